//! Contract the physical wire driver has to provide
//!
//! The layer does not speak the wire protocol itself. It consumes a driver
//! that owns the sockets and pushes query results as events: a field list,
//! then result packets, then a terminal end or error. Everything in this
//! module is implemented by the driver, nothing in it is implemented here.
use std::fmt::Display;
use std::sync::Arc;

use crate::value::Value;

/// Error reported by the driver
#[derive(Debug, Clone)]
pub struct DriverError {
    /// 2-byte mysql error code, if the failure came from the server
    pub code: Option<u16>,
    /// Error message
    pub message: String,
}

impl DriverError {
    /// A server reported error
    pub fn server(code: u16, message: impl Into<String>) -> DriverError {
        DriverError {
            code: Some(code),
            message: message.into(),
        }
    }

    /// A client side failure without a server code
    pub fn client(message: impl Into<String>) -> DriverError {
        DriverError {
            code: None,
            message: message.into(),
        }
    }
}

impl Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Raw column metadata from one field definition packet
#[derive(Debug, Clone)]
pub struct FieldPacket {
    /// Column name
    pub name: String,
    /// Wire type code, see [crate::constants::type_]
    pub type_code: u8,
    /// Column flags, see [crate::constants::column_flag]
    pub flags: u16,
    /// Declared column length in bytes
    pub column_length: u32,
    /// Number of decimals for DECIMAL columns
    pub decimals: u8,
}

/// Result of an update statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// The number of rows affected by the statement
    pub affected_rows: u64,
    /// The id of the last row inserted
    pub last_insert_id: u64,
}

/// Payload of one `result` event
#[derive(Debug, Clone)]
pub enum ResultPacket {
    /// One row of a result set, values in field order
    Row(Vec<Value>),
    /// The single update packet of an execute statement,
    /// delivered without a preceding field list
    Exec(ExecResult),
}

/// Event sink for one in-flight query
///
/// The driver pushes `on_fields` then zero or more `on_result` then exactly
/// one of `on_end` or `on_error`. Execute statements skip `on_fields` and
/// deliver a single [ResultPacket::Exec]. Events for one query arrive in
/// order from one task; the sink must not call back into the driver while
/// handling an event other than through [WireConn::pause]/[WireConn::resume].
pub trait QueryEvents: Send + Sync {
    /// The field definitions of a row producing statement
    fn on_fields(&self, fields: Vec<FieldPacket>);
    /// One result packet
    fn on_result(&self, packet: ResultPacket);
    /// Terminal: the result stream finished cleanly
    fn on_end(&self);
    /// Terminal: the query failed
    fn on_error(&self, err: DriverError);
}

/// One wire connection owned by the driver's pool
pub trait WireConn: Send + Sync {
    /// Issue a query. Results are pushed to `events`; a connection carries
    /// at most one in-flight query at a time
    fn start_query(&self, sql: &str, params: &[Value], events: Arc<dyn QueryEvents>);
    /// Stop delivering result events until [WireConn::resume]
    fn pause(&self);
    /// Resume delivery after [WireConn::pause]
    fn resume(&self);
    /// The server assigned thread id of this connection, the target
    /// handle for `KILL QUERY`
    fn thread_id(&self) -> u64;
    /// Return the connection to its pool
    fn release(&self);
    /// Close the connection gracefully
    fn end(&self);
    /// Tear the connection down without waiting for in-flight work
    fn destroy(&self);
}

/// The driver's connection pool
pub trait WirePool: Send + Sync {
    /// Request a connection. The callback fires once, from an arbitrary
    /// task, with the connection or the acquire failure
    fn get_connection(
        &self,
        cb: Box<dyn FnOnce(Result<Arc<dyn WireConn>, DriverError>) + Send>,
    );
    /// Close the pool and all idle connections
    fn end(&self);
}
