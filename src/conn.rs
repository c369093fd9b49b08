//! A dedicated connection leased from the pool
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::driver::{ExecResult, WireConn};
use crate::error::{ErrorContent, Result};
use crate::pool::Pool;
use crate::query::{Rows, StreamConfig};
use crate::row::Row;
use crate::txn::{Txn, TxnOptions};
use crate::value::{Param, flatten};

/// Inner state of a leased connection
struct ConnInner {
    pool: Pool,
    /// The wire connection, None once closed
    wire: Mutex<Option<Arc<dyn WireConn>>>,
}

/// One leased wire connection with the shared query surface
///
/// Statements issued through a [Conn] reuse the same wire connection; the
/// connection goes back to the pool on [Conn::close]. Cheap to clone, all
/// clones share the lease.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").finish_non_exhaustive()
    }
}

impl Conn {
    pub(crate) fn new(pool: Pool, wire: Arc<dyn WireConn>) -> Conn {
        Conn {
            inner: Arc::new(ConnInner {
                pool,
                wire: Mutex::new(Some(wire)),
            }),
        }
    }

    fn wire(&self) -> Result<Arc<dyn WireConn>> {
        self.inner
            .wire
            .lock()
            .expect("connection state poisoned")
            .clone()
            .ok_or_else(|| ErrorContent::Closed("connection").into())
    }

    fn stream_config(&self) -> StreamConfig {
        let options = self.inner.pool.options();
        StreamConfig {
            keep_open: true,
            high_water: options.high_water,
            low_water: options.low_water,
        }
    }

    /// Run a row producing statement on this connection
    ///
    /// The connection outlives the returned cursor; closing the cursor
    /// early interrupts the query but keeps the connection leased.
    pub async fn query(&self, ctx: &Context, sql: &str, params: &[Param]) -> Result<Rows> {
        let wire = self.wire()?;
        if ctx.is_canceled() {
            return Err(ErrorContent::Canceled.into());
        }
        Ok(Rows::start(
            wire,
            self.inner.pool.driver().clone(),
            self.stream_config(),
            ctx,
            sql,
            &flatten(params),
        ))
    }

    /// Run a statement and return its first row, if any
    ///
    /// The returned row is detached from any cursor lifetime; the stream
    /// is closed whatever happens.
    pub async fn query_row(&self, ctx: &Context, sql: &str, params: &[Param]) -> Result<Option<Row>> {
        let rows = self.query(ctx, sql, params).await?;
        rows.into_single_row().await
    }

    /// Run an update statement
    ///
    /// Fails with [ErrorContent::UnexpectedRows] when the statement turns
    /// out to produce a result set.
    pub async fn execute(&self, ctx: &Context, sql: &str, params: &[Param]) -> Result<ExecResult> {
        let rows = self.query(ctx, sql, params).await?;
        rows.into_exec_result().await
    }

    /// Begin a transaction bound to this connection
    ///
    /// The connection stays leased when the transaction ends.
    pub async fn begin(&self, ctx: &Context, opts: TxnOptions) -> Result<Txn> {
        let wire = self.wire()?;
        let txn = Txn::new(self.inner.pool.clone(), wire, true);
        txn.begin(ctx, opts).await?;
        Ok(txn)
    }

    /// Release the wire connection back to the pool
    ///
    /// Idempotent; every later statement on this handle fails with
    /// [ErrorContent::Closed].
    pub fn close(&self) {
        let wire = self
            .inner
            .wire
            .lock()
            .expect("connection state poisoned")
            .take();
        if let Some(wire) = wire {
            wire.release();
        }
    }
}
