//! Transactions over one bound wire connection
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::driver::{ExecResult, WireConn};
use crate::error::{Error, ErrorContent, Result};
use crate::pool::Pool;
use crate::query::{Rows, StreamConfig};
use crate::row::Row;
use crate::value::{Param, flatten};

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// The mysql default
    #[default]
    RepeatableRead,
    /// Statements only see committed changes
    ReadCommitted,
    /// Dirty reads allowed
    ReadUncommitted,
    /// Transactions appear to run sequentially
    Serializable,
}

impl IsolationLevel {
    /// The sql spelling of this level
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    /// Parse the external configuration tokens
    fn from_str(s: &str) -> Result<IsolationLevel> {
        match s {
            "default" | "repeatableRead" => Ok(IsolationLevel::RepeatableRead),
            "readCommitted" => Ok(IsolationLevel::ReadCommitted),
            "readUncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(ErrorContent::UnsupportedIsolation(other.to_string()).into()),
        }
    }
}

/// Options passed to begin
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnOptions {
    /// Isolation level for this transaction
    pub isolation: IsolationLevel,
    /// Start the transaction READ ONLY instead of READ WRITE
    pub read_only: bool,
}

/// Where the transaction is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    /// Constructed, begin not run yet
    Created,
    /// A begin is in flight
    Beginning,
    /// Begin succeeded, statements allowed
    Active,
    /// A commit or rollback is in flight
    Resolving,
    Committed,
    RolledBack,
}

/// Inner state of a transaction
struct TxnInner {
    pool: Pool,
    wire: Arc<dyn WireConn>,
    /// True when the bound connection belongs to a caller held [crate::conn::Conn]
    /// and must survive the transaction
    keep_open: bool,
    state: Mutex<TxnState>,
}

/// A sequence of statements on one bound connection
///
/// Constructed unstarted; [Txn::begin] sets the isolation level and opens
/// the transaction. Every statement surface refuses to run before begin
/// succeeded or after commit/rollback. Cheap to clone, all clones share
/// the state.
#[derive(Clone)]
pub struct Txn {
    inner: Arc<TxnInner>,
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn").finish_non_exhaustive()
    }
}

impl Txn {
    pub(crate) fn new(pool: Pool, wire: Arc<dyn WireConn>, keep_open: bool) -> Txn {
        Txn {
            inner: Arc::new(TxnInner {
                pool,
                wire,
                keep_open,
                state: Mutex::new(TxnState::Created),
            }),
        }
    }

    fn set_state(&self, next: TxnState) {
        *self.inner.state.lock().expect("transaction state poisoned") = next;
    }

    /// Atomically step from `from` to `to`, failing like a statement
    /// surface would in any other state
    fn transition(&self, from: TxnState, to: TxnState) -> Result<()> {
        let mut st = self.inner.state.lock().expect("transaction state poisoned");
        if *st != from {
            return Err(Self::refusal(*st));
        }
        *st = to;
        Ok(())
    }

    /// Fail unless statements are currently allowed
    fn check_active(&self) -> Result<()> {
        let st = *self.inner.state.lock().expect("transaction state poisoned");
        match st {
            TxnState::Active => Ok(()),
            _ => Err(Self::refusal(st)),
        }
    }

    /// The error a surface call gets in a state that refuses it
    fn refusal(st: TxnState) -> Error {
        match st {
            TxnState::Created | TxnState::Beginning => {
                ErrorContent::InvalidState("transaction not begun").into()
            }
            TxnState::Active => ErrorContent::InvalidState("transaction already begun").into(),
            TxnState::Resolving => {
                ErrorContent::InvalidState("transaction resolution in flight").into()
            }
            TxnState::Committed | TxnState::RolledBack => ErrorContent::Closed("transaction").into(),
        }
    }

    fn stream_config(&self) -> StreamConfig {
        let options = self.inner.pool.options();
        StreamConfig {
            keep_open: true,
            high_water: options.high_water,
            low_water: options.low_water,
        }
    }

    /// Run one statement on the bound connection through the stream layer
    async fn run(&self, ctx: &Context, sql: &str, params: &[crate::value::Value]) -> Result<ExecResult> {
        let rows = Rows::start(
            self.inner.wire.clone(),
            self.inner.pool.driver().clone(),
            self.stream_config(),
            ctx,
            sql,
            params,
        );
        rows.into_exec_result().await
    }

    /// Open the transaction
    ///
    /// Sets the isolation level, then starts the transaction in the
    /// requested access mode. The error is returned as a value so callers
    /// can translate it; on failure a connection this transaction owns is
    /// released back to the pool.
    pub async fn begin(&self, ctx: &Context, opts: TxnOptions) -> Result<()> {
        self.transition(TxnState::Created, TxnState::Beginning)?;
        let out = async {
            let isolation = format!(
                "SET TRANSACTION ISOLATION LEVEL {}",
                opts.isolation.as_sql()
            );
            self.run(ctx, &isolation, &[]).await?;
            let start = if opts.read_only {
                "START TRANSACTION READ ONLY"
            } else {
                "START TRANSACTION READ WRITE"
            };
            self.run(ctx, start, &[]).await?;
            Ok(())
        }
        .await;
        match out {
            Ok(()) => {
                self.set_state(TxnState::Active);
                Ok(())
            }
            Err(e) => {
                self.set_state(TxnState::RolledBack);
                if !self.inner.keep_open {
                    self.inner.wire.release();
                }
                Err(e)
            }
        }
    }

    /// Run a row producing statement inside the transaction
    pub async fn query(&self, ctx: &Context, sql: &str, params: &[Param]) -> Result<Rows> {
        self.check_active()?;
        if ctx.is_canceled() {
            return Err(ErrorContent::Canceled.into());
        }
        Ok(Rows::start(
            self.inner.wire.clone(),
            self.inner.pool.driver().clone(),
            self.stream_config(),
            ctx,
            sql,
            &flatten(params),
        ))
    }

    /// Run a statement and return its first row, if any
    pub async fn query_row(&self, ctx: &Context, sql: &str, params: &[Param]) -> Result<Option<Row>> {
        let rows = self.query(ctx, sql, params).await?;
        rows.into_single_row().await
    }

    /// Run an update statement inside the transaction
    pub async fn execute(&self, ctx: &Context, sql: &str, params: &[Param]) -> Result<ExecResult> {
        self.check_active()?;
        if ctx.is_canceled() {
            return Err(ErrorContent::Canceled.into());
        }
        self.run(ctx, sql, &flatten(params)).await
    }

    /// Resolve the transaction with the given statement, then let go of
    /// an owned connection whatever the statement did
    async fn resolve(&self, sql: &str, next: TxnState) -> Result<()> {
        self.transition(TxnState::Active, TxnState::Resolving)?;
        // Resolution must not be interruptible by the caller's cancel
        // signal, it runs under a background context
        let out = self.run(&Context::background(), sql, &[]).await;
        self.set_state(next);
        if !self.inner.keep_open {
            self.inner.wire.release();
        }
        out.map(|_| ())
    }

    /// Commit the transaction
    pub async fn commit(&self) -> Result<()> {
        self.resolve("COMMIT", TxnState::Committed).await
    }

    /// Roll the transaction back
    pub async fn rollback(&self) -> Result<()> {
        self.resolve("ROLLBACK", TxnState::RolledBack).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_sql_spellings() {
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::ReadUncommitted.as_sql(), "READ UNCOMMITTED");
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
    }

    #[test]
    fn isolation_tokens() {
        assert_eq!(
            "default".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "repeatableRead".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "readCommitted".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "readUncommitted".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadUncommitted
        );
        assert_eq!(
            "serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        let err = "snapshot".parse::<IsolationLevel>().unwrap_err();
        assert!(matches!(
            err.content(),
            ErrorContent::UnsupportedIsolation(v) if v == "snapshot"
        ));
    }

    #[test]
    fn default_options() {
        let opts = TxnOptions::default();
        assert_eq!(opts.isolation, IsolationLevel::RepeatableRead);
        assert!(!opts.read_only);
    }
}
