//! Request scoped context: cancel signal and bound storage handle
use std::future::Future;

use tokio::sync::watch;
use tracing::warn;

use crate::conn::Conn;
use crate::error::{ErrorContent, Result};
use crate::pool::Pool;
use crate::row::Row;
use crate::txn::{Txn, TxnOptions};
use crate::value::Param;

/// The observing half of a cancel signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    /// Flips to true exactly once
    rx: watch::Receiver<bool>,
}

/// The firing half of a cancel signal
#[derive(Debug)]
pub struct Canceler {
    tx: watch::Sender<bool>,
}

/// Create a connected canceler/token pair
pub fn cancel_pair() -> (Canceler, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (Canceler { tx }, CancelToken { rx })
}

impl Canceler {
    /// Fire the signal. Idempotent
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// True once the signal has fired
    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the signal. Never resolves when the canceler is gone
    /// without having fired
    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Canceler dropped without firing, the signal can no
                // longer arrive
                std::future::pending::<()>().await;
            }
        }
    }
}

/// What query surface a context carries for [run_transaction]
#[derive(Clone)]
pub enum Storage {
    /// A pool, one shot leases per statement
    Pool(Pool),
    /// A dedicated connection
    Conn(Conn),
    /// An already running transaction
    Txn(Txn),
}

/// Context passed through every surface call
///
/// Carries an optional cancel token, honored at the await points of the
/// layer, and an optional storage binding used by [run_transaction].
#[derive(Clone, Default)]
pub struct Context {
    cancel: Option<CancelToken>,
    storage: Option<Storage>,
}

impl Context {
    /// A context with no cancel signal and no storage binding
    pub fn background() -> Context {
        Context::default()
    }

    /// Derive a cancelable context. Dropping the canceler without firing
    /// leaves the derived context uncancelable
    pub fn with_cancel(&self) -> (Context, Canceler) {
        let (canceler, token) = cancel_pair();
        let ctx = Context {
            cancel: Some(token),
            storage: self.storage.clone(),
        };
        (ctx, canceler)
    }

    /// Derive a context with the given storage handle bound
    pub fn with_storage(&self, storage: Storage) -> Context {
        Context {
            cancel: self.cancel.clone(),
            storage: Some(storage),
        }
    }

    /// The cancel token, if this context carries one
    pub fn cancel_token(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }

    /// The bound storage handle, if any
    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    /// True once the cancel signal has fired
    pub fn is_canceled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_canceled)
    }

    /// Wait for the cancel signal. Never resolves on a context without one
    pub async fn canceled(&self) {
        match &self.cancel {
            Some(token) => token.canceled().await,
            None => std::future::pending().await,
        }
    }
}

impl Storage {
    /// Run a one shot query through the bound handle
    pub async fn query_row(&self, ctx: &Context, sql: &str, params: &[Param]) -> Result<Option<Row>> {
        match self {
            Storage::Pool(p) => p.query_row(ctx, sql, params).await,
            Storage::Conn(c) => c.query_row(ctx, sql, params).await,
            Storage::Txn(t) => t.query_row(ctx, sql, params).await,
        }
    }

    /// Run an update statement through the bound handle
    pub async fn execute(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Param],
    ) -> Result<crate::driver::ExecResult> {
        match self {
            Storage::Pool(p) => p.execute(ctx, sql, params).await,
            Storage::Conn(c) => c.execute(ctx, sql, params).await,
            Storage::Txn(t) => t.execute(ctx, sql, params).await,
        }
    }
}

/// Run `f` inside a transaction
///
/// When the context already carries a transaction the callback runs on it
/// directly and the outer caller keeps control of commit/rollback. Otherwise
/// a transaction is begun on the bound pool or connection, injected into a
/// derived context, committed when the callback returns Ok and rolled back
/// when it returns Err; the callback's error is re-raised. A rollback
/// failure is logged and swallowed so the original error wins.
pub async fn run_transaction<T, F, Fut>(ctx: &Context, f: F) -> Result<T>
where
    F: FnOnce(Context, Txn) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let txn = match ctx.storage() {
        Some(Storage::Txn(txn)) => {
            // Already transactional, the outer layer owns the outcome
            return f(ctx.clone(), txn.clone()).await;
        }
        Some(Storage::Pool(pool)) => pool.begin(ctx, TxnOptions::default()).await?,
        Some(Storage::Conn(conn)) => conn.begin(ctx, TxnOptions::default()).await?,
        None => {
            return Err(ErrorContent::InvalidState("no storage bound to context").into());
        }
    };
    let derived = ctx.with_storage(Storage::Txn(txn.clone()));
    match f(derived, txn.clone()).await {
        Ok(v) => {
            txn.commit().await?;
            Ok(v)
        }
        Err(e) => {
            if let Err(rb) = txn.rollback().await {
                warn!("rollback after failed transaction callback failed: {rb}");
            }
            Err(e)
        }
    }
}
