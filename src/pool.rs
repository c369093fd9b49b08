//! Pool facade: one shot statement leases and dedicated connections
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::conn::Conn;
use crate::context::Context;
use crate::driver::{ExecResult, WireConn, WirePool};
use crate::error::{ErrorContent, Result};
use crate::promise::promise;
use crate::query::{HIGH_WATER, LOW_WATER, Rows, StreamConfig};
use crate::row::Row;
use crate::txn::{Txn, TxnOptions};
use crate::value::{Param, flatten};

/// Options of the access layer itself, not of the wire driver
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Buffered row count at which a stream pauses wire delivery
    pub high_water: usize,
    /// Buffered row count at which a paused stream resumes delivery
    pub low_water: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            high_water: HIGH_WATER,
            low_water: LOW_WATER,
        }
    }
}

/// Inner state of a pool facade
struct PoolInner {
    driver: Arc<dyn WirePool>,
    options: PoolOptions,
    closed: AtomicBool,
}

/// Public facade over the driver's pool
///
/// Runs one shot statements by leasing a wire connection per statement,
/// hands out dedicated connections, and begins transactions. Cheap to
/// clone; all clones observe [Pool::close].
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Wrap a driver pool
    pub fn new(driver: Arc<dyn WirePool>) -> Pool {
        Pool::with_options(driver, PoolOptions::default())
    }

    /// Wrap a driver pool with explicit stream watermarks
    pub fn with_options(driver: Arc<dyn WirePool>, options: PoolOptions) -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                driver,
                options,
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ErrorContent::Closed("pool").into());
        }
        Ok(())
    }

    fn stream_config(&self, keep_open: bool) -> StreamConfig {
        StreamConfig {
            keep_open,
            high_water: self.inner.options.high_water,
            low_water: self.inner.options.low_water,
        }
    }

    pub(crate) fn driver(&self) -> &Arc<dyn WirePool> {
        &self.inner.driver
    }

    pub(crate) fn options(&self) -> PoolOptions {
        self.inner.options
    }

    /// Lease a dedicated connection
    pub async fn acquire(&self, ctx: &Context) -> Result<Conn> {
        self.check_open()?;
        let wire = acquire_wire(&self.inner.driver, ctx).await?;
        Ok(Conn::new(self.clone(), wire))
    }

    /// Run a row producing statement
    ///
    /// The lease travels with the returned cursor, which releases it on
    /// close or at the terminal event.
    pub async fn query(&self, ctx: &Context, sql: &str, params: &[Param]) -> Result<Rows> {
        self.check_open()?;
        let lease = Lease::new(acquire_wire(&self.inner.driver, ctx).await?);
        if ctx.is_canceled() {
            return Err(ErrorContent::Canceled.into());
        }
        // Release ownership transfers to the stream
        Ok(Rows::start(
            lease.take(),
            self.inner.driver.clone(),
            self.stream_config(false),
            ctx,
            sql,
            &flatten(params),
        ))
    }

    /// Run a statement and return its first row, if any
    pub async fn query_row(&self, ctx: &Context, sql: &str, params: &[Param]) -> Result<Option<Row>> {
        self.check_open()?;
        let lease = Lease::new(acquire_wire(&self.inner.driver, ctx).await?);
        let rows = Rows::start(
            lease.conn().clone(),
            self.inner.driver.clone(),
            self.stream_config(true),
            ctx,
            sql,
            &flatten(params),
        );
        // The lease guard releases when this frame unwinds, whatever the
        // stream did
        rows.into_single_row().await
    }

    /// Run an update statement
    pub async fn execute(&self, ctx: &Context, sql: &str, params: &[Param]) -> Result<ExecResult> {
        self.check_open()?;
        let lease = Lease::new(acquire_wire(&self.inner.driver, ctx).await?);
        let rows = Rows::start(
            lease.conn().clone(),
            self.inner.driver.clone(),
            self.stream_config(true),
            ctx,
            sql,
            &flatten(params),
        );
        rows.into_exec_result().await
    }

    /// Begin a transaction on a fresh lease
    ///
    /// The lease is held until the transaction commits or rolls back.
    pub async fn begin(&self, ctx: &Context, opts: TxnOptions) -> Result<Txn> {
        self.check_open()?;
        let lease = Lease::new(acquire_wire(&self.inner.driver, ctx).await?);
        let txn = Txn::new(self.clone(), lease.take(), false);
        txn.begin(ctx, opts).await?;
        Ok(txn)
    }

    /// Close the pool. Idempotent; every later surface call fails
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.driver.end();
    }
}

/// Scoped wire connection lease
///
/// Releases the connection back to the pool when dropped, unless ownership
/// was taken over by a stream or transaction with [Lease::take]. This is
/// what makes the one shot paths release exactly once on every exit.
pub(crate) struct Lease {
    conn: Option<Arc<dyn WireConn>>,
}

impl Lease {
    pub(crate) fn new(conn: Arc<dyn WireConn>) -> Lease {
        Lease { conn: Some(conn) }
    }

    /// The leased connection
    pub(crate) fn conn(&self) -> &Arc<dyn WireConn> {
        self.conn.as_ref().expect("lease already taken")
    }

    /// Take ownership out of the guard without releasing
    pub(crate) fn take(mut self) -> Arc<dyn WireConn> {
        self.conn.take().expect("lease already taken")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.release();
        }
    }
}

/// Waiting side of one pending driver acquire. The promise carries a
/// [Lease] so a delivery nobody collects releases itself
type PendingAcquire = Mutex<Option<crate::promise::Promise<Result<Lease>>>>;

/// Resolve the driver's callback style acquire into a future, honoring the
/// context's cancel signal
///
/// A cancel that wins the race rejects with [ErrorContent::Canceled]; a
/// connection the driver delivers after that is released back to the pool
/// immediately, never leaked.
pub(crate) async fn acquire_wire(
    pool: &Arc<dyn WirePool>,
    ctx: &Context,
) -> Result<Arc<dyn WireConn>> {
    if ctx.is_canceled() {
        return Err(ErrorContent::Canceled.into());
    }
    let (p, expect) = promise();
    let slot: Arc<PendingAcquire> = Arc::new(Mutex::new(Some(p)));
    let cb_slot = slot.clone();
    pool.get_connection(Box::new(move |res| {
        let waiter = cb_slot.lock().expect("acquire slot poisoned").take();
        match (waiter, res) {
            (Some(p), Ok(conn)) => p.fulfill(Ok(Lease::new(conn))),
            (Some(p), Err(e)) => p.fulfill(Err(e.into())),
            (None, Ok(conn)) => {
                // The acquire was abandoned before the pool delivered;
                // hand the connection straight back
                debug!("releasing connection delivered after canceled acquire");
                conn.release();
            }
            (None, Err(_)) => {}
        }
    }));
    tokio::select! {
        out = expect.wait() => match out {
            Ok(r) => r.map(Lease::take),
            Err(_) => Err(ErrorContent::Canceled.into()),
        },
        () = ctx.canceled() => {
            // Empty the slot so a late delivery is released by the
            // callback; one already buffered in the promise is released
            // when the uncollected lease drops
            drop(slot.lock().expect("acquire slot poisoned").take());
            Err(ErrorContent::Canceled.into())
        }
    }
}
