//! The streaming query object
//!
//! Adapts the driver's push events (fields, result packets, end, error) into
//! a cursor the caller drives with [Rows::next]. Rows the caller has not
//! asked for yet go into a bounded buffer; crossing the high-water mark
//! pauses delivery on the wire connection and draining back to the low-water
//! mark resumes it. An external cancel signal is propagated to the wire as a
//! `KILL QUERY` issued over a separate pooled connection, or by tearing the
//! connection down when the stream owns it outright.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::column::ColumnInfo;
use crate::constants::error_code;
use crate::context::Context;
use crate::driver::{DriverError, ExecResult, FieldPacket, QueryEvents, ResultPacket, WireConn, WirePool};
use crate::error::{Error, ErrorContent, Result};
use crate::pool::acquire_wire;
use crate::promise::{Promise, promise};
use crate::row::Row;
use crate::value::Value;

/// Buffered row count at which delivery is paused
pub const HIGH_WATER: usize = 100;
/// Buffered row count at which a paused delivery is resumed
pub const LOW_WATER: usize = 75;

/// Per stream configuration, fixed at start
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamConfig {
    /// True when the wire connection outlives the stream and is shared
    /// with other statements. False when the stream owns the lease and
    /// must release it on close
    pub keep_open: bool,
    /// Pause threshold
    pub high_water: usize,
    /// Resume threshold
    pub low_water: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            keep_open: true,
            high_water: HIGH_WATER,
            low_water: LOW_WATER,
        }
    }
}

/// State shared between the cursor, the event sink and the cancel watcher
struct Shared {
    /// The connection the query runs on
    conn: Arc<dyn WireConn>,
    /// The pool, used for the sideband KILL connection
    pool: Arc<dyn WirePool>,
    config: StreamConfig,
    state: Mutex<State>,
}

/// The mutable query state
struct State {
    /// The field list or the exec packet has been observed
    ready: bool,
    /// Error that ended the opening phase, surfaced by [Rows::ready]
    ready_err: Option<Error>,
    /// The statement produced an update packet instead of a field list
    is_exec: bool,
    exec: Option<ExecResult>,
    columns: Option<Arc<[ColumnInfo]>>,
    names: Option<Arc<[String]>>,
    /// Mid-stream error, surfaced by every later [Rows::next]
    err: Option<Error>,
    /// Terminal transition happened
    done: bool,
    paused: bool,
    canceling: bool,
    closed: bool,
    /// The lease disposition has been performed
    released: bool,
    /// Raw row packets not yet pulled. Wrapping into [Row] happens on the
    /// pop side, rows discarded by a cancel never pay the projection
    buffer: VecDeque<Vec<Value>>,
    wait_ready: Option<Promise<Result<()>>>,
    wait_next: Option<Promise<Result<Option<Row>>>>,
    wait_close: Option<Promise<Result<()>>>,
}

impl State {
    fn new() -> State {
        State {
            ready: false,
            ready_err: None,
            is_exec: false,
            exec: None,
            columns: None,
            names: None,
            err: None,
            done: false,
            paused: false,
            canceling: false,
            closed: false,
            released: false,
            buffer: VecDeque::new(),
            wait_ready: None,
            wait_next: None,
            wait_close: None,
        }
    }
}

/// What the wire connection gets once the stream lets go of it
#[derive(Clone, Copy, PartialEq)]
enum Dispose {
    /// Back to the pool
    Release,
    /// Closed gracefully, the stream was let go without an error
    End,
    /// Torn down, the connection is no longer trustworthy
    Destroy,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // The mutex only guards plain state transitions, a poisoned lock
        // means a panic inside one of those
        self.state.lock().expect("query state poisoned")
    }

    /// Mark the lease disposition done, returns what to perform after the
    /// lock is dropped. Owned leases are disposed exactly once
    fn dispose(&self, st: &mut State, how: Dispose) -> Option<Dispose> {
        if self.config.keep_open || st.released {
            return None;
        }
        st.released = true;
        Some(how)
    }

    fn perform(&self, dispose: Option<Dispose>) {
        match dispose {
            Some(Dispose::Release) => self.conn.release(),
            Some(Dispose::End) => self.conn.end(),
            Some(Dispose::Destroy) => self.conn.destroy(),
            None => {}
        }
    }

    /// Terminal clean end, also synthesized from an expected interrupt
    fn finish(&self, st: &mut State) -> Option<Dispose> {
        st.done = true;
        if !st.ready {
            // The driver ended without fields or an exec packet; surface
            // an empty exec result so ready() resolves
            st.ready = true;
            st.is_exec = true;
            st.exec = Some(ExecResult::default());
        }
        if let Some(p) = st.wait_ready.take() {
            p.fulfill(Ok(()));
        }
        if let Some(p) = st.wait_next.take() {
            p.fulfill(Ok(None));
        }
        if let Some(p) = st.wait_close.take() {
            p.fulfill(Ok(()));
        }
        self.dispose(st, Dispose::Release)
    }

    /// Terminal failure
    fn fail(&self, st: &mut State, e: Error) -> Option<Dispose> {
        st.done = true;
        if !st.ready {
            st.ready = true;
            st.ready_err = Some(e.clone());
            if let Some(p) = st.wait_ready.take() {
                p.fulfill(Err(e.clone()));
            }
        }
        st.err = Some(e.clone());
        if let Some(p) = st.wait_next.take() {
            p.fulfill(Err(e.clone()));
        }
        if let Some(p) = st.wait_close.take() {
            p.fulfill(Err(e));
        }
        self.dispose(st, Dispose::Destroy)
    }

    /// The cancel signal fired while the query may still be in flight
    fn cancel(&self) {
        let mut kill = false;
        let mut dispose = None;
        {
            let mut st = self.lock();
            if st.done || st.canceling {
                return;
            }
            st.canceling = true;
            st.buffer.clear();
            if self.config.keep_open {
                // The connection is shared, interrupt the query from a
                // second connection and let the terminal event arrive
                kill = true;
            } else {
                // The stream owns the connection, tear it down and
                // synthesize the terminal transition
                st.done = true;
                if !st.ready {
                    st.ready = true;
                    let e = Error::from(ErrorContent::Canceled);
                    st.ready_err = Some(e.clone());
                    if let Some(p) = st.wait_ready.take() {
                        p.fulfill(Err(e));
                    }
                }
                if let Some(p) = st.wait_next.take() {
                    p.fulfill(Ok(None));
                }
                if let Some(p) = st.wait_close.take() {
                    p.fulfill(Ok(()));
                }
                st.released = true;
                dispose = Some(Dispose::Destroy);
            }
        }
        self.perform(dispose);
        if kill {
            debug!("canceling in-flight query on thread {}", self.conn.thread_id());
            spawn_kill(self.pool.clone(), self.conn.thread_id());
        }
    }
}

/// The event sink handed to the driver for one query
struct EventSink(Arc<Shared>);

impl QueryEvents for EventSink {
    fn on_fields(&self, fields: Vec<FieldPacket>) {
        let shared = &self.0;
        let mut st = shared.lock();
        if st.ready || st.done {
            return;
        }
        let columns: Arc<[ColumnInfo]> = fields.iter().map(ColumnInfo::from_field).collect();
        let names: Arc<[String]> = fields.iter().map(|f| f.name.clone()).collect();
        st.columns = Some(columns);
        st.names = Some(names);
        st.ready = true;
        if let Some(p) = st.wait_ready.take() {
            p.fulfill(Ok(()));
        }
    }

    fn on_result(&self, packet: ResultPacket) {
        let shared = &self.0;
        match packet {
            ResultPacket::Row(values) => {
                let mut pause = false;
                {
                    let mut st = shared.lock();
                    if st.done || st.canceling || st.closed {
                        // Rows after cancel or terminal are discarded
                        return;
                    }
                    let Some(names) = st.names.clone() else {
                        let dispose = shared
                            .fail(&mut st, ErrorContent::InvalidState("row before field list").into());
                        drop(st);
                        shared.perform(dispose);
                        return;
                    };
                    if let Some(p) = st.wait_next.take() {
                        // A reader is parked, hand the row over directly
                        debug_assert!(st.buffer.is_empty());
                        p.fulfill(Ok(Some(Row::new(names, values))));
                    } else {
                        st.buffer.push_back(values);
                        if st.buffer.len() >= shared.config.high_water && !st.paused {
                            st.paused = true;
                            pause = true;
                        }
                    }
                }
                if pause {
                    shared.conn.pause();
                }
            }
            ResultPacket::Exec(result) => {
                let mut dispose = None;
                {
                    let mut st = shared.lock();
                    if st.done {
                        return;
                    }
                    if st.ready {
                        dispose = shared.fail(
                            &mut st,
                            ErrorContent::InvalidState("execute result after field list").into(),
                        );
                    } else {
                        st.is_exec = true;
                        st.exec = Some(result);
                        st.ready = true;
                        if let Some(p) = st.wait_ready.take() {
                            p.fulfill(Ok(()));
                        }
                        if let Some(p) = st.wait_next.take() {
                            p.fulfill(Ok(None));
                        }
                    }
                }
                shared.perform(dispose);
            }
        }
    }

    fn on_end(&self) {
        let shared = &self.0;
        let dispose;
        {
            let mut st = shared.lock();
            if st.done {
                return;
            }
            dispose = shared.finish(&mut st);
        }
        shared.perform(dispose);
    }

    fn on_error(&self, err: DriverError) {
        let shared = &self.0;
        let dispose;
        {
            let mut st = shared.lock();
            if st.done {
                return;
            }
            if st.canceling && err.code == Some(error_code::ER_QUERY_INTERRUPTED) {
                // The interrupt we asked for with KILL QUERY, a clean end.
                // Raised before the field list it is still the outcome of
                // the opening phase
                if !st.ready {
                    st.ready = true;
                    let e = Error::from(err);
                    st.ready_err = Some(e.clone());
                    if let Some(p) = st.wait_ready.take() {
                        p.fulfill(Err(e));
                    }
                }
                st.done = true;
                if let Some(p) = st.wait_next.take() {
                    p.fulfill(Ok(None));
                }
                if let Some(p) = st.wait_close.take() {
                    p.fulfill(Ok(()));
                }
                dispose = shared.dispose(&mut st, Dispose::Release);
            } else {
                dispose = shared.fail(&mut st, err.into());
            }
        }
        shared.perform(dispose);
    }
}

/// Pull based cursor over one query's result stream
pub struct Rows {
    shared: Arc<Shared>,
    /// The row most recently produced by [Rows::next], valid until the
    /// next advance
    current: Option<Row>,
    /// Task observing the context's cancel signal
    watcher: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows").finish_non_exhaustive()
    }
}

impl Rows {
    /// Issue `sql` on `conn` and return the cursor over its events
    pub(crate) fn start(
        conn: Arc<dyn WireConn>,
        pool: Arc<dyn WirePool>,
        config: StreamConfig,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Rows {
        let shared = Arc::new(Shared {
            conn,
            pool,
            config,
            state: Mutex::new(State::new()),
        });
        let sink: Arc<dyn QueryEvents> = Arc::new(EventSink(shared.clone()));
        shared.conn.start_query(sql, params, sink);
        let watcher = ctx.cancel_token().cloned().map(|token| {
            let shared = shared.clone();
            tokio::spawn(async move {
                token.canceled().await;
                shared.cancel();
            })
        });
        Rows {
            shared,
            current: None,
            watcher,
        }
    }

    /// Wait until the field list or the exec result has been observed
    ///
    /// An error that ended the opening phase is the returned value; it is
    /// never raised out-of-band.
    pub async fn ready(&self) -> Result<()> {
        let expect;
        {
            let mut st = self.shared.lock();
            if st.ready {
                return match &st.ready_err {
                    Some(e) => Err(e.clone()),
                    None => Ok(()),
                };
            }
            if st.wait_ready.is_some() {
                return Err(ErrorContent::InvalidState("concurrent ready waiters").into());
            }
            let (p, e) = promise();
            st.wait_ready = Some(p);
            expect = e;
        }
        match expect.wait().await {
            Ok(r) => r,
            Err(_) => Err(ErrorContent::Canceled.into()),
        }
    }

    /// The column names, available once [Rows::ready] resolved
    pub fn columns(&self) -> Result<Arc<[String]>> {
        let st = self.shared.lock();
        Self::check_rows_meta(&st)?;
        Ok(st.names.clone().expect("ready row stream has names"))
    }

    /// The column type descriptions, available once [Rows::ready] resolved
    pub fn column_types(&self) -> Result<Arc<[ColumnInfo]>> {
        let st = self.shared.lock();
        Self::check_rows_meta(&st)?;
        Ok(st.columns.clone().expect("ready row stream has columns"))
    }

    /// Shared metadata guards: not ready, ready with error, or exec
    fn check_rows_meta(st: &State) -> Result<()> {
        if !st.ready {
            return Err(ErrorContent::NotReady.into());
        }
        if let Some(e) = &st.ready_err {
            return Err(e.clone());
        }
        if st.is_exec {
            return Err(ErrorContent::ExpectedRows.into());
        }
        Ok(())
    }

    /// Advance the cursor
    ///
    /// Resolves true when a row became current, false at end of stream,
    /// and with the stream error if one occurred. Returns false on every
    /// call after the end. For execute statements always resolves false.
    pub async fn next(&mut self) -> Result<bool> {
        self.current = None;
        let expect;
        let mut resume = false;
        {
            let mut st = self.shared.lock();
            if st.closed {
                return Ok(false);
            }
            if let Some(e) = &st.err {
                return Err(e.clone());
            }
            if let Some(values) = st.buffer.pop_front() {
                if st.paused && st.buffer.len() <= self.shared.config.low_water {
                    st.paused = false;
                    resume = true;
                }
                let names = st
                    .names
                    .clone()
                    .ok_or(ErrorContent::InvalidState("buffered row without field list"))?;
                self.current = Some(Row::new(names, values));
                drop(st);
                if resume {
                    self.shared.conn.resume();
                }
                return Ok(true);
            }
            if st.done || st.is_exec {
                return Ok(false);
            }
            if st.wait_next.is_some() {
                return Err(ErrorContent::InvalidState("concurrent next on one cursor").into());
            }
            let (p, e) = promise();
            st.wait_next = Some(p);
            expect = e;
        }
        match expect.wait().await {
            Ok(Ok(Some(row))) => {
                self.current = Some(row);
                Ok(true)
            }
            Ok(Ok(None)) => Ok(false),
            Ok(Err(e)) => Err(e),
            // The shared state went away mid-wait, treat as end of stream
            Err(_) => Ok(false),
        }
    }

    /// The current row
    ///
    /// Only valid after [Rows::next] resolved true, and until the next
    /// advance.
    pub fn row(&self) -> Result<&Row> {
        self.current
            .as_ref()
            .ok_or_else(|| ErrorContent::InvalidState("no current row").into())
    }

    /// The update result of an execute statement
    pub fn result(&self) -> Result<ExecResult> {
        let st = self.shared.lock();
        if !st.ready {
            return Err(ErrorContent::NotReady.into());
        }
        if let Some(e) = &st.ready_err {
            return Err(e.clone());
        }
        if !st.is_exec {
            return Err(ErrorContent::UnexpectedRows.into());
        }
        Ok(st.exec.unwrap_or_default())
    }

    /// Close the stream
    ///
    /// Cancels the underlying query if it is still running and discards
    /// buffered rows. Idempotent; safe to call while a [Rows::next] is
    /// pending on another path.
    pub async fn close(&mut self) -> Result<()> {
        self.current = None;
        if let Some(w) = self.watcher.take() {
            w.abort();
        }
        let mut kill = false;
        let mut dispose = None;
        let mut wait = None;
        {
            let mut st = self.shared.lock();
            if st.closed {
                return Ok(());
            }
            st.closed = true;
            st.buffer.clear();
            if st.done {
                dispose = self.shared.dispose(&mut st, Dispose::Release);
            } else if st.is_exec {
                // The update packet has arrived, the terminal end is
                // imminent; nothing is left to cancel
                let (p, e) = promise();
                st.wait_close = Some(p);
                wait = Some(e);
            } else {
                let already_canceling = st.canceling;
                st.canceling = true;
                if self.shared.config.keep_open {
                    let (p, e) = promise();
                    st.wait_close = Some(p);
                    wait = Some(e);
                    kill = !already_canceling;
                } else {
                    st.done = true;
                    if !st.ready {
                        st.ready = true;
                        let e = Error::from(ErrorContent::Canceled);
                        st.ready_err = Some(e.clone());
                        if let Some(p) = st.wait_ready.take() {
                            p.fulfill(Err(e));
                        }
                    }
                    if let Some(p) = st.wait_next.take() {
                        p.fulfill(Ok(None));
                    }
                    st.released = true;
                    // A close without a cancel or error lets the owned
                    // connection go down gracefully
                    dispose = Some(Dispose::End);
                }
            }
        }
        self.shared.perform(dispose);
        if kill {
            spawn_kill(self.shared.pool.clone(), self.shared.conn.thread_id());
        }
        match wait {
            Some(e) => e.wait().await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }

    /// Drain the cursor into a vector, closing it on every path
    pub async fn collect(mut self) -> Result<Vec<Row>> {
        let out = async {
            self.ready().await?;
            let mut rows = Vec::new();
            while self.next().await? {
                rows.push(self.row()?.clone());
            }
            Ok(rows)
        }
        .await;
        let closed = self.close().await;
        match out {
            Ok(rows) => closed.map(|()| rows),
            Err(e) => Err(e),
        }
    }

    /// Run the stream as a single row lookup: first row or None, stream
    /// closed regardless of outcome
    pub(crate) async fn into_single_row(mut self) -> Result<Option<Row>> {
        let out = async {
            self.ready().await?;
            if self.next().await? {
                Ok(Some(self.row()?.clone()))
            } else {
                Ok(None)
            }
        }
        .await;
        if let Err(e) = self.close().await {
            debug!("closing single-row stream failed: {e}");
        }
        out
    }

    /// Run the stream as an execute statement: readiness, the update
    /// packet, stream closed on every path
    pub(crate) async fn into_exec_result(mut self) -> Result<ExecResult> {
        let out = async {
            self.ready().await?;
            self.result()
        }
        .await;
        let closed = self.close().await;
        match out {
            Ok(r) => closed.map(|()| r),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Rows {
    fn drop(&mut self) {
        if let Some(w) = self.watcher.take() {
            w.abort();
        }
        let Ok(mut st) = self.shared.state.lock() else {
            return;
        };
        if st.closed || st.done {
            return;
        }
        st.closed = true;
        st.canceling = true;
        st.buffer.clear();
        if !self.shared.config.keep_open && !st.released {
            st.released = true;
            st.done = true;
            drop(st);
            // Dropped without a cancel or error, the owned connection can
            // still go down gracefully
            self.shared.conn.end();
        } else if self.shared.config.keep_open {
            drop(st);
            // Dropped without close while the query is still running; the
            // shared connection must not stay busy forever
            if tokio::runtime::Handle::try_current().is_ok() {
                spawn_kill(self.shared.pool.clone(), self.shared.conn.thread_id());
            } else {
                warn!("row stream dropped outside a runtime with its query still running");
            }
        }
    }
}

/// Interrupt the query running on `thread_id` from a second pooled
/// connection. Best effort: failures are logged and swallowed
fn spawn_kill(pool: Arc<dyn WirePool>, thread_id: u64) {
    tokio::spawn(async move {
        if let Err(e) = kill_query(&pool, thread_id).await {
            warn!("KILL QUERY {thread_id} failed: {e}");
        }
    });
}

/// Lease a fresh connection and run `KILL QUERY` on it
async fn kill_query(pool: &Arc<dyn WirePool>, thread_id: u64) -> Result<()> {
    let ctx = Context::background();
    let conn = acquire_wire(pool, &ctx).await?;
    let sql = format!("KILL QUERY {thread_id}");
    let rows = Rows::start(
        conn.clone(),
        pool.clone(),
        StreamConfig::default(),
        &ctx,
        &sql,
        &[],
    );
    let out = rows.into_exec_result().await;
    conn.release();
    out.map(|_| ())
}
