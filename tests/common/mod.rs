//! Scripted wire driver backing the integration tests
//!
//! Behaves like the event side of a real driver: each query runs on its own
//! task and pushes fields, rows and a terminal event, honoring pause/resume
//! and `KILL QUERY` against the thread id of a sibling connection.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cursql::constants::{error_code, type_};
use cursql::driver::{
    DriverError, ExecResult, FieldPacket, QueryEvents, ResultPacket, WireConn, WirePool,
};
use cursql::pool::Pool;
use cursql::value::Value;
use tokio::sync::Notify;

/// What one scripted statement produces
#[derive(Clone)]
pub enum Script {
    /// Field list, rows, clean end
    Rows {
        fields: Vec<FieldPacket>,
        rows: Vec<Vec<Value>>,
    },
    /// Field list, some rows, then a driver error
    RowsThenFail {
        fields: Vec<FieldPacket>,
        rows: Vec<Vec<Value>>,
        err: DriverError,
    },
    /// A single update packet, no field list
    Exec(ExecResult),
    /// Immediate driver error
    Fail(DriverError),
    /// Emit nothing until killed or torn down
    Hang,
}

/// A BIGINT field definition
pub fn bigint(name: &str) -> FieldPacket {
    FieldPacket {
        name: name.into(),
        type_code: type_::LONG_LONG,
        flags: 0,
        column_length: 20,
        decimals: 0,
    }
}

/// A VARCHAR(10) field definition
pub fn varchar(name: &str) -> FieldPacket {
    FieldPacket {
        name: name.into(),
        type_code: type_::VAR_STRING,
        flags: 0,
        column_length: 40,
        decimals: 0,
    }
}

/// Single integer column rows covering `range`
pub fn int_rows(range: std::ops::RangeInclusive<i64>) -> Vec<Vec<Value>> {
    range.map(|i| vec![Value::Int(i)]).collect()
}

/// The interrupt a server raises on the victim of a KILL QUERY
pub fn interrupted() -> DriverError {
    DriverError::server(
        error_code::ER_QUERY_INTERRUPTED,
        "Query execution was interrupted",
    )
}

/// Poll until `f` holds, panicking after a couple of seconds
pub async fn wait_until(what: &str, f: impl Fn() -> bool) {
    for _ in 0..1000 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Delivery gate of one connection
#[derive(Default)]
struct GateState {
    paused: bool,
    interrupted: bool,
    dead: bool,
}

struct Gate {
    state: Mutex<GateState>,
    notify: Notify,
}

enum Go {
    Deliver,
    Interrupted,
    Dead,
}

impl Gate {
    fn new() -> Gate {
        Gate {
            state: Mutex::new(GateState::default()),
            notify: Notify::new(),
        }
    }

    fn set(&self, f: impl FnOnce(&mut GateState)) {
        f(&mut self.state.lock().unwrap());
        self.notify.notify_one();
    }

    fn is_dead(&self) -> bool {
        self.state.lock().unwrap().dead
    }

    /// Fresh query on this connection: pause and interrupt are per query
    fn reset(&self) {
        let mut st = self.state.lock().unwrap();
        st.paused = false;
        st.interrupted = false;
    }

    /// Wait until the next row may be delivered
    async fn next_step(&self) -> Go {
        loop {
            let notified = self.notify.notified();
            {
                let st = self.state.lock().unwrap();
                if st.dead {
                    return Go::Dead;
                }
                if st.interrupted {
                    return Go::Interrupted;
                }
                if !st.paused {
                    return Go::Deliver;
                }
            }
            notified.await;
        }
    }

    /// Wait for a terminal reason only
    async fn wait_terminal(&self) -> Go {
        loop {
            let notified = self.notify.notified();
            {
                let st = self.state.lock().unwrap();
                if st.dead {
                    return Go::Dead;
                }
                if st.interrupted {
                    return Go::Interrupted;
                }
            }
            notified.await;
        }
    }
}

/// One scripted connection
pub struct MockConn {
    id: u64,
    core: Arc<PoolCore>,
    gate: Arc<Gate>,
}

impl WireConn for MockConn {
    fn start_query(&self, sql: &str, params: &[Value], events: Arc<dyn QueryEvents>) {
        self.core
            .log
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        if let Some(rest) = sql.strip_prefix("KILL QUERY ") {
            let target: u64 = rest.trim().parse().unwrap_or(0);
            self.core.interrupt(target);
            events.on_result(ResultPacket::Exec(ExecResult::default()));
            events.on_end();
            return;
        }
        self.gate.reset();
        let script = self.core.script_for(sql);
        let gate = self.gate.clone();
        let core = self.core.clone();
        tokio::spawn(async move {
            run_script(script, gate, core, events).await;
        });
    }

    fn pause(&self) {
        self.core.pauses.fetch_add(1, Ordering::SeqCst);
        self.gate.set(|st| st.paused = true);
    }

    fn resume(&self) {
        self.core.resumes.fetch_add(1, Ordering::SeqCst);
        self.gate.set(|st| st.paused = false);
    }

    fn thread_id(&self) -> u64 {
        self.id
    }

    fn release(&self) {
        self.core.release(self.id);
    }

    fn end(&self) {
        self.core.discard(self.id, false);
        self.gate.set(|st| st.dead = true);
    }

    fn destroy(&self) {
        self.core.discard(self.id, true);
        self.gate.set(|st| st.dead = true);
    }
}

/// Push one script's events, honoring the gate between rows
async fn run_script(script: Script, gate: Arc<Gate>, core: Arc<PoolCore>, events: Arc<dyn QueryEvents>) {
    let (fields, rows, terminal) = match script {
        Script::Fail(e) => {
            events.on_error(e);
            return;
        }
        Script::Exec(r) => {
            events.on_result(ResultPacket::Exec(r));
            events.on_end();
            return;
        }
        Script::Hang => {
            match gate.wait_terminal().await {
                Go::Interrupted => events.on_error(interrupted()),
                _ => {}
            }
            return;
        }
        Script::Rows { fields, rows } => (fields, rows, None),
        Script::RowsThenFail { fields, rows, err } => (fields, rows, Some(err)),
    };
    events.on_fields(fields);
    for row in rows {
        match gate.next_step().await {
            Go::Deliver => {
                core.rows_emitted.fetch_add(1, Ordering::SeqCst);
                events.on_result(ResultPacket::Row(row));
            }
            Go::Interrupted => {
                events.on_error(interrupted());
                return;
            }
            Go::Dead => return,
        }
        tokio::task::yield_now().await;
    }
    match terminal {
        Some(err) => events.on_error(err),
        None => match gate.next_step().await {
            Go::Deliver => events.on_end(),
            Go::Interrupted => events.on_error(interrupted()),
            Go::Dead => {}
        },
    }
}

/// Shared pool state
pub struct PoolCore {
    me: Weak<PoolCore>,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    conns: Mutex<Vec<Arc<MockConn>>>,
    idle: Mutex<Vec<Arc<MockConn>>>,
    held: Mutex<Option<Vec<AcquireCb>>>,
    acquire_failures: Mutex<VecDeque<DriverError>>,
    leased: AtomicUsize,
    created: AtomicUsize,
    ended: AtomicUsize,
    destroyed: AtomicUsize,
    pauses: AtomicUsize,
    resumes: AtomicUsize,
    rows_emitted: AtomicUsize,
    next_id: AtomicU64,
    log: Mutex<Vec<(String, Vec<Value>)>>,
}

type AcquireCb = Box<dyn FnOnce(Result<Arc<dyn WireConn>, DriverError>) + Send>;

impl PoolCore {
    fn checkout(&self) -> Arc<dyn WireConn> {
        let reused = self.idle.lock().unwrap().pop();
        let conn = reused.unwrap_or_else(|| {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.created.fetch_add(1, Ordering::SeqCst);
            let conn = Arc::new(MockConn {
                id,
                core: self.me.upgrade().expect("pool core gone"),
                gate: Arc::new(Gate::new()),
            });
            self.conns.lock().unwrap().push(conn.clone());
            conn
        });
        self.leased.fetch_add(1, Ordering::SeqCst);
        conn
    }

    fn release(&self, id: u64) {
        let prev = self.leased.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "released a connection that was not leased");
        let conn = self
            .conns
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned();
        if let Some(conn) = conn {
            if !conn.gate.is_dead() {
                self.idle.lock().unwrap().push(conn);
            }
        }
    }

    fn discard(&self, _id: u64, hard: bool) {
        let prev = self.leased.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "closed a connection that was not leased");
        if hard {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn interrupt(&self, id: u64) {
        let conn = self
            .conns
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned();
        if let Some(conn) = conn {
            conn.gate.set(|st| st.interrupted = true);
        }
    }

    fn script_for(&self, sql: &str) -> Script {
        if let Some(queue) = self.scripts.lock().unwrap().get_mut(sql) {
            if let Some(s) = queue.pop_front() {
                return s;
            }
        }
        if sql.starts_with("SET TRANSACTION")
            || sql.starts_with("START TRANSACTION")
            || sql == "COMMIT"
            || sql == "ROLLBACK"
        {
            return Script::Exec(ExecResult::default());
        }
        Script::Fail(DriverError::client(format!("no script for {sql:?}")))
    }
}

impl WirePool for PoolCore {
    fn get_connection(&self, cb: AcquireCb) {
        if let Some(e) = self.acquire_failures.lock().unwrap().pop_front() {
            cb(Err(e));
            return;
        }
        if let Some(held) = self.held.lock().unwrap().as_mut() {
            held.push(cb);
            return;
        }
        cb(Ok(self.checkout()));
    }

    fn end(&self) {}
}

/// Handle the tests hold on the scripted driver
#[derive(Clone)]
pub struct MockPool {
    core: Arc<PoolCore>,
}

impl MockPool {
    pub fn new() -> MockPool {
        let core = Arc::new_cyclic(|me| PoolCore {
            me: me.clone(),
            scripts: Mutex::new(HashMap::new()),
            conns: Mutex::new(Vec::new()),
            idle: Mutex::new(Vec::new()),
            held: Mutex::new(None),
            acquire_failures: Mutex::new(VecDeque::new()),
            leased: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            ended: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            rows_emitted: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            log: Mutex::new(Vec::new()),
        });
        MockPool { core }
    }

    /// The driver facade consumed by the layer under test
    pub fn driver(&self) -> Arc<dyn WirePool> {
        self.core.clone()
    }

    /// A layer pool over this driver
    pub fn pool(&self) -> Pool {
        Pool::new(self.driver())
    }

    /// Queue the script for the next run of `sql`
    pub fn script(&self, sql: &str, script: Script) {
        self.core
            .scripts
            .lock()
            .unwrap()
            .entry(sql.to_string())
            .or_default()
            .push_back(script);
    }

    /// Queue a plain row script
    pub fn script_rows(&self, sql: &str, fields: Vec<FieldPacket>, rows: Vec<Vec<Value>>) {
        self.script(sql, Script::Rows { fields, rows });
    }

    /// Queue an update script
    pub fn script_exec(&self, sql: &str, affected_rows: u64, last_insert_id: u64) {
        self.script(
            sql,
            Script::Exec(ExecResult {
                affected_rows,
                last_insert_id,
            }),
        );
    }

    /// Queue a failing script
    pub fn script_fail(&self, sql: &str, err: DriverError) {
        self.script(sql, Script::Fail(err));
    }

    /// Fail the next acquire instead of delivering a connection
    pub fn fail_next_acquire(&self, err: DriverError) {
        self.core.acquire_failures.lock().unwrap().push_back(err);
    }

    /// Park acquires instead of answering them
    pub fn hold_acquires(&self) {
        *self.core.held.lock().unwrap() = Some(Vec::new());
    }

    /// Number of acquires currently parked
    pub fn held_count(&self) -> usize {
        self.core.held.lock().unwrap().as_ref().map_or(0, Vec::len)
    }

    /// Answer every parked acquire with a fresh connection
    pub fn release_held(&self) {
        let held = self.core.held.lock().unwrap().take();
        for cb in held.into_iter().flatten() {
            cb(Ok(self.core.checkout()));
        }
    }

    /// Connections currently out of the pool
    pub fn leased(&self) -> usize {
        self.core.leased.load(Ordering::SeqCst)
    }

    /// Connections ever created
    pub fn created(&self) -> usize {
        self.core.created.load(Ordering::SeqCst)
    }

    /// Connections closed gracefully
    pub fn ended(&self) -> usize {
        self.core.ended.load(Ordering::SeqCst)
    }

    /// Connections torn down hard
    pub fn destroyed(&self) -> usize {
        self.core.destroyed.load(Ordering::SeqCst)
    }

    /// Raw pause calls observed on the wire
    pub fn pauses(&self) -> usize {
        self.core.pauses.load(Ordering::SeqCst)
    }

    /// Raw resume calls observed on the wire
    pub fn resumes(&self) -> usize {
        self.core.resumes.load(Ordering::SeqCst)
    }

    /// Rows pushed by every emitter so far
    pub fn rows_emitted(&self) -> usize {
        self.core.rows_emitted.load(Ordering::SeqCst)
    }

    /// Every statement started, in order
    pub fn executed(&self) -> Vec<String> {
        self.core
            .log
            .lock()
            .unwrap()
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    /// The positional parameters of the most recent run of `sql`
    pub fn params_of(&self, sql: &str) -> Option<Vec<Value>> {
        self.core
            .log
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(s, _)| s == sql)
            .map(|(_, p)| p.clone())
    }
}
