//! Scripted in-memory database sessions for integration tests.
//!
//! Every statement is recorded with placeholders already substituted. Replies are chosen
//! by the most recently registered rule whose prefix matches the statement.

#![allow(dead_code)]

use async_trait::async_trait;
use exasol_provider::db::sql::bind_literals;
use exasol_provider::db::{ConnectionPool, Connector, PoolMode, Row, SqlConnection};
use exasol_provider::error::{ProviderError, ProviderResult, ROLLBACK_MARKER, classify_database_error};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    Rows(Vec<Row>),
    Affected(u64),
    /// Sleep, then report zero rows affected.
    Sleep(Duration),
    Collision,
    Fail(String),
}

#[derive(Debug)]
struct Rule {
    prefix: String,
    reply: Reply,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    log: Vec<(usize, String)>,
    rules: Vec<Rule>,
    active: usize,
    max_active: usize,
    closed: usize,
    closed_slots: Vec<usize>,
    used_after_close: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeDb {
    state: Arc<Mutex<State>>,
}

pub fn row(values: &[Option<&str>]) -> Row {
    values.iter().map(|v| v.map(str::to_string)).collect()
}

pub fn collision() -> ProviderError {
    classify_database_error(
        &format!("{}. (Session: 1)", ROLLBACK_MARKER),
        Some("40001".to_string()),
    )
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every statement starting with `prefix`.
    pub fn on(&self, prefix: &str, reply: Reply) {
        self.push_rule(prefix, reply, None);
    }

    /// Answer the next `times` statements starting with `prefix`.
    pub fn on_times(&self, prefix: &str, times: usize, reply: Reply) {
        self.push_rule(prefix, reply, Some(times));
    }

    fn push_rule(&self, prefix: &str, reply: Reply, remaining: Option<usize>) {
        self.state.lock().unwrap().rules.push(Rule {
            prefix: prefix.to_string(),
            reply,
            remaining,
        });
    }

    pub fn connection(&self, slot: usize) -> Box<dyn SqlConnection> {
        Box::new(FakeConnection {
            slot,
            db: self.clone(),
        })
    }

    pub fn pool(&self, size: usize, mode: PoolMode) -> ConnectionPool {
        let connections = (0..size).map(|slot| self.connection(slot)).collect();
        ConnectionPool::from_connections(connections, mode).unwrap()
    }

    /// All statements in execution order.
    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Statements that change something (everything but SELECT).
    pub fn mutations(&self) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|sql| !sql.starts_with("SELECT"))
            .collect()
    }

    /// Session index of every statement, in execution order.
    pub fn slots(&self) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .map(|(slot, _)| *slot)
            .collect()
    }

    pub fn max_active(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    /// Statements that reached a session after it was closed.
    pub fn used_after_close(&self) -> usize {
        self.state.lock().unwrap().used_after_close
    }

    fn reply_for(&self, slot: usize, sql: &str) -> Option<Reply> {
        let mut state = self.state.lock().unwrap();
        if state.closed_slots.contains(&slot) {
            state.used_after_close += 1;
        }
        state.log.push((slot, sql.to_string()));
        let rule = state
            .rules
            .iter_mut()
            .rev()
            .find(|r| sql.starts_with(&r.prefix) && r.remaining != Some(0))?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.reply.clone())
    }

    async fn run(&self, slot: usize, sql: &str, args: &[String]) -> ProviderResult<Reply> {
        let sql = bind_literals(sql, args);
        let reply = self.reply_for(slot, &sql);
        match reply {
            Some(Reply::Sleep(delay)) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.active += 1;
                    state.max_active = state.max_active.max(state.active);
                }
                tokio::time::sleep(delay).await;
                self.state.lock().unwrap().active -= 1;
                Ok(Reply::Affected(0))
            }
            Some(Reply::Collision) => Err(collision()),
            Some(Reply::Fail(message)) => Err(classify_database_error(&message, None)),
            Some(reply) => Ok(reply),
            None => Ok(Reply::Rows(Vec::new())),
        }
    }
}

pub struct FakeConnection {
    slot: usize,
    db: FakeDb,
}

#[async_trait]
impl SqlConnection for FakeConnection {
    async fn execute(&mut self, sql: &str, args: &[String]) -> ProviderResult<u64> {
        match self.db.run(self.slot, sql, args).await? {
            Reply::Affected(n) => Ok(n),
            Reply::Rows(rows) => Ok(rows.len() as u64),
            _ => Ok(0),
        }
    }

    async fn fetch(&mut self, sql: &str, args: &[String]) -> ProviderResult<Vec<Row>> {
        match self.db.run(self.slot, sql, args).await? {
            Reply::Rows(rows) => Ok(rows),
            _ => Ok(Vec::new()),
        }
    }

    async fn commit(&mut self) -> ProviderResult<()> {
        self.db.run(self.slot, "COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> ProviderResult<()> {
        self.db.run(self.slot, "ROLLBACK", &[]).await.map(|_| ())
    }

    async fn close(&mut self) -> ProviderResult<()> {
        let mut state = self.db.state.lock().unwrap();
        state.closed += 1;
        state.closed_slots.push(self.slot);
        Ok(())
    }
}

/// Connector handing out fake sessions; fails the connect numbered `fail_at` (0-based).
pub struct FakeConnector {
    pub db: FakeDb,
    pub fail_at: Option<usize>,
    opened: Mutex<usize>,
}

impl FakeConnector {
    pub fn new(db: FakeDb, fail_at: Option<usize>) -> Self {
        Self {
            db,
            fail_at,
            opened: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> ProviderResult<Box<dyn SqlConnection>> {
        let slot = {
            let mut opened = self.opened.lock().unwrap();
            let slot = *opened;
            *opened += 1;
            slot
        };
        if self.fail_at == Some(slot) {
            return Err(ProviderError::connection("refused", "check the fake"));
        }
        Ok(self.db.connection(slot))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
