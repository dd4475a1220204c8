//! In-process broker and database
//!
//! Used for dry runs and tests. The broker is a channel; clones share the
//! same queue, settlement log and dead letters. The database keeps rows per
//! table and understands just enough SQL for plugin persistence: `INSERT INTO`,
//! `SELECT .. FROM`, `DELETE FROM` (params act as equality filters) and
//! `CREATE TABLE`.
//!
//! With process isolation each worker resolves its own `MemoryDatabase`, so
//! worker writes are never visible to the parent; `check-config` rejects
//! that combination.

use async_trait::async_trait;
use pipeline_common::DeadLetter;
use pipeline_core::{
    Acknowledge, Broker, ConnectorConfig, ConnectorError, ConnectorRegistry, Database, Delivery, DeliveryHandler,
    Params, Row,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack { tag: u64 },
    Nack { tag: u64, requeue: bool },
}

#[derive(Debug, Clone)]
struct Queued {
    tag: u64,
    body: Vec<u8>,
    routing_key: Option<String>,
    redelivered: bool,
}

#[derive(Default)]
struct BrokerState {
    settlements: Mutex<Vec<Settlement>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    changed: Notify,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MemoryBrokerOptions {
    redeliver: bool,
}

#[derive(Clone)]
pub struct MemoryBroker {
    sender: mpsc::UnboundedSender<Queued>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>>,
    state: Arc<BrokerState>,
    next_tag: Arc<AtomicU64>,
    redeliver: bool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            state: Arc::new(BrokerState::default()),
            next_tag: Arc::new(AtomicU64::new(1)),
            redeliver: false,
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let options: MemoryBrokerOptions = config.options()?;
        Ok(Self::new().with_redelivery(options.redeliver))
    }

    /// Put requeued deliveries back on the queue instead of only recording them
    pub fn with_redelivery(mut self, redeliver: bool) -> Self {
        self.redeliver = redeliver;
        self
    }

    /// Register this instance, so every resolution of `kind` shares its queue
    pub fn register(&self, registry: &mut ConnectorRegistry, kind: &str) {
        let broker = self.clone();
        registry.register_broker(kind, move |_config: ConnectorConfig| {
            let broker = broker.clone();
            async move { Ok::<_, ConnectorError>(Arc::new(broker) as Arc<dyn Broker>) }
        });
    }

    /// Enqueue a payload, returning its delivery tag
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> u64 {
        self.publish_with_key(body, None)
    }

    pub fn publish_with_key(&self, body: impl Into<Vec<u8>>, routing_key: Option<&str>) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let queued = Queued {
            tag,
            body: body.into(),
            routing_key: routing_key.map(str::to_string),
            redelivered: false,
        };
        // The receiver lives as long as self, so sending cannot fail
        let _ = self.sender.send(queued);
        tag
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        lock(&self.state.settlements).clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.state.dead_letters).clone()
    }

    /// Wait until at least `count` deliveries were settled or `timeout` passed
    pub async fn wait_for_settlements(&self, count: usize, timeout: Duration) -> Vec<Settlement> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.state.changed.notified();
            let settlements = self.settlements();
            if settlements.len() >= count {
                return settlements;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return self.settlements();
            }
        }
    }

    fn delivery(&self, queued: Queued) -> Delivery {
        Delivery {
            body: queued.body.clone(),
            routing_key: queued.routing_key.clone(),
            redelivered: queued.redelivered,
            acker: Box::new(MemoryAcker {
                state: self.state.clone(),
                requeue_to: self.redeliver.then(|| self.sender.clone()),
                queued,
            }),
        }
    }
}

struct MemoryAcker {
    state: Arc<BrokerState>,
    requeue_to: Option<mpsc::UnboundedSender<Queued>>,
    queued: Queued,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) {
        lock(&self.state.settlements).push(settlement);
        self.state.changed.notify_waiters();
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), ConnectorError> {
        self.settle(Settlement::Ack { tag: self.queued.tag });
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), ConnectorError> {
        self.settle(Settlement::Nack {
            tag: self.queued.tag,
            requeue,
        });
        if let (true, Some(sender)) = (requeue, &self.requeue_to) {
            let mut again = self.queued.clone();
            again.redelivered = true;
            sender
                .send(again)
                .map_err(|_| ConnectorError::Connection("memory queue closed".to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn test_connectivity(&self) -> bool {
        true
    }

    async fn start_listener(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        stop: CancellationToken,
    ) -> Result<(), ConnectorError> {
        let mut receiver = self.receiver.lock().await;
        let mut tasks = JoinSet::new();
        debug!("Memory broker listening");

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                queued = receiver.recv() => match queued {
                    Some(queued) => {
                        let handler = handler.clone();
                        let delivery = self.delivery(queued);
                        tasks.spawn(async move { handler.handle(delivery).await });
                    }
                    None => break,
                },
            }
        }

        while tasks.join_next().await.is_some() {}
        debug!("Memory broker stopped listening");
        Ok(())
    }

    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), ConnectorError> {
        lock(&self.state.dead_letters).push(letter.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MemoryDatabaseOptions {
    init: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct MemoryDatabase {
    init: Option<PathBuf>,
    tables: Mutex<BTreeMap<String, Vec<Row>>>,
    statements: Mutex<Vec<String>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let options: MemoryDatabaseOptions = config.options()?;
        Ok(Self {
            init: options.init,
            ..Self::default()
        })
    }

    /// Every statement executed so far, in order
    pub fn statements(&self) -> Vec<String> {
        lock(&self.statements).clone()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    fn run(&self, sql: &str, params: &Params) -> Vec<Row> {
        let statement = sql.trim();
        lock(&self.statements).push(statement.to_string());
        let lowered = statement.to_lowercase();
        let mut tables = lock(&self.tables);

        if lowered.starts_with("insert") {
            if let Some(table) = table_after(&lowered, "into") {
                tables.entry(table).or_default().push(params.clone());
            }
            Vec::new()
        } else if lowered.starts_with("select") {
            table_after(&lowered, "from")
                .and_then(|table| tables.get(&table))
                .map(|rows| rows.iter().filter(|row| row_matches(row, params)).cloned().collect())
                .unwrap_or_default()
        } else if lowered.starts_with("delete") {
            if let Some(rows) = table_after(&lowered, "from").and_then(|table| tables.get_mut(&table)) {
                rows.retain(|row| !row_matches(row, params));
            }
            Vec::new()
        } else {
            if lowered.starts_with("create table") {
                if let Some(table) = table_after(&lowered.replace("if not exists", ""), "table") {
                    tables.entry(table).or_default();
                }
            }
            Vec::new()
        }
    }
}

/// Name following `keyword`, without quotes or a column list
fn table_after(sql: &str, keyword: &str) -> Option<String> {
    let mut words = sql.split_whitespace();
    words.by_ref().find(|word| *word == keyword)?;
    let name = words.next()?.split('(').next()?.trim_matches(|c| c == '"' || c == ';');
    (!name.is_empty()).then(|| name.to_string())
}

fn row_matches(row: &Row, params: &Params) -> bool {
    params
        .iter()
        .all(|(key, value)| row.get(key).map_or(true, |have| have == value))
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn initialize(&self) -> Result<(), ConnectorError> {
        match &self.init {
            Some(script) => self.execute_script(script, &Params::new()).await,
            None => Ok(()),
        }
    }

    async fn execute_script(&self, path: &Path, params: &Params) -> Result<(), ConnectorError> {
        let script = crate::read_script(path).await?;
        for statement in script.split(';').filter(|s| !s.trim().is_empty()) {
            self.run(statement, params);
        }
        Ok(())
    }

    async fn execute_query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, ConnectorError> {
        Ok(self.run(sql, params))
    }
}
