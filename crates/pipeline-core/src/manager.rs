//! Processing manager: the per-message state machine
//!
//! RECEIVED -> VALIDATING -> QUERYING -> PROCESSING -> DONE | RETRY | FAILED
//!
//! Decode failures and unsupported mime types never reach a plugin. Plugin
//! failures are collected from every dispatched plugin before the ack
//! decision, and each failing plugin gets its own dead letter.

use crate::config::{BrokerPolicy, Config};
use crate::connector::{Broker, ConnectorRegistry, Delivery, DeliveryHandler};
use crate::decoder::MessageDecoder;
use crate::error::{PluginExecutionError, ProcessingError};
use crate::executor::{PluginExecutor, PluginJob};
use crate::fetch::Fetcher;
use crate::fileinfo::{self, APPLICATION_OCTET_STREAM};
use crate::registry::PluginRegistry;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use futures::future::join_all;
use pipeline_common::{DeadLetter, Disposition, LocalContent, Message, Metadata, PluginFailure};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct ProcessingManager {
    config: Arc<Config>,
    policy: BrokerPolicy,
    decoder: MessageDecoder,
    fetcher: Fetcher,
    registry: Arc<PluginRegistry>,
    executor: Arc<dyn PluginExecutor>,
    broker: Arc<dyn Broker>,
    shutdown: Shutdown,
}

impl ProcessingManager {
    /// Resolve the broker and data store; both are required at startup
    pub async fn new(
        config: Arc<Config>,
        connectors: &ConnectorRegistry,
        registry: Arc<PluginRegistry>,
        executor: Arc<dyn PluginExecutor>,
        shutdown: Shutdown,
    ) -> Result<Self, ProcessingError> {
        let broker = connectors.broker(&config.broker).await?;
        let fetcher = Fetcher::new(&config, connectors).await?;
        Self::with_parts(config, broker, fetcher, registry, executor, shutdown)
    }

    pub fn with_parts(
        config: Arc<Config>,
        broker: Arc<dyn Broker>,
        fetcher: Fetcher,
        registry: Arc<PluginRegistry>,
        executor: Arc<dyn PluginExecutor>,
        shutdown: Shutdown,
    ) -> Result<Self, ProcessingError> {
        let decoder = MessageDecoder::new(&config.message)?;
        let policy = config.broker_policy()?;
        Ok(Self {
            config,
            policy,
            decoder,
            fetcher,
            registry,
            executor,
            broker,
            shutdown,
        })
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Wait for the broker, then consume until intake stops
    pub async fn run(self: Arc<Self>) -> Result<(), ProcessingError> {
        if !self.wait_for_broker().await {
            info!("Shutdown requested before the broker became available");
            return Ok(());
        }

        info!("Starting message subscription on {} broker", self.broker.kind());
        let handler: Arc<dyn DeliveryHandler> = self.clone();
        self.broker
            .start_listener(handler, self.shutdown.intake_token())
            .await
            .map_err(ProcessingError::Connector)?;
        info!("Message subscription stopped");
        Ok(())
    }

    /// Retry connectivity every `retry_interval`; false when shutdown wins
    pub async fn wait_for_broker(&self) -> bool {
        let stop = self.shutdown.intake_token();
        loop {
            if self.broker.test_connectivity().await {
                info!("Connected to {} broker", self.broker.kind());
                return true;
            }
            warn!(
                "Could not connect to {} broker, retrying in {}s",
                self.broker.kind(),
                self.policy.retry_interval
            );
            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep(self.policy.retry_interval()) => {}
            }
        }
    }

    /// Decode, process and classify one payload, publishing dead letters on plugin failures
    pub async fn process_message(&self, body: &[u8], routing_key: Option<&str>) -> Disposition {
        let mut message = match self.decoder.decode(body) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping message that could not be decoded: {}", e);
                return Disposition::Failed;
            }
        };

        info!("Message processing started for {}", message.label());
        match self.process(&mut message).await {
            Ok(()) => {
                info!("Processing completed for {}", message.label());
                Disposition::Done
            }
            Err(ProcessingError::PluginExecution(err)) => {
                warn!("Processing of {} finished with failures: {}", message.label(), err);
                self.dead_letter(&message, &err.failures, routing_key).await;
                Disposition::Failed
            }
            Err(e) => {
                let disposition = e.disposition();
                if disposition == Disposition::Retry {
                    warn!(
                        "Could not fetch content and/or metadata for {} at this point: {}",
                        message.label(),
                        e
                    );
                } else {
                    error!("Could not process message {}: {}", message.label(), e);
                }
                disposition
            }
        }
    }

    /// Query, validate, hash and dispatch an already decoded message
    pub async fn process(&self, message: &mut Message) -> Result<(), ProcessingError> {
        let (content, metadata) = self.query(message).await?;

        if message.mime_type.is_none() {
            let mime = fileinfo::get_mime_type(content.path(), &metadata, self.config.message.mime.as_ref());
            debug!("Resolved mime type {} for {}", mime, message.label());
            message.mime_type = Some(mime);
        }
        let mime = message.mime_type.as_deref().unwrap_or(APPLICATION_OCTET_STREAM);
        fileinfo::validate_mime_type(mime, self.registry.accepted_types())?;

        message.hash_digest = Some(fileinfo::compute_digest(content.path()).await?);

        self.execute_plugins(message, &metadata, &content).await?;
        Ok(())
    }

    pub async fn query(&self, message: &Message) -> Result<(LocalContent, Metadata), ProcessingError> {
        self.fetcher.query(message).await
    }

    /// Run every matching plugin concurrently and wait for all of them
    pub async fn execute_plugins(
        &self,
        message: &Message,
        metadata: &Metadata,
        content: &LocalContent,
    ) -> Result<(), PluginExecutionError> {
        let mime = message.mime_type.as_deref().unwrap_or(APPLICATION_OCTET_STREAM);
        let selected = self.registry.select(mime);
        if selected.is_empty() {
            debug!("No active plugin selected for {} ({})", message.label(), mime);
            return Ok(());
        }

        debug!("Dispatching {} plugin(s) for {}", selected.len(), message.label());
        let job = PluginJob {
            message: message.clone(),
            metadata: metadata.clone(),
            content_path: content.path().to_path_buf(),
        };
        let results = join_all(
            selected
                .iter()
                .map(|descriptor| self.executor.execute(descriptor, job.clone())),
        )
        .await;

        let failures: Vec<PluginFailure> = results.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PluginExecutionError { failures })
        }
    }

    async fn dead_letter(&self, message: &Message, failures: &[PluginFailure], routing_key: Option<&str>) {
        for failure in failures {
            let letter = DeadLetter::new(message, failure, routing_key);
            match self.broker.publish_dead_letter(&letter).await {
                Ok(()) => debug!("Dead-lettered {} for plugin {}", message.label(), failure.plugin),
                Err(e) => error!(
                    "Could not dead-letter {} for plugin {}: {}",
                    message.label(),
                    failure.plugin,
                    e
                ),
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for ProcessingManager {
    async fn handle(&self, delivery: Delivery) {
        if self.shutdown.is_requested() {
            debug!("Shutting down, returning delivery to the broker");
            if let Err(e) = delivery.acker.nack(true).await {
                warn!("Could not return delivery: {}", e);
            }
            return;
        }

        let _guard = self.shutdown.guard();
        if self.policy.process_delay > 0 {
            tokio::time::sleep(self.policy.process_delay()).await;
        }

        let disposition = self
            .process_message(&delivery.body, delivery.routing_key.as_deref())
            .await;
        let settled = match disposition {
            Disposition::Done => delivery.acker.ack().await,
            Disposition::Retry => delivery.acker.nack(true).await,
            Disposition::Failed => delivery.acker.nack(self.policy.requeue).await,
        };
        if let Err(e) = settled {
            error!("Could not settle delivery ({:?}): {}", disposition, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Acknowledge, DataStore, Database};
    use crate::error::{ConnectorError, PluginError};
    use crate::executor::TaskExecutor;
    use crate::plugin::{Content, Plugin, PluginCatalog};
    use crate::registry::tests::connectors;
    use pipeline_common::FailureKind;
    use serde_json::json;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingBroker {
        letters: Mutex<Vec<DeadLetter>>,
        reachable_after: AtomicUsize,
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        fn kind(&self) -> &str {
            "recording"
        }

        async fn test_connectivity(&self) -> bool {
            let remaining = self.reachable_after.load(Ordering::SeqCst);
            if remaining == 0 {
                return true;
            }
            self.reachable_after.store(remaining - 1, Ordering::SeqCst);
            false
        }

        async fn start_listener(
            &self,
            _handler: Arc<dyn DeliveryHandler>,
            stop: CancellationToken,
        ) -> Result<(), ConnectorError> {
            stop.cancelled().await;
            Ok(())
        }

        async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), ConnectorError> {
            self.letters.lock().unwrap().push(letter.clone());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Settlement(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Acknowledge for Settlement {
        async fn ack(&self) -> Result<(), ConnectorError> {
            self.0.lock().unwrap().push("ack".to_string());
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), ConnectorError> {
            self.0.lock().unwrap().push(format!("nack:{requeue}"));
            Ok(())
        }
    }

    struct LocalStore;

    #[async_trait]
    impl DataStore for LocalStore {
        async fn download_to_disk(&self, reference: &str) -> Result<LocalContent, ConnectorError> {
            let path = std::path::Path::new(reference);
            if !path.exists() {
                return Err(ConnectorError::NotFound(reference.to_string()));
            }
            Ok(LocalContent::persistent(path))
        }
    }

    /// Records what it saw and optionally fails
    struct Recorder {
        name: String,
        fail: bool,
        seen: Seen,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(
            &self,
            _config: &Config,
            _database: &dyn Database,
            mut message: Message,
            mut metadata: Metadata,
            _content: Content,
        ) -> Result<(), PluginError> {
            self.seen
                .lock()
                .unwrap()
                .push((self.name.clone(), message.mime_type.clone(), message.hash_digest.clone()));
            message.uuid = Some("mutated".to_string());
            metadata.insert("mutated".to_string(), json!(true));
            if self.fail {
                return Err(PluginError::ExecutionFailed(format!("{} refused", self.name)));
            }
            Ok(())
        }
    }

    type Seen = Arc<Mutex<Vec<(String, Option<String>, Option<String>)>>>;

    struct Harness {
        manager: Arc<ProcessingManager>,
        broker: Arc<RecordingBroker>,
        seen: Seen,
        _dir: tempfile::TempDir,
    }

    async fn harness(plugins: &[(&str, &str, bool)], broker_yaml: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let seen: Seen = Arc::default();
        let mut catalog = PluginCatalog::new();
        for (name, accepted, fail) in plugins {
            std::fs::write(
                dir.path().join(format!("{name}.yaml")),
                format!("plugin:\n  accepted_mime_types: {accepted}\n  timeout_seconds: 5\n"),
            )
            .unwrap();
            let (owned, fail, seen) = (name.to_string(), *fail, seen.clone());
            catalog.register(name, move |_| {
                Ok(Arc::new(Recorder {
                    name: owned.clone(),
                    fail,
                    seen: seen.clone(),
                }) as Arc<dyn Plugin>)
            });
        }

        let config = Config::from_yaml_str(&format!(
            "broker:\n  type: recording\n{broker_yaml}database:\n  type: memory\nplugins_dir: {}\n",
            dir.path().display()
        ))
        .unwrap();
        let registry = PluginRegistry::discover(&config, &catalog, &connectors()).await;
        let broker = Arc::new(RecordingBroker::default());
        let manager = ProcessingManager::with_parts(
            Arc::new(config),
            broker.clone(),
            Fetcher::with_data_store(Arc::new(LocalStore), None, ConnectorRegistry::new()),
            Arc::new(registry),
            Arc::new(TaskExecutor),
            Shutdown::new(),
        )
        .unwrap();

        Harness {
            manager: Arc::new(manager),
            broker,
            seen,
            _dir: dir,
        }
    }

    fn png_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D]).unwrap();
        file
    }

    fn payload(path: &str) -> Vec<u8> {
        json!({"uuid": "u1", "data_location": path, "meta_location": "store/u1"})
            .to_string()
            .into_bytes()
    }

    #[tokio::test]
    async fn test_only_matching_plugins_dispatched() {
        let h = harness(&[("jpeg", "[image/jpeg]", false), ("any", "['*']", false)], "").await;
        let file = png_file();

        let disposition = h
            .manager
            .process_message(&payload(&file.path().display().to_string()), None)
            .await;
        assert_eq!(disposition, Disposition::Done);

        let seen = h.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "any");
        assert_eq!(seen[0].1.as_deref(), Some("image/png"));
        let digest = seen[0].2.clone().unwrap();
        assert_eq!(digest.len(), 64);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_siblings() {
        let h = harness(&[("good", "[]", false), ("bad", "[]", true), ("other", "[]", false)], "").await;
        let file = png_file();

        let disposition = h
            .manager
            .process_message(&payload(&file.path().display().to_string()), Some("incoming"))
            .await;
        assert_eq!(disposition, Disposition::Failed);
        assert_eq!(h.seen.lock().unwrap().len(), 3);

        let letters = h.broker.letters.lock().unwrap().clone();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].plugin, "bad");
        assert_eq!(letters[0].kind, FailureKind::Error);
        assert_eq!(letters[0].routing_key.as_deref(), Some("incoming"));
        assert_eq!(letters[0].uuid.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_each_failing_plugin_is_dead_lettered() {
        let h = harness(&[("a", "[]", true), ("b", "[]", true)], "").await;
        let file = png_file();
        h.manager
            .process_message(&payload(&file.path().display().to_string()), None)
            .await;

        let mut plugins: Vec<String> = h.broker.letters.lock().unwrap().iter().map(|l| l.plugin.clone()).collect();
        plugins.sort();
        assert_eq!(plugins, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_content_is_retry() {
        let h = harness(&[("any", "['*']", false)], "").await;
        let disposition = h.manager.process_message(&payload("missing"), None).await;
        assert_eq!(disposition, Disposition::Retry);
        assert!(h.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_mime_and_bad_payload_fail() {
        let h = harness(&[("jpeg", "[image/jpeg]", false)], "").await;
        let file = png_file();
        let disposition = h
            .manager
            .process_message(&payload(&file.path().display().to_string()), None)
            .await;
        assert_eq!(disposition, Disposition::Failed);

        let disposition = h.manager.process_message(br#"{"uuid": "u1"}"#, None).await;
        assert_eq!(disposition, Disposition::Failed);
        assert!(h.seen.lock().unwrap().is_empty());
        assert!(h.broker.letters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_without_meta_store() {
        let h = harness(&[], "").await;
        let file = png_file();
        let mut message = Message::new(file.path().display().to_string());
        message.uuid = Some("u1".to_string());
        message.meta_location = Some("store/u1".to_string());

        let (content, metadata) = h.manager.query(&message).await.unwrap();
        assert_eq!(content.path(), file.path());
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn test_handle_settles_delivery() {
        let h = harness(&[("bad", "[]", true)], "  requeue: true\n").await;
        let file = png_file();
        let settlement = Settlement::default();

        h.manager
            .handle(Delivery {
                body: payload(&file.path().display().to_string()),
                routing_key: None,
                redelivered: false,
                acker: Box::new(settlement.clone()),
            })
            .await;
        h.manager
            .handle(Delivery {
                body: payload("missing"),
                routing_key: None,
                redelivered: false,
                acker: Box::new(settlement.clone()),
            })
            .await;

        assert_eq!(
            settlement.0.lock().unwrap().clone(),
            vec!["nack:true".to_string(), "nack:true".to_string()]
        );
        assert_eq!(h.manager.shutdown().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_handle_after_shutdown_returns_delivery() {
        let h = harness(&[("any", "[]", false)], "").await;
        h.manager.shutdown().request();
        let settlement = Settlement::default();
        h.manager
            .handle(Delivery {
                body: payload("whatever"),
                routing_key: None,
                redelivered: false,
                acker: Box::new(settlement.clone()),
            })
            .await;
        assert_eq!(settlement.0.lock().unwrap().clone(), vec!["nack:true".to_string()]);
        assert!(h.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_loop_retries() {
        let h = harness(&[], "  retry_interval: 1\n").await;
        h.broker.reachable_after.store(2, Ordering::SeqCst);
        assert!(h.manager.wait_for_broker().await);
        assert_eq!(h.broker.reachable_after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(&[], "").await;
        let task = tokio::spawn(h.manager.clone().run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.manager.shutdown().request();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
