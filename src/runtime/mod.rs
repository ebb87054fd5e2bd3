use std::sync::{Arc, Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde_json::json;

use crate::blocks::standard_registry;
use crate::channels::{ChannelBus, EmitReport, Message};
use crate::dom::{self, Document, Fragment, RegionId, SharedDocument};
use crate::geometry::Size;
use crate::logging::{event_with_fields, json_kv};
use crate::metrics::{HostMetrics, MetricSnapshot};
use crate::{BlockError, LogLevel, Logger, Result};

pub mod arbitration;
pub mod declarations;
pub mod diagnostics;
pub mod shared_state;
pub mod transport;

pub use declarations::{BlockFactory, BlockKey, BlockRegistry, BlockSpec, parse_declaration};
use shared_state::{SharedState, SharedStateError};
use transport::{FetchClient, RequestId, Transport, TransportError};

const HOST_TARGET: &str = "blockbus::host";

/// Configuration knobs for the block host.
#[derive(Clone)]
pub struct HostConfig {
    /// Optional structured logger shared with the bus and every block.
    pub logger: Option<Logger>,
    /// Metrics accumulator updated as events are dispatched.
    pub metrics: Option<Arc<Mutex<HostMetrics>>>,
    /// Target field used when emitting metrics snapshots.
    pub metrics_target: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            logger: None,
            metrics: None,
            metrics_target: "blockbus::host.metrics".to_string(),
        }
    }
}

impl HostConfig {
    /// Enable metrics collection if it has not already been configured.
    pub fn enable_metrics(&mut self) {
        if self.metrics.is_none() {
            self.metrics = Some(Arc::new(Mutex::new(HostMetrics::new())));
        }
    }

    pub fn disable_metrics(&mut self) {
        self.metrics = None;
    }

    pub fn metrics_handle(&self) -> Option<Arc<Mutex<HostMetrics>>> {
        self.metrics.as_ref().map(Arc::clone)
    }
}

/// Page events delivered to blocks.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// The page finished loading.
    Ready,
    Click { target: RegionId },
    Change { target: RegionId },
    /// Editable content of `target` now reads `html`.
    Input { target: RegionId, html: String },
    /// `target` scrolled; measurements in host units.
    Scroll {
        target: RegionId,
        scroll_top: u32,
        client_height: u32,
        scroll_height: u32,
    },
    Resize(Size),
    /// Block-local message addressed to the blocks mounted on `target`.
    Signal { target: RegionId, message: Message },
    /// Answer to a request issued through the host's transport. Only the
    /// block that issued it sees this event.
    FetchCompleted {
        id: RequestId,
        result: std::result::Result<Fragment, TransportError>,
    },
}

impl HostEvent {
    fn describe(&self) -> &'static str {
        match self {
            HostEvent::Ready => "ready",
            HostEvent::Click { .. } => "click",
            HostEvent::Change { .. } => "change",
            HostEvent::Input { .. } => "input",
            HostEvent::Scroll { .. } => "scroll",
            HostEvent::Resize(_) => "resize",
            HostEvent::Signal { .. } => "signal",
            HostEvent::FetchCompleted { .. } => "fetch_completed",
        }
    }
}

/// Control the propagation of an event across blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlow {
    Continue,
    Consumed,
}

/// Handles a block needs while it initialises or reacts to an event.
pub struct BlockContext<'a> {
    document: &'a SharedDocument,
    bus: &'a Arc<ChannelBus>,
    shared: &'a SharedState,
    logger: Option<&'a Logger>,
    fetch: Option<&'a FetchClient>,
}

impl<'a> BlockContext<'a> {
    pub fn new(
        document: &'a SharedDocument,
        bus: &'a Arc<ChannelBus>,
        shared: &'a SharedState,
        logger: Option<&'a Logger>,
        fetch: Option<&'a FetchClient>,
    ) -> Self {
        Self {
            document,
            bus,
            shared,
            logger,
            fetch,
        }
    }

    pub fn document(&self) -> &SharedDocument {
        self.document
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, Document>> {
        dom::read(self.document)
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Document>> {
        dom::write(self.document)
    }

    pub fn bus(&self) -> &Arc<ChannelBus> {
        self.bus
    }

    /// Emit and surface handler failures as an error once delivery finished.
    pub fn emit(&self, channel: &str, message: &Message) -> Result<EmitReport> {
        self.bus.emit(channel, message).into_result()
    }

    pub fn shared(&self) -> &SharedState {
        self.shared
    }

    pub fn shared_init<T, F>(&self, make: F) -> std::result::Result<Arc<T>, SharedStateError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        self.shared.get_or_insert_with(make)
    }

    pub fn logger(&self) -> Option<Logger> {
        self.logger.cloned()
    }

    pub fn fetch_client(&self) -> Option<FetchClient> {
        self.fetch.cloned()
    }
}

/// Behaviour attached to one declared element.
pub trait Block: Send {
    fn key(&self) -> &BlockKey;

    fn name(&self) -> &str {
        &self.key().name
    }

    fn root(&self) -> &str {
        &self.key().root
    }

    /// Called exactly once, right after construction.
    fn init(&mut self, _ctx: &mut BlockContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_event(&mut self, _ctx: &mut BlockContext<'_>, _event: &HostEvent) -> Result<EventFlow> {
        Ok(EventFlow::Continue)
    }
}

/// Owns the document, the channel bus and every mounted block.
pub struct BlockHost {
    document: SharedDocument,
    bus: Arc<ChannelBus>,
    shared: SharedState,
    registry: BlockRegistry,
    blocks: Vec<Box<dyn Block>>,
    fetch: Option<FetchClient>,
    config: HostConfig,
    started: Instant,
}

impl BlockHost {
    pub fn new(document: Document) -> Self {
        Self::with_config(document, HostConfig::default())
    }

    pub fn with_config(document: Document, config: HostConfig) -> Self {
        let bus = match config.logger.clone() {
            Some(logger) => ChannelBus::new().with_logger(logger),
            None => ChannelBus::new(),
        };
        Self {
            document: dom::shared(document),
            bus: Arc::new(bus),
            shared: SharedState::new(),
            registry: standard_registry(),
            blocks: Vec::new(),
            fetch: None,
            config,
            started: Instant::now(),
        }
    }

    /// Route block requests through `transport`. Set before mounting blocks
    /// that fetch.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.fetch = Some(FetchClient::new(transport));
        self
    }

    pub fn with_registry(mut self, registry: BlockRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry_mut(&mut self) -> &mut BlockRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    pub fn bus(&self) -> &Arc<ChannelBus> {
        &self.bus
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn block_keys(&self) -> Vec<BlockKey> {
        self.blocks.iter().map(|block| block.key().clone()).collect()
    }

    pub fn is_mounted(&self, root: &str, name: &str) -> bool {
        self.blocks
            .iter()
            .any(|block| block.root() == root && block.name() == name)
    }

    /// Mount every block named in `declaration` on the element `root`.
    ///
    /// A block name already mounted on the element is rejected before any
    /// block of the declaration is built.
    pub fn declare(&mut self, root: &str, declaration: &str) -> Result<Vec<BlockKey>> {
        if !dom::read(&self.document)?.contains(root) {
            return Err(crate::BlockError::RegionNotFound(root.to_string()));
        }
        let specs = parse_declaration(root, declaration)?;
        if let Some(dup) = specs.iter().find(|spec| self.is_mounted(root, spec.name())) {
            return Err(crate::BlockError::declaration(
                dup.name(),
                format!("already mounted on `{root}`"),
            ));
        }
        let mut keys = Vec::with_capacity(specs.len());
        for spec in specs {
            keys.push(self.mount_spec(spec)?);
        }
        Ok(keys)
    }

    /// Mount the declarations carried by document regions. Pairs already
    /// mounted are skipped, so calling this again only picks up new elements.
    pub fn mount(&mut self) -> Result<Vec<BlockKey>> {
        let declarations = dom::read(&self.document)?.declarations();
        let mut keys = Vec::new();
        for (root, declaration) in declarations {
            for spec in parse_declaration(&root, &declaration)? {
                if self.is_mounted(spec.root(), spec.name()) {
                    continue;
                }
                keys.push(self.mount_spec(spec)?);
            }
        }
        Ok(keys)
    }

    fn mount_spec(&mut self, spec: BlockSpec) -> Result<BlockKey> {
        let mut block = self.registry.build(&spec)?;
        {
            let mut ctx = BlockContext::new(
                &self.document,
                &self.bus,
                &self.shared,
                self.config.logger.as_ref(),
                self.fetch.as_ref(),
            );
            block.init(&mut ctx)?;
        }
        self.blocks.push(block);
        self.with_metrics(|metrics| metrics.record_mounts(1));
        self.log_host_event(
            LogLevel::Debug,
            "block_mounted",
            [
                json_kv("block", json!(spec.name())),
                json_kv("root", json!(spec.root())),
            ],
        );
        Ok(spec.key)
    }

    /// Deliver `event` to the mounted blocks in mount order until one consumes it.
    ///
    /// A block returning an error does not stop delivery. Failures are logged
    /// as they happen and returned as [`BlockError::Dispatch`] once every
    /// block had its turn.
    pub fn dispatch(&mut self, event: HostEvent) -> Result<EventFlow> {
        if let HostEvent::Resize(size) = &event {
            dom::write(&self.document)?.set_viewport(*size);
        }

        let mut failures = Vec::new();
        let flow = match &event {
            HostEvent::FetchCompleted { id, .. } => self.deliver_completion(*id, &event)?,
            _ => {
                let mut flow = EventFlow::Continue;
                for idx in 0..self.blocks.len() {
                    let block = &mut self.blocks[idx];
                    let mut ctx = BlockContext::new(
                        &self.document,
                        &self.bus,
                        &self.shared,
                        self.config.logger.as_ref(),
                        self.fetch.as_ref(),
                    );
                    match block.on_event(&mut ctx, &event) {
                        Ok(EventFlow::Consumed) => {
                            flow = EventFlow::Consumed;
                            break;
                        }
                        Ok(EventFlow::Continue) => {}
                        Err(err) => failures.push((block.key().clone(), err)),
                    }
                }
                flow
            }
        };

        for (key, err) in &failures {
            self.log_host_event(
                LogLevel::Warn,
                "block_failed",
                [
                    json_kv("event", json!(event.describe())),
                    json_kv("block", json!(key.to_string())),
                    json_kv("error", json!(err.to_string())),
                ],
            );
        }

        self.with_metrics(HostMetrics::record_event);
        self.log_host_event(
            LogLevel::Debug,
            "event_dispatched",
            [
                json_kv("event", json!(event.describe())),
                json_kv("consumed", json!(flow == EventFlow::Consumed)),
            ],
        );
        let count = failures.len();
        match failures.into_iter().next() {
            None => Ok(flow),
            Some((_, first)) => Err(BlockError::Dispatch {
                event: event.describe().to_string(),
                failures: count,
                first: Box::new(first),
            }),
        }
    }

    fn deliver_completion(&mut self, id: RequestId, event: &HostEvent) -> Result<EventFlow> {
        let fetch = self.fetch.as_ref().ok_or(TransportError::NotConfigured)?;
        let origin = fetch
            .take_route(id)
            .ok_or(TransportError::UnknownRequest(id))?;
        self.with_metrics(HostMetrics::record_fetch_completed);

        let position = self.blocks.iter().position(|block| block.key() == &origin);
        let Some(idx) = position else {
            self.log_host_event(
                LogLevel::Warn,
                "fetch_orphaned",
                [
                    json_kv("request", json!(id.to_string())),
                    json_kv("block", json!(origin.to_string())),
                ],
            );
            return Ok(EventFlow::Continue);
        };
        let block = &mut self.blocks[idx];
        let mut ctx = BlockContext::new(
            &self.document,
            &self.bus,
            &self.shared,
            self.config.logger.as_ref(),
            self.fetch.as_ref(),
        );
        block.on_event(&mut ctx, event)
    }

    pub fn ready(&mut self) -> Result<EventFlow> {
        self.dispatch(HostEvent::Ready)
    }

    pub fn click(&mut self, target: &str) -> Result<EventFlow> {
        self.dispatch(HostEvent::Click {
            target: target.to_string(),
        })
    }

    pub fn resize(&mut self, size: Size) -> Result<EventFlow> {
        self.dispatch(HostEvent::Resize(size))
    }

    /// Hand a transport answer back to the block that asked for it.
    pub fn complete_fetch(
        &mut self,
        id: RequestId,
        result: std::result::Result<Fragment, TransportError>,
    ) -> Result<EventFlow> {
        self.dispatch(HostEvent::FetchCompleted { id, result })
    }

    /// Emit on the bus. Every subscriber runs; failures are reported afterwards.
    pub fn emit(&self, channel: &str, message: &Message) -> Result<EmitReport> {
        let report = self.bus.emit(channel, message);
        self.with_metrics(|metrics| metrics.observe_bus(self.bus.stats()));
        report.into_result()
    }

    /// Emit a message given in string form, e.g. `("insert", Some(html))`.
    pub fn publish(&self, channel: &str, tag: &str, payload: Option<&str>) -> Result<EmitReport> {
        let message = Message::from_parts(tag, payload)?;
        self.emit(channel, &message)
    }

    /// Remove an element; blocks mounted inside it are destroyed and their
    /// subscriptions die with them.
    pub fn remove_element(&mut self, id: &str) -> Result<Vec<RegionId>> {
        let removed = dom::write(&self.document)?.remove(id)?;
        let before = self.blocks.len();
        self.blocks
            .retain(|block| !removed.iter().any(|gone| gone == block.root()));
        self.log_host_event(
            LogLevel::Debug,
            "element_removed",
            [
                json_kv("root", json!(id)),
                json_kv("blocks_destroyed", json!(before - self.blocks.len())),
            ],
        );
        Ok(removed)
    }

    pub fn take_notices(&self) -> Result<Vec<String>> {
        Ok(dom::write(&self.document)?.take_notices())
    }

    pub fn run_scripted<I>(&mut self, events: I) -> Result<()>
    where
        I: IntoIterator<Item = HostEvent>,
    {
        self.log_host_event(
            LogLevel::Info,
            "script_started",
            [json_kv("blocks", json!(self.blocks.len()))],
        );
        for event in events {
            self.dispatch(event)?;
        }
        self.log_metrics();
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> Option<MetricSnapshot> {
        let metrics = self.config.metrics.as_ref()?;
        let mut guard = metrics.lock().ok()?;
        guard.observe_bus(self.bus.stats());
        Some(guard.snapshot(self.started.elapsed()))
    }

    /// Write a metrics snapshot through the configured logger.
    pub fn log_metrics(&self) {
        if let (Some(logger), Some(snapshot)) =
            (self.config.logger.as_ref(), self.metrics_snapshot())
        {
            let _ = logger.log_event(snapshot.to_log_event(&self.config.metrics_target));
        }
    }

    fn with_metrics(&self, update: impl FnOnce(&mut HostMetrics)) {
        if let Some(metrics) = self.config.metrics.as_ref() {
            if let Ok(mut guard) = metrics.lock() {
                update(&mut guard);
            }
        }
    }

    fn log_host_event<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        if let Some(logger) = self.config.logger.as_ref() {
            let event = event_with_fields(level, HOST_TARGET, message, fields);
            let _ = logger.log_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MessageTag;
    use crate::dom::RegionSpec;
    use crate::logging::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        key: BlockKey,
        inits: Arc<AtomicUsize>,
        events: Arc<AtomicUsize>,
        consume: bool,
    }

    impl Block for Counter {
        fn key(&self) -> &BlockKey {
            &self.key
        }

        fn init(&mut self, _ctx: &mut BlockContext<'_>) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_event(
            &mut self,
            _ctx: &mut BlockContext<'_>,
            _event: &HostEvent,
        ) -> Result<EventFlow> {
            self.events.fetch_add(1, Ordering::SeqCst);
            Ok(if self.consume {
                EventFlow::Consumed
            } else {
                EventFlow::Continue
            })
        }
    }

    fn host_with_counter(consume: bool) -> (BlockHost, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let mut doc = Document::new(Size::new(800, 600));
        doc.append(None, RegionSpec::new("a").declare(r#"{"counter": {}}"#))
            .unwrap();
        doc.append(None, RegionSpec::new("b")).unwrap();
        let inits = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(AtomicUsize::new(0));
        let (i, e) = (Arc::clone(&inits), Arc::clone(&events));
        let registry = BlockRegistry::new().with_factory("counter", move |spec| {
            Ok(Box::new(Counter {
                key: spec.key.clone(),
                inits: Arc::clone(&i),
                events: Arc::clone(&e),
                consume,
            }) as Box<dyn Block>)
        });
        (BlockHost::new(doc).with_registry(registry), inits, events)
    }

    #[test]
    fn mount_initialises_each_declaration_once() {
        let (mut host, inits, _) = host_with_counter(false);
        assert_eq!(host.mount().unwrap(), vec![BlockKey::new("a", "counter")]);
        assert!(host.mount().unwrap().is_empty());
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_declaration_is_rejected() {
        let (mut host, inits, _) = host_with_counter(false);
        host.declare("b", r#"{"counter": {}}"#).unwrap();
        let err = host.declare("b", r#"{"counter": {}}"#).unwrap_err();
        assert!(matches!(err, crate::BlockError::Declaration { .. }));
        assert!(matches!(
            host.declare("missing", r#"{"counter": {}}"#),
            Err(crate::BlockError::RegionNotFound(_))
        ));
        assert!(matches!(
            host.declare("b", r#"{"carousel": {}}"#),
            Err(crate::BlockError::UnknownBlock(_))
        ));
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn consumed_events_stop_propagation() {
        let (mut host, _, events) = host_with_counter(true);
        host.declare("a", r#"{"counter": {}}"#).unwrap();
        host.declare("b", r#"{"counter": {}}"#).unwrap();
        assert_eq!(host.click("a").unwrap(), EventFlow::Consumed);
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    struct Broken {
        key: BlockKey,
    }

    impl Block for Broken {
        fn key(&self) -> &BlockKey {
            &self.key
        }

        fn on_event(
            &mut self,
            _ctx: &mut BlockContext<'_>,
            _event: &HostEvent,
        ) -> Result<EventFlow> {
            Err(TransportError::NotConfigured.into())
        }
    }

    #[test]
    fn failing_block_does_not_starve_later_blocks() {
        let sink = MemorySink::new();
        let (host, _, events) = host_with_counter(false);
        let registry = host.registry.clone().with_factory("broken", |spec| {
            Ok(Box::new(Broken {
                key: spec.key.clone(),
            }) as Box<dyn Block>)
        });
        let mut host = host.with_registry(registry);
        host.config.logger = Some(Logger::new(sink.clone()));
        host.declare("b", r#"{"broken": {}}"#).unwrap();
        host.declare("a", r#"{"counter": {}}"#).unwrap();

        let err = host.click("b").unwrap_err();
        assert!(matches!(
            err,
            BlockError::Dispatch { failures: 1, ref first, .. }
                if matches!(**first, BlockError::Transport(TransportError::NotConfigured))
        ));
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert!(sink.contains("block_failed"));
    }

    #[test]
    fn removing_an_element_destroys_its_blocks() {
        let (mut host, _, events) = host_with_counter(false);
        host.mount().unwrap();
        host.remove_element("a").unwrap();
        assert!(host.block_keys().is_empty());
        host.ready().unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resize_updates_the_viewport() {
        let (mut host, _, _) = host_with_counter(false);
        host.resize(Size::new(320, 480)).unwrap();
        assert_eq!(dom::read(host.document()).unwrap().viewport(), Size::new(320, 480));
    }

    #[test]
    fn emit_surfaces_handler_failures_and_metrics() {
        let sink = MemorySink::new();
        let mut config = HostConfig {
            logger: Some(Logger::new(sink.clone())),
            ..HostConfig::default()
        };
        config.enable_metrics();
        let host = BlockHost::with_config(Document::new(Size::new(1, 1)), config);
        let _sub = host.bus().subscribe("feed", MessageTag::Init, |_, _| {
            Err(crate::BlockError::UnknownMode("x".into()))
        });

        assert!(host.emit("feed", &Message::Init).is_err());
        assert!(host.publish("feed", "bogus", None).is_err());
        let snapshot = host.metrics_snapshot().unwrap();
        assert_eq!(snapshot.handler_failures, 1);
        host.log_metrics();
        assert!(sink.contains("host_metrics"));
    }

    #[test]
    fn unknown_completion_is_an_error() {
        let (host, _, _) = host_with_counter(false);
        let queue = Arc::new(transport::QueuedTransport::new());
        let mut host = host.with_transport(queue);
        let err = host
            .complete_fetch(RequestId(99), Ok(Fragment::new("<p></p>")))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::BlockError::Transport(TransportError::UnknownRequest(_))
        ));
    }
}
