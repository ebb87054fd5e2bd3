use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::json;

use crate::error::{BlockError, Result};
use crate::logging::{LogLevel, Logger, emit_log, json_kv, json_str};

use super::message::{ChannelError, Message, MessageTag};

/// Nested emissions deeper than this are refused and reported as failures.
pub const MAX_EMIT_DEPTH: usize = 64;

const LOG_TARGET: &str = "blockbus::channels";

/// Callback registered for one `(channel, tag)` pair. It receives the bus so it
/// can emit follow-up messages while it runs.
pub type Handler = Arc<dyn Fn(&ChannelBus, &Message) -> Result<()> + Send + Sync>;

struct Subscriber {
    id: u64,
    alive: Arc<AtomicBool>,
    handler: Handler,
}

#[derive(Default)]
struct Channel {
    subscribers: HashMap<MessageTag, Vec<Subscriber>>,
}

/// Counters accumulated over the lifetime of a bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub emissions: u64,
    pub deliveries: u64,
    pub failures: u64,
}

/// One handler that returned an error or panicked during an emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub subscriber: u64,
    pub error: String,
}

/// Outcome of a single `emit` call.
#[derive(Debug, Clone)]
pub struct EmitReport {
    pub channel: String,
    pub tag: MessageTag,
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl EmitReport {
    fn new(channel: &str, tag: MessageTag) -> Self {
        Self {
            channel: channel.to_string(),
            tag,
            delivered: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn recorded failures into an error. Delivery has already finished.
    pub fn into_result(self) -> Result<EmitReport> {
        match self.failures.first() {
            None => Ok(self),
            Some(first) => Err(BlockError::Delivery {
                channel: self.channel.clone(),
                tag: self.tag,
                failures: self.failures.len(),
                first: first.error.clone(),
            }),
        }
    }
}

/// Registry of named broadcast channels with synchronous, re-entrant delivery.
///
/// Subscribers are stored per channel and per [`MessageTag`] in registration
/// order. `emit` snapshots the subscriber list and releases the registry lock
/// before running any handler, so handlers may subscribe, unsubscribe or emit
/// on any channel while they run. A nested emission is fully delivered before
/// the outer emission moves on to its next subscriber.
pub struct ChannelBus {
    channels: Mutex<HashMap<String, Channel>>,
    next_id: AtomicU64,
    depth: AtomicUsize,
    emissions: AtomicU64,
    deliveries: AtomicU64,
    failures: AtomicU64,
    logger: Option<Logger>,
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            depth: AtomicUsize::new(0),
            emissions: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Register `handler` for `tag` messages on `channel`.
    ///
    /// The returned handle owns the registration: dropping it unsubscribes.
    pub fn subscribe<F>(
        self: &Arc<Self>,
        channel: &str,
        tag: MessageTag,
        handler: F,
    ) -> Subscription
    where
        F: Fn(&ChannelBus, &Message) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        {
            let mut channels = self.lock_channels();
            channels
                .entry(channel.to_string())
                .or_default()
                .subscribers
                .entry(tag)
                .or_default()
                .push(Subscriber {
                    id,
                    alive: Arc::clone(&alive),
                    handler: Arc::new(handler),
                });
        }
        emit_log(
            self.logger.as_ref(),
            LogLevel::Trace,
            LOG_TARGET,
            "subscribed",
            [
                json_str("channel", channel),
                json_str("tag", tag.as_str()),
                json_kv("subscriber", id),
            ],
        );
        Subscription {
            channel: channel.to_string(),
            tag,
            id,
            alive,
            bus: Arc::downgrade(self),
        }
    }

    /// Deliver `message` to every live subscriber of `(channel, message.tag())`.
    pub fn emit(&self, channel: &str, message: &Message) -> EmitReport {
        let tag = message.tag();
        let mut report = EmitReport::new(channel, tag);
        self.emissions.fetch_add(1, Ordering::Relaxed);

        let Some(_depth) = DepthGuard::enter(&self.depth) else {
            self.record_failure(
                &mut report,
                0,
                ChannelError::DepthExceeded(MAX_EMIT_DEPTH).to_string(),
            );
            return report;
        };

        let snapshot: Vec<(u64, Arc<AtomicBool>, Handler)> = {
            let mut channels = self.lock_channels();
            channels
                .entry(channel.to_string())
                .or_default()
                .subscribers
                .get(&tag)
                .map(|subs| {
                    subs.iter()
                        .map(|sub| (sub.id, Arc::clone(&sub.alive), Arc::clone(&sub.handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (id, alive, handler) in snapshot {
            if !alive.load(Ordering::Acquire) {
                continue;
            }
            report.delivered += 1;
            self.deliveries.fetch_add(1, Ordering::Relaxed);

            let error = match catch_unwind(AssertUnwindSafe(|| handler(self, message))) {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some(ChannelError::HandlerPanicked.to_string()),
            };
            if let Some(error) = error {
                self.record_failure(&mut report, id, error);
            }
        }

        emit_log(
            self.logger.as_ref(),
            LogLevel::Trace,
            LOG_TARGET,
            "emitted",
            [
                json_str("channel", channel),
                json_str("tag", tag.as_str()),
                json_kv("delivered", json!(report.delivered)),
            ],
        );
        report
    }

    /// True once the channel has been referenced by a subscribe or emit.
    pub fn has_channel(&self, channel: &str) -> bool {
        self.lock_channels().contains_key(channel)
    }

    pub fn subscriber_count(&self, channel: &str, tag: MessageTag) -> usize {
        self.lock_channels()
            .get(channel)
            .and_then(|entry| entry.subscribers.get(&tag))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            emissions: self.emissions.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn record_failure(&self, report: &mut EmitReport, subscriber: u64, error: String) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        emit_log(
            self.logger.as_ref(),
            LogLevel::Error,
            LOG_TARGET,
            "handler_failed",
            [
                json_str("channel", report.channel.as_str()),
                json_str("tag", report.tag.as_str()),
                json_kv("subscriber", subscriber),
                json_str("error", error.as_str()),
            ],
        );
        report.failures.push(HandlerFailure { subscriber, error });
    }

    fn remove(&self, channel: &str, tag: MessageTag, id: u64) {
        let mut channels = self.lock_channels();
        if let Some(subs) = channels
            .get_mut(channel)
            .and_then(|entry| entry.subscribers.get_mut(&tag))
        {
            subs.retain(|sub| sub.id != id);
        }
    }

    fn lock_channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        // The registry lock is never held while user code runs.
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct DepthGuard<'a> {
    depth: &'a AtomicUsize,
}

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a AtomicUsize) -> Option<Self> {
        if depth.fetch_add(1, Ordering::AcqRel) >= MAX_EMIT_DEPTH {
            depth.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self { depth })
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Live registration on a [`ChannelBus`]. Dropping it unsubscribes, and no
/// further message reaches the handler, even from an emission in progress.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    channel: String,
    tag: MessageTag,
    id: u64,
    alive: Arc<AtomicBool>,
    bus: Weak<ChannelBus>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn tag(&self) -> MessageTag {
        self.tag
    }

    pub fn is_active(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.channel, self.tag, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("tag", &self.tag)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Fragment;
    use crate::logging::MemorySink;

    type BoxedHandler = Box<dyn Fn(&ChannelBus, &Message) -> Result<()> + Send + Sync>;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> BoxedHandler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&log);
        let make = move |label: &str| {
            let log = Arc::clone(&shared);
            let label = label.to_string();
            Box::new(move |_: &ChannelBus, msg: &Message| {
                log.lock().unwrap().push(format!("{label}:{}", msg.tag()));
                Ok(())
            }) as BoxedHandler
        };
        (log, make)
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = Arc::new(ChannelBus::new());
        let (log, make) = recorder();
        let _a = bus.subscribe("feed", MessageTag::Wait, make("a"));
        let _b = bus.subscribe("feed", MessageTag::Wait, make("b"));
        let _other_tag = bus.subscribe("feed", MessageTag::Init, make("c"));

        let report = bus.emit("feed", &Message::Wait);
        assert_eq!(report.delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:wait", "b:wait"]);
    }

    #[test]
    fn emitting_without_subscribers_is_a_noop() {
        let bus = ChannelBus::new();
        let report = bus.emit("nobody", &Message::Reset);
        assert_eq!(report.delivered, 0);
        assert!(report.is_clean());
        assert!(bus.has_channel("nobody"));
    }

    #[test]
    fn nested_emission_completes_before_outer_continues() {
        let bus = Arc::new(ChannelBus::new());
        let (log, make) = recorder();
        let inner_log = Arc::clone(&log);
        let _first = bus.subscribe("feed", MessageTag::Insert, move |bus, _| {
            inner_log.lock().unwrap().push("first:insert".into());
            bus.emit("feed", &Message::InsertEnd).into_result()?;
            Ok(())
        });
        let _second = bus.subscribe("feed", MessageTag::Insert, make("second"));
        let _end = bus.subscribe("feed", MessageTag::InsertEnd, make("end"));

        bus.emit("feed", &Message::Insert(Fragment::new("<p>x</p>")));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:insert", "end:insertend", "second:insert"]
        );
    }

    #[test]
    fn unsubscribe_during_emission_stops_delivery() {
        let bus = Arc::new(ChannelBus::new());
        let (log, make) = recorder();
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&victim);
        let _killer = bus.subscribe("feed", MessageTag::Reset, move |_, _| {
            slot.lock().unwrap().take();
            Ok(())
        });
        *victim.lock().unwrap() = Some(bus.subscribe("feed", MessageTag::Reset, make("victim")));

        let report = bus.emit("feed", &Message::Reset);
        assert_eq!(report.delivered, 1);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.subscriber_count("feed", MessageTag::Reset), 1);
    }

    #[test]
    fn dropped_subscription_leaves_channel_in_place() {
        let bus = Arc::new(ChannelBus::new());
        let (_log, make) = recorder();
        let sub = bus.subscribe("feed", MessageTag::Init, make("a"));
        assert!(sub.is_active());
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count("feed", MessageTag::Init), 0);
        assert!(bus.has_channel("feed"));
    }

    #[test]
    fn failing_handlers_do_not_block_others() {
        let sink = MemorySink::new();
        let bus = Arc::new(ChannelBus::new().with_logger(Logger::new(sink.clone())));
        let (log, make) = recorder();
        let _bad = bus.subscribe("feed", MessageTag::Init, |_, _| {
            Err(BlockError::UnknownMode("ghost".into()))
        });
        let _panics = bus.subscribe("feed", MessageTag::Init, |_, _| -> Result<()> {
            panic!("handler blew up")
        });
        let _good = bus.subscribe("feed", MessageTag::Init, make("good"));

        let report = bus.emit("feed", &Message::Init);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["good:init"]);
        assert!(sink.contains("handler_failed"));
        assert_eq!(bus.stats().failures, 2);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, BlockError::Delivery { failures: 2, .. }));
    }

    #[test]
    fn runaway_recursion_is_cut_off() {
        let bus = Arc::new(ChannelBus::new());
        let _echo = bus.subscribe("loop", MessageTag::Click, |bus, msg| {
            bus.emit("loop", msg).into_result()?;
            Ok(())
        });
        let report = bus.emit("loop", &Message::Click);
        assert_eq!(report.failures.len(), 1);
    }
}
