use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;

use crate::channels::{ChannelBus, Message, MessageTag, Subscription};
use crate::logging::{LogLevel, Logger, event_with_fields, json_kv};

const TAP_TARGET: &str = "blockbus::channels.tap";

/// Logs every message crossing the watched channels. Useful when wiring
/// blocks together by channel name and nothing seems to happen.
pub struct ChannelTap {
    logger: Logger,
    level: LogLevel,
    log_payloads: bool,
    observed: Arc<AtomicU64>,
    subscriptions: Vec<Subscription>,
}

impl ChannelTap {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger,
            level: LogLevel::Debug,
            log_payloads: false,
            observed: Arc::new(AtomicU64::new(0)),
            subscriptions: Vec::new(),
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Include insert markup in the log lines instead of only its length.
    pub fn log_payloads(mut self, enabled: bool) -> Self {
        self.log_payloads = enabled;
        self
    }

    /// Start watching every tag on `channel`.
    pub fn watch(mut self, bus: &Arc<ChannelBus>, channel: &str) -> Self {
        for tag in MessageTag::ALL {
            let logger = self.logger.clone();
            let level = self.level;
            let log_payloads = self.log_payloads;
            let observed = Arc::clone(&self.observed);
            let name = channel.to_string();
            self.subscriptions
                .push(bus.subscribe(channel, tag, move |_, message| {
                    observed.fetch_add(1, Ordering::Relaxed);
                    let mut fields = vec![
                        json_kv("channel", json!(name)),
                        json_kv("tag", json!(message.tag().as_str())),
                    ];
                    match message {
                        Message::Insert(fragment) if log_payloads => {
                            fields.push(json_kv("html", json!(fragment.as_str())));
                        }
                        Message::Insert(fragment) => {
                            fields.push(json_kv("html_bytes", json!(fragment.as_str().len())));
                        }
                        other => {
                            if let Some(name) = other.name() {
                                fields.push(json_kv("name", json!(name)));
                            }
                        }
                    }
                    let event = event_with_fields(level, TAP_TARGET, "channel.message", fields);
                    let _ = logger.log_event(event);
                    Ok(())
                }));
        }
        self
    }

    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    pub fn watched_channels(&self) -> Vec<&str> {
        let mut channels: Vec<&str> = self
            .subscriptions
            .iter()
            .map(Subscription::channel)
            .collect();
        channels.dedup();
        channels
    }
}
