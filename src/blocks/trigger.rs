use serde::Deserialize;
use serde_json::json;

use crate::channels::Message;
use crate::error::Result;
use crate::logging::{LogLevel, emit_log, json_kv};
use crate::runtime::{Block, BlockContext, BlockKey, BlockSpec, EventFlow, HostEvent};

use super::log_target;

pub const BLOCK_NAME: &str = "ext-paste";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEvent {
    Click,
    Change,
}

impl TriggerEvent {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "click" => Some(TriggerEvent::Click),
            "change" => Some(TriggerEvent::Change),
            _ => None,
        }
    }

    fn message(self) -> Message {
        match self {
            TriggerEvent::Click => Message::Click,
            TriggerEvent::Change => Message::Change,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TriggerParams {
    /// Channel that receives `click`/`change`.
    pub name: Option<String>,
    /// Extra events on top of the root's `event` modifier.
    pub events: Vec<TriggerEvent>,
}

/// Forwards clicks and changes inside its element to a named channel, so a
/// control can drive a block mounted elsewhere on the page.
pub struct Trigger {
    key: BlockKey,
    params: TriggerParams,
    events: Vec<TriggerEvent>,
}

impl Trigger {
    pub fn from_spec(spec: &BlockSpec) -> Result<Self> {
        Ok(Self::new(spec.key.clone(), spec.params()?))
    }

    pub fn new(key: BlockKey, params: TriggerParams) -> Self {
        Self {
            key,
            params,
            events: Vec::new(),
        }
    }

    pub fn listens_to(&self, event: TriggerEvent) -> bool {
        self.events.contains(&event)
    }
}

impl Block for Trigger {
    fn key(&self) -> &BlockKey {
        &self.key
    }

    fn init(&mut self, ctx: &mut BlockContext<'_>) -> Result<()> {
        let from_root = ctx
            .read()?
            .modifier(&self.key.root, "event")
            .and_then(TriggerEvent::parse);
        self.events = from_root.into_iter().chain(self.params.events.iter().copied()).collect();
        self.events.dedup();
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut BlockContext<'_>, event: &HostEvent) -> Result<EventFlow> {
        let (kind, target) = match event {
            HostEvent::Click { target } => (TriggerEvent::Click, target),
            HostEvent::Change { target } => (TriggerEvent::Change, target),
            _ => return Ok(EventFlow::Continue),
        };
        let Some(name) = &self.params.name else {
            return Ok(EventFlow::Continue);
        };
        if !self.listens_to(kind) || !ctx.read()?.is_within(target, &self.key.root) {
            return Ok(EventFlow::Continue);
        }
        emit_log(
            ctx.logger().as_ref(),
            LogLevel::Debug,
            &log_target(BLOCK_NAME),
            "trigger_forwarded",
            [
                json_kv("channel", json!(name)),
                json_kv("root", json!(self.key.root)),
            ],
        );
        ctx.emit(name, &kind.message())?;
        Ok(EventFlow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::channels::{MessageTag, Subscription};
    use crate::dom::{self, Document, RegionSpec};
    use crate::geometry::Size;
    use crate::runtime::BlockHost;

    fn host(root: RegionSpec, declaration: &str) -> BlockHost {
        let mut doc = Document::new(Size::new(800, 600));
        doc.append(None, root).unwrap();
        doc.append(Some("btn"), RegionSpec::new("icon")).unwrap();
        doc.append(None, RegionSpec::new("elsewhere")).unwrap();
        let mut host = BlockHost::new(doc);
        host.declare("btn", declaration).unwrap();
        host
    }

    fn record(host: &BlockHost, tag: MessageTag) -> (Arc<Mutex<usize>>, Subscription) {
        let count = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&count);
        let sub = host.bus().subscribe("news", tag, move |_, _| {
            *seen.lock().unwrap() += 1;
            Ok(())
        });
        (count, sub)
    }

    #[test]
    fn click_inside_is_forwarded_to_the_named_channel() {
        let mut host = host(
            RegionSpec::new("btn").modifier("event", "click"),
            r#"{"ext-paste": {"name": "news"}}"#,
        );
        let (clicks, _sub) = record(&host, MessageTag::Click);
        host.click("icon").unwrap();
        host.click("elsewhere").unwrap();
        host.dispatch(HostEvent::Change { target: "icon".into() }).unwrap();
        assert_eq!(*clicks.lock().unwrap(), 1);
        assert!(dom::read(host.document()).unwrap().contains("icon"));
    }

    #[test]
    fn events_param_adds_change() {
        let mut host = host(
            RegionSpec::new("btn").modifier("event", "click"),
            r#"{"ext-paste": {"name": "news", "events": ["change"]}}"#,
        );
        let (changes, _sub) = record(&host, MessageTag::Change);
        host.dispatch(HostEvent::Change { target: "btn".into() }).unwrap();
        assert_eq!(*changes.lock().unwrap(), 1);
    }

    #[test]
    fn without_event_modifier_nothing_is_sent() {
        let mut host = host(RegionSpec::new("btn"), r#"{"ext-paste": {"name": "news"}}"#);
        let (clicks, _sub) = record(&host, MessageTag::Click);
        host.click("btn").unwrap();
        assert_eq!(*clicks.lock().unwrap(), 0);
    }
}
