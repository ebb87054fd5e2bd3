use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;

use crate::channels::{ChannelBus, Message, MessageTag, Subscription};
use crate::dom::{self, Document, Fragment, RegionId, SharedDocument};
use crate::error::{BlockError, Result};
use crate::logging::{LogLevel, Logger, emit_log, json_kv};
use crate::modes::{
    DisplayController, MODE_INIT, MODE_INSERT, MODE_RESET, MODE_WAIT, ModeDescriptor, ModeTable,
    RegionMarks,
};
use crate::runtime::{Block, BlockContext, BlockKey, BlockSpec, EventFlow, HostEvent};

use super::{lock, log_target, subscribe_weak};

/// Names the content block answers to. The numbered aliases let several
/// independent feeds share one element.
pub const PASTE_NAMES: [&str; 5] = ["paste", "paste2", "paste3", "paste4", "paste5"];

/// Parameters of a content block. Each mode override must be complete.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PasteParams {
    pub channel: Option<String>,
    pub init: Option<ModeDescriptor>,
    pub wait: Option<ModeDescriptor>,
    pub insert: Option<ModeDescriptor>,
    pub reset: Option<ModeDescriptor>,
}

impl PasteParams {
    pub fn mode_table(&self) -> ModeTable {
        let overrides = [
            (MODE_INIT, self.init),
            (MODE_WAIT, self.wait),
            (MODE_INSERT, self.insert),
            (MODE_RESET, self.reset),
        ]
        .into_iter()
        .filter_map(|(name, descriptor)| descriptor.map(|d| (name.to_string(), d)))
        .collect();
        ModeTable::base().with_overrides(&overrides)
    }
}

/// Replace the first `slot_mark` region under `root` with `fragment` and drop
/// the other slots. Returns the regions the fragment introduced.
pub(crate) fn insert_fragment(
    doc: &mut Document,
    block: &str,
    root: &str,
    slot_mark: &str,
    fragment: &Fragment,
) -> Result<Vec<RegionId>> {
    let slots = doc.find_marked(root, slot_mark);
    let Some((first, rest)) = slots.split_first() else {
        return Err(BlockError::missing(block, slot_mark));
    };
    for extra in rest {
        // Nested slots may already be gone with an earlier one.
        if doc.contains(extra) && !doc.is_within(extra, first) {
            doc.remove(extra)?;
        }
    }
    doc.replace_with_fragment(first, fragment)
}

pub(crate) struct PasteCore {
    key: BlockKey,
    channel: Option<String>,
    document: SharedDocument,
    display: Mutex<DisplayController>,
    logger: Option<Logger>,
}

impl PasteCore {
    fn apply_mode(&self, mode: &str) -> Result<()> {
        let mut doc = dom::write(&self.document)?;
        lock(&self.display)?.apply(&mut doc, &self.key.root, mode)
    }

    fn insert(&self, bus: &ChannelBus, fragment: &Fragment) -> Result<()> {
        let created = {
            let mut doc = dom::write(&self.document)?;
            let mut display = lock(&self.display)?;
            let slot = display.marks().slot.clone();
            let created =
                insert_fragment(&mut doc, &self.key.name, &self.key.root, &slot, fragment)?;
            display.apply(&mut doc, &self.key.root, MODE_INSERT)?;
            created
        };
        emit_log(
            self.logger.as_ref(),
            LogLevel::Debug,
            &log_target(&self.key.name),
            "fragment_inserted",
            [
                json_kv("root", json!(self.key.root)),
                json_kv("regions", json!(created.len())),
            ],
        );
        if let Some(channel) = &self.channel {
            bus.emit(channel, &Message::InsertEnd).into_result()?;
        }
        Ok(())
    }

    /// Run one lifecycle message. Returns `false` for tags this block ignores.
    fn handle(&self, bus: &ChannelBus, message: &Message) -> Result<bool> {
        match message {
            Message::Wait => self.apply_mode(MODE_WAIT)?,
            Message::Init => self.apply_mode(MODE_INIT)?,
            Message::Reset => self.apply_mode(MODE_RESET)?,
            Message::Insert(fragment) => self.insert(bus, fragment)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn current_mode(&self) -> Option<String> {
        lock(&self.display)
            .ok()
            .and_then(|display| display.current().map(str::to_string))
    }
}

/// Content controller: shows a spinner, an affordance or the inserted content
/// depending on the lifecycle messages on its channel.
pub struct Paste {
    key: BlockKey,
    params: PasteParams,
    core: Option<Arc<PasteCore>>,
    subscriptions: Vec<Subscription>,
}

impl Paste {
    pub fn from_spec(spec: &BlockSpec) -> Result<Self> {
        Ok(Self::new(spec.key.clone(), spec.params()?))
    }

    pub fn new(key: BlockKey, params: PasteParams) -> Self {
        Self {
            key,
            params,
            core: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn current_mode(&self) -> Option<String> {
        self.core.as_ref().and_then(|core| core.current_mode())
    }
}

impl Block for Paste {
    fn key(&self) -> &BlockKey {
        &self.key
    }

    fn init(&mut self, ctx: &mut BlockContext<'_>) -> Result<()> {
        let marks = RegionMarks::standard(&self.key.name, "delete");
        let core = Arc::new(PasteCore {
            key: self.key.clone(),
            channel: self.params.channel.clone(),
            document: Arc::clone(ctx.document()),
            display: Mutex::new(DisplayController::new(marks, self.params.mode_table())),
            logger: ctx.logger(),
        });
        core.apply_mode(MODE_INIT)?;

        if let Some(channel) = &self.params.channel {
            for tag in [MessageTag::Wait, MessageTag::Init, MessageTag::Reset, MessageTag::Insert] {
                self.subscriptions
                    .push(subscribe_weak(ctx.bus(), channel, tag, &core, |core, bus, message| {
                        core.handle(bus, message).map(|_| ())
                    }));
            }
        }
        self.core = Some(core);
        Ok(())
    }

    /// Lifecycle messages signalled on the root element drive the block
    /// directly, with or without a channel.
    fn on_event(&mut self, ctx: &mut BlockContext<'_>, event: &HostEvent) -> Result<EventFlow> {
        let (Some(core), HostEvent::Signal { target, message }) = (&self.core, event) else {
            return Ok(EventFlow::Continue);
        };
        if target != &self.key.root || !core.handle(ctx.bus(), message)? {
            return Ok(EventFlow::Continue);
        }
        Ok(EventFlow::Consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::RegionSpec;
    use crate::geometry::Size;
    use crate::runtime::BlockHost;

    fn feed_document(block: &str) -> Document {
        let mut doc = Document::new(Size::new(800, 600));
        doc.append(None, RegionSpec::new("feed")).unwrap();
        doc.append(
            Some("feed"),
            RegionSpec::new("spinner").classes(&format!("{block}__trubber {block}__trubber_hide")),
        )
        .unwrap();
        doc.append(
            Some("feed"),
            RegionSpec::new("more").classes(&format!("{block}__other {block}__other_hide")),
        )
        .unwrap();
        doc.append(
            Some("feed"),
            RegionSpec::new("slot").classes(&format!("{block}__delete {block}__delete_hide")),
        )
        .unwrap();
        doc
    }

    fn visible(host: &BlockHost) -> [bool; 3] {
        let doc = dom::read(host.document()).unwrap();
        ["spinner", "more", "slot"].map(|id| doc.is_visible(id))
    }

    #[test]
    fn init_shows_the_affordance() {
        let mut host = BlockHost::new(feed_document("paste"));
        host.declare("feed", r#"{"paste": {"channel": "c"}}"#).unwrap();
        assert_eq!(visible(&host), [false, true, false]);
    }

    #[test]
    fn wait_then_insert_replaces_the_slot_and_reports_insertend() {
        let mut host = BlockHost::new(feed_document("paste"));
        host.declare("feed", r#"{"paste": {"channel": "c"}}"#).unwrap();
        let ends = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&ends);
        let _probe = host.bus().subscribe("c", MessageTag::InsertEnd, move |_, _| {
            *seen.lock().unwrap() += 1;
            Ok(())
        });

        host.emit("c", &Message::Wait).unwrap();
        assert_eq!(visible(&host), [true, false, false]);

        host.publish("c", "insert", Some("<div>X</div>")).unwrap();
        assert_eq!(visible(&host), [false, false, true]);
        assert_eq!(*ends.lock().unwrap(), 1);

        let doc = dom::read(host.document()).unwrap();
        assert_eq!(doc.content("slot"), Some("<div>X</div>"));
        assert!(doc.find_marked("feed", "paste__delete").is_empty());
    }

    #[test]
    fn only_the_first_slot_survives_an_insert() {
        for slots in 2..=5 {
            let mut doc = feed_document("paste");
            for n in 2..=slots {
                let extra = RegionSpec::new(format!("slot{n}")).classes("paste__delete");
                doc.append(Some("feed"), extra).unwrap();
            }
            let mut host = BlockHost::new(doc);
            host.declare("feed", r#"{"paste": {"channel": "c"}}"#).unwrap();
            host.publish("c", "insert", Some("<p>a</p>")).unwrap();

            let doc = dom::read(host.document()).unwrap();
            assert_eq!(doc.content("slot"), Some("<p>a</p>"), "{slots} slots");
            for n in 2..=slots {
                assert!(!doc.contains(&format!("slot{n}")), "{slots} slots");
            }
            assert!(doc.find_marked("feed", "paste__delete").is_empty());
        }
    }

    #[test]
    fn insert_without_slot_is_reported() {
        let mut doc = feed_document("paste");
        doc.remove("slot").unwrap();
        let mut host = BlockHost::new(doc);
        host.declare("feed", r#"{"paste": {"channel": "c"}}"#).unwrap();
        let err = host.publish("c", "insert", Some("<p>a</p>")).unwrap_err();
        assert!(matches!(err, BlockError::Delivery { .. }));
        assert!(err.to_string().contains("paste__delete"));
    }

    #[test]
    fn numbered_alias_uses_its_own_marks_and_overrides() {
        let mut host = BlockHost::new(feed_document("paste3"));
        host.declare(
            "feed",
            r#"{"paste3": {"channel": "c", "reset": {"trubber": true, "other": true, "delete": false}}}"#,
        )
        .unwrap();
        host.emit("c", &Message::Reset).unwrap();
        assert_eq!(visible(&host), [true, true, false]);
    }

    #[test]
    fn incomplete_override_is_rejected() {
        let mut host = BlockHost::new(feed_document("paste"));
        let err = host
            .declare("feed", r#"{"paste": {"wait": {"trubber": true}}}"#)
            .unwrap_err();
        assert!(matches!(err, BlockError::Declaration { .. }));
    }

    #[test]
    fn without_channel_nothing_is_subscribed() {
        let mut host = BlockHost::new(feed_document("paste"));
        host.declare("feed", r#"{"paste": {}}"#).unwrap();
        assert_eq!(host.bus().subscriber_count("c", MessageTag::Wait), 0);
        assert_eq!(visible(&host), [false, true, false]);
    }

    #[test]
    fn root_signals_drive_a_block_without_channel() {
        let mut host = BlockHost::new(feed_document("paste"));
        host.declare("feed", r#"{"paste": {}}"#).unwrap();
        let signal = |message| HostEvent::Signal {
            target: "feed".to_string(),
            message,
        };

        assert_eq!(host.dispatch(signal(Message::Wait)).unwrap(), EventFlow::Consumed);
        assert_eq!(visible(&host), [true, false, false]);

        let flow = host
            .dispatch(signal(Message::Insert(Fragment::new("<p>x</p>"))))
            .unwrap();
        assert_eq!(flow, EventFlow::Consumed);
        assert_eq!(visible(&host), [false, false, true]);
        assert_eq!(dom::read(host.document()).unwrap().content("slot"), Some("<p>x</p>"));

        let elsewhere = HostEvent::Signal {
            target: "slot".to_string(),
            message: Message::Reset,
        };
        assert_eq!(host.dispatch(elsewhere).unwrap(), EventFlow::Continue);
        assert_eq!(host.dispatch(signal(Message::Click)).unwrap(), EventFlow::Continue);
    }
}
