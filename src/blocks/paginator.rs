use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;

use crate::channels::{ChannelBus, Message, MessageTag, Subscription};
use crate::dom::{self, SharedDocument};
use crate::error::Result;
use crate::logging::{LogLevel, Logger, emit_log, json_kv};
use crate::runtime::{Block, BlockContext, BlockKey, BlockSpec, EventFlow, HostEvent};

use super::{lock, log_target, subscribe_weak};

pub const BLOCK_NAME: &str = "paginator";

const OBJECT_MARK: &str = "paginator__object";
const INDICATOR_MARK: &str = "paginator__trubber";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoPaginate {
    /// Manual: a click on the affordance asks for the next page.
    #[default]
    #[serde(alias = "none", alias = "null")]
    Off,
    Top,
    Bottom,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaginatorParams {
    /// Channel of the feed this paginator drives.
    pub channel1: Option<String>,
    /// Channel of a sibling feed whose activity resets or re-inits the bound one.
    pub channel2: Option<String>,
    /// Outbound channel for `next(token)` requests.
    pub channelnext: Option<String>,
    pub autopaginator: Option<AutoPaginate>,
    /// Hidden input carrying the next page token.
    pub page_field: String,
}

impl Default for PaginatorParams {
    fn default() -> Self {
        Self {
            channel1: None,
            channel2: None,
            channelnext: None,
            autopaginator: None,
            page_field: "page".to_string(),
        }
    }
}

impl PaginatorParams {
    pub fn trigger(&self) -> AutoPaginate {
        self.autopaginator.unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct PaginatorState {
    awaiting: bool,
    ended: bool,
    triggers_enabled: bool,
}

struct PaginatorCore {
    key: BlockKey,
    params: PaginatorParams,
    document: SharedDocument,
    state: Mutex<PaginatorState>,
    logger: Option<Logger>,
}

impl PaginatorCore {
    fn token(&self) -> Result<Option<String>> {
        Ok(dom::read(&self.document)?.field_value(&self.key.root, &self.params.page_field))
    }

    fn log(
        &self,
        level: LogLevel,
        message: &str,
        fields: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) {
        emit_log(self.logger.as_ref(), level, &log_target(BLOCK_NAME), message, fields);
    }

    /// Bound feed finished inserting: keep paginating or tear down for good.
    fn on_bound_insert_end(&self, bus: &ChannelBus) -> Result<()> {
        {
            let mut state = lock(&self.state)?;
            state.awaiting = false;
            if state.ended {
                return Ok(());
            }
        }
        let Some(channel1) = &self.params.channel1 else {
            return Ok(());
        };
        if self.token()?.is_some() {
            bus.emit(channel1, &Message::Init).into_result()?;
            return Ok(());
        }

        {
            let mut doc = dom::write(&self.document)?;
            for mark in [OBJECT_MARK, INDICATOR_MARK] {
                for id in doc.find_marked(&self.key.root, mark) {
                    if doc.contains(&id) {
                        doc.remove(&id)?;
                    }
                }
            }
            let mut state = lock(&self.state)?;
            state.ended = true;
            state.triggers_enabled = false;
        }
        self.log(LogLevel::Info, "feed_ended", [json_kv("root", json!(self.key.root))]);
        bus.emit(channel1, &Message::Reset).into_result()?;
        Ok(())
    }

    fn clear_awaiting(&self) -> Result<()> {
        lock(&self.state)?.awaiting = false;
        Ok(())
    }

    fn forward(&self, bus: &ChannelBus, message: Message) -> Result<()> {
        if message == Message::Init && lock(&self.state)?.ended {
            return Ok(());
        }
        if let Some(channel1) = &self.params.channel1 {
            bus.emit(channel1, &message).into_result()?;
        }
        Ok(())
    }

    /// Ask for the next page with the token the page currently carries.
    fn request_next(&self, bus: &ChannelBus) -> Result<bool> {
        let Some(channelnext) = &self.params.channelnext else {
            return Ok(false);
        };
        {
            let state = lock(&self.state)?;
            if !state.triggers_enabled || state.ended {
                return Ok(false);
            }
            if state.awaiting {
                self.log(
                    LogLevel::Debug,
                    "trigger_ignored",
                    [json_kv("reason", json!("awaiting"))],
                );
                return Ok(false);
            }
        }
        let Some(token) = self.token()? else {
            return Ok(false);
        };
        lock(&self.state)?.awaiting = true;
        self.log(LogLevel::Debug, "next_requested", [json_kv("token", json!(token))]);
        bus.emit(channelnext, &Message::Next(token)).into_result()?;
        Ok(true)
    }
}

/// Drives a feed's "load more" cycle: decides from each inserted fragment
/// whether more pages exist and turns clicks or scrolling into `next` requests.
pub struct Paginator {
    key: BlockKey,
    params: PaginatorParams,
    core: Option<Arc<PaginatorCore>>,
    subscriptions: Vec<Subscription>,
}

impl Paginator {
    pub fn from_spec(spec: &BlockSpec) -> Result<Self> {
        Ok(Self::new(spec.key.clone(), spec.params()?))
    }

    pub fn new(key: BlockKey, params: PaginatorParams) -> Self {
        Self {
            key,
            params,
            core: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.core
            .as_ref()
            .and_then(|core| lock(&core.state).ok().map(|state| state.ended))
            .unwrap_or(false)
    }

    fn scroll_triggers(&self, scroll_top: u32, client_height: u32, scroll_height: u32) -> bool {
        match self.params.trigger() {
            AutoPaginate::Off => false,
            AutoPaginate::Top => scroll_top == 0,
            AutoPaginate::Bottom => scroll_top.saturating_add(client_height) >= scroll_height,
        }
    }
}

impl Block for Paginator {
    fn key(&self) -> &BlockKey {
        &self.key
    }

    fn init(&mut self, ctx: &mut BlockContext<'_>) -> Result<()> {
        let triggers_enabled = ctx.read()?.first_marked(&self.key.root, OBJECT_MARK).is_some();
        let core = Arc::new(PaginatorCore {
            key: self.key.clone(),
            params: self.params.clone(),
            document: Arc::clone(ctx.document()),
            state: Mutex::new(PaginatorState {
                triggers_enabled,
                ..PaginatorState::default()
            }),
            logger: ctx.logger(),
        });

        let bus = ctx.bus();
        if let Some(channel1) = &self.params.channel1 {
            self.subscriptions.push(subscribe_weak(
                bus,
                channel1,
                MessageTag::InsertEnd,
                &core,
                |core, bus, _| core.on_bound_insert_end(bus),
            ));
            for tag in [MessageTag::Init, MessageTag::Reset] {
                self.subscriptions.push(subscribe_weak(bus, channel1, tag, &core, |core, _, _| {
                    core.clear_awaiting()
                }));
            }
        }
        if let Some(channel2) = &self.params.channel2 {
            self.subscriptions.push(subscribe_weak(
                bus,
                channel2,
                MessageTag::Wait,
                &core,
                |core, bus, _| core.forward(bus, Message::Reset),
            ));
            self.subscriptions.push(subscribe_weak(
                bus,
                channel2,
                MessageTag::InsertEnd,
                &core,
                |core, bus, _| core.forward(bus, Message::Init),
            ));
        }
        self.core = Some(core);
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut BlockContext<'_>, event: &HostEvent) -> Result<EventFlow> {
        let Some(core) = self.core.clone() else {
            return Ok(EventFlow::Continue);
        };
        match event {
            HostEvent::Click { target } if self.params.trigger() == AutoPaginate::Off => {
                let on_object = {
                    let doc = ctx.read()?;
                    doc.find_marked(&self.key.root, OBJECT_MARK)
                        .iter()
                        .any(|object| doc.is_within(target, object))
                };
                if on_object {
                    core.request_next(ctx.bus())?;
                    return Ok(EventFlow::Consumed);
                }
            }
            HostEvent::Scroll {
                target,
                scroll_top,
                client_height,
                scroll_height,
            } if target == &self.key.root => {
                if self.scroll_triggers(*scroll_top, *client_height, *scroll_height) {
                    core.request_next(ctx.bus())?;
                }
            }
            _ => {}
        }
        Ok(EventFlow::Continue)
    }
}
