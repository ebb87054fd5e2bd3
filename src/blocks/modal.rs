use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;

use crate::channels::{ChannelBus, Message, MessageTag, Subscription};
use crate::dom::{self, Document, SharedDocument};
use crate::error::Result;
use crate::logging::{LogLevel, Logger, emit_log, json_kv};
use crate::runtime::arbitration::{SharedArbitrator, ensure_arbitrator};
use crate::runtime::{Block, BlockContext, BlockKey, BlockSpec, EventFlow, HostEvent};

use super::{lock, log_target, subscribe_weak};

pub const BLOCK_NAME: &str = "modal-window";

/// Channel every modal window listens on.
pub const MODAL_CHANNEL: &str = "modal-window";

const WRAP_MARK: &str = "modal-window__wrap";
const CONTENT_MARK: &str = "modal-window__content";
const CLOSE_MARK: &str = "modal-window__close";

/// Vertical placement of an open window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Centered when it fits the viewport, top-aligned otherwise.
    #[default]
    Auto,
    Top,
    Center,
    #[serde(alias = "end")]
    Bottom,
    /// Top-aligned with the content stretched to the viewport.
    Fit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    On,
    #[default]
    Off,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModalParams {
    /// Name used by `openmodal`/`closemodal` to address this window.
    pub name: String,
    pub direction: Direction,
    /// `on` lets this window stay open alongside others.
    pub multiple: Switch,
}

/// Decides whether a click closes the window.
///
/// Each click runs [`ClickGate::capture`] and then [`ClickGate::decide`]. A
/// press that started inside the content keeps the window open once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClickGate {
    #[default]
    Unset,
    InsideSeen,
    OutsideOnly,
}

impl ClickGate {
    pub fn capture(&mut self, inside_content: bool) {
        if inside_content {
            *self = ClickGate::InsideSeen;
        }
    }

    /// Returns `true` when the window should close.
    pub fn decide(&mut self) -> bool {
        match self {
            ClickGate::InsideSeen => {
                *self = ClickGate::OutsideOnly;
                false
            }
            ClickGate::Unset | ClickGate::OutsideOnly => true,
        }
    }

    pub fn reset(&mut self) {
        *self = ClickGate::Unset;
    }
}

#[derive(Debug, Default)]
struct WindowState {
    open: bool,
    gate: ClickGate,
    /// Height the wrap adds around the content, measured on the first fit.
    chrome: Option<u16>,
}

struct ModalCore {
    key: BlockKey,
    params: ModalParams,
    document: SharedDocument,
    arbitrator: Option<SharedArbitrator>,
    state: Mutex<WindowState>,
    logger: Option<Logger>,
}

impl ModalCore {
    fn name(&self) -> &str {
        &self.params.name
    }

    fn log(&self, message: &str) {
        emit_log(
            self.logger.as_ref(),
            LogLevel::Debug,
            &log_target(BLOCK_NAME),
            message,
            [
                json_kv("name", json!(self.name())),
                json_kv("root", json!(self.key.root)),
            ],
        );
    }

    fn is_open(&self) -> Result<bool> {
        Ok(lock(&self.state)?.open)
    }

    /// Whether resize and arbitration treat this window as the active one.
    fn is_active(&self) -> Result<bool> {
        let open = self.is_open()?;
        Ok(match &self.arbitrator {
            Some(arbitrator) => open && arbitrator.is_active(self.name()),
            None => open,
        })
    }

    fn open(&self, bus: &ChannelBus) -> Result<()> {
        match &self.arbitrator {
            Some(arbitrator) => match arbitrator.active() {
                Some(active) if active == self.name() => {
                    self.close(bus)?;
                }
                Some(other) => {
                    bus.emit(MODAL_CHANNEL, &Message::CloseModal(Some(other)))
                        .into_result()?;
                }
                None => {}
            },
            None => {
                if self.is_open()? {
                    self.close(bus)?;
                }
            }
        }
        self.show()
    }

    fn show(&self) -> Result<()> {
        {
            let mut doc = dom::write(&self.document)?;
            doc.set_hidden(&self.key.root, false)?;
            doc.lock_scroll(&self.key.to_string());
            self.place(&mut doc)?;
            let mut state = lock(&self.state)?;
            state.open = true;
            state.gate.reset();
        }
        if let Some(arbitrator) = &self.arbitrator {
            arbitrator.open(self.name());
        }
        self.log("modal_opened");
        Ok(())
    }

    fn place(&self, doc: &mut Document) -> Result<()> {
        let viewport = doc.viewport().height;
        let content = doc.first_marked(&self.key.root, CONTENT_MARK);
        let content_height = content
            .as_deref()
            .and_then(|id| doc.rect_of(id))
            .map(|rect| rect.height);
        let fits = content_height.is_some_and(|height| height < viewport);

        let display = match self.params.direction {
            Direction::Top | Direction::Fit => "top",
            Direction::Auto | Direction::Center if fits => "center",
            Direction::Bottom if fits => "bottom",
            Direction::Auto | Direction::Center | Direction::Bottom => "top",
        };
        doc.set_modifier(&self.key.root, "display", Some(display))?;

        if self.params.direction == Direction::Fit {
            if let (Some(content), Some(chrome)) = (content, self.chrome(doc, content_height)?) {
                doc.set_height(&content, viewport.saturating_sub(chrome))?;
            }
            doc.set_modifier(&self.key.root, "display", Some("fit"))?;
        }
        Ok(())
    }

    /// Wrap height minus content height from the top-aligned render. Later
    /// opens reuse it since resizing the content leaves the wrap rect stale.
    fn chrome(&self, doc: &Document, content_height: Option<u16>) -> Result<Option<u16>> {
        let mut state = lock(&self.state)?;
        if state.chrome.is_none() {
            let wrap_height = doc
                .first_marked(&self.key.root, WRAP_MARK)
                .and_then(|id| doc.rect_of(&id))
                .map(|rect| rect.height);
            if let (Some(wrap), Some(content)) = (wrap_height, content_height) {
                state.chrome = Some(wrap.saturating_sub(content));
            }
        }
        Ok(state.chrome)
    }

    fn close(&self, bus: &ChannelBus) -> Result<bool> {
        {
            let mut doc = dom::write(&self.document)?;
            if doc.is_visible(&self.key.root) {
                doc.set_hidden(&self.key.root, true)?;
                doc.unlock_scroll(&self.key.to_string());
            }
            lock(&self.state)?.open = false;
        }
        if let Some(arbitrator) = &self.arbitrator {
            arbitrator.close(self.name());
        }
        self.log("modal_closed");
        bus.emit(MODAL_CHANNEL, &Message::CloseModal(None)).into_result()?;
        Ok(true)
    }

    /// Run an `openmodal`/`closemodal` message addressed to this window.
    /// Block-local signals may omit the name.
    fn handle(&self, bus: &ChannelBus, message: &Message, local: bool) -> Result<()> {
        let addressed = match message.name() {
            Some(name) => name == self.name(),
            None => local,
        };
        if !addressed {
            return Ok(());
        }
        match message {
            Message::OpenModal(_) => self.open(bus),
            Message::CloseModal(_) => self.close(bus).map(|_| ()),
            _ => Ok(()),
        }
    }

    fn on_click(&self, bus: &ChannelBus, target: &str) -> Result<EventFlow> {
        let (on_close, inside_content) = {
            let doc = dom::read(&self.document)?;
            if !doc.is_within(target, &self.key.root) {
                return Ok(EventFlow::Continue);
            }
            let within = |mark: &str| {
                doc.find_marked(&self.key.root, mark)
                    .iter()
                    .any(|region| doc.is_within(target, region))
            };
            (within(CLOSE_MARK), within(CONTENT_MARK))
        };
        if on_close {
            self.close(bus)?;
            return Ok(EventFlow::Consumed);
        }
        let should_close = {
            let mut state = lock(&self.state)?;
            state.gate.capture(inside_content);
            state.gate.decide()
        };
        if should_close {
            self.close(bus)?;
            return Ok(EventFlow::Consumed);
        }
        Ok(EventFlow::Continue)
    }
}

/// Overlay window. At most one is open at a time unless `multiple` is on.
pub struct ModalWindow {
    key: BlockKey,
    params: ModalParams,
    core: Option<Arc<ModalCore>>,
    subscriptions: Vec<Subscription>,
}

impl ModalWindow {
    pub fn from_spec(spec: &BlockSpec) -> Result<Self> {
        Ok(Self::new(spec.key.clone(), spec.params()?))
    }

    pub fn new(key: BlockKey, params: ModalParams) -> Self {
        Self {
            key,
            params,
            core: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.core
            .as_ref()
            .and_then(|core| core.is_open().ok())
            .unwrap_or(false)
    }
}

impl Block for ModalWindow {
    fn key(&self) -> &BlockKey {
        &self.key
    }

    fn init(&mut self, ctx: &mut BlockContext<'_>) -> Result<()> {
        let arbitrator = match self.params.multiple {
            Switch::On => None,
            Switch::Off => Some(ensure_arbitrator(ctx)?),
        };
        let open = ctx.read()?.is_visible(&self.key.root);
        let core = Arc::new(ModalCore {
            key: self.key.clone(),
            params: self.params.clone(),
            document: Arc::clone(ctx.document()),
            arbitrator,
            state: Mutex::new(WindowState {
                open,
                ..WindowState::default()
            }),
            logger: ctx.logger(),
        });
        for tag in [MessageTag::OpenModal, MessageTag::CloseModal] {
            self.subscriptions.push(subscribe_weak(
                ctx.bus(),
                MODAL_CHANNEL,
                tag,
                &core,
                |core, bus, message| core.handle(bus, message, false),
            ));
        }
        self.core = Some(core);
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut BlockContext<'_>, event: &HostEvent) -> Result<EventFlow> {
        let Some(core) = self.core.clone() else {
            return Ok(EventFlow::Continue);
        };
        let open = core.is_open()?;
        match event {
            HostEvent::Signal { target, message } if target == &self.key.root => {
                core.handle(ctx.bus(), message, true)?;
                Ok(EventFlow::Consumed)
            }
            HostEvent::Resize(_) => {
                if core.is_active()? {
                    core.close(ctx.bus())?;
                    core.open(ctx.bus())?;
                }
                Ok(EventFlow::Continue)
            }
            HostEvent::Click { target } if open => core.on_click(ctx.bus(), target),
            _ => Ok(EventFlow::Continue),
        }
    }
}
