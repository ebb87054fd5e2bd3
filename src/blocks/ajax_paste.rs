use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;

use crate::channels::{ChannelBus, Message, MessageTag, Subscription};
use crate::dom::{self, Document, Fragment, SharedDocument};
use crate::error::{BlockError, Result};
use crate::logging::{LogLevel, Logger, emit_log, json_kv};
use crate::modes::{DisplayController, ModeDescriptor, ModeTable, RegionMarks};
use crate::runtime::transport::{FetchClient, Method, RequestId, TransportError};
use crate::runtime::{Block, BlockContext, BlockKey, BlockSpec, EventFlow, HostEvent};

use super::paste::insert_fragment;
use super::{lock, log_target, subscribe_weak};

pub const BLOCK_NAME: &str = "paste-1";

/// Shown to the user when a request fails.
pub const FAILURE_NOTICE: &str = "A server error occurred. We apologize for the inconvenience.";

const CLICK_MARK: &str = "paste-1__click";
const CHANGE_MARK: &str = "paste-1__change";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertKind {
    /// Fetch `url` and show the response.
    #[default]
    Simple,
    /// Fetch the URL carried by the page field and keep paginating.
    Paginator,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AjaxPasteParams {
    /// Channel for `click`/`change` triggers and `success` notifications.
    pub name: Option<String>,
    pub type_insert: InsertKind,
    pub mode_sending_request_ajax: String,
    pub mode_getting_response_ajax: String,
    pub url: Option<String>,
    pub ajax_type: Method,
    pub page_field: String,
    pub display_modes: HashMap<String, ModeDescriptor>,
}

impl Default for AjaxPasteParams {
    fn default() -> Self {
        Self {
            name: None,
            type_insert: InsertKind::Simple,
            mode_sending_request_ajax: "wait".to_string(),
            mode_getting_response_ajax: "insert".to_string(),
            url: None,
            ajax_type: Method::Get,
            page_field: "page".to_string(),
            display_modes: HashMap::new(),
        }
    }
}

impl AjaxPasteParams {
    pub fn mode_table(&self) -> ModeTable {
        ModeTable::extended().with_overrides(&self.display_modes)
    }
}

/// Display state before a request changed it.
#[derive(Debug, Clone)]
struct Snapshot {
    hidden: Vec<(String, bool)>,
    mode: Option<String>,
}

#[derive(Debug, Clone)]
struct InFlight {
    id: RequestId,
    previous: Snapshot,
}

struct AjaxCore {
    key: BlockKey,
    params: AjaxPasteParams,
    document: SharedDocument,
    display: Mutex<DisplayController>,
    in_flight: Mutex<Option<InFlight>>,
    fetch: Option<FetchClient>,
    logger: Option<Logger>,
}

impl AjaxCore {
    fn log(
        &self,
        level: LogLevel,
        message: &str,
        fields: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) {
        emit_log(self.logger.as_ref(), level, &log_target(BLOCK_NAME), message, fields);
    }

    /// Page field carried by the first replace region.
    fn page_token(&self, doc: &Document) -> Option<String> {
        let slot = lock(&self.display).ok()?.marks().slot.clone();
        doc.first_marked(&self.key.root, &slot)
            .and_then(|replace| doc.field_value(&replace, &self.params.page_field))
    }

    fn target_url(&self) -> Result<Option<String>> {
        match self.params.type_insert {
            InsertKind::Simple => Ok(self.params.url.clone()),
            InsertKind::Paginator => Ok(self.page_token(&*dom::read(&self.document)?)),
        }
    }

    /// Start a request unless one is already running. Returns whether a
    /// request went out.
    fn request(&self) -> Result<bool> {
        if lock(&self.in_flight)?.is_some() {
            self.log(LogLevel::Debug, "trigger_ignored", [json_kv("reason", json!("in_flight"))]);
            return Ok(false);
        }
        let Some(url) = self.target_url()? else {
            self.log(LogLevel::Debug, "trigger_ignored", [json_kv("reason", json!("no_url"))]);
            return Ok(false);
        };
        let fetch = self.fetch.as_ref().ok_or(TransportError::NotConfigured)?;

        let previous = {
            let mut doc = dom::write(&self.document)?;
            let mut display = lock(&self.display)?;
            let marks = display.marks().clone();
            let hidden = [&marks.indicator, &marks.affordance]
                .into_iter()
                .filter_map(|mark| doc.first_marked(&self.key.root, mark))
                .chain(doc.find_marked(&self.key.root, &marks.slot))
                .filter_map(|id| doc.region(&id).map(|region| (id.clone(), region.is_hidden())))
                .collect();
            let previous = Snapshot {
                hidden,
                mode: display.current().map(str::to_string),
            };
            display.apply(&mut doc, &self.key.root, &self.params.mode_sending_request_ajax)?;
            previous
        };

        match fetch.submit(&self.key, self.params.ajax_type, url.as_str(), None) {
            Ok(id) => {
                *lock(&self.in_flight)? = Some(InFlight { id, previous });
                self.log(
                    LogLevel::Debug,
                    "request_sent",
                    [
                        json_kv("request", json!(id.to_string())),
                        json_kv("method", json!(self.params.ajax_type.as_str())),
                        json_kv("url", json!(url)),
                    ],
                );
                Ok(true)
            }
            Err(err) => {
                self.fail(&previous, &err)?;
                Ok(false)
            }
        }
    }

    /// Tell the user and put the display back the way it was before the request.
    fn fail(&self, previous: &Snapshot, err: &TransportError) -> Result<()> {
        {
            let mut doc = dom::write(&self.document)?;
            doc.push_notice(FAILURE_NOTICE);
            for (id, hidden) in &previous.hidden {
                if doc.contains(id) {
                    doc.set_hidden(id, *hidden)?;
                }
            }
            lock(&self.display)?.restore(previous.mode.clone());
        }
        self.log(LogLevel::Warn, "request_failed", [json_kv("error", json!(err.to_string()))]);
        Ok(())
    }

    fn complete(
        &self,
        bus: &ChannelBus,
        id: RequestId,
        result: &std::result::Result<Fragment, TransportError>,
    ) -> Result<()> {
        let in_flight = {
            let mut slot = lock(&self.in_flight)?;
            if slot.as_ref().is_some_and(|pending| pending.id == id) {
                slot.take()
            } else {
                None
            }
        };
        let Some(in_flight) = in_flight else {
            return Ok(());
        };
        let fragment = match result {
            Ok(fragment) => fragment,
            Err(err) => return self.fail(&in_flight.previous, err),
        };

        let ended = {
            let mut doc = dom::write(&self.document)?;
            let mut display = lock(&self.display)?;
            let marks = display.marks().clone();
            insert_fragment(&mut doc, BLOCK_NAME, &self.key.root, &marks.slot, fragment)?;
            match self.params.type_insert {
                InsertKind::Simple => {
                    let mode = &self.params.mode_getting_response_ajax;
                    display.apply(&mut doc, &self.key.root, mode)?;
                    false
                }
                InsertKind::Paginator => {
                    let has_next = doc
                        .first_marked(&self.key.root, &marks.slot)
                        .and_then(|replace| doc.field_value(&replace, &self.params.page_field))
                        .is_some();
                    if has_next {
                        display.apply(&mut doc, &self.key.root, "init")?;
                    } else {
                        display.apply(&mut doc, &self.key.root, "reset")?;
                        for mark in [&marks.affordance, &marks.indicator] {
                            for region in doc.find_marked(&self.key.root, mark) {
                                if doc.contains(&region) {
                                    doc.remove(&region)?;
                                }
                            }
                        }
                    }
                    !has_next
                }
            }
        };
        self.log(
            LogLevel::Debug,
            "response_inserted",
            [
                json_kv("request", json!(id.to_string())),
                json_kv("ended", json!(ended)),
            ],
        );
        if let Some(name) = &self.params.name {
            bus.emit(name, &Message::Success).into_result()?;
        }
        Ok(())
    }

    /// Whether a click or change on `target` starts a request.
    fn triggered_by(&self, doc: &Document, target: &str, event: &str) -> Result<bool> {
        let marks = lock(&self.display)?.marks().clone();
        let element_mark = if event == "click" { CLICK_MARK } else { CHANGE_MARK };
        let hit = |region: &String| doc.is_within(target, region);

        if doc.find_marked(&self.key.root, element_mark).iter().any(hit) {
            return Ok(true);
        }
        let flagged = [&marks.indicator, &marks.affordance, &marks.slot]
            .into_iter()
            .filter_map(|mark| doc.first_marked(&self.key.root, mark))
            .filter(|region| doc.modifier(region, "event") == Some(event))
            .any(|region| hit(&region));
        Ok(flagged)
    }
}

/// Content block that fetches its own content through the host transport.
pub struct AjaxPaste {
    key: BlockKey,
    params: AjaxPasteParams,
    core: Option<Arc<AjaxCore>>,
    subscriptions: Vec<Subscription>,
}

impl AjaxPaste {
    pub fn from_spec(spec: &BlockSpec) -> Result<Self> {
        let params: AjaxPasteParams = spec.params()?;
        let table = params.mode_table();
        for mode in [&params.mode_sending_request_ajax, &params.mode_getting_response_ajax] {
            if !table.contains(mode) {
                return Err(BlockError::UnknownMode(mode.clone()));
            }
        }
        Ok(Self::new(spec.key.clone(), params))
    }

    pub fn new(key: BlockKey, params: AjaxPasteParams) -> Self {
        Self {
            key,
            params,
            core: None,
            subscriptions: Vec::new(),
        }
    }

    /// Display mode last applied, if any.
    pub fn current_mode(&self) -> Option<String> {
        let core = self.core.as_ref()?;
        let display = lock(&core.display).ok()?;
        display.current().map(str::to_string)
    }

    pub fn is_waiting(&self) -> bool {
        self.core
            .as_ref()
            .and_then(|core| lock(&core.in_flight).ok().map(|slot| slot.is_some()))
            .unwrap_or(false)
    }
}

impl Block for AjaxPaste {
    fn key(&self) -> &BlockKey {
        &self.key
    }

    fn init(&mut self, ctx: &mut BlockContext<'_>) -> Result<()> {
        let marks = RegionMarks::new(BLOCK_NAME, "trubber", "other", "replace");
        let core = Arc::new(AjaxCore {
            key: self.key.clone(),
            params: self.params.clone(),
            document: Arc::clone(ctx.document()),
            display: Mutex::new(DisplayController::new(marks, self.params.mode_table())),
            in_flight: Mutex::new(None),
            fetch: ctx.fetch_client(),
            logger: ctx.logger(),
        });

        if self.params.type_insert == InsertKind::Paginator {
            let mut doc = ctx.write()?;
            if core.page_token(&doc).is_some() {
                let affordance = lock(&core.display)?.marks().affordance.clone();
                if let Some(other) = doc.first_marked(&self.key.root, &affordance) {
                    doc.set_hidden(&other, false)?;
                }
            }
        }

        if let Some(name) = &self.params.name {
            for tag in [MessageTag::Click, MessageTag::Change] {
                self.subscriptions
                    .push(subscribe_weak(ctx.bus(), name, tag, &core, |core, _, _| {
                        core.request().map(|_| ())
                    }));
            }
        }
        self.core = Some(core);
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut BlockContext<'_>, event: &HostEvent) -> Result<EventFlow> {
        let Some(core) = self.core.clone() else {
            return Ok(EventFlow::Continue);
        };
        match event {
            HostEvent::Ready => {
                let on_load = ctx.read()?.modifier(&self.key.root, "event") == Some("load");
                if on_load && self.params.type_insert == InsertKind::Simple {
                    core.request()?;
                }
                Ok(EventFlow::Continue)
            }
            HostEvent::Click { target } | HostEvent::Change { target } => {
                let kind = match event {
                    HostEvent::Click { .. } => "click",
                    _ => "change",
                };
                let triggered = core.triggered_by(&*ctx.read()?, target, kind)?;
                if triggered {
                    core.request()?;
                    return Ok(EventFlow::Consumed);
                }
                Ok(EventFlow::Continue)
            }
            HostEvent::FetchCompleted { id, result } => {
                core.complete(ctx.bus(), *id, result)?;
                Ok(EventFlow::Consumed)
            }
            _ => Ok(EventFlow::Continue),
        }
    }
}
