use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use crate::channels::{ChannelBus, Message};
use crate::dom::{self, Document, Fragment, RegionId, SharedDocument};
use crate::error::{BlockError, Result};
use crate::logging::{LogLevel, Logger, emit_log, json_kv};
use crate::runtime::transport::{FetchClient, Method, RequestId, TransportError};
use crate::runtime::{Block, BlockContext, BlockKey, BlockSpec, EventFlow, HostEvent};

use super::{lock, log_target};

pub const BLOCK_NAME: &str = "textareasmiles";

pub const EMPTY_NOTICE: &str = "Enter text!";
pub const SEND_FAILED_NOTICE: &str = "The message could not be sent.";

const EMOJI_PIXEL: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAABAAAAAQAQMAAAAlPW0iAAAAA1BMVEUAAACnej3aAAAAAXRSTlMAQObYZgAAAAtJREFUCNdjIBEAAAAwAAFletZ8AAAAAElFTkSuQmCC";
const EMOJI_SPAN: &str =
    r#"<span class="textareasmiles__emoji textareasmiles__emoji_border_delete textareasmiles__emoji_e"#;

fn emoji_open_pattern() -> &'static Regex {
    static OPEN: OnceLock<Regex> = OnceLock::new();
    OPEN.get_or_init(|| {
        Regex::new(r#"<img class="textareasmiles__emoji\stextareasmiles__emoji_e"#)
            .expect("emoji open pattern is valid")
    })
}

fn emoji_close_pattern() -> &'static Regex {
    static CLOSE: OnceLock<Regex> = OnceLock::new();
    CLOSE.get_or_init(|| {
        Regex::new(r#""\ssrc="[^"]+"(\sstyle="[^"]+")*>"#).expect("emoji close pattern is valid")
    })
}

/// Turn emoji images into `<!--eN-->` codes for sending.
pub fn encode_emoji(html: &str) -> String {
    let opened = emoji_open_pattern().replace_all(html, "<!--");
    emoji_close_pattern().replace_all(&opened, "-->").into_owned()
}

/// Turn `<!--eN-->` codes from the server back into emoji spans.
pub fn decode_emoji(html: &str) -> String {
    html.replace("<!--", EMOJI_SPAN).replace("-->", r#""></span>"#)
}

fn emoji_markup(code: &str) -> String {
    format!(r#" <img class="textareasmiles__emoji textareasmiles__emoji_{code}" src="{EMOJI_PIXEL}"> "#)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenSide {
    #[default]
    Top,
    Bottom,
    /// Below the textarea when it sits in the upper half of the viewport.
    Auto,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComposerParams {
    /// Feed channel that receives `wait` and the posted message.
    pub channel: Option<String>,
    /// Textarea height as a multiple of the placeholder height.
    pub k: f32,
    pub height_box_smiles: u16,
    pub openside: OpenSide,
    pub url: Option<String>,
    pub method: Method,
}

impl Default for ComposerParams {
    fn default() -> Self {
        Self {
            channel: None,
            k: 3.2,
            height_box_smiles: 50,
            openside: OpenSide::Top,
            url: None,
            method: Method::Post,
        }
    }
}

/// Element regions of one composer.
#[derive(Debug, Clone)]
struct Parts {
    placeholder: RegionId,
    textarea: RegionId,
    button: RegionId,
    panel: RegionId,
    submit: RegionId,
}

impl Parts {
    fn find(doc: &Document, root: &str) -> Result<Self> {
        let part = |element: &str| {
            doc.first_marked(root, &format!("{BLOCK_NAME}__{element}"))
                .ok_or_else(|| BlockError::missing(BLOCK_NAME, &format!("{BLOCK_NAME}__{element}")))
        };
        Ok(Self {
            placeholder: part("placeholder")?,
            textarea: part("textarea")?,
            button: part("btn-smile")?,
            panel: part("box-smiles")?,
            submit: part("sub-text-smiles")?,
        })
    }
}

#[derive(Debug, Default)]
struct ComposerState {
    /// A part of the composer handled the current click.
    claimed: bool,
    panel_open: bool,
    sending: Option<RequestId>,
}

struct ComposerCore {
    key: BlockKey,
    params: ComposerParams,
    parts: Parts,
    document: SharedDocument,
    state: Mutex<ComposerState>,
    fetch: Option<FetchClient>,
    logger: Option<Logger>,
}

/// Emoji regions carry their code as a modifier such as `e12`.
fn is_emoji_code(key: &str) -> bool {
    key.strip_prefix('e')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

impl ComposerCore {
    fn log(
        &self,
        level: LogLevel,
        message: &str,
        fields: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) {
        emit_log(self.logger.as_ref(), level, &log_target(BLOCK_NAME), message, fields);
    }

    fn emoji_code(doc: &Document, emoji: &str) -> Option<String> {
        doc.region(emoji)?
            .modifiers()
            .map(|(key, _)| key)
            .find(|key| is_emoji_code(key))
            .map(str::to_string)
    }

    fn show_textarea(&self, doc: &mut Document, state: &mut ComposerState) -> Result<()> {
        state.claimed = true;
        let placeholder_height = doc.rect_of(&self.parts.placeholder).map_or(0, |rect| rect.height);
        doc.set_hidden(&self.parts.placeholder, true)?;
        doc.set_hidden(&self.parts.textarea, false)?;
        let height = (f32::from(placeholder_height) * self.params.k).round() as u16;
        doc.set_height(&self.parts.textarea, height)
    }

    fn show_panel(&self, doc: &mut Document, state: &mut ComposerState) -> Result<()> {
        let side = match self.params.openside {
            OpenSide::Top => "top",
            OpenSide::Bottom => "bottom",
            OpenSide::Auto => {
                let centre = doc.rect_of(&self.parts.textarea).map_or(0, |rect| rect.middle_y());
                if centre <= doc.viewport().height / 2 { "bottom" } else { "top" }
            }
        };
        doc.set_modifier(&self.parts.panel, "side", Some(side))?;
        doc.set_height(&self.parts.panel, self.params.height_box_smiles)?;
        doc.set_hidden(&self.parts.panel, false)?;
        state.panel_open = true;
        Ok(())
    }

    /// Collapse back to the placeholder unless a part of the composer claimed
    /// the click.
    fn original_state(&self, doc: &mut Document, state: &mut ComposerState) -> Result<()> {
        if !state.claimed {
            let empty = doc
                .region(&self.parts.textarea)
                .is_none_or(|textarea| textarea.text().is_empty());
            if empty {
                doc.set_hidden(&self.parts.textarea, true)?;
                doc.set_hidden(&self.parts.placeholder, false)?;
            }
            doc.set_hidden(&self.parts.panel, true)?;
            state.panel_open = false;
        }
        state.claimed = false;
        Ok(())
    }

    fn on_click(&self, bus: &ChannelBus, target: &str) -> Result<EventFlow> {
        let within = |doc: &Document, part: &str| doc.is_within(target, part);
        {
            let doc = dom::read(&self.document)?;
            if within(&*doc, &self.parts.submit) {
                drop(doc);
                self.submit(bus)?;
                return Ok(EventFlow::Consumed);
            }
        }

        let mut doc = dom::write(&self.document)?;
        let mut state = lock(&self.state)?;
        if within(&*doc, &self.parts.placeholder) {
            self.show_textarea(&mut doc, &mut state)?;
        }
        if within(&*doc, &self.parts.textarea) {
            state.claimed = true;
        }
        let emoji = doc
            .find_marked(&self.parts.panel, &format!("{BLOCK_NAME}__emoji"))
            .into_iter()
            .find(|emoji| doc.is_within(target, emoji));
        if let Some(emoji) = emoji {
            state.claimed = true;
            if let Some(code) = Self::emoji_code(&doc, &emoji) {
                let content = doc.content(&self.parts.textarea).unwrap_or_default().to_string();
                doc.set_content(&self.parts.textarea, content + &emoji_markup(&code))?;
                doc.set_hidden(&self.parts.submit, false)?;
            }
        }
        if within(&*doc, &self.parts.button) {
            state.claimed = true;
            if state.panel_open {
                doc.set_hidden(&self.parts.panel, true)?;
                state.panel_open = false;
            } else {
                let empty = doc
                    .region(&self.parts.textarea)
                    .is_none_or(|textarea| textarea.text().is_empty());
                if empty {
                    self.show_textarea(&mut doc, &mut state)?;
                }
                self.show_panel(&mut doc, &mut state)?;
            }
        }
        self.original_state(&mut doc, &mut state)?;
        Ok(EventFlow::Continue)
    }

    fn on_input(&self, target: &str, html: &str) -> Result<()> {
        let mut doc = dom::write(&self.document)?;
        if !doc.is_within(target, &self.parts.textarea) || lock(&self.state)?.sending.is_some() {
            return Ok(());
        }
        doc.set_content(&self.parts.textarea, html)?;
        doc.set_hidden(&self.parts.submit, html.is_empty())?;
        Ok(())
    }

    fn set_locked(&self, doc: &mut Document, locked: bool) -> Result<()> {
        let flag = locked.then_some("");
        doc.set_modifier(&self.parts.submit, "disabled", flag)?;
        doc.set_modifier(&self.parts.textarea, "disabled", flag)?;
        Ok(())
    }

    fn submit(&self, bus: &ChannelBus) -> Result<()> {
        if lock(&self.state)?.sending.is_some() {
            return Ok(());
        }
        let fetch = self.fetch.as_ref().ok_or(TransportError::NotConfigured)?;
        let url = self.params.url.as_deref().ok_or_else(|| {
            BlockError::declaration(BLOCK_NAME, "`url` is required to send messages")
        })?;
        let encoded = {
            let mut doc = dom::write(&self.document)?;
            let encoded = encode_emoji(doc.content(&self.parts.textarea).unwrap_or_default());
            if encoded.is_empty() {
                doc.push_notice(EMPTY_NOTICE);
                return Ok(());
            }
            self.set_locked(&mut doc, true)?;
            encoded
        };
        if let Some(channel) = &self.params.channel {
            bus.emit(channel, &Message::Wait).into_result()?;
        }

        match fetch.submit(&self.key, self.params.method, url, Some(encoded)) {
            Ok(id) => {
                lock(&self.state)?.sending = Some(id);
                self.log(
                    LogLevel::Debug,
                    "message_sent",
                    [json_kv("request", json!(id.to_string()))],
                );
                Ok(())
            }
            Err(err) => self.fail(&err),
        }
    }

    fn unlock(&self) -> Result<()> {
        let mut doc = dom::write(&self.document)?;
        self.set_locked(&mut doc, false)
    }

    fn fail(&self, err: &TransportError) -> Result<()> {
        {
            let mut doc = dom::write(&self.document)?;
            doc.push_notice(SEND_FAILED_NOTICE);
            self.set_locked(&mut doc, false)?;
        }
        lock(&self.state)?.sending = None;
        self.log(LogLevel::Warn, "message_failed", [json_kv("error", json!(err.to_string()))]);
        Ok(())
    }

    fn complete(
        &self,
        bus: &ChannelBus,
        id: RequestId,
        result: &std::result::Result<Fragment, TransportError>,
    ) -> Result<()> {
        {
            let mut state = lock(&self.state)?;
            if state.sending != Some(id) {
                return Ok(());
            }
            state.sending = None;
        }
        let fragment = match result {
            Ok(fragment) => fragment,
            Err(err) => return self.fail(err),
        };
        self.unlock()?;
        if let Some(channel) = &self.params.channel {
            let decoded = Fragment::new(decode_emoji(fragment.as_str()));
            bus.emit(channel, &Message::Insert(decoded)).into_result()?;
        }

        let mut doc = dom::write(&self.document)?;
        let mut state = lock(&self.state)?;
        doc.set_content(&self.parts.textarea, "")?;
        doc.set_hidden(&self.parts.submit, true)?;
        state.claimed = false;
        self.original_state(&mut doc, &mut state)
    }
}

/// Message composer with an emoji panel that posts through the host
/// transport and hands the answer to a feed channel.
pub struct Composer {
    key: BlockKey,
    params: ComposerParams,
    core: Option<Arc<ComposerCore>>,
}

impl Composer {
    pub fn from_spec(spec: &BlockSpec) -> Result<Self> {
        Ok(Self::new(spec.key.clone(), spec.params()?))
    }

    pub fn new(key: BlockKey, params: ComposerParams) -> Self {
        Self {
            key,
            params,
            core: None,
        }
    }

    pub fn is_sending(&self) -> bool {
        self.core
            .as_ref()
            .and_then(|core| lock(&core.state).ok().map(|state| state.sending.is_some()))
            .unwrap_or(false)
    }
}

impl Block for Composer {
    fn key(&self) -> &BlockKey {
        &self.key
    }

    fn init(&mut self, ctx: &mut BlockContext<'_>) -> Result<()> {
        let parts = Parts::find(&*ctx.read()?, &self.key.root)?;
        self.core = Some(Arc::new(ComposerCore {
            key: self.key.clone(),
            params: self.params.clone(),
            parts,
            document: Arc::clone(ctx.document()),
            state: Mutex::new(ComposerState::default()),
            fetch: ctx.fetch_client(),
            logger: ctx.logger(),
        }));
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut BlockContext<'_>, event: &HostEvent) -> Result<EventFlow> {
        let Some(core) = self.core.clone() else {
            return Ok(EventFlow::Continue);
        };
        match event {
            HostEvent::Click { target } => core.on_click(ctx.bus(), target),
            HostEvent::Input { target, html } => {
                core.on_input(target, html)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MessageTag;
    use crate::dom::RegionSpec;
    use crate::geometry::{Rect, Size};
    use crate::runtime::BlockHost;
    use crate::runtime::transport::QueuedTransport;

    fn composer_page() -> Document {
        let mut doc = Document::new(Size::new(800, 600));
        doc.append(None, RegionSpec::new("form")).unwrap();
        doc.append(
            Some("form"),
            RegionSpec::new("ph")
                .mark("textareasmiles__placeholder")
                .rect(Rect::new(0, 100, 400, 20)),
        )
        .unwrap();
        doc.append(
            Some("form"),
            RegionSpec::new("ta")
                .classes("textareasmiles__textarea textareasmiles__textarea_hide")
                .rect(Rect::new(0, 100, 400, 20)),
        )
        .unwrap();
        doc.append(Some("form"), RegionSpec::new("smile").mark("textareasmiles__btn-smile"))
            .unwrap();
        doc.append(
            Some("form"),
            RegionSpec::new("panel")
                .classes("textareasmiles__box-smiles textareasmiles__box-smiles_hide"),
        )
        .unwrap();
        doc.append(
            Some("form"),
            RegionSpec::new("send")
                .classes("textareasmiles__sub-text-smiles textareasmiles__sub-text-smiles_hide"),
        )
        .unwrap();
        for code in ["e3", "e7"] {
            doc.append(
                Some("panel"),
                RegionSpec::new(format!("panel/{code}")).classes(&format!(
                    "textareasmiles__emoji textareasmiles__emoji_{code}"
                )),
            )
            .unwrap();
        }
        doc.append(None, RegionSpec::new("page")).unwrap();
        doc
    }

    fn composer(declaration: &str) -> (BlockHost, Arc<QueuedTransport>) {
        let transport = Arc::new(QueuedTransport::new());
        let mut host = BlockHost::new(composer_page()).with_transport(transport.clone());
        host.declare("form", declaration).unwrap();
        (host, transport)
    }

    fn visible(host: &BlockHost, id: &str) -> bool {
        dom::read(host.document()).unwrap().is_visible(id)
    }

    #[test]
    fn emoji_codes_survive_a_round_trip_through_the_server() {
        let typed = format!("hi{}", emoji_markup("e12"));
        assert_eq!(encode_emoji(&typed), "hi <!--12--> ");
        assert_eq!(
            decode_emoji("hi <!--12-->"),
            r#"hi <span class="textareasmiles__emoji textareasmiles__emoji_border_delete textareasmiles__emoji_e12"></span>"#
        );
    }

    #[test]
    fn placeholder_opens_the_textarea_until_an_outside_click() {
        let (mut host, _) = composer(r#"{"textareasmiles": {"channel": "comments"}}"#);
        host.click("ph").unwrap();
        assert!(visible(&host, "ta"));
        assert!(!visible(&host, "ph"));
        assert_eq!(dom::read(host.document()).unwrap().rect_of("ta").unwrap().height, 64);

        host.click("ta").unwrap();
        assert!(visible(&host, "ta"));
        host.click("page").unwrap();
        assert!(!visible(&host, "ta"));
        assert!(visible(&host, "ph"));
    }

    #[test]
    fn smile_button_toggles_the_panel_and_emoji_are_appended() {
        let (mut host, _) = composer(r#"{"textareasmiles": {"openside": "auto"}}"#);
        host.click("smile").unwrap();
        {
            let doc = dom::read(host.document()).unwrap();
            assert!(doc.is_visible("panel"));
            assert!(doc.is_visible("ta"));
            assert_eq!(doc.modifier("panel", "side"), Some("bottom"));
        }
        host.click("panel/e7").unwrap();
        assert!(visible(&host, "panel"));
        assert!(visible(&host, "send"));
        let content = dom::read(host.document()).unwrap().content("ta").unwrap().to_string();
        assert!(content.contains("textareasmiles__emoji_e7"));

        host.click("smile").unwrap();
        assert!(!visible(&host, "panel"));
    }

    #[test]
    fn empty_submit_only_warns() {
        let (mut host, transport) = composer(r#"{"textareasmiles": {"url": "/post"}}"#);
        assert_eq!(host.click("send").unwrap(), EventFlow::Consumed);
        assert_eq!(host.take_notices().unwrap(), vec![EMPTY_NOTICE.to_string()]);
        assert!(transport.is_empty());
    }

    #[test]
    fn submit_posts_encoded_text_and_inserts_the_answer() {
        let (mut host, transport) =
            composer(r#"{"textareasmiles": {"channel": "comments", "url": "/post"}}"#);
        let inserted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inserted);
        let _probe = host.bus().subscribe("comments", MessageTag::Insert, move |_, message| {
            if let Some(fragment) = message.fragment() {
                sink.lock().unwrap().push(fragment.as_str().to_string());
            }
            Ok(())
        });

        host.click("ph").unwrap();
        host.dispatch(HostEvent::Input {
            target: "ta".into(),
            html: format!("hello{}", emoji_markup("e3")),
        })
        .unwrap();
        assert!(visible(&host, "send"));
        host.click("send").unwrap();

        let request = transport.pop().unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.body.as_deref(), Some("hello <!--3--> "));
        assert_eq!(
            dom::read(host.document()).unwrap().modifier("send", "disabled"),
            Some("")
        );

        host.complete_fetch(request.id, Ok(Fragment::new("<p>hello <!--3--></p>")))
            .unwrap();
        let inserted = inserted.lock().unwrap();
        assert_eq!(inserted.len(), 1);
        assert!(inserted[0].contains("textareasmiles__emoji_e3\"></span>"));
        let doc = dom::read(host.document()).unwrap();
        assert_eq!(doc.content("ta"), Some(""));
        assert_eq!(doc.modifier("send", "disabled"), None);
        assert!(doc.is_visible("ph"));
    }

    #[test]
    fn failed_send_unlocks_with_a_notice() {
        let (mut host, transport) = composer(r#"{"textareasmiles": {"url": "/post"}}"#);
        host.dispatch(HostEvent::Input {
            target: "ta".into(),
            html: "hi".into(),
        })
        .unwrap();
        host.click("send").unwrap();
        let request = transport.pop().unwrap();
        host.complete_fetch(request.id, Err(TransportError::Network("reset".into())))
            .unwrap();
        assert_eq!(host.take_notices().unwrap(), vec![SEND_FAILED_NOTICE.to_string()]);
        assert_eq!(dom::read(host.document()).unwrap().content("ta"), Some("hi"));
        host.click("send").unwrap();
        assert_eq!(transport.len(), 1);
    }

    #[test]
    fn missing_part_is_reported_at_mount() {
        let mut doc = composer_page();
        doc.remove("smile").unwrap();
        let mut host = BlockHost::new(doc);
        let err = host.declare("form", r#"{"textareasmiles": {}}"#).unwrap_err();
        assert!(err.to_string().contains("textareasmiles__btn-smile"));
    }
}
