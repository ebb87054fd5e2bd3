use std::fmt;

use thiserror::Error;

use crate::dom::Fragment;

/// Tag half of a channel message; subscriptions are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageTag {
    OpenModal,
    CloseModal,
    Wait,
    Insert,
    InsertEnd,
    Init,
    Reset,
    Next,
    Success,
    Click,
    Change,
}

impl MessageTag {
    pub const ALL: [MessageTag; 11] = [
        MessageTag::OpenModal,
        MessageTag::CloseModal,
        MessageTag::Wait,
        MessageTag::Insert,
        MessageTag::InsertEnd,
        MessageTag::Init,
        MessageTag::Reset,
        MessageTag::Next,
        MessageTag::Success,
        MessageTag::Click,
        MessageTag::Change,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageTag::OpenModal => "openmodal",
            MessageTag::CloseModal => "closemodal",
            MessageTag::Wait => "wait",
            MessageTag::Insert => "insert",
            MessageTag::InsertEnd => "insertend",
            MessageTag::Init => "init",
            MessageTag::Reset => "reset",
            MessageTag::Next => "next",
            MessageTag::Success => "success",
            MessageTag::Click => "click",
            MessageTag::Change => "change",
        }
    }

    pub fn parse(tag: &str) -> Result<Self, ChannelError> {
        let tag = match tag {
            "open" | "openmodal" => MessageTag::OpenModal,
            "closemodal" => MessageTag::CloseModal,
            "wait" => MessageTag::Wait,
            "insert" => MessageTag::Insert,
            "insertend" => MessageTag::InsertEnd,
            "init" => MessageTag::Init,
            "reset" => MessageTag::Reset,
            "next" => MessageTag::Next,
            "success" => MessageTag::Success,
            "click" => MessageTag::Click,
            "change" => MessageTag::Change,
            other => return Err(ChannelError::UnknownTag(other.to_string())),
        };
        Ok(tag)
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A channel message: a tag plus the payload shape that tag requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Open the modal window with this name.
    OpenModal(String),
    /// Close the named modal; `None` is the broadcast "a modal closed" notice.
    CloseModal(Option<String>),
    Wait,
    Insert(Fragment),
    InsertEnd,
    Init,
    Reset,
    /// Request the next page; carries the continuation token.
    Next(String),
    Success,
    Click,
    Change,
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::OpenModal(_) => MessageTag::OpenModal,
            Message::CloseModal(_) => MessageTag::CloseModal,
            Message::Wait => MessageTag::Wait,
            Message::Insert(_) => MessageTag::Insert,
            Message::InsertEnd => MessageTag::InsertEnd,
            Message::Init => MessageTag::Init,
            Message::Reset => MessageTag::Reset,
            Message::Next(_) => MessageTag::Next,
            Message::Success => MessageTag::Success,
            Message::Click => MessageTag::Click,
            Message::Change => MessageTag::Change,
        }
    }

    /// Build a message from its string form, checking the payload against the tag.
    pub fn from_parts(tag: &str, payload: Option<&str>) -> Result<Self, ChannelError> {
        let tag = MessageTag::parse(tag)?;
        let message = match (tag, payload) {
            (MessageTag::OpenModal, Some(name)) => Message::OpenModal(name.to_string()),
            (MessageTag::CloseModal, name) => Message::CloseModal(name.map(str::to_string)),
            (MessageTag::Insert, Some(html)) => Message::Insert(Fragment::new(html)),
            (MessageTag::Next, Some(token)) => Message::Next(token.to_string()),
            (MessageTag::OpenModal | MessageTag::Insert | MessageTag::Next, None) => {
                return Err(ChannelError::MissingPayload(tag));
            }
            (_, Some(_)) => return Err(ChannelError::UnexpectedPayload(tag)),
            (MessageTag::Wait, None) => Message::Wait,
            (MessageTag::InsertEnd, None) => Message::InsertEnd,
            (MessageTag::Init, None) => Message::Init,
            (MessageTag::Reset, None) => Message::Reset,
            (MessageTag::Success, None) => Message::Success,
            (MessageTag::Click, None) => Message::Click,
            (MessageTag::Change, None) => Message::Change,
        };
        Ok(message)
    }

    /// Name or token carried by the message, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Message::OpenModal(name) | Message::Next(name) => Some(name),
            Message::CloseModal(name) => name.as_deref(),
            _ => None,
        }
    }

    pub fn fragment(&self) -> Option<&Fragment> {
        match self {
            Message::Insert(fragment) => Some(fragment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("unknown message tag `{0}`")]
    UnknownTag(String),
    #[error("message `{0}` requires a payload")]
    MissingPayload(MessageTag),
    #[error("message `{0}` does not take a payload")]
    UnexpectedPayload(MessageTag),
    #[error("emission depth limit of {0} exceeded")]
    DepthExceeded(usize),
    #[error("handler panicked")]
    HandlerPanicked,
}
