//! The widgets a page declares on its elements.
//!
//! Each block keeps its mutable state behind an `Arc` shared with its channel
//! handlers. Handlers hold only a weak reference, lock state briefly, and emit
//! follow-up messages after every lock is released.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::channels::{ChannelBus, Message, MessageTag, Subscription};
use crate::error::{BlockError, Result};
use crate::runtime::{Block, BlockRegistry};

pub mod ajax_paste;
pub mod composer;
pub mod modal;
pub mod paginator;
pub mod paste;
pub mod trigger;

pub use ajax_paste::{AjaxPaste, AjaxPasteParams, InsertKind};
pub use composer::{Composer, ComposerParams, OpenSide};
pub use modal::{ClickGate, Direction, MODAL_CHANNEL, ModalParams, ModalWindow};
pub use paginator::{AutoPaginate, Paginator, PaginatorParams};
pub use paste::{PASTE_NAMES, Paste, PasteParams};
pub use trigger::{Trigger, TriggerParams};

/// Registry with every block this crate ships.
pub fn standard_registry() -> BlockRegistry {
    let mut registry = BlockRegistry::new();
    for name in PASTE_NAMES {
        registry.register(name, |spec| Ok(Box::new(Paste::from_spec(spec)?) as Box<dyn Block>));
    }
    registry.register(modal::BLOCK_NAME, |spec| {
        Ok(Box::new(ModalWindow::from_spec(spec)?) as Box<dyn Block>)
    });
    registry.register(paginator::BLOCK_NAME, |spec| {
        Ok(Box::new(Paginator::from_spec(spec)?) as Box<dyn Block>)
    });
    registry.register(ajax_paste::BLOCK_NAME, |spec| {
        Ok(Box::new(AjaxPaste::from_spec(spec)?) as Box<dyn Block>)
    });
    registry.register(trigger::BLOCK_NAME, |spec| {
        Ok(Box::new(Trigger::from_spec(spec)?) as Box<dyn Block>)
    });
    registry.register(composer::BLOCK_NAME, |spec| {
        Ok(Box::new(Composer::from_spec(spec)?) as Box<dyn Block>)
    });
    registry
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| BlockError::Poisoned)
}

pub(crate) fn log_target(block: &str) -> String {
    format!("blockbus::blocks.{block}")
}

/// Subscribe `handler` with a weak hold on `target`; once the block is gone
/// the handler does nothing.
pub(crate) fn subscribe_weak<S, F>(
    bus: &Arc<ChannelBus>,
    channel: &str,
    tag: MessageTag,
    target: &Arc<S>,
    handler: F,
) -> Subscription
where
    S: Send + Sync + 'static,
    F: Fn(&S, &ChannelBus, &Message) -> Result<()> + Send + Sync + 'static,
{
    let weak = Arc::downgrade(target);
    bus.subscribe(channel, tag, move |bus, message| match weak.upgrade() {
        Some(target) => handler(&target, bus, message),
        None => Ok(()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_knows_every_block() {
        let registry = standard_registry();
        for name in [
            "paste",
            "paste2",
            "paste5",
            "modal-window",
            "paginator",
            "paste-1",
            "ext-paste",
            "textareasmiles",
        ] {
            assert!(registry.contains(name), "missing {name}");
        }
    }
}
