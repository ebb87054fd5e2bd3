use std::sync::{Arc, RwLock};

use super::BlockContext;
use super::shared_state::SharedStateError;

/// Which modal window, if any, currently owns the screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ModalState {
    #[default]
    Closed,
    Open(String),
}

/// Host-wide record of the single active modal window.
///
/// Only [`ModalArbitrator::open`] and [`ModalArbitrator::close`] mutate it, and
/// `close` only clears the state when it names the caller.
#[derive(Debug, Default)]
pub struct ModalArbitrator {
    inner: RwLock<ModalState>,
}

impl ModalArbitrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, name: impl Into<String>) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = ModalState::Open(name.into());
        }
    }

    /// Returns whether `name` was the active modal.
    pub fn close(&self, name: &str) -> bool {
        if let Ok(mut guard) = self.inner.write() {
            if matches!(&*guard, ModalState::Open(active) if active == name) {
                *guard = ModalState::Closed;
                return true;
            }
        }
        false
    }

    pub fn state(&self) -> ModalState {
        self.inner
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn active(&self) -> Option<String> {
        match self.state() {
            ModalState::Open(name) => Some(name),
            ModalState::Closed => None,
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        matches!(self.state(), ModalState::Open(active) if active == name)
    }
}

pub type SharedArbitrator = Arc<ModalArbitrator>;

pub fn ensure_arbitrator(ctx: &BlockContext<'_>) -> Result<SharedArbitrator, SharedStateError> {
    ctx.shared_init::<ModalArbitrator, _>(ModalArbitrator::new)
}
