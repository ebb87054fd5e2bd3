use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

/// Host-wide resources shared by blocks that never see each other, such as
/// the modal arbitrator.
///
/// Resources are keyed by their [`TypeId`], so each type appears at most once
/// per host. Cloning the container clones the handle, not the resources.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_arc<T>(&self, value: Arc<T>) -> Result<(), SharedStateError>
    where
        T: Send + Sync + 'static,
    {
        let mut guard = self.inner.write().map_err(|_| SharedStateError::Poisoned)?;
        let type_id = TypeId::of::<T>();
        if guard.contains_key(&type_id) {
            return Err(SharedStateError::AlreadyExists(std::any::type_name::<T>()));
        }
        guard.insert(type_id, Box::new(value));
        Ok(())
    }

    pub fn get<T>(&self) -> Result<Arc<T>, SharedStateError>
    where
        T: Send + Sync + 'static,
    {
        let guard = self.inner.read().map_err(|_| SharedStateError::Poisoned)?;
        let boxed = guard
            .get(&TypeId::of::<T>())
            .ok_or(SharedStateError::Missing(std::any::type_name::<T>()))?;
        boxed
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or(SharedStateError::TypeMismatch)
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.inner
            .read()
            .map(|guard| guard.contains_key(&TypeId::of::<T>()))
            .unwrap_or(false)
    }

    /// Fetch the resource, creating it on first use. Racing initialisers agree
    /// on whichever value was stored first.
    pub fn get_or_insert_with<T, F>(&self, make: F) -> Result<Arc<T>, SharedStateError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Ok(value) = self.get::<T>() {
            return Ok(value);
        }
        let mut guard = self.inner.write().map_err(|_| SharedStateError::Poisoned)?;
        let stored = guard
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Arc::new(make())));
        stored
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or(SharedStateError::TypeMismatch)
    }
}

#[derive(Debug, Error)]
pub enum SharedStateError {
    #[error("shared resource `{0}` already exists")]
    AlreadyExists(&'static str),
    #[error("shared resource `{0}` missing")]
    Missing(&'static str),
    #[error("shared resource type mismatch")]
    TypeMismatch,
    #[error("shared state poisoned")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct OpenCount(Mutex<u32>);

    #[test]
    fn resources_are_shared_between_handles() {
        let state = SharedState::new();
        let other = state.clone();
        let first = state.get_or_insert_with(OpenCount::default).unwrap();
        *first.0.lock().unwrap() += 1;

        let second = other.get::<OpenCount>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second.0.lock().unwrap(), 1);
        assert!(other.contains::<OpenCount>());
    }

    #[test]
    fn duplicate_insert_fails() {
        let state = SharedState::new();
        state.insert_arc(Arc::new(OpenCount::default())).unwrap();
        let err = state.insert_arc(Arc::new(OpenCount::default())).unwrap_err();
        assert!(matches!(err, SharedStateError::AlreadyExists(_)));
    }

    #[test]
    fn missing_resource_is_reported() {
        let state = SharedState::new();
        assert!(matches!(
            state.get::<OpenCount>(),
            Err(SharedStateError::Missing(_))
        ));
    }
}
