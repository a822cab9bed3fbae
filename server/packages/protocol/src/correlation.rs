use std::collections::HashMap;

use termrelay_error::RelayError;
use thiserror::Error;
use tokio::sync::oneshot;

pub type CorrelationId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("correlation id {0} is already registered")]
    Duplicate(CorrelationId),
}

/// What a parked caller eventually observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    Value(T),
    Cancelled,
}

impl<T> Resolution<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Resolution::Value(value) => Some(value),
            Resolution::Cancelled => None,
        }
    }
}

/// Receiving half of a registered continuation.
#[derive(Debug)]
pub struct Parked<T> {
    id: CorrelationId,
    rx: oneshot::Receiver<Resolution<T>>,
}

impl<T> Parked<T> {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait for the matching `resolve`. A registry dropped without resolving
    /// counts as cancellation so no caller can stay suspended forever.
    pub async fn wait(self) -> Resolution<T> {
        self.rx.await.unwrap_or(Resolution::Cancelled)
    }
}

/// Maps correlation ids to pending continuations for one session.
///
/// Each registry is owned by exactly one actor (a controller or a sandbox
/// worker) and is never shared, so it needs no locking. Ids start at 1 and
/// only grow for the lifetime of the registry.
#[derive(Debug)]
pub struct CorrelationRegistry<T> {
    label: &'static str,
    next_id: CorrelationId,
    entries: HashMap<CorrelationId, oneshot::Sender<Resolution<T>>>,
}

impl<T> CorrelationRegistry<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    pub fn allocate(&mut self) -> CorrelationId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn register(
        &mut self,
        id: CorrelationId,
        continuation: oneshot::Sender<Resolution<T>>,
    ) -> Result<(), CorrelationError> {
        if self.entries.contains_key(&id) {
            return Err(CorrelationError::Duplicate(id));
        }
        self.entries.insert(id, continuation);
        // Keep externally chosen ids from being handed out again later.
        if id >= self.next_id {
            self.next_id = id + 1;
        }
        Ok(())
    }

    /// Allocate a fresh id and register a continuation for it.
    pub fn park(&mut self) -> Parked<T> {
        let id = self.allocate();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, tx);
        Parked { id, rx }
    }

    /// Fire and remove the continuation for `id`. Unknown ids model a late or
    /// duplicate response: they are logged and ignored.
    pub fn resolve(&mut self, id: CorrelationId, value: T) -> bool {
        let Some(continuation) = self.entries.remove(&id) else {
            tracing::warn!(
                registry = self.label,
                error = %RelayError::CorrelationMismatch { id },
                "response discarded"
            );
            return false;
        };
        if continuation.send(Resolution::Value(value)).is_err() {
            tracing::debug!(
                registry = self.label,
                id = id,
                "correlation resolved after its caller went away"
            );
        }
        true
    }

    /// Wake every pending caller with `Cancelled`. Returns how many were woken.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, continuation) in self.entries.drain() {
            let _ = continuation.send(Resolution::Cancelled);
        }
        if count > 0 {
            tracing::debug!(
                registry = self.label,
                cancelled = count,
                "cancelled pending correlations"
            );
        }
        count
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn pending(&self) -> Vec<CorrelationId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ids_are_unique_and_increasing() {
        let mut registry = CorrelationRegistry::<String>::new("test");
        let ids: Vec<_> = (0..5).map(|_| registry.allocate()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = CorrelationRegistry::<String>::new("test");
        let id = registry.allocate();
        let (tx, _rx) = oneshot::channel();
        registry.register(id, tx).expect("first registration");
        let (tx, _rx) = oneshot::channel();
        assert_eq!(
            registry.register(id, tx),
            Err(CorrelationError::Duplicate(id))
        );
    }

    #[test]
    fn externally_registered_ids_are_never_reallocated() {
        let mut registry = CorrelationRegistry::<String>::new("test");
        let (tx, _rx) = oneshot::channel();
        registry.register(7, tx).expect("register");
        assert_eq!(registry.allocate(), 8);
    }

    #[tokio::test]
    async fn resolve_fires_the_matching_continuation_once() {
        let mut registry = CorrelationRegistry::new("test");
        let first = registry.park();
        let second = registry.park();

        // Out-of-order resolution is matched by id, not arrival order.
        assert!(registry.resolve(second.id(), "b".to_string()));
        assert!(registry.resolve(first.id(), "a".to_string()));
        assert!(!registry.resolve(first.id(), "again".to_string()));

        assert_eq!(first.wait().await, Resolution::Value("a".to_string()));
        assert_eq!(second.wait().await, Resolution::Value("b".to_string()));
        assert!(registry.is_empty());
    }

    #[test]
    fn resolving_an_unknown_id_is_a_no_op() {
        let mut registry = CorrelationRegistry::<String>::new("test");
        assert!(!registry.resolve(42, "late".to_string()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancel_all_wakes_every_parked_caller() {
        let mut registry = CorrelationRegistry::<String>::new("test");
        let parked: Vec<_> = (0..3).map(|_| registry.park()).collect();
        assert_eq!(registry.pending(), vec![1, 2, 3]);

        assert_eq!(registry.cancel_all(), 3);
        assert!(registry.pending().is_empty());
        for caller in parked {
            assert_eq!(caller.wait().await, Resolution::Cancelled);
        }
    }

    #[tokio::test]
    async fn dropping_the_registry_cancels_waiters() {
        let mut registry = CorrelationRegistry::<String>::new("test");
        let parked = registry.park();
        drop(registry);
        assert_eq!(parked.wait().await, Resolution::Cancelled);
    }
}
