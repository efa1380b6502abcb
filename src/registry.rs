//! Typed subscription bookkeeping.
//!
//! The registry stores type-erased callbacks keyed by [`SubscriptionId`].
//! Every entry remembers the [`TypeId`] of the slot type it was registered
//! with, so typed lookups and removals never confuse two message types that
//! happen to share a name.

use std::{
    any::{Any, TypeId, type_name},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Unique identifier of a subscription or responder registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

struct Entry {
    slot: TypeId,
    seq: u64,
    callback: Arc<dyn Any + Send + Sync>,
}

/// Thread-safe map of subscriptions.
///
/// `C` is the slot type: one concrete callback wrapper per message type.
/// Typed queries walk the whole map and return matches in registration
/// order.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<SubscriptionId, Entry>,
    next_seq: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback and return its id.
    pub fn insert<C: Send + Sync + 'static>(&self, callback: C) -> SubscriptionId {
        let id = SubscriptionId::new();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            id,
            Entry {
                slot: TypeId::of::<C>(),
                seq,
                callback: Arc::new(callback),
            },
        );
        id
    }

    /// Remove a registration of slot type `C`.
    ///
    /// Fails with `SubscriptionTypeMismatch` when `id` belongs to another
    /// slot type (the entry is left in place) and with
    /// `SubscriptionNotFound` when nothing is registered under `id`.
    pub fn remove<C: 'static>(&self, id: SubscriptionId) -> Result<(), Error> {
        let slot = TypeId::of::<C>();
        if self.entries.remove_if(&id, |_, entry| entry.slot == slot).is_some() {
            return Ok(());
        }
        if self.entries.contains_key(&id) {
            Err(Error::subscription_type_mismatch(id, type_name::<C>()))
        } else {
            Err(Error::subscription_not_found(id))
        }
    }

    /// Every callback of slot type `C`, in registration order.
    pub fn callbacks<C: Send + Sync + 'static>(&self) -> Vec<Arc<C>> {
        let slot = TypeId::of::<C>();
        let mut matches: Vec<(u64, Arc<dyn Any + Send + Sync>)> = self
            .entries
            .iter()
            .filter(|entry| entry.slot == slot)
            .map(|entry| (entry.seq, Arc::clone(&entry.callback)))
            .collect();
        matches.sort_unstable_by_key(|(seq, _)| *seq);
        matches
            .into_iter()
            .filter_map(|(_, callback)| callback.downcast::<C>().ok())
            .collect()
    }

    /// The earliest registered callback of slot type `C`.
    pub fn first<C: Send + Sync + 'static>(&self) -> Option<Arc<C>> {
        let slot = TypeId::of::<C>();
        self.entries
            .iter()
            .filter(|entry| entry.slot == slot)
            .min_by_key(|entry| entry.seq)
            .and_then(|entry| Arc::clone(&entry.callback).downcast::<C>().ok())
    }

    /// Number of registrations of slot type `C`.
    pub fn count<C: 'static>(&self) -> usize {
        let slot = TypeId::of::<C>();
        self.entries.iter().filter(|entry| entry.slot == slot).count()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    struct OnOrder(&'static str);
    struct OnInvoice;

    #[test]
    fn callbacks_come_back_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        for name in ["a", "b", "c", "d"] {
            registry.insert(OnOrder(name));
        }
        registry.insert(OnInvoice);

        let names: Vec<_> = registry
            .callbacks::<OnOrder>()
            .iter()
            .map(|cb| cb.0)
            .collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
        assert_eq!(registry.first::<OnOrder>().map(|cb| cb.0), Some("a"));
        assert_eq!(registry.count::<OnInvoice>(), 1);
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn removal_with_the_wrong_type_is_rejected() {
        let registry = SubscriptionRegistry::new();
        let id = registry.insert(OnOrder("a"));

        let err = registry.remove::<OnInvoice>(id).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::SubscriptionTypeMismatch { .. }));
        assert!(registry.contains(id));

        registry.remove::<OnOrder>(id).unwrap();
        assert!(registry.is_empty());

        let err = registry.remove::<OnOrder>(id).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::SubscriptionNotFound(_)));
    }

    #[test]
    fn subscription_ids_serialize_as_plain_uuids() {
        let id = SubscriptionId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.as_uuid().to_string()));
    }
}
