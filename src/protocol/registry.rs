//! Identifier allocation and the in-progress store transaction registry.
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic session, transaction and listing identifiers. Safe to call
/// from any thread.
#[derive(Debug)]
pub struct IdAllocator {
    next_session: AtomicU64,
    next_txn: AtomicU64,
    next_listing: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_session: AtomicU64::new(0),
            next_txn: AtomicU64::new(0),
            // Listing id zero means "not yet assigned" on the wire.
            next_listing: AtomicU64::new(1),
        }
    }

    pub fn next_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_txn(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_listing(&self) -> u64 {
        self.next_listing.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The key a client uses to stream or abort a multi-part store: the session
/// issued at handshake plus the request id the store began with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueRequest {
    pub session_id: u64,
    pub req_id: u64,
}

/// Registry value for one open transaction. `next_part` is the only part
/// number the next store frame may carry; a gap is malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnSlot {
    pub txn_id: u64,
    pub next_part: u32,
}

/// Internally synchronized map from [`UniqueRequest`] to the transaction it
/// addresses.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    slots: Mutex<HashMap<UniqueRequest, TxnSlot>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &UniqueRequest) -> bool {
        self.slots.lock().unwrap().contains_key(key)
    }

    pub fn lookup(&self, key: &UniqueRequest) -> Option<TxnSlot> {
        self.slots.lock().unwrap().get(key).copied()
    }

    pub fn insert(&self, key: UniqueRequest, slot: TxnSlot) {
        self.slots.lock().unwrap().insert(key, slot);
    }

    /// Bumps the expected part number after a successfully written part.
    pub fn advance(&self, key: &UniqueRequest) {
        if let Some(slot) = self.slots.lock().unwrap().get_mut(key) {
            slot.next_part += 1;
        }
    }

    pub fn erase(&self, key: &UniqueRequest) {
        self.slots.lock().unwrap().remove(key);
    }

    pub fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let ids = IdAllocator::new();

        assert_eq!(ids.next_session(), 0);
        assert_eq!(ids.next_session(), 1);
        assert_eq!(ids.next_txn(), 0);
        assert_eq!(ids.next_txn(), 1);
    }

    #[test]
    fn listing_ids_start_at_one() {
        let ids = IdAllocator::new();

        assert_eq!(ids.next_listing(), 1);
        assert_eq!(ids.next_listing(), 2);
    }

    #[test]
    fn registry_lifecycle() {
        let registry = TransactionRegistry::new();
        let key = UniqueRequest {
            session_id: 4,
            req_id: 11,
        };

        assert!(!registry.contains(&key));
        registry.insert(
            key,
            TxnSlot {
                txn_id: 9,
                next_part: 2,
            },
        );
        assert!(registry.contains(&key));
        assert_eq!(registry.lookup(&key).map(|slot| slot.txn_id), Some(9));

        registry.advance(&key);
        assert_eq!(registry.lookup(&key).map(|slot| slot.next_part), Some(3));

        registry.erase(&key);
        assert!(registry.lookup(&key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_empties_the_registry() {
        let registry = TransactionRegistry::new();
        for req_id in 0..4 {
            registry.insert(
                UniqueRequest {
                    session_id: 1,
                    req_id,
                },
                TxnSlot {
                    txn_id: req_id,
                    next_part: 2,
                },
            );
        }

        registry.clear();
        assert!(registry.is_empty());
    }
}
