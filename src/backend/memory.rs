//! In-memory reference backend.
//!
//! Keeps every object, open transaction and listing cursor in a single
//! locked table. Useful as the demo daemon's engine and as the concrete
//! backend behind the channel tests; a durable cache would live in its own
//! crate and only has to satisfy [`CacheBackend`].
use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

use super::registry::{BackendFactory, BackendOptions};
use super::{CacheBackend, CacheInfo, Capabilities, ObjectInfo, ObjectType};
use crate::hash::ObjectId;
use crate::protocol::Status;

const DEFAULT_CAPACITY: u64 = 1 << 30;

struct Object {
    data: Vec<u8>,
    object_type: ObjectType,
    refcount: i64,
    pinned: bool,
    description: String,
}

struct OpenTxn {
    id: ObjectId,
    info: ObjectInfo,
    data: Vec<u8>,
}

struct ListingCursor {
    items: Vec<ObjectInfo>,
    pos: usize,
}

#[derive(Default)]
struct State {
    objects: HashMap<ObjectId, Object>,
    txns: HashMap<u64, OpenTxn>,
    listings: HashMap<u64, ListingCursor>,
}

impl State {
    fn used_bytes(&self) -> u64 {
        self.objects.values().map(|obj| obj.data.len() as u64).sum()
    }

    fn pinned_bytes(&self) -> u64 {
        self.objects
            .values()
            .filter(|obj| obj.pinned)
            .map(|obj| obj.data.len() as u64)
            .sum()
    }

    /// Drops unpinned, unreferenced objects until at most `target` bytes are
    /// used. Volatile objects go first.
    fn evict_to(&mut self, target: u64) -> u64 {
        let mut used = self.used_bytes();
        for round in [ObjectType::Volatile, ObjectType::Regular, ObjectType::Catalog] {
            if used <= target {
                break;
            }
            let victims: Vec<ObjectId> = self
                .objects
                .iter()
                .filter(|(_, obj)| obj.object_type == round && obj.refcount <= 0 && !obj.pinned)
                .map(|(id, _)| *id)
                .collect();
            for id in victims {
                if used <= target {
                    break;
                }
                if let Some(evicted) = self.objects.remove(&id) {
                    used -= evicted.data.len() as u64;
                    debug!("evicted {id} ({} bytes)", evicted.data.len());
                }
            }
        }
        used
    }
}

/// A capacity-bounded object cache living entirely on the heap.
pub struct MemoryBackend {
    capacity: u64,
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(State::default()),
        }
    }
}

impl CacheBackend for MemoryBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn change_refcount(&self, id: &ObjectId, change_by: i64) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        let object = state.objects.get_mut(id).ok_or(Status::NoEntry)?;
        let changed = object.refcount + change_by;
        if changed < 0 {
            return Err(Status::BadCount);
        }
        object.refcount = changed;
        Ok(())
    }

    fn object_info(&self, id: &ObjectId) -> Result<ObjectInfo, Status> {
        let state = self.state.lock().unwrap();
        let object = state.objects.get(id).ok_or(Status::NoEntry)?;
        Ok(ObjectInfo {
            id: *id,
            object_type: object.object_type,
            size: Some(object.data.len() as u64),
            pinned: object.pinned,
            description: object.description.clone(),
        })
    }

    fn pread(&self, id: &ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize, Status> {
        let state = self.state.lock().unwrap();
        let object = state.objects.get(id).ok_or(Status::NoEntry)?;
        let len = object.data.len() as u64;
        if offset > len {
            return Err(Status::OutOfBounds);
        }
        let available = (len - offset) as usize;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&object.data[offset as usize..offset as usize + n]);
        Ok(n)
    }

    fn start_txn(&self, id: &ObjectId, txn_id: u64, info: ObjectInfo) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        let data = match info.size {
            Some(expected) => Vec::with_capacity(expected.min(self.capacity) as usize),
            None => Vec::new(),
        };
        state.txns.insert(txn_id, OpenTxn { id: *id, info, data });
        Ok(())
    }

    fn write_txn(&self, txn_id: u64, data: &[u8]) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        let txn = state.txns.get_mut(&txn_id).ok_or(Status::NoEntry)?;
        if txn.data.len() as u64 + data.len() as u64 > self.capacity {
            return Err(Status::NoSpace);
        }
        txn.data.extend_from_slice(data);
        Ok(())
    }

    fn commit_txn(&self, txn_id: u64) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        let txn = state.txns.remove(&txn_id).ok_or(Status::NoEntry)?;

        if state.objects.contains_key(&txn.id) {
            // Content-addressed and immutable: a re-store of the same object
            // only takes another reference.
            if let Some(object) = state.objects.get_mut(&txn.id) {
                object.refcount += 1;
            }
            return Ok(());
        }

        let incoming = txn.data.len() as u64;
        if incoming > self.capacity {
            return Err(Status::NoSpace);
        }
        if state.used_bytes() + incoming > self.capacity {
            let used = state.evict_to(self.capacity - incoming);
            if used + incoming > self.capacity {
                return Err(Status::NoSpace);
            }
        }

        let pinned = txn.info.object_type == ObjectType::Pinned;
        state.objects.insert(
            txn.id,
            Object {
                data: txn.data,
                object_type: txn.info.object_type,
                refcount: 1,
                pinned,
                description: txn.info.description,
            },
        );
        Ok(())
    }

    fn abort_txn(&self, txn_id: u64) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        state.txns.remove(&txn_id).ok_or(Status::NoEntry)?;
        Ok(())
    }

    fn info(&self) -> Result<CacheInfo, Status> {
        let state = self.state.lock().unwrap();
        Ok(CacheInfo {
            size_bytes: self.capacity,
            used_bytes: state.used_bytes(),
            pinned_bytes: state.pinned_bytes(),
            no_shrink: false,
        })
    }

    fn shrink(&self, shrink_to: u64) -> Result<u64, Status> {
        let mut state = self.state.lock().unwrap();
        let used = state.evict_to(shrink_to);
        if used > shrink_to {
            return Err(Status::NoSpace);
        }
        Ok(used)
    }

    fn listing_begin(&self, listing_id: u64, object_type: ObjectType) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        let items: Vec<ObjectInfo> = state
            .objects
            .iter()
            .filter(|(_, obj)| obj.object_type == object_type)
            .map(|(id, obj)| ObjectInfo {
                id: *id,
                object_type: obj.object_type,
                size: Some(obj.data.len() as u64),
                pinned: obj.pinned,
                description: obj.description.clone(),
            })
            .collect();
        state
            .listings
            .insert(listing_id, ListingCursor { items, pos: 0 });
        Ok(())
    }

    fn listing_next(&self, listing_id: u64) -> Result<Option<ObjectInfo>, Status> {
        let mut state = self.state.lock().unwrap();
        let cursor = state.listings.get_mut(&listing_id).ok_or(Status::NoEntry)?;
        if cursor.pos >= cursor.items.len() {
            return Ok(None);
        }
        let item = cursor.items[cursor.pos].clone();
        cursor.pos += 1;
        Ok(Some(item))
    }

    fn listing_end(&self, listing_id: u64) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        state.listings.remove(&listing_id).ok_or(Status::NoEntry)?;
        Ok(())
    }
}

/// Registers the in-memory backend under the `memory` tag.
pub struct MemoryBackendFactory;

impl BackendFactory for MemoryBackendFactory {
    fn tag(&self) -> &'static str {
        "memory"
    }

    fn description(&self) -> &'static str {
        "in-memory object cache"
    }

    fn construct(&self, options: &BackendOptions) -> Option<Box<dyn CacheBackend>> {
        let capacity = match options.get("capacity") {
            Some(raw) => raw.parse::<u64>().ok()?,
            None => DEFAULT_CAPACITY,
        };
        Some(Box::new(MemoryBackend::new(capacity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;

    fn object_id(fill: u8) -> ObjectId {
        ObjectId::new(HashAlgorithm::Sha1, &[fill; 20]).unwrap()
    }

    fn store(backend: &MemoryBackend, txn_id: u64, id: ObjectId, data: &[u8]) {
        store_typed(backend, txn_id, id, data, ObjectType::Regular);
    }

    fn store_typed(
        backend: &MemoryBackend,
        txn_id: u64,
        id: ObjectId,
        data: &[u8],
        object_type: ObjectType,
    ) {
        let mut info = ObjectInfo::new(id);
        info.object_type = object_type;
        info.size = Some(data.len() as u64);
        backend.start_txn(&id, txn_id, info).unwrap();
        backend.write_txn(txn_id, data).unwrap();
        backend.commit_txn(txn_id).unwrap();
    }

    #[test]
    fn store_then_read_round_trip() {
        let backend = MemoryBackend::new(1024);
        let id = object_id(1);
        store(&backend, 1, id, b"hello quarry");

        let mut buf = [0u8; 5];
        let n = backend.pread(&id, 6, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"quarr");

        let info = backend.object_info(&id).unwrap();
        assert_eq!(info.size, Some(12));
    }

    #[test]
    fn pread_beyond_end_is_out_of_bounds() {
        let backend = MemoryBackend::new(1024);
        let id = object_id(1);
        store(&backend, 1, id, b"abc");

        let mut buf = [0u8; 4];
        assert_eq!(backend.pread(&id, 4, &mut buf), Err(Status::OutOfBounds));
    }

    #[test]
    fn refcount_may_not_drop_below_zero() {
        let backend = MemoryBackend::new(1024);
        let id = object_id(2);
        store(&backend, 1, id, b"x");

        backend.change_refcount(&id, -1).unwrap();
        assert_eq!(backend.change_refcount(&id, -1), Err(Status::BadCount));
        assert_eq!(
            backend.change_refcount(&object_id(9), 1),
            Err(Status::NoEntry)
        );
    }

    #[test]
    fn abort_discards_transaction() {
        let backend = MemoryBackend::new(1024);
        let id = object_id(3);
        backend.start_txn(&id, 7, ObjectInfo::new(id)).unwrap();
        backend.write_txn(7, b"junk").unwrap();
        backend.abort_txn(7).unwrap();

        assert_eq!(backend.object_info(&id), Err(Status::NoEntry));
        assert_eq!(backend.abort_txn(7), Err(Status::NoEntry));
    }

    #[test]
    fn shrink_evicts_only_unreferenced_objects() {
        let backend = MemoryBackend::new(1024);
        store(&backend, 1, object_id(1), &[0u8; 100]);
        store(&backend, 2, object_id(2), &[0u8; 100]);
        backend.change_refcount(&object_id(2), -1).unwrap();

        let used = backend.shrink(150).unwrap();
        assert_eq!(used, 100);
        assert!(backend.object_info(&object_id(1)).is_ok());
        assert_eq!(backend.object_info(&object_id(2)), Err(Status::NoEntry));

        // The remaining object is still referenced.
        assert_eq!(backend.shrink(50), Err(Status::NoSpace));
    }

    #[test]
    fn commit_evicts_to_make_room() {
        let backend = MemoryBackend::new(256);
        store(&backend, 1, object_id(1), &[0u8; 200]);
        backend.change_refcount(&object_id(1), -1).unwrap();

        store(&backend, 2, object_id(2), &[0u8; 200]);
        assert_eq!(backend.object_info(&object_id(1)), Err(Status::NoEntry));
        assert!(backend.object_info(&object_id(2)).is_ok());
    }

    #[test]
    fn restore_of_existing_object_takes_a_reference() {
        let backend = MemoryBackend::new(1024);
        let id = object_id(4);
        store(&backend, 1, id, b"same");
        store(&backend, 2, id, b"same");

        backend.change_refcount(&id, -2).unwrap();
        assert_eq!(backend.change_refcount(&id, -1), Err(Status::BadCount));
    }

    #[test]
    fn listing_filters_by_object_type() {
        let backend = MemoryBackend::new(4096);
        store_typed(&backend, 1, object_id(1), b"r", ObjectType::Regular);
        store_typed(&backend, 2, object_id(2), b"c", ObjectType::Catalog);
        store_typed(&backend, 3, object_id(3), b"r2", ObjectType::Regular);

        backend.listing_begin(5, ObjectType::Regular).unwrap();
        let mut seen = Vec::new();
        while let Some(item) = backend.listing_next(5).unwrap() {
            seen.push(item.id);
        }
        backend.listing_end(5).unwrap();

        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&object_id(1)));
        assert!(seen.contains(&object_id(3)));
        assert_eq!(backend.listing_next(5), Err(Status::NoEntry));
    }

    #[test]
    fn factory_parses_capacity() {
        let factory = MemoryBackendFactory;
        let mut options = BackendOptions::new();
        options.insert("capacity".to_string(), "4096".to_string());
        assert!(factory.construct(&options).is_some());

        options.insert("capacity".to_string(), "not-a-number".to_string());
        assert!(factory.construct(&options).is_none());
    }
}
