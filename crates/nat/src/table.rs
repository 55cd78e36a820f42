use std::net::Ipv4Addr;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::entry::NatTableEntry;
use crate::error::{NatError, NatResult};

type InternalKey = (Ipv4Addr, u16);
type ExternalKey = (Ipv4Addr, u16);

/// The NAT mapping table: a single arena of entries with two independent
/// indices into it (by internal key and by external key), rather than two
/// separate maps each holding its own copy of the entry. Two copies would
/// let the internal and external views of the same mapping drift apart
/// under concurrent refresh/remove; one arena with two indices makes that
/// class of bug structurally impossible, since there is exactly one place
/// an entry's fields live.
///
/// Wrapped in a `parking_lot::RwLock` at the field level (not the whole
/// struct) the way turn-rs's `Table<K, V>` wraps its inner `HashMap`,
/// because the controller is single-writer-per-forwarder but reads (MAP
/// refresh lookups, ARP/flow-removed handling) can come from any of the
/// forwarder's tasks.
pub struct NatTable {
    arena: RwLock<Vec<Option<NatTableEntry>>>,
    internal_index: RwLock<AHashMap<InternalKey, usize>>,
    external_index: RwLock<AHashMap<ExternalKey, usize>>,
    free_slots: RwLock<Vec<usize>>,
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NatTable {
    pub fn new() -> Self {
        NatTable {
            arena: RwLock::new(Vec::new()),
            internal_index: RwLock::new(AHashMap::new()),
            external_index: RwLock::new(AHashMap::new()),
            free_slots: RwLock::new(Vec::new()),
        }
    }

    /// Insert a new mapping. Fails with [`NatError::AlreadyMapped`] if the
    /// internal key is already bound, or [`NatError::NoResources`] if the
    /// external key the caller picked (normally via
    /// [`crate::allocator::AllocatorState::allocate`]) is already taken.
    /// A well-behaved caller never reaches this with a colliding external
    /// key, but the table does not trust that.
    pub fn add_entry(&self, entry: NatTableEntry) -> NatResult<()> {
        let internal_key = entry.internal_key();
        let external_key = entry.external_key();

        let mut internal_index = self.internal_index.write();
        let mut external_index = self.external_index.write();
        if internal_index.contains_key(&internal_key) {
            return Err(NatError::AlreadyMapped);
        }
        if external_index.contains_key(&external_key) {
            return Err(NatError::NoResources);
        }

        let mut arena = self.arena.write();
        let slot = match self.free_slots.write().pop() {
            Some(slot) => {
                arena[slot] = Some(entry);
                slot
            }
            None => {
                arena.push(Some(entry));
                arena.len() - 1
            }
        };

        internal_index.insert(internal_key, slot);
        external_index.insert(external_key, slot);
        Ok(())
    }

    pub fn find_entry(&self, key: InternalKey) -> Option<NatTableEntry> {
        let slot = *self.internal_index.read().get(&key)?;
        self.arena.read()[slot]
    }

    pub fn find_entry_by_external(&self, key: ExternalKey) -> Option<NatTableEntry> {
        let slot = *self.external_index.read().get(&key)?;
        self.arena.read()[slot]
    }

    pub fn is_external_taken(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.external_index.read().contains_key(&(ip, port))
    }

    /// Refresh an existing mapping's lifetime/creation timestamp in place.
    /// Does not move the entry between slots, so both indices stay valid.
    pub fn update_entry_lifetime(
        &self,
        key: InternalKey,
        lifetime: u32,
        now: u64,
    ) -> NatResult<NatTableEntry> {
        let internal_index = self.internal_index.read();
        let slot = *internal_index.get(&key).ok_or(NatError::NotMapped)?;
        drop(internal_index);

        let mut arena = self.arena.write();
        let entry = arena[slot].as_mut().ok_or(NatError::NotMapped)?;
        entry.lifetime = lifetime;
        entry.created_at = now;
        Ok(*entry)
    }

    pub fn remove_entry(&self, key: InternalKey) -> NatResult<NatTableEntry> {
        let mut internal_index = self.internal_index.write();
        let slot = internal_index.remove(&key).ok_or(NatError::NotMapped)?;

        let mut arena = self.arena.write();
        let entry = arena[slot].take().ok_or(NatError::NotMapped)?;
        self.external_index.write().remove(&entry.external_key());
        self.free_slots.write().push(slot);
        Ok(entry)
    }

    pub fn remove_entry_by_external(&self, key: ExternalKey) -> NatResult<NatTableEntry> {
        let mut external_index = self.external_index.write();
        let slot = external_index.remove(&key).ok_or(NatError::NotMapped)?;

        let mut arena = self.arena.write();
        let entry = arena[slot].take().ok_or(NatError::NotMapped)?;
        self.internal_index.write().remove(&entry.internal_key());
        self.free_slots.write().push(slot);
        Ok(entry)
    }

    /// Remove and return every entry whose lifetime has elapsed as of
    /// `now`. Called by the controller's idle-expiry sweep (spec.md §4.4).
    pub fn expire_older_than(&self, now: u64) -> Vec<NatTableEntry> {
        let expired_keys: Vec<InternalKey> = self
            .internal_index
            .read()
            .iter()
            .filter_map(|(key, &slot)| {
                let arena = self.arena.read();
                arena[slot].filter(|e| e.is_expired(now)).map(|_| *key)
            })
            .collect();

        expired_keys
            .into_iter()
            .filter_map(|key| self.remove_entry(key).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.internal_index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
