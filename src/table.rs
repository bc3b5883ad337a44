//! Address-indexed probe table.
//!
//! Records live in a fixed-capacity arena addressed by index. Each bucket
//! head and each record's hash link is an index stored in an atomic, so the
//! trap dispatcher can walk a chain without taking any lock:
//!
//! - insert fills a vacant slot completely, then publishes it with a single
//!   release store of the bucket head;
//! - remove splices the slot out with a single release store into its
//!   predecessor (or the bucket head), leaving the slot's own link intact so
//!   a reader parked on it still reaches the rest of the chain.
//!
//! A slot can be recycled while a reader is still looking at it, so every
//! rewrite of a slot is bracketed by a per-slot sequence counter. A reader
//! only trusts fields read between two equal, even counter values; a slot
//! caught mid-rewrite makes the walk restart from the bucket head.
//!
//! Everything the dispatcher does not need (module binding, saved byte,
//! lifecycle state, function chain link) lives in the cold half, guarded by a
//! spin lock that is never taken from trap context.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering, fence};
use spin::Mutex;

use crate::arch::Emulate;
use crate::engine::{ProbeId, ProbeKind};
use crate::host::ModuleId;

/// End-of-chain marker.
const NIL: u32 = u32::MAX;

/// Walk restarts allowed when a slot is caught mid-rewrite.
const LOOKUP_RETRIES: usize = 16;

/// Error types for probe table operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bucket count is zero or not a power of two.
    InvalidSize(usize),
    /// All record slots are in use.
    Full,
    /// Handle does not name a reserved or live record.
    StaleHandle,
    /// Address 0 cannot be instrumented.
    NullAddress,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidSize(n) => write!(f, "Probe table size must be a power of two, got {}", n),
            Self::Full => write!(f, "Probe table is full"),
            Self::StaleHandle => write!(f, "Stale probe handle"),
            Self::NullAddress => write!(f, "Cannot probe address 0"),
        }
    }
}

impl core::error::Error for Error {}

/// Generation-tagged reference to a record slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProbeHandle {
    index: u32,
    tag: u32,
}

impl ProbeHandle {
    /// Slot index.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Patch state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Original byte in place.
    Unpatched,
    /// Trap byte installed.
    Enabled,
    /// Original byte restored while the probe stays logically enabled.
    Suspended,
}

/// One instrumentation site.
#[derive(Debug, Clone)]
pub struct ProbeRecord {
    /// Owning module.
    pub module: ModuleId,
    /// Function name.
    pub name: String,
    /// Patch address.
    pub addr: usize,
    /// Entry or return site.
    pub kind: ProbeKind,
    /// Byte found at `addr` before the first patch.
    pub saved: u8,
    /// Trap byte to install.
    pub patch_val: u8,
    /// 0 for entry sites, distance from function start for return sites.
    pub roffset: usize,
    /// Engine probe shared by every record of the function.
    pub id: ProbeId,
    /// Module load generation observed at scan time.
    pub load_gen: u64,
    /// Index of the function in the module's symbol list.
    pub symndx: usize,
    /// Instruction replaced by the trap.
    pub emulate: Emulate,
    /// Patch state.
    pub state: ProbeState,
    /// Next record of the same function.
    pub next: Option<ProbeHandle>,
}

/// What the dispatcher learns from a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHit {
    pub id: ProbeId,
    pub roffset: usize,
    pub emulate: Emulate,
}

/// Trap-visible half of a record.
struct Slot {
    /// Odd while the slot is being rewritten.
    seq: AtomicU32,
    /// Patch address, 0 while vacant.
    addr: AtomicUsize,
    hash_next: AtomicU32,
    roffset: AtomicU32,
    id: AtomicU32,
    emulate: AtomicU8,
}

/// Consistent copy of a slot's fields.
struct SlotView {
    addr: usize,
    next: u32,
    roffset: u32,
    id: u32,
    emulate: u8,
}

impl Slot {
    fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            addr: AtomicUsize::new(0),
            hash_next: AtomicU32::new(NIL),
            roffset: AtomicU32::new(0),
            id: AtomicU32::new(0),
            emulate: AtomicU8::new(0),
        }
    }

    /// Snapshot the slot, or `None` if a writer touched it meanwhile.
    #[inline]
    fn read(&self) -> Option<SlotView> {
        let seq = self.seq.load(Ordering::Acquire);
        if seq & 1 != 0 {
            return None;
        }
        let view = SlotView {
            addr: self.addr.load(Ordering::Relaxed),
            next: self.hash_next.load(Ordering::Relaxed),
            roffset: self.roffset.load(Ordering::Relaxed),
            id: self.id.load(Ordering::Relaxed),
            emulate: self.emulate.load(Ordering::Relaxed),
        };
        fence(Ordering::Acquire);
        (self.seq.load(Ordering::Relaxed) == seq).then_some(view)
    }

    /// Rewrite the slot's fields. Callers hold the arena lock.
    fn write<F: FnOnce(&Slot)>(&self, f: F) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        f(self);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }
}

enum SlotState {
    Free,
    Reserved,
    Live(ProbeRecord),
}

/// Cold half: record metadata and slot allocation.
struct Arena {
    states: Vec<SlotState>,
    tags: Vec<u32>,
    /// Recycled slots, reused oldest first.
    free: VecDeque<u32>,
    live: usize,
}

/// Hash table of probe records keyed by patch address.
pub struct ProbeTable {
    buckets: Box<[AtomicU32]>,
    mask: usize,
    shift: u32,
    slots: Box<[Slot]>,
    arena: Mutex<Arena>,
}

impl ProbeTable {
    /// Allocate a table with `nbuckets` chains and room for `capacity`
    /// records. Bucket index is `(addr >> shift) & (nbuckets - 1)`.
    pub fn new(nbuckets: usize, shift: u32, capacity: usize) -> Result<Self, Error> {
        if nbuckets == 0 || !nbuckets.is_power_of_two() {
            return Err(Error::InvalidSize(nbuckets));
        }
        let capacity = capacity.min(NIL as usize);

        let buckets = (0..nbuckets).map(|_| AtomicU32::new(NIL)).collect::<Vec<_>>();
        let slots = (0..capacity).map(|_| Slot::new()).collect::<Vec<_>>();

        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            mask: nbuckets - 1,
            shift,
            slots: slots.into_boxed_slice(),
            arena: Mutex::new(Arena {
                states: Vec::new(),
                tags: Vec::new(),
                free: VecDeque::new(),
                live: 0,
            }),
        })
    }

    /// Bucket index of `addr`.
    #[inline]
    pub fn bucket_of(&self, addr: usize) -> usize {
        (addr >> self.shift) & self.mask
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of published records.
    pub fn len(&self) -> usize {
        self.arena.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim a vacant slot. The handle must be passed to
    /// [`publish`](Self::publish) or [`release`](Self::release).
    pub fn reserve(&self) -> Result<ProbeHandle, Error> {
        let mut arena = self.arena.lock();
        let index = match arena.free.pop_front() {
            Some(index) => index,
            None if arena.states.len() < self.slots.len() => {
                arena.states.push(SlotState::Free);
                arena.tags.push(0);
                (arena.states.len() - 1) as u32
            }
            None => return Err(Error::Full),
        };

        let i = index as usize;
        arena.states[i] = SlotState::Reserved;
        arena.tags[i] = arena.tags[i].wrapping_add(1);
        Ok(ProbeHandle {
            index,
            tag: arena.tags[i],
        })
    }

    /// Return a reserved slot that will not be published.
    pub fn release(&self, handle: ProbeHandle) {
        let mut arena = self.arena.lock();
        let i = handle.index();
        if arena.tags.get(i) == Some(&handle.tag) && matches!(arena.states[i], SlotState::Reserved) {
            arena.states[i] = SlotState::Free;
            arena.free.push_back(handle.index);
        }
    }

    /// Make a reserved record visible to lookups by prepending it to its
    /// bucket chain.
    pub fn publish(&self, handle: ProbeHandle, record: ProbeRecord) -> Result<(), Error> {
        if record.addr == 0 {
            return Err(Error::NullAddress);
        }

        let mut arena = self.arena.lock();
        let i = handle.index();
        if arena.tags.get(i) != Some(&handle.tag) || !matches!(arena.states[i], SlotState::Reserved) {
            return Err(Error::StaleHandle);
        }

        let head = &self.buckets[self.bucket_of(record.addr)];
        self.slots[i].write(|slot| {
            slot.roffset.store(record.roffset as u32, Ordering::Relaxed);
            slot.id.store(record.id.0, Ordering::Relaxed);
            slot.emulate.store(record.emulate.code(), Ordering::Relaxed);
            slot.hash_next.store(head.load(Ordering::Acquire), Ordering::Relaxed);
            slot.addr.store(record.addr, Ordering::Relaxed);
        });
        head.store(handle.index, Ordering::Release);

        arena.states[i] = SlotState::Live(record);
        arena.live += 1;
        Ok(())
    }

    /// Find the record patched at `addr`.
    ///
    /// Lock-free and allocation-free; safe from trap context. A lookup
    /// racing with removal or slot reuse may miss, but every field of a hit
    /// comes from one record published at `addr`.
    pub fn lookup(&self, addr: usize) -> Option<ProbeHit> {
        if addr == 0 {
            return None;
        }

        let head = &self.buckets[self.bucket_of(addr)];
        let mut idx = head.load(Ordering::Acquire);
        let mut retries = LOOKUP_RETRIES;
        // A chain can never be longer than the arena.
        let mut steps = self.slots.len();
        while steps > 0 {
            if idx == NIL {
                return None;
            }
            let slot = self.slots.get(idx as usize)?;
            match slot.read() {
                Some(view) if view.addr == addr => {
                    return Some(ProbeHit {
                        id: ProbeId(view.id),
                        roffset: view.roffset as usize,
                        emulate: Emulate::from_code(view.emulate)?,
                    });
                }
                Some(view) => {
                    idx = view.next;
                    steps -= 1;
                }
                None => {
                    retries = retries.checked_sub(1)?;
                    idx = head.load(Ordering::Acquire);
                    steps = self.slots.len();
                }
            }
        }
        None
    }

    /// Whether a record is published at `addr`.
    pub fn contains(&self, addr: usize) -> bool {
        self.lookup(addr).is_some()
    }

    /// Number of records chained in `bucket`.
    pub fn chain_len(&self, bucket: usize) -> usize {
        let _arena = self.arena.lock();
        let mut n = 0;
        let mut idx = self.buckets[bucket & self.mask].load(Ordering::Acquire);
        while idx != NIL {
            n += 1;
            idx = self.slots[idx as usize].hash_next.load(Ordering::Acquire);
        }
        n
    }

    /// Splice a record out of its bucket and free its slot.
    ///
    /// Returns `None` if the handle is stale (already removed).
    pub fn remove(&self, handle: ProbeHandle) -> Option<ProbeRecord> {
        let mut arena = self.arena.lock();
        let i = handle.index();
        if arena.tags.get(i) != Some(&handle.tag) || !matches!(arena.states[i], SlotState::Live(_)) {
            return None;
        }

        let addr = self.slots[i].addr.load(Ordering::Relaxed);
        let head = &self.buckets[self.bucket_of(addr)];
        let next = self.slots[i].hash_next.load(Ordering::Acquire);

        let mut prev = NIL;
        let mut cur = head.load(Ordering::Acquire);
        while cur != NIL && cur != handle.index {
            prev = cur;
            cur = self.slots[cur as usize].hash_next.load(Ordering::Acquire);
        }

        if cur == NIL {
            warn!("fbt: record {} at {:#x} missing from its bucket", i, addr);
        } else if prev == NIL {
            head.store(next, Ordering::Release);
        } else {
            self.slots[prev as usize].hash_next.store(next, Ordering::Release);
        }
        self.slots[i].write(|slot| slot.addr.store(0, Ordering::Relaxed));

        let state = core::mem::replace(&mut arena.states[i], SlotState::Free);
        arena.free.push_back(handle.index);
        arena.live -= 1;
        match state {
            SlotState::Live(record) => Some(record),
            _ => None,
        }
    }

    /// Snapshot of a live record.
    pub fn get(&self, handle: ProbeHandle) -> Option<ProbeRecord> {
        let arena = self.arena.lock();
        match arena.states.get(handle.index()) {
            Some(SlotState::Live(record)) if arena.tags[handle.index()] == handle.tag => {
                Some(record.clone())
            }
            _ => None,
        }
    }

    /// Mutate the cold fields of a live record. Returns `false` for a stale
    /// handle.
    pub fn update<F: FnOnce(&mut ProbeRecord)>(&self, handle: ProbeHandle, f: F) -> bool {
        let mut arena = self.arena.lock();
        if arena.tags.get(handle.index()) != Some(&handle.tag) {
            return false;
        }
        match arena.states.get_mut(handle.index()) {
            Some(SlotState::Live(record)) => {
                f(record);
                true
            }
            _ => false,
        }
    }

    /// Handles of the function chain starting at `head`, in link order.
    pub fn chain(&self, head: ProbeHandle) -> Vec<ProbeHandle> {
        let arena = self.arena.lock();
        let mut out = Vec::new();
        let mut cur = Some(head);
        while let Some(handle) = cur {
            let i = handle.index();
            match arena.states.get(i) {
                Some(SlotState::Live(record)) if arena.tags[i] == handle.tag => {
                    out.push(handle);
                    cur = record.next;
                }
                _ => break,
            }
            if out.len() > self.slots.len() {
                break;
            }
        }
        out
    }

    /// Snapshot of every live record.
    pub fn records(&self) -> Vec<(ProbeHandle, ProbeRecord)> {
        let arena = self.arena.lock();
        arena
            .states
            .iter()
            .enumerate()
            .filter_map(|(i, state)| match state {
                SlotState::Live(record) => Some((
                    ProbeHandle {
                        index: i as u32,
                        tag: arena.tags[i],
                    },
                    record.clone(),
                )),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn record(addr: usize) -> ProbeRecord {
        ProbeRecord {
            module: ModuleId(1),
            name: "f".to_string(),
            addr,
            kind: ProbeKind::Entry,
            saved: 0x55,
            patch_val: 0xcc,
            roffset: 0,
            id: ProbeId(7),
            load_gen: 0,
            symndx: 1,
            emulate: Emulate::PushFramePointer,
            state: ProbeState::Unpatched,
            next: None,
        }
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        assert_eq!(ProbeTable::new(3, 4, 8).err(), Some(Error::InvalidSize(3)));
        assert_eq!(ProbeTable::new(0, 4, 8).err(), Some(Error::InvalidSize(0)));
    }

    #[test]
    fn test_insert_is_at_chain_head() {
        let table = ProbeTable::new(4, 4, 8).unwrap();
        let a = table.reserve().unwrap();
        table.publish(a, record(0x1000)).unwrap();
        let b = table.reserve().unwrap();
        table.publish(b, record(0x1040)).unwrap();

        assert_eq!(table.bucket_of(0x1000), table.bucket_of(0x1040));
        let bucket = table.bucket_of(0x1000);
        assert_eq!(table.buckets[bucket].load(Ordering::Relaxed), b.index);
        assert_eq!(table.chain_len(bucket), 2);
    }

    #[test]
    fn test_removed_slot_gets_new_tag() {
        let table = ProbeTable::new(4, 4, 1).unwrap();
        let a = table.reserve().unwrap();
        table.publish(a, record(0x1000)).unwrap();
        assert!(table.reserve().is_err());

        assert!(table.remove(a).is_some());
        let b = table.reserve().unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(table.remove(a).is_none());
        assert_eq!(table.publish(a, record(0x2000)), Err(Error::StaleHandle));
    }

    #[test]
    fn test_release_returns_slot() {
        let table = ProbeTable::new(4, 4, 1).unwrap();
        let a = table.reserve().unwrap();
        table.release(a);
        assert!(table.reserve().is_ok());
    }

    #[test]
    fn test_slot_mid_rewrite_is_never_reported() {
        let table = ProbeTable::new(4, 4, 2).unwrap();
        let a = table.reserve().unwrap();
        table.publish(a, record(0x1000)).unwrap();

        // a writer stalled halfway through recycling the slot
        let slot = &table.slots[a.index()];
        let seq = slot.seq.load(Ordering::Relaxed);
        slot.seq.store(seq + 1, Ordering::Relaxed);
        slot.id.store(99, Ordering::Relaxed);
        slot.emulate.store(Emulate::Ret.code(), Ordering::Relaxed);
        assert_eq!(table.lookup(0x1000), None);

        slot.seq.store(seq + 2, Ordering::Release);
        let hit = table.lookup(0x1000).unwrap();
        assert_eq!(hit.id, ProbeId(99));
        assert_eq!(hit.emulate, Emulate::Ret);
    }

    #[test]
    fn test_rewrites_bump_sequence_to_even() {
        let table = ProbeTable::new(4, 4, 1).unwrap();
        let a = table.reserve().unwrap();
        table.publish(a, record(0x1000)).unwrap();
        assert_eq!(table.slots[a.index()].seq.load(Ordering::Relaxed), 2);
        table.remove(a);
        assert_eq!(table.slots[a.index()].seq.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_null_address_rejected() {
        let table = ProbeTable::new(4, 4, 1).unwrap();
        let a = table.reserve().unwrap();
        assert_eq!(table.publish(a, record(0)), Err(Error::NullAddress));
        assert!(table.lookup(0).is_none());
    }
}
