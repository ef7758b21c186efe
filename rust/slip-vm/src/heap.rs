//! Handle-addressed object heap with a stop-the-world mark-sweep collector.
//!
//! Objects live in an arena of slots addressed by generation-tagged
//! integer handles. Freeing a slot bumps its generation, so a stale
//! handle is detected on access instead of silently reading whatever
//! object reused the slot. Marking walks an explicit worklist seeded
//! from the caller-supplied roots; sweep returns unmarked slots to the
//! free list and clears every survivor's mark bit so the next cycle
//! starts clean.

use std::fmt;

use crate::value::Value;
use crate::vm::VmError;

/// Collection runs when `bytes_allocated` would first exceed this.
const INITIAL_GC_THRESHOLD: usize = 1024;
/// After each collection the threshold becomes `live bytes × this factor`.
const HEAP_GROW_FACTOR: usize = 2;

/// A generation-tagged index into the heap's slot arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub(crate) fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index this handle addresses.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Generation the slot had when this handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}g{}", self.index, self.generation)
    }
}

/// Discriminant for the kind of heap object in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Pair,
}

/// A garbage-collected heap object: a mark bit plus a kind-specific
/// payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    marked: bool,
    payload: Payload,
}

/// Kind-specific object payload.
///
/// Tracing dispatches on this enum: each variant pushes the handles its
/// fields reference onto the mark worklist. A future variant with no
/// reference-valued fields traces nothing and marks only itself, so the
/// kind set extends without touching the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Pair { car: Value, cdr: Value },
}

impl Payload {
    fn trace(&self, worklist: &mut Vec<Handle>) {
        match self {
            Payload::Pair { car, cdr } => {
                if let Value::Obj(h) = car {
                    worklist.push(*h);
                }
                if let Value::Obj(h) = cdr {
                    worklist.push(*h);
                }
            }
        }
    }
}

impl Object {
    /// Kind tag for this object.
    pub fn kind(&self) -> ObjectKind {
        match self.payload {
            Payload::Pair { .. } => ObjectKind::Pair,
        }
    }

    /// The object's payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

/// One arena slot. `object` is `None` while the slot sits on the free
/// list; `generation` counts how many times the slot has been reused.
#[derive(Debug)]
struct Slot {
    generation: u32,
    object: Option<Object>,
}

/// Counters reported by the heap, reset only by constructing a new heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Completed collection cycles.
    pub collections: u64,
    /// Objects freed across all collections.
    pub objects_freed: u64,
}

/// The object heap: slot arena, free list, and allocation accounting.
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Hard cap modeling host-allocator exhaustion. `None` = unlimited.
    byte_limit: Option<usize>,
    stats: GcStats,
}

impl Heap {
    /// Bytes accounted to one allocated object slot.
    pub const OBJECT_SIZE: usize = std::mem::size_of::<Object>();

    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            byte_limit: None,
            stats: GcStats::default(),
        }
    }

    /// Cap the heap at `limit` bytes. Allocations past the cap fail with
    /// `VmError::OutOfMemory` even after a collection has run.
    pub fn set_byte_limit(&mut self, limit: usize) {
        self.byte_limit = Some(limit);
    }

    /// Would allocating `extra` more bytes cross the collection threshold?
    ///
    /// The engine consults this before every allocation and runs a full
    /// collection first when it answers `true`.
    pub fn should_collect(&self, extra: usize) -> bool {
        self.bytes_allocated + extra > self.next_gc
    }

    /// Would allocating `extra` more bytes exceed the hard byte cap?
    pub fn over_limit(&self, extra: usize) -> bool {
        self.byte_limit
            .is_some_and(|limit| self.bytes_allocated + extra > limit)
    }

    /// Allocate a pair object. The new object starts unmarked.
    ///
    /// This does not trigger collection itself; the engine handles the
    /// threshold check so roots are available for marking.
    pub fn alloc_pair(&mut self, car: Value, cdr: Value) -> Result<Handle, VmError> {
        if let Some(limit) = self.byte_limit {
            if self.bytes_allocated + Self::OBJECT_SIZE > limit {
                return Err(VmError::OutOfMemory {
                    requested: Self::OBJECT_SIZE,
                    limit,
                });
            }
        }

        let object = Object {
            marked: false,
            payload: Payload::Pair { car, cdr },
        };

        let index = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize].object = Some(object);
                i
            }
            None => {
                let i = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    object: Some(object),
                });
                i
            }
        };

        self.bytes_allocated += Self::OBJECT_SIZE;
        Ok(Handle {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    /// Look up a live object. Fails on a stale or never-issued handle.
    pub fn get(&self, handle: Handle) -> Result<&Object, VmError> {
        self.slots
            .get(handle.index())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.object.as_ref())
            .ok_or(VmError::StaleHandle(handle))
    }

    fn get_mut(&mut self, handle: Handle) -> Result<&mut Object, VmError> {
        self.slots
            .get_mut(handle.index())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.object.as_mut())
            .ok_or(VmError::StaleHandle(handle))
    }

    /// Returns `true` if `handle` addresses a live object.
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }

    /// Read a pair's `(car, cdr)`.
    pub fn pair(&self, handle: Handle) -> Result<(Value, Value), VmError> {
        match self.get(handle)?.payload {
            Payload::Pair { car, cdr } => Ok((car, cdr)),
        }
    }

    /// Replace a pair's car.
    pub fn set_car(&mut self, handle: Handle, value: Value) -> Result<(), VmError> {
        match &mut self.get_mut(handle)?.payload {
            Payload::Pair { car, .. } => *car = value,
        }
        Ok(())
    }

    /// Replace a pair's cdr.
    pub fn set_cdr(&mut self, handle: Handle, value: Value) -> Result<(), VmError> {
        match &mut self.get_mut(handle)?.payload {
            Payload::Pair { cdr, .. } => *cdr = value,
        }
        Ok(())
    }

    /// Run one full stop-the-world mark-sweep cycle over the given roots.
    ///
    /// Returns the number of objects freed. After this returns, every
    /// object reachable from `roots` is still live with its payload
    /// intact, no unreachable object remains, and every survivor's mark
    /// bit is clear.
    pub fn collect<I>(&mut self, roots: I) -> usize
    where
        I: IntoIterator<Item = Value>,
    {
        // Mark phase: explicit worklist, so arbitrarily deep or cyclic
        // structures cannot overflow the native call stack.
        let mut worklist: Vec<Handle> = roots
            .into_iter()
            .filter_map(|v| v.as_obj())
            .collect();

        while let Some(handle) = worklist.pop() {
            let Some(slot) = self.slots.get_mut(handle.index()) else {
                continue;
            };
            if slot.generation != handle.generation {
                continue;
            }
            let Some(object) = slot.object.as_mut() else {
                continue;
            };
            if object.marked {
                // Already visited: shared references and cycles stop here.
                continue;
            }
            object.marked = true;
            object.payload.trace(&mut worklist);
        }

        // Sweep phase: free unmarked slots, unmark survivors.
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot.object.as_mut() {
                Some(object) if object.marked => object.marked = false,
                Some(_) => {
                    slot.object = None;
                    slot.generation = slot.generation.wrapping_add(1);
                    self.free.push(index as u32);
                    self.bytes_allocated -= Self::OBJECT_SIZE;
                    freed += 1;
                }
                None => {}
            }
        }

        self.next_gc = (self.bytes_allocated * HEAP_GROW_FACTOR).max(INITIAL_GC_THRESHOLD);
        self.stats.collections += 1;
        self.stats.objects_freed += freed as u64;
        freed
    }

    /// Bytes currently accounted to live objects.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Threshold at which the next allocation triggers a collection.
    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }

    /// Collection counters.
    pub fn stats(&self) -> GcStats {
        self.stats
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("live_objects", &self.live_objects())
            .field("bytes_allocated", &self.bytes_allocated)
            .field("next_gc", &self.next_gc)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    #[test]
    fn test_alloc_and_read_pair() {
        let mut heap = Heap::new();
        let h = heap.alloc_pair(num(1.0), num(2.0)).unwrap();
        assert!(heap.contains(h));
        assert_eq!(heap.get(h).unwrap().kind(), ObjectKind::Pair);
        assert_eq!(heap.pair(h).unwrap(), (num(1.0), num(2.0)));
        assert_eq!(heap.bytes_allocated(), Heap::OBJECT_SIZE);
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn test_set_car_and_cdr() {
        let mut heap = Heap::new();
        let h = heap.alloc_pair(num(0.0), num(0.0)).unwrap();
        heap.set_car(h, num(7.0)).unwrap();
        heap.set_cdr(h, num(8.0)).unwrap();
        assert_eq!(heap.pair(h).unwrap(), (num(7.0), num(8.0)));
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = Heap::new();
        let _garbage = heap.alloc_pair(num(1.0), num(2.0)).unwrap();
        let kept = heap.alloc_pair(num(3.0), num(4.0)).unwrap();

        let freed = heap.collect([Value::Obj(kept)]);
        assert_eq!(freed, 1);
        assert!(heap.contains(kept));
        assert_eq!(heap.pair(kept).unwrap(), (num(3.0), num(4.0)));
        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.bytes_allocated(), Heap::OBJECT_SIZE);
    }

    #[test]
    fn test_collect_with_no_roots_frees_everything() {
        let mut heap = Heap::new();
        for i in 0..10 {
            heap.alloc_pair(num(i as f64), num(0.0)).unwrap();
        }
        let freed = heap.collect([]);
        assert_eq!(freed, 10);
        assert_eq!(heap.live_objects(), 0);
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn test_reachability_through_pairs() {
        let mut heap = Heap::new();
        let inner = heap.alloc_pair(num(1.0), num(2.0)).unwrap();
        let outer = heap.alloc_pair(Value::Obj(inner), num(3.0)).unwrap();

        let freed = heap.collect([Value::Obj(outer)]);
        assert_eq!(freed, 0);
        assert!(heap.contains(inner));
        assert!(heap.contains(outer));
    }

    #[test]
    fn test_cycle_terminates_and_survives() {
        let mut heap = Heap::new();
        let a = heap.alloc_pair(num(1.0), num(0.0)).unwrap();
        let b = heap.alloc_pair(num(2.0), Value::Obj(a)).unwrap();
        // Close the loop: a.cdr -> b, b.cdr -> a.
        heap.set_cdr(a, Value::Obj(b)).unwrap();

        let freed = heap.collect([Value::Obj(a)]);
        assert_eq!(freed, 0);
        assert!(heap.contains(a));
        assert!(heap.contains(b));

        // Unrooted, the whole cycle goes at once — no infinite loop,
        // no double free.
        let freed = heap.collect([]);
        assert_eq!(freed, 2);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn test_deep_list_marks_without_recursion() {
        let mut heap = Heap::new();
        let mut head = heap.alloc_pair(num(0.0), num(0.0)).unwrap();
        for i in 1..10_000 {
            head = heap.alloc_pair(num(i as f64), Value::Obj(head)).unwrap();
        }
        let freed = heap.collect([Value::Obj(head)]);
        assert_eq!(freed, 0);
        assert_eq!(heap.live_objects(), 10_000);
    }

    #[test]
    fn test_stale_handle_detected_after_reuse() {
        let mut heap = Heap::new();
        let stale = heap.alloc_pair(num(1.0), num(2.0)).unwrap();
        heap.collect([]);
        assert!(!heap.contains(stale));

        // The freed slot is reused with a bumped generation; the old
        // handle must still be rejected.
        let fresh = heap.alloc_pair(num(9.0), num(9.0)).unwrap();
        assert_eq!(fresh.index(), stale.index());
        assert_ne!(fresh.generation(), stale.generation());
        assert!(heap.get(stale).is_err());
        assert_eq!(heap.pair(fresh).unwrap(), (num(9.0), num(9.0)));
    }

    #[test]
    fn test_threshold_grows_after_collection() {
        let mut heap = Heap::new();
        let mut root = heap.alloc_pair(num(0.0), num(0.0)).unwrap();
        while !heap.should_collect(Heap::OBJECT_SIZE) {
            root = heap.alloc_pair(num(0.0), Value::Obj(root)).unwrap();
        }
        let before = heap.next_gc();
        heap.collect([Value::Obj(root)]);
        assert!(
            heap.next_gc() >= before,
            "threshold should not shrink while the live set fills it"
        );
        assert_eq!(heap.next_gc(), (heap.bytes_allocated() * 2).max(1024));
    }

    #[test]
    fn test_byte_limit_exhaustion() {
        let mut heap = Heap::new();
        heap.set_byte_limit(Heap::OBJECT_SIZE * 2);
        let a = heap.alloc_pair(num(1.0), num(1.0)).unwrap();
        let _b = heap.alloc_pair(num(2.0), num(2.0)).unwrap();
        let err = heap.alloc_pair(num(3.0), num(3.0)).unwrap_err();
        assert!(matches!(err, VmError::OutOfMemory { .. }));

        // Freeing one object makes room again.
        heap.collect([Value::Obj(a)]);
        assert!(heap.alloc_pair(num(4.0), num(4.0)).is_ok());
    }

    #[test]
    fn test_marks_clear_after_collection() {
        let mut heap = Heap::new();
        let a = heap.alloc_pair(num(1.0), num(2.0)).unwrap();
        heap.collect([Value::Obj(a)]);
        // A second collection with the same root must keep the object
        // alive; a leftover mark bit would make sweep free it.
        heap.collect([Value::Obj(a)]);
        assert!(heap.contains(a));
        let freed = heap.collect([]);
        assert_eq!(freed, 1);
    }

    #[test]
    fn test_stats_accumulate() {
        let mut heap = Heap::new();
        heap.alloc_pair(num(1.0), num(1.0)).unwrap();
        heap.alloc_pair(num(2.0), num(2.0)).unwrap();
        heap.collect([]);
        heap.collect([]);
        let stats = heap.stats();
        assert_eq!(stats.collections, 2);
        assert_eq!(stats.objects_freed, 2);
    }
}
