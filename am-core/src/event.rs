//! Pooled, reference-counted events: ties [`crate::pool::PoolRegistry`] to
//! the [`am_sys::EventHeader`] bit layout and implements the
//! allocate/duplicate/free/push contract.
//!
//! `EventBox` plays the role `tokio_uring_reactor`'s `RawRegistration`
//! plays for completions: a raw handle that owns a piece of shared backing
//! storage and round-trips it by pointer rather than through the borrow
//! checker, because the same event is handed to the allocator, one or more
//! queues, and the dispatcher over its lifetime. It is `Send` because the
//! preemptive runtime moves events across AO threads; all header mutation
//! happens while the framework's critical section is held.

use core::fmt;
use core::mem::size_of;
use core::slice;

use am_sys::EventHeader;

use crate::pool::PoolRegistry;
use crate::queue::PushRc;

#[derive(Clone, Copy)]
enum Origin {
    Static,
    Pooled { pool_index: u32, block_index: u32 },
}

/// An in-flight event: header plus payload, either borrowed from static
/// storage or carved out of a registered pool.
pub struct EventBox {
    ptr: *mut u8,
    len: usize,
    origin: Origin,
}

// SAFETY: an `EventBox` behaves like an owning handle to a block no other
// `EventBox` aliases; all header/refcount mutation is performed by
// `EventPools` under the caller's critical section.
unsafe impl Send for EventBox {}

impl EventBox {
    /// Wraps caller-owned storage that outlives the framework and is never
    /// returned to a pool. `ptr` must point at a valid `EventHeader`
    /// followed by `len - size_of::<EventHeader>()` payload bytes, for the
    /// entire program lifetime.
    pub unsafe fn from_static(ptr: *mut u8, len: usize) -> Self {
        assert!(len >= size_of::<EventHeader>());
        EventBox { ptr, len, origin: Origin::Static }
    }

    pub fn header(&self) -> &EventHeader {
        unsafe { &*(self.ptr as *const EventHeader) }
    }

    fn header_mut(&mut self) -> &mut EventHeader {
        unsafe { &mut *(self.ptr as *mut EventHeader) }
    }

    pub fn id(&self) -> i32 {
        self.header().id()
    }

    pub fn is_static(&self) -> bool {
        matches!(self.origin, Origin::Static)
    }

    pub fn payload(&self) -> &[u8] {
        let header_len = size_of::<EventHeader>();
        unsafe { slice::from_raw_parts(self.ptr.add(header_len), self.len - header_len) }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = size_of::<EventHeader>();
        unsafe { slice::from_raw_parts_mut(self.ptr.add(header_len), self.len - header_len) }
    }

    pub fn inc_ref_cnt(&mut self) {
        self.header_mut().inc_ref_cnt();
    }

    /// Hands out a second owning handle over the same block, for the
    /// router's fan-out: `publish_exclude_x` bumps the refcount once and
    /// then delivers the *same* event to every subscriber queue, exactly
    /// as the original core delivers one pointer to N queues. `EventBox`
    /// can't be `Clone` (a naive clone would let two handles free the same
    /// block independently), so this is `unsafe` and comes with the
    /// caller's obligation: never call it without having just bumped the
    /// refcount to account for the new handle.
    pub unsafe fn alias(&self) -> EventBox {
        EventBox { ptr: self.ptr, len: self.len, origin: self.origin }
    }
}

impl fmt::Debug for EventBox {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventBox").field("header", self.header()).finish()
    }
}

#[derive(Debug)]
pub enum AllocError {
    /// No registered pool has a block large enough for the request.
    NoFittingPool,
    /// The fitting pool had `nfree <= margin` free blocks.
    Exhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AllocError::NoFittingPool => write!(f, "no registered pool fits the requested size"),
            AllocError::Exhausted => write!(f, "pool exhausted (margin not satisfied)"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Owns the pool registry and implements allocate/duplicate/free/push.
pub struct EventPools<'buf> {
    registry: PoolRegistry<'buf>,
}

impl<'buf> EventPools<'buf> {
    pub fn new() -> Self {
        EventPools { registry: PoolRegistry::new() }
    }

    /// See [`PoolRegistry::add_pool`]; `block_size` must be at least
    /// `size_of::<EventHeader>()`.
    pub fn add_pool(&mut self, buf: &'buf mut [u8], block_size: usize, alignment: usize) {
        assert!(
            block_size >= size_of::<EventHeader>(),
            "pool block size must fit at least the event header"
        );
        self.registry.add_pool(buf, block_size, alignment);
    }

    pub fn npools(&self) -> usize {
        self.registry.npools()
    }

    pub fn nfree(&self, pool_index: usize) -> usize {
        self.registry.pool(pool_index).nfree()
    }

    pub fn nfree_min(&self, pool_index: usize) -> usize {
        self.registry.pool(pool_index).nfree_min()
    }

    pub fn nblocks(&self, pool_index: usize) -> usize {
        self.registry.pool(pool_index).nblocks()
    }

    /// `size` is the total block size needed, header included.
    pub fn allocate_x(&mut self, id: i32, size: usize, margin: usize, tick_domain: u8) -> Result<EventBox, AllocError> {
        let pool_index = self.registry.find_pool_for_size(size).ok_or(AllocError::NoFittingPool)?;
        let pool = self.registry.pool_mut(pool_index);
        if pool.nfree() <= margin {
            return Err(AllocError::Exhausted);
        }
        let block_index = pool.allocate().expect("nfree > margin implies a free block exists");
        let block = pool.block_mut(block_index);
        for b in block.iter_mut() {
            *b = 0;
        }
        let header = EventHeader::new_pooled(id, pool_index as u8, tick_domain);
        unsafe {
            (block.as_mut_ptr() as *mut EventHeader).write(header);
        }
        Ok(EventBox {
            ptr: block.as_mut_ptr(),
            len: block.len(),
            origin: Origin::Pooled { pool_index: pool_index as u32, block_index },
        })
    }

    /// Panics if allocation fails; use [`Self::allocate_x`] to handle
    /// back-pressure.
    pub fn allocate(&mut self, id: i32, size: usize) -> EventBox {
        self.allocate_x(id, size, 0, 0).unwrap_or_else(|e| panic!("am_event_allocate: {}", e))
    }

    /// Copies `e`'s payload into a freshly allocated event of the same id.
    pub fn dup(&mut self, e: &EventBox) -> EventBox {
        let mut new_event = self.allocate(e.id(), e.len);
        new_event.payload_mut().copy_from_slice(e.payload());
        new_event
    }

    /// Frees `e`, consuming it so it cannot be referenced again. No-op for
    /// static events. `ref_counter == 0` is the allocator's baseline (an
    /// event nobody has pushed anywhere yet still counts as one implicit
    /// owner), so `free` reclaims storage whenever the pre-decrement count
    /// is `0` or `1`, and otherwise just decrements; see
    /// `am_event_dec_ref_cnt`, which is an alias for this operation.
    pub fn free(&mut self, e: EventBox) {
        if e.is_static() {
            return;
        }
        if !e.header().check_id_lsw() {
            crate::fault::fault("am_event_free: id_lsw mismatch (double-free or corruption)", &*self);
        }
        let origin = e.origin;
        let old = e.header().ref_counter();
        if old > 1 {
            let ptr = e.ptr as *mut EventHeader;
            unsafe { (*ptr).set_ref_counter(old - 1) };
            return;
        }
        if let Origin::Pooled { pool_index, block_index } = origin {
            self.registry.pool_mut(pool_index as usize).free_block(block_index);
        }
    }

    /// `am_event_dec_ref_cnt`.
    pub fn dec_ref_cnt(&mut self, e: EventBox) {
        self.free(e);
    }

    /// Pops one event under the critical section (via `queue.pop_front()`,
    /// which the caller is expected to have already called inside one),
    /// hands it to `cb`, then frees it — matching `am_event_pop_front`'s
    /// "verify id unchanged, then free" contract.
    pub fn pop_front_and_free<F: FnOnce(&EventBox)>(&mut self, event: EventBox, cb: F) {
        let id_before = event.id();
        cb(&event);
        assert_eq!(event.id(), id_before, "event id changed during dispatch");
        self.free(event);
    }
}

impl<'buf> Default for EventPools<'buf> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pushes `event` onto `queue`, applying the margin / refcount contract
/// shared by `push_back_x`/`push_front_x`: on acceptance the refcount is
/// incremented (a no-op for static events); on rejection the event is
/// freed and `PushRc::Err` is returned.
pub fn push_back_x(
    pools: &mut EventPools,
    queue: &mut crate::queue::BoundedQueue<EventBox>,
    mut event: EventBox,
    margin: usize,
) -> PushRc {
    if queue.free_len() <= margin {
        pools.free(event);
        return PushRc::Err;
    }
    event.inc_ref_cnt();
    let (rc, rejected) = queue.push_back_x(event, usize::MAX);
    debug_assert!(rejected.is_none(), "capacity already checked above");
    rc
}

pub fn push_front_x(
    pools: &mut EventPools,
    queue: &mut crate::queue::BoundedQueue<EventBox>,
    mut event: EventBox,
    margin: usize,
) -> PushRc {
    if queue.free_len() <= margin {
        pools.free(event);
        return PushRc::Err;
    }
    event.inc_ref_cnt();
    let (rc, rejected) = queue.push_front_x(event, usize::MAX);
    debug_assert!(rejected.is_none(), "capacity already checked above");
    rc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BoundedQueue;

    #[test]
    fn allocate_then_free_restores_pool_stats() {
        let mut buf = [0u8; 256];
        let mut pools = EventPools::new();
        pools.add_pool(&mut buf, 32, 8);
        let before = pools.nfree(0);
        let e = pools.allocate(10, 32);
        assert_eq!(pools.nfree(0), before - 1);
        pools.free(e);
        assert_eq!(pools.nfree(0), before);
    }

    #[test]
    fn push_then_pop_round_trips_refcount_to_free() {
        let mut buf = [0u8; 256];
        let mut pools = EventPools::new();
        pools.add_pool(&mut buf, 32, 8);
        let before = pools.nfree(0);

        let mut q: BoundedQueue<EventBox> = BoundedQueue::with_capacity(4);
        let e = pools.allocate(10, 32);
        let rc = push_back_x(&mut pools, &mut q, e, 0);
        assert_eq!(rc, PushRc::OkWasEmpty);
        assert_eq!(pools.nfree(0), before - 1);

        let popped = q.pop_front().unwrap();
        pools.free(popped);
        assert_eq!(pools.nfree(0), before);
    }

    #[test]
    fn publish_with_zero_subscribers_reclaims_on_outer_free() {
        // publish_exclude_x's shape with no subscriber queues: inc_ref_cnt
        // once up front (0 -> 1), then the outer free sees old == 1 and
        // reclaims immediately.
        let mut buf = [0u8; 256];
        let mut pools = EventPools::new();
        pools.add_pool(&mut buf, 32, 8);
        let before = pools.nfree(0);

        let mut e = pools.allocate(10, 32);
        e.inc_ref_cnt();
        assert_eq!(e.header().ref_counter(), 1);
        pools.free(e);
        assert_eq!(pools.nfree(0), before);
    }

    #[test]
    fn publish_with_two_subscribers_reclaims_only_after_last_pop_free() {
        // inc_ref_cnt once up front (0 -> 1), then one increment per
        // delivered queue (here emulated as two more inc_ref_cnt calls,
        // standing in for two push_back_x deliveries) takes it to 3. The
        // outer free (old == 3) decrements to 2 and keeps the block alive;
        // each subscriber's own pop+free walks it down, reclaiming only
        // when the last holder sees old <= 1.
        let mut buf = [0u8; 256];
        let mut pools = EventPools::new();
        pools.add_pool(&mut buf, 32, 8);
        let before = pools.nfree(0);

        let mut e = pools.allocate(10, 32);
        e.inc_ref_cnt(); // publish_exclude_x's up-front increment: 0 -> 1
        let mut a = unsafe { e.alias() };
        a.inc_ref_cnt(); // delivered to subscriber A's queue: 1 -> 2
        let mut b = unsafe { e.alias() };
        b.inc_ref_cnt(); // delivered to subscriber B's queue: 2 -> 3
        assert_eq!(e.header().ref_counter(), 3);

        pools.free(e); // outer free: old == 3, decrement to 2, stays alive
        assert_eq!(pools.nfree(0), before - 1);

        pools.free(a); // old == 2, decrement to 1, stays alive
        assert_eq!(pools.nfree(0), before - 1);

        pools.free(b); // old == 1, reclaim
        assert_eq!(pools.nfree(0), before);
    }
}
