//! Wire layout of the event header shared by every in-flight message.
//!
//! Mirrors `struct am_event` from the original C core: an `id` word
//! followed by a single packed bitfield word so the whole header stays
//! at 8 bytes on every target this crate supports.

use core::fmt;

/// Reserved event ids. User ids start at [`USER_BASE`].
pub const EVT_ENTRY: i32 = 0;
pub const EVT_EXIT: i32 = 1;
pub const EVT_INIT: i32 = 2;
/// Spare reserved id, kept for header-layout parity with the original core.
pub const EVT_RESERVED_SPARE: i32 = 3;
pub const USER_BASE: i32 = 4;
pub const EVT_INVALID: i32 = -1;

const REF_COUNTER_BITS: u32 = 6;
const POOL_INDEX_BITS: u32 = 5;
const TICK_DOMAIN_BITS: u32 = 3;
const ID_LSW_BITS: u32 = 16;

const REF_COUNTER_SHIFT: u32 = 0;
const POOL_INDEX_SHIFT: u32 = REF_COUNTER_SHIFT + REF_COUNTER_BITS;
const TICK_DOMAIN_SHIFT: u32 = POOL_INDEX_SHIFT + POOL_INDEX_BITS;
const ID_LSW_SHIFT: u32 = TICK_DOMAIN_SHIFT + TICK_DOMAIN_BITS + 1; // one reserved bit

const REF_COUNTER_MASK: u32 = (1 << REF_COUNTER_BITS) - 1;
const POOL_INDEX_MASK: u32 = (1 << POOL_INDEX_BITS) - 1;
const TICK_DOMAIN_MASK: u32 = (1 << TICK_DOMAIN_BITS) - 1;
const ID_LSW_MASK: u32 = (1 << ID_LSW_BITS) - 1;

/// Saturating maximum of the 6-bit refcount field.
pub const REF_COUNTER_MAX: u8 = REF_COUNTER_MASK as u8;
/// Largest representable one-based pool index (31 pools, `0` means static).
pub const POOL_INDEX_MAX: u8 = POOL_INDEX_MASK as u8;
/// Largest representable tick domain.
pub const TICK_DOMAIN_MAX: u8 = TICK_DOMAIN_MASK as u8;

/// Event header: `id` plus the packed refcount / pool-index / tick-domain /
/// id-low-word bitfield.
///
/// `id_lsw` must equal `id & 0xFFFF` for every non-static event at every API
/// boundary; see [`EventHeader::check_id_lsw`].
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventHeader {
    id: i32,
    bits: u32,
}

const _: () = assert!(core::mem::size_of::<EventHeader>() == 8, "EventHeader must stay 8 bytes on every target");

impl EventHeader {
    /// A header for a static event: never pooled, refcount operations on it
    /// are no-ops.
    pub fn new_static(id: i32) -> Self {
        let mut h = EventHeader { id, bits: 0 };
        h.set_id_lsw((id & (ID_LSW_MASK as i32)) as u16);
        h
    }

    /// A freshly carved pooled event: `ref_counter == 0`, `pool_index_plus_one`
    /// one-based.
    pub fn new_pooled(id: i32, pool_index: u8, tick_domain: u8) -> Self {
        assert!(pool_index <= POOL_INDEX_MAX, "pool index out of range");
        assert!(tick_domain <= TICK_DOMAIN_MAX, "tick domain out of range");
        let mut h = EventHeader { id, bits: 0 };
        h.set_pool_index_plus_one(pool_index + 1);
        h.set_tick_domain(tick_domain);
        h.set_id_lsw((id & (ID_LSW_MASK as i32)) as u16);
        h
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn set_id(&mut self, id: i32) {
        self.id = id;
    }

    pub fn ref_counter(&self) -> u8 {
        ((self.bits >> REF_COUNTER_SHIFT) & REF_COUNTER_MASK) as u8
    }

    pub fn set_ref_counter(&mut self, v: u8) {
        assert!(v <= REF_COUNTER_MAX, "ref_counter overflow");
        self.bits &= !(REF_COUNTER_MASK << REF_COUNTER_SHIFT);
        self.bits |= (v as u32) << REF_COUNTER_SHIFT;
    }

    /// `0` means the event is static; nonzero is one-based into the pool registry.
    pub fn pool_index_plus_one(&self) -> u8 {
        ((self.bits >> POOL_INDEX_SHIFT) & POOL_INDEX_MASK) as u8
    }

    fn set_pool_index_plus_one(&mut self, v: u8) {
        assert!(v <= POOL_INDEX_MAX + 1, "pool index overflow");
        self.bits &= !(POOL_INDEX_MASK << POOL_INDEX_SHIFT);
        self.bits |= (v as u32) << POOL_INDEX_SHIFT;
    }

    pub fn is_static(&self) -> bool {
        self.pool_index_plus_one() == 0
    }

    /// `None` for static events; otherwise the zero-based pool index.
    pub fn pool_index(&self) -> Option<u8> {
        let p = self.pool_index_plus_one();
        if p == 0 {
            None
        } else {
            Some(p - 1)
        }
    }

    pub fn tick_domain(&self) -> u8 {
        ((self.bits >> TICK_DOMAIN_SHIFT) & TICK_DOMAIN_MASK) as u8
    }

    pub fn set_tick_domain(&mut self, v: u8) {
        assert!(v <= TICK_DOMAIN_MAX, "tick domain overflow");
        self.bits &= !(TICK_DOMAIN_MASK << TICK_DOMAIN_SHIFT);
        self.bits |= (v as u32) << TICK_DOMAIN_SHIFT;
    }

    pub fn id_lsw(&self) -> u16 {
        ((self.bits >> ID_LSW_SHIFT) & ID_LSW_MASK) as u16
    }

    fn set_id_lsw(&mut self, v: u16) {
        self.bits &= !(ID_LSW_MASK << ID_LSW_SHIFT);
        self.bits |= (v as u32) << ID_LSW_SHIFT;
    }

    /// Tamper / use-after-free / double-free check: `id_lsw` must track `id`.
    pub fn check_id_lsw(&self) -> bool {
        self.id_lsw() == (self.id & (ID_LSW_MASK as i32)) as u16
    }

    /// Raises the refcount by one; a no-op on static events. The "an event
    /// freshly out of `allocate` already represents one implicit owner"
    /// convention (so `ref_counter == 0` does not mean "unreferenced") lives
    /// one layer up, in `am_core::event`, alongside the free-list it needs
    /// to consult when a refcount drops back to that implicit baseline.
    pub fn inc_ref_cnt(&mut self) {
        if self.is_static() {
            return;
        }
        let rc = self.ref_counter();
        assert!(rc < REF_COUNTER_MAX, "ref_counter saturated");
        self.set_ref_counter(rc + 1);
    }
}

impl fmt::Debug for EventHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventHeader")
            .field("id", &self.id)
            .field("ref_counter", &self.ref_counter())
            .field("pool_index_plus_one", &self.pool_index_plus_one())
            .field("tick_domain", &self.tick_domain())
            .field("id_lsw", &self.id_lsw())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_eight_bytes() {
        assert_eq!(core::mem::size_of::<EventHeader>(), 8);
    }

    #[test]
    fn static_event_ignores_refcount() {
        let mut h = EventHeader::new_static(42);
        assert!(h.is_static());
        h.inc_ref_cnt();
        assert_eq!(h.ref_counter(), 0);
    }

    #[test]
    fn pooled_event_round_trips_fields() {
        let mut h = EventHeader::new_pooled(100, 3, 5);
        assert_eq!(h.pool_index(), Some(3));
        assert_eq!(h.tick_domain(), 5);
        assert!(h.check_id_lsw());
        h.inc_ref_cnt();
        h.inc_ref_cnt();
        assert_eq!(h.ref_counter(), 2);
    }

    #[test]
    fn id_lsw_detects_tamper() {
        let mut h = EventHeader::new_pooled(7, 0, 0);
        assert!(h.check_id_lsw());
        h.set_id(8);
        assert!(!h.check_id_lsw());
    }
}
