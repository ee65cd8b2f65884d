//! Publish/subscribe router: per-event-id subscription bitmaps and
//! priority-descending delivery.
//!
//! Grounded the same way `am_core::event`'s pooled refcounting is: one
//! up-front `inc_ref_cnt` before fan-out, a `push_back_x` per subscriber,
//! and a single balancing `free` at the end so a zero-subscriber publish
//! reclaims immediately and a many-subscriber one is kept alive exactly as
//! long as the slowest reader needs it.

use am_core::event::EventBox;
use am_core::queue::PushRc;
use am_sys::{BitSet64, USER_BASE};

use crate::ao::{AoRegistry, Priority};
use crate::pal::Pal;

/// Owns one bitmap per subscribable event id. Event ids below [`USER_BASE`]
/// are reserved for the HSM and are never subscribable.
pub struct SubscribeTable {
    bitmaps: Vec<BitSet64>,
}

impl SubscribeTable {
    /// `nsub` is the number of user event ids covered, starting at
    /// `USER_BASE`.
    pub fn new(nsub: usize) -> Self {
        SubscribeTable { bitmaps: vec![BitSet64::new(); nsub] }
    }

    fn slot(&mut self, id: i32) -> &mut BitSet64 {
        let idx = (id - USER_BASE) as usize;
        &mut self.bitmaps[idx]
    }

    pub fn subscribe(&mut self, prio: Priority, id: i32) {
        self.slot(id).set(prio.ao as u32);
    }

    pub fn unsubscribe(&mut self, prio: Priority, id: i32) {
        self.slot(id).clear(prio.ao as u32);
    }

    /// Clears `prio`'s bit across every event id, for `stop`.
    pub fn unsubscribe_all(&mut self, prio: Priority) {
        for bitmap in &mut self.bitmaps {
            bitmap.clear(prio.ao as u32);
        }
    }

    pub(crate) fn bitmap(&self, id: i32) -> BitSet64 {
        self.bitmaps[(id - USER_BASE) as usize]
    }
}

/// Delivers `event` to every subscriber of `event.id()` except `exclude`,
/// highest priority first, then balances the up-front refcount bump.
/// Returns `true` iff every eligible subscriber accepted the event.
///
/// The high-to-low iteration order matters on the preemptive back-end: a
/// publish that hands a higher-priority AO its event first, and only then
/// a lower one, can never let the lower AO observe the event before the
/// higher one even when delivery races with immediate preemption.
pub fn publish_exclude_x(
    table: &SubscribeTable,
    registry: &mut AoRegistry,
    pools: &mut am_core::event::EventPools,
    pal: &dyn Pal,
    mut event: EventBox,
    exclude: Option<Priority>,
    margin: usize,
) -> bool {
    if !event.is_static() {
        event.inc_ref_cnt();
    }

    let mut bitmap = table.bitmap(event.id());
    if let Some(ex) = exclude {
        bitmap.clear(ex.ao as u32);
    }

    let mut all_ok = true;
    while let Some(p) = bitmap.msb() {
        bitmap.clear(p);
        // push_back_x bumps the refcount again on acceptance; `alias` just
        // hands the queue its own owning handle over the same block.
        let handle = unsafe { event.alias() };
        let rc = registry.slot_mut(p as u8).post_back(pools, handle, margin);
        match rc {
            PushRc::OkWasEmpty => {
                pal.crit_enter();
                registry.mark_ready(p as u8);
                pal.crit_exit();
            }
            PushRc::Ok => {}
            PushRc::Err => {
                all_ok = false;
                log::warn!("publish_exclude_x: subscriber prio={p} queue full, event dropped");
                assert!(margin > 0, "publish_exclude_x: subscriber queue full with zero margin");
            }
        }
    }

    pools.free(event);
    all_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_core::event::EventPools;
    use am_core::hsm::{Event, Hsm, Outcome, State};
    use am_sys::EVT_INIT;

    struct Noop;

    fn top_parent(_: u16) -> Option<State<Noop>> {
        None
    }

    fn top(_ctx: &mut Noop, _hsm: &mut Hsm<Noop>, _instance: u16, event: &Event) -> Outcome<Noop> {
        match event.id {
            am_sys::EVT_ENTRY | am_sys::EVT_EXIT => Outcome::Handled,
            EVT_INIT => Outcome::Tran(State::new(idle, 0, Some(idle_parent))),
            _ => Outcome::Super,
        }
    }

    fn idle_parent(_: u16) -> Option<State<Noop>> {
        Some(State::new(top, 0, Some(top_parent)))
    }

    fn idle(_ctx: &mut Noop, _hsm: &mut Hsm<Noop>, _instance: u16, event: &Event) -> Outcome<Noop> {
        match event.id {
            am_sys::EVT_ENTRY | am_sys::EVT_EXIT | EVT_INIT => Outcome::Handled,
            id if id >= USER_BASE => Outcome::Handled,
            _ => Outcome::Super,
        }
    }

    fn make_ao(prio: Priority) -> crate::ao::ActiveObject<Noop> {
        crate::ao::ActiveObject::new("noop", prio, State::new(top, 0, Some(top_parent)), Noop, 4)
    }

    #[test]
    fn publish_with_no_subscribers_reclaims_the_block() {
        let mut registry = AoRegistry::with_capacity(4);
        let mut pools = EventPools::new();
        let mut buf = [0u8; 256];
        pools.add_pool(&mut buf, 16, 8);
        let before = pools.nfree(0);

        let table = SubscribeTable::new(8);
        let pal = crate::pal::StdPal::new([1]);
        let e = pools.allocate(USER_BASE, 16);
        let ok = publish_exclude_x(&table, &mut registry, &mut pools, &pal, e, None, 0);
        assert!(ok);
        assert_eq!(pools.nfree(0), before);
    }

    #[test]
    fn publish_delivers_highest_priority_subscriber_first() {
        let mut registry = AoRegistry::with_capacity(4);
        let init = Event::new(EVT_INIT, &[]);
        let mut low = make_ao(Priority { ao: 1, task: 1 });
        let mut high = make_ao(Priority { ao: 5, task: 5 });
        low.ctor(&init);
        high.ctor(&init);
        registry.register(Box::new(low), 0);
        registry.register(Box::new(high), 0);

        let mut table = SubscribeTable::new(8);
        table.subscribe(Priority { ao: 1, task: 1 }, USER_BASE);
        table.subscribe(Priority { ao: 5, task: 5 }, USER_BASE);

        let mut pools = EventPools::new();
        let mut buf = [0u8; 256];
        pools.add_pool(&mut buf, 16, 8);
        let before = pools.nfree(0);

        let pal = crate::pal::StdPal::new([1]);
        let e = pools.allocate(USER_BASE, 16);
        let ok = publish_exclude_x(&table, &mut registry, &mut pools, &pal, e, None, 0);
        assert!(ok);

        assert!(!registry.slot_mut(5).is_empty());
        assert!(!registry.slot_mut(1).is_empty());
        assert_eq!(registry.ready_msb(), Some(5));

        // one block, aliased into both subscriber queues: the block stays
        // held (refcount 2) until both subscribers pop and free their copy.
        assert_eq!(pools.nfree(0), before - 1);
    }

    #[test]
    fn publish_excludes_the_given_priority() {
        let mut registry = AoRegistry::with_capacity(4);
        let init = Event::new(EVT_INIT, &[]);
        let mut a = make_ao(Priority { ao: 0, task: 0 });
        a.ctor(&init);
        registry.register(Box::new(a), 0);

        let mut table = SubscribeTable::new(8);
        table.subscribe(Priority { ao: 0, task: 0 }, USER_BASE);

        let mut pools = EventPools::new();
        let mut buf = [0u8; 256];
        pools.add_pool(&mut buf, 16, 8);

        let pal = crate::pal::StdPal::new([1]);
        let e = pools.allocate(USER_BASE, 16);
        let ok = publish_exclude_x(&table, &mut registry, &mut pools, &pal, e, Some(Priority { ao: 0, task: 0 }), 0);
        assert!(ok);
        assert!(registry.slot_mut(0).is_empty());
    }

    #[test]
    fn unsubscribe_all_clears_every_id() {
        let mut table = SubscribeTable::new(4);
        let p = Priority { ao: 2, task: 2 };
        table.subscribe(p, USER_BASE);
        table.subscribe(p, USER_BASE + 1);
        table.unsubscribe_all(p);
        assert!(table.bitmap(USER_BASE).is_empty());
        assert!(table.bitmap(USER_BASE + 1).is_empty());
    }
}
