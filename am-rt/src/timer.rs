//! Timer wheel: per-tick-domain armed/pending-insert lists, integrated with
//! the posting and publishing paths.
//!
//! A timer's own event is never reallocated per shot: it is handed to
//! [`TimerWheel::ctor`] once and kept for the timer's whole lifetime (the
//! up-front `inc_ref_cnt` there mirrors `publish_exclude_x`'s own "one
//! implicit owner" bump). Every fire delivers an [`EventBox::alias`] of it,
//! never the original — the same aliasing trick the router uses for
//! fan-out, here with exactly one reader at a time. Timer bookkeeping
//! (`shot_in_ticks`, `disarm_pending`, ...) lives in a permanent slab
//! indexed by [`TimerId`] rather than inside the intrusive list itself, so
//! membership in `armed`/`pending` can be represented by the cheap,
//! `Copy` index alone — see `am_core::list::SList`'s own doc comment for
//! why that list trades raw pointer-chasing for a slab.

use am_core::event::{EventBox, EventPools};
use am_core::list::SList;

use crate::ao::{post_to, AoRegistry, Priority};
use crate::pal::Pal;
use crate::pubsub::{publish_exclude_x, SubscribeTable};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerId(u32);

struct TimerState {
    event: Option<EventBox>,
    domain: u8,
    /// `None` means the timer publishes instead of posting to one AO.
    owner: Option<Priority>,
    shot_in_ticks: u64,
    interval_ticks: u64,
    disarm_pending: bool,
    linked: bool,
}

/// Owns every timer's bookkeeping plus the two intrusive lists per domain.
pub struct TimerWheel {
    states: Vec<TimerState>,
    armed: Vec<SList<u32>>,
    pending: Vec<SList<u32>>,
}

impl TimerWheel {
    pub fn new(ndomains: usize, capacity_per_domain: usize) -> Self {
        TimerWheel {
            states: Vec::new(),
            armed: (0..ndomains).map(|_| SList::with_capacity(capacity_per_domain)).collect(),
            pending: (0..ndomains).map(|_| SList::with_capacity(capacity_per_domain)).collect(),
        }
    }

    /// Initialises a new, disarmed timer bound to `event` for its whole
    /// lifetime. `owner = None` publishes on fire; `Some(prio)` posts to
    /// that AO.
    pub fn ctor(&mut self, domain: u8, mut event: EventBox, owner: Option<Priority>) -> TimerId {
        if !event.is_static() {
            event.inc_ref_cnt();
        }
        let id = self.states.len() as u32;
        self.states.push(TimerState {
            event: Some(event),
            domain,
            owner,
            shot_in_ticks: 0,
            interval_ticks: 0,
            disarm_pending: false,
            linked: false,
        });
        TimerId(id)
    }

    fn state_mut(&mut self, id: TimerId) -> &mut TimerState {
        &mut self.states[id.0 as usize]
    }

    /// Arms (or re-arms) the timer to fire in `ticks` ticks, repeating
    /// every `interval` ticks thereafter (`interval == 0` is one-shot).
    pub fn arm_ticks(&mut self, id: TimerId, ticks: u64, interval: u64, pal: &dyn Pal) {
        pal.crit_enter();
        let domain = self.states[id.0 as usize].domain;
        let st = self.state_mut(id);
        st.shot_in_ticks = ticks.max(1);
        st.interval_ticks = interval;
        st.disarm_pending = false;
        if !st.linked {
            st.linked = true;
            self.pending[domain as usize].push_back(id.0);
        }
        pal.crit_exit();
    }

    pub fn arm_ms(&mut self, id: TimerId, ms: u64, interval_ms: u64, pal: &dyn Pal) {
        let domain = self.states[id.0 as usize].domain;
        let ticks = pal.time_get_tick_from_ms(domain, ms);
        let interval_ticks = pal.time_get_tick_from_ms(domain, interval_ms);
        self.arm_ticks(id, ticks, interval_ticks, pal);
    }

    /// Flags the timer for removal on the next `tick`; the list itself is
    /// left untouched so `disarm` is always safe to call concurrently with
    /// a `tick` in progress.
    pub fn disarm(&mut self, id: TimerId, pal: &dyn Pal) {
        pal.crit_enter();
        self.state_mut(id).disarm_pending = true;
        pal.crit_exit();
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        let st = &self.states[id.0 as usize];
        st.linked && !st.disarm_pending
    }

    /// Advances `domain` by one tick: splices pending insertions onto the
    /// armed list, then decrements every armed timer, firing (and, for
    /// one-shots, unlinking) the ones that reach zero. Delivery happens
    /// after the critical section is released.
    pub fn tick(
        &mut self,
        domain: u8,
        registry: &mut AoRegistry,
        table: &SubscribeTable,
        pools: &mut EventPools,
        pal: &dyn Pal,
    ) {
        let d = domain as usize;
        let mut fired: Vec<u32> = Vec::new();

        pal.crit_enter();
        let mut drained = std::mem::replace(&mut self.pending[d], SList::with_capacity(0));
        self.armed[d].append(&mut drained);

        let states = &mut self.states;
        self.armed[d].retain_and_visit(|state_id| {
            let st = &mut states[*state_id as usize];
            if st.disarm_pending {
                st.disarm_pending = false;
                st.linked = false;
                return true;
            }
            st.shot_in_ticks -= 1;
            if st.shot_in_ticks > 0 {
                return false;
            }
            if st.interval_ticks > 0 {
                st.shot_in_ticks = st.interval_ticks;
                fired.push(*state_id);
                false
            } else {
                st.linked = false;
                fired.push(*state_id);
                true
            }
        });
        pal.crit_exit();

        for state_id in fired {
            log::trace!("am_timer_tick: domain={domain} state_id={state_id} fired");
            // A `disarm` can race in between the critical section above and
            // this delivery: re-check right before handing the event off,
            // mirroring the original wheel's `else if (!disarm_pending)`
            // guard on its own post/publish call.
            pal.crit_enter();
            let disarmed = self.states[state_id as usize].disarm_pending;
            pal.crit_exit();
            if disarmed {
                log::trace!("am_timer_tick: domain={domain} state_id={state_id} disarm raced delivery, skipped");
                continue;
            }

            let (owner, handle) = {
                let st = &self.states[state_id as usize];
                let ev = st.event.as_ref().expect("fired timer has no event");
                (st.owner, unsafe { ev.alias() })
            };
            match owner {
                Some(prio) => {
                    post_to(registry, pools, prio.ao, handle, 0);
                }
                None => {
                    publish_exclude_x(table, registry, pools, pal, handle, None, 0);
                }
            }
        }
    }

    /// Releases the timer's permanently-held event. Must not be called
    /// while the timer is linked; `disarm` it and let one more `tick` run
    /// first.
    pub fn dtor(&mut self, id: TimerId, pools: &mut EventPools) {
        let st = self.state_mut(id);
        if st.linked {
            am_core::fault::fault("am_timer_dtor: timer still linked, disarm and tick it first", pools);
        }
        if let Some(ev) = st.event.take() {
            pools.free(ev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_core::event::EventPools;
    use am_core::hsm::{Event, Hsm, Outcome, State};
    use am_sys::{EVT_INIT, USER_BASE};

    struct Counting {
        seen: Vec<i32>,
    }

    fn top_parent(_: u16) -> Option<State<Counting>> {
        None
    }

    fn top(_ctx: &mut Counting, _hsm: &mut Hsm<Counting>, _instance: u16, event: &Event) -> Outcome<Counting> {
        match event.id {
            am_sys::EVT_ENTRY | am_sys::EVT_EXIT => Outcome::Handled,
            EVT_INIT => Outcome::Tran(State::new(idle, 0, Some(idle_parent))),
            _ => Outcome::Super,
        }
    }

    fn idle_parent(_: u16) -> Option<State<Counting>> {
        Some(State::new(top, 0, Some(top_parent)))
    }

    fn idle(ctx: &mut Counting, _hsm: &mut Hsm<Counting>, _instance: u16, event: &Event) -> Outcome<Counting> {
        match event.id {
            am_sys::EVT_ENTRY | am_sys::EVT_EXIT | EVT_INIT => Outcome::Handled,
            id if id >= USER_BASE => {
                ctx.seen.push(id);
                Outcome::Handled
            }
            _ => Outcome::Super,
        }
    }

    fn make_ao(prio: Priority) -> crate::ao::ActiveObject<Counting> {
        crate::ao::ActiveObject::new("counting", prio, State::new(top, 0, Some(top_parent)), Counting { seen: Vec::new() }, 8)
    }

    #[test]
    fn one_shot_fires_after_exactly_k_ticks() {
        let mut wheel = TimerWheel::new(1, 4);
        let mut pools = EventPools::new();
        let mut buf = [0u8; 256];
        pools.add_pool(&mut buf, 16, 8);

        let mut registry = AoRegistry::with_capacity(4);
        let init = Event::new(EVT_INIT, &[]);
        let mut ao = make_ao(Priority { ao: 0, task: 0 });
        ao.ctor(&init);
        registry.register(Box::new(ao), 0);

        let table = SubscribeTable::new(4);
        let pal = crate::pal::StdPal::new([1]);

        let ev = pools.allocate(USER_BASE, 16);
        let id = wheel.ctor(0, ev, Some(Priority { ao: 0, task: 0 }));
        wheel.arm_ticks(id, 3, 0, &pal);
        assert!(wheel.is_armed(id));

        wheel.tick(0, &mut registry, &table, &mut pools, &pal);
        wheel.tick(0, &mut registry, &table, &mut pools, &pal);
        assert!(registry.slot_mut(0).is_empty());

        wheel.tick(0, &mut registry, &table, &mut pools, &pal);
        assert!(!registry.slot_mut(0).is_empty());
        assert!(!wheel.is_armed(id));
    }

    #[test]
    fn interval_timer_keeps_reloading() {
        let mut wheel = TimerWheel::new(1, 4);
        let mut pools = EventPools::new();
        let mut buf = [0u8; 256];
        pools.add_pool(&mut buf, 16, 8);

        let mut registry = AoRegistry::with_capacity(4);
        let init = Event::new(EVT_INIT, &[]);
        let mut ao = make_ao(Priority { ao: 0, task: 0 });
        ao.ctor(&init);
        registry.register(Box::new(ao), 0);

        let table = SubscribeTable::new(4);
        let pal = crate::pal::StdPal::new([1]);

        let ev = pools.allocate(USER_BASE, 16);
        let id = wheel.ctor(0, ev, Some(Priority { ao: 0, task: 0 }));
        wheel.arm_ticks(id, 2, 2, &pal);

        wheel.tick(0, &mut registry, &table, &mut pools, &pal);
        wheel.tick(0, &mut registry, &table, &mut pools, &pal);
        assert!(!registry.slot_mut(0).is_empty());
        assert!(wheel.is_armed(id));
        registry.slot_mut(0).dispatch_one(&mut pools);

        wheel.tick(0, &mut registry, &table, &mut pools, &pal);
        wheel.tick(0, &mut registry, &table, &mut pools, &pal);
        assert!(!registry.slot_mut(0).is_empty());
    }

    #[test]
    fn disarm_before_the_shot_suppresses_delivery() {
        let mut wheel = TimerWheel::new(1, 4);
        let mut pools = EventPools::new();
        let mut buf = [0u8; 256];
        pools.add_pool(&mut buf, 16, 8);

        let mut registry = AoRegistry::with_capacity(4);
        let init = Event::new(EVT_INIT, &[]);
        let mut ao = make_ao(Priority { ao: 0, task: 0 });
        ao.ctor(&init);
        registry.register(Box::new(ao), 0);

        let table = SubscribeTable::new(4);
        let pal = crate::pal::StdPal::new([1]);

        let ev = pools.allocate(USER_BASE, 16);
        let id = wheel.ctor(0, ev, Some(Priority { ao: 0, task: 0 }));
        wheel.arm_ticks(id, 2, 0, &pal);
        wheel.disarm(id, &pal);

        wheel.tick(0, &mut registry, &table, &mut pools, &pal);
        assert!(!wheel.is_armed(id));
        wheel.tick(0, &mut registry, &table, &mut pools, &pal);
        assert!(registry.slot_mut(0).is_empty());
    }

    #[test]
    fn re_arming_after_disarm_reuses_the_same_event() {
        let mut wheel = TimerWheel::new(1, 4);
        let mut pools = EventPools::new();
        let mut buf = [0u8; 256];
        pools.add_pool(&mut buf, 16, 8);

        let mut registry = AoRegistry::with_capacity(4);
        let init = Event::new(EVT_INIT, &[]);
        let mut ao = make_ao(Priority { ao: 0, task: 0 });
        ao.ctor(&init);
        registry.register(Box::new(ao), 0);

        let table = SubscribeTable::new(4);
        let pal = crate::pal::StdPal::new([1]);

        let ev = pools.allocate(USER_BASE, 16);
        let id = wheel.ctor(0, ev, Some(Priority { ao: 0, task: 0 }));
        wheel.arm_ticks(id, 1, 0, &pal);
        wheel.disarm(id, &pal);
        wheel.tick(0, &mut registry, &table, &mut pools, &pal);
        assert!(!wheel.is_armed(id));

        wheel.arm_ticks(id, 1, 0, &pal);
        wheel.tick(0, &mut registry, &table, &mut pools, &pal);
        assert!(!registry.slot_mut(0).is_empty());
    }
}
