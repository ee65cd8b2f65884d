//! Active-object runtime: a registry of priority-addressed event consumers
//! plus two interchangeable back-ends that drain it — a single-threaded
//! cooperative scheduler and a `std::thread`-per-AO preemptive binding.
//!
//! An [`ActiveObject<C>`] is generic over its own context type `C`, but the
//! registry has to hold AOs of many different `C` at once, the way
//! `io_uring`'s `SubmissionQueue` hides its entry type behind raw pointers
//! so a single ring can carry heterogeneous operations. Here the erasure is
//! safe: [`AoDyn`] is the object-safe façade the scheduler drives, and
//! `ActiveObject<C>` implements it for any `C: Send`.

use std::sync::{Arc, Mutex};

use am_core::event::{push_back_x, push_front_x, EventBox, EventPools};
use am_core::hsm::{Event, Hsm, State};
use am_core::queue::{BoundedQueue, PushRc};
use am_sys::BitSet64;

use crate::fault::ao_fault;
use crate::pal::Pal;
use crate::pubsub::SubscribeTable;

/// `ao` indexes the registry slot and must be unique among running AOs;
/// `task` is the OS task (preemptive) or logical scheduler slot
/// (cooperative) that runs it. Both live in `[0, AO_NUM_MAX)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Priority {
    pub ao: u8,
    pub task: u8,
}

/// The scheduler's object-safe view of an [`ActiveObject<C>`]: every
/// operation it needs without naming `C`.
pub trait AoDyn: Send {
    fn name(&self) -> &'static str;
    fn prio(&self) -> Priority;
    fn is_empty(&self) -> bool;
    fn len(&self) -> usize;
    /// The id of the most recently dispatched event, or `None` before the
    /// first one. Diagnostic only — read by the fault handler's queue dump.
    fn last_event(&self) -> Option<i32>;
    fn ctor_called(&self) -> bool;
    /// Drives the embedded HSM's `init` transition. Must run exactly once
    /// before the first [`Self::dispatch_one`].
    fn ctor(&mut self, init_event: &Event);
    fn post_back(&mut self, pools: &mut EventPools, event: EventBox, margin: usize) -> PushRc;
    fn post_front(&mut self, pools: &mut EventPools, event: EventBox, margin: usize) -> PushRc;
    /// Pops one event and runs it through the embedded HSM. Panics if the
    /// queue is empty; callers only invoke this after confirming the ready
    /// bit is set.
    fn dispatch_one(&mut self, pools: &mut EventPools);
    /// Pops and frees every queued event without dispatching, for `stop`.
    fn drain_and_free(&mut self, pools: &mut EventPools);
}

/// A long-lived entity owning a hierarchical state machine, a private FIFO
/// of events, and a priority.
pub struct ActiveObject<C> {
    ctx: C,
    hsm: Hsm<C>,
    queue: BoundedQueue<EventBox>,
    name: &'static str,
    prio: Priority,
    ctor_called: bool,
    stopped: bool,
    last_event: Option<i32>,
}

impl<C> ActiveObject<C> {
    pub fn new(name: &'static str, prio: Priority, initial: State<C>, ctx: C, queue_capacity: usize) -> Self {
        ActiveObject {
            ctx,
            hsm: Hsm::ctor(initial),
            queue: BoundedQueue::with_capacity(queue_capacity),
            name,
            prio,
            ctor_called: false,
            stopped: false,
            last_event: None,
        }
    }

    pub fn ctx(&self) -> &C {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut C {
        &mut self.ctx
    }

    /// Drives the HSM's `init` transition. Must run exactly once before any
    /// dispatch; `start` calls this for the caller.
    pub fn ctor(&mut self, init_event: &Event) {
        assert!(!self.ctor_called, "am_ao_ctor: already constructed");
        self.hsm.init(&mut self.ctx, init_event);
        self.ctor_called = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl<C: Send> AoDyn for ActiveObject<C> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn prio(&self) -> Priority {
        self.prio
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn last_event(&self) -> Option<i32> {
        self.last_event
    }

    fn ctor_called(&self) -> bool {
        self.ctor_called
    }

    fn ctor(&mut self, init_event: &Event) {
        ActiveObject::ctor(self, init_event);
    }

    fn post_back(&mut self, pools: &mut EventPools, event: EventBox, margin: usize) -> PushRc {
        push_back_x(pools, &mut self.queue, event, margin)
    }

    fn post_front(&mut self, pools: &mut EventPools, event: EventBox, margin: usize) -> PushRc {
        push_front_x(pools, &mut self.queue, event, margin)
    }

    fn dispatch_one(&mut self, pools: &mut EventPools) {
        assert!(self.ctor_called, "am_ao_dispatch: ctor was never called");
        let event = self.queue.pop_front().expect("dispatch_one called on an empty queue");
        let hsm = &mut self.hsm;
        let ctx = &mut self.ctx;
        let last_event = &mut self.last_event;
        pools.pop_front_and_free(event, |e| {
            *last_event = Some(e.id());
            let ev = Event::new(e.id(), e.payload());
            hsm.dispatch(ctx, &ev);
        });
    }

    fn drain_and_free(&mut self, pools: &mut EventPools) {
        while let Some(e) = self.queue.pop_front() {
            pools.free(e);
        }
    }
}

/// Array of AO slots indexed by `prio.ao`, plus the ready bitmap both
/// back-ends share and the owning task id each slot was registered with.
pub struct AoRegistry {
    slots: Vec<Option<Box<dyn AoDyn>>>,
    owner_task: Vec<Option<usize>>,
    ready: BitSet64,
    running: u32,
}

impl AoRegistry {
    pub fn with_capacity(n: usize) -> Self {
        assert!(n as u32 <= BitSet64::CAPACITY, "registry capacity exceeds the ready bitmap width");
        let mut slots = Vec::with_capacity(n);
        slots.resize_with(n, || None);
        AoRegistry { slots, owner_task: vec![None; n], ready: BitSet64::new(), running: 0 }
    }

    pub fn running_count(&self) -> u32 {
        self.running
    }

    /// Registers `ao` in its priority slot, which must be vacant.
    /// `owner_task` is the task id (from [`Pal::task_get_own_id`] on the
    /// cooperative back-end, [`Pal::task_create`]'s return on the
    /// preemptive one) that `stop` later checks the caller against.
    pub fn register(&mut self, ao: Box<dyn AoDyn>, owner_task: usize) {
        let p = ao.prio().ao as usize;
        assert!(self.slots[p].is_none(), "am_ao_start: priority slot already occupied");
        self.slots[p] = Some(ao);
        self.owner_task[p] = Some(owner_task);
        self.running += 1;
    }

    /// Clears the slot, the ready bit, and decrements the running count.
    /// Returns the removed AO so the caller can finish tearing it down.
    pub fn unregister(&mut self, prio: u8) -> Box<dyn AoDyn> {
        let ao = self.slots[prio as usize].take().expect("am_ao_stop: slot already empty");
        self.owner_task[prio as usize] = None;
        self.ready.clear(prio as u32);
        self.running -= 1;
        ao
    }

    pub fn owner_task_of(&self, prio: u8) -> Option<usize> {
        self.owner_task[prio as usize]
    }

    pub fn mark_ready(&mut self, prio: u8) {
        self.ready.set(prio as u32);
    }

    pub fn clear_ready(&mut self, prio: u8) {
        self.ready.clear(prio as u32);
    }

    pub fn slot_mut(&mut self, prio: u8) -> &mut dyn AoDyn {
        self.slots[prio as usize].as_deref_mut().expect("am_ao: priority slot is vacant")
    }

    pub fn ready_msb(&self) -> Option<u32> {
        self.ready.msb()
    }

    /// Iterates every occupied slot as `(prio, ao)`, for the fault
    /// handler's dumps.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &dyn AoDyn)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(p, slot)| slot.as_deref().map(|ao| (p as u8, ao)))
    }
}

/// Posts `event` to the AO at `prio`, marking it ready on acceptance.
/// Shared by both back-ends and by the pub/sub router's per-subscriber
/// delivery.
pub fn post_to(
    registry: &mut AoRegistry,
    pools: &mut EventPools,
    prio: u8,
    event: EventBox,
    margin: usize,
) -> PushRc {
    let rc = registry.slot_mut(prio).post_back(pools, event, margin);
    if rc == PushRc::OkWasEmpty {
        registry.mark_ready(prio);
    }
    rc
}

/// Single-threaded priority-select loop: runs at most one handler at a
/// time system-wide.
pub struct Cooperative {
    pub registry: AoRegistry,
}

impl Cooperative {
    pub fn new(capacity: usize) -> Self {
        Cooperative { registry: AoRegistry::with_capacity(capacity) }
    }

    /// Dispatches at most one event from the highest-priority ready AO.
    /// Returns `false` (after invoking the idle hook) when no AO is ready.
    pub fn run_all(&mut self, pools: &mut EventPools, pal: &dyn Pal) -> bool {
        pal.crit_enter();
        let p = match self.registry.ready_msb() {
            Some(p) => p,
            None => {
                pal.on_idle();
                pal.crit_exit();
                return false;
            }
        };
        pal.crit_exit();

        let ao = self.registry.slot_mut(p as u8);
        ao.dispatch_one(pools);

        pal.crit_enter();
        if self.registry.slot_mut(p as u8).is_empty() {
            self.registry.clear_ready(p as u8);
        }
        pal.crit_exit();
        true
    }

    /// Registers and constructs `ao`. The cooperative scheduler runs every
    /// AO on the thread that calls `start`/`run_all`/`stop`, so that
    /// thread's own id (not `prio.task`, which is only ever advisory here)
    /// is recorded as the owner `stop` later checks against.
    pub fn start<C: Send + 'static>(&mut self, mut ao: ActiveObject<C>, init_event: &Event, pal: &dyn Pal) {
        ao.ctor(init_event);
        self.registry.register(Box::new(ao), pal.task_get_own_id());
    }

    /// Tears the AO at `prio` down: asserts the caller is the AO's own
    /// owning task, unsubscribes it from every pub/sub id, frees its queued
    /// events, then clears the registry slot.
    pub fn stop(&mut self, prio: u8, pools: &mut EventPools, pal: &dyn Pal, table: &mut SubscribeTable) {
        log::debug!("am_ao_stop: prio={prio}");
        let owner = self.registry.owner_task_of(prio);
        if owner != Some(pal.task_get_own_id()) {
            ao_fault("am_ao_stop: stop called from a foreign task", &self.registry, pools);
        }
        let ao_prio = self.registry.slot_mut(prio).prio();
        table.unsubscribe_all(ao_prio);
        let mut ao = self.registry.unregister(prio);
        ao.drain_and_free(pools);
    }
}

/// Each AO owns a host task. The task body waits on its own PAL
/// notification, pops one event, dispatches it, and loops until `stop`
/// clears its slot.
pub struct Preemptive {
    registry: Arc<Mutex<AoRegistry>>,
    pools: Arc<Mutex<EventPools<'static>>>,
    pal: Arc<dyn Pal>,
}

impl Preemptive {
    pub fn new(capacity: usize, pools: Arc<Mutex<EventPools<'static>>>, pal: Arc<dyn Pal>) -> Self {
        Preemptive { registry: Arc::new(Mutex::new(AoRegistry::with_capacity(capacity))), pools, pal }
    }

    pub fn registry(&self) -> &Arc<Mutex<AoRegistry>> {
        &self.registry
    }

    /// Spawns `ao`'s task first so its real owning-task id (the value
    /// [`Pal::task_create`] returns, not the advisory `prio.task`) is known
    /// before the slot is registered, then drives `init` inside that task
    /// body once it has cleared the one-shot startup barrier.
    pub fn start<C: Send + 'static>(&self, name: &'static str, prio: Priority, ao: ActiveObject<C>, init_event_id: i32) {
        log::debug!("am_ao_start: name={name} prio={}/{}", prio.ao, prio.task);
        let registry = Arc::clone(&self.registry);
        let pools = Arc::clone(&self.pools);
        let registry_for_task = Arc::clone(&self.registry);
        let pal_for_wait = Arc::clone(&self.pal);
        let task_id = self.pal.task_create(
            name,
            prio.task,
            0,
            Box::new(move || {
                pal_for_wait.task_wait_all();
                {
                    let init_event = Event::new(init_event_id, &[]);
                    let mut registry = registry_for_task.lock().unwrap();
                    registry.slot_mut(prio.ao).ctor(&init_event);
                }
                loop {
                    pal_for_wait.task_wait();
                    let mut registry = registry_for_task.lock().unwrap();
                    if registry.owner_task_of(prio.ao).is_none() {
                        break;
                    }
                    let ao = registry.slot_mut(prio.ao);
                    if ao.is_empty() {
                        continue;
                    }
                    let mut pools = pools.lock().unwrap();
                    ao.dispatch_one(&mut pools);
                    if ao.is_empty() {
                        registry.clear_ready(prio.ao);
                    }
                }
            }),
        );
        let mut registry = registry.lock().unwrap();
        registry.register(Box::new(ao), task_id);
    }

    /// Must be called from the AO's own task — `stop` asserts this via
    /// [`Pal::task_get_own_id`] rather than trusting the caller, since a
    /// foreign-task stop would tear down a queue another thread might still
    /// be dispatching from.
    pub fn stop(&self, prio: u8, table: &mut SubscribeTable) {
        let mut registry = self.registry.lock().unwrap();
        let mut pools = self.pools.lock().unwrap();
        let owner = registry.owner_task_of(prio);
        if owner != Some(self.pal.task_get_own_id()) {
            ao_fault("am_ao_stop: stop called from a foreign task", &registry, &pools);
        }
        let ao_prio = registry.slot_mut(prio).prio();
        table.unsubscribe_all(ao_prio);
        let mut ao = registry.unregister(prio);
        ao.drain_and_free(&mut pools);
    }

    pub fn unlock_start_barrier(&self) {
        self.pal.unlock_start_barrier();
    }
}
