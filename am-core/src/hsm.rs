//! Hierarchical state machine dispatcher: UML-statechart semantics over
//! plain Rust functions.
//!
//! A state is `{handler, instance, parent}`: the handler function, a
//! submachine instance number, and a direct reference to the immediate
//! ancestor. The ancestor is data, not a re-entry into the dispatch path —
//! `State::parent_state` calls a plain `fn(instance) -> Option<State<C>>`
//! supplied once at construction, so every topology walk (LCA computation,
//! `is_in`, the destructor unwind) is a pointer read, never a synthetic
//! event sent back through a state's own `StateFn`. `Outcome::Super` keeps
//! its original job of bubbling an unhandled *application* event one level
//! up; the dispatcher now resolves "one level up" itself from the state's
//! own data instead of asking the handler a second, fake question.

use am_sys::{EVT_ENTRY, EVT_EXIT, EVT_INIT};

/// A dispatcher-level event: just an id and a payload view. Pooled,
/// refcounted application events (`am_core::event::EventBox`) are unwrapped
/// into this before reaching a state handler — the dispatcher has no
/// business with allocation or refcounting.
pub struct Event<'a> {
    pub id: i32,
    pub payload: &'a [u8],
}

impl<'a> Event<'a> {
    pub fn new(id: i32, payload: &'a [u8]) -> Self {
        Event { id, payload }
    }

    fn entry() -> Event<'static> {
        Event { id: EVT_ENTRY, payload: &[] }
    }

    fn exit() -> Event<'static> {
        Event { id: EVT_EXIT, payload: &[] }
    }

    fn init() -> Event<'static> {
        Event { id: EVT_INIT, payload: &[] }
    }
}

pub type StateFn<C> = fn(ctx: &mut C, hsm: &mut Hsm<C>, instance: u16, event: &Event) -> Outcome<C>;

/// A state's immediate-ancestor lookup, keyed by its own instance number so
/// a submachine state can answer differently per instance (see the
/// `counter`/`counter_top` fixture in this module's tests).
pub type ParentFn<C> = fn(instance: u16) -> Option<State<C>>;

/// Identifies one state: its handler, which submachine instance is active,
/// and where to find its immediate ancestor. Two states are equal iff
/// `handler` and `instance` both match — `parent` is derived data the
/// handler's author attaches once, not independent identity.
pub struct State<C> {
    pub handler: StateFn<C>,
    pub instance: u16,
    pub parent: Option<ParentFn<C>>,
}

impl<C> State<C> {
    pub fn new(handler: StateFn<C>, instance: u16, parent: Option<ParentFn<C>>) -> Self {
        State { handler, instance, parent }
    }

    /// This state's immediate ancestor, or `None` at the synthetic root.
    /// A plain data read: no event is built or dispatched.
    pub fn parent_state(&self) -> Option<State<C>> {
        self.parent.and_then(|f| f(self.instance))
    }
}

impl<C> Clone for State<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for State<C> {}

impl<C> PartialEq for State<C> {
    fn eq(&self, other: &Self) -> bool {
        self.handler as usize == other.handler as usize && self.instance == other.instance
    }
}

impl<C> Eq for State<C> {}

impl<C> core::fmt::Debug for State<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("State")
            .field("handler", &(self.handler as usize))
            .field("instance", &self.instance)
            .finish()
    }
}

/// What a state handler reports back to the dispatcher.
pub enum Outcome<C> {
    /// The event was consumed; no bubbling, no transition.
    Handled,
    /// Not handled at this level; the dispatcher looks up the current
    /// state's own `parent` to decide where to retry, stopping once that
    /// is `None` (the synthetic root).
    Super,
    /// Take a transition to `State`, exiting up to the LCA and entering
    /// back down, then running nested `INIT`.
    Tran(State<C>),
    /// As `Tran`, then re-deliver the triggering event exactly once to the
    /// new leaf.
    TranRedispatch(State<C>),
}

impl<C> Clone for Outcome<C> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Handled => Outcome::Handled,
            Outcome::Super => Outcome::Super,
            Outcome::Tran(s) => Outcome::Tran(*s),
            Outcome::TranRedispatch(s) => Outcome::TranRedispatch(*s),
        }
    }
}

impl<C> Copy for Outcome<C> {}

impl<C> core::fmt::Debug for Outcome<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Outcome::Handled => write!(f, "Handled"),
            Outcome::Super => write!(f, "Super"),
            Outcome::Tran(s) => write!(f, "Tran({:?})", s),
            Outcome::TranRedispatch(s) => write!(f, "TranRedispatch({:?})", s),
        }
    }
}

/// A hierarchical state machine over context type `C`. `C` typically holds
/// whatever data the states close over (an active object's private state);
/// the dispatcher itself is stateless beyond bookkeeping.
pub struct Hsm<C> {
    active: Option<State<C>>,
    /// Scratch space for the source side of a transition's ancestor chain,
    /// reused across dispatches to avoid allocating on the hot path.
    chain_buf: Vec<Option<State<C>>>,
    dispatch_in_progress: bool,
    init_called: bool,
    spy: Option<fn(&C, State<C>, &Event)>,
}

impl<C> Hsm<C> {
    /// Zeroes the record and remembers `initial` as the active state. Does
    /// **not** invoke it; call [`Self::init`] to run the initial
    /// transition.
    pub fn ctor(initial: State<C>) -> Self {
        Hsm {
            active: Some(initial),
            chain_buf: Vec::new(),
            dispatch_in_progress: false,
            init_called: false,
            spy: None,
        }
    }

    pub fn set_spy(&mut self, spy: fn(&C, State<C>, &Event)) {
        self.spy = Some(spy);
    }

    pub fn active(&self) -> State<C> {
        self.active.expect("hsm not constructed")
    }

    pub fn is_init_called(&self) -> bool {
        self.init_called
    }

    /// Invokes the initial state with `init_event`, which must answer
    /// `Tran(target)`, then runs the standard enter-from-root-to-target +
    /// nested-`INIT` sequence.
    pub fn init(&mut self, ctx: &mut C, init_event: &Event) {
        if self.init_called {
            crate::fault::fault_bare("am_hsm_init: hsm already initialized");
        }
        let initial = self.active.expect("ctor must run before init");
        match (initial.handler)(ctx, self, initial.instance, init_event) {
            Outcome::Tran(target) => {
                self.transition(ctx, None, target);
                self.init_called = true;
            }
            other => crate::fault::fault_bare(&format!(
                "am_hsm_init: initial state must respond to init with Tran, got {:?}",
                other
            )),
        }
    }

    /// Dispatches one event. Re-entrant calls (from inside a handler this
    /// call is already running) are a fatal error.
    pub fn dispatch(&mut self, ctx: &mut C, event: &Event) {
        if !self.init_called {
            crate::fault::fault_bare("am_hsm_dispatch: dispatch before init");
        }
        if self.dispatch_in_progress {
            crate::fault::fault_bare("am_hsm_dispatch: reentrant hsm dispatch");
        }
        self.dispatch_in_progress = true;
        self.dispatch_inner(ctx, event, false);
        self.dispatch_in_progress = false;
    }

    fn dispatch_inner(&mut self, ctx: &mut C, event: &Event, already_redispatched: bool) {
        let source = self.active.expect("active state missing");
        let mut cur = source;
        loop {
            if let Some(spy) = self.spy {
                spy(ctx, cur, event);
            }
            match (cur.handler)(ctx, self, cur.instance, event) {
                Outcome::Handled => return,
                Outcome::Super => match cur.parent_state() {
                    Some(parent) => cur = parent,
                    None => return,
                },
                Outcome::Tran(target) => {
                    self.transition(ctx, Some(source), target);
                    return;
                }
                Outcome::TranRedispatch(target) => {
                    if already_redispatched {
                        crate::fault::fault_bare("am_hsm_dispatch: redispatch of the same event more than once");
                    }
                    self.transition(ctx, Some(source), target);
                    self.dispatch_inner(ctx, event, true);
                    return;
                }
            }
        }
    }

    fn exit(&mut self, ctx: &mut C, state: State<C>) {
        match (state.handler)(ctx, self, state.instance, &Event::exit()) {
            Outcome::Handled => {}
            other => crate::fault::fault_bare(&format!("am_hsm_exit: EXIT handler must return Handled, got {:?}", other)),
        }
    }

    fn entry(&mut self, ctx: &mut C, state: State<C>) {
        match (state.handler)(ctx, self, state.instance, &Event::entry()) {
            Outcome::Handled => {}
            other => crate::fault::fault_bare(&format!("am_hsm_entry: ENTRY handler must return Handled, got {:?}", other)),
        }
    }

    fn run_init_chain(&mut self, ctx: &mut C, mut cur: State<C>) {
        loop {
            match (cur.handler)(ctx, self, cur.instance, &Event::init()) {
                Outcome::Handled => break,
                Outcome::Tran(next) => {
                    self.entry(ctx, next);
                    cur = next;
                }
                other => crate::fault::fault_bare(&format!("am_hsm_init: INIT handler returned invalid outcome: {:?}", other)),
            }
        }
        self.active = Some(cur);
    }

    /// `source == None` means "entering for the very first time" (used by
    /// [`Self::init`]): every ancestor of `target` down to `target` itself
    /// is entered, nothing is exited.
    fn transition(&mut self, ctx: &mut C, source: Option<State<C>>, target: State<C>) {
        if source == Some(target) {
            let s = target;
            self.exit(ctx, s);
            self.entry(ctx, s);
            self.run_init_chain(ctx, s);
            return;
        }

        self.chain_buf.clear();
        let mut s = source;
        loop {
            self.chain_buf.push(s);
            match s {
                None => break,
                Some(st) => s = st.parent_state(),
            }
        }

        let mut target_chain = Vec::new();
        let mut t = Some(target);
        loop {
            target_chain.push(t);
            match t {
                None => break,
                Some(st) => t = st.parent_state(),
            }
        }

        let i = match self.chain_buf.iter().position(|x| target_chain.contains(x)) {
            Some(i) => i,
            None => crate::fault::fault_bare("am_hsm_transition: no common ancestor — a parent fn never terminates at None"),
        };
        let lca = self.chain_buf[i];
        let j = target_chain.iter().position(|x| *x == lca).unwrap();

        for idx in 0..i {
            let st = self.chain_buf[idx].expect("exit list never includes the synthetic root");
            self.exit(ctx, st);
        }
        for idx in (0..j).rev() {
            let st = target_chain[idx].expect("entry list never includes the synthetic root");
            self.entry(ctx, st);
        }
        self.run_init_chain(ctx, target);
    }

    /// `true` if `query` is the active state or one of its ancestors. A
    /// pure data walk: no `ctx`, no handler invocation.
    pub fn is_in(&self, query: State<C>) -> bool {
        let mut cur = self.active;
        loop {
            match cur {
                Some(s) if s == query => return true,
                Some(s) => cur = s.parent_state(),
                None => return false,
            }
        }
    }

    /// Exits from the active state up through its ancestor chain, then
    /// clears the record.
    pub fn dtor(&mut self, ctx: &mut C) {
        let mut cur = self.active;
        while let Some(s) = cur {
            self.exit(ctx, s);
            cur = s.parent_state();
        }
        self.active = None;
        self.init_called = false;
    }
}

pub fn state_is_eq<C>(a: State<C>, b: State<C>) -> bool {
    a == b
}
