use super::{
    Binding, ContentFn, HistoryKind, ScError, StateChart, StateId, StateKind, TransitionDef,
    TransitionId, TransitionKind,
};
use crate::event::{Event, Origin, descriptor_matches};
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use log::{error, trace};
use smallvec::SmallVec;
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Default cap on the number of microsteps in a single macrostep.
///
/// Eventless transitions can form cycles that never quiesce; when a
/// macrostep exceeds the cap, an `error.execution` event is raised and the
/// macrostep is halted.
pub const DEFAULT_STEP_LIMIT: usize = 1024;

// Insertion-ordered set of states with constant-time membership tests.
//
// The configuration and the exit and entry sets are kept in insertion order
// and sorted by document order only at the point they are consumed.
#[derive(Clone, Default)]
pub(crate) struct OrderedSet {
    items: SmallVec<[StateId; 8]>,
    index: HashSet<StateId>,
}

impl OrderedSet {
    pub(crate) fn insert(&mut self, state: StateId) {
        if self.index.insert(state) {
            self.items.push(state);
        }
    }

    pub(crate) fn remove(&mut self, state: StateId) {
        if self.index.remove(&state) {
            self.items.retain(|s| *s != state);
        }
    }

    pub(crate) fn contains(&self, state: StateId) -> bool {
        self.index.contains(&state)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = StateId> + '_ {
        self.items.iter().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }
}

/// A cloneable handle for enqueuing external events on a [`StateChart`]'s
/// queue from other threads.
///
/// Enqueuing never processes events: the interpreter consumes them at the
/// next [`StateChart::run`].
#[derive(Clone)]
pub struct EventSender {
    queue: Arc<Mutex<VecDeque<Event>>>,
}

impl EventSender {
    /// Enqueues an event, stamping it with [`Origin::External`].
    pub fn send(&self, mut event: Event) {
        event.origin = Origin::External;
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(event);
    }
}

/// The capabilities available to host executable content while it runs.
pub struct Effects<'a> {
    event: Option<&'a Event>,
    internal: &'a mut VecDeque<Event>,
}

impl Effects<'_> {
    /// The event that triggered the current step, if any.
    pub fn event(&self) -> Option<&Event> {
        self.event
    }

    /// Raises an event on the internal queue, stamped [`Origin::Internal`].
    /// It is consumed before the next external event.
    pub fn raise(&mut self, mut event: Event) {
        event.origin = Origin::Internal;
        self.internal.push_back(event);
    }
}

fn event_matches(transition: &TransitionDef, event: Option<&Event>) -> bool {
    match event {
        None => transition.events.is_empty(),
        Some(event) => {
            !transition.events.is_empty()
                && transition
                    .events
                    .iter()
                    .any(|descriptor| descriptor_matches(descriptor, &event.name))
        }
    }
}

impl StateChart {
    /// Starts the statechart by entering the root's default initial state,
    /// then runs microsteps to quiescence.
    ///
    /// Fails if the statechart has already been started.
    pub fn start(&mut self) -> Result<(), ScError> {
        self.begin()?;
        let def = Arc::clone(&self.def);
        let Some(initial) = def.compound_initial(def.root) else {
            return Err(ScError::EmptyChart);
        };
        trace!("start statechart");
        let targets: SmallVec<[StateId; 4]> =
            def.transition(initial).targets.iter().copied().collect();
        self.initial_entry(&targets);
        self.stabilize();
        self.finish_macrostep();
        if !self.running {
            self.exit_interpreter();
        }
        Ok(())
    }

    /// Starts the statechart directly in the state with the given id, rather
    /// than in the root's default initial state.
    ///
    /// Compound and parallel states along the way are entered as if the seed
    /// state were the target of a transition from the root.
    pub fn start_in(&mut self, id: &str) -> Result<(), ScError> {
        let Some(&target) = self.def.ids.get(id) else {
            return Err(ScError::UnknownId(id.to_owned()));
        };
        if target == self.def.root {
            return Err(ScError::RootTarget);
        }
        self.begin()?;
        trace!("start statechart in state {id:?}");
        self.initial_entry(&[target]);
        self.stabilize();
        self.finish_macrostep();
        if !self.running {
            self.exit_interpreter();
        }
        Ok(())
    }

    /// Enqueues an event on the external queue, stamping it with
    /// [`Origin::External`].
    ///
    /// The event is not processed until [`StateChart::run`] is called.
    pub fn send(&mut self, mut event: Event) {
        event.origin = Origin::External;
        self.external_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(event);
    }

    /// Enqueues an event on the internal queue, stamping it with
    /// [`Origin::Internal`].
    ///
    /// Internal events are consumed ahead of every external event. Host
    /// executable content raises events this way (see [`Effects::raise`]).
    pub fn send_internal(&mut self, mut event: Event) {
        event.origin = Origin::Internal;
        self.internal_queue.push_back(event);
    }

    /// Returns a handle for enqueuing external events from other threads.
    pub fn sender(&self) -> EventSender {
        EventSender {
            queue: Arc::clone(&self.external_queue),
        }
    }

    /// Clears the running flag.
    ///
    /// The next [`StateChart::run`] observes the flag between steps and shuts
    /// the interpreter down, running the exit content of all active states.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Processes queued events until quiescence: pending internal work is
    /// drained first, then one macrostep per queued external event.
    ///
    /// Returns once the external queue is empty or the statechart has
    /// stopped running. Fails if the statechart has not been started.
    pub fn run(&mut self) -> Result<(), ScError> {
        if !self.started {
            return Err(ScError::NotStarted);
        }
        if self.running && !self.internal_queue.is_empty() {
            self.stabilize();
            self.finish_macrostep();
        }
        while self.running {
            let next = self
                .external_queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            let Some(event) = next else { break };
            trace!("processing external event {:?}", event.name);
            let enabled = self.select_transitions(Some(&event));
            if !enabled.is_empty() {
                self.microstep(&enabled, Some(&event));
            }
            self.stabilize();
            self.finish_macrostep();
        }
        if !self.running {
            self.exit_interpreter();
        }
        Ok(())
    }

    /// Enqueues an external event and processes the queue to quiescence.
    pub fn dispatch(&mut self, event: Event) -> Result<(), ScError> {
        self.send(event);
        self.run()
    }

    fn begin(&mut self) -> Result<(), ScError> {
        if self.started {
            return Err(ScError::AlreadyStarted);
        }
        self.started = true;
        self.running = true;
        if self.def.binding == Binding::Early {
            let def = Arc::clone(&self.def);
            let states = (0..def.states.len())
                .map(|index| StateId(index as u16))
                .sorted_by_key(|&s| def.state(s).order);
            for s in states {
                if let Some(init) = &def.state(s).data_init {
                    self.run_content(std::slice::from_ref(init), None);
                }
            }
        }
        Ok(())
    }

    // Enters the given seed states as if they were the targets of a
    // transition from the root.
    fn initial_entry(&mut self, targets: &[StateId]) {
        let mut to_enter = OrderedSet::default();
        let mut default_entry: HashSet<StateId> = HashSet::new();
        let mut history_content: HashMap<StateId, TransitionId> = HashMap::new();
        for &s in targets {
            self.add_descendant_states_to_enter(
                s,
                &mut to_enter,
                &mut default_entry,
                &mut history_content,
            );
        }
        let root = self.def.root;
        for &s in targets {
            self.add_ancestor_states_to_enter(
                s,
                root,
                &mut to_enter,
                &mut default_entry,
                &mut history_content,
            );
        }
        self.enter_sorted(&to_enter, &default_entry, &history_content, None);
    }

    // Runs microsteps until no eventless transition is enabled and the
    // internal queue is empty, bounded by the per-macrostep step cap.
    // Eventless transitions always take priority over internal events.
    //
    // The cap counts loop iterations rather than microsteps, so that a
    // guard failing on every selection attempt cannot keep the macrostep
    // alive by raising one error event per iteration.
    fn stabilize(&mut self) {
        let mut steps: usize = 0;
        while self.running {
            if steps >= self.def.step_limit {
                self.abort_macrostep();
                return;
            }
            steps += 1;
            let enabled = self.select_transitions(None);
            if !enabled.is_empty() {
                self.microstep(&enabled, None);
                continue;
            }
            let Some(event) = self.internal_queue.pop_front() else {
                trace!("macrostep quiescent");
                return;
            };
            trace!("processing internal event {:?}", event.name);
            let enabled = self.select_transitions(Some(&event));
            if !enabled.is_empty() {
                self.microstep(&enabled, Some(&event));
            }
        }
    }

    fn abort_macrostep(&mut self) {
        error!(
            "macrostep halted after exceeding the microstep cap ({})",
            self.def.step_limit
        );
        self.internal_queue.push_back(Event::execution_error(format!(
            "macrostep exceeded {} microsteps",
            self.def.step_limit
        )));
    }

    // States entered since the last macrostep boundary would be invoked
    // here; the invoke lifecycle is an external concern, so only the
    // bookkeeping set is maintained.
    fn finish_macrostep(&mut self) {
        if !self.states_to_invoke.is_empty() {
            trace!("{} states pending invocation", self.states_to_invoke.len());
            self.states_to_invoke.clear();
        }
    }

    // Runs the exit content of all active states, deepest first, once the
    // running flag has been cleared.
    fn exit_interpreter(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let def = Arc::clone(&self.def);
        let ordered: Vec<StateId> = self
            .configuration
            .iter()
            .sorted_by_key(|&s| Reverse(def.state(s).order))
            .collect();
        for s in ordered {
            self.run_content(&def.state(s).on_exit, None);
            self.configuration.remove(s);
        }
        trace!("interpreter exited");
    }

    // Selects the first enabled transition for each atomic state in the
    // configuration, walking from the state outward through its ancestors,
    // then prunes the set of conflicting transitions.
    //
    // With `event` equal to `None`, only eventless transitions are
    // considered.
    fn select_transitions(&mut self, event: Option<&Event>) -> SmallVec<[TransitionId; 4]> {
        let def = Arc::clone(&self.def);
        let atoms: SmallVec<[StateId; 8]> = self
            .configuration
            .iter()
            .filter(|&s| def.is_atomic(s))
            .sorted_by_key(|&s| def.state(s).order)
            .collect();
        let mut enabled: SmallVec<[TransitionId; 4]> = SmallVec::new();
        'atoms: for s in atoms {
            for state in std::iter::once(s).chain(def.proper_ancestors(s, None)) {
                for &t in &def.state(state).transitions {
                    if !event_matches(def.transition(t), event) {
                        continue;
                    }
                    if self.guard_passes(t, event) {
                        if !enabled.contains(&t) {
                            enabled.push(t);
                        }
                        continue 'atoms;
                    }
                }
            }
        }
        self.remove_conflicting(enabled)
    }

    // A failing guard disables its transition; the failure is surfaced as an
    // `error.execution` event on the internal queue.
    fn guard_passes(&mut self, transition: TransitionId, event: Option<&Event>) -> bool {
        let def = Arc::clone(&self.def);
        match &def.transition(transition).guard {
            None => true,
            Some(guard) => match guard(event) {
                Ok(enabled) => enabled,
                Err(failure) => {
                    error!("guard of transition {transition:?} failed: {failure}");
                    self.internal_queue
                        .push_back(Event::execution_error(failure.to_string()));
                    false
                }
            },
        }
    }

    // Two transitions conflict when their exit sets intersect. The transition
    // selected by the earlier atomic state wins, unless the later one was
    // selected by a descendant of the earlier one's source, which preempts it.
    // Targetless transitions have empty exit sets and never conflict.
    fn remove_conflicting(
        &self,
        enabled: SmallVec<[TransitionId; 4]>,
    ) -> SmallVec<[TransitionId; 4]> {
        let mut filtered: SmallVec<[TransitionId; 4]> = SmallVec::new();
        for &t1 in &enabled {
            let mut preempted = false;
            let mut to_remove: SmallVec<[TransitionId; 4]> = SmallVec::new();
            let exits1 = self.compute_exit_set(&[t1]);
            for &t2 in &filtered {
                let exits2 = self.compute_exit_set(&[t2]);
                if exits1.iter().any(|s| exits2.contains(s)) {
                    if self.def.is_descendant(
                        self.def.transition(t1).source,
                        self.def.transition(t2).source,
                    ) {
                        to_remove.push(t2);
                    } else {
                        preempted = true;
                        break;
                    }
                }
            }
            if !preempted {
                filtered.retain(|t| !to_remove.contains(t));
                filtered.push(t1);
            }
        }
        filtered
    }

    // Dereferences history pseudo-states to their recorded value, or to their
    // default targets when the parent has never been exited.
    fn effective_targets(&self, transition: TransitionId) -> SmallVec<[StateId; 4]> {
        let mut targets: SmallVec<[StateId; 4]> = SmallVec::new();
        for &target in &self.def.transition(transition).targets {
            match self.def.state(target).kind {
                StateKind::History { default, .. } => {
                    let resolved = match self.history_values.get(&target) {
                        Some(stored) => stored.as_slice(),
                        None => self.def.transition(default).targets.as_slice(),
                    };
                    for &s in resolved {
                        if !targets.contains(&s) {
                            targets.push(s);
                        }
                    }
                }
                _ => {
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
            }
        }
        targets
    }

    // The domain of a transition is the innermost state left undisturbed by
    // it: an internal transition from a compound state into its own
    // descendants is confined to the source, every other targeted transition
    // to the least common compound ancestor of its source and targets.
    // Targetless transitions have no domain and exit nothing.
    fn transition_domain(&self, transition: TransitionId) -> Option<StateId> {
        let def = self.def.transition(transition);
        let targets = self.effective_targets(transition);
        if targets.is_empty() {
            return None;
        }
        if def.kind == TransitionKind::Internal
            && self.def.is_compound(def.source)
            && targets
                .iter()
                .all(|&s| self.def.is_descendant(s, def.source))
        {
            return Some(def.source);
        }
        Some(self.def.find_lcca(def.source, &targets))
    }

    // Every state in the configuration that is a descendant of some
    // transition's domain is exited.
    fn compute_exit_set(&self, transitions: &[TransitionId]) -> OrderedSet {
        let mut exits = OrderedSet::default();
        for &t in transitions {
            if let Some(domain) = self.transition_domain(t) {
                for s in self.configuration.iter() {
                    if self.def.is_descendant(s, domain) {
                        exits.insert(s);
                    }
                }
            }
        }
        exits
    }

    fn microstep(&mut self, enabled: &[TransitionId], event: Option<&Event>) {
        trace!("microstep with {} transitions", enabled.len());
        self.exit_states(enabled, event);
        self.execute_transition_content(enabled, event);
        self.enter_states_for(enabled, event);
    }

    fn exit_states(&mut self, enabled: &[TransitionId], event: Option<&Event>) {
        let def = Arc::clone(&self.def);
        let exits = self.compute_exit_set(enabled);
        // Exit order: deepest first, parallel children in reverse document order.
        let ordered: Vec<StateId> = exits
            .iter()
            .sorted_by_key(|&s| Reverse(def.state(s).order))
            .collect();
        for &s in &ordered {
            self.states_to_invoke.remove(s);
        }
        // Record history before any exit content runs.
        for &s in &ordered {
            for &history in &def.state(s).histories {
                let stored: Vec<StateId> = match def.state(history).kind {
                    StateKind::History {
                        kind: HistoryKind::Deep,
                        ..
                    } => self
                        .configuration
                        .iter()
                        .filter(|&s0| def.is_atomic(s0) && def.is_descendant(s0, s))
                        .collect(),
                    _ => self
                        .configuration
                        .iter()
                        .filter(|&s0| def.state(s0).parent == Some(s))
                        .collect(),
                };
                self.history_values.insert(history, stored);
            }
        }
        for &s in &ordered {
            trace!("exit state {:?}", def.state(s).id);
            self.run_content(&def.state(s).on_exit, event);
            self.configuration.remove(s);
        }
    }

    fn execute_transition_content(&mut self, enabled: &[TransitionId], event: Option<&Event>) {
        let def = Arc::clone(&self.def);
        for &t in enabled
            .iter()
            .sorted_by_key(|&&t| def.transition(t).order)
        {
            self.run_content(&def.transition(t).content, event);
        }
    }

    fn enter_states_for(&mut self, enabled: &[TransitionId], event: Option<&Event>) {
        let def = Arc::clone(&self.def);
        let mut to_enter = OrderedSet::default();
        let mut default_entry: HashSet<StateId> = HashSet::new();
        let mut history_content: HashMap<StateId, TransitionId> = HashMap::new();
        for &t in enabled {
            for &target in &def.transition(t).targets {
                self.add_descendant_states_to_enter(
                    target,
                    &mut to_enter,
                    &mut default_entry,
                    &mut history_content,
                );
            }
            if let Some(domain) = self.transition_domain(t) {
                for target in self.effective_targets(t) {
                    self.add_ancestor_states_to_enter(
                        target,
                        domain,
                        &mut to_enter,
                        &mut default_entry,
                        &mut history_content,
                    );
                }
            }
        }
        self.enter_sorted(&to_enter, &default_entry, &history_content, event);
    }

    // Adds a target state and everything that must be entered beneath it:
    // the default initial chain of compound states, every region of parallel
    // states, and the recorded or default value of history pseudo-states.
    fn add_descendant_states_to_enter(
        &self,
        state: StateId,
        to_enter: &mut OrderedSet,
        default_entry: &mut HashSet<StateId>,
        history_content: &mut HashMap<StateId, TransitionId>,
    ) {
        if let StateKind::History { default, .. } = self.def.state(state).kind {
            let parent = self.def.state(state).parent;
            if let Some(stored) = self.history_values.get(&state) {
                for &s in stored {
                    self.add_descendant_states_to_enter(s, to_enter, default_entry, history_content);
                }
                if let Some(parent) = parent {
                    for &s in stored {
                        self.add_ancestor_states_to_enter(
                            s,
                            parent,
                            to_enter,
                            default_entry,
                            history_content,
                        );
                    }
                }
            } else {
                let targets = &self.def.transition(default).targets;
                if let Some(parent) = parent {
                    history_content.insert(parent, default);
                }
                for &s in targets {
                    self.add_descendant_states_to_enter(s, to_enter, default_entry, history_content);
                }
                if let Some(parent) = parent {
                    for &s in targets {
                        self.add_ancestor_states_to_enter(
                            s,
                            parent,
                            to_enter,
                            default_entry,
                            history_content,
                        );
                    }
                }
            }
            return;
        }
        to_enter.insert(state);
        if let StateKind::Compound { initial } = self.def.state(state).kind {
            default_entry.insert(state);
            let targets = &self.def.transition(initial).targets;
            for &s in targets {
                self.add_descendant_states_to_enter(s, to_enter, default_entry, history_content);
            }
            for &s in targets {
                self.add_ancestor_states_to_enter(
                    s,
                    state,
                    to_enter,
                    default_entry,
                    history_content,
                );
            }
        } else if self.def.is_parallel(state) {
            for &child in &self.def.state(state).children {
                if !to_enter.iter().any(|s| self.def.is_descendant(s, child)) {
                    self.add_descendant_states_to_enter(
                        child,
                        to_enter,
                        default_entry,
                        history_content,
                    );
                }
            }
        }
    }

    // Adds the ancestors of a target up to but excluding the domain, filling
    // in the sibling regions of any parallel ancestor crossed on the way.
    fn add_ancestor_states_to_enter(
        &self,
        state: StateId,
        stop: StateId,
        to_enter: &mut OrderedSet,
        default_entry: &mut HashSet<StateId>,
        history_content: &mut HashMap<StateId, TransitionId>,
    ) {
        for ancestor in self.def.proper_ancestors(state, Some(stop)) {
            to_enter.insert(ancestor);
            if self.def.is_parallel(ancestor) {
                for &child in &self.def.state(ancestor).children {
                    if !to_enter.iter().any(|s| self.def.is_descendant(s, child)) {
                        self.add_descendant_states_to_enter(
                            child,
                            to_enter,
                            default_entry,
                            history_content,
                        );
                    }
                }
            }
        }
    }

    fn enter_sorted(
        &mut self,
        to_enter: &OrderedSet,
        default_entry: &HashSet<StateId>,
        history_content: &HashMap<StateId, TransitionId>,
        event: Option<&Event>,
    ) {
        let def = Arc::clone(&self.def);
        // Entry order: ancestors before descendants, document order among siblings.
        let ordered: Vec<StateId> = to_enter
            .iter()
            .sorted_by_key(|&s| def.state(s).order)
            .collect();
        for s in ordered {
            trace!("enter state {:?}", def.state(s).id);
            self.configuration.insert(s);
            self.states_to_invoke.insert(s);
            if def.binding == Binding::Late && self.entered_once.insert(s) {
                if let Some(init) = &def.state(s).data_init {
                    self.run_content(std::slice::from_ref(init), event);
                }
            }
            self.run_content(&def.state(s).on_entry, event);
            if default_entry.contains(&s) {
                if let Some(initial) = def.compound_initial(s) {
                    self.run_content(&def.transition(initial).content, event);
                }
            }
            if let Some(&default) = history_content.get(&s) {
                self.run_content(&def.transition(default).content, event);
            }
            if matches!(def.state(s).kind, StateKind::Final) {
                if let Some(parent) = def.state(s).parent {
                    if parent == def.root {
                        trace!("top-level final state {:?} entered", def.state(s).id);
                        self.running = false;
                    } else {
                        let done = Event::done_state(
                            &def.state(parent).id,
                            def.state(s).done_data.clone(),
                        );
                        self.internal_queue.push_back(done);
                        if let Some(grandparent) = def.state(parent).parent {
                            if def.is_parallel(grandparent)
                                && def
                                    .state(grandparent)
                                    .children
                                    .iter()
                                    .all(|&c| self.in_final_state(c))
                            {
                                self.internal_queue.push_back(Event::done_state(
                                    &def.state(grandparent).id,
                                    None,
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    // A compound state is in a final state when one of its final children is
    // active; a parallel state when all of its regions are.
    fn in_final_state(&self, state: StateId) -> bool {
        match self.def.state(state).kind {
            StateKind::Compound { .. } => self.def.state(state).children.iter().any(|&c| {
                matches!(self.def.state(c).kind, StateKind::Final) && self.configuration.contains(c)
            }),
            StateKind::Parallel => self
                .def
                .state(state)
                .children
                .iter()
                .all(|&c| self.in_final_state(c)),
            _ => false,
        }
    }

    // A failing content hook raises `error.execution` and the step continues.
    fn run_content(&mut self, contents: &[ContentFn], event: Option<&Event>) {
        for content in contents {
            let mut effects = Effects {
                event,
                internal: &mut self.internal_queue,
            };
            if let Err(failure) = content(&mut effects) {
                error!("executable content failed: {failure}");
                self.internal_queue
                    .push_back(Event::execution_error(failure.to_string()));
            }
        }
    }
}
