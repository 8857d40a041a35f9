use super::interpreter::{DEFAULT_STEP_LIMIT, OrderedSet};
use super::{
    Binding, ContentFn, Effects, GuardFn, HistoryKind, HostError, ScError, StateChart,
    StateChartDef, StateDef, StateId, StateKind, TransitionDef, TransitionId, TransitionKind,
};
use crate::event::{Event, Val};
use hashbrown::{HashMap, HashSet};
use log::info;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

enum BuildKind {
    // Compound or atomic, resolved at build time from the presence of children.
    State {
        initial: Option<String>,
        initial_content: Vec<ContentFn>,
    },
    Parallel,
    Final,
    History {
        kind: HistoryKind,
        defaults: Vec<String>,
        content: Vec<ContentFn>,
    },
}

struct BuildState {
    id: String,
    parent: Option<StateId>,
    kind: BuildKind,
    children: Vec<StateId>,
    histories: Vec<StateId>,
    transitions: Vec<TransitionId>,
    on_entry: Vec<ContentFn>,
    on_exit: Vec<ContentFn>,
    data_init: Option<ContentFn>,
    done_data: Option<Val>,
}

impl BuildState {
    fn new(id: String, parent: Option<StateId>, kind: BuildKind) -> Self {
        BuildState {
            id,
            parent,
            kind,
            children: Vec::new(),
            histories: Vec::new(),
            transitions: Vec::new(),
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            data_init: None,
            done_data: None,
        }
    }
}

struct BuildTransition {
    source: StateId,
    events: Vec<String>,
    guard: Option<GuardFn>,
    // Target id references, resolved at build time.
    targets: Vec<String>,
    kind: TransitionKind,
    content: Vec<ContentFn>,
}

/// Defines and builds a statechart.
///
/// States and transitions are added one at a time, in document order: the
/// order in which sibling elements are added is the order that breaks ties
/// everywhere in the interpreter. Transition targets are plain id references
/// and are resolved when the statechart is built, so forward references are
/// allowed.
pub struct StateChartBuilder {
    states: Vec<BuildState>,
    transitions: Vec<BuildTransition>,
    ids: HashMap<String, StateId>,
    binding: Binding,
    step_limit: usize,
}

impl Default for StateChartBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StateChartBuilder {
    const ROOT: StateId = StateId(0);

    /// The id carried by the root of every statechart.
    pub const ROOT_ID: &'static str = "root";

    /// Creates a new [`StateChartBuilder`].
    /// At creation, this will only have the root state with no children and no transitions.
    /// The root can be retrieved by [`StateChartBuilder::root`].
    pub fn new() -> Self {
        let root = BuildState::new(
            Self::ROOT_ID.to_owned(),
            None,
            BuildKind::State {
                initial: None,
                initial_content: Vec::new(),
            },
        );
        let mut ids = HashMap::new();
        ids.insert(Self::ROOT_ID.to_owned(), Self::ROOT);
        StateChartBuilder {
            states: vec![root],
            transitions: Vec::new(),
            ids,
            binding: Binding::Early,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    /// Gets the root of the statechart.
    /// This is created together with the [`StateChartBuilder`] by default.
    pub fn root(&self) -> StateId {
        Self::ROOT
    }

    fn state(&self, state: StateId) -> Result<&BuildState, ScError> {
        self.states
            .get(state.0 as usize)
            .ok_or(ScError::MissingState(state))
    }

    fn state_mut(&mut self, state: StateId) -> Result<&mut BuildState, ScError> {
        self.states
            .get_mut(state.0 as usize)
            .ok_or(ScError::MissingState(state))
    }

    fn insert_state(
        &mut self,
        parent: StateId,
        id: &str,
        kind: BuildKind,
    ) -> Result<StateId, ScError> {
        match self.state(parent)?.kind {
            BuildKind::State { .. } => {}
            BuildKind::Parallel => {
                if matches!(kind, BuildKind::Final) {
                    return Err(ScError::FinalInParallel(parent));
                }
            }
            BuildKind::Final | BuildKind::History { .. } => {
                return Err(ScError::LeafParent(parent));
            }
        }
        if self.ids.contains_key(id) {
            return Err(ScError::DuplicateId(id.to_owned()));
        }
        let state = StateId(self.states.len() as u16);
        let history = matches!(kind, BuildKind::History { .. });
        self.states.push(BuildState::new(id.to_owned(), Some(parent), kind));
        self.ids.insert(id.to_owned(), state);
        if history {
            self.states[parent.0 as usize].histories.push(state);
        } else {
            self.states[parent.0 as usize].children.push(state);
        }
        Ok(state)
    }

    /// Adds a new state to the statechart, under the given parent.
    ///
    /// Whether the state is atomic or compound is determined when the
    /// statechart is built, by whether child states have been added to it.
    ///
    /// It fails if the parent does not belong to the statechart or cannot
    /// have children, or if the id is already taken.
    ///
    /// ```
    /// # use statechart::state_chart::StateChartBuilder;
    /// # let mut builder = StateChartBuilder::new();
    /// let a = builder.new_state(builder.root(), "a").expect("the root can have child states");
    ///
    /// // Ids must be unique across the whole statechart
    /// builder
    ///     .new_state(builder.root(), "a")
    ///     .expect_err("the id is already taken");
    /// ```
    pub fn new_state(&mut self, parent: StateId, id: &str) -> Result<StateId, ScError> {
        self.insert_state(
            parent,
            id,
            BuildKind::State {
                initial: None,
                initial_content: Vec::new(),
            },
        )
    }

    /// Adds a new parallel state to the statechart, under the given parent.
    ///
    /// When a parallel state is active, all of its child states are active
    /// simultaneously.
    pub fn new_parallel(&mut self, parent: StateId, id: &str) -> Result<StateId, ScError> {
        self.insert_state(parent, id, BuildKind::Parallel)
    }

    /// Adds a new final state to the statechart, under the given parent.
    ///
    /// Entering a final state generates a `done.state.<parentId>` event,
    /// or terminates the statechart when the parent is the root.
    pub fn new_final(&mut self, parent: StateId, id: &str) -> Result<StateId, ScError> {
        self.insert_state(parent, id, BuildKind::Final)
    }

    /// Adds a new history pseudo-state to the given parent.
    ///
    /// When the parent is exited, the history records its active descendants
    /// (direct children for [`HistoryKind::Shallow`], atomic descendants for
    /// [`HistoryKind::Deep`]). A transition targeting the history re-enters
    /// the recorded states, or the declared defaults when the parent has
    /// never been exited.
    pub fn new_history(
        &mut self,
        parent: StateId,
        id: &str,
        kind: HistoryKind,
        defaults: &[&str],
    ) -> Result<StateId, ScError> {
        self.insert_state(
            parent,
            id,
            BuildKind::History {
                kind,
                defaults: defaults.iter().map(|&d| d.to_owned()).collect(),
                content: Vec::new(),
            },
        )
    }

    /// Adds a new transition to the statechart, outbound from the given source.
    ///
    /// `events` is a list of event descriptors, any of which may select the
    /// transition; an empty list makes the transition eventless. `targets` is
    /// a list of id references resolved when the statechart is built; an
    /// empty list makes the transition targetless, so that firing it executes
    /// its content but leaves the configuration unchanged.
    ///
    /// ```
    /// # use statechart::state_chart::{StateChartBuilder, TransitionKind};
    /// # let mut builder = StateChartBuilder::new();
    /// let a = builder.new_state(builder.root(), "a").expect("the root can have child states");
    ///
    /// // Targets may be declared before the states they reference
    /// builder
    ///     .new_transition(a, &["go"], &["b"], TransitionKind::External)
    ///     .expect("a belongs to the statechart");
    /// let b = builder.new_state(builder.root(), "b").expect("the root can have child states");
    ///
    /// builder.build().expect("all targets resolve");
    /// ```
    pub fn new_transition(
        &mut self,
        source: StateId,
        events: &[&str],
        targets: &[&str],
        kind: TransitionKind,
    ) -> Result<TransitionId, ScError> {
        if source == Self::ROOT {
            return Err(ScError::TransitionFromRoot);
        }
        match self.state(source)?.kind {
            BuildKind::Final => return Err(ScError::TransitionFromFinal(source)),
            BuildKind::History { .. } => return Err(ScError::TransitionFromHistory(source)),
            _ => {}
        }
        let transition = TransitionId(self.transitions.len() as u16);
        self.transitions.push(BuildTransition {
            source,
            events: events.iter().map(|&e| e.to_owned()).collect(),
            guard: None,
            targets: targets.iter().map(|&t| t.to_owned()).collect(),
            kind,
            content: Vec::new(),
        });
        self.states[source.0 as usize].transitions.push(transition);
        Ok(transition)
    }

    /// Sets the guard of the given transition, replacing any previous one.
    ///
    /// The guard is an opaque host hook: the interpreter calls it during
    /// transition selection and never interprets its meaning. A transition
    /// whose guard fails is treated as not enabled, and the failure is
    /// surfaced as an `error.execution` event on the internal queue.
    pub fn set_guard<F>(&mut self, transition: TransitionId, guard: F) -> Result<(), ScError>
    where
        F: Fn(Option<&Event>) -> Result<bool, HostError> + Send + Sync + 'static,
    {
        self.transitions
            .get_mut(transition.0 as usize)
            .ok_or(ScError::MissingTransition(transition))?
            .guard = Some(Arc::new(guard));
        Ok(())
    }

    /// Appends a block of executable content to the given transition.
    pub fn add_content<F>(&mut self, transition: TransitionId, content: F) -> Result<(), ScError>
    where
        F: Fn(&mut Effects<'_>) -> Result<(), HostError> + Send + Sync + 'static,
    {
        self.transitions
            .get_mut(transition.0 as usize)
            .ok_or(ScError::MissingTransition(transition))?
            .content
            .push(Arc::new(content));
        Ok(())
    }

    /// Appends a block of executable content run whenever the state is entered.
    pub fn on_entry<F>(&mut self, state: StateId, content: F) -> Result<(), ScError>
    where
        F: Fn(&mut Effects<'_>) -> Result<(), HostError> + Send + Sync + 'static,
    {
        self.state_mut(state)?.on_entry.push(Arc::new(content));
        Ok(())
    }

    /// Appends a block of executable content run whenever the state is exited.
    pub fn on_exit<F>(&mut self, state: StateId, content: F) -> Result<(), ScError>
    where
        F: Fn(&mut Effects<'_>) -> Result<(), HostError> + Send + Sync + 'static,
    {
        self.state_mut(state)?.on_exit.push(Arc::new(content));
        Ok(())
    }

    /// Declares the default initial target of a compound state.
    ///
    /// Without a declaration, the default initial target of a compound state
    /// is its first child in document order. The target is an id reference
    /// resolved when the statechart is built and must be a descendant of the
    /// state.
    pub fn set_initial(&mut self, state: StateId, target: &str) -> Result<(), ScError> {
        match &mut self.state_mut(state)?.kind {
            BuildKind::State { initial, .. } => {
                *initial = Some(target.to_owned());
                Ok(())
            }
            _ => Err(ScError::InitialInAtomic(state)),
        }
    }

    /// Appends executable content to the default initial transition of a
    /// compound state, run after the state's own entry content on default entry.
    pub fn on_initial<F>(&mut self, state: StateId, content: F) -> Result<(), ScError>
    where
        F: Fn(&mut Effects<'_>) -> Result<(), HostError> + Send + Sync + 'static,
    {
        match &mut self.state_mut(state)?.kind {
            BuildKind::State {
                initial_content, ..
            } => {
                initial_content.push(Arc::new(content));
                Ok(())
            }
            _ => Err(ScError::InitialInAtomic(state)),
        }
    }

    /// Appends executable content to the default transition of a history
    /// pseudo-state, run when the history is targeted with no recorded value.
    pub fn on_history_default<F>(&mut self, state: StateId, content: F) -> Result<(), ScError>
    where
        F: Fn(&mut Effects<'_>) -> Result<(), HostError> + Send + Sync + 'static,
    {
        match &mut self.state_mut(state)?.kind {
            BuildKind::History { content: blocks, .. } => {
                blocks.push(Arc::new(content));
                Ok(())
            }
            _ => Err(ScError::NotHistory(state)),
        }
    }

    /// Sets the data-initialization hook of the given state.
    ///
    /// With [`Binding::Early`] all hooks run when the statechart starts, in
    /// document order; with [`Binding::Late`] the hook runs the first time
    /// the state is entered, before its entry content.
    pub fn set_data_init<F>(&mut self, state: StateId, content: F) -> Result<(), ScError>
    where
        F: Fn(&mut Effects<'_>) -> Result<(), HostError> + Send + Sync + 'static,
    {
        self.state_mut(state)?.data_init = Some(Arc::new(content));
        Ok(())
    }

    /// Attaches a payload to the `done.state` event generated when the given
    /// final state is entered.
    pub fn set_done_data(&mut self, state: StateId, data: Val) -> Result<(), ScError> {
        let state_def = self.state_mut(state)?;
        if !matches!(state_def.kind, BuildKind::Final) {
            return Err(ScError::DoneDataOutsideFinal(state));
        }
        state_def.done_data = Some(data);
        Ok(())
    }

    /// Sets when data-initialization hooks run. The default is [`Binding::Early`].
    pub fn set_binding(&mut self, binding: Binding) {
        self.binding = binding;
    }

    /// Sets the maximum number of microsteps in a macrostep, guarding against
    /// eventless-transition cycles that never quiesce.
    /// The default is [`DEFAULT_STEP_LIMIT`].
    pub fn set_step_limit(&mut self, limit: usize) {
        self.step_limit = limit;
    }

    // Resolves an id reference, innermost scope first: the subtree of `start`
    // is searched in document order, then the subtree of each ancestor in turn.
    fn find_target(&self, start: StateId, idref: &str) -> Result<StateId, ScError> {
        let mut scope = start;
        loop {
            if let Some(found) = self.find_in_subtree(scope, idref) {
                return Ok(found);
            }
            match self.states[scope.0 as usize].parent {
                Some(parent) => scope = parent,
                None => return Err(ScError::UnresolvedTarget(idref.to_owned())),
            }
        }
    }

    fn find_in_subtree(&self, from: StateId, idref: &str) -> Option<StateId> {
        let state = &self.states[from.0 as usize];
        if state.id == idref {
            return Some(from);
        }
        state
            .children
            .iter()
            .chain(&state.histories)
            .find_map(|&child| self.find_in_subtree(child, idref))
    }

    fn is_descendant(&self, s: StateId, of: StateId) -> bool {
        let mut current = self.states[s.0 as usize].parent;
        while let Some(ancestor) = current {
            if ancestor == of {
                return true;
            }
            current = self.states[ancestor.0 as usize].parent;
        }
        false
    }

    /// Produces a [`StateChart`] defined by the [`StateChartBuilder`]'s data,
    /// consuming it.
    ///
    /// All target id references are resolved here, and the tree invariants
    /// are checked: building fails if a reference does not resolve, if the
    /// root has no children, or if a pseudo-state is malformed. A built
    /// statechart can no longer be altered, so no resolution error can occur
    /// during execution.
    pub fn build(mut self) -> Result<StateChart, ScError> {
        if self.states[Self::ROOT.0 as usize].children.is_empty() {
            return Err(ScError::EmptyChart);
        }
        for state in &self.states {
            if !state.histories.is_empty() && state.children.is_empty() {
                return Err(ScError::HistoryInAtomic(state.histories[0]));
            }
        }

        // Resolve the targets of the declared transitions.
        let build_transitions = std::mem::take(&mut self.transitions);
        let mut transitions: Vec<TransitionDef> =
            Vec::with_capacity(build_transitions.len() + self.states.len());
        for transition in build_transitions {
            let mut targets = Vec::with_capacity(transition.targets.len());
            for idref in &transition.targets {
                let target = self.find_target(transition.source, idref)?;
                if target == Self::ROOT {
                    return Err(ScError::RootTarget);
                }
                targets.push(target);
            }
            transitions.push(TransitionDef {
                source: transition.source,
                events: transition.events,
                guard: transition.guard,
                targets,
                kind: transition.kind,
                content: transition.content,
                order: 0,
            });
        }

        // Resolve each state's kind, synthesizing the default transitions of
        // compound states and the default transitions of history states.
        let mut kinds: Vec<StateKind> = Vec::with_capacity(self.states.len());
        for (index, state) in self.states.iter().enumerate() {
            let sid = StateId(index as u16);
            let kind = match &state.kind {
                BuildKind::State {
                    initial,
                    initial_content,
                } => {
                    if state.children.is_empty() {
                        if initial.is_some() || !initial_content.is_empty() {
                            return Err(ScError::InitialInAtomic(sid));
                        }
                        StateKind::Atomic
                    } else {
                        let target = match initial {
                            Some(idref) => {
                                let target = self.find_target(sid, idref)?;
                                if !self.is_descendant(target, sid) {
                                    return Err(ScError::InitialNotDescendant(sid));
                                }
                                target
                            }
                            None => state.children[0],
                        };
                        let initial = TransitionId(transitions.len() as u16);
                        transitions.push(TransitionDef {
                            source: sid,
                            events: Vec::new(),
                            guard: None,
                            targets: vec![target],
                            kind: TransitionKind::External,
                            content: initial_content.clone(),
                            order: 0,
                        });
                        StateKind::Compound { initial }
                    }
                }
                BuildKind::Parallel => StateKind::Parallel,
                BuildKind::Final => StateKind::Final,
                BuildKind::History {
                    kind,
                    defaults,
                    content,
                } => {
                    if defaults.is_empty() {
                        return Err(ScError::HistoryWithoutDefault(sid));
                    }
                    let parent = state.parent.ok_or(ScError::MissingState(sid))?;
                    let mut targets = Vec::with_capacity(defaults.len());
                    for idref in defaults {
                        let target = self.find_target(parent, idref)?;
                        if !self.is_descendant(target, parent) {
                            return Err(ScError::HistoryDefaultNotDescendant(sid));
                        }
                        targets.push(target);
                    }
                    let default = TransitionId(transitions.len() as u16);
                    transitions.push(TransitionDef {
                        source: sid,
                        events: Vec::new(),
                        guard: None,
                        targets,
                        kind: TransitionKind::External,
                        content: content.clone(),
                        order: 0,
                    });
                    StateKind::History {
                        kind: *kind,
                        default,
                    }
                }
            };
            kinds.push(kind);
        }

        // Assign document-order positions with a depth-first, pre-order walk.
        let mut state_orders = vec![0u16; self.states.len()];
        let mut transition_orders = vec![0u16; transitions.len()];
        let mut next_state: u16 = 0;
        let mut next_transition: u16 = 0;
        let mut stack = vec![Self::ROOT];
        while let Some(s) = stack.pop() {
            state_orders[s.0 as usize] = next_state;
            next_state += 1;
            for &t in &self.states[s.0 as usize].transitions {
                transition_orders[t.0 as usize] = next_transition;
                next_transition += 1;
            }
            let state = &self.states[s.0 as usize];
            stack.extend(state.histories.iter().rev());
            stack.extend(state.children.iter().rev());
        }
        for (index, transition) in transitions.iter_mut().enumerate() {
            transition.order = transition_orders[index];
        }

        let mut states: Vec<StateDef> = Vec::with_capacity(self.states.len());
        for (index, (state, kind)) in self.states.into_iter().zip(kinds).enumerate() {
            states.push(StateDef {
                id: state.id,
                parent: state.parent,
                order: state_orders[index],
                kind,
                children: state.children,
                histories: state.histories,
                transitions: state.transitions,
                on_entry: state.on_entry,
                on_exit: state.on_exit,
                data_init: state.data_init,
                done_data: state.done_data,
            });
        }

        info!(
            "create statechart with:\n{} states\n{} transitions",
            states.len(),
            transitions.len()
        );
        let def = StateChartDef {
            states,
            transitions,
            ids: self.ids,
            root: Self::ROOT,
            binding: self.binding,
            step_limit: self.step_limit,
        };
        Ok(StateChart {
            def: Arc::new(def),
            configuration: OrderedSet::default(),
            internal_queue: VecDeque::new(),
            external_queue: Arc::new(Mutex::new(VecDeque::new())),
            history_values: HashMap::new(),
            states_to_invoke: OrderedSet::default(),
            entered_once: HashSet::new(),
            running: false,
            started: false,
            finished: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chart() {
        let builder = StateChartBuilder::new();
        assert!(matches!(builder.build(), Err(ScError::EmptyChart)));
    }

    #[test]
    fn duplicate_id() {
        let mut builder = StateChartBuilder::new();
        builder.new_state(builder.root(), "a").unwrap();
        assert!(matches!(
            builder.new_state(builder.root(), "a"),
            Err(ScError::DuplicateId(_))
        ));
    }

    #[test]
    fn unresolved_target() {
        let mut builder = StateChartBuilder::new();
        let a = builder.new_state(builder.root(), "a").unwrap();
        builder
            .new_transition(a, &["go"], &["nowhere"], TransitionKind::External)
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(ScError::UnresolvedTarget(idref)) if idref == "nowhere"
        ));
    }

    #[test]
    fn transitions_from_leaves() {
        let mut builder = StateChartBuilder::new();
        let a = builder.new_state(builder.root(), "a").unwrap();
        let f = builder.new_final(builder.root(), "f").unwrap();
        let h = builder
            .new_history(a, "h", HistoryKind::Shallow, &["a1"])
            .unwrap();
        builder.new_state(a, "a1").unwrap();
        assert!(matches!(
            builder.new_transition(f, &[], &[], TransitionKind::External),
            Err(ScError::TransitionFromFinal(_))
        ));
        assert!(matches!(
            builder.new_transition(h, &[], &[], TransitionKind::External),
            Err(ScError::TransitionFromHistory(_))
        ));
        assert!(matches!(
            builder.new_transition(builder.root(), &[], &[], TransitionKind::External),
            Err(ScError::TransitionFromRoot)
        ));
    }

    #[test]
    fn initial_must_be_a_descendant() {
        let mut builder = StateChartBuilder::new();
        let a = builder.new_state(builder.root(), "a").unwrap();
        builder.new_state(a, "a1").unwrap();
        builder.new_state(builder.root(), "b").unwrap();
        builder.set_initial(a, "b").unwrap();
        assert!(matches!(
            builder.build(),
            Err(ScError::InitialNotDescendant(_))
        ));
    }

    #[test]
    fn initial_on_atomic_state() {
        let mut builder = StateChartBuilder::new();
        let a = builder.new_state(builder.root(), "a").unwrap();
        builder.set_initial(a, "a").unwrap();
        assert!(matches!(builder.build(), Err(ScError::InitialInAtomic(_))));
    }

    #[test]
    fn history_needs_children_and_defaults() {
        let mut builder = StateChartBuilder::new();
        let a = builder.new_state(builder.root(), "a").unwrap();
        builder
            .new_history(a, "h", HistoryKind::Shallow, &["a"])
            .unwrap();
        assert!(matches!(builder.build(), Err(ScError::HistoryInAtomic(_))));

        let mut builder = StateChartBuilder::new();
        let a = builder.new_state(builder.root(), "a").unwrap();
        builder.new_state(a, "a1").unwrap();
        builder.new_history(a, "h", HistoryKind::Deep, &[]).unwrap();
        assert!(matches!(
            builder.build(),
            Err(ScError::HistoryWithoutDefault(_))
        ));
    }

    #[test]
    fn final_under_parallel() {
        let mut builder = StateChartBuilder::new();
        let p = builder.new_parallel(builder.root(), "p").unwrap();
        assert!(matches!(
            builder.new_final(p, "f"),
            Err(ScError::FinalInParallel(_))
        ));
    }

    #[test]
    fn targets_resolve_innermost_scope_first() {
        let mut builder = StateChartBuilder::new();
        let a = builder.new_state(builder.root(), "a").unwrap();
        let a1 = builder.new_state(a, "a1").unwrap();
        let b = builder.new_state(builder.root(), "b").unwrap();
        let _b1 = builder.new_state(b, "b1").unwrap();
        // Resolves across subtrees: a1 can target b's child.
        builder
            .new_transition(a1, &["go"], &["b1"], TransitionKind::External)
            .unwrap();
        let chart = builder.build().unwrap();
        assert_eq!(chart.def.transitions[0].targets, vec![chart.def.ids["b1"]]);
    }
}
