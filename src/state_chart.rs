//! Implementation of the statechart model of computation.
//!
//! A _statechart_ is given by:
//!
//! - a finite tree of _states_, which are either _compound_ (holding child
//!   states of which exactly one is active at a time), _parallel_ (holding
//!   child states which are all active together), _atomic_ (leaves), or
//!   _final_ (terminal leaves);
//! - _history_ pseudo-states, which record the active descendants of their
//!   parent when it is exited and restore them when targeted;
//! - a set of _transitions_, each attached to a source state, selected by
//!   event name and an optional guard, and leading to zero or more targets.
//!
//! The state of a statechart is its _configuration_: the set of states that
//! are simultaneously active. The configuration evolves by _microsteps_: a
//! conflict-free set of enabled transitions is executed by exiting the
//! affected states, running the transitions' executable content, and entering
//! the target states, innermost states exited first and outermost entered
//! first. Microsteps chain into _macrosteps_: eventless transitions and
//! internally raised events are drained to quiescence before the next
//! external event is admitted. Document order, the order in which elements
//! were added to the builder, is the deterministic tiebreaker throughout.
//!
//! A statechart is represented by a [`StateChart`] and defined through a
//! [`StateChartBuilder`], by adding, one at a time, new states, transitions,
//! guards and executable content. Then, the [`StateChart`] is built from the
//! [`StateChartBuilder`] and can be executed by feeding it events, though the
//! structure of the statechart itself can no longer be altered.
//!
//! ```
//! # use statechart::Event;
//! # use statechart::state_chart::{StateChartBuilder, TransitionKind};
//! // Create a new statechart builder
//! let mut builder = StateChartBuilder::new();
//!
//! // Add two atomic states under the root
//! let idle = builder
//!     .new_state(builder.root(), "idle")
//!     .expect("the root can have child states");
//! let busy = builder
//!     .new_state(builder.root(), "busy")
//!     .expect("the root can have child states");
//!
//! // Add a transition reacting to the `work` event
//! builder
//!     .new_transition(idle, &["work"], &["busy"], TransitionKind::External)
//!     .expect("both states belong to the statechart");
//!
//! // Build the statechart from its builder
//! let mut chart = builder.build().expect("the statechart is well-formed");
//!
//! // Execution starts in the root's default initial state
//! chart.start().expect("the statechart has not been started yet");
//! assert_eq!(chart.configuration(), vec!["idle"]);
//!
//! // Process an external event
//! chart
//!     .dispatch(Event::external("work"))
//!     .expect("the statechart has been started");
//! assert_eq!(chart.configuration(), vec!["busy"]);
//! ```

mod builder;
mod interpreter;

pub use builder::StateChartBuilder;
pub use interpreter::{DEFAULT_STEP_LIMIT, Effects, EventSender};

use crate::event::{Event, Val};
use hashbrown::{HashMap, HashSet};
use interpreter::OrderedSet;
use itertools::Itertools;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// An indexing object for states in a statechart.
///
/// These cannot be directly created or manipulated,
/// but have to be generated and/or provided by a [`StateChartBuilder`] or [`StateChart`].
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct StateId(pub(crate) u16);

/// An indexing object for transitions in a statechart.
///
/// These cannot be directly created or manipulated,
/// but have to be generated and/or provided by a [`StateChartBuilder`] or [`StateChart`].
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransitionId(pub(crate) u16);

/// The error type returned by host-provided guard and content hooks.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    /// Creates a new [`HostError`] with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        HostError(message.into())
    }
}

/// A host-provided hook evaluating a transition guard.
///
/// The argument is the event being processed, or `None` for eventless
/// transitions. A transition without a guard is always enabled.
pub type GuardFn = Arc<dyn Fn(Option<&Event>) -> Result<bool, HostError> + Send + Sync>;

/// A host-provided hook executing a block of opaque executable content.
///
/// The interpreter never interprets content itself; it only sequences the
/// hooks according to the step algorithm.
pub type ContentFn = Arc<dyn Fn(&mut Effects<'_>) -> Result<(), HostError> + Send + Sync>;

/// Whether a transition crosses out of its source state when its targets are
/// all descendants of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// The source state is exited and re-entered.
    External,
    /// The source state remains active if it contains all targets.
    Internal,
}

/// How much of the active descendant set a history pseudo-state records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    /// Records the active direct children of the parent.
    Shallow,
    /// Records the active atomic descendants of the parent.
    Deep,
}

/// When the data model of a state is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// All data-initialization hooks run when the statechart starts.
    Early,
    /// A state's data-initialization hook runs the first time it is entered.
    Late,
}

/// The error type for operations with [`StateChartBuilder`]s and [`StateChart`]s.
#[derive(Debug, Clone, Error)]
pub enum ScError {
    /// A target id reference does not resolve to any state in the tree.
    #[error("target {0:?} does not resolve to any state")]
    UnresolvedTarget(String),
    /// Two states declare the same id.
    #[error("id {0:?} is declared by more than one state")]
    DuplicateId(String),
    /// There is no such state in the statechart.
    #[error("state {0:?} does not belong to this statechart")]
    MissingState(StateId),
    /// There is no such transition in the statechart.
    #[error("transition {0:?} does not belong to this statechart")]
    MissingTransition(TransitionId),
    /// There is no state with the given id.
    #[error("no state carries the id {0:?}")]
    UnknownId(String),
    /// The root has no child states.
    #[error("the root has no child states")]
    EmptyChart,
    /// Final and history states cannot have children.
    #[error("state {0:?} cannot have child states")]
    LeafParent(StateId),
    /// A parallel state cannot have final states as direct children.
    #[error("parallel state {0:?} cannot have final child states")]
    FinalInParallel(StateId),
    /// A history pseudo-state belongs to a state with no children.
    #[error("history state {0:?} belongs to a state with no child states")]
    HistoryInAtomic(StateId),
    /// A history pseudo-state declares no default target.
    #[error("history state {0:?} declares no default target")]
    HistoryWithoutDefault(StateId),
    /// A default initial target is declared on a state that cannot have one.
    #[error("state {0:?} cannot declare a default initial target")]
    InitialInAtomic(StateId),
    /// A default initial target lies outside its compound state.
    #[error("the initial target of state {0:?} is not one of its descendants")]
    InitialNotDescendant(StateId),
    /// A history default target lies outside the history's parent.
    #[error("the default target of history state {0:?} is not a descendant of its parent")]
    HistoryDefaultNotDescendant(StateId),
    /// The root cannot carry outbound transitions.
    #[error("the root cannot carry outbound transitions")]
    TransitionFromRoot,
    /// Final states cannot carry outbound transitions.
    #[error("final state {0:?} cannot carry outbound transitions")]
    TransitionFromFinal(StateId),
    /// History pseudo-states carry only their default transition.
    #[error("history state {0:?} carries only its default transition")]
    TransitionFromHistory(StateId),
    /// Transitions cannot target the root of the statechart.
    #[error("transitions cannot target the root")]
    RootTarget,
    /// The state is not a history pseudo-state.
    #[error("state {0:?} is not a history pseudo-state")]
    NotHistory(StateId),
    /// Done data can only be attached to final states.
    #[error("state {0:?} is not a final state and cannot carry done data")]
    DoneDataOutsideFinal(StateId),
    /// The statechart has already been started.
    #[error("the statechart has already been started")]
    AlreadyStarted,
    /// The statechart has not been started yet.
    #[error("the statechart has not been started")]
    NotStarted,
}

// What a state is, beyond the data shared by every kind of state.
#[derive(Clone)]
pub(crate) enum StateKind {
    Compound { initial: TransitionId },
    Parallel,
    Atomic,
    Final,
    History { kind: HistoryKind, default: TransitionId },
}

pub(crate) struct StateDef {
    pub(crate) id: String,
    pub(crate) parent: Option<StateId>,
    // Position in a depth-first, pre-order traversal of the tree.
    pub(crate) order: u16,
    pub(crate) kind: StateKind,
    // State children in document order; empty for leaves and pseudo-states.
    pub(crate) children: Vec<StateId>,
    // History pseudo-states attached to this state.
    pub(crate) histories: Vec<StateId>,
    pub(crate) transitions: Vec<TransitionId>,
    pub(crate) on_entry: Vec<ContentFn>,
    pub(crate) on_exit: Vec<ContentFn>,
    pub(crate) data_init: Option<ContentFn>,
    pub(crate) done_data: Option<Val>,
}

pub(crate) struct TransitionDef {
    pub(crate) source: StateId,
    // Event descriptors, any of which may select this transition; empty for
    // eventless transitions.
    pub(crate) events: Vec<String>,
    pub(crate) guard: Option<GuardFn>,
    // Resolved targets; empty for targetless transitions.
    pub(crate) targets: Vec<StateId>,
    pub(crate) kind: TransitionKind,
    pub(crate) content: Vec<ContentFn>,
    // Document-order position, used to sequence transition content.
    pub(crate) order: u16,
}

pub(crate) struct StateChartDef {
    pub(crate) states: Vec<StateDef>,
    pub(crate) transitions: Vec<TransitionDef>,
    pub(crate) ids: HashMap<String, StateId>,
    pub(crate) root: StateId,
    pub(crate) binding: Binding,
    pub(crate) step_limit: usize,
}

impl StateChartDef {
    #[inline(always)]
    pub(crate) fn state(&self, s: StateId) -> &StateDef {
        &self.states[s.0 as usize]
    }

    #[inline(always)]
    pub(crate) fn transition(&self, t: TransitionId) -> &TransitionDef {
        &self.transitions[t.0 as usize]
    }

    pub(crate) fn is_atomic(&self, s: StateId) -> bool {
        matches!(self.state(s).kind, StateKind::Atomic | StateKind::Final)
    }

    pub(crate) fn is_compound(&self, s: StateId) -> bool {
        matches!(self.state(s).kind, StateKind::Compound { .. })
    }

    pub(crate) fn is_parallel(&self, s: StateId) -> bool {
        matches!(self.state(s).kind, StateKind::Parallel)
    }

    pub(crate) fn compound_initial(&self, s: StateId) -> Option<TransitionId> {
        match self.state(s).kind {
            StateKind::Compound { initial } => Some(initial),
            _ => None,
        }
    }

    // The ancestors of `s`, nearest first, up to but excluding `stop`.
    //
    // With `stop` equal to `None`, all ancestors up to and including the root
    // are returned. When `stop` is not an ancestor of `s` (it is `s` itself,
    // or one of its descendants, or unrelated), the result is empty.
    pub(crate) fn proper_ancestors(
        &self,
        s: StateId,
        stop: Option<StateId>,
    ) -> SmallVec<[StateId; 8]> {
        let mut ancestors = SmallVec::new();
        let mut current = self.state(s).parent;
        while let Some(ancestor) = current {
            if Some(ancestor) == stop {
                return ancestors;
            }
            ancestors.push(ancestor);
            current = self.state(ancestor).parent;
        }
        if stop.is_some() {
            ancestors.clear();
        }
        ancestors
    }

    // True iff `s` appears anywhere beneath `of`.
    pub(crate) fn is_descendant(&self, s: StateId, of: StateId) -> bool {
        let mut current = self.state(s).parent;
        while let Some(ancestor) = current {
            if ancestor == of {
                return true;
            }
            current = self.state(ancestor).parent;
        }
        false
    }

    // The least common compound ancestor: the deepest state that is compound
    // (the root included) and a proper ancestor of `head` and of every state
    // in `rest`.
    pub(crate) fn find_lcca(&self, head: StateId, rest: &[StateId]) -> StateId {
        for ancestor in self.proper_ancestors(head, None) {
            if self.is_compound(ancestor) && rest.iter().all(|&s| self.is_descendant(s, ancestor)) {
                return ancestor;
            }
        }
        // The root is a compound ancestor of every other state.
        self.root
    }
}

/// Representation of a statechart that can be executed by feeding it events.
///
/// The structure of the statechart cannot be changed,
/// meaning that it is not possible to introduce new states or transitions.
/// Though, this restriction makes it so that cloning the [`StateChart`] is cheap,
/// because only the internal state needs to be duplicated.
///
/// The only way to produce a [`StateChart`] is through a [`StateChartBuilder`].
/// This guarantees that every transition target resolves and that the tree
/// invariants hold, and thus the statechart will always be in a consistent state.
pub struct StateChart {
    pub(crate) def: Arc<StateChartDef>,
    pub(crate) configuration: OrderedSet,
    pub(crate) internal_queue: VecDeque<Event>,
    pub(crate) external_queue: Arc<Mutex<VecDeque<Event>>>,
    pub(crate) history_values: HashMap<StateId, Vec<StateId>>,
    pub(crate) states_to_invoke: OrderedSet,
    pub(crate) entered_once: HashSet<StateId>,
    pub(crate) running: bool,
    pub(crate) started: bool,
    pub(crate) finished: bool,
}

impl StateChart {
    /// Returns the ids of the currently active states, in document order.
    ///
    /// The root is never part of the configuration. The configuration is
    /// empty before [`StateChart::start`] and after the interpreter has
    /// exited.
    pub fn configuration(&self) -> Vec<&str> {
        self.configuration
            .iter()
            .sorted_by_key(|&s| self.def.state(s).order)
            .map(|s| self.def.state(s).id.as_str())
            .collect()
    }

    /// Returns whether the state with the given id is currently active.
    pub fn is_active(&self, id: &str) -> bool {
        self.def
            .ids
            .get(id)
            .is_some_and(|&s| self.configuration.contains(s))
    }

    /// Returns whether the statechart is still processing events.
    ///
    /// This is false before [`StateChart::start`], after a top-level final
    /// state has been entered, and after [`StateChart::stop`].
    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Clone for StateChart {
    // Clones share the immutable definition but not the event queues: a clone
    // starts from the same interpreter state with a queue of its own.
    fn clone(&self) -> Self {
        let pending = self
            .external_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        StateChart {
            def: Arc::clone(&self.def),
            configuration: self.configuration.clone(),
            internal_queue: self.internal_queue.clone(),
            external_queue: Arc::new(Mutex::new(pending)),
            history_values: self.history_values.clone(),
            states_to_invoke: self.states_to_invoke.clone(),
            entered_once: self.entered_once.clone(),
            running: self.running,
            started: self.started,
            finished: self.finished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> StateChart {
        let mut builder = StateChartBuilder::new();
        let a = builder.new_state(builder.root(), "A").unwrap();
        let a1 = builder.new_state(a, "A.a1").unwrap();
        let a2 = builder.new_state(a, "A.a2").unwrap();
        let _a1x = builder.new_state(a1, "A.a1.x").unwrap();
        let b = builder.new_state(builder.root(), "B").unwrap();
        builder
            .new_transition(a2, &["ev"], &["B"], TransitionKind::External)
            .unwrap();
        let _ = b;
        builder.build().unwrap()
    }

    #[test]
    fn proper_ancestors() {
        let chart = nested();
        let def = &chart.def;
        let a = def.ids["A"];
        let a1 = def.ids["A.a1"];
        let a1x = def.ids["A.a1.x"];
        let b = def.ids["B"];
        assert_eq!(
            def.proper_ancestors(a1x, None).as_slice(),
            &[a1, a, def.root]
        );
        assert_eq!(def.proper_ancestors(a1x, Some(a)).as_slice(), &[a1]);
        // Stopping at the parent yields nothing.
        assert!(def.proper_ancestors(a1, Some(a)).is_empty());
        // A stop that is not an ancestor yields nothing.
        assert!(def.proper_ancestors(a1x, Some(b)).is_empty());
        assert!(def.proper_ancestors(a, Some(a1x)).is_empty());
    }

    #[test]
    fn descendants() {
        let chart = nested();
        let def = &chart.def;
        let a = def.ids["A"];
        let a1 = def.ids["A.a1"];
        let a1x = def.ids["A.a1.x"];
        let b = def.ids["B"];
        assert!(def.is_descendant(a1x, a));
        assert!(def.is_descendant(a1x, def.root));
        assert!(!def.is_descendant(a1x, b));
        assert!(!def.is_descendant(a, a1));
        assert!(!def.is_descendant(a, a));
    }

    #[test]
    fn lcca() {
        let chart = nested();
        let def = &chart.def;
        let a = def.ids["A"];
        let a1 = def.ids["A.a1"];
        let a2 = def.ids["A.a2"];
        let a1x = def.ids["A.a1.x"];
        let b = def.ids["B"];
        assert_eq!(def.find_lcca(a1, &[a2]), a);
        assert_eq!(def.find_lcca(a1x, &[a2]), a);
        assert_eq!(def.find_lcca(a1, &[b]), def.root);
        // A1 itself is compound, but the LCCA must be a proper ancestor.
        assert_eq!(def.find_lcca(a1x, &[a1x]), a1);
    }

    #[test]
    fn document_order_is_depth_first() {
        let chart = nested();
        let def = &chart.def;
        let order = |id: &str| def.state(def.ids[id]).order;
        assert!(order("A") < order("A.a1"));
        assert!(order("A.a1") < order("A.a1.x"));
        assert!(order("A.a1.x") < order("A.a2"));
        assert!(order("A.a2") < order("B"));
    }
}
