//! Flat machines: a single-level convenience surface over the statechart core.
//!
//! A flat [`Machine`] has no hierarchy: states are bare identifiers, and each
//! state maps event names to a successor state. Transitions are resolved
//! statelessly, one at a time.
//!
//! ```
//! # use statechart::machine::Machine;
//! let mut builder = Machine::builder();
//! builder.on("green", "TIMER", "yellow").expect("ids are fresh");
//! builder.on("yellow", "TIMER", "red").expect("ids are fresh");
//! builder.on("red", "TIMER", "green").expect("ids are fresh");
//! let machine = builder.build().expect("the machine is well-formed");
//!
//! let next = machine.transition("green", "TIMER");
//! assert_eq!(next.value, "yellow");
//!
//! // Unmapped events leave the state unchanged
//! let same = machine.transition("red", "UNKNOWN");
//! assert_eq!(same.value, "red");
//! ```

use crate::event::Event;
use crate::state_chart::{ScError, StateChart, StateChartBuilder, StateId, TransitionKind};
use hashbrown::HashMap;

/// The state a flat [`Machine`] resolved to after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    /// The id of the state the machine settled in.
    pub value: String,
}

/// A flat state machine mapping `(state, event)` pairs to successor states.
///
/// A flat machine is a degenerate statechart and is implemented as one: its
/// states are atomic siblings under the root of a [`StateChart`], and
/// [`Machine::transition`] seeds a throwaway interpreter with the current
/// state. Cloning the underlying statechart duplicates only the interpreter
/// state, so the machine itself holds no mutable state and can be queried
/// freely.
pub struct Machine {
    chart: StateChart,
}

impl Machine {
    /// Creates a new [`MachineBuilder`].
    pub fn builder() -> MachineBuilder {
        MachineBuilder::new()
    }

    /// Returns the state reached from `state` when `event` occurs.
    ///
    /// When `state` has no mapping for `event`, or is not a state of the
    /// machine at all, the machine stays where it is.
    pub fn transition(&self, state: &str, event: &str) -> MachineState {
        let stay = || MachineState {
            value: state.to_owned(),
        };
        let mut chart = self.chart.clone();
        if chart.start_in(state).is_err() {
            return stay();
        }
        if chart.dispatch(Event::external(event)).is_err() {
            return stay();
        }
        match chart.configuration().first() {
            Some(&value) => MachineState {
                value: value.to_owned(),
            },
            None => stay(),
        }
    }
}

/// Defines and builds a flat [`Machine`].
pub struct MachineBuilder {
    builder: StateChartBuilder,
    states: HashMap<String, StateId>,
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineBuilder {
    /// Creates a new [`MachineBuilder`] with no states.
    pub fn new() -> Self {
        MachineBuilder {
            builder: StateChartBuilder::new(),
            states: HashMap::new(),
        }
    }

    fn ensure_state(&mut self, id: &str) -> Result<StateId, ScError> {
        if let Some(&state) = self.states.get(id) {
            Ok(state)
        } else {
            let state = self.builder.new_state(self.builder.root(), id)?;
            self.states.insert(id.to_owned(), state);
            Ok(state)
        }
    }

    /// Adds a state to the machine.
    ///
    /// States are created the first time they are mentioned, so this is only
    /// needed for states that no transition references.
    pub fn state(&mut self, id: &str) -> Result<(), ScError> {
        self.ensure_state(id).map(|_| ())
    }

    /// Maps `event` in state `from` to the successor state `to`.
    ///
    /// Both states are created if they have not been mentioned before.
    pub fn on(&mut self, from: &str, event: &str, to: &str) -> Result<(), ScError> {
        let source = self.ensure_state(from)?;
        self.ensure_state(to)?;
        self.builder
            .new_transition(source, &[event], &[to], TransitionKind::External)?;
        Ok(())
    }

    /// Produces the [`Machine`] defined by the builder's data, consuming it.
    ///
    /// Fails if the machine has no states at all.
    pub fn build(self) -> Result<Machine, ScError> {
        Ok(Machine {
            chart: self.builder.build()?,
        })
    }
}
