//! Events processed by a statechart and the matching rules for event names.
//!
//! Event names are dot-separated tokens, and transitions select events by
//! *descriptor*: the descriptor `a.b` matches the event `a.b` itself and any
//! event below it in the name hierarchy, such as `a.b.c`.
//! The descriptor `*` matches every event,
//! and a trailing `.*` on a descriptor is equivalent to the bare prefix.

/// Integer values carried by events.
pub type Integer = i64;

/// A value carried as the payload of an [`Event`].
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    /// Boolean values.
    Boolean(bool),
    /// Integer values.
    Integer(Integer),
    /// Textual values.
    Text(String),
    /// Lists of values.
    List(Vec<Val>),
}

impl From<bool> for Val {
    fn from(value: bool) -> Self {
        Val::Boolean(value)
    }
}

impl From<Integer> for Val {
    fn from(value: Integer) -> Self {
        Val::Integer(value)
    }
}

impl From<&str> for Val {
    fn from(value: &str) -> Self {
        Val::Text(value.to_owned())
    }
}

impl From<String> for Val {
    fn from(value: String) -> Self {
        Val::Text(value)
    }
}

impl From<Vec<Val>> for Val {
    fn from(value: Vec<Val>) -> Self {
        Val::List(value)
    }
}

/// Where an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The event was enqueued by an external producer.
    External,
    /// The event was raised by executable content during a step.
    Internal,
    /// The event was generated by the interpreter upon reaching a final state.
    Done,
}

/// An event processed by a statechart.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// The dot-separated name of the event.
    pub name: String,
    /// An opaque payload, uninterpreted by the interpreter.
    pub data: Option<Val>,
    /// Where the event originated.
    pub origin: Origin,
}

impl Event {
    /// Creates a new event with [`Origin::External`] and no payload.
    pub fn external(name: impl Into<String>) -> Self {
        Event {
            name: name.into(),
            data: None,
            origin: Origin::External,
        }
    }

    /// Creates a new event with [`Origin::Internal`] and no payload.
    pub fn internal(name: impl Into<String>) -> Self {
        Event {
            name: name.into(),
            data: None,
            origin: Origin::Internal,
        }
    }

    /// Attaches a payload to the event.
    pub fn with_data(mut self, data: Val) -> Self {
        self.data = Some(data);
        self
    }

    // Generated when every child region of `id`'s parent reaches a final state.
    pub(crate) fn done_state(id: &str, data: Option<Val>) -> Self {
        Event {
            name: format!("done.state.{id}"),
            data,
            origin: Origin::Done,
        }
    }

    // Generated when a host hook fails or the microstep cap is exceeded.
    pub(crate) fn execution_error(message: impl Into<String>) -> Self {
        Event {
            name: "error.execution".to_owned(),
            data: Some(Val::Text(message.into())),
            origin: Origin::Internal,
        }
    }
}

/// Checks a single event descriptor against an event name.
pub(crate) fn descriptor_matches(descriptor: &str, name: &str) -> bool {
    if descriptor == "*" {
        return true;
    }
    let descriptor = descriptor.strip_suffix(".*").unwrap_or(descriptor);
    match name.strip_prefix(descriptor) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(descriptor_matches("a.b", "a.b"));
        assert!(!descriptor_matches("a.b", "a"));
    }

    #[test]
    fn prefix_match() {
        assert!(descriptor_matches("a.b", "a.b.c"));
        assert!(descriptor_matches("a", "a.b.c"));
        // Prefixes match whole tokens, not substrings.
        assert!(!descriptor_matches("a.b", "a.bc"));
        assert!(!descriptor_matches("err", "error"));
    }

    #[test]
    fn wildcard() {
        assert!(descriptor_matches("*", "anything.at.all"));
        assert!(descriptor_matches("a.b.*", "a.b"));
        assert!(descriptor_matches("a.b.*", "a.b.c"));
        assert!(!descriptor_matches("a.b.*", "a.c"));
    }

    #[test]
    fn done_event_name() {
        let event = Event::done_state("P", None);
        assert_eq!(event.name, "done.state.P");
        assert_eq!(event.origin, Origin::Done);
        assert!(descriptor_matches("done.state", &event.name));
        assert!(descriptor_matches("done.state.P", &event.name));
    }
}
