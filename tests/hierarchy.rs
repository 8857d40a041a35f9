use statechart::state_chart::{Binding, Effects, HostError, StateChartBuilder, TransitionKind};
use statechart::{Event, Val};
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, entry: &str) -> impl Fn(&mut Effects<'_>) -> Result<(), HostError> + use<> {
    let log = Arc::clone(log);
    let entry = entry.to_owned();
    move |_| {
        log.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

#[test]
fn compound_default_entry() {
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "A").unwrap();
    builder.new_state(a, "A.a1").unwrap();
    builder.new_state(builder.root(), "B").unwrap();
    builder
        .new_transition(a, &["ev"], &["B"], TransitionKind::External)
        .unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    assert_eq!(chart.configuration(), vec!["A", "A.a1"]);

    chart.dispatch(Event::external("ev")).unwrap();
    assert_eq!(chart.configuration(), vec!["B"]);
}

#[test]
fn exits_run_deepest_first() {
    let log: Log = Arc::default();
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "A").unwrap();
    let a1 = builder.new_state(a, "A.a1").unwrap();
    let b = builder.new_state(builder.root(), "B").unwrap();
    builder
        .new_transition(a, &["ev"], &["B"], TransitionKind::External)
        .unwrap();
    builder.on_exit(a, record(&log, "exit A")).unwrap();
    builder.on_exit(a1, record(&log, "exit A.a1")).unwrap();
    builder.on_entry(b, record(&log, "enter B")).unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    chart.dispatch(Event::external("ev")).unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["exit A.a1", "exit A", "enter B"]
    );
}

#[test]
fn declared_initial_overrides_document_order() {
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "A").unwrap();
    builder.new_state(a, "A.a1").unwrap();
    builder.new_state(a, "A.a2").unwrap();
    builder.set_initial(a, "A.a2").unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    assert_eq!(chart.configuration(), vec!["A", "A.a2"]);
}

#[test]
fn default_entry_runs_initial_content_after_entry_content() {
    let log: Log = Arc::default();
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "A").unwrap();
    let a1 = builder.new_state(a, "A.a1").unwrap();
    builder.on_entry(a, record(&log, "enter A")).unwrap();
    builder.on_initial(a, record(&log, "initial A")).unwrap();
    builder.on_entry(a1, record(&log, "enter A.a1")).unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["enter A", "initial A", "enter A.a1"]
    );
}

#[test]
fn internal_transitions_do_not_exit_their_source() {
    let log: Log = Arc::default();
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "A").unwrap();
    let a1 = builder.new_state(a, "A.a1").unwrap();
    builder.on_exit(a, record(&log, "exit A")).unwrap();
    builder.on_exit(a1, record(&log, "exit A.a1")).unwrap();
    builder
        .new_transition(a, &["reset"], &["A.a1"], TransitionKind::Internal)
        .unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    chart.dispatch(Event::external("reset")).unwrap();
    assert_eq!(chart.configuration(), vec!["A", "A.a1"]);
    // Only the child was exited and re-entered.
    assert_eq!(*log.lock().unwrap(), vec!["exit A.a1"]);
}

#[test]
fn external_self_transitions_exit_their_source() {
    let log: Log = Arc::default();
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "A").unwrap();
    let a1 = builder.new_state(a, "A.a1").unwrap();
    builder.on_exit(a, record(&log, "exit A")).unwrap();
    builder.on_exit(a1, record(&log, "exit A.a1")).unwrap();
    builder
        .new_transition(a, &["reset"], &["A.a1"], TransitionKind::External)
        .unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    chart.dispatch(Event::external("reset")).unwrap();
    assert_eq!(chart.configuration(), vec!["A", "A.a1"]);
    assert_eq!(*log.lock().unwrap(), vec!["exit A.a1", "exit A"]);
}

#[test]
fn top_level_final_terminates_the_interpreter() {
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "a").unwrap();
    builder.new_final(builder.root(), "end").unwrap();
    builder
        .new_transition(a, &["finish"], &["end"], TransitionKind::External)
        .unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    assert!(chart.is_running());
    chart.dispatch(Event::external("finish")).unwrap();
    assert!(!chart.is_running());
    assert!(chart.configuration().is_empty());
}

#[test]
fn done_event_fires_before_the_next_external_event() {
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "A").unwrap();
    let a1 = builder.new_state(a, "A.a1").unwrap();
    builder.new_final(a, "A.end").unwrap();
    let b = builder.new_state(builder.root(), "B").unwrap();
    let c = builder.new_state(builder.root(), "C").unwrap();
    builder
        .new_transition(a1, &["finish"], &["A.end"], TransitionKind::External)
        .unwrap();
    builder
        .new_transition(a, &["done.state.A"], &["B"], TransitionKind::External)
        .unwrap();
    builder
        .new_transition(b, &["other"], &["C"], TransitionKind::External)
        .unwrap();
    let _ = c;
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    chart.send(Event::external("finish"));
    chart.send(Event::external("other"));
    chart.run().unwrap();
    // `done.state.A` was consumed within the `finish` macrostep, so `other`
    // found the chart already in `B`.
    assert_eq!(chart.configuration(), vec!["C"]);
}

#[test]
fn done_events_carry_done_data() {
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "A").unwrap();
    let a1 = builder.new_state(a, "A.a1").unwrap();
    let end = builder.new_final(a, "A.end").unwrap();
    builder.set_done_data(end, Val::from("ok")).unwrap();
    builder.new_state(builder.root(), "B").unwrap();
    builder
        .new_transition(a1, &["finish"], &["A.end"], TransitionKind::External)
        .unwrap();
    let t = builder
        .new_transition(a, &["done.state.A"], &["B"], TransitionKind::External)
        .unwrap();
    builder
        .set_guard(t, |event| {
            Ok(event.is_some_and(|e| e.data == Some(Val::from("ok"))))
        })
        .unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    chart.dispatch(Event::external("finish")).unwrap();
    assert_eq!(chart.configuration(), vec!["B"]);
}

#[test]
fn late_binding_initializes_on_first_entry_only() {
    let log: Log = Arc::default();
    let mut builder = StateChartBuilder::new();
    builder.set_binding(Binding::Late);
    let a = builder.new_state(builder.root(), "a").unwrap();
    let b = builder.new_state(builder.root(), "b").unwrap();
    builder.set_data_init(b, record(&log, "init b")).unwrap();
    builder
        .new_transition(a, &["go"], &["b"], TransitionKind::External)
        .unwrap();
    builder
        .new_transition(b, &["back"], &["a"], TransitionKind::External)
        .unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    assert!(log.lock().unwrap().is_empty());
    chart.dispatch(Event::external("go")).unwrap();
    chart.dispatch(Event::external("back")).unwrap();
    chart.dispatch(Event::external("go")).unwrap();
    // Entered twice, initialized once.
    assert_eq!(*log.lock().unwrap(), vec!["init b"]);
}

#[test]
fn early_binding_initializes_everything_at_start() {
    let log: Log = Arc::default();
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "a").unwrap();
    let b = builder.new_state(builder.root(), "b").unwrap();
    builder.set_data_init(a, record(&log, "init a")).unwrap();
    builder.set_data_init(b, record(&log, "init b")).unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    // `b` is never entered, but its data model is initialized anyway.
    assert_eq!(*log.lock().unwrap(), vec!["init a", "init b"]);
}

#[test]
fn document_order_breaks_ties_between_transitions() {
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "a").unwrap();
    builder.new_state(builder.root(), "b").unwrap();
    builder.new_state(builder.root(), "c").unwrap();
    builder
        .new_transition(a, &["go"], &["b"], TransitionKind::External)
        .unwrap();
    builder
        .new_transition(a, &["go"], &["c"], TransitionKind::External)
        .unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    chart.dispatch(Event::external("go")).unwrap();
    // Both transitions match; the one declared first wins.
    assert_eq!(chart.configuration(), vec!["b"]);
}

#[test]
fn a_false_guard_falls_through_to_later_transitions() {
    let mut builder = StateChartBuilder::new();
    let a = builder.new_state(builder.root(), "a").unwrap();
    builder.new_state(builder.root(), "b").unwrap();
    builder.new_state(builder.root(), "c").unwrap();
    let guarded = builder
        .new_transition(a, &["go"], &["b"], TransitionKind::External)
        .unwrap();
    builder.set_guard(guarded, |_| Ok(false)).unwrap();
    builder
        .new_transition(a, &["go"], &["c"], TransitionKind::External)
        .unwrap();
    let mut chart = builder.build().unwrap();

    chart.start().unwrap();
    chart.dispatch(Event::external("go")).unwrap();
    assert_eq!(chart.configuration(), vec!["c"]);
}

#[test]
fn configuration_traces_are_deterministic() {
    let run = || {
        let mut builder = StateChartBuilder::new();
        let a = builder.new_state(builder.root(), "a").unwrap();
        let b = builder.new_state(builder.root(), "b").unwrap();
        let c = builder.new_state(builder.root(), "c").unwrap();
        builder
            .new_transition(a, &["go"], &["b"], TransitionKind::External)
            .unwrap();
        builder
            .new_transition(b, &["go"], &["c"], TransitionKind::External)
            .unwrap();
        builder
            .new_transition(c, &["go"], &["a"], TransitionKind::External)
            .unwrap();
        let mut chart = builder.build().unwrap();
        chart.start().unwrap();
        let mut trace = Vec::new();
        for _ in 0..5 {
            chart.dispatch(Event::external("go")).unwrap();
            trace.push(chart.configuration().join(","));
        }
        trace
    };
    assert_eq!(run(), run());
}
