use criterion::{Criterion, criterion_group, criterion_main};
use statechart::Event;
use statechart::machine::Machine;
use statechart::state_chart::{StateChart, StateChartBuilder, TransitionKind};

fn flat_machine() -> Machine {
    let mut builder = Machine::builder();
    builder.on("Green", "TIMER", "Yellow").unwrap();
    builder.on("Yellow", "TIMER", "Red").unwrap();
    builder.on("Red", "TIMER", "Green").unwrap();
    builder.build().unwrap()
}

// A parallel state whose regions both react to the same event without
// conflicting, exercising selection across the whole configuration.
fn parallel_chart() -> StateChart {
    let mut builder = StateChartBuilder::new();
    let p = builder.new_parallel(builder.root(), "P").unwrap();
    for region in ["X", "Y", "Z"] {
        let r = builder.new_state(p, region).unwrap();
        let first = format!("{region}.1");
        let second = format!("{region}.2");
        let one = builder.new_state(r, &first).unwrap();
        let two = builder.new_state(r, &second).unwrap();
        builder
            .new_transition(one, &["toggle"], &[second.as_str()], TransitionKind::External)
            .unwrap();
        builder
            .new_transition(two, &["toggle"], &[first.as_str()], TransitionKind::External)
            .unwrap();
    }
    builder.build().unwrap()
}

#[inline(always)]
fn run_toggles(chart: &StateChart, toggles: usize) {
    let mut chart = chart.clone();
    chart.start().unwrap();
    for _ in 0..toggles {
        chart.dispatch(Event::external("toggle")).unwrap();
    }
}

fn bench_steps(c: &mut Criterion) {
    let machine = flat_machine();
    c.bench_function("flat transition", |b| {
        b.iter(|| machine.transition("Green", "TIMER"))
    });

    let chart = parallel_chart();
    c.bench_function("parallel toggle x32", |b| b.iter(|| run_toggles(&chart, 32)));
}

criterion_group!(benches, bench_steps);
criterion_main!(benches);
