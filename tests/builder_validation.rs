use simchain::harness::{Gain, Ramp};
use simchain::{BuildError, DatumKind, SimBuilder, SimError};

#[test]
fn late_connection_takes_effect_on_next_pass() {
    let mut b = SimBuilder::new();
    b.process_named("src", Ramp::new(2, 2)).unwrap();
    b.process_named("g", Gain::new(3.0)).unwrap();
    let mut sim = b.build().unwrap();
    assert!(simchain::Scheduler::default().execute(&mut sim, None).is_err());

    sim.connect("src", "g").unwrap();
    simchain::Scheduler::default().execute(&mut sim, None).unwrap();
    assert_eq!(sim.process_by_label("g").unwrap().output().channel(1).unwrap(), &[6.0, 9.0]);

    let g = sim.list().get(sim.find("g").unwrap()).unwrap();
    assert!(matches!(&g.kind, DatumKind::Process { inputs, .. } if inputs == &["src".to_string()]));
}

#[test]
fn connection_errors() {
    let mut b = SimBuilder::new();
    b.process_named("a", Ramp::new(1, 1)).unwrap();
    b.repeat_named("loop", 2).unwrap();
    assert_eq!(b.connect("a", "ghost"), Err(BuildError::UnknownLabel("ghost".into())));
    assert_eq!(b.connect("a", "loop"), Err(BuildError::NotAProcess("loop".into())));
    b.end_repeat().unwrap();
    let mut sim = b.build().unwrap();
    assert!(matches!(sim.connect("a", "a"), Err(SimError::Build(BuildError::SelfConnection(_)))));
}

#[test]
fn reset_must_target_a_process() {
    let mut b = SimBuilder::new();
    b.repeat_named("loop", 1).unwrap();
    b.reset("loop").unwrap();
    b.end_repeat().unwrap();
    assert_eq!(b.build().unwrap_err(), BuildError::NotAProcess("loop".into()));
}

#[test]
fn auto_labels_skip_explicit_ones() {
    let mut b = SimBuilder::new();
    b.process_named("p1", Ramp::new(1, 1)).unwrap();
    b.process(Ramp::new(1, 1)).unwrap();
    b.process_named("x0", Gain::new(1.0)).unwrap();
    b.connect("p1", "x0").unwrap();
    b.reset("x0").unwrap();
    b.process_named("r0", Gain::new(1.0)).unwrap();
    b.repeat(1).unwrap();
    b.end_repeat().unwrap();
    let sim = b.build().unwrap();

    assert!(sim.find("p2").is_some());
    assert!(sim.find("x1").is_some());
    assert!(sim.find("r1").is_some());
    assert_eq!(sim.processes().len(), 4);
}
