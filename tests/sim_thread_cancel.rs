use simchain::harness::{gain_chain, CancelOnRun, Fail, Probe, Ramp};
use simchain::{CancelToken, Scheduler, SimBuilder, SimError, SimState, SimThread};
use std::sync::{Arc, Mutex};
use std::thread;

fn wait_terminal(t: &SimThread) -> SimState {
    loop {
        let state = t.state();
        if state.is_terminal() {
            return state;
        }
        thread::yield_now();
    }
}

#[test]
fn cancel_is_observed_at_the_next_instruction() {
    let _ = env_logger::builder().is_test(true).try_init();
    let log = Arc::new(Mutex::new(Vec::new()));
    let token = CancelToken::new();
    let mut b = SimBuilder::new();
    b.process_named("first", Probe::new("first", &log)).unwrap();
    b.process_named("cancel", CancelOnRun::new(&token)).unwrap();
    b.process_named("never", Probe::new("never", &log)).unwrap();
    let sim = b.build().unwrap();
    let never = sim.find("never");

    let t = SimThread::spawn_with_token(sim, Scheduler::default(), token).unwrap();
    assert_eq!(wait_terminal(&t), SimState::Cancelled);
    let (_, outcome) = t.join().unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.steps, 2);
    assert_eq!(outcome.last, never);
    assert_eq!(*log.lock().unwrap(), vec!["first".to_string()]);
}

#[test]
fn cancel_inside_repeat_finishes_the_repeat() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let token = CancelToken::new();
    let mut b = SimBuilder::new();
    b.repeat(3).unwrap();
    b.process_named("cancel", CancelOnRun::new(&token)).unwrap();
    b.process_named("body", Probe::new("body", &log)).unwrap();
    b.end_repeat().unwrap();
    b.process_named("after", Probe::new("after", &log)).unwrap();
    let sim = b.build().unwrap();

    let t = SimThread::spawn_with_token(sim, Scheduler::default(), token).unwrap();
    let (_, outcome) = t.join().unwrap();
    assert!(outcome.cancelled);
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[test]
fn failure_is_reported_by_join() {
    let mut b = SimBuilder::new();
    b.process_named("boom", Fail).unwrap();
    let t = SimThread::spawn(b.build().unwrap(), Scheduler::default()).unwrap();
    assert_eq!(wait_terminal(&t), SimState::Failed);
    assert!(matches!(t.join(), Err(SimError::ProcessRun { .. })));
}

#[test]
fn failed_pass_keeps_simulation() {
    let mut b = SimBuilder::new();
    b.process_named("src", Ramp::new(2, 3)).unwrap();
    b.process_named("boom", Fail).unwrap();
    let t = SimThread::spawn(b.build().unwrap(), Scheduler::default()).unwrap();
    let (sim, result) = t.join_with_simulation().unwrap();
    match result {
        Err(SimError::ProcessRun { label, .. }) => assert_eq!(label, "boom"),
        other => panic!("unexpected result {:?}", other),
    }
    let src = sim.process_by_label("src").unwrap();
    assert_eq!(src.output().channel(1).unwrap(), &[3.0, 4.0, 5.0]);
}

#[test]
fn finished_pass_returns_outputs() {
    let t = SimThread::spawn(gain_chain(3, 4, 2).unwrap(), Scheduler::default()).unwrap();
    assert!(!t.cancel_token().is_cancelled());
    assert_eq!(wait_terminal(&t), SimState::Finished);
    let (sim, outcome) = t.join().unwrap();
    assert!(!outcome.cancelled);
    // ramp * 2 for the first stage
    let s0 = sim.process_by_label("s0").unwrap();
    assert_eq!(s0.output().channel(2).unwrap(), &[16.0, 18.0, 20.0, 22.0]);
}

#[test]
fn dropping_the_handle_joins() {
    let t = SimThread::spawn(gain_chain(2, 4, 1).unwrap(), Scheduler::default()).unwrap();
    t.cancel();
    drop(t);
}
