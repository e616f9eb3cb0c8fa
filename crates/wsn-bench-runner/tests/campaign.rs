mod common;

use std::sync::Arc;

use common::{Bench, ClientReply, FakeExec};
use wsn_bench_abstract::{
    CampaignPlan, ClientMode, EscalationPolicy, ExperimentSpec, ParameterTuple, RdcDriver,
};
use wsn_bench_runner::{CampaignError, CampaignState, FailureKind, RigState};

fn spec(hops: Vec<u32>, rdc: Vec<RdcDriver>, iterations: usize) -> ExperimentSpec {
    ExperimentSpec {
        name: "bench".to_string(),
        mode: ClientMode::Simple,
        rdc,
        hops,
        payloads: vec![0],
        payload_ranges: Vec::new(),
        acks: Vec::new(),
        waits: Vec::new(),
        iterations,
        interleave: false,
    }
}

fn plan(specs: &[ExperimentSpec]) -> CampaignPlan {
    CampaignPlan::from_specs(specs).unwrap()
}

/// Index of the `n`-th (0-based) client invocation in the event log.
fn client_at(exec: &FakeExec, n: usize) -> usize {
    exec.positions("run client")[n]
}

fn between(exec: &FakeExec, prefix: &str, from: usize, to: usize) -> usize {
    exec.positions(prefix)
        .into_iter()
        .filter(|&i| i > from && i < to)
        .count()
}

#[test]
fn campaign_is_resumable() {
    let bench = Bench::new();
    let plan = plan(&[spec(vec![1, 2], vec![RdcDriver::ContikiMac], 3)]);

    let mut exec = FakeExec::new();
    let mut state = CampaignState::default();
    let report = bench
        .runner(EscalationPolicy::default())
        .run_plan(&mut exec, &mut state, &plan)
        .unwrap();
    assert_eq!(exec.client_calls().len(), 6);
    assert!(report.tuples.iter().all(|t| t.samples == 3 && t.target == 3));

    let mut again = FakeExec::new();
    let mut state = CampaignState::default();
    let report = bench
        .runner(EscalationPolicy::default())
        .run_plan(&mut again, &mut state, &plan)
        .unwrap();
    assert!(again.client_calls().is_empty());
    assert!(again.positions("run build").is_empty());
    assert_eq!(report.counters.results, 2);
    assert!(report.tuples.iter().all(|t| t.samples == 3));
}

#[test]
fn partial_progress_is_completed_not_repeated() {
    let bench = Bench::new();
    let store = bench.store();
    let tuple = ParameterTuple::simple(1, 0, RdcDriver::ContikiMac);

    let mut exec = FakeExec::new();
    let mut state = CampaignState::default();
    bench
        .runner(EscalationPolicy::default())
        .run_campaign(&mut exec, &mut state, &[tuple], 2)
        .unwrap();
    assert_eq!(store.count(&tuple).unwrap(), 2);

    let mut exec = FakeExec::new();
    let mut state = CampaignState::default();
    bench
        .runner(EscalationPolicy::default())
        .run_campaign(&mut exec, &mut state, &[tuple], 5)
        .unwrap();
    assert_eq!(exec.client_calls().len(), 3);
    assert_eq!(store.count(&tuple).unwrap(), 5);
    assert_eq!(state.counters.successes, 3);
}

#[test]
fn failed_trial_does_not_change_the_count() {
    let bench = Bench::new();
    let store = bench.store();
    let tuple = ParameterTuple::simple(2, 0, RdcDriver::ContikiMac);
    let mut exec = FakeExec::new();
    exec.drop_capture_once = Some(3);
    let mut state = CampaignState::default();

    bench
        .runner(EscalationPolicy::default())
        .run_campaign(&mut exec, &mut state, &[tuple], 1)
        .unwrap();

    assert_eq!(exec.client_calls().len(), 2);
    assert_eq!(store.count(&tuple).unwrap(), 1);
    assert_eq!(state.counters.failures, 1);
    assert_eq!(state.counters.by_kind[&FailureKind::TelemetryMissing], 1);
    assert_eq!(store.load(&tuple).unwrap()[0].power.len(), 2);
}

#[test]
fn three_failures_reset_the_network_before_the_client() {
    let bench = Bench::new();
    let tuple = ParameterTuple::simple(2, 0, RdcDriver::ContikiMac);
    let mut exec = FakeExec::with_replies([
        ClientReply::no_reply(),
        ClientReply::no_reply(),
        ClientReply::no_reply(),
    ]);
    let mut state = CampaignState::default();

    bench
        .runner(EscalationPolicy::default())
        .run_campaign(&mut exec, &mut state, &[tuple], 1)
        .unwrap();

    assert_eq!(exec.client_calls().len(), 4);
    let (second, third, fourth) = (client_at(&exec, 1), client_at(&exec, 2), client_at(&exec, 3));
    assert_eq!(between(&exec, "run reset", 0, third), 0);
    assert_eq!(between(&exec, "run reset", second, third), 0);
    // Gateway plus both hops, then the network is re-verified.
    assert_eq!(between(&exec, "run reset", third, fourth), 3);
    assert_eq!(between(&exec, "spawn bridge", third, fourth), 1);
    assert_eq!(between(&exec, "run build", third, fourth), 0);
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(state.counters.no_reply, 3);
}

#[test]
fn five_failures_rebuild_before_network_bring_up() {
    let bench = Bench::new();
    let tuple = ParameterTuple::simple(1, 0, RdcDriver::ContikiMac);
    let mut exec = FakeExec::with_replies((0..5).map(|_| ClientReply::crashed()));
    let mut state = CampaignState::default();

    bench
        .runner(EscalationPolicy::default())
        .run_campaign(&mut exec, &mut state, &[tuple], 1)
        .unwrap();

    assert_eq!(exec.client_calls().len(), 6);
    let (fifth, sixth) = (client_at(&exec, 4), client_at(&exec, 5));
    assert_eq!(exec.positions("run build").len(), 2);
    let rebuild = exec.positions("run build")[1];
    let bridge = *exec.positions("spawn bridge").last().unwrap();
    assert!(fifth < rebuild && rebuild < bridge && bridge < sixth);
    assert_eq!(between(&exec, "run flash router", fifth, sixth), 1);
    assert_eq!(state.counters.by_kind[&FailureKind::ClientExecution], 5);
}

#[test]
fn provisioning_failure_aborts_the_campaign() {
    let bench = Bench::new();
    let store = bench.store();
    let tuple = ParameterTuple::simple(1, 0, RdcDriver::ContikiMac);
    let mut exec = FakeExec::new();
    exec.failing_builds = 1;
    let mut state = CampaignState::default();

    let err = bench
        .runner(EscalationPolicy::default())
        .run_campaign(&mut exec, &mut state, &[tuple], 1)
        .unwrap_err();

    assert!(matches!(err, CampaignError::Provisioning(_)));
    assert!(exec.client_calls().is_empty());
    assert_eq!(store.count(&tuple).unwrap(), 0);
}

#[test]
fn provisioning_failure_can_be_retried() {
    let bench = Bench::new();
    let tuple = ParameterTuple::simple(1, 0, RdcDriver::ContikiMac);
    let mut exec = FakeExec::new();
    exec.failing_builds = 1;
    let mut state = CampaignState::default();
    let policy = EscalationPolicy {
        provisioning_fatal: false,
        ..EscalationPolicy::default()
    };

    bench
        .runner(policy)
        .run_campaign(&mut exec, &mut state, &[tuple], 1)
        .unwrap();

    assert_eq!(exec.positions("run build").len(), 2);
    assert_eq!(state.counters.by_kind[&FailureKind::Provisioning], 1);
}

#[test]
fn switching_driver_recompiles() {
    let bench = Bench::new();
    let plan = plan(&[
        spec(vec![1], vec![RdcDriver::ContikiMac], 1),
        spec(vec![1], vec![RdcDriver::NullRdc], 1),
    ]);
    let mut exec = FakeExec::new();
    let mut state = CampaignState::default();

    bench
        .runner(EscalationPolicy::default())
        .run_plan(&mut exec, &mut state, &plan)
        .unwrap();

    let builds: Vec<String> = exec
        .events()
        .into_iter()
        .filter(|e| e.starts_with("run build"))
        .collect();
    assert_eq!(builds, vec!["run build contikimac_driver", "run build nullrdc_driver"]);
}

#[test]
fn assume_programmed_skips_the_first_build() {
    let bench = Bench::new();
    let tuple = ParameterTuple::simple(1, 0, RdcDriver::ContikiMac);
    let mut exec = FakeExec::new();
    let mut state = CampaignState::new(RigState::assume_programmed(RdcDriver::ContikiMac));

    bench
        .runner(EscalationPolicy::default())
        .run_campaign(&mut exec, &mut state, &[tuple], 1)
        .unwrap();

    assert!(exec.positions("run build").is_empty());
    assert_eq!(exec.positions("spawn bridge").len(), 1);
}

#[test]
fn interleaved_rounds_alternate_tuples() {
    let bench = Bench::new();
    let mut interleaved = spec(vec![1, 2], vec![RdcDriver::ContikiMac], 2);
    interleaved.interleave = true;
    let plan = plan(&[interleaved]);
    let mut exec = FakeExec::new();
    let mut state = CampaignState::default();

    bench
        .runner(EscalationPolicy::default())
        .run_plan(&mut exec, &mut state, &plan)
        .unwrap();

    assert_eq!(
        exec.client_calls(),
        vec![
            "run client 2 0",
            "run client 3 0",
            "run client 2 0",
            "run client 3 0"
        ]
    );
}

#[test]
fn interruption_stops_every_background_process() {
    let bench = Bench::new();
    let store = bench.store();
    let tuple = ParameterTuple::simple(2, 0, RdcDriver::ContikiMac);
    let mut exec = FakeExec::new();
    exec.interrupt_on_client = Some(Arc::clone(&bench.shutdown));
    let plan = plan(&[spec(vec![2], vec![RdcDriver::ContikiMac], 1)]);
    let mut state = CampaignState::default();

    let err = bench
        .runner(EscalationPolicy::default())
        .run_plan(&mut exec, &mut state, &plan)
        .unwrap_err();

    assert!(matches!(err, CampaignError::Interrupted));
    assert_eq!(exec.positions("spawn capture").len(), 2);
    assert_eq!(exec.positions("stop capture").len(), 2);
    assert_eq!(exec.positions("stop bridge").len(), 1);
    assert_eq!(store.count(&tuple).unwrap(), 0);

    // Leftover helpers are still cleaned up once the operator has cancelled.
    let client = exec.positions("run client")[0];
    let bridge_stop = exec.positions("stop bridge")[0];
    let last_cleanup = *exec.positions("run cleanup").last().unwrap();
    assert!(client < bridge_stop && bridge_stop < last_cleanup);
}
