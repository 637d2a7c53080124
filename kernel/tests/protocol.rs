//! Dispatcher and policy server wired together through the wire codec
//!
//! Every request leaves the kernel encoded, is handled by the real policy
//! server and comes back as encoded bytes, the way the IPC transport carries
//! them.

use gsched_abi::wire;
use gsched_abi::{CpuShare, Endpoint, Justice, PriorityBounds, RejectReason, SchedConfig, MAX_MESSAGE_SIZE};
use gsched_kernel::scheduler::{DiscardReason, RuntimeFlags};
use gsched_kernel::{Dispatcher, PrivId, ResponseOutcome, SpawnParams};
use gsched_server::PolicyServer;

fn config() -> SchedConfig {
    SchedConfig::DEFAULT.with_max_processes(8)
}

fn share(ppm: u32) -> CpuShare {
    CpuShare::from_ppm(ppm).unwrap()
}

fn spawn(d: &mut Dispatcher, name: &str, bounds: PriorityBounds) -> Endpoint {
    d.spawn(SpawnParams::new(name, PrivId(1), bounds)).unwrap()
}

/// Encoded answers to every request the kernel has queued
fn exchange(d: &mut Dispatcher, server: &mut PolicyServer) -> Vec<Vec<u8>> {
    let mut requests = Vec::new();
    d.drain_encoded(|bytes| requests.push(bytes.to_vec())).unwrap();
    let mut answers = Vec::new();
    for bytes in requests {
        let mut out = [0u8; MAX_MESSAGE_SIZE];
        if let Some(len) = server.handle_encoded(&bytes, &mut out).unwrap() {
            answers.push(out[..len].to_vec());
        }
    }
    answers
}

/// One full round: requests out, answers back in
fn pump(d: &mut Dispatcher, server: &mut PolicyServer) -> Vec<ResponseOutcome> {
    exchange(d, server).iter().map(|bytes| d.deliver_encoded(bytes)).collect()
}

fn ticks(d: &mut Dispatcher, count: usize) {
    for _ in 0..count {
        d.tick();
    }
}

#[test]
fn test_requantize_round_trip() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let init = spawn(&mut d, "init", PriorityBounds::new(0, 7).with_share(share(500_000)));
    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied]);
    assert_eq!(d.current(), Some(init));

    // a full quantum alone on the CPU: twice the entitlement
    ticks(&mut d, 10);
    assert_eq!(d.current(), None);
    assert!(d.process(init).unwrap().flags().contains(RuntimeFlags::PREEMPTED));
    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied]);

    let entry = *server.entry(init).unwrap();
    let pcb = d.process(init).unwrap();
    assert_eq!(pcb.justice, Justice(2000));
    assert_eq!((pcb.priority, pcb.quantum_size, pcb.ticks_left), (11, 5, 5));
    assert_eq!((pcb.priority, pcb.quantum_size, pcb.justice), (entry.priority, entry.time_slice, entry.fairness_ratio));
    assert_eq!(pcb.accounting.preempted, 1);
    assert_eq!(pcb.schedules, 2);
    assert_eq!(d.current(), Some(init));
    assert!(d.check_invariants().is_ok());
}

#[test]
fn test_exit_while_quantum_request_outstanding() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let worker = spawn(&mut d, "worker", PriorityBounds::new(0, 7));
    pump(&mut d, &mut server);

    ticks(&mut d, 10);
    assert!(d.pending_request(worker).is_some());
    // the server answers, but the process is gone before the answer lands
    let late = exchange(&mut d, &mut server);
    assert_eq!(late.len(), 1);
    d.exit(worker).unwrap();
    assert!(d.pending_request(worker).is_none());

    // the slot is reused before the late answer arrives
    let next = spawn(&mut d, "next", PriorityBounds::new(0, 7));
    assert_eq!(next.slot(), worker.slot());
    assert_ne!(next, worker);
    assert_eq!(d.deliver_encoded(&late[0]), ResponseOutcome::Discarded(DiscardReason::StaleEndpoint));
    assert_eq!(d.process(next).unwrap().priority, 7);

    // ProcessExited then ProcessCreated reach the server in order
    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied]);
    assert!(server.entry(worker).is_none());
    assert!(server.entry(next).is_some());
    assert!(d.check_invariants().is_ok());
}

#[test]
fn test_exit_frees_slot() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let a = spawn(&mut d, "a", PriorityBounds::new(0, 7));
    let b = spawn(&mut d, "b", PriorityBounds::new(0, 7));
    pump(&mut d, &mut server);
    assert_eq!(d.ready_at(7), vec![b]);

    ticks(&mut d, 10);
    let late = exchange(&mut d, &mut server);
    d.exit(a).unwrap();
    assert_eq!(d.deliver_encoded(&late[0]), ResponseOutcome::Discarded(DiscardReason::StaleEndpoint));

    let slot = d.table().slot(a.slot()).unwrap();
    assert_eq!(slot.flags(), RuntimeFlags::SLOT_FREE);
    assert!(!slot.is_queued());
    assert!(d.ready_at(7).is_empty());
    assert_eq!(d.current(), Some(b));
    assert!(d.check_invariants().is_ok());
}

#[test]
fn test_oversubscribed_spawn_keeps_local_defaults() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let big = spawn(&mut d, "big", PriorityBounds::new(0, 7).with_share(share(950_000)));
    let small = spawn(&mut d, "small", PriorityBounds::new(0, 6).with_quantum(12).with_share(share(100_000)));
    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied, ResponseOutcome::Rejected]);

    let pcb = d.process(small).unwrap();
    assert_eq!(pcb.last_rejection, Some(RejectReason::Oversubscribed));
    assert_eq!((pcb.priority, pcb.quantum_size), (6, 12));
    // higher priority: took the CPU at spawn
    assert_eq!(d.current(), Some(small));
    assert_eq!(d.ready_at(7), vec![big]);
    assert_eq!(server.table().aggregate_share(0), 950_000);
    assert_eq!(d.stats().rejections, 1);
}

#[test]
fn test_silent_server_times_out() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let pid = spawn(&mut d, "quiet", PriorityBounds::new(0, 7));
    pump(&mut d, &mut server);

    ticks(&mut d, 10);
    assert_eq!(d.current(), None);
    // the request is sent but never answered
    d.drain_requests();
    ticks(&mut d, config().response_timeout as usize);
    assert_eq!(d.current(), Some(pid));
    assert_eq!(d.stats().timeouts, 1);
    let pcb = d.process(pid).unwrap();
    assert_eq!((pcb.priority, pcb.ticks_left), (7, 10));
}

#[test]
fn test_unreachable_server_degrades() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let pid = spawn(&mut d, "alone", PriorityBounds::new(0, 7));
    pump(&mut d, &mut server);

    d.set_policy_reachable(false);
    ticks(&mut d, 10);
    // no wait at all: fresh quantum at once
    assert_eq!(d.current(), Some(pid));
    assert_eq!(d.process(pid).unwrap().ticks_left, 10);
    assert!(d.stats().degraded >= 1);
    assert!(d.drain_requests().is_empty());

    d.set_policy_reachable(true);
    ticks(&mut d, 10);
    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied]);
}

#[test]
fn test_sweep_reaches_idle_process() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let busy = spawn(&mut d, "busy", PriorityBounds::new(0, 7).with_share(share(500_000)));
    let waiting = spawn(&mut d, "waiting", PriorityBounds::new(0, 7).with_share(share(100_000)));
    pump(&mut d, &mut server);
    ticks(&mut d, 5);

    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    let outcomes: Vec<ResponseOutcome> = server
        .maybe_sweep(600)
        .iter()
        .map(|response| {
            let bytes = wire::encode_response(response, &mut buf).unwrap();
            d.deliver_encoded(bytes)
        })
        .collect();
    // neither has reported any usage yet: both are owed
    assert_eq!(outcomes, vec![ResponseOutcome::Applied, ResponseOutcome::Applied]);
    assert!(d.process(waiting).unwrap().priority < 7);
    assert!(d.process(busy).unwrap().priority < 7);
    assert!(d.check_invariants().is_ok());
}

#[test]
fn test_sweep_yields_to_outstanding_request() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let pid = spawn(&mut d, "p", PriorityBounds::new(0, 7).with_share(share(500_000)));
    pump(&mut d, &mut server);
    ticks(&mut d, 10);
    assert!(d.pending_request(pid).is_some());

    let sweep = server.sweep(600);
    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    let bytes = wire::encode_response(&sweep[0], &mut buf).unwrap();
    assert_eq!(d.deliver_encoded(bytes), ResponseOutcome::Discarded(DiscardReason::RequestOutstanding));
    // the real answer still applies
    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied]);
}

#[test]
fn test_priority_change_through_server() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let a = spawn(&mut d, "a", PriorityBounds::new(0, 7));
    let b = spawn(&mut d, "b", PriorityBounds::new(0, 7));
    pump(&mut d, &mut server);
    assert_eq!(d.current(), Some(a));

    d.request_priority_change(b, PriorityBounds::new(0, 3).with_share(share(200_000))).unwrap();
    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied]);
    // b now outranks a and takes the CPU
    let pcb = d.process(b).unwrap();
    assert_eq!((pcb.priority, pcb.quantum_size), (3, 10));
    assert_eq!(d.current(), Some(b));
    assert_eq!(d.ready_at(7), vec![a]);
    assert_eq!(server.entry(b).map(|e| e.cpu_share), Some(share(200_000)));
    assert!(d.check_invariants().is_ok());
}

#[test]
fn test_exit_during_outage_releases_share() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let big = spawn(&mut d, "big", PriorityBounds::new(0, 7).with_share(share(900_000)));
    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied]);

    d.set_policy_reachable(false);
    d.exit(big).unwrap();
    // the slot is reused while the server cannot hear anything
    let quiet = spawn(&mut d, "quiet", PriorityBounds::new(0, 7));
    assert_eq!(quiet.slot(), big.slot());

    d.set_policy_reachable(true);
    let half = spawn(&mut d, "half", PriorityBounds::new(0, 7).with_share(share(500_000)));
    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied]);
    assert!(server.entry(big).is_none());
    assert!(server.entry(half).is_some());
    assert_eq!(server.table().aggregate_share(0), 500_000);
    assert_eq!(server.stats().exited, 1);
}

#[test]
fn test_share_change_epoch_follows_kernel_reset() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let pid = spawn(&mut d, "p", PriorityBounds::new(0, 7));
    pump(&mut d, &mut server);
    ticks(&mut d, 5);

    d.request_priority_change(pid, PriorityBounds::new(0, 7).with_share(share(500_000))).unwrap();
    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied]);
    let pcb = d.process(pid).unwrap();
    assert_eq!((pcb.accounting.cpu_time, pcb.accounting.epoch_start), (0, 5));
    assert!(server.entry(pid).unwrap().epoch_pending());

    // the remaining five ticks of the quantum
    ticks(&mut d, 5);
    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied]);
    let entry = *server.entry(pid).unwrap();
    assert!(!entry.epoch_pending());
    assert_eq!((entry.start_time, entry.cpu_time_used), (5, 5));
    assert_eq!(entry.fairness_ratio, Justice(2000));
}

#[test]
fn test_lost_share_change_keeps_epochs_aligned() {
    let mut d = Dispatcher::new(config()).unwrap();
    let mut server = PolicyServer::new(config()).unwrap();
    let pid = spawn(&mut d, "p", PriorityBounds::new(0, 7));
    pump(&mut d, &mut server);
    ticks(&mut d, 5);

    d.request_priority_change(pid, PriorityBounds::new(0, 7).with_share(share(500_000))).unwrap();
    // the server applies the new share but its answer never arrives
    assert_eq!(exchange(&mut d, &mut server).len(), 1);
    assert!(server.entry(pid).unwrap().epoch_pending());

    // timeout at 55, next quantum report at 60
    ticks(&mut d, 55);
    assert_eq!(d.stats().timeouts, 1);
    let pcb = d.process(pid).unwrap();
    assert_eq!((pcb.accounting.cpu_time, pcb.accounting.epoch_start), (60, 0));
    assert!(d.pending_request(pid).is_some());

    assert_eq!(pump(&mut d, &mut server), vec![ResponseOutcome::Applied]);
    let entry = *server.entry(pid).unwrap();
    assert!(!entry.epoch_pending());
    // 60 ticks over 60 at 0.5, measured from the kernel's own epoch
    assert_eq!((entry.start_time, entry.cpu_time_used), (0, 60));
    assert_eq!(entry.fairness_ratio, Justice(2000));
    assert_eq!(d.process(pid).unwrap().justice, Justice(2000));
}
