//! Superstep barrier protocol over the coordination tree.
//!
//! Layout under `/kafka-graphs/pregel-<jobId>`:
//!
//! ```text
//! group/                ephemeral child per live worker
//! leader/               leader-election subtree (sequential ephemerals)
//! barriers/snd-<N>/     one marker per worker with unfinished send work
//! barriers/rcv-<N>/     one marker per worker that finished receiving
//! barriers/<phase>/ready entry gate for the phase
//! aggregates/<N>/<wid>  per-worker aggregator contributions
//! aggregates/<N>/master merged result written by the leader
//! superstep             current superstep, for observers
//! ```
//!
//! The receive barrier counts up to the group size. The send barrier counts
//! down to zero: markers are registered as work-intent before the previous
//! receive barrier can complete (step-0 intents during the join sequence) and
//! removed when the owning worker finishes sending, so a drained subtree
//! means every participating worker is done.

use crate::coord::{CoordinationClient, CreateMode, TreeCache};
use crate::error::{invariant_violation, PregelError};
use crate::state::{PregelState, Stage};
use tracing::debug;

pub const GRAPHS_PATH: &str = "/kafka-graphs";
pub const PREGEL_PREFIX: &str = "/kafka-graphs/pregel-";

pub const AGGREGATES: &str = "aggregates";
pub const BARRIERS: &str = "barriers";
pub const GROUP: &str = "group";
pub const LEADER: &str = "leader";
pub const READY: &str = "ready";
pub const SUPERSTEP: &str = "superstep";
pub const MASTER: &str = "master";

#[derive(Debug, Clone)]
pub struct JobPaths {
    root: String,
}

impl JobPaths {
    pub fn new(job_id: &str) -> Self {
        JobPaths { root: format!("{}{}", PREGEL_PREFIX, job_id) }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn group(&self) -> String {
        format!("{}/{}", self.root, GROUP)
    }

    pub fn group_member(&self, worker_id: usize) -> String {
        format!("{}/{}", self.group(), worker_id)
    }

    pub fn group_ready(&self) -> String {
        format!("{}/{}", self.group(), READY)
    }

    pub fn leader(&self) -> String {
        format!("{}/{}", self.root, LEADER)
    }

    pub fn superstep_node(&self) -> String {
        format!("{}/{}", self.root, SUPERSTEP)
    }

    pub fn barrier_dir(&self, phase: &str, superstep: i32) -> String {
        format!("{}/{}/{}-{}", self.root, BARRIERS, phase, superstep)
    }

    pub fn barrier(&self, state: PregelState) -> String {
        self.barrier_dir(state.phase_name(), state.superstep())
    }

    pub fn barrier_marker(&self, state: PregelState, worker_id: usize) -> String {
        format!("{}/{}", self.barrier(state), worker_id)
    }

    pub fn barrier_ready(&self, state: PregelState) -> String {
        format!("{}/{}", self.barrier(state), READY)
    }

    pub fn aggregates(&self, superstep: i32) -> String {
        format!("{}/{}/{}", self.root, AGGREGATES, superstep)
    }

    pub fn aggregate_contribution(&self, superstep: i32, worker_id: usize) -> String {
        format!("{}/{}", self.aggregates(superstep), worker_id)
    }

    pub fn aggregate_master(&self, superstep: i32) -> String {
        format!("{}/{}", self.aggregates(superstep), MASTER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    Wait,
    /// The receive barrier is complete and the next send phase has queued
    /// work. `ready_exists` reports whether the entry gate is already up.
    Advance { ready_exists: bool },
    /// The receive barrier is complete and no worker queued work.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveDecision {
    Wait,
    Advance,
}

/// Non-`ready` children of a barrier node; `None` when the node is absent.
fn barrier_population(cache: &TreeCache, path: &str) -> Option<usize> {
    cache.children_of(path).map(|children| children.len() - usize::from(children.contains_key(READY)))
}

/// Evaluated from the RECEIVE stage of step `N`. Advances once all `G`
/// workers have marked `rcv-N` and at least one work-intent marker exists
/// under `snd-(N+1)`; completes when none does.
pub fn send_decision(
    cache: &TreeCache,
    paths: &JobPaths,
    state: PregelState,
    group_size: usize,
) -> Result<SendDecision, PregelError> {
    debug_assert_eq!(state.stage(), Stage::Receive);
    if state.superstep() < 0 {
        return Ok(SendDecision::Advance { ready_exists: true });
    }
    let barrier = paths.barrier(state);
    let population = match barrier_population(cache, &barrier) {
        None => return Ok(SendDecision::Wait),
        Some(n) => n,
    };
    if population < group_size {
        return Ok(SendDecision::Wait);
    }
    if population > group_size {
        return Err(invariant_violation(format!(
            "{}: {} markers for a group of {}",
            barrier, population, group_size
        )));
    }
    let next_barrier = paths.barrier(state.next());
    match barrier_population(cache, &next_barrier) {
        None | Some(0) => Ok(SendDecision::Complete),
        Some(_) => Ok(SendDecision::Advance { ready_exists: cache.exists(&paths.barrier_ready(state.next())) }),
    }
}

/// Evaluated from the SEND stage of step `N`. Advances once the send barrier
/// has drained.
pub fn receive_decision(
    cache: &TreeCache,
    paths: &JobPaths,
    state: PregelState,
) -> Result<ReceiveDecision, PregelError> {
    debug_assert_eq!(state.stage(), Stage::Send);
    if state.superstep() < 0 {
        return Ok(ReceiveDecision::Advance);
    }
    let barrier = paths.barrier(state);
    match barrier_population(cache, &barrier) {
        Some(0) => Ok(ReceiveDecision::Advance),
        _ => Ok(ReceiveDecision::Wait),
    }
}

/// Transition function for the RECEIVE stage: either the same state, the
/// next one with the gate created, or COMPLETED. Repeated invocation on an
/// unchanged tree returns the same result.
pub fn maybe_ready_to_send(
    client: &CoordinationClient,
    paths: &JobPaths,
    cache: &TreeCache,
    state: PregelState,
    group_size: usize,
) -> Result<PregelState, PregelError> {
    if state.superstep() < 0 {
        return Ok(state.next());
    }
    match send_decision(cache, paths, state, group_size)? {
        SendDecision::Wait => Ok(state),
        SendDecision::Complete => Ok(state.with_status(crate::state::Status::Completed)),
        SendDecision::Advance { .. } => {
            add_ready(client, paths, state.next())?;
            Ok(state.next())
        }
    }
}

/// Transition function for the SEND stage, the receive-side counterpart.
pub fn maybe_ready_to_receive(
    client: &CoordinationClient,
    paths: &JobPaths,
    cache: &TreeCache,
    state: PregelState,
) -> Result<PregelState, PregelError> {
    if state.superstep() < 0 {
        return Ok(state.next());
    }
    match receive_decision(cache, paths, state)? {
        ReceiveDecision::Wait => Ok(state),
        ReceiveDecision::Advance => {
            add_ready(client, paths, state.next())?;
            Ok(state.next())
        }
    }
}

/// Create the entry gate for a phase, first-create-wins.
pub fn add_ready(
    client: &CoordinationClient,
    paths: &JobPaths,
    state: PregelState,
) -> Result<(), PregelError> {
    let path = paths.barrier_ready(state);
    debug!(path = %path, "adding ready");
    client.ensure(&path, &[], CreateMode::Persistent)?;
    Ok(())
}

/// Place this worker's marker under the barrier for `state`. Markers are
/// persistent: a finished worker may close its session while slower peers
/// still evaluate the barrier, and worker death is detected through group
/// membership instead.
pub fn add_marker(
    client: &CoordinationClient,
    paths: &JobPaths,
    state: PregelState,
    worker_id: usize,
) -> Result<(), PregelError> {
    let path = paths.barrier_marker(state, worker_id);
    debug!(path = %path, "adding barrier marker");
    client.ensure(&path, &[], CreateMode::Persistent)?;
    Ok(())
}

/// Remove this worker's marker; a missing marker is fine (the worker had no
/// send work to register).
pub fn remove_marker(
    client: &CoordinationClient,
    paths: &JobPaths,
    state: PregelState,
    worker_id: usize,
) -> Result<(), PregelError> {
    let path = paths.barrier_marker(state, worker_id);
    debug!(path = %path, "removing barrier marker");
    client.remove(&path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{CoordinationClient, CreateMode, TreeCache};
    use crate::fs_store::FsCoordinationStore;
    use crate::state::{Stage, Status};
    use rand::seq::SliceRandom;
    use rand::thread_rng;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;

    struct Fixture {
        dir: PathBuf,
        client: CoordinationClient,
        paths: JobPaths,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("kgraph-barrier-{}-{}", name, std::process::id()));
            let _ = fs::remove_dir_all(&dir);
            let store = Arc::new(FsCoordinationStore::open(&dir).unwrap());
            let client = CoordinationClient::connect(store);
            let paths = JobPaths::new(name);
            client.ensure(paths.root(), &[], CreateMode::Persistent).unwrap();
            Fixture { dir, client, paths }
        }

        fn cache(&self) -> TreeCache {
            TreeCache::new(&self.client, self.paths.root()).unwrap()
        }

        fn rcv(&self, superstep: i32) -> PregelState {
            let mut state = PregelState::initial().running();
            while !(state.superstep() == superstep && state.stage() == Stage::Receive) {
                state = state.next();
            }
            state
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    #[test]
    fn bootstrap_advances_unconditionally() {
        let fx = Fixture::new("bootstrap");
        let cache = fx.cache();
        let state = PregelState::initial().running();
        let out = maybe_ready_to_send(&fx.client, &fx.paths, &cache, state, 2).unwrap();
        assert_eq!((out.superstep(), out.stage()), (0, Stage::Send));
    }

    #[test]
    fn receive_barrier_counts_up_to_group_size() {
        let fx = Fixture::new("countup");
        let state = fx.rcv(0);
        // work is queued for step 1, so completion is not an option
        add_marker(&fx.client, &fx.paths, state.next(), 0).unwrap();

        add_marker(&fx.client, &fx.paths, state, 0).unwrap();
        let out = maybe_ready_to_send(&fx.client, &fx.paths, &fx.cache(), state, 2).unwrap();
        assert_eq!(out, state);

        add_marker(&fx.client, &fx.paths, state, 1).unwrap();
        let out = maybe_ready_to_send(&fx.client, &fx.paths, &fx.cache(), state, 2).unwrap();
        assert_eq!((out.superstep(), out.stage()), (1, Stage::Send));
        assert!(fx.client.exists(&fx.paths.barrier_ready(state.next())).unwrap());
    }

    #[test]
    fn empty_next_send_barrier_means_completed() {
        let fx = Fixture::new("complete");
        let state = fx.rcv(0);
        add_marker(&fx.client, &fx.paths, state, 0).unwrap();
        add_marker(&fx.client, &fx.paths, state, 1).unwrap();
        let out = maybe_ready_to_send(&fx.client, &fx.paths, &fx.cache(), state, 2).unwrap();
        assert_eq!(out.status(), Status::Completed);
        assert_eq!(out.superstep(), 0);
        assert!(!fx.client.exists(&fx.paths.barrier(state.next())).unwrap());
    }

    #[test]
    fn send_barrier_drains_to_zero() {
        let fx = Fixture::new("drain");
        let state = fx.rcv(0).next(); // snd-1
        add_marker(&fx.client, &fx.paths, state, 0).unwrap();
        add_marker(&fx.client, &fx.paths, state, 1).unwrap();

        let out = maybe_ready_to_receive(&fx.client, &fx.paths, &fx.cache(), state).unwrap();
        assert_eq!(out, state);

        remove_marker(&fx.client, &fx.paths, state, 0).unwrap();
        let out = maybe_ready_to_receive(&fx.client, &fx.paths, &fx.cache(), state).unwrap();
        assert_eq!(out, state);

        remove_marker(&fx.client, &fx.paths, state, 1).unwrap();
        let out = maybe_ready_to_receive(&fx.client, &fx.paths, &fx.cache(), state).unwrap();
        assert_eq!((out.superstep(), out.stage()), (1, Stage::Receive));
        assert!(fx.client.exists(&fx.paths.barrier_ready(out)).unwrap());
    }

    #[test]
    fn the_ready_gate_does_not_count() {
        let fx = Fixture::new("readyskip");
        let state = fx.rcv(2);
        add_marker(&fx.client, &fx.paths, state.next(), 1).unwrap();
        fx.client.ensure(&fx.paths.barrier_ready(state), &[], CreateMode::Persistent).unwrap();
        add_marker(&fx.client, &fx.paths, state, 0).unwrap();
        // one real marker plus ready: still short of G=2
        let out = maybe_ready_to_send(&fx.client, &fx.paths, &fx.cache(), state, 2).unwrap();
        assert_eq!(out, state);
    }

    #[test]
    fn overfull_receive_barrier_is_fatal() {
        let fx = Fixture::new("overfull");
        let state = fx.rcv(0);
        for wid in 0..3 {
            add_marker(&fx.client, &fx.paths, state, wid).unwrap();
        }
        let err = maybe_ready_to_send(&fx.client, &fx.paths, &fx.cache(), state, 2).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvariantViolation);
    }

    #[test]
    fn reevaluation_is_idempotent() {
        let fx = Fixture::new("idem");
        let state = fx.rcv(0);
        add_marker(&fx.client, &fx.paths, state.next(), 0).unwrap();
        add_marker(&fx.client, &fx.paths, state, 0).unwrap();
        add_marker(&fx.client, &fx.paths, state, 1).unwrap();
        let first = maybe_ready_to_send(&fx.client, &fx.paths, &fx.cache(), state, 2).unwrap();
        let second = maybe_ready_to_send(&fx.client, &fx.paths, &fx.cache(), state, 2).unwrap();
        assert_eq!(first, second);
    }

    // Barrier monotonicity: however tree mutations interleave with
    // re-evaluations, the returned state never moves backwards.
    #[test]
    fn random_event_orders_never_regress() {
        let mut rng = thread_rng();
        for round in 0..20 {
            let fx = Fixture::new(&format!("mono{}", round));
            let group_size = 3;
            let rcv0 = fx.rcv(0);
            let snd1 = rcv0.next();

            let mut mutations: Vec<Box<dyn Fn(&Fixture)>> = Vec::new();
            for wid in 0..group_size {
                mutations.push(Box::new(move |fx: &Fixture| {
                    add_marker(&fx.client, &fx.paths, fx.rcv(0), wid).unwrap();
                }));
                mutations.push(Box::new(move |fx: &Fixture| {
                    add_marker(&fx.client, &fx.paths, fx.rcv(0).next(), wid).unwrap();
                }));
            }
            mutations.shuffle(&mut rng);

            let mut state = PregelState::initial().running();
            state = maybe_ready_to_send(&fx.client, &fx.paths, &fx.cache(), state, group_size).unwrap();
            let mut last = state.ordinal();
            for mutation in mutations {
                mutation(&fx);
                state = match state.stage() {
                    Stage::Receive => {
                        maybe_ready_to_send(&fx.client, &fx.paths, &fx.cache(), state, group_size).unwrap()
                    }
                    Stage::Send => {
                        maybe_ready_to_receive(&fx.client, &fx.paths, &fx.cache(), state).unwrap()
                    }
                };
                assert!(state.ordinal() >= last, "state regressed");
                last = state.ordinal();
            }
            let _ = (rcv0, snd1);
        }
    }
}
