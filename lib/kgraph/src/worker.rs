//! Worker lifecycle and the per-superstep compute driver.
//!
//! Each worker joins the group, places its step-0 work-intent marker, elects
//! a leader through sequential-ephemeral nodes, and then loops: SEND
//! (compute over owned vertices, apply staged mutations, flush outbound
//! batches, publish the aggregate contribution, drain its send marker),
//! RECEIVE (drain assigned partitions into per-vertex bags, register the
//! next step's work-intent, mark the receive barrier). Between supersteps
//! the leader merges aggregator contributions, runs the master program, and
//! opens the gate for the next send phase.

use crate::aggregators::{AggregatorRegistry, MergedAggregates};
use crate::barrier::{self, JobPaths, ReceiveDecision, SendDecision};
use crate::config::PregelConfig;
use crate::coord::{CoordError, CoordinationClient, CoordinationStore, CreateMode, TreeCache};
use crate::error::{
    config_error, invariant_violation, job_aborted, serde_error, user_error, ErrorKind, PregelError,
};
use crate::program::{Combiner, ComputeCallback, InitCallback, MasterCallback, VertexProgram, VertexView};
use crate::router::{self, MessageBags, OutboundBuffers};
use crate::state::{PregelState, Status};
use crate::transport::{InMemoryLog, MessageTransport};
use crate::vertices::{Edge, StagedUpdate, VertexStore};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Safety net against a wedged job; barrier progress normally arrives as
/// watch events well before this.
const BARRIER_TIMEOUT: Duration = Duration::from_secs(300);

pub type GraphInput<P> = Vec<(
    <P as VertexProgram>::Id,
    <P as VertexProgram>::Value,
    Vec<Edge<<P as VertexProgram>::Id, <P as VertexProgram>::EdgeValue>>,
)>;

#[derive(Debug, Clone, Default)]
pub struct SuperstepStats {
    pub superstep: i32,
    pub computed_vertices: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub compute_ms: u64,
}

pub struct WorkerReport<P: VertexProgram> {
    pub worker_id: usize,
    pub last_superstep: i32,
    pub aggregates: BTreeMap<String, Value>,
    pub vertices: HashMap<P::Id, P::Value>,
    pub stats: Vec<SuperstepStats>,
}

struct ShardOutcome<K, V, E> {
    staged: Vec<StagedUpdate<K, V, E>>,
    deltas: Vec<(String, Value)>,
    sent: u64,
    computed: usize,
}

pub struct PregelWorker<P: VertexProgram> {
    worker_id: usize,
    paths: JobPaths,
    config: PregelConfig,
    group_size: usize,
    num_partitions: usize,
    max_iterations: i32,
    client: CoordinationClient,
    transport: Arc<dyn MessageTransport>,
    program: Arc<P>,
    store: VertexStore<P::Id, P::Value, P::EdgeValue, P::Message>,
    aggregators: AggregatorRegistry,
    combiner: Option<Box<dyn Combiner<P::Id, P::Message>>>,
    offsets: Vec<(usize, u64)>,
    is_leader: bool,
    stats: Vec<SuperstepStats>,
}

impl<P: VertexProgram> PregelWorker<P> {
    pub fn new(
        worker_id: usize,
        job_id: &str,
        config: PregelConfig,
        coordination: Arc<dyn CoordinationStore>,
        transport: Arc<dyn MessageTransport>,
        program: Arc<P>,
        graph: &[(P::Id, P::Value, Vec<Edge<P::Id, P::EdgeValue>>)],
    ) -> Result<Self, PregelError> {
        let group_size = config.group_size()?;
        if worker_id >= group_size {
            return Err(config_error(format!(
                "worker id {} outside group of {}",
                worker_id, group_size
            )));
        }
        let num_partitions = config.num_partitions()?;
        if transport.num_partitions() != num_partitions {
            return Err(config_error(format!(
                "transport has {} partitions, config says {}",
                transport.num_partitions(),
                num_partitions
            )));
        }
        let max_iterations = config.max_iterations()?;

        let mut store = VertexStore::new(num_cpus::get().min(16));
        for (id, value, edges) in graph {
            if router::owner_worker(id, num_partitions, group_size)? == worker_id {
                store.insert_vertex(id.clone(), value.clone(), edges.clone());
            }
        }
        let combiner = if config.combiner_enabled() { program.combiner() } else { None };
        let offsets = (0..num_partitions)
            .filter(|p| router::worker_for_partition(*p, group_size) == worker_id)
            .map(|p| (p, 0))
            .collect();

        Ok(PregelWorker {
            worker_id,
            paths: JobPaths::new(job_id),
            config,
            group_size,
            num_partitions,
            max_iterations,
            client: CoordinationClient::connect(coordination),
            transport,
            program,
            store,
            aggregators: AggregatorRegistry::new(),
            combiner,
            offsets,
            is_leader: false,
            stats: Vec::new(),
        })
    }

    pub fn run(mut self) -> Result<WorkerReport<P>, PregelError> {
        {
            let program = Arc::clone(&self.program);
            let mut cb = InitCallback::new(&mut self.aggregators);
            program
                .init(&self.config, &mut cb)
                .map_err(|e| user_error(format!("init: {:#}", e)))?;
        }
        let mut cache = self.join()?;
        info!(
            worker = self.worker_id,
            leader = self.is_leader,
            vertices = self.store.len(),
            "joined group"
        );

        let mut state = PregelState::initial().running();
        match self.superstep_loop(&mut cache, &mut state) {
            Ok(()) => Ok(self.into_report(state.superstep())),
            Err(e) => {
                if e.kind() == ErrorKind::UserError {
                    // poison the job so peers abort too
                    let _ = self.client.remove_recursive(self.paths.root());
                }
                Err(e)
            }
        }
    }

    fn superstep_loop(
        &mut self,
        cache: &mut TreeCache,
        state: &mut PregelState,
    ) -> Result<(), PregelError> {
        loop {
            *state = self.await_send(cache, *state)?;
            if state.status() == Status::Completed {
                return Ok(());
            }
            self.run_send_phase(*state)?;
            *state = self.await_receive(cache, *state)?;
            self.run_receive_phase(*state)?;
        }
    }

    /// Join sequence: ensure the job tree, register membership and the
    /// step-0 work intent, pass the group barrier, elect the leader.
    fn join(&mut self) -> Result<TreeCache, PregelError> {
        let root = self.paths.root().to_string();
        for path in [
            barrier::GRAPHS_PATH.to_string(),
            root.clone(),
            self.paths.group(),
            format!("{}/{}", root, barrier::BARRIERS),
            format!("{}/{}", root, barrier::AGGREGATES),
            self.paths.leader(),
        ] {
            self.client.ensure(&path, &[], CreateMode::Persistent)?;
        }
        self.client.ensure(&self.paths.superstep_node(), b"-1", CreateMode::Persistent)?;

        let mut cache = TreeCache::new(&self.client, &root)?;
        self.client.ensure(&self.paths.group_member(self.worker_id), &[], CreateMode::Ephemeral)?;
        // every vertex starts active, so the step-0 intent goes up before
        // the group is allowed to start
        let snd0 = PregelState::initial().running().next();
        barrier::add_marker(&self.client, &self.paths, snd0, self.worker_id)?;

        loop {
            cache.refresh();
            if cache.exists(&self.paths.group_ready()) {
                break;
            }
            let members = match cache.children_of(&self.paths.group()) {
                None => return Err(job_aborted("job root vanished while joining".to_string())),
                Some(children) => {
                    children.len() - usize::from(children.contains_key(barrier::READY))
                }
            };
            if members > self.group_size {
                return Err(invariant_violation(format!(
                    "{}: {} members for a group of {}",
                    self.paths.group(),
                    members,
                    self.group_size
                )));
            }
            if members == self.group_size {
                self.client.ensure(&self.paths.group_ready(), &[], CreateMode::Persistent)?;
                break;
            }
            self.wait_for_event(&mut cache)?;
        }

        let me = self.client.create(
            &format!("{}/member-", self.paths.leader()),
            &[],
            CreateMode::EphemeralSequential,
        )?;
        let my_name = me.rsplit('/').next().unwrap_or(&me).to_string();
        loop {
            cache.refresh();
            if let Some(candidates) = cache.children_of(&self.paths.leader()) {
                if candidates.len() >= self.group_size {
                    // lowest sequence number leads
                    self.is_leader =
                        candidates.keys().next().map(String::as_str) == Some(my_name.as_str());
                    break;
                }
            }
            self.wait_for_event(&mut cache)?;
        }
        Ok(cache)
    }

    /// RECEIVE stage of step `N`: wait until all receive markers are in,
    /// then either advance into SEND of `N+1` behind the leader's gate or
    /// complete. Applying the step-`N` merge to the previous cells happens
    /// here, on whichever path is taken.
    fn await_send(
        &mut self,
        cache: &mut TreeCache,
        state: PregelState,
    ) -> Result<PregelState, PregelError> {
        if state.superstep() < 0 {
            return Ok(state.next());
        }
        let n = state.superstep();
        loop {
            // drain events before deciding: a finished peer's departure is
            // always ordered after the barrier markers that let it finish,
            // so a fully caught-up cache never mistakes completion for death
            cache.refresh();
            match barrier::send_decision(cache, &self.paths, state, self.group_size)? {
                SendDecision::Wait => {
                    self.check_group(cache)?;
                    self.wait_for_event(cache)?;
                }
                SendDecision::Complete => {
                    let merged = if self.is_leader {
                        self.merge_and_master(n)?
                    } else {
                        self.await_merged(cache, n)?
                    };
                    self.aggregators.finish_superstep(&merged.values)?;
                    info!(worker = self.worker_id, superstep = n, "no more work, completing");
                    return Ok(state.with_status(Status::Completed));
                }
                SendDecision::Advance { ready_exists } => {
                    if self.is_leader && !ready_exists {
                        let merged = self.merge_and_master(n)?;
                        if merged.halt || n + 1 >= self.max_iterations {
                            self.aggregators.finish_superstep(&merged.values)?;
                            info!(
                                worker = self.worker_id,
                                superstep = n,
                                master_halt = merged.halt,
                                "halting"
                            );
                            return Ok(state.with_status(Status::Completed));
                        }
                        self.client
                            .set_data(&self.paths.superstep_node(), format!("{}", n + 1).as_bytes())?;
                        self.collect_garbage(n)?;
                        barrier::add_ready(&self.client, &self.paths, state.next())?;
                        self.aggregators.finish_superstep(&merged.values)?;
                        return Ok(state.next());
                    }
                    if ready_exists {
                        let merged =
                            MergedAggregates::from_bytes(&self.client.get_data(&self.paths.aggregate_master(n))?)?;
                        self.aggregators.finish_superstep(&merged.values)?;
                        return Ok(state.next());
                    }
                    // the leader has not opened the gate; the payload may
                    // carry a halt instead
                    if let Some(merged) = self.try_merged(cache, n)? {
                        if merged.halt || n + 1 >= self.max_iterations {
                            self.aggregators.finish_superstep(&merged.values)?;
                            info!(worker = self.worker_id, superstep = n, "halting with leader");
                            return Ok(state.with_status(Status::Completed));
                        }
                    }
                    self.check_group(cache)?;
                    self.wait_for_event(cache)?;
                }
            }
        }
    }

    /// SEND stage of step `N`: wait for the send barrier to drain, then open
    /// the receive gate and advance.
    fn await_receive(
        &mut self,
        cache: &mut TreeCache,
        state: PregelState,
    ) -> Result<PregelState, PregelError> {
        loop {
            cache.refresh();
            match barrier::receive_decision(cache, &self.paths, state)? {
                ReceiveDecision::Advance => {
                    barrier::add_ready(&self.client, &self.paths, state.next())?;
                    return Ok(state.next());
                }
                ReceiveDecision::Wait => {
                    self.check_group(cache)?;
                    self.wait_for_event(cache)?;
                }
            }
        }
    }

    fn run_send_phase(&mut self, state: PregelState) -> Result<(), PregelError> {
        let n = state.superstep();
        let started = Instant::now();
        let view = self.aggregators.view();
        self.program.pre_superstep(n, &view);

        let program = Arc::clone(&self.program);
        let transport = Arc::clone(&self.transport);
        let num_partitions = self.num_partitions;
        let outcomes: Vec<ShardOutcome<P::Id, P::Value, P::EdgeValue>> = self
            .store
            .shards_mut()
            .par_iter_mut()
            .map(|shard| {
                let mut outbound = OutboundBuffers::new(num_partitions);
                let mut deltas = Vec::new();
                let mut staged = Vec::new();
                let mut computed = 0usize;
                for (id, entry) in shard.iter_mut() {
                    let active = n == 0 || !entry.halted || !entry.inbox.is_empty();
                    if !active {
                        continue;
                    }
                    let messages = std::mem::take(&mut entry.inbox);
                    let mut cb = ComputeCallback::<P>::new(
                        n,
                        id.clone(),
                        &view,
                        transport.as_ref(),
                        &mut outbound,
                        &mut deltas,
                    );
                    let vertex = VertexView::<P> { id, value: &entry.value, edges: &entry.edges };
                    program
                        .compute(n, &vertex, &messages, &mut cb)
                        .map_err(|e| user_error(format!("compute at superstep {}: {:#}", n, e)))?;
                    let update = cb.into_staged();
                    if !update.is_noop() {
                        staged.push(update);
                    }
                    computed += 1;
                }
                outbound.flush_all(transport.as_ref())?;
                Ok(ShardOutcome { staged, deltas, sent: outbound.messages_sent(), computed })
            })
            .collect::<Result<Vec<_>, PregelError>>()?;

        let mut staged = Vec::new();
        let mut sent = 0u64;
        let mut computed = 0usize;
        for outcome in outcomes {
            for (name, delta) in outcome.deltas {
                self.aggregators.aggregate_raw(&name, delta)?;
            }
            staged.extend(outcome.staged);
            sent += outcome.sent;
            computed += outcome.computed;
        }
        self.store.apply_staged(staged);
        self.program.post_superstep(n, &self.aggregators.view());

        let contribution = serde_json::to_vec(&self.aggregators.current_snapshot())
            .map_err(|e| serde_error(format!("contribution: {}", e)))?;
        self.client.ensure(
            &self.paths.aggregate_contribution(n, self.worker_id),
            &contribution,
            CreateMode::Persistent,
        )?;
        barrier::remove_marker(&self.client, &self.paths, state, self.worker_id)?;

        let elapsed = started.elapsed().as_millis() as u64;
        info!(
            worker = self.worker_id,
            superstep = n,
            computed,
            sent,
            elapsed_ms = elapsed,
            "send phase done"
        );
        self.stats.push(SuperstepStats {
            superstep: n,
            computed_vertices: computed,
            messages_sent: sent,
            messages_received: 0,
            compute_ms: elapsed,
        });
        Ok(())
    }

    fn run_receive_phase(&mut self, state: PregelState) -> Result<(), PregelError> {
        let n = state.superstep();
        let mut bags: MessageBags<P::Id, P::Message> = MessageBags::new();
        for (partition, offset) in self.offsets.iter_mut() {
            let records = self.transport.fetch(*partition, *offset)?;
            *offset += records.len() as u64;
            for record in &records {
                let (dst, msg) = router::decode_record::<P::Id, P::Message>(record, n + 1, *partition)?;
                bags.deliver(dst, msg, self.combiner.as_deref());
            }
        }
        let received = bags.received();
        for (id, messages) in bags.into_inner() {
            self.store.deliver(id, messages);
        }
        // register the next step's work intent before the receive marker, so
        // the next send barrier cannot drain before every participant is in
        if self.store.has_local_work() {
            barrier::add_marker(&self.client, &self.paths, state.next(), self.worker_id)?;
        }
        barrier::add_marker(&self.client, &self.paths, state, self.worker_id)?;

        if let Some(last) = self.stats.last_mut() {
            last.messages_received = received;
        }
        debug!(worker = self.worker_id, superstep = n, received, "receive phase done");
        Ok(())
    }

    /// Reduce the `G` contributions for step `n`, run the master program,
    /// and publish the result. An already-published merge wins, so replays
    /// are no-ops.
    fn merge_and_master(&mut self, n: i32) -> Result<MergedAggregates, PregelError> {
        let master_path = self.paths.aggregate_master(n);
        match self.client.get_data(&master_path) {
            Ok(bytes) => return MergedAggregates::from_bytes(&bytes),
            Err(CoordError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let node = self.paths.aggregates(n);
        let children = self
            .client
            .children(&node)?
            .ok_or_else(|| invariant_violation(format!("{}: no contributions", node)))?;
        let mut contributions = Vec::new();
        for (name, data) in &children {
            if name == barrier::MASTER {
                continue;
            }
            contributions.push(
                serde_json::from_slice::<BTreeMap<String, Value>>(data)
                    .map_err(|e| serde_error(format!("contribution {}/{}: {}", node, name, e)))?,
            );
        }
        if contributions.len() != self.group_size {
            return Err(invariant_violation(format!(
                "{}: {} contributions for a group of {}",
                node,
                contributions.len(),
                self.group_size
            )));
        }

        let mut values = self.aggregators.merge_contributions(&contributions)?;
        let mut halt = false;
        let view = self.aggregators.view();
        {
            let mut cb = MasterCallback::new(&view, &mut values, &mut halt);
            self.program
                .master_compute(n, &mut cb)
                .map_err(|e| user_error(format!("master_compute at superstep {}: {:#}", n, e)))?;
        }
        let merged = MergedAggregates { values, halt };
        self.client.ensure(&master_path, &merged.to_bytes()?, CreateMode::Persistent)?;
        debug!(worker = self.worker_id, superstep = n, halt, "published merged aggregates");
        Ok(merged)
    }

    fn try_merged(&self, cache: &TreeCache, n: i32) -> Result<Option<MergedAggregates>, PregelError> {
        match cache.data(&self.paths.aggregate_master(n)) {
            Some(bytes) if !bytes.is_empty() => Ok(Some(MergedAggregates::from_bytes(bytes)?)),
            _ => Ok(None),
        }
    }

    fn await_merged(&self, cache: &mut TreeCache, n: i32) -> Result<MergedAggregates, PregelError> {
        loop {
            cache.refresh();
            if let Some(merged) = self.try_merged(cache, n)? {
                return Ok(merged);
            }
            // the payload is persistent, so a leader that wrote it and left
            // is still observable; only a dead leader stalls us here
            self.check_group(cache)?;
            self.wait_for_event(cache)?;
        }
    }

    /// Step `n-1` is out of reach for everyone once `rcv-n` is complete.
    fn collect_garbage(&self, n: i32) -> Result<(), PregelError> {
        if n < 1 {
            return Ok(());
        }
        self.client.remove_recursive(&self.paths.barrier_dir("snd", n - 1))?;
        self.client.remove_recursive(&self.paths.barrier_dir("rcv", n - 1))?;
        self.client.remove_recursive(&self.paths.aggregates(n - 1))?;
        Ok(())
    }

    fn check_group(&self, cache: &TreeCache) -> Result<(), PregelError> {
        let Some(children) = cache.children_of(&self.paths.group()) else {
            return Err(job_aborted(format!("worker {}: job root torn down", self.worker_id)));
        };
        let members = children.len() - usize::from(children.contains_key(barrier::READY));
        if members < self.group_size {
            return Err(job_aborted(format!(
                "worker {}: group shrank to {} of {}",
                self.worker_id, members, self.group_size
            )));
        }
        Ok(())
    }

    fn wait_for_event(&self, cache: &mut TreeCache) -> Result<(), PregelError> {
        if cache.await_change(BARRIER_TIMEOUT) {
            Ok(())
        } else {
            Err(job_aborted(format!(
                "worker {}: no coordination activity within {:?}",
                self.worker_id, BARRIER_TIMEOUT
            )))
        }
    }

    fn into_report(self, last_superstep: i32) -> WorkerReport<P> {
        let vertices =
            self.store.iter().map(|(id, entry)| (id.clone(), entry.value.clone())).collect();
        WorkerReport {
            worker_id: self.worker_id,
            last_superstep,
            aggregates: self.aggregators.previous_snapshot(),
            vertices,
            stats: self.stats,
        }
    }
}

/// Final state visible to the controller.
pub struct JobResult<P: VertexProgram> {
    pub last_superstep: i32,
    pub aggregates: BTreeMap<String, Value>,
    pub vertices: HashMap<P::Id, P::Value>,
}

impl<P: VertexProgram> std::fmt::Debug for JobResult<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobResult")
            .field("last_superstep", &self.last_superstep)
            .field("aggregates", &self.aggregates)
            .field("vertices", &self.vertices)
            .finish()
    }
}

impl<P: VertexProgram> JobResult<P> {
    pub fn aggregated<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.aggregates.get(name).and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Run a whole job in this process: `G` workers on named threads sharing one
/// coordination store and an in-memory transport. The job root is torn down
/// once every worker has been joined.
pub fn run_local<P: VertexProgram>(
    job_id: &str,
    program: P,
    config: PregelConfig,
    coordination: Arc<dyn CoordinationStore>,
    graph: GraphInput<P>,
) -> Result<JobResult<P>, PregelError> {
    let group_size = config.group_size()?;
    let num_partitions = config.num_partitions()?;
    let transport: Arc<dyn MessageTransport> = Arc::new(InMemoryLog::new(num_partitions));
    let program = Arc::new(program);
    let graph = Arc::new(graph);

    let mut handles = Vec::new();
    for worker_id in 0..group_size {
        let config = config.clone();
        let coordination = Arc::clone(&coordination);
        let transport = Arc::clone(&transport);
        let program = Arc::clone(&program);
        let graph = Arc::clone(&graph);
        let job_id = job_id.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("pregel-worker-{}", worker_id))
            .spawn(move || {
                let worker = PregelWorker::new(
                    worker_id,
                    &job_id,
                    config,
                    coordination,
                    transport,
                    program,
                    &graph,
                )?;
                worker.run()
            })
            .map_err(|e| job_aborted(format!("spawning worker {}: {}", worker_id, e)))?;
        handles.push(handle);
    }

    let mut reports = Vec::new();
    let mut first_error: Option<PregelError> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) => {
                // a user failure is the root cause; the aborts it triggers
                // on peers are noise
                let replace = match &first_error {
                    None => true,
                    Some(first) => {
                        e.kind() == ErrorKind::UserError && first.kind() != ErrorKind::UserError
                    }
                };
                if replace {
                    first_error = Some(e);
                }
            }
            Err(_) => {
                if first_error.is_none() {
                    first_error = Some(job_aborted("worker thread panicked".to_string()));
                }
            }
        }
    }

    let cleaner = CoordinationClient::connect(coordination);
    let _ = cleaner.remove_recursive(JobPaths::new(job_id).root());

    if let Some(e) = first_error {
        return Err(e);
    }

    let mut vertices = HashMap::new();
    let mut aggregates = BTreeMap::new();
    let mut last_superstep = -1;
    for report in reports {
        last_superstep = last_superstep.max(report.last_superstep);
        vertices.extend(report.vertices);
        aggregates = report.aggregates;
    }
    Ok(JobResult { last_superstep, aggregates, vertices })
}
