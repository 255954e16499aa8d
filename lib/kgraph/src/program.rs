//! The contract between the engine and a user algorithm. A program is one
//! type implementing [`VertexProgram`]; per-phase behavior branches on the
//! superstep number inside `compute`. Callbacks collect effects (value
//! updates, messages, edge mutations, aggregator deltas, halt votes) which
//! the driver applies at the superstep boundary.

use crate::aggregators::{AggregateView, AggregatorHandle, AggregatorRegistry, Reducer};
use crate::config::PregelConfig;
use crate::error::{config_error, serde_error, PregelError};
use crate::router::OutboundBuffers;
use crate::transport::MessageTransport;
use crate::vertices::{Edge, EdgeMutation, StagedUpdate};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;

/// An associative, commutative reduction over messages bound for the same
/// destination. Must not be used when the algorithm relies on message
/// multiplicity.
pub trait Combiner<K, M>: Send + Sync {
    fn combine(&self, dst: &K, a: M, b: M) -> M;
}

pub trait VertexProgram: Sized + Send + Sync + 'static {
    type Id: Serialize + DeserializeOwned + Clone + Eq + Ord + Hash + Debug + Send + Sync + 'static;
    type Value: Serialize + DeserializeOwned + Clone + Debug + Default + Send + Sync + 'static;
    type EdgeValue: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;
    type Message: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;

    /// Runs once per worker before the first superstep; the place to
    /// register aggregators.
    fn init(&self, _config: &PregelConfig, _cb: &mut InitCallback<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_superstep(&self, _superstep: i32, _aggregates: &AggregateView) {}

    fn post_superstep(&self, _superstep: i32, _aggregates: &AggregateView) {}

    /// Invoked for every vertex that is unhalted, has pending messages, or
    /// is starting superstep 0.
    fn compute(
        &self,
        superstep: i32,
        vertex: &VertexView<'_, Self>,
        messages: &[Self::Message],
        cb: &mut ComputeCallback<'_, Self>,
    ) -> anyhow::Result<()>;

    /// Runs on the elected leader between supersteps, after the global
    /// aggregator merge for `superstep` and before any worker can enter the
    /// next one.
    fn master_compute(&self, _superstep: i32, _cb: &mut MasterCallback<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn combiner(&self) -> Option<Box<dyn Combiner<Self::Id, Self::Message>>> {
        None
    }
}

pub struct VertexView<'a, P: VertexProgram> {
    pub id: &'a P::Id,
    pub value: &'a P::Value,
    pub edges: &'a [Edge<P::Id, P::EdgeValue>],
}

pub struct InitCallback<'a> {
    registry: &'a mut AggregatorRegistry,
}

impl<'a> InitCallback<'a> {
    pub(crate) fn new(registry: &'a mut AggregatorRegistry) -> Self {
        InitCallback { registry }
    }

    pub fn register_aggregator<R: Reducer>(
        &mut self,
        name: &str,
        reducer: R,
        persistent: bool,
    ) -> Result<AggregatorHandle<R::Value>, PregelError> {
        self.registry.register(name, reducer, persistent)
    }
}

pub struct ComputeCallback<'a, P: VertexProgram> {
    superstep: i32,
    aggregates: &'a AggregateView,
    transport: &'a dyn MessageTransport,
    outbound: &'a mut OutboundBuffers,
    deltas: &'a mut Vec<(String, Value)>,
    staged: StagedUpdate<P::Id, P::Value, P::EdgeValue>,
}

impl<'a, P: VertexProgram> ComputeCallback<'a, P> {
    pub(crate) fn new(
        superstep: i32,
        id: P::Id,
        aggregates: &'a AggregateView,
        transport: &'a dyn MessageTransport,
        outbound: &'a mut OutboundBuffers,
        deltas: &'a mut Vec<(String, Value)>,
    ) -> Self {
        ComputeCallback {
            superstep,
            aggregates,
            transport,
            outbound,
            deltas,
            staged: StagedUpdate::new(id),
        }
    }

    pub fn superstep(&self) -> i32 {
        self.superstep
    }

    /// Staged; visible from the next superstep.
    pub fn set_new_vertex_value(&mut self, value: P::Value) {
        self.staged.new_value = Some(value);
    }

    /// Queue a message for delivery to `dst` in the next superstep.
    /// Self-messages are permitted.
    pub fn send_message_to(&mut self, dst: &P::Id, msg: P::Message) -> Result<(), PregelError> {
        self.outbound.emit(self.transport, self.superstep + 1, dst, &msg)
    }

    pub fn add_edge(&mut self, target: P::Id, value: P::EdgeValue) {
        self.staged.edge_mutations.push(EdgeMutation::Add { target, value });
    }

    pub fn remove_edge(&mut self, target: P::Id) {
        self.staged.edge_mutations.push(EdgeMutation::Remove { target });
    }

    pub fn vote_to_halt(&mut self) {
        self.staged.halt = true;
    }

    pub fn aggregate<T: Serialize + 'static>(
        &mut self,
        handle: &AggregatorHandle<T>,
        delta: T,
    ) -> Result<(), PregelError> {
        let delta = serde_json::to_value(delta)
            .map_err(|e| serde_error(format!("aggregator '{}': {}", handle.name(), e)))?;
        self.deltas.push((handle.name().to_string(), delta));
        Ok(())
    }

    pub fn aggregate_named<T: Serialize + 'static>(
        &mut self,
        name: &str,
        delta: T,
    ) -> Result<(), PregelError> {
        self.aggregates.check::<T>(name)?;
        let delta = serde_json::to_value(delta)
            .map_err(|e| serde_error(format!("aggregator '{}': {}", name, e)))?;
        self.deltas.push((name.to_string(), delta));
        Ok(())
    }

    /// The value merged from every worker's contributions in the previous
    /// superstep (the reducer identity during superstep 0).
    pub fn get_aggregated_value<T: DeserializeOwned + 'static>(
        &self,
        name: &str,
    ) -> Result<T, PregelError> {
        self.aggregates.get(name)
    }

    pub(crate) fn into_staged(self) -> StagedUpdate<P::Id, P::Value, P::EdgeValue> {
        self.staged
    }
}

pub struct MasterCallback<'a> {
    view: &'a AggregateView,
    merged: &'a mut BTreeMap<String, Value>,
    halt: &'a mut bool,
}

impl<'a> MasterCallback<'a> {
    pub(crate) fn new(
        view: &'a AggregateView,
        merged: &'a mut BTreeMap<String, Value>,
        halt: &'a mut bool,
    ) -> Self {
        MasterCallback { view, merged, halt }
    }

    pub fn get_aggregated_value<T: DeserializeOwned + 'static>(
        &self,
        name: &str,
    ) -> Result<T, PregelError> {
        self.view.check::<T>(name)?;
        let raw = self
            .merged
            .get(name)
            .ok_or_else(|| config_error(format!("unknown aggregator '{}'", name)))?;
        serde_json::from_value(raw.clone())
            .map_err(|e| serde_error(format!("aggregator '{}': {}", name, e)))
    }

    /// Override the merged value; every worker observes it in the next
    /// superstep.
    pub fn set_aggregated_value<T: Serialize + 'static>(
        &mut self,
        name: &str,
        value: T,
    ) -> Result<(), PregelError> {
        AggregatorRegistry::set_aggregated_value(self.merged, self.view, name, value)
    }

    /// Force global termination at the next barrier crossing, regardless of
    /// pending work.
    pub fn halt_computation(&mut self) {
        *self.halt = true;
    }
}
