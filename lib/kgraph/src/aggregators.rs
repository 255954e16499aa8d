//! Named, typed reducers merged globally between supersteps. Each aggregator
//! keeps two cells: *current* collects this superstep's deltas, *previous*
//! holds the value merged from every worker's contribution in the last
//! superstep. Persistent aggregators carry their current cell across
//! supersteps; the rest reset to the reducer identity after each merge.

use crate::error::{config_error, serde_error, PregelError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::TypeId;
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// An associative, commutative reduction with an identity element.
pub trait Reducer: Send + Sync + 'static {
    type Value: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn identity(&self) -> Self::Value;
    fn combine(&self, a: Self::Value, b: Self::Value) -> Self::Value;
}

pub struct LongSumReducer;

impl Reducer for LongSumReducer {
    type Value = i64;

    fn identity(&self) -> i64 {
        0
    }

    fn combine(&self, a: i64, b: i64) -> i64 {
        a + b
    }
}

pub struct DoubleSumReducer;

impl Reducer for DoubleSumReducer {
    type Value = f64;

    fn identity(&self) -> f64 {
        0.0
    }

    fn combine(&self, a: f64, b: f64) -> f64 {
        a + b
    }
}

trait DynReducer: Send + Sync {
    fn identity_value(&self) -> Result<Value, PregelError>;
    fn combine_values(&self, a: Value, b: Value) -> Result<Value, PregelError>;
}

struct Erased<R: Reducer>(R);

impl<R: Reducer> DynReducer for Erased<R> {
    fn identity_value(&self) -> Result<Value, PregelError> {
        serde_json::to_value(self.0.identity())
            .map_err(|e| serde_error(format!("aggregator value: {}", e)))
    }

    fn combine_values(&self, a: Value, b: Value) -> Result<Value, PregelError> {
        let a: R::Value =
            serde_json::from_value(a).map_err(|e| serde_error(format!("aggregator value: {}", e)))?;
        let b: R::Value =
            serde_json::from_value(b).map_err(|e| serde_error(format!("aggregator value: {}", e)))?;
        serde_json::to_value(self.0.combine(a, b))
            .map_err(|e| serde_error(format!("aggregator value: {}", e)))
    }
}

/// Proof of registration for an aggregator of value type `T`.
pub struct AggregatorHandle<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AggregatorHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for AggregatorHandle<T> {
    fn clone(&self) -> Self {
        AggregatorHandle { name: self.name.clone(), _marker: PhantomData }
    }
}

struct Slot {
    reducer: Box<dyn DynReducer>,
    value_type: TypeId,
    persistent: bool,
    current: Value,
    previous: Value,
}

/// Read-only snapshot handed to user code: previous values plus the
/// registered value types, so typed access can be checked without touching
/// the registry.
#[derive(Clone)]
pub struct AggregateView {
    previous: BTreeMap<String, Value>,
    types: BTreeMap<String, TypeId>,
}

impl AggregateView {
    pub fn get<T: DeserializeOwned + 'static>(&self, name: &str) -> Result<T, PregelError> {
        check_type::<T>(&self.types, name)?;
        let raw = self
            .previous
            .get(name)
            .ok_or_else(|| config_error(format!("unknown aggregator '{}'", name)))?;
        serde_json::from_value(raw.clone())
            .map_err(|e| serde_error(format!("aggregator '{}': {}", name, e)))
    }

    pub(crate) fn check<T: 'static>(&self, name: &str) -> Result<(), PregelError> {
        check_type::<T>(&self.types, name)
    }
}

fn check_type<T: 'static>(types: &BTreeMap<String, TypeId>, name: &str) -> Result<(), PregelError> {
    match types.get(name) {
        None => Err(config_error(format!("unknown aggregator '{}'", name))),
        Some(t) if *t == TypeId::of::<T>() => Ok(()),
        Some(_) => Err(config_error(format!("aggregator '{}' registered with another value type", name))),
    }
}

/// Merged result shipped from the leader to every worker between supersteps,
/// also carrying the master program's halt signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergedAggregates {
    pub values: BTreeMap<String, Value>,
    pub halt: bool,
}

impl MergedAggregates {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PregelError> {
        serde_json::to_vec(self).map_err(|e| serde_error(format!("merged aggregates: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PregelError> {
        serde_json::from_slice(bytes).map_err(|e| serde_error(format!("merged aggregates: {}", e)))
    }
}

#[derive(Default)]
pub struct AggregatorRegistry {
    slots: BTreeMap<String, Slot>,
}

impl AggregatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; re-registering an existing name with a different value
    /// type is a configuration error.
    pub fn register<R: Reducer>(
        &mut self,
        name: &str,
        reducer: R,
        persistent: bool,
    ) -> Result<AggregatorHandle<R::Value>, PregelError> {
        if let Some(slot) = self.slots.get(name) {
            if slot.value_type != TypeId::of::<R::Value>() {
                return Err(config_error(format!(
                    "aggregator '{}' already registered with another value type",
                    name
                )));
            }
        } else {
            let reducer: Box<dyn DynReducer> = Box::new(Erased(reducer));
            let identity = reducer.identity_value()?;
            self.slots.insert(
                name.to_string(),
                Slot {
                    reducer,
                    value_type: TypeId::of::<R::Value>(),
                    persistent,
                    current: identity.clone(),
                    previous: identity,
                },
            );
        }
        Ok(AggregatorHandle { name: name.to_string(), _marker: PhantomData })
    }

    /// Typed handle for an already-registered aggregator.
    pub fn typed_handle<T: 'static>(&self, name: &str) -> Result<AggregatorHandle<T>, PregelError> {
        let types: BTreeMap<String, TypeId> =
            self.slots.iter().map(|(n, s)| (n.clone(), s.value_type)).collect();
        check_type::<T>(&types, name)?;
        Ok(AggregatorHandle { name: name.to_string(), _marker: PhantomData })
    }

    /// Fold an erased delta into the current cell.
    pub fn aggregate_raw(&mut self, name: &str, delta: Value) -> Result<(), PregelError> {
        let slot = self
            .slots
            .get_mut(name)
            .ok_or_else(|| config_error(format!("unknown aggregator '{}'", name)))?;
        let current = std::mem::replace(&mut slot.current, Value::Null);
        slot.current = slot.reducer.combine_values(current, delta)?;
        Ok(())
    }

    pub fn view(&self) -> AggregateView {
        AggregateView {
            previous: self.slots.iter().map(|(n, s)| (n.clone(), s.previous.clone())).collect(),
            types: self.slots.iter().map(|(n, s)| (n.clone(), s.value_type)).collect(),
        }
    }

    /// This worker's contribution for the ongoing superstep.
    pub fn current_snapshot(&self) -> BTreeMap<String, Value> {
        self.slots.iter().map(|(n, s)| (n.clone(), s.current.clone())).collect()
    }

    /// The committed values readable by user code.
    pub fn previous_snapshot(&self) -> BTreeMap<String, Value> {
        self.slots.iter().map(|(n, s)| (n.clone(), s.previous.clone())).collect()
    }

    /// Reduce one contribution map per worker into a single value per name.
    pub fn merge_contributions(
        &self,
        contributions: &[BTreeMap<String, Value>],
    ) -> Result<BTreeMap<String, Value>, PregelError> {
        let mut merged = BTreeMap::new();
        for (name, slot) in &self.slots {
            let mut acc = slot.reducer.identity_value()?;
            for contribution in contributions {
                if let Some(delta) = contribution.get(name) {
                    acc = slot.reducer.combine_values(acc, delta.clone())?;
                }
            }
            merged.insert(name.clone(), acc);
        }
        Ok(merged)
    }

    /// Commit a superstep boundary: the merged result becomes readable as
    /// previous, and non-persistent current cells reset to identity.
    pub fn finish_superstep(&mut self, merged: &BTreeMap<String, Value>) -> Result<(), PregelError> {
        for (name, slot) in &mut self.slots {
            if let Some(value) = merged.get(name) {
                slot.previous = value.clone();
            }
            if !slot.persistent {
                slot.current = slot.reducer.identity_value()?;
            }
        }
        Ok(())
    }

    pub fn set_aggregated_value<T: Serialize + 'static>(
        merged: &mut BTreeMap<String, Value>,
        types: &AggregateView,
        name: &str,
        value: T,
    ) -> Result<(), PregelError> {
        types.check::<T>(name)?;
        let value = serde_json::to_value(value)
            .map_err(|e| serde_error(format!("aggregator '{}': {}", name, e)))?;
        merged.insert(name.to_string(), value);
        Ok(())
    }
}
