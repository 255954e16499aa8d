//! Routes messages between workers: outgoing messages are partitioned by
//! `hash(destination) mod P` and batched per partition before publishing;
//! inbound records are decoded, epoch-checked, and gathered into
//! per-destination bags, combined on arrival when a combiner is in play.

use crate::error::{invariant_violation, serde_error, PregelError};
use crate::program::Combiner;
use crate::transport::MessageTransport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Stable partition assignment: hash the serialized destination id. The
/// serialized form keeps the mapping independent of in-memory layout, so an
/// id owns the same partition on every worker.
pub fn partition_for<K: Serialize>(key: &K, num_partitions: usize) -> Result<usize, PregelError> {
    let mut hasher = DefaultHasher::new();
    let bytes =
        serde_json::to_vec(key).map_err(|e| serde_error(format!("vertex id: {}", e)))?;
    hasher.write(&bytes);
    Ok((hasher.finish() as usize) % num_partitions)
}

/// Partitions are spread round-robin over the group.
pub fn worker_for_partition(partition: usize, group_size: usize) -> usize {
    partition % group_size
}

pub fn owner_worker<K: Serialize>(
    key: &K,
    num_partitions: usize,
    group_size: usize,
) -> Result<usize, PregelError> {
    Ok(worker_for_partition(partition_for(key, num_partitions)?, group_size))
}

const BATCH_RECORDS: usize = 512;

/// Per-partition outbound buffers held by one compute thread. Batches ship
/// early when they reach the batch size; the remainder goes out on
/// `flush_all`, which must complete before the send barrier marker moves.
pub struct OutboundBuffers {
    buffers: Vec<Vec<Vec<u8>>>,
    sent: u64,
}

impl OutboundBuffers {
    pub fn new(num_partitions: usize) -> Self {
        OutboundBuffers { buffers: (0..num_partitions).map(|_| Vec::new()).collect(), sent: 0 }
    }

    /// Queue one message for delivery in superstep `step`.
    pub fn emit<K: Serialize, M: Serialize>(
        &mut self,
        transport: &dyn MessageTransport,
        step: i32,
        dst: &K,
        msg: &M,
    ) -> Result<(), PregelError> {
        let partition = partition_for(dst, self.buffers.len())?;
        let record = serde_json::to_vec(&(step, dst, msg))
            .map_err(|e| serde_error(format!("outbound message: {}", e)))?;
        self.buffers[partition].push(record);
        self.sent += 1;
        if self.buffers[partition].len() >= BATCH_RECORDS {
            self.flush_partition(transport, partition)?;
        }
        Ok(())
    }

    fn flush_partition(
        &mut self,
        transport: &dyn MessageTransport,
        partition: usize,
    ) -> Result<(), PregelError> {
        if self.buffers[partition].is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffers[partition]);
        transport.publish(partition, batch)?;
        Ok(())
    }

    pub fn flush_all(&mut self, transport: &dyn MessageTransport) -> Result<(), PregelError> {
        for partition in 0..self.buffers.len() {
            self.flush_partition(transport, partition)?;
        }
        Ok(())
    }

    pub fn messages_sent(&self) -> u64 {
        self.sent
    }
}

/// Decode one inbound record, enforcing the message-epoch invariant: a
/// record drained during the receive phase of step `N` must be addressed to
/// step `N+1`.
pub fn decode_record<K: DeserializeOwned, M: DeserializeOwned>(
    record: &[u8],
    expected_step: i32,
    partition: usize,
) -> Result<(K, M), PregelError> {
    let (step, dst, msg): (i32, K, M) = serde_json::from_slice(record)
        .map_err(|e| serde_error(format!("inbound message: {}", e)))?;
    if step != expected_step {
        return Err(invariant_violation(format!(
            "partition {}: drained a message for superstep {} while receiving for {}",
            partition, step, expected_step
        )));
    }
    Ok((dst, msg))
}

/// Per-destination bags for the next superstep. Without a combiner the bag
/// keeps arrival order per source; with one, it collapses to a single value
/// as messages arrive.
pub struct MessageBags<K, M> {
    bags: HashMap<K, Vec<M>>,
    received: u64,
}

impl<K: Eq + Hash, M> MessageBags<K, M> {
    pub fn new() -> Self {
        MessageBags { bags: HashMap::new(), received: 0 }
    }

    pub fn deliver(&mut self, dst: K, msg: M, combiner: Option<&dyn Combiner<K, M>>) {
        self.received += 1;
        if let Some(bag) = self.bags.get_mut(&dst) {
            match combiner {
                Some(combiner) => match bag.pop() {
                    Some(acc) => bag.push(combiner.combine(&dst, acc, msg)),
                    None => bag.push(msg),
                },
                None => bag.push(msg),
            }
        } else {
            self.bags.insert(dst, vec![msg]);
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn into_inner(self) -> HashMap<K, Vec<M>> {
        self.bags
    }
}

impl<K: Eq + Hash, M> Default for MessageBags<K, M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryLog;

    #[test]
    fn partition_assignment_is_stable() {
        for id in 0u64..200 {
            let first = partition_for(&id, 7).unwrap();
            assert!(first < 7);
            assert_eq!(first, partition_for(&id, 7).unwrap());
        }
        assert_eq!(worker_for_partition(5, 2), 1);
        assert_eq!(
            owner_worker(&3u64, 4, 2).unwrap(),
            worker_for_partition(partition_for(&3u64, 4).unwrap(), 2)
        );
    }

    #[test]
    fn emitted_messages_arrive_in_order_per_source() {
        let log = InMemoryLog::new(1);
        let mut out = OutboundBuffers::new(1);
        for i in 0..5u32 {
            out.emit(&log, 1, &7u64, &i).unwrap();
        }
        out.flush_all(&log).unwrap();
        assert_eq!(out.messages_sent(), 5);

        let records = log.fetch(0, 0).unwrap();
        let payloads: Vec<u32> = records
            .iter()
            .map(|r| decode_record::<u64, u32>(r, 1, 0).unwrap().1)
            .collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn wrong_epoch_is_fatal() {
        let log = InMemoryLog::new(1);
        let mut out = OutboundBuffers::new(1);
        out.emit(&log, 2, &1u64, &0u32).unwrap();
        out.flush_all(&log).unwrap();
        let records = log.fetch(0, 0).unwrap();
        let err = decode_record::<u64, u32>(&records[0], 1, 0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvariantViolation);
    }

    struct Sum;

    impl Combiner<u64, u32> for Sum {
        fn combine(&self, _dst: &u64, a: u32, b: u32) -> u32 {
            a + b
        }
    }

    #[test]
    fn bags_collapse_under_a_combiner() {
        let mut bags = MessageBags::new();
        for _ in 0..100 {
            bags.deliver(9u64, 1u32, Some(&Sum));
        }
        bags.deliver(4u64, 5u32, Some(&Sum));
        assert_eq!(bags.received(), 101);
        let inner = bags.into_inner();
        assert_eq!(inner[&9], vec![100]);
        assert_eq!(inner[&4], vec![5]);
    }

    #[test]
    fn bags_keep_multiplicity_without_a_combiner() {
        let mut bags: MessageBags<u64, u32> = MessageBags::new();
        bags.deliver(9, 1, None);
        bags.deliver(9, 2, None);
        bags.deliver(9, 3, None);
        assert_eq!(bags.into_inner()[&9], vec![1, 2, 3]);
    }
}
