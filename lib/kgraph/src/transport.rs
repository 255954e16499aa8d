//! Message transport seam. The engine only assumes a reliable partitioned
//! log: publish is acknowledged once durable, each partition preserves
//! per-producer order, and consumers read by offset. [`InMemoryLog`] is the
//! in-process implementation used by local jobs and tests.

use std::fmt;
use std::sync::Mutex;

use crate::error::{transport_error, PregelError};

#[derive(Debug)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for PregelError {
    fn from(err: TransportError) -> Self {
        transport_error(err.0)
    }
}

pub trait MessageTransport: Send + Sync {
    fn num_partitions(&self) -> usize;

    /// Append a batch to a partition. Returning means the batch is durably
    /// accepted; the new end offset is reported.
    fn publish(&self, partition: usize, records: Vec<Vec<u8>>) -> Result<u64, TransportError>;

    /// All records in `[offset, end)` at call time.
    fn fetch(&self, partition: usize, offset: u64) -> Result<Vec<Vec<u8>>, TransportError>;
}

pub struct InMemoryLog {
    partitions: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl InMemoryLog {
    pub fn new(num_partitions: usize) -> Self {
        InMemoryLog { partitions: (0..num_partitions).map(|_| Mutex::new(Vec::new())).collect() }
    }

    fn partition(&self, partition: usize) -> Result<&Mutex<Vec<Vec<u8>>>, TransportError> {
        self.partitions
            .get(partition)
            .ok_or_else(|| TransportError(format!("no partition {}", partition)))
    }
}

impl MessageTransport for InMemoryLog {
    fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    fn publish(&self, partition: usize, records: Vec<Vec<u8>>) -> Result<u64, TransportError> {
        let mut log = self.partition(partition)?.lock().expect("partition mutex poisoned");
        log.extend(records);
        Ok(log.len() as u64)
    }

    fn fetch(&self, partition: usize, offset: u64) -> Result<Vec<Vec<u8>>, TransportError> {
        let log = self.partition(partition)?.lock().expect("partition mutex poisoned");
        let offset = offset as usize;
        if offset > log.len() {
            return Err(TransportError(format!(
                "offset {} beyond end {} of partition {}",
                offset,
                log.len(),
                partition
            )));
        }
        Ok(log[offset..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_fetch_by_offset() {
        let log = InMemoryLog::new(2);
        assert_eq!(log.publish(0, vec![b"a".to_vec(), b"b".to_vec()]).unwrap(), 2);
        assert_eq!(log.publish(0, vec![b"c".to_vec()]).unwrap(), 3);
        assert_eq!(log.fetch(0, 0).unwrap().len(), 3);
        assert_eq!(log.fetch(0, 2).unwrap(), vec![b"c".to_vec()]);
        assert!(log.fetch(0, 4).is_err());
        assert!(log.fetch(1, 0).unwrap().is_empty());
        assert!(log.publish(7, Vec::new()).is_err());
    }

    #[test]
    fn per_producer_order_is_preserved() {
        let log = InMemoryLog::new(1);
        for i in 0..10u8 {
            log.publish(0, vec![vec![i]]).unwrap();
        }
        let records = log.fetch(0, 0).unwrap();
        assert_eq!(records, (0..10u8).map(|i| vec![i]).collect::<Vec<_>>());
    }
}
