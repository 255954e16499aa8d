//! A distributed bulk-synchronous-parallel graph computation engine in the
//! Pregel family. Workers advance through numbered supersteps behind
//! barriers kept in an external hierarchical coordination tree; messages
//! travel through a partitioned log; named aggregators are merged globally
//! between supersteps by an elected leader running the master program.

pub mod aggregators;
pub mod barrier;
pub mod config;
pub mod coord;
pub mod error;
pub mod fs_store;
pub mod program;
pub mod router;
pub mod state;
pub mod transport;
pub mod vertices;
pub mod worker;

pub use aggregators::{
    AggregateView, AggregatorHandle, DoubleSumReducer, LongSumReducer, Reducer,
};
pub use config::PregelConfig;
pub use coord::{CoordinationClient, CoordinationStore, CreateMode};
pub use error::{ErrorKind, PregelError};
pub use fs_store::FsCoordinationStore;
pub use program::{Combiner, ComputeCallback, InitCallback, MasterCallback, VertexProgram, VertexView};
pub use state::{PregelState, Stage, Status};
pub use transport::{InMemoryLog, MessageTransport};
pub use vertices::Edge;
pub use worker::{run_local, GraphInput, JobResult, PregelWorker, WorkerReport};
