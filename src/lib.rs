//! Multi-table partitioned cubes on a key-value blob store.
//!
//! A cube is a set of independently stored, partitioned polars datasets
//! sharing a common set of dimension columns. Datasets are persisted as
//! immutable partition blobs plus a JSON manifest per dataset; queries
//! select, load and join partitions from all datasets into one table.
//!
//! Writes run in two phases: a side-effect-free validation phase that must
//! fully succeed, then one atomic write per dataset. The cube-level commit
//! is not atomic across datasets and there is no locking; concurrent
//! writers to the same cube must be serialized by the caller.

pub mod codec;
pub mod conditions;
pub mod cube;
pub mod dataset;
pub mod error;
pub mod io;
pub mod observer;
pub mod query;
pub mod storage;
pub mod write;

pub use codec::{Codec, Compression, Format};
pub use conditions::{CmpOp, Condition, Conjunction, Scalar};
pub use cube::{Cube, UUID_SEPARATOR};
pub use dataset::{DatasetMetadata, DatasetStats, Partition};
pub use error::{CubeError, Result};
pub use io::{CopyOptions, CubeIo, WriteOptions};
pub use observer::{Observer, Silent, Stdout};
pub use query::QueryRequest;
pub use storage::{BlobStore, FileStore, MemoryStore, StoreSource};
pub use write::{CubeInput, DataPart, MetadataMap};
