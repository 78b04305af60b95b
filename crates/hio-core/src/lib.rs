pub mod collective;
pub mod comm;
pub mod config;
pub mod context;
pub mod dataset;
pub mod error;
pub mod local;
pub mod manifest;
pub mod module;
pub mod request;
pub mod segment;
pub mod shmem;
pub mod types;

// Re-export primary types for convenience
pub use comm::GroupComm;
pub use context::{Context, ContextBuilder};
pub use dataset::{Dataset, DatasetState, Element, ElementId};
pub use error::{HioError, HioResult};
pub use local::{local_endpoints, LocalComm, LocalEndpoint};
pub use manifest::{DatasetHeader, Manifest};
pub use module::{Module, ModuleFactory};
pub use request::{InternalRequest, Request, XferDir};
pub use segment::{Extent, Segment};
pub use shmem::SharedRegion;
pub use types::{
    DatasetFlags, DatasetMode, FileMode, FsType, DATASET_ID_HIGHEST, DATASET_ID_NEWEST,
};
