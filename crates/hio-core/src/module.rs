use std::sync::Arc;

use crate::context::Context;
use crate::dataset::Dataset;
use crate::error::HioResult;
use crate::request::InternalRequest;

/// Storage backend contract. A module owns one data root; the engine picks
/// the first (factory, root) pair whose open succeeds and routes every
/// dataset operation through it from then on.
///
/// `process_reqs` receives batches already sorted by (element, offset); it
/// executes them, records segments for optimized-mode writes, and marks
/// each request's completion state.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn data_root(&self) -> &str;

    fn dataset_open(&self, ctx: &Context, dataset: &mut Dataset) -> HioResult<()>;

    fn dataset_close(&self, ctx: &Context, dataset: &mut Dataset) -> HioResult<()>;

    fn dataset_unlink(&self, ctx: &Context, name: &str, id: i64) -> HioResult<()>;

    fn element_open(
        &self,
        ctx: &Context,
        dataset: &mut Dataset,
        element_index: usize,
    ) -> HioResult<()>;

    fn element_close(
        &self,
        ctx: &Context,
        dataset: &mut Dataset,
        element_index: usize,
    ) -> HioResult<()>;

    fn process_reqs(
        &self,
        ctx: &Context,
        dataset: &mut Dataset,
        reqs: Vec<InternalRequest>,
    ) -> HioResult<()>;
}

/// Constructs modules for data roots it understands. Factories register on
/// the context at init; the engine consults them in registration order for
/// each configured data root.
pub trait ModuleFactory: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, ctx: &Context, data_root: &str) -> HioResult<Arc<dyn Module>>;
}
