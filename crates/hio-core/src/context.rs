use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::comm::GroupComm;
use crate::config::{self, ConfigSet};
use crate::dataset::{Dataset, DatasetState, ElementId, RANK_SHARED};
use crate::error::{ErrorStack, ErrorStackEntry, HioError, HioResult};
use crate::local::LocalComm;
use crate::module::ModuleFactory;
use crate::request::{InternalRequest, Request, RequestState, XferDir};
use crate::types::{dataset_id_is_sentinel, DatasetFlags, DatasetMode, FileMode};

/// Per-dataset-name data that outlives individual dataset instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatasetData {
    /// Last id successfully opened or committed under this name
    pub last_id: i64,
    /// Expected global size hint
    pub expected_size: u64,
}

/// Builds a [`Context`]. Configuration is resolved in priority order:
/// explicit `set` calls, then the environment, then config files.
pub struct ContextBuilder {
    name: String,
    world: Option<Arc<dyn GroupComm>>,
    node: Option<Arc<dyn GroupComm>>,
    config: ConfigSet,
    factories: Vec<Arc<dyn ModuleFactory>>,
}

impl ContextBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            world: None,
            node: None,
            config: ConfigSet::with_context_defaults(),
            factories: Vec::new(),
        }
    }

    /// The participating group. Defaults to a single-rank group.
    pub fn world_comm(mut self, comm: Arc<dyn GroupComm>) -> Self {
        self.world = Some(comm);
        self
    }

    /// The on-node sub-group. Defaults to the world group.
    pub fn node_comm(mut self, comm: Arc<dyn GroupComm>) -> Self {
        self.node = Some(comm);
        self
    }

    /// Register a backend factory. Factories are consulted in registration
    /// order for each data root.
    pub fn factory(mut self, factory: Arc<dyn ModuleFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Set a configuration variable.
    pub fn set(mut self, name: &str, value: &str) -> HioResult<Self> {
        self.config.set(name, value)?;
        Ok(self)
    }

    /// Parse `hio.`-prefixed settings from a file.
    pub fn config_file(mut self, path: &Path) -> HioResult<Self> {
        self.config.parse_file(path, None)?;
        Ok(self)
    }

    pub fn build(mut self) -> HioResult<Context> {
        if self.name.is_empty() {
            return Err(HioError::BadParam);
        }
        self.config.load_env()?;

        let world: Arc<dyn GroupComm> = match self.world {
            Some(comm) => comm,
            None => Arc::new(LocalComm::group(1).pop().unwrap()),
        };
        let node = self.node.unwrap_or_else(|| Arc::clone(&world));

        let data_roots =
            config::parse_data_roots(self.config.get_str("data_roots").unwrap_or(""));

        Ok(Context {
            name: self.name,
            world,
            node,
            config: self.config,
            factories: self.factories,
            data_roots,
            error_stack: ErrorStack::new(),
            ds_data: Mutex::new(HashMap::new()),
        })
    }
}

/// Root library handle: owns the participating group, the configuration,
/// the backend registry, and the per-context error stack. One context per
/// rank; contexts are independent and thread-safe with respect to each
/// other.
pub struct Context {
    name: String,
    world: Arc<dyn GroupComm>,
    node: Arc<dyn GroupComm>,
    config: ConfigSet,
    factories: Vec<Arc<dyn ModuleFactory>>,
    data_roots: Vec<String>,
    error_stack: ErrorStack,
    ds_data: Mutex<HashMap<String, DatasetData>>,
}

impl Context {
    pub fn builder(name: &str) -> ContextBuilder {
        ContextBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn comm(&self) -> &dyn GroupComm {
        self.world.as_ref()
    }

    pub fn node_comm(&self) -> &dyn GroupComm {
        self.node.as_ref()
    }

    pub fn rank(&self) -> i32 {
        self.world.rank()
    }

    pub fn size(&self) -> i32 {
        self.world.size()
    }

    pub fn node_rank(&self) -> i32 {
        self.node.rank()
    }

    pub fn config(&self) -> &ConfigSet {
        &self.config
    }

    pub fn data_roots(&self) -> &[String] {
        &self.data_roots
    }

    /// Push an error onto this context's stack.
    pub fn err_push(&self, error: HioError, message: String) {
        self.error_stack.push(error, message);
    }

    /// Pop the most recent error from this context's stack.
    pub fn err_pop(&self) -> Option<ErrorStackEntry> {
        self.error_stack.pop()
    }

    pub fn error_stack(&self) -> &ErrorStack {
        &self.error_stack
    }

    /// Persistent data recorded for a dataset name.
    pub fn dataset_data(&self, name: &str) -> Option<DatasetData> {
        self.ds_data.lock().unwrap().get(name).copied()
    }

    fn note_dataset_id(&self, name: &str, id: i64) {
        let mut ds_data = self.ds_data.lock().unwrap();
        let entry = ds_data.entry(name.to_string()).or_default();
        entry.last_id = entry.last_id.max(id);
    }

    /// Allocate an in-memory dataset. Layout settings default from the
    /// context configuration and may be adjusted before open.
    pub fn dataset_alloc(
        &self,
        name: &str,
        id: i64,
        flags: DatasetFlags,
        mode: DatasetMode,
    ) -> HioResult<Dataset> {
        if name.is_empty() || name.contains('/') {
            return Err(HioError::BadParam);
        }
        if !flags.intersects(DatasetFlags::READ | DatasetFlags::WRITE) {
            return Err(HioError::BadParam);
        }
        if flags.intersects(DatasetFlags::CREATE | DatasetFlags::TRUNCATE)
            && !flags.contains(DatasetFlags::WRITE)
        {
            return Err(HioError::BadParam);
        }
        if dataset_id_is_sentinel(id) {
            // automatic id selection only makes sense for existing data
            if !flags.contains(DatasetFlags::READ) || flags.contains(DatasetFlags::CREATE) {
                return Err(HioError::BadParam);
            }
        } else if id < 0 {
            return Err(HioError::BadParam);
        }

        let file_mode =
            FileMode::parse(self.config.get_str("dataset_file_mode").unwrap_or("basic"))?;
        let block_size = self
            .config
            .get_u64("dataset_block_size")
            .unwrap_or(config::DEFAULT_BLOCK_SIZE);
        let buffer_size = self
            .config
            .get_u64("dataset_buffer_size")
            .unwrap_or(config::DEFAULT_BUFFER_SIZE);
        let expected_size = self.config.get_u64("dataset_expected_size").unwrap_or(0);

        self.ds_data
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(DatasetData {
                last_id: -1,
                expected_size,
            });

        Ok(Dataset::new(
            name,
            id,
            flags,
            mode,
            file_mode,
            block_size,
            buffer_size,
            expected_size,
        ))
    }

    /// Open a dataset. Collective over the participating group. Data roots
    /// are tried in configured order; failure of one root records an error
    /// and falls through transparently to the next.
    pub fn dataset_open(&self, dataset: &mut Dataset) -> HioResult<()> {
        if dataset.state() != DatasetState::Allocated {
            return Err(HioError::BadParam);
        }
        if self.data_roots.is_empty() || self.factories.is_empty() {
            return Err(HioError::NotAvailable);
        }

        let mut last_err = HioError::NotFound;
        for root in &self.data_roots {
            for factory in &self.factories {
                let module = match factory.open(self, root) {
                    Ok(m) => m,
                    Err(e) => {
                        last_err = e;
                        continue;
                    }
                };
                match module.dataset_open(self, dataset) {
                    Ok(()) => {
                        debug!(
                            "opened dataset {}::{} on data root {root}",
                            dataset.name(),
                            dataset.id()
                        );
                        dataset.module = Some(module);
                        dataset.set_state(DatasetState::Open);
                        self.note_dataset_id(dataset.name(), dataset.id());
                        return Ok(());
                    }
                    Err(e) => {
                        self.err_push(
                            e,
                            format!(
                                "failed to open dataset {}::{} on data root {root}",
                                dataset.name(),
                                dataset.id()
                            ),
                        );
                        last_err = e;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Close a dataset. Collective; every participating rank must call it.
    /// Pending requests are flushed, the local manifest is merged and
    /// committed through the backend, and every rank leaves with the same
    /// result code.
    pub fn dataset_close(&self, dataset: &mut Dataset) -> HioResult<()> {
        if dataset.state() != DatasetState::Open {
            return Err(HioError::BadParam);
        }
        let module = dataset.module.clone().ok_or(HioError::Generic)?;
        dataset.set_state(DatasetState::Closing);

        let mut rc = Ok(());

        // force-close any elements the caller left open
        for index in 0..dataset.elements().len() {
            if dataset.elements()[index].is_open() {
                warn!(
                    "element {} still open at dataset close",
                    dataset.elements()[index].identifier()
                );
                while dataset.element_open_count(index, -1) > 0 {}
                if let Err(e) = module.element_close(self, dataset, index) {
                    rc = Err(e);
                }
            }
        }

        if let Err(e) = self.flush(dataset) {
            rc = Err(e);
        }
        if let Err(e) = module.dataset_close(self, dataset) {
            rc = Err(e);
        }

        match rc {
            Ok(()) => {
                dataset.set_state(DatasetState::Closed);
                self.note_dataset_id(dataset.name(), dataset.id());
                Ok(())
            }
            Err(e) => {
                dataset.set_status(e.code());
                dataset.set_state(DatasetState::Errored);
                Err(e)
            }
        }
    }

    /// Release a dataset object. Open datasets must be closed first.
    pub fn dataset_free(&self, dataset: Dataset) -> HioResult<()> {
        match dataset.state() {
            DatasetState::Open | DatasetState::Closing => {
                self.err_push(
                    HioError::BadParam,
                    format!("dataset {} freed while open", dataset.name()),
                );
                Err(HioError::BadParam)
            }
            _ => Ok(()),
        }
    }

    /// Remove all persisted data for (name, id) from every data root that
    /// holds it.
    pub fn dataset_unlink(&self, name: &str, id: i64) -> HioResult<()> {
        if dataset_id_is_sentinel(id) || id < 0 {
            return Err(HioError::BadParam);
        }
        let mut result = Err(HioError::NotFound);
        for root in &self.data_roots {
            for factory in &self.factories {
                let Ok(module) = factory.open(self, root) else {
                    continue;
                };
                match module.dataset_unlink(self, name, id) {
                    Ok(()) => result = Ok(()),
                    Err(HioError::NotFound) => {}
                    Err(e) if result.is_err() => result = Err(e),
                    Err(_) => {}
                }
            }
        }
        result
    }

    /// Open an element by name. Local operation; in unique mode the name is
    /// silently scoped to this rank.
    pub fn element_open(&self, dataset: &mut Dataset, name: &str) -> HioResult<ElementId> {
        if dataset.state() != DatasetState::Open {
            return Err(HioError::BadParam);
        }
        if name.is_empty() {
            return Err(HioError::BadParam);
        }

        let rank = match dataset.mode() {
            DatasetMode::Unique => self.rank(),
            DatasetMode::Shared => RANK_SHARED,
        };

        if !dataset.flags().contains(DatasetFlags::WRITE)
            && dataset.find_element(name, rank).is_none()
        {
            return Err(HioError::NotFound);
        }

        let module = dataset.module.clone().ok_or(HioError::Generic)?;
        let index = dataset.element_alloc(name, rank);
        dataset.element_open_count(index, 1);
        module.element_open(self, dataset, index)?;
        Ok(ElementId(index))
    }

    /// Close an element. The dataset buffer is flushed when the last open
    /// handle goes away.
    pub fn element_close(&self, dataset: &mut Dataset, element: ElementId) -> HioResult<()> {
        if dataset.state() != DatasetState::Open {
            return Err(HioError::BadParam);
        }
        let module = dataset.module.clone().ok_or(HioError::Generic)?;
        if dataset.element_open_count(element.0, -1) == 0 {
            self.flush(dataset)?;
        }
        module.element_close(self, dataset, element.0)
    }

    /// Flush the dataset's request buffer: sort the pending batch and hand
    /// it to the backend.
    pub fn flush(&self, dataset: &mut Dataset) -> HioResult<()> {
        if dataset.buffer.is_empty() {
            return Ok(());
        }
        let module = dataset.module.clone().ok_or(HioError::Generic)?;
        let batch = dataset.buffer.take_sorted();
        debug!("flushing {} requests", batch.len());
        module.process_reqs(self, dataset, batch)
    }

    /// Queue a strided non-blocking write of `count` chunks of `size` bytes
    /// with `stride` bytes between chunks in memory. The element region is
    /// contiguous starting at `app_offset`.
    ///
    /// # Safety
    /// `ptr` must stay valid and unmodified until the returned request
    /// completes (it completes no later than the next flush or wait).
    pub unsafe fn element_write_strided_nb(
        &self,
        dataset: &mut Dataset,
        element: ElementId,
        app_offset: u64,
        ptr: *const u8,
        count: usize,
        size: usize,
        stride: usize,
    ) -> HioResult<Request> {
        self.submit(
            dataset,
            element,
            XferDir::Write,
            app_offset,
            ptr as *mut u8,
            count,
            size,
            stride,
        )
    }

    /// Queue a strided non-blocking read.
    ///
    /// # Safety
    /// `ptr` must stay valid until the returned request completes, and must
    /// have room for the full chunk shape.
    pub unsafe fn element_read_strided_nb(
        &self,
        dataset: &mut Dataset,
        element: ElementId,
        app_offset: u64,
        ptr: *mut u8,
        count: usize,
        size: usize,
        stride: usize,
    ) -> HioResult<Request> {
        self.submit(
            dataset,
            element,
            XferDir::Read,
            app_offset,
            ptr,
            count,
            size,
            stride,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn submit(
        &self,
        dataset: &mut Dataset,
        element: ElementId,
        dir: XferDir,
        app_offset: u64,
        buf: *mut u8,
        count: usize,
        size: usize,
        stride: usize,
    ) -> HioResult<Request> {
        if dataset.state() != DatasetState::Open {
            return Err(HioError::BadParam);
        }
        let needed = match dir {
            XferDir::Write => DatasetFlags::WRITE,
            XferDir::Read => DatasetFlags::READ,
        };
        if !dataset.flags().contains(needed) {
            return Err(HioError::Perm);
        }
        if count == 0 || size == 0 {
            return Err(HioError::BadParam);
        }

        match dir {
            XferDir::Write => {
                dataset
                    .stats
                    .write_requests
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            XferDir::Read => {
                dataset
                    .stats
                    .read_requests
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }

        let len = (count * size) as u64;
        if dataset.buffer.needs_flush(len) {
            self.flush(dataset)?;
        }

        let state = Arc::new(RequestState::default());
        dataset.buffer.push(InternalRequest {
            element_index: element.0,
            dir,
            app_offset,
            buf,
            count,
            size,
            stride,
            state: Arc::clone(&state),
        });
        Ok(Request::new(state))
    }

    /// Wait for a request, forcing a flush if it has not completed yet.
    pub fn wait(&self, dataset: &mut Dataset, request: &Request) -> HioResult<i64> {
        if request.test().is_none() {
            self.flush(dataset)?;
        }
        match request.test() {
            Some(Ok(n)) => Ok(n),
            Some(Err(code)) => {
                Err(HioError::from_code(code).err().unwrap_or(HioError::Generic))
            }
            None => Err(HioError::Generic),
        }
    }

    /// Blocking contiguous write: queue and wait.
    pub fn element_write(
        &self,
        dataset: &mut Dataset,
        element: ElementId,
        app_offset: u64,
        data: &[u8],
    ) -> HioResult<i64> {
        // the buffer cannot outlive this call: wait flushes before returning
        let request = unsafe {
            self.element_write_strided_nb(
                dataset,
                element,
                app_offset,
                data.as_ptr(),
                1,
                data.len(),
                0,
            )?
        };
        self.wait(dataset, &request)
    }

    /// Blocking contiguous read: queue and wait.
    pub fn element_read(
        &self,
        dataset: &mut Dataset,
        element: ElementId,
        app_offset: u64,
        buf: &mut [u8],
    ) -> HioResult<i64> {
        let request = unsafe {
            self.element_read_strided_nb(
                dataset,
                element,
                app_offset,
                buf.as_mut_ptr(),
                1,
                buf.len(),
                0,
            )?
        };
        self.wait(dataset, &request)
    }
}
