//! POSIX storage backend: BASIC (one file per element per rank) and
//! OPTIMIZED (striped, node-aggregated) dataset layouts under a directory
//! tree of the form `<data_root>/<context>/<dataset>/<id>/`.

use std::ffi::CString;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, warn};

use hio_core::collective;
use hio_core::context::Context;
use hio_core::dataset::{Dataset, RANK_SHARED};
use hio_core::error::{HioError, HioResult};
use hio_core::manifest;
use hio_core::module::{Module, ModuleFactory};
use hio_core::request::{InternalRequest, XferDir};
use hio_core::segment::Segment;
use hio_core::shmem::{self, SharedRegion};
use hio_core::types::{
    dataset_id_is_sentinel, DatasetFlags, DatasetMode, FileMode, FsType, DATASET_ID_HIGHEST,
};

/// Open file descriptors kept per dataset before LRU eviction kicks in.
const MAX_OPEN_FILES: usize = 32;

/// Retries for transfers interrupted before completion.
const MAX_RETRY: usize = 10_000;

/// Writes at or below this size are aggregated into the node buffer when
/// the node has peer ranks.
const AGG_THRESHOLD: usize = 4096;

const LUSTRE_SUPER_MAGIC: u64 = 0x0BD0_0BD0;
const GPFS_SUPER_MAGIC: u64 = 0x4750_4653;

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn path_to_cstring(path: &Path) -> HioResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| HioError::BadParam)
}

/// Write the whole buffer at `offset`, retrying interrupted and partial
/// transfers.
fn pwrite_full(fd: RawFd, buf: &[u8], offset: u64) -> HioResult<()> {
    let mut done = 0usize;
    let mut off = offset as libc::off_t;
    let mut retries = 0;

    while done < buf.len() {
        let rc = unsafe {
            libc::pwrite(
                fd,
                buf[done..].as_ptr() as *const libc::c_void,
                buf.len() - done,
                off,
            )
        };
        if rc < 0 {
            let e = errno();
            if e == libc::EINTR && retries < MAX_RETRY {
                retries += 1;
                continue;
            }
            return Err(HioError::from_errno(e));
        }
        if rc == 0 {
            return Err(HioError::Truncate);
        }
        done += rc as usize;
        off += rc as libc::off_t;
    }
    Ok(())
}

/// Read up to `buf.len()` bytes at `offset`, stopping at end of file.
/// Returns the byte count actually read.
fn pread_full(fd: RawFd, buf: &mut [u8], offset: u64) -> HioResult<usize> {
    let mut done = 0usize;
    let mut off = offset as libc::off_t;
    let mut retries = 0;

    while done < buf.len() {
        let rc = unsafe {
            libc::pread(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
                off,
            )
        };
        if rc < 0 {
            let e = errno();
            if e == libc::EINTR && retries < MAX_RETRY {
                retries += 1;
                continue;
            }
            return Err(HioError::from_errno(e));
        }
        if rc == 0 {
            break;
        }
        done += rc as usize;
        off += rc as libc::off_t;
    }
    Ok(done)
}

/// Create every missing directory on `path` with the given access mode.
fn mkpath(path: &Path, mode: libc::mode_t) -> HioResult<()> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if current == Path::new("/") || current.as_os_str().is_empty() {
            continue;
        }
        let cpath = path_to_cstring(&current)?;
        let rc = unsafe { libc::mkdir(cpath.as_ptr(), mode) };
        if rc != 0 {
            let e = errno();
            if e != libc::EEXIST {
                return Err(HioError::from_errno(e));
            }
        }
    }
    Ok(())
}

fn detect_fs_type(data_root: &str, path: &Path) -> FsType {
    if data_root.starts_with("/var/opt/cray/dws") {
        return FsType::Datawarp;
    }
    let Ok(cpath) = path_to_cstring(path) else {
        return FsType::Default;
    };
    unsafe {
        let mut st: libc::statfs = std::mem::zeroed();
        if libc::statfs(cpath.as_ptr(), &mut st) != 0 {
            return FsType::Default;
        }
        match st.f_type as u64 {
            LUSTRE_SUPER_MAGIC => FsType::Lustre,
            GPFS_SUPER_MAGIC => FsType::Gpfs,
            _ => FsType::Default,
        }
    }
}

fn fs_type_code(fs_type: FsType) -> i64 {
    match fs_type {
        FsType::Default => 0,
        FsType::Lustre => 1,
        FsType::Gpfs => 2,
        FsType::Datawarp => 3,
    }
}

fn fs_type_from_code(code: i64) -> FsType {
    match code {
        1 => FsType::Lustre,
        2 => FsType::Gpfs,
        3 => FsType::Datawarp,
        _ => FsType::Default,
    }
}

fn data_file_name(master_rank: i32) -> String {
    format!("data.{master_rank}")
}

fn basic_file_name(identifier: &str, rank: i32) -> String {
    format!("element_data.{identifier}.{rank}")
}

/// The rank whose bytes these are: the element's owner in unique mode, the
/// calling rank in shared mode.
fn writing_rank(ctx: &Context, element_rank: i32) -> i32 {
    if element_rank == RANK_SHARED {
        ctx.rank()
    } else {
        element_rank
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileKey {
    /// Optimized-mode data file, by dataset file-list index
    Data(usize),
    /// Basic-mode element file, by element index
    Basic(usize),
}

struct FileSlot {
    key: FileKey,
    fd: RawFd,
    last_used: u64,
}

/// Per-dataset backend state, stashed on the dataset as `backend_state`.
struct PosixDatasetState {
    base_path: PathBuf,
    slots: Vec<FileSlot>,
    tick: u64,
    reserved_offset: u64,
    reserved_remaining: u64,
    master_rank: i32,
}

impl PosixDatasetState {
    fn new(base_path: PathBuf, master_rank: i32) -> Self {
        Self {
            base_path,
            slots: Vec::new(),
            tick: 0,
            reserved_offset: 0,
            reserved_remaining: 0,
            master_rank,
        }
    }

    /// Descriptor for `key`, opening `path` on a miss and evicting the
    /// least-recently-used slot when the table is full.
    fn fd_for(&mut self, key: FileKey, path: &Path, writable: bool) -> HioResult<RawFd> {
        self.tick += 1;
        if let Some(slot) = self.slots.iter_mut().find(|s| s.key == key) {
            slot.last_used = self.tick;
            return Ok(slot.fd);
        }

        if self.slots.len() >= MAX_OPEN_FILES {
            let lru = self
                .slots
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(i, _)| i)
                .unwrap();
            let slot = self.slots.swap_remove(lru);
            unsafe { libc::close(slot.fd) };
        }

        let cpath = path_to_cstring(path)?;
        let oflags: c_int = if writable {
            libc::O_RDWR | libc::O_CREAT
        } else {
            libc::O_RDONLY
        };
        let mode: libc::mode_t = 0o644;
        let fd = unsafe { libc::open(cpath.as_ptr(), oflags, mode) };
        if fd < 0 {
            return Err(HioError::from_errno(errno()));
        }

        self.slots.push(FileSlot {
            key,
            fd,
            last_used: self.tick,
        });
        Ok(fd)
    }

    fn close_all(&mut self) {
        for slot in self.slots.drain(..) {
            unsafe { libc::close(slot.fd) };
        }
    }
}

fn take_state(dataset: &mut Dataset) -> HioResult<Box<PosixDatasetState>> {
    dataset
        .backend_state
        .take()
        .ok_or(HioError::Generic)?
        .downcast::<PosixDatasetState>()
        .map_err(|_| HioError::Generic)
}

/// Factory for [`PosixModule`]. Claims every data root.
pub struct PosixFactory {
    /// Access mode for created directories
    pub access_mode: u32,
    /// Persist manifests bzip2-compressed
    pub compress_manifest: bool,
}

impl Default for PosixFactory {
    fn default() -> Self {
        Self {
            access_mode: 0o755,
            compress_manifest: false,
        }
    }
}

impl ModuleFactory for PosixFactory {
    fn name(&self) -> &str {
        "posix"
    }

    fn open(&self, _ctx: &Context, data_root: &str) -> HioResult<Arc<dyn Module>> {
        if data_root.is_empty() {
            return Err(HioError::BadParam);
        }
        Ok(Arc::new(PosixModule {
            data_root: data_root.to_string(),
            access_mode: self.access_mode as libc::mode_t,
            compress_manifest: self.compress_manifest,
        }))
    }
}

/// POSIX dataset module bound to one data root.
pub struct PosixModule {
    data_root: String,
    access_mode: libc::mode_t,
    compress_manifest: bool,
}

impl PosixModule {
    fn name_dir(&self, ctx: &Context, name: &str) -> PathBuf {
        Path::new(&self.data_root).join(ctx.name()).join(name)
    }

    fn base_path(&self, ctx: &Context, name: &str, id: i64) -> PathBuf {
        self.name_dir(ctx, name).join(id.to_string())
    }

    fn manifest_name(&self) -> &'static str {
        if self.compress_manifest {
            "manifest.json.bz2"
        } else {
            "manifest.json"
        }
    }

    /// Locate a committed manifest in a dataset id directory.
    fn find_manifest(base: &Path) -> Option<PathBuf> {
        for name in ["manifest.json", "manifest.json.bz2"] {
            let candidate = base.join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    /// Resolve a NEWEST/HIGHEST sentinel to a committed dataset id by
    /// header-only manifest reads.
    fn resolve_id(&self, name_dir: &Path, sentinel: i64) -> HioResult<i64> {
        let entries = std::fs::read_dir(name_dir).map_err(HioError::from)?;

        let mut best: Option<(u64, i64)> = None;
        for entry in entries.flatten() {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<i64>().ok())
            else {
                continue;
            };
            let Some(path) = Self::find_manifest(&entry.path()) else {
                continue;
            };
            let Ok(header) = manifest::read_header(&path) else {
                continue;
            };
            if header.status != 0 {
                continue;
            }

            let candidate = if sentinel == DATASET_ID_HIGHEST {
                (0, id)
            } else {
                (header.mtime, id)
            };
            if best.is_none_or(|b| candidate > b) {
                best = Some(candidate);
            }
        }

        best.map(|(_, id)| id).ok_or(HioError::NotFound)
    }

    /// Rank-0 half of dataset open: resolve the id, prepare or verify the
    /// directory, and load the committed manifest when one is required.
    fn prepare_root(
        &self,
        ctx: &Context,
        dataset: &Dataset,
    ) -> HioResult<(i64, FsType, Option<Vec<u8>>)> {
        let flags = dataset.flags();
        let name_dir = self.name_dir(ctx, dataset.name());

        let id = if dataset_id_is_sentinel(dataset.id()) {
            self.resolve_id(&name_dir, dataset.id())?
        } else {
            dataset.id()
        };
        let base = name_dir.join(id.to_string());

        if flags.contains(DatasetFlags::TRUNCATE) {
            match std::fs::remove_dir_all(&base) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(HioError::from(e)),
            }
        }

        let manifest_path = Self::find_manifest(&base);
        if flags.contains(DatasetFlags::CREATE) {
            mkpath(&base, self.access_mode)?;
        } else if manifest_path.is_none() {
            // existing data requires a committed manifest
            return Err(HioError::NotFound);
        }

        let bytes = match manifest_path {
            Some(path) => {
                let data = std::fs::read(&path).map_err(HioError::from)?;
                if data.is_empty() {
                    return Err(HioError::BadParam);
                }
                Some(data)
            }
            None => None,
        };

        let fs_type = detect_fs_type(&self.data_root, &base);
        Ok((id, fs_type, bytes))
    }

    /// Write `data` into the node's shared file through stripe
    /// reservations, recording one segment per carved slice.
    fn write_striped(
        &self,
        dataset: &mut Dataset,
        state: &mut PosixDatasetState,
        element_index: usize,
        data: &[u8],
        app_offset: u64,
    ) -> HioResult<()> {
        let region = dataset.shared.clone().ok_or(HioError::Generic)?;
        let file_name = data_file_name(state.master_rank);
        let file_index = dataset.add_file(&file_name);
        let path = state.base_path.join(&file_name);

        let mut done = 0usize;
        while done < data.len() {
            if state.reserved_remaining == 0 {
                let stripe = dataset.block_size().max(1);
                state.reserved_offset = region.reserve_file_space(stripe);
                state.reserved_remaining = stripe;
            }

            let take = ((data.len() - done) as u64).min(state.reserved_remaining) as usize;
            let fd = state.fd_for(FileKey::Data(file_index), &path, true)?;
            pwrite_full(fd, &data[done..done + take], state.reserved_offset)?;

            dataset.element_mut(element_index).add_segment(Segment {
                file_index,
                file_offset: state.reserved_offset,
                app_offset: app_offset + done as u64,
                length: take as u64,
            });

            state.reserved_offset += take as u64;
            state.reserved_remaining -= take as u64;
            done += take;
        }
        Ok(())
    }

    fn write_basic(
        &self,
        ctx: &Context,
        dataset: &mut Dataset,
        state: &mut PosixDatasetState,
        element_index: usize,
        chunk: &[u8],
        app_offset: u64,
    ) -> HioResult<()> {
        let file_name = {
            let element = &dataset.elements()[element_index];
            basic_file_name(element.identifier(), writing_rank(ctx, element.rank()))
        };
        let path = state.base_path.join(&file_name);
        let fd = state.fd_for(FileKey::Basic(element_index), &path, true)?;
        pwrite_full(fd, chunk, app_offset)?;
        dataset
            .element_mut(element_index)
            .extend_size(app_offset + chunk.len() as u64);
        Ok(())
    }

    fn write_optimized(
        &self,
        ctx: &Context,
        dataset: &mut Dataset,
        state: &mut PosixDatasetState,
        element_index: usize,
        chunk: &[u8],
        app_offset: u64,
    ) -> HioResult<()> {
        let region = dataset.shared.clone().ok_or(HioError::Generic)?;

        // small writes ride the node buffer; the master drains them at close
        if ctx.node_comm().size() > 1 && chunk.len() <= AGG_THRESHOLD {
            let record = {
                let element = &dataset.elements()[element_index];
                shmem::encode_record(
                    element.identifier(),
                    writing_rank(ctx, element.rank()),
                    app_offset,
                    chunk,
                )
            };
            if region.try_append(&record) {
                dataset
                    .element_mut(element_index)
                    .extend_size(app_offset + chunk.len() as u64);
                return Ok(());
            }
        }

        self.write_striped(dataset, state, element_index, chunk, app_offset)
    }

    fn execute_write(
        &self,
        ctx: &Context,
        dataset: &mut Dataset,
        state: &mut PosixDatasetState,
        req: &InternalRequest,
    ) -> HioResult<i64> {
        let mut transferred = 0i64;
        for i in 0..req.count {
            // Safety: the submit contract keeps the buffer valid until the
            // request completes.
            let chunk =
                unsafe { std::slice::from_raw_parts(req.chunk_ptr(i) as *const u8, req.size) };
            let app_offset = req.app_offset + (i * req.size) as u64;

            match dataset.file_mode() {
                FileMode::Basic => {
                    self.write_basic(ctx, dataset, state, req.element_index, chunk, app_offset)?
                }
                FileMode::Optimized => self.write_optimized(
                    ctx,
                    dataset,
                    state,
                    req.element_index,
                    chunk,
                    app_offset,
                )?,
            }
            transferred += req.size as i64;
        }
        dataset
            .stats
            .bytes_written
            .fetch_add(transferred as u64, Ordering::Relaxed);
        Ok(transferred)
    }

    fn read_basic(
        &self,
        ctx: &Context,
        dataset: &Dataset,
        state: &mut PosixDatasetState,
        element_index: usize,
        buf: &mut [u8],
        app_offset: u64,
    ) -> HioResult<()> {
        let element = &dataset.elements()[element_index];
        let file_name = basic_file_name(element.identifier(), writing_rank(ctx, element.rank()));
        let path = state.base_path.join(&file_name);
        let writable = dataset.flags().contains(DatasetFlags::WRITE);

        match state.fd_for(FileKey::Basic(element_index), &path, writable) {
            Ok(fd) => {
                // short reads leave the zero fill in place
                pread_full(fd, buf, app_offset)?;
                Ok(())
            }
            // a hole in the element: nothing was ever written here
            Err(HioError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn read_optimized(
        &self,
        dataset: &Dataset,
        state: &mut PosixDatasetState,
        element_index: usize,
        buf: &mut [u8],
        app_offset: u64,
    ) -> HioResult<()> {
        let extents = dataset.elements()[element_index].lookup(app_offset, buf.len() as u64);
        let writable = dataset.flags().contains(DatasetFlags::WRITE);

        for extent in extents {
            let Some(file_index) = extent.file_index else {
                continue;
            };
            let name = dataset
                .file_name(file_index)
                .ok_or(HioError::BadParam)?
                .to_string();
            let path = state.base_path.join(&name);
            let fd = state.fd_for(FileKey::Data(file_index), &path, writable)?;

            let start = (extent.app_offset - app_offset) as usize;
            pread_full(
                fd,
                &mut buf[start..start + extent.length as usize],
                extent.file_offset,
            )?;
        }
        Ok(())
    }

    fn execute_read(
        &self,
        ctx: &Context,
        dataset: &mut Dataset,
        state: &mut PosixDatasetState,
        req: &InternalRequest,
    ) -> HioResult<i64> {
        let mut transferred = 0i64;
        for i in 0..req.count {
            // Safety: the submit contract keeps the buffer valid until the
            // request completes.
            let chunk = unsafe { std::slice::from_raw_parts_mut(req.chunk_ptr(i), req.size) };
            let app_offset = req.app_offset + (i * req.size) as u64;

            chunk.fill(0);
            let size = dataset.elements()[req.element_index].size();
            let effective = size.saturating_sub(app_offset).min(req.size as u64) as usize;
            if effective == 0 {
                // entirely past the element: zero bytes transferred
                continue;
            }

            match dataset.file_mode() {
                FileMode::Basic => self.read_basic(
                    ctx,
                    dataset,
                    state,
                    req.element_index,
                    &mut chunk[..effective],
                    app_offset,
                )?,
                FileMode::Optimized => self.read_optimized(
                    dataset,
                    state,
                    req.element_index,
                    &mut chunk[..effective],
                    app_offset,
                )?,
            }
            transferred += effective as i64;
        }
        dataset
            .stats
            .bytes_read
            .fetch_add(transferred as u64, Ordering::Relaxed);
        Ok(transferred)
    }

    /// Master-side drain of the node aggregation buffer. Records sort by
    /// (element, rank, offset) so segment insertion order is deterministic
    /// and higher ranks win overlap ties.
    fn drain_node_buffer(
        &self,
        dataset: &mut Dataset,
        state: &mut PosixDatasetState,
        region: &SharedRegion,
    ) -> HioResult<()> {
        let _guard = region.lock();
        if !region.take_flush_pending() {
            return Ok(());
        }

        // Safety: every node peer passed the pre-drain barrier; no appender
        // is active.
        let mut records = shmem::decode_records(unsafe { region.records() });
        records.sort_by(|a, b| {
            (&a.element, a.rank, a.app_offset).cmp(&(&b.element, b.rank, b.app_offset))
        });
        debug!("draining {} aggregated records", records.len());

        for record in records {
            let rank = match dataset.mode() {
                DatasetMode::Unique => record.rank,
                DatasetMode::Shared => RANK_SHARED,
            };
            let element_index = dataset.element_alloc(&record.element, rank);
            self.write_striped(
                dataset,
                state,
                element_index,
                &record.payload,
                record.app_offset,
            )?;
        }
        region.reset_records();
        Ok(())
    }
}

impl Module for PosixModule {
    fn name(&self) -> &str {
        "posix"
    }

    fn data_root(&self) -> &str {
        &self.data_root
    }

    fn dataset_open(&self, ctx: &Context, dataset: &mut Dataset) -> HioResult<()> {
        let comm = ctx.comm();

        // rank 0 resolves the id and prepares the directory; everyone
        // receives {rc, id, fs_type, have_manifest}
        let mut header = [0i64; 4];
        let mut manifest_bytes: Option<Vec<u8>> = None;
        if comm.rank() == 0 {
            match self.prepare_root(ctx, dataset) {
                Ok((id, fs_type, bytes)) => {
                    header[1] = id;
                    header[2] = fs_type_code(fs_type);
                    header[3] = bytes.is_some() as i64;
                    manifest_bytes = bytes;
                }
                Err(e) => header[0] = e.code(),
            }
        }
        comm.bcast_longs(0, &mut header)?;
        HioError::from_code(header[0])?;

        dataset.set_id(header[1]);
        dataset.fs_attr.fs_type = fs_type_from_code(header[2]);

        if header[3] != 0 {
            match dataset.mode() {
                DatasetMode::Unique => collective::scatter_manifest_unique(
                    comm,
                    dataset,
                    manifest_bytes.as_deref(),
                    0,
                )?,
                DatasetMode::Shared => {
                    collective::scatter_manifest(comm, dataset, manifest_bytes.as_deref(), 0)?
                }
            }
        }

        let mut state = PosixDatasetState::new(
            self.base_path(ctx, dataset.name(), dataset.id()),
            ctx.rank(),
        );

        if dataset.file_mode() == FileMode::Optimized {
            let node = ctx.node_comm();
            let mut master = [ctx.rank() as i64];
            node.bcast_longs(0, &mut master)?;
            state.master_rank = master[0] as i32;

            let region = node.alloc_shared(shmem::DEFAULT_REGION_SIZE, state.master_rank)?;
            if node.rank() == 0 && dataset.flags().contains(DatasetFlags::WRITE) {
                // continue the shared data file where a previous open left it
                let data_path = state.base_path.join(data_file_name(state.master_rank));
                if let Ok(meta) = std::fs::metadata(&data_path) {
                    if meta.len() > 0 {
                        region.reserve_file_space(meta.len());
                    }
                }
            }
            node.barrier()?;
            dataset.shared = Some(region);
        }

        dataset.backend_state = Some(Box::new(state));
        Ok(())
    }

    fn dataset_close(&self, ctx: &Context, dataset: &mut Dataset) -> HioResult<()> {
        let mut state = take_state(dataset)?;
        let mut rc: HioResult<()> = Ok(());

        if let Some(region) = dataset.shared.clone() {
            let node = ctx.node_comm();
            // all appenders quiesce before the master drains
            node.barrier()?;
            if node.rank() == 0 {
                if let Err(e) = self.drain_node_buffer(dataset, &mut state, &region) {
                    ctx.err_push(e, "failed to drain node aggregation buffer".into());
                    rc = Err(e);
                }
            }
            node.barrier()?;
        }

        if dataset.flags().contains(DatasetFlags::WRITE) {
            let path = state.base_path.join(self.manifest_name());
            let rc_in = match &rc {
                Ok(()) => 0,
                Err(e) => e.code(),
            };
            let commit = collective::commit_manifest(
                ctx.comm(),
                dataset,
                &path,
                self.compress_manifest,
                rc_in,
            );
            if rc.is_ok() {
                rc = commit;
            }
        } else {
            let barrier = ctx.comm().barrier();
            if rc.is_ok() {
                rc = barrier;
            }
        }

        state.close_all();
        dataset.shared = None;
        rc
    }

    fn dataset_unlink(&self, ctx: &Context, name: &str, id: i64) -> HioResult<()> {
        let base = self.base_path(ctx, name, id);
        debug!("unlinking dataset {}::{id} at {}", name, base.display());
        std::fs::remove_dir_all(&base).map_err(HioError::from)
    }

    fn element_open(
        &self,
        _ctx: &Context,
        dataset: &mut Dataset,
        element_index: usize,
    ) -> HioResult<()> {
        debug!(
            "opened element {} in dataset {}::{}",
            dataset.elements()[element_index].identifier(),
            dataset.name(),
            dataset.id()
        );
        Ok(())
    }

    fn element_close(
        &self,
        _ctx: &Context,
        _dataset: &mut Dataset,
        _element_index: usize,
    ) -> HioResult<()> {
        Ok(())
    }

    fn process_reqs(
        &self,
        ctx: &Context,
        dataset: &mut Dataset,
        reqs: Vec<InternalRequest>,
    ) -> HioResult<()> {
        let mut state = take_state(dataset)?;
        let mut rc: HioResult<()> = Ok(());

        for req in &reqs {
            let result = match req.dir {
                XferDir::Write => self.execute_write(ctx, dataset, &mut state, req),
                XferDir::Read => self.execute_read(ctx, dataset, &mut state, req),
            };
            match result {
                Ok(n) => req.state.finish(n),
                Err(e) => {
                    warn!("request failed on {}: {e}", self.data_root);
                    req.state.fail(e.code());
                    rc = Err(e);
                }
            }
        }

        dataset.backend_state = Some(state);
        rc
    }
}
