use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{HioError, HioResult};
use crate::manifest::{
    Manifest, ManifestElement, ManifestSegment, MANIFEST_COMPAT, MANIFEST_VERSION,
};
use crate::module::Module;
use crate::request::RequestBuffer;
use crate::segment::{self, Extent, Segment};
use crate::shmem::SharedRegion;
use crate::types::{DatasetFlags, DatasetMode, FileMode, FsType};

/// Rank value recorded for elements of shared-mode datasets.
pub const RANK_SHARED: i32 = -1;

/// Lifecycle state of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetState {
    Allocated,
    Open,
    Closing,
    Closed,
    Errored,
}

/// Per-instance transfer statistics.
#[derive(Debug, Default)]
pub struct DatasetStats {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub read_requests: AtomicU64,
    pub write_requests: AtomicU64,
}

/// Filesystem attributes of the data root backing an open dataset.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsAttr {
    pub fs_type: FsType,
    pub stripe_count: i64,
    pub stripe_size: i64,
}

/// Opaque handle to an element within one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementId(pub(crate) usize);

/// A logically contiguous byte stream inside a dataset.
#[derive(Debug)]
pub struct Element {
    identifier: String,
    rank: i32,
    size: u64,
    segments: Vec<Segment>,
    open_count: u32,
}

impl Element {
    fn new(identifier: &str, rank: i32) -> Self {
        Self {
            identifier: identifier.to_string(),
            rank,
            size: 0,
            segments: Vec::new(),
            open_count: 0,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Logical size: monotone maximum over everything written.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_open(&self) -> bool {
        self.open_count > 0
    }

    pub fn add_segment(&mut self, seg: Segment) {
        self.size = self.size.max(seg.end());
        segment::add_segment(&mut self.segments, seg);
    }

    /// Grow the logical size to at least `size`.
    pub fn extend_size(&mut self, size: u64) {
        self.size = self.size.max(size);
    }

    pub fn lookup(&self, app_offset: u64, length: u64) -> Vec<Extent> {
        segment::lookup(&self.segments, app_offset, length)
    }
}

/// A named, id-stamped container of elements; the unit of open/close and of
/// manifest commit.
pub struct Dataset {
    name: String,
    id: i64,
    id_requested: i64,
    flags: DatasetFlags,
    mode: DatasetMode,
    file_mode: FileMode,
    block_size: u64,
    buffer_size: u64,
    expected_size: u64,
    status: i64,
    mtime: u64,
    state: DatasetState,
    elements: Vec<Element>,
    files: Vec<String>,
    pub stats: DatasetStats,
    pub fs_attr: FsAttr,
    pub(crate) buffer: RequestBuffer,
    pub(crate) module: Option<Arc<dyn Module>>,
    /// Backend-private per-dataset state, downcast by the owning module
    pub backend_state: Option<Box<dyn Any + Send>>,
    /// Node-shared aggregation region, present while open in optimized mode
    pub shared: Option<Arc<SharedRegion>>,
}

impl Dataset {
    pub(crate) fn new(
        name: &str,
        id: i64,
        flags: DatasetFlags,
        mode: DatasetMode,
        file_mode: FileMode,
        block_size: u64,
        buffer_size: u64,
        expected_size: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            id,
            id_requested: id,
            flags,
            mode,
            file_mode,
            block_size,
            buffer_size,
            expected_size,
            status: 0,
            mtime: 0,
            state: DatasetState::Allocated,
            elements: Vec::new(),
            files: Vec::new(),
            stats: DatasetStats::default(),
            fs_attr: FsAttr::default(),
            buffer: RequestBuffer::new(buffer_size),
            module: None,
            backend_state: None,
            shared: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn id_requested(&self) -> i64 {
        self.id_requested
    }

    /// Record the concrete id resolved by the backend at open time.
    pub fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    pub fn flags(&self) -> DatasetFlags {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: DatasetFlags) {
        self.flags = flags;
    }

    pub fn mode(&self) -> DatasetMode {
        self.mode
    }

    pub fn file_mode(&self) -> FileMode {
        self.file_mode
    }

    /// Change the file mode before the dataset is opened.
    pub fn set_file_mode(&mut self, file_mode: FileMode) -> HioResult<()> {
        if self.state != DatasetState::Allocated {
            return Err(HioError::Perm);
        }
        self.file_mode = file_mode;
        Ok(())
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn set_block_size(&mut self, block_size: u64) -> HioResult<()> {
        if self.state != DatasetState::Allocated || block_size == 0 {
            return Err(HioError::BadParam);
        }
        self.block_size = block_size;
        Ok(())
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn status(&self) -> i64 {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: i64) {
        self.status = status;
    }

    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    pub(crate) fn set_mtime(&mut self, mtime: u64) {
        self.mtime = mtime;
    }

    pub fn state(&self) -> DatasetState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DatasetState) {
        self.state = state;
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn element(&self, id: ElementId) -> &Element {
        &self.elements[id.0]
    }

    pub fn element_mut(&mut self, index: usize) -> &mut Element {
        &mut self.elements[index]
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn file_name(&self, index: usize) -> Option<&str> {
        self.files.get(index).map(String::as_str)
    }

    /// Find or record a file name, returning its index. Names dedup by
    /// string equality.
    pub fn add_file(&mut self, name: &str) -> usize {
        match self.files.iter().position(|f| f == name) {
            Some(idx) => idx,
            None => {
                self.files.push(name.to_string());
                self.files.len() - 1
            }
        }
    }

    pub fn find_element(&self, identifier: &str, rank: i32) -> Option<usize> {
        self.elements
            .iter()
            .position(|e| e.identifier == identifier && e.rank == rank)
    }

    /// Find or create the element (identifier, rank), returning its index.
    pub fn element_alloc(&mut self, identifier: &str, rank: i32) -> usize {
        match self.find_element(identifier, rank) {
            Some(idx) => idx,
            None => {
                self.elements.push(Element::new(identifier, rank));
                self.elements.len() - 1
            }
        }
    }

    pub(crate) fn element_open_count(&mut self, index: usize, delta: i32) -> u32 {
        let element = &mut self.elements[index];
        element.open_count = element.open_count.saturating_add_signed(delta);
        element.open_count
    }

    /// Build this rank's manifest view of the dataset.
    pub fn to_manifest(&self, comm_size: u64) -> Manifest {
        let elements: Vec<ManifestElement> = self
            .elements
            .iter()
            .map(|e| ManifestElement {
                identifier: e.identifier.clone(),
                size: e.size,
                rank: match self.mode {
                    DatasetMode::Unique => Some(e.rank as i64),
                    DatasetMode::Shared => None,
                },
                segments: if e.segments.is_empty() {
                    None
                } else {
                    Some(
                        e.segments
                            .iter()
                            .map(|s| ManifestSegment {
                                file_offset: s.file_offset,
                                app_offset: s.app_offset,
                                length: s.length,
                                file_index: s.file_index as u64,
                            })
                            .collect(),
                    )
                },
            })
            .collect();

        Manifest {
            version: MANIFEST_VERSION.into(),
            compat: MANIFEST_COMPAT.into(),
            hio_version: env!("CARGO_PKG_VERSION").into(),
            identifier: self.name.clone(),
            dataset_id: self.id,
            mode: self.mode,
            file_mode: self.file_mode,
            status: self.status,
            mtime: self.mtime,
            comm_size,
            block_size: match self.file_mode {
                FileMode::Optimized => Some(self.block_size),
                FileMode::Basic => None,
            },
            files: if self.files.is_empty() {
                None
            } else {
                Some(self.files.clone())
            },
            elements: if elements.is_empty() {
                None
            } else {
                Some(elements)
            },
        }
    }

    /// Replace this rank's view with the contents of a (typically merged)
    /// manifest. In unique mode only elements owned by `my_rank` are
    /// materialized; a unique-mode element with no rank field is rejected
    /// without side effects.
    pub fn apply_manifest(
        &mut self,
        manifest: &Manifest,
        my_rank: i32,
        comm_size: u64,
    ) -> HioResult<()> {
        if manifest.mode != self.mode {
            return Err(HioError::BadParam);
        }
        if self.mode == DatasetMode::Unique && manifest.comm_size != comm_size {
            return Err(HioError::BadParam);
        }
        if let Some(elements) = &manifest.elements {
            if self.mode == DatasetMode::Unique
                && elements.iter().any(|e| e.rank.is_none())
            {
                return Err(HioError::BadParam);
            }
        }

        self.file_mode = manifest.file_mode;
        if let Some(block_size) = manifest.block_size {
            self.block_size = block_size;
        }
        self.status = manifest.status;
        self.mtime = manifest.mtime;

        self.files.clear();
        self.elements.clear();
        for name in manifest.files.iter().flatten() {
            self.files.push(name.clone());
        }

        for elem in manifest.elements.iter().flatten() {
            let rank = match self.mode {
                DatasetMode::Unique => {
                    let rank = elem.rank.unwrap() as i32;
                    if rank != my_rank {
                        continue;
                    }
                    rank
                }
                DatasetMode::Shared => RANK_SHARED,
            };

            let index = self.element_alloc(&elem.identifier, rank);
            self.elements[index].extend_size(elem.size);
            for seg in elem.segments.iter().flatten() {
                if seg.file_index as usize >= self.files.len() {
                    return Err(HioError::BadParam);
                }
                self.elements[index].add_segment(Segment {
                    file_index: seg.file_index as usize,
                    file_offset: seg.file_offset,
                    app_offset: seg.app_offset,
                    length: seg.length,
                });
            }
        }

        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.stats.bytes_written.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.stats.bytes_read.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(mode: DatasetMode, file_mode: FileMode) -> Dataset {
        Dataset::new(
            "ckpt",
            1,
            DatasetFlags::WRITE | DatasetFlags::CREATE,
            mode,
            file_mode,
            1024,
            1 << 20,
            0,
        )
    }

    #[test]
    fn test_element_alloc_and_find() {
        let mut ds = dataset(DatasetMode::Unique, FileMode::Basic);
        let a = ds.element_alloc("e", 0);
        let b = ds.element_alloc("e", 1);
        assert_ne!(a, b);
        assert_eq!(ds.element_alloc("e", 0), a);
        assert_eq!(ds.find_element("e", 1), Some(b));
        assert_eq!(ds.find_element("missing", 0), None);
    }

    #[test]
    fn test_add_file_dedups() {
        let mut ds = dataset(DatasetMode::Shared, FileMode::Optimized);
        assert_eq!(ds.add_file("data.0"), 0);
        assert_eq!(ds.add_file("data.1"), 1);
        assert_eq!(ds.add_file("data.0"), 0);
        assert_eq!(ds.files().len(), 2);
    }

    #[test]
    fn test_element_size_tracks_segments() {
        let mut ds = dataset(DatasetMode::Shared, FileMode::Optimized);
        let idx = ds.element_alloc("v", RANK_SHARED);
        ds.element_mut(idx).add_segment(Segment {
            file_index: 0,
            file_offset: 0,
            app_offset: 1000,
            length: 500,
        });
        assert_eq!(ds.elements()[idx].size(), 1500);
        ds.element_mut(idx).extend_size(100);
        assert_eq!(ds.elements()[idx].size(), 1500);
    }

    #[test]
    fn test_manifest_round_trip_through_dataset() {
        let mut ds = dataset(DatasetMode::Shared, FileMode::Optimized);
        let file = ds.add_file("data.0");
        let idx = ds.element_alloc("v", RANK_SHARED);
        ds.element_mut(idx).add_segment(Segment {
            file_index: file,
            file_offset: 0,
            app_offset: 0,
            length: 1024,
        });
        ds.set_mtime(123);

        let manifest = ds.to_manifest(2);
        assert_eq!(manifest.block_size, Some(1024));

        let mut restored = dataset(DatasetMode::Shared, FileMode::Optimized);
        restored.apply_manifest(&manifest, 0, 2).unwrap();
        assert_eq!(restored.files(), &["data.0"]);
        assert_eq!(restored.elements().len(), 1);
        assert_eq!(restored.elements()[0].size(), 1024);
        assert_eq!(restored.elements()[0].segments().len(), 1);
        assert_eq!(restored.mtime(), 123);
    }

    #[test]
    fn test_apply_unique_filters_by_rank() {
        let mut ds = dataset(DatasetMode::Unique, FileMode::Basic);
        let idx = ds.element_alloc("e", 2);
        ds.element_mut(idx).extend_size(8);
        let mut manifest = ds.to_manifest(4);
        manifest.elements.as_mut().unwrap().push(ManifestElement {
            identifier: "e".into(),
            size: 8,
            rank: Some(3),
            segments: None,
        });

        let mut mine = dataset(DatasetMode::Unique, FileMode::Basic);
        mine.apply_manifest(&manifest, 2, 4).unwrap();
        assert_eq!(mine.elements().len(), 1);
        assert_eq!(mine.elements()[0].rank(), 2);

        let mut other = dataset(DatasetMode::Unique, FileMode::Basic);
        other.apply_manifest(&manifest, 0, 4).unwrap();
        assert!(other.elements().is_empty());
    }

    #[test]
    fn test_apply_unique_missing_rank_rejected() {
        let mut src = dataset(DatasetMode::Unique, FileMode::Basic);
        src.element_alloc("e", 0);
        let mut manifest = src.to_manifest(2);
        manifest.elements.as_mut().unwrap()[0].rank = None;

        let mut ds = dataset(DatasetMode::Unique, FileMode::Basic);
        assert_eq!(ds.apply_manifest(&manifest, 0, 2), Err(HioError::BadParam));
        // rejected without side effects
        assert!(ds.elements().is_empty());
    }

    #[test]
    fn test_apply_comm_size_guard() {
        let mut src = dataset(DatasetMode::Unique, FileMode::Basic);
        src.element_alloc("e", 0);
        let manifest = src.to_manifest(4);

        let mut ds = dataset(DatasetMode::Unique, FileMode::Basic);
        assert_eq!(ds.apply_manifest(&manifest, 0, 2), Err(HioError::BadParam));
    }

    #[test]
    fn test_mode_guards() {
        let mut ds = dataset(DatasetMode::Shared, FileMode::Basic);
        ds.set_file_mode(FileMode::Optimized).unwrap();
        ds.set_block_size(4096).unwrap();
        assert_eq!(ds.set_block_size(0), Err(HioError::BadParam));

        ds.set_state(DatasetState::Open);
        assert_eq!(ds.set_file_mode(FileMode::Basic), Err(HioError::Perm));
    }
}
