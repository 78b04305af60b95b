use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HioError, HioResult};
use crate::types::{DatasetMode, FileMode};

/// Version written into new manifests.
pub const MANIFEST_VERSION: &str = "2.1";
/// Oldest manifest version this codec can parse.
pub const MANIFEST_COMPAT: &str = "2.0";

/// One segment entry. Short key names keep large manifests compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestSegment {
    /// File offset
    #[serde(rename = "loff")]
    pub file_offset: u64,
    /// Application offset
    #[serde(rename = "off")]
    pub app_offset: u64,
    /// Length in bytes
    #[serde(rename = "len")]
    pub length: u64,
    /// Index into the manifest's file list
    #[serde(rename = "findex")]
    pub file_index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestElement {
    pub identifier: String,
    pub size: u64,
    /// Owning rank; present only for unique-mode datasets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<ManifestSegment>>,
}

impl ManifestElement {
    fn segment_count(&self) -> usize {
        self.segments.as_ref().map_or(0, Vec::len)
    }
}

/// In-memory form of a dataset manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "hio_manifest_version")]
    pub version: String,
    #[serde(rename = "hio_manifest_compat")]
    pub compat: String,
    pub hio_version: String,
    pub identifier: String,
    pub dataset_id: i64,
    #[serde(rename = "hio_dataset_mode")]
    pub mode: DatasetMode,
    #[serde(rename = "hio_file_mode")]
    pub file_mode: FileMode,
    #[serde(rename = "hio_status")]
    pub status: i64,
    #[serde(rename = "hio_mtime")]
    pub mtime: u64,
    #[serde(rename = "hio_comm_size")]
    pub comm_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<ManifestElement>>,
}

/// Scalar summary of a manifest, extracted without materializing segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetHeader {
    pub id: i64,
    pub mode: DatasetMode,
    pub file_mode: FileMode,
    pub status: i64,
    pub mtime: u64,
}

#[derive(Deserialize)]
struct HeaderDoc {
    #[serde(rename = "hio_manifest_compat")]
    compat: String,
    dataset_id: i64,
    #[serde(rename = "hio_dataset_mode")]
    mode: DatasetMode,
    #[serde(rename = "hio_file_mode")]
    file_mode: FileMode,
    #[serde(rename = "hio_status")]
    status: i64,
    #[serde(rename = "hio_mtime")]
    mtime: u64,
}

fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == b'B' && data[1] == b'Z'
}

fn decompress(data: &[u8]) -> HioResult<Vec<u8>> {
    let mut out = Vec::new();
    bzip2::read::BzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|_| HioError::Generic)?;
    Ok(out)
}

fn compress(data: &[u8]) -> HioResult<Vec<u8>> {
    use std::io::Write;
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(3));
    encoder.write_all(data).map_err(|_| HioError::Generic)?;
    encoder.finish().map_err(|_| HioError::Generic)
}

/// Inflate serialized manifest bytes if they carry the bzip2 magic.
fn plain_bytes(data: &[u8]) -> HioResult<std::borrow::Cow<'_, [u8]>> {
    if is_compressed(data) {
        Ok(std::borrow::Cow::Owned(decompress(data)?))
    } else {
        Ok(std::borrow::Cow::Borrowed(data))
    }
}

impl Manifest {
    /// Serialize to bytes, optionally bzip2-compressed.
    pub fn serialize(&self, compress_data: bool) -> HioResult<Vec<u8>> {
        let json = serde_json::to_vec(self).map_err(|_| HioError::Generic)?;
        if compress_data { compress(&json) } else { Ok(json) }
    }

    /// Parse serialized manifest bytes, transparently inflating compressed
    /// input. Empty input and incompatible versions are rejected.
    pub fn deserialize(data: &[u8]) -> HioResult<Manifest> {
        if data.len() < 2 {
            return Err(HioError::BadParam);
        }
        let plain = plain_bytes(data)?;
        let manifest: Manifest =
            serde_json::from_slice(&plain).map_err(|_| HioError::Generic)?;
        if manifest.compat != MANIFEST_COMPAT {
            return Err(HioError::Generic);
        }
        Ok(manifest)
    }

    /// Write to `path`, compressing when the path ends in `.bz2`. The bytes
    /// land in a temporary file first and are renamed into place.
    pub fn save(&self, path: &Path) -> HioResult<()> {
        let compress_data = path.extension().is_some_and(|e| e == "bz2");
        let data = self.serialize(compress_data)?;

        let file_name = path.file_name().ok_or(HioError::BadParam)?;
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);

        std::fs::write(&tmp, &data).map_err(HioError::from)?;
        std::fs::rename(&tmp, path).map_err(HioError::from)?;
        Ok(())
    }

    /// Load a manifest from a file.
    pub fn load(path: &Path) -> HioResult<Manifest> {
        Manifest::deserialize(&read_manifest_file(path)?)
    }

    /// Merge `other` into `self`. Both manifests must describe the same
    /// dataset (mode, id, and library version all equal); `other`'s files
    /// are unioned into `self`'s file list and its segments re-pointed
    /// through the resulting index remap.
    pub fn merge(&mut self, other: Manifest) -> HioResult<()> {
        if self.mode != other.mode
            || self.dataset_id != other.dataset_id
            || self.hio_version != other.hio_version
        {
            return Err(HioError::BadParam);
        }

        // union the file lists, remembering where each incoming index went
        let remap: Vec<u64> = match other.files {
            Some(other_files) => {
                let files = self.files.get_or_insert_with(Vec::new);
                other_files
                    .into_iter()
                    .map(|name| match files.iter().position(|f| *f == name) {
                        Some(idx) => idx as u64,
                        None => {
                            files.push(name);
                            (files.len() - 1) as u64
                        }
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        let Some(other_elements) = other.elements else {
            if other.status != 0 && self.status == 0 {
                self.status = other.status;
            }
            return Ok(());
        };
        let elements = self.elements.get_or_insert_with(Vec::new);

        for mut element in other_elements {
            if let Some(segments) = element.segments.as_mut() {
                for seg in segments.iter_mut() {
                    let idx = seg.file_index as usize;
                    if idx >= remap.len() {
                        return Err(HioError::BadParam);
                    }
                    seg.file_index = remap[idx];
                }
            }

            // unique-mode elements match by (identifier, rank), shared by
            // identifier alone; unmatched entries append verbatim
            let slot = elements.iter().position(|e| {
                e.identifier == element.identifier && e.rank == element.rank
            });
            match slot {
                Some(idx) => {
                    let existing = &mut elements[idx];
                    if element.segment_count() > 0 {
                        let merged = existing.segments.get_or_insert_with(Vec::new);
                        merged.extend(element.segments.unwrap());
                        dedup_segments(merged);
                        merged.sort_by_key(|s| s.app_offset);
                    }
                    existing.size = existing.size.max(element.size);
                }
                None => elements.push(element),
            }
        }

        if other.status != 0 && self.status == 0 {
            self.status = other.status;
        }

        Ok(())
    }

    /// The sorted, deduplicated set of ranks that hold data in this
    /// manifest.
    pub fn ranks(&self) -> Vec<i32> {
        let mut ranks: Vec<i32> = self
            .elements
            .iter()
            .flatten()
            .filter_map(|e| e.rank)
            .map(|r| r as i32)
            .collect();
        ranks.sort_unstable();
        ranks.dedup();
        ranks
    }
}

/// Drop exact duplicate segments, keeping first occurrences.
fn dedup_segments(segments: &mut Vec<ManifestSegment>) {
    let mut seen = HashSet::with_capacity(segments.len());
    segments.retain(|s| seen.insert(*s));
}

/// Merge serialized manifest `other` into serialized accumulator `acc`.
/// Either side may be bzip2-compressed; the result is compressed iff the
/// accumulator was. An empty accumulator adopts `other` unchanged.
pub fn merge_data(acc: &mut Vec<u8>, other: &[u8]) -> HioResult<()> {
    if acc.is_empty() {
        acc.extend_from_slice(other);
        return Ok(());
    }
    if other.is_empty() {
        return Ok(());
    }

    let compressed = is_compressed(acc);
    let mut merged = Manifest::deserialize(acc)?;
    merged.merge(Manifest::deserialize(other)?)?;
    *acc = merged.serialize(compressed)?;
    Ok(())
}

fn read_manifest_file(path: &Path) -> HioResult<Vec<u8>> {
    let data = std::fs::read(path).map_err(HioError::from)?;
    if data.is_empty() {
        return Err(HioError::BadParam);
    }
    Ok(data)
}

/// Read just the scalar header of a persisted manifest.
pub fn read_header(path: &Path) -> HioResult<DatasetHeader> {
    let data = read_manifest_file(path)?;
    let plain = plain_bytes(&data)?;
    let doc: HeaderDoc = serde_json::from_slice(&plain).map_err(|_| HioError::Generic)?;
    if doc.compat != MANIFEST_COMPAT {
        return Err(HioError::Generic);
    }
    Ok(DatasetHeader {
        id: doc.dataset_id,
        mode: doc.mode,
        file_mode: doc.file_mode,
        status: doc.status,
        mtime: doc.mtime,
    })
}
