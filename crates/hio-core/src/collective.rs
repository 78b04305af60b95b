use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::comm::{GroupComm, TAG_MANIFEST_DATA, TAG_MANIFEST_SIZE};
use crate::dataset::Dataset;
use crate::error::{HioError, HioResult};
use crate::manifest::{self, Manifest};
use crate::types::DatasetFlags;

/// Seconds since the epoch, for manifest mtime stamps.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Binary-tree reduction of per-rank manifests into rank 0.
///
/// Every rank passes its serialized local manifest. Internal nodes receive
/// each child's size on tag 1001, then the payload on tag 1002, and merge
/// left before right so segments from the higher-numbered subtree land
/// later and win overlap shadowing. Rank 0 gets `(rc, Some(bytes))`; other
/// ranks forward upward and get `(rc, None)`.
///
/// A failed merge does not abort the protocol: the child's payload is
/// dropped, the failure is recorded in `rc`, and the reduction continues so
/// every rank still reaches the scatter step.
pub fn gather_manifest(
    comm: &dyn GroupComm,
    local: Vec<u8>,
) -> HioResult<(i64, Option<Vec<u8>>)> {
    let rank = comm.rank();
    let size = comm.size();
    let mut data = local;
    let mut rc = 0i64;

    let left = 2 * rank + 1;
    let right = left + 1;

    for child in [left, right] {
        if child >= size {
            continue;
        }
        let size_bytes = comm.recv(child, TAG_MANIFEST_SIZE)?;
        let mut child_size = [0i64];
        crate::comm::bytes_to_longs(&size_bytes, &mut child_size);

        let payload = comm.recv(child, TAG_MANIFEST_DATA)?;
        if payload.len() as i64 != child_size[0] {
            rc = HioError::Truncate.code().min(rc);
            continue;
        }

        debug!("merging {} manifest bytes from rank {child}", payload.len());
        if let Err(e) = manifest::merge_data(&mut data, &payload) {
            rc = e.code().min(rc);
        }
    }

    if rank > 0 {
        let parent = (rank - 1) / 2;
        debug!("forwarding {} manifest bytes to rank {parent}", data.len());
        comm.send(
            parent,
            TAG_MANIFEST_SIZE,
            &crate::comm::longs_to_bytes(&[data.len() as i64]),
        )?;
        comm.send(parent, TAG_MANIFEST_DATA, &data)?;
        return Ok((rc, None));
    }

    Ok((rc, Some(data)))
}

/// Broadcast the committed manifest from the root of `comm` and rebuild
/// every member's in-memory view from it. `apply_rank` and `apply_size`
/// identify the caller within the dataset's participating group, which may
/// be wider than `comm`.
///
/// The reduction of `rc` means the worst result on any rank becomes the
/// result on every rank; the root's persist step never reaches the wire
/// when the reduction fails.
fn scatter_manifest_over(
    comm: &dyn GroupComm,
    dataset: &mut Dataset,
    manifest_bytes: Option<&[u8]>,
    rc: i64,
    apply_rank: i32,
    apply_size: u64,
) -> HioResult<()> {
    let min_rc = comm.allreduce_min_i64(rc)?;

    let mut header = [0i64; 5];
    if comm.rank() == 0 {
        header = [
            min_rc,
            manifest_bytes.map_or(0, |m| m.len() as i64),
            dataset.flags().bits() as i64,
            dataset.fs_attr.stripe_count,
            dataset.fs_attr.stripe_size,
        ];
    }
    comm.bcast_longs(0, &mut header)?;
    HioError::from_code(header[0])?;

    let manifest_size = header[1] as usize;
    if manifest_size > 0 {
        let mut bytes = if comm.rank() == 0 {
            manifest_bytes.unwrap().to_vec()
        } else {
            Vec::new()
        };
        comm.bcast(0, &mut bytes)?;

        let merged = Manifest::deserialize(&bytes)?;
        dataset.apply_manifest(&merged, apply_rank, apply_size)?;
    }

    if let Some(flags) = DatasetFlags::from_bits(header[2] as u32) {
        dataset.set_flags(flags);
    }
    dataset.fs_attr.stripe_count = header[3];
    dataset.fs_attr.stripe_size = header[4];

    Ok(())
}

/// Scatter across the dataset's full participating group.
pub fn scatter_manifest(
    comm: &dyn GroupComm,
    dataset: &mut Dataset,
    manifest_bytes: Option<&[u8]>,
    rc: i64,
) -> HioResult<()> {
    scatter_manifest_over(
        comm,
        dataset,
        manifest_bytes,
        rc,
        comm.rank(),
        comm.size() as u64,
    )
}

/// Unique-mode scatter. Ranks holding a manifest announce the ranks it
/// covers; a max-reduction elects an I/O leader per rank, and only covered
/// ranks join a leader's sub-group for the payload broadcast. Ranks with no
/// leader skip the broadcast entirely.
pub fn scatter_manifest_unique(
    comm: &dyn GroupComm,
    dataset: &mut Dataset,
    manifest_bytes: Option<&[u8]>,
    rc: i64,
) -> HioResult<()> {
    let min_rc = comm.allreduce_min_i64(rc)?;
    HioError::from_code(min_rc)?;

    let mut leaders = vec![-1i32; comm.size() as usize];
    if let Some(bytes) = manifest_bytes {
        let m = Manifest::deserialize(bytes)?;
        for r in m.ranks() {
            if r < 0 || r >= comm.size() {
                return Err(HioError::BadParam);
            }
            leaders[r as usize] = comm.rank();
        }
        // the holder leads its own group even when it owns no data
        leaders[comm.rank() as usize] = leaders[comm.rank() as usize].max(comm.rank());
    }
    comm.allreduce_max_i32s(&mut leaders)?;

    let leader = leaders[comm.rank() as usize];
    if leader < 0 {
        // no data anywhere for this rank
        comm.split(-1, 0)?;
        return Ok(());
    }

    let key = if leader == comm.rank() { 0 } else { 1 };
    let sub = comm.split(leader, key)?.ok_or(HioError::Generic)?;
    scatter_manifest_over(
        sub.as_ref(),
        dataset,
        manifest_bytes,
        min_rc,
        comm.rank(),
        comm.size() as u64,
    )
}

/// Commit a dataset: serialize this rank's manifest, gather-and-merge into
/// rank 0, persist atomically at `manifest_path`, and scatter the combined
/// manifest back so every rank holds the committed view. `rc_in` carries
/// any failure this rank hit before the commit; the min-reduction makes it
/// everyone's result.
pub fn commit_manifest(
    comm: &dyn GroupComm,
    dataset: &mut Dataset,
    manifest_path: &Path,
    compress: bool,
    rc_in: i64,
) -> HioResult<()> {
    dataset.set_mtime(unix_time());

    let local = dataset
        .to_manifest(comm.size() as u64)
        .serialize(compress)?;
    let (gather_rc, merged) = gather_manifest(comm, local)?;
    let mut rc = gather_rc.min(rc_in);

    if comm.rank() == 0 && rc == 0 {
        if let Err(e) = persist_bytes(manifest_path, merged.as_deref().unwrap_or(&[])) {
            rc = e.code();
        }
    }

    scatter_manifest(comm, dataset, merged.as_deref(), rc)
}

/// Write manifest bytes to a temporary file and rename into place.
fn persist_bytes(path: &Path, data: &[u8]) -> HioResult<()> {
    if data.is_empty() {
        return Err(HioError::BadParam);
    }
    let file_name = path.file_name().ok_or(HioError::BadParam)?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    std::fs::write(&tmp, data).map_err(HioError::from)?;
    std::fs::rename(&tmp, path).map_err(HioError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::RANK_SHARED;
    use crate::local::LocalComm;
    use crate::types::{DatasetMode, FileMode};
    use std::sync::Arc;

    fn run_ranks<F>(size: i32, f: F)
    where
        F: Fn(LocalComm) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = LocalComm::group(size)
            .into_iter()
            .map(|comm| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || f(comm))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    fn unique_dataset(rank: i32) -> Dataset {
        let mut ds = Dataset::new(
            "ckpt",
            1,
            DatasetFlags::WRITE | DatasetFlags::CREATE,
            DatasetMode::Unique,
            FileMode::Basic,
            1024,
            1 << 20,
            0,
        );
        let idx = ds.element_alloc("e", rank);
        ds.element_mut(idx).extend_size(8);
        ds
    }

    #[test]
    fn test_gather_merges_to_root() {
        run_ranks(4, |comm| {
            let ds = unique_dataset(comm.rank());
            let local = ds.to_manifest(4).serialize(false).unwrap();
            let (rc, merged) = gather_manifest(&comm, local).unwrap();
            assert_eq!(rc, 0);

            if comm.rank() == 0 {
                let merged = Manifest::deserialize(&merged.unwrap()).unwrap();
                let elements = merged.elements.as_ref().unwrap();
                assert_eq!(elements.len(), 4);
                let mut ranks: Vec<i64> =
                    elements.iter().map(|e| e.rank.unwrap()).collect();
                ranks.sort();
                assert_eq!(ranks, vec![0, 1, 2, 3]);
            } else {
                assert!(merged.is_none());
            }
        });
    }

    #[test]
    fn test_gather_handles_compressed_payloads() {
        run_ranks(2, |comm| {
            let ds = unique_dataset(comm.rank());
            let local = ds.to_manifest(2).serialize(true).unwrap();
            let (rc, merged) = gather_manifest(&comm, local).unwrap();
            assert_eq!(rc, 0);
            if comm.rank() == 0 {
                let bytes = merged.unwrap();
                // accumulator was compressed, so the merge result stays so
                assert_eq!(&bytes[..2], b"BZ");
                let merged = Manifest::deserialize(&bytes).unwrap();
                assert_eq!(merged.elements.as_ref().unwrap().len(), 2);
            }
        });
    }

    #[test]
    fn test_commit_converges_all_ranks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        run_ranks(4, move |comm| {
            let mut ds = unique_dataset(comm.rank());
            commit_manifest(&comm, &mut ds, &path, false, 0).unwrap();

            // every rank sees the committed scalar view
            assert_eq!(ds.status(), 0);
            assert!(ds.mtime() > 0);
            // and its own element back from the merged manifest
            assert_eq!(ds.elements().len(), 1);
            assert_eq!(ds.elements()[0].rank(), comm.rank());

            comm.barrier().unwrap();
            let header = manifest::read_header(&path).unwrap();
            assert_eq!(header.id, 1);
            assert_eq!(header.mode, DatasetMode::Unique);
            assert_eq!(header.status, 0);
            assert_eq!(header.mtime, ds.mtime());
        });
    }

    #[test]
    fn test_scatter_propagates_worst_rc() {
        run_ranks(3, |comm| {
            let mut ds = unique_dataset(comm.rank());
            let rc = if comm.rank() == 1 {
                HioError::NotFound.code()
            } else {
                0
            };
            let result = scatter_manifest(&comm, &mut ds, None, rc);
            assert_eq!(result, Err(HioError::NotFound));
        });
    }

    #[test]
    fn test_scatter_unique_skips_uncovered_ranks() {
        run_ranks(3, |comm| {
            let mut ds = Dataset::new(
                "ckpt",
                1,
                DatasetFlags::READ,
                DatasetMode::Unique,
                FileMode::Basic,
                1024,
                1 << 20,
                0,
            );
            // rank 0 holds a manifest covering ranks 0 and 2 only
            let bytes = if comm.rank() == 0 {
                let mut src = unique_dataset(0);
                src.element_alloc("e", 2);
                src.element_mut(1).extend_size(8);
                Some(src.to_manifest(3).serialize(false).unwrap())
            } else {
                None
            };

            scatter_manifest_unique(&comm, &mut ds, bytes.as_deref(), 0).unwrap();
            match comm.rank() {
                0 | 2 => {
                    assert_eq!(ds.elements().len(), 1);
                    assert_eq!(ds.elements()[0].rank(), comm.rank());
                }
                _ => assert!(ds.elements().is_empty()),
            }
        });
    }

    #[test]
    fn test_scatter_shared_rebuilds_view() {
        run_ranks(2, |comm| {
            let mut ds = Dataset::new(
                "ckpt",
                7,
                DatasetFlags::READ,
                DatasetMode::Shared,
                FileMode::Optimized,
                1024,
                1 << 20,
                0,
            );
            let bytes = if comm.rank() == 0 {
                let mut src = Dataset::new(
                    "ckpt",
                    7,
                    DatasetFlags::READ,
                    DatasetMode::Shared,
                    FileMode::Optimized,
                    1024,
                    1 << 20,
                    0,
                );
                let file = src.add_file("data.0");
                let idx = src.element_alloc("v", RANK_SHARED);
                src.element_mut(idx).add_segment(crate::segment::Segment {
                    file_index: file,
                    file_offset: 0,
                    app_offset: 0,
                    length: 3000,
                });
                Some(src.to_manifest(2).serialize(false).unwrap())
            } else {
                None
            };

            scatter_manifest(&comm, &mut ds, bytes.as_deref(), 0).unwrap();
            assert_eq!(ds.files(), &["data.0"]);
            assert_eq!(ds.elements().len(), 1);
            assert_eq!(ds.elements()[0].size(), 3000);
        });
    }
}
