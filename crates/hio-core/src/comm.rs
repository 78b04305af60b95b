use std::sync::Arc;

use crate::error::HioResult;
use crate::shmem::SharedRegion;

/// Tag for manifest size exchange during the gather tree.
pub const TAG_MANIFEST_SIZE: i32 = 1001;
/// Tag for manifest payload exchange during the gather tree.
pub const TAG_MANIFEST_DATA: i32 = 1002;

const TAG_BARRIER: i32 = 901;
const TAG_BCAST: i32 = 902;
const TAG_REDUCE: i32 = 903;

/// Group communicator contract. The engine expresses every collective need
/// through this trait; implementations provide ordered, tagged,
/// length-delimited point-to-point delivery and the two group-management
/// operations, and inherit the derived collectives.
///
/// `recv` is selective: it returns the oldest pending message from `src`
/// with the given tag, waiting if none has arrived yet.
pub trait GroupComm: Send + Sync {
    fn size(&self) -> i32;

    fn rank(&self) -> i32;

    fn send(&self, dest: i32, tag: i32, data: &[u8]) -> HioResult<()>;

    fn recv(&self, src: i32, tag: i32) -> HioResult<Vec<u8>>;

    /// Collectively partition the group by `color`. Ranks passing a
    /// negative color opt out and receive `None`; members of each color
    /// are ordered by (key, rank).
    fn split(&self, color: i32, key: i32) -> HioResult<Option<Box<dyn GroupComm>>>;

    /// Collectively allocate a shared region visible to every member of
    /// this group. The root's `master_rank` value is recorded in the
    /// region's control block.
    fn alloc_shared(&self, size: usize, master_rank: i32) -> HioResult<Arc<SharedRegion>>;

    /// Synchronize every member of the group.
    fn barrier(&self) -> HioResult<()> {
        if self.size() <= 1 {
            return Ok(());
        }
        if self.rank() == 0 {
            for r in 1..self.size() {
                self.recv(r, TAG_BARRIER)?;
            }
            for r in 1..self.size() {
                self.send(r, TAG_BARRIER, &[])?;
            }
        } else {
            self.send(0, TAG_BARRIER, &[])?;
            self.recv(0, TAG_BARRIER)?;
        }
        Ok(())
    }

    /// Broadcast `data` from `root` to every member.
    fn bcast(&self, root: i32, data: &mut Vec<u8>) -> HioResult<()> {
        if self.size() <= 1 {
            return Ok(());
        }
        if self.rank() == root {
            for r in 0..self.size() {
                if r != root {
                    self.send(r, TAG_BCAST, data)?;
                }
            }
        } else {
            *data = self.recv(root, TAG_BCAST)?;
        }
        Ok(())
    }

    /// Broadcast a fixed-size array of signed 64-bit values from `root`.
    fn bcast_longs(&self, root: i32, vals: &mut [i64]) -> HioResult<()> {
        let mut bytes = longs_to_bytes(vals);
        self.bcast(root, &mut bytes)?;
        bytes_to_longs(&bytes, vals);
        Ok(())
    }

    /// Minimum of `value` across the group, visible to every member.
    fn allreduce_min_i64(&self, value: i64) -> HioResult<i64> {
        if self.size() <= 1 {
            return Ok(value);
        }
        let mut result = [value];
        if self.rank() == 0 {
            for r in 1..self.size() {
                let bytes = self.recv(r, TAG_REDUCE)?;
                let mut v = [0i64];
                bytes_to_longs(&bytes, &mut v);
                result[0] = result[0].min(v[0]);
            }
        } else {
            self.send(0, TAG_REDUCE, &longs_to_bytes(&result))?;
        }
        self.bcast_longs(0, &mut result)?;
        Ok(result[0])
    }

    /// Element-wise maximum of `vals` across the group.
    fn allreduce_max_i32s(&self, vals: &mut [i32]) -> HioResult<()> {
        if self.size() <= 1 {
            return Ok(());
        }
        if self.rank() == 0 {
            for r in 1..self.size() {
                let bytes = self.recv(r, TAG_REDUCE)?;
                for (i, chunk) in bytes.chunks_exact(4).enumerate() {
                    let v = i32::from_le_bytes(chunk.try_into().unwrap());
                    vals[i] = vals[i].max(v);
                }
            }
        } else {
            let bytes: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
            self.send(0, TAG_REDUCE, &bytes)?;
        }

        let mut longs: Vec<i64> = vals.iter().map(|&v| v as i64).collect();
        self.bcast_longs(0, &mut longs)?;
        for (dst, src) in vals.iter_mut().zip(longs) {
            *dst = src as i32;
        }
        Ok(())
    }
}

pub(crate) fn longs_to_bytes(vals: &[i64]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn bytes_to_longs(bytes: &[u8], vals: &mut [i64]) {
    for (i, chunk) in bytes.chunks_exact(8).enumerate() {
        if i < vals.len() {
            vals[i] = i64::from_le_bytes(chunk.try_into().unwrap());
        }
    }
}
