use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Default capacity of a node's aggregation buffer (512 KiB).
pub const DEFAULT_REGION_SIZE: usize = 512 * 1024;

/// Control block at the head of a node-shared region. Cache-line aligned so
/// the atomics never share a line with buffer data.
#[repr(C, align(128))]
#[derive(Debug)]
pub struct ShmemControl {
    master_rank: i32,
    shared_offset: AtomicU64,
    mutex: Mutex<()>,
    flush_pending: AtomicBool,
}

/// Node-shared aggregation region. One region is allocated per dataset per
/// node; the master rank (lowest global rank on the node) owns the drain
/// side while peers hold append-only access through atomic reservation.
#[derive(Debug)]
pub struct SharedRegion {
    control: ShmemControl,
    append_offset: AtomicU64,
    data: UnsafeCell<Box<[u8]>>,
}

// Safety: peers only touch disjoint reserved slices of `data`; the drain
// side runs after a node barrier with no appenders active.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn new(master_rank: i32, capacity: usize) -> Self {
        Self {
            control: ShmemControl {
                master_rank,
                shared_offset: AtomicU64::new(0),
                mutex: Mutex::new(()),
                flush_pending: AtomicBool::new(false),
            },
            append_offset: AtomicU64::new(0),
            data: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
        }
    }

    pub fn master_rank(&self) -> i32 {
        self.control.master_rank
    }

    pub fn capacity(&self) -> usize {
        unsafe { (&*self.data.get()).len() }
    }

    /// Atomically bump the next free byte in the node's shared data file,
    /// returning the start of the reserved range.
    pub fn reserve_file_space(&self, len: u64) -> u64 {
        self.control.shared_offset.fetch_add(len, Ordering::Relaxed)
    }

    /// Bytes of file space handed out so far.
    pub fn file_space_used(&self) -> u64 {
        self.control.shared_offset.load(Ordering::Relaxed)
    }

    /// Serialize master-side drains.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.control.mutex.lock().unwrap()
    }

    /// Copy `record` into the aggregation buffer. Returns false when the
    /// buffer cannot hold it; the caller then takes the direct-write path.
    pub fn try_append(&self, record: &[u8]) -> bool {
        let len = record.len() as u64;
        let capacity = self.capacity() as u64;
        let mut cur = self.append_offset.load(Ordering::Acquire);
        loop {
            if cur + len > capacity {
                return false;
            }
            match self.append_offset.compare_exchange_weak(
                cur,
                cur + len,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }

        // Safety: [cur, cur+len) was reserved above and no other appender
        // can observe the same range.
        unsafe {
            let data = &mut *self.data.get();
            data[cur as usize..(cur + len) as usize].copy_from_slice(record);
        }
        self.control.flush_pending.store(true, Ordering::Release);
        true
    }

    /// Clear the flush flag, reporting whether it was set.
    pub fn take_flush_pending(&self) -> bool {
        self.control.flush_pending.swap(false, Ordering::AcqRel)
    }

    /// View the appended records.
    ///
    /// # Safety
    /// All appenders must be quiesced (node barrier) before calling; the
    /// view is invalidated by any subsequent append or reset.
    pub unsafe fn records(&self) -> &[u8] {
        let used = self.append_offset.load(Ordering::Acquire) as usize;
        let used = used.min(self.capacity());
        unsafe { &(&*self.data.get())[..used] }
    }

    /// Discard appended records after a drain. Master side only.
    pub fn reset_records(&self) {
        self.append_offset.store(0, Ordering::Release);
    }
}

/// One aggregated write record: which element, whose rank, where in the
/// element, and the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggRecord {
    pub element: String,
    pub rank: i32,
    pub app_offset: u64,
    pub payload: Vec<u8>,
}

/// Encode a record for [`SharedRegion::try_append`].
pub fn encode_record(element: &str, rank: i32, app_offset: u64, payload: &[u8]) -> Vec<u8> {
    let name = element.as_bytes();
    let mut out = Vec::with_capacity(20 + name.len() + payload.len());
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&rank.to_le_bytes());
    out.extend_from_slice(&app_offset.to_le_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

/// Decode every record in a drained buffer.
pub fn decode_records(mut buf: &[u8]) -> Vec<AggRecord> {
    let mut records = Vec::new();
    while buf.len() >= 20 {
        let name_len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let payload_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let rank = i32::from_le_bytes(buf[8..12].try_into().unwrap());
        let app_offset = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let total = 20 + name_len + payload_len;
        if buf.len() < total {
            break;
        }
        records.push(AggRecord {
            element: String::from_utf8_lossy(&buf[20..20 + name_len]).into_owned(),
            rank,
            app_offset,
            payload: buf[20 + name_len..total].to_vec(),
        });
        buf = &buf[total..];
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_codec() {
        let encoded = encode_record("elem", 3, 4096, &[0xAA; 16]);
        let records = decode_records(&encoded);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].element, "elem");
        assert_eq!(records[0].rank, 3);
        assert_eq!(records[0].app_offset, 4096);
        assert_eq!(records[0].payload, vec![0xAA; 16]);
    }

    #[test]
    fn test_file_space_reservation() {
        let region = SharedRegion::new(0, 1024);
        assert_eq!(region.reserve_file_space(1024), 0);
        assert_eq!(region.reserve_file_space(512), 1024);
        assert_eq!(region.file_space_used(), 1536);
    }

    #[test]
    fn test_append_and_drain() {
        let region = SharedRegion::new(0, 4096);
        assert!(region.try_append(&encode_record("a", 0, 0, &[1, 2, 3])));
        assert!(region.try_append(&encode_record("b", 1, 100, &[4])));
        assert!(region.take_flush_pending());
        assert!(!region.take_flush_pending());

        let records = decode_records(unsafe { region.records() });
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].element, "a");
        assert_eq!(records[1].rank, 1);

        region.reset_records();
        assert!(unsafe { region.records() }.is_empty());
    }

    #[test]
    fn test_append_overflow_refused() {
        let region = SharedRegion::new(0, 64);
        assert!(!region.try_append(&vec![0u8; 65]));
        assert!(region.try_append(&vec![0u8; 64]));
        assert!(!region.try_append(&[0u8; 1]));
    }

    #[test]
    fn test_concurrent_appends_disjoint() {
        let region = Arc::new(SharedRegion::new(0, 1 << 20));
        let mut handles = Vec::new();
        for rank in 0..4 {
            let region = Arc::clone(&region);
            handles.push(std::thread::spawn(move || {
                for i in 0..64u64 {
                    let payload = vec![rank as u8; 32];
                    assert!(region.try_append(&encode_record(
                        "e",
                        rank,
                        i * 32,
                        &payload
                    )));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let records = decode_records(unsafe { region.records() });
        assert_eq!(records.len(), 256);
        for rec in &records {
            assert!(rec.payload.iter().all(|&b| b == rec.rank as u8));
        }
    }
}
