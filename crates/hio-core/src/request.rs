use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Direction of a data transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDir {
    Read,
    Write,
}

/// Completion slot shared between a public [`Request`] handle and the
/// internal request queued in the dataset buffer.
#[derive(Debug, Default)]
pub struct RequestState {
    complete: AtomicBool,
    transferred: AtomicI64,
    error: AtomicI64,
}

impl RequestState {
    pub fn finish(&self, transferred: i64) {
        self.transferred.store(transferred, Ordering::Release);
        self.complete.store(true, Ordering::Release);
    }

    pub fn fail(&self, code: i64) {
        self.error.store(code, Ordering::Release);
        self.complete.store(true, Ordering::Release);
    }
}

/// Handle for a non-blocking I/O request. Requests complete when the
/// owning dataset flushes; waiting on one therefore forces a flush.
#[derive(Debug, Clone)]
pub struct Request {
    state: Arc<RequestState>,
}

impl Request {
    pub(crate) fn new(state: Arc<RequestState>) -> Self {
        Self { state }
    }

    /// Poll for completion. Returns the transfer count once complete, or
    /// the error code recorded by the backend.
    pub fn test(&self) -> Option<Result<i64, i64>> {
        if !self.state.complete.load(Ordering::Acquire) {
            return None;
        }
        let err = self.state.error.load(Ordering::Acquire);
        if err != 0 {
            Some(Err(err))
        } else {
            Some(Ok(self.state.transferred.load(Ordering::Acquire)))
        }
    }
}

/// A queued I/O operation. The user buffer is described by a chunk shape:
/// `count` chunks of `size` bytes, `stride` extra bytes between chunks in
/// memory, while the element region stays contiguous.
pub struct InternalRequest {
    pub element_index: usize,
    pub dir: XferDir,
    pub app_offset: u64,
    pub buf: *mut u8,
    pub count: usize,
    pub size: usize,
    pub stride: usize,
    pub state: Arc<RequestState>,
}

// Safety: the buffer pointer is owned by the caller, who must keep it valid
// until the request completes (enforced by the unsafe submit APIs); request
// objects themselves are only ever handed between threads whole.
unsafe impl Send for InternalRequest {}

impl InternalRequest {
    pub fn total_len(&self) -> u64 {
        (self.count * self.size) as u64
    }

    /// Pointer to memory chunk `i`. Callers must not index past `count`.
    pub fn chunk_ptr(&self, i: usize) -> *mut u8 {
        unsafe { self.buf.add(i * (self.size + self.stride)) }
    }
}

/// Per-dataset queue of pending requests with a byte budget. When the
/// budget cannot cover the next request the queue must be flushed first.
pub(crate) struct RequestBuffer {
    budget: u64,
    remaining: u64,
    reqs: Vec<InternalRequest>,
}

impl RequestBuffer {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            remaining: budget,
            reqs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    /// True when `len` more bytes do not fit in the remaining budget.
    pub fn needs_flush(&self, len: u64) -> bool {
        !self.reqs.is_empty() && self.remaining < len
    }

    pub fn push(&mut self, req: InternalRequest) {
        self.remaining = self.remaining.saturating_sub(req.total_len());
        self.reqs.push(req);
    }

    /// Detach the queued requests sorted by (element, offset) and reset the
    /// budget. Offsets compare as unsigned; the sort is stable so requests
    /// to the same (element, offset) keep issue order.
    pub fn take_sorted(&mut self) -> Vec<InternalRequest> {
        let mut reqs = std::mem::take(&mut self.reqs);
        reqs.sort_by_key(|r| (r.element_index, r.app_offset));
        self.remaining = self.budget;
        reqs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(element_index: usize, app_offset: u64, len: usize) -> InternalRequest {
        InternalRequest {
            element_index,
            dir: XferDir::Write,
            app_offset,
            buf: std::ptr::null_mut(),
            count: 1,
            size: len,
            stride: 0,
            state: Arc::new(RequestState::default()),
        }
    }

    #[test]
    fn test_budget_flush_points() {
        // 4096-byte budget, 1024-byte requests: flushes needed before the
        // 5th and 9th submissions
        let mut buffer = RequestBuffer::new(4096);
        let mut flushes = 0;
        for i in 0..10u64 {
            if buffer.needs_flush(1024) {
                flushes += 1;
                let batch = buffer.take_sorted();
                assert_eq!(batch.len(), 4);
            }
            buffer.push(req(0, i * 1024, 1024));
        }
        assert_eq!(flushes, 2);
        assert_eq!(buffer.take_sorted().len(), 2);
    }

    #[test]
    fn test_sort_by_element_then_offset() {
        let mut buffer = RequestBuffer::new(1 << 20);
        buffer.push(req(1, 512, 64));
        buffer.push(req(0, 1024, 64));
        buffer.push(req(1, 0, 64));
        buffer.push(req(0, 0, 64));

        let batch = buffer.take_sorted();
        let order: Vec<(usize, u64)> =
            batch.iter().map(|r| (r.element_index, r.app_offset)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1024), (1, 0), (1, 512)]);
    }

    #[test]
    fn test_sort_stable_for_rewrites() {
        let mut buffer = RequestBuffer::new(1 << 20);
        let first = req(0, 0, 64);
        let second = req(0, 0, 32);
        let first_state = Arc::clone(&first.state);
        buffer.push(first);
        buffer.push(second);

        let batch = buffer.take_sorted();
        assert!(Arc::ptr_eq(&batch[0].state, &first_state));
    }

    #[test]
    fn test_oversized_request_flushes_then_queues() {
        let mut buffer = RequestBuffer::new(1024);
        buffer.push(req(0, 0, 512));
        assert!(buffer.needs_flush(4096));
        buffer.take_sorted();
        // an oversized request still queues alone against an empty buffer
        assert!(!buffer.needs_flush(4096));
        buffer.push(req(0, 0, 4096));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_request_handle_completion() {
        let state = Arc::new(RequestState::default());
        let handle = Request::new(Arc::clone(&state));
        assert!(handle.test().is_none());
        state.finish(4096);
        assert_eq!(handle.test(), Some(Ok(4096)));

        let state = Arc::new(RequestState::default());
        let handle = Request::new(Arc::clone(&state));
        state.fail(-5);
        assert_eq!(handle.test(), Some(Err(-5)));
    }
}
