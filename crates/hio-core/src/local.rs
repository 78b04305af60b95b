use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::comm::GroupComm;
use crate::error::HioResult;
use crate::shmem::SharedRegion;

/// One queued point-to-point message.
struct Message {
    src: i32,
    tag: i32,
    data: Vec<u8>,
}

/// Per-rank mailbox with selective receive.
#[derive(Default)]
struct Mailbox {
    queue: Mutex<Vec<Message>>,
    cond: Condvar,
}

impl Mailbox {
    fn deliver(&self, msg: Message) {
        self.queue.lock().unwrap().push(msg);
        self.cond.notify_all();
    }

    /// Take the oldest message matching (src, tag), waiting when none is
    /// queued yet.
    fn take(&self, src: i32, tag: i32) -> Vec<u8> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(pos) = queue.iter().position(|m| m.src == src && m.tag == tag) {
                return queue.remove(pos).data;
            }
            queue = self.cond.wait(queue).unwrap();
        }
    }
}

/// Pending collective split, keyed by per-endpoint call sequence.
struct SplitGather {
    entries: Vec<Option<(i32, i32)>>,
    results: Option<Vec<Option<(Arc<GroupState>, i32)>>>,
    fetched: i32,
}

/// Shared state of one communicator: everything its member endpoints need
/// to exchange messages and coordinate group operations.
struct GroupState {
    size: i32,
    mailboxes: Vec<Mailbox>,
    shared: Mutex<HashMap<u64, (Arc<SharedRegion>, i32)>>,
    shared_cond: Condvar,
    splits: Mutex<HashMap<u64, SplitGather>>,
    split_cond: Condvar,
}

impl GroupState {
    fn new(size: i32) -> Arc<Self> {
        Arc::new(Self {
            size,
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            shared: Mutex::new(HashMap::new()),
            shared_cond: Condvar::new(),
            splits: Mutex::new(HashMap::new()),
            split_cond: Condvar::new(),
        })
    }
}

/// In-process group communicator. Every "rank" is a thread holding one
/// endpoint; endpoints of one group share a [`GroupState`]. This is the
/// communicator used by the test driver and the test suites; a
/// network-backed implementation would provide the same trait.
pub struct LocalComm {
    state: Arc<GroupState>,
    rank: i32,
    shared_seq: AtomicU64,
    split_seq: AtomicU64,
}

impl LocalComm {
    fn new(state: Arc<GroupState>, rank: i32) -> Self {
        Self {
            state,
            rank,
            shared_seq: AtomicU64::new(0),
            split_seq: AtomicU64::new(0),
        }
    }

    /// Endpoints for a `size`-rank group in one flat node.
    pub fn group(size: i32) -> Vec<LocalComm> {
        let state = GroupState::new(size);
        (0..size).map(|r| LocalComm::new(Arc::clone(&state), r)).collect()
    }
}

impl GroupComm for LocalComm {
    fn size(&self) -> i32 {
        self.state.size
    }

    fn rank(&self) -> i32 {
        self.rank
    }

    fn send(&self, dest: i32, tag: i32, data: &[u8]) -> HioResult<()> {
        self.state.mailboxes[dest as usize].deliver(Message {
            src: self.rank,
            tag,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn recv(&self, src: i32, tag: i32) -> HioResult<Vec<u8>> {
        Ok(self.state.mailboxes[self.rank as usize].take(src, tag))
    }

    fn split(&self, color: i32, key: i32) -> HioResult<Option<Box<dyn GroupComm>>> {
        let seq = self.split_seq.fetch_add(1, Ordering::Relaxed);
        let size = self.state.size as usize;

        let mut splits = self.state.splits.lock().unwrap();
        let gather = splits.entry(seq).or_insert_with(|| SplitGather {
            entries: vec![None; size],
            results: None,
            fetched: 0,
        });
        gather.entries[self.rank as usize] = Some((color, key));

        if gather.entries.iter().all(Option::is_some) {
            // last arriver builds the child groups
            let mut members: Vec<(i32, i32, i32)> = gather
                .entries
                .iter()
                .enumerate()
                .filter_map(|(rank, e)| {
                    let (color, key) = e.unwrap();
                    (color >= 0).then_some((color, key, rank as i32))
                })
                .collect();
            members.sort();

            let mut results: Vec<Option<(Arc<GroupState>, i32)>> = vec![None; size];
            let mut i = 0;
            while i < members.len() {
                let color = members[i].0;
                let group: Vec<_> = members[i..]
                    .iter()
                    .take_while(|m| m.0 == color)
                    .collect();
                let child = GroupState::new(group.len() as i32);
                for (new_rank, member) in group.iter().enumerate() {
                    results[member.2 as usize] = Some((Arc::clone(&child), new_rank as i32));
                }
                i += group.len();
            }
            gather.results = Some(results);
            self.state.split_cond.notify_all();
        }

        loop {
            let gather = splits.get_mut(&seq).unwrap();
            if let Some(results) = gather.results.as_mut() {
                let mine = results[self.rank as usize].take();
                gather.fetched += 1;
                if gather.fetched == self.state.size {
                    splits.remove(&seq);
                }
                return Ok(mine.map(|(state, rank)| {
                    Box::new(LocalComm::new(state, rank)) as Box<dyn GroupComm>
                }));
            }
            splits = self.state.split_cond.wait(splits).unwrap();
        }
    }

    fn alloc_shared(&self, size: usize, master_rank: i32) -> HioResult<Arc<SharedRegion>> {
        let seq = self.shared_seq.fetch_add(1, Ordering::Relaxed);
        let mut shared = self.state.shared.lock().unwrap();

        if self.rank == 0 {
            shared.insert(
                seq,
                (Arc::new(SharedRegion::new(master_rank, size)), self.state.size),
            );
            self.state.shared_cond.notify_all();
        }

        loop {
            if let Some(entry) = shared.get_mut(&seq) {
                let region = Arc::clone(&entry.0);
                entry.1 -= 1;
                if entry.1 == 0 {
                    shared.remove(&seq);
                }
                return Ok(region);
            }
            shared = self.state.shared_cond.wait(shared).unwrap();
        }
    }
}

/// One rank's view of the fabric: the world group plus its on-node
/// sub-group.
pub struct LocalEndpoint {
    pub world: LocalComm,
    pub node: LocalComm,
    pub node_rank: i32,
}

/// Build endpoints for `size` ranks packed `ranks_per_node` to a node.
pub fn local_endpoints(size: i32, ranks_per_node: i32) -> Vec<LocalEndpoint> {
    assert!(size > 0 && ranks_per_node > 0);
    let world = GroupState::new(size);

    let mut endpoints = Vec::with_capacity(size as usize);
    let mut node_start = 0;
    while node_start < size {
        let node_size = ranks_per_node.min(size - node_start);
        let node = GroupState::new(node_size);
        for node_rank in 0..node_size {
            let rank = node_start + node_rank;
            endpoints.push(LocalEndpoint {
                world: LocalComm::new(Arc::clone(&world), rank),
                node: LocalComm::new(Arc::clone(&node), node_rank),
                node_rank,
            });
        }
        node_start += node_size;
    }
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

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

    #[test]
    fn test_send_recv_fifo() {
        run_ranks(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, 7, b"first").unwrap();
                comm.send(1, 7, b"second").unwrap();
                comm.send(1, 9, b"other-tag").unwrap();
            } else {
                // tag-selective receive out of arrival order
                assert_eq!(comm.recv(0, 9).unwrap(), b"other-tag");
                assert_eq!(comm.recv(0, 7).unwrap(), b"first");
                assert_eq!(comm.recv(0, 7).unwrap(), b"second");
            }
        });
    }

    #[test]
    fn test_bcast() {
        run_ranks(4, |comm| {
            let mut data = if comm.rank() == 0 {
                b"payload".to_vec()
            } else {
                Vec::new()
            };
            comm.bcast(0, &mut data).unwrap();
            assert_eq!(data, b"payload");
        });
    }

    #[test]
    fn test_barrier_and_reduce() {
        static COUNTER: AtomicI64 = AtomicI64::new(0);
        run_ranks(4, |comm| {
            COUNTER.fetch_add(1, Ordering::SeqCst);
            comm.barrier().unwrap();
            assert_eq!(COUNTER.load(Ordering::SeqCst), 4);

            let min = comm.allreduce_min_i64(-(comm.rank() as i64)).unwrap();
            assert_eq!(min, -3);

            let mut vals = vec![-1i32; 4];
            vals[comm.rank() as usize] = comm.rank() * 10;
            comm.allreduce_max_i32s(&mut vals).unwrap();
            assert_eq!(vals, vec![0, 10, 20, 30]);
        });
    }

    #[test]
    fn test_split_by_parity() {
        run_ranks(4, |comm| {
            let color = comm.rank() % 2;
            let sub = comm.split(color, comm.rank()).unwrap().unwrap();
            assert_eq!(sub.size(), 2);
            assert_eq!(sub.rank(), comm.rank() / 2);

            // sub-groups are independent: a barrier in each works
            sub.barrier().unwrap();
        });
    }

    #[test]
    fn test_split_opt_out() {
        run_ranks(3, |comm| {
            let color = if comm.rank() == 2 { -1 } else { 0 };
            let sub = comm.split(color, 0).unwrap();
            if comm.rank() == 2 {
                assert!(sub.is_none());
            } else {
                assert_eq!(sub.unwrap().size(), 2);
            }
        });
    }

    #[test]
    fn test_split_key_orders_members() {
        run_ranks(2, |comm| {
            // rank 1 asks for key 0, so it becomes rank 0 of the child
            let key = 1 - comm.rank();
            let sub = comm.split(0, key).unwrap().unwrap();
            assert_eq!(sub.rank(), 1 - comm.rank());
        });
    }

    #[test]
    fn test_alloc_shared_is_shared() {
        run_ranks(3, |comm| {
            let region = comm.alloc_shared(1024, 0).unwrap();
            assert_eq!(region.master_rank(), 0);
            // every rank bumps the counter once; total visible everywhere
            region.reserve_file_space(100);
            comm.barrier().unwrap();
            assert_eq!(region.file_space_used(), 300);
        });
    }

    #[test]
    fn test_local_endpoints_node_groups() {
        let endpoints = local_endpoints(4, 2);
        assert_eq!(endpoints.len(), 4);
        assert_eq!(endpoints[0].node.size(), 2);
        assert_eq!(endpoints[3].node_rank, 1);

        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|ep| {
                std::thread::spawn(move || {
                    ep.world.barrier().unwrap();
                    ep.node.barrier().unwrap();
                    assert_eq!(ep.node.rank(), ep.world.rank() % 2);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
