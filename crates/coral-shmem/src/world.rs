//! Shared state of an in-process image world.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use coral_core::transport::{Comm, TransportError, WinId};

use crate::transport::ShmemTransport;

/// The world communicator.
pub(crate) const WORLD_COMM: Comm = Comm(0);
/// The process-wide dynamic window.
pub(crate) const DYN_WIN: WinId = WinId(0);

// ============================================================================
// Window regions
// ============================================================================

/// One image's share of a window: an 8-aligned, zero-initialized region.
pub(crate) struct Region {
    words: std::cell::UnsafeCell<Box<[u64]>>,
    len: usize,
}

// SAFETY: concurrent access to the bytes is governed by the window's epoch
// locks; the runtime never issues conflicting accesses outside an epoch.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn new(len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(8)].into_boxed_slice();
        Self {
            words: std::cell::UnsafeCell::new(words),
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn ptr(&self) -> *mut u8 {
        // SAFETY: the box outlives the region; we only hand out the raw base.
        unsafe { (*self.words.get()).as_mut_ptr() as *mut u8 }
    }
}

/// A shared/exclusive lock whose acquire and release are separate calls, as
/// passive-target epochs require.
#[derive(Default)]
pub(crate) struct RegionLock {
    state: Mutex<LockState>,
    cv: Condvar,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    exclusive: bool,
}

impl RegionLock {
    pub(crate) fn lock_shared(&self) {
        let mut s = self.state.lock();
        while s.exclusive {
            self.cv.wait(&mut s);
        }
        s.readers += 1;
    }

    pub(crate) fn lock_exclusive(&self) {
        let mut s = self.state.lock();
        while s.exclusive || s.readers > 0 {
            self.cv.wait(&mut s);
        }
        s.exclusive = true;
    }

    pub(crate) fn unlock_shared(&self) {
        let mut s = self.state.lock();
        s.readers = s.readers.saturating_sub(1);
        if s.readers == 0 {
            self.cv.notify_all();
        }
    }

    pub(crate) fn unlock_exclusive(&self) {
        let mut s = self.state.lock();
        s.exclusive = false;
        self.cv.notify_all();
    }
}

pub(crate) struct WindowState {
    pub(crate) regions: HashMap<usize, Region>,
    pub(crate) locks: HashMap<usize, Arc<RegionLock>>,
    pub(crate) comm: Comm,
}

/// A range of local memory attached to the dynamic window.
pub(crate) struct DynRange {
    pub(crate) owner: usize,
    pub(crate) addr: u64,
    pub(crate) len: usize,
}

// ============================================================================
// Tagged messaging
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) struct Msg {
    pub(crate) src: usize,
    pub(crate) tag: i32,
    pub(crate) value: i32,
}

#[derive(Debug)]
pub(crate) struct RecvState {
    pub(crate) src: usize,
    pub(crate) tag: i32,
    pub(crate) value: Option<i32>,
}

#[derive(Default)]
pub(crate) struct MailboxInner {
    pub(crate) msgs: VecDeque<Msg>,
    /// Pending receives in posting order (request ids are monotonic).
    pub(crate) recvs: BTreeMap<u64, RecvState>,
}

#[derive(Default)]
pub(crate) struct Mailbox {
    pub(crate) inner: Mutex<MailboxInner>,
    pub(crate) cv: Condvar,
}

// ============================================================================
// Collectives
// ============================================================================

#[derive(Default)]
struct CollInner {
    phase: u64,
    arrived: Vec<(usize, Vec<u8>)>,
    /// Finished rounds awaiting readers: phase -> (result, readers left).
    results: HashMap<u64, (Vec<u8>, usize)>,
}

#[derive(Default)]
pub(crate) struct CollState {
    inner: Mutex<CollInner>,
    cv: Condvar,
}

pub(crate) struct CommState {
    /// Member world ranks, ascending.
    pub(crate) members: Vec<usize>,
    pub(crate) coll: Arc<CollState>,
}

// ============================================================================
// The world
// ============================================================================

pub(crate) struct WorldState {
    pub(crate) num_images: usize,
    pub(crate) comms: Mutex<HashMap<u32, CommState>>,
    pub(crate) next_comm: AtomicU32,
    pub(crate) windows: Mutex<HashMap<u64, WindowState>>,
    pub(crate) next_win: AtomicU64,
    pub(crate) dyn_ranges: Mutex<Vec<DynRange>>,
    pub(crate) dyn_locks: Vec<Arc<RegionLock>>,
    pub(crate) mailboxes: Vec<Mailbox>,
    pub(crate) next_req: AtomicU64,
    pub(crate) failed: Mutex<HashSet<usize>>,
    /// Failures each image has acknowledged.
    pub(crate) acked: Vec<Mutex<HashSet<usize>>>,
    /// Outstanding alive watches: request id -> watched communicator.
    pub(crate) watches: Mutex<HashMap<u64, u32>>,
}

impl WorldState {
    pub(crate) fn members_of(&self, comm: Comm) -> Result<Vec<usize>, TransportError> {
        self.comms
            .lock()
            .get(&comm.0)
            .map(|c| c.members.clone())
            .ok_or_else(|| TransportError::other(format!("unknown communicator {}", comm.0)))
    }

    pub(crate) fn coll_of(&self, comm: Comm) -> Result<(Vec<usize>, Arc<CollState>), TransportError> {
        self.comms
            .lock()
            .get(&comm.0)
            .map(|c| (c.members.clone(), Arc::clone(&c.coll)))
            .ok_or_else(|| TransportError::other(format!("unknown communicator {}", comm.0)))
    }

    pub(crate) fn new_comm(&self, members: Vec<usize>) -> Comm {
        let id = self.next_comm.fetch_add(1, Ordering::Relaxed);
        self.comms.lock().insert(
            id,
            CommState {
                members,
                coll: Arc::new(CollState::default()),
            },
        );
        Comm(id)
    }

    pub(crate) fn is_failed(&self, rank: usize) -> bool {
        self.failed.lock().contains(&rank)
    }

    fn live_count(&self, members: &[usize]) -> usize {
        let failed = self.failed.lock();
        members.iter().filter(|m| !failed.contains(m)).count()
    }

    fn any_failed(&self, members: &[usize]) -> bool {
        let failed = self.failed.lock();
        members.iter().any(|m| failed.contains(m))
    }

    /// Mark an image failed and wake everything that might be waiting on it.
    pub(crate) fn mark_failed(&self, rank: usize) {
        debug!(rank, "image marked failed");
        self.failed.lock().insert(rank);
        for mb in &self.mailboxes {
            let _guard = mb.inner.lock();
            mb.cv.notify_all();
        }
        // Collect first: a rendezvous completion may hold a collective mutex
        // while registering a communicator, so never hold `comms` across the
        // collective locks.
        let colls: Vec<Arc<CollState>> = self
            .comms
            .lock()
            .values()
            .map(|c| Arc::clone(&c.coll))
            .collect();
        for coll in colls {
            let _guard = coll.inner.lock();
            coll.cv.notify_all();
        }
    }

    /// One round of a collective: every live member contributes a payload,
    /// the last arrival runs `finish` over the contributions (ascending by
    /// world rank) and everyone receives the finished bytes.
    ///
    /// Without `tolerate_failures`, a member failing before the round
    /// completes aborts it with a `ProcFailed` error on every waiter.
    pub(crate) fn rendezvous(
        &self,
        comm: Comm,
        my_rank: usize,
        payload: Vec<u8>,
        tolerate_failures: bool,
        finish: impl FnOnce(Vec<(usize, Vec<u8>)>) -> Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        let (members, coll) = self.coll_of(comm)?;
        let mut finish = Some(finish);

        let mut inner = coll.inner.lock();
        let gen = inner.phase;
        inner.arrived.push((my_rank, payload));

        let mut complete = |inner: &mut CollInner| {
            let mut contribs = std::mem::take(&mut inner.arrived);
            contribs.sort_by_key(|(rank, _)| *rank);
            let readers = contribs.len();
            let result = (finish.take().expect("finish consumed once"))(contribs);
            inner.results.insert(gen, (result, readers));
            inner.phase += 1;
        };

        // A failure-tolerant round completes over the survivors; a normal
        // round needs every member.
        let needed = if tolerate_failures {
            self.live_count(&members)
        } else {
            members.len()
        };
        if inner.arrived.len() >= needed {
            complete(&mut inner);
            coll.cv.notify_all();
        } else {
            loop {
                if !tolerate_failures && self.any_failed(&members) {
                    if inner.phase == gen {
                        // Withdraw so the round cannot complete over a
                        // stale contribution.
                        inner.arrived.retain(|(rank, _)| *rank != my_rank);
                        coll.cv.notify_all();
                        return Err(TransportError::proc_failed("peer failed in collective"));
                    }
                    break;
                }
                if inner.phase > gen {
                    break;
                }
                if tolerate_failures && inner.arrived.len() >= self.live_count(&members) {
                    complete(&mut inner);
                    coll.cv.notify_all();
                    break;
                }
                coll.cv.wait(&mut inner);
            }
        }

        let entry = inner
            .results
            .get_mut(&gen)
            .ok_or_else(|| TransportError::proc_failed("collective round aborted"))?;
        let out = entry.0.clone();
        entry.1 -= 1;
        if entry.1 == 0 {
            inner.results.remove(&gen);
        }
        Ok(out)
    }
}

/// An in-process world of `n` images.
///
/// Create one world per job, hand each image thread its transport via
/// [`ShmemWorld::transport`].
pub struct ShmemWorld {
    state: Arc<WorldState>,
}

impl ShmemWorld {
    /// Create a world of `num_images` images.
    pub fn new(num_images: usize) -> Self {
        assert!(num_images > 0, "a world needs at least one image");
        let state = Arc::new(WorldState {
            num_images,
            comms: Mutex::new(HashMap::new()),
            next_comm: AtomicU32::new(1),
            windows: Mutex::new(HashMap::new()),
            next_win: AtomicU64::new(1),
            dyn_ranges: Mutex::new(Vec::new()),
            dyn_locks: (0..num_images)
                .map(|_| Arc::new(RegionLock::default()))
                .collect(),
            mailboxes: (0..num_images).map(|_| Mailbox::default()).collect(),
            next_req: AtomicU64::new(1),
            failed: Mutex::new(HashSet::new()),
            acked: (0..num_images).map(|_| Mutex::new(HashSet::new())).collect(),
            watches: Mutex::new(HashMap::new()),
        });
        state.comms.lock().insert(
            WORLD_COMM.0,
            CommState {
                members: (0..num_images).collect(),
                coll: Arc::new(CollState::default()),
            },
        );
        Self { state }
    }

    /// Number of images in the world.
    pub fn num_images(&self) -> usize {
        self.state.num_images
    }

    /// The transport endpoint of one image (0-based world rank).
    pub fn transport(&self, rank: usize) -> Arc<ShmemTransport> {
        assert!(rank < self.state.num_images, "rank out of range");
        Arc::new(ShmemTransport::new(Arc::clone(&self.state), rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_is_aligned_and_zeroed() {
        let r = Region::new(37);
        assert_eq!(r.len(), 37);
        assert_eq!(r.ptr() as usize % 8, 0);
        // SAFETY: exclusive access in this test.
        let bytes = unsafe { std::slice::from_raw_parts(r.ptr(), 37) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_region_lock_shared_then_exclusive() {
        let lock = RegionLock::default();
        lock.lock_shared();
        lock.lock_shared();
        lock.unlock_shared();
        lock.unlock_shared();
        lock.lock_exclusive();
        lock.unlock_exclusive();
    }

    #[test]
    fn test_rendezvous_single_member() {
        let world = ShmemWorld::new(1);
        let out = world
            .state
            .rendezvous(WORLD_COMM, 0, vec![7], false, |contribs| {
                assert_eq!(contribs.len(), 1);
                contribs.into_iter().next().unwrap().1
            })
            .unwrap();
        assert_eq!(out, vec![7]);
    }

    #[test]
    fn test_rendezvous_two_threads() {
        let world = ShmemWorld::new(2);
        let s1 = Arc::clone(&world.state);
        let s2 = Arc::clone(&world.state);
        let t1 = std::thread::spawn(move || {
            s1.rendezvous(WORLD_COMM, 0, vec![1], false, |c| {
                c.into_iter().flat_map(|(_, v)| v).collect()
            })
        });
        let t2 = std::thread::spawn(move || {
            s2.rendezvous(WORLD_COMM, 1, vec![2], false, |c| {
                c.into_iter().flat_map(|(_, v)| v).collect()
            })
        });
        assert_eq!(t1.join().unwrap().unwrap(), vec![1, 2]);
        assert_eq!(t2.join().unwrap().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_rendezvous_fails_on_dead_member() {
        let world = ShmemWorld::new(2);
        world.state.mark_failed(1);
        let err = world
            .state
            .rendezvous(WORLD_COMM, 0, vec![], false, |_| Vec::new())
            .unwrap_err();
        assert!(err.is_proc_failed());
    }
}
