//! The per-image transport endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use coral_core::transport::{
    AtomicOp, AtomicWidth, BasePtr, CollDatatype, CollOp, Comm, DynAddr, LockMode, RequestId,
    Transport, TransportError, TransportResult, WaitAny, WinAllocation, WinId,
};

use crate::world::{DynRange, Msg, RecvState, Region, WindowState, WorldState, DYN_WIN, WORLD_COMM};

/// One image's endpoint into an in-process world.
pub struct ShmemTransport {
    world: Arc<WorldState>,
    rank: usize,
    /// Epoch modes this image currently holds, per (window, target).
    held: Mutex<HashMap<(u64, usize), LockMode>>,
}

impl ShmemTransport {
    pub(crate) fn new(world: Arc<WorldState>, rank: usize) -> Self {
        Self {
            world,
            rank,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// This endpoint's world rank.
    pub fn world_rank(&self) -> usize {
        self.rank
    }

    fn check_alive(&self, rank: usize) -> TransportResult<()> {
        if self.world.is_failed(rank) {
            Err(TransportError::proc_failed(format!(
                "rank {rank} has failed"
            )))
        } else {
            Ok(())
        }
    }

    /// Resolve `(win, rank, offset, len)` to a raw pointer, with bounds
    /// checks. Dynamic-window offsets are absolute attached addresses.
    fn resolve(
        &self,
        win: WinId,
        rank: usize,
        offset: u64,
        len: usize,
    ) -> TransportResult<*mut u8> {
        if win == DYN_WIN {
            let ranges = self.world.dyn_ranges.lock();
            let attached = ranges.iter().any(|r| {
                r.owner == rank
                    && offset >= r.addr
                    && offset.saturating_add(len as u64) <= r.addr + r.len as u64
            });
            if !attached {
                return Err(TransportError::other(format!(
                    "address {offset:#x}+{len} not attached on rank {rank}"
                )));
            }
            return Ok(offset as usize as *mut u8);
        }
        let windows = self.world.windows.lock();
        let state = windows
            .get(&win.0)
            .ok_or_else(|| TransportError::other(format!("unknown window {}", win.0)))?;
        let region = state
            .regions
            .get(&rank)
            .ok_or_else(|| TransportError::other(format!("rank {rank} not in window {}", win.0)))?;
        if offset as usize + len > region.len() {
            return Err(TransportError::other(format!(
                "access [{offset}, +{len}) beyond window of {} bytes",
                region.len()
            )));
        }
        // SAFETY of use: callers touch the bytes only inside an epoch.
        Ok(unsafe { region.ptr().add(offset as usize) })
    }

    fn region_lock(&self, win: WinId, rank: usize) -> Option<Arc<crate::world::RegionLock>> {
        if win == DYN_WIN {
            return self.world.dyn_locks.get(rank).cloned();
        }
        self.world
            .windows
            .lock()
            .get(&win.0)
            .and_then(|w| w.locks.get(&rank).cloned())
    }
}

impl Transport for ShmemTransport {
    // ------------------------------------------------------------------
    // Identity and lifecycle
    // ------------------------------------------------------------------

    fn world(&self) -> Comm {
        WORLD_COMM
    }

    fn rank(&self, _comm: Comm) -> TransportResult<usize> {
        Ok(self.rank)
    }

    fn size(&self, comm: Comm) -> TransportResult<usize> {
        Ok(self.world.members_of(comm)?.len())
    }

    fn dup(&self, comm: Comm) -> TransportResult<Comm> {
        let members = self.world.members_of(comm)?;
        let out = self.world.rendezvous(comm, self.rank, Vec::new(), false, {
            let world = Arc::clone(&self.world);
            move |_| world.new_comm(members).0.to_ne_bytes().to_vec()
        })?;
        Ok(Comm(u32::from_ne_bytes(out[..4].try_into().unwrap())))
    }

    fn free_comm(&self, comm: Comm) {
        // Communicators are tiny; they are retained until the world drops.
        trace!(rank = self.rank, comm = comm.0, "free_comm");
    }

    fn initialized_externally(&self) -> bool {
        false
    }

    fn finalize(&self) {
        debug!(rank = self.rank, "transport finalize");
    }

    fn abort(&self, code: i32) -> ! {
        self.world.mark_failed(self.rank);
        panic!("image rank {} aborted with exit code {}", self.rank, code);
    }

    // ------------------------------------------------------------------
    // Windows
    // ------------------------------------------------------------------

    fn win_allocate(&self, comm: Comm, size: usize) -> TransportResult<WinAllocation> {
        let payload = (size as u64).to_ne_bytes().to_vec();
        let world = Arc::clone(&self.world);
        let out = self
            .world
            .rendezvous(comm, self.rank, payload, false, move |contribs| {
                let id = world.next_win.fetch_add(1, Ordering::Relaxed);
                let mut regions = HashMap::new();
                let mut locks = HashMap::new();
                for (rank, bytes) in &contribs {
                    let sz = u64::from_ne_bytes(bytes[..8].try_into().unwrap()) as usize;
                    regions.insert(*rank, Region::new(sz));
                    locks.insert(*rank, Arc::new(crate::world::RegionLock::default()));
                }
                world.windows.lock().insert(
                    id,
                    WindowState {
                        regions,
                        locks,
                        comm,
                    },
                );
                id.to_ne_bytes().to_vec()
            })?;
        let win = WinId(u64::from_ne_bytes(out[..8].try_into().unwrap()));
        let base = self.resolve(win, self.rank, 0, 0)?;
        trace!(rank = self.rank, win = win.0, size, "window allocated");
        Ok(WinAllocation {
            win,
            base: BasePtr(base),
        })
    }

    fn win_free(&self, win: WinId) -> TransportResult<()> {
        let comm = self
            .world
            .windows
            .lock()
            .get(&win.0)
            .map(|w| w.comm)
            .ok_or_else(|| TransportError::other(format!("unknown window {}", win.0)))?;
        let world = Arc::clone(&self.world);
        self.world
            .rendezvous(comm, self.rank, Vec::new(), true, move |_| {
                world.windows.lock().remove(&win.0);
                Vec::new()
            })?;
        Ok(())
    }

    fn dynamic_win(&self) -> WinId {
        DYN_WIN
    }

    fn dyn_attach(&self, ptr: *mut u8, len: usize) -> TransportResult<DynAddr> {
        let addr = ptr as u64;
        self.world.dyn_ranges.lock().push(DynRange {
            owner: self.rank,
            addr,
            len,
        });
        trace!(rank = self.rank, addr, len, "dyn_attach");
        Ok(addr)
    }

    fn dyn_detach(&self, addr: DynAddr) -> TransportResult<()> {
        let mut ranges = self.world.dyn_ranges.lock();
        let before = ranges.len();
        ranges.retain(|r| !(r.owner == self.rank && r.addr == addr));
        if ranges.len() == before {
            return Err(TransportError::other(format!(
                "address {addr:#x} was not attached"
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Epochs
    // ------------------------------------------------------------------

    fn win_lock(&self, mode: LockMode, image: usize, win: WinId) {
        if let Some(lock) = self.region_lock(win, image) {
            match mode {
                LockMode::Shared => lock.lock_shared(),
                LockMode::Exclusive => lock.lock_exclusive(),
            }
            self.held.lock().insert((win.0, image), mode);
        }
    }

    fn win_unlock(&self, image: usize, win: WinId) {
        let mode = self.held.lock().remove(&(win.0, image));
        if let (Some(mode), Some(lock)) = (mode, self.region_lock(win, image)) {
            match mode {
                LockMode::Shared => lock.unlock_shared(),
                LockMode::Exclusive => lock.unlock_exclusive(),
            }
        }
    }

    fn win_lock_all(&self, win: WinId) {
        for image in 0..self.world.num_images {
            self.win_lock(LockMode::Shared, image, win);
        }
    }

    fn win_unlock_all(&self, win: WinId) {
        for image in 0..self.world.num_images {
            self.win_unlock(image, win);
        }
    }

    fn win_flush(&self, _image: usize, _win: WinId) {
        // Stores are immediate in shared memory.
    }

    fn win_sync(&self, _win: WinId) {
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // One-sided data movement
    // ------------------------------------------------------------------

    fn put(&self, win: WinId, image: usize, offset: u64, data: &[u8]) -> TransportResult<()> {
        self.check_alive(image)?;
        if data.is_empty() {
            return Ok(());
        }
        let ptr = self.resolve(win, image, offset, data.len())?;
        // SAFETY: resolve bounds-checked the range; the caller holds an
        // epoch on (win, image) serializing conflicting access.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        Ok(())
    }

    fn get(&self, win: WinId, image: usize, offset: u64, out: &mut [u8]) -> TransportResult<()> {
        self.check_alive(image)?;
        if out.is_empty() {
            return Ok(());
        }
        let ptr = self.resolve(win, image, offset, out.len())?;
        // SAFETY: as in `put`.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn put_indexed(
        &self,
        win: WinId,
        image: usize,
        elem_size: usize,
        offsets: &[u64],
        data: &[u8],
    ) -> TransportResult<()> {
        self.check_alive(image)?;
        for (i, &off) in offsets.iter().enumerate() {
            let ptr = self.resolve(win, image, off, elem_size)?;
            // SAFETY: as in `put`, per element.
            unsafe {
                std::ptr::copy_nonoverlapping(data[i * elem_size..].as_ptr(), ptr, elem_size);
            }
        }
        Ok(())
    }

    fn get_indexed(
        &self,
        win: WinId,
        image: usize,
        elem_size: usize,
        offsets: &[u64],
        out: &mut [u8],
    ) -> TransportResult<()> {
        self.check_alive(image)?;
        for (i, &off) in offsets.iter().enumerate() {
            let ptr = self.resolve(win, image, off, elem_size)?;
            // SAFETY: as in `get`, per element.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, out[i * elem_size..].as_mut_ptr(), elem_size);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Window atomics
    // ------------------------------------------------------------------

    fn atomic_cas(
        &self,
        win: WinId,
        image: usize,
        offset: u64,
        compare: i64,
        newval: i64,
        width: AtomicWidth,
    ) -> TransportResult<i64> {
        self.check_alive(image)?;
        let ptr = self.resolve(win, image, offset, width.bytes())?;
        if offset % width.bytes() as u64 != 0 {
            return Err(TransportError::other("misaligned atomic access"));
        }
        // SAFETY: the lane is inside the region, aligned, and only ever
        // accessed atomically by the runtime's atomic entry points.
        let old = match width {
            AtomicWidth::W4 => {
                let a = unsafe { AtomicI32::from_ptr(ptr as *mut i32) };
                match a.compare_exchange(compare as i32, newval as i32, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(v) | Err(v) => v as i64,
                }
            }
            AtomicWidth::W8 => {
                let a = unsafe { AtomicI64::from_ptr(ptr as *mut i64) };
                match a.compare_exchange(compare, newval, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(v) | Err(v) => v,
                }
            }
        };
        Ok(old)
    }

    fn atomic_fetch_op(
        &self,
        win: WinId,
        image: usize,
        offset: u64,
        op: AtomicOp,
        operand: i64,
        width: AtomicWidth,
    ) -> TransportResult<i64> {
        self.check_alive(image)?;
        let ptr = self.resolve(win, image, offset, width.bytes())?;
        if offset % width.bytes() as u64 != 0 {
            return Err(TransportError::other("misaligned atomic access"));
        }
        // SAFETY: as in `atomic_cas`.
        let old = match width {
            AtomicWidth::W4 => {
                let a = unsafe { AtomicI32::from_ptr(ptr as *mut i32) };
                let v = operand as i32;
                (match op {
                    AtomicOp::NoOp => a.load(Ordering::SeqCst),
                    AtomicOp::Replace => a.swap(v, Ordering::SeqCst),
                    AtomicOp::Add => a.fetch_add(v, Ordering::SeqCst),
                    AtomicOp::And => a.fetch_and(v, Ordering::SeqCst),
                    AtomicOp::Or => a.fetch_or(v, Ordering::SeqCst),
                    AtomicOp::Xor => a.fetch_xor(v, Ordering::SeqCst),
                }) as i64
            }
            AtomicWidth::W8 => {
                let a = unsafe { AtomicI64::from_ptr(ptr as *mut i64) };
                match op {
                    AtomicOp::NoOp => a.load(Ordering::SeqCst),
                    AtomicOp::Replace => a.swap(operand, Ordering::SeqCst),
                    AtomicOp::Add => a.fetch_add(operand, Ordering::SeqCst),
                    AtomicOp::And => a.fetch_and(operand, Ordering::SeqCst),
                    AtomicOp::Or => a.fetch_or(operand, Ordering::SeqCst),
                    AtomicOp::Xor => a.fetch_xor(operand, Ordering::SeqCst),
                }
            }
        };
        Ok(old)
    }

    // ------------------------------------------------------------------
    // Tagged messaging
    // ------------------------------------------------------------------

    fn isend_i32(&self, _comm: Comm, dest: usize, tag: i32, value: i32) -> TransportResult<()> {
        self.check_alive(dest)?;
        let mb = &self.world.mailboxes[dest];
        let mut inner = mb.inner.lock();
        // Complete the oldest matching posted receive, else queue.
        let slot = inner
            .recvs
            .iter_mut()
            .find(|(_, r)| r.value.is_none() && r.src == self.rank && r.tag == tag);
        if let Some((_, r)) = slot {
            r.value = Some(value);
        } else {
            inner.msgs.push_back(Msg {
                src: self.rank,
                tag,
                value,
            });
        }
        mb.cv.notify_all();
        Ok(())
    }

    fn irecv_i32(&self, _comm: Comm, src: usize, tag: i32) -> TransportResult<RequestId> {
        let id = self.world.next_req.fetch_add(1, Ordering::Relaxed);
        let mb = &self.world.mailboxes[self.rank];
        let mut inner = mb.inner.lock();
        // An already-delivered message completes the receive immediately.
        let pos = inner.msgs.iter().position(|m| m.src == src && m.tag == tag);
        let value = pos.and_then(|at| inner.msgs.remove(at)).map(|m| m.value);
        inner.recvs.insert(id, RecvState { src, tag, value });
        Ok(RequestId(id))
    }

    fn wait_any(&self, reqs: &mut [Option<RequestId>]) -> TransportResult<WaitAny> {
        let mb = &self.world.mailboxes[self.rank];
        let mut inner = mb.inner.lock();
        loop {
            for (index, slot) in reqs.iter_mut().enumerate() {
                let id = match slot {
                    Some(r) => r.0,
                    None => continue,
                };
                if let Some(state) = inner.recvs.get(&id) {
                    if let Some(value) = state.value {
                        inner.recvs.remove(&id);
                        *slot = None;
                        return Ok(WaitAny { index, value });
                    }
                    if self.world.is_failed(state.src) {
                        return Err(TransportError::proc_failed(format!(
                            "rank {} failed while awaited",
                            state.src
                        )));
                    }
                }
            }
            mb.cv.wait(&mut inner);
        }
    }

    fn test(&self, req: RequestId) -> TransportResult<Option<i32>> {
        // An alive watch reports unacknowledged failures.
        if let Some(comm) = self.world.watches.lock().get(&req.0).copied() {
            let members = self.world.members_of(Comm(comm))?;
            let acked = self.world.acked[self.rank].lock();
            for m in members {
                if m != self.rank && self.world.is_failed(m) && !acked.contains(&m) {
                    return Err(TransportError::proc_failed(format!("rank {m} has failed")));
                }
            }
            return Ok(None);
        }
        let mb = &self.world.mailboxes[self.rank];
        let mut inner = mb.inner.lock();
        match inner.recvs.get(&req.0) {
            Some(state) if state.value.is_some() => {
                let value = state.value;
                inner.recvs.remove(&req.0);
                Ok(value)
            }
            Some(state) if self.world.is_failed(state.src) => Err(TransportError::proc_failed(
                format!("rank {} failed while awaited", state.src),
            )),
            _ => Ok(None),
        }
    }

    fn cancel(&self, req: RequestId) {
        if self.world.watches.lock().remove(&req.0).is_some() {
            return;
        }
        self.world.mailboxes[self.rank]
            .inner
            .lock()
            .recvs
            .remove(&req.0);
    }

    // ------------------------------------------------------------------
    // Collectives
    // ------------------------------------------------------------------

    fn barrier(&self, comm: Comm) -> TransportResult<()> {
        self.world
            .rendezvous(comm, self.rank, Vec::new(), false, |_| Vec::new())?;
        Ok(())
    }

    fn broadcast(&self, comm: Comm, root: usize, data: &mut [u8]) -> TransportResult<()> {
        let out = self
            .world
            .rendezvous(comm, self.rank, data.to_vec(), false, move |contribs| {
                contribs
                    .into_iter()
                    .find(|(rank, _)| *rank == root)
                    .map(|(_, bytes)| bytes)
                    .unwrap_or_default()
            })?;
        if out.len() != data.len() {
            return Err(TransportError::other("broadcast length mismatch"));
        }
        data.copy_from_slice(&out);
        Ok(())
    }

    fn reduce(
        &self,
        comm: Comm,
        data: &mut [u8],
        dtype: CollDatatype,
        op: CollOp<'_>,
        root: Option<usize>,
    ) -> TransportResult<()> {
        enum Folder<'a> {
            Builtin(BuiltinOp),
            User(&'a (dyn Fn(&[u8], &mut [u8]) + Sync)),
        }
        let folder = match op {
            CollOp::Sum => Folder::Builtin(BuiltinOp::Sum),
            CollOp::Min => Folder::Builtin(BuiltinOp::Min),
            CollOp::Max => Folder::Builtin(BuiltinOp::Max),
            CollOp::User(f) => Folder::User(f),
        };

        let mut fold_err = None;
        let out = {
            let fold_err = &mut fold_err;
            self.world
                .rendezvous(comm, self.rank, data.to_vec(), false, move |contribs| {
                    let mut iter = contribs.into_iter();
                    let (_, acc) = iter.next().expect("at least one contribution");
                    let mut acc = acc;
                    for (_, mut next) in iter {
                        match &folder {
                            Folder::Builtin(b) => {
                                if let Err(e) = fold_builtin(dtype, *b, &acc, &mut next) {
                                    *fold_err = Some(e);
                                    return Vec::new();
                                }
                            }
                            Folder::User(f) => f(&acc, &mut next),
                        }
                        acc = next;
                    }
                    acc
                })?
        };
        if let Some(e) = fold_err {
            return Err(e);
        }
        let copy_out = match root {
            None => true,
            Some(r) => r == self.rank,
        };
        if copy_out {
            if out.len() != data.len() {
                return Err(TransportError::other("reduction length mismatch"));
            }
            data.copy_from_slice(&out);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failure extension
    // ------------------------------------------------------------------

    fn failure_support(&self) -> bool {
        true
    }

    fn alive_watch(&self, comm: Comm) -> TransportResult<RequestId> {
        let id = self.world.next_req.fetch_add(1, Ordering::Relaxed);
        self.world.watches.lock().insert(id, comm.0);
        Ok(RequestId(id))
    }

    fn acked_failures(&self, comm: Comm) -> TransportResult<Vec<usize>> {
        let members = self.world.members_of(comm)?;
        let mut acked = self.world.acked[self.rank].lock();
        let mut out = Vec::new();
        for m in members {
            if self.world.is_failed(m) {
                acked.insert(m);
                out.push(m);
            }
        }
        Ok(out)
    }

    fn shrink(&self, comm: Comm) -> TransportResult<Comm> {
        let members = self.world.members_of(comm)?;
        let world = Arc::clone(&self.world);
        let out = self
            .world
            .rendezvous(comm, self.rank, Vec::new(), true, move |_| {
                let survivors: Vec<usize> = {
                    let failed = world.failed.lock();
                    members.iter().copied().filter(|m| !failed.contains(m)).collect()
                };
                world.new_comm(survivors).0.to_ne_bytes().to_vec()
            })?;
        Ok(Comm(u32::from_ne_bytes(out[..4].try_into().unwrap())))
    }

    fn split(&self, comm: Comm, color: i32, key: i32) -> TransportResult<Comm> {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&color.to_ne_bytes());
        payload.extend_from_slice(&key.to_ne_bytes());
        let world = Arc::clone(&self.world);
        let out = self
            .world
            .rendezvous(comm, self.rank, payload, false, move |contribs| {
                // Group by color, order by (key, rank), one comm per group.
                let mut groups: HashMap<i32, Vec<(i32, usize)>> = HashMap::new();
                for (rank, bytes) in &contribs {
                    let c = i32::from_ne_bytes(bytes[..4].try_into().unwrap());
                    let k = i32::from_ne_bytes(bytes[4..8].try_into().unwrap());
                    groups.entry(c).or_default().push((k, *rank));
                }
                let mut result = Vec::new();
                let mut colors: Vec<i32> = groups.keys().copied().collect();
                colors.sort_unstable();
                for c in colors {
                    let mut group = groups.remove(&c).unwrap();
                    group.sort_unstable();
                    let members: Vec<usize> = group.into_iter().map(|(_, r)| r).collect();
                    let id = world.new_comm(members).0;
                    result.extend_from_slice(&c.to_ne_bytes());
                    result.extend_from_slice(&id.to_ne_bytes());
                }
                result
            })?;
        for pair in out.chunks_exact(8) {
            let c = i32::from_ne_bytes(pair[..4].try_into().unwrap());
            if c == color {
                return Ok(Comm(u32::from_ne_bytes(pair[4..8].try_into().unwrap())));
            }
        }
        Err(TransportError::other("split produced no communicator"))
    }

    fn agree(&self, comm: Comm, flag: &mut i32) -> TransportResult<()> {
        let payload = flag.to_ne_bytes().to_vec();
        let out = self
            .world
            .rendezvous(comm, self.rank, payload, true, |contribs| {
                let mut acc = -1i32;
                for (_, bytes) in &contribs {
                    acc &= i32::from_ne_bytes(bytes[..4].try_into().unwrap());
                }
                acc.to_ne_bytes().to_vec()
            })?;
        *flag = i32::from_ne_bytes(out[..4].try_into().unwrap());
        Ok(())
    }

    fn kill_self(&self) {
        debug!(rank = self.rank, "kill_self");
        self.world.mark_failed(self.rank);
    }
}

// ============================================================================
// Built-in reduction folds
// ============================================================================

#[derive(Clone, Copy)]
enum BuiltinOp {
    Sum,
    Min,
    Max,
}

macro_rules! fold_typed {
    ($ty:ty, $op:expr, $src:expr, $dst:expr) => {{
        let lane = std::mem::size_of::<$ty>();
        for (s, d) in $src.chunks_exact(lane).zip($dst.chunks_exact_mut(lane)) {
            let a = <$ty>::from_ne_bytes(s.try_into().unwrap());
            let b = <$ty>::from_ne_bytes(d.try_into().unwrap());
            let r = match $op {
                BuiltinOp::Sum => a + b,
                BuiltinOp::Min => if a < b { a } else { b },
                BuiltinOp::Max => if a > b { a } else { b },
            };
            d.copy_from_slice(&r.to_ne_bytes());
        }
    }};
}

/// Fold `src` into `dst` with a built-in operator. `dst` accumulates.
fn fold_builtin(
    dtype: CollDatatype,
    op: BuiltinOp,
    src: &[u8],
    dst: &mut [u8],
) -> TransportResult<()> {
    match dtype {
        CollDatatype::Int(1) => fold_typed!(i8, op, src, dst),
        CollDatatype::Int(2) => fold_typed!(i16, op, src, dst),
        CollDatatype::Int(4) => fold_typed!(i32, op, src, dst),
        CollDatatype::Int(8) => fold_typed!(i64, op, src, dst),
        CollDatatype::Int(16) => fold_typed!(i128, op, src, dst),
        CollDatatype::Float(4) => fold_typed!(f32, op, src, dst),
        CollDatatype::Float(8) => fold_typed!(f64, op, src, dst),
        CollDatatype::Complex(kind) if matches!(op, BuiltinOp::Sum) => {
            // Component-wise sum over the (re, im) lanes.
            match kind {
                4 => fold_typed!(f32, BuiltinOp::Sum, src, dst),
                8 => fold_typed!(f64, BuiltinOp::Sum, src, dst),
                _ => {
                    return Err(TransportError::other(format!(
                        "no builtin reduction for complex kind {kind}"
                    )))
                }
            }
        }
        other => {
            return Err(TransportError::other(format!(
                "no builtin reduction for {other:?}"
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::ShmemWorld;

    fn two_images() -> (Arc<ShmemTransport>, Arc<ShmemTransport>) {
        let world = ShmemWorld::new(2);
        (world.transport(0), world.transport(1))
    }

    #[test]
    fn test_window_put_get_across_images() {
        let (t0, t1) = two_images();
        let h0 = std::thread::spawn(move || {
            let alloc = t0.win_allocate(WORLD_COMM, 64).unwrap();
            t0.barrier(WORLD_COMM).unwrap();
            // Read what rank 1 put into our region.
            t0.barrier(WORLD_COMM).unwrap();
            let mut buf = [0u8; 4];
            t0.get(alloc.win, 0, 8, &mut buf).unwrap();
            i32::from_ne_bytes(buf)
        });
        let h1 = std::thread::spawn(move || {
            let alloc = t1.win_allocate(WORLD_COMM, 64).unwrap();
            t1.barrier(WORLD_COMM).unwrap();
            t1.win_lock(LockMode::Exclusive, 0, alloc.win);
            t1.put(alloc.win, 0, 8, &42i32.to_ne_bytes()).unwrap();
            t1.win_unlock(0, alloc.win);
            t1.barrier(WORLD_COMM).unwrap();
        });
        h1.join().unwrap();
        assert_eq!(h0.join().unwrap(), 42);
    }

    #[test]
    fn test_messaging_matches_by_tag() {
        let (t0, t1) = two_images();
        let h0 = std::thread::spawn(move || {
            let r_a = t0.irecv_i32(WORLD_COMM, 1, 7).unwrap();
            let r_b = t0.irecv_i32(WORLD_COMM, 1, 9).unwrap();
            let mut reqs = [Some(r_a), Some(r_b)];
            let first = t0.wait_any(&mut reqs).unwrap();
            let second = t0.wait_any(&mut reqs).unwrap();
            (first, second)
        });
        let h1 = std::thread::spawn(move || {
            t1.isend_i32(WORLD_COMM, 0, 9, 900).unwrap();
            t1.isend_i32(WORLD_COMM, 0, 7, 700).unwrap();
        });
        h1.join().unwrap();
        let (first, second) = h0.join().unwrap();
        let mut got = [(first.index, first.value), (second.index, second.value)];
        got.sort_unstable();
        assert_eq!(got, [(0, 700), (1, 900)]);
    }

    #[test]
    fn test_reduce_sum_all() {
        let (t0, t1) = two_images();
        let run = |t: Arc<ShmemTransport>, v: i32| {
            std::thread::spawn(move || {
                let mut data = v.to_ne_bytes().to_vec();
                t.reduce(WORLD_COMM, &mut data, CollDatatype::Int(4), CollOp::Sum, None)
                    .unwrap();
                i32::from_ne_bytes(data[..4].try_into().unwrap())
            })
        };
        let h0 = run(t0, 3);
        let h1 = run(t1, 4);
        assert_eq!(h0.join().unwrap(), 7);
        assert_eq!(h1.join().unwrap(), 7);
    }

    #[test]
    fn test_atomic_cas_and_fetch() {
        let world = ShmemWorld::new(1);
        let t = world.transport(0);
        let alloc = t.win_allocate(WORLD_COMM, 16).unwrap();

        let old = t
            .atomic_cas(alloc.win, 0, 0, 0, 5, AtomicWidth::W4)
            .unwrap();
        assert_eq!(old, 0);
        let old = t
            .atomic_fetch_op(alloc.win, 0, 0, AtomicOp::Add, 2, AtomicWidth::W4)
            .unwrap();
        assert_eq!(old, 5);
        let now = t
            .atomic_fetch_op(alloc.win, 0, 0, AtomicOp::NoOp, 0, AtomicWidth::W4)
            .unwrap();
        assert_eq!(now, 7);
    }

    #[test]
    fn test_failure_breaks_barrier() {
        let (t0, t1) = two_images();
        let h0 = std::thread::spawn(move || t0.barrier(WORLD_COMM));
        let h1 = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            t1.kill_self();
        });
        h1.join().unwrap();
        let err = h0.join().unwrap().unwrap_err();
        assert!(err.is_proc_failed());
    }

    #[test]
    fn test_shrink_excludes_failed() {
        let world = ShmemWorld::new(3);
        let t0 = world.transport(0);
        let t1 = world.transport(1);
        let t2 = world.transport(2);
        t2.kill_self();

        let h0 = std::thread::spawn(move || t0.shrink(WORLD_COMM).unwrap());
        let h1 = std::thread::spawn(move || t1.shrink(WORLD_COMM).unwrap());
        let c0 = h0.join().unwrap();
        let c1 = h1.join().unwrap();
        assert_eq!(c0, c1);
        let t3 = world.transport(0);
        assert_eq!(t3.size(c0).unwrap(), 2);
    }
}
