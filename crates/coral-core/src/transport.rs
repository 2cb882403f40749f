//! The transport contract: the message-passing/RMA subset the runtime core
//! requires from the layer below it.
//!
//! A transport provides symmetric windows, a process-wide dynamic window,
//! passive-target epochs, one-sided put/get, window atomics, tagged integer
//! messaging, collectives, and (optionally) fault-tolerance extensions.
//! Everything is addressed through opaque integer handles so the trait stays
//! object-safe and tokens can be stable integers.

use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Classification of a transport error, used by the failure manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A member of the communicator failed.
    ProcFailed,
    /// The communicator was revoked during recovery.
    Revoked,
    /// Anything else; not recoverable by shrinking.
    Other,
}

/// An error reported by the transport.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct TransportError {
    /// Error classification.
    pub class: ErrorClass,
    /// Transport-specific message.
    pub message: String,
}

impl TransportError {
    /// A process-failure error.
    pub fn proc_failed(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::ProcFailed,
            message: message.into(),
        }
    }

    /// A revoked-communicator error.
    pub fn revoked(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Revoked,
            message: message.into(),
        }
    }

    /// A generic transport error.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Other,
            message: message.into(),
        }
    }

    /// Whether this error reports a failed peer.
    pub fn is_proc_failed(&self) -> bool {
        matches!(self.class, ErrorClass::ProcFailed)
    }

    /// Whether the failure manager can recover from this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.class, ErrorClass::ProcFailed | ErrorClass::Revoked)
    }
}

/// Handle of an RMA window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WinId(pub u64);

/// Handle of a communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Comm(pub u32);

/// Handle of an outstanding receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// An absolute address in the dynamic window's address space.
pub type DynAddr = u64;

/// The local base pointer of a window region.
///
/// Wrapped so runtime state holding it stays `Send`: the pointer targets
/// window memory whose lifetime the transport guarantees until `win_free`.
#[derive(Debug, Clone, Copy)]
pub struct BasePtr(pub *mut u8);

// SAFETY: the pointee is window memory owned by the transport; the runtime
// only dereferences it from the owning image under an epoch.
unsafe impl Send for BasePtr {}
unsafe impl Sync for BasePtr {}

/// Result of a collective window allocation.
#[derive(Debug, Clone, Copy)]
pub struct WinAllocation {
    /// The window handle, identical on every image.
    pub win: WinId,
    /// Base of this image's region.
    pub base: BasePtr,
}

/// Epoch lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Concurrent access from several origins.
    Shared,
    /// Single-origin access.
    Exclusive,
}

/// Width of a window atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicWidth {
    /// 4-byte lane.
    W4,
    /// 8-byte lane.
    W8,
}

impl AtomicWidth {
    /// Lane width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            AtomicWidth::W4 => 4,
            AtomicWidth::W8 => 8,
        }
    }

    /// Select the lane for an integer kind, if supported.
    pub fn for_kind(kind: u32) -> Option<Self> {
        match kind {
            4 => Some(AtomicWidth::W4),
            8 => Some(AtomicWidth::W8),
            _ => None,
        }
    }
}

/// Operation of a fetching window atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    /// Store the operand, fetch the previous value.
    Replace,
    /// Fetch only; the operand is ignored.
    NoOp,
    /// Fetch-and-add.
    Add,
    /// Fetch-and-bitwise-and.
    And,
    /// Fetch-and-bitwise-or.
    Or,
    /// Fetch-and-bitwise-xor.
    Xor,
}

/// Element datatype of a collective reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollDatatype {
    /// Signed integer of 1/2/4/8/16 bytes.
    Int(u32),
    /// IEEE float of 4/8 bytes.
    Float(u32),
    /// Complex of 2×4 / 2×8 bytes.
    Complex(u32),
    /// A contiguous run of octets, reduced only by user operators.
    Octets(usize),
}

impl CollDatatype {
    /// Element size in bytes.
    pub fn elem_size(self) -> usize {
        match self {
            CollDatatype::Int(k) | CollDatatype::Float(k) => k as usize,
            CollDatatype::Complex(k) => 2 * k as usize,
            CollDatatype::Octets(n) => n,
        }
    }
}

/// Reduction operator passed to the transport.
#[derive(Clone, Copy)]
pub enum CollOp<'a> {
    /// Element-wise sum.
    Sum,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// A user combiner: `combine(contribution, accumulator)` folds the
    /// first buffer into the second, element count implied by the buffers.
    User(&'a (dyn Fn(&[u8], &mut [u8]) + Sync)),
}

/// Completion of a `wait_any`.
#[derive(Debug, Clone, Copy)]
pub struct WaitAny {
    /// Index of the completed request in the caller's slice.
    pub index: usize,
    /// The received value.
    pub value: i32,
}

/// The message-passing/RMA layer the runtime core runs on.
///
/// Image arguments on this trait are 0-based ranks within the given
/// communicator (the runtime's public 1-based indexing is translated before
/// calls land here). All blocking entry points may return a
/// [`TransportError`] with class `ProcFailed` when a peer dies mid-call.
pub trait Transport: Send + Sync {
    // ------------------------------------------------------------------
    // Identity and lifecycle
    // ------------------------------------------------------------------

    /// The world communicator containing every image.
    fn world(&self) -> Comm;

    /// This image's 0-based rank in `comm`.
    fn rank(&self, comm: Comm) -> TransportResult<usize>;

    /// Number of members of `comm`.
    fn size(&self, comm: Comm) -> TransportResult<usize>;

    /// Duplicate a communicator (collective).
    fn dup(&self, comm: Comm) -> TransportResult<Comm>;

    /// Release a duplicated communicator.
    fn free_comm(&self, comm: Comm);

    /// Whether the transport was initialized by the embedder rather than
    /// the runtime; if so, the runtime must not finalize it.
    fn initialized_externally(&self) -> bool;

    /// Finalize the transport. Called only when the runtime owns it.
    fn finalize(&self);

    /// Abort the job; does not return.
    fn abort(&self, code: i32) -> !;

    // ------------------------------------------------------------------
    // Windows
    // ------------------------------------------------------------------

    /// Collectively allocate a symmetric window of `size` bytes per image.
    fn win_allocate(&self, comm: Comm, size: usize) -> TransportResult<WinAllocation>;

    /// Collectively free a window.
    fn win_free(&self, win: WinId) -> TransportResult<()>;

    /// The process-wide dynamic window.
    fn dynamic_win(&self) -> WinId;

    /// Attach local memory to the dynamic window; peers address it by the
    /// returned absolute address.
    fn dyn_attach(&self, ptr: *mut u8, len: usize) -> TransportResult<DynAddr>;

    /// Detach a previously attached range. Detach must precede freeing the
    /// memory.
    fn dyn_detach(&self, addr: DynAddr) -> TransportResult<()>;

    // ------------------------------------------------------------------
    // Epochs
    // ------------------------------------------------------------------

    /// Open a passive-target epoch on `image`'s region of `win`.
    fn win_lock(&self, mode: LockMode, image: usize, win: WinId);

    /// Close the epoch, completing all RMA issued inside it.
    fn win_unlock(&self, image: usize, win: WinId);

    /// Open a shared epoch on every region of `win` at once.
    fn win_lock_all(&self, win: WinId);

    /// Close a `win_lock_all` epoch.
    fn win_unlock_all(&self, win: WinId);

    /// Complete outstanding RMA to `image` without closing the epoch.
    fn win_flush(&self, image: usize, win: WinId);

    /// Synchronize the local copy of the window with its public state.
    fn win_sync(&self, win: WinId);

    // ------------------------------------------------------------------
    // One-sided data movement (inside an epoch)
    // ------------------------------------------------------------------

    /// Contiguous put of `data` at `offset` in `image`'s region.
    fn put(&self, win: WinId, image: usize, offset: u64, data: &[u8]) -> TransportResult<()>;

    /// Contiguous get from `offset` in `image`'s region.
    fn get(&self, win: WinId, image: usize, offset: u64, out: &mut [u8]) -> TransportResult<()>;

    /// Vectored put: element `i` of `data` (elements of `elem_size` bytes)
    /// lands at `offsets[i]`. The committed-datatype strided strategy.
    fn put_indexed(
        &self,
        win: WinId,
        image: usize,
        elem_size: usize,
        offsets: &[u64],
        data: &[u8],
    ) -> TransportResult<()>;

    /// Vectored get: element `i` of `out` is read from `offsets[i]`.
    fn get_indexed(
        &self,
        win: WinId,
        image: usize,
        elem_size: usize,
        offsets: &[u64],
        out: &mut [u8],
    ) -> TransportResult<()>;

    // ------------------------------------------------------------------
    // Window atomics
    // ------------------------------------------------------------------

    /// Compare-and-swap one lane at `offset`; returns the previous value.
    fn atomic_cas(
        &self,
        win: WinId,
        image: usize,
        offset: u64,
        compare: i64,
        newval: i64,
        width: AtomicWidth,
    ) -> TransportResult<i64>;

    /// Fetch-and-op one lane at `offset`; returns the previous value.
    fn atomic_fetch_op(
        &self,
        win: WinId,
        image: usize,
        offset: u64,
        op: AtomicOp,
        operand: i64,
        width: AtomicWidth,
    ) -> TransportResult<i64>;

    // ------------------------------------------------------------------
    // Tagged messaging (subset sync)
    // ------------------------------------------------------------------

    /// Non-blocking send of one integer to `dest` with `tag`.
    fn isend_i32(&self, comm: Comm, dest: usize, tag: i32, value: i32) -> TransportResult<()>;

    /// Post a non-blocking receive of one integer from `src` with `tag`.
    fn irecv_i32(&self, comm: Comm, src: usize, tag: i32) -> TransportResult<RequestId>;

    /// Block until any of the pending requests completes; the completed slot
    /// is cleared. Returns which request finished and the received value.
    fn wait_any(&self, reqs: &mut [Option<RequestId>]) -> TransportResult<WaitAny>;

    /// Poll one request; `Some(value)` once completed.
    fn test(&self, req: RequestId) -> TransportResult<Option<i32>>;

    /// Cancel a pending receive.
    fn cancel(&self, req: RequestId);

    // ------------------------------------------------------------------
    // Collectives
    // ------------------------------------------------------------------

    /// Barrier over `comm`.
    fn barrier(&self, comm: Comm) -> TransportResult<()>;

    /// Broadcast `data` from `root` to every member of `comm`.
    fn broadcast(&self, comm: Comm, root: usize, data: &mut [u8]) -> TransportResult<()>;

    /// Reduce `data` (a whole buffer of `dtype` elements) across `comm`.
    /// `root == None` is an all-reduce; otherwise only `root` receives the
    /// result and other members' buffers are left unchanged.
    fn reduce(
        &self,
        comm: Comm,
        data: &mut [u8],
        dtype: CollDatatype,
        op: CollOp<'_>,
        root: Option<usize>,
    ) -> TransportResult<()>;

    // ------------------------------------------------------------------
    // Failure extension
    // ------------------------------------------------------------------

    /// Whether the fault-tolerance extension is available.
    fn failure_support(&self) -> bool;

    /// Post the long-running alive watch on `comm`: a receive that completes
    /// with a `ProcFailed` error when any member dies.
    fn alive_watch(&self, comm: Comm) -> TransportResult<RequestId>;

    /// World ranks of the members whose failure has been acknowledged.
    fn acked_failures(&self, comm: Comm) -> TransportResult<Vec<usize>>;

    /// Build the survivor communicator (collective among survivors).
    fn shrink(&self, comm: Comm) -> TransportResult<Comm>;

    /// Split `comm`, compacting ranks by `key` within each `color`.
    fn split(&self, comm: Comm, color: i32, key: i32) -> TransportResult<Comm>;

    /// Agree on `flag` across the survivors of `comm` (bitwise AND).
    fn agree(&self, comm: Comm, flag: &mut i32) -> TransportResult<()>;

    /// Mark this image failed and stop participating. Peers observe the
    /// failure through their next blocking call.
    fn kill_self(&self);
}
