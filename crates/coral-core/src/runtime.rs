//! The runtime value: one per image, owning every piece of global state the
//! PGAS model needs (communicators, registries, status window, deferred-put
//! queue) and threading it through all operations.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::descriptor::Descriptor;
use crate::epoch::EpochPolicy;
use crate::error::{fill_errmsg, CoralError, Result};
use crate::registry::{MasterToken, SlaveToken, Token, TokenRegistry};
use crate::transport::{
    Comm, DynAddr, LockMode, RequestId, Transport, WinId,
};
use crate::types::{stat, DeregisterMode, ImageIndex, RegisterKind};

/// Preallocated buffers of the subset-sync protocol.
pub(crate) struct SyncBuffers {
    /// Last status word received from each image (1-based indexing).
    pub arrived: Vec<i32>,
    /// Outstanding receive handles, compacted per call.
    pub handles: Vec<Option<RequestId>>,
}

/// The per-image runtime.
///
/// Created by [`Runtime::init`], destroyed by [`Runtime::finalize`] (or the
/// termination entry points). All operations take `&self`; the contained
/// state is interior-mutable because any operation may have to update
/// bookkeeping such as the deferred-put queue or failure records.
pub struct Runtime {
    transport: Arc<dyn Transport>,
    epochs: Box<dyn EpochPolicy>,
    config: RuntimeConfig,
    owns_transport: bool,
    failure_enabled: bool,

    this_image: ImageIndex,
    num_images: usize,
    /// All image indices except this one.
    peers: Vec<ImageIndex>,

    /// The runtime's private communicator; replaced after failure recovery.
    pub(crate) core_comm: RwLock<Comm>,
    /// Communicator carrying only the alive watch; replaced with the
    /// survivor communicator after recovery.
    pub(crate) alive_comm: RwLock<Option<Comm>>,
    pub(crate) alive_watch: Mutex<Option<RequestId>>,

    /// Window holding this image's status word; replaced after recovery.
    pub(crate) status_win: RwLock<WinId>,

    pub(crate) registry: Mutex<TokenRegistry>,
    /// Windows with queued puts, one vector per target image (1-based).
    pending_puts: Mutex<Vec<Vec<WinId>>>,
    pub(crate) sync_bufs: Mutex<SyncBuffers>,

    /// Last known status word of every image (1-based indexing).
    pub(crate) image_stati: Mutex<Vec<i32>>,
    pub(crate) num_failed: AtomicUsize,
    pub(crate) num_stopped: AtomicUsize,
    pub(crate) finalized: AtomicBool,
}

impl Runtime {
    /// Initialize the runtime over the given transport.
    ///
    /// Duplicates the transport's world communicator so embedder traffic is
    /// undisturbed, assigns this image its index, and creates the status
    /// window, the subset-sync buffers and (under failure handling) the
    /// alive watch.
    pub fn init(transport: Arc<dyn Transport>, config: RuntimeConfig) -> Result<Self> {
        let owns_transport = !transport.initialized_externally();
        let world = transport.world();
        let core_comm = transport.dup(world).map_err(CoralError::Transport)?;

        let rank = transport.rank(core_comm).map_err(CoralError::Transport)?;
        let num_images = transport.size(core_comm).map_err(CoralError::Transport)?;
        let this_image = rank + 1;

        let peers: Vec<ImageIndex> = (1..=num_images).filter(|&i| i != this_image).collect();

        let mut failure_enabled = config.failure_handling;
        if failure_enabled && !transport.failure_support() {
            warn!("transport has no fault-tolerance extension; failure handling disabled");
            failure_enabled = false;
        }

        let epochs = config.epoch_style.policy();

        // The status window: one integer slot per image, read by peers with
        // image_status and written only by the owner.
        let status = transport
            .win_allocate(core_comm, std::mem::size_of::<i32>())
            .map_err(CoralError::Transport)?;
        epochs.on_create(transport.as_ref(), status.win);
        epochs.on_create(transport.as_ref(), transport.dynamic_win());

        let (alive_comm, alive_watch) = if failure_enabled {
            let comm = transport.dup(world).map_err(CoralError::Transport)?;
            let watch = transport.alive_watch(comm).map_err(CoralError::Transport)?;
            (Some(comm), Some(watch))
        } else {
            (None, None)
        };

        info!(
            image = this_image,
            images = num_images,
            failure_handling = failure_enabled,
            "coral runtime initialized"
        );

        Ok(Self {
            transport,
            epochs,
            config,
            owns_transport,
            failure_enabled,
            this_image,
            num_images,
            peers,
            core_comm: RwLock::new(core_comm),
            alive_comm: RwLock::new(alive_comm),
            alive_watch: Mutex::new(alive_watch),
            status_win: RwLock::new(status.win),
            registry: Mutex::new(TokenRegistry::new()),
            pending_puts: Mutex::new(vec![Vec::new(); num_images + 1]),
            sync_bufs: Mutex::new(SyncBuffers {
                arrived: vec![0; num_images + 1],
                handles: vec![None; num_images + 1],
            }),
            image_stati: Mutex::new(vec![0; num_images + 1]),
            num_failed: AtomicUsize::new(0),
            num_stopped: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// This image's 1-based index.
    pub fn this_image(&self) -> ImageIndex {
        self.this_image
    }

    /// Number of images.
    pub fn num_images(&self) -> usize {
        self.num_images
    }

    /// The indices of all other images.
    pub fn peers(&self) -> &[ImageIndex] {
        &self.peers
    }

    /// The active configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Whether failure handling is active.
    pub fn failure_enabled(&self) -> bool {
        self.failure_enabled
    }

    pub(crate) fn t(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn epochs(&self) -> &dyn EpochPolicy {
        self.epochs.as_ref()
    }

    pub(crate) fn owns_transport(&self) -> bool {
        self.owns_transport
    }

    /// Translate a public image index into a transport rank; 0 means self.
    pub(crate) fn rank_of(&self, image: ImageIndex) -> usize {
        if image == 0 {
            self.this_image - 1
        } else {
            image - 1
        }
    }

    // ------------------------------------------------------------------
    // The stat/errmsg ABI
    // ------------------------------------------------------------------

    /// Run an operation under the optional-`stat` contract.
    ///
    /// On success `stat` (when present) is set to zero. A recoverable error
    /// is written into `stat`/`errmsg` (space-padded) and swallowed. Without
    /// a `stat` output, any error terminates the image: a failed peer is
    /// never reported silently.
    pub fn with_stat<T>(
        &self,
        stat_out: Option<&mut i32>,
        errmsg: Option<&mut [u8]>,
        op: impl FnOnce(&Self) -> Result<T>,
    ) -> Result<Option<T>> {
        match op(self) {
            Ok(v) => {
                if let Some(s) = stat_out {
                    *s = stat::OK;
                }
                Ok(Some(v))
            }
            Err(e @ CoralError::Shutdown { .. }) => Err(e),
            Err(e) => match stat_out {
                Some(s) => {
                    *s = e.stat_code();
                    if let Some(buf) = errmsg {
                        fill_errmsg(buf, &e.to_string());
                    }
                    Ok(None)
                }
                None => Err(self.terminate(e)),
            },
        }
    }

    // ------------------------------------------------------------------
    // Token registry operations
    // ------------------------------------------------------------------

    /// Register a new coarray (or lock/event/critical object): collectively
    /// allocate its window, zero-initialize integer-slot payloads, and
    /// record the token.
    ///
    /// `size` is in bytes for plain coarrays and in integer slots for
    /// lock/event/critical kinds. Every image must call `register` in the
    /// same order; window allocation is collective.
    pub fn register(
        &self,
        size: usize,
        kind: RegisterKind,
        desc: Option<Descriptor>,
    ) -> Result<Token> {
        if self.finalized.load(Ordering::Acquire) {
            return Err(CoralError::Finalized);
        }

        let bytes = if kind.is_integer_slots() {
            size * std::mem::size_of::<i32>()
        } else {
            size
        };

        let comm = *self.core_comm.read();
        let alloc = self
            .transport
            .win_allocate(comm, bytes)
            .map_err(|_| CoralError::AllocationFailed { size: bytes })?;
        self.epochs.on_create(self.t(), alloc.win);

        if kind.is_integer_slots() && bytes > 0 {
            // Publish zeros so peers never observe an unset lock or event.
            let zeros = vec![0u8; bytes];
            let me = self.this_image - 1;
            self.epochs.lock(self.t(), LockMode::Exclusive, me, alloc.win);
            self.t().put(alloc.win, me, 0, &zeros)?;
            self.epochs.unlock(self.t(), me, alloc.win);
        }

        let token = self.registry.lock().insert_master(MasterToken {
            win: alloc.win,
            base: alloc.base,
            size: bytes,
            kind,
            desc: if desc.as_ref().is_some_and(|d| d.rank() > 0) {
                desc
            } else {
                None
            },
        });
        debug!(image = self.this_image, ?token, bytes, "registered window");
        Ok(token)
    }

    /// Register a slave token for an allocatable or pointer component:
    /// allocate local memory and attach it to the global dynamic window.
    ///
    /// Returns the token and the address peers reach the memory under.
    pub fn register_slave(&self, size: usize, desc: Option<Descriptor>) -> Result<(Token, DynAddr)> {
        if self.finalized.load(Ordering::Acquire) {
            return Err(CoralError::Finalized);
        }
        let mut mem = vec![0u8; size].into_boxed_slice();
        let addr = self
            .transport
            .dyn_attach(mem.as_mut_ptr(), size)
            .map_err(|_| CoralError::AllocationFailed { size })?;
        let token = self.registry.lock().insert_slave(SlaveToken {
            mem: Some(mem),
            addr,
            desc,
        });
        debug!(image = self.this_image, ?token, size, addr, "registered slave token");
        Ok((token, addr))
    }

    /// Reallocate a slave token's memory in place: detach, free, allocate,
    /// attach. The token handle stays valid throughout.
    pub fn slave_reallocate(
        &self,
        token: Token,
        size: usize,
        desc: Option<Descriptor>,
    ) -> Result<DynAddr> {
        let mut reg = self.registry.lock();
        let rec = reg.slave_mut(token)?;
        if rec.is_attached() {
            self.transport.dyn_detach(rec.addr)?;
            rec.addr = 0;
        }
        rec.mem = None;
        let mut mem = vec![0u8; size].into_boxed_slice();
        let addr = self
            .transport
            .dyn_attach(mem.as_mut_ptr(), size)
            .map_err(|_| CoralError::AllocationFailed { size })?;
        rec.mem = Some(mem);
        rec.addr = addr;
        rec.desc = desc;
        Ok(addr)
    }

    /// Deregister a token.
    ///
    /// Full deregistration of a master is collective and preceded by a sync
    /// across images so no peer still has RMA in flight against the window.
    /// The deallocate-only fast path applies to slave tokens: it releases
    /// the memory but keeps the token for a later re-allocation.
    pub fn deregister(&self, token: Token, mode: DeregisterMode) -> Result<()> {
        if self.finalized.load(Ordering::Acquire) {
            return Err(CoralError::Finalized);
        }
        match (token, mode) {
            (Token::Slave(_), DeregisterMode::DeallocateOnly) => {
                let mut reg = self.registry.lock();
                let rec = reg.slave_mut(token)?;
                if rec.is_attached() {
                    self.transport.dyn_detach(rec.addr)?;
                    rec.addr = 0;
                }
                rec.mem = None;
                Ok(())
            }
            (Token::Slave(_), DeregisterMode::Full) => {
                let rec = self.registry.lock().remove_slave(token)?;
                if rec.is_attached() {
                    self.transport.dyn_detach(rec.addr)?;
                }
                Ok(())
            }
            (Token::Master(_), DeregisterMode::DeallocateOnly) => Err(CoralError::unsupported(
                "deallocate-only deregistration of a window-backed token",
            )),
            (Token::Master(_), DeregisterMode::Full) => {
                self.sync_all()?;
                let rec = self.registry.lock().remove_master(token)?;
                self.epochs.on_free(self.t(), rec.win);
                self.transport.win_free(rec.win)?;
                debug!(image = self.this_image, ?token, "deregistered window");
                Ok(())
            }
        }
    }

    /// Resolve a master token to its window. Constant time.
    pub fn lookup(&self, token: Token) -> Result<WinId> {
        Ok(self.registry.lock().master(token)?.win)
    }

    /// Resolve a slave token to its current dynamic address.
    pub fn lookup_slave(&self, token: Token) -> Result<DynAddr> {
        Ok(self.registry.lock().slave(token)?.addr)
    }

    /// Run `f` over the local payload of a slave token. This is how the
    /// owning image initializes or inspects component memory; peers go
    /// through the dynamic window.
    pub fn with_slave_memory<R>(&self, token: Token, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut reg = self.registry.lock();
        let rec = reg.slave_mut(token)?;
        let mem = rec
            .mem
            .as_mut()
            .ok_or_else(|| CoralError::invalid_reference("slave token has no memory"))?;
        Ok(f(mem))
    }

    /// The registered descriptor of a token, if any.
    pub fn token_desc(&self, token: Token) -> Result<Option<Descriptor>> {
        let reg = self.registry.lock();
        Ok(match token {
            Token::Master(_) => reg.master(token)?.desc.clone(),
            Token::Slave(_) => reg.slave(token)?.desc.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Deferred puts
    // ------------------------------------------------------------------

    /// Record a queued put so the next sync can complete it.
    pub(crate) fn note_pending_put(&self, image: ImageIndex, win: WinId) {
        if !self.config.deferred_puts {
            return;
        }
        let mut pending = self.pending_puts.lock();
        let per_image = &mut pending[image];
        if !per_image.contains(&win) {
            per_image.push(win);
        }
    }

    /// Complete all queued puts. Called by `sync_memory` and every barrier.
    pub(crate) fn drain_pending_puts(&self) {
        let drained: Vec<(ImageIndex, Vec<WinId>)> = {
            let mut pending = self.pending_puts.lock();
            pending
                .iter_mut()
                .enumerate()
                .filter(|(_, wins)| !wins.is_empty())
                .map(|(image, wins)| (image, std::mem::take(wins)))
                .collect()
        };
        for (image, wins) in drained {
            for win in wins {
                self.epochs.flush(self.t(), image - 1, win);
            }
        }
    }

    /// Complete all outstanding memory operations of this image: drain the
    /// deferred-put queue and synchronize window state.
    pub fn sync_memory(&self) -> Result<()> {
        self.drain_pending_puts();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer health
    // ------------------------------------------------------------------

    /// Report an error if `image` is known to have failed.
    pub(crate) fn check_image_health(&self, image: ImageIndex) -> Result<()> {
        if !self.failure_enabled || image == 0 {
            return Ok(());
        }
        if self.image_stati.lock()[image] == stat::FAILED_IMAGE {
            return Err(CoralError::FailedImage);
        }
        Ok(())
    }
}
