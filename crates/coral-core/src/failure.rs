//! Failure detection and communicator recovery.
//!
//! When a transport call reports a failed peer, the survivors acknowledge
//! the failure, shrink the communicator, split it to compact ranks, and
//! agree on the result before replacing the runtime's communicator. The
//! retry loop restarts at shrink whenever agreement fails because another
//! image died mid-recovery.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::error::CoralError;
use crate::runtime::Runtime;
use crate::transport::{Comm, TransportError};
use crate::types::stat;

/// States of the recovery machine; recovery always runs to `Replace` or
/// terminates the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryStage {
    Shrink,
    Split,
    Agree,
    Replace,
}

impl Runtime {
    /// Poll the alive watch, recording any newly acknowledged failures.
    pub(crate) fn probe_failures(&self) {
        if !self.failure_enabled() {
            return;
        }
        let watch = match *self.alive_watch.lock() {
            Some(w) => w,
            None => return,
        };
        // The watch completes with a failure class once per unacknowledged
        // failure batch.
        if let Err(e) = self.t().test(watch) {
            if e.is_proc_failed() {
                self.record_failures();
            }
        }
    }

    /// Pull the acknowledged failure list from the transport into the
    /// per-image status bookkeeping.
    pub(crate) fn record_failures(&self) {
        let comm = (*self.alive_comm.read()).unwrap_or_else(|| *self.core_comm.read());
        let failed = match self.t().acked_failures(comm) {
            Ok(f) => f,
            Err(_) => return,
        };
        let mut stati = self.image_stati.lock();
        for rank in failed {
            let image = rank + 1;
            if stati[image] != stat::FAILED_IMAGE {
                stati[image] = stat::FAILED_IMAGE;
                self.num_failed.fetch_add(1, Ordering::Relaxed);
                warn!(image = self.this_image(), failed = image, "peer failure recorded");
            }
        }
    }

    /// Handle an error from a communicator-wide operation.
    ///
    /// Recoverable errors (failed peer, revoked communicator) run the
    /// shrink/split/agree recovery and surface as `FailedImage` so the
    /// caller's `stat` can report it. Anything else terminates the image.
    pub(crate) fn handle_comm_error(&self, err: TransportError) -> CoralError {
        if !self.failure_enabled() || !err.is_recoverable() {
            return self.terminate(CoralError::Transport(err));
        }
        self.record_failures();

        let old_comm = *self.core_comm.read();
        let new_comm = match self.rebuild_comm(old_comm) {
            Ok(c) => c,
            Err(e) => return self.terminate(CoralError::Transport(e)),
        };

        // Re-create the status window over the survivor communicator and
        // republish our own word.
        let old_status = *self.status_win.read();
        self.epochs().on_free(self.t(), old_status);
        let _ = self.t().win_free(old_status);
        match self.t().win_allocate(new_comm, std::mem::size_of::<i32>()) {
            Ok(alloc) => {
                self.epochs().on_create(self.t(), alloc.win);
                *self.status_win.write() = alloc.win;
            }
            Err(e) => return self.terminate(CoralError::Transport(e)),
        }

        self.t().free_comm(old_comm);
        *self.core_comm.write() = new_comm;
        // The alive watch moves to the survivor communicator as well.
        if let Some(old_alive) = self.alive_comm.write().replace(new_comm) {
            self.t().free_comm(old_alive);
        }
        debug!(image = self.this_image(), "communicator recovered");

        CoralError::FailedImage
    }

    /// The Shrink → Split → Agree loop; retried until the survivors agree.
    fn rebuild_comm(&self, broken: Comm) -> Result<Comm, TransportError> {
        let key = self.this_image() as i32 - 1;
        let mut stage = RecoveryStage::Shrink;
        let mut shrunk: Option<Comm> = None;
        let mut candidate: Option<Comm> = None;
        loop {
            match stage {
                RecoveryStage::Shrink => {
                    shrunk = Some(self.t().shrink(broken)?);
                    stage = RecoveryStage::Split;
                }
                RecoveryStage::Split => {
                    let s = shrunk.expect("shrink precedes split");
                    match self.t().split(s, 0, key) {
                        Ok(c) => {
                            candidate = Some(c);
                            stage = RecoveryStage::Agree;
                        }
                        Err(_) => {
                            // Another failure mid-recovery; start over.
                            self.record_failures();
                            stage = RecoveryStage::Shrink;
                        }
                    }
                    self.t().free_comm(s);
                    shrunk = None;
                }
                RecoveryStage::Agree => {
                    let c = candidate.expect("split precedes agree");
                    let mut flag = 1;
                    match self.t().agree(c, &mut flag) {
                        Ok(()) if flag == 1 => stage = RecoveryStage::Replace,
                        _ => {
                            self.t().free_comm(c);
                            candidate = None;
                            self.record_failures();
                            stage = RecoveryStage::Shrink;
                        }
                    }
                }
                RecoveryStage::Replace => {
                    return Ok(candidate.expect("agree precedes replace"));
                }
            }
        }
    }
}
