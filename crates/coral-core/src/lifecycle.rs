//! Teardown and termination: finalize, the stop family, image status
//! queries, and the failed/stopped image lists.

use std::sync::atomic::Ordering;

use tracing::{debug, error, info, warn};

use crate::descriptor::{Descriptor, Dim, LocalArray};
use crate::error::{CoralError, Result};
use crate::runtime::Runtime;
use crate::transport::LockMode;
use crate::types::{stat, ElemType, ImageIndex, ImageStatus};

impl Runtime {
    /// Finalize the runtime at normal program end: full collective teardown
    /// of every token, window and communicator.
    pub fn finalize(&self) -> Result<()> {
        self.finalize_internal(0)
    }

    /// Shared teardown path.
    ///
    /// With `error_status == 0` this is the orderly collective teardown.
    /// A nonzero `error_status` is the stop/error path: publish the status
    /// word, notify peers waiting in subset sync, and return without the
    /// collective frees (peers may not be in a matching call).
    pub(crate) fn finalize_internal(&self, error_status: i32) -> Result<()> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(image = self.this_image(), error_status, "finalizing");

        let word = if error_status == 0 {
            ImageStatus::Stopped.to_word()
        } else {
            error_status
        };

        // Publish our status word under an exclusive lock on our own slot.
        let status_win = *self.status_win.read();
        let me = self.this_image() - 1;
        self.epochs().lock(self.t(), LockMode::Exclusive, me, status_win);
        let _ = self.t().put(status_win, me, 0, &word.to_ne_bytes());
        self.epochs().unlock(self.t(), me, status_win);

        {
            let mut stati = self.image_stati.lock();
            stati[self.this_image()] = word;
        }
        self.num_stopped.fetch_add(1, Ordering::Relaxed);

        // Tell every peer; anyone blocked in sync_images sees the stop.
        let comm = *self.core_comm.read();
        for &peer in self.peers() {
            let _ = self.t().isend_i32(comm, peer - 1, crate::types::SYNC_IMAGES_TAG, word);
        }

        if let Some(watch) = self.alive_watch.lock().take() {
            self.t().cancel(watch);
        }

        if error_status != 0 {
            return Ok(());
        }

        self.drain_pending_puts();
        if let Err(e) = self.t().barrier(comm) {
            // Peers that died during teardown must not keep us from exiting.
            warn!(image = self.this_image(), %e, "barrier failed during finalize");
        }

        // Slave tokens first: detach from the dynamic window, then free.
        self.epochs().on_free(self.t(), self.t().dynamic_win());
        let slaves = self.registry.lock().drain_slaves();
        for rec in slaves {
            if rec.is_attached() {
                let _ = self.t().dyn_detach(rec.addr);
            }
        }

        // Then every master window.
        let masters = self.registry.lock().drain_masters();
        for rec in masters {
            self.epochs().on_free(self.t(), rec.win);
            let _ = self.t().win_free(rec.win);
        }

        self.epochs().on_free(self.t(), status_win);
        let _ = self.t().win_free(status_win);

        if let Some(alive) = self.alive_comm.write().take() {
            self.t().free_comm(alive);
        }
        self.t().free_comm(comm);

        if self.owns_transport() {
            self.t().finalize();
        }
        info!(image = self.this_image(), "finalized");
        Ok(())
    }

    /// Tear down after an unrecoverable error and produce the shutdown
    /// value that unwinds this image.
    pub(crate) fn terminate(&self, err: CoralError) -> CoralError {
        error!(image = self.this_image(), %err, "terminating image");
        self.terminate_internal(err.stat_code(), 1)
    }

    pub(crate) fn terminate_internal(&self, stat_code: i32, exit_code: i32) -> CoralError {
        let _ = self.finalize_internal(stat_code);
        CoralError::Shutdown { code: exit_code }
    }

    // ------------------------------------------------------------------
    // The stop family
    // ------------------------------------------------------------------

    /// Normal `STOP` with a numeric code: publish the stopped status for
    /// peers and shut this image down with the given exit code.
    pub fn stop_numeric(&self, stop_code: i32) -> CoralError {
        info!(image = self.this_image(), stop_code, "STOP");
        self.terminate_internal(stat::STOPPED_IMAGE, stop_code)
    }

    /// Normal `STOP` with a message.
    pub fn stop_str(&self, message: &str) -> CoralError {
        info!(image = self.this_image(), message, "STOP");
        self.terminate_internal(stat::STOPPED_IMAGE, 0)
    }

    /// `ERROR STOP` with a numeric code: like stop, but the exit code is
    /// the (nonzero) error code.
    pub fn error_stop(&self, error_code: i32) -> CoralError {
        error!(image = self.this_image(), error_code, "ERROR STOP");
        self.terminate_internal(stat::STOPPED_IMAGE, error_code)
    }

    /// `ERROR STOP` with a message; exits with code 1.
    pub fn error_stop_str(&self, message: &str) -> CoralError {
        error!(image = self.this_image(), message, "ERROR STOP");
        self.terminate_internal(stat::STOPPED_IMAGE, 1)
    }

    /// `FAIL IMAGE`: die abruptly without notifying anyone. Peers discover
    /// the failure through the transport's fault-tolerance extension.
    pub fn fail_image(&self) -> CoralError {
        warn!(image = self.this_image(), "IMAGE FAILED");
        self.t().kill_self();
        self.finalized.store(true, Ordering::Release);
        CoralError::Shutdown {
            code: stat::FAILED_IMAGE,
        }
    }

    // ------------------------------------------------------------------
    // Status queries
    // ------------------------------------------------------------------

    /// The status word of `image`: 0 while running, otherwise the
    /// stopped/failed stat code.
    ///
    /// Without failure handling this build cannot observe peers and
    /// reports 0, preserving the ABI of non-fault-tolerant builds.
    pub fn image_status(&self, image: ImageIndex) -> Result<i32> {
        if image < 1 || image > self.num_images() {
            return Err(CoralError::extent(format!(
                "image {image} out of bounds of images 1..{}",
                self.num_images()
            )));
        }
        if !self.failure_enabled() {
            warn!("IMAGE_STATUS() requires a failure-handling build; reporting 0");
            return Ok(0);
        }

        // Probe the alive watch first so latent failures are accounted.
        self.probe_failures();

        let cached = self.image_stati.lock()[image];
        if cached != 0 {
            return Ok(cached);
        }

        let status_win = *self.status_win.read();
        let rank = image - 1;
        let mut word = [0u8; 4];
        self.epochs().lock(self.t(), LockMode::Shared, rank, status_win);
        let res = self.t().get(status_win, rank, 0, &mut word);
        self.epochs().unlock(self.t(), rank, status_win);
        match res {
            Ok(()) => {
                let word = i32::from_ne_bytes(word);
                if word != 0 {
                    self.image_stati.lock()[image] = word;
                }
                Ok(word)
            }
            Err(e) if e.is_proc_failed() => {
                self.image_stati.lock()[image] = stat::FAILED_IMAGE;
                Ok(stat::FAILED_IMAGE)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Indices of the images known to have failed, as a rank-1 integer
    /// array of the requested kind.
    pub fn failed_images(&self, kind: u32) -> Result<LocalArray> {
        if !self.failure_enabled() {
            warn!("FAILED_IMAGES() requires a failure-handling build");
            return image_list(&[], kind);
        }
        self.probe_failures();
        let stati = self.image_stati.lock();
        let failed: Vec<ImageIndex> = (1..=self.num_images())
            .filter(|&i| stati[i] == stat::FAILED_IMAGE)
            .collect();
        image_list(&failed, kind)
    }

    /// Indices of the images known to have stopped, as a rank-1 integer
    /// array of the requested kind.
    pub fn stopped_images(&self, kind: u32) -> Result<LocalArray> {
        if !self.failure_enabled() {
            warn!("STOPPED_IMAGES() requires a failure-handling build");
            return image_list(&[], kind);
        }
        self.probe_failures();
        let stati = self.image_stati.lock();
        let stopped: Vec<ImageIndex> = (1..=self.num_images())
            .filter(|&i| stati[i] == stat::STOPPED_IMAGE)
            .collect();
        image_list(&stopped, kind)
    }
}

/// Pack a list of image indices into a rank-1 integer array of `kind`.
fn image_list(images: &[ImageIndex], kind: u32) -> Result<LocalArray> {
    if !matches!(kind, 1 | 2 | 4 | 8 | 16) {
        return Err(CoralError::unsupported(format!(
            "integer kind {kind} in image list"
        )));
    }
    let n = images.len();
    let desc = Descriptor::array(
        ElemType::Integer,
        kind,
        kind as usize,
        &[Dim::new(0, n as i64 - 1, 1)],
    )?;
    let mut out = LocalArray::new(desc);
    for (slot, &image) in images.iter().enumerate() {
        let at = slot * kind as usize;
        let bytes = &mut out.bytes_mut()[at..at + kind as usize];
        crate::convert::write_scalar(ElemType::Integer, kind, crate::convert::Scalar::Int(image as i128), bytes)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_list_packing() {
        let list = image_list(&[2, 4], 8).unwrap();
        assert_eq!(list.desc().rank(), 1);
        assert_eq!(list.desc().element_count(), 2);
        assert_eq!(list.to_elements::<i64>(), vec![2, 4]);
    }

    #[test]
    fn test_image_list_empty() {
        let list = image_list(&[], 4).unwrap();
        assert_eq!(list.desc().element_count(), 0);
        assert!(list.bytes().is_empty());
    }

    #[test]
    fn test_image_list_rejects_bad_kind() {
        assert!(image_list(&[1], 3).is_err());
    }
}
