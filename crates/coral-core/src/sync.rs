//! Synchronization: barriers, subset sync over tagged messages, mutex
//! locks via compare-and-swap, and event counters via fetch-and-add.

use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{CoralError, Result};
use crate::registry::Token;
use crate::runtime::Runtime;
use crate::transport::{AtomicOp, AtomicWidth, LockMode, TransportError};
use crate::types::{stat, ImageIndex, SYNC_IMAGES_TAG};

/// The image set of a `sync_images` call.
#[derive(Debug, Clone, Copy)]
pub enum ImageSet<'a> {
    /// Synchronize with every other image.
    All,
    /// Synchronize with the listed images.
    Images(&'a [ImageIndex]),
}

impl Runtime {
    /// Translate a communicator-wide failure, or pass other errors through.
    fn comm_result(&self, r: std::result::Result<(), TransportError>) -> Result<()> {
        match r {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => Err(self.handle_comm_error(e)),
            Err(e) => Err(e.into()),
        }
    }

    /// Barrier over all images: drain deferred puts, then fence.
    pub fn sync_all(&self) -> Result<()> {
        if self.is_finalized() {
            return Err(CoralError::StoppedImage);
        }
        self.drain_pending_puts();
        let comm = match *self.alive_comm.read() {
            Some(alive) if self.failure_enabled() => alive,
            _ => *self.core_comm.read(),
        };
        trace!(image = self.this_image(), "sync_all");
        self.comm_result(self.t().barrier(comm))
    }

    /// Synchronize with an arbitrary set of images.
    ///
    /// Every image of the set must call `sync_images` with a set containing
    /// this image. A peer that stopped instead is reported as
    /// `StoppedImage`; a dead peer as `FailedImage`.
    pub fn sync_images(&self, set: ImageSet<'_>) -> Result<()> {
        let images: Vec<ImageIndex> = match set {
            ImageSet::All => self.peers().to_vec(),
            ImageSet::Images(list) => list.to_vec(),
        };

        // A self-only or empty set is a no-op.
        if images.is_empty() || (images.len() == 1 && images[0] == self.this_image()) {
            return Ok(());
        }
        for (i, &a) in images.iter().enumerate() {
            if a < 1 || a > self.num_images() {
                return Err(CoralError::extent(format!(
                    "invalid image index {a} to SYNC IMAGES"
                )));
            }
            if images[..i].contains(&a) {
                return Err(CoralError::DuplicateSyncImage(a));
            }
        }
        if self.is_finalized() {
            return Err(CoralError::StoppedImage);
        }

        self.drain_pending_puts();
        self.probe_failures();

        let comm = *self.core_comm.read();
        let count = images.len();
        trace!(image = self.this_image(), ?images, "sync_images");

        let mut bufs = self.sync_bufs.lock();
        for (slot, &target) in images.iter().enumerate() {
            bufs.handles[slot] = Some(self.t().irecv_i32(
                comm,
                target - 1,
                SYNC_IMAGES_TAG,
            )?);
        }
        for &target in &images {
            self.t()
                .isend_i32(comm, target - 1, SYNC_IMAGES_TAG, 0)?;
        }

        let mut done = 0;
        while done < count {
            match self.t().wait_any(&mut bufs.handles[..count]) {
                Ok(w) => {
                    done += 1;
                    let source = images[w.index];
                    bufs.arrived[source] = w.value;
                    if w.value == stat::STOPPED_IMAGE {
                        // The peer stopped; promote and leave the remaining
                        // receives pending for teardown to discard.
                        self.image_stati.lock()[source] = stat::STOPPED_IMAGE;
                        debug!(image = self.this_image(), source, "peer stopped during sync");
                        return Err(CoralError::StoppedImage);
                    }
                }
                Err(e) if e.is_proc_failed() && self.failure_enabled() => {
                    self.record_failures();
                    return Err(CoralError::FailedImage);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn is_finalized(&self) -> bool {
        self.finalized.load(std::sync::atomic::Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Mutex locks
    // ------------------------------------------------------------------

    /// Acquire the lock in slot `index` of the lock coarray on `image`
    /// (0 = self). The slot holds 0 when free, else the holder's index.
    ///
    /// With `acquired` given, the call does not block: it reports whether
    /// the lock was taken. Otherwise it spins with a growing backoff until
    /// the slot is won, stealing the lock when its holder has failed.
    pub fn lock(
        &self,
        token: Token,
        index: usize,
        image: ImageIndex,
        mut acquired: Option<&mut bool>,
    ) -> Result<()> {
        let win = self.lookup(token)?;
        let target = self.rank_of(image);
        let me = self.this_image() as i64;
        let offset = (index * std::mem::size_of::<i32>()) as u64;

        self.probe_failures();

        let mut iter: u64 = 0;
        loop {
            self.epochs().lock(self.t(), LockMode::Exclusive, target, win);
            let value = self
                .t()
                .atomic_cas(win, target, offset, 0, me, AtomicWidth::W4)?;
            self.epochs().unlock(self.t(), target, win);

            if value == me && target + 1 == self.this_image() {
                return Err(CoralError::MutexSelfDeadlock);
            }
            if let Some(out) = acquired.take() {
                *out = value == 0;
                return Ok(());
            }
            if value == 0 {
                return Ok(());
            }

            iter += 1;
            if self.failure_enabled() {
                if iter % 100 == 0 {
                    self.probe_failures();
                }
                let holder = value as usize;
                if holder <= self.num_images()
                    && self.image_stati.lock()[holder] == stat::FAILED_IMAGE
                {
                    // The holder died; free the slot and retry the acquire.
                    self.epochs().lock(self.t(), LockMode::Exclusive, target, win);
                    let _ = self
                        .t()
                        .atomic_cas(win, target, offset, value, 0, AtomicWidth::W4)?;
                    self.epochs().unlock(self.t(), target, win);
                    continue;
                }
            }
            std::thread::sleep(Duration::from_micros(
                self.this_image() as u64 * iter * self.config().lock_backoff_us,
            ));
        }
    }

    /// Release the lock in slot `index` on `image` by storing 0.
    pub fn unlock(&self, token: Token, index: usize, image: ImageIndex) -> Result<()> {
        let win = self.lookup(token)?;
        let target = self.rank_of(image);
        let offset = (index * std::mem::size_of::<i32>()) as u64;

        self.probe_failures();

        self.epochs().lock(self.t(), LockMode::Exclusive, target, win);
        let _old = self
            .t()
            .atomic_fetch_op(win, target, offset, AtomicOp::Replace, 0, AtomicWidth::W4)?;
        self.epochs().unlock(self.t(), target, win);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Atomically increment event counter `index` on `image` (0 = self).
    pub fn event_post(&self, token: Token, index: usize, image: ImageIndex) -> Result<()> {
        let win = self.lookup(token)?;
        let target = self.rank_of(image);
        let offset = (index * std::mem::size_of::<i32>()) as u64;

        self.epochs().lock(self.t(), LockMode::Exclusive, target, win);
        let res =
            self.t()
                .atomic_fetch_op(win, target, offset, AtomicOp::Add, 1, AtomicWidth::W4);
        self.epochs().unlock(self.t(), target, win);
        res?;
        self.check_image_health(image)
    }

    /// Wait until the local event counter `index` reaches `until_count`,
    /// then atomically consume that many posts.
    pub fn event_wait(&self, token: Token, index: usize, until_count: i32) -> Result<()> {
        const SPIN_LOOP_MAX: u32 = 20_000;

        let win = self.lookup(token)?;
        let me = self.this_image() - 1;
        let offset = (index * std::mem::size_of::<i32>()) as u64;

        let read_counter = || -> Result<i64> {
            self.t().win_sync(win);
            self.t()
                .atomic_fetch_op(win, me, offset, AtomicOp::NoOp, 0, AtomicWidth::W4)
                .map_err(CoralError::Transport)
        };

        let mut count = read_counter()?;
        let mut spins = 0u32;
        while count < until_count as i64 && spins < SPIN_LOOP_MAX {
            spins += 1;
            count = read_counter()?;
        }
        let mut backoff: u64 = 1;
        while count < until_count as i64 {
            std::thread::sleep(Duration::from_micros(10 * backoff));
            backoff += 1;
            count = read_counter()?;
        }

        self.epochs().lock(self.t(), LockMode::Exclusive, me, win);
        let res = self.t().atomic_fetch_op(
            win,
            me,
            offset,
            AtomicOp::Add,
            -(until_count as i64),
            AtomicWidth::W4,
        );
        self.epochs().unlock(self.t(), me, win);
        res?;
        Ok(())
    }

    /// Read event counter `index` on `image` without consuming posts.
    pub fn event_query(&self, token: Token, index: usize, image: ImageIndex) -> Result<i32> {
        let win = self.lookup(token)?;
        let target = self.rank_of(image);
        let offset = (index * std::mem::size_of::<i32>()) as u64;

        self.epochs().lock(self.t(), LockMode::Exclusive, target, win);
        let res =
            self.t()
                .atomic_fetch_op(win, target, offset, AtomicOp::NoOp, 0, AtomicWidth::W4);
        self.epochs().unlock(self.t(), target, win);
        Ok(res? as i32)
    }
}
