//! # Coral
//!
//! A PGAS ("coarray") runtime over one-sided RMA transports.
//!
//! Coral presents N symmetric images in which any image may read, write,
//! atomically update, synchronize with, or collectively reduce memory owned
//! by any other image. The core engine lives in `coral-core`; the
//! always-available in-process transport in `coral-shmem`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use coral::prelude::*;
//!
//! let report = Coral::builder()
//!     .num_images(4)
//!     .build()
//!     .launch(|rt| {
//!         let desc = Descriptor::vector(ElemType::Integer, 4, 4, 10);
//!         let token = rt.register(40, RegisterKind::Coarray, Some(desc))?;
//!         rt.sync_all()?;
//!         // ... one-sided traffic against any image ...
//!         rt.deregister(token, DeregisterMode::Full)?;
//!         Ok(())
//!     })
//!     .unwrap();
//! assert!(report.all_normal());
//! ```
//!
//! Each image runs the closure on its own thread with its own [`Runtime`];
//! collective operations (registration, sync, reductions) must be executed
//! by every image in the same order, exactly as in the underlying model.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::debug;

// Re-export the core and the in-process transport.
pub use coral_core::*;
pub use coral_shmem::{ShmemTransport, ShmemWorld};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{Coral, CoralBuilder, FleetReport, ImageExit};
    pub use coral_core::prelude::*;
    pub use coral_shmem::ShmemWorld;
}

/// How one image's closure ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageExit {
    /// The closure returned successfully and the image finalized.
    Normal,
    /// The image executed a stop (or was terminated) with this exit code.
    Stopped {
        /// Process exit code the image would have returned.
        code: i32,
    },
    /// The closure returned an error other than a shutdown.
    Error(String),
    /// The closure panicked; the image was marked failed for its peers.
    Panicked(String),
}

/// Per-image outcomes of one fleet run.
#[derive(Debug)]
pub struct FleetReport {
    /// Outcome of each image, 1-based index minus one.
    pub exits: Vec<ImageExit>,
}

impl FleetReport {
    /// Whether every image finished normally.
    pub fn all_normal(&self) -> bool {
        self.exits.iter().all(|e| matches!(e, ImageExit::Normal))
    }

    /// Outcome of one image (1-based).
    pub fn image(&self, image: ImageIndex) -> &ImageExit {
        &self.exits[image - 1]
    }
}

/// The runtime facade: configures and launches an image fleet.
pub struct Coral {
    num_images: usize,
    config: RuntimeConfig,
}

impl Coral {
    /// Start building a fleet.
    pub fn builder() -> CoralBuilder {
        CoralBuilder::new()
    }

    /// Number of images this fleet will run.
    pub fn num_images(&self) -> usize {
        self.num_images
    }

    /// Run `body` on every image of an in-process world and collect the
    /// outcomes. Returns when every image has finished.
    pub fn launch<F>(&self, body: F) -> Result<FleetReport>
    where
        F: Fn(&Runtime) -> Result<()> + Send + Sync,
    {
        let world = ShmemWorld::new(self.num_images);
        let config = self.config.clone();
        let body = &body;

        let exits = std::thread::scope(|s| {
            let handles: Vec<_> = (0..self.num_images)
                .map(|rank| {
                    let transport = world.transport(rank);
                    let config = config.clone();
                    s.spawn(move || run_image(transport, config, body))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(exit) => exit,
                    Err(_) => ImageExit::Panicked("image thread panicked".into()),
                })
                .collect()
        });

        Ok(FleetReport { exits })
    }
}

fn run_image<F>(transport: Arc<ShmemTransport>, config: RuntimeConfig, body: &F) -> ImageExit
where
    F: Fn(&Runtime) -> Result<()> + Send + Sync,
{
    // Keep a handle so a panicking image can be marked failed, unblocking
    // any peer waiting on it.
    let escape = Arc::clone(&transport);
    let rt = match Runtime::init(transport, config) {
        Ok(rt) => rt,
        Err(e) => return ImageExit::Error(e.to_string()),
    };

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| body(&rt)));
    match outcome {
        Ok(Ok(())) => match rt.finalize() {
            Ok(()) => ImageExit::Normal,
            Err(e) => ImageExit::Error(e.to_string()),
        },
        Ok(Err(CoralError::Shutdown { code })) => {
            debug!(image = rt.this_image(), code, "image shut down");
            ImageExit::Stopped { code }
        }
        Ok(Err(e)) => {
            let _ = rt.finalize();
            ImageExit::Error(e.to_string())
        }
        Err(panic) => {
            escape.kill_self();
            let msg = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "opaque panic payload".into());
            ImageExit::Panicked(msg)
        }
    }
}

/// Builder for a [`Coral`] fleet.
pub struct CoralBuilder {
    num_images: usize,
    config: RuntimeConfig,
}

impl CoralBuilder {
    /// Create a builder with a single image and default configuration.
    pub fn new() -> Self {
        Self {
            num_images: 1,
            config: RuntimeConfig::default(),
        }
    }

    /// Set the number of images.
    pub fn num_images(mut self, n: usize) -> Self {
        self.num_images = n;
        self
    }

    /// Replace the runtime configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable failure handling.
    pub fn failure_handling(mut self, enable: bool) -> Self {
        self.config.failure_handling = enable;
        self
    }

    /// Finish building.
    pub fn build(self) -> Coral {
        Coral {
            num_images: self.num_images,
            config: self.config,
        }
    }
}

impl Default for CoralBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_image_fleet() {
        let report = Coral::builder()
            .num_images(1)
            .build()
            .launch(|rt| {
                assert_eq!(rt.this_image(), 1);
                assert_eq!(rt.num_images(), 1);
                rt.sync_all()?;
                Ok(())
            })
            .unwrap();
        assert!(report.all_normal());
    }

    #[test]
    fn test_stop_reports_exit_code() {
        let report = Coral::builder()
            .num_images(1)
            .build()
            .launch(|rt| Err(rt.stop_numeric(3)))
            .unwrap();
        assert_eq!(*report.image(1), ImageExit::Stopped { code: 3 });
    }

    #[test]
    fn test_builder_defaults() {
        let fleet = Coral::builder().build();
        assert_eq!(fleet.num_images(), 1);
    }
}
