//! # Coral Shmem
//!
//! In-process shared-memory transport for the Coral PGAS runtime.
//!
//! Every image is a thread of one process; windows are shared byte regions
//! guarded by shared/exclusive epoch locks, the dynamic window is a table of
//! attached address ranges, tagged messaging and collectives are condvar
//! rendezvous. This is the transport the test suite runs on, playing the
//! role a CPU backend plays for a GPU runtime: always available, faithful to
//! the contract, and able to simulate image failure for the recovery paths.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use coral_core::{Runtime, RuntimeConfig};
//! use coral_shmem::ShmemWorld;
//!
//! let world = ShmemWorld::new(4);
//! let handles: Vec<_> = (0..4)
//!     .map(|r| {
//!         let transport = world.transport(r);
//!         std::thread::spawn(move || {
//!             let rt = Runtime::init(transport, RuntimeConfig::default()).unwrap();
//!             // ... coarray program ...
//!             rt.finalize().unwrap();
//!         })
//!     })
//!     .collect();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

mod transport;
mod world;

pub use transport::ShmemTransport;
pub use world::ShmemWorld;
