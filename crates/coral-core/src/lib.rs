//! # Coral Core
//!
//! Core traits and engine of the Coral PGAS runtime: N symmetric images in
//! which any image may read, write, atomically update, synchronize with, or
//! collectively reduce memory owned by any other image, over a
//! message-passing transport providing one-sided RMA.
//!
//! ## Core Abstractions
//!
//! - [`Transport`] - the RMA/messaging contract the runtime needs
//! - [`Runtime`] - one per image; owns registries, communicators, status
//! - [`Token`] - opaque handle of one registered coarray or component
//! - [`Descriptor`] - multi-dimensional shape/layout metadata
//! - [`RefNode`] - one selector of a remote reference chain
//!
//! ## Example
//!
//! ```ignore
//! use coral_core::prelude::*;
//!
//! let rt = Runtime::init(transport, RuntimeConfig::default())?;
//! let token = rt.register(40, RegisterKind::Coarray, Some(desc))?;
//! rt.sync_all()?;
//! rt.get(token, 0, 1, &remote, &local, buf.bytes_mut(), false)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod atomics;
pub mod collectives;
pub mod config;
pub mod convert;
pub mod descriptor;
pub mod epoch;
pub mod error;
pub mod failure;
pub mod lifecycle;
pub mod refwalk;
pub mod registry;
pub mod runtime;
pub mod strided;
pub mod sync;
pub mod transfer;
pub mod transport;
pub mod types;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::atomics::AtomicOpCode;
    pub use crate::collectives::ReduceOperator;
    pub use crate::config::{EpochStyle, RuntimeConfig, RuntimeConfigBuilder, StridedStrategy};
    pub use crate::descriptor::{Descriptor, Dim, LocalArray};
    pub use crate::error::{CoralError, Result};
    pub use crate::refwalk::{ArrayRefDim, RefNode};
    pub use crate::registry::Token;
    pub use crate::runtime::Runtime;
    pub use crate::sync::ImageSet;
    pub use crate::transport::Transport;
    pub use crate::types::{
        stat, DeregisterMode, ElemType, ImageIndex, ImageStatus, RegisterKind,
    };
}

// Re-exports for convenience
pub use config::{EpochStyle, RuntimeConfig, StridedStrategy};
pub use descriptor::{Descriptor, Dim, LocalArray};
pub use error::{CoralError, Result};
pub use refwalk::{ArrayRefDim, RefNode};
pub use registry::Token;
pub use runtime::Runtime;
pub use sync::ImageSet;
pub use transport::{Transport, TransportError, WinId};
pub use types::{DeregisterMode, ElemType, ImageIndex, ImageStatus, RegisterKind};
