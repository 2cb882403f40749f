//! Shared scalar types of the runtime: image indexing, element types,
//! status words and registration kinds.

/// 1-based index of an image. In atomics and locks, `0` means "this image".
pub type ImageIndex = usize;

/// Message tag reserved for the subset-sync protocol. No other traffic may
/// use this tag on the runtime's communicator.
pub const SYNC_IMAGES_TAG: i32 = 424242;

/// Maximum supported array rank.
pub const MAX_DIMS: usize = 15;

/// Size of a remote pointer as stored inside window memory.
pub const PTR_SIZE: usize = std::mem::size_of::<u64>();

/// Integer status codes of the public ABI.
///
/// Every public operation reports one of these through its optional `stat`
/// output. `OK` is guaranteed to be zero.
pub mod stat {
    /// Success.
    pub const OK: i32 = 0;
    /// Generic failure with no more specific classification.
    pub const GENERIC: i32 = 1;
    /// The image set passed to `sync_images` contains a duplicate index.
    pub const DUP_SYNC_IMAGES: i32 = 3;
    /// A lock operation found the slot already held by this image.
    pub const ALREADY_LOCKED: i32 = 99;
    /// A peer involved in the operation has stopped.
    pub const STOPPED_IMAGE: i32 = 6000;
    /// A peer involved in the operation has failed.
    pub const FAILED_IMAGE: i32 = 6001;
}

/// The per-image status word kept in the dedicated status window.
///
/// The numeric values are shared with the `stat` code space so that a status
/// word received on the sync tag can be compared against
/// [`stat::STOPPED_IMAGE`] directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageStatus {
    /// The image is executing normally.
    #[default]
    Running,
    /// The image has executed a normal or error stop.
    Stopped,
    /// The image is known to have failed.
    Failed,
}

impl ImageStatus {
    /// Encode the status word for publication in the status window.
    pub fn to_word(self) -> i32 {
        match self {
            ImageStatus::Running => 0,
            ImageStatus::Stopped => stat::STOPPED_IMAGE,
            ImageStatus::Failed => stat::FAILED_IMAGE,
        }
    }

    /// Decode a status word read from a peer's status window.
    pub fn from_word(word: i32) -> Self {
        match word {
            stat::STOPPED_IMAGE => ImageStatus::Stopped,
            stat::FAILED_IMAGE => ImageStatus::Failed,
            _ => ImageStatus::Running,
        }
    }
}

/// Element type of a descriptor, mirroring the front-end's type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ElemType {
    /// Fixed-width signed integer.
    Integer = 1,
    /// Logical, stored as an integer of the kind's width.
    Logical = 2,
    /// IEEE floating point.
    Real = 3,
    /// Pair of reals.
    Complex = 4,
    /// Derived type; moved byte-wise, never converted.
    Derived = 5,
    /// Character; the kind is the code-unit width (1 or 4).
    Character = 6,
}

impl ElemType {
    /// Decode a wire type code.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => ElemType::Integer,
            2 => ElemType::Logical,
            3 => ElemType::Real,
            4 => ElemType::Complex,
            5 => ElemType::Derived,
            6 => ElemType::Character,
            _ => return None,
        })
    }

    /// Whether values of this type participate in numeric kind conversion.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ElemType::Integer | ElemType::Logical | ElemType::Real | ElemType::Complex
        )
    }
}

/// What kind of object a `register` call creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// A plain coarray; the window covers `size` bytes of payload.
    Coarray,
    /// Token-only registration; memory is attached by a later allocation.
    RegisterOnly,
    /// A lock coarray: `size` integer slots, zero-initialized.
    Lock,
    /// An event coarray: `size` counters, zero-initialized.
    Event,
    /// A critical-section token: one integer slot, zero-initialized.
    Critical,
}

impl RegisterKind {
    /// Whether the window payload is integer slots rather than raw bytes.
    pub fn is_integer_slots(self) -> bool {
        matches!(
            self,
            RegisterKind::Lock | RegisterKind::Event | RegisterKind::Critical
        )
    }
}

/// Mode argument of `deregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregisterMode {
    /// Release the window and the token record.
    Full,
    /// Detach and free the memory but keep the token alive for a later
    /// re-allocation. Skips the pre-deregistration sync.
    DeallocateOnly,
}
