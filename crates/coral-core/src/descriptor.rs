//! The array descriptor model: multi-dimensional shape and layout metadata
//! for every object the runtime moves, plus the fixed POD wire image used
//! when a descriptor is fetched from a remote image.

use bytemuck::{Pod, Zeroable};

use crate::error::{CoralError, Result};
use crate::types::{ElemType, MAX_DIMS};

/// One dimension of a descriptor. Bounds are inclusive, the stride is in
/// elements (not bytes) and may be negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dim {
    /// Lower bound.
    pub lower: i64,
    /// Upper bound.
    pub upper: i64,
    /// Distance between consecutive elements along this dimension.
    pub stride: i64,
}

impl Dim {
    /// A dimension `lower..=upper` with unit stride.
    pub fn new(lower: i64, upper: i64, stride: i64) -> Self {
        Self { lower, upper, stride }
    }

    /// Number of elements along this dimension; empty ranges count as zero.
    pub fn extent(&self) -> i64 {
        (self.upper - self.lower + 1).max(0)
    }
}

/// Shape and layout of an array: rank, per-dimension bounds and strides,
/// element size and element type/kind.
///
/// Rank 0 describes a scalar. The logical linear byte offset of the element
/// with multi-index `(i0, …)` is `Σ (ij − lbj) · stridej · elem_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Element type.
    pub elem_type: ElemType,
    /// Element kind (scalar width in bytes; code-unit width for CHARACTER).
    pub elem_kind: u32,
    /// Element size in bytes.
    pub elem_size: usize,
    rank: u8,
    dims: [Dim; MAX_DIMS],
}

impl Descriptor {
    /// Describe a scalar.
    pub fn scalar(elem_type: ElemType, elem_kind: u32, elem_size: usize) -> Self {
        Self {
            elem_type,
            elem_kind,
            elem_size,
            rank: 0,
            dims: [Dim::default(); MAX_DIMS],
        }
    }

    /// Describe an array with the given dimensions.
    pub fn array(
        elem_type: ElemType,
        elem_kind: u32,
        elem_size: usize,
        dims: &[Dim],
    ) -> Result<Self> {
        if dims.len() > MAX_DIMS {
            return Err(CoralError::RankOutOfRange(dims.len()));
        }
        let mut d = Self::scalar(elem_type, elem_kind, elem_size);
        d.rank = dims.len() as u8;
        d.dims[..dims.len()].copy_from_slice(dims);
        Ok(d)
    }

    /// A contiguous rank-1 array `1..=len` with unit stride.
    pub fn vector(elem_type: ElemType, elem_kind: u32, elem_size: usize, len: i64) -> Self {
        let mut d = Self::scalar(elem_type, elem_kind, elem_size);
        d.rank = 1;
        d.dims[0] = Dim::new(1, len, 1);
        d
    }

    /// Array rank; 0 for scalars.
    pub fn rank(&self) -> usize {
        self.rank as usize
    }

    /// The used dimensions.
    pub fn dims(&self) -> &[Dim] {
        &self.dims[..self.rank as usize]
    }

    /// One dimension.
    pub fn dim(&self, j: usize) -> &Dim {
        &self.dims[j]
    }

    /// Mutable access to the used dimensions.
    pub fn dims_mut(&mut self) -> &mut [Dim] {
        &mut self.dims[..self.rank as usize]
    }

    /// Total element count; the product of the per-dimension extents, with
    /// empty dimensions collapsing the whole count to zero. Scalars count 1.
    pub fn element_count(&self) -> usize {
        let mut count: i64 = 1;
        for d in self.dims() {
            count *= d.extent();
        }
        count.max(0) as usize
    }

    /// Payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.element_count() * self.elem_size
    }

    /// Whether the elements are laid out densely in memory: unit stride in
    /// the first dimension and each further stride equal to the product of
    /// the preceding extents. Scalars are contiguous.
    pub fn is_contiguous(&self) -> bool {
        let mut expected: i64 = 1;
        for d in self.dims() {
            if d.stride != expected {
                return false;
            }
            expected *= d.extent();
        }
        true
    }

    /// Byte offset of the element with the given multi-index.
    pub fn byte_offset(&self, index: &[i64]) -> i64 {
        let mut off: i64 = 0;
        for (d, &i) in self.dims().iter().zip(index) {
            off += (i - d.lower) * d.stride;
        }
        off * self.elem_size as i64
    }
}

// ============================================================================
// Wire image
// ============================================================================

/// Fixed header of the serialized descriptor image.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct RawHeader {
    /// Remote base address of the data (a dynamic-window address).
    pub base_addr: u64,
    /// Element size in bytes.
    pub elem_size: u64,
    /// Element type code.
    pub elem_type: i32,
    /// Element kind.
    pub elem_kind: i32,
    /// Rank.
    pub rank: i32,
    _pad: i32,
}

/// One serialized dimension triple.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct RawDim {
    /// Lower bound.
    pub lower: i64,
    /// Upper bound.
    pub upper: i64,
    /// Stride in elements.
    pub stride: i64,
}

/// Length of the serialized header.
pub const RAW_HEADER_LEN: usize = std::mem::size_of::<RawHeader>();
/// Length of one serialized dimension.
pub const RAW_DIM_LEN: usize = std::mem::size_of::<RawDim>();
/// Largest possible serialized descriptor.
pub const MAX_RAW_LEN: usize = RAW_HEADER_LEN + MAX_DIMS * RAW_DIM_LEN;

/// Serialized length of a descriptor of the given rank.
pub const fn encoded_len(rank: usize) -> usize {
    RAW_HEADER_LEN + rank * RAW_DIM_LEN
}

impl Descriptor {
    /// Serialize into `out` as `(fixed header + rank · per-dim triple)`.
    /// Returns the number of bytes written.
    pub fn encode(&self, base_addr: u64, out: &mut [u8]) -> usize {
        let header = RawHeader {
            base_addr,
            elem_size: self.elem_size as u64,
            elem_type: self.elem_type as i32,
            elem_kind: self.elem_kind as i32,
            rank: self.rank as i32,
            _pad: 0,
        };
        out[..RAW_HEADER_LEN].copy_from_slice(bytemuck::bytes_of(&header));
        let mut at = RAW_HEADER_LEN;
        for d in self.dims() {
            let raw = RawDim {
                lower: d.lower,
                upper: d.upper,
                stride: d.stride,
            };
            out[at..at + RAW_DIM_LEN].copy_from_slice(bytemuck::bytes_of(&raw));
            at += RAW_DIM_LEN;
        }
        at
    }

    /// Deserialize a descriptor image fetched from a remote window.
    /// Returns the remote base address alongside the shape.
    pub fn decode(bytes: &[u8]) -> Result<(u64, Descriptor)> {
        if bytes.len() < RAW_HEADER_LEN {
            return Err(CoralError::invalid_reference("short descriptor image"));
        }
        let header: RawHeader = bytemuck::pod_read_unaligned(&bytes[..RAW_HEADER_LEN]);
        let rank = header.rank as usize;
        if header.rank < 0 || rank > MAX_DIMS {
            return Err(CoralError::RankOutOfRange(header.rank.max(0) as usize));
        }
        let elem_type = ElemType::from_code(header.elem_type)
            .ok_or_else(|| CoralError::invalid_reference("unknown element type code"))?;
        if bytes.len() < encoded_len(rank) {
            return Err(CoralError::invalid_reference("short descriptor image"));
        }
        let mut desc = Descriptor::scalar(elem_type, header.elem_kind as u32, header.elem_size as usize);
        desc.rank = rank as u8;
        let mut at = RAW_HEADER_LEN;
        for j in 0..rank {
            let raw: RawDim = bytemuck::pod_read_unaligned(&bytes[at..at + RAW_DIM_LEN]);
            desc.dims[j] = Dim::new(raw.lower, raw.upper, raw.stride);
            at += RAW_DIM_LEN;
        }
        Ok((header.base_addr, desc))
    }
}

// ============================================================================
// Local arrays
// ============================================================================

/// An owned local array: a byte buffer plus the descriptor describing it.
///
/// This is the destination type of `get_by_ref`: it may start unallocated
/// and be (re)allocated by the walker to match the referenced section.
#[derive(Debug, Clone)]
pub struct LocalArray {
    buf: Vec<u8>,
    desc: Descriptor,
    allocated: bool,
}

impl LocalArray {
    /// Allocate a zero-initialized array of the given shape.
    pub fn new(desc: Descriptor) -> Self {
        let len = desc.byte_len();
        Self {
            buf: vec![0u8; len],
            desc,
            allocated: true,
        }
    }

    /// An unallocated destination of the given element type and rank; the
    /// bounds are established by the first (re)allocation.
    pub fn unallocated(elem_type: ElemType, elem_kind: u32, elem_size: usize, rank: usize) -> Self {
        let mut desc = Descriptor::scalar(elem_type, elem_kind, elem_size);
        desc.rank = rank.min(MAX_DIMS) as u8;
        for d in desc.dims_mut() {
            *d = Dim::new(1, 0, 1);
        }
        Self {
            buf: Vec::new(),
            desc,
            allocated: false,
        }
    }

    /// Build from typed elements laid out per `desc`.
    pub fn from_elements<T: bytemuck::NoUninit>(desc: Descriptor, elems: &[T]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(elems);
        if bytes.len() != desc.byte_len() {
            return Err(CoralError::extent("element data does not match descriptor"));
        }
        Ok(Self {
            buf: bytes.to_vec(),
            desc,
            allocated: true,
        })
    }

    /// The descriptor.
    pub fn desc(&self) -> &Descriptor {
        &self.desc
    }

    /// Mutable descriptor access.
    pub fn desc_mut(&mut self) -> &mut Descriptor {
        &mut self.desc
    }

    /// Whether the buffer is currently allocated.
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// The raw payload.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The raw payload, mutably.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Drop the payload but keep the element type and rank, returning to
    /// the unallocated state.
    pub fn deallocate(&mut self) {
        self.buf = Vec::new();
        for d in self.desc.dims_mut() {
            *d = Dim::new(1, 0, 1);
        }
        self.allocated = false;
    }

    /// Replace shape and storage; the new payload is zero-initialized.
    pub fn reallocate(&mut self, desc: Descriptor) {
        self.buf = vec![0u8; desc.byte_len()];
        self.desc = desc;
        self.allocated = true;
    }

    /// Copy the payload out as typed elements.
    pub fn to_elements<T: bytemuck::AnyBitPattern + bytemuck::Pod>(&self) -> Vec<T> {
        bytemuck::pod_collect_to_vec(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32_vec(len: i64) -> Descriptor {
        Descriptor::vector(ElemType::Integer, 4, 4, len)
    }

    #[test]
    fn test_element_count() {
        assert_eq!(i32_vec(10).element_count(), 10);
        assert_eq!(Descriptor::scalar(ElemType::Real, 8, 8).element_count(), 1);

        let d = Descriptor::array(
            ElemType::Integer,
            4,
            4,
            &[Dim::new(1, 4, 1), Dim::new(1, 4, 4)],
        )
        .unwrap();
        assert_eq!(d.element_count(), 16);

        let empty = Descriptor::array(ElemType::Integer, 4, 4, &[Dim::new(1, 0, 1)]).unwrap();
        assert_eq!(empty.element_count(), 0);
    }

    #[test]
    fn test_contiguity() {
        assert!(i32_vec(10).is_contiguous());
        assert!(Descriptor::scalar(ElemType::Integer, 4, 4).is_contiguous());

        let dense = Descriptor::array(
            ElemType::Integer,
            4,
            4,
            &[Dim::new(1, 4, 1), Dim::new(1, 4, 4)],
        )
        .unwrap();
        assert!(dense.is_contiguous());

        let section = Descriptor::array(
            ElemType::Integer,
            4,
            4,
            &[Dim::new(1, 2, 2), Dim::new(1, 2, 8)],
        )
        .unwrap();
        assert!(!section.is_contiguous());
    }

    #[test]
    fn test_byte_offset() {
        let d = Descriptor::array(
            ElemType::Integer,
            4,
            4,
            &[Dim::new(1, 4, 1), Dim::new(1, 4, 4)],
        )
        .unwrap();
        assert_eq!(d.byte_offset(&[1, 1]), 0);
        assert_eq!(d.byte_offset(&[2, 1]), 4);
        assert_eq!(d.byte_offset(&[1, 2]), 16);
        assert_eq!(d.byte_offset(&[3, 3]), (2 + 8) * 4);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let d = Descriptor::array(
            ElemType::Real,
            8,
            8,
            &[Dim::new(-2, 7, 1), Dim::new(1, 3, 10)],
        )
        .unwrap();
        let mut buf = [0u8; MAX_RAW_LEN];
        let n = d.encode(0xdead_beef, &mut buf);
        assert_eq!(n, encoded_len(2));

        let (base, back) = Descriptor::decode(&buf[..n]).unwrap();
        assert_eq!(base, 0xdead_beef);
        assert_eq!(back, d);
    }

    #[test]
    fn test_decode_rejects_bad_rank() {
        let d = Descriptor::scalar(ElemType::Integer, 4, 4);
        let mut buf = [0u8; MAX_RAW_LEN];
        d.encode(0, &mut buf);
        // Corrupt the rank field.
        buf[24] = 0xff;
        assert!(matches!(
            Descriptor::decode(&buf),
            Err(CoralError::RankOutOfRange(_))
        ));
    }

    #[test]
    fn test_local_array_reallocation() {
        let mut a = LocalArray::unallocated(ElemType::Integer, 4, 4, 1);
        assert!(!a.is_allocated());
        assert_eq!(a.bytes().len(), 0);
        assert_eq!(a.desc().rank(), 1);
        assert_eq!(a.desc().element_count(), 0);

        a.reallocate(i32_vec(5));
        assert!(a.is_allocated());
        assert_eq!(a.bytes().len(), 20);

        a.deallocate();
        assert!(!a.is_allocated());
        assert_eq!(a.desc().element_count(), 0);
    }

    #[test]
    fn test_local_array_elements() {
        let a = LocalArray::from_elements(i32_vec(4), &[1i32, 2, 3, 4]).unwrap();
        assert_eq!(a.to_elements::<i32>(), vec![1, 2, 3, 4]);
    }
}
