//! The reference walker: traversal of nested component and array references
//! on a remote image.
//!
//! A reference chain selects a sub-object of a remote coarray: component
//! selectors walk into derived types (dereferencing allocatable/pointer
//! components by fetching their remote address at use time), array selectors
//! pick sections whose bounds come either from a descriptor fetched from the
//! remote image or from the selector itself.
//!
//! `get_by_ref` runs in two passes: a planning pass that follows every
//! pointer, sizes the result and validates (or reallocates) the destination,
//! and a copy pass that recursively descends the chain issuing one leaf
//! transfer per element.

use tracing::trace;

use crate::convert::{convert_char, convert_elem, space_fill};
use crate::descriptor::{encoded_len, Descriptor, Dim, LocalArray, MAX_RAW_LEN};
use crate::error::{CoralError, Result};
use crate::registry::Token;
use crate::runtime::Runtime;
use crate::transport::{LockMode, WinId};
use crate::types::{ElemType, ImageIndex, MAX_DIMS, PTR_SIZE};

/// One dimension of an array selector.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayRefDim {
    /// A single subscript.
    Single(i64),
    /// `start:end:stride`.
    Range {
        /// First subscript.
        start: i64,
        /// Last subscript.
        end: i64,
        /// Subscript step; may be negative.
        stride: i64,
    },
    /// `:end:stride`, starting at the array's lower bound.
    OpenStart {
        /// Last subscript.
        end: i64,
        /// Subscript step.
        stride: i64,
    },
    /// `start::stride`, running to the array's upper bound.
    OpenEnd {
        /// First subscript.
        start: i64,
        /// Subscript step.
        stride: i64,
    },
    /// The whole dimension, possibly strided.
    Full {
        /// Subscript step.
        stride: i64,
    },
    /// An explicit vector of subscripts.
    Vector {
        /// Integer kind the front-end stored the indices in.
        kind: u32,
        /// The subscripts, widened.
        indices: Vec<i64>,
    },
}

/// One node of a reference chain.
#[derive(Debug, Clone, PartialEq)]
pub enum RefNode {
    /// A component selector.
    ///
    /// `offset` locates the component inside the current object. A nonzero
    /// `token_offset` marks an allocatable/pointer component: the component
    /// slot is an embedded descriptor whose leading pointer must be
    /// dereferenced before continuing, with the slave-token handle stored at
    /// `token_offset`.
    Component {
        /// Byte offset of the component.
        offset: u64,
        /// Byte offset of the slave-token handle; 0 for plain components.
        token_offset: u64,
        /// Size of the referenced item in bytes.
        item_size: usize,
    },
    /// An array selector whose bounds come from the remote descriptor.
    Array {
        /// Element size in bytes.
        item_size: usize,
        /// One selector per dimension.
        dims: Vec<ArrayRefDim>,
    },
    /// An array selector carrying its own (absolute) bounds; no remote
    /// descriptor is consulted.
    StaticArray {
        /// Element size in bytes.
        item_size: usize,
        /// Element type of the static array.
        elem_type: ElemType,
        /// Element kind of the static array.
        elem_kind: u32,
        /// One selector per dimension, with absolute element offsets.
        dims: Vec<ArrayRefDim>,
    },
}

impl RefNode {
    fn item_size(&self) -> usize {
        match self {
            RefNode::Component { item_size, .. }
            | RefNode::Array { item_size, .. }
            | RefNode::StaticArray { item_size, .. } => *item_size,
        }
    }
}

/// Number of items between `lb` and `ub` with the given stride, honoring
/// the traversal direction; 0 means the section is empty.
fn compute_num_items(stride: i64, lb: i64, ub: i64) -> i64 {
    let abs_stride = stride.abs();
    let num = if stride > 0 { ub + 1 - lb } else { lb + 1 - ub };
    if num <= 0 || abs_stride < 1 {
        return 0;
    }
    if abs_stride > 1 {
        1 + (num - 1) / abs_stride
    } else {
        num
    }
}

fn check_vector_kind(kind: u32) -> Result<()> {
    if matches!(kind, 1 | 2 | 4 | 8) {
        Ok(())
    } else {
        Err(CoralError::invalid_reference(
            "vector subscript of unsupported integer kind",
        ))
    }
}

/// Where remote bytes currently live: the master window, or the dynamic
/// window at an absolute base address learned from a pointer fetch.
#[derive(Debug, Clone, Copy)]
enum Space {
    Win,
    Dyn { base: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    space: Space,
    offset: i64,
}

impl Cursor {
    fn start() -> Self {
        Cursor {
            space: Space::Win,
            offset: 0,
        }
    }

    fn advanced(self, delta: i64) -> Self {
        Cursor {
            space: self.space,
            offset: self.offset + delta,
        }
    }
}

/// Shared context of one walk.
struct Walk<'rt> {
    rt: &'rt Runtime,
    rank: usize,
    win: WinId,
    dyn_win: WinId,
    token_desc: Option<Descriptor>,
}

impl<'rt> Walk<'rt> {
    fn new(rt: &'rt Runtime, token: Token, image: ImageIndex) -> Result<Self> {
        Ok(Walk {
            rt,
            rank: image - 1,
            win: rt.lookup(token)?,
            dyn_win: rt.t().dynamic_win(),
            token_desc: rt.token_desc(token)?,
        })
    }

    fn lock_both(&self) {
        self.rt
            .epochs()
            .lock(self.rt.t(), LockMode::Shared, self.rank, self.dyn_win);
        self.rt
            .epochs()
            .lock(self.rt.t(), LockMode::Shared, self.rank, self.win);
    }

    fn unlock_both(&self) {
        self.rt.epochs().unlock(self.rt.t(), self.rank, self.win);
        self.rt.epochs().unlock(self.rt.t(), self.rank, self.dyn_win);
    }

    /// Read remote bytes at a cursor, through the owning window or the
    /// dynamic window as the cursor dictates.
    fn fetch(&self, at: Cursor, out: &mut [u8]) -> Result<()> {
        match at.space {
            Space::Win => self
                .rt
                .t()
                .get(self.win, self.rank, at.offset as u64, out)?,
            Space::Dyn { base } => self.rt.t().get(
                self.dyn_win,
                self.rank,
                base.wrapping_add(at.offset as u64),
                out,
            )?,
        }
        Ok(())
    }

    /// Dereference a remote pointer slot.
    fn fetch_ptr(&self, at: Cursor) -> Result<u64> {
        let mut buf = [0u8; PTR_SIZE];
        self.fetch(at, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Fetch and decode a remote descriptor of the given rank.
    fn fetch_desc(&self, at: Cursor, rank: usize) -> Result<(u64, Descriptor)> {
        if rank > MAX_DIMS {
            return Err(CoralError::RankOutOfRange(rank));
        }
        let mut image = [0u8; MAX_RAW_LEN];
        let len = encoded_len(rank);
        self.fetch(at, &mut image[..len])?;
        Descriptor::decode(&image[..len])
    }
}

/// Bookkeeping of the planning pass over the destination descriptor.
struct Plan {
    size: i64,
    item_size: usize,
    dst_cur_dim: usize,
    in_array_ref: bool,
    array_extent_fixed: bool,
    realloc_needed: bool,
    realloc_required: bool,
}

impl Plan {
    /// Account one non-scalar extent `delta` of an array selector against
    /// the destination, growing/validating it per the reallocation rules.
    /// `reset_leading` carries the remote rank for selectors whose
    /// descriptor is known, enabling the leading-dims reset.
    fn enter_extent(
        &mut self,
        dst: &mut Descriptor,
        dim_idx: usize,
        delta: i64,
        reset_leading: Option<usize>,
        dst_reallocatable: bool,
    ) -> Result<()> {
        let dst_rank = dst.rank();
        if delta > 1 && dst_rank == 0 {
            return Err(CoralError::extent("array required but scalar destination"));
        }
        if dst_rank == 0 {
            return Ok(());
        }
        if self.dst_cur_dim >= dst_rank && delta != 1 {
            return Err(CoralError::RankOutOfRange(self.dst_cur_dim));
        }
        if delta != 1 {
            if !self.in_array_ref {
                if self.array_extent_fixed {
                    return Err(CoralError::DoubleArrayReference);
                }
                self.in_array_ref = true;
                match reset_leading {
                    Some(src_rank) if dim_idx > 0 && dst_rank == src_rank => {
                        if dst_reallocatable {
                            // Scalars so far; collapse the leading dims.
                            for d in 0..dim_idx {
                                dst.dims_mut()[d] = Dim::new(1, 1, 1);
                            }
                            self.dst_cur_dim = dim_idx;
                        } else {
                            self.dst_cur_dim = dim_idx;
                        }
                    }
                    None if dim_idx > 0 => self.dst_cur_dim = dim_idx.min(dst_rank - 1),
                    _ => {}
                }
            }
            let extent_mismatch =
                self.realloc_required || dst.dim(self.dst_cur_dim).extent() != delta;
            if self.realloc_required || self.realloc_needed || extent_mismatch {
                if !dst_reallocatable {
                    return Err(CoralError::NonReallocatableExtentMismatch {
                        needed: delta as usize,
                        have: dst.dim(self.dst_cur_dim).extent() as usize,
                    });
                }
                self.realloc_needed = true;
            }
            if extent_mismatch {
                dst.dims_mut()[self.dst_cur_dim] = Dim {
                    lower: 1,
                    upper: delta,
                    stride: self.size,
                };
            }
        }
        if self.in_array_ref && self.dst_cur_dim < dst_rank {
            self.dst_cur_dim += 1;
        }
        self.size *= delta;
        Ok(())
    }

    fn close_array_ref(&mut self) {
        if self.in_array_ref {
            self.array_extent_fixed = true;
            self.in_array_ref = false;
        }
    }
}

impl Runtime {
    /// Fetch the sub-object selected by `refs` of the coarray identified by
    /// `token` on `image` into `dst`, reallocating `dst` when permitted.
    pub fn get_by_ref(
        &self,
        token: Token,
        image: ImageIndex,
        refs: &[RefNode],
        dst: &mut LocalArray,
        dst_reallocatable: bool,
    ) -> Result<()> {
        if refs.is_empty() {
            return Err(CoralError::invalid_reference("empty reference chain"));
        }
        self.check_image_health(image)?;
        let walk = Walk::new(self, token, image)?;
        trace!(image, ?token, refs = refs.len(), "get_by_ref");

        walk.lock_both();
        let result = self.get_by_ref_locked(&walk, refs, dst, dst_reallocatable);
        walk.unlock_both();
        result
    }

    fn get_by_ref_locked(
        &self,
        walk: &Walk<'_>,
        refs: &[RefNode],
        dst: &mut LocalArray,
        dst_reallocatable: bool,
    ) -> Result<()> {
        let plan = self.plan_refs(walk, refs, dst, dst_reallocatable)?;
        let size = match plan {
            Some((size, _item_size)) => size,
            None => return Ok(()), // empty selection
        };

        let mut copy = CopyPass {
            walk,
            dst,
            copied: 0,
        };
        copy.descend(
            refs,
            0,
            walk.token_desc.clone(),
            Cursor::start(),
            Cursor::start(),
            0,
            0,
            0,
            1,
        )?;
        debug_assert!(copy.copied <= size as usize);
        Ok(())
    }

    /// Pass 1: follow the chain, size the selection and prepare `dst`.
    /// Returns `None` when the selection is empty.
    fn plan_refs(
        &self,
        walk: &Walk<'_>,
        refs: &[RefNode],
        dst: &mut LocalArray,
        dst_reallocatable: bool,
    ) -> Result<Option<(i64, usize)>> {
        let mut plan = Plan {
            size: 1,
            item_size: 0,
            dst_cur_dim: 0,
            in_array_ref: false,
            array_extent_fixed: false,
            realloc_needed: !dst.is_allocated(),
            realloc_required: !dst.is_allocated(),
        };
        let mut data = Cursor::start();
        let mut desc = Cursor::start();

        for node in refs {
            match node {
                RefNode::Component {
                    offset,
                    token_offset,
                    ..
                } => {
                    if *token_offset > 0 {
                        data = data.advanced(*offset as i64);
                        // The embedded descriptor starts with the data
                        // pointer; remember where it lives, then follow it.
                        desc = data;
                        let base = walk.fetch_ptr(data)?;
                        data = Cursor {
                            space: Space::Dyn { base },
                            offset: 0,
                        };
                    } else {
                        data = data.advanced(*offset as i64);
                        desc = desc.advanced(*offset as i64);
                    }
                }
                RefNode::Array { item_size, dims } => {
                    // Bounds come from the remote image: either the fetched
                    // descriptor (after a pointer component) or the token's
                    // descriptor, which is symmetric across images.
                    let remote = match data.space {
                        Space::Dyn { .. } => {
                            let (_, d) = walk.fetch_desc(desc, dims.len())?;
                            d
                        }
                        Space::Win => walk.token_desc.clone().ok_or_else(|| {
                            CoralError::invalid_reference("array reference on scalar coarray")
                        })?,
                    };
                    if dims.len() > remote.rank() {
                        return Err(CoralError::RankOutOfRange(dims.len()));
                    }
                    for (i, sel) in dims.iter().enumerate() {
                        let rd = *remote.dim(i);
                        let (delta, start_off) = match sel {
                            ArrayRefDim::Vector { kind, indices } => {
                                check_vector_kind(*kind)?;
                                let first = *indices.first().ok_or_else(|| {
                                    CoralError::invalid_reference("empty vector subscript")
                                })?;
                                (indices.len() as i64, (first - rd.lower) * rd.stride)
                            }
                            ArrayRefDim::Full { stride } => {
                                (compute_num_items(*stride, rd.lower, rd.upper), 0)
                            }
                            ArrayRefDim::Range { start, end, stride } => (
                                compute_num_items(*stride, *start, *end),
                                (*start - rd.lower) * rd.stride,
                            ),
                            ArrayRefDim::Single(at) => (1, (*at - rd.lower) * rd.stride),
                            ArrayRefDim::OpenEnd { start, stride } => (
                                compute_num_items(*stride, *start, rd.upper),
                                (*start - rd.lower) * rd.stride,
                            ),
                            ArrayRefDim::OpenStart { end, stride } => {
                                (compute_num_items(*stride, rd.lower, *end), 0)
                            }
                        };
                        if delta <= 0 {
                            return Ok(None);
                        }
                        data = data.advanced(start_off * *item_size as i64);
                        plan.enter_extent(
                            dst.desc_mut(),
                            i,
                            delta,
                            Some(remote.rank()),
                            dst_reallocatable,
                        )?;
                    }
                    plan.close_array_ref();
                }
                RefNode::StaticArray { item_size, dims, .. } => {
                    for (i, sel) in dims.iter().enumerate() {
                        let (delta, start_off) = match sel {
                            ArrayRefDim::Vector { kind, indices } => {
                                check_vector_kind(*kind)?;
                                let first = *indices.first().ok_or_else(|| {
                                    CoralError::invalid_reference("empty vector subscript")
                                })?;
                                (indices.len() as i64, first)
                            }
                            ArrayRefDim::Range { start, end, stride } => {
                                (compute_num_items(*stride, *start, *end), *start * *stride)
                            }
                            ArrayRefDim::Single(at) => (1, *at),
                            _ => {
                                return Err(CoralError::invalid_reference(
                                    "unknown array reference kind in static selector",
                                ))
                            }
                        };
                        if delta <= 0 {
                            return Ok(None);
                        }
                        data = data.advanced(start_off * *item_size as i64);
                        plan.enter_extent(dst.desc_mut(), i, delta, None, dst_reallocatable)?;
                    }
                    plan.close_array_ref();
                }
            }
            plan.item_size = node.item_size();
        }

        if plan.size == 0 || plan.item_size == 0 {
            return Ok(None);
        }

        if plan.realloc_needed {
            if !plan.array_extent_fixed {
                // A scalar result into an array destination.
                let rank = dst.desc().rank();
                for d in 0..rank {
                    dst.desc_mut().dims_mut()[d] = Dim::new(1, 1, 1);
                }
            }
            let new_desc = dst.desc().clone();
            dst.reallocate(new_desc);
            if dst.bytes().len() < plan.size as usize * dst.desc().elem_size {
                return Err(CoralError::AllocationFailed {
                    size: plan.size as usize * dst.desc().elem_size,
                });
            }
        }
        Ok(Some((plan.size, plan.item_size)))
    }

    /// `is_present`: walk the chain without transferring and report whether
    /// the final dereferenced component is allocated.
    pub fn is_present(&self, token: Token, image: ImageIndex, refs: &[RefNode]) -> Result<bool> {
        if refs.is_empty() {
            return Err(CoralError::invalid_reference("empty reference chain"));
        }
        self.check_image_health(image)?;
        let walk = Walk::new(self, token, image)?;
        walk.lock_both();
        let result = self.is_present_locked(&walk, refs);
        walk.unlock_both();
        result
    }

    fn is_present_locked(&self, walk: &Walk<'_>, refs: &[RefNode]) -> Result<bool> {
        let mut data = Cursor::start();
        let mut desc = Cursor::start();
        for node in refs {
            match node {
                RefNode::Component {
                    offset,
                    token_offset,
                    ..
                } => {
                    if *token_offset > 0 {
                        data = data.advanced(*offset as i64);
                        desc = data;
                        let base = walk.fetch_ptr(data)?;
                        if base == 0 {
                            return Ok(false);
                        }
                        data = Cursor {
                            space: Space::Dyn { base },
                            offset: 0,
                        };
                    } else {
                        data = data.advanced(*offset as i64);
                        desc = desc.advanced(*offset as i64);
                    }
                }
                RefNode::Array { item_size, dims } => {
                    let remote = match data.space {
                        Space::Dyn { .. } => {
                            let (base, d) = walk.fetch_desc(desc, dims.len())?;
                            if base == 0 {
                                return Ok(false);
                            }
                            d
                        }
                        Space::Win => match &walk.token_desc {
                            Some(d) => d.clone(),
                            None => return Ok(true),
                        },
                    };
                    for (i, sel) in dims.iter().enumerate() {
                        let rd = remote.dim(i);
                        let start = match sel {
                            ArrayRefDim::Single(at) => Some(*at),
                            ArrayRefDim::Range { start, .. }
                            | ArrayRefDim::OpenEnd { start, .. } => Some(*start),
                            _ => None,
                        };
                        if let Some(at) = start {
                            data = data.advanced((at - rd.lower) * rd.stride * *item_size as i64);
                        }
                    }
                }
                RefNode::StaticArray { item_size, dims, .. } => {
                    for sel in dims {
                        let start = match sel {
                            ArrayRefDim::Single(at) => Some(*at),
                            ArrayRefDim::Range { start, .. } => Some(*start),
                            _ => None,
                        };
                        if let Some(at) = start {
                            data = data.advanced(at * *item_size as i64);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    /// Writing through a reference chain is not yet supported: derived-type
    /// coarrays with allocatable components can only be read remotely.
    pub fn send_by_ref(
        &self,
        _token: Token,
        _image: ImageIndex,
        _refs: &[RefNode],
        _src: &LocalArray,
    ) -> Result<()> {
        Err(CoralError::unsupported(
            "send_by_ref: assigning to an allocatable coarray component is not implemented",
        ))
    }

    /// See [`Runtime::send_by_ref`].
    #[allow(clippy::too_many_arguments)]
    pub fn sendget_by_ref(
        &self,
        _dst_token: Token,
        _dst_image: ImageIndex,
        _dst_refs: &[RefNode],
        _src_token: Token,
        _src_image: ImageIndex,
        _src_refs: &[RefNode],
    ) -> Result<()> {
        Err(CoralError::unsupported(
            "sendget_by_ref: assigning to an allocatable coarray component is not implemented",
        ))
    }
}

// ============================================================================
// Pass 2
// ============================================================================

struct CopyPass<'w, 'rt> {
    walk: &'w Walk<'rt>,
    dst: &'w mut LocalArray,
    copied: usize,
}

impl CopyPass<'_, '_> {
    /// Recursive descent over the chain; mirrors the planning traversal but
    /// emits one leaf transfer per selected element.
    #[allow(clippy::too_many_arguments)]
    fn descend(
        &mut self,
        refs: &[RefNode],
        ri: usize,
        src_desc: Option<Descriptor>,
        data: Cursor,
        desc: Cursor,
        mut dst_index: i64,
        dst_dim: usize,
        src_dim: usize,
        num: usize,
    ) -> Result<()> {
        let node = &refs[ri];
        let last = ri + 1 == refs.len();

        match node {
            RefNode::Component {
                offset,
                token_offset,
                item_size,
            } => {
                let (data, desc) = if *token_offset > 0 {
                    let at = data.advanced(*offset as i64);
                    let base = self.walk.fetch_ptr(at)?;
                    (
                        Cursor {
                            space: Space::Dyn { base },
                            offset: 0,
                        },
                        at,
                    )
                } else {
                    (data.advanced(*offset as i64), desc.advanced(*offset as i64))
                };
                if last {
                    self.leaf(data, None, *item_size, dst_index, 1)?;
                    return Ok(());
                }
                self.descend(refs, ri + 1, None, data, desc, dst_index, dst_dim, 0, 1)
            }
            RefNode::Array { item_size, dims } => {
                // On the leftmost index switch to the array's own layout.
                let (src, data, desc) = if src_dim == 0 {
                    match data.space {
                        Space::Dyn { .. } => {
                            let (base, d) = self.walk.fetch_desc(desc, dims.len())?;
                            (
                                d,
                                Cursor {
                                    space: Space::Dyn { base },
                                    offset: 0,
                                },
                                desc,
                            )
                        }
                        Space::Win => {
                            let d = self.walk.token_desc.clone().ok_or_else(|| {
                                CoralError::invalid_reference("array reference on scalar coarray")
                            })?;
                            (d, data, desc)
                        }
                    }
                } else {
                    (
                        src_desc.ok_or_else(|| {
                            CoralError::invalid_reference("array reference on scalar coarray")
                        })?,
                        data,
                        desc,
                    )
                };

                if src_dim == dims.len() {
                    if last {
                        self.leaf(data, Some(&src), *item_size, dst_index, num)?;
                        return Ok(());
                    }
                    return self.descend(
                        refs,
                        ri + 1,
                        None,
                        data,
                        desc,
                        dst_index,
                        dst_dim,
                        0,
                        1,
                    );
                }

                let rd = *src.dim(src_dim);
                let step = self.dst_step(dst_dim);
                let item = *item_size as i64;
                match &dims[src_dim] {
                    ArrayRefDim::Vector { kind, indices } => {
                        check_vector_kind(*kind)?;
                        for &idx in indices {
                            let off = (idx - rd.lower) * rd.stride * item;
                            self.descend(
                                refs,
                                ri,
                                Some(src.clone()),
                                data.advanced(off),
                                desc.advanced(off),
                                dst_index,
                                dst_dim + 1,
                                src_dim + 1,
                                1,
                            )?;
                            dst_index += step;
                        }
                        Ok(())
                    }
                    ArrayRefDim::Full { stride } => {
                        let n = compute_num_items(*stride, rd.lower, rd.upper);
                        let step_src = rd.stride * stride * item;
                        let mut off = 0;
                        for _ in 0..n {
                            self.descend(
                                refs,
                                ri,
                                Some(src.clone()),
                                data.advanced(off),
                                desc.advanced(off),
                                dst_index,
                                dst_dim + 1,
                                src_dim + 1,
                                1,
                            )?;
                            dst_index += step;
                            off += step_src;
                        }
                        Ok(())
                    }
                    ArrayRefDim::Range { start, end, stride } => {
                        let n = compute_num_items(*stride, *start, *end);
                        // A scalar range does not consume a destination dim.
                        let next_dst_dim = if n > 1 || self.dst_extent(dst_dim) == 1 {
                            dst_dim + 1
                        } else {
                            dst_dim
                        };
                        let step_src = rd.stride * stride * item;
                        let mut off = (*start - rd.lower) * rd.stride * item;
                        for _ in 0..n {
                            self.descend(
                                refs,
                                ri,
                                Some(src.clone()),
                                data.advanced(off),
                                desc.advanced(off),
                                dst_index,
                                next_dst_dim,
                                src_dim + 1,
                                1,
                            )?;
                            dst_index += step;
                            off += step_src;
                        }
                        Ok(())
                    }
                    ArrayRefDim::Single(at) => {
                        let off = (*at - rd.lower) * rd.stride * item;
                        self.descend(
                            refs,
                            ri,
                            Some(src.clone()),
                            data.advanced(off),
                            desc.advanced(off),
                            dst_index,
                            dst_dim,
                            src_dim + 1,
                            1,
                        )
                    }
                    ArrayRefDim::OpenEnd { start, stride } => {
                        let n = compute_num_items(*stride, *start, rd.upper);
                        let step_src = rd.stride * stride * item;
                        let mut off = (*start - rd.lower) * rd.stride * item;
                        for _ in 0..n {
                            self.descend(
                                refs,
                                ri,
                                Some(src.clone()),
                                data.advanced(off),
                                desc.advanced(off),
                                dst_index,
                                dst_dim + 1,
                                src_dim + 1,
                                1,
                            )?;
                            dst_index += step;
                            off += step_src;
                        }
                        Ok(())
                    }
                    ArrayRefDim::OpenStart { end, stride } => {
                        let n = compute_num_items(*stride, rd.lower, *end);
                        let step_src = rd.stride * stride * item;
                        let mut off = 0;
                        for _ in 0..n {
                            self.descend(
                                refs,
                                ri,
                                Some(src.clone()),
                                data.advanced(off),
                                desc.advanced(off),
                                dst_index,
                                dst_dim + 1,
                                src_dim + 1,
                                1,
                            )?;
                            dst_index += step;
                            off += step_src;
                        }
                        Ok(())
                    }
                }
            }
            RefNode::StaticArray {
                item_size,
                elem_type,
                elem_kind,
                dims,
            } => {
                if src_dim == dims.len() {
                    if last {
                        let src = Descriptor::scalar(*elem_type, *elem_kind, *item_size);
                        self.leaf(data, Some(&src), *item_size, dst_index, num)?;
                        return Ok(());
                    }
                    return self.descend(
                        refs,
                        ri + 1,
                        None,
                        data,
                        desc,
                        dst_index,
                        dst_dim,
                        0,
                        1,
                    );
                }
                let step = self.dst_step(dst_dim);
                let item = *item_size as i64;
                match &dims[src_dim] {
                    ArrayRefDim::Vector { kind, indices } => {
                        check_vector_kind(*kind)?;
                        for &idx in indices {
                            let off = idx * item;
                            self.descend(
                                refs,
                                ri,
                                src_desc.clone(),
                                data.advanced(off),
                                desc.advanced(off),
                                dst_index,
                                dst_dim + 1,
                                src_dim + 1,
                                1,
                            )?;
                            dst_index += step;
                        }
                        Ok(())
                    }
                    ArrayRefDim::Range { start, end, stride } => {
                        let n = compute_num_items(*stride, *start, *end);
                        let mut off = *start * *stride * item;
                        for _ in 0..n {
                            self.descend(
                                refs,
                                ri,
                                src_desc.clone(),
                                data.advanced(off),
                                desc.advanced(off),
                                dst_index,
                                dst_dim + 1,
                                src_dim + 1,
                                1,
                            )?;
                            dst_index += step;
                            off += *stride * item;
                        }
                        Ok(())
                    }
                    ArrayRefDim::Single(at) => {
                        let off = *at * item;
                        self.descend(
                            refs,
                            ri,
                            src_desc.clone(),
                            data.advanced(off),
                            desc.advanced(off),
                            dst_index,
                            dst_dim,
                            src_dim + 1,
                            1,
                        )
                    }
                    _ => Err(CoralError::invalid_reference(
                        "unknown array reference kind in static selector",
                    )),
                }
            }
        }
    }

    fn dst_step(&self, dst_dim: usize) -> i64 {
        let d = self.dst.desc();
        if dst_dim < d.rank() {
            d.dim(dst_dim).stride
        } else {
            1
        }
    }

    fn dst_extent(&self, dst_dim: usize) -> i64 {
        let d = self.dst.desc();
        if dst_dim < d.rank() {
            d.dim(dst_dim).extent()
        } else {
            1
        }
    }

    /// The leaf transfer: fetch `num` items and store them at destination
    /// element `dst_index`, converting representation where needed.
    fn leaf(
        &mut self,
        data: Cursor,
        src: Option<&Descriptor>,
        item_size: usize,
        dst_index: i64,
        num: usize,
    ) -> Result<()> {
        let dst_desc = self.dst.desc().clone();
        let dst_size = dst_desc.elem_size;
        let at = (dst_index * dst_size as i64) as usize;
        let out = &mut self.dst.bytes_mut()[at..at + num * dst_size];

        let (src_type, src_kind) = match src {
            Some(d) => (d.elem_type, d.elem_kind),
            // A direct component access is typed like the destination.
            None => (dst_desc.elem_type, dst_desc.elem_kind),
        };

        if src_type == dst_desc.elem_type && src_kind == dst_desc.elem_kind {
            let sz = dst_size.min(item_size);
            let mut staged = vec![0u8; item_size * num];
            self.walk.fetch(data, &mut staged)?;
            for k in 0..num {
                out[k * dst_size..k * dst_size + sz]
                    .copy_from_slice(&staged[k * item_size..k * item_size + sz]);
                if dst_desc.elem_type == ElemType::Character && dst_size > item_size {
                    space_fill(dst_desc.elem_kind, &mut out[k * dst_size + sz..(k + 1) * dst_size]);
                }
            }
        } else if dst_desc.elem_type == ElemType::Character && src_type == ElemType::Character {
            let mut staged = vec![0u8; item_size * num];
            self.walk.fetch(data, &mut staged)?;
            for k in 0..num {
                convert_char(
                    src_kind,
                    &staged[k * item_size..(k + 1) * item_size],
                    dst_desc.elem_kind,
                    &mut out[k * dst_size..(k + 1) * dst_size],
                )?;
            }
        } else {
            let mut staged = vec![0u8; item_size * num];
            self.walk.fetch(data, &mut staged)?;
            for k in 0..num {
                convert_elem(
                    src_type,
                    src_kind,
                    &staged[k * item_size..(k + 1) * item_size],
                    dst_desc.elem_type,
                    dst_desc.elem_kind,
                    &mut out[k * dst_size..(k + 1) * dst_size],
                )?;
            }
        }
        self.copied += num;
        Ok(())
    }
}
