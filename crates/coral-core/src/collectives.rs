//! Collective reductions and broadcast over the image set.
//!
//! Contiguous (or scalar) arrays go to the transport in one call; any other
//! layout falls back to one collective per element using the same unravel
//! as the transfer engine. User operators are adapted through a by-value
//! shim for the scalar kinds the front-end passes by value and a general
//! by-reference shim, which is also the only form used for CHARACTER.

use bytemuck::Pod;
use tracing::trace;

use crate::descriptor::{Descriptor, LocalArray};
use crate::error::{CoralError, Result};
use crate::runtime::Runtime;
use crate::strided::unravel;
use crate::transport::{CollDatatype, CollOp, TransportError};
use crate::types::{ElemType, ImageIndex};

/// A user-supplied reduction operator.
pub enum ReduceOperator<'a> {
    /// General form: fold the first element buffer into the second.
    ByReference(&'a (dyn Fn(&[u8], &mut [u8]) + Sync)),
    /// By-value combiner for default integers.
    I32(fn(i32, i32) -> i32),
    /// By-value combiner for single-precision reals.
    F32(fn(f32, f32) -> f32),
    /// By-value combiner for double-precision reals.
    F64(fn(f64, f64) -> f64),
}

/// Map a descriptor onto the transport's element datatype.
fn datatype_of(desc: &Descriptor) -> Result<CollDatatype> {
    Ok(match desc.elem_type {
        ElemType::Integer => CollDatatype::Int(desc.elem_kind),
        ElemType::Logical => CollDatatype::Int(desc.elem_kind),
        ElemType::Real => CollDatatype::Float(desc.elem_kind),
        ElemType::Complex => CollDatatype::Complex(desc.elem_kind),
        ElemType::Character => CollDatatype::Octets(desc.elem_size),
        ElemType::Derived => {
            return Err(CoralError::unsupported(
                "collective reduction of derived types",
            ))
        }
    })
}

/// Fold `src` into `dst` lane-wise with a by-value combiner.
fn fold_lanes<T: Pod>(src: &[u8], dst: &mut [u8], f: fn(T, T) -> T) {
    let lane = std::mem::size_of::<T>();
    for (s, d) in src.chunks_exact(lane).zip(dst.chunks_exact_mut(lane)) {
        let a: T = bytemuck::pod_read_unaligned(s);
        let b: T = bytemuck::pod_read_unaligned(d);
        let r = f(a, b);
        d.copy_from_slice(bytemuck::bytes_of(&r));
    }
}

impl Runtime {
    fn coll_result(&self, r: std::result::Result<(), TransportError>) -> Result<()> {
        match r {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => Err(self.handle_comm_error(e)),
            Err(e) => Err(e.into()),
        }
    }

    /// Run one reduction over `a`, either whole-array or element-wise,
    /// depending on contiguity.
    fn reduce_traversal(
        &self,
        a: &mut LocalArray,
        dtype: CollDatatype,
        op: CollOp<'_>,
        root: Option<usize>,
    ) -> Result<()> {
        let desc = a.desc().clone();
        let count = desc.element_count();
        if count == 0 {
            return Ok(());
        }
        let comm = *self.core_comm.read();
        let elem = desc.elem_size;

        if desc.rank() == 0 || desc.is_contiguous() {
            let bytes = &mut a.bytes_mut()[..count * elem];
            return self.coll_result(self.t().reduce(comm, bytes, dtype, op, root));
        }
        for i in 0..count {
            let at = (unravel(&desc, i) * elem as i64) as usize;
            let bytes = &mut a.bytes_mut()[at..at + elem];
            self.coll_result(self.t().reduce(comm, bytes, dtype, op, root))?;
        }
        Ok(())
    }

    /// `co_sum`: element-wise sum across all images; `result_image == 0`
    /// leaves the result on every image.
    pub fn co_sum(&self, a: &mut LocalArray, result_image: ImageIndex) -> Result<()> {
        let dtype = datatype_of(a.desc())?;
        trace!(image = self.this_image(), result_image, "co_sum");
        self.reduce_traversal(a, dtype, CollOp::Sum, root_of(result_image))
    }

    /// `co_min`: element-wise minimum across all images.
    pub fn co_min(&self, a: &mut LocalArray, result_image: ImageIndex) -> Result<()> {
        let dtype = datatype_of(a.desc())?;
        trace!(image = self.this_image(), result_image, "co_min");
        self.reduce_traversal(a, dtype, CollOp::Min, root_of(result_image))
    }

    /// `co_max`: element-wise maximum across all images.
    pub fn co_max(&self, a: &mut LocalArray, result_image: ImageIndex) -> Result<()> {
        let dtype = datatype_of(a.desc())?;
        trace!(image = self.this_image(), result_image, "co_max");
        self.reduce_traversal(a, dtype, CollOp::Max, root_of(result_image))
    }

    /// `co_reduce` with a user operator.
    ///
    /// CHARACTER data always reduces by reference, with the element size
    /// taken from the descriptor.
    pub fn co_reduce(
        &self,
        a: &mut LocalArray,
        op: ReduceOperator<'_>,
        result_image: ImageIndex,
    ) -> Result<()> {
        let desc = a.desc().clone();
        let dtype = datatype_of(&desc)?;
        trace!(image = self.this_image(), result_image, "co_reduce");

        if desc.elem_type == ElemType::Character
            && !matches!(op, ReduceOperator::ByReference(_))
        {
            return Err(CoralError::unsupported(
                "character co_reduce requires a by-reference operator",
            ));
        }

        let elem = desc.elem_size;
        let combine: Box<dyn Fn(&[u8], &mut [u8]) + Sync> = match op {
            ReduceOperator::ByReference(f) => Box::new(move |src: &[u8], dst: &mut [u8]| {
                for (s, d) in src.chunks_exact(elem).zip(dst.chunks_exact_mut(elem)) {
                    f(s, d);
                }
            }),
            ReduceOperator::I32(f) => Box::new(move |src: &[u8], dst: &mut [u8]| {
                fold_lanes::<i32>(src, dst, f)
            }),
            ReduceOperator::F32(f) => Box::new(move |src: &[u8], dst: &mut [u8]| {
                fold_lanes::<f32>(src, dst, f)
            }),
            ReduceOperator::F64(f) => Box::new(move |src: &[u8], dst: &mut [u8]| {
                fold_lanes::<f64>(src, dst, f)
            }),
        };
        self.reduce_traversal(a, dtype, CollOp::User(&*combine), root_of(result_image))
    }

    /// `co_broadcast`: replicate `a` from `source_image` to every image.
    ///
    /// CHARACTER scalars broadcast their length first; CHARACTER arrays are
    /// not supported.
    pub fn co_broadcast(&self, a: &mut LocalArray, source_image: ImageIndex) -> Result<()> {
        let desc = a.desc().clone();
        let count = desc.element_count();
        if count == 0 {
            return Ok(());
        }
        let comm = *self.core_comm.read();
        let root = source_image - 1;
        let elem = desc.elem_size;
        trace!(image = self.this_image(), source_image, "co_broadcast");

        if desc.elem_type == ElemType::Character {
            if desc.rank() != 0 {
                return Err(CoralError::unsupported(
                    "co_broadcast of character arrays",
                ));
            }
            // The source publishes the payload length first.
            let mut len_bytes = (elem as u64).to_ne_bytes();
            self.coll_result(self.t().broadcast(comm, root, &mut len_bytes))?;
            let len = u64::from_ne_bytes(len_bytes) as usize;
            if len > a.bytes().len() {
                return Err(CoralError::extent(
                    "broadcast character longer than destination",
                ));
            }
            return self.coll_result(self.t().broadcast(comm, root, &mut a.bytes_mut()[..len]));
        }

        if desc.rank() == 0 || desc.is_contiguous() {
            let bytes = &mut a.bytes_mut()[..count * elem];
            return self.coll_result(self.t().broadcast(comm, root, bytes));
        }
        for i in 0..count {
            let at = (unravel(&desc, i) * elem as i64) as usize;
            let bytes = &mut a.bytes_mut()[at..at + elem];
            self.coll_result(self.t().broadcast(comm, root, bytes))?;
        }
        Ok(())
    }
}

/// `result_image == 0` means all-reduce; otherwise the 0-based root rank.
fn root_of(result_image: ImageIndex) -> Option<usize> {
    if result_image == 0 {
        None
    } else {
        Some(result_image - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Dim;

    #[test]
    fn test_datatype_mapping() {
        let d = Descriptor::vector(ElemType::Integer, 4, 4, 3);
        assert_eq!(datatype_of(&d).unwrap(), CollDatatype::Int(4));

        let r = Descriptor::scalar(ElemType::Real, 8, 8);
        assert_eq!(datatype_of(&r).unwrap(), CollDatatype::Float(8));

        let c = Descriptor::scalar(ElemType::Character, 1, 12);
        assert_eq!(datatype_of(&c).unwrap(), CollDatatype::Octets(12));

        let z = Descriptor::scalar(ElemType::Complex, 8, 16);
        assert_eq!(datatype_of(&z).unwrap(), CollDatatype::Complex(8));

        let der = Descriptor::scalar(ElemType::Derived, 0, 24);
        assert!(datatype_of(&der).is_err());
    }

    #[test]
    fn test_fold_lanes() {
        let src: Vec<u8> = [1i32, 2, 3].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut dst: Vec<u8> = [10i32, 20, 30].iter().flat_map(|v| v.to_ne_bytes()).collect();
        fold_lanes::<i32>(&src, &mut dst, |a, b| a + b);
        let out: Vec<i32> = dst
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, vec![11, 22, 33]);
    }

    #[test]
    fn test_root_selection() {
        assert_eq!(root_of(0), None);
        assert_eq!(root_of(1), Some(0));
        assert_eq!(root_of(4), Some(3));
    }

    #[test]
    fn test_unravel_offsets_match_engine() {
        let d = Descriptor::array(ElemType::Integer, 4, 4, &[Dim::new(1, 2, 2)]).unwrap();
        assert_eq!(unravel(&d, 0), 0);
        assert_eq!(unravel(&d, 1), 2);
    }
}
