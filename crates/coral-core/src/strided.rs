//! The linear-index unravel shared by the transfer engine and the
//! per-element collective fallback.
//!
//! Walking an arbitrary section means turning a linear element index `i`
//! into per-dimension indices via `ij = (i / Πk<j extentk) mod extentj` and
//! then into byte offsets through each descriptor's stride vector. That loop
//! is factored here into one iterator used by every strided code path.

use crate::descriptor::Descriptor;

/// Byte offsets of one element of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementOffsets {
    /// Linear element index in `[0, count)`.
    pub linear: usize,
    /// Byte offset within the destination array.
    pub dst: i64,
    /// Byte offset within the source array; 0 when the source is a scalar.
    pub src: i64,
}

/// Iterator over the element offsets of a transfer described by a
/// destination descriptor and an optional source descriptor.
///
/// The element count is taken from the destination shape. A missing or
/// rank-0 source yields offset 0 for every element (scalar broadcast).
pub struct SectionIter<'a> {
    dst: &'a Descriptor,
    src: Option<&'a Descriptor>,
    count: usize,
    i: usize,
}

impl<'a> SectionIter<'a> {
    /// Iterate the section described by `dst`, pairing each element with the
    /// matching element of `src`.
    pub fn new(dst: &'a Descriptor, src: Option<&'a Descriptor>) -> Self {
        Self {
            dst,
            src,
            count: dst.element_count(),
            i: 0,
        }
    }

    /// Total number of elements.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Element offset (in elements, not bytes) of linear index `i` within `desc`.
pub fn unravel(desc: &Descriptor, i: usize) -> i64 {
    let rank = desc.rank();
    if rank == 0 {
        return 0;
    }
    let mut offset: i64 = 0;
    let mut tot_ext: i64 = 1;
    for j in 0..rank - 1 {
        let ext = desc.dim(j).extent();
        offset += ((i as i64 / tot_ext) % ext) * desc.dim(j).stride;
        tot_ext *= ext;
    }
    offset + (i as i64 / tot_ext) * desc.dim(rank - 1).stride
}

impl Iterator for SectionIter<'_> {
    type Item = ElementOffsets;

    fn next(&mut self) -> Option<ElementOffsets> {
        if self.i >= self.count {
            return None;
        }
        let i = self.i;
        self.i += 1;

        let dst = unravel(self.dst, i) * self.dst.elem_size as i64;
        let src = match self.src {
            Some(s) if s.rank() != 0 => unravel(s, i) * s.elem_size as i64,
            _ => 0,
        };
        Some(ElementOffsets { linear: i, dst, src })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count - self.i;
        (left, Some(left))
    }
}

impl ExactSizeIterator for SectionIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Dim;
    use crate::types::ElemType;

    fn desc(dims: &[Dim]) -> Descriptor {
        Descriptor::array(ElemType::Integer, 4, 4, dims).unwrap()
    }

    #[test]
    fn test_unravel_contiguous() {
        let d = desc(&[Dim::new(1, 4, 1), Dim::new(1, 4, 4)]);
        for i in 0..16 {
            assert_eq!(unravel(&d, i), i as i64);
        }
    }

    #[test]
    fn test_unravel_strided_section() {
        // The [1:4:2, 1:4:2] section of a 4x4: elements {0, 2, 8, 10}.
        let d = desc(&[Dim::new(1, 2, 2), Dim::new(1, 2, 8)]);
        let offsets: Vec<i64> = (0..4).map(|i| unravel(&d, i)).collect();
        assert_eq!(offsets, vec![0, 2, 8, 10]);
    }

    #[test]
    fn test_section_iter_pairs() {
        let dst = desc(&[Dim::new(1, 2, 1), Dim::new(1, 2, 2)]);
        let src = desc(&[Dim::new(1, 2, 2), Dim::new(1, 2, 8)]);
        let pairs: Vec<(i64, i64)> = SectionIter::new(&dst, Some(&src))
            .map(|e| (e.dst, e.src))
            .collect();
        assert_eq!(pairs, vec![(0, 0), (4, 8), (8, 32), (12, 40)]);
    }

    #[test]
    fn test_scalar_source_broadcast() {
        let dst = desc(&[Dim::new(1, 3, 1)]);
        let src = Descriptor::scalar(ElemType::Integer, 4, 4);
        let offs: Vec<ElementOffsets> = SectionIter::new(&dst, Some(&src)).collect();
        assert_eq!(offs.len(), 3);
        assert!(offs.iter().all(|e| e.src == 0));
    }

    #[test]
    fn test_zero_count() {
        let dst = desc(&[Dim::new(1, 0, 1)]);
        assert_eq!(SectionIter::new(&dst, None).count(), 0);
    }
}
