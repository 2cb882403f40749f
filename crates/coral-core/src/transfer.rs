//! The remote access engine: `get`, `send` and `sendget` over arbitrary
//! array sections, with element conversion and character padding.
//!
//! Local sections are passed as a byte buffer plus a descriptor whose
//! unraveled offsets index into that buffer; a section whose offsets would
//! go negative (negative stride) must be rebased by the caller, exactly as
//! a base address into the middle of an array would be.

use tracing::trace;

use crate::config::{EpochStyle, StridedStrategy};
use crate::convert::{convert_char, convert_elem, space_fill};
use crate::descriptor::Descriptor;
use crate::error::{CoralError, Result};
use crate::registry::Token;
use crate::runtime::Runtime;
use crate::strided::SectionIter;
use crate::transport::{LockMode, WinId};
use crate::types::{ElemType, ImageIndex};

/// Whether two descriptors use the same element representation, so bytes
/// can move without conversion or padding.
fn same_repr(dst: &Descriptor, src: &Descriptor) -> bool {
    dst.elem_type == src.elem_type
        && dst.elem_kind == src.elem_kind
        && (dst.elem_type != ElemType::Character || dst.elem_size == src.elem_size)
}

/// Convert one element between the two representations.
fn convert_one(dst: &Descriptor, src: &Descriptor, from: &[u8], to: &mut [u8]) -> Result<()> {
    if dst.elem_type == ElemType::Character && src.elem_type == ElemType::Character {
        return convert_char(src.elem_kind, from, dst.elem_kind, to);
    }
    if dst.elem_type == ElemType::Character || src.elem_type == ElemType::Character {
        return Err(CoralError::TypeConversion {
            from_type: src.elem_type,
            from_kind: src.elem_kind,
            to_type: dst.elem_type,
            to_kind: dst.elem_kind,
        });
    }
    convert_elem(
        src.elem_type,
        src.elem_kind,
        from,
        dst.elem_type,
        dst.elem_kind,
        to,
    )
}

/// Materialize the local section as a contiguous buffer of destination-typed
/// elements: kind conversion, character translation and padding happen here.
fn stage_to_dst_repr(
    dst: &Descriptor,
    src: &Descriptor,
    src_bytes: &[u8],
    count: usize,
) -> Result<Vec<u8>> {
    let mut staged = vec![0u8; count * dst.elem_size];
    if dst.elem_type == ElemType::Character
        && src.elem_type == ElemType::Character
        && dst.elem_kind == src.elem_kind
        && dst.elem_size < src.elem_size
    {
        // Never truncate character payloads silently.
        return Err(CoralError::extent(
            "character destination shorter than source",
        ));
    }
    for e in SectionIter::new(dst, Some(src)) {
        let from = &src_bytes[e.src as usize..e.src as usize + src.elem_size];
        let to = &mut staged[e.linear * dst.elem_size..(e.linear + 1) * dst.elem_size];
        if same_repr(dst, src) {
            to.copy_from_slice(from);
        } else if dst.elem_type == ElemType::Character
            && src.elem_type == ElemType::Character
            && dst.elem_kind == src.elem_kind
        {
            // Same kind, longer destination element: pad with spaces.
            to[..src.elem_size].copy_from_slice(from);
            space_fill(dst.elem_kind, &mut to[src.elem_size..]);
        } else {
            convert_one(dst, src, from, to)?;
        }
    }
    Ok(staged)
}

impl Runtime {
    // ------------------------------------------------------------------
    // Public entry points
    // ------------------------------------------------------------------

    /// Write the local section `(src, src_bytes)` into the window of
    /// `token` on `image` at byte `offset`, laid out per `dest`.
    ///
    /// A computed element count of zero is a no-op. When `image` is this
    /// image the transfer is a local copy; `may_require_temp` forces it
    /// through a temporary so overlapping sections stay correct.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        token: Token,
        offset: u64,
        image: ImageIndex,
        dest: &Descriptor,
        src: &Descriptor,
        src_bytes: &[u8],
        may_require_temp: bool,
    ) -> Result<()> {
        let count = dest.element_count();
        if count == 0 {
            return Ok(());
        }
        self.check_image_health(image)?;
        let win = self.lookup(token)?;

        if same_repr(dest, src) {
            return self.send_raw(win, offset, image, dest, src, src_bytes, may_require_temp, count);
        }
        let staged = stage_to_dst_repr(dest, src, src_bytes, count)?;
        let staged_desc = Descriptor::vector(
            dest.elem_type,
            dest.elem_kind,
            dest.elem_size,
            count as i64,
        );
        self.send_raw(win, offset, image, dest, &staged_desc, &staged, false, count)
    }

    /// Read the section `(src, offset)` of the window of `token` on
    /// `image` into the local section `(dest, dest_bytes)`.
    #[allow(clippy::too_many_arguments)]
    pub fn get(
        &self,
        token: Token,
        offset: u64,
        image: ImageIndex,
        src: &Descriptor,
        dest: &Descriptor,
        dest_bytes: &mut [u8],
        may_require_temp: bool,
    ) -> Result<()> {
        let count = dest.element_count();
        if count == 0 {
            return Ok(());
        }
        self.check_image_health(image)?;
        let win = self.lookup(token)?;

        if same_repr(dest, src) {
            return self.get_raw(win, offset, image, src, dest, dest_bytes, may_require_temp, count);
        }

        // Fetch in source representation, then convert into place.
        let staged_desc =
            Descriptor::vector(src.elem_type, src.elem_kind, src.elem_size, count as i64);
        let mut staged = vec![0u8; count * src.elem_size];
        self.get_raw(win, offset, image, src, &staged_desc, &mut staged, false, count)?;

        if dest.elem_type == ElemType::Character
            && src.elem_type == ElemType::Character
            && dest.elem_kind == src.elem_kind
            && dest.elem_size < src.elem_size
        {
            return Err(CoralError::extent(
                "character destination shorter than source",
            ));
        }
        for e in SectionIter::new(dest, None) {
            let from = &staged[e.linear * src.elem_size..(e.linear + 1) * src.elem_size];
            let at = e.dst as usize;
            let to = &mut dest_bytes[at..at + dest.elem_size];
            if dest.elem_type == ElemType::Character
                && src.elem_type == ElemType::Character
                && dest.elem_kind == src.elem_kind
            {
                to[..src.elem_size].copy_from_slice(from);
                space_fill(dest.elem_kind, &mut to[src.elem_size..]);
            } else {
                convert_one(dest, src, from, to)?;
            }
        }
        Ok(())
    }

    /// Get-then-put: fetch the section `(src, src_offset)` from
    /// `src_image` and deliver it as `(dest, dst_offset)` on `dst_image`.
    /// The element count is taken from `dest`.
    #[allow(clippy::too_many_arguments)]
    pub fn sendget(
        &self,
        dst_token: Token,
        dst_offset: u64,
        dst_image: ImageIndex,
        dest: &Descriptor,
        src_token: Token,
        src_offset: u64,
        src_image: ImageIndex,
        src: &Descriptor,
    ) -> Result<()> {
        let count = dest.element_count();
        if count == 0 {
            return Ok(());
        }
        self.check_image_health(src_image)?;
        self.check_image_health(dst_image)?;

        // Stage through this image in source representation.
        let staged_desc =
            Descriptor::vector(src.elem_type, src.elem_kind, src.elem_size, count as i64);
        let mut staged = vec![0u8; count * src.elem_size];
        let src_win = self.lookup(src_token)?;
        self.get_raw(
            src_win,
            src_offset,
            src_image,
            src,
            &staged_desc,
            &mut staged,
            false,
            count,
        )?;

        self.send(
            dst_token, dst_offset, dst_image, dest, &staged_desc, &staged, false,
        )
    }

    // ------------------------------------------------------------------
    // Same-representation movement
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn send_raw(
        &self,
        win: WinId,
        offset: u64,
        image: ImageIndex,
        dest: &Descriptor,
        src: &Descriptor,
        src_bytes: &[u8],
        may_require_temp: bool,
        count: usize,
    ) -> Result<()> {
        let elem = dest.elem_size;
        let fast = dest.rank() == 0
            || (src.rank() != 0 && dest.is_contiguous() && src.is_contiguous());

        if image == self.this_image() {
            return self.local_store(win, offset, dest, src, src_bytes, may_require_temp, count);
        }

        let rank = image - 1;
        trace!(image, offset, count, fast, "send");
        self.epochs().lock(self.t(), LockMode::Exclusive, rank, win);
        let res = if fast {
            self.t().put(win, rank, offset, &src_bytes[..count * elem])
        } else {
            match self.config().strided {
                StridedStrategy::Vectored => {
                    let (offsets, packed) = pack_section(offset, dest, src, src_bytes, count);
                    self.t().put_indexed(win, rank, elem, &offsets, &packed)
                }
                StridedStrategy::PerElement => {
                    let mut r = Ok(());
                    for e in SectionIter::new(dest, Some(src)) {
                        let from = &src_bytes[e.src as usize..e.src as usize + elem];
                        r = self
                            .t()
                            .put(win, rank, offset.wrapping_add(e.dst as u64), from);
                        if r.is_err() {
                            break;
                        }
                    }
                    r
                }
            }
        };
        if res.is_ok()
            && self.config().deferred_puts
            && self.config().epoch_style == EpochStyle::LockAllFlush
        {
            self.note_pending_put(image, win);
        } else {
            self.epochs().unlock(self.t(), rank, win);
        }
        res.map_err(|e| {
            if e.is_proc_failed() {
                self.handle_comm_error(e)
            } else {
                e.into()
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn get_raw(
        &self,
        win: WinId,
        offset: u64,
        image: ImageIndex,
        src: &Descriptor,
        dest: &Descriptor,
        dest_bytes: &mut [u8],
        may_require_temp: bool,
        count: usize,
    ) -> Result<()> {
        let elem = dest.elem_size;
        let fast = dest.rank() == 0
            || (src.rank() != 0 && dest.is_contiguous() && src.is_contiguous());

        if image == self.this_image() {
            return self.local_load(win, offset, src, dest, dest_bytes, may_require_temp, count);
        }

        let rank = image - 1;
        trace!(image, offset, count, fast, "get");
        self.epochs().lock(self.t(), LockMode::Shared, rank, win);
        let res = if fast {
            self.t()
                .get(win, rank, offset, &mut dest_bytes[..count * elem])
        } else {
            match self.config().strided {
                StridedStrategy::Vectored => {
                    let offsets: Vec<u64> = SectionIter::new(dest, Some(src))
                        .map(|e| offset.wrapping_add(e.src as u64))
                        .collect();
                    let mut packed = vec![0u8; count * elem];
                    let r = self.t().get_indexed(win, rank, elem, &offsets, &mut packed);
                    if r.is_ok() {
                        for e in SectionIter::new(dest, Some(src)) {
                            let to = &mut dest_bytes[e.dst as usize..e.dst as usize + elem];
                            to.copy_from_slice(&packed[e.linear * elem..(e.linear + 1) * elem]);
                        }
                    }
                    r
                }
                StridedStrategy::PerElement => {
                    let mut r = Ok(());
                    for e in SectionIter::new(dest, Some(src)) {
                        let to = &mut dest_bytes[e.dst as usize..e.dst as usize + elem];
                        r = self.t().get(win, rank, offset.wrapping_add(e.src as u64), to);
                        if r.is_err() {
                            break;
                        }
                    }
                    r
                }
            }
        };
        self.epochs().unlock(self.t(), rank, win);
        res.map_err(|e| {
            if e.is_proc_failed() {
                self.handle_comm_error(e)
            } else {
                e.into()
            }
        })
    }

    // ------------------------------------------------------------------
    // Self-access short-circuit
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn local_store(
        &self,
        win: WinId,
        offset: u64,
        dest: &Descriptor,
        src: &Descriptor,
        src_bytes: &[u8],
        may_require_temp: bool,
        count: usize,
    ) -> Result<()> {
        let elem = dest.elem_size;
        let staged: Vec<u8>;
        let from: &[u8] = if may_require_temp {
            staged = src_bytes.to_vec();
            &staged
        } else {
            src_bytes
        };
        let window = self.local_window_mut(win, offset, dest)?;
        if dest.rank() == 0 || (src.rank() != 0 && dest.is_contiguous() && src.is_contiguous()) {
            window[..count * elem].copy_from_slice(&from[..count * elem]);
        } else {
            for e in SectionIter::new(dest, Some(src)) {
                window[e.dst as usize..e.dst as usize + elem]
                    .copy_from_slice(&from[e.src as usize..e.src as usize + elem]);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn local_load(
        &self,
        win: WinId,
        offset: u64,
        src: &Descriptor,
        dest: &Descriptor,
        dest_bytes: &mut [u8],
        may_require_temp: bool,
        count: usize,
    ) -> Result<()> {
        let elem = dest.elem_size;
        let window = self.local_window_mut(win, offset, src)?;
        let staged: Vec<u8>;
        let from: &[u8] = if may_require_temp {
            staged = window.to_vec();
            &staged
        } else {
            window
        };
        if dest.rank() == 0 || (src.rank() != 0 && dest.is_contiguous() && src.is_contiguous()) {
            dest_bytes[..count * elem].copy_from_slice(&from[..count * elem]);
        } else {
            for e in SectionIter::new(dest, Some(src)) {
                dest_bytes[e.dst as usize..e.dst as usize + elem]
                    .copy_from_slice(&from[e.src as usize..e.src as usize + elem]);
            }
        }
        Ok(())
    }

    /// This image's region of `win` from `offset` to the end, as a slice.
    fn local_window_mut(&self, win: WinId, offset: u64, _layout: &Descriptor) -> Result<&mut [u8]> {
        let reg = self.registry.lock();
        let token = reg
            .find_master_by_win(win)
            .ok_or_else(|| CoralError::invalid_reference("window has no master token"))?;
        let len = token.size.saturating_sub(offset as usize);
        // SAFETY: the base pointer targets this image's window region, which
        // stays allocated until the token is deregistered; self-access runs
        // on the owning image with no concurrent local epoch.
        unsafe {
            Ok(std::slice::from_raw_parts_mut(
                token.base.0.add(offset as usize),
                len,
            ))
        }
    }
}

/// Compute the remote offsets of a section and pack the matching local
/// elements into one contiguous buffer.
fn pack_section(
    base: u64,
    dest: &Descriptor,
    src: &Descriptor,
    src_bytes: &[u8],
    count: usize,
) -> (Vec<u64>, Vec<u8>) {
    let elem = dest.elem_size;
    let mut offsets = Vec::with_capacity(count);
    let mut packed = vec![0u8; count * elem];
    for e in SectionIter::new(dest, Some(src)) {
        offsets.push(base.wrapping_add(e.dst as u64));
        packed[e.linear * elem..(e.linear + 1) * elem]
            .copy_from_slice(&src_bytes[e.src as usize..e.src as usize + elem]);
    }
    (offsets, packed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Dim;

    fn ivec(len: i64) -> Descriptor {
        Descriptor::vector(ElemType::Integer, 4, 4, len)
    }

    #[test]
    fn test_same_repr() {
        assert!(same_repr(&ivec(4), &ivec(8)));
        assert!(!same_repr(
            &ivec(4),
            &Descriptor::vector(ElemType::Integer, 8, 8, 4)
        ));
        let c1 = Descriptor::vector(ElemType::Character, 1, 4, 2);
        let c2 = Descriptor::vector(ElemType::Character, 1, 6, 2);
        assert!(!same_repr(&c1, &c2));
    }

    #[test]
    fn test_stage_kind_conversion() {
        let src = ivec(3);
        let dst = Descriptor::vector(ElemType::Integer, 8, 8, 3);
        let bytes: Vec<u8> = [-1i32, 2, -3]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        let staged = stage_to_dst_repr(&dst, &src, &bytes, 3).unwrap();
        let vals: Vec<i64> = staged
            .chunks_exact(8)
            .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vals, vec![-1, 2, -3]);
    }

    #[test]
    fn test_stage_character_padding() {
        let src = Descriptor::vector(ElemType::Character, 1, 3, 2);
        let dst = Descriptor::vector(ElemType::Character, 1, 5, 2);
        let staged = stage_to_dst_repr(&dst, &src, b"abcdef", 2).unwrap();
        assert_eq!(&staged, b"abc  def  ");
    }

    #[test]
    fn test_stage_rejects_character_truncation() {
        let src = Descriptor::vector(ElemType::Character, 1, 5, 1);
        let dst = Descriptor::vector(ElemType::Character, 1, 3, 1);
        assert!(matches!(
            stage_to_dst_repr(&dst, &src, b"abcde", 1),
            Err(CoralError::ExtentOutOfRange(_))
        ));
    }

    #[test]
    fn test_stage_strided_source() {
        // Elements {0, 2} of a length-3 buffer.
        let src = Descriptor::array(ElemType::Integer, 4, 4, &[Dim::new(1, 2, 2)]).unwrap();
        let dst = ivec(2);
        let bytes: Vec<u8> = [10i32, 20, 30].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let staged = stage_to_dst_repr(&dst, &src, &bytes, 2).unwrap();
        let vals: Vec<i32> = staged
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vals, vec![10, 30]);
    }
}
