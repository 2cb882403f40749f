//! Element-wise conversion between scalar kinds and character kinds.
//!
//! Numeric conversion goes through a widest common representation (128-bit
//! integer, double real, double complex) and demotes into the destination.
//! Character conversion translates code units between kind 1 (octets) and
//! kind 4 (32-bit), padding with the space character of the destination kind.

use crate::error::{CoralError, Result};
use crate::types::ElemType;

/// The widest representation a numeric element is promoted to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    /// Integer and logical values.
    Int(i128),
    /// Real values.
    Real(f64),
    /// Complex values as (re, im).
    Complex(f64, f64),
}

fn unsupported(
    from_type: ElemType,
    from_kind: u32,
    to_type: ElemType,
    to_kind: u32,
) -> CoralError {
    CoralError::TypeConversion {
        from_type,
        from_kind,
        to_type,
        to_kind,
    }
}

fn read_real(kind: u32, bytes: &[u8]) -> Option<f64> {
    match kind {
        4 => Some(f32::from_ne_bytes(bytes[..4].try_into().ok()?) as f64),
        8 => Some(f64::from_ne_bytes(bytes[..8].try_into().ok()?)),
        _ => None,
    }
}

fn write_real(kind: u32, v: f64, out: &mut [u8]) -> bool {
    match kind {
        4 => out[..4].copy_from_slice(&(v as f32).to_ne_bytes()),
        8 => out[..8].copy_from_slice(&v.to_ne_bytes()),
        _ => return false,
    }
    true
}

fn read_int(kind: u32, bytes: &[u8]) -> Option<i128> {
    Some(match kind {
        1 => i8::from_ne_bytes(bytes[..1].try_into().ok()?) as i128,
        2 => i16::from_ne_bytes(bytes[..2].try_into().ok()?) as i128,
        4 => i32::from_ne_bytes(bytes[..4].try_into().ok()?) as i128,
        8 => i64::from_ne_bytes(bytes[..8].try_into().ok()?) as i128,
        16 => i128::from_ne_bytes(bytes[..16].try_into().ok()?),
        _ => return None,
    })
}

fn write_int(kind: u32, v: i128, out: &mut [u8]) -> bool {
    match kind {
        1 => out[..1].copy_from_slice(&(v as i8).to_ne_bytes()),
        2 => out[..2].copy_from_slice(&(v as i16).to_ne_bytes()),
        4 => out[..4].copy_from_slice(&(v as i32).to_ne_bytes()),
        8 => out[..8].copy_from_slice(&(v as i64).to_ne_bytes()),
        16 => out[..16].copy_from_slice(&v.to_ne_bytes()),
        _ => return false,
    }
    true
}

/// Read one numeric element into the widest representation.
pub fn read_scalar(elem_type: ElemType, kind: u32, bytes: &[u8]) -> Result<Scalar> {
    let fail = || unsupported(elem_type, kind, elem_type, kind);
    match elem_type {
        ElemType::Integer | ElemType::Logical => {
            Ok(Scalar::Int(read_int(kind, bytes).ok_or_else(fail)?))
        }
        ElemType::Real => Ok(Scalar::Real(read_real(kind, bytes).ok_or_else(fail)?)),
        ElemType::Complex => {
            let half = kind as usize;
            let re = read_real(kind, &bytes[..half]).ok_or_else(fail)?;
            let im = read_real(kind, &bytes[half..]).ok_or_else(fail)?;
            Ok(Scalar::Complex(re, im))
        }
        _ => Err(fail()),
    }
}

/// Demote a widest-representation value into one destination element.
pub fn write_scalar(elem_type: ElemType, kind: u32, v: Scalar, out: &mut [u8]) -> Result<()> {
    let fail = || unsupported(elem_type, kind, elem_type, kind);
    match elem_type {
        ElemType::Integer | ElemType::Logical => {
            let i = match v {
                Scalar::Int(i) => i,
                Scalar::Real(r) => r as i128,
                Scalar::Complex(re, _) => re as i128,
            };
            if !write_int(kind, i, out) {
                return Err(fail());
            }
        }
        ElemType::Real => {
            let r = match v {
                Scalar::Int(i) => i as f64,
                Scalar::Real(r) => r,
                Scalar::Complex(re, _) => re,
            };
            if !write_real(kind, r, out) {
                return Err(fail());
            }
        }
        ElemType::Complex => {
            let (re, im) = match v {
                Scalar::Int(i) => (i as f64, 0.0),
                Scalar::Real(r) => (r, 0.0),
                Scalar::Complex(re, im) => (re, im),
            };
            let half = kind as usize;
            if !write_real(kind, re, &mut out[..half]) || !write_real(kind, im, &mut out[half..]) {
                return Err(fail());
            }
        }
        _ => return Err(fail()),
    }
    Ok(())
}

/// Convert one numeric element between types and kinds.
pub fn convert_elem(
    src_type: ElemType,
    src_kind: u32,
    src: &[u8],
    dst_type: ElemType,
    dst_kind: u32,
    dst: &mut [u8],
) -> Result<()> {
    if !src_type.is_numeric() || !dst_type.is_numeric() {
        return Err(unsupported(src_type, src_kind, dst_type, dst_kind));
    }
    let v = read_scalar(src_type, src_kind, src)
        .map_err(|_| unsupported(src_type, src_kind, dst_type, dst_kind))?;
    write_scalar(dst_type, dst_kind, v, dst)
        .map_err(|_| unsupported(src_type, src_kind, dst_type, dst_kind))
}

// ============================================================================
// Characters
// ============================================================================

/// Fill a character buffer with the space character of the given kind.
pub fn space_fill(kind: u32, out: &mut [u8]) {
    match kind {
        4 => {
            for unit in out.chunks_exact_mut(4) {
                unit.copy_from_slice(&0x20u32.to_ne_bytes());
            }
        }
        _ => out.fill(b' '),
    }
}

fn read_unit(kind: u32, bytes: &[u8]) -> u32 {
    match kind {
        4 => u32::from_ne_bytes(bytes[..4].try_into().unwrap_or([0; 4])),
        _ => bytes[0] as u32,
    }
}

fn write_unit(kind: u32, unit: u32, out: &mut [u8]) {
    match kind {
        4 => out[..4].copy_from_slice(&unit.to_ne_bytes()),
        _ => {
            // Narrowing: code points above the octet range become '?'.
            out[0] = if unit > 0xff { b'?' } else { unit as u8 };
        }
    }
}

/// Convert one character element between kinds 1 and 4, translating code
/// units and space-padding the remainder of the destination element.
pub fn convert_char(src_kind: u32, src: &[u8], dst_kind: u32, dst: &mut [u8]) -> Result<()> {
    if !matches!(src_kind, 1 | 4) || !matches!(dst_kind, 1 | 4) {
        return Err(unsupported(
            ElemType::Character,
            src_kind,
            ElemType::Character,
            dst_kind,
        ));
    }
    let src_units = src.len() / src_kind as usize;
    let dst_units = dst.len() / dst_kind as usize;
    let n = src_units.min(dst_units);
    for i in 0..n {
        let unit = read_unit(src_kind, &src[i * src_kind as usize..]);
        write_unit(dst_kind, unit, &mut dst[i * dst_kind as usize..]);
    }
    space_fill(dst_kind, &mut dst[n * dst_kind as usize..]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widening_sign_extends() {
        let v: i32 = -7;
        let mut out = [0u8; 8];
        convert_elem(ElemType::Integer, 4, &v.to_ne_bytes(), ElemType::Integer, 8, &mut out)
            .unwrap();
        assert_eq!(i64::from_ne_bytes(out), -7);
    }

    #[test]
    fn test_integer_narrowing_keeps_low_bits() {
        let v: i64 = 0x1_2345_6789;
        let mut out = [0u8; 4];
        convert_elem(ElemType::Integer, 8, &v.to_ne_bytes(), ElemType::Integer, 4, &mut out)
            .unwrap();
        assert_eq!(i32::from_ne_bytes(out), 0x2345_6789);
    }

    #[test]
    fn test_int_to_real() {
        let v: i32 = 42;
        let mut out = [0u8; 8];
        convert_elem(ElemType::Integer, 4, &v.to_ne_bytes(), ElemType::Real, 8, &mut out).unwrap();
        assert_eq!(f64::from_ne_bytes(out), 42.0);
    }

    #[test]
    fn test_real_to_complex() {
        let v: f32 = 1.5;
        let mut out = [0u8; 16];
        convert_elem(ElemType::Real, 4, &v.to_ne_bytes(), ElemType::Complex, 8, &mut out).unwrap();
        assert_eq!(f64::from_ne_bytes(out[..8].try_into().unwrap()), 1.5);
        assert_eq!(f64::from_ne_bytes(out[8..].try_into().unwrap()), 0.0);
    }

    #[test]
    fn test_complex_to_real_takes_real_part() {
        let mut src = [0u8; 16];
        src[..8].copy_from_slice(&3.0f64.to_ne_bytes());
        src[8..].copy_from_slice(&4.0f64.to_ne_bytes());
        let mut out = [0u8; 4];
        convert_elem(ElemType::Complex, 8, &src, ElemType::Real, 4, &mut out).unwrap();
        assert_eq!(f32::from_ne_bytes(out), 3.0);
    }

    #[test]
    fn test_character_rejected_by_numeric_path() {
        let mut out = [0u8; 4];
        assert!(matches!(
            convert_elem(ElemType::Character, 1, b"abcd", ElemType::Integer, 4, &mut out),
            Err(CoralError::TypeConversion { .. })
        ));
    }

    #[test]
    fn test_char_widening() {
        let mut out = [0u8; 16]; // 4 units of kind 4
        convert_char(1, b"ab", 4, &mut out).unwrap();
        let units: Vec<u32> = out
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(units, vec![b'a' as u32, b'b' as u32, 0x20, 0x20]);
    }

    #[test]
    fn test_char_narrowing_replaces_wide_units() {
        let mut src = [0u8; 8];
        src[..4].copy_from_slice(&0x263Au32.to_ne_bytes()); // outside octet range
        src[4..].copy_from_slice(&(b'x' as u32).to_ne_bytes());
        let mut out = [0u8; 3];
        convert_char(4, &src, 1, &mut out).unwrap();
        assert_eq!(&out, b"?x ");
    }

    #[test]
    fn test_space_fill_kind4() {
        let mut out = [0u8; 8];
        space_fill(4, &mut out);
        assert_eq!(u32::from_ne_bytes(out[..4].try_into().unwrap()), 0x20);
    }
}
