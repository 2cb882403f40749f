//! Type-directed atomic access to integer and logical coarray elements.

use crate::error::{CoralError, Result};
use crate::registry::Token;
use crate::runtime::Runtime;
use crate::transport::{AtomicOp, AtomicWidth, LockMode};
use crate::types::ImageIndex;

/// Operation codes of `atomic_op`, matching the front-end's encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AtomicOpCode {
    /// Atomic add.
    Add = 1,
    /// Atomic bitwise and.
    And = 2,
    /// Atomic bitwise or.
    Or = 4,
    /// Atomic bitwise xor.
    Xor = 5,
}

impl AtomicOpCode {
    /// Decode the front-end op code.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => AtomicOpCode::Add,
            2 => AtomicOpCode::And,
            4 => AtomicOpCode::Or,
            5 => AtomicOpCode::Xor,
            _ => return None,
        })
    }

    fn op(self) -> AtomicOp {
        match self {
            AtomicOpCode::Add => AtomicOp::Add,
            AtomicOpCode::And => AtomicOp::And,
            AtomicOpCode::Or => AtomicOp::Or,
            AtomicOpCode::Xor => AtomicOp::Xor,
        }
    }
}

fn width_for(kind: u32) -> Result<AtomicWidth> {
    AtomicWidth::for_kind(kind)
        .ok_or_else(|| CoralError::unsupported(format!("atomic access of kind {kind}")))
}

impl Runtime {
    /// Atomically store `value` at byte `offset` of the window of `token`
    /// on `image` (0 = self).
    pub fn atomic_define(
        &self,
        token: Token,
        offset: u64,
        image: ImageIndex,
        value: i64,
        kind: u32,
    ) -> Result<()> {
        let width = width_for(kind)?;
        let win = self.lookup(token)?;
        let target = self.rank_of(image);

        self.epochs().lock(self.t(), LockMode::Exclusive, target, win);
        let res = self
            .t()
            .atomic_fetch_op(win, target, offset, AtomicOp::Replace, value, width);
        self.epochs().unlock(self.t(), target, win);
        res?;
        Ok(())
    }

    /// Atomically read the value at byte `offset` on `image`.
    pub fn atomic_ref(
        &self,
        token: Token,
        offset: u64,
        image: ImageIndex,
        kind: u32,
    ) -> Result<i64> {
        let width = width_for(kind)?;
        let win = self.lookup(token)?;
        let target = self.rank_of(image);

        self.epochs().lock(self.t(), LockMode::Exclusive, target, win);
        let res = self
            .t()
            .atomic_fetch_op(win, target, offset, AtomicOp::NoOp, 0, width);
        self.epochs().unlock(self.t(), target, win);
        Ok(res?)
    }

    /// Atomic compare-and-swap; returns the previous value.
    #[allow(clippy::too_many_arguments)]
    pub fn atomic_cas(
        &self,
        token: Token,
        offset: u64,
        image: ImageIndex,
        compare: i64,
        new_value: i64,
        kind: u32,
    ) -> Result<i64> {
        let width = width_for(kind)?;
        let win = self.lookup(token)?;
        let target = self.rank_of(image);

        self.epochs().lock(self.t(), LockMode::Exclusive, target, win);
        let res = self
            .t()
            .atomic_cas(win, target, offset, compare, new_value, width);
        self.epochs().unlock(self.t(), target, win);
        Ok(res?)
    }

    /// Atomic fetch-and-op; returns the previous value.
    #[allow(clippy::too_many_arguments)]
    pub fn atomic_op(
        &self,
        op: AtomicOpCode,
        token: Token,
        offset: u64,
        image: ImageIndex,
        value: i64,
        kind: u32,
    ) -> Result<i64> {
        let width = width_for(kind)?;
        let win = self.lookup(token)?;
        let target = self.rank_of(image);

        self.epochs().lock(self.t(), LockMode::Exclusive, target, win);
        let res = self
            .t()
            .atomic_fetch_op(win, target, offset, op.op(), value, width);
        self.epochs().unlock(self.t(), target, win);
        Ok(res?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_codes() {
        assert_eq!(AtomicOpCode::from_code(1), Some(AtomicOpCode::Add));
        assert_eq!(AtomicOpCode::from_code(2), Some(AtomicOpCode::And));
        assert_eq!(AtomicOpCode::from_code(4), Some(AtomicOpCode::Or));
        assert_eq!(AtomicOpCode::from_code(5), Some(AtomicOpCode::Xor));
        assert_eq!(AtomicOpCode::from_code(3), None);
    }

    #[test]
    fn test_width_dispatch() {
        assert!(width_for(4).is_ok());
        assert!(width_for(8).is_ok());
        assert!(width_for(2).is_err());
        assert!(width_for(16).is_err());
    }
}
