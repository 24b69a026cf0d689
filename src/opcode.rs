//! [`WakeOp`] is the read-modify-write program applied by
//! [`Futex::wake_op`](crate::Futex::wake_op).

use log::warn;

use crate::error::Error;

/// Arithmetic applied to the second futex word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArithOp {
    /// `word = oparg`.
    Set,
    /// `word += oparg`.
    Add,
    /// `word |= oparg`.
    Or,
    /// `word &= !oparg`.
    AndNot,
    /// `word ^= oparg`.
    Xor,
}

/// Signed comparison between the previous value of the second word and `cmparg`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Comparison {
    /// `old == cmparg`.
    Eq,
    /// `old != cmparg`.
    Ne,
    /// `old < cmparg`.
    Lt,
    /// `old <= cmparg`.
    Le,
    /// `old > cmparg`.
    Gt,
    /// `old >= cmparg`.
    Ge,
}

/// [`WakeOp`] atomically updates a futex word and decides whether its waiters are woken.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WakeOp {
    op: ArithOp,
    oparg: u32,
    cmp: Comparison,
    cmparg: i32,
}

impl WakeOp {
    /// Flag in the operation nibble turning `oparg` into `1 << oparg`.
    pub const OPARG_SHIFT: u32 = 8;

    /// Creates a new [`WakeOp`].
    ///
    /// # Examples
    ///
    /// ```
    /// use futex_engine::opcode::{ArithOp, Comparison, WakeOp};
    ///
    /// let op = WakeOp::new(ArithOp::Add, 1, Comparison::Gt, 0);
    /// let encoded = WakeOp::encode(ArithOp::Add, 1, Comparison::Gt, 0, false);
    /// assert_eq!(WakeOp::decode(encoded), Ok(op));
    /// ```
    #[inline]
    #[must_use]
    pub const fn new(op: ArithOp, oparg: u32, cmp: Comparison, cmparg: i32) -> Self {
        Self {
            op,
            oparg,
            cmp,
            cmparg,
        }
    }

    /// Packs an operation into its 32-bit encoding.
    ///
    /// `oparg` and `cmparg` are truncated to 12 bits.
    #[must_use]
    pub const fn encode(op: ArithOp, oparg: i32, cmp: Comparison, cmparg: i32, shift: bool) -> u32 {
        let op = match op {
            ArithOp::Set => 0,
            ArithOp::Add => 1,
            ArithOp::Or => 2,
            ArithOp::AndNot => 3,
            ArithOp::Xor => 4,
        } | if shift { Self::OPARG_SHIFT } else { 0 };
        let cmp = match cmp {
            Comparison::Eq => 0,
            Comparison::Ne => 1,
            Comparison::Lt => 2,
            Comparison::Le => 3,
            Comparison::Gt => 4,
            Comparison::Ge => 5,
        };
        let oparg = u32::from_ne_bytes(oparg.to_ne_bytes()) & 0xfff;
        let cmparg = u32::from_ne_bytes(cmparg.to_ne_bytes()) & 0xfff;
        (op << 28) | (cmp << 24) | (oparg << 12) | cmparg
    }

    /// Unpacks an encoded operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the operation or the comparison is unknown.
    pub fn decode(encoded: u32) -> Result<Self, Error> {
        let op_bits = encoded >> 28;
        let op = match op_bits & !Self::OPARG_SHIFT {
            0 => ArithOp::Set,
            1 => ArithOp::Add,
            2 => ArithOp::Or,
            3 => ArithOp::AndNot,
            4 => ArithOp::Xor,
            _ => return Err(Error::InvalidArgument),
        };
        let cmp = match (encoded >> 24) & 0xf {
            0 => Comparison::Eq,
            1 => Comparison::Ne,
            2 => Comparison::Lt,
            3 => Comparison::Le,
            4 => Comparison::Gt,
            5 => Comparison::Ge,
            _ => return Err(Error::InvalidArgument),
        };
        let oparg = sign_extend((encoded >> 12) & 0xfff);
        let cmparg = sign_extend(encoded & 0xfff);
        let oparg = if op_bits & Self::OPARG_SHIFT == 0 {
            u32::from_ne_bytes(oparg.to_ne_bytes())
        } else {
            if !(0..32).contains(&oparg) {
                warn!("wake_op shift {oparg} out of range, clamped");
            }
            1_u32 << (oparg & 31).unsigned_abs()
        };
        Ok(Self::new(op, oparg, cmp, cmparg))
    }

    /// Computes the new word value from the old one.
    #[inline]
    pub(crate) const fn apply(&self, old: u32) -> u32 {
        match self.op {
            ArithOp::Set => self.oparg,
            ArithOp::Add => old.wrapping_add(self.oparg),
            ArithOp::Or => old | self.oparg,
            ArithOp::AndNot => old & !self.oparg,
            ArithOp::Xor => old ^ self.oparg,
        }
    }

    /// Evaluates the comparison against the old word value.
    #[inline]
    pub(crate) const fn compare(&self, old: u32) -> bool {
        let old = i32::from_ne_bytes(old.to_ne_bytes());
        match self.cmp {
            Comparison::Eq => old == self.cmparg,
            Comparison::Ne => old != self.cmparg,
            Comparison::Lt => old < self.cmparg,
            Comparison::Le => old <= self.cmparg,
            Comparison::Gt => old > self.cmparg,
            Comparison::Ge => old >= self.cmparg,
        }
    }
}

/// Sign-extends a 12-bit field.
const fn sign_extend(field: u32) -> i32 {
    i32::from_ne_bytes((field << 20).to_ne_bytes()) >> 20
}
