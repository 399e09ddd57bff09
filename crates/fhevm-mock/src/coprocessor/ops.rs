//! Cleartext semantics of the coprocessor operators.
//!
//! All values are unsigned and bounded by the bit width `w` of their value type.
//! Arithmetic wraps modulo `2^w`; shift and rotate amounts are reduced modulo `w`.

use rand::Rng;

use super::CoprocessorError;
use crate::{
    cleartext::{ClearTextFlags, ClearValue},
    handle::{FheType, Handle, Operator, input_index},
};

/// Stride between packed entries of a mock input proof.
pub const PROOF_ENTRY_STRIDE: usize = 53;

/// Offset of the first packed entry (byte 0 holds the entry count).
pub const PROOF_HEADER_LEN: usize = 1;

const MAX_BITS: usize = ClearValue::BITS;

/// Result of a cleartext operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// The reduced value.
    pub value: ClearValue,
    /// Flags raised while computing it.
    pub flags: ClearTextFlags,
}

impl Outcome {
    fn plain(value: ClearValue) -> Self {
        Self { value, flags: ClearTextFlags::default() }
    }

    fn boolean(value: bool) -> Self {
        Self::plain(ClearValue::from(u64::from(value)))
    }
}

/// Returns the all-ones value of width `width`.
pub fn max_value(width: usize) -> ClearValue {
    if width == 0 {
        return ClearValue::ZERO;
    }
    ClearValue::MAX >> (MAX_BITS - width.min(MAX_BITS))
}

/// Reduces `value` modulo `2^width`.
pub fn mask(value: ClearValue, width: usize) -> ClearValue {
    if width >= MAX_BITS { value } else { value & max_value(width) }
}

fn shift_amount(amount: ClearValue, width: usize) -> usize {
    (amount % ClearValue::from(width as u64)).as_limbs()[0] as usize
}

/// Rotates the low `width` bits of `value` left by `amount`.
pub fn rotate_left(value: ClearValue, amount: ClearValue, width: usize) -> ClearValue {
    let value = mask(value, width);
    let amount = shift_amount(amount, width);
    if amount == 0 {
        return value;
    }
    mask((value << amount) | (value >> (width - amount)), width)
}

/// Rotates the low `width` bits of `value` right by `amount`.
pub fn rotate_right(value: ClearValue, amount: ClearValue, width: usize) -> ClearValue {
    let value = mask(value, width);
    let amount = shift_amount(amount, width);
    if amount == 0 {
        return value;
    }
    mask((value >> amount) | (value << (width - amount)), width)
}

/// Evaluates a binary operator on operands of width `width`.
///
/// Comparison results are 0 or 1; every other result is reduced modulo `2^width`.
pub fn binary(
    op: Operator,
    lhs: ClearValue,
    rhs: ClearValue,
    width: usize,
) -> Result<Outcome, CoprocessorError> {
    let lhs = mask(lhs, width);
    let rhs = mask(rhs, width);
    let limit = max_value(width);

    let outcome = match op {
        Operator::Add => {
            let (sum, carried) = lhs.overflowing_add(rhs);
            Outcome {
                value: mask(sum, width),
                flags: ClearTextFlags { overflow: carried || sum > limit, ..Default::default() },
            }
        }
        Operator::Sub => Outcome {
            value: mask(lhs.wrapping_sub(rhs), width),
            flags: ClearTextFlags { underflow: lhs < rhs, ..Default::default() },
        },
        Operator::Mul => {
            let (product, carried) = lhs.overflowing_mul(rhs);
            Outcome {
                value: mask(product, width),
                flags: ClearTextFlags { overflow: carried || product > limit, ..Default::default() },
            }
        }
        // A zero divisor saturates the quotient and leaves the dividend as remainder.
        Operator::Div => match lhs.checked_div(rhs) {
            Some(quotient) => Outcome::plain(quotient),
            None => Outcome {
                value: limit,
                flags: ClearTextFlags { division_by_zero: true, ..Default::default() },
            },
        },
        Operator::Rem => match lhs.checked_rem(rhs) {
            Some(remainder) => Outcome::plain(remainder),
            None => Outcome {
                value: lhs,
                flags: ClearTextFlags { division_by_zero: true, ..Default::default() },
            },
        },
        Operator::BitAnd => Outcome::plain(lhs & rhs),
        Operator::BitOr => Outcome::plain(lhs | rhs),
        Operator::BitXor => Outcome::plain(lhs ^ rhs),
        Operator::Shl => Outcome::plain(mask(lhs << shift_amount(rhs, width), width)),
        Operator::Shr => Outcome::plain(lhs >> shift_amount(rhs, width)),
        Operator::Rotl => Outcome::plain(rotate_left(lhs, rhs, width)),
        Operator::Rotr => Outcome::plain(rotate_right(lhs, rhs, width)),
        Operator::Eq => Outcome::boolean(lhs == rhs),
        Operator::Ne => Outcome::boolean(lhs != rhs),
        Operator::Ge => Outcome::boolean(lhs >= rhs),
        Operator::Gt => Outcome::boolean(lhs > rhs),
        Operator::Le => Outcome::boolean(lhs <= rhs),
        Operator::Lt => Outcome::boolean(lhs < rhs),
        Operator::Min => Outcome::plain(lhs.min(rhs)),
        Operator::Max => Outcome::plain(lhs.max(rhs)),
        other => return Err(CoprocessorError::NotBinary(other)),
    };
    Ok(outcome)
}

/// Bitwise complement within `width` bits.
pub fn not(value: ClearValue, width: usize) -> ClearValue {
    mask(!value, width)
}

/// Two's-complement negation within `width` bits.
pub fn neg(value: ClearValue, width: usize) -> ClearValue {
    mask((!value).wrapping_add(ClearValue::from(1u64)), width)
}

/// Reinterprets `value` as a value of `target`.
pub fn cast(value: ClearValue, target: FheType) -> ClearValue {
    mask(value, target.bit_width())
}

/// Draws `bits` uniformly random bits.
pub fn random<R: Rng + ?Sized>(rng: &mut R, bits: usize) -> ClearValue {
    let mut bytes = [0u8; ClearValue::BYTES];
    rng.fill(&mut bytes[..]);
    mask(ClearValue::from_be_bytes(bytes), bits)
}

/// Number of random bits drawn for a bounded random value of `ty`.
///
/// Bounds are powers of two on-chain; other bounds round down.
pub fn bounded_bits(bound: ClearValue, ty: FheType) -> usize {
    bound.bit_len().saturating_sub(1).min(ty.bit_width())
}

/// Extracts the cleartext of an input handle from its mock input proof.
///
/// Entry `i` starts at `1 + 53 * i` and holds the value in its first
/// `byte_size(ty)` bytes. `Bytes256` values use the full window after the header.
pub fn slice_proof(proof: &[u8], handle: &Handle, ty: FheType) -> Result<ClearValue, CoprocessorError> {
    let start = if ty == FheType::Bytes256 {
        PROOF_HEADER_LEN
    } else {
        PROOF_HEADER_LEN + PROOF_ENTRY_STRIDE * input_index(handle) as usize
    };
    let end = start + ty.byte_size();
    let window = proof.get(start..end).ok_or(CoprocessorError::MalformedProof {
        handle: *handle,
        start,
        end,
        len: proof.len(),
    })?;
    Ok(mask(ClearValue::from_be_slice(window), ty.bit_width()))
}
