//! Executor call decoding
//!
//! Decodes the calldata of calls made to the FHE executor contract into typed
//! [`ExecutorCall`] values.

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{SolInterface, sol};

use super::CoprocessorError;
use crate::handle::{Handle, Operator};

sol! {
    /// Entry points of the FHE executor that produce handles.
    interface IFhevmExecutor {
        function fheAdd(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheSub(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheMul(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheDiv(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheRem(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheBitAnd(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheBitOr(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheBitXor(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheShl(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheShr(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheRotl(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheRotr(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheEq(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheNe(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheGe(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheGt(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheLe(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheLt(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheMin(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheMax(bytes32 lhs, bytes32 rhs, bytes1 scalarByte) external returns (bytes32 result);
        function fheNeg(bytes32 ct) external returns (bytes32 result);
        function fheNot(bytes32 ct) external returns (bytes32 result);
        function verifyCiphertext(bytes32 inputHandle, address userAddress, bytes inputProof, uint8 inputType) external returns (bytes32 result);
        function cast(bytes32 ct, uint8 toType) external returns (bytes32 result);
        function trivialEncrypt(uint256 pt, uint8 toType) external returns (bytes32 result);
        function fheIfThenElse(bytes32 control, bytes32 ifTrue, bytes32 ifFalse) external returns (bytes32 result);
        function fheRand(uint8 randType) external returns (bytes32 result);
        function fheRandBounded(uint256 upperBound, uint8 randType) external returns (bytes32 result);
    }
}

use IFhevmExecutor::IFhevmExecutorCalls as Calls;

/// A decoded executor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCall {
    /// Two-operand arithmetic, bitwise or comparison operator.
    Binary {
        /// The operator.
        op: Operator,
        /// Left operand handle.
        lhs: Handle,
        /// Right operand: a handle, or a plaintext word when `scalar` is set.
        rhs: Handle,
        /// Whether `rhs` is a plaintext scalar.
        scalar: bool,
    },
    /// Negation or bitwise complement.
    Unary {
        /// [`Operator::Neg`] or [`Operator::Not`].
        op: Operator,
        /// Operand handle.
        ct: Handle,
    },
    /// Type conversion.
    Cast {
        /// Operand handle.
        ct: Handle,
        /// Target type tag.
        to: u8,
    },
    /// Encryption of a public plaintext.
    TrivialEncrypt {
        /// The plaintext.
        value: U256,
        /// Target type tag.
        to: u8,
    },
    /// Verification of a user-supplied input.
    VerifyCiphertext {
        /// The input handle.
        handle: Handle,
        /// Account the input is bound to.
        user: Address,
        /// The packed input proof.
        proof: Bytes,
        /// Declared type tag.
        ty: u8,
    },
    /// Encrypted conditional.
    IfThenElse {
        control: Handle,
        if_true: Handle,
        if_false: Handle,
    },
    /// Fresh random value.
    Rand {
        /// Type tag.
        ty: u8,
    },
    /// Fresh random value below a power-of-two bound.
    RandBounded {
        /// Exclusive upper bound.
        bound: U256,
        /// Type tag.
        ty: u8,
    },
}

macro_rules! binary {
    ($op:ident, $call:expr) => {{
        let call = $call;
        ExecutorCall::Binary {
            op: Operator::$op,
            lhs: call.lhs,
            rhs: call.rhs,
            scalar: call.scalarByte[0] == 1,
        }
    }};
}

impl ExecutorCall {
    /// Decodes executor calldata.
    ///
    /// Calldata whose selector is not an executor entry point yields
    /// [`CoprocessorError::UnsupportedOperation`].
    pub fn decode(input: &[u8]) -> Result<Self, CoprocessorError> {
        let Some(selector) = input.get(..4).and_then(|s| <[u8; 4]>::try_from(s).ok()) else {
            return Err(CoprocessorError::UnsupportedOperation { selector: [0; 4] });
        };
        if !Calls::valid_selector(selector) {
            return Err(CoprocessorError::UnsupportedOperation { selector });
        }

        let call = match Calls::abi_decode(input)? {
            Calls::fheAdd(c) => binary!(Add, c),
            Calls::fheSub(c) => binary!(Sub, c),
            Calls::fheMul(c) => binary!(Mul, c),
            Calls::fheDiv(c) => binary!(Div, c),
            Calls::fheRem(c) => binary!(Rem, c),
            Calls::fheBitAnd(c) => binary!(BitAnd, c),
            Calls::fheBitOr(c) => binary!(BitOr, c),
            Calls::fheBitXor(c) => binary!(BitXor, c),
            Calls::fheShl(c) => binary!(Shl, c),
            Calls::fheShr(c) => binary!(Shr, c),
            Calls::fheRotl(c) => binary!(Rotl, c),
            Calls::fheRotr(c) => binary!(Rotr, c),
            Calls::fheEq(c) => binary!(Eq, c),
            Calls::fheNe(c) => binary!(Ne, c),
            Calls::fheGe(c) => binary!(Ge, c),
            Calls::fheGt(c) => binary!(Gt, c),
            Calls::fheLe(c) => binary!(Le, c),
            Calls::fheLt(c) => binary!(Lt, c),
            Calls::fheMin(c) => binary!(Min, c),
            Calls::fheMax(c) => binary!(Max, c),
            Calls::fheNeg(c) => Self::Unary { op: Operator::Neg, ct: c.ct },
            Calls::fheNot(c) => Self::Unary { op: Operator::Not, ct: c.ct },
            Calls::verifyCiphertext(c) => Self::VerifyCiphertext {
                handle: c.inputHandle,
                user: c.userAddress,
                proof: c.inputProof,
                ty: c.inputType,
            },
            Calls::cast(c) => Self::Cast { ct: c.ct, to: c.toType },
            Calls::trivialEncrypt(c) => Self::TrivialEncrypt { value: c.pt, to: c.toType },
            Calls::fheIfThenElse(c) => {
                Self::IfThenElse { control: c.control, if_true: c.ifTrue, if_false: c.ifFalse }
            }
            Calls::fheRand(c) => Self::Rand { ty: c.randType },
            Calls::fheRandBounded(c) => Self::RandBounded { bound: c.upperBound, ty: c.randType },
        };
        Ok(call)
    }

    /// Returns the operator this call performs.
    pub const fn operator(&self) -> Operator {
        match self {
            Self::Binary { op, .. } | Self::Unary { op, .. } => *op,
            Self::Cast { .. } => Operator::Cast,
            Self::TrivialEncrypt { .. } => Operator::TrivialEncrypt,
            Self::VerifyCiphertext { .. } => Operator::VerifyCiphertext,
            Self::IfThenElse { .. } => Operator::IfThenElse,
            Self::Rand { .. } => Operator::Rand,
            Self::RandBounded { .. } => Operator::RandBounded,
        }
    }
}
