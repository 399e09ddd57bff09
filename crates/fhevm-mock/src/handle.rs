//! Handle Codec
//!
//! Handles are 32-byte identifiers that stand in for ciphertexts. Their layout is:
//!
//! ```text
//! | bytes 0..29        | byte 29 | byte 30    | byte 31 |
//! | keccak256 prefix   | index   | value type | version |
//! ```
//!
//! Computed handles carry `0xff` in the index byte; input handles carry their
//! position inside the packed input proof. The value type is read back with a
//! single byte access so consumers can dispatch on bit width without knowing
//! how the handle was produced.

use alloy_primitives::{Address, B256, U256, keccak256};
use serde::{Deserialize, Serialize};

/// A ciphertext handle.
pub type Handle = B256;

/// Version byte written into every handle produced by this codec.
pub const HANDLE_VERSION: u8 = 0;

/// Index byte marking a handle as the output of a computation.
pub const COMPUTED_INDEX: u8 = 0xff;

/// Offset of the packed input index.
pub const INDEX_BYTE: usize = 29;

/// Offset of the value type tag.
pub const TYPE_BYTE: usize = 30;

/// Offset of the version byte.
pub const VERSION_BYTE: usize = 31;

/// Errors produced while encoding or decoding handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    /// The type tag does not name a known value type.
    #[error("unknown value type tag {0}")]
    UnknownType(u8),

    /// A randomized operator was encoded without its trailing counter.
    #[error("randomized operator {0:?} requires a trailing counter operand")]
    MissingCounter(Operator),

    /// `verifyCiphertext` was encoded without the input handle.
    #[error("ciphertext verification requires the input handle as first operand")]
    MissingInputHandle,
}

/// Value types a handle can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum FheType {
    /// Encrypted boolean.
    Bool = 0,
    /// 4-bit unsigned integer.
    Uint4 = 1,
    /// 8-bit unsigned integer.
    Uint8 = 2,
    /// 16-bit unsigned integer.
    Uint16 = 3,
    /// 32-bit unsigned integer.
    Uint32 = 4,
    /// 64-bit unsigned integer.
    Uint64 = 5,
    /// 128-bit unsigned integer.
    Uint128 = 6,
    /// 160-bit address.
    Address = 7,
    /// 256-bit unsigned integer.
    Uint256 = 8,
    /// 64-byte blob.
    Bytes64 = 9,
    /// 128-byte blob.
    Bytes128 = 10,
    /// 256-byte blob.
    Bytes256 = 11,
}

impl FheType {
    /// All value types, ordered by tag.
    pub const ALL: [Self; 12] = [
        Self::Bool,
        Self::Uint4,
        Self::Uint8,
        Self::Uint16,
        Self::Uint32,
        Self::Uint64,
        Self::Uint128,
        Self::Address,
        Self::Uint256,
        Self::Bytes64,
        Self::Bytes128,
        Self::Bytes256,
    ];

    /// Returns the tag stored in byte 30 of the handle.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Returns the number of significant bits of a value of this type.
    pub const fn bit_width(self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Uint4 => 4,
            Self::Uint8 => 8,
            Self::Uint16 => 16,
            Self::Uint32 => 32,
            Self::Uint64 => 64,
            Self::Uint128 => 128,
            Self::Address => 160,
            Self::Uint256 => 256,
            Self::Bytes64 => 512,
            Self::Bytes128 => 1024,
            Self::Bytes256 => 2048,
        }
    }

    /// Returns the number of bytes a value of this type occupies inside an input proof.
    pub const fn byte_size(self) -> usize {
        match self {
            Self::Bool | Self::Uint4 | Self::Uint8 => 1,
            Self::Uint16 => 2,
            Self::Uint32 => 4,
            Self::Uint64 => 8,
            Self::Uint128 => 16,
            Self::Address => 20,
            Self::Uint256 => 32,
            Self::Bytes64 => 64,
            Self::Bytes128 => 128,
            Self::Bytes256 => 256,
        }
    }

    /// Returns true for the large byte-blob types.
    pub const fn is_bytes(self) -> bool {
        matches!(self, Self::Bytes64 | Self::Bytes128 | Self::Bytes256)
    }
}

impl TryFrom<u8> for FheType {
    type Error = HandleError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(tag as usize).copied().ok_or(HandleError::UnknownType(tag))
    }
}

/// Operators understood by the coprocessor, with their on-chain codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operator {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Rem = 4,
    BitAnd = 5,
    BitOr = 6,
    BitXor = 7,
    Shl = 8,
    Shr = 9,
    Rotl = 10,
    Rotr = 11,
    Eq = 12,
    Ne = 13,
    Ge = 14,
    Gt = 15,
    Le = 16,
    Lt = 17,
    Min = 18,
    Max = 19,
    Neg = 20,
    Not = 21,
    VerifyCiphertext = 22,
    Cast = 23,
    TrivialEncrypt = 24,
    IfThenElse = 25,
    Rand = 26,
    RandBounded = 27,
}

impl Operator {
    /// Returns the operator code hashed into computed handles.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Returns true for operators whose output is not a function of their inputs.
    pub const fn is_randomized(self) -> bool {
        matches!(self, Self::Rand | Self::RandBounded)
    }

    /// Returns true for operators producing a boolean regardless of operand type.
    pub const fn is_comparison(self) -> bool {
        matches!(self, Self::Eq | Self::Ne | Self::Ge | Self::Gt | Self::Le | Self::Lt)
    }
}

/// One element of a packed handle preimage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Another handle, packed as 32 bytes.
    Handle(Handle),
    /// A 256-bit word (plaintext, bound or counter), packed as 32 bytes.
    Uint(U256),
    /// A single byte (type tag or scalar flag).
    Byte(u8),
}

impl Operand {
    fn write_packed(&self, out: &mut Vec<u8>) {
        match self {
            Self::Handle(handle) => out.extend_from_slice(handle.as_slice()),
            Self::Uint(word) => out.extend_from_slice(&word.to_be_bytes::<32>()),
            Self::Byte(byte) => out.push(*byte),
        }
    }
}

/// Deterministic handle derivation bound to an ACL contract and chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleCodec {
    acl: Address,
    chain_id: u64,
}

impl HandleCodec {
    /// Creates a codec for the given ACL address and chain id.
    pub const fn new(acl: Address, chain_id: u64) -> Self {
        Self { acl, chain_id }
    }

    /// Returns the chain id hashed into every computed handle.
    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Derives the handle produced by `op` over `operands`.
    ///
    /// Randomized operators must carry their counter as the last operand, which is
    /// what makes two otherwise identical calls yield distinct handles. Ciphertext
    /// verification returns the verified input handle unchanged.
    pub fn encode(
        &self,
        op: Operator,
        value_type: FheType,
        operands: &[Operand],
    ) -> Result<Handle, HandleError> {
        if op == Operator::VerifyCiphertext {
            return match operands.first() {
                Some(Operand::Handle(input)) => Ok(*input),
                _ => Err(HandleError::MissingInputHandle),
            };
        }
        if op.is_randomized() && !matches!(operands.last(), Some(Operand::Uint(_))) {
            return Err(HandleError::MissingCounter(op));
        }

        let mut preimage = Vec::with_capacity(1 + operands.len() * 32 + 20 + 32);
        preimage.push(op.code());
        for operand in operands {
            operand.write_packed(&mut preimage);
        }
        preimage.extend_from_slice(self.acl.as_slice());
        preimage.extend_from_slice(&U256::from(self.chain_id).to_be_bytes::<32>());

        Ok(with_metadata(keccak256(&preimage), COMPUTED_INDEX, value_type))
    }

    /// Reads the value type of a handle.
    pub fn decode(&self, handle: &Handle) -> Result<FheType, HandleError> {
        value_type(handle)
    }
}

/// Reads the value type tag of `handle`.
pub fn value_type(handle: &Handle) -> Result<FheType, HandleError> {
    FheType::try_from(handle[TYPE_BYTE])
}

/// Reads the packed input index of `handle`.
pub fn input_index(handle: &Handle) -> u8 {
    handle[INDEX_BYTE]
}

/// Overwrites the metadata bytes of `prehandle`.
pub fn with_metadata(prehandle: B256, index: u8, value_type: FheType) -> Handle {
    let mut bytes = prehandle.0;
    bytes[INDEX_BYTE] = index;
    bytes[TYPE_BYTE] = value_type.tag();
    bytes[VERSION_BYTE] = HANDLE_VERSION;
    B256::from(bytes)
}
