//! Typed execution traces.
//!
//! Step-level traces (`debug_traceTransaction` with the default struct logger) are
//! parsed once into a list of [`CallStep`] records: the call opcode, its target and
//! the exact input bytes sliced out of memory. Everything downstream works on these
//! records instead of raw stack and memory dumps.

use alloy_primitives::{Address, B256, Bytes, U256, hex};
use alloy_rpc_types_trace::geth::DefaultFrame;

const WORD: usize = 32;

/// Errors raised while parsing a step trace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    /// A call step did not have enough stack items.
    #[error("{opcode:?} step at depth {depth} has {available} stack items, needs {needed}")]
    StackUnderflow {
        /// The call opcode.
        opcode: CallOpcode,
        /// Call depth of the step.
        depth: u64,
        /// Stack items present.
        available: usize,
        /// Stack items required.
        needed: usize,
    },

    /// A call step was captured without memory.
    #[error("{0:?} step captured without memory, enable memory in the tracer config")]
    MissingMemory(CallOpcode),

    /// A memory word was not valid hex.
    #[error("invalid memory word: {0}")]
    InvalidMemory(String),

    /// Offset or size does not fit in memory addressing.
    #[error("call arguments out of range (offset {offset}, size {size})")]
    ArgumentsOutOfRange {
        /// Raw offset word.
        offset: U256,
        /// Raw size word.
        size: U256,
    },
}

/// Opcodes that perform an external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOpcode {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
}

impl CallOpcode {
    /// Parses an opcode mnemonic, returning `None` for non-call opcodes.
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "CALL" => Some(Self::Call),
            "CALLCODE" => Some(Self::CallCode),
            "DELEGATECALL" => Some(Self::DelegateCall),
            "STATICCALL" => Some(Self::StaticCall),
            _ => None,
        }
    }

    /// Position of `argsOffset` counted from the top of the stack.
    ///
    /// CALL and CALLCODE take `gas, addr, value, argsOffset, argsSize, ...`; the other
    /// two have no value word.
    const fn args_position(self) -> usize {
        match self {
            Self::Call | Self::CallCode => 3,
            Self::DelegateCall | Self::StaticCall => 2,
        }
    }
}

/// A single struct-log step, borrowed from whatever produced the trace.
#[derive(Debug, Clone, Copy)]
pub struct RawStep<'a> {
    /// Opcode mnemonic.
    pub op: &'a str,
    /// Call depth.
    pub depth: u64,
    /// Stack, bottom first.
    pub stack: Option<&'a [U256]>,
    /// Memory as 32-byte hex words.
    pub memory: Option<&'a [String]>,
}

/// An external call made during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStep {
    /// Call depth of the calling frame.
    pub depth: u64,
    /// Call opcode.
    pub opcode: CallOpcode,
    /// Called address.
    pub target: Address,
    /// Memory offset of the call input.
    pub args_offset: usize,
    /// Length of the call input.
    pub args_size: usize,
    /// Call input.
    pub input: Bytes,
}

/// The external calls of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionTrace {
    /// Whether the transaction reverted.
    pub failed: bool,
    /// External calls, in execution order.
    pub calls: Vec<CallStep>,
}

impl ExecutionTrace {
    /// Parses a geth default-tracer frame, keeping the calls made to `target`.
    pub fn from_frame(frame: &DefaultFrame, target: Address) -> Result<Self, TraceError> {
        Self::from_steps(
            frame.failed,
            target,
            frame.struct_logs.iter().map(|log| RawStep {
                op: log.opcode(),
                depth: log.depth,
                stack: log.stack.as_deref(),
                memory: log.memory.as_deref(),
            }),
        )
    }

    /// Parses a sequence of raw steps, keeping only external calls to `target`.
    ///
    /// Calls to other addresses are skipped before their arguments are read, so
    /// out-of-gas calls with absurd memory windows elsewhere in the transaction do
    /// not affect parsing.
    pub fn from_steps<'a>(
        failed: bool,
        target: Address,
        steps: impl IntoIterator<Item = RawStep<'a>>,
    ) -> Result<Self, TraceError> {
        let mut calls = Vec::new();
        for step in steps {
            let Some(opcode) = CallOpcode::parse(step.op) else {
                continue;
            };
            if let Some(call) = parse_call(opcode, &step, target)? {
                calls.push(call);
            }
        }
        Ok(Self { failed, calls })
    }

    /// Returns the calls made to `target`.
    pub fn calls_to(&self, target: Address) -> impl Iterator<Item = &CallStep> {
        self.calls.iter().filter(move |call| call.target == target)
    }
}

fn parse_call(
    opcode: CallOpcode,
    step: &RawStep<'_>,
    wanted: Address,
) -> Result<Option<CallStep>, TraceError> {
    let stack = step.stack.unwrap_or_default();
    let needed = opcode.args_position() + 2;
    if stack.len() < needed {
        return Err(TraceError::StackUnderflow {
            opcode,
            depth: step.depth,
            available: stack.len(),
            needed,
        });
    }

    // Top of stack is the last element.
    let peek = |n: usize| stack[stack.len() - 1 - n];
    let target = Address::from_word(B256::from(peek(1).to_be_bytes::<32>()));
    if target != wanted {
        return Ok(None);
    }

    let offset_word = peek(opcode.args_position());
    let size_word = peek(opcode.args_position() + 1);
    let (Ok(args_offset), Ok(args_size)) =
        (usize::try_from(offset_word), usize::try_from(size_word))
    else {
        return Err(TraceError::ArgumentsOutOfRange { offset: offset_word, size: size_word });
    };

    let memory = step.memory.ok_or(TraceError::MissingMemory(opcode))?;
    let input = slice_memory(memory, args_offset, args_size)?;

    Ok(Some(CallStep { depth: step.depth, opcode, target, args_offset, args_size, input }))
}

/// Copies `size` bytes at `offset` out of word-encoded memory.
///
/// The window may run at most one word past the captured memory, which is
/// zero-filled.
fn slice_memory(words: &[String], offset: usize, size: usize) -> Result<Bytes, TraceError> {
    if size == 0 {
        return Ok(Bytes::new());
    }
    let out_of_range =
        || TraceError::ArgumentsOutOfRange { offset: U256::from(offset), size: U256::from(size) };
    let end = offset.checked_add(size).ok_or_else(out_of_range)?;
    if end > (words.len() + 1) * WORD {
        return Err(out_of_range());
    }

    let mut out = vec![0u8; size];
    for (index, word) in words.iter().enumerate().take(end.div_ceil(WORD)).skip(offset / WORD) {
        let bytes = hex::decode(word).map_err(|_| TraceError::InvalidMemory(word.clone()))?;
        let word_start = index * WORD;
        for (i, byte) in bytes.iter().enumerate() {
            let position = word_start + i;
            if (offset..end).contains(&position) {
                out[position - offset] = *byte;
            }
        }
    }
    Ok(out.into())
}
