//! Mock Coprocessor
//!
//! Replays every call a transaction makes to the FHE executor contract in cleartext.
//! For each mined transaction the coprocessor fetches a step trace, picks out the
//! calls to the executor, decodes them into [`ExecutorCall`]s, evaluates them and
//! stores the result under the handle the executor itself would have returned.
//!
//! Scanning is checkpointed at transaction granularity: a transient failure while
//! fetching a trace leaves the checkpoint on that transaction so the next sync
//! resumes exactly where the previous one stopped.

pub mod calls;
pub mod ops;
pub mod trace;

use alloy_primitives::{Address, B256, U256};
use rand::{SeedableRng, rngs::StdRng};
use tracing::{debug, info, trace as trace_log, warn};

use crate::{
    cleartext::{ClearTextEntry, ClearTextFlags, ClearTextStore, ClearValue, StoreError, widen},
    client::{ChainClient, ClientError},
    handle::{FheType, Handle, HandleCodec, HandleError, Operand, Operator, value_type},
    metrics::Metrics,
};
pub use calls::ExecutorCall;
pub use trace::{CallOpcode, CallStep, ExecutionTrace, RawStep, TraceError};

/// Errors raised by the mock coprocessor.
#[derive(Debug, thiserror::Error)]
pub enum CoprocessorError {
    /// The call selector is not an executor entry point.
    #[error("unsupported executor operation 0x{}", alloy_primitives::hex::encode(.selector))]
    UnsupportedOperation {
        /// The 4-byte selector.
        selector: [u8; 4],
    },

    /// A non-binary operator was evaluated as a binary one.
    #[error("operator {0:?} is not binary")]
    NotBinary(Operator),

    /// The input proof is too short for the requested entry.
    #[error("input proof of {len} bytes has no window {start}..{end} for handle {handle}")]
    MalformedProof {
        /// The input handle.
        handle: Handle,
        /// Window start.
        start: usize,
        /// Window end.
        end: usize,
        /// Proof length.
        len: usize,
    },

    /// An input handle does not carry the type it was verified as.
    #[error("handle {handle} carries {actual:?}, verified as {declared:?}")]
    TypeMismatch {
        /// The input handle.
        handle: Handle,
        /// The type declared by the call.
        declared: FheType,
        /// The type encoded in the handle.
        actual: FheType,
    },

    /// The calldata could not be ABI-decoded.
    #[error("failed to decode executor call: {0}")]
    Decode(#[from] alloy_sol_types::Error),

    /// A handle or type tag was invalid.
    #[error(transparent)]
    Handle(#[from] HandleError),

    /// The clear-text store rejected a read or write.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A trace could not be parsed.
    #[error(transparent)]
    Trace(#[from] TraceError),

    /// The node failed to serve a block or trace.
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl CoprocessorError {
    /// Returns true if syncing again later may succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Client(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Counts gathered by one [`MockCoprocessor::sync`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Blocks fully scanned.
    pub blocks: u64,
    /// Transactions whose traces were processed.
    pub transactions: u64,
    /// Reverted transactions skipped.
    pub reverted: u64,
    /// Executor calls evaluated.
    pub operations: u64,
    /// Executor calls skipped as unsupported.
    pub unsupported: u64,
    /// Executor calls that could not be evaluated, and transactions whose trace
    /// could not be read.
    pub failed: u64,
}

impl ScanSummary {
    fn absorb(&mut self, other: Self) {
        self.transactions += other.transactions;
        self.reverted += other.reverted;
        self.operations += other.operations;
        self.unsupported += other.unsupported;
        self.failed += other.failed;
    }
}

/// Cleartext emulator of the FHE coprocessor.
#[derive(Debug)]
pub struct MockCoprocessor {
    codec: HandleCodec,
    executor: Address,
    store: ClearTextStore,
    rand_counter: u64,
    rng: StdRng,
    next_block: u64,
    resume_tx: usize,
}

impl MockCoprocessor {
    /// Creates a coprocessor scanning from `start_block`.
    ///
    /// Without a seed the random generator is seeded from the operating system.
    pub(crate) fn new(
        codec: HandleCodec,
        executor: Address,
        store: ClearTextStore,
        start_block: u64,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { codec, executor, store, rand_counter: 0, rng, next_block: start_block, resume_tx: 0 }
    }

    /// Returns the clear-text store.
    pub const fn store(&self) -> &ClearTextStore {
        &self.store
    }

    /// Returns the first block not yet fully scanned.
    pub const fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Moves the checkpoint back to `block` after a chain revert.
    ///
    /// Cleartexts already stored are kept: handles are content-addressed, so
    /// re-executing the same calls reproduces the same entries.
    pub fn rewind(&mut self, block: u64) {
        if block < self.next_block {
            info!(target: "fhevm::coprocessor", from = self.next_block, to = block, "rewinding checkpoint");
            self.next_block = block;
            self.resume_tx = 0;
        }
    }

    /// Scans every transaction from the checkpoint up to and including `to_block`.
    pub async fn sync<C: ChainClient + ?Sized>(
        &mut self,
        client: &C,
        to_block: u64,
    ) -> Result<ScanSummary, CoprocessorError> {
        let mut summary = ScanSummary::default();
        let result = self.scan(client, to_block, &mut summary).await;
        // Persist whatever was computed, even when the scan stopped early.
        self.store.flush()?;

        metrics::gauge!(Metrics::CLEARTEXT_ENTRIES).set(self.store.count() as f64);
        if summary.transactions > 0 {
            debug!(
                target: "fhevm::coprocessor",
                blocks = summary.blocks,
                transactions = summary.transactions,
                operations = summary.operations,
                next_block = self.next_block,
                "synced"
            );
        }
        result.map(|()| summary)
    }

    async fn scan<C: ChainClient + ?Sized>(
        &mut self,
        client: &C,
        to_block: u64,
        summary: &mut ScanSummary,
    ) -> Result<(), CoprocessorError> {
        while self.next_block <= to_block {
            let block = self.next_block;
            let hashes = client.transaction_hashes(block).await?;
            for (index, hash) in hashes.iter().enumerate().skip(self.resume_tx) {
                match client.trace_transaction(*hash, self.executor).await {
                    Ok(trace) => summary.absorb(self.process_trace(*hash, &trace)?),
                    Err(err) if err.is_transient() => {
                        warn!(
                            target: "fhevm::coprocessor",
                            block,
                            tx_index = index,
                            tx_hash = %hash,
                            error = %err,
                            "failed to fetch trace"
                        );
                        return Err(err.into());
                    }
                    Err(err) => {
                        warn!(
                            target: "fhevm::coprocessor",
                            block,
                            tx_index = index,
                            tx_hash = %hash,
                            error = %err,
                            "skipping transaction with unreadable trace"
                        );
                        metrics::counter!(Metrics::FAILED_OPERATIONS).increment(1);
                        summary.transactions += 1;
                        summary.failed += 1;
                    }
                }
                self.resume_tx = index + 1;
            }
            self.next_block = block + 1;
            self.resume_tx = 0;
            summary.blocks += 1;
        }
        Ok(())
    }

    /// Evaluates every executor call made by one transaction.
    ///
    /// Reverted transactions are skipped entirely, as are calls with a selector
    /// outside the executor catalog. A call that fails to evaluate is logged and
    /// skipped; handles depending on it stay uncomputed. Only a conflicting
    /// cleartext aborts the transaction.
    pub fn process_trace(
        &mut self,
        tx_hash: B256,
        trace: &ExecutionTrace,
    ) -> Result<ScanSummary, CoprocessorError> {
        let mut summary = ScanSummary { transactions: 1, ..Default::default() };
        if trace.failed {
            trace_log!(target: "fhevm::coprocessor", %tx_hash, "skipping reverted transaction");
            summary.reverted = 1;
            return Ok(summary);
        }

        for step in trace.calls_to(self.executor) {
            let call = match ExecutorCall::decode(&step.input) {
                Ok(call) => call,
                Err(CoprocessorError::UnsupportedOperation { selector }) => {
                    debug!(
                        target: "fhevm::coprocessor",
                        %tx_hash,
                        selector = %alloy_primitives::hex::encode(selector),
                        "skipping unsupported executor call"
                    );
                    metrics::counter!(Metrics::UNSUPPORTED_OPERATIONS).increment(1);
                    summary.unsupported += 1;
                    continue;
                }
                Err(err) => {
                    record_failure(tx_hash, None, &err, &mut summary);
                    continue;
                }
            };
            match self.execute(&call) {
                Ok(handle) => {
                    trace_log!(target: "fhevm::coprocessor", %tx_hash, op = ?call.operator(), %handle, "executed");
                    metrics::counter!(Metrics::OPERATIONS).increment(1);
                    summary.operations += 1;
                }
                Err(err @ CoprocessorError::Store(StoreError::Consistency(_))) => return Err(err),
                Err(err) => record_failure(tx_hash, Some(call.operator()), &err, &mut summary),
            }
        }
        Ok(summary)
    }

    /// Evaluates one executor call, stores its cleartext and returns the result handle.
    pub fn execute(&mut self, call: &ExecutorCall) -> Result<Handle, CoprocessorError> {
        match call {
            ExecutorCall::Binary { op, lhs, rhs, scalar } => {
                let lhs_entry = self.store.get(lhs)?;
                let ty = lhs_entry.value_type;
                let lhs_value = lhs_entry.value;
                let rhs_value = if *scalar {
                    widen(U256::from_be_bytes(rhs.0))
                } else {
                    self.store.value(rhs)?
                };

                let outcome = ops::binary(*op, lhs_value, rhs_value, ty.bit_width())?;
                let out_ty = if op.is_comparison() { FheType::Bool } else { ty };
                let handle = self.codec.encode(
                    *op,
                    out_ty,
                    &[Operand::Handle(*lhs), Operand::Handle(*rhs), Operand::Byte(u8::from(*scalar))],
                )?;
                self.put(handle, ClearTextEntry::new(out_ty, outcome.value).with_flags(outcome.flags), false)
            }
            ExecutorCall::Unary { op, ct } => {
                let entry = self.store.get(ct)?;
                let ty = entry.value_type;
                let width = ty.bit_width();
                let value = match op {
                    Operator::Neg => ops::neg(entry.value, width),
                    _ => ops::not(entry.value, width),
                };
                let handle = self.codec.encode(*op, ty, &[Operand::Handle(*ct)])?;
                self.put(handle, ClearTextEntry::new(ty, value), false)
            }
            ExecutorCall::Cast { ct, to } => {
                let target = FheType::try_from(*to)?;
                let value = ops::cast(self.store.value(ct)?, target);
                let handle =
                    self.codec.encode(Operator::Cast, target, &[Operand::Handle(*ct), Operand::Byte(*to)])?;
                self.put(handle, ClearTextEntry::new(target, value), false)
            }
            ExecutorCall::TrivialEncrypt { value, to } => {
                let target = FheType::try_from(*to)?;
                let clear = ops::cast(widen(*value), target);
                let handle = self.codec.encode(
                    Operator::TrivialEncrypt,
                    target,
                    &[Operand::Uint(*value), Operand::Byte(*to)],
                )?;
                self.put(
                    handle,
                    ClearTextEntry::new(target, clear).with_flags(ClearTextFlags::TRIVIAL),
                    false,
                )
            }
            ExecutorCall::VerifyCiphertext { handle, proof, ty, .. } => {
                let declared = FheType::try_from(*ty)?;
                let actual = value_type(handle)?;
                if declared != actual {
                    return Err(CoprocessorError::TypeMismatch { handle: *handle, declared, actual });
                }
                let value = ops::slice_proof(proof, handle, declared)?;
                let out = self.codec.encode(Operator::VerifyCiphertext, declared, &[Operand::Handle(*handle)])?;
                self.put(out, ClearTextEntry::new(declared, value), false)
            }
            ExecutorCall::IfThenElse { control, if_true, if_false } => {
                let condition = self.store.value(control)?;
                let selected = if condition == ClearValue::from(1u64) { if_true } else { if_false };
                let entry = self.store.get(selected)?;
                let ty = entry.value_type;
                let value = entry.value;
                let handle = self.codec.encode(
                    Operator::IfThenElse,
                    ty,
                    &[Operand::Handle(*control), Operand::Handle(*if_true), Operand::Handle(*if_false)],
                )?;
                self.put(handle, ClearTextEntry::new(ty, value), false)
            }
            ExecutorCall::Rand { ty } => {
                let target = FheType::try_from(*ty)?;
                let value = ops::random(&mut self.rng, target.bit_width());
                let counter = self.next_counter();
                let handle = self.codec.encode(
                    Operator::Rand,
                    target,
                    &[Operand::Byte(*ty), Operand::Uint(counter)],
                )?;
                self.put(handle, ClearTextEntry::new(target, value), true)
            }
            ExecutorCall::RandBounded { bound, ty } => {
                let target = FheType::try_from(*ty)?;
                let bits = ops::bounded_bits(widen(*bound), target);
                let value = ops::random(&mut self.rng, bits);
                let counter = self.next_counter();
                let handle = self.codec.encode(
                    Operator::RandBounded,
                    target,
                    &[Operand::Uint(*bound), Operand::Byte(*ty), Operand::Uint(counter)],
                )?;
                self.put(handle, ClearTextEntry::new(target, value), true)
            }
        }
    }

    /// Returns the cleartext entry of `handle`.
    pub fn clear_text(&self, handle: &Handle) -> Result<&ClearTextEntry, StoreError> {
        self.store.get(handle)
    }

    fn next_counter(&mut self) -> U256 {
        let counter = U256::from(self.rand_counter);
        self.rand_counter += 1;
        counter
    }

    fn put(
        &mut self,
        handle: Handle,
        entry: ClearTextEntry,
        allow_replace: bool,
    ) -> Result<Handle, CoprocessorError> {
        self.store.put(handle, entry, allow_replace)?;
        Ok(handle)
    }
}

fn record_failure(
    tx_hash: B256,
    op: Option<Operator>,
    err: &CoprocessorError,
    summary: &mut ScanSummary,
) {
    warn!(target: "fhevm::coprocessor", %tx_hash, ?op, error = %err, "skipping failed executor call");
    metrics::counter!(Metrics::FAILED_OPERATIONS).increment(1);
    summary.failed += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{COMPUTED_INDEX, input_index, with_metadata};
    use alloy_primitives::{Bytes, address};
    use alloy_rpc_types_eth::{Filter, Log};
    use alloy_sol_types::SolCall;
    use async_trait::async_trait;
    use calls::IFhevmExecutor;

    /// Blocks of transactions; a `None` trace cannot be read.
    #[derive(Debug, Default)]
    struct TracedBlocks {
        blocks: Vec<Vec<(B256, Option<ExecutionTrace>)>>,
    }

    impl TracedBlocks {
        fn push_block(&mut self, traces: Vec<Option<ExecutionTrace>>) {
            let offset = self.blocks.iter().map(Vec::len).sum::<usize>();
            let txs = traces
                .into_iter()
                .enumerate()
                .map(|(i, trace)| (B256::with_last_byte((offset + i + 1) as u8), trace))
                .collect();
            self.blocks.push(txs);
        }
    }

    #[async_trait]
    impl ChainClient for TracedBlocks {
        async fn client_version(&self) -> Result<String, ClientError> {
            Ok("anvil/v0.2.0".to_string())
        }

        async fn block_number(&self) -> Result<u64, ClientError> {
            Ok(self.blocks.len() as u64 - 1)
        }

        async fn transaction_hashes(&self, block: u64) -> Result<Vec<B256>, ClientError> {
            let txs = self
                .blocks
                .get(block as usize)
                .ok_or_else(|| ClientError::NotFound(format!("block {block}")))?;
            Ok(txs.iter().map(|(hash, _)| *hash).collect())
        }

        async fn trace_transaction(
            &self,
            hash: B256,
            target: Address,
        ) -> Result<ExecutionTrace, ClientError> {
            let (_, trace) = self
                .blocks
                .iter()
                .flatten()
                .find(|(h, _)| *h == hash)
                .ok_or_else(|| ClientError::NotFound(format!("transaction {hash}")))?;
            let trace = trace.as_ref().ok_or(ClientError::UnexpectedTrace(hash))?;
            Ok(ExecutionTrace { failed: trace.failed, calls: trace.calls_to(target).cloned().collect() })
        }

        async fn get_logs(&self, _filter: &Filter) -> Result<Vec<Log>, ClientError> {
            Ok(vec![])
        }

        async fn send_transaction(&self, _to: Address, _input: Bytes) -> Result<B256, ClientError> {
            Ok(B256::ZERO)
        }

        async fn mine_block(&self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn wait_for_block(&self, after: u64) -> Result<u64, ClientError> {
            Ok(after + 1)
        }
    }

    const ACL: Address = address!("339ece85b9e11a3a3aa557582784a15d7f82aaf2");
    const EXECUTOR: Address = address!("596e6682c72946af006b27c131793f2b62527a4b");

    fn coprocessor() -> MockCoprocessor {
        MockCoprocessor::new(HandleCodec::new(ACL, 31337), EXECUTOR, ClearTextStore::new(), 0, Some(1))
    }

    fn trivial(cop: &mut MockCoprocessor, value: u64, ty: FheType) -> Handle {
        cop.execute(&ExecutorCall::TrivialEncrypt { value: U256::from(value), to: ty.tag() }).unwrap()
    }

    fn value_of(cop: &MockCoprocessor, handle: &Handle) -> ClearValue {
        cop.clear_text(handle).unwrap().value
    }

    fn call_step(input: Vec<u8>, target: Address) -> CallStep {
        CallStep {
            depth: 1,
            opcode: CallOpcode::Call,
            target,
            args_offset: 0,
            args_size: input.len(),
            input: Bytes::from(input),
        }
    }

    #[test]
    fn test_trivial_encrypt_sets_flag() {
        let mut cop = coprocessor();
        let handle = trivial(&mut cop, 250, FheType::Uint8);
        let entry = cop.clear_text(&handle).unwrap();
        assert_eq!(entry.value, ClearValue::from(250u64));
        assert!(entry.flags.trivial);
        assert_eq!(value_type(&handle).unwrap(), FheType::Uint8);
        assert_eq!(input_index(&handle), COMPUTED_INDEX);
    }

    #[test]
    fn test_add_wraps_and_flags_overflow() {
        let mut cop = coprocessor();
        let a = trivial(&mut cop, 250, FheType::Uint8);
        let b = trivial(&mut cop, 10, FheType::Uint8);
        let sum = cop
            .execute(&ExecutorCall::Binary { op: Operator::Add, lhs: a, rhs: b, scalar: false })
            .unwrap();
        let entry = cop.clear_text(&sum).unwrap();
        assert_eq!(entry.value, ClearValue::from(4u64));
        assert!(entry.flags.overflow);
    }

    #[test]
    fn test_scalar_operand_is_literal() {
        let mut cop = coprocessor();
        let a = trivial(&mut cop, 100, FheType::Uint16);
        let rhs = B256::from(U256::from(23).to_be_bytes::<32>());
        let out = cop
            .execute(&ExecutorCall::Binary { op: Operator::Sub, lhs: a, rhs, scalar: true })
            .unwrap();
        assert_eq!(value_of(&cop, &out), ClearValue::from(77u64));
    }

    #[test]
    fn test_comparison_produces_bool() {
        let mut cop = coprocessor();
        let a = trivial(&mut cop, 5, FheType::Uint32);
        let b = trivial(&mut cop, 9, FheType::Uint32);
        let lt = cop
            .execute(&ExecutorCall::Binary { op: Operator::Lt, lhs: a, rhs: b, scalar: false })
            .unwrap();
        assert_eq!(value_type(&lt).unwrap(), FheType::Bool);
        assert_eq!(value_of(&cop, &lt), ClearValue::from(1u64));
    }

    #[test]
    fn test_missing_operand_is_not_computed() {
        let mut cop = coprocessor();
        let unknown = with_metadata(B256::repeat_byte(3), COMPUTED_INDEX, FheType::Uint8);
        let err = cop.execute(&ExecutorCall::Unary { op: Operator::Not, ct: unknown }).unwrap_err();
        assert!(matches!(err, CoprocessorError::Store(StoreError::NotComputed(h)) if h == unknown));
    }

    #[test]
    fn test_if_then_else_follows_selected_branch() {
        let mut cop = coprocessor();
        let yes = trivial(&mut cop, 1, FheType::Bool);
        let no = trivial(&mut cop, 0, FheType::Bool);
        let small = trivial(&mut cop, 7, FheType::Uint8);
        let wide = trivial(&mut cop, 9, FheType::Uint64);

        let picked = cop
            .execute(&ExecutorCall::IfThenElse { control: yes, if_true: small, if_false: wide })
            .unwrap();
        assert_eq!(value_type(&picked).unwrap(), FheType::Uint8);
        assert_eq!(value_of(&cop, &picked), ClearValue::from(7u64));

        let picked = cop
            .execute(&ExecutorCall::IfThenElse { control: no, if_true: small, if_false: wide })
            .unwrap();
        assert_eq!(value_type(&picked).unwrap(), FheType::Uint64);
        assert_eq!(value_of(&cop, &picked), ClearValue::from(9u64));
    }

    #[test]
    fn test_cast_and_unary() {
        let mut cop = coprocessor();
        let a = trivial(&mut cop, 0x1ff, FheType::Uint16);
        let narrowed = cop.execute(&ExecutorCall::Cast { ct: a, to: FheType::Uint8.tag() }).unwrap();
        assert_eq!(value_of(&cop, &narrowed), ClearValue::from(0xffu64));

        let negated = cop.execute(&ExecutorCall::Unary { op: Operator::Neg, ct: narrowed }).unwrap();
        assert_eq!(value_of(&cop, &negated), ClearValue::from(1u64));
    }

    #[test]
    fn test_verify_ciphertext_slices_proof() {
        let mut cop = coprocessor();
        let handle = with_metadata(B256::repeat_byte(0x42), 1, FheType::Uint8);
        let mut proof = vec![2u8];
        proof.extend_from_slice(&[0u8; ops::PROOF_ENTRY_STRIDE]);
        let mut second = [0u8; ops::PROOF_ENTRY_STRIDE];
        second[0] = 10;
        proof.extend_from_slice(&second);

        let out = cop
            .execute(&ExecutorCall::VerifyCiphertext {
                handle,
                user: Address::ZERO,
                proof: proof.clone().into(),
                ty: FheType::Uint8.tag(),
            })
            .unwrap();
        assert_eq!(out, handle);
        assert_eq!(value_of(&cop, &handle), ClearValue::from(10u64));

        let err = cop
            .execute(&ExecutorCall::VerifyCiphertext {
                handle,
                user: Address::ZERO,
                proof: proof.into(),
                ty: FheType::Uint16.tag(),
            })
            .unwrap_err();
        assert!(matches!(err, CoprocessorError::TypeMismatch { .. }));
    }

    #[test]
    fn test_rand_handles_are_fresh() {
        let mut cop = coprocessor();
        let first = cop.execute(&ExecutorCall::Rand { ty: FheType::Uint8.tag() }).unwrap();
        let second = cop.execute(&ExecutorCall::Rand { ty: FheType::Uint8.tag() }).unwrap();
        assert_ne!(first, second);

        let bounded = cop
            .execute(&ExecutorCall::RandBounded { bound: U256::from(16), ty: FheType::Uint8.tag() })
            .unwrap();
        assert!(value_of(&cop, &bounded) < ClearValue::from(16u64));
    }

    #[test]
    fn test_process_trace_skips_reverted_and_foreign_calls() {
        let mut cop = coprocessor();
        let encrypt = IFhevmExecutor::trivialEncryptCall { pt: U256::from(3), toType: 2 }.abi_encode();

        let reverted = ExecutionTrace { failed: true, calls: vec![call_step(encrypt.clone(), EXECUTOR)] };
        let summary = cop.process_trace(B256::ZERO, &reverted).unwrap();
        assert_eq!(summary.reverted, 1);
        assert!(cop.store().is_empty());

        let trace = ExecutionTrace {
            failed: false,
            calls: vec![
                call_step(encrypt.clone(), Address::repeat_byte(9)),
                call_step(vec![0xde, 0xad, 0xbe, 0xef], EXECUTOR),
                call_step(encrypt, EXECUTOR),
            ],
        };
        let summary = cop.process_trace(B256::ZERO, &trace).unwrap();
        assert_eq!(summary.operations, 1);
        assert_eq!(summary.unsupported, 1);
        assert_eq!(cop.store().count(), 1);
    }

    /// An unsupported call leaves its result uncomputed; the call consuming it
    /// fails and is skipped while the rest of the transaction still runs.
    fn trace_with_broken_dependency() -> (ExecutionTrace, Handle) {
        let missing = with_metadata(B256::repeat_byte(7), COMPUTED_INDEX, FheType::Uint8);
        let not = IFhevmExecutor::fheNotCall { ct: missing }.abi_encode();
        let encrypt = IFhevmExecutor::trivialEncryptCall { pt: U256::from(3), toType: 2 }.abi_encode();
        let trace = ExecutionTrace {
            failed: false,
            calls: vec![
                call_step(vec![0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 1], EXECUTOR),
                call_step(not, EXECUTOR),
                call_step(encrypt, EXECUTOR),
            ],
        };
        (trace, missing)
    }

    #[test]
    fn test_failed_call_is_skipped() {
        let mut cop = coprocessor();
        let (trace, missing) = trace_with_broken_dependency();

        let summary = cop.process_trace(B256::ZERO, &trace).unwrap();
        assert_eq!(summary.unsupported, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.operations, 1);
        assert_eq!(cop.store().count(), 1);
        assert!(cop.clear_text(&missing).is_err());
    }

    #[tokio::test]
    async fn test_sync_continues_past_failed_transactions() {
        let mut cop = coprocessor();
        let (broken, _) = trace_with_broken_dependency();
        let later = ExecutionTrace {
            failed: false,
            calls: vec![call_step(
                IFhevmExecutor::trivialEncryptCall { pt: U256::from(9), toType: 3 }.abi_encode(),
                EXECUTOR,
            )],
        };

        let mut chain = TracedBlocks::default();
        chain.push_block(vec![]);
        chain.push_block(vec![Some(broken), None]);
        chain.push_block(vec![Some(later)]);

        let summary = cop.sync(&chain, 2).await.unwrap();
        assert_eq!(cop.next_block(), 3);
        assert_eq!(summary.blocks, 3);
        assert_eq!(summary.transactions, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.operations, 2);

        let expected = cop
            .codec
            .encode(
                Operator::TrivialEncrypt,
                FheType::Uint16,
                &[Operand::Uint(U256::from(9)), Operand::Byte(FheType::Uint16.tag())],
            )
            .unwrap();
        assert_eq!(value_of(&cop, &expected), ClearValue::from(9u64));
    }

    #[tokio::test]
    async fn test_sync_stops_on_missing_block() {
        let mut cop = coprocessor();
        let mut chain = TracedBlocks::default();
        chain.push_block(vec![]);

        let err = cop.sync(&chain, 1).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(cop.next_block(), 1);
    }

    #[test]
    fn test_reprocessing_is_idempotent() {
        let mut cop = coprocessor();
        let a = trivial(&mut cop, 250, FheType::Uint8);
        let add = IFhevmExecutor::fheAddCall {
            lhs: a,
            rhs: B256::from(U256::from(10).to_be_bytes::<32>()),
            scalarByte: alloy_primitives::FixedBytes([1]),
        }
        .abi_encode();
        let trace = ExecutionTrace { failed: false, calls: vec![call_step(add, EXECUTOR)] };

        cop.process_trace(B256::ZERO, &trace).unwrap();
        let count = cop.store().count();
        cop.process_trace(B256::ZERO, &trace).unwrap();
        assert_eq!(cop.store().count(), count);
    }

    #[test]
    fn test_rewind_only_moves_backwards() {
        let mut cop = coprocessor();
        cop.next_block = 10;
        cop.rewind(12);
        assert_eq!(cop.next_block(), 10);
        cop.rewind(4);
        assert_eq!(cop.next_block(), 4);
    }
}
