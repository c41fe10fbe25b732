// ferret - coverage-guided fuzzing for EVM smart contracts
// Copyright (C) 2026 ferret contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Sequence generation.
//!
//! The mutator is the abstraction point for input generation: workers ask
//! it for sequences and it draws on the corpus and the registered method
//! surface. [`RandomMutator`] is the stock implementation; anything
//! smarter plugs in behind the [`Mutator`] trait.

use crate::{
    abi::{AbiType, AbiValue},
    calls::{CallData, CallMessage},
    contracts::MethodDefinition,
    corpus::Corpus,
    sequence::{CallSequence, CallSequenceElement},
};
use alloy_primitives::{Address, Bytes, B256, I256, U256};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// A fuzzable method on a deployed contract.
#[derive(Debug, Clone)]
pub struct FuzzableMethod {
    /// Name of the owning contract.
    pub contract: String,
    /// Deployment address.
    pub address: Address,
    /// The method.
    pub method: MethodDefinition,
}

/// Everything a mutator may draw on when generating a sequence.
pub struct MutationContext<'a> {
    /// The shared corpus.
    pub corpus: &'a Corpus,
    /// Callable methods on the worker's chain.
    pub methods: &'a [FuzzableMethod],
    /// Configured sender addresses.
    pub senders: &'a [Address],
    /// Maximum sequence length.
    pub max_length: usize,
    /// Per-transaction gas budget.
    pub gas_limit: u64,
}

/// Generates call sequences for a worker.
pub trait Mutator: Send {
    /// Produce the next sequence to execute.
    fn generate(&mut self, ctx: &MutationContext<'_>) -> CallSequence;
}

/// Stock mutator: corpus splicing and truncation plus fresh random tails.
pub struct RandomMutator {
    rng: StdRng,
}

impl RandomMutator {
    /// New mutator seeded deterministically.
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    fn random_element(&mut self, ctx: &MutationContext<'_>) -> Option<CallSequenceElement> {
        if ctx.methods.is_empty() || ctx.senders.is_empty() {
            return None;
        }
        let method = &ctx.methods[self.rng.random_range(0..ctx.methods.len())];
        let sender = ctx.senders[self.rng.random_range(0..ctx.senders.len())];

        let values: Vec<AbiValue> =
            method.method.inputs.iter().map(|ty| self.random_value(*ty, ctx)).collect();
        let call = CallMessage::call(
            sender,
            method.address,
            CallData::abi(method.method.signature(), values),
            ctx.gas_limit,
        );

        // Delays stay zero most of the time so calls coalesce into
        // blocks; occasionally skip ahead.
        let (number_delay, timestamp_delay) = if self.rng.random_bool(0.2) {
            let dt = self.rng.random_range(1..=60u64);
            (self.rng.random_range(0..=dt), dt)
        } else {
            (0, 0)
        };

        Some(CallSequenceElement::new(
            Some(method.contract.clone()),
            call,
            number_delay,
            timestamp_delay,
        ))
    }

    fn random_value(&mut self, ty: AbiType, ctx: &MutationContext<'_>) -> AbiValue {
        match ty {
            AbiType::Uint => AbiValue::Uint(match self.rng.random_range(0..4u8) {
                0 => U256::ZERO,
                1 => U256::from(1u64),
                2 => U256::from(self.rng.random_range(0..=u16::MAX as u64)),
                _ => U256::from(self.rng.random::<u64>()),
            }),
            AbiType::Int => {
                let raw = self.rng.random_range(-1_000_000i64..=1_000_000i64);
                AbiValue::Int(I256::try_from(raw).expect("i64 fits"))
            }
            AbiType::Address => {
                // Mix senders, known contracts and the zero address.
                let choice = self.rng.random_range(0..3u8);
                let address = match choice {
                    0 => Address::ZERO,
                    1 => ctx.senders[self.rng.random_range(0..ctx.senders.len())],
                    _ => ctx.methods[self.rng.random_range(0..ctx.methods.len())].address,
                };
                AbiValue::Address(address)
            }
            AbiType::Bool => AbiValue::Bool(self.rng.random()),
            AbiType::Bytes => {
                let len = self.rng.random_range(0..=32usize);
                let bytes: Vec<u8> = (0..len).map(|_| self.rng.random()).collect();
                AbiValue::Bytes(Bytes::from(bytes))
            }
            AbiType::FixedBytes => {
                let mut word = [0u8; 32];
                for byte in &mut word {
                    *byte = self.rng.random();
                }
                AbiValue::FixedBytes(B256::new(word))
            }
            AbiType::String => {
                let len = self.rng.random_range(0..=16usize);
                let s: String =
                    (0..len).map(|_| char::from(self.rng.random_range(b'a'..=b'z'))).collect();
                AbiValue::String(s)
            }
        }
    }

    fn fresh_tail(
        &mut self,
        ctx: &MutationContext<'_>,
        length: usize,
    ) -> Vec<CallSequenceElement> {
        (0..length).filter_map(|_| self.random_element(ctx)).collect()
    }
}

impl Mutator for RandomMutator {
    fn generate(&mut self, ctx: &MutationContext<'_>) -> CallSequence {
        let max_length = ctx.max_length.max(1);

        // Half of the time mutate a corpus entry, otherwise generate
        // from scratch.
        if self.rng.random_bool(0.5) {
            if let Some(entry) = ctx.corpus.random(&mut self.rng) {
                let keep = self.rng.random_range(1..=entry.len().min(max_length));
                let mut elements: Vec<CallSequenceElement> = entry.elements[..keep]
                    .iter()
                    .map(CallSequenceElement::without_results)
                    .collect();
                let tail_budget = max_length - elements.len();
                if tail_budget > 0 {
                    let tail_len = self.rng.random_range(0..=tail_budget);
                    elements.extend(self.fresh_tail(ctx, tail_len));
                }
                return CallSequence::new(elements);
            }
        }

        let length = self.rng.random_range(1..=max_length);
        CallSequence::new(self.fresh_tail(ctx, length))
    }
}
