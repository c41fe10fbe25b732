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

//! ferret's fuzzing engine.
//!
//! A [`fuzzer::Fuzzer`] spawns a bounded pool of workers. Each worker owns
//! a private test chain deployed from the configured contract
//! definitions, asks its mutator for call sequences, executes them
//! through the call-sequence [`executor`], fans post-call checks out to
//! the registered test providers (property, assertion, optimization),
//! shrinks interesting sequences and publishes coverage-increasing or
//! failing sequences to the shared corpus.
//!
//! The EVM itself stays external behind [`chain::Evm`]; the chain,
//! executor and testing loop only rely on that seam plus the forked state
//! of `ferret-fork`.

pub mod abi;
pub mod calls;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod fuzzer;
pub mod metrics;
pub mod mutator;
pub mod sequence;
pub mod shrink;
pub mod testing;
pub mod worker;

pub use abi::*;
pub use calls::*;
pub use chain::*;
pub use config::*;
pub use contracts::*;
pub use corpus::*;
pub use coverage::*;
pub use executor::*;
pub use fuzzer::*;
pub use metrics::*;
pub use mutator::*;
pub use sequence::*;
pub use shrink::*;
pub use testing::*;
pub use worker::*;
