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

//! Call messages.
//!
//! A call message carries its payload either as raw bytes or in tagged
//! ABI form; the raw bytes of a tagged payload are derived lazily and
//! cached, and cloning preserves both representations.

use crate::abi::{encode_call, AbiValue};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

/// Tagged ABI payload: resolvable by signature after recompilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiCallData {
    /// Canonical method signature, e.g. `withdraw(uint256)`.
    pub method_signature: String,
    /// Input values in declaration order.
    pub input_values: Vec<AbiValue>,
}

/// Payload of a call message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallData {
    /// Raw calldata bytes.
    Raw(Bytes),
    /// Tagged ABI form; raw bytes derived lazily by ABI-packing.
    Abi {
        /// The tagged payload.
        #[serde(flatten)]
        data: AbiCallData,
        /// Packed-bytes cache. Cloning carries it along.
        #[serde(skip)]
        packed: OnceCell<Bytes>,
    },
}

impl CallData {
    /// Tagged payload constructor.
    pub fn abi(method_signature: impl Into<String>, input_values: Vec<AbiValue>) -> Self {
        Self::Abi {
            data: AbiCallData { method_signature: method_signature.into(), input_values },
            packed: OnceCell::new(),
        }
    }

    /// The payload as calldata bytes, packing the tagged form on first
    /// use.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Raw(bytes) => bytes.clone(),
            Self::Abi { data, packed } => packed
                .get_or_init(|| encode_call(&data.method_signature, &data.input_values))
                .clone(),
        }
    }

    /// The 4-byte selector of the payload, if it carries one.
    pub fn selector(&self) -> Option<[u8; 4]> {
        let bytes = self.to_bytes();
        (bytes.len() >= 4).then(|| [bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// The tagged payload, when present.
    pub fn as_abi(&self) -> Option<&AbiCallData> {
        match self {
            Self::Raw(_) => None,
            Self::Abi { data, .. } => Some(data),
        }
    }
}

/// Storage keys warmed for one address (EIP-2930).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessListItem {
    /// The warmed account.
    pub address: Address,
    /// The warmed storage keys.
    pub storage_keys: Vec<B256>,
}

/// A single message executed on the test chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMessage {
    /// Sender address.
    pub from: Address,
    /// Recipient; `None` deploys a contract.
    pub to: Option<Address>,
    /// Sender nonce.
    pub nonce: u64,
    /// Transferred value in wei.
    pub value: U256,
    /// Gas budget of the call.
    pub gas_limit: u64,
    /// Legacy gas price.
    pub gas_price: u128,
    /// EIP-1559 fee cap.
    pub gas_fee_cap: u128,
    /// EIP-1559 tip cap.
    pub gas_tip_cap: u128,
    /// The payload.
    pub data: CallData,
    /// EIP-2930 access list.
    #[serde(default)]
    pub access_list: Vec<AccessListItem>,
    /// Skip nonce/balance validation when executing.
    #[serde(default)]
    pub skip_account_checks: bool,
}

impl CallMessage {
    /// A plain call message with zeroed gas pricing.
    pub fn call(from: Address, to: Address, data: CallData, gas_limit: u64) -> Self {
        Self {
            from,
            to: Some(to),
            nonce: 0,
            value: U256::ZERO,
            gas_limit,
            gas_price: 0,
            gas_fee_cap: 0,
            gas_tip_cap: 0,
            data,
            access_list: Vec::new(),
            skip_account_checks: true,
        }
    }

    /// A deployment message carrying `init_code`.
    pub fn create(from: Address, init_code: Bytes, gas_limit: u64) -> Self {
        Self {
            from,
            to: None,
            nonce: 0,
            value: U256::ZERO,
            gas_limit,
            gas_price: 0,
            gas_fee_cap: 0,
            gas_tip_cap: 0,
            data: CallData::Raw(init_code),
            access_list: Vec::new(),
            skip_account_checks: true,
        }
    }

    /// The payload as calldata bytes.
    pub fn input_bytes(&self) -> Bytes {
        self.data.to_bytes()
    }

    /// Canonical transaction hash: a keccak over a deterministic
    /// serialization of every field, with the payload in packed form so
    /// raw and tagged representations of the same call hash alike.
    pub fn canonical_hash(&self) -> B256 {
        let input = self.input_bytes();
        let mut buf = Vec::with_capacity(160 + input.len());
        buf.extend_from_slice(self.from.as_slice());
        match &self.to {
            Some(to) => {
                buf.push(1);
                buf.extend_from_slice(to.as_slice());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.value.to_be_bytes::<32>());
        buf.extend_from_slice(&self.gas_limit.to_be_bytes());
        buf.extend_from_slice(&self.gas_price.to_be_bytes());
        buf.extend_from_slice(&self.gas_fee_cap.to_be_bytes());
        buf.extend_from_slice(&self.gas_tip_cap.to_be_bytes());
        buf.extend_from_slice(&(input.len() as u32).to_be_bytes());
        buf.extend_from_slice(&input);
        for item in &self.access_list {
            buf.extend_from_slice(item.address.as_slice());
            for key in &item.storage_keys {
                buf.extend_from_slice(key.as_slice());
            }
        }
        buf.push(self.skip_account_checks as u8);
        keccak256(&buf)
    }
}
