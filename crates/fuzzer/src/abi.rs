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

//! Serializable ABI values and call-data packing.
//!
//! Corpus entries persist call data in tagged form (method signature plus
//! input values) so that method ids stay resolvable after recompilation.
//! [`AbiValue`] is the serde-able value model; packing goes through
//! `alloy-dyn-abi`.

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{keccak256, Address, Bytes, B256, I256, U256};
use serde::{Deserialize, Serialize};

/// Supported ABI parameter types for fuzzed methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbiType {
    /// `uint256`
    Uint,
    /// `int256`
    Int,
    /// `address`
    Address,
    /// `bool`
    Bool,
    /// `bytes`
    Bytes,
    /// `bytes32`
    FixedBytes,
    /// `string`
    String,
}

impl AbiType {
    /// Canonical Solidity type name used in method signatures.
    pub fn sol_name(&self) -> &'static str {
        match self {
            Self::Uint => "uint256",
            Self::Int => "int256",
            Self::Address => "address",
            Self::Bool => "bool",
            Self::Bytes => "bytes",
            Self::FixedBytes => "bytes32",
            Self::String => "string",
        }
    }
}

/// A serde-able ABI value, convertible to [`DynSolValue`] for packing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AbiValue {
    /// `uint256`
    Uint(U256),
    /// `int256`
    Int(I256),
    /// `address`
    Address(Address),
    /// `bool`
    Bool(bool),
    /// dynamic `bytes`
    Bytes(Bytes),
    /// `bytes32`
    FixedBytes(B256),
    /// `string`
    String(String),
}

impl AbiValue {
    /// The ABI type of this value.
    pub fn abi_type(&self) -> AbiType {
        match self {
            Self::Uint(_) => AbiType::Uint,
            Self::Int(_) => AbiType::Int,
            Self::Address(_) => AbiType::Address,
            Self::Bool(_) => AbiType::Bool,
            Self::Bytes(_) => AbiType::Bytes,
            Self::FixedBytes(_) => AbiType::FixedBytes,
            Self::String(_) => AbiType::String,
        }
    }

    /// Convert into the dyn-abi representation.
    pub fn to_sol_value(&self) -> DynSolValue {
        match self {
            Self::Uint(value) => DynSolValue::Uint(*value, 256),
            Self::Int(value) => DynSolValue::Int(*value, 256),
            Self::Address(value) => DynSolValue::Address(*value),
            Self::Bool(value) => DynSolValue::Bool(*value),
            Self::Bytes(value) => DynSolValue::Bytes(value.to_vec()),
            Self::FixedBytes(value) => DynSolValue::FixedBytes(*value, 32),
            Self::String(value) => DynSolValue::String(value.clone()),
        }
    }
}

/// 4-byte method selector of a canonical signature like `withdraw(uint256)`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// ABI-pack a method call: selector followed by the encoded parameters.
pub fn encode_call(signature: &str, values: &[AbiValue]) -> Bytes {
    let mut out = Vec::with_capacity(4 + values.len() * 32);
    out.extend_from_slice(&selector(signature));
    if !values.is_empty() {
        let tuple = DynSolValue::Tuple(values.iter().map(AbiValue::to_sol_value).collect());
        out.extend_from_slice(&tuple.abi_encode_params());
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_selector_matches_known_signatures() {
        // keccak256("transfer(address,uint256)")[..4] == a9059cbb
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(selector("property_balanceIsSane()"), selector("property_balanceIsSane()"));
    }

    #[test]
    fn test_encode_call_packs_selector_and_args() {
        let data = encode_call(
            "transfer(address,uint256)",
            &[
                AbiValue::Address(address!("00000000000000000000000000000000000000aa")),
                AbiValue::Uint(U256::from(5)),
            ],
        );
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(data[35], 0xaa);
        assert_eq!(data[67], 0x05);
    }

    #[test]
    fn test_encode_call_without_args_is_bare_selector() {
        let data = encode_call("property_neverFails()", &[]);
        assert_eq!(data.len(), 4);
    }

    #[test]
    fn test_abi_value_serde_round_trip() {
        let values = vec![
            AbiValue::Uint(U256::from(42)),
            AbiValue::Int(I256::try_from(-7i64).unwrap()),
            AbiValue::Address(address!("00000000000000000000000000000000000000bb")),
            AbiValue::Bool(true),
            AbiValue::Bytes(Bytes::from_static(&[1, 2, 3])),
            AbiValue::FixedBytes(B256::with_last_byte(9)),
            AbiValue::String("ferret".into()),
        ];
        let json = serde_json::to_string(&values).unwrap();
        let back: Vec<AbiValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }
}
