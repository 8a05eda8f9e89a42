//! Token transfer row: the unit stored in chunk files and the consolidated
//! output. Field order is the column order on disk.

use std::fmt::Display;
use std::str::FromStr;

use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};

use crate::storage::index::{BlockNumber, BlockRange};

/// One ERC-20 transfer as reported by the explorer `tokentx` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    #[serde(deserialize_with = "number_or_string")]
    pub block_number: BlockNumber,
    #[serde(deserialize_with = "number_or_string")]
    pub time_stamp: i64,
    pub hash: String,
    pub nonce: String,
    pub block_hash: String,
    pub from: String,
    pub to: String,
    pub contract_address: String,
    pub value: String,
    pub token_name: String,
    pub token_symbol: String,
    pub token_decimal: String,
    pub transaction_index: String,
    pub gas: String,
    pub gas_price: String,
    pub gas_used: String,
    pub cumulative_gas_used: String,
    pub input: String,
    pub confirmations: String,
    /// UTC rendering of `time_stamp`, filled in by [`TokenTransfer::fill_datetime`].
    #[serde(default)]
    pub datetime: String,
}

impl TokenTransfer {
    pub fn fill_datetime(&mut self) {
        self.datetime = DateTime::from_timestamp(self.time_stamp, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
    }

    /// Schema check applied before a chunk's rows reach the consolidated output.
    pub fn validate_in(&self, range: BlockRange) -> Result<(), String> {
        if !range.contains(self.block_number) {
            return Err(format!(
                "row {} at block {} outside chunk range {range}",
                self.hash, self.block_number
            ));
        }
        if self.hash.is_empty() {
            return Err(format!("row at block {} has no hash", self.block_number));
        }
        Ok(())
    }
}

/// Explorer APIs send numbers as strings; chunk files carry them bare.
fn number_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Num(T),
        Str(String),
    }

    match Raw::<T>::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
