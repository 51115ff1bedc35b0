//! Pre-estimate files.
//!
//! A file lists, per transaction and store, the hex-encoded keys the
//! transaction is expected to write:
//!
//! ```json
//! { "0": { "0": ["aa01", "bb02"], "1": ["aa010000000000000000"] } }
//! ```

use crate::bank::{self, ACCOUNTS, HISTORY};
use crate::workload::Workload;
use block_stm::{BlockStmError, PreEstimates, StoreId, TxnIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EstimatesError {
    #[error("failed to read estimates file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed estimates file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transaction {txn}, store {store}: invalid hex key {key:?}: {source}")]
    Hex {
        txn: TxnIndex,
        store: u16,
        key: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error(transparent)]
    Invalid(#[from] BlockStmError),
}

/// On-disk form of [`PreEstimates`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EstimatesFile(BTreeMap<TxnIndex, BTreeMap<u16, Vec<String>>>);

impl EstimatesFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EstimatesError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(json: &str) -> Result<Self, EstimatesError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), EstimatesError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Decodes the keys and checks them against the block's shape.
    pub fn to_pre_estimates(&self, num_txns: usize, num_stores: usize) -> Result<PreEstimates, EstimatesError> {
        let mut estimates = PreEstimates::new();
        for (&txn, stores) in &self.0 {
            for (&store, keys) in stores {
                for key in keys {
                    let bytes = hex::decode(key.trim_start_matches("0x")).map_err(|source| EstimatesError::Hex {
                        txn,
                        store,
                        key: key.clone(),
                        source,
                    })?;
                    estimates.insert(txn, StoreId(store), bytes);
                }
            }
        }
        estimates.validate(num_txns, num_stores)?;
        Ok(estimates)
    }
}

impl From<&PreEstimates> for EstimatesFile {
    fn from(estimates: &PreEstimates) -> Self {
        let mut file = BTreeMap::<TxnIndex, BTreeMap<u16, Vec<String>>>::new();
        for (txn, store, key) in estimates.iter() {
            file.entry(txn).or_default().entry(store.0).or_default().push(hex::encode(key));
        }
        Self(file)
    }
}

/// Every location each transfer of `workload` writes when it succeeds.
pub fn derive_from_workload(workload: &Workload) -> PreEstimates {
    let mut estimates = PreEstimates::new();
    for (txn, tx) in workload.transactions.iter().enumerate() {
        estimates.insert(txn, ACCOUNTS, tx.from.as_slice());
        if tx.to != tx.from {
            estimates.insert(txn, ACCOUNTS, tx.to.as_slice());
        }
        estimates.insert(txn, HISTORY, bank::history_key(&tx.from, tx.nonce));
    }
    estimates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadConfig;

    #[test]
    fn test_parse_file() {
        let file = EstimatesFile::parse(r#"{"0": {"0": ["aa01", "0xbb"]}, "3": {"1": []}}"#).unwrap();
        let estimates = file.to_pre_estimates(4, 2).unwrap();

        let hints: Vec<_> = estimates.iter().map(|(txn, store, key)| (txn, store, key.to_vec())).collect();
        assert_eq!(
            hints,
            vec![(0, StoreId(0), vec![0xaa, 0x01]), (0, StoreId(0), vec![0xbb])]
        );
    }

    #[test]
    fn test_malformed_files_rejected() {
        assert!(matches!(EstimatesFile::parse("[1, 2]"), Err(EstimatesError::Json(_))));
        assert!(matches!(
            EstimatesFile::parse(r#"{"x": {}}"#),
            Err(EstimatesError::Json(_))
        ));

        let bad_hex = EstimatesFile::parse(r#"{"1": {"0": ["zz"]}}"#).unwrap();
        assert!(matches!(
            bad_hex.to_pre_estimates(2, 2),
            Err(EstimatesError::Hex { txn: 1, store: 0, .. })
        ));
    }

    #[test]
    fn test_out_of_block_hints_rejected() {
        let file = EstimatesFile::parse(r#"{"5": {"0": ["aa"]}}"#).unwrap();
        assert!(matches!(file.to_pre_estimates(5, 2), Err(EstimatesError::Invalid(_))));

        let file = EstimatesFile::parse(r#"{"0": {"7": ["aa"]}}"#).unwrap();
        assert!(matches!(file.to_pre_estimates(5, 2), Err(EstimatesError::Invalid(_))));
    }

    #[test]
    fn test_derived_estimates_survive_file_form() {
        let config = WorkloadConfig {
            num_accounts: 5,
            num_transactions: 8,
            ..Default::default()
        };
        let workload = Workload::generate(config).unwrap();
        let derived = derive_from_workload(&workload);
        assert_eq!(derived.len(), 8 * 3);

        let json = serde_json::to_string(&EstimatesFile::from(&derived)).unwrap();
        let reloaded = EstimatesFile::parse(&json).unwrap().to_pre_estimates(8, bank::NUM_STORES).unwrap();
        assert_eq!(reloaded, derived);
    }
}
