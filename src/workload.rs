//! Deterministic transfer workloads.
//!
//! A workload is a set of secp256k1 accounts and a block of signed transfers
//! between them, generated upfront so that signing never shows up in the
//! measured execution time.

use crate::bank::{self, AccountState};
use alloy_primitives::{keccak256, Address, Signature, B256, U256};
use block_stm::MemStorage;
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while generating a workload.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("invalid workload configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to sign transaction: {0}")]
    Signing(#[from] k256::ecdsa::Error),
}

// ============================================================================
// Account & Key Management
// ============================================================================

/// An account with its signing key.
#[derive(Clone)]
pub struct Account {
    pub signing_key: SigningKey,
    /// Address derived from the public key.
    pub address: Address,
}

impl Account {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = public_key_to_address(&verifying_key);
        Self { signing_key, address }
    }

    /// Generates a deterministic account from a seed.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        loop {
            let mut key_bytes = [0u8; 32];
            rng.fill(&mut key_bytes);
            // Zero and out-of-range scalars are rejected; draw again.
            if let Ok(signing_key) = SigningKey::from_slice(&key_bytes) {
                return Self::from_signing_key(signing_key);
            }
        }
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account").field("address", &self.address).finish()
    }
}

fn public_key_to_address(verifying_key: &VerifyingKey) -> Address {
    let public_key_bytes = verifying_key.to_encoded_point(false);
    // Skip the 0x04 prefix byte.
    let hash = keccak256(&public_key_bytes.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

// ============================================================================
// Signed Transfer
// ============================================================================

/// A signed transfer ready for execution.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    pub signature: Signature,
    /// Hash of the signed fields.
    pub tx_hash: B256,
}

impl SignedTransaction {
    /// Signs a transfer of `value` from `account` to `to`.
    pub fn new(
        account: &Account,
        to: Address,
        value: U256,
        nonce: u64,
        chain_id: u64,
    ) -> Result<Self, WorkloadError> {
        let tx_hash = Self::compute_tx_hash(account.address, to, value, nonce, chain_id);
        let (sig, recovery_id) = account.signing_key.sign_prehash_recoverable(tx_hash.as_slice())?;

        Ok(Self {
            from: account.address,
            to,
            value,
            nonce,
            signature: Signature::from_signature_and_parity(sig, recovery_id.is_y_odd()),
            tx_hash,
        })
    }

    fn compute_tx_hash(from: Address, to: Address, value: U256, nonce: u64, chain_id: u64) -> B256 {
        let mut data = Vec::with_capacity(20 + 20 + 32 + 8 + 8);
        data.extend_from_slice(from.as_slice());
        data.extend_from_slice(to.as_slice());
        data.extend_from_slice(&value.to_be_bytes::<32>());
        data.extend_from_slice(&nonce.to_be_bytes());
        data.extend_from_slice(&chain_id.to_be_bytes());
        keccak256(&data)
    }

    /// Recovers the signer's address, or `None` if the signature is invalid.
    pub fn recover_signer(&self) -> Option<Address> {
        self.signature.recover_address_from_prehash(&self.tx_hash).ok()
    }

    pub fn verify(&self) -> bool {
        self.recover_signer().is_some_and(|addr| addr == self.from)
    }
}

// ============================================================================
// Workload Configuration & Generation
// ============================================================================

/// 1000 ETH in wei.
pub const DEFAULT_INITIAL_BALANCE: u128 = 1_000_000_000_000_000_000_000;

/// 0.001 ETH in wei.
pub const DEFAULT_TRANSFER_VALUE: u128 = 1_000_000_000_000_000;

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub num_accounts: usize,
    pub num_transactions: usize,
    /// 0.0 spreads transfers over every account, 1.0 sends all of them
    /// between the same two accounts.
    pub conflict_factor: f64,
    pub seed: u64,
    pub chain_id: u64,
    /// Balance of every account at genesis.
    pub initial_balance: U256,
    pub transfer_value: U256,
    /// Makes every transfer range-scan its sender's history before writing.
    pub audit_history: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            num_transactions: 100,
            conflict_factor: 0.0,
            seed: 42,
            chain_id: 1,
            initial_balance: U256::from(DEFAULT_INITIAL_BALANCE),
            transfer_value: U256::from(DEFAULT_TRANSFER_VALUE),
            audit_history: false,
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<(), WorkloadError> {
        if self.num_accounts < 2 {
            return Err(WorkloadError::InvalidConfig(format!(
                "at least 2 accounts are required, got {}",
                self.num_accounts
            )));
        }
        if !(0.0..=1.0).contains(&self.conflict_factor) {
            return Err(WorkloadError::InvalidConfig(format!(
                "conflict factor must be within [0, 1], got {}",
                self.conflict_factor
            )));
        }
        Ok(())
    }
}

/// Pre-generated accounts and signed transfers.
#[derive(Debug, Clone)]
pub struct Workload {
    pub accounts: Vec<Account>,
    pub transactions: Vec<SignedTransaction>,
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates a workload. All transfers are signed here.
    pub fn generate(config: WorkloadConfig) -> Result<Self, WorkloadError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let accounts: Vec<Account> = (0..config.num_accounts)
            .map(|i| Account::from_seed(config.seed.wrapping_add(i as u64)))
            .collect();

        let mut nonces: HashMap<usize, u64> = HashMap::new();

        // The hot set shrinks towards two accounts as the conflict factor grows.
        let hot_account_count = if config.conflict_factor > 0.0 {
            (2.0 + (1.0 - config.conflict_factor) * (config.num_accounts as f64 - 2.0)).max(2.0) as usize
        } else {
            config.num_accounts
        };

        let mut transactions = Vec::with_capacity(config.num_transactions);
        for _ in 0..config.num_transactions {
            let pool = if rng.gen::<f64>() < config.conflict_factor {
                hot_account_count
            } else {
                config.num_accounts
            };
            let from_idx = rng.gen_range(0..pool);
            let mut to_idx = rng.gen_range(0..pool);
            while to_idx == from_idx {
                to_idx = rng.gen_range(0..pool);
            }

            let nonce = nonces.entry(from_idx).or_insert(0);
            transactions.push(SignedTransaction::new(
                &accounts[from_idx],
                accounts[to_idx].address,
                config.transfer_value,
                *nonce,
                config.chain_id,
            )?);
            *nonce += 1;
        }

        Ok(Self { accounts, transactions, config })
    }

    /// State before the block: every account funded with the initial balance
    /// and an empty history.
    pub fn genesis(&self) -> MemStorage {
        let mut storage = MemStorage::new(bank::NUM_STORES);
        let state = AccountState {
            nonce: 0,
            balance: self.config.initial_balance,
        };
        for account in &self.accounts {
            bank::put_account(&mut storage, &account.address, &state);
        }
        storage
    }
}
