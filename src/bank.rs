//! Balance transfers over two byte stores.
//!
//! `accounts` maps an address to `nonce (u64 BE) || balance (U256 BE)`.
//! `history` maps `sender || nonce (u64 BE)` to `receiver || value (U256 BE)`,
//! so the entries of one sender form a contiguous key range.
//!
//! The transfer is written once against [`Ledger`], which is implemented for
//! the engine's [`ExecutionView`] and for a plain [`MemStorage`], so the
//! parallel and the sequential executor run exactly the same code.

use crate::workload::SignedTransaction;
use alloy_primitives::{Address, U256};
use block_stm::{
    BlockStmError, Direction, ExecutionView, KeyRange, MemStorage, Storage, StorageMut, StoreConfig, StoreId,
    Value,
};
use thiserror::Error;

pub const ACCOUNTS: StoreId = StoreId(0);
pub const HISTORY: StoreId = StoreId(1);
pub const NUM_STORES: usize = 2;

const ACCOUNT_LEN: usize = 8 + 32;
const HISTORY_KEY_LEN: usize = 20 + 8;
const HISTORY_ENTRY_LEN: usize = 20 + 32;

/// Store layout expected by [`apply_transfer`], in [`StoreId`] order.
pub fn store_configs() -> Vec<StoreConfig> {
    vec![StoreConfig::bytes("accounts"), StoreConfig::bytes("history")]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: U256,
}

impl AccountState {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ACCOUNT_LEN);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.balance.to_be_bytes::<32>());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ACCOUNT_LEN {
            return None;
        }
        let (nonce, balance) = bytes.split_at(8);
        Some(Self {
            nonce: u64::from_be_bytes(nonce.try_into().ok()?),
            balance: U256::from_be_slice(balance),
        })
    }
}

pub fn history_key(sender: &Address, nonce: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(HISTORY_KEY_LEN);
    key.extend_from_slice(sender.as_slice());
    key.extend_from_slice(&nonce.to_be_bytes());
    key
}

pub fn history_entry(receiver: &Address, value: U256) -> Vec<u8> {
    let mut entry = Vec::with_capacity(HISTORY_ENTRY_LEN);
    entry.extend_from_slice(receiver.as_slice());
    entry.extend_from_slice(&value.to_be_bytes::<32>());
    entry
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("unknown sender {0}")]
    UnknownAccount(Address),

    #[error("malformed account record for {0}")]
    CorruptAccount(Address),

    #[error("nonce mismatch: account at {expected}, transaction has {got}")]
    NonceMismatch { expected: u64, got: u64 },

    #[error("insufficient balance: have {balance}, need {value}")]
    InsufficientBalance { balance: U256, value: U256 },

    #[error("history of {sender} has {found} entries, expected {expected}")]
    HistoryMismatch { sender: Address, expected: u64, found: u64 },

    #[error(transparent)]
    Store(#[from] BlockStmError),
}

/// Keyed byte storage a transfer runs against.
pub trait Ledger {
    fn get(&mut self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, TransferError>;

    fn set(&mut self, store: StoreId, key: &[u8], value: Vec<u8>) -> Result<(), TransferError>;

    /// Number of keys in `store` starting with `prefix`.
    fn count_prefix(&mut self, store: StoreId, prefix: &[u8]) -> Result<u64, TransferError>;
}

impl Ledger for ExecutionView<'_> {
    fn get(&mut self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, TransferError> {
        let value = self.store(store)?.get(key);
        Ok(value.as_ref().and_then(Value::as_bytes).map(<[u8]>::to_vec))
    }

    fn set(&mut self, store: StoreId, key: &[u8], value: Vec<u8>) -> Result<(), TransferError> {
        self.store(store)?.set(key, value);
        Ok(())
    }

    fn count_prefix(&mut self, store: StoreId, prefix: &[u8]) -> Result<u64, TransferError> {
        let mut view = self.store(store)?;
        let count = view.iterator(KeyRange::prefix(prefix), Direction::Ascending).count();
        Ok(count as u64)
    }
}

impl Ledger for MemStorage {
    fn get(&mut self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, TransferError> {
        let value = Storage::get(&*self, store, key);
        Ok(value.as_ref().and_then(Value::as_bytes).map(<[u8]>::to_vec))
    }

    fn set(&mut self, store: StoreId, key: &[u8], value: Vec<u8>) -> Result<(), TransferError> {
        StorageMut::set(self, store, key.into(), value.into());
        Ok(())
    }

    fn count_prefix(&mut self, store: StoreId, prefix: &[u8]) -> Result<u64, TransferError> {
        let count = self.range(store, &KeyRange::prefix(prefix), Direction::Ascending).count();
        Ok(count as u64)
    }
}

pub fn read_account<L: Ledger + ?Sized>(
    ledger: &mut L,
    address: &Address,
) -> Result<Option<AccountState>, TransferError> {
    match ledger.get(ACCOUNTS, address.as_slice())? {
        Some(bytes) => AccountState::decode(&bytes)
            .map(Some)
            .ok_or(TransferError::CorruptAccount(*address)),
        None => Ok(None),
    }
}

/// Writes an account record straight into storage.
pub fn put_account<S: StorageMut + ?Sized>(storage: &mut S, address: &Address, state: &AccountState) {
    storage.set(ACCOUNTS, address.as_slice().into(), state.encode().into());
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOptions {
    pub verify_signatures: bool,
    /// Check that the sender's history holds exactly `nonce` entries.
    pub audit_history: bool,
}

/// Applies one transfer. Every check runs before the first write, so a
/// failed transfer leaves the ledger untouched.
pub fn apply_transfer<L: Ledger + ?Sized>(
    ledger: &mut L,
    tx: &SignedTransaction,
    options: TransferOptions,
) -> Result<(), TransferError> {
    if options.verify_signatures && !tx.verify() {
        return Err(TransferError::InvalidSignature);
    }

    let mut sender = read_account(ledger, &tx.from)?.ok_or(TransferError::UnknownAccount(tx.from))?;
    if sender.nonce != tx.nonce {
        return Err(TransferError::NonceMismatch {
            expected: sender.nonce,
            got: tx.nonce,
        });
    }
    if sender.balance < tx.value {
        return Err(TransferError::InsufficientBalance {
            balance: sender.balance,
            value: tx.value,
        });
    }

    if options.audit_history {
        let found = ledger.count_prefix(HISTORY, tx.from.as_slice())?;
        if found != sender.nonce {
            return Err(TransferError::HistoryMismatch {
                sender: tx.from,
                expected: sender.nonce,
                found,
            });
        }
    }

    sender.nonce += 1;
    if tx.to == tx.from {
        ledger.set(ACCOUNTS, tx.from.as_slice(), sender.encode())?;
    } else {
        let mut receiver = read_account(ledger, &tx.to)?.unwrap_or_default();
        sender.balance -= tx.value;
        receiver.balance = receiver.balance.saturating_add(tx.value);
        ledger.set(ACCOUNTS, tx.from.as_slice(), sender.encode())?;
        ledger.set(ACCOUNTS, tx.to.as_slice(), receiver.encode())?;
    }
    ledger.set(HISTORY, &history_key(&tx.from, tx.nonce), history_entry(&tx.to, tx.value))?;
    Ok(())
}
