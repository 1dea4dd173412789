//! The wallet engine: subchain scanners, per-nym account fan-out, the
//! spend proposal builder, and the coordinator actor gluing them to the
//! rest of the node.

mod account;
mod accounts;
mod errors;
mod job;
pub mod keys;
mod matcher;
mod spend;
mod subchain;
mod wallet;

pub use account::Account;
pub use accounts::Accounts;
pub use errors::{WalletError, WalletResult};
pub use job::JobCounter;
pub use keys::{Bip32KeySource, KeySource, ScriptForm};
pub use matcher::{match_transaction, TxMatch};
pub use spend::{BuilderError, Proposals, TransactionBuilder};
pub use subchain::{FilterSource, ScannerConfig, SubchainState, SubchainStateData};
pub use wallet::{Wallet, WalletCommand};

/// Mempool view consumed by the scanners.
pub trait Mempool: Send + Sync + 'static {
    fn dump(&self) -> Vec<cinder_primitives::buf::Buf32>;

    fn query(&self, txid: &cinder_primitives::buf::Buf32) -> Option<bitcoin::Transaction>;
}
