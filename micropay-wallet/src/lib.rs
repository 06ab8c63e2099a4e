pub mod primitives;
mod test_wallet;

pub use crate::primitives::{Clock, CoinSelection, SystemClock};
pub use crate::test_wallet::{TestBroadcaster, TestClock, TestWallet, TestWalletBuilder};

use anyhow::Result;
use bitcoin::{Address, Amount, Network, Transaction, Txid};

/// The channel machinery's view of a wallet: a source of coins and keys
/// for the funding transaction and a sink for settled channel outputs.
///
/// Implementations are internally thread-safe; several channels may share
/// one wallet.
#[async_trait::async_trait]
pub trait BitcoinWallet: Send + Sync {
    fn network(&self) -> Network;

    async fn new_address(&self) -> Result<Address>;

    /// Pick coins worth at least `target + fee`. The returned change is
    /// what the spender owes back to the wallet.
    async fn select_coins(&self, target: Amount, fee: Amount) -> Result<CoinSelection>;

    /// Sign every input of `transaction` that spends one of this wallet's
    /// own outputs. Foreign inputs are left untouched.
    async fn sign_funding(&self, transaction: Transaction) -> Result<Transaction>;

    /// Record a transaction as pending so its coins are not spent twice.
    async fn commit_pending(&self, transaction: Transaction) -> Result<()>;

    async fn pending_transactions(&self) -> Vec<Transaction>;

    /// Credit any outputs of a confirmed transaction that pay this wallet.
    async fn receive_from_block(&self, transaction: &Transaction, height: u32) -> Result<()>;

    async fn balance(&self) -> Result<Amount>;
}

/// Hands finalized transactions to the Bitcoin network.
#[async_trait::async_trait]
pub trait Broadcaster: Send + Sync {
    /// Resolves with the txid once the network accepts the transaction.
    /// `kind` is a human-readable label for diagnostics only.
    async fn broadcast(&self, transaction: Transaction, kind: &str) -> Result<Txid>;
}
