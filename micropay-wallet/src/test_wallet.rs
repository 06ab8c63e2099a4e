use crate::primitives::{Clock, CoinSelection};
use crate::{BitcoinWallet, Broadcaster};
use anyhow::{Result, bail};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{self, Message, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, EcdsaSighashType, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use std::cmp::Reverse;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

struct WalletKey {
    secret: secp256k1::SecretKey,
    public: bitcoin::PublicKey,
    script_pubkey: ScriptBuf,
}

struct Utxo {
    outpoint: OutPoint,
    txout: TxOut,
    /// `None` for watch-only outputs the wallet can count but not spend.
    key_index: Option<usize>,
}

struct Inner {
    keys: Vec<WalletKey>,
    utxos: Vec<Utxo>,
    pending: Vec<Transaction>,
    watched: Vec<ScriptBuf>,
    seed_counter: u32,
}

/// In-memory P2PKH wallet over regtest, with real signatures. Only for
/// tests; nothing is persisted.
pub struct TestWallet {
    network: Network,
    inner: Mutex<Inner>,
}

/// Builds a [`TestWallet`] pre-funded with synthetic coins.
pub struct TestWalletBuilder {
    balance: u64,
    num_utxos: u8,
}

impl TestWalletBuilder {
    pub fn new(balance: u64) -> Self {
        Self {
            balance,
            num_utxos: 1,
        }
    }

    pub fn with_num_utxos(mut self, num_utxos: u8) -> Self {
        self.num_utxos = num_utxos;
        self
    }

    pub fn build(self) -> TestWallet {
        let wallet = TestWallet::new(Network::Regtest);
        if self.balance > 0 {
            let utxos = u64::from(self.num_utxos.max(1));
            for _ in 0..utxos {
                wallet.give(Amount::from_sat(self.balance / utxos));
            }
        }
        wallet
    }
}

impl TestWallet {
    fn new(network: Network) -> Self {
        Self {
            network,
            inner: Mutex::new(Inner {
                keys: Vec::new(),
                utxos: Vec::new(),
                pending: Vec::new(),
                watched: Vec::new(),
                seed_counter: 0,
            }),
        }
    }

    /// Count outputs paying `script` towards the balance, even though the
    /// wallet holds no key for them.
    pub fn watch_script(&self, script: ScriptBuf) {
        self.inner.lock().expect("wallet mutex").watched.push(script);
    }

    fn give(&self, value: Amount) {
        let mut inner = self.inner.lock().expect("wallet mutex");
        let key_index = Self::add_key_locked(&mut inner);
        let script_pubkey = inner.keys[key_index].script_pubkey.clone();

        // A unique dummy prevout keeps the seed txids distinct.
        let seed = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), inner.seed_counter),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value,
                script_pubkey,
            }],
        };
        inner.seed_counter += 1;
        inner.utxos.push(Utxo {
            outpoint: OutPoint::new(seed.compute_txid(), 0),
            txout: seed.output[0].clone(),
            key_index: Some(key_index),
        });
    }

    fn add_key_locked(inner: &mut Inner) -> usize {
        let secret = secp256k1::SecretKey::new(&mut rand::thread_rng());
        let public = bitcoin::PublicKey::new(secret.public_key(&Secp256k1::new()));
        let script_pubkey = ScriptBuf::new_p2pkh(&public.pubkey_hash());
        inner.keys.push(WalletKey {
            secret,
            public,
            script_pubkey,
        });
        inner.keys.len() - 1
    }

    fn credit_outputs_locked(inner: &mut Inner, transaction: &Transaction) {
        let txid = transaction.compute_txid();
        for (vout, output) in transaction.output.iter().enumerate() {
            let key_index = inner
                .keys
                .iter()
                .position(|key| key.script_pubkey == output.script_pubkey);
            let watched = inner.watched.contains(&output.script_pubkey);
            if key_index.is_none() && !watched {
                continue;
            }
            inner.utxos.push(Utxo {
                outpoint: OutPoint::new(txid, vout as u32),
                txout: output.clone(),
                key_index,
            });
        }
    }
}

#[async_trait]
impl BitcoinWallet for TestWallet {
    fn network(&self) -> Network {
        self.network
    }

    async fn new_address(&self) -> Result<Address> {
        let mut inner = self.inner.lock().expect("wallet mutex");
        let key_index = Self::add_key_locked(&mut inner);
        Ok(Address::p2pkh(inner.keys[key_index].public, self.network))
    }

    async fn select_coins(&self, target: Amount, fee: Amount) -> Result<CoinSelection> {
        let mut inner = self.inner.lock().expect("wallet mutex");
        let needed = target + fee;

        let mut coins: Vec<(OutPoint, Amount)> = inner
            .utxos
            .iter()
            .filter(|utxo| utxo.key_index.is_some())
            .map(|utxo| (utxo.outpoint, utxo.txout.value))
            .collect();
        coins.sort_by_key(|(_, value)| Reverse(*value));

        let mut inputs = Vec::new();
        let mut input_value = Amount::ZERO;
        for (outpoint, value) in coins {
            if input_value >= needed {
                break;
            }
            input_value += value;
            inputs.push(TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            });
        }
        if input_value < needed {
            bail!("wallet holds {input_value}, cannot select {needed}");
        }

        let change_index = Self::add_key_locked(&mut inner);
        Ok(CoinSelection {
            inputs,
            input_value,
            change: input_value - needed,
            change_script: inner.keys[change_index].script_pubkey.clone(),
        })
    }

    async fn sign_funding(&self, transaction: Transaction) -> Result<Transaction> {
        let inner = self.inner.lock().expect("wallet mutex");
        let secp = Secp256k1::new();
        let cache = SighashCache::new(&transaction);

        let mut signed = transaction.clone();
        for (index, input) in transaction.input.iter().enumerate() {
            let Some(utxo) = inner
                .utxos
                .iter()
                .find(|utxo| utxo.outpoint == input.previous_output)
            else {
                continue;
            };
            let Some(key_index) = utxo.key_index else {
                continue;
            };
            let key = &inner.keys[key_index];

            let sighash = cache.legacy_signature_hash(
                index,
                &utxo.txout.script_pubkey,
                EcdsaSighashType::All.to_u32(),
            )?;
            let message = Message::from_digest(sighash.to_byte_array());
            let mut signature = secp.sign_ecdsa(&message, &key.secret).serialize_der().to_vec();
            signature.push(EcdsaSighashType::All.to_u32() as u8);
            let signature = PushBytesBuf::try_from(signature).expect("signature fits a push");

            signed.input[index].script_sig = Builder::new()
                .push_slice(signature)
                .push_key(&key.public)
                .into_script();
        }
        Ok(signed)
    }

    async fn commit_pending(&self, transaction: Transaction) -> Result<()> {
        let mut inner = self.inner.lock().expect("wallet mutex");
        for input in &transaction.input {
            inner
                .utxos
                .retain(|utxo| utxo.outpoint != input.previous_output);
        }
        Self::credit_outputs_locked(&mut inner, &transaction);
        inner.pending.push(transaction);
        Ok(())
    }

    async fn pending_transactions(&self) -> Vec<Transaction> {
        self.inner.lock().expect("wallet mutex").pending.clone()
    }

    async fn receive_from_block(&self, transaction: &Transaction, height: u32) -> Result<()> {
        let mut inner = self.inner.lock().expect("wallet mutex");
        let txid = transaction.compute_txid();
        inner.pending.retain(|tx| tx.compute_txid() != txid);
        for input in &transaction.input {
            inner
                .utxos
                .retain(|utxo| utxo.outpoint != input.previous_output);
        }
        // A pending commit may already have credited these outputs.
        inner.utxos.retain(|utxo| utxo.outpoint.txid != txid);
        Self::credit_outputs_locked(&mut inner, transaction);
        tracing::debug!(%txid, height, "Wallet absorbed block transaction");
        Ok(())
    }

    async fn balance(&self) -> Result<Amount> {
        let inner = self.inner.lock().expect("wallet mutex");
        Ok(inner
            .utxos
            .iter()
            .map(|utxo| utxo.txout.value)
            .sum::<Amount>())
    }
}

/// Records broadcasts in order; can be armed to reject them.
#[derive(Default)]
pub struct TestBroadcaster {
    sent: Mutex<Vec<(String, Transaction)>>,
    failure: Mutex<Option<String>>,
}

impl TestBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent broadcast fail with `reason`.
    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock().expect("broadcaster mutex") = Some(reason.to_string());
    }

    pub fn recover(&self) {
        *self.failure.lock().expect("broadcaster mutex") = None;
    }

    pub fn broadcasts(&self) -> Vec<(String, Transaction)> {
        self.sent.lock().expect("broadcaster mutex").clone()
    }

    pub fn broadcast_count(&self) -> usize {
        self.sent.lock().expect("broadcaster mutex").len()
    }
}

#[async_trait]
impl Broadcaster for TestBroadcaster {
    async fn broadcast(&self, transaction: Transaction, kind: &str) -> Result<Txid> {
        if let Some(reason) = self.failure.lock().expect("broadcaster mutex").clone() {
            bail!("broadcast rejected: {reason}");
        }
        let txid = transaction.compute_txid();
        tracing::debug!(%txid, kind, "Test broadcaster accepted transaction");
        self.sent
            .lock()
            .expect("broadcaster mutex")
            .push((kind.to_string(), transaction));
        Ok(txid)
    }
}

/// Settable clock for deadline tests.
pub struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BitcoinWallet;

    #[tokio::test]
    async fn builder_distributes_balance_over_utxos() {
        let wallet = TestWalletBuilder::new(100_000).with_num_utxos(4).build();
        assert_eq!(wallet.balance().await.unwrap(), Amount::from_sat(100_000));
    }

    #[tokio::test]
    async fn select_coins_accounts_for_fee_and_change() {
        let wallet = TestWalletBuilder::new(100_000).build();
        let selection = wallet
            .select_coins(Amount::from_sat(60_000), Amount::from_sat(1_000))
            .await
            .unwrap();

        assert_eq!(selection.input_value, Amount::from_sat(100_000));
        assert_eq!(selection.change, Amount::from_sat(39_000));
    }

    #[tokio::test]
    async fn select_coins_fails_when_underfunded() {
        let wallet = TestWalletBuilder::new(1_000).build();
        let result = wallet
            .select_coins(Amount::from_sat(60_000), Amount::from_sat(1_000))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn commit_pending_spends_coins_and_credits_change() {
        let wallet = TestWalletBuilder::new(100_000).build();
        let selection = wallet
            .select_coins(Amount::from_sat(60_000), Amount::from_sat(1_000))
            .await
            .unwrap();

        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: selection.inputs.clone(),
            output: vec![
                TxOut {
                    value: Amount::from_sat(60_000),
                    // pays somebody else
                    script_pubkey: ScriptBuf::new(),
                },
                TxOut {
                    value: selection.change,
                    script_pubkey: selection.change_script.clone(),
                },
            ],
        };
        wallet.commit_pending(tx.clone()).await.unwrap();

        assert_eq!(wallet.balance().await.unwrap(), Amount::from_sat(39_000));
        assert_eq!(wallet.pending_transactions().await.len(), 1);

        // Confirmation must not credit the change twice.
        wallet.receive_from_block(&tx, 100).await.unwrap();
        assert_eq!(wallet.balance().await.unwrap(), Amount::from_sat(39_000));
        assert!(wallet.pending_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn sign_funding_fills_own_inputs_only() {
        let wallet = TestWalletBuilder::new(100_000).build();
        let selection = wallet
            .select_coins(Amount::from_sat(60_000), Amount::from_sat(1_000))
            .await
            .unwrap();

        let foreign_input = TxIn {
            previous_output: OutPoint::new(Txid::all_zeros(), 7),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        };
        let mut inputs = selection.inputs.clone();
        inputs.push(foreign_input);

        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: vec![TxOut {
                value: Amount::from_sat(99_000),
                script_pubkey: selection.change_script.clone(),
            }],
        };
        let signed = wallet.sign_funding(tx).await.unwrap();

        assert!(!signed.input[0].script_sig.is_empty());
        assert!(signed.input[1].script_sig.is_empty());
    }

    #[tokio::test]
    async fn watched_scripts_count_towards_balance() {
        let wallet = TestWalletBuilder::new(0).build();
        let script = ScriptBuf::from_bytes(vec![0x51]);
        wallet.watch_script(script.clone());

        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 1),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(5_000),
                script_pubkey: script,
            }],
        };
        wallet.receive_from_block(&tx, 1).await.unwrap();

        assert_eq!(wallet.balance().await.unwrap(), Amount::from_sat(5_000));
    }

    #[tokio::test]
    async fn broadcaster_failure_is_sticky_until_recovered() {
        let broadcaster = TestBroadcaster::new();
        broadcaster.fail_with("mempool full");

        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        assert!(broadcaster.broadcast(tx.clone(), "test").await.is_err());

        broadcaster.recover();
        broadcaster.broadcast(tx, "test").await.unwrap();
        assert_eq!(broadcaster.broadcast_count(), 1);
    }
}
