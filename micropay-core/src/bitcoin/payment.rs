use crate::bitcoin::{
    Amount, ChannelSignature, LegacySighash, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction,
    TxOut, Txid, legacy_digest, multisig_script_sig, p2pkh_script,
};
use ::bitcoin::absolute::LockTime;
use ::bitcoin::transaction::Version;
use ::bitcoin::{TxIn, Witness};

/// One off-chain split of the funding output. The refund to the client
/// sits at output 0, the index `SIGHASH_SINGLE` commits the client's
/// signature to, so the server can never redirect it; the server's
/// residual follows. Zero-valued outputs are omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPayment {
    inner: Transaction,
    multisig_script: ScriptBuf,
}

impl TxPayment {
    pub fn new(
        funding_outpoint: OutPoint,
        to_server: Amount,
        to_client: Amount,
        client_refund_script: ScriptBuf,
        server_key: PublicKey,
        multisig_script: ScriptBuf,
    ) -> Self {
        let mut output = Vec::with_capacity(2);
        if to_client > Amount::ZERO {
            output.push(TxOut {
                value: to_client,
                script_pubkey: client_refund_script,
            });
        }
        if to_server > Amount::ZERO {
            output.push(TxOut {
                value: to_server,
                script_pubkey: p2pkh_script(&server_key),
            });
        }

        let inner = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: funding_outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output,
        };

        Self {
            inner,
            multisig_script,
        }
    }

    pub fn txid(&self) -> Txid {
        self.inner.compute_txid()
    }

    pub fn digest(&self, sighash_flag: u8) -> LegacySighash {
        legacy_digest(&self.inner, 0, &self.multisig_script, sighash_flag)
    }

    pub fn transaction(&self) -> &Transaction {
        &self.inner
    }

    pub fn into_transaction(self) -> Transaction {
        self.inner
    }

    /// Finalizes the split as-is, both signatures on the multisig input.
    pub fn add_signatures(
        self,
        client_sig: &ChannelSignature,
        server_sig: &ChannelSignature,
    ) -> Transaction {
        let mut tx = self.inner;
        tx.input[0].script_sig = multisig_script_sig(client_sig, server_sig);
        tx
    }
}
