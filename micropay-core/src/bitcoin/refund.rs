use crate::bitcoin::{
    Amount, ChannelSignature, LegacySighash, OutPoint, REFUND_INPUT_SEQUENCE, ScriptBuf, Sequence,
    Transaction, TxOut, Txid, legacy_digest, multisig_script_sig,
};
use ::bitcoin::absolute::LockTime;
use ::bitcoin::transaction::Version;
use ::bitcoin::{TxIn, Witness};

/// The pre-signed, time-locked transaction returning the channel capital
/// to the client if the server disappears. Signed by both parties before
/// any coins are locked; broadcast only by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRefund {
    inner: Transaction,
    multisig_script: ScriptBuf,
}

impl TxRefund {
    /// Spends the funding output back to `refund_script`, maturing at
    /// `locktime`. The input sequence stays below final so consensus
    /// enforces the locktime.
    pub fn new(
        funding_outpoint: OutPoint,
        amount: Amount,
        refund_script: ScriptBuf,
        locktime: u32,
        multisig_script: ScriptBuf,
    ) -> Self {
        let inner = Transaction {
            version: Version::ONE,
            lock_time: LockTime::from_consensus(locktime),
            input: vec![TxIn {
                previous_output: funding_outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence(REFUND_INPUT_SEQUENCE),
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: amount,
                script_pubkey: refund_script,
            }],
        };

        Self {
            inner,
            multisig_script,
        }
    }

    /// Wraps a client-built refund whose shape the server has already
    /// validated.
    pub fn from_transaction(tx: Transaction, multisig_script: ScriptBuf) -> Self {
        Self {
            inner: tx,
            multisig_script,
        }
    }

    pub fn txid(&self) -> Txid {
        self.inner.compute_txid()
    }

    pub fn lock_time(&self) -> u32 {
        self.inner.lock_time.to_consensus_u32()
    }

    pub fn digest(&self, sighash_flag: u8) -> LegacySighash {
        legacy_digest(&self.inner, 0, &self.multisig_script, sighash_flag)
    }

    pub fn transaction(&self) -> &Transaction {
        &self.inner
    }

    /// The final refund, with both signatures on the multisig input.
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
