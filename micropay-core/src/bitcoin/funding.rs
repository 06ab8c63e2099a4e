use crate::bitcoin::{
    Amount, OutPoint, PublicKey, REFERENCE_MIN_FEE, ScriptBuf, Transaction, TxOut, Txid,
    channel_multisig_script, is_dust,
};
use ::bitcoin::absolute::LockTime;
use ::bitcoin::transaction::Version;
use anyhow::{Context, Result};
use micropay_wallet::BitcoinWallet;

/// The multisig contract: locks the channel's capital in output #0, with
/// change back to the client wallet behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFunding {
    inner: Transaction,
    multisig_script: ScriptBuf,
    fee: Amount,
}

impl TxFunding {
    /// Selects wallet coins for `total` plus fees, pays `total` into the
    /// 2-of-2 of (client, server), and has the wallet sign its inputs.
    /// The signed transaction is not committed anywhere yet.
    pub async fn new(
        wallet: &dyn BitcoinWallet,
        client: PublicKey,
        server: PublicKey,
        total: Amount,
    ) -> Result<Self> {
        let multisig_script = channel_multisig_script(&client, &server);

        let mut template = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: total,
                script_pubkey: multisig_script.clone(),
            }],
        };

        // The reference fee covers any funding transaction a wallet of
        // this era produces; a dust change remainder swells it instead of
        // producing an unspendable output.
        let selection = wallet
            .select_coins(total, REFERENCE_MIN_FEE)
            .await
            .context("wallet cannot fund the channel")?;

        let mut fee = selection.input_value - total - selection.change;
        if is_dust(selection.change) {
            fee += selection.change;
        } else {
            template.output.push(TxOut {
                value: selection.change,
                script_pubkey: selection.change_script,
            });
        }
        template.input = selection.inputs;

        let inner = wallet
            .sign_funding(template)
            .await
            .context("wallet failed to sign the funding transaction")?;

        tracing::debug!(
            txid = %inner.compute_txid(),
            %total,
            %fee,
            "Built multisig contract"
        );

        Ok(Self {
            inner,
            multisig_script,
            fee,
        })
    }

    pub fn txid(&self) -> Txid {
        self.inner.compute_txid()
    }

    /// The channel capital always sits at output #0.
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid(), 0)
    }

    pub fn amount(&self) -> Amount {
        self.inner.output[0].value
    }

    /// What the wallet paid to get the contract mined.
    pub fn fee(&self) -> Amount {
        self.fee
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.multisig_script.clone()
    }

    pub fn transaction(&self) -> &Transaction {
        &self.inner
    }
}
