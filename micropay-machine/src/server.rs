use crate::common::ChannelError;
use crate::config::Config;
use anyhow::Result;
use micropay_core::bitcoin::{
    Amount, ChannelSignature, MIN_NONDUST_OUTPUT, OutPoint, PublicKey, SIGHASH_ALL, ScriptBuf,
    SecretKey, Sequence, SignaturePurpose, Transaction, TxOut, TxPayment, TxRefund, Txid,
    channel_multisig_script, estimate_fee, is_dust, legacy_digest, multisig_script_sig, verify_sig,
};
use micropay_wallet::{BitcoinWallet, Broadcaster};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    WaitingForRefundTransaction,
    WaitingForMultisigContract,
    WaitingForMultisigAcceptance,
    Ready,
    Closing,
    Closed,
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::WaitingForRefundTransaction => {
                write!(f, "waiting for the refund transaction")
            }
            ServerStatus::WaitingForMultisigContract => {
                write!(f, "waiting for the multisig contract")
            }
            ServerStatus::WaitingForMultisigAcceptance => {
                write!(f, "waiting for the network to accept the contract")
            }
            ServerStatus::Ready => write!(f, "channel is open"),
            ServerStatus::Closing => write!(f, "close transaction in flight"),
            ServerStatus::Closed => write!(f, "channel is closed"),
            ServerStatus::Error => write!(f, "channel failed"),
        }
    }
}

/// Payee side of the channel. Signs the refund before any coins lock,
/// publishes the contract, and keeps only the best payment signature.
/// Older ones authorize strictly less and are forgotten.
pub struct ServerChannel {
    wallet: Arc<dyn BitcoinWallet>,
    broadcaster: Arc<dyn Broadcaster>,
    server_key: SecretKey,
    expire_time: u64,
    config: Config,
    state: ServerStatus,
    client_pubkey: Option<PublicKey>,
    multisig_script: Option<ScriptBuf>,
    refund_txid: Option<Txid>,
    client_refund_script: Option<ScriptBuf>,
    funding: Option<Transaction>,
    /// Learned from contract output #0, not negotiated up front.
    total_value: Amount,
    best_value_to_me: Amount,
    latest_refund_amount: Amount,
    latest_sig: Option<ChannelSignature>,
    close_tx: Option<Transaction>,
    broadcast_error: Option<String>,
}

impl ServerChannel {
    pub fn new(
        wallet: Arc<dyn BitcoinWallet>,
        broadcaster: Arc<dyn Broadcaster>,
        server_key: SecretKey,
        expire_time: u64,
        config: Config,
    ) -> Self {
        Self {
            wallet,
            broadcaster,
            server_key,
            expire_time,
            config,
            state: ServerStatus::WaitingForRefundTransaction,
            client_pubkey: None,
            multisig_script: None,
            refund_txid: None,
            client_refund_script: None,
            funding: None,
            total_value: Amount::ZERO,
            best_value_to_me: Amount::ZERO,
            latest_refund_amount: Amount::ZERO,
            latest_sig: None,
            close_tx: None,
            broadcast_error: None,
        }
    }

    pub fn state(&self) -> ServerStatus {
        self.state
    }

    pub fn best_value_to_me(&self) -> Amount {
        self.best_value_to_me
    }

    pub fn total_value(&self) -> Amount {
        self.total_value
    }

    pub fn expire_time(&self) -> u64 {
        self.expire_time
    }

    pub fn refund_txid(&self) -> Option<Txid> {
        self.refund_txid
    }

    /// Checks the proposed refund cannot hold funds hostage (exactly one
    /// input and one output, a locktime no earlier than our deadline, a
    /// non-final sequence), then signs it. The server keeps only the txid;
    /// it never broadcasts the refund.
    pub fn provide_refund_transaction(
        &mut self,
        refund: Transaction,
        client_pubkey: PublicKey,
    ) -> Result<Vec<u8>, ChannelError> {
        self.require_state(
            ServerStatus::WaitingForRefundTransaction,
            "provide_refund_transaction",
        )?;

        let input = match refund.input.as_slice() {
            [input] => input,
            [] => {
                return Err(ChannelError::Verification(
                    "refund transaction spends nothing".to_string(),
                ));
            }
            inputs => {
                return Err(ChannelError::Verification(format!(
                    "refund transaction has {} inputs, expected 1",
                    inputs.len()
                )));
            }
        };
        let output = match refund.output.as_slice() {
            [output] => output,
            outputs => {
                return Err(ChannelError::Verification(format!(
                    "refund transaction has {} outputs, expected 1",
                    outputs.len()
                )));
            }
        };
        if input.sequence == Sequence::MAX {
            return Err(ChannelError::Verification(
                "refund input sequence is final, its locktime would be ignored".to_string(),
            ));
        }
        let lock_time = u64::from(refund.lock_time.to_consensus_u32());
        let min_lock_time = self
            .expire_time
            .saturating_sub(self.config.server_min_locktime_margin);
        if lock_time < min_lock_time {
            return Err(ChannelError::Verification(format!(
                "refund locktime {lock_time} matures before our deadline {min_lock_time}"
            )));
        }
        if output.value < MIN_NONDUST_OUTPUT {
            return Err(ChannelError::Verification(
                "refund output is dust".to_string(),
            ));
        }

        let multisig_script = channel_multisig_script(&client_pubkey, &self.server_key.public());
        let refund = TxRefund::from_transaction(refund, multisig_script.clone());
        let signature =
            ChannelSignature::new(self.server_key.sign(refund.digest(SIGHASH_ALL)), SIGHASH_ALL);

        self.refund_txid = Some(refund.txid());
        self.client_refund_script = Some(refund.transaction().output[0].script_pubkey.clone());
        self.client_pubkey = Some(client_pubkey);
        self.multisig_script = Some(multisig_script);
        self.state = ServerStatus::WaitingForMultisigContract;
        tracing::debug!(
            refund_txid = %refund.txid(),
            lock_time,
            "Signed the client's refund"
        );

        Ok(signature.to_bytes())
    }

    /// Validates that output #0 locks the channel under the canonical
    /// 2-of-2 and publishes the contract. Resolves once the network has
    /// accepted it; a rejected broadcast parks the channel in `Error` and
    /// surfaces the broadcaster's error unchanged.
    pub async fn provide_multisig_contract(&mut self, contract: Transaction) -> Result<()> {
        self.require_state(
            ServerStatus::WaitingForMultisigContract,
            "provide_multisig_contract",
        )?;

        let output = contract.output.first().ok_or_else(|| {
            ChannelError::Verification("contract has no outputs".to_string())
        })?;
        let expected = self
            .multisig_script
            .clone()
            .expect("multisig script fixed with the refund");
        if output.script_pubkey != expected {
            return Err(ChannelError::Verification(
                "contract output #0 must pay a 2-of-2 multisig of client and server in that order"
                    .to_string(),
            )
            .into());
        }
        if output.value == Amount::ZERO {
            return Err(
                ChannelError::Verification("contract output #0 has zero value".to_string()).into(),
            );
        }
        if contract.input.is_empty() || contract.is_coinbase() {
            return Err(ChannelError::Verification(
                "contract does not spend a plausible input chain".to_string(),
            )
            .into());
        }

        self.total_value = output.value;
        self.funding = Some(contract.clone());
        self.state = ServerStatus::WaitingForMultisigAcceptance;

        let txid = contract.compute_txid();
        tracing::info!(%txid, value = %self.total_value, "Publishing multisig contract");
        match self.broadcaster.broadcast(contract, "multisig contract").await {
            Ok(_) => {
                self.state = ServerStatus::Ready;
                tracing::info!(%txid, "Channel open");
                Ok(())
            }
            Err(error) => {
                self.state = ServerStatus::Error;
                Err(error)
            }
        }
    }

    /// Accepts one more payment slice and returns the (possibly
    /// unchanged) best value. An update that does not raise it is a
    /// silent no-op, so replays and reordering are harmless.
    pub fn increment_payment(
        &mut self,
        client_refund_amount: Amount,
        signature: &[u8],
    ) -> Result<Amount, ChannelError> {
        self.require_state(ServerStatus::Ready, "increment_payment")?;

        let new_value_to_me = self
            .total_value
            .checked_sub(client_refund_amount)
            .ok_or_else(|| {
                ChannelError::ValueOutOfRange(format!(
                    "payment of more than the channel worth, refund {client_refund_amount} \
                     exceeds the {} locked",
                    self.total_value
                ))
            })?;
        if new_value_to_me <= self.best_value_to_me {
            tracing::debug!(
                best = %self.best_value_to_me,
                offered = %new_value_to_me,
                "Ignoring stale payment update"
            );
            return Ok(self.best_value_to_me);
        }
        if client_refund_amount > Amount::ZERO && client_refund_amount < MIN_NONDUST_OUTPUT {
            return Err(ChannelError::ValueOutOfRange(format!(
                "client refund of {client_refund_amount} would be dust"
            )));
        }

        let signature = ChannelSignature::from_bytes(signature)?;
        signature.ensure_sighash(SignaturePurpose::Payment)?;

        let payment = self.payment_transaction(new_value_to_me, client_refund_amount);
        verify_sig(
            self.client_pubkey
                .as_ref()
                .expect("client key known once open"),
            &payment.digest(signature.sighash()),
            signature.signature(),
        )?;

        self.best_value_to_me = new_value_to_me;
        self.latest_refund_amount = client_refund_amount;
        self.latest_sig = Some(signature);
        tracing::debug!(best = %self.best_value_to_me, "Accepted payment update");

        Ok(self.best_value_to_me)
    }

    /// Settles the channel at the best payment seen. The server absorbs
    /// the fee from its own output; when the client signature pins that
    /// output, or it would drop into the dust band, the fee comes from a
    /// wallet top-up instead, which `ANYONECANPAY` makes legal.
    /// Idempotent once closed.
    pub async fn close(&mut self) -> Result<Transaction> {
        match self.state {
            ServerStatus::Ready => {}
            ServerStatus::Closed => {
                return Ok(self.close_tx.clone().expect("close tx retained in Closed"));
            }
            ServerStatus::Error => {
                if let Some(reason) = &self.broadcast_error {
                    anyhow::bail!("{reason}");
                }
                return Err(ChannelError::illegal_state("close", self.state).into());
            }
            _ => return Err(ChannelError::illegal_state("close", self.state).into()),
        }

        let payment = self.payment_transaction(self.best_value_to_me, self.latest_refund_amount);
        let mut close_tx = payment.into_transaction();
        let server_fee = estimate_fee(&close_tx);
        if self.best_value_to_me <= server_fee {
            return Err(ChannelError::ValueOutOfRange(format!(
                "close would burn more in fees than the channel was worth, {} against a fee of \
                 {server_fee}",
                self.best_value_to_me
            ))
            .into());
        }
        let client_sig = self
            .latest_sig
            .clone()
            .expect("a payment was accepted if the best value is positive");

        let server_vout = if self.latest_refund_amount > Amount::ZERO { 1 } else { 0 };
        let absorb = self.latest_refund_amount > Amount::ZERO
            && self.best_value_to_me >= server_fee + MIN_NONDUST_OUTPUT;
        if absorb {
            close_tx.output[server_vout].value = self.best_value_to_me - server_fee;
        } else {
            // The committed output cannot shrink; fetch the fee from our
            // own coins instead.
            let selection = self
                .wallet
                .select_coins(Amount::ZERO, server_fee)
                .await
                .map_err(|_| {
                    ChannelError::ValueOutOfRange(
                        "unable to pay required fee for the close transaction".to_string(),
                    )
                })?;
            close_tx.input.extend(selection.inputs);
            if !is_dust(selection.change) {
                close_tx.output.push(TxOut {
                    value: selection.change,
                    script_pubkey: selection.change_script,
                });
            }
        }

        let multisig_script = self
            .multisig_script
            .clone()
            .expect("multisig script fixed with the refund");
        let digest = legacy_digest(&close_tx, 0, &multisig_script, SIGHASH_ALL);
        let server_sig = ChannelSignature::new(self.server_key.sign(digest), SIGHASH_ALL);
        close_tx.input[0].script_sig = multisig_script_sig(&client_sig, &server_sig);
        if !absorb {
            close_tx = self.wallet.sign_funding(close_tx).await?;
        }

        self.state = ServerStatus::Closing;
        let txid = close_tx.compute_txid();
        tracing::info!(
            %txid,
            value = %self.best_value_to_me,
            fee = %server_fee,
            "Broadcasting close transaction"
        );
        match self.broadcaster.broadcast(close_tx.clone(), "close").await {
            Ok(_) => {
                self.close_tx = Some(close_tx.clone());
                self.state = ServerStatus::Closed;
                Ok(close_tx)
            }
            Err(error) => {
                self.state = ServerStatus::Error;
                Err(error)
            }
        }
    }

    /// The best payment finalized as-is, no fee shaping. This is what the
    /// storage layer broadcasts to beat the refund's maturity.
    pub fn best_payment_transaction(&self) -> Result<Transaction, ChannelError> {
        let client_sig = self.latest_sig.clone().ok_or_else(|| {
            ChannelError::illegal_state("best_payment_transaction", "no payment accepted yet")
        })?;
        let payment = self.payment_transaction(self.best_value_to_me, self.latest_refund_amount);
        let server_sig =
            ChannelSignature::new(self.server_key.sign(payment.digest(SIGHASH_ALL)), SIGHASH_ALL);
        Ok(payment.add_signatures(&client_sig, &server_sig))
    }

    fn payment_transaction(&self, to_server: Amount, to_client: Amount) -> TxPayment {
        let funding = self.funding.as_ref().expect("funding known once open");
        TxPayment::new(
            OutPoint::new(funding.compute_txid(), 0),
            to_server,
            to_client,
            self.client_refund_script
                .clone()
                .expect("refund script recorded with the refund"),
            self.server_key.public(),
            self.multisig_script
                .clone()
                .expect("multisig script fixed with the refund"),
        )
    }

    fn require_state(
        &self,
        required: ServerStatus,
        operation: &'static str,
    ) -> Result<(), ChannelError> {
        if self.state != required {
            return Err(ChannelError::illegal_state(operation, self.state));
        }
        Ok(())
    }

    pub(crate) fn record_broadcast_failure(&mut self, reason: String) {
        tracing::warn!(%reason, "Stored channel broadcast failed");
        self.broadcast_error = Some(reason);
        self.state = ServerStatus::Error;
    }

    pub(crate) fn set_state(&mut self, state: ServerStatus) {
        tracing::debug!(%state, "Server channel state change");
        self.state = state;
    }
}
