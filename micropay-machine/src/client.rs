use crate::common::{ChannelError, PaymentUpdate};
use anyhow::{Context, Result};
use micropay_core::bitcoin::{
    Address, Amount, ChannelSignature, MIN_NONDUST_OUTPUT, PublicKey, REFERENCE_MIN_FEE,
    SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_SINGLE, ScriptBuf, SecretKey, SignaturePurpose,
    Transaction, TxFunding, TxPayment, TxRefund, verify_sig,
};
use micropay_wallet::BitcoinWallet;
use std::fmt;
use std::sync::Arc;

/// Everything fixed at channel birth, seen from the payer.
#[derive(Debug, Clone)]
pub struct ChannelParameters {
    pub client_key: SecretKey,
    pub server_pubkey: PublicKey,
    /// The most the channel can ever transfer.
    pub total_value: Amount,
    /// Unix seconds after which the refund matures.
    pub expire_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    New,
    Initiated,
    ProvideContract,
    Ready,
    Closed,
    Expired,
    Error,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientStatus::New => write!(f, "channel is new"),
            ClientStatus::Initiated => write!(f, "waiting for the refund signature"),
            ClientStatus::ProvideContract => write!(f, "contract ready for the server"),
            ClientStatus::Ready => write!(f, "channel is open"),
            ClientStatus::Closed => write!(f, "channel is closed"),
            ClientStatus::Expired => write!(f, "channel expired and fell back to the refund"),
            ClientStatus::Error => write!(f, "channel failed"),
        }
    }
}

/// Payer side of the channel: locks the capital, holds the signed refund
/// as its fallback, and signs away ever larger slices.
pub struct ClientChannel {
    wallet: Arc<dyn BitcoinWallet>,
    params: ChannelParameters,
    refund_script: ScriptBuf,
    state: ClientStatus,
    funding: Option<TxFunding>,
    refund: Option<TxRefund>,
    signed_refund: Option<Transaction>,
    refund_fees: Amount,
    /// Value signed over to the server so far.
    current_payment: Amount,
    stored: bool,
}

impl ClientChannel {
    pub fn new(
        wallet: Arc<dyn BitcoinWallet>,
        params: ChannelParameters,
        refund_address: Address,
    ) -> Self {
        Self {
            wallet,
            params,
            refund_script: refund_address.script_pubkey(),
            state: ClientStatus::New,
            funding: None,
            refund: None,
            signed_refund: None,
            refund_fees: Amount::ZERO,
            current_payment: Amount::ZERO,
            stored: false,
        }
    }

    pub fn state(&self) -> ClientStatus {
        self.state
    }

    pub fn current_payment(&self) -> Amount {
        self.current_payment
    }

    /// Total cost of abandoning the channel over the refund path.
    pub fn refund_fees(&self) -> Amount {
        self.refund_fees
    }

    pub fn expire_time(&self) -> u64 {
        self.params.expire_time
    }

    /// Builds the multisig contract and its time-locked refund. Nothing
    /// is committed or broadcast until the server has signed the refund.
    pub async fn initiate(&mut self) -> Result<()> {
        self.require_state(ClientStatus::New, "initiate")?;

        let min_channel = MIN_NONDUST_OUTPUT + REFERENCE_MIN_FEE;
        if self.params.total_value < min_channel {
            return Err(ChannelError::ValueOutOfRange(format!(
                "cannot afford a channel of {}, the refund would not clear below {min_channel}",
                self.params.total_value
            ))
            .into());
        }

        let locktime = u32::try_from(self.params.expire_time)
            .context("channel expiry does not fit a transaction locktime")?;

        let funding = TxFunding::new(
            self.wallet.as_ref(),
            self.params.client_key.public(),
            self.params.server_pubkey,
            self.params.total_value,
        )
        .await?;

        let refund = TxRefund::new(
            funding.outpoint(),
            self.params.total_value - REFERENCE_MIN_FEE,
            self.refund_script.clone(),
            locktime,
            funding.script_pubkey(),
        );

        self.refund_fees = funding.fee() + REFERENCE_MIN_FEE;
        tracing::debug!(
            contract_txid = %funding.txid(),
            total = %self.params.total_value,
            refund_fees = %self.refund_fees,
            "Initiated payment channel"
        );
        self.funding = Some(funding);
        self.refund = Some(refund);
        self.state = ClientStatus::Initiated;
        Ok(())
    }

    /// The refund for the server to sign. Unsigned on purpose: the server
    /// must commit to it before ever seeing the contract.
    pub fn incomplete_refund_transaction(&self) -> Result<Transaction, ChannelError> {
        self.require_state(ClientStatus::Initiated, "incomplete_refund_transaction")?;
        Ok(self
            .refund
            .as_ref()
            .expect("refund built on initiate")
            .transaction()
            .clone())
    }

    /// Validates the server's refund signature, co-signs, and commits the
    /// funding transaction to the wallet as pending. From here the client
    /// can always get its money back.
    pub async fn provide_refund_signature(&mut self, signature: &[u8]) -> Result<()> {
        self.require_state(ClientStatus::Initiated, "provide_refund_signature")?;

        let server_sig = ChannelSignature::from_bytes(signature).map_err(ChannelError::from)?;
        server_sig
            .ensure_sighash(SignaturePurpose::Refund)
            .map_err(ChannelError::from)?;

        let refund = self.refund.clone().expect("refund built on initiate");
        verify_sig(
            &self.params.server_pubkey,
            &refund.digest(server_sig.sighash()),
            server_sig.signature(),
        )
        .map_err(ChannelError::from)?;

        let client_sig = ChannelSignature::new(
            self.params.client_key.sign(refund.digest(SIGHASH_ALL)),
            SIGHASH_ALL,
        );
        let refund_txid = refund.txid();
        self.signed_refund = Some(refund.add_signatures(&client_sig, &server_sig));

        let funding = self.funding.as_ref().expect("funding built on initiate");
        self.wallet
            .commit_pending(funding.transaction().clone())
            .await?;

        self.state = ClientStatus::ProvideContract;
        tracing::debug!(%refund_txid, "Refund fully signed, contract safe to hand over");
        Ok(())
    }

    /// The signed multisig contract for the server to publish. The first
    /// call opens the channel for payments.
    pub fn multisig_contract(&mut self) -> Result<Transaction, ChannelError> {
        match self.state {
            ClientStatus::ProvideContract => {
                self.state = ClientStatus::Ready;
                tracing::debug!("Channel ready for payments");
            }
            ClientStatus::Ready => {}
            _ => return Err(ChannelError::illegal_state("multisig_contract", self.state)),
        }
        Ok(self
            .funding
            .as_ref()
            .expect("funding exists once the refund is signed")
            .transaction()
            .clone())
    }

    /// Signs `delta` more satoshis over to the server and returns the
    /// update to send. The refund to ourselves must stay spendable, so a
    /// remainder inside the dust band is rejected; exactly zero is fine.
    pub fn increment_payment_by(&mut self, delta: Amount) -> Result<PaymentUpdate, ChannelError> {
        if self.stored {
            return Err(ChannelError::illegal_state(
                "increment_payment_by",
                "the channel is stored in the wallet",
            ));
        }
        self.require_state(ClientStatus::Ready, "increment_payment_by")?;

        if delta == Amount::ZERO {
            return Err(ChannelError::ValueOutOfRange(
                "payment increment must be positive".to_string(),
            ));
        }
        let new_payment = self
            .current_payment
            .checked_add(delta)
            .ok_or_else(|| ChannelError::ValueOutOfRange("payment overflows".to_string()))?;
        let new_refund = self
            .params
            .total_value
            .checked_sub(new_payment)
            .ok_or_else(|| {
                ChannelError::ValueOutOfRange(format!(
                    "payment of {new_payment} is more than the channel worth"
                ))
            })?;
        if new_refund > Amount::ZERO && new_refund < MIN_NONDUST_OUTPUT {
            return Err(ChannelError::ValueOutOfRange(format!(
                "a refund of {new_refund} would be dust, pay less or spend the whole channel"
            )));
        }

        let funding = self.funding.as_ref().expect("funding exists in Ready");
        let payment = TxPayment::new(
            funding.outpoint(),
            new_payment,
            new_refund,
            self.refund_script.clone(),
            self.params.server_pubkey,
            funding.script_pubkey(),
        );
        let flag = SIGHASH_SINGLE | SIGHASH_ANYONECANPAY;
        let signature =
            ChannelSignature::new(self.params.client_key.sign(payment.digest(flag)), flag);

        self.current_payment = new_payment;
        tracing::debug!(paid = %new_payment, refund = %new_refund, "Signed payment increment");

        Ok(PaymentUpdate {
            client_refund_amount: new_refund,
            signature: signature.to_bytes(),
        })
    }

    /// The fully signed refund, broadcastable once its locktime matures.
    pub fn completed_refund_transaction(&self) -> Result<Transaction, ChannelError> {
        self.require_handshake_done("completed_refund_transaction")?;
        Ok(self
            .signed_refund
            .clone()
            .expect("refund signed before the handshake completed"))
    }

    /// The signed contract, for rebroadcast by the storage layer.
    pub fn funding_transaction(&self) -> Result<Transaction, ChannelError> {
        self.require_handshake_done("funding_transaction")?;
        Ok(self
            .funding
            .as_ref()
            .expect("funding exists once the refund is signed")
            .transaction()
            .clone())
    }

    fn require_handshake_done(&self, operation: &'static str) -> Result<(), ChannelError> {
        match self.state {
            ClientStatus::ProvideContract
            | ClientStatus::Ready
            | ClientStatus::Closed
            | ClientStatus::Expired => Ok(()),
            _ => Err(ChannelError::illegal_state(operation, self.state)),
        }
    }

    fn require_state(
        &self,
        required: ClientStatus,
        operation: &'static str,
    ) -> Result<(), ChannelError> {
        if self.state != required {
            return Err(ChannelError::illegal_state(operation, self.state));
        }
        Ok(())
    }

    pub(crate) fn mark_stored(&mut self) {
        self.stored = true;
    }

    pub(crate) fn set_state(&mut self, state: ClientStatus) {
        tracing::debug!(%state, "Client channel state change");
        self.state = state;
    }
}
