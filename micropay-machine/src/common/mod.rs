use micropay_core::bitcoin::{Amount, InvalidSignature, SignatureError, Transaction};
use serde::{Deserialize, Serialize};

/// Client → server: the unsigned refund the server must co-sign before
/// any coins are locked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitiateRefund {
    pub refund_tx: Transaction,
}

/// Server → client: its refund signature, DER plus sighash byte.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundSignature {
    pub signature: Vec<u8>,
}

/// Client → server: the signed multisig contract, safe to publish now
/// that the refund is in hand.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FundingReady {
    pub contract: Transaction,
}

/// Server → client: the contract reached the network, payments may begin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelOpen {}

/// Client → server: authorize one more slice of the channel. Repeated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentUpdate {
    pub client_refund_amount: Amount,
    pub signature: Vec<u8>,
}

/// Every way a channel operation can fail locally. A failed validation
/// never mutates the machine; the caller decides whether the channel is
/// still worth driving.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The operation is not in the current state's whitelist.
    #[error("{operation} is not allowed while {state}")]
    IllegalState {
        operation: &'static str,
        state: String,
    },
    /// An amount violates the dust, total-value, or fee bounds.
    #[error("{0}")]
    ValueOutOfRange(String),
    /// A counterparty-supplied transaction or signature failed a
    /// structural, canonical, or cryptographic check.
    #[error("{0}")]
    Verification(String),
}

impl ChannelError {
    pub(crate) fn illegal_state(
        operation: &'static str,
        state: impl std::fmt::Display,
    ) -> Self {
        Self::IllegalState {
            operation,
            state: state.to_string(),
        }
    }
}

impl From<SignatureError> for ChannelError {
    fn from(error: SignatureError) -> Self {
        Self::Verification(error.to_string())
    }
}

impl From<InvalidSignature> for ChannelError {
    fn from(error: InvalidSignature) -> Self {
        Self::Verification(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_update_roundtrips_through_json() {
        let update = PaymentUpdate {
            client_refund_amount: Amount::from_sat(123_456),
            signature: vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01, 0x81],
        };

        let json = serde_json::to_string(&update).unwrap();
        let decoded: PaymentUpdate = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.client_refund_amount, update.client_refund_amount);
        assert_eq!(decoded.signature, update.signature);
    }

    #[test]
    fn error_kinds_keep_their_stable_substrings() {
        let err = ChannelError::illegal_state("close", "channel is new");
        assert!(err.to_string().contains("not allowed"));

        let err = ChannelError::ValueOutOfRange("cannot afford a channel of 1 sat".into());
        assert!(err.to_string().contains("afford"));

        let err = ChannelError::from(SignatureError::NotCanonical);
        assert!(err.to_string().contains("not canonical"));

        let err = ChannelError::from(InvalidSignature);
        assert!(!err.to_string().contains("not canonical"));
    }
}
