mod funding;
mod payment;
mod refund;
mod sig;

pub use crate::bitcoin::funding::TxFunding;
pub use crate::bitcoin::payment::TxPayment;
pub use crate::bitcoin::refund::TxRefund;
pub use crate::bitcoin::sig::{ChannelSignature, SignatureError, SignaturePurpose};

pub use ::bitcoin::absolute::LockTime;
pub use ::bitcoin::amount::Amount;
pub use ::bitcoin::sighash::LegacySighash;
pub use ::bitcoin::{Address, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxOut, Txid};

use ::bitcoin::hashes::Hash;
use ::bitcoin::opcodes;
use ::bitcoin::script::{Builder, PushBytesBuf};
use ::bitcoin::secp256k1::{self, Message, Secp256k1};
use ::bitcoin::sighash::SighashCache;
use rand::{CryptoRng, RngCore};

/// Fee below which the reference client refuses to relay, in satoshis.
pub const REFERENCE_MIN_FEE: Amount = Amount::from_sat(10_000);

/// Smallest output value relay nodes consider spendable.
pub const MIN_NONDUST_OUTPUT: Amount = Amount::from_sat(546);

pub const SIGHASH_ALL: u8 = 0x01;
pub const SIGHASH_NONE: u8 = 0x02;
pub const SIGHASH_SINGLE: u8 = 0x03;
pub const SIGHASH_ANYONECANPAY: u8 = 0x80;

/// Sequence for the refund input. Anything below final keeps the
/// transaction's locktime enforceable under consensus rules.
pub const REFUND_INPUT_SEQUENCE: u32 = 0xFFFF_FFFE;

/// One half of a channel's 2-of-2. The private scalar never leaves this
/// type; the public point is what goes over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretKey {
    inner: secp256k1::SecretKey,
    public: secp256k1::PublicKey,
}

impl SecretKey {
    pub fn new_random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let inner = secp256k1::SecretKey::new(rng);
        let public = inner.public_key(&Secp256k1::new());

        Self { inner, public }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.public)
    }

    pub fn sign(&self, digest: LegacySighash) -> secp256k1::ecdsa::Signature {
        let message = Message::from_digest(digest.to_byte_array());
        Secp256k1::new().sign_ecdsa(&message, &self.inner)
    }
}

/// A canonically-encoded curve point; construction rejects anything the
/// secp256k1 parser will not accept.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PublicKey(secp256k1::PublicKey);

impl PublicKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, secp256k1::Error> {
        Ok(Self(secp256k1::PublicKey::from_slice(bytes)?))
    }

    pub fn to_bytes(self) -> [u8; 33] {
        self.0.serialize()
    }
}

impl From<PublicKey> for ::bitcoin::PublicKey {
    fn from(from: PublicKey) -> Self {
        ::bitcoin::PublicKey::new(from.0)
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("signature is invalid")]
pub struct InvalidSignature;

pub fn verify_sig(
    verification_key: &PublicKey,
    transaction_sighash: &LegacySighash,
    sig: &secp256k1::ecdsa::Signature,
) -> Result<(), InvalidSignature> {
    let message = Message::from_digest(transaction_sighash.to_byte_array());

    Secp256k1::verification_only()
        .verify_ecdsa(&message, sig, &verification_key.0)
        .map_err(|_| InvalidSignature)
}

/// The script locking the channel's capital: a bare 2-of-2 with the keys
/// strictly in (client, server) order.
pub fn channel_multisig_script(client: &PublicKey, server: &PublicKey) -> ScriptBuf {
    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHNUM_2)
        .push_key(&(*client).into())
        .push_key(&(*server).into())
        .push_opcode(opcodes::all::OP_PUSHNUM_2)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG)
        .into_script()
}

/// Spending script for the multisig input. The leading OP_0 feeds the
/// extra element CHECKMULTISIG pops; signatures go in key order.
pub fn multisig_script_sig(
    client_sig: &ChannelSignature,
    server_sig: &ChannelSignature,
) -> ScriptBuf {
    let client_sig = PushBytesBuf::try_from(client_sig.to_bytes()).expect("signature fits a push");
    let server_sig = PushBytesBuf::try_from(server_sig.to_bytes()).expect("signature fits a push");

    Builder::new()
        .push_opcode(opcodes::OP_0)
        .push_slice(client_sig)
        .push_slice(server_sig)
        .into_script()
}

/// P2PKH output script paying a channel key directly. Both sides can
/// derive the server's payout script from the channel parameters alone.
pub fn p2pkh_script(key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&::bitcoin::PublicKey::from(*key).pubkey_hash())
}

/// Legacy sighash for `input_index` of `tx` with `script_code` as the
/// spent script.
pub fn legacy_digest(
    tx: &Transaction,
    input_index: usize,
    script_code: &ScriptBuf,
    sighash_flag: u8,
) -> LegacySighash {
    SighashCache::new(tx)
        .legacy_signature_hash(input_index, script_code, u32::from(sighash_flag))
        .expect("input index within bounds")
}

/// `max(REFERENCE_MIN_FEE, ceil(size / 1000) * REFERENCE_MIN_FEE)`
pub fn estimate_fee(tx: &Transaction) -> Amount {
    let size = tx.total_size() as u64;
    (REFERENCE_MIN_FEE * size.div_ceil(1000)).max(REFERENCE_MIN_FEE)
}

pub fn is_dust(amount: Amount) -> bool {
    amount < MIN_NONDUST_OUTPUT
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::bitcoin::absolute::LockTime;
    use ::bitcoin::transaction::Version;
    use ::bitcoin::{TxIn, Witness};
    use proptest::prelude::*;
    use rand::rngs::OsRng;

    fn dummy_tx(script_sig_len: usize) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 0),
                script_sig: ScriptBuf::from_bytes(vec![0; script_sig_len]),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    #[test]
    fn multisig_script_has_canonical_template() {
        let client = SecretKey::new_random(&mut OsRng).public();
        let server = SecretKey::new_random(&mut OsRng).public();

        let script = channel_multisig_script(&client, &server);
        let bytes = script.as_bytes();

        // OP_2 <33-byte key> <33-byte key> OP_2 OP_CHECKMULTISIG
        assert_eq!(bytes.len(), 71);
        assert_eq!(bytes[0], 0x52);
        assert_eq!(bytes[1], 33);
        assert_eq!(bytes[2..35], client.to_bytes());
        assert_eq!(bytes[36..69], server.to_bytes());
        assert_eq!(bytes[69], 0x52);
        assert_eq!(bytes[70], 0xae);
    }

    #[test]
    fn swapping_keys_changes_the_script() {
        let client = SecretKey::new_random(&mut OsRng).public();
        let server = SecretKey::new_random(&mut OsRng).public();

        assert_ne!(
            channel_multisig_script(&client, &server),
            channel_multisig_script(&server, &client)
        );
    }

    #[test]
    fn small_transactions_pay_the_reference_fee() {
        assert_eq!(estimate_fee(&dummy_tx(0)), REFERENCE_MIN_FEE);
        assert_eq!(estimate_fee(&dummy_tx(800)), REFERENCE_MIN_FEE);
    }

    #[test]
    fn fee_scales_with_the_kilobyte() {
        let fee = estimate_fee(&dummy_tx(1_200));
        assert_eq!(fee, Amount::from_sat(20_000));
    }

    #[test]
    fn dust_boundary_is_exact() {
        assert!(is_dust(Amount::from_sat(545)));
        assert!(!is_dust(MIN_NONDUST_OUTPUT));
    }

    #[test]
    fn signature_verifies_under_the_right_key_only() {
        let key = SecretKey::new_random(&mut OsRng);
        let other = SecretKey::new_random(&mut OsRng);
        let tx = dummy_tx(0);
        let digest = legacy_digest(&tx, 0, &ScriptBuf::new(), SIGHASH_ALL);

        let sig = key.sign(digest);

        assert!(verify_sig(&key.public(), &digest, &sig).is_ok());
        assert!(verify_sig(&other.public(), &digest, &sig).is_err());
    }

    #[test]
    fn public_key_roundtrips_through_bytes() {
        let key = SecretKey::new_random(&mut OsRng).public();
        assert_eq!(PublicKey::from_slice(&key.to_bytes()).unwrap(), key);
    }

    #[test]
    fn mangled_public_key_bytes_are_rejected() {
        let mut bytes = SecretKey::new_random(&mut OsRng).public().to_bytes();
        bytes[0] = 0x05;
        assert!(PublicKey::from_slice(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn estimated_fee_never_drops_below_the_reference(script_sig_len in 0usize..5_000) {
            let fee = estimate_fee(&dummy_tx(script_sig_len));
            prop_assert!(fee >= REFERENCE_MIN_FEE);
        }
    }
}
