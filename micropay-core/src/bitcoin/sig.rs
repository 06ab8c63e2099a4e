use crate::bitcoin::{SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_SINGLE};
use ::bitcoin::secp256k1::ecdsa;

/// Which channel transaction a signature authorizes. Each purpose admits
/// exactly one sighash byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignaturePurpose {
    Refund,
    Payment,
}

impl SignaturePurpose {
    pub fn required_sighash(self) -> u8 {
        match self {
            SignaturePurpose::Refund => SIGHASH_ALL,
            SignaturePurpose::Payment => SIGHASH_SINGLE | SIGHASH_ANYONECANPAY,
        }
    }

    fn required_name(self) -> &'static str {
        match self {
            SignaturePurpose::Refund => "SIGHASH_ALL",
            SignaturePurpose::Payment => "SIGHASH_SINGLE | SIGHASH_ANYONECANPAY",
        }
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum SignatureError {
    #[error("signature encoding is not canonical")]
    NotCanonical,
    #[error(
        "sighash flags must be {required} and never the SIGHASH_NONE family, got {got:#04x}"
    )]
    ForbiddenSighash { required: &'static str, got: u8 },
}

/// A counterparty signature as it travels over the wire: strict DER
/// followed by a single sighash byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSignature {
    signature: ecdsa::Signature,
    sighash: u8,
}

impl ChannelSignature {
    pub fn new(signature: ecdsa::Signature, sighash: u8) -> Self {
        Self { signature, sighash }
    }

    /// Decodes a DER+sighash blob, holding it to the canonical form relay
    /// nodes require: strict DER (the secp256k1 parser's verdict, not our
    /// own), low S, and a known base sighash flag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        if bytes.len() < 9 || bytes.len() > 73 {
            return Err(SignatureError::NotCanonical);
        }
        let (sighash, der) = bytes.split_last().expect("length checked above");

        let base = sighash & !SIGHASH_ANYONECANPAY;
        if !(SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base) {
            return Err(SignatureError::NotCanonical);
        }

        let signature = ecdsa::Signature::from_der(der).map_err(|_| SignatureError::NotCanonical)?;

        let mut normalized = signature;
        normalized.normalize_s();
        if normalized != signature {
            return Err(SignatureError::NotCanonical);
        }

        Ok(Self {
            signature,
            sighash: *sighash,
        })
    }

    pub fn signature(&self) -> &ecdsa::Signature {
        &self.signature
    }

    pub fn sighash(&self) -> u8 {
        self.sighash
    }

    /// Re-encodes as the DER+sighash blob scripts carry.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.signature.serialize_der().to_vec();
        bytes.push(self.sighash);
        bytes
    }

    /// Enforces the one sighash byte `purpose` admits. A SIGHASH_NONE
    /// signature would let the counterparty rewrite the outputs, so the
    /// rejection names that flag explicitly.
    pub fn ensure_sighash(&self, purpose: SignaturePurpose) -> Result<(), SignatureError> {
        if self.sighash != purpose.required_sighash() {
            return Err(SignatureError::ForbiddenSighash {
                required: purpose.required_name(),
                got: self.sighash,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::{SIGHASH_NONE, SecretKey, legacy_digest};
    use ::bitcoin::absolute::LockTime;
    use ::bitcoin::hashes::Hash;
    use ::bitcoin::transaction::Version;
    use ::bitcoin::{
        Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
    };
    use proptest::prelude::*;
    use rand::rngs::OsRng;

    /// secp256k1 group order, big endian.
    const CURVE_ORDER: [u8; 32] = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xfe, 0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36,
        0x41, 0x41,
    ];

    fn signed_blob(sighash: u8) -> Vec<u8> {
        let key = SecretKey::new_random(&mut OsRng);
        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        let digest = legacy_digest(&tx, 0, &ScriptBuf::new(), sighash);
        ChannelSignature::new(key.sign(digest), sighash).to_bytes()
    }

    /// Big-endian `CURVE_ORDER - s` over raw bytes.
    fn order_minus(s: &[u8; 32]) -> [u8; 32] {
        let mut out = [0u8; 32];
        let mut borrow = 0i16;
        for i in (0..32).rev() {
            let mut diff = i16::from(CURVE_ORDER[i]) - i16::from(s[i]) - borrow;
            borrow = if diff < 0 {
                diff += 256;
                1
            } else {
                0
            };
            out[i] = diff as u8;
        }
        out
    }

    #[test]
    fn roundtrips_a_fresh_signature() {
        let blob = signed_blob(SIGHASH_ALL);
        let sig = ChannelSignature::from_bytes(&blob).unwrap();

        assert_eq!(sig.sighash(), SIGHASH_ALL);
        assert_eq!(sig.to_bytes(), blob);
    }

    #[test]
    fn rejects_a_broken_der_length_byte_as_not_canonical() {
        let mut blob = signed_blob(SIGHASH_ALL);
        blob[3] ^= 0x08;

        let err = ChannelSignature::from_bytes(&blob).unwrap_err();
        assert!(err.to_string().contains("not canonical"));
    }

    #[test]
    fn accepts_a_bit_flip_inside_r_as_canonical() {
        let mut blob = signed_blob(SIGHASH_ALL);
        blob[10] ^= 0x01;

        // Structurally fine, it only fails cryptographic verification.
        let err = ChannelSignature::from_bytes(&blob);
        if let Err(err) = err {
            panic!("expected canonical signature, got {err}");
        }
    }

    #[test]
    fn rejects_high_s_as_not_canonical() {
        let blob = signed_blob(SIGHASH_ALL);
        let sig = ChannelSignature::from_bytes(&blob).unwrap();

        let compact = sig.signature().serialize_compact();
        let mut high = [0u8; 64];
        high[..32].copy_from_slice(&compact[..32]);
        let s: [u8; 32] = compact[32..].try_into().unwrap();
        high[32..].copy_from_slice(&order_minus(&s));

        let mut blob = ecdsa::Signature::from_compact(&high)
            .unwrap()
            .serialize_der()
            .to_vec();
        blob.push(SIGHASH_ALL);

        let err = ChannelSignature::from_bytes(&blob).unwrap_err();
        assert!(err.to_string().contains("not canonical"));
    }

    #[test]
    fn rejects_sighash_bytes_outside_the_known_range() {
        for flag in [0x00, 0x04, 0x80, 0x84] {
            let mut blob = signed_blob(SIGHASH_ALL);
            *blob.last_mut().unwrap() = flag;
            assert!(
                ChannelSignature::from_bytes(&blob)
                    .unwrap_err()
                    .to_string()
                    .contains("not canonical"),
                "flag {flag:#04x} should not decode"
            );
        }
    }

    #[test]
    fn rejects_truncated_and_oversized_blobs() {
        assert!(ChannelSignature::from_bytes(&[]).is_err());
        assert!(ChannelSignature::from_bytes(&[SIGHASH_ALL]).is_err());
        assert!(ChannelSignature::from_bytes(&[0x30; 74]).is_err());
    }

    #[test]
    fn payment_purpose_admits_only_single_anyonecanpay() {
        let blob = signed_blob(SIGHASH_SINGLE | SIGHASH_ANYONECANPAY);
        let sig = ChannelSignature::from_bytes(&blob).unwrap();
        sig.ensure_sighash(SignaturePurpose::Payment).unwrap();

        for flag in [
            SIGHASH_ALL,
            SIGHASH_NONE,
            SIGHASH_SINGLE,
            SIGHASH_NONE | SIGHASH_ANYONECANPAY,
        ] {
            let sig = ChannelSignature::from_bytes(&signed_blob(flag)).unwrap();
            let err = sig.ensure_sighash(SignaturePurpose::Payment).unwrap_err();
            assert!(
                err.to_string().contains("SIGHASH_NONE"),
                "rejection for {flag:#04x} must name the forbidden flag"
            );
        }
    }

    #[test]
    fn refund_purpose_admits_only_sighash_all() {
        let sig = ChannelSignature::from_bytes(&signed_blob(SIGHASH_ALL)).unwrap();
        sig.ensure_sighash(SignaturePurpose::Refund).unwrap();

        let sig =
            ChannelSignature::from_bytes(&signed_blob(SIGHASH_NONE | SIGHASH_ANYONECANPAY))
                .unwrap();
        let err = sig.ensure_sighash(SignaturePurpose::Refund).unwrap_err();
        assert!(err.to_string().contains("SIGHASH_NONE"));
    }

    proptest! {
        #[test]
        fn every_fresh_signature_decodes_canonically(flag in prop::sample::select(vec![
            SIGHASH_ALL,
            SIGHASH_NONE,
            SIGHASH_SINGLE,
            SIGHASH_ALL | SIGHASH_ANYONECANPAY,
            SIGHASH_SINGLE | SIGHASH_ANYONECANPAY,
        ])) {
            let blob = signed_blob(flag);
            let sig = ChannelSignature::from_bytes(&blob).unwrap();
            prop_assert_eq!(sig.sighash(), flag);
        }
    }
}
