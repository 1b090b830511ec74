//! Envelope signing, kept behind a trait so the relay's routing logic never
//! imports a crypto crate directly (spec §1).

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};

pub trait Signer: Send + Sync {
    fn public_key_hex(&self) -> String;
    fn sign(&self, message: &[u8]) -> String;
}

pub trait Verifier: Send + Sync {
    fn verify(&self, public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool;
}

/// Generates a fresh keypair, returned as `(public_key_hex, private_key_hex)`.
pub fn generate_keypair() -> (String, String) {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let public = hex::encode(signing_key.verifying_key().to_bytes());
    let private = hex::encode(signing_key.to_bytes());
    (public, private)
}

pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_hex(private_key_hex: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(private_key_hex)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("private key must be 32 bytes"))?;
        Ok(Self { key: SigningKey::from_bytes(&bytes) })
    }
}

impl Signer for Ed25519Signer {
    fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.key.sign(message).to_bytes())
    }
}

#[derive(Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool {
        let Ok(key_bytes) = hex::decode(public_key_hex) else { return false };
        let Ok(key_bytes): Result<[u8; 32], _> = key_bytes.try_into() else { return false };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else { return false };

        let Ok(sig_bytes) = hex::decode(signature_hex) else { return false };
        let Ok(sig_bytes): Result<[u8; 64], _> = sig_bytes.try_into() else { return false };
        let signature = Signature::from_bytes(&sig_bytes);

        verifying_key.verify(message, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_sign_and_verify() {
        let (public, private) = generate_keypair();
        let signer = Ed25519Signer::from_hex(&private).unwrap();
        assert_eq!(signer.public_key_hex(), public);

        let message = b"hello relay";
        let signature = signer.sign(message);

        let verifier = Ed25519Verifier;
        assert!(verifier.verify(&public, message, &signature));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let (public, private) = generate_keypair();
        let signer = Ed25519Signer::from_hex(&private).unwrap();
        let signature = signer.sign(b"original");

        let verifier = Ed25519Verifier;
        assert!(!verifier.verify(&public, b"tampered", &signature));
    }

    #[test]
    fn malformed_hex_is_rejected_not_panicking() {
        let verifier = Ed25519Verifier;
        assert!(!verifier.verify("not-hex", b"x", "also-not-hex"));
    }
}
