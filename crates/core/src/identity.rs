use ed25519_dalek::{Signer, Verifier};

use crate::error::CoreError;
use crate::ids::Signature;

/// ed25519 key used to sign audit entries.
pub struct SigningIdentity {
    signing_key: ed25519_dalek::SigningKey,
}

impl SigningIdentity {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut rng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.signing_key.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("public_key", &blake3::hash(&self.public_key()).to_hex()[..8].to_string())
            .finish()
    }
}

pub fn verify_signature(
    public_key: &[u8; 32],
    message: &[u8],
    signature: &Signature,
) -> Result<(), CoreError> {
    let verifying_key =
        ed25519_dalek::VerifyingKey::from_bytes(public_key).map_err(|_| CoreError::InvalidSignature)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    verifying_key
        .verify(message, &sig)
        .map_err(|_| CoreError::InvalidSignature)
}
