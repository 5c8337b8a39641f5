//! crypto helpers for orbita-chain: sha3 hashing + ed25519 key material
//!
//! The core treats signatures as opaque bytes (verification happens upstream
//! of block application), so this module only carries the digest helper used
//! for block/transaction identifiers and the keypair utilities tests and
//! fixtures rely on.
use anyhow::{anyhow, Result};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_512};

use crate::types::{Hash, PublicKey};

/// One-shot sha3-512 digest of `data`, as the chain's `Hash` type.
pub fn sha3_512(data: &[u8]) -> Hash {
    let digest: [u8; 64] = Sha3_512::digest(data).into();
    Hash::from_bytes(digest)
}

/// Generate an ed25519 keypair, returning the typed public key and the
/// 32-byte secret.
pub fn generate_keypair() -> (PublicKey, [u8; 32]) {
    let signing = SigningKey::generate(&mut OsRng);
    (PublicKey::from_bytes(signing.verifying_key().to_bytes()), signing.to_bytes())
}

/// Sign a message with a 32-byte ed25519 secret key.
pub fn sign_with_secret_key(secret: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let arr: [u8; 32] = secret
        .try_into()
        .map_err(|_| anyhow!("ed25519 secret key must be 32 bytes"))?;
    let signing = SigningKey::from_bytes(&arr);
    Ok(signing.sign(msg).to_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha3_deterministic() {
        let h = sha3_512(b"hello");
        assert_eq!(h, sha3_512(b"hello"));
        assert_ne!(h, sha3_512(b"hello2"));
        assert_eq!(h.to_hex().len(), 128);
    }

    #[test]
    fn keypair_and_sign() {
        let (pk, sk) = generate_keypair();
        assert_eq!(pk.as_bytes().len(), 32);
        let sig = sign_with_secret_key(&sk, b"orbita block").expect("sign");
        assert_eq!(sig.len(), 64);
    }
}
