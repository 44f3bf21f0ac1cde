//! Password exchange and storage.
//!
//! Login/register passwords arrive as base64 of an RSA/PKCS1v15 ciphertext
//! of the UTF-8 password; this module owns the server keypair, decryption,
//! and bcrypt hashing/verification. Message bodies beyond the password are
//! never encrypted — that's an explicit non-goal, not an oversight.

use anyhow::Context;
use rand::rngs::OsRng;
use rsa::{
    pkcs1::EncodeRsaPublicKey, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
};

/// Bcrypt cost factor the reference server uses for every stored password.
pub const BCRYPT_COST: u32 = 10;
/// RSA modulus size the reference server generates on every run.
pub const RSA_KEY_BITS: usize = 1024;

/// The server's per-run RSA keypair.
pub struct ServerKeypair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl ServerKeypair {
    /// Generates a fresh keypair. Called once at startup; the key is never
    /// persisted, matching the reference server's per-run `rsa.newkeys`.
    pub fn generate() -> anyhow::Result<Self> {
        let mut rng = OsRng;
        let private_key =
            RsaPrivateKey::new(&mut rng, RSA_KEY_BITS).context("generate rsa keypair")?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// PKCS#1 PEM encoding of the public key, exposed via `obtain-public`.
    pub fn public_key_pem(&self) -> anyhow::Result<String> {
        self.public_key
            .to_pkcs1_pem(Default::default())
            .context("encode public key pem")
            .map(|pem| pem.to_string())
    }

    /// Decrypts a base64-encoded PKCS1v15 ciphertext into the UTF-8
    /// password it carries. Any failure (bad base64, decrypt failure, bad
    /// UTF-8) is reported uniformly — callers map this to `failed-decrypt`.
    pub fn decrypt_password(&self, base64_ciphertext: &str) -> anyhow::Result<String> {
        let ciphertext = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            base64_ciphertext,
        )
        .context("decode base64 ciphertext")?;
        let plaintext = self
            .private_key
            .decrypt(Pkcs1v15Encrypt, &ciphertext)
            .map_err(|_| anyhow::anyhow!("rsa decryption failed"))?;
        String::from_utf8(plaintext).context("decrypted password is not valid utf-8")
    }
}

/// Generates a fresh session token: 16 random bytes, URL-safe base64,
/// matching the reference client handler's `secrets.token_urlsafe(16)`.
pub fn generate_session_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

/// Hashes `password` at [`BCRYPT_COST`].
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    bcrypt::hash(password, BCRYPT_COST).context("hash password")
}

/// Verifies `password` against a stored bcrypt hash.
pub fn verify_password(password: &str, hash: &str) -> anyhow::Result<bool> {
    bcrypt::verify(password, hash).context("verify password")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::DecodeRsaPublicKey;

    #[test]
    fn public_key_pem_round_trips() {
        let keypair = ServerKeypair::generate().unwrap();
        let pem = keypair.public_key_pem().unwrap();
        let parsed = RsaPublicKey::from_pkcs1_pem(&pem).unwrap();
        assert_eq!(parsed, keypair.public_key);
    }

    #[test]
    fn decrypt_recovers_the_original_password() {
        let keypair = ServerKeypair::generate().unwrap();
        let mut rng = OsRng;
        let ciphertext = keypair
            .public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, b"Password")
            .unwrap();
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, ciphertext);
        let decrypted = keypair.decrypt_password(&encoded).unwrap();
        assert_eq!(decrypted, "Password");
    }

    #[test]
    fn decrypt_rejects_garbage_ciphertext() {
        let keypair = ServerKeypair::generate().unwrap();
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"not a real ciphertext");
        assert!(keypair.decrypt_password(&encoded).is_err());
    }

    #[test]
    fn session_tokens_are_unique() {
        assert_ne!(generate_session_token(), generate_session_token());
    }

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }
}
