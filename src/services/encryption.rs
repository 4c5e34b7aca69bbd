use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Authenticated-encryption envelope for backup artifacts.
///
/// File layout: `[nonce (12 bytes)] [ciphertext || auth tag (16 bytes)]`.
/// The nonce is random per wrap; the tag is verified on unwrap, so a
/// truncated or tampered artifact fails closed instead of restoring
/// garbage.
pub struct EncryptionEnvelope {
    cipher: Aes256Gcm,
}

const NONCE_LEN: usize = 12;

impl EncryptionEnvelope {
    pub fn new(passphrase: &str) -> anyhow::Result<Self> {
        if passphrase.is_empty() {
            anyhow::bail!("Encryption key not configured");
        }
        let key = Sha256::digest(passphrase.as_bytes());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Ok(Self { cipher })
    }

    pub fn wrap_bytes(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| anyhow::anyhow!("Encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn unwrap_bytes(&self, envelope: &[u8]) -> anyhow::Result<Vec<u8>> {
        if envelope.len() < NONCE_LEN + 16 {
            anyhow::bail!("File too short to be an encrypted backup");
        }
        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("Decryption failed: wrong key or corrupted file"))
    }

    pub fn wrap_file(&self, input: &Path, output: &Path) -> anyhow::Result<()> {
        let plaintext = std::fs::read(input)?;
        let envelope = self.wrap_bytes(&plaintext)?;
        std::fs::write(output, envelope)?;
        Ok(())
    }

    pub fn unwrap_file(&self, input: &Path, output: &Path) -> anyhow::Result<()> {
        let envelope = std::fs::read(input)?;
        let plaintext = self.unwrap_bytes(&envelope)?;
        std::fs::write(output, plaintext)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_is_byte_exact() {
        let env = EncryptionEnvelope::new("correct horse battery staple").unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let wrapped = env.wrap_bytes(&data).unwrap();
        assert_ne!(wrapped, data);
        assert_eq!(env.unwrap_bytes(&wrapped).unwrap(), data);
    }

    #[test]
    fn test_wrap_is_nondeterministic() {
        let env = EncryptionEnvelope::new("key").unwrap();
        let a = env.wrap_bytes(b"same input").unwrap();
        let b = env.wrap_bytes(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_envelope_fails_closed() {
        let env = EncryptionEnvelope::new("key").unwrap();
        let mut wrapped = env.wrap_bytes(b"payload").unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xff;
        assert!(env.unwrap_bytes(&wrapped).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let env = EncryptionEnvelope::new("key-a").unwrap();
        let wrapped = env.wrap_bytes(b"payload").unwrap();
        let other = EncryptionEnvelope::new("key-b").unwrap();
        assert!(other.unwrap_bytes(&wrapped).is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plain.gz");
        let wrapped = dir.path().join("plain.gz.enc");
        let unwrapped = dir.path().join("plain.out.gz");
        std::fs::write(&input, b"archive bytes").unwrap();

        let env = EncryptionEnvelope::new("key").unwrap();
        env.wrap_file(&input, &wrapped).unwrap();
        env.unwrap_file(&wrapped, &unwrapped).unwrap();
        assert_eq!(std::fs::read(&unwrapped).unwrap(), b"archive bytes");
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(EncryptionEnvelope::new("").is_err());
    }
}
