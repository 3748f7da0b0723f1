use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Result};
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use solana_sdk::signature::{Keypair, Signer};

/// Encrypted-at-rest wallet key handling.
///
/// Keys are encrypted with AES-256-GCM under a key derived from the process
/// master secret and a random per-wallet salt (PBKDF2-HMAC-SHA256, 100k
/// iterations). Plaintext key bytes exist only inside a `SigningKey` guard
/// that zeroes its buffer on drop; decrypt right before signing, let the
/// guard fall out of scope right after.
#[derive(Clone)]
pub struct WalletVault {
    master_secret: String,
}

/// Base64 blobs as stored in the wallets table.
#[derive(Debug, Clone)]
pub struct EncryptedKeyMaterial {
    pub ciphertext: String,
    pub nonce: String,
    pub salt: String,
}

/// Plaintext keypair bytes, zeroed on drop.
pub struct SigningKey {
    bytes: [u8; 64],
}

impl SigningKey {
    pub fn keypair(&self) -> Result<Keypair> {
        Keypair::from_bytes(&self.bytes).map_err(|e| anyhow!("Corrupt key material: {}", e))
    }

    pub fn pubkey(&self) -> Result<String> {
        Ok(self.keypair()?.pubkey().to_string())
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        // Best-effort zeroization; volatile write prevents dead-store elision.
        for b in self.bytes.iter_mut() {
            unsafe { std::ptr::write_volatile(b, 0) };
        }
    }
}

impl WalletVault {
    pub fn new(master_secret: String) -> Self {
        Self { master_secret }
    }

    /// Generate a fresh keypair and encrypt it. Returns (public address,
    /// encrypted material).
    pub fn create_key(&self) -> Result<(String, EncryptedKeyMaterial)> {
        let keypair = Keypair::new();
        let address = keypair.pubkey().to_string();
        let material = self.encrypt_keypair(&keypair)?;
        Ok((address, material))
    }

    /// Encrypt an imported keypair.
    pub fn encrypt_keypair(&self, keypair: &Keypair) -> Result<EncryptedKeyMaterial> {
        let salt = generate_salt();
        let derived = derive_key(&self.master_secret, &salt);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let plaintext = keypair.to_bytes();
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| anyhow!("Key encryption failed: {:?}", e))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        Ok(EncryptedKeyMaterial {
            ciphertext: b64.encode(ciphertext),
            nonce: b64.encode(nonce),
            salt: b64.encode(salt),
        })
    }

    /// Decrypt stored material into a scoped signing guard.
    pub fn decrypt(&self, material: &EncryptedKeyMaterial) -> Result<SigningKey> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let ciphertext = b64.decode(&material.ciphertext)?;
        let nonce_bytes = b64.decode(&material.nonce)?;
        let salt = b64.decode(&material.salt)?;

        let derived = derive_key(&self.master_secret, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived));
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_slice())
            .map_err(|e| anyhow!("Key decryption failed: {:?}", e))?;
        if plaintext.len() != 64 {
            return Err(anyhow!("Decrypted key has unexpected length {}", plaintext.len()));
        }

        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&plaintext);
        Ok(SigningKey { bytes })
    }
}

fn derive_key(secret: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    // 100k iterations per OWASP guidance for PBKDF2-HMAC-SHA256.
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, 100_000, &mut key);
    key
}

fn generate_salt() -> [u8; 32] {
    let n1 = Aes256Gcm::generate_nonce(&mut OsRng);
    let n2 = Aes256Gcm::generate_nonce(&mut OsRng);
    let n3 = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut salt = [0u8; 32];
    salt[0..12].copy_from_slice(&n1);
    salt[12..24].copy_from_slice(&n2);
    salt[24..32].copy_from_slice(&n3[0..8]);
    salt
}
