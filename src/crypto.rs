use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use std::path::Path;
use tracing::{info, warn};

const KEY_FILE: &str = "queue.key";

/// Шифрование payload очереди перед сохранением в SQLite (AES-256-GCM).
/// Evidence frames and time logs sit on disk until delivered, so they are never stored in clear.
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl PayloadCipher {
    /// Key source, first match wins: `HUBNITY_ENCRYPTION_KEY` (hex), `<data_dir>/queue.key`
    /// (created on first run), otherwise an ephemeral key for in-memory databases.
    pub fn new(data_dir: Option<&Path>) -> Result<Self, String> {
        if let Some(key) = std::env::var("HUBNITY_ENCRYPTION_KEY")
            .ok()
            .and_then(|k| hex::decode(k).ok())
        {
            return Self::from_key(&key);
        }

        match data_dir {
            Some(dir) => {
                let path = dir.join(KEY_FILE);
                if path.exists() {
                    let hex_key = std::fs::read_to_string(&path)
                        .map_err(|e| format!("Failed to read key file: {}", e))?;
                    let key = hex::decode(hex_key.trim())
                        .map_err(|e| format!("Corrupted key file: {}", e))?;
                    Self::from_key(&key)
                } else {
                    let key = Self::random_key();
                    std::fs::write(&path, hex::encode(key))
                        .map_err(|e| format!("Failed to write key file: {}", e))?;
                    info!("[CRYPTO] Generated new queue key at {}", path.display());
                    Self::from_key(&key)
                }
            }
            None => {
                warn!("[CRYPTO] No data dir, using ephemeral key (queue will not survive restart)");
                Self::from_key(&Self::random_key())
            }
        }
    }

    pub fn from_key(key: &[u8]) -> Result<Self, String> {
        if key.len() != 32 {
            return Err("Encryption key must be 32 bytes".to_string());
        }
        let key_array: [u8; 32] = key
            .try_into()
            .map_err(|_| "Failed to convert key to array".to_string())?;
        Ok(Self {
            cipher: Aes256Gcm::new(&key_array.into()),
        })
    }

    fn random_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// nonce (12 bytes) + ciphertext, base64
    pub fn encrypt(&self, plaintext: &str) -> Result<String, String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| format!("Encryption failed: {}", e))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(&result))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, String> {
        let data = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| format!("Base64 decode failed: {}", e))?;

        if data.len() < 12 {
            return Err("Invalid encrypted data length".to_string());
        }

        let nonce = Nonce::from_slice(&data[..12]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &data[12..])
            .map_err(|e| format!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| format!("UTF-8 decode failed: {}", e))
    }
}
