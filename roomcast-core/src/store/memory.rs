//! Memory file: encrypted admin fingerprint plus the plain client-name and
//! BSL-match maps, in one JSON document rewritten atomically on mutation.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::models::Fingerprint;
use crate::{Error, Result};

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Environment variable consulted first when sourcing the encryption key.
pub const KEY_ENV_VAR: &str = "ROOMCAST_MEMORY_KEY";

/// On-disk shape of the memory file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MemoryDoc {
    /// `hex(iv) ":" hex(tag) ":" hex(ciphertext)` holding the admin fingerprint.
    encrypted: Option<String>,
    client_names: HashMap<String, String>,
    /// fingerprint -> lowercase client file -> lowercase playlist file.
    bsl_matches: HashMap<String, HashMap<String, String>>,
}

/// Pre-migration shape: the whole document was one encrypted blob.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LegacyDoc {
    admin_fingerprint: Option<String>,
    client_names: HashMap<String, String>,
    bsl_matches: HashMap<String, HashMap<String, String>>,
}

impl Default for LegacyDoc {
    fn default() -> Self {
        Self {
            admin_fingerprint: None,
            client_names: HashMap::new(),
            bsl_matches: HashMap::new(),
        }
    }
}

/// Source the 32-byte memory-file key: environment variable (SHA-256 of its
/// value), then a key file next to the store, else a fresh key written to
/// that file on first boot.
pub fn load_or_create_key(key_file: &Path) -> Result<[u8; 32]> {
    if let Ok(value) = std::env::var(KEY_ENV_VAR) {
        if !value.is_empty() {
            let digest = Sha256::digest(value.as_bytes());
            return Ok(digest.into());
        }
    }

    if key_file.exists() {
        check_key_file_permissions(key_file);
        let raw = fs::read_to_string(key_file)?;
        let bytes = hex::decode(raw.trim())
            .map_err(|e| Error::Internal(format!("Corrupt key file: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Internal("Key file must hold 32 bytes".to_string()))?;
        return Ok(key);
    }

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    if let Some(parent) = key_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(key_file, hex::encode(key))?;
    restrict_key_file_permissions(key_file)?;
    info!(
        path = %key_file.display(),
        "Generated a new memory encryption key. Back this file up; losing it \
         invalidates the stored admin fingerprint."
    );
    Ok(key)
}

#[cfg(unix)]
fn restrict_key_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_key_file_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn check_key_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "Memory key file is readable by other users; expected 0600"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_key_file_permissions(_path: &Path) {}

/// Persistent store for the admin fingerprint (encrypted), client display
/// names, and remembered BSL matches.
pub struct MemoryStore {
    path: PathBuf,
    cipher: Aes256Gcm,
    doc: Mutex<MemoryDoc>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("path", &self.path)
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

impl MemoryStore {
    /// Open (or create) the memory file. A legacy fully-encrypted document
    /// is detected by a format probe and migrated to the split format.
    pub fn open(path: PathBuf, key: &[u8; 32]) -> Result<Self> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

        let doc = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            Self::parse_or_migrate(&raw, &cipher)?
        } else {
            MemoryDoc::default()
        };

        let store = Self {
            path,
            cipher,
            doc: Mutex::new(doc),
        };
        store.save()?;
        Ok(store)
    }

    fn parse_or_migrate(raw: &str, cipher: &Aes256Gcm) -> Result<MemoryDoc> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(MemoryDoc::default());
        }

        if let Ok(doc) = serde_json::from_str::<MemoryDoc>(trimmed) {
            // A legacy blob is not a JSON object, so reaching here means the
            // split format (possibly with all fields absent).
            if trimmed.starts_with('{') {
                return Ok(doc);
            }
        }

        if looks_like_blob(trimmed) {
            let plaintext = decrypt_blob(cipher, trimmed)?;
            let legacy: LegacyDoc = serde_json::from_slice(&plaintext)?;
            info!("Migrating legacy encrypted memory file to split format");
            let mut doc = MemoryDoc {
                encrypted: None,
                client_names: legacy.client_names,
                bsl_matches: legacy.bsl_matches,
            };
            if let Some(fp) = legacy.admin_fingerprint {
                doc.encrypted = Some(encrypt_blob(cipher, fp.as_bytes())?);
            }
            return Ok(doc);
        }

        Err(Error::Internal(
            "Memory file is neither the split format nor a legacy blob".to_string(),
        ))
    }

    /// Atomically rewrite the whole document.
    fn save(&self) -> Result<()> {
        let doc = self.doc.lock();
        let json = serde_json::to_string_pretty(&*doc)?;
        drop(doc);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Decrypted admin fingerprint, if one has been persisted.
    pub fn admin_fingerprint(&self) -> Result<Option<Fingerprint>> {
        let encrypted = self.doc.lock().encrypted.clone();
        match encrypted {
            None => Ok(None),
            Some(blob) => {
                let plaintext = decrypt_blob(&self.cipher, &blob)?;
                let fp = String::from_utf8(plaintext)
                    .map_err(|_| Error::Internal("Decrypted fingerprint is not UTF-8".into()))?;
                Ok(Some(Fingerprint::from_string(fp)))
            }
        }
    }

    pub fn set_admin_fingerprint(&self, fingerprint: &Fingerprint) -> Result<()> {
        let blob = encrypt_blob(&self.cipher, fingerprint.as_str().as_bytes())?;
        self.doc.lock().encrypted = Some(blob);
        self.save()
    }

    #[must_use]
    pub fn client_name(&self, fingerprint: &Fingerprint) -> Option<String> {
        self.doc
            .lock()
            .client_names
            .get(fingerprint.as_str())
            .cloned()
    }

    pub fn set_client_name(&self, fingerprint: &Fingerprint, name: &str) -> Result<()> {
        self.doc
            .lock()
            .client_names
            .insert(fingerprint.as_str().to_string(), name.to_string());
        self.save()
    }

    /// Remembered match for a client file (lowercase keys on both sides).
    #[must_use]
    pub fn bsl_match(&self, fingerprint: &Fingerprint, client_file: &str) -> Option<String> {
        self.doc
            .lock()
            .bsl_matches
            .get(fingerprint.as_str())
            .and_then(|m| m.get(&client_file.to_lowercase()))
            .cloned()
    }

    pub fn set_bsl_match(
        &self,
        fingerprint: &Fingerprint,
        client_file: &str,
        playlist_file: &str,
    ) -> Result<()> {
        self.doc
            .lock()
            .bsl_matches
            .entry(fingerprint.as_str().to_string())
            .or_default()
            .insert(client_file.to_lowercase(), playlist_file.to_lowercase());
        self.save()
    }
}

fn looks_like_blob(raw: &str) -> bool {
    let parts: Vec<&str> = raw.split(':').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_hexdigit()))
        && parts[0].len() == NONCE_SIZE * 2
        && parts[1].len() == TAG_SIZE * 2
}

/// Encrypt to the `hex(iv):hex(tag):hex(ct)` layout.
fn encrypt_blob(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<String> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut combined = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Internal(format!("Encryption failed: {e}")))?;
    // aes-gcm appends the tag to the ciphertext.
    let tag = combined.split_off(combined.len() - TAG_SIZE);

    Ok(format!(
        "{}:{}:{}",
        hex::encode(nonce_bytes),
        hex::encode(tag),
        hex::encode(combined)
    ))
}

fn decrypt_blob(cipher: &Aes256Gcm, blob: &str) -> Result<Vec<u8>> {
    let parts: Vec<&str> = blob.split(':').collect();
    if parts.len() != 3 {
        return Err(Error::Internal("Encrypted blob must have 3 parts".into()));
    }
    let iv = hex::decode(parts[0]).map_err(|e| Error::Internal(format!("Bad iv hex: {e}")))?;
    let tag = hex::decode(parts[1]).map_err(|e| Error::Internal(format!("Bad tag hex: {e}")))?;
    let mut ct = hex::decode(parts[2]).map_err(|e| Error::Internal(format!("Bad ct hex: {e}")))?;
    if iv.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
        return Err(Error::Internal("Encrypted blob has wrong iv/tag size".into()));
    }

    ct.extend_from_slice(&tag);
    cipher
        .decrypt(Nonce::from_slice(&iv), ct.as_ref())
        .map_err(|_| Error::Internal("Decryption failed (wrong key or corrupted data)".into()))
}
