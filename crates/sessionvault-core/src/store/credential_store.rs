use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::crypto::{random_bytes, EncryptionKey, SALT_SIZE};
use super::StoreError;
use crate::auth::EncryptionSecret;

/// Store file name in the data directory
pub const STORE_FILE: &str = "session.vault";

/// Record name under which the serialized session lives
pub const SESSION_KEY: &str = "auth-session";

const FORMAT_VERSION: u32 = 1;

/// Extension of the advisory lock file next to the store
const LOCK_EXTENSION: &str = "vault.lock";

/// One sealed value as it sits on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub key_id: String,
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    salt: String,
    records: BTreeMap<String, EncryptedRecord>,
}

/// Encrypted key/value store backed by a single file.
///
/// Every operation holds a process-local mutex and an exclusive advisory
/// lock on `session.vault.lock`, so the session host and maintenance
/// commands running in other processes never interleave writes.
/// Values are replaced by writing a temp file and renaming it over the
/// store, so a crash leaves either the old or the new file.
pub struct CredentialStore {
    path: PathBuf,
    salt: [u8; SALT_SIZE],
    key: EncryptionKey,
    lock: Mutex<()>,
    lock_file: File,
}

/// Held for the duration of one store operation.
struct StoreGuard<'a> {
    _local: MutexGuard<'a, ()>,
    file: &'a File,
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            warn!(error = %e, "Failed to release store lock");
        }
    }
}

impl CredentialStore {
    /// Open the store at `path`, creating it if missing, and derive the key.
    ///
    /// A corrupt existing file is left in place; it reads as empty and is
    /// replaced by the next write.
    pub fn open(
        path: impl Into<PathBuf>,
        secret: &EncryptionSecret,
        key_id: &str,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.with_extension(LOCK_EXTENSION))?;
        FileExt::lock_exclusive(&lock_file)?;

        let (salt, fresh) = match Self::read_file(&path) {
            Ok(Some(file)) => match Self::decode_salt(&file.salt) {
                Some(salt) => (salt, false),
                None => {
                    warn!(path = ?path, "Store salt unreadable, treating store as empty");
                    (random_bytes::<SALT_SIZE>(), false)
                }
            },
            Ok(None) => (random_bytes::<SALT_SIZE>(), true),
            Err(e) => {
                warn!(path = ?path, error = %e, "Store file corrupt, treating store as empty");
                (random_bytes::<SALT_SIZE>(), false)
            }
        };

        let created = if fresh {
            Self::write_records(&path, &salt, &BTreeMap::new()).map(|()| true)
        } else {
            Ok(false)
        };
        FileExt::unlock(&lock_file)?;
        if created? {
            debug!(path = ?path, "Created credential store");
        }

        let key = EncryptionKey::derive(secret, &salt, key_id)?;
        Ok(Self {
            path,
            salt,
            key,
            lock: Mutex::new(()),
            lock_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decrypt a value. Anything other than a clean decrypt is `None`.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        let records = match self.guard() {
            Ok(_guard) => self.load_records(),
            Err(e) => {
                warn!(error = %e, "Could not lock credential store");
                return None;
            }
        };
        let record = records.get(name)?;
        self.decrypt(name, record)
    }

    fn decrypt(&self, name: &str, record: &EncryptedRecord) -> Option<Vec<u8>> {
        if record.key_id != self.key.key_id() {
            warn!(record = name, key_id = %record.key_id, "Record sealed under another key, ignoring");
            return None;
        }

        let nonce = BASE64.decode(&record.nonce).ok();
        let ciphertext = BASE64.decode(&record.ciphertext).ok();
        let (Some(nonce), Some(ciphertext)) = (nonce, ciphertext) else {
            warn!(record = name, "Record encoding corrupt, ignoring");
            return None;
        };

        match self.key.open(name, &nonce, &ciphertext) {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                warn!(record = name, error = %e, "Record failed to decrypt, ignoring");
                None
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Encrypt and atomically store a value.
    pub fn set(&self, name: &str, value: &[u8]) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        let mut records = self.load_records();
        self.insert_record(&mut records, name, value)?;
        self.write_file(&records)
    }

    /// Overwrite a value only if a readable one is still stored.
    ///
    /// Returns `false`, writing nothing, when the value has been removed in
    /// the meantime (possibly by another process).
    pub fn replace(&self, name: &str, value: &[u8]) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        let mut records = self.load_records();
        let present = records
            .get(name)
            .is_some_and(|record| self.decrypt(name, record).is_some());
        if !present {
            return Ok(false);
        }
        self.insert_record(&mut records, name, value)?;
        self.write_file(&records)?;
        Ok(true)
    }

    fn insert_record(
        &self,
        records: &mut BTreeMap<String, EncryptedRecord>,
        name: &str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        let (nonce, ciphertext) = self.key.seal(name, value)?;
        records.insert(
            name.to_string(),
            EncryptedRecord {
                key_id: self.key.key_id().to_string(),
                nonce: BASE64.encode(nonce),
                ciphertext: BASE64.encode(ciphertext),
            },
        );
        Ok(())
    }

    /// Remove a value. Removing a missing value succeeds.
    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        let mut records = self.load_records();
        let existed = records.remove(name).is_some();
        if existed || !self.file_is_clean() {
            self.write_file(&records)?;
        }
        Ok(())
    }

    fn guard(&self) -> Result<StoreGuard<'_>, StoreError> {
        let local = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        FileExt::lock_exclusive(&self.lock_file)?;
        Ok(StoreGuard {
            _local: local,
            file: &self.lock_file,
        })
    }

    /// Records readable with the current salt; corrupt files read as empty.
    fn load_records(&self) -> BTreeMap<String, EncryptedRecord> {
        match Self::read_file(&self.path) {
            Ok(Some(file)) if Self::decode_salt(&file.salt) == Some(self.salt) => file.records,
            Ok(Some(_)) => {
                warn!(path = ?self.path, "Store salt changed underneath us, treating store as empty");
                BTreeMap::new()
            }
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Store file corrupt, treating store as empty");
                BTreeMap::new()
            }
        }
    }

    fn file_is_clean(&self) -> bool {
        matches!(Self::read_file(&self.path), Ok(Some(ref file)) if Self::decode_salt(&file.salt) == Some(self.salt))
            || !self.path.exists()
    }

    fn read_file(path: &Path) -> Result<Option<StoreFile>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read(path)?;
        let file: StoreFile = serde_json::from_slice(&contents)?;
        Ok(Some(file))
    }

    fn decode_salt(encoded: &str) -> Option<[u8; SALT_SIZE]> {
        BASE64.decode(encoded).ok()?.try_into().ok()
    }

    fn write_file(&self, records: &BTreeMap<String, EncryptedRecord>) -> Result<(), StoreError> {
        Self::write_records(&self.path, &self.salt, records)
    }

    fn write_records(
        path: &Path,
        salt: &[u8; SALT_SIZE],
        records: &BTreeMap<String, EncryptedRecord>,
    ) -> Result<(), StoreError> {
        let file = StoreFile {
            version: FORMAT_VERSION,
            salt: BASE64.encode(salt),
            records: records.clone(),
        };
        let contents = serde_json::to_vec(&file)?;

        let temp_path = path.with_extension("vault.tmp");
        let mut temp = fs::File::create(&temp_path)?;
        temp.write_all(&contents)?;
        temp.sync_all()?;
        drop(temp);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            if let Err(e) = fs::set_permissions(&temp_path, perms) {
                warn!(path = ?temp_path, error = %e, "Failed to set file permissions to 0600");
            }
        }

        fs::rename(&temp_path, path)?;
        debug!(path = ?path, records = records.len(), "Credential store written");
        Ok(())
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("key", &self.key)
            .finish()
    }
}
