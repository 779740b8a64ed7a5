//! Admin device binding: first-admin-wins fingerprint lock plus the
//! in-process verified-admin set the dispatcher authorizes against.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{ConnectionId, Fingerprint};
use crate::store::MemoryStore;
use crate::{Error, Result};

pub struct AdminAuthority {
    lock_enabled: bool,
    memory: Arc<MemoryStore>,
    verified: DashMap<ConnectionId, Fingerprint>,
}

impl AdminAuthority {
    #[must_use]
    pub fn new(lock_enabled: bool, memory: Arc<MemoryStore>) -> Self {
        Self {
            lock_enabled,
            memory,
            verified: DashMap::new(),
        }
    }

    /// Register a connection as an admin device.
    ///
    /// With the fingerprint lock on, the first fingerprint ever presented is
    /// persisted (encrypted) and all later devices must match it. Callers
    /// answer a failure with `admin-auth-result {success:false}` and a
    /// delayed disconnect.
    pub fn register(&self, connection: ConnectionId, fingerprint: Fingerprint) -> Result<()> {
        if fingerprint.is_empty() {
            return Err(Error::Validation("Fingerprint must not be empty".to_string()));
        }

        if self.lock_enabled {
            match self.memory.admin_fingerprint()? {
                None => {
                    self.memory.set_admin_fingerprint(&fingerprint)?;
                    info!(connection = %connection, "First admin device bound");
                }
                Some(stored) if stored == fingerprint => {}
                Some(_) => {
                    warn!(connection = %connection, "Rejected unknown admin device");
                    return Err(Error::Auth(
                        "Unauthorized device: this server is bound to a different admin"
                            .to_string(),
                    ));
                }
            }
        }

        self.verified.insert(connection, fingerprint);
        Ok(())
    }

    #[must_use]
    pub fn is_verified(&self, connection: &ConnectionId) -> bool {
        self.verified.contains_key(connection)
    }

    #[must_use]
    pub fn fingerprint_of(&self, connection: &ConnectionId) -> Option<Fingerprint> {
        self.verified.get(connection).map(|e| e.value().clone())
    }

    /// Drop a connection from the verified set (on disconnect).
    pub fn unregister(&self, connection: &ConnectionId) {
        self.verified.remove(connection);
    }

    #[must_use]
    pub fn verified_count(&self) -> usize {
        self.verified.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest;
    use tempfile::TempDir;

    fn memory(dir: &TempDir) -> Arc<MemoryStore> {
        let key: [u8; 32] = sha2::Sha256::digest(b"admin-test").into();
        Arc::new(MemoryStore::open(dir.path().join("memory.json"), &key).expect("open"))
    }

    #[test]
    fn first_admin_wins_under_lock() {
        let dir = TempDir::new().expect("tempdir");
        let mem = memory(&dir);
        let authority = AdminAuthority::new(true, mem.clone());

        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        authority
            .register(c1.clone(), Fingerprint::from("F1"))
            .expect("first admin");
        assert!(authority.is_verified(&c1));

        let err = authority
            .register(c2.clone(), Fingerprint::from("F2"))
            .expect_err("second device");
        assert!(matches!(err, Error::Auth(_)));
        assert!(!authority.is_verified(&c2));

        // Same device on a new connection is fine.
        authority
            .register(c2.clone(), Fingerprint::from("F1"))
            .expect("same device");
        assert!(authority.is_verified(&c2));

        // The memory file holds F1, encrypted.
        assert_eq!(
            mem.admin_fingerprint().expect("decrypt"),
            Some(Fingerprint::from("F1"))
        );
    }

    #[test]
    fn lock_off_accepts_any_device() {
        let dir = TempDir::new().expect("tempdir");
        let authority = AdminAuthority::new(false, memory(&dir));
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        authority
            .register(c1, Fingerprint::from("F1"))
            .expect("first");
        authority
            .register(c2, Fingerprint::from("F2"))
            .expect("second");
    }

    #[test]
    fn unregister_removes_verification() {
        let dir = TempDir::new().expect("tempdir");
        let authority = AdminAuthority::new(false, memory(&dir));
        let conn = ConnectionId::new();
        authority
            .register(conn.clone(), Fingerprint::from("F1"))
            .expect("register");
        authority.unregister(&conn);
        assert!(!authority.is_verified(&conn));
    }

    #[test]
    fn empty_fingerprint_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let authority = AdminAuthority::new(true, memory(&dir));
        assert!(authority
            .register(ConnectionId::new(), Fingerprint::from(""))
            .is_err());
    }
}
