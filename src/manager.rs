//! Registry of open certificate authorities.
//!
//! The [`CertificateAuthorityManager`] opens and creates CAs, refuses to
//! open the same directory twice and forwards the change events of every
//! managed CA to manager-level listeners tagged with the CA id.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use ca_manager::events::CaEvent;
//! use ca_manager::manager::CertificateAuthorityManager;
//! use uuid::Uuid;
//!
//! # fn main() -> ca_manager::Result<()> {
//! let manager = CertificateAuthorityManager::new();
//! manager.subscribe(Arc::new(|id: Uuid, event: &CaEvent| {
//!     tracing::info!(ca = %id, property = ?event.property(), "CA changed");
//!     Ok(())
//! }));
//!
//! let ca = manager.open(Path::new("/srv/pki/home-ca"))?;
//! ca.lock().unlock("passphrase")?;
//! # Ok(())
//! # }
//! ```
//!
//! Listeners run while the CA mutex is held by the caller; a listener must
//! not lock the same CA again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::authority::CertificateAuthority;
use crate::certificate_factory::IssuedCertificate;
use crate::error::{CaError, ListenerError, Result};
use crate::events::{CaEvent, Listener, SubscriptionHandle};
use crate::storage::validate_base_path;

pub type SharedAuthority = Arc<Mutex<CertificateAuthority>>;

/// Listener over all managed CAs.
pub type ManagerListener =
    Arc<dyn Fn(Uuid, &CaEvent) -> std::result::Result<(), ListenerError> + Send + Sync>;

/// Token returned by [`CertificateAuthorityManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerSubscription(u64);

type ManagerListeners = Arc<RwLock<Vec<(ManagerSubscription, ManagerListener)>>>;

struct Entry {
    id: Uuid,
    authority: SharedAuthority,
    forwarder: SubscriptionHandle,
    external: Vec<SubscriptionHandle>,
}

#[derive(Default)]
pub struct CertificateAuthorityManager {
    authorities: RwLock<HashMap<PathBuf, Entry>>,
    listeners: ManagerListeners,
    next_subscription: AtomicU64,
}

impl CertificateAuthorityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the CA in `path`. A directory that is already open in this
    /// manager is an I/O failure.
    pub fn open(&self, path: &Path) -> Result<SharedAuthority> {
        let base = self.check_not_open(path)?;
        let authority = CertificateAuthority::open(&base)?;
        self.register(base, authority)
    }

    /// Creates a CA in `path` and registers it.
    pub fn create(
        &self,
        path: &Path,
        issued: IssuedCertificate,
        passphrase: &str,
        description: &str,
    ) -> Result<SharedAuthority> {
        let base = self.check_not_open(path)?;
        let authority = CertificateAuthority::create(&base, issued, passphrase, description)?;
        self.register(base, authority)
    }

    fn check_not_open(&self, path: &Path) -> Result<PathBuf> {
        let base = validate_base_path(path)?;
        if self.authorities.read().contains_key(&base) {
            return Err(CaError::io(format!(
                "certificate authority in {} is already open",
                base.display()
            )));
        }
        Ok(base)
    }

    fn register(&self, base: PathBuf, authority: CertificateAuthority) -> Result<SharedAuthority> {
        let id = authority.id();
        let listeners = Arc::clone(&self.listeners);
        let forwarder = authority.subscribe(Arc::new(move |event: &CaEvent| {
            let snapshot: Vec<ManagerListener> =
                listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
            let mut first_error = None;
            for listener in snapshot {
                if let Err(e) = listener(id, event) {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        }));

        let shared = Arc::new(Mutex::new(authority));
        let mut authorities = self.authorities.write();
        if authorities.contains_key(&base) {
            return Err(CaError::io(format!(
                "certificate authority in {} is already open",
                base.display()
            )));
        }
        authorities.insert(
            base.clone(),
            Entry {
                id,
                authority: Arc::clone(&shared),
                forwarder,
                external: Vec::new(),
            },
        );
        info!(ca = %id, path = %base.display(), "added certificate authority to manager");
        Ok(shared)
    }

    pub fn get(&self, id: Uuid) -> Option<SharedAuthority> {
        self.authorities
            .read()
            .values()
            .find(|e| e.id == id)
            .map(|e| Arc::clone(&e.authority))
    }

    pub fn get_by_path(&self, path: &Path) -> Option<SharedAuthority> {
        let base = std::fs::canonicalize(path).ok()?;
        self.authorities
            .read()
            .get(&base)
            .map(|e| Arc::clone(&e.authority))
    }

    /// Ids and directories of the managed CAs, ordered by directory.
    pub fn list(&self) -> Vec<(Uuid, PathBuf)> {
        let mut list: Vec<(Uuid, PathBuf)> = self
            .authorities
            .read()
            .iter()
            .map(|(path, e)| (e.id, path.clone()))
            .collect();
        list.sort_by(|a, b| a.1.cmp(&b.1));
        list
    }

    pub fn len(&self) -> usize {
        self.authorities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.authorities.read().is_empty()
    }

    /// Locks and forgets the CA `id`. Its files stay on disk.
    pub fn remove(&self, id: Uuid) -> Result<Option<SharedAuthority>> {
        let entry = {
            let mut authorities = self.authorities.write();
            let Some(path) = authorities
                .iter()
                .find(|(_, e)| e.id == id)
                .map(|(p, _)| p.clone())
            else {
                return Ok(None);
            };
            authorities.remove(&path)
        };
        let Some(entry) = entry else {
            return Ok(None);
        };

        let mut authority = entry.authority.lock();
        authority.unsubscribe(entry.forwarder);
        for handle in &entry.external {
            authority.unsubscribe(*handle);
        }
        let locked = authority.lock();
        drop(authority);
        info!(ca = %id, "removed certificate authority from manager");
        locked.map(|_| Some(entry.authority))
    }

    // ---- aggregated listeners ---------------------------------------------

    pub fn subscribe(&self, listener: ManagerListener) -> ManagerSubscription {
        let handle = ManagerSubscription(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((handle, listener));
        handle
    }

    pub fn unsubscribe(&self, handle: ManagerSubscription) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        listeners.len() != before
    }

    // ---- per-CA listeners -------------------------------------------------

    /// Subscribes `listener` to the CA `id` on behalf of a collaborator.
    ///
    /// The registry lock is never held while waiting for the CA mutex.
    pub fn add_listener(&self, id: Uuid, listener: Listener) -> Result<SubscriptionHandle> {
        let authority = self
            .get(id)
            .ok_or_else(|| CaError::not_found(format!("certificate authority {id}")))?;
        let guard = authority.lock();
        let handle = guard.subscribe(listener);

        let mut authorities = self.authorities.write();
        match authorities
            .values_mut()
            .find(|e| e.id == id && Arc::ptr_eq(&e.authority, &authority))
        {
            Some(entry) => {
                entry.external.push(handle);
                debug!(ca = %id, listeners = entry.external.len(), "added listener");
                Ok(handle)
            }
            None => {
                // Removed from the manager in the meantime
                guard.unsubscribe(handle);
                Err(CaError::not_found(format!("certificate authority {id}")))
            }
        }
    }

    /// Removes a collaborator listener. Removing the last one locks the CA.
    pub fn remove_listener(&self, id: Uuid, handle: SubscriptionHandle) -> Result<()> {
        let (authority, last) = {
            let mut authorities = self.authorities.write();
            let entry = authorities
                .values_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| CaError::not_found(format!("certificate authority {id}")))?;
            let before = entry.external.len();
            entry.external.retain(|h| *h != handle);
            if entry.external.len() == before {
                return Err(CaError::not_found(format!("listener on {id}")));
            }
            (Arc::clone(&entry.authority), entry.external.is_empty())
        };

        let mut authority = authority.lock();
        authority.unsubscribe(handle);
        if last {
            info!(ca = %id, "last listener removed, locking");
            authority.lock()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::{Duration, OffsetDateTime};

    use crate::certificate_factory::generate_self_signed_certificate;
    use crate::events::CaProperty;
    use crate::key_pair_factory::{generate_key_pair, KeyType};

    fn root_bundle() -> IssuedCertificate {
        let key = generate_key_pair(KeyType::EcP256).unwrap();
        let now = OffsetDateTime::now_utc();
        let cert = generate_self_signed_certificate(
            "CN=Managed CA",
            now,
            now + Duration::days(1),
            &key,
            None,
            true,
            None,
        )
        .unwrap();
        IssuedCertificate::new(cert.clone(), Some(key), vec![cert])
    }

    #[test]
    fn test_duplicate_open_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = CertificateAuthorityManager::new();
        let ca = manager.create(dir.path(), root_bundle(), "pw", "home").unwrap();
        let id = ca.lock().id();

        assert!(manager.open(dir.path()).unwrap_err().is_io_failure());
        assert!(manager
            .open(&dir.path().join("."))
            .unwrap_err()
            .is_io_failure());
        assert_eq!(manager.len(), 1);
        assert!(manager.get(id).is_some());
        assert!(manager.get_by_path(dir.path()).is_some());

        assert!(manager.remove(id).unwrap().is_some());
        assert!(manager.is_empty());
        let reopened = manager.open(dir.path()).unwrap();
        assert_eq!(reopened.lock().id(), id);
    }

    #[test]
    fn test_events_are_forwarded_with_ca_id() {
        let dir = TempDir::new().unwrap();
        let manager = CertificateAuthorityManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = manager.subscribe(Arc::new(move |id: Uuid, event: &CaEvent| {
            sink.lock().push((id, event.property()));
            Ok(())
        }));

        let ca = manager.create(dir.path(), root_bundle(), "pw", "home").unwrap();
        let id = ca.lock().id();
        ca.lock().unlock("pw").unwrap();
        assert_eq!(*seen.lock(), vec![(id, CaProperty::Unlock)]);

        assert!(manager.unsubscribe(subscription));
        ca.lock().lock().unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_removing_last_listener_locks_the_ca() {
        let dir = TempDir::new().unwrap();
        let manager = CertificateAuthorityManager::new();
        let ca = manager.create(dir.path(), root_bundle(), "pw", "").unwrap();
        let id = ca.lock().id();
        ca.lock().unlock("pw").unwrap();

        let first = manager.add_listener(id, Arc::new(|_: &CaEvent| Ok(()))).unwrap();
        let second = manager.add_listener(id, Arc::new(|_: &CaEvent| Ok(()))).unwrap();

        manager.remove_listener(id, first).unwrap();
        assert!(!ca.lock().is_locked());
        manager.remove_listener(id, second).unwrap();
        assert!(ca.lock().is_locked());
        assert!(matches!(
            manager.remove_listener(id, second),
            Err(CaError::NotFound(_))
        ));
    }

    #[test]
    fn test_add_listener_while_a_listener_reads_the_registry() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration as StdDuration;

        let dir = TempDir::new().unwrap();
        let manager = Arc::new(CertificateAuthorityManager::new());
        let ca = manager.create(dir.path(), root_bundle(), "pw", "").unwrap();
        let id = ca.lock().id();

        let (entered_tx, entered_rx) = mpsc::channel();
        let weak = Arc::downgrade(&manager);
        manager.subscribe(Arc::new(move |_: Uuid, _: &CaEvent| {
            let _ = entered_tx.send(());
            thread::sleep(StdDuration::from_millis(200));
            if let Some(manager) = weak.upgrade() {
                assert_eq!(manager.list().len(), 1);
            }
            Ok(())
        }));

        let (done_tx, done_rx) = mpsc::channel();
        let unlocking = {
            let ca = Arc::clone(&ca);
            let done = done_tx.clone();
            thread::spawn(move || {
                let result = ca.lock().unlock("pw");
                let _ = done.send(("unlock", result.is_ok()));
            })
        };
        entered_rx
            .recv_timeout(StdDuration::from_secs(5))
            .unwrap();
        let adding = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let result = manager.add_listener(id, Arc::new(|_: &CaEvent| Ok(())));
                let _ = done_tx.send(("add_listener", result.is_ok()));
            })
        };

        for _ in 0..2 {
            let (name, ok) = done_rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
            assert!(ok, "{name} failed");
        }
        unlocking.join().unwrap();
        adding.join().unwrap();
        assert!(!ca.lock().is_locked());
    }

    #[test]
    fn test_remove_locks_the_ca() {
        let dir = TempDir::new().unwrap();
        let manager = CertificateAuthorityManager::new();
        let ca = manager.create(dir.path(), root_bundle(), "pw", "").unwrap();
        let id = ca.lock().id();
        ca.lock().unlock("pw").unwrap();

        manager.remove(id).unwrap();
        assert!(ca.lock().is_locked());
        assert!(manager.remove(id).unwrap().is_none());
    }
}
