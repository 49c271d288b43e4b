//! Change notifications.
//!
//! Every observable mutation of a CA produces a [`CaEvent`] that is
//! dispatched synchronously to the subscribed listeners, in subscription
//! order, after the change has been persisted.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ca_manager::events::{CaEvent, EventBus};
//!
//! let bus = EventBus::new();
//! let handle = bus.subscribe(Arc::new(|event: &CaEvent| {
//!     tracing::info!(property = ?event.property(), "CA changed");
//!     Ok(())
//! }));
//! bus.unsubscribe(handle);
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{CaError, ListenerError, Result};
use crate::properties::{CertificateRequestProperties, CrlProperties, IssuedCertificateProperties};
use crate::signature_algorithm::SignatureAlgorithm;
use crate::template::CertificateKeyPairTemplate;

/// Named, observable properties of a CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaProperty {
    Unlock,
    Description,
    SignatureAlgorithm,
    ExpiryDays,
    IncrementalSerial,
    EnableLog,
    Requests,
    Issued,
    Revoked,
    Crls,
    Templates,
}

/// A change of one property. Scalar events carry the old and new value,
/// collection events the full updated listing.
#[derive(Debug, Clone, PartialEq)]
pub enum CaEvent {
    /// Values are the locked flag: unlocking goes from `true` to `false`.
    LockChanged { old: bool, new: bool },
    DescriptionChanged { old: String, new: String },
    SignatureAlgorithmChanged {
        old: SignatureAlgorithm,
        new: SignatureAlgorithm,
    },
    ExpiryDaysChanged { old: i64, new: i64 },
    IncrementalSerialChanged { old: bool, new: bool },
    EnableLogChanged { old: bool, new: bool },
    RequestsChanged(Vec<CertificateRequestProperties>),
    IssuedChanged(Vec<IssuedCertificateProperties>),
    RevokedChanged(Vec<IssuedCertificateProperties>),
    CrlsChanged(Vec<CrlProperties>),
    TemplatesChanged(Vec<CertificateKeyPairTemplate>),
}

impl CaEvent {
    pub fn property(&self) -> CaProperty {
        match self {
            Self::LockChanged { .. } => CaProperty::Unlock,
            Self::DescriptionChanged { .. } => CaProperty::Description,
            Self::SignatureAlgorithmChanged { .. } => CaProperty::SignatureAlgorithm,
            Self::ExpiryDaysChanged { .. } => CaProperty::ExpiryDays,
            Self::IncrementalSerialChanged { .. } => CaProperty::IncrementalSerial,
            Self::EnableLogChanged { .. } => CaProperty::EnableLog,
            Self::RequestsChanged(_) => CaProperty::Requests,
            Self::IssuedChanged(_) => CaProperty::Issued,
            Self::RevokedChanged(_) => CaProperty::Revoked,
            Self::CrlsChanged(_) => CaProperty::Crls,
            Self::TemplatesChanged(_) => CaProperty::Templates,
        }
    }
}

pub type Listener = Arc<dyn Fn(&CaEvent) -> std::result::Result<(), ListenerError> + Send + Sync>;

/// Token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(SubscriptionHandle, Listener)>,
}

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Listeners>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Listener) -> SubscriptionHandle {
        let mut listeners = self.listeners.write();
        listeners.next_id += 1;
        let handle = SubscriptionHandle(listeners.next_id);
        listeners.entries.push((handle, listener));
        handle
    }

    /// Returns `false` when the handle was not subscribed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.entries.len();
        listeners.entries.retain(|(h, _)| *h != handle);
        listeners.entries.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().entries.len()
    }

    /// Delivers `events` in order to every listener. All listeners see all
    /// events; the first listener failure is returned afterwards.
    pub fn emit(&self, events: &[CaEvent]) -> Result<()> {
        // Snapshot so a listener may subscribe or unsubscribe while handling
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        let mut first_error = None;
        for event in events {
            for listener in &listeners {
                if let Err(e) = listener(event) {
                    warn!(property = ?event.property(), error = %e, "change listener failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(CaError::Listener(e)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_dispatch_in_order_and_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = bus.subscribe(Arc::new(move |event: &CaEvent| {
            sink.lock().push(event.property());
            Ok(())
        }));

        bus.emit(&[
            CaEvent::IssuedChanged(Vec::new()),
            CaEvent::RevokedChanged(Vec::new()),
        ])
        .unwrap();
        assert_eq!(*seen.lock(), vec![CaProperty::Issued, CaProperty::Revoked]);

        assert!(bus.unsubscribe(handle));
        assert!(!bus.unsubscribe(handle));
        bus.emit(&[CaEvent::CrlsChanged(Vec::new())]).unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_listener_error_reaches_caller_after_all_listeners_ran() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(0));
        bus.subscribe(Arc::new(|_: &CaEvent| Err("boom".into())));
        let counter = Arc::clone(&calls);
        bus.subscribe(Arc::new(move |_: &CaEvent| {
            *counter.lock() += 1;
            Ok(())
        }));

        let err = bus
            .emit(&[CaEvent::LockChanged {
                old: true,
                new: false,
            }])
            .unwrap_err();
        assert!(matches!(err, CaError::Listener(_)));
        assert_eq!(*calls.lock(), 1);
    }
}
