//! Client certificates generated on demand, one per origin.

use crate::{
    error::{Error, Result},
    identity::Identity,
    url::Origin,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{io, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

/// How long a transient certificate is reused before a new one is generated.
pub const MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Where the client gets a certificate when a server asks for one.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// A certificate for `origin`, reused or freshly generated.
    async fn get(&self, origin: &Origin) -> Result<Arc<Identity>>;

    /// Forget the certificate for `origin`. Returns whether there was one.
    async fn delete(&self, origin: &Origin) -> bool;
}

struct Entry {
    created_at: Instant,
    identity: Arc<Identity>,
}

/// In-memory store of short-lived self-signed certificates.
///
/// Each origin gets its own certificate, never shared with another origin
/// and never kept past [`MAX_AGE`] (or the age given to
/// [`TransientCertStore::with_max_age`]). Access to one origin is serialized,
/// so concurrent requests to the same origin end up with the same
/// certificate. Nothing is persisted.
#[derive(Clone)]
pub struct TransientCertStore {
    entries: Arc<DashMap<Origin, Arc<Mutex<Option<Entry>>>>>,
    max_age: Duration,
}

impl Default for TransientCertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransientCertStore {
    /// A store reusing certificates for [`MAX_AGE`].
    pub fn new() -> Self {
        Self::with_max_age(MAX_AGE)
    }

    /// A store reusing certificates for `max_age`.
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_age,
        }
    }

    fn slot(&self, origin: &Origin) -> Arc<Mutex<Option<Entry>>> {
        self.entries.entry(origin.clone()).or_default().value().clone()
    }

    /// Drop slots nobody is using that are empty or hold an expired
    /// certificate.
    fn prune(&self) {
        self.entries.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(entry) => match &*entry {
                    Some(entry) => entry.created_at.elapsed() < self.max_age,
                    None => false,
                },
                Err(_) => true,
            }
        });
    }

    async fn generate(&self) -> Result<Identity> {
        // the certificate outlives the reuse window a little so it is never
        // presented expired
        let validity = self.max_age + Duration::from_secs(60 * 60);
        tokio::task::spawn_blocking(move || Identity::self_signed(&[], validity))
            .await
            .map_err(|err| Error::Io(io::Error::other(err)))?
    }
}

#[async_trait]
impl CertificateStore for TransientCertStore {
    async fn get(&self, origin: &Origin) -> Result<Arc<Identity>> {
        self.prune();
        let slot = self.slot(origin);
        let mut entry = slot.lock().await;

        if let Some(existing) = entry.as_ref() {
            if existing.created_at.elapsed() < self.max_age {
                return Ok(existing.identity.clone());
            }
            debug!(%origin, "transient certificate expired");
            *entry = None;
        }

        let identity = Arc::new(self.generate().await?);
        debug!(%origin, fingerprint = ?identity.fingerprint(), "generated transient certificate");
        *entry = Some(Entry {
            created_at: Instant::now(),
            identity: identity.clone(),
        });

        Ok(identity)
    }

    async fn delete(&self, origin: &Origin) -> bool {
        let Some(slot) = self.entries.get(origin).map(|slot| slot.value().clone()) else {
            return false;
        };
        let removed = slot.lock().await.take().is_some();
        drop(slot);
        self.entries
            .remove_if(origin, |_, slot| Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|entry| entry.is_none()));
        if removed {
            debug!(%origin, "deleted transient certificate");
        }
        removed
    }
}
