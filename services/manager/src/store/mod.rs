//! Spec store: the source of truth for desired state.
//!
//! Holds services (as immutable, versioned [`ServiceVersion`]s) and secrets
//! (sealed at rest). Readers take a [`StoreSnapshot`] without locking; writers
//! serialize on a mutex, copy the current snapshot, apply their change and
//! publish the copy. A published snapshot is never modified.
//!
//! Every mutation is announced on a broadcast channel so the reconciler can
//! react without polling.

pub mod crypto;
pub mod validate;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use convoy_id::{SecretId, ServiceId, TaskId};
use convoy_reconcile::SpecHash;
use convoy_secrets::SecretPayload;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::model::{SecretMeta, ServiceSpec, ServiceVersion};
use crypto::{SealError, SealedSecret, SecretSealer};

const EVENT_CAPACITY: usize = 1024;

/// Errors surfaced to callers of the store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{kind} name '{name}' is already in use")]
    Conflict { kind: &'static str, name: String },

    #[error("secret '{name}' is in use by {} service(s) and {tasks} task(s)", .services.len())]
    InUse {
        name: String,
        /// Services whose current version references the secret.
        services: Vec<String>,
        tasks: usize,
    },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Seal(#[from] SealError),
}

impl StoreError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    fn service_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "service",
            id: id.to_string(),
        }
    }

    fn secret_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "secret",
            id: id.to_string(),
        }
    }
}

/// Change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    ServiceCreated { id: ServiceId, version: u64 },
    ServiceUpdated { id: ServiceId, version: u64 },
    ServiceDeleted { id: ServiceId },
    SecretCreated { id: SecretId },
    SecretDeleted { id: SecretId },
}

impl StoreEvent {
    /// Service affected by this event, if any.
    pub fn service_id(&self) -> Option<ServiceId> {
        match self {
            Self::ServiceCreated { id, .. }
            | Self::ServiceUpdated { id, .. }
            | Self::ServiceDeleted { id } => Some(*id),
            Self::SecretCreated { .. } | Self::SecretDeleted { .. } => None,
        }
    }
}

/// A service's current version and the one it replaced.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub current: Arc<ServiceVersion>,
    pub previous: Option<Arc<ServiceVersion>>,
}

#[derive(Debug)]
struct SecretRecord {
    meta: SecretMeta,
    sealed: SealedSecret,
}

/// Immutable view of the store at one revision.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    revision: u64,
    services: HashMap<ServiceId, ServiceRecord>,
    service_names: HashMap<String, ServiceId>,
    secrets: HashMap<SecretId, Arc<SecretRecord>>,
    secret_names: HashMap<String, SecretId>,
}

impl StoreSnapshot {
    /// Increases by one with every published change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn service(&self, id: &ServiceId) -> Option<&Arc<ServiceVersion>> {
        self.services.get(id).map(|r| &r.current)
    }

    pub fn service_record(&self, id: &ServiceId) -> Option<&ServiceRecord> {
        self.services.get(id)
    }

    pub fn service_by_name(&self, name: &str) -> Option<&Arc<ServiceVersion>> {
        self.service_names
            .get(name)
            .and_then(|id| self.service(id))
    }

    /// Current versions of all services, in no particular order.
    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceVersion>> {
        self.services.values().map(|r| &r.current)
    }

    pub fn secret(&self, id: &SecretId) -> Option<&SecretMeta> {
        self.secrets.get(id).map(|r| &r.meta)
    }

    pub fn secret_id(&self, name: &str) -> Option<SecretId> {
        self.secret_names.get(name).copied()
    }

    pub fn secrets(&self) -> impl Iterator<Item = &SecretMeta> {
        self.secrets.values().map(|r| &r.meta)
    }
}

/// The spec store.
pub struct SpecStore {
    snapshot: ArcSwap<StoreSnapshot>,

    /// Serializes writers. Readers never take it.
    writer: Mutex<()>,

    /// Non-terminal tasks holding each secret.
    pins: Mutex<HashMap<SecretId, BTreeSet<TaskId>>>,

    sealer: SecretSealer,
    events: broadcast::Sender<StoreEvent>,
}

impl SpecStore {
    pub fn new(sealer: SecretSealer) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            snapshot: ArcSwap::from_pointee(StoreSnapshot::default()),
            writer: Mutex::new(()),
            pins: Mutex::new(HashMap::new()),
            sealer,
            events,
        }
    }

    /// Current snapshot. Cheap; never blocks.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snapshot.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, current: &StoreSnapshot, apply: impl FnOnce(&mut StoreSnapshot)) {
        let mut next = current.clone();
        apply(&mut next);
        next.revision = current.revision + 1;
        self.snapshot.store(Arc::new(next));
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn build_version(
        snapshot: &StoreSnapshot,
        service_id: ServiceId,
        version: u64,
        spec: ServiceSpec,
    ) -> Result<ServiceVersion, StoreError> {
        validate::validate_spec(&spec)?;
        let secrets = validate::normalize_secrets(&spec.task_template.container.secrets, |name| {
            snapshot.secret_id(name)
        })?;

        let template_hash = SpecHash::of(&(&spec.task_template, &secrets))
            .map_err(|e| StoreError::validation("task_template", e.to_string()))?;

        Ok(ServiceVersion {
            service_id,
            version,
            spec,
            secrets,
            template_hash,
            created_at: Utc::now(),
        })
    }

    // =========================================================================
    // Services
    // =========================================================================

    pub async fn create_service(&self, spec: ServiceSpec) -> Result<Arc<ServiceVersion>, StoreError> {
        let _guard = self.writer.lock().await;
        let current = self.snapshot.load_full();

        if current.service_names.contains_key(&spec.name) {
            return Err(StoreError::Conflict {
                kind: "service",
                name: spec.name,
            });
        }

        let id = ServiceId::new();
        let version = Arc::new(Self::build_version(&current, id, 1, spec)?);

        self.publish(&current, |next| {
            next.service_names.insert(version.name().to_string(), id);
            next.services.insert(
                id,
                ServiceRecord {
                    current: version.clone(),
                    previous: None,
                },
            );
        });

        info!(service_id = %id, name = %version.name(), replicas = version.replicas(), "service created");
        self.emit(StoreEvent::ServiceCreated { id, version: 1 });
        Ok(version)
    }

    /// Publish a new version of an existing service.
    pub async fn update_service(
        &self,
        id: ServiceId,
        spec: ServiceSpec,
    ) -> Result<Arc<ServiceVersion>, StoreError> {
        let _guard = self.writer.lock().await;
        let current = self.snapshot.load_full();

        let record = current
            .services
            .get(&id)
            .ok_or_else(|| StoreError::service_not_found(id))?;

        if record.current.name() != spec.name {
            return Err(StoreError::validation("name", "services cannot be renamed"));
        }

        let number = record.current.version + 1;
        let version = Arc::new(Self::build_version(&current, id, number, spec)?);
        let previous = record.current.clone();

        self.publish(&current, |next| {
            next.services.insert(
                id,
                ServiceRecord {
                    current: version.clone(),
                    previous: Some(previous),
                },
            );
        });

        info!(service_id = %id, version = number, replicas = version.replicas(), "service updated");
        self.emit(StoreEvent::ServiceUpdated {
            id,
            version: number,
        });
        Ok(version)
    }

    pub async fn delete_service(&self, id: ServiceId) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let current = self.snapshot.load_full();

        let name = current
            .service(&id)
            .map(|v| v.name().to_string())
            .ok_or_else(|| StoreError::service_not_found(id))?;

        self.publish(&current, |next| {
            next.services.remove(&id);
            next.service_names.remove(&name);
        });

        info!(service_id = %id, %name, "service deleted");
        self.emit(StoreEvent::ServiceDeleted { id });
        Ok(())
    }

    pub fn get_service(&self, id: &ServiceId) -> Result<Arc<ServiceVersion>, StoreError> {
        self.snapshot()
            .service(id)
            .cloned()
            .ok_or_else(|| StoreError::service_not_found(id))
    }

    /// Look a service up by ID or by name.
    pub fn find_service(&self, id_or_name: &str) -> Result<Arc<ServiceVersion>, StoreError> {
        let snapshot = self.snapshot();
        let found = match id_or_name.parse::<ServiceId>() {
            Ok(id) => snapshot.service(&id),
            Err(_) => snapshot.service_by_name(id_or_name),
        };
        found
            .cloned()
            .ok_or_else(|| StoreError::service_not_found(id_or_name))
    }

    /// All services, ordered by name.
    pub fn list_services(&self) -> Vec<Arc<ServiceVersion>> {
        let snapshot = self.snapshot();
        let mut services: Vec<_> = snapshot.services().cloned().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    // =========================================================================
    // Secrets
    // =========================================================================

    pub async fn create_secret(
        &self,
        name: String,
        data: Vec<u8>,
        labels: BTreeMap<String, String>,
    ) -> Result<SecretMeta, StoreError> {
        validate::validate_name("name", &name)?;
        let payload =
            SecretPayload::new(data).map_err(|e| StoreError::validation("data", e.to_string()))?;

        let _guard = self.writer.lock().await;
        let current = self.snapshot.load_full();

        if current.secret_names.contains_key(&name) {
            return Err(StoreError::Conflict {
                kind: "secret",
                name,
            });
        }

        let id = SecretId::new();
        let sealed = self.sealer.seal(&payload, id.to_string().as_bytes())?;
        let meta = SecretMeta {
            id,
            name,
            labels,
            size_bytes: payload.len(),
            created_at: Utc::now(),
        };

        let record = Arc::new(SecretRecord {
            meta: meta.clone(),
            sealed,
        });
        self.publish(&current, |next| {
            next.secret_names.insert(meta.name.clone(), id);
            next.secrets.insert(id, record);
        });

        info!(secret_id = %id, name = %meta.name, size_bytes = meta.size_bytes, "secret created");
        self.emit(StoreEvent::SecretCreated { id });
        Ok(meta)
    }

    pub fn get_secret(&self, id: &SecretId) -> Result<SecretMeta, StoreError> {
        self.snapshot()
            .secret(id)
            .cloned()
            .ok_or_else(|| StoreError::secret_not_found(id))
    }

    /// Look a secret up by ID or by name.
    pub fn find_secret(&self, id_or_name: &str) -> Result<SecretMeta, StoreError> {
        let snapshot = self.snapshot();
        let id = match id_or_name.parse::<SecretId>() {
            Ok(id) => Some(id),
            Err(_) => snapshot.secret_id(id_or_name),
        };
        id.and_then(|id| snapshot.secret(&id).cloned())
            .ok_or_else(|| StoreError::secret_not_found(id_or_name))
    }

    /// All secrets, ordered by name.
    pub fn list_secrets(&self) -> Vec<SecretMeta> {
        let mut secrets: Vec<_> = self.snapshot().secrets().cloned().collect();
        secrets.sort_by(|a, b| a.name.cmp(&b.name));
        secrets
    }

    /// Delete a secret no service references and no live task depends on.
    pub async fn delete_secret(&self, id: SecretId) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let pins = self.pins.lock().await;
        let current = self.snapshot.load_full();

        let name = current
            .secret(&id)
            .map(|m| m.name.clone())
            .ok_or_else(|| StoreError::secret_not_found(id))?;

        let mut services: Vec<String> = current
            .services()
            .filter(|v| v.secrets.iter().any(|r| r.secret_id == id))
            .map(|v| v.name().to_string())
            .collect();
        let tasks = pins.get(&id).map_or(0, |t| t.len());
        if !services.is_empty() || tasks > 0 {
            services.sort();
            return Err(StoreError::InUse {
                name,
                services,
                tasks,
            });
        }

        self.publish(&current, |next| {
            next.secrets.remove(&id);
            next.secret_names.remove(&name);
        });
        drop(pins);

        info!(secret_id = %id, %name, "secret deleted");
        self.emit(StoreEvent::SecretDeleted { id });
        Ok(())
    }

    /// Record that `task` needs `secrets` until it terminates.
    pub async fn pin_secrets(&self, task: TaskId, secrets: &[SecretId]) {
        if secrets.is_empty() {
            return;
        }
        let mut pins = self.pins.lock().await;
        for secret in secrets {
            pins.entry(*secret).or_default().insert(task);
        }
        debug!(task_id = %task, count = secrets.len(), "secrets pinned");
    }

    /// Release the pins `task` holds.
    pub async fn unpin_secrets(&self, task: TaskId, secrets: &[SecretId]) {
        if secrets.is_empty() {
            return;
        }
        let mut pins = self.pins.lock().await;
        for secret in secrets {
            if let Some(tasks) = pins.get_mut(secret) {
                tasks.remove(&task);
                if tasks.is_empty() {
                    pins.remove(secret);
                }
            }
        }
        debug!(task_id = %task, count = secrets.len(), "secrets unpinned");
    }

    /// Number of live tasks pinning `secret`.
    pub async fn pin_count(&self, secret: &SecretId) -> usize {
        self.pins.lock().await.get(secret).map_or(0, BTreeSet::len)
    }

    /// Decrypt a secret's payload. Only the binding resolver calls this.
    pub(crate) fn unseal(&self, id: &SecretId) -> Result<SecretPayload, StoreError> {
        let snapshot = self.snapshot();
        let record = snapshot
            .secrets
            .get(id)
            .ok_or_else(|| StoreError::secret_not_found(id))?;
        Ok(self
            .sealer
            .unseal(&record.sealed, id.to_string().as_bytes())?)
    }
}
