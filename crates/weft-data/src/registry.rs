use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Storage tier of an artifact on its owning server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Accelerator / cache memory. Fastest, most limited.
    FastMemory,
    /// System RAM.
    MainMemory,
    /// Local disk. Slowest, most abundant.
    Disk,
}

impl Tier {
    /// The next tier down under memory pressure, if any. Disk is the
    /// floor; content is never dropped by tiering alone.
    pub fn downgrade(self) -> Option<Tier> {
        match self {
            Tier::FastMemory => Some(Tier::MainMemory),
            Tier::MainMemory => Some(Tier::Disk),
            Tier::Disk => None,
        }
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::MainMemory
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::FastMemory => "fast_memory",
            Tier::MainMemory => "main_memory",
            Tier::Disk => "disk",
        };
        write!(f, "{}", s)
    }
}

/// Tensor element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorDType {
    Float16,
    BFloat16,
    Float32,
    Float64,
    Int8,
    Int32,
    Int64,
    Uint8,
    Bool,
}

/// Type tag carried by every DataRef. Closed set; each variant carries
/// the metadata its consumers need to interpret the bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadKind {
    Tensor { shape: Vec<usize>, dtype: TensorDType },
    Json,
    Bytes,
    KvCache { model_id: String, seq_len: usize },
    File { mime_type: String },
}

/// Payloads at or below this size may be inlined in task messages
/// instead of being fetched by reference.
pub const INLINE_THRESHOLD_BYTES: u64 = 64 * 1024;

/// An immutable handle to one data artifact.
///
/// The bytes a DataRef names never change; a computation producing new
/// content always creates a new DataRef. Only `tier` may be rewritten in
/// place (by pressure-driven eviction), and that happens in the registry,
/// not on handed-out copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRef {
    pub uuid: Uuid,
    pub workflow_id: Uuid,
    /// Server address currently holding the primary copy.
    pub location: String,
    pub size_bytes: u64,
    pub kind: PayloadKind,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    /// Optional integrity checksum reported by the producing server.
    #[serde(default)]
    pub checksum: Option<String>,
}

impl DataRef {
    pub fn new(location: &str, workflow_id: Uuid, size_bytes: u64, kind: PayloadKind) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            workflow_id,
            location: location.to_string(),
            size_bytes,
            kind,
            tier: Tier::default(),
            created_at: Utc::now(),
            checksum: None,
        }
    }

    pub fn json(location: &str, workflow_id: Uuid, value: &serde_json::Value) -> Self {
        let size = value.to_string().len() as u64;
        Self::new(location, workflow_id, size, PayloadKind::Json)
    }

    pub fn file(location: &str, workflow_id: Uuid, size_bytes: u64, mime_type: &str) -> Self {
        Self::new(
            location,
            workflow_id,
            size_bytes,
            PayloadKind::File {
                mime_type: mime_type.to_string(),
            },
        )
    }

    pub fn tensor(
        location: &str,
        workflow_id: Uuid,
        size_bytes: u64,
        shape: Vec<usize>,
        dtype: TensorDType,
    ) -> Self {
        Self::new(
            location,
            workflow_id,
            size_bytes,
            PayloadKind::Tensor { shape, dtype },
        )
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn is_local_to(&self, server: &str) -> bool {
        self.location == server
    }

    pub fn is_inline_eligible(&self) -> bool {
        self.size_bytes <= INLINE_THRESHOLD_BYTES
    }
}

struct Entry {
    data_ref: DataRef,
    /// Logical clock of the last `resolve`, for LRU eviction ordering.
    last_resolved: u64,
    retired: bool,
}

/// Process-wide registry of every DataRef known to the orchestrator.
///
/// `resolve` never performs I/O: it returns the last known location and
/// lets the protocol layer surface staleness as a runtime error. The
/// registry is constructed once at startup and passed by handle.
pub struct DataRegistry {
    inner: RwLock<Inner>,
}

struct Inner {
    entries: HashMap<Uuid, Entry>,
    clock: u64,
}

impl DataRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// Register a newly produced artifact. The id must be fresh.
    pub fn register(&self, data_ref: DataRef) -> Result<(), DataError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.entries.contains_key(&data_ref.uuid) {
            return Err(DataError::Duplicate(data_ref.uuid));
        }
        debug!(
            data_uuid = %data_ref.uuid,
            location = %data_ref.location,
            size_bytes = data_ref.size_bytes,
            tier = %data_ref.tier,
            "DataRef registered"
        );
        let clock = inner.clock;
        inner.entries.insert(
            data_ref.uuid,
            Entry {
                data_ref,
                last_resolved: clock,
                retired: false,
            },
        );
        Ok(())
    }

    /// Look up a DataRef by id, bumping its recency.
    pub fn resolve(&self, id: Uuid) -> Result<DataRef, DataError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.entries.get_mut(&id).ok_or(DataError::NotFound(id))?;
        entry.last_resolved = clock;
        Ok(entry.data_ref.clone())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .entries
            .contains_key(&id)
    }

    /// Mark a DataRef eligible for eviction/deletion. Content is not
    /// touched; actual deletion is driven by the external data plane.
    pub fn retire(&self, id: Uuid) -> Result<(), DataError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner.entries.get_mut(&id).ok_or(DataError::NotFound(id))?;
        entry.retired = true;
        info!(data_uuid = %id, "DataRef retired");
        Ok(())
    }

    /// Rewrite the storage tier in place. Identity and content are
    /// unaffected; this is the only mutable attribute of a DataRef.
    pub fn set_tier(&self, id: Uuid, tier: Tier) -> Result<(), DataError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner.entries.get_mut(&id).ok_or(DataError::NotFound(id))?;
        entry.data_ref.tier = tier;
        Ok(())
    }

    /// Remove a retired DataRef after the external data plane confirmed
    /// deletion. Refuses to drop entries that were never retired.
    pub fn remove(&self, id: Uuid) -> Result<DataRef, DataError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        match inner.entries.get(&id) {
            None => Err(DataError::NotFound(id)),
            Some(entry) if !entry.retired => Err(DataError::NotRetired(id)),
            Some(_) => Ok(inner
                .entries
                .remove(&id)
                .map(|e| e.data_ref)
                .expect("entry present")),
        }
    }

    /// The `n` least-recently-resolved refs that still have a tier below
    /// them, as `(id, current, next)` moves. Read-only; callers log the
    /// moves durably before applying them with [`set_tier`].
    ///
    /// [`set_tier`]: DataRegistry::set_tier
    pub fn eviction_candidates(&self, n: usize) -> Vec<(Uuid, Tier, Tier)> {
        let inner = self.inner.read().expect("registry lock poisoned");

        let mut candidates: Vec<(Uuid, u64, Tier, Tier)> = inner
            .entries
            .iter()
            .filter_map(|(id, e)| {
                e.data_ref
                    .tier
                    .downgrade()
                    .map(|to| (*id, e.last_resolved, e.data_ref.tier, to))
            })
            .collect();
        candidates.sort_by_key(|(_, at, _, _)| *at);

        candidates
            .into_iter()
            .take(n)
            .map(|(id, _, from, to)| (id, from, to))
            .collect()
    }

    /// Respond to an external memory-pressure signal: downgrade the `n`
    /// least-recently-resolved refs one tier each. Returns the applied
    /// `(id, old, new)` moves; refs already on disk are skipped.
    pub fn evict_under_pressure(&self, n: usize) -> Vec<(Uuid, Tier, Tier)> {
        let moves = self.eviction_candidates(n);
        for (id, from, to) in &moves {
            if self.set_tier(*id, *to).is_ok() {
                info!(data_uuid = %id, from = %from, to = %to, "Tier downgraded under pressure");
            }
        }
        moves
    }

    /// All refs owned by a workflow, for locality scoring and retention.
    pub fn refs_for_workflow(&self, workflow_id: Uuid) -> Vec<DataRef> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .entries
            .values()
            .filter(|e| e.data_ref.workflow_id == workflow_id)
            .map(|e| e.data_ref.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DataRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("DataRef not found: {0}")]
    NotFound(Uuid),

    #[error("DataRef already registered: {0}")]
    Duplicate(Uuid),

    #[error("DataRef not retired: {0}")]
    NotRetired(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(location: &str) -> DataRef {
        DataRef::new(location, Uuid::new_v4(), 2048, PayloadKind::Bytes)
    }

    #[test]
    fn register_and_resolve() {
        let registry = DataRegistry::new();
        let r = sample("server-a");
        let id = r.uuid;
        registry.register(r.clone()).unwrap();

        let resolved = registry.resolve(id).unwrap();
        assert_eq!(resolved, r);
        assert!(matches!(
            registry.resolve(Uuid::new_v4()),
            Err(DataError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_rejected() {
        let registry = DataRegistry::new();
        let r = sample("server-a");
        registry.register(r.clone()).unwrap();
        assert!(matches!(
            registry.register(r),
            Err(DataError::Duplicate(_))
        ));
    }

    #[test]
    fn identity_invariant_under_tier_change() {
        let registry = DataRegistry::new();
        let r = sample("server-a").with_tier(Tier::FastMemory);
        let id = r.uuid;
        let (size, kind) = (r.size_bytes, r.kind.clone());
        registry.register(r).unwrap();

        registry.set_tier(id, Tier::Disk).unwrap();
        let after = registry.resolve(id).unwrap();
        assert_eq!(after.uuid, id);
        assert_eq!(after.size_bytes, size);
        assert_eq!(after.kind, kind);
        assert_eq!(after.tier, Tier::Disk);
    }

    #[test]
    fn pressure_evicts_least_recently_resolved() {
        let registry = DataRegistry::new();
        let cold = sample("server-a").with_tier(Tier::FastMemory);
        let warm = sample("server-a").with_tier(Tier::FastMemory);
        let (cold_id, warm_id) = (cold.uuid, warm.uuid);
        registry.register(cold).unwrap();
        registry.register(warm).unwrap();

        // Touch `warm` so `cold` is the LRU candidate.
        registry.resolve(warm_id).unwrap();

        let moves = registry.evict_under_pressure(1);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].0, cold_id);
        assert_eq!(moves[0].2, Tier::MainMemory);
        assert_eq!(registry.resolve(warm_id).unwrap().tier, Tier::FastMemory);
    }

    #[test]
    fn eviction_stops_at_disk() {
        let registry = DataRegistry::new();
        let r = sample("server-a").with_tier(Tier::Disk);
        let id = r.uuid;
        registry.register(r).unwrap();

        assert!(registry.evict_under_pressure(4).is_empty());
        assert_eq!(registry.resolve(id).unwrap().tier, Tier::Disk);
    }

    #[test]
    fn remove_requires_retire() {
        let registry = DataRegistry::new();
        let r = sample("server-a");
        let id = r.uuid;
        registry.register(r).unwrap();

        assert!(matches!(registry.remove(id), Err(DataError::NotRetired(_))));
        registry.retire(id).unwrap();
        registry.remove(id).unwrap();
        assert!(!registry.contains(id));
    }

    #[test]
    fn inline_eligibility() {
        let wf = Uuid::new_v4();
        let small = DataRef::new("s", wf, 1024, PayloadKind::Json);
        let large = DataRef::new("s", wf, 10 * 1024 * 1024, PayloadKind::Bytes);
        assert!(small.is_inline_eligible());
        assert!(!large.is_inline_eligible());
    }
}
