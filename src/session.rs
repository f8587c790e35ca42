//! Session table (C3): in-memory map from container id to session record.
//!
//! Guarded by a single `RwLock`; mutators take the write lock, readers take
//! the read lock and clone out a snapshot rather than holding a guard across
//! an `.await` elsewhere in the controller.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::registry::SandboxProfile;

/// A live sandbox session, one per tracked container.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub container_id: String,
    pub session_id: String,
    pub profile_name: String,
    pub profile: SandboxProfile,
    pub persistent: bool,
    pub ttl_seconds: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ttyd_enabled: bool,
    pub ttyd_host_port: Option<u16>,
    pub ttyd_url: Option<String>,
    /// Set when `ttyd_enabled` forced the `none` network policy open for
    /// this record — an audit trail for Open Question (a) in the design
    /// notes, surfaced by `status`/`get_session`.
    pub network_override: bool,
}

impl SessionRecord {
    /// Seconds remaining before the reaper would evict this record, clamped
    /// to zero. Meaningless for non-persistent records (always `0`).
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        if !self.persistent {
            return 0;
        }
        let elapsed = (now - self.last_activity).num_seconds().max(0) as u64;
        self.ttl_seconds.saturating_sub(elapsed)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.persistent && self.remaining_seconds(now) == 0
    }
}

/// Process-wide mapping `container_id -> SessionRecord`.
#[derive(Default)]
pub struct SessionTable {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, minting `session_id`/timestamps if the caller left
    /// them unset. All-or-nothing: the record is either fully present after
    /// this returns or not present at all.
    pub async fn insert(&self, mut record: SessionRecord) -> SessionRecord {
        if record.session_id.is_empty() {
            record.session_id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        if record.started_at == DateTime::<Utc>::default() {
            record.started_at = now;
        }
        if record.last_activity == DateTime::<Utc>::default() {
            record.last_activity = now;
        }

        let mut records = self.records.write().await;
        records.insert(record.container_id.clone(), record.clone());
        record
    }

    /// Bump `last_activity` to now. Returns whether the record existed.
    pub async fn touch(&self, container_id: &str) -> bool {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(container_id) {
            record.last_activity = Utc::now();
            true
        } else {
            false
        }
    }

    pub async fn lookup(&self, container_id: &str) -> Option<SessionRecord> {
        self.records.read().await.get(container_id).cloned()
    }

    /// Linear scan by `session_id` — acceptable at operator scale.
    pub async fn by_session(&self, session_id: &str) -> Option<(String, SessionRecord)> {
        self.records
            .read()
            .await
            .iter()
            .find(|(_, record)| record.session_id == session_id)
            .map(|(id, record)| (id.clone(), record.clone()))
    }

    pub async fn remove(&self, container_id: &str) -> bool {
        self.records.write().await.remove(container_id).is_some()
    }

    /// Copy of every record, for the reaper and status endpoints.
    pub async fn snapshot(&self) -> Vec<SessionRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Atomic `ttl <- min(ttl + delta, max_ttl)`, refreshing `last_activity`.
    /// Returns the new ttl, or `None` if no record matches `session_id`.
    pub async fn extend(&self, session_id: &str, delta_seconds: u64, max_ttl: u64) -> Option<u64> {
        let mut records = self.records.write().await;
        let record = records
            .values_mut()
            .find(|record| record.session_id == session_id)?;
        record.ttl_seconds = (record.ttl_seconds + delta_seconds).min(max_ttl);
        record.last_activity = Utc::now();
        Some(record.ttl_seconds)
    }

    /// Remove and return every record whose TTL has lapsed, as observed at
    /// `now`. Used by the reaper; pure bookkeeping, no engine calls here.
    pub async fn take_expired(&self, now: DateTime<Utc>) -> Vec<SessionRecord> {
        let mut records = self.records.write().await;
        let expired_ids: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        expired_ids
            .into_iter()
            .filter_map(|id| records.remove(&id))
            .collect()
    }

    /// Drain every tracked record, for shutdown/administrative sweeps.
    pub async fn drain(&self) -> Vec<SessionRecord> {
        self.records.write().await.drain().map(|(_, r)| r).collect()
    }
}
