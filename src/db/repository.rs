use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::sqlite::{open_database, open_memory_database};
use super::DatabaseError;
use crate::models::{DiffKey, DiffResult, DigitizedPolicy};

/// Versioned policy documents plus persisted diff results.
///
/// Policies are immutable once stored; a new document for the same
/// (payer, medication) becomes the next version.
pub trait PolicyStore: Send + Sync {
    /// Store `policy` as the next version and return it with the version set.
    fn insert_next_version(&self, policy: &DigitizedPolicy) -> Result<DigitizedPolicy, DatabaseError>;
    fn load_policy(
        &self,
        payer: &str,
        medication: &str,
        version: u32,
    ) -> Result<Option<DigitizedPolicy>, DatabaseError>;
    fn latest_policy(&self, payer: &str, medication: &str) -> Result<Option<DigitizedPolicy>, DatabaseError>;
    fn list_versions(&self, payer: &str, medication: &str) -> Result<Vec<u32>, DatabaseError>;
    fn load_diff(&self, key: &DiffKey) -> Result<Option<DiffResult>, DatabaseError>;
    fn store_diff(&self, diff: &DiffResult) -> Result<(), DatabaseError>;
    /// Keep the `keep` most recently computed diffs. Returns rows removed.
    fn prune_diffs(&self, keep: usize) -> Result<usize, DatabaseError>;
}

fn subject_key(value: &str) -> String {
    value.trim().to_lowercase()
}

// ═══════════════════════════════════════════
// Policy Repository
// ═══════════════════════════════════════════

pub fn next_policy_version(conn: &Connection, payer: &str, medication: &str) -> Result<u32, DatabaseError> {
    let current: Option<u32> = conn.query_row(
        "SELECT MAX(version) FROM policies WHERE payer_key = ?1 AND medication_key = ?2",
        params![subject_key(payer), subject_key(medication)],
        |row| row.get(0),
    )?;
    Ok(current.unwrap_or(0) + 1)
}

pub fn insert_policy(conn: &Connection, policy: &DigitizedPolicy) -> Result<(), DatabaseError> {
    let document = serde_json::to_string(policy)?;
    conn.execute(
        "INSERT INTO policies (payer_key, medication_key, version, payer, medication,
         source_hash, extraction_quality, document, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            subject_key(&policy.payer),
            subject_key(&policy.medication),
            policy.version,
            policy.payer,
            policy.medication,
            policy.source_hash,
            policy.extraction_quality.as_str(),
            document,
            policy.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_policy(
    conn: &Connection,
    payer: &str,
    medication: &str,
    version: u32,
) -> Result<Option<DigitizedPolicy>, DatabaseError> {
    let document: Option<String> = conn
        .query_row(
            "SELECT document FROM policies
             WHERE payer_key = ?1 AND medication_key = ?2 AND version = ?3",
            params![subject_key(payer), subject_key(medication), version],
            |row| row.get(0),
        )
        .optional()?;
    document
        .map(|json| serde_json::from_str(&json).map_err(DatabaseError::from))
        .transpose()
}

pub fn get_latest_policy(
    conn: &Connection,
    payer: &str,
    medication: &str,
) -> Result<Option<DigitizedPolicy>, DatabaseError> {
    let document: Option<String> = conn
        .query_row(
            "SELECT document FROM policies
             WHERE payer_key = ?1 AND medication_key = ?2
             ORDER BY version DESC LIMIT 1",
            params![subject_key(payer), subject_key(medication)],
            |row| row.get(0),
        )
        .optional()?;
    document
        .map(|json| serde_json::from_str(&json).map_err(DatabaseError::from))
        .transpose()
}

pub fn get_policy_versions(conn: &Connection, payer: &str, medication: &str) -> Result<Vec<u32>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT version FROM policies WHERE payer_key = ?1 AND medication_key = ?2 ORDER BY version",
    )?;
    let rows = stmt.query_map(params![subject_key(payer), subject_key(medication)], |row| {
        row.get::<_, u32>(0)
    })?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row?);
    }
    Ok(versions)
}

// ═══════════════════════════════════════════
// Diff Cache Repository
// ═══════════════════════════════════════════

pub fn get_diff(conn: &Connection, key: &DiffKey) -> Result<Option<DiffResult>, DatabaseError> {
    let result: Option<String> = conn
        .query_row(
            "SELECT result FROM diff_cache
             WHERE payer_key = ?1 AND medication_key = ?2 AND old_version = ?3 AND new_version = ?4",
            params![key.payer, key.medication, key.old_version, key.new_version],
            |row| row.get(0),
        )
        .optional()?;
    result
        .map(|json| serde_json::from_str(&json).map_err(DatabaseError::from))
        .transpose()
}

pub fn upsert_diff(conn: &Connection, diff: &DiffResult) -> Result<(), DatabaseError> {
    let key = diff.key();
    let result = serde_json::to_string(diff)?;
    conn.execute(
        "INSERT OR REPLACE INTO diff_cache
         (payer_key, medication_key, old_version, new_version, result, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            key.payer,
            key.medication,
            key.old_version,
            key.new_version,
            result,
            diff.computed_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn delete_oldest_diffs(conn: &Connection, keep: usize) -> Result<usize, DatabaseError> {
    let keep = i64::try_from(keep).unwrap_or(i64::MAX);
    let removed = conn.execute(
        "DELETE FROM diff_cache WHERE rowid NOT IN (
             SELECT rowid FROM diff_cache ORDER BY computed_at DESC, rowid DESC LIMIT ?1
         )",
        params![keep],
    )?;
    Ok(removed)
}

// ═══════════════════════════════════════════
// SQLite store
// ═══════════════════════════════════════════

/// [`PolicyStore`] over one SQLite connection. The lock is held for one
/// statement batch at a time and never across an await.
pub struct SqlitePolicyStore {
    conn: Mutex<Connection>,
}

impl SqlitePolicyStore {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self {
            conn: Mutex::new(open_database(path)?),
        })
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self {
            conn: Mutex::new(open_memory_database()?),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PolicyStore for SqlitePolicyStore {
    fn insert_next_version(&self, policy: &DigitizedPolicy) -> Result<DigitizedPolicy, DatabaseError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut stored = policy.clone();
        stored.version = next_policy_version(&tx, &policy.payer, &policy.medication)?;
        insert_policy(&tx, &stored)?;
        tx.commit()?;
        tracing::info!(
            payer = %stored.payer,
            medication = %stored.medication,
            version = stored.version,
            "Policy version stored"
        );
        Ok(stored)
    }

    fn load_policy(
        &self,
        payer: &str,
        medication: &str,
        version: u32,
    ) -> Result<Option<DigitizedPolicy>, DatabaseError> {
        get_policy(&self.conn(), payer, medication, version)
    }

    fn latest_policy(&self, payer: &str, medication: &str) -> Result<Option<DigitizedPolicy>, DatabaseError> {
        get_latest_policy(&self.conn(), payer, medication)
    }

    fn list_versions(&self, payer: &str, medication: &str) -> Result<Vec<u32>, DatabaseError> {
        get_policy_versions(&self.conn(), payer, medication)
    }

    fn load_diff(&self, key: &DiffKey) -> Result<Option<DiffResult>, DatabaseError> {
        get_diff(&self.conn(), key)
    }

    fn store_diff(&self, diff: &DiffResult) -> Result<(), DatabaseError> {
        upsert_diff(&self.conn(), diff)
    }

    fn prune_diffs(&self, keep: usize) -> Result<usize, DatabaseError> {
        let removed = delete_oldest_diffs(&self.conn(), keep)?;
        if removed > 0 {
            tracing::debug!(removed, keep, "Pruned persisted diffs");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiffSummary, ExtractionQuality};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn policy(payer: &str) -> DigitizedPolicy {
        DigitizedPolicy {
            payer: payer.into(),
            medication: "Humira".into(),
            version: 0,
            policy_title: None,
            effective_date: None,
            criteria: Vec::new(),
            groups: Vec::new(),
            indications: Vec::new(),
            exclusions: Vec::new(),
            safety_screenings: Vec::new(),
            extraction_quality: ExtractionQuality::Good,
            provenance: BTreeMap::new(),
            source_hash: "abc".into(),
            extraction_provider: "gemini".into(),
            validation_provider: "claude".into(),
            created_at: Utc::now(),
        }
    }

    fn diff(old: u32, new: u32, age_minutes: i64) -> DiffResult {
        DiffResult {
            payer: "Aetna".into(),
            medication: "Humira".into(),
            old_version: old,
            new_version: new,
            entries: Vec::new(),
            summary: DiffSummary::default(),
            computed_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn versions_increase_per_subject() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        assert_eq!(store.insert_next_version(&policy("Aetna")).unwrap().version, 1);
        assert_eq!(store.insert_next_version(&policy(" aetna ")).unwrap().version, 2);
        assert_eq!(store.insert_next_version(&policy("Cigna")).unwrap().version, 1);
        assert_eq!(store.list_versions("AETNA", "humira").unwrap(), vec![1, 2]);
    }

    #[test]
    fn stored_policy_round_trips() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        let stored = store.insert_next_version(&policy("Aetna")).unwrap();
        let loaded = store.load_policy("aetna", "HUMIRA", 1).unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert!(store.load_policy("aetna", "humira", 2).unwrap().is_none());
        assert_eq!(store.latest_policy("Aetna", "Humira").unwrap().unwrap().version, 1);
    }

    #[test]
    fn concurrent_inserts_get_distinct_versions() {
        let store = Arc::new(SqlitePolicyStore::in_memory().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.insert_next_version(&policy("Aetna")).unwrap().version)
            })
            .collect();
        let mut versions: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[test]
    fn diff_rows_are_keyed_and_pruned() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        store.store_diff(&diff(1, 2, 30)).unwrap();
        store.store_diff(&diff(2, 3, 20)).unwrap();
        store.store_diff(&diff(1, 3, 10)).unwrap();

        let key = DiffKey::new("AETNA", "Humira", 1, 2);
        assert!(store.load_diff(&key).unwrap().is_some());

        assert_eq!(store.prune_diffs(2).unwrap(), 1);
        assert!(store.load_diff(&key).unwrap().is_none());
        assert!(store.load_diff(&DiffKey::new("aetna", "humira", 1, 3)).unwrap().is_some());
    }
}
