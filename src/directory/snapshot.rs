/// Snapshot directory - serves lookups from a periodically rebuilt in-memory copy
///
/// The whole view is loaded into a [`DirectoryIndex`]. Rebuilds are skipped
/// when the content fingerprint of the view has not changed. A failed refresh
/// keeps serving the previous snapshot.
use crate::{
    directory::{DirectoryIndex, GalRow, IdentityLookup, IdentityRecord, SqlDirectory},
    error::{ResolverError, ResolverResult},
    metrics,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One immutable generation of the directory
#[derive(Debug)]
pub struct Snapshot {
    pub index: DirectoryIndex,
    pub fingerprint: String,
    pub loaded_at: DateTime<Utc>,
}

/// Result of a refresh attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Rebuilt { entries: usize, groups: usize },
    Unchanged,
}

/// Identity store backed by an in-memory snapshot of the SQL view
pub struct SnapshotDirectory {
    source: SqlDirectory,
    current: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotDirectory {
    /// Create an empty snapshot directory; call [`refresh`](Self::refresh) before use
    pub fn new(source: SqlDirectory) -> Self {
        Self {
            source,
            current: RwLock::new(None),
        }
    }

    /// Reload the view and swap in a new snapshot if its content changed
    pub async fn refresh(&self) -> ResolverResult<RefreshOutcome> {
        let started = std::time::Instant::now();
        let rows = match self.source.load_all().await {
            Ok(rows) => rows,
            Err(e) => {
                metrics::SNAPSHOT_REFRESHES_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                return Err(e);
            }
        };
        let fingerprint = fingerprint(&rows);

        if let Some(current) = self.current.read().await.as_ref() {
            if current.fingerprint == fingerprint {
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "directory unchanged, skipping snapshot rebuild"
                );
                metrics::SNAPSHOT_REFRESHES_TOTAL
                    .with_label_values(&["unchanged"])
                    .inc();
                return Ok(RefreshOutcome::Unchanged);
            }
        }

        let index = DirectoryIndex::from_records(rows.into_iter().map(IdentityRecord::from).collect());
        let entries = index.len();
        let groups = index.group_count();
        if index.is_empty() {
            warn!("directory view is empty; every lookup will miss");
        }

        *self.current.write().await = Some(Arc::new(Snapshot {
            index,
            fingerprint,
            loaded_at: Utc::now(),
        }));

        metrics::SNAPSHOT_ENTRIES.set(entries as i64);
        metrics::SNAPSHOT_REFRESHES_TOTAL
            .with_label_values(&["rebuilt"])
            .inc();
        info!(
            entries,
            groups,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "directory snapshot rebuilt"
        );

        Ok(RefreshOutcome::Rebuilt { entries, groups })
    }

    /// Current snapshot, if one has been loaded
    pub async fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.read().await.clone()
    }

    async fn loaded(&self) -> ResolverResult<Arc<Snapshot>> {
        self.current().await.ok_or_else(|| {
            ResolverError::StoreUnavailable("directory snapshot not loaded yet".to_string())
        })
    }
}

#[async_trait]
impl IdentityLookup for SnapshotDirectory {
    async fn lookup(&self, id: &str) -> ResolverResult<Option<IdentityRecord>> {
        let snapshot = self.loaded().await?;
        snapshot.index.lookup(id).await
    }

    async fn lookup_many(
        &self,
        ids: &[String],
    ) -> ResolverResult<HashMap<String, IdentityRecord>> {
        let snapshot = self.loaded().await?;
        snapshot.index.lookup_many(ids).await
    }

    async fn list_all(&self) -> ResolverResult<Vec<IdentityRecord>> {
        let snapshot = self.loaded().await?;
        Ok(snapshot.index.records().cloned().collect())
    }

    async fn health_check(&self) -> ResolverResult<()> {
        self.loaded().await.map(|_| ())
    }
}

/// Content hash over every column of every row, in row order
fn fingerprint(rows: &[GalRow]) -> String {
    const FIELD: &[u8] = &[0x1f];
    const RECORD: &[u8] = &[0x1e];

    let mut hasher = Sha256::new();
    for row in rows {
        for field in [
            Some(row.uid.as_str()),
            row.display_name.as_deref(),
            row.mail.as_deref(),
            row.given_name.as_deref(),
            row.surname.as_deref(),
            row.organization.as_deref(),
            row.telephone.as_deref(),
            row.group_members.as_deref(),
        ] {
            // NULL and empty must hash differently
            match field {
                Some(value) => {
                    hasher.update(b"s");
                    hasher.update(value.as_bytes());
                }
                None => hasher.update(b"n"),
            }
            hasher.update(FIELD);
        }
        hasher.update(row.is_group.unwrap_or(0).to_be_bytes());
        hasher.update(RECORD);
    }
    hex::encode(hasher.finalize())
}
