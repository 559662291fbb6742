/// Live SQL-backed identity lookups against the address list view
use crate::{
    db,
    directory::{best_match, GalRow, IdentityLookup, IdentityRecord},
    error::{ResolverError, ResolverResult},
    metrics,
};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::{HashMap, HashSet};
use tracing::error;

const COLUMNS: &str =
    "uid, display_name, mail, given_name, surname, organization, telephone, is_group, group_members";

/// SQLite caps bound parameters per statement; each key is bound twice
const BATCH_CHUNK: usize = 400;

/// Identity store that queries the database on every lookup
#[derive(Clone)]
pub struct SqlDirectory {
    db: SqlitePool,
}

impl SqlDirectory {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Load every row of the view, ordered by uid
    pub async fn load_all(&self) -> ResolverResult<Vec<GalRow>> {
        sqlx::query_as::<_, GalRow>(&format!("SELECT {} FROM gal ORDER BY uid", COLUMNS))
            .fetch_all(&self.db)
            .await
            .map_err(store_error)
    }
}

#[async_trait]
impl IdentityLookup for SqlDirectory {
    async fn lookup(&self, id: &str) -> ResolverResult<Option<IdentityRecord>> {
        metrics::DIRECTORY_LOOKUPS_TOTAL
            .with_label_values(&["single"])
            .inc();

        let rows = sqlx::query_as::<_, GalRow>(&format!(
            "SELECT {} FROM gal WHERE uid = ?1 OR mail = ?1",
            COLUMNS
        ))
        .bind(id)
        .fetch_all(&self.db)
        .await
        .map_err(store_error)?;

        let records: Vec<IdentityRecord> = rows.into_iter().map(IdentityRecord::from).collect();
        Ok(best_match(id, records.iter()).cloned())
    }

    async fn lookup_many(
        &self,
        ids: &[String],
    ) -> ResolverResult<HashMap<String, IdentityRecord>> {
        let mut seen = HashSet::new();
        let keys: Vec<&String> = ids.iter().filter(|id| seen.insert(id.as_str())).collect();
        let mut found = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(BATCH_CHUNK) {
            metrics::DIRECTORY_LOOKUPS_TOTAL
                .with_label_values(&["batch"])
                .inc();

            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {} FROM gal WHERE uid IN (", COLUMNS));
            {
                let mut separated = qb.separated(", ");
                for id in chunk {
                    separated.push_bind((*id).clone());
                }
            }
            qb.push(") OR mail IN (");
            {
                let mut separated = qb.separated(", ");
                for id in chunk {
                    separated.push_bind((*id).clone());
                }
            }
            qb.push(")");

            let rows = qb
                .build_query_as::<GalRow>()
                .fetch_all(&self.db)
                .await
                .map_err(store_error)?;
            let records: Vec<IdentityRecord> =
                rows.into_iter().map(IdentityRecord::from).collect();

            for id in chunk {
                if let Some(record) = best_match(id, records.iter()) {
                    found.insert((*id).clone(), record.clone());
                }
            }
        }

        Ok(found)
    }

    async fn list_all(&self) -> ResolverResult<Vec<IdentityRecord>> {
        metrics::DIRECTORY_LOOKUPS_TOTAL
            .with_label_values(&["list"])
            .inc();

        // uid is the primary key, so rows are already one per id
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .map(IdentityRecord::from)
            .collect())
    }

    async fn health_check(&self) -> ResolverResult<()> {
        db::test_connection(&self.db).await.map_err(|e| match e {
            ResolverError::Database(err) => store_error(err),
            other => other,
        })
    }
}

/// Any failure talking to the view makes the store unavailable for this call
fn store_error(e: sqlx::Error) -> ResolverError {
    error!(error = %e, "identity store query failed");
    ResolverError::StoreUnavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{insert_group, insert_leaf, memory_pool};

    async fn seeded() -> SqlDirectory {
        let pool = memory_pool().await;
        insert_leaf(&pool, "alice", Some("Alice A"), Some("alice@x")).await;
        insert_leaf(&pool, "bob", None, None).await;
        insert_group(&pool, "team", "alice bob missing").await;
        SqlDirectory::new(pool)
    }

    #[tokio::test]
    async fn test_lookup_by_uid_and_mail() {
        let directory = seeded().await;

        let by_uid = directory.lookup("alice").await.unwrap().unwrap();
        let by_mail = directory.lookup("alice@x").await.unwrap().unwrap();
        assert_eq!(by_uid, by_mail);
        assert_eq!(by_uid.contact().display_name(), "Alice A");

        assert!(directory.lookup("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_group_record() {
        let directory = seeded().await;

        match directory.lookup("team").await.unwrap().unwrap() {
            IdentityRecord::Group(group) => {
                assert_eq!(group.token_count(), 3);
            }
            other => panic!("expected group, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lookup_many_batched() {
        let directory = seeded().await;
        let ids: Vec<String> = ["alice@x", "bob", "missing", "bob"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let found = directory.lookup_many(&ids).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["alice@x"].id(), "alice");
        assert_eq!(found["bob"].contact().display_name(), "bob");
    }

    #[tokio::test]
    async fn test_load_all_ordered() {
        let directory = seeded().await;
        let rows = directory.load_all().await.unwrap();
        let uids: Vec<_> = rows.iter().map(|r| r.uid.as_str()).collect();
        assert_eq!(uids, vec!["alice", "bob", "team"]);
    }

    #[tokio::test]
    async fn test_list_all_classifies_rows() {
        let directory = seeded().await;
        let listed = directory.list_all().await.unwrap();

        let ids: Vec<&str> = listed.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["alice", "bob", "team"]);
        assert!(listed[2].is_group());
    }

    #[tokio::test]
    async fn test_closed_pool_is_unavailable() {
        let directory = seeded().await;
        directory.db.close().await;

        let err = directory.lookup("alice").await.unwrap_err();
        assert!(matches!(err, ResolverError::StoreUnavailable(_)));
        assert!(directory.health_check().await.is_err());
        assert!(matches!(
            directory.list_all().await,
            Err(ResolverError::StoreUnavailable(_))
        ));
    }
}
