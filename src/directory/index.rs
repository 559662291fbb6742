/// In-memory directory index keyed by id and by address
use crate::{
    directory::{IdentityLookup, IdentityRecord},
    error::ResolverResult,
};
use async_trait::async_trait;
use std::collections::HashMap;

/// Immutable lookup table over a set of directory records
#[derive(Debug, Clone, Default)]
pub struct DirectoryIndex {
    records: Vec<IdentityRecord>,
    by_id: HashMap<String, usize>,
    by_address: HashMap<String, usize>,
}

impl DirectoryIndex {
    /// Build an index; on duplicate ids or addresses the first record wins
    pub fn from_records(records: Vec<IdentityRecord>) -> Self {
        let mut by_id = HashMap::with_capacity(records.len());
        let mut by_address = HashMap::with_capacity(records.len());

        for (pos, record) in records.iter().enumerate() {
            by_id.entry(record.id().to_string()).or_insert(pos);
            if let Some(address) = record.contact().primary_address.as_deref() {
                if !address.is_empty() {
                    by_address.entry(address.to_string()).or_insert(pos);
                }
            }
        }

        Self {
            records,
            by_id,
            by_address,
        }
    }

    pub fn get(&self, key: &str) -> Option<&IdentityRecord> {
        self.by_id
            .get(key)
            .or_else(|| self.by_address.get(key))
            .map(|&pos| &self.records[pos])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_group()).count()
    }

    /// Records in load order, skipping any shadowed by an earlier duplicate id
    pub fn records(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.records
            .iter()
            .enumerate()
            .filter(|(pos, record)| self.by_id.get(record.id()) == Some(pos))
            .map(|(_, record)| record)
    }
}

#[async_trait]
impl IdentityLookup for DirectoryIndex {
    async fn lookup(&self, id: &str) -> ResolverResult<Option<IdentityRecord>> {
        Ok(self.get(id).cloned())
    }

    async fn lookup_many(
        &self,
        ids: &[String],
    ) -> ResolverResult<HashMap<String, IdentityRecord>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }

    async fn list_all(&self) -> ResolverResult<Vec<IdentityRecord>> {
        Ok(self.records().cloned().collect())
    }
}
