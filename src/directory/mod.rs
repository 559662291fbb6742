/// Identity Store access
///
/// The address list is a flat relational view where every row is either a
/// person (leaf) or a group carrying a whitespace-delimited member list.
/// Rows are decoded once into [`IdentityRecord`] and reach the resolver
/// through the [`IdentityLookup`] capability.

pub mod index;
pub mod snapshot;
pub mod sql;

pub use index::DirectoryIndex;
pub use snapshot::{RefreshOutcome, SnapshotDirectory};
pub use sql::SqlDirectory;

use crate::error::{ResolverError, ResolverResult};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::FromRow;
use std::collections::HashMap;

/// Contact attributes shared by people and groups
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Contact {
    pub id: String,
    pub display_name: Option<String>,
    pub primary_address: Option<String>,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub organization: Option<String>,
    pub telephone: Option<String>,
}

impl Contact {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.primary_address = Some(address.into());
        self
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        non_empty(&self.display_name).unwrap_or(&self.id)
    }

    /// Primary address, falling back to the id
    pub fn primary_address(&self) -> &str {
        non_empty(&self.primary_address).unwrap_or(&self.id)
    }
}

/// A group row: its own contact data plus the raw member list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupRecord {
    pub contact: Contact,
    pub member_list: String,
}

impl GroupRecord {
    pub fn new(contact: Contact, member_list: impl Into<String>) -> Self {
        Self {
            contact,
            member_list: member_list.into(),
        }
    }

    /// Member tokens in list order; runs of whitespace separate tokens
    pub fn member_tokens(&self) -> impl Iterator<Item = &str> {
        self.member_list.split_whitespace()
    }

    /// Raw token count, before any resolution or de-duplication
    pub fn token_count(&self) -> usize {
        self.member_tokens().count()
    }
}

/// One directory entry, classified when it is read from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IdentityRecord {
    Leaf(Contact),
    Group(GroupRecord),
}

impl IdentityRecord {
    pub fn contact(&self) -> &Contact {
        match self {
            IdentityRecord::Leaf(contact) => contact,
            IdentityRecord::Group(group) => &group.contact,
        }
    }

    pub fn id(&self) -> &str {
        &self.contact().id
    }

    pub fn is_group(&self) -> bool {
        matches!(self, IdentityRecord::Group(_))
    }

    /// True when `key` names this record by id or by address
    pub fn matches(&self, key: &str) -> bool {
        let contact = self.contact();
        contact.id == key || contact.primary_address.as_deref() == Some(key)
    }
}

/// Raw row of the address list view
#[derive(Debug, Clone, FromRow)]
pub struct GalRow {
    pub uid: String,
    pub display_name: Option<String>,
    pub mail: Option<String>,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub organization: Option<String>,
    pub telephone: Option<String>,
    pub is_group: Option<i64>,
    pub group_members: Option<String>,
}

impl From<GalRow> for IdentityRecord {
    fn from(row: GalRow) -> Self {
        let contact = Contact {
            id: row.uid,
            display_name: row.display_name,
            primary_address: row.mail,
            given_name: row.given_name,
            surname: row.surname,
            organization: row.organization,
            telephone: row.telephone,
        };

        // NULL and 0 both mean "not a group" in the view
        if row.is_group.unwrap_or(0) != 0 {
            IdentityRecord::Group(GroupRecord::new(
                contact,
                row.group_members.unwrap_or_default(),
            ))
        } else {
            IdentityRecord::Leaf(contact)
        }
    }
}

/// Read-only lookup capability over the Identity Store
///
/// Implementations must distinguish "not found" (`Ok(None)` / missing key)
/// from a store failure (`Err`). A key may be either an id or an address;
/// an id match wins over an address match.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Look up a single identifier
    async fn lookup(&self, id: &str) -> ResolverResult<Option<IdentityRecord>>;

    /// Look up many identifiers at once, keyed by the requested identifier.
    /// Keys with no matching record are absent from the map.
    async fn lookup_many(&self, ids: &[String]) -> ResolverResult<HashMap<String, IdentityRecord>> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.lookup(id).await? {
                found.insert(id.clone(), record);
            }
        }
        Ok(found)
    }

    /// Every record, one per id, for adapters that publish the whole directory
    async fn list_all(&self) -> ResolverResult<Vec<IdentityRecord>> {
        Err(ResolverError::Internal(
            "identity store does not support listing".to_string(),
        ))
    }

    /// Verify the store can serve lookups
    async fn health_check(&self) -> ResolverResult<()> {
        Ok(())
    }
}

/// Pick the record a key refers to, preferring an id match over an address match
pub(crate) fn best_match<'a, I>(key: &str, candidates: I) -> Option<&'a IdentityRecord>
where
    I: IntoIterator<Item = &'a IdentityRecord>,
{
    let mut by_address = None;
    for record in candidates {
        if record.id() == key {
            return Some(record);
        }
        if by_address.is_none() && record.matches(key) {
            by_address = Some(record);
        }
    }
    by_address
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(uid: &str, is_group: Option<i64>, members: Option<&str>) -> GalRow {
        GalRow {
            uid: uid.to_string(),
            display_name: None,
            mail: None,
            given_name: None,
            surname: None,
            organization: None,
            telephone: None,
            is_group,
            group_members: members.map(str::to_string),
        }
    }

    #[test]
    fn test_row_classification() {
        assert!(!IdentityRecord::from(row("alice", None, None)).is_group());
        assert!(!IdentityRecord::from(row("alice", Some(0), Some("x"))).is_group());

        let group = IdentityRecord::from(row("team", Some(1), None));
        match group {
            IdentityRecord::Group(g) => assert_eq!(g.token_count(), 0),
            other => panic!("expected group, got {:?}", other),
        }
    }

    #[test]
    fn test_member_tokens_irregular_whitespace() {
        let spaced = GroupRecord::new(Contact::new("g"), "a b c");
        let messy = GroupRecord::new(Contact::new("g"), "  a\n\tb   \r\n c  ");

        let spaced: Vec<_> = spaced.member_tokens().collect();
        let messy: Vec<_> = messy.member_tokens().collect();
        assert_eq!(spaced, vec!["a", "b", "c"]);
        assert_eq!(spaced, messy);
    }

    #[test]
    fn test_fallbacks() {
        let bare = Contact::new("bob");
        assert_eq!(bare.display_name(), "bob");
        assert_eq!(bare.primary_address(), "bob");

        let empty = Contact::new("bob").with_display_name("").with_address("");
        assert_eq!(empty.display_name(), "bob");
        assert_eq!(empty.primary_address(), "bob");

        let full = Contact::new("bob")
            .with_display_name("Bob B")
            .with_address("bob@x");
        assert_eq!(full.display_name(), "Bob B");
        assert_eq!(full.primary_address(), "bob@x");
    }

    #[test]
    fn test_best_match_prefers_id() {
        let by_mail = IdentityRecord::Leaf(Contact::new("u1").with_address("shared"));
        let by_id = IdentityRecord::Leaf(Contact::new("shared"));
        let records = vec![by_mail, by_id];

        let picked = best_match("shared", records.iter()).unwrap();
        assert_eq!(picked.id(), "shared");

        let picked = best_match("u1", records.iter()).unwrap();
        assert_eq!(picked.id(), "u1");
        assert!(best_match("nobody", records.iter()).is_none());
    }
}
