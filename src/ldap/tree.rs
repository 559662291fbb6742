/// Directory tree published over LDAP
///
/// The address list is laid out below the base DN as `ou=users`, one
/// `inetOrgPerson` per leaf, and `ou=groups`, one `groupOfUniqueNames` per
/// group. In the tree a group's `uniqueMember` values name its direct
/// members; member tokens that match no record are left out.
use super::message::{Filter, SearchEntry, SearchScope};
use crate::directory::{Contact, IdentityRecord};
use std::collections::{HashMap, HashSet};

pub fn user_dn(contact: &Contact, base_dn: &str) -> String {
    format!("uid={},ou=users,{}", contact.id, base_dn)
}

pub fn group_dn(contact: &Contact, base_dn: &str) -> String {
    format!("cn={},ou=groups,{}", contact.id, base_dn)
}

pub fn person_entry(contact: &Contact, base_dn: &str) -> SearchEntry {
    SearchEntry::new(user_dn(contact, base_dn))
        .attribute(
            "objectClass",
            strings(&["top", "person", "organizationalPerson", "inetOrgPerson"]),
        )
        .attribute("uid", vec![contact.id.clone()])
        .attribute("cn", vec![contact.display_name().to_string()])
        .attribute("mail", vec![contact.primary_address().to_string()])
        .attribute("givenName", optional(&contact.given_name))
        .attribute("sn", optional(&contact.surname))
        .attribute("o", optional(&contact.organization))
        .attribute("telephoneNumber", optional(&contact.telephone))
}

pub fn group_entry(group: &Contact, member_dns: Vec<String>, base_dn: &str) -> SearchEntry {
    SearchEntry::new(group_dn(group, base_dn))
        .attribute("objectClass", strings(&["top", "groupOfUniqueNames"]))
        .attribute("cn", vec![group.id.clone()])
        .attribute("displayName", vec![group.display_name().to_string()])
        .attribute("mail", vec![group.primary_address().to_string()])
        .attribute("uniqueMember", member_dns)
}

/// Snapshot of the whole directory as LDAP entries
#[derive(Debug)]
pub struct DirectoryTree {
    /// Entries paired with their normalized DN
    entries: Vec<(String, SearchEntry)>,
}

impl DirectoryTree {
    pub fn build(base_dn: &str, records: &[IdentityRecord]) -> Self {
        let member_dns = member_dn_table(base_dn, records);

        let mut entries = vec![
            root_entry(base_dn),
            unit_entry("users", base_dn),
            unit_entry("groups", base_dn),
        ];

        for record in records {
            entries.push(match record {
                IdentityRecord::Leaf(contact) => person_entry(contact, base_dn),
                IdentityRecord::Group(group) => {
                    let mut seen = HashSet::new();
                    let members = group
                        .member_tokens()
                        .filter_map(|token| member_dns.get(token))
                        .filter(|dn| seen.insert(dn.as_str()))
                        .cloned()
                        .collect();
                    group_entry(&group.contact, members, base_dn)
                }
            });
        }

        Self {
            entries: entries
                .into_iter()
                .map(|entry| (normalize_dn(&entry.dn), entry))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries within `scope` of `base` that match `filter`, in tree order
    ///
    /// Returns `None` when `base` names no entry of the tree.
    pub fn search(&self, base: &str, scope: SearchScope, filter: &Filter) -> Option<Vec<SearchEntry>> {
        let base = normalize_dn(base);
        if !self.entries.iter().any(|(dn, _)| *dn == base) {
            return None;
        }

        let subtree_suffix = format!(",{}", base);
        Some(
            self.entries
                .iter()
                .filter(|(dn, _)| match scope {
                    SearchScope::BaseObject => *dn == base,
                    SearchScope::SingleLevel => {
                        dn.split_once(',').map(|(_, parent)| parent) == Some(base.as_str())
                    }
                    SearchScope::WholeSubtree => *dn == base || dn.ends_with(&subtree_suffix),
                })
                .filter(|(_, entry)| filter.matches(entry))
                .map(|(_, entry)| entry.clone())
                .collect(),
        )
    }
}

/// DN for every key a member token may use; an id wins over an address
fn member_dn_table<'a>(base_dn: &str, records: &'a [IdentityRecord]) -> HashMap<&'a str, String> {
    let dn = |record: &IdentityRecord| match record {
        IdentityRecord::Leaf(contact) => user_dn(contact, base_dn),
        IdentityRecord::Group(group) => group_dn(&group.contact, base_dn),
    };

    let mut table = HashMap::with_capacity(records.len() * 2);
    for record in records {
        table.entry(record.id()).or_insert_with(|| dn(record));
    }
    for record in records {
        if let Some(address) = record.contact().primary_address.as_deref() {
            if !address.is_empty() {
                table.entry(address).or_insert_with(|| dn(record));
            }
        }
    }
    table
}

fn root_entry(base_dn: &str) -> SearchEntry {
    let entry = SearchEntry::new(base_dn).attribute("objectClass", strings(&["top", "domain"]));
    match base_dn.split(',').next().and_then(|rdn| rdn.split_once('=')) {
        Some((attribute, value)) => entry.attribute(attribute.trim(), vec![value.trim().to_string()]),
        None => entry,
    }
}

fn unit_entry(unit: &str, base_dn: &str) -> SearchEntry {
    SearchEntry::new(format!("ou={},{}", unit, base_dn))
        .attribute("objectClass", strings(&["top", "organizationalUnit"]))
        .attribute("ou", vec![unit.to_string()])
}

/// Lowercase, with blanks around separators removed
fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| match rdn.split_once('=') {
            Some((attribute, value)) => format!("{}={}", attribute.trim(), value.trim()),
            None => rdn.trim().to_string(),
        })
        .filter(|rdn| !rdn.is_empty())
        .collect::<Vec<_>>()
        .join(",")
        .to_lowercase()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn optional(value: &Option<String>) -> Vec<String> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(|v| vec![v.to_string()])
        .unwrap_or_default()
}
