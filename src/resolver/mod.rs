/// Membership Resolver
///
/// Computes the transitive closure of leaf members reachable from a group.
///
/// Expansion is depth-first in member-list order with a visited set that is
/// global to one call: an identifier is expanded at most once no matter how
/// many paths reach it, so the first path to discover it wins. A group that
/// is reached again while its own expansion is still in progress (a cycle)
/// contributes nothing the second time. Leaves are additionally
/// de-duplicated by id, so a person listed by id in one group and by address
/// in another appears once.
///
/// Each group's member tokens are fetched with one batched lookup, falling
/// back to one lookup per token when the batch fails. A token whose lookup
/// fails contributes nothing; the call fails only when the root cannot be
/// looked up, nesting exceeds the depth bound, or the deadline expires.
use crate::{
    directory::{Contact, GroupRecord, IdentityLookup, IdentityRecord},
    error::{ResolverError, ResolverResult},
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Resolver limits
#[derive(Debug, Clone)]
pub struct ResolverLimits {
    /// Maximum number of nested group hops below the starting group
    pub max_depth: usize,
    /// Overall deadline for one resolution call
    pub timeout: Duration,
}

impl Default for ResolverLimits {
    fn default() -> Self {
        Self {
            max_depth: 32,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Group membership resolver over an identity store
#[derive(Clone)]
pub struct MembershipResolver {
    store: Arc<dyn IdentityLookup>,
    limits: ResolverLimits,
}

impl MembershipResolver {
    pub fn new(store: Arc<dyn IdentityLookup>, limits: ResolverLimits) -> Self {
        Self { store, limits }
    }

    /// Resolve every leaf reachable from `start_id`
    ///
    /// An unknown start contributes nothing and a leaf start yields itself.
    /// A failed root lookup is returned as an error.
    pub async fn resolve_members(&self, start_id: &str) -> ResolverResult<Vec<Contact>> {
        self.with_deadline(async {
            let mut expansion = Expansion::new(self.store.as_ref(), self.limits.max_depth);
            expansion.visited.insert(start_id.to_string());

            match self.store.lookup(start_id).await? {
                None => {}
                Some(IdentityRecord::Leaf(contact)) => expansion.push_leaf(contact),
                Some(IdentityRecord::Group(group)) => expansion.run(&group).await?,
            }

            Ok(expansion.finish())
        })
        .await
    }

    /// Resolve the members of an already looked-up group
    pub async fn expand_group(&self, group: &GroupRecord) -> ResolverResult<Vec<Contact>> {
        self.with_deadline(async {
            let mut expansion = Expansion::new(self.store.as_ref(), self.limits.max_depth);
            expansion.visited.insert(group.contact.id.clone());
            expansion.run(group).await?;
            Ok(expansion.finish())
        })
        .await
    }

    async fn with_deadline<F>(&self, fut: F) -> ResolverResult<Vec<Contact>>
    where
        F: std::future::Future<Output = ResolverResult<Vec<Contact>>>,
    {
        tokio::time::timeout(self.limits.timeout, fut)
            .await
            .map_err(|_| ResolverError::Timeout(self.limits.timeout))?
    }
}

/// One group whose member tokens are being walked
struct Frame {
    group_id: String,
    tokens: Vec<String>,
    records: HashMap<String, IdentityRecord>,
    next: usize,
    depth: usize,
}

/// State of a single resolution call; never shared between calls
struct Expansion<'a> {
    store: &'a dyn IdentityLookup,
    max_depth: usize,
    visited: HashSet<String>,
    leaf_ids: HashSet<String>,
    members: Vec<Contact>,
}

impl<'a> Expansion<'a> {
    fn new(store: &'a dyn IdentityLookup, max_depth: usize) -> Self {
        Self {
            store,
            max_depth,
            visited: HashSet::new(),
            leaf_ids: HashSet::new(),
            members: Vec::new(),
        }
    }

    fn push_leaf(&mut self, contact: Contact) {
        if self.leaf_ids.insert(contact.id.clone()) {
            self.members.push(contact);
        }
    }

    fn finish(self) -> Vec<Contact> {
        debug!(
            members = self.members.len(),
            visited = self.visited.len(),
            "membership expansion finished"
        );
        self.members
    }

    /// Walk `root` depth-first using an explicit stack of frames
    async fn run(&mut self, root: &GroupRecord) -> ResolverResult<()> {
        self.visited.insert(root.contact.id.clone());
        let mut stack = vec![self.open(root, 0).await];

        while let Some(frame) = stack.last_mut() {
            if frame.next >= frame.tokens.len() {
                if let Some(done) = stack.pop() {
                    debug!(group = %done.group_id, depth = done.depth, "group expanded");
                }
                continue;
            }

            let token = frame.tokens[frame.next].clone();
            frame.next += 1;
            let depth = frame.depth + 1;

            // Global guard: first discovery wins
            if !self.visited.insert(token.clone()) {
                continue;
            }

            match frame.records.remove(&token) {
                None => {}
                Some(IdentityRecord::Leaf(contact)) => self.push_leaf(contact),
                Some(IdentityRecord::Group(group)) => {
                    // Reached by address after already being expanded by id (or vice versa)
                    if group.contact.id != token && !self.visited.insert(group.contact.id.clone()) {
                        continue;
                    }
                    if depth > self.max_depth {
                        return Err(ResolverError::DepthExceeded {
                            max_depth: self.max_depth,
                        });
                    }
                    let child = self.open(&group, depth).await;
                    stack.push(child);
                }
            }
        }

        Ok(())
    }

    /// Parse a group's member list and fetch its not-yet-visited tokens
    async fn open(&self, group: &GroupRecord, depth: usize) -> Frame {
        let tokens: Vec<String> = group.member_tokens().map(str::to_string).collect();

        let pending: Vec<String> = {
            let mut seen = HashSet::new();
            tokens
                .iter()
                .filter(|t| !self.visited.contains(t.as_str()) && seen.insert(t.as_str()))
                .cloned()
                .collect()
        };

        let records = self.fetch(&group.contact.id, &pending).await;

        Frame {
            group_id: group.contact.id.clone(),
            tokens,
            records,
            next: 0,
            depth,
        }
    }

    async fn fetch(
        &self,
        group_id: &str,
        tokens: &[String],
    ) -> HashMap<String, IdentityRecord> {
        if tokens.is_empty() {
            return HashMap::new();
        }

        let batch_err = match self.store.lookup_many(tokens).await {
            Ok(records) => return records,
            Err(e) => e,
        };
        warn!(
            group = %group_id,
            tokens = tokens.len(),
            error = %batch_err,
            "batched member lookup failed, retrying per token"
        );

        let mut records = HashMap::new();
        for token in tokens {
            match self.store.lookup(token).await {
                Ok(Some(record)) => {
                    records.insert(token.clone(), record);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(group = %group_id, member = %token, error = %e, "member lookup failed, skipping");
                }
            }
        }
        records
    }
}
