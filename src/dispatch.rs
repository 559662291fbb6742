/// Query Dispatcher
///
/// Validates an inbound `(target, operation)` pair and routes it: `Check`
/// consults the identity store directly, `Expand` runs the membership
/// resolver. Transport adapters only ever talk to this type.
use crate::{
    directory::{Contact, IdentityLookup, IdentityRecord},
    error::{ResolverError, ResolverResult},
    metrics,
    resolver::{MembershipResolver, ResolverLimits},
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Requested operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Is the target a group, and how many raw member tokens does it list
    Check,
    /// Full transitive member expansion
    Expand,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Check => "check",
            Operation::Expand => "expand",
        }
    }
}

impl FromStr for Operation {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "check" => Ok(Operation::Check),
            // "members" is what the address book frontend sends
            "expand" | "members" => Ok(Operation::Expand),
            other => Err(ResolverError::InvalidInput(format!(
                "Invalid action '{}'",
                other
            ))),
        }
    }
}

/// Transport-agnostic inbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRequest {
    pub target_id: String,
    pub operation: Operation,
}

impl ResolutionRequest {
    pub fn new(target_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            target_id: target_id.into(),
            operation,
        }
    }
}

/// Outcome of a `Check`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCheck {
    pub target_id: String,
    pub is_group: bool,
    /// Raw token count of the member list; `None` unless the target is a group
    pub member_count: Option<usize>,
}

/// Outcome of an `Expand`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupExpansion {
    /// Target as requested, which may be an address rather than the id
    pub target_id: String,
    pub group: Contact,
    pub members: Vec<Contact>,
}

impl GroupExpansion {
    /// Resolved leaf count
    pub fn count(&self) -> usize {
        self.members.len()
    }
}

/// Result of a dispatched request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionResult {
    Check(GroupCheck),
    Expand(GroupExpansion),
}

/// Routes requests to the store or the resolver
#[derive(Clone)]
pub struct QueryDispatcher {
    store: Arc<dyn IdentityLookup>,
    resolver: MembershipResolver,
    timeout: Duration,
}

impl QueryDispatcher {
    pub fn new(store: Arc<dyn IdentityLookup>, limits: ResolverLimits) -> Self {
        let timeout = limits.timeout;
        let resolver = MembershipResolver::new(Arc::clone(&store), limits);
        Self {
            store,
            resolver,
            timeout,
        }
    }

    /// Validate and route a request
    pub async fn dispatch(&self, request: &ResolutionRequest) -> ResolverResult<ResolutionResult> {
        let started = Instant::now();
        let operation = request.operation;

        let result = match operation {
            Operation::Check => self.check(&request.target_id).await.map(ResolutionResult::Check),
            Operation::Expand => self.expand(&request.target_id).await.map(ResolutionResult::Expand),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::record_resolution(operation.as_str(), outcome, started.elapsed().as_secs_f64());
        debug!(
            target_id = %request.target_id,
            operation = operation.as_str(),
            outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request dispatched"
        );

        result
    }

    /// Report whether `target_id` is a group; a missing target is simply not a group
    pub async fn check(&self, target_id: &str) -> ResolverResult<GroupCheck> {
        let target_id = validate_target(target_id)?;

        let check = match self.with_deadline(self.store.lookup(target_id)).await? {
            Some(IdentityRecord::Group(group)) => GroupCheck {
                target_id: target_id.to_string(),
                is_group: true,
                member_count: Some(group.token_count()),
            },
            Some(IdentityRecord::Leaf(_)) | None => GroupCheck {
                target_id: target_id.to_string(),
                is_group: false,
                member_count: None,
            },
        };

        Ok(check)
    }

    /// Expand `target_id`, which must name a group
    pub async fn expand(&self, target_id: &str) -> ResolverResult<GroupExpansion> {
        let target_id = validate_target(target_id)?;

        self.with_deadline(async {
            let group = match self.store.lookup(target_id).await? {
                Some(IdentityRecord::Group(group)) => group,
                Some(IdentityRecord::Leaf(_)) | None => {
                    return Err(ResolverError::NotFound(format!(
                        "Not a group or group not found: {}",
                        target_id
                    )));
                }
            };

            let members = self.resolver.expand_group(&group).await?;

            Ok(GroupExpansion {
                target_id: target_id.to_string(),
                group: group.contact,
                members,
            })
        })
        .await
    }

    /// Plain record lookup, for adapters that must describe a non-group target
    pub async fn lookup(&self, target_id: &str) -> ResolverResult<Option<IdentityRecord>> {
        let target_id = validate_target(target_id)?;
        self.with_deadline(self.store.lookup(target_id)).await
    }

    /// Every directory record, for adapters that publish the whole address list
    pub async fn list_directory(&self) -> ResolverResult<Vec<IdentityRecord>> {
        self.with_deadline(self.store.list_all()).await
    }

    /// Bound a whole call, root lookup included, by the resolution deadline
    async fn with_deadline<T, F>(&self, fut: F) -> ResolverResult<T>
    where
        F: Future<Output = ResolverResult<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ResolverError::Timeout(self.timeout))?
    }
}

fn validate_target(target_id: &str) -> ResolverResult<&str> {
    let trimmed = target_id.trim();
    if trimmed.is_empty() {
        return Err(ResolverError::InvalidInput(
            "Missing target identifier".to_string(),
        ));
    }
    Ok(trimmed)
}
