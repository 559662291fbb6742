/// Per-connection LDAP request handling
///
/// A search whose filter or base DN names a target is answered through the
/// dispatcher: a group target yields the group entry followed by one entry
/// per resolved member. Any other search is evaluated against the whole
/// directory tree.
use super::{
    message::{self, LdapMessage, ProtocolOp, ResultCode, SearchEntry, SearchRequest, SearchScope},
    tree::{self, DirectoryTree},
};
use crate::{
    directory::IdentityRecord,
    dispatch::{Operation, QueryDispatcher, ResolutionRequest, ResolutionResult},
    error::{ResolverError, ResolverResult},
    metrics,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Attributes whose equality assertion names the search target
const TARGET_ATTRIBUTES: [&str; 3] = ["cn", "uid", "mail"];

/// What the connection loop should do after a message
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// Write these frames, possibly none, and keep reading
    Frames(Vec<Vec<u8>>),
    /// Close the connection
    Close,
}

#[derive(Clone)]
pub struct LdapSession {
    dispatcher: Arc<QueryDispatcher>,
    base_dn: String,
}

impl LdapSession {
    pub fn new(dispatcher: Arc<QueryDispatcher>, base_dn: impl Into<String>) -> Self {
        Self {
            dispatcher,
            base_dn: base_dn.into(),
        }
    }

    pub async fn handle(&self, message: LdapMessage) -> Reply {
        metrics::record_ldap_operation(message.op.name());
        let id = message.message_id;

        match message.op {
            ProtocolOp::BindRequest { version, name } => {
                debug!(message_id = id, version, bind_dn = %name, "ldap bind");
                Reply::Frames(vec![message::encode_bind_response(id)])
            }
            ProtocolOp::UnbindRequest => Reply::Close,
            ProtocolOp::SearchRequest(request) => Reply::Frames(self.search(id, &request).await),
            ProtocolOp::AbandonRequest => Reply::Frames(Vec::new()),
            ProtocolOp::Other(tag) => match message::response_tag(tag) {
                Some(response) => Reply::Frames(vec![message::encode_result(
                    id,
                    response,
                    ResultCode::UnwillingToPerform,
                    "Operation not supported",
                )]),
                None => Reply::Frames(Vec::new()),
            },
        }
    }

    async fn search(&self, id: i64, request: &SearchRequest) -> Vec<Vec<u8>> {
        let entries = match self.entries_with_limit(request).await {
            Ok(Some(entries)) => entries,
            Ok(None) => {
                debug!(message_id = id, base_dn = %request.base_dn, "ldap search base not in tree");
                return vec![message::encode_search_done(id, ResultCode::NoSuchObject, "")];
            }
            Err(ResolverError::NotFound(_)) => Vec::new(),
            Err(e) => {
                warn!(message_id = id, base_dn = %request.base_dn, error = %e, "ldap search failed");
                let diagnostic = match &e {
                    ResolverError::InvalidInput(_)
                    | ResolverError::StoreUnavailable(_)
                    | ResolverError::Timeout(_)
                    | ResolverError::DepthExceeded { .. } => e.to_string(),
                    _ => "Internal error".to_string(),
                };
                return vec![message::encode_search_done(
                    id,
                    ResultCode::from(&e),
                    &diagnostic,
                )];
            }
        };

        let limit = usize::try_from(request.size_limit).unwrap_or(0);
        let truncated = limit > 0 && entries.len() > limit;

        let mut frames: Vec<Vec<u8>> = entries
            .into_iter()
            .take(if truncated { limit } else { usize::MAX })
            .map(|entry| {
                message::encode_search_entry(id, &entry.select(&request.attributes), request.types_only)
            })
            .collect();

        debug!(
            message_id = id,
            base_dn = %request.base_dn,
            entries = frames.len(),
            truncated,
            "ldap search answered"
        );

        frames.push(if truncated {
            message::encode_search_done(id, ResultCode::SizeLimitExceeded, "")
        } else {
            message::encode_search_done(id, ResultCode::Success, "")
        });
        frames
    }

    async fn entries_with_limit(&self, request: &SearchRequest) -> ResolverResult<Option<Vec<SearchEntry>>> {
        match u64::try_from(request.time_limit) {
            Ok(secs) if secs > 0 => {
                let limit = Duration::from_secs(secs);
                tokio::time::timeout(limit, self.entries(request))
                    .await
                    .map_err(|_| ResolverError::Timeout(limit))?
            }
            _ => self.entries(request).await,
        }
    }

    /// `None` when a tree search names a base outside the tree
    async fn entries(&self, request: &SearchRequest) -> ResolverResult<Option<Vec<SearchEntry>>> {
        if let Some(target) = search_target(request) {
            debug!(target = %target, "ldap search by target");
            return self.target_entries(&target).await.map(Some);
        }

        let records = self.dispatcher.list_directory().await?;
        let tree = DirectoryTree::build(&self.base_dn, &records);
        debug!(tree_entries = tree.len(), "ldap search over directory tree");
        Ok(tree.search(&request.base_dn, request.scope, &request.filter))
    }

    async fn target_entries(&self, target: &str) -> ResolverResult<Vec<SearchEntry>> {
        match self.dispatcher.lookup(target).await? {
            Some(IdentityRecord::Group(_)) => {
                let request = ResolutionRequest::new(target, Operation::Expand);
                let expansion = match self.dispatcher.dispatch(&request).await? {
                    ResolutionResult::Expand(expansion) => expansion,
                    ResolutionResult::Check(_) => {
                        return Err(ResolverError::Internal(
                            "expand dispatched as check".to_string(),
                        ))
                    }
                };

                let member_dns = expansion
                    .members
                    .iter()
                    .map(|m| tree::user_dn(m, &self.base_dn))
                    .collect();
                let mut entries = Vec::with_capacity(expansion.count() + 1);
                entries.push(tree::group_entry(&expansion.group, member_dns, &self.base_dn));
                entries.extend(
                    expansion
                        .members
                        .iter()
                        .map(|m| tree::person_entry(m, &self.base_dn)),
                );
                Ok(entries)
            }
            Some(IdentityRecord::Leaf(contact)) => Ok(vec![tree::person_entry(&contact, &self.base_dn)]),
            None => Ok(Vec::new()),
        }
    }
}

/// Equality filter on cn/uid/mail that every match must satisfy, else the
/// first RDN of a base-scope search
fn search_target(request: &SearchRequest) -> Option<String> {
    if let Some(value) = request.filter.find_equality(&TARGET_ATTRIBUTES) {
        return Some(value.trim().to_string()).filter(|v| !v.is_empty());
    }
    if request.scope != SearchScope::BaseObject {
        return None;
    }

    let rdn = request.base_dn.split(',').next()?;
    let (attribute, value) = rdn.split_once('=')?;
    let attribute = attribute.trim();
    let value = value.trim();
    if value.is_empty() || !TARGET_ATTRIBUTES.iter().any(|a| a.eq_ignore_ascii_case(attribute)) {
        return None;
    }
    Some(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        directory::{Contact, DirectoryIndex, GroupRecord},
        ldap::message::client,
        resolver::ResolverLimits,
    };

    fn session() -> LdapSession {
        let records = vec![
            IdentityRecord::Leaf(
                Contact::new("alice")
                    .with_display_name("Alice A")
                    .with_address("alice@x"),
            ),
            IdentityRecord::Leaf(Contact::new("bob").with_address("bob@x")),
            IdentityRecord::Group(GroupRecord::new(Contact::new("team"), "alice bob missing")),
            IdentityRecord::Group(GroupRecord::new(Contact::new("deep"), "deeper")),
            IdentityRecord::Group(GroupRecord::new(Contact::new("deeper"), "alice")),
        ];
        let dispatcher = QueryDispatcher::new(
            Arc::new(DirectoryIndex::from_records(records)),
            ResolverLimits {
                max_depth: 0,
                ..Default::default()
            },
        );
        LdapSession::new(Arc::new(dispatcher), "dc=schule,dc=lan")
    }

    async fn run(session: &LdapSession, frame: Vec<u8>) -> Vec<(i64, u8, Vec<u8>)> {
        let message = LdapMessage::decode(&frame).unwrap();
        match session.handle(message).await {
            Reply::Frames(frames) => frames.iter().map(|f| client::decode_response(f)).collect(),
            Reply::Close => panic!("unexpected close"),
        }
    }

    fn search(filter: Vec<u8>, size_limit: i64) -> Vec<u8> {
        client::search_request(2, "dc=schule,dc=lan", 2, size_limit, filter, &[])
    }

    #[tokio::test]
    async fn test_bind_and_unbind() {
        let session = session();
        let replies = run(&session, client::bind_request(1)).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1, message::BIND_RESPONSE);
        assert_eq!(client::result_code(&replies[0].2), 0);

        let unbind = LdapMessage::decode(&client::unbind_request(2)).unwrap();
        assert_eq!(session.handle(unbind).await, Reply::Close);
    }

    #[tokio::test]
    async fn test_group_search() {
        let session = session();
        let replies = run(&session, search(client::equality("cn", "team"), 0)).await;

        assert_eq!(replies.len(), 4);
        assert!(replies.iter().all(|(id, _, _)| *id == 2));

        let group = client::entry(&replies[0].2);
        assert_eq!(group.dn, "cn=team,ou=groups,dc=schule,dc=lan");
        assert_eq!(
            group.values("uniqueMember"),
            &[
                "uid=alice,ou=users,dc=schule,dc=lan".to_string(),
                "uid=bob,ou=users,dc=schule,dc=lan".to_string()
            ][..]
        );

        let alice = client::entry(&replies[1].2);
        assert_eq!(alice.dn, "uid=alice,ou=users,dc=schule,dc=lan");
        assert_eq!(alice.values("cn"), &["Alice A".to_string()][..]);
        assert_eq!(alice.values("mail"), &["alice@x".to_string()][..]);
        assert!(alice.values("sn").is_empty());

        assert_eq!(replies[3].1, message::SEARCH_RESULT_DONE);
        assert_eq!(client::result_code(&replies[3].2), 0);
    }

    #[tokio::test]
    async fn test_leaf_and_missing_targets() {
        let session = session();

        let replies = run(&session, search(client::equality("mail", "bob@x"), 0)).await;
        assert_eq!(replies.len(), 2);
        assert_eq!(client::entry(&replies[0].2).dn, "uid=bob,ou=users,dc=schule,dc=lan");

        let replies = run(&session, search(client::equality("uid", "nobody"), 0)).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(client::result_code(&replies[0].2), 0);
    }

    fn entry_dns(replies: &[(i64, u8, Vec<u8>)]) -> Vec<String> {
        replies
            .iter()
            .filter(|(_, tag, _)| *tag == message::SEARCH_RESULT_ENTRY)
            .map(|(_, _, value)| client::entry(value).dn)
            .collect()
    }

    #[tokio::test]
    async fn test_untargeted_search_lists_directory() {
        let session = session();
        let replies = run(&session, search(client::present("objectClass"), 0)).await;

        // base, two units, two people, three groups
        assert_eq!(replies.len(), 9);
        let dns = entry_dns(&replies);
        assert_eq!(dns[0], "dc=schule,dc=lan");
        assert!(dns.contains(&"uid=alice,ou=users,dc=schule,dc=lan".to_string()));
        assert!(dns.contains(&"cn=team,ou=groups,dc=schule,dc=lan".to_string()));
        assert_eq!(client::result_code(&replies[8].2), 0);

        let people = client::search_request(
            4,
            "ou=users,dc=schule,dc=lan",
            1,
            0,
            client::or(&[client::prefix("cn", "ali"), client::prefix("mail", "ali")]),
            &["mail"],
        );
        let replies = run(&session, people).await;
        assert_eq!(entry_dns(&replies), vec!["uid=alice,ou=users,dc=schule,dc=lan"]);
    }

    #[tokio::test]
    async fn test_search_outside_tree_is_no_such_object() {
        let session = session();
        let frame = client::search_request(5, "dc=elsewhere", 2, 0, client::present("objectClass"), &[]);

        let replies = run(&session, frame).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(client::result_code(&replies[0].2), 32);
    }

    #[tokio::test]
    async fn test_negated_target_is_not_answered_with_target() {
        let session = session();
        let replies = run(&session, search(client::not(client::equality("cn", "team")), 0)).await;

        let dns = entry_dns(&replies);
        assert!(!dns.is_empty());
        assert!(!dns.contains(&"cn=team,ou=groups,dc=schule,dc=lan".to_string()));
        assert!(dns.contains(&"uid=alice,ou=users,dc=schule,dc=lan".to_string()));
    }

    #[tokio::test]
    async fn test_base_scope_target() {
        let session = session();
        let frame = client::search_request(
            3,
            "cn=team,ou=groups,dc=schule,dc=lan",
            0,
            0,
            client::present("objectClass"),
            &["cn"],
        );

        let replies = run(&session, frame).await;
        assert_eq!(replies.len(), 4);
        let group = client::entry(&replies[0].2);
        assert_eq!(group.attributes.len(), 1);
        assert_eq!(group.values("cn"), &["team".to_string()][..]);
    }

    #[tokio::test]
    async fn test_size_limit() {
        let session = session();
        let replies = run(&session, search(client::equality("cn", "team"), 2)).await;

        assert_eq!(replies.len(), 3);
        assert_eq!(replies[2].1, message::SEARCH_RESULT_DONE);
        assert_eq!(client::result_code(&replies[2].2), 4);
    }

    #[tokio::test]
    async fn test_depth_error_maps_to_result_code() {
        let session = session();
        let replies = run(&session, search(client::equality("cn", "deep"), 0)).await;

        assert_eq!(replies.len(), 1);
        assert_eq!(client::result_code(&replies[0].2), 53);
    }

    #[tokio::test]
    async fn test_unsupported_operation() {
        let session = session();
        let modify = LdapMessage {
            message_id: 9,
            op: ProtocolOp::Other(0x66),
        };
        match session.handle(modify).await {
            Reply::Frames(frames) => {
                let (id, tag, value) = client::decode_response(&frames[0]);
                assert_eq!((id, tag), (9, 0x67));
                assert_eq!(client::result_code(&value), 53);
            }
            Reply::Close => panic!("unexpected close"),
        }

        let abandon = LdapMessage {
            message_id: 10,
            op: ProtocolOp::AbandonRequest,
        };
        assert_eq!(session.handle(abandon).await, Reply::Frames(Vec::new()));
    }
}
