/// Response Formatter
///
/// Maps resolution results to the record shapes the address book frontend
/// consumes. Field names follow the frontend's contact model (`c_uid`,
/// `c_cn`, ...), which is why they are not camelCase.
use crate::{
    directory::Contact,
    dispatch::{GroupCheck, GroupExpansion, ResolutionResult},
};
use serde::{Deserialize, Serialize};

/// Category label attached to every member address
pub const EMAIL_CATEGORY: &str = "work";

/// One address of a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailEntry {
    pub value: String,
    #[serde(rename = "type")]
    pub category: String,
}

/// Caller-facing member record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub c_uid: String,
    pub c_cn: String,
    pub c_givenname: String,
    pub c_sn: String,
    pub c_name: String,
    pub c_o: String,
    pub c_telephonenumber: String,
    pub emails: Vec<EmailEntry>,
    pub mail: String,
}

impl From<&Contact> for MemberRecord {
    fn from(contact: &Contact) -> Self {
        let address = contact.primary_address().to_string();
        Self {
            c_uid: contact.id.clone(),
            c_cn: contact.display_name().to_string(),
            c_givenname: contact.given_name.clone().unwrap_or_default(),
            c_sn: contact.surname.clone().unwrap_or_default(),
            c_name: contact.id.clone(),
            c_o: contact.organization.clone().unwrap_or_default(),
            c_telephonenumber: contact.telephone.clone().unwrap_or_default(),
            emails: vec![EmailEntry {
                value: address.clone(),
                category: EMAIL_CATEGORY.to_string(),
            }],
            mail: address,
        }
    }
}

/// `Check` response: group flag plus raw member token count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub is_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_count: Option<usize>,
}

impl From<&GroupCheck> for CheckResponse {
    fn from(check: &GroupCheck) -> Self {
        if check.is_group {
            Self {
                is_group: true,
                email: Some(check.target_id.clone()),
                member_count: check.member_count,
            }
        } else {
            Self {
                is_group: false,
                email: None,
                member_count: None,
            }
        }
    }
}

/// `Expand` response: resolved leaves and their count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandResponse {
    pub group: String,
    pub members: Vec<MemberRecord>,
    pub count: usize,
}

impl From<&GroupExpansion> for ExpandResponse {
    fn from(expansion: &GroupExpansion) -> Self {
        Self {
            group: expansion.target_id.clone(),
            members: member_records(&expansion.members),
            count: expansion.count(),
        }
    }
}

/// Bare member list, as returned by the per-group members endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersResponse {
    pub members: Vec<MemberRecord>,
}

/// Wire record for any dispatched result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WireRecord {
    Check(CheckResponse),
    Expand(ExpandResponse),
}

pub fn format(result: &ResolutionResult) -> WireRecord {
    match result {
        ResolutionResult::Check(check) => WireRecord::Check(check.into()),
        ResolutionResult::Expand(expansion) => WireRecord::Expand(expansion.into()),
    }
}

pub fn member_records(members: &[Contact]) -> Vec<MemberRecord> {
    members.iter().map(MemberRecord::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_member_record_fallbacks() {
        let record = MemberRecord::from(&Contact::new("bob"));
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(
            value,
            json!({
                "c_uid": "bob",
                "c_cn": "bob",
                "c_givenname": "",
                "c_sn": "",
                "c_name": "bob",
                "c_o": "",
                "c_telephonenumber": "",
                "emails": [{"value": "bob", "type": "work"}],
                "mail": "bob"
            })
        );
    }

    #[test]
    fn test_check_shapes() {
        let group = format(&ResolutionResult::Check(GroupCheck {
            target_id: "team".to_string(),
            is_group: true,
            member_count: Some(2),
        }));
        assert_eq!(
            serde_json::to_value(&group).unwrap(),
            json!({"isGroup": true, "email": "team", "memberCount": 2})
        );

        let leaf = format(&ResolutionResult::Check(GroupCheck {
            target_id: "alice".to_string(),
            is_group: false,
            member_count: None,
        }));
        assert_eq!(serde_json::to_value(&leaf).unwrap(), json!({"isGroup": false}));
    }

    #[test]
    fn test_expand_shape() {
        let alice = Contact::new("alice")
            .with_display_name("Alice A")
            .with_address("alice@x");
        let wire = format(&ResolutionResult::Expand(GroupExpansion {
            target_id: "team@x".to_string(),
            group: Contact::new("team").with_address("team@x"),
            members: vec![alice],
        }));

        let value = serde_json::to_value(&wire).unwrap();
        assert_eq!(value["group"], "team@x");
        assert_eq!(value["count"], 1);
        assert_eq!(value["members"][0]["c_cn"], "Alice A");
        assert_eq!(value["members"][0]["emails"][0]["value"], "alice@x");
        assert_eq!(value["members"][0]["emails"][0]["type"], "work");
    }
}
