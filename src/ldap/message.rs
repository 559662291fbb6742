/// LDAPv3 message model
///
/// Decodes the requests the groupware client sends (bind, search, unbind)
/// and encodes the responses the listener writes back.
use super::ber::{
    self, BerError, BerReader, BOOLEAN, ENUMERATED, INTEGER, OCTET_STRING, SEQUENCE, SET,
};
use crate::error::ResolverError;

// Application tags
pub const BIND_REQUEST: u8 = 0x60;
pub const BIND_RESPONSE: u8 = 0x61;
pub const UNBIND_REQUEST: u8 = 0x42;
pub const SEARCH_REQUEST: u8 = 0x63;
pub const SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const SEARCH_RESULT_DONE: u8 = 0x65;
pub const ABANDON_REQUEST: u8 = 0x50;

// Filter choices
const FILTER_AND: u8 = 0xa0;
const FILTER_OR: u8 = 0xa1;
const FILTER_NOT: u8 = 0xa2;
const FILTER_EQUALITY: u8 = 0xa3;
const FILTER_SUBSTRINGS: u8 = 0xa4;
const FILTER_PRESENT: u8 = 0x87;

// Substring choices
const SUBSTRING_INITIAL: u8 = 0x80;
const SUBSTRING_ANY: u8 = 0x81;
const SUBSTRING_FINAL: u8 = 0x82;

/// Deepest and/or/not nesting accepted in a search filter
pub const MAX_FILTER_DEPTH: usize = 32;

/// LDAP result codes this server emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success = 0,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    NoSuchObject = 32,
    Unavailable = 52,
    UnwillingToPerform = 53,
    Other = 80,
}

impl From<&ResolverError> for ResultCode {
    fn from(error: &ResolverError) -> Self {
        match error {
            ResolverError::InvalidInput(_) => ResultCode::ProtocolError,
            ResolverError::NotFound(_) => ResultCode::Success,
            ResolverError::StoreUnavailable(_) => ResultCode::Unavailable,
            ResolverError::Timeout(_) => ResultCode::TimeLimitExceeded,
            ResolverError::DepthExceeded { .. } => ResultCode::UnwillingToPerform,
            _ => ResultCode::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject,
    SingleLevel,
    WholeSubtree,
}

impl TryFrom<i64> for SearchScope {
    type Error = BerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(BerError::Malformed("search scope")),
        }
    }
}

/// Search filter; choices the server does not evaluate keep only their tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality { attribute: String, value: String },
    Substrings {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    Present(String),
    Unsupported(u8),
}

impl Filter {
    fn decode(tag: u8, value: &[u8], depth: usize) -> Result<Self, BerError> {
        if depth > MAX_FILTER_DEPTH {
            return Err(BerError::Malformed("filter nesting"));
        }

        match tag {
            FILTER_AND | FILTER_OR => {
                let mut reader = BerReader::new(value);
                let mut filters = Vec::new();
                while !reader.is_empty() {
                    let tlv = reader.read_tlv()?;
                    filters.push(Filter::decode(tlv.tag, tlv.value, depth + 1)?);
                }
                Ok(if tag == FILTER_AND {
                    Filter::And(filters)
                } else {
                    Filter::Or(filters)
                })
            }
            FILTER_NOT => {
                let tlv = BerReader::new(value).read_tlv()?;
                Ok(Filter::Not(Box::new(Filter::decode(tlv.tag, tlv.value, depth + 1)?)))
            }
            FILTER_EQUALITY => {
                let mut reader = BerReader::new(value);
                Ok(Filter::Equality {
                    attribute: reader.read_string(OCTET_STRING)?,
                    value: reader.read_string(OCTET_STRING)?,
                })
            }
            FILTER_SUBSTRINGS => {
                let mut reader = BerReader::new(value);
                let attribute = reader.read_string(OCTET_STRING)?;
                let mut parts = BerReader::new(reader.expect(SEQUENCE)?);
                let (mut initial, mut any, mut last) = (None, Vec::new(), None);
                while !parts.is_empty() {
                    let part = parts.read_tlv()?;
                    let text = String::from_utf8_lossy(part.value).into_owned();
                    match part.tag {
                        SUBSTRING_INITIAL => initial = Some(text),
                        SUBSTRING_ANY => any.push(text),
                        SUBSTRING_FINAL => last = Some(text),
                        _ => return Err(BerError::Malformed("substring filter")),
                    }
                }
                Ok(Filter::Substrings {
                    attribute,
                    initial,
                    any,
                    last,
                })
            }
            FILTER_PRESENT => Ok(Filter::Present(String::from_utf8_lossy(value).into_owned())),
            other => Ok(Filter::Unsupported(other)),
        }
    }

    /// Equality assertion on one of `attributes` that every match must satisfy
    ///
    /// Only the filter itself and the terms of a conjunction qualify: an
    /// assertion under `or` or `not` does not name what the search returns.
    pub fn find_equality(&self, attributes: &[&str]) -> Option<&str> {
        match self {
            Filter::And(filters) => filters
                .iter()
                .find_map(|filter| filter.find_equality(attributes)),
            Filter::Equality { attribute, value } => attributes
                .iter()
                .any(|a| a.eq_ignore_ascii_case(attribute))
                .then_some(value.as_str()),
            _ => None,
        }
    }

    /// Evaluate against an entry; `None` is the undefined outcome of an
    /// assertion the server cannot judge, which never selects an entry
    pub fn evaluate(&self, entry: &SearchEntry) -> Option<bool> {
        match self {
            Filter::And(filters) => {
                let mut outcome = Some(true);
                for filter in filters {
                    match filter.evaluate(entry) {
                        Some(false) => return Some(false),
                        None => outcome = None,
                        Some(true) => {}
                    }
                }
                outcome
            }
            Filter::Or(filters) => {
                let mut outcome = Some(false);
                for filter in filters {
                    match filter.evaluate(entry) {
                        Some(true) => return Some(true),
                        None => outcome = None,
                        Some(false) => {}
                    }
                }
                outcome
            }
            Filter::Not(inner) => inner.evaluate(entry).map(|matched| !matched),
            Filter::Equality { attribute, value } => {
                let value = value.to_lowercase();
                Some(
                    entry
                        .values(attribute)
                        .iter()
                        .any(|candidate| candidate.to_lowercase() == value),
                )
            }
            Filter::Substrings {
                attribute,
                initial,
                any,
                last,
            } => Some(entry.values(attribute).iter().any(|candidate| {
                substrings_match(candidate, initial.as_deref(), any, last.as_deref())
            })),
            Filter::Present(attribute) => Some(!entry.values(attribute).is_empty()),
            Filter::Unsupported(_) => None,
        }
    }

    pub fn matches(&self, entry: &SearchEntry) -> bool {
        self.evaluate(entry) == Some(true)
    }
}

/// Case-insensitive `initial*any*...*final` match
fn substrings_match(candidate: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let candidate = candidate.to_lowercase();
    let mut rest = candidate.as_str();

    if let Some(initial) = initial {
        let initial = initial.to_lowercase();
        match rest.strip_prefix(initial.as_str()) {
            Some(tail) => rest = tail,
            None => return false,
        }
    }

    for part in any {
        let part = part.to_lowercase();
        match rest.find(part.as_str()) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }

    match last {
        Some(last) => rest.ends_with(last.to_lowercase().as_str()),
        None => true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    /// 0 means no limit
    pub size_limit: i64,
    pub time_limit: i64,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    fn decode(value: &[u8]) -> Result<Self, BerError> {
        let mut reader = BerReader::new(value);
        let base_dn = reader.read_string(OCTET_STRING)?;
        let scope = SearchScope::try_from(reader.read_integer(ENUMERATED)?)?;
        let _deref_aliases = reader.read_integer(ENUMERATED)?;
        let size_limit = reader.read_integer(INTEGER)?;
        let time_limit = reader.read_integer(INTEGER)?;
        let types_only = reader.read_bool(BOOLEAN)?;
        let filter_tlv = reader.read_tlv()?;
        let filter = Filter::decode(filter_tlv.tag, filter_tlv.value, 0)?;

        let mut attributes = Vec::new();
        let mut attribute_reader = BerReader::new(reader.expect(SEQUENCE)?);
        while !attribute_reader.is_empty() {
            attributes.push(attribute_reader.read_string(OCTET_STRING)?);
        }

        Ok(Self {
            base_dn,
            scope,
            size_limit,
            time_limit,
            types_only,
            filter,
            attributes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest { version: i64, name: String },
    UnbindRequest,
    SearchRequest(SearchRequest),
    AbandonRequest,
    /// Any other operation, by its application tag
    Other(u8),
}

impl ProtocolOp {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest { .. } => "bind",
            ProtocolOp::UnbindRequest => "unbind",
            ProtocolOp::SearchRequest(_) => "search",
            ProtocolOp::AbandonRequest => "abandon",
            ProtocolOp::Other(_) => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i64,
    pub op: ProtocolOp,
}

impl LdapMessage {
    /// Decode one frame as returned by [`ber::read_frame`]
    pub fn decode(frame: &[u8]) -> Result<Self, BerError> {
        let mut outer = BerReader::new(frame);
        let mut reader = BerReader::new(outer.expect(SEQUENCE)?);
        let message_id = reader.read_integer(INTEGER)?;
        let op = reader.read_tlv()?;
        // Trailing controls are ignored

        let op = match op.tag {
            BIND_REQUEST => {
                let mut bind = BerReader::new(op.value);
                ProtocolOp::BindRequest {
                    version: bind.read_integer(INTEGER)?,
                    name: bind.read_string(OCTET_STRING)?,
                }
            }
            UNBIND_REQUEST => ProtocolOp::UnbindRequest,
            SEARCH_REQUEST => ProtocolOp::SearchRequest(SearchRequest::decode(op.value)?),
            ABANDON_REQUEST => ProtocolOp::AbandonRequest,
            other => ProtocolOp::Other(other),
        };

        Ok(Self { message_id, op })
    }
}

/// Response tag paired with a request tag, for requests that have one
pub fn response_tag(request_tag: u8) -> Option<u8> {
    match request_tag {
        BIND_REQUEST => Some(BIND_RESPONSE),
        SEARCH_REQUEST => Some(SEARCH_RESULT_DONE),
        0x66 => Some(0x67), // modify
        0x68 => Some(0x69), // add
        0x4a => Some(0x6b), // delete
        0x6c => Some(0x6d), // modify DN
        0x6e => Some(0x6f), // compare
        0x77 => Some(0x78), // extended
        _ => None,
    }
}

/// One directory entry as sent in a SearchResultEntry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: Vec<(String, Vec<String>)>,
}

impl SearchEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    /// Add an attribute; empty value lists are skipped
    pub fn attribute(mut self, name: &str, values: Vec<String>) -> Self {
        if !values.is_empty() {
            self.attributes.push((name.to_string(), values));
        }
        self
    }

    /// Keep only the requested attributes; an empty list or `*` keeps all
    pub fn select(mut self, requested: &[String]) -> Self {
        if requested.is_empty() || requested.iter().any(|a| a == "*") {
            return self;
        }
        self.attributes
            .retain(|(name, _)| requested.iter().any(|r| r.eq_ignore_ascii_case(name)));
        self
    }

    /// Values of `name`, empty when the entry lacks it
    pub fn values(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }
}

fn envelope(message_id: i64, op: Vec<u8>) -> Vec<u8> {
    let mut contents = Vec::with_capacity(op.len() + 6);
    ber::write_integer(&mut contents, INTEGER, message_id);
    contents.extend_from_slice(&op);
    ber::wrap(SEQUENCE, &contents)
}

/// LDAPResult-shaped response (bind response, search done, ...)
pub fn encode_result(
    message_id: i64,
    tag: u8,
    code: ResultCode,
    diagnostic: &str,
) -> Vec<u8> {
    let mut result = Vec::new();
    ber::write_integer(&mut result, ENUMERATED, code as i64);
    ber::write_octets(&mut result, b""); // matchedDN
    ber::write_octets(&mut result, diagnostic.as_bytes());
    envelope(message_id, ber::wrap(tag, &result))
}

pub fn encode_bind_response(message_id: i64) -> Vec<u8> {
    encode_result(message_id, BIND_RESPONSE, ResultCode::Success, "")
}

pub fn encode_search_done(message_id: i64, code: ResultCode, diagnostic: &str) -> Vec<u8> {
    encode_result(message_id, SEARCH_RESULT_DONE, code, diagnostic)
}

pub fn encode_search_entry(message_id: i64, entry: &SearchEntry, types_only: bool) -> Vec<u8> {
    let mut attributes = Vec::new();
    for (name, values) in &entry.attributes {
        let mut value_set = Vec::new();
        if !types_only {
            for value in values {
                ber::write_octets(&mut value_set, value.as_bytes());
            }
        }

        let mut attribute = Vec::new();
        ber::write_octets(&mut attribute, name.as_bytes());
        ber::write_tlv(&mut attribute, SET, &value_set);
        ber::write_tlv(&mut attributes, SEQUENCE, &attribute);
    }

    let mut body = Vec::new();
    ber::write_octets(&mut body, entry.dn.as_bytes());
    ber::write_tlv(&mut body, SEQUENCE, &attributes);
    envelope(message_id, ber::wrap(SEARCH_RESULT_ENTRY, &body))
}
