/// Read-only CardDAV view of the address list
///
/// `/carddav/users/` holds one vCard per person with an address and
/// `/carddav/groups/` one per group, naming its direct members. Covers what
/// address book clients need to sync a read-only collection: OPTIONS,
/// PROPFIND, REPORT and GET. In snapshot mode the cards come from memory.
use crate::{
    context::AppContext,
    directory::{Contact, GroupRecord, IdentityRecord},
    error::{ResolverError, ResolverResult},
};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

const ROOT: &str = "/carddav/";
const DAV_CLASSES: &str = "1, 2, 3, addressbook";
const ALLOWED: &str = "OPTIONS, GET, HEAD, PROPFIND, REPORT";
const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";
const VCARD_CONTENT_TYPE: &str = "text/vcard; charset=utf-8";

/// Build CardDAV routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/carddav", any(root))
        .route("/carddav/", any(root))
        .route("/carddav/:collection", any(collection))
        .route("/carddav/:collection/", any(collection))
        .route("/carddav/:collection/:resource", any(resource))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    Users,
    Groups,
}

impl Collection {
    fn parse(name: &str) -> ResolverResult<Self> {
        match name {
            "users" => Ok(Collection::Users),
            "groups" => Ok(Collection::Groups),
            other => Err(ResolverError::NotFound(format!(
                "No address book named '{}'",
                other
            ))),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Groups => "groups",
        }
    }

    fn display_name(self) -> &'static str {
        match self {
            Collection::Users => "GAL Users",
            Collection::Groups => "GAL Groups",
        }
    }

    fn href(self) -> String {
        format!("{}{}/", ROOT, self.name())
    }
}

/// One vCard resource of a collection
struct Card {
    id: String,
    display_name: String,
    vcard: String,
    etag: String,
}

impl Card {
    fn new(contact: &Contact, vcard: String) -> Self {
        let etag = format!("\"{}\"", hex::encode(Sha256::digest(vcard.as_bytes())));
        Self {
            id: contact.id.clone(),
            display_name: contact.display_name().to_string(),
            vcard,
            etag,
        }
    }

    fn href(&self, collection: Collection) -> String {
        format!("{}{}.vcf", collection.href(), self.id)
    }
}

/// Cards of `collection`, in directory order
async fn cards(ctx: &AppContext, collection: Collection) -> ResolverResult<Vec<Card>> {
    let records = ctx.dispatcher.list_directory().await?;
    let addresses = address_table(&records);

    Ok(records
        .iter()
        .filter_map(|record| match (collection, record) {
            (Collection::Users, IdentityRecord::Leaf(contact))
                if stored(&contact.primary_address).is_some() =>
            {
                Some(Card::new(contact, person_vcard(contact)))
            }
            (Collection::Groups, IdentityRecord::Group(group)) => {
                Some(Card::new(&group.contact, group_vcard(group, &addresses)))
            }
            _ => None,
        })
        .collect())
}

/// /carddav/
async fn root(method: Method, headers: HeaderMap) -> Response {
    match method.as_str() {
        "OPTIONS" => options(),
        "PROPFIND" => {
            let mut xml = Multistatus::new();
            xml.collection(ROOT, "Global Address Books", false);
            if depth(&headers) != "0" {
                for collection in [Collection::Users, Collection::Groups] {
                    xml.collection(&collection.href(), collection.display_name(), true);
                }
            }
            xml.into_response()
        }
        _ => not_allowed(),
    }
}

/// /carddav/:collection/
async fn collection(
    method: Method,
    headers: HeaderMap,
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
    body: String,
) -> ResolverResult<Response> {
    let collection = Collection::parse(&name)?;

    match method.as_str() {
        "OPTIONS" => Ok(options()),
        "PROPFIND" => {
            let mut xml = Multistatus::new();
            xml.collection(&collection.href(), collection.display_name(), true);
            if depth(&headers) != "0" {
                for card in cards(&ctx, collection).await? {
                    xml.card_properties(&card.href(collection), &card);
                }
            }
            Ok(xml.into_response())
        }
        "REPORT" => {
            let cards = cards(&ctx, collection).await?;
            let requested = requested_hrefs(&body);
            tracing::debug!(
                collection = collection.name(),
                requested = requested.len(),
                "carddav report"
            );

            let mut xml = Multistatus::new();
            if requested.is_empty() {
                for card in &cards {
                    xml.card_data(&card.href(collection), card);
                }
            } else {
                let by_id: HashMap<&str, &Card> =
                    cards.iter().map(|card| (card.id.as_str(), card)).collect();
                for href in &requested {
                    match resource_id(href).and_then(|id| by_id.get(id)) {
                        Some(card) => xml.card_data(href, card),
                        None => xml.missing(href),
                    }
                }
            }
            Ok(xml.into_response())
        }
        _ => Ok(not_allowed()),
    }
}

/// /carddav/:collection/:id.vcf
async fn resource(
    method: Method,
    State(ctx): State<AppContext>,
    Path((name, resource)): Path<(String, String)>,
) -> ResolverResult<Response> {
    let collection = Collection::parse(&name)?;
    if method == Method::OPTIONS {
        return Ok(options());
    }

    let not_found = || ResolverError::NotFound(format!("No contact '{}' in {}", resource, collection.name()));
    let id = resource_id(&resource).ok_or_else(not_found)?;
    let card = cards(&ctx, collection)
        .await?
        .into_iter()
        .find(|card| card.id == id)
        .ok_or_else(not_found)?;

    match method.as_str() {
        "GET" | "HEAD" => {
            let etag = card.etag.clone();
            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, VCARD_CONTENT_TYPE.to_string()),
                    (header::ETAG, etag),
                ],
                card.vcard,
            )
                .into_response())
        }
        "PROPFIND" => {
            let mut xml = Multistatus::new();
            xml.card_properties(&card.href(collection), &card);
            Ok(xml.into_response())
        }
        _ => Ok(not_allowed()),
    }
}

fn options() -> Response {
    (
        StatusCode::OK,
        [
            (HeaderName::from_static("dav"), DAV_CLASSES),
            (header::ALLOW, ALLOWED),
        ],
    )
        .into_response()
}

fn not_allowed() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, ALLOWED)]).into_response()
}

/// `Depth` header; absent means 0
fn depth(headers: &HeaderMap) -> &str {
    headers
        .get("depth")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or("0")
}

/// `alice.vcf` or `/carddav/users/alice.vcf` -> `alice`
fn resource_id(href: &str) -> Option<&str> {
    href.trim_end_matches('/')
        .rsplit('/')
        .next()?
        .strip_suffix(".vcf")
        .filter(|id| !id.is_empty())
}

/// Text of every `href` element in a REPORT body, whatever its prefix
fn requested_hrefs(body: &str) -> Vec<String> {
    let mut hrefs = Vec::new();
    let mut rest = body;

    while let Some(open) = rest.find('<') {
        rest = &rest[open + 1..];
        let Some(close) = rest.find('>') else { break };
        let tag = &rest[..close];
        rest = &rest[close + 1..];

        let name = tag.split_whitespace().next().unwrap_or_default();
        if name.starts_with('/') || tag.ends_with('/') {
            continue;
        }
        if name.rsplit(':').next() != Some("href") {
            continue;
        }
        if let Some(end) = rest.find('<') {
            let text = unescape_xml(rest[..end].trim());
            if !text.is_empty() {
                hrefs.push(text);
            }
        }
    }

    hrefs
}

/// WebDAV multistatus document under construction
struct Multistatus {
    body: String,
}

impl Multistatus {
    fn new() -> Self {
        Self {
            body: String::from(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
                 <D:multistatus xmlns:D=\"DAV:\" xmlns:CARD=\"urn:ietf:params:xml:ns:carddav\">\n",
            ),
        }
    }

    fn collection(&mut self, href: &str, display_name: &str, address_book: bool) {
        let properties = if address_book {
            format!(
                "<D:displayname>{}</D:displayname>\
                 <D:resourcetype><D:collection/><CARD:addressbook/></D:resourcetype>\
                 <D:getcontenttype>text/vcard</D:getcontenttype>",
                escape_xml(display_name)
            )
        } else {
            format!(
                "<D:displayname>{}</D:displayname><D:resourcetype><D:collection/></D:resourcetype>",
                escape_xml(display_name)
            )
        };
        self.found(href, &properties);
    }

    fn card_properties(&mut self, href: &str, card: &Card) {
        self.found(
            href,
            &format!(
                "<D:displayname>{}</D:displayname><D:getcontenttype>{}</D:getcontenttype>\
                 <D:getetag>{}</D:getetag><D:resourcetype/>",
                escape_xml(&card.display_name),
                VCARD_CONTENT_TYPE,
                escape_xml(&card.etag)
            ),
        );
    }

    fn card_data(&mut self, href: &str, card: &Card) {
        self.found(
            href,
            &format!(
                "<D:getetag>{}</D:getetag><CARD:address-data>{}</CARD:address-data>",
                escape_xml(&card.etag),
                escape_xml(&card.vcard)
            ),
        );
    }

    fn missing(&mut self, href: &str) {
        self.body.push_str(&format!(
            "<D:response><D:href>{}</D:href><D:status>HTTP/1.1 404 Not Found</D:status></D:response>\n",
            escape_xml(href)
        ));
    }

    fn found(&mut self, href: &str, properties: &str) {
        self.body.push_str(&format!(
            "<D:response><D:href>{}</D:href><D:propstat><D:prop>{}</D:prop>\
             <D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>\n",
            escape_xml(href),
            properties
        ));
    }
}

impl IntoResponse for Multistatus {
    fn into_response(mut self) -> Response {
        self.body.push_str("</D:multistatus>\n");
        (
            StatusCode::MULTI_STATUS,
            [(header::CONTENT_TYPE, XML_CONTENT_TYPE)],
            self.body,
        )
            .into_response()
    }
}

fn person_vcard(contact: &Contact) -> String {
    let (given, family) = name_parts(contact);
    let mut lines = vec![
        "BEGIN:VCARD".to_string(),
        "VERSION:3.0".to_string(),
        format!("UID:{}", escape_text(&contact.id)),
        format!("FN:{}", escape_text(contact.display_name())),
        format!("N:{};{};;;", escape_text(family), escape_text(given)),
        format!("EMAIL;TYPE=INTERNET:{}", escape_text(contact.primary_address())),
    ];
    if let Some(organization) = stored(&contact.organization) {
        lines.push(format!("ORG:{}", escape_text(organization)));
    }
    if let Some(telephone) = stored(&contact.telephone) {
        lines.push(format!("TEL;TYPE=WORK:{}", escape_text(telephone)));
    }
    lines.push("END:VCARD".to_string());
    vcard(lines)
}

/// Group card listing the address of every direct member that resolves
fn group_vcard(group: &GroupRecord, addresses: &HashMap<&str, &str>) -> String {
    let contact = &group.contact;
    let mut lines = vec![
        "BEGIN:VCARD".to_string(),
        "VERSION:3.0".to_string(),
        format!("UID:{}", escape_text(&contact.id)),
        format!("FN:{}", escape_text(contact.display_name())),
        format!("N:{};;;;", escape_text(contact.display_name())),
        "KIND:group".to_string(),
        "X-ADDRESSBOOKSERVER-KIND:group".to_string(),
        format!("EMAIL;TYPE=INTERNET:{}", escape_text(contact.primary_address())),
    ];

    let mut seen = HashSet::new();
    for token in group.member_tokens() {
        if let Some(address) = addresses.get(token) {
            if seen.insert(*address) {
                lines.push(format!("X-ADDRESSBOOKSERVER-MEMBER:mailto:{}", address));
            }
        }
    }

    lines.push("END:VCARD".to_string());
    vcard(lines)
}

fn vcard(lines: Vec<String>) -> String {
    let mut card = lines.join("\r\n");
    card.push_str("\r\n");
    card
}

/// Address for every key a member token may use; an id wins over an address
fn address_table(records: &[IdentityRecord]) -> HashMap<&str, &str> {
    let mut table = HashMap::with_capacity(records.len() * 2);
    for record in records {
        table
            .entry(record.id())
            .or_insert_with(|| record.contact().primary_address());
    }
    for record in records {
        if let Some(address) = stored(&record.contact().primary_address) {
            table
                .entry(address)
                .or_insert_with(|| record.contact().primary_address());
        }
    }
    table
}

/// Given and family name, split from the display name when not stored
fn name_parts(contact: &Contact) -> (&str, &str) {
    let display = contact.display_name();
    let (given, family) = match display.rsplit_once(' ') {
        Some((given, family)) => (given.trim(), family.trim()),
        None => ("", display),
    };
    (
        stored(&contact.given_name).unwrap_or(given),
        stored(&contact.surname).unwrap_or(family),
    )
}

fn stored(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// vCard 3.0 text value escaping
fn escape_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            ',' => escaped.push_str("\\,"),
            ';' => escaped.push_str("\\;"),
            '\n' => escaped.push_str("\\n"),
            '\r' => {}
            other => escaped.push(other),
        }
    }
    escaped
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::test_config, directory::DirectoryIndex, server::build_router};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let records = vec![
            IdentityRecord::Leaf(
                Contact::new("alice")
                    .with_display_name("Alice Anders")
                    .with_address("alice@x"),
            ),
            IdentityRecord::Leaf(Contact::new("bob").with_address("bob@x")),
            IdentityRecord::Leaf(Contact::new("carol")),
            IdentityRecord::Group(GroupRecord::new(
                Contact::new("team").with_address("team@x"),
                "alice bob@x ghost alice@x",
            )),
        ];
        let ctx = AppContext::with_directory(
            test_config(),
            Arc::new(DirectoryIndex::from_records(records)),
        );
        build_router(ctx)
    }

    async fn send(method: &str, uri: &str, depth: Option<&str>, body: &str) -> (StatusCode, HeaderMap, String) {
        let mut request = Request::builder()
            .method(Method::from_bytes(method.as_bytes()).unwrap())
            .uri(uri);
        if let Some(depth) = depth {
            request = request.header("Depth", depth);
        }
        let response = app()
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_options_advertises_addressbook() {
        let (status, headers, _) = send("OPTIONS", "/carddav/users/", None, "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers["dav"].to_str().unwrap().contains("addressbook"));
        assert!(headers["allow"].to_str().unwrap().contains("PROPFIND"));
    }

    #[tokio::test]
    async fn test_propfind_root_and_collections() {
        let (status, _, body) = send("PROPFIND", "/carddav/", Some("1"), "").await;
        assert_eq!(status, StatusCode::MULTI_STATUS);
        assert!(body.contains("<D:href>/carddav/users/</D:href>"));
        assert!(body.contains("<D:href>/carddav/groups/</D:href>"));

        let (status, headers, body) = send("PROPFIND", "/carddav/users/", Some("1"), "").await;
        assert_eq!(status, StatusCode::MULTI_STATUS);
        assert_eq!(headers["content-type"], XML_CONTENT_TYPE);
        assert!(body.contains("/carddav/users/alice.vcf"));
        assert!(body.contains("/carddav/users/bob.vcf"));
        // No address, nothing to put on a card
        assert!(!body.contains("carol"));
        assert!(!body.contains("team.vcf"));

        let (_, _, shallow) = send("PROPFIND", "/carddav/users", None, "").await;
        assert!(!shallow.contains("alice.vcf"));
    }

    #[tokio::test]
    async fn test_get_person_card() {
        let (status, headers, body) = send("GET", "/carddav/users/alice.vcf", None, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], VCARD_CONTENT_TYPE);
        assert!(body.starts_with("BEGIN:VCARD\r\nVERSION:3.0\r\n"));
        assert!(body.contains("FN:Alice Anders\r\n"));
        assert!(body.contains("N:Anders;Alice;;;\r\n"));
        assert!(body.contains("EMAIL;TYPE=INTERNET:alice@x\r\n"));

        let etag = headers["etag"].to_str().unwrap().to_string();
        let (_, _, listing) = send("PROPFIND", "/carddav/users/", Some("1"), "").await;
        assert!(listing.contains(&escape_xml(&etag)));
    }

    #[tokio::test]
    async fn test_group_card_lists_resolvable_members_once() {
        let (status, _, body) = send("GET", "/carddav/groups/team.vcf", None, "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("KIND:group\r\n"));
        assert_eq!(body.matches("X-ADDRESSBOOKSERVER-MEMBER:mailto:alice@x").count(), 1);
        assert!(body.contains("X-ADDRESSBOOKSERVER-MEMBER:mailto:bob@x"));
        assert!(!body.contains("ghost"));
    }

    #[tokio::test]
    async fn test_report_multiget() {
        let request = r#"<?xml version="1.0"?>
<C:addressbook-multiget xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:carddav">
  <D:prop><D:getetag/><C:address-data/></D:prop>
  <D:href>/carddav/users/bob.vcf</D:href>
  <D:href>/carddav/users/nobody.vcf</D:href>
</C:addressbook-multiget>"#;

        let (status, _, body) = send("REPORT", "/carddav/users/", None, request).await;
        assert_eq!(status, StatusCode::MULTI_STATUS);
        assert!(body.contains("EMAIL;TYPE=INTERNET:bob@x"));
        assert!(!body.contains("alice@x"));
        assert!(body.contains("HTTP/1.1 404 Not Found"));

        let (_, _, everything) = send("REPORT", "/carddav/groups/", None, "").await;
        assert!(everything.contains("/carddav/groups/team.vcf"));
        assert!(everything.contains("<CARD:address-data>BEGIN:VCARD"));
    }

    #[tokio::test]
    async fn test_unknown_resources_and_methods() {
        let (status, _, _) = send("GET", "/carddav/users/nobody.vcf", None, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send("PROPFIND", "/carddav/calendars/", Some("1"), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, headers, _) = send("PUT", "/carddav/users/alice.vcf", None, "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(headers["allow"], ALLOWED);
    }

    #[test]
    fn test_requested_hrefs() {
        let body = "<d:href>/a/x.vcf</d:href><href> y.vcf </href><D:href/><D:prop>z</D:prop>\
                    <D:href>/a/b&amp;c.vcf</D:href>";
        assert_eq!(requested_hrefs(body), vec!["/a/x.vcf", "y.vcf", "/a/b&c.vcf"]);
        assert!(requested_hrefs("not xml").is_empty());
        assert_eq!(resource_id("/carddav/users/alice.vcf"), Some("alice"));
        assert_eq!(resource_id("/carddav/users/"), None);
    }

    #[test]
    fn test_text_escaping() {
        assert_eq!(escape_text("a,b;c\\d\r\ne"), "a\\,b\\;c\\\\d\\ne");
        assert_eq!(escape_xml("<a & 'b'>"), "&lt;a &amp; &apos;b&apos;&gt;");
    }
}
