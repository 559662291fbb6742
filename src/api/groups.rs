/// Group resolution endpoints
/// The query endpoint used by the address book frontend plus its per-group members route
use crate::{
    context::AppContext,
    dispatch::{Operation, ResolutionRequest},
    error::ResolverResult,
    format::{self, MembersResponse, WireRecord},
};
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

/// Build group routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/group-resolver", get(group_resolver))
        .route(
            "/SOGo/so/:login/Contacts/:addressbook/:group_id/members",
            get(user_group_members),
        )
        .route("/Contacts/:addressbook/:group_id/members", get(group_members))
}

/// Query string of `/group-resolver`
#[derive(Debug, Deserialize)]
pub struct GroupResolverParams {
    /// Target id or address
    #[serde(default)]
    pub email: Option<String>,
    /// `check`, `members` or `expand`; defaults to `members`
    #[serde(default)]
    pub action: Option<String>,
}

/// GET /group-resolver
pub async fn group_resolver(
    State(ctx): State<AppContext>,
    Query(params): Query<GroupResolverParams>,
) -> ResolverResult<Json<WireRecord>> {
    let operation = match params.action.as_deref() {
        Some(action) => action.parse::<Operation>()?,
        None => Operation::Expand,
    };
    let request = ResolutionRequest::new(params.email.unwrap_or_default(), operation);

    let result = ctx.dispatcher.dispatch(&request).await?;
    Ok(Json(format::format(&result)))
}

/// Path segments of the frontend's members route
#[derive(Debug, Deserialize)]
pub struct MembersPath {
    pub addressbook: String,
    pub group_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UserMembersPath {
    pub login: String,
    pub addressbook: String,
    pub group_id: String,
}

/// GET /SOGo/so/:login/Contacts/:addressbook/:group_id/members
pub async fn user_group_members(
    State(ctx): State<AppContext>,
    Path(path): Path<UserMembersPath>,
) -> ResolverResult<Json<MembersResponse>> {
    tracing::debug!(
        login = %path.login,
        addressbook = %path.addressbook,
        group_id = %path.group_id,
        "members requested"
    );
    members(&ctx, &path.group_id).await
}

/// GET /Contacts/:addressbook/:group_id/members
pub async fn group_members(
    State(ctx): State<AppContext>,
    Path(path): Path<MembersPath>,
) -> ResolverResult<Json<MembersResponse>> {
    tracing::debug!(
        addressbook = %path.addressbook,
        group_id = %path.group_id,
        "members requested"
    );
    members(&ctx, &path.group_id).await
}

async fn members(ctx: &AppContext, group_id: &str) -> ResolverResult<Json<MembersResponse>> {
    let expansion = ctx.dispatcher.expand(group_id).await?;
    Ok(Json(MembersResponse {
        members: format::member_records(&expansion.members),
    }))
}
