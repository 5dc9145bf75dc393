//! Directory module: users synced from the external identity provider,
//! organizations, memberships and departments.

pub mod departments;
pub mod members;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::error::{ApiError, ApiResult};
use crate::shared::state::AppState;

// ============================================================================
// DATABASE SCHEMA
// ============================================================================

diesel::table! {
    users (id) {
        id -> Uuid,
        external_id -> Text,
        email -> Text,
        display_name -> Text,
        avatar_url -> Nullable<Text>,
        api_key -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    organizations (id) {
        id -> Uuid,
        name -> Text,
        slug -> Text,
        owner_id -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    organization_members (id) {
        id -> Uuid,
        organization_id -> Uuid,
        user_id -> Uuid,
        role -> Text,
        status -> Text,
        department_id -> Nullable<Uuid>,
        assigned_course_ids -> Jsonb,
        invited_at -> Timestamptz,
        joined_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(users, organizations, organization_members);

// ============================================================================
// DATA MODELS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub external_id: String,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = organizations)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = organization_members)]
pub struct OrganizationMember {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub status: String,
    pub department_id: Option<Uuid>,
    pub assigned_course_ids: serde_json::Value,
    pub invited_at: DateTime<Utc>,
    pub joined_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub use departments::Department;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Invited,
    Active,
}

impl From<&str> for MemberStatus {
    fn from(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            _ => Self::Invited,
        }
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invited => write!(f, "invited"),
            Self::Active => write!(f, "active"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Admin,
    Employee,
}

impl From<&str> for MemberRole {
    fn from(s: &str) -> Self {
        match s {
            "admin" => Self::Admin,
            _ => Self::Employee,
        }
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Employee => write!(f, "employee"),
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("lsk_{}", hex::encode(bytes))
}

pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Decodes a Jsonb uuid-list column; malformed entries are dropped.
pub fn uuid_list(value: &serde_json::Value) -> Vec<Uuid> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// USER SYNC
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SyncUserRequest {
    pub external_id: String,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Upserts a user record from the identity provider. The API key is minted
/// on first sync and never rotated here.
pub async fn sync_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncUserRequest>,
) -> ApiResult<Json<User>> {
    if req.external_id.trim().is_empty() {
        return Err(ApiError::Validation("external_id is required".to_string()));
    }

    let mut conn = state.conn.get()?;
    let now = Utc::now();

    let existing: Option<User> = users::table
        .filter(users::external_id.eq(&req.external_id))
        .first(&mut conn)
        .optional()?;

    let user = match existing {
        Some(user) => {
            diesel::update(users::table.filter(users::id.eq(user.id)))
                .set((
                    users::email.eq(&req.email),
                    users::display_name.eq(&req.display_name),
                    users::avatar_url.eq(req.avatar_url.clone()),
                    users::updated_at.eq(now),
                ))
                .execute(&mut conn)?;
            users::table.filter(users::id.eq(user.id)).first(&mut conn)?
        }
        None => {
            let user = User {
                id: Uuid::new_v4(),
                external_id: req.external_id,
                email: req.email,
                display_name: req.display_name,
                avatar_url: req.avatar_url,
                api_key: generate_api_key(),
                created_at: now,
                updated_at: now,
            };
            diesel::insert_into(users::table)
                .values(&user)
                .execute(&mut conn)?;
            user
        }
    };

    Ok(Json(user))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<User>> {
    let mut conn = state.conn.get()?;
    let user: User = users::table
        .filter(users::id.eq(id))
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    Ok(Json(user))
}

// ============================================================================
// ORGANIZATIONS
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateOrganizationRequest {
    pub name: String,
    pub owner_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct OrganizationListQuery {
    pub owner_id: Option<Uuid>,
}

pub async fn create_organization(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrganizationRequest>,
) -> ApiResult<(StatusCode, Json<Organization>)> {
    if req.name.trim().is_empty() {
        return Err(ApiError::Validation(
            "organization name is required".to_string(),
        ));
    }

    let mut conn = state.conn.get()?;
    let now = Utc::now();

    let org = Organization {
        id: Uuid::new_v4(),
        slug: slugify(&req.name),
        name: req.name,
        owner_id: req.owner_id,
        created_at: now,
        updated_at: now,
    };

    conn.transaction::<_, ApiError, _>(|conn| {
        diesel::insert_into(organizations::table)
            .values(&org)
            .execute(conn)?;

        // The owner is an active admin member from day one.
        let member = OrganizationMember {
            id: Uuid::new_v4(),
            organization_id: org.id,
            user_id: org.owner_id,
            role: MemberRole::Admin.to_string(),
            status: MemberStatus::Active.to_string(),
            department_id: None,
            assigned_course_ids: serde_json::json!([]),
            invited_at: now,
            joined_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(organization_members::table)
            .values(&member)
            .execute(conn)?;

        Ok(())
    })?;

    Ok((StatusCode::CREATED, Json(org)))
}

pub async fn list_organizations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrganizationListQuery>,
) -> ApiResult<Json<Vec<Organization>>> {
    let mut conn = state.conn.get()?;

    let mut q = organizations::table.into_boxed();
    if let Some(owner_id) = query.owner_id {
        q = q.filter(organizations::owner_id.eq(owner_id));
    }

    Ok(Json(
        q.order(organizations::created_at.desc())
            .load::<Organization>(&mut conn)?,
    ))
}

pub async fn get_organization(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Organization>> {
    let mut conn = state.conn.get()?;
    let org: Organization = organizations::table
        .filter(organizations::id.eq(id))
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("Organization not found".to_string()))?;
    Ok(Json(org))
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrganizationRequest {
    pub name: Option<String>,
}

pub async fn update_organization(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateOrganizationRequest>,
) -> ApiResult<Json<Organization>> {
    let mut conn = state.conn.get()?;

    if let Some(name) = req.name {
        if name.trim().is_empty() {
            return Err(ApiError::Validation(
                "organization name is required".to_string(),
            ));
        }
        diesel::update(organizations::table.filter(organizations::id.eq(id)))
            .set((
                organizations::slug.eq(slugify(&name)),
                organizations::name.eq(name),
                organizations::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
    }

    let org: Organization = organizations::table
        .filter(organizations::id.eq(id))
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("Organization not found".to_string()))?;
    Ok(Json(org))
}

/// Cascades members, departments, enrollments, lesson progress, quiz
/// attempts, events and rollups in one transaction.
pub async fn delete_organization(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    use self::departments::departments as depts;
    use crate::analytics::{analytics_events, analytics_rollups};
    use crate::learn::{courses, enrollments, lesson_progress, quiz_attempts};

    let mut conn = state.conn.get()?;

    conn.transaction::<_, ApiError, _>(|conn| {
        let course_ids: Vec<Uuid> = courses::table
            .filter(courses::organization_id.eq(id))
            .select(courses::id)
            .load(conn)?;

        if !course_ids.is_empty() {
            diesel::delete(
                lesson_progress::table.filter(lesson_progress::course_id.eq_any(&course_ids)),
            )
            .execute(conn)?;
            diesel::delete(
                quiz_attempts::table.filter(quiz_attempts::course_id.eq_any(&course_ids)),
            )
            .execute(conn)?;
        }

        diesel::delete(enrollments::table.filter(enrollments::organization_id.eq(id)))
            .execute(conn)?;
        diesel::delete(courses::table.filter(courses::organization_id.eq(id))).execute(conn)?;
        diesel::delete(
            analytics_events::table.filter(analytics_events::organization_id.eq(id)),
        )
        .execute(conn)?;
        diesel::delete(
            analytics_rollups::table.filter(analytics_rollups::organization_id.eq(id)),
        )
        .execute(conn)?;
        diesel::delete(
            organization_members::table.filter(organization_members::organization_id.eq(id)),
        )
        .execute(conn)?;
        diesel::delete(depts::table.filter(depts::organization_id.eq(id))).execute(conn)?;

        let deleted =
            diesel::delete(organizations::table.filter(organizations::id.eq(id))).execute(conn)?;
        if deleted == 0 {
            return Err(ApiError::NotFound("Organization not found".to_string()));
        }

        Ok(())
    })?;

    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// ROUTE CONFIGURATION
// ============================================================================

pub fn configure_directory_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Users
        .route("/api/users/sync", post(sync_user))
        .route("/api/users/:id", get(get_user))
        // Organizations
        .route("/api/orgs", get(list_organizations).post(create_organization))
        .route(
            "/api/orgs/:id",
            get(get_organization)
                .put(update_organization)
                .delete(delete_organization),
        )
        // Members
        .route(
            "/api/orgs/:id/members",
            get(members::list_members).post(members::invite_member),
        )
        .route(
            "/api/orgs/:id/members/import",
            post(members::import_members),
        )
        .route(
            "/api/orgs/:id/members/:member_id",
            put(members::update_member).delete(members::remove_member),
        )
        .route(
            "/api/orgs/:id/members/:member_id/activate",
            post(members::activate_member),
        )
        // Departments
        .route(
            "/api/orgs/:id/departments",
            get(departments::list_departments).post(departments::create_department),
        )
        .route(
            "/api/orgs/:id/departments/:department_id",
            get(departments::get_department)
                .put(departments::update_department)
                .delete(departments::delete_department),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Acme Corp"), "acme-corp");
        assert_eq!(slugify("  Weird -- Name!  "), "weird-name");
        assert_eq!(slugify("ALLCAPS"), "allcaps");
    }

    #[test]
    fn test_member_status_conversion() {
        assert_eq!(MemberStatus::from("active"), MemberStatus::Active);
        assert_eq!(MemberStatus::from("invited"), MemberStatus::Invited);
        assert_eq!(MemberStatus::from("garbage"), MemberStatus::Invited);
        assert_eq!(MemberStatus::Active.to_string(), "active");
    }

    #[test]
    fn test_member_role_conversion() {
        assert_eq!(MemberRole::from("admin"), MemberRole::Admin);
        assert_eq!(MemberRole::from("employee"), MemberRole::Employee);
        assert_eq!(MemberRole::from("other"), MemberRole::Employee);
    }

    #[test]
    fn test_generate_api_key_shape() {
        let key = generate_api_key();
        assert!(key.starts_with("lsk_"));
        assert_eq!(key.len(), 4 + 48);
        assert_ne!(key, generate_api_key());
    }

    #[test]
    fn test_uuid_list_drops_malformed() {
        let id = Uuid::new_v4();
        let value = serde_json::json!([id.to_string(), "not-a-uuid", 42]);
        assert_eq!(uuid_list(&value), vec![id]);
        assert!(uuid_list(&serde_json::json!({"a": 1})).is_empty());
    }
}
