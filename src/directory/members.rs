//! Organization membership lifecycle: invite, activate, update, remove,
//! plus bulk import of employee rosters.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use diesel::prelude::*;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    departments::departments, generate_api_key, organization_members, organizations, users,
    uuid_list, Department, MemberRole, MemberStatus, OrganizationMember, User,
};
use crate::learn::enrollments_api::auto_enroll_member;
use crate::shared::error::{ApiError, ApiResult};
use crate::shared::state::AppState;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

// ============================================================================
// INVITE / ACTIVATE
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InviteMemberRequest {
    pub user_id: Uuid,
    pub role: Option<String>,
    pub department_id: Option<Uuid>,
}

pub async fn invite_member(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<InviteMemberRequest>,
) -> ApiResult<(StatusCode, Json<OrganizationMember>)> {
    let mut conn = state.conn.get()?;

    let org_exists: Option<Uuid> = organizations::table
        .filter(organizations::id.eq(org_id))
        .select(organizations::id)
        .first(&mut conn)
        .optional()?;
    if org_exists.is_none() {
        return Err(ApiError::NotFound("Organization not found".to_string()));
    }

    let user_exists: Option<Uuid> = users::table
        .filter(users::id.eq(req.user_id))
        .select(users::id)
        .first(&mut conn)
        .optional()?;
    if user_exists.is_none() {
        return Err(ApiError::NotFound("User not found".to_string()));
    }

    let existing: Option<Uuid> = organization_members::table
        .filter(organization_members::organization_id.eq(org_id))
        .filter(organization_members::user_id.eq(req.user_id))
        .select(organization_members::id)
        .first(&mut conn)
        .optional()?;
    if existing.is_some() {
        return Err(ApiError::Conflict(
            "User is already a member of this organization".to_string(),
        ));
    }

    if let Some(department_id) = req.department_id {
        let dept: Option<Uuid> = departments::table
            .filter(departments::id.eq(department_id))
            .filter(departments::organization_id.eq(org_id))
            .select(departments::id)
            .first(&mut conn)
            .optional()?;
        if dept.is_none() {
            return Err(ApiError::NotFound("Department not found".to_string()));
        }
    }

    let role = MemberRole::from(req.role.as_deref().unwrap_or("employee"));
    let now = Utc::now();
    let member = OrganizationMember {
        id: Uuid::new_v4(),
        organization_id: org_id,
        user_id: req.user_id,
        role: role.to_string(),
        status: MemberStatus::Invited.to_string(),
        department_id: req.department_id,
        assigned_course_ids: serde_json::json!([]),
        invited_at: now,
        joined_at: None,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(organization_members::table)
        .values(&member)
        .execute(&mut conn)?;

    Ok((StatusCode::CREATED, Json(member)))
}

/// Marks an invited member active. If the member sits in a department with
/// auto-enroll on, its default courses are enrolled in the same transaction.
pub async fn activate_member(
    State(state): State<Arc<AppState>>,
    Path((org_id, member_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<OrganizationMember>> {
    let mut conn = state.conn.get()?;

    let member = conn.transaction::<OrganizationMember, ApiError, _>(|conn| {
        let member: OrganizationMember = organization_members::table
            .filter(organization_members::id.eq(member_id))
            .filter(organization_members::organization_id.eq(org_id))
            .first(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("Member not found".to_string()))?;

        if MemberStatus::from(member.status.as_str()) == MemberStatus::Active {
            return Ok(member);
        }

        let now = Utc::now();
        diesel::update(organization_members::table.filter(organization_members::id.eq(member_id)))
            .set((
                organization_members::status.eq(MemberStatus::Active.to_string()),
                organization_members::joined_at.eq(Some(now)),
                organization_members::updated_at.eq(now),
            ))
            .execute(conn)?;

        let mut course_ids = uuid_list(&member.assigned_course_ids);
        if let Some(department_id) = member.department_id {
            let dept: Option<Department> = departments::table
                .filter(departments::id.eq(department_id))
                .first(conn)
                .optional()?;
            if let Some(dept) = dept {
                if dept.auto_enroll {
                    course_ids.extend(uuid_list(&dept.default_course_ids));
                }
            }
        }
        course_ids.sort();
        course_ids.dedup();
        if !course_ids.is_empty() {
            let enrolled = auto_enroll_member(conn, org_id, member.user_id, &course_ids)?;
            log::info!(
                "Auto-enrolled member {} into {} course(s)",
                member_id,
                enrolled
            );
        }

        Ok(organization_members::table
            .filter(organization_members::id.eq(member_id))
            .first(conn)?)
    })?;

    Ok(Json(member))
}

// ============================================================================
// UPDATE / LIST / REMOVE
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub role: Option<String>,
    pub department_id: Option<Uuid>,
    pub assigned_course_ids: Option<Vec<Uuid>>,
}

pub async fn update_member(
    State(state): State<Arc<AppState>>,
    Path((org_id, member_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateMemberRequest>,
) -> ApiResult<Json<OrganizationMember>> {
    let mut conn = state.conn.get()?;

    let existing: Option<Uuid> = organization_members::table
        .filter(organization_members::id.eq(member_id))
        .filter(organization_members::organization_id.eq(org_id))
        .select(organization_members::id)
        .first(&mut conn)
        .optional()?;
    if existing.is_none() {
        return Err(ApiError::NotFound("Member not found".to_string()));
    }

    if let Some(role) = req.role {
        let role = MemberRole::from(role.as_str());
        diesel::update(organization_members::table.filter(organization_members::id.eq(member_id)))
            .set(organization_members::role.eq(role.to_string()))
            .execute(&mut conn)?;
    }
    if let Some(department_id) = req.department_id {
        let dept: Option<Uuid> = departments::table
            .filter(departments::id.eq(department_id))
            .filter(departments::organization_id.eq(org_id))
            .select(departments::id)
            .first(&mut conn)
            .optional()?;
        if dept.is_none() {
            return Err(ApiError::NotFound("Department not found".to_string()));
        }
        diesel::update(organization_members::table.filter(organization_members::id.eq(member_id)))
            .set(organization_members::department_id.eq(Some(department_id)))
            .execute(&mut conn)?;
    }
    if let Some(course_ids) = req.assigned_course_ids {
        let doc = serde_json::json!(course_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>());
        diesel::update(organization_members::table.filter(organization_members::id.eq(member_id)))
            .set(organization_members::assigned_course_ids.eq(doc))
            .execute(&mut conn)?;
    }
    diesel::update(organization_members::table.filter(organization_members::id.eq(member_id)))
        .set(organization_members::updated_at.eq(Utc::now()))
        .execute(&mut conn)?;

    let member: OrganizationMember = organization_members::table
        .filter(organization_members::id.eq(member_id))
        .first(&mut conn)?;
    Ok(Json(member))
}

#[derive(Debug, Deserialize)]
pub struct MemberListQuery {
    pub status: Option<String>,
    pub role: Option<String>,
    pub department_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct MemberDetail {
    #[serde(flatten)]
    pub member: OrganizationMember,
    pub email: String,
    pub display_name: String,
}

pub async fn list_members(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<Uuid>,
    Query(query): Query<MemberListQuery>,
) -> ApiResult<Json<Vec<MemberDetail>>> {
    let mut conn = state.conn.get()?;

    let mut q = organization_members::table
        .inner_join(users::table.on(users::id.eq(organization_members::user_id)))
        .filter(organization_members::organization_id.eq(org_id))
        .into_boxed();

    if let Some(status) = query.status {
        q = q.filter(organization_members::status.eq(MemberStatus::from(status.as_str()).to_string()));
    }
    if let Some(role) = query.role {
        q = q.filter(organization_members::role.eq(MemberRole::from(role.as_str()).to_string()));
    }
    if let Some(department_id) = query.department_id {
        q = q.filter(organization_members::department_id.eq(Some(department_id)));
    }

    let rows: Vec<(OrganizationMember, User)> = q
        .order(organization_members::created_at.asc())
        .load(&mut conn)?;

    Ok(Json(
        rows.into_iter()
            .map(|(member, user)| MemberDetail {
                member,
                email: user.email,
                display_name: user.display_name,
            })
            .collect(),
    ))
}

pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    Path((org_id, member_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    let mut conn = state.conn.get()?;

    let deleted = diesel::delete(
        organization_members::table
            .filter(organization_members::id.eq(member_id))
            .filter(organization_members::organization_id.eq(org_id)),
    )
    .execute(&mut conn)?;

    if deleted == 0 {
        return Err(ApiError::NotFound("Member not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// BULK IMPORT
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ImportRow {
    pub email: String,
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub department_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportOutcome {
    Imported,
    Skipped,
    Errored,
}

#[derive(Debug, Serialize)]
pub struct ImportRowResult {
    pub row: usize,
    pub email: String,
    pub outcome: ImportOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImportReport {
    pub total: usize,
    pub imported: usize,
    pub skipped: usize,
    pub errored: usize,
    pub rows: Vec<ImportRowResult>,
}

impl ImportReport {
    pub fn from_rows(rows: Vec<ImportRowResult>) -> Self {
        let imported = rows
            .iter()
            .filter(|r| r.outcome == ImportOutcome::Imported)
            .count();
        let skipped = rows
            .iter()
            .filter(|r| r.outcome == ImportOutcome::Skipped)
            .count();
        let errored = rows
            .iter()
            .filter(|r| r.outcome == ImportOutcome::Errored)
            .count();
        Self {
            total: rows.len(),
            imported,
            skipped,
            errored,
            rows,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ImportMembersRequest {
    pub rows: Vec<ImportRow>,
}

/// Imports a roster of members row by row. Rows never fail the batch: a bad
/// email or unknown department is skipped with a reason, an existing member
/// is skipped, and the rest are created as active members. Users unknown to
/// the directory are created with a minted API key; errored is reserved for
/// database failures.
pub async fn import_members(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<ImportMembersRequest>,
) -> ApiResult<Json<ImportReport>> {
    let mut conn = state.conn.get()?;

    let org_exists: Option<Uuid> = organizations::table
        .filter(organizations::id.eq(org_id))
        .select(organizations::id)
        .first(&mut conn)
        .optional()?;
    if org_exists.is_none() {
        return Err(ApiError::NotFound("Organization not found".to_string()));
    }

    let mut results = Vec::with_capacity(req.rows.len());
    for (index, row) in req.rows.into_iter().enumerate() {
        let (outcome, reason) = match import_one(&mut conn, org_id, &row) {
            Ok((outcome, reason)) => (outcome, reason),
            Err(reason) => (ImportOutcome::Errored, Some(reason)),
        };
        results.push(ImportRowResult {
            row: index,
            email: row.email,
            outcome,
            reason,
        });
    }

    let report = ImportReport::from_rows(results);
    log::info!(
        "Imported members into org {}: {} imported, {} skipped, {} errored",
        org_id,
        report.imported,
        report.skipped,
        report.errored
    );
    Ok(Json(report))
}

/// Skipped rows carry a reason; `Err` is reserved for database failures,
/// which the report counts as errored.
fn import_one(
    conn: &mut PgConnection,
    org_id: Uuid,
    row: &ImportRow,
) -> Result<(ImportOutcome, Option<String>), String> {
    let email = row.email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Ok((
            ImportOutcome::Skipped,
            Some(format!("invalid email: {}", row.email)),
        ));
    }

    if let Some(department_id) = row.department_id {
        let dept: Option<Uuid> = departments::table
            .filter(departments::id.eq(department_id))
            .filter(departments::organization_id.eq(org_id))
            .select(departments::id)
            .first(conn)
            .optional()
            .map_err(|e| e.to_string())?;
        if dept.is_none() {
            return Ok((
                ImportOutcome::Skipped,
                Some(format!("unknown department: {}", department_id)),
            ));
        }
    }

    let outcome = conn.transaction::<ImportOutcome, diesel::result::Error, _>(|conn| {
        let now = Utc::now();
        let user_id = match users::table
            .filter(users::email.eq(&email))
            .select(users::id)
            .first::<Uuid>(conn)
            .optional()?
        {
            Some(id) => id,
            None => {
                let user = User {
                    id: Uuid::new_v4(),
                    external_id: format!("import:{}", email),
                    email: email.clone(),
                    display_name: row
                        .display_name
                        .clone()
                        .unwrap_or_else(|| email.clone()),
                    avatar_url: None,
                    api_key: generate_api_key(),
                    created_at: now,
                    updated_at: now,
                };
                diesel::insert_into(users::table).values(&user).execute(conn)?;
                user.id
            }
        };

        let existing: Option<Uuid> = organization_members::table
            .filter(organization_members::organization_id.eq(org_id))
            .filter(organization_members::user_id.eq(user_id))
            .select(organization_members::id)
            .first(conn)
            .optional()?;
        if existing.is_some() {
            return Ok(ImportOutcome::Skipped);
        }

        let member = OrganizationMember {
            id: Uuid::new_v4(),
            organization_id: org_id,
            user_id,
            role: MemberRole::from(row.role.as_deref().unwrap_or("employee")).to_string(),
            status: MemberStatus::Active.to_string(),
            department_id: row.department_id,
            assigned_course_ids: serde_json::json!([]),
            invited_at: now,
            joined_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(organization_members::table)
            .values(&member)
            .execute(conn)?;

        Ok(ImportOutcome::Imported)
    })
    .map_err(|e| e.to_string())?;

    Ok((outcome, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("a@b.co"));
        assert!(is_valid_email("first.last+tag@example.org"));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("spaces in@mail.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn test_import_report_counts_sum_to_total() {
        let rows = vec![
            ImportRowResult {
                row: 0,
                email: "a@b.co".into(),
                outcome: ImportOutcome::Imported,
                reason: None,
            },
            ImportRowResult {
                row: 1,
                email: "a@b.co".into(),
                outcome: ImportOutcome::Skipped,
                reason: None,
            },
            ImportRowResult {
                row: 2,
                email: "bad".into(),
                outcome: ImportOutcome::Skipped,
                reason: Some("invalid email: bad".into()),
            },
            ImportRowResult {
                row: 3,
                email: "c@d.co".into(),
                outcome: ImportOutcome::Errored,
                reason: Some("connection reset".into()),
            },
        ];
        let report = ImportReport::from_rows(rows);
        assert_eq!(report.total, 4);
        assert_eq!(
            report.imported + report.skipped + report.errored,
            report.total
        );
        assert_eq!(report.imported, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.errored, 1);
    }

    #[test]
    fn test_empty_import_report() {
        let report = ImportReport::from_rows(Vec::new());
        assert_eq!(report.total, 0);
        assert_eq!(report.imported, 0);
    }
}
