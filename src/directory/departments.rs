//! Departments group members and optionally auto-enroll new joiners into a
//! default set of courses.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{organizations, uuid_list};
use crate::shared::error::{ApiError, ApiResult};
use crate::shared::state::AppState;

diesel::table! {
    departments (id) {
        id -> Uuid,
        organization_id -> Uuid,
        name -> Text,
        description -> Nullable<Text>,
        default_course_ids -> Jsonb,
        auto_enroll -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = departments)]
pub struct Department {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub default_course_ids: serde_json::Value,
    pub auto_enroll: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Department {
    pub fn default_courses(&self) -> Vec<Uuid> {
        uuid_list(&self.default_course_ids)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDepartmentRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub default_course_ids: Vec<Uuid>,
    #[serde(default)]
    pub auto_enroll: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDepartmentRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub default_course_ids: Option<Vec<Uuid>>,
    pub auto_enroll: Option<bool>,
}

fn course_ids_doc(ids: &[Uuid]) -> serde_json::Value {
    serde_json::json!(ids.iter().map(|id| id.to_string()).collect::<Vec<_>>())
}

pub async fn create_department(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<CreateDepartmentRequest>,
) -> ApiResult<(StatusCode, Json<Department>)> {
    if req.name.trim().is_empty() {
        return Err(ApiError::Validation(
            "department name is required".to_string(),
        ));
    }

    let mut conn = state.conn.get()?;

    let org_exists: Option<Uuid> = organizations::table
        .filter(organizations::id.eq(org_id))
        .select(organizations::id)
        .first(&mut conn)
        .optional()?;
    if org_exists.is_none() {
        return Err(ApiError::NotFound("Organization not found".to_string()));
    }

    let now = Utc::now();
    let department = Department {
        id: Uuid::new_v4(),
        organization_id: org_id,
        name: req.name,
        description: req.description,
        default_course_ids: course_ids_doc(&req.default_course_ids),
        auto_enroll: req.auto_enroll,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(departments::table)
        .values(&department)
        .execute(&mut conn)?;

    Ok((StatusCode::CREATED, Json(department)))
}

pub async fn list_departments(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Department>>> {
    let mut conn = state.conn.get()?;
    let rows: Vec<Department> = departments::table
        .filter(departments::organization_id.eq(org_id))
        .order(departments::name.asc())
        .load(&mut conn)?;
    Ok(Json(rows))
}

pub async fn get_department(
    State(state): State<Arc<AppState>>,
    Path((org_id, department_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Department>> {
    let mut conn = state.conn.get()?;
    let department: Department = departments::table
        .filter(departments::id.eq(department_id))
        .filter(departments::organization_id.eq(org_id))
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("Department not found".to_string()))?;
    Ok(Json(department))
}

pub async fn update_department(
    State(state): State<Arc<AppState>>,
    Path((org_id, department_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateDepartmentRequest>,
) -> ApiResult<Json<Department>> {
    let mut conn = state.conn.get()?;

    let existing: Option<Uuid> = departments::table
        .filter(departments::id.eq(department_id))
        .filter(departments::organization_id.eq(org_id))
        .select(departments::id)
        .first(&mut conn)
        .optional()?;
    if existing.is_none() {
        return Err(ApiError::NotFound("Department not found".to_string()));
    }

    if let Some(name) = req.name {
        if name.trim().is_empty() {
            return Err(ApiError::Validation(
                "department name is required".to_string(),
            ));
        }
        diesel::update(departments::table.filter(departments::id.eq(department_id)))
            .set(departments::name.eq(name))
            .execute(&mut conn)?;
    }
    if let Some(description) = req.description {
        diesel::update(departments::table.filter(departments::id.eq(department_id)))
            .set(departments::description.eq(Some(description)))
            .execute(&mut conn)?;
    }
    if let Some(course_ids) = req.default_course_ids {
        diesel::update(departments::table.filter(departments::id.eq(department_id)))
            .set(departments::default_course_ids.eq(course_ids_doc(&course_ids)))
            .execute(&mut conn)?;
    }
    if let Some(auto_enroll) = req.auto_enroll {
        diesel::update(departments::table.filter(departments::id.eq(department_id)))
            .set(departments::auto_enroll.eq(auto_enroll))
            .execute(&mut conn)?;
    }
    diesel::update(departments::table.filter(departments::id.eq(department_id)))
        .set(departments::updated_at.eq(Utc::now()))
        .execute(&mut conn)?;

    let department: Department = departments::table
        .filter(departments::id.eq(department_id))
        .first(&mut conn)?;
    Ok(Json(department))
}

/// Members of the deleted department keep their membership with no
/// department assignment.
pub async fn delete_department(
    State(state): State<Arc<AppState>>,
    Path((org_id, department_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    use super::organization_members;

    let mut conn = state.conn.get()?;

    conn.transaction::<_, ApiError, _>(|conn| {
        diesel::update(
            organization_members::table
                .filter(organization_members::department_id.eq(Some(department_id))),
        )
        .set(organization_members::department_id.eq(None::<Uuid>))
        .execute(conn)?;

        let deleted = diesel::delete(
            departments::table
                .filter(departments::id.eq(department_id))
                .filter(departments::organization_id.eq(org_id)),
        )
        .execute(conn)?;
        if deleted == 0 {
            return Err(ApiError::NotFound("Department not found".to_string()));
        }
        Ok(())
    })?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_courses_round_trip() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let department = Department {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "Engineering".to_string(),
            description: None,
            default_course_ids: course_ids_doc(&ids),
            auto_enroll: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(department.default_courses(), ids);
    }
}
