//! Enrollment lifecycle. One enrollment per user+course; duplicates return
//! 409. Detail reads derive progress live from lesson-progress rows, so a
//! stale stored percentage can never be served.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use diesel::prelude::*;
use std::sync::Arc;
use uuid::Uuid;

use super::progress::{completed_lesson_set, compute_progress};
use super::types::{
    decode_modules, ordered_lessons, EnrollRequest, EnrollmentDetail, EnrollmentFilters,
    EnrollmentStatus,
};
use super::{courses, enrollments, Course, Enrollment, LearnEngine};
use crate::shared::error::{ApiError, ApiResult};
use crate::shared::state::AppState;

impl LearnEngine {
    pub async fn enroll(&self, req: EnrollRequest) -> ApiResult<Enrollment> {
        let mut conn = self.db.get()?;

        let course: Option<Course> = courses::table
            .filter(courses::id.eq(req.course_id))
            .first(&mut conn)
            .optional()?;
        if course.is_none() {
            return Err(ApiError::NotFound("Course not found".to_string()));
        }

        let existing: Option<Enrollment> = enrollments::table
            .filter(enrollments::organization_id.eq(req.organization_id))
            .filter(enrollments::user_id.eq(req.user_id))
            .filter(enrollments::course_id.eq(req.course_id))
            .first(&mut conn)
            .optional()?;

        if existing.is_some() {
            return Err(ApiError::Conflict(
                "User is already enrolled in this course".to_string(),
            ));
        }

        let now = Utc::now();
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            organization_id: req.organization_id,
            user_id: req.user_id,
            course_id: req.course_id,
            status: EnrollmentStatus::NotStarted.to_string(),
            completion_percentage: 0,
            completed_lesson_ids: serde_json::json!([]),
            // stamped by the first progress write, not at enroll time
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        diesel::insert_into(enrollments::table)
            .values(&enrollment)
            .execute(&mut conn)?;

        Ok(enrollment)
    }

    pub async fn list_enrollments(
        &self,
        filters: EnrollmentFilters,
    ) -> ApiResult<Vec<Enrollment>> {
        let mut conn = self.db.get()?;

        let mut query = enrollments::table.into_boxed();

        if let Some(org_id) = filters.organization_id {
            query = query.filter(enrollments::organization_id.eq(org_id));
        }

        if let Some(user_id) = filters.user_id {
            query = query.filter(enrollments::user_id.eq(user_id));
        }

        if let Some(course_id) = filters.course_id {
            query = query.filter(enrollments::course_id.eq(course_id));
        }

        if let Some(status) = filters.status {
            query = query.filter(enrollments::status.eq(status));
        }

        Ok(query
            .order(enrollments::updated_at.desc())
            .load::<Enrollment>(&mut conn)?)
    }

    /// Progress fields are derived live; a deleted course degrades to
    /// `course_title: None` with zero-lesson totals instead of failing.
    pub async fn enrollment_detail(&self, enrollment_id: Uuid) -> ApiResult<EnrollmentDetail> {
        let mut conn = self.db.get()?;

        let enrollment: Enrollment = enrollments::table
            .filter(enrollments::id.eq(enrollment_id))
            .first(&mut conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("Enrollment not found".to_string()))?;

        let course: Option<Course> = courses::table
            .filter(courses::id.eq(enrollment.course_id))
            .first(&mut conn)
            .optional()?;

        let lesson_ids: Vec<Uuid> = course
            .as_ref()
            .map(|c| {
                let modules = decode_modules(&c.modules);
                ordered_lessons(&modules).iter().map(|l| l.id).collect()
            })
            .unwrap_or_default();

        let completed =
            completed_lesson_set(&mut conn, enrollment.user_id, enrollment.course_id)?;
        let summary = compute_progress(&lesson_ids, &completed);

        Ok(EnrollmentDetail {
            id: enrollment.id,
            organization_id: enrollment.organization_id,
            user_id: enrollment.user_id,
            course_id: enrollment.course_id,
            course_title: course.map(|c| c.title),
            status: summary.status,
            completion_percentage: summary.percentage,
            lessons_completed: summary.lessons_completed,
            lessons_total: summary.lessons_total,
            next_lesson_id: summary.next_lesson_id,
            started_at: enrollment.started_at,
            completed_at: enrollment.completed_at,
        })
    }

    pub async fn unenroll(&self, enrollment_id: Uuid) -> ApiResult<()> {
        let mut conn = self.db.get()?;

        let enrollment: Enrollment = enrollments::table
            .filter(enrollments::id.eq(enrollment_id))
            .first(&mut conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("Enrollment not found".to_string()))?;

        conn.transaction::<_, ApiError, _>(|conn| {
            diesel::delete(
                super::lesson_progress::table
                    .filter(super::lesson_progress::user_id.eq(enrollment.user_id))
                    .filter(super::lesson_progress::course_id.eq(enrollment.course_id)),
            )
            .execute(conn)?;

            diesel::delete(enrollments::table.filter(enrollments::id.eq(enrollment_id)))
                .execute(conn)?;

            Ok(())
        })
    }
}

/// Department auto-enroll hook: enrolls the user into each course id,
/// skipping courses that are missing or already enrolled. Runs on the
/// caller's connection so it joins the member-activation transaction.
pub fn auto_enroll_member(
    conn: &mut PgConnection,
    organization_id: Uuid,
    user_id: Uuid,
    course_ids: &[Uuid],
) -> Result<usize, diesel::result::Error> {
    let mut created = 0;
    let now = Utc::now();

    for course_id in course_ids {
        let course_exists: bool = courses::table
            .filter(courses::id.eq(course_id))
            .count()
            .get_result::<i64>(conn)
            .map(|c| c > 0)?;
        if !course_exists {
            continue;
        }

        let already: bool = enrollments::table
            .filter(enrollments::organization_id.eq(organization_id))
            .filter(enrollments::user_id.eq(user_id))
            .filter(enrollments::course_id.eq(course_id))
            .count()
            .get_result::<i64>(conn)
            .map(|c| c > 0)?;
        if already {
            continue;
        }

        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            organization_id,
            user_id,
            course_id: *course_id,
            status: EnrollmentStatus::NotStarted.to_string(),
            completion_percentage: 0,
            completed_lesson_ids: serde_json::json!([]),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(enrollments::table)
            .values(&enrollment)
            .execute(conn)?;
        created += 1;
    }

    Ok(created)
}

// ----- Handlers -----

pub async fn enroll(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnrollRequest>,
) -> ApiResult<(StatusCode, Json<Enrollment>)> {
    let engine = LearnEngine::new(state.conn.clone());
    let enrollment = engine.enroll(req).await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

pub async fn list_enrollments(
    State(state): State<Arc<AppState>>,
    Query(filters): Query<EnrollmentFilters>,
) -> ApiResult<Json<Vec<Enrollment>>> {
    let engine = LearnEngine::new(state.conn.clone());
    Ok(Json(engine.list_enrollments(filters).await?))
}

pub async fn get_enrollment(
    State(state): State<Arc<AppState>>,
    Path(enrollment_id): Path<Uuid>,
) -> ApiResult<Json<EnrollmentDetail>> {
    let engine = LearnEngine::new(state.conn.clone());
    Ok(Json(engine.enrollment_detail(enrollment_id).await?))
}

pub async fn unenroll(
    State(state): State<Arc<AppState>>,
    Path(enrollment_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let engine = LearnEngine::new(state.conn.clone());
    engine.unenroll(enrollment_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
