//! Learn module: courses with embedded module/lesson documents, enrollments,
//! lesson progress and quiz attempts.
//!
//! Follows the same patterns as the other app modules:
//! - Diesel ORM for database operations
//! - Axum handlers for HTTP routes
//! - Serde for JSON serialization
//! - UUID for unique identifiers
//!
//! Enrollment progress is never stored independently of the underlying
//! lesson-progress rows: every write that can move progress happens inside a
//! single database transaction, and detail reads re-derive from the rows.

#[path = "enrollments.rs"]
pub mod enrollments_api;
pub mod progress;
pub mod quizzes;
pub mod types;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::error::{ApiError, ApiResult};
use crate::shared::state::AppState;
use crate::shared::utils::DbPool;
use self::types::{
    decode_modules, ordered_lessons, CourseFilters, CourseResponse, CourseStatus,
    CreateCourseRequest, UpdateCourseRequest,
};

// ============================================================================
// DATABASE SCHEMA
// ============================================================================

diesel::table! {
    courses (id) {
        id -> Uuid,
        organization_id -> Uuid,
        title -> Text,
        description -> Nullable<Text>,
        category -> Text,
        status -> Text,
        modules -> Jsonb,
        created_by -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    enrollments (id) {
        id -> Uuid,
        organization_id -> Uuid,
        user_id -> Uuid,
        course_id -> Uuid,
        status -> Text,
        completion_percentage -> Int4,
        completed_lesson_ids -> Jsonb,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    lesson_progress (id) {
        id -> Uuid,
        user_id -> Uuid,
        course_id -> Uuid,
        lesson_id -> Uuid,
        status -> Text,
        watch_seconds -> Int4,
        max_scroll_percent -> Int4,
        time_spent_seconds -> Int4,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    quiz_attempts (id) {
        id -> Uuid,
        user_id -> Uuid,
        course_id -> Uuid,
        lesson_id -> Uuid,
        attempt_number -> Int4,
        earned_points -> Int4,
        total_points -> Int4,
        percentage -> Int4,
        passed -> Bool,
        breakdown -> Jsonb,
        submitted_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    courses,
    enrollments,
    lesson_progress,
    quiz_attempts,
);

// ============================================================================
// DATA MODELS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = courses)]
pub struct Course {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub status: String,
    pub modules: serde_json::Value,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Course {
    pub fn to_response(&self) -> CourseResponse {
        let modules = decode_modules(&self.modules);
        let lessons = ordered_lessons(&modules);
        let estimated_minutes = lessons.iter().map(|l| l.estimated_minutes).sum();
        CourseResponse {
            id: self.id,
            organization_id: self.organization_id,
            title: self.title.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            status: CourseStatus::from(self.status.as_str()),
            lessons_total: lessons.len() as i32,
            estimated_minutes,
            modules,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = enrollments)]
pub struct Enrollment {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub status: String,
    pub completion_percentage: i32,
    pub completed_lesson_ids: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = lesson_progress)]
pub struct LessonProgress {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub lesson_id: Uuid,
    pub status: String,
    pub watch_seconds: i32,
    pub max_scroll_percent: i32,
    pub time_spent_seconds: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = quiz_attempts)]
pub struct QuizAttempt {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub lesson_id: Uuid,
    pub attempt_number: i32,
    pub earned_points: i32,
    pub total_points: i32,
    pub percentage: i32,
    pub passed: bool,
    pub breakdown: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

// ============================================================================
// LEARN ENGINE
// ============================================================================

/// Main engine handling course, enrollment, progress and quiz operations.
pub struct LearnEngine {
    pub(crate) db: DbPool,
}

impl LearnEngine {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    // ----- Course Operations -----

    pub async fn create_course(
        &self,
        organization_id: Uuid,
        req: CreateCourseRequest,
        created_by: Option<Uuid>,
    ) -> ApiResult<Course> {
        if req.title.trim().is_empty() {
            return Err(ApiError::Validation("course title is required".to_string()));
        }

        let now = Utc::now();
        let course = Course {
            id: Uuid::new_v4(),
            organization_id,
            title: req.title,
            description: req.description,
            category: req.category,
            status: CourseStatus::Draft.to_string(),
            modules: serde_json::to_value(&req.modules)
                .unwrap_or_else(|_| serde_json::json!([])),
            created_by,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.db.get()?;
        diesel::insert_into(courses::table)
            .values(&course)
            .execute(&mut conn)?;

        Ok(course)
    }

    pub async fn get_course(&self, course_id: Uuid) -> ApiResult<Option<Course>> {
        let mut conn = self.db.get()?;
        Ok(courses::table
            .filter(courses::id.eq(course_id))
            .first::<Course>(&mut conn)
            .optional()?)
    }

    pub async fn list_courses(
        &self,
        organization_id: Uuid,
        filters: CourseFilters,
    ) -> ApiResult<Vec<Course>> {
        let mut conn = self.db.get()?;

        let mut query = courses::table
            .filter(courses::organization_id.eq(organization_id))
            .into_boxed();

        if let Some(category) = filters.category {
            query = query.filter(courses::category.eq(category));
        }

        if let Some(status) = filters.status {
            query = query.filter(courses::status.eq(status));
        }

        if let Some(search) = filters.search {
            let pattern = format!("%{}%", search.to_lowercase());
            query = query.filter(
                courses::title
                    .ilike(pattern.clone())
                    .or(courses::description.ilike(pattern)),
            );
        }

        query = query.order(courses::created_at.desc());

        if let Some(limit) = filters.limit {
            query = query.limit(limit);
        }

        if let Some(offset) = filters.offset {
            query = query.offset(offset);
        }

        Ok(query.load::<Course>(&mut conn)?)
    }

    pub async fn update_course(
        &self,
        course_id: Uuid,
        req: UpdateCourseRequest,
    ) -> ApiResult<Course> {
        let mut conn = self.db.get()?;
        let now = Utc::now();

        diesel::update(courses::table.filter(courses::id.eq(course_id)))
            .set(courses::updated_at.eq(now))
            .execute(&mut conn)?;

        if let Some(title) = req.title {
            diesel::update(courses::table.filter(courses::id.eq(course_id)))
                .set(courses::title.eq(title))
                .execute(&mut conn)?;
        }

        if let Some(description) = req.description {
            diesel::update(courses::table.filter(courses::id.eq(course_id)))
                .set(courses::description.eq(description))
                .execute(&mut conn)?;
        }

        if let Some(category) = req.category {
            diesel::update(courses::table.filter(courses::id.eq(course_id)))
                .set(courses::category.eq(category))
                .execute(&mut conn)?;
        }

        if let Some(modules) = req.modules {
            let doc = serde_json::to_value(&modules).unwrap_or_else(|_| serde_json::json!([]));
            diesel::update(courses::table.filter(courses::id.eq(course_id)))
                .set(courses::modules.eq(doc))
                .execute(&mut conn)?;
        }

        courses::table
            .filter(courses::id.eq(course_id))
            .first::<Course>(&mut conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))
    }

    pub async fn publish_course(&self, course_id: Uuid) -> ApiResult<Course> {
        let mut conn = self.db.get()?;

        let updated = diesel::update(courses::table.filter(courses::id.eq(course_id)))
            .set((
                courses::status.eq(CourseStatus::Published.to_string()),
                courses::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;

        if updated == 0 {
            return Err(ApiError::NotFound("Course not found".to_string()));
        }

        Ok(courses::table
            .filter(courses::id.eq(course_id))
            .first::<Course>(&mut conn)?)
    }

    /// Deletes the course together with its enrollments, lesson progress and
    /// quiz attempts, in one transaction.
    pub async fn delete_course(&self, course_id: Uuid) -> ApiResult<()> {
        let mut conn = self.db.get()?;

        conn.transaction::<_, ApiError, _>(|conn| {
            diesel::delete(
                lesson_progress::table.filter(lesson_progress::course_id.eq(course_id)),
            )
            .execute(conn)?;

            diesel::delete(quiz_attempts::table.filter(quiz_attempts::course_id.eq(course_id)))
                .execute(conn)?;

            diesel::delete(enrollments::table.filter(enrollments::course_id.eq(course_id)))
                .execute(conn)?;

            let deleted =
                diesel::delete(courses::table.filter(courses::id.eq(course_id))).execute(conn)?;

            if deleted == 0 {
                return Err(ApiError::NotFound("Course not found".to_string()));
            }

            Ok(())
        })
    }
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CourseCreateBody {
    pub organization_id: Uuid,
    pub created_by: Option<Uuid>,
    #[serde(flatten)]
    pub course: CreateCourseRequest,
}

// Flat on purpose: serde_urlencoded cannot deserialize flattened structs.
#[derive(Debug, Deserialize)]
pub struct CourseListQuery {
    pub organization_id: Uuid,
    pub category: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl CourseListQuery {
    fn into_parts(self) -> (Uuid, CourseFilters) {
        (
            self.organization_id,
            CourseFilters {
                category: self.category,
                status: self.status,
                search: self.search,
                limit: self.limit,
                offset: self.offset,
            },
        )
    }
}

pub async fn create_course(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CourseCreateBody>,
) -> ApiResult<(StatusCode, Json<CourseResponse>)> {
    let engine = LearnEngine::new(state.conn.clone());
    let course = engine
        .create_course(body.organization_id, body.course, body.created_by)
        .await?;
    Ok((StatusCode::CREATED, Json(course.to_response())))
}

pub async fn list_courses(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CourseListQuery>,
) -> ApiResult<Json<Vec<CourseResponse>>> {
    let engine = LearnEngine::new(state.conn.clone());
    let (organization_id, filters) = query.into_parts();
    let courses = engine.list_courses(organization_id, filters).await?;
    Ok(Json(courses.iter().map(Course::to_response).collect()))
}

pub async fn get_course(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<Uuid>,
) -> ApiResult<Json<CourseResponse>> {
    let engine = LearnEngine::new(state.conn.clone());
    let course = engine
        .get_course(course_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))?;
    Ok(Json(course.to_response()))
}

pub async fn update_course(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<Uuid>,
    Json(req): Json<UpdateCourseRequest>,
) -> ApiResult<Json<CourseResponse>> {
    let engine = LearnEngine::new(state.conn.clone());
    let course = engine.update_course(course_id, req).await?;
    Ok(Json(course.to_response()))
}

pub async fn publish_course(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<Uuid>,
) -> ApiResult<Json<CourseResponse>> {
    let engine = LearnEngine::new(state.conn.clone());
    let course = engine.publish_course(course_id).await?;
    Ok(Json(course.to_response()))
}

pub async fn delete_course(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let engine = LearnEngine::new(state.conn.clone());
    engine.delete_course(course_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// ROUTE CONFIGURATION
// ============================================================================

pub fn configure_learn_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Course routes
        .route("/api/courses", get(list_courses).post(create_course))
        .route(
            "/api/courses/:id",
            get(get_course).put(update_course).delete(delete_course),
        )
        .route("/api/courses/:id/publish", post(publish_course))
        // Enrollment routes
        .route(
            "/api/enrollments",
            get(enrollments_api::list_enrollments).post(enrollments_api::enroll),
        )
        .route(
            "/api/enrollments/:id",
            get(enrollments_api::get_enrollment).delete(enrollments_api::unenroll),
        )
        // Lesson progress
        .route("/api/progress", post(progress::record_progress_handler))
        // Quiz routes
        .route(
            "/api/courses/:id/lessons/:lesson_id/quiz",
            post(quizzes::submit_quiz),
        )
        .route(
            "/api/courses/:id/lessons/:lesson_id/quiz/attempts",
            get(quizzes::list_attempts),
        )
}
