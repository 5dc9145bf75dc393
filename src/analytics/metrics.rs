//! Windowed metric computation. The reducers are pure functions over loaded
//! rows; the handlers load the rows and delegate.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use super::{analytics_events, AnalyticsEvent, TimeWindow};
use crate::learn::types::{decode_modules, ordered_lessons, LessonProgressStatus};
use crate::learn::{courses, enrollments, lesson_progress, quiz_attempts};
use crate::shared::error::{ApiError, ApiResult};
use crate::shared::state::AppState;

pub const EVENT_LESSON_COMPLETED: &str = "lesson_completed";
pub const EVENT_QUIZ_SUBMITTED: &str = "quiz_submitted";

// ============================================================================
// ORGANIZATION METRICS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationMetrics {
    pub total_time_spent_seconds: i64,
    pub average_quiz_score: f64,
    pub active_users: i64,
    pub lessons_completed: i64,
    pub average_completion_percentage: f64,
}

impl OrganizationMetrics {
    pub fn zeroed() -> Self {
        Self {
            total_time_spent_seconds: 0,
            average_quiz_score: 0.0,
            active_users: 0,
            lessons_completed: 0,
            average_completion_percentage: 0.0,
        }
    }
}

/// Reduces an event window plus current enrollment percentages into one
/// metrics document. An empty window yields zeroed metrics.
pub fn organization_metrics(
    events: &[AnalyticsEvent],
    enrollment_percentages: &[i32],
) -> OrganizationMetrics {
    let mut metrics = OrganizationMetrics::zeroed();

    let mut active: HashSet<Uuid> = HashSet::new();
    let mut quiz_scores: Vec<f64> = Vec::new();
    for event in events {
        if let Some(user_id) = event.user_id {
            active.insert(user_id);
        }
        if let Some(seconds) = event.properties.get("time_spent_seconds").and_then(|v| v.as_i64())
        {
            metrics.total_time_spent_seconds += seconds.max(0);
        }
        match event.event_type.as_str() {
            EVENT_LESSON_COMPLETED => metrics.lessons_completed += 1,
            EVENT_QUIZ_SUBMITTED => {
                if let Some(score) = event.properties.get("percentage").and_then(|v| v.as_f64()) {
                    quiz_scores.push(score);
                }
            }
            _ => {}
        }
    }
    metrics.active_users = active.len() as i64;
    if !quiz_scores.is_empty() {
        metrics.average_quiz_score = quiz_scores.iter().sum::<f64>() / quiz_scores.len() as f64;
    }
    if !enrollment_percentages.is_empty() {
        metrics.average_completion_percentage = enrollment_percentages
            .iter()
            .map(|p| f64::from(*p))
            .sum::<f64>()
            / enrollment_percentages.len() as f64;
    }

    metrics
}

pub(super) fn load_organization_metrics(
    conn: &mut PgConnection,
    organization_id: Uuid,
    window: TimeWindow,
) -> Result<OrganizationMetrics, ApiError> {
    let events: Vec<AnalyticsEvent> = analytics_events::table
        .filter(analytics_events::organization_id.eq(organization_id))
        .filter(analytics_events::occurred_at.ge(window.from))
        .filter(analytics_events::occurred_at.lt(window.to))
        .load(conn)?;

    let percentages: Vec<i32> = enrollments::table
        .filter(enrollments::organization_id.eq(organization_id))
        .select(enrollments::completion_percentage)
        .load(conn)?;

    Ok(organization_metrics(&events, &percentages))
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub async fn handle_organization_metrics(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<OrganizationMetrics>> {
    let mut conn = state.conn.get()?;
    let window = TimeWindow::resolve(query.from, query.to);
    let metrics = load_organization_metrics(&mut conn, organization_id, window)?;
    Ok(Json(metrics))
}

// ============================================================================
// COURSE DROPOFF FUNNEL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelStep {
    pub lesson_id: Uuid,
    pub title: String,
    pub completed_users: i64,
    /// Share of users carried over from the previous step, in [0, 1].
    pub conversion: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseFunnel {
    pub course_id: Uuid,
    pub enrolled_users: i64,
    pub steps: Vec<FunnelStep>,
    /// Index into `steps` of the largest absolute user loss. The loss from
    /// enrollment to the first lesson counts as step 0.
    pub dropoff_step: Option<usize>,
}

/// Builds the funnel from position-ordered lessons and per-lesson distinct
/// completion counts.
pub fn course_funnel(
    course_id: Uuid,
    enrolled_users: i64,
    lessons: &[(Uuid, String)],
    completions: &HashMap<Uuid, i64>,
) -> CourseFunnel {
    let mut steps = Vec::with_capacity(lessons.len());
    let mut previous = enrolled_users;
    let mut dropoff_step: Option<usize> = None;
    let mut largest_loss = 0i64;

    for (index, (lesson_id, title)) in lessons.iter().enumerate() {
        let completed = completions.get(lesson_id).copied().unwrap_or(0);
        let conversion = if previous > 0 {
            completed as f64 / previous as f64
        } else {
            0.0
        };
        let loss = previous - completed;
        if loss > largest_loss {
            largest_loss = loss;
            dropoff_step = Some(index);
        }
        steps.push(FunnelStep {
            lesson_id: *lesson_id,
            title: title.clone(),
            completed_users: completed,
            conversion,
        });
        previous = completed;
    }

    CourseFunnel {
        course_id,
        enrolled_users,
        steps,
        dropoff_step,
    }
}

pub(super) fn load_course_funnel(
    conn: &mut PgConnection,
    course_id: Uuid,
) -> Result<CourseFunnel, ApiError> {
    let modules_doc: serde_json::Value = courses::table
        .filter(courses::id.eq(course_id))
        .select(courses::modules)
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))?;
    let modules = decode_modules(&modules_doc);
    let lessons: Vec<(Uuid, String)> = ordered_lessons(&modules)
        .into_iter()
        .map(|lesson| (lesson.id, lesson.title.clone()))
        .collect();

    let enrolled_users: i64 = enrollments::table
        .filter(enrollments::course_id.eq(course_id))
        .count()
        .get_result(conn)?;

    let completed_rows: Vec<(Uuid, Uuid)> = lesson_progress::table
        .filter(lesson_progress::course_id.eq(course_id))
        .filter(lesson_progress::status.eq(LessonProgressStatus::Completed.to_string()))
        .select((lesson_progress::lesson_id, lesson_progress::user_id))
        .load(conn)?;
    let mut per_lesson: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
    for (lesson_id, user_id) in completed_rows {
        per_lesson.entry(lesson_id).or_default().insert(user_id);
    }
    let completions: HashMap<Uuid, i64> = per_lesson
        .into_iter()
        .map(|(lesson_id, users)| (lesson_id, users.len() as i64))
        .collect();

    Ok(course_funnel(course_id, enrolled_users, &lessons, &completions))
}

pub async fn handle_course_funnel(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<Uuid>,
) -> ApiResult<Json<CourseFunnel>> {
    let mut conn = state.conn.get()?;
    Ok(Json(load_course_funnel(&mut conn, course_id)?))
}

// ============================================================================
// USER METRICS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMetrics {
    pub events: i64,
    pub total_time_spent_seconds: i64,
    pub lessons_completed: i64,
    pub quizzes_passed: i64,
}

pub fn user_metrics(
    events: &[AnalyticsEvent],
    lessons_completed: i64,
    quizzes_passed: i64,
) -> UserMetrics {
    let total_time_spent_seconds = events
        .iter()
        .filter_map(|e| e.properties.get("time_spent_seconds").and_then(|v| v.as_i64()))
        .map(|s| s.max(0))
        .sum();
    UserMetrics {
        events: events.len() as i64,
        total_time_spent_seconds,
        lessons_completed,
        quizzes_passed,
    }
}

#[derive(Debug, Deserialize)]
pub struct UserMetricsQuery {
    pub organization_id: Uuid,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub(super) fn load_user_metrics(
    conn: &mut PgConnection,
    organization_id: Uuid,
    user_id: Uuid,
    window: TimeWindow,
) -> Result<UserMetrics, ApiError> {
    let events: Vec<AnalyticsEvent> = analytics_events::table
        .filter(analytics_events::organization_id.eq(organization_id))
        .filter(analytics_events::user_id.eq(Some(user_id)))
        .filter(analytics_events::occurred_at.ge(window.from))
        .filter(analytics_events::occurred_at.lt(window.to))
        .load(conn)?;

    let lessons_completed: i64 = lesson_progress::table
        .filter(lesson_progress::user_id.eq(user_id))
        .filter(lesson_progress::status.eq(LessonProgressStatus::Completed.to_string()))
        .count()
        .get_result(conn)?;

    let quizzes_passed: i64 = quiz_attempts::table
        .filter(quiz_attempts::user_id.eq(user_id))
        .filter(quiz_attempts::passed.eq(true))
        .select(diesel::dsl::count_distinct(quiz_attempts::lesson_id))
        .get_result(conn)?;

    Ok(user_metrics(&events, lessons_completed, quizzes_passed))
}

pub async fn handle_user_metrics(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<UserMetricsQuery>,
) -> ApiResult<Json<UserMetrics>> {
    let mut conn = state.conn.get()?;
    let window = TimeWindow::resolve(query.from, query.to);
    let metrics = load_user_metrics(&mut conn, query.organization_id, user_id, window)?;
    Ok(Json(metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(
        user_id: Option<Uuid>,
        event_type: &str,
        properties: serde_json::Value,
    ) -> AnalyticsEvent {
        AnalyticsEvent {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            user_id,
            event_type: event_type.to_string(),
            properties,
            session_id: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_window_yields_zeroed_metrics() {
        let metrics = organization_metrics(&[], &[]);
        assert_eq!(metrics, OrganizationMetrics::zeroed());
    }

    #[test]
    fn test_organization_metrics_aggregation() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let events = vec![
            event(
                Some(alice),
                EVENT_LESSON_COMPLETED,
                serde_json::json!({"time_spent_seconds": 120}),
            ),
            event(
                Some(alice),
                EVENT_QUIZ_SUBMITTED,
                serde_json::json!({"percentage": 80.0}),
            ),
            event(
                Some(bob),
                EVENT_QUIZ_SUBMITTED,
                serde_json::json!({"percentage": 60.0}),
            ),
            event(None, "page_view", serde_json::json!({})),
        ];
        let metrics = organization_metrics(&events, &[100, 50, 0]);
        assert_eq!(metrics.active_users, 2);
        assert_eq!(metrics.lessons_completed, 1);
        assert_eq!(metrics.total_time_spent_seconds, 120);
        assert!((metrics.average_quiz_score - 70.0).abs() < f64::EPSILON);
        assert!((metrics.average_completion_percentage - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_negative_time_spent_ignored() {
        let events = vec![event(
            None,
            "heartbeat",
            serde_json::json!({"time_spent_seconds": -5}),
        )];
        let metrics = organization_metrics(&events, &[]);
        assert_eq!(metrics.total_time_spent_seconds, 0);
    }

    #[test]
    fn test_funnel_dropoff_is_largest_absolute_loss() {
        let course_id = Uuid::new_v4();
        let lessons: Vec<(Uuid, String)> = (0..3)
            .map(|i| (Uuid::new_v4(), format!("Lesson {}", i + 1)))
            .collect();
        let mut completions = HashMap::new();
        completions.insert(lessons[0].0, 80i64);
        completions.insert(lessons[1].0, 30i64);
        completions.insert(lessons[2].0, 28i64);

        let funnel = course_funnel(course_id, 100, &lessons, &completions);
        assert_eq!(funnel.enrolled_users, 100);
        assert_eq!(funnel.steps.len(), 3);
        // 100 -> 80 (-20), 80 -> 30 (-50), 30 -> 28 (-2)
        assert_eq!(funnel.dropoff_step, Some(1));
        assert!((funnel.steps[1].conversion - 0.375).abs() < f64::EPSILON);
    }

    #[test]
    fn test_funnel_counts_enrollment_to_first_lesson_loss() {
        let course_id = Uuid::new_v4();
        let lessons = vec![(Uuid::new_v4(), "Intro".to_string())];
        let mut completions = HashMap::new();
        completions.insert(lessons[0].0, 10i64);

        let funnel = course_funnel(course_id, 100, &lessons, &completions);
        assert_eq!(funnel.dropoff_step, Some(0));
        assert!((funnel.steps[0].conversion - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_funnel_with_no_lessons() {
        let funnel = course_funnel(Uuid::new_v4(), 5, &[], &HashMap::new());
        assert!(funnel.steps.is_empty());
        assert_eq!(funnel.dropoff_step, None);
    }

    #[test]
    fn test_user_metrics_time_sum() {
        let user = Uuid::new_v4();
        let events = vec![
            event(
                Some(user),
                "heartbeat",
                serde_json::json!({"time_spent_seconds": 30}),
            ),
            event(
                Some(user),
                "heartbeat",
                serde_json::json!({"time_spent_seconds": 45}),
            ),
        ];
        let metrics = user_metrics(&events, 3, 1);
        assert_eq!(metrics.events, 2);
        assert_eq!(metrics.total_time_spent_seconds, 75);
        assert_eq!(metrics.lessons_completed, 3);
        assert_eq!(metrics.quizzes_passed, 1);
    }
}
