//! Lesson progress recording and live progress derivation.
//!
//! The completion percentage and enrollment status are a pure function of
//! the course's lesson sequence and the set of completed lesson ids; the
//! write path runs that function inside the same transaction that stores
//! the lesson-progress row, so the enrollment row cannot drift.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::types::{
    decode_modules, ordered_lessons, EnrollmentStatus, LessonProgressStatus,
    RecordProgressRequest,
};
use super::{courses, enrollments, lesson_progress, Course, LearnEngine, LessonProgress};
use crate::shared::error::{ApiError, ApiResult};
use crate::shared::state::AppState;

/// Result of deriving progress from the lesson sequence and completions.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSummary {
    pub lessons_completed: i32,
    pub lessons_total: i32,
    pub percentage: i32,
    pub status: EnrollmentStatus,
    pub next_lesson_id: Option<Uuid>,
}

/// `lesson_ids` must be in position order. Percentage is `round(N/M*100)`;
/// status is `completed` iff every lesson is done and there is at least one.
pub fn compute_progress(lesson_ids: &[Uuid], completed: &HashSet<Uuid>) -> ProgressSummary {
    let total = lesson_ids.len() as i32;
    let done = lesson_ids.iter().filter(|id| completed.contains(id)).count() as i32;

    let percentage = if total > 0 {
        ((done as f64 / total as f64) * 100.0).round() as i32
    } else {
        0
    };

    let status = if total > 0 && done == total {
        EnrollmentStatus::Completed
    } else if done > 0 {
        EnrollmentStatus::InProgress
    } else {
        EnrollmentStatus::NotStarted
    };

    let next_lesson_id = lesson_ids.iter().find(|id| !completed.contains(id)).copied();

    ProgressSummary {
        lessons_completed: done,
        lessons_total: total,
        percentage,
        status,
        next_lesson_id,
    }
}

/// Timestamps carried onto the enrollment row on recompute. `started_at` is
/// stamped once, when the status first leaves not-started, and kept after
/// that; `completed_at` keeps its original stamp across redundant recomputes
/// and clears only if the status drops back below completed.
pub fn enrollment_timestamps(
    status: EnrollmentStatus,
    current_started: Option<DateTime<Utc>>,
    current_completed: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let started_at = if status == EnrollmentStatus::NotStarted {
        current_started
    } else {
        current_started.or(Some(now))
    };
    let completed_at = if status == EnrollmentStatus::Completed {
        current_completed.or(Some(now))
    } else {
        None
    };
    (started_at, completed_at)
}

/// Loads the completed lesson-id set for a user+course pair.
pub(super) fn completed_lesson_set(
    conn: &mut PgConnection,
    user_id: Uuid,
    course_id: Uuid,
) -> Result<HashSet<Uuid>, diesel::result::Error> {
    let ids: Vec<Uuid> = lesson_progress::table
        .filter(lesson_progress::user_id.eq(user_id))
        .filter(lesson_progress::course_id.eq(course_id))
        .filter(lesson_progress::status.eq(LessonProgressStatus::Completed.to_string()))
        .select(lesson_progress::lesson_id)
        .load(conn)?;
    Ok(ids.into_iter().collect())
}

/// Re-derives enrollment progress from lesson-progress rows and writes it
/// back. Must be called inside the transaction that changed the rows.
pub(super) fn sync_enrollment(
    conn: &mut PgConnection,
    user_id: Uuid,
    course_id: Uuid,
) -> Result<ProgressSummary, ApiError> {
    let course: Course = courses::table
        .filter(courses::id.eq(course_id))
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))?;

    let modules = decode_modules(&course.modules);
    let lesson_ids: Vec<Uuid> = ordered_lessons(&modules).iter().map(|l| l.id).collect();
    let completed = completed_lesson_set(conn, user_id, course_id)?;
    let summary = compute_progress(&lesson_ids, &completed);

    let now = Utc::now();
    let completed_doc = serde_json::to_value(
        lesson_ids
            .iter()
            .filter(|id| completed.contains(id))
            .collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| serde_json::json!([]));

    let (current_started, current_completed): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
        enrollments::table
            .filter(enrollments::user_id.eq(user_id))
            .filter(enrollments::course_id.eq(course_id))
            .select((enrollments::started_at, enrollments::completed_at))
            .first(conn)
            .optional()?
            .unwrap_or((None, None));
    let (started_at, completed_at) =
        enrollment_timestamps(summary.status, current_started, current_completed, now);

    diesel::update(
        enrollments::table
            .filter(enrollments::user_id.eq(user_id))
            .filter(enrollments::course_id.eq(course_id)),
    )
    .set((
        enrollments::status.eq(summary.status.to_string()),
        enrollments::completion_percentage.eq(summary.percentage),
        enrollments::completed_lesson_ids.eq(completed_doc),
        enrollments::started_at.eq(started_at),
        enrollments::completed_at.eq(completed_at),
        enrollments::updated_at.eq(now),
    ))
    .execute(conn)?;

    Ok(summary)
}

impl LearnEngine {
    /// Upserts the lesson-progress row and, when the lesson is (or becomes)
    /// completed, re-derives the enrollment in the same transaction.
    pub async fn record_progress(
        &self,
        req: RecordProgressRequest,
    ) -> ApiResult<ProgressSummary> {
        let mut conn = self.db.get()?;

        conn.transaction::<_, ApiError, _>(|conn| {
            let course: Course = courses::table
                .filter(courses::id.eq(req.course_id))
                .first(conn)
                .optional()?
                .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))?;

            let modules = decode_modules(&course.modules);
            if super::types::find_lesson(&modules, req.lesson_id).is_none() {
                return Err(ApiError::NotFound(
                    "Lesson not found in course".to_string(),
                ));
            }

            let now = Utc::now();
            let existing: Option<LessonProgress> = lesson_progress::table
                .filter(lesson_progress::user_id.eq(req.user_id))
                .filter(lesson_progress::lesson_id.eq(req.lesson_id))
                .first(conn)
                .optional()?;

            match existing {
                Some(row) => {
                    let status = if req.completed
                        || LessonProgressStatus::from(row.status.as_str())
                            == LessonProgressStatus::Completed
                    {
                        LessonProgressStatus::Completed
                    } else {
                        LessonProgressStatus::Started
                    };
                    let completed_at = if status == LessonProgressStatus::Completed {
                        row.completed_at.or(Some(now))
                    } else {
                        None
                    };
                    diesel::update(
                        lesson_progress::table.filter(lesson_progress::id.eq(row.id)),
                    )
                    .set((
                        lesson_progress::status.eq(status.to_string()),
                        lesson_progress::watch_seconds
                            .eq(req.watch_seconds.unwrap_or(row.watch_seconds)),
                        lesson_progress::max_scroll_percent.eq(req
                            .max_scroll_percent
                            .unwrap_or(row.max_scroll_percent)
                            .max(row.max_scroll_percent)),
                        lesson_progress::time_spent_seconds.eq(row.time_spent_seconds
                            + req.time_spent_seconds.unwrap_or(0)),
                        lesson_progress::completed_at.eq(completed_at),
                        lesson_progress::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                }
                None => {
                    let status = if req.completed {
                        LessonProgressStatus::Completed
                    } else {
                        LessonProgressStatus::Started
                    };
                    let row = LessonProgress {
                        id: Uuid::new_v4(),
                        user_id: req.user_id,
                        course_id: req.course_id,
                        lesson_id: req.lesson_id,
                        status: status.to_string(),
                        watch_seconds: req.watch_seconds.unwrap_or(0),
                        max_scroll_percent: req.max_scroll_percent.unwrap_or(0),
                        time_spent_seconds: req.time_spent_seconds.unwrap_or(0),
                        started_at: now,
                        completed_at: if req.completed { Some(now) } else { None },
                        updated_at: now,
                    };
                    diesel::insert_into(lesson_progress::table)
                        .values(&row)
                        .execute(conn)?;
                }
            }

            sync_enrollment(conn, req.user_id, req.course_id)
        })
    }
}

pub async fn record_progress_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordProgressRequest>,
) -> ApiResult<Json<ProgressSummaryResponse>> {
    let engine = LearnEngine::new(state.conn.clone());
    let summary = engine.record_progress(req).await?;
    Ok(Json(ProgressSummaryResponse::from(summary)))
}

#[derive(Debug, serde::Serialize)]
pub struct ProgressSummaryResponse {
    pub lessons_completed: i32,
    pub lessons_total: i32,
    pub completion_percentage: i32,
    pub status: EnrollmentStatus,
    pub next_lesson_id: Option<Uuid>,
}

impl From<ProgressSummary> for ProgressSummaryResponse {
    fn from(s: ProgressSummary) -> Self {
        Self {
            lessons_completed: s.lessons_completed,
            lessons_total: s.lessons_total,
            completion_percentage: s.percentage,
            status: s.status,
            next_lesson_id: s.next_lesson_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_progress_rounding() {
        let lessons = ids(3);
        let completed: HashSet<Uuid> = lessons.iter().take(1).copied().collect();
        let summary = compute_progress(&lessons, &completed);
        // 1/3 rounds to 33, not truncated from 33.33
        assert_eq!(summary.percentage, 33);
        assert_eq!(summary.status, EnrollmentStatus::InProgress);

        let completed: HashSet<Uuid> = lessons.iter().take(2).copied().collect();
        let summary = compute_progress(&lessons, &completed);
        // 2/3 rounds to 67
        assert_eq!(summary.percentage, 67);
    }

    #[test]
    fn test_completed_only_when_all_done() {
        let lessons = ids(4);
        let almost: HashSet<Uuid> = lessons.iter().take(3).copied().collect();
        assert_eq!(
            compute_progress(&lessons, &almost).status,
            EnrollmentStatus::InProgress
        );

        let all: HashSet<Uuid> = lessons.iter().copied().collect();
        let summary = compute_progress(&lessons, &all);
        assert_eq!(summary.status, EnrollmentStatus::Completed);
        assert_eq!(summary.percentage, 100);
        assert_eq!(summary.next_lesson_id, None);
    }

    #[test]
    fn test_empty_course_is_not_started() {
        let summary = compute_progress(&[], &HashSet::new());
        assert_eq!(summary.status, EnrollmentStatus::NotStarted);
        assert_eq!(summary.percentage, 0);
        assert_eq!(summary.lessons_total, 0);
        assert_eq!(summary.next_lesson_id, None);
    }

    #[test]
    fn test_next_lesson_is_first_incomplete_in_order() {
        let lessons = ids(3);
        // complete the middle lesson only
        let completed: HashSet<Uuid> = [lessons[1]].into_iter().collect();
        let summary = compute_progress(&lessons, &completed);
        assert_eq!(summary.next_lesson_id, Some(lessons[0]));

        let completed: HashSet<Uuid> = [lessons[0], lessons[1]].into_iter().collect();
        let summary = compute_progress(&lessons, &completed);
        assert_eq!(summary.next_lesson_id, Some(lessons[2]));
    }

    #[test]
    fn test_completed_at_survives_redundant_recompute() {
        let first_completion = Utc::now() - chrono::Duration::hours(3);
        let started = Utc::now() - chrono::Duration::days(1);
        let (started_at, completed_at) = enrollment_timestamps(
            EnrollmentStatus::Completed,
            Some(started),
            Some(first_completion),
            Utc::now(),
        );
        assert_eq!(started_at, Some(started));
        assert_eq!(completed_at, Some(first_completion));
    }

    #[test]
    fn test_started_at_stamped_on_first_progress_only() {
        let now = Utc::now();

        // no progress yet: stays unset
        let (started_at, completed_at) =
            enrollment_timestamps(EnrollmentStatus::NotStarted, None, None, now);
        assert_eq!(started_at, None);
        assert_eq!(completed_at, None);

        // first progress write stamps it
        let (started_at, _) =
            enrollment_timestamps(EnrollmentStatus::InProgress, None, None, now);
        assert_eq!(started_at, Some(now));

        // later writes keep the original stamp
        let original = now - chrono::Duration::hours(6);
        let (started_at, _) = enrollment_timestamps(
            EnrollmentStatus::InProgress,
            Some(original),
            None,
            now,
        );
        assert_eq!(started_at, Some(original));
    }

    #[test]
    fn test_completed_at_clears_when_status_regresses() {
        let now = Utc::now();
        let (_, completed_at) = enrollment_timestamps(
            EnrollmentStatus::InProgress,
            Some(now - chrono::Duration::days(1)),
            Some(now - chrono::Duration::hours(1)),
            now,
        );
        assert_eq!(completed_at, None);
    }

    #[test]
    fn test_foreign_completions_do_not_count() {
        let lessons = ids(2);
        // a completion for a lesson no longer in the course
        let completed: HashSet<Uuid> = [Uuid::new_v4()].into_iter().collect();
        let summary = compute_progress(&lessons, &completed);
        assert_eq!(summary.lessons_completed, 0);
        assert_eq!(summary.status, EnrollmentStatus::NotStarted);
    }
}
