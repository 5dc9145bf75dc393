//! Quiz grading and attempts. Grading is a pure function over the lesson's
//! embedded question list; a passing attempt completes the quiz lesson
//! through the same transactional path as any other lesson completion.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use diesel::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::progress::sync_enrollment;
use super::types::{
    decode_modules, find_lesson, AnswerResult, LessonKind, LessonProgressStatus, QuizResult,
    QuizSpec, QuizSubmission,
};
use super::{courses, lesson_progress, quiz_attempts, Course, LearnEngine, LessonProgress, QuizAttempt};
use crate::shared::error::{ApiError, ApiResult};
use crate::shared::state::AppState;

pub struct GradedSubmission {
    pub earned_points: i32,
    pub total_points: i32,
    pub percentage: i32,
    pub passed: bool,
    pub breakdown: Vec<AnswerResult>,
}

/// Exact-match grading: a question scores its points iff the selected option
/// set equals the correct set. Percentage is rounded; pass iff percentage
/// reaches the quiz's passing score.
pub fn grade_submission(
    spec: &QuizSpec,
    answers: &HashMap<String, Vec<usize>>,
) -> GradedSubmission {
    let mut total_points = 0;
    let mut earned_points = 0;
    let mut breakdown = Vec::new();

    for question in &spec.questions {
        total_points += question.points;
        let user_answers = answers
            .get(&question.id.to_string())
            .cloned()
            .unwrap_or_default();

        let mut selected = user_answers.clone();
        selected.sort_unstable();
        selected.dedup();
        let mut expected = question.correct_answers.clone();
        expected.sort_unstable();
        expected.dedup();
        let is_correct = selected == expected;
        let points_earned = if is_correct { question.points } else { 0 };
        earned_points += points_earned;

        breakdown.push(AnswerResult {
            question_id: question.id,
            is_correct,
            points_earned,
            correct_answers: question.correct_answers.clone(),
            user_answers,
        });
    }

    let percentage = if total_points > 0 {
        ((earned_points as f64 / total_points as f64) * 100.0).round() as i32
    } else {
        0
    };

    GradedSubmission {
        earned_points,
        total_points,
        percentage,
        passed: percentage >= spec.passing_score,
        breakdown,
    }
}

impl LearnEngine {
    pub async fn submit_quiz(
        &self,
        course_id: Uuid,
        lesson_id: Uuid,
        submission: QuizSubmission,
    ) -> ApiResult<QuizResult> {
        let mut conn = self.db.get()?;

        conn.transaction::<_, ApiError, _>(|conn| {
            let course: Course = courses::table
                .filter(courses::id.eq(course_id))
                .first(conn)
                .optional()?
                .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))?;

            let modules = decode_modules(&course.modules);
            let lesson = find_lesson(&modules, lesson_id)
                .ok_or_else(|| ApiError::NotFound("Lesson not found in course".to_string()))?;

            if lesson.kind != LessonKind::Quiz {
                return Err(ApiError::Validation(
                    "Lesson does not carry a quiz".to_string(),
                ));
            }
            let spec = lesson.quiz.as_ref().ok_or_else(|| {
                ApiError::Validation("Quiz lesson has no question list".to_string())
            })?;

            let graded = grade_submission(spec, &submission.answers);

            let previous: i64 = quiz_attempts::table
                .filter(quiz_attempts::user_id.eq(submission.user_id))
                .filter(quiz_attempts::lesson_id.eq(lesson_id))
                .count()
                .get_result(conn)?;
            let attempt_number = previous as i32 + 1;

            let now = Utc::now();
            let attempt = QuizAttempt {
                id: Uuid::new_v4(),
                user_id: submission.user_id,
                course_id,
                lesson_id,
                attempt_number,
                earned_points: graded.earned_points,
                total_points: graded.total_points,
                percentage: graded.percentage,
                passed: graded.passed,
                breakdown: serde_json::to_value(&graded.breakdown)
                    .unwrap_or_else(|_| serde_json::json!([])),
                submitted_at: now,
            };
            diesel::insert_into(quiz_attempts::table)
                .values(&attempt)
                .execute(conn)?;

            if graded.passed {
                mark_quiz_lesson_completed(conn, submission.user_id, course_id, lesson_id)?;
                sync_enrollment(conn, submission.user_id, course_id)?;
            }

            Ok(QuizResult {
                course_id,
                lesson_id,
                user_id: submission.user_id,
                attempt_number,
                earned_points: graded.earned_points,
                total_points: graded.total_points,
                percentage: graded.percentage,
                passed: graded.passed,
                breakdown: graded.breakdown,
            })
        })
    }

    pub async fn list_attempts(
        &self,
        course_id: Uuid,
        lesson_id: Uuid,
        user_id: Option<Uuid>,
    ) -> ApiResult<Vec<QuizAttempt>> {
        let mut conn = self.db.get()?;

        let mut query = quiz_attempts::table
            .filter(quiz_attempts::course_id.eq(course_id))
            .filter(quiz_attempts::lesson_id.eq(lesson_id))
            .into_boxed();

        if let Some(user_id) = user_id {
            query = query.filter(quiz_attempts::user_id.eq(user_id));
        }

        Ok(query
            .order(quiz_attempts::submitted_at.desc())
            .load::<QuizAttempt>(&mut conn)?)
    }
}

fn mark_quiz_lesson_completed(
    conn: &mut PgConnection,
    user_id: Uuid,
    course_id: Uuid,
    lesson_id: Uuid,
) -> Result<(), diesel::result::Error> {
    let now = Utc::now();
    let existing: Option<LessonProgress> = lesson_progress::table
        .filter(lesson_progress::user_id.eq(user_id))
        .filter(lesson_progress::lesson_id.eq(lesson_id))
        .first(conn)
        .optional()?;

    match existing {
        Some(row) => {
            diesel::update(lesson_progress::table.filter(lesson_progress::id.eq(row.id)))
                .set((
                    lesson_progress::status.eq(LessonProgressStatus::Completed.to_string()),
                    lesson_progress::completed_at.eq(row.completed_at.or(Some(now))),
                    lesson_progress::updated_at.eq(now),
                ))
                .execute(conn)?;
        }
        None => {
            let row = LessonProgress {
                id: Uuid::new_v4(),
                user_id,
                course_id,
                lesson_id,
                status: LessonProgressStatus::Completed.to_string(),
                watch_seconds: 0,
                max_scroll_percent: 0,
                time_spent_seconds: 0,
                started_at: now,
                completed_at: Some(now),
                updated_at: now,
            };
            diesel::insert_into(lesson_progress::table)
                .values(&row)
                .execute(conn)?;
        }
    }
    Ok(())
}

// ----- Handlers -----

pub async fn submit_quiz(
    State(state): State<Arc<AppState>>,
    Path((course_id, lesson_id)): Path<(Uuid, Uuid)>,
    Json(submission): Json<QuizSubmission>,
) -> ApiResult<Json<QuizResult>> {
    let engine = LearnEngine::new(state.conn.clone());
    Ok(Json(engine.submit_quiz(course_id, lesson_id, submission).await?))
}

#[derive(Debug, serde::Deserialize)]
pub struct AttemptsQuery {
    pub user_id: Option<Uuid>,
}

pub async fn list_attempts(
    State(state): State<Arc<AppState>>,
    Path((course_id, lesson_id)): Path<(Uuid, Uuid)>,
    axum::extract::Query(query): axum::extract::Query<AttemptsQuery>,
) -> ApiResult<Json<Vec<QuizAttempt>>> {
    let engine = LearnEngine::new(state.conn.clone());
    Ok(Json(
        engine
            .list_attempts(course_id, lesson_id, query.user_id)
            .await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::types::QuizQuestion;

    fn spec() -> QuizSpec {
        QuizSpec {
            passing_score: 70,
            questions: vec![
                QuizQuestion {
                    id: Uuid::new_v4(),
                    text: "Pick one".to_string(),
                    options: vec!["a".into(), "b".into()],
                    correct_answers: vec![1],
                    points: 2,
                },
                QuizQuestion {
                    id: Uuid::new_v4(),
                    text: "Pick two".to_string(),
                    options: vec!["a".into(), "b".into(), "c".into()],
                    correct_answers: vec![0, 2],
                    points: 3,
                },
            ],
        }
    }

    #[test]
    fn test_full_marks_pass() {
        let spec = spec();
        let mut answers = HashMap::new();
        answers.insert(spec.questions[0].id.to_string(), vec![1]);
        // selection order must not matter
        answers.insert(spec.questions[1].id.to_string(), vec![2, 0]);

        let graded = grade_submission(&spec, &answers);
        assert_eq!(graded.earned_points, 5);
        assert_eq!(graded.total_points, 5);
        assert_eq!(graded.percentage, 100);
        assert!(graded.passed);
    }

    #[test]
    fn test_partial_answer_set_scores_zero_for_question() {
        let spec = spec();
        let mut answers = HashMap::new();
        answers.insert(spec.questions[0].id.to_string(), vec![1]);
        // only one of the two correct options
        answers.insert(spec.questions[1].id.to_string(), vec![0]);

        let graded = grade_submission(&spec, &answers);
        assert_eq!(graded.earned_points, 2);
        // 2/5 = 40%
        assert_eq!(graded.percentage, 40);
        assert!(!graded.passed);
        assert!(!graded.breakdown[1].is_correct);
    }

    #[test]
    fn test_missing_answers_count_as_wrong() {
        let spec = spec();
        let graded = grade_submission(&spec, &HashMap::new());
        assert_eq!(graded.earned_points, 0);
        assert_eq!(graded.percentage, 0);
        assert!(!graded.passed);
        assert_eq!(graded.breakdown.len(), 2);
    }

    #[test]
    fn test_empty_question_list_never_passes() {
        let spec = QuizSpec {
            passing_score: 70,
            questions: vec![],
        };
        let graded = grade_submission(&spec, &HashMap::new());
        assert_eq!(graded.percentage, 0);
        assert!(!graded.passed);
    }

    #[test]
    fn test_pass_boundary() {
        let spec = QuizSpec {
            passing_score: 70,
            questions: (0..10)
                .map(|i| QuizQuestion {
                    id: Uuid::new_v4(),
                    text: format!("q{}", i),
                    options: vec!["a".into(), "b".into()],
                    correct_answers: vec![0],
                    points: 1,
                })
                .collect(),
        };
        let mut answers = HashMap::new();
        for q in spec.questions.iter().take(7) {
            answers.insert(q.id.to_string(), vec![0]);
        }
        let graded = grade_submission(&spec, &answers);
        assert_eq!(graded.percentage, 70);
        assert!(graded.passed);
    }
}
