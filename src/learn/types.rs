//! Wire and document types for the learn module.
//!
//! Courses carry their module/lesson structure as one embedded Jsonb
//! document, so the lesson sequence always travels with the course row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ----- Embedded course document -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseModule {
    pub id: Uuid,
    pub title: String,
    pub position: i32,
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Uuid,
    pub title: String,
    pub kind: LessonKind,
    pub position: i32,
    #[serde(default)]
    pub estimated_minutes: i32,
    #[serde(default)]
    pub content_url: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub quiz: Option<QuizSpec>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LessonKind {
    Video,
    Article,
    Quiz,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizSpec {
    #[serde(default = "default_passing_score")]
    pub passing_score: i32,
    pub questions: Vec<QuizQuestion>,
}

fn default_passing_score() -> i32 {
    70
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub id: Uuid,
    pub text: String,
    pub options: Vec<String>,
    pub correct_answers: Vec<usize>,
    #[serde(default = "default_points")]
    pub points: i32,
}

fn default_points() -> i32 {
    1
}

/// Decodes the Jsonb `modules` column; a malformed document reads as empty
/// rather than failing the whole request.
pub fn decode_modules(value: &serde_json::Value) -> Vec<CourseModule> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

/// Flattens the document into the position-ordered lesson sequence.
pub fn ordered_lessons(modules: &[CourseModule]) -> Vec<&Lesson> {
    let mut indexed: Vec<(i32, &CourseModule)> =
        modules.iter().map(|m| (m.position, m)).collect();
    indexed.sort_by_key(|(pos, _)| *pos);

    let mut lessons = Vec::new();
    for (_, module) in indexed {
        let mut inner: Vec<&Lesson> = module.lessons.iter().collect();
        inner.sort_by_key(|l| l.position);
        lessons.extend(inner);
    }
    lessons
}

pub fn find_lesson<'a>(modules: &'a [CourseModule], lesson_id: Uuid) -> Option<&'a Lesson> {
    modules
        .iter()
        .flat_map(|m| m.lessons.iter())
        .find(|l| l.id == lesson_id)
}

// ----- Statuses -----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CourseStatus {
    Draft,
    Published,
}

impl From<&str> for CourseStatus {
    fn from(s: &str) -> Self {
        match s {
            "published" => Self::Published,
            _ => Self::Draft,
        }
    }
}

impl std::fmt::Display for CourseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Published => write!(f, "published"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl From<&str> for EnrollmentStatus {
    fn from(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            _ => Self::NotStarted,
        }
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LessonProgressStatus {
    Started,
    Completed,
}

impl From<&str> for LessonProgressStatus {
    fn from(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            _ => Self::Started,
        }
    }
}

impl std::fmt::Display for LessonProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

// ----- Course requests/responses -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCourseRequest {
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    #[serde(default)]
    pub modules: Vec<CourseModule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCourseRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub modules: Option<Vec<CourseModule>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseFilters {
    pub category: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseResponse {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub status: CourseStatus,
    pub modules: Vec<CourseModule>,
    pub lessons_total: i32,
    pub estimated_minutes: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ----- Enrollment requests/responses -----

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollRequest {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollmentFilters {
    pub organization_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentDetail {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    /// None when the course has since been deleted; the record still reads.
    pub course_title: Option<String>,
    pub status: EnrollmentStatus,
    pub completion_percentage: i32,
    pub lessons_completed: i32,
    pub lessons_total: i32,
    pub next_lesson_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ----- Lesson progress requests -----

#[derive(Debug, Clone, Deserialize)]
pub struct RecordProgressRequest {
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub lesson_id: Uuid,
    #[serde(default)]
    pub watch_seconds: Option<i32>,
    #[serde(default)]
    pub max_scroll_percent: Option<i32>,
    #[serde(default)]
    pub time_spent_seconds: Option<i32>,
    #[serde(default)]
    pub completed: bool,
}

// ----- Quiz requests/responses -----

#[derive(Debug, Clone, Deserialize)]
pub struct QuizSubmission {
    pub user_id: Uuid,
    /// Question id -> selected option indexes.
    pub answers: HashMap<String, Vec<usize>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuizResult {
    pub course_id: Uuid,
    pub lesson_id: Uuid,
    pub user_id: Uuid,
    pub attempt_number: i32,
    pub earned_points: i32,
    pub total_points: i32,
    pub percentage: i32,
    pub passed: bool,
    pub breakdown: Vec<AnswerResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResult {
    pub question_id: Uuid,
    pub is_correct: bool,
    pub points_earned: i32,
    pub correct_answers: Vec<usize>,
    pub user_answers: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lesson(title: &str, position: i32) -> Lesson {
        Lesson {
            id: Uuid::new_v4(),
            title: title.to_string(),
            kind: LessonKind::Article,
            position,
            estimated_minutes: 5,
            content_url: None,
            body: None,
            quiz: None,
        }
    }

    #[test]
    fn test_ordered_lessons_across_modules() {
        let modules = vec![
            CourseModule {
                id: Uuid::new_v4(),
                title: "Second".to_string(),
                position: 2,
                lessons: vec![lesson("c", 1), lesson("d", 2)],
            },
            CourseModule {
                id: Uuid::new_v4(),
                title: "First".to_string(),
                position: 1,
                lessons: vec![lesson("b", 2), lesson("a", 1)],
            },
        ];
        let titles: Vec<&str> = ordered_lessons(&modules)
            .iter()
            .map(|l| l.title.as_str())
            .collect();
        assert_eq!(titles, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_decode_modules_tolerates_garbage() {
        assert!(decode_modules(&serde_json::json!("nonsense")).is_empty());
        assert!(decode_modules(&serde_json::json!({"not": "a list"})).is_empty());
    }

    #[test]
    fn test_status_conversions() {
        assert_eq!(CourseStatus::from("published"), CourseStatus::Published);
        assert_eq!(CourseStatus::from("anything"), CourseStatus::Draft);
        assert_eq!(EnrollmentStatus::from("completed"), EnrollmentStatus::Completed);
        assert_eq!(EnrollmentStatus::from("unknown"), EnrollmentStatus::NotStarted);
        assert_eq!(EnrollmentStatus::InProgress.to_string(), "in_progress");
        assert_eq!(LessonProgressStatus::from("completed").to_string(), "completed");
    }

    #[test]
    fn test_quiz_spec_defaults() {
        let spec: QuizSpec = serde_json::from_value(serde_json::json!({
            "questions": [{
                "id": Uuid::new_v4(),
                "text": "2 + 2?",
                "options": ["3", "4"],
                "correct_answers": [1]
            }]
        }))
        .unwrap();
        assert_eq!(spec.passing_score, 70);
        assert_eq!(spec.questions[0].points, 1);
    }
}
