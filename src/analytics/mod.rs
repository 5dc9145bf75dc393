//! Analytics module: append-only event log, windowed metrics and periodic
//! rollups.

pub mod metrics;
pub mod rollups;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::error::{ApiError, ApiResult};
use crate::shared::state::AppState;

// ============================================================================
// DATABASE SCHEMA
// ============================================================================

diesel::table! {
    analytics_events (id) {
        id -> Uuid,
        organization_id -> Uuid,
        user_id -> Nullable<Uuid>,
        event_type -> Text,
        properties -> Jsonb,
        session_id -> Nullable<Text>,
        occurred_at -> Timestamptz,
    }
}

diesel::table! {
    analytics_rollups (id) {
        id -> Uuid,
        subject_type -> Text,
        subject_id -> Uuid,
        organization_id -> Uuid,
        period_start -> Timestamptz,
        period_minutes -> Int4,
        metrics -> Jsonb,
        computed_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(analytics_events, analytics_rollups);

// ============================================================================
// DATA MODELS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = analytics_events)]
pub struct AnalyticsEvent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub properties: serde_json::Value,
    pub session_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = analytics_rollups)]
pub struct AnalyticsRollup {
    pub id: Uuid,
    pub subject_type: String,
    pub subject_id: Uuid,
    pub organization_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_minutes: i32,
    pub metrics: serde_json::Value,
    pub computed_at: DateTime<Utc>,
}

/// Half-open time window used by all aggregation queries.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn resolve(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        let to = to.unwrap_or_else(Utc::now);
        let from = from.unwrap_or(to - Duration::days(30));
        Self { from, to }
    }
}

// ============================================================================
// EVENT INGEST
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RecordEventRequest {
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    #[serde(default)]
    pub properties: serde_json::Value,
    pub session_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

pub async fn record_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordEventRequest>,
) -> ApiResult<(StatusCode, Json<AnalyticsEvent>)> {
    if req.event_type.trim().is_empty() {
        return Err(ApiError::Validation("event_type is required".to_string()));
    }

    let mut conn = state.conn.get()?;
    let event = AnalyticsEvent {
        id: Uuid::new_v4(),
        organization_id: req.organization_id,
        user_id: req.user_id,
        event_type: req.event_type,
        properties: if req.properties.is_null() {
            serde_json::json!({})
        } else {
            req.properties
        },
        session_id: req.session_id,
        occurred_at: req.occurred_at.unwrap_or_else(Utc::now),
    };
    diesel::insert_into(analytics_events::table)
        .values(&event)
        .execute(&mut conn)?;

    Ok((StatusCode::CREATED, Json(event)))
}

#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    pub organization_id: Uuid,
    pub event_type: Option<String>,
    pub user_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventListQuery>,
) -> ApiResult<Json<Vec<AnalyticsEvent>>> {
    let mut conn = state.conn.get()?;
    let window = TimeWindow::resolve(query.from, query.to);

    let mut q = analytics_events::table
        .filter(analytics_events::organization_id.eq(query.organization_id))
        .filter(analytics_events::occurred_at.ge(window.from))
        .filter(analytics_events::occurred_at.lt(window.to))
        .into_boxed();

    if let Some(event_type) = query.event_type {
        q = q.filter(analytics_events::event_type.eq(event_type));
    }
    if let Some(user_id) = query.user_id {
        q = q.filter(analytics_events::user_id.eq(Some(user_id)));
    }

    let events: Vec<AnalyticsEvent> = q
        .order(analytics_events::occurred_at.desc())
        .limit(query.limit.unwrap_or(100).clamp(1, 1000))
        .load(&mut conn)?;
    Ok(Json(events))
}

// ============================================================================
// ROUTE CONFIGURATION
// ============================================================================

pub fn configure_analytics_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/analytics/events", get(list_events).post(record_event))
        .route(
            "/api/analytics/orgs/:id",
            get(metrics::handle_organization_metrics),
        )
        .route(
            "/api/analytics/courses/:id/funnel",
            get(metrics::handle_course_funnel),
        )
        .route("/api/analytics/users/:id", get(metrics::handle_user_metrics))
        .route("/api/analytics/rollups", get(handle_list_rollups))
}

#[derive(Debug, Deserialize)]
pub struct RollupListQuery {
    pub organization_id: Uuid,
    pub subject_type: Option<String>,
    pub subject_id: Option<Uuid>,
}

pub async fn handle_list_rollups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RollupListQuery>,
) -> ApiResult<Json<Vec<AnalyticsRollup>>> {
    let mut conn = state.conn.get()?;

    let mut q = analytics_rollups::table
        .filter(analytics_rollups::organization_id.eq(query.organization_id))
        .into_boxed();
    if let Some(subject_type) = query.subject_type {
        q = q.filter(analytics_rollups::subject_type.eq(subject_type));
    }
    if let Some(subject_id) = query.subject_id {
        q = q.filter(analytics_rollups::subject_id.eq(subject_id));
    }

    let rows: Vec<AnalyticsRollup> = q
        .order(analytics_rollups::period_start.desc())
        .limit(500)
        .load(&mut conn)?;
    Ok(Json(rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_defaults_to_last_30_days() {
        let window = TimeWindow::resolve(None, None);
        assert_eq!(window.to - window.from, Duration::days(30));
    }

    #[test]
    fn test_time_window_keeps_explicit_bounds() {
        let from = Utc::now() - Duration::hours(2);
        let to = Utc::now();
        let window = TimeWindow::resolve(Some(from), Some(to));
        assert_eq!(window.from, from);
        assert_eq!(window.to, to);
    }
}
