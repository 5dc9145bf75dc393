//! Periodic rollup recomputation. One rollup row per (subject, period start,
//! period length), upserted on every recompute.

use chrono::{DateTime, Duration, Timelike, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::metrics::{load_course_funnel, load_organization_metrics, load_user_metrics};
use super::{analytics_rollups, AnalyticsRollup, TimeWindow};
use crate::directory::{organization_members, organizations};
use crate::learn::courses;
use crate::shared::error::ApiError;
use crate::shared::state::AppState;
use std::sync::Arc;

pub const SUBJECT_ORGANIZATION: &str = "organization";
pub const SUBJECT_COURSE: &str = "course";
pub const SUBJECT_USER: &str = "user";
pub const DAILY_PERIOD_MINUTES: i32 = 24 * 60;

/// Current UTC-day window shared by every daily recompute.
fn daily_window() -> TimeWindow {
    let period_start = day_start(Utc::now());
    TimeWindow {
        from: period_start,
        to: period_start + Duration::minutes(i64::from(DAILY_PERIOD_MINUTES)),
    }
}

/// Start of the UTC day containing `at`.
pub fn day_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

pub fn upsert_rollup(
    conn: &mut PgConnection,
    subject_type: &str,
    subject_id: Uuid,
    organization_id: Uuid,
    period_start: DateTime<Utc>,
    period_minutes: i32,
    metrics: serde_json::Value,
) -> Result<(), diesel::result::Error> {
    let rollup = AnalyticsRollup {
        id: Uuid::new_v4(),
        subject_type: subject_type.to_string(),
        subject_id,
        organization_id,
        period_start,
        period_minutes,
        metrics,
        computed_at: Utc::now(),
    };

    diesel::insert_into(analytics_rollups::table)
        .values(&rollup)
        .on_conflict((
            analytics_rollups::subject_type,
            analytics_rollups::subject_id,
            analytics_rollups::period_start,
            analytics_rollups::period_minutes,
        ))
        .do_update()
        .set((
            analytics_rollups::metrics.eq(&rollup.metrics),
            analytics_rollups::computed_at.eq(rollup.computed_at),
        ))
        .execute(conn)?;

    Ok(())
}

/// Recomputes the current-day rollup for one organization.
pub fn recompute_organization_rollup(
    conn: &mut PgConnection,
    organization_id: Uuid,
) -> Result<(), ApiError> {
    let window = daily_window();
    let metrics = load_organization_metrics(conn, organization_id, window)?;
    upsert_rollup(
        conn,
        SUBJECT_ORGANIZATION,
        organization_id,
        organization_id,
        window.from,
        DAILY_PERIOD_MINUTES,
        serde_json::to_value(&metrics).unwrap_or_else(|_| serde_json::json!({})),
    )?;
    Ok(())
}

/// Recomputes the current-day rollup for one course. The metrics document is
/// the dropoff funnel, which reflects all progress to date.
pub fn recompute_course_rollup(
    conn: &mut PgConnection,
    course_id: Uuid,
    organization_id: Uuid,
) -> Result<(), ApiError> {
    let window = daily_window();
    let funnel = load_course_funnel(conn, course_id)?;
    upsert_rollup(
        conn,
        SUBJECT_COURSE,
        course_id,
        organization_id,
        window.from,
        DAILY_PERIOD_MINUTES,
        serde_json::to_value(&funnel).unwrap_or_else(|_| serde_json::json!({})),
    )?;
    Ok(())
}

/// Recomputes the current-day rollup for one organization member.
pub fn recompute_user_rollup(
    conn: &mut PgConnection,
    organization_id: Uuid,
    user_id: Uuid,
) -> Result<(), ApiError> {
    let window = daily_window();
    let metrics = load_user_metrics(conn, organization_id, user_id, window)?;
    upsert_rollup(
        conn,
        SUBJECT_USER,
        user_id,
        organization_id,
        window.from,
        DAILY_PERIOD_MINUTES,
        serde_json::to_value(&metrics).unwrap_or_else(|_| serde_json::json!({})),
    )?;
    Ok(())
}

fn recompute_all(state: &AppState) -> Result<usize, ApiError> {
    let mut conn = state.conn.get()?;
    let org_ids: Vec<Uuid> = organizations::table
        .select(organizations::id)
        .load(&mut conn)?;
    let course_ids: Vec<(Uuid, Uuid)> = courses::table
        .select((courses::id, courses::organization_id))
        .load(&mut conn)?;
    let member_ids: Vec<(Uuid, Uuid)> = organization_members::table
        .select((
            organization_members::organization_id,
            organization_members::user_id,
        ))
        .distinct()
        .load(&mut conn)?;

    let mut recomputed = 0;
    for organization_id in org_ids {
        match recompute_organization_rollup(&mut conn, organization_id) {
            Ok(()) => recomputed += 1,
            Err(e) => log::warn!(
                "Rollup recompute failed for org {}: {}",
                organization_id,
                e
            ),
        }
    }
    for (course_id, organization_id) in course_ids {
        match recompute_course_rollup(&mut conn, course_id, organization_id) {
            Ok(()) => recomputed += 1,
            Err(e) => log::warn!("Rollup recompute failed for course {}: {}", course_id, e),
        }
    }
    for (organization_id, user_id) in member_ids {
        match recompute_user_rollup(&mut conn, organization_id, user_id) {
            Ok(()) => recomputed += 1,
            Err(e) => log::warn!("Rollup recompute failed for user {}: {}", user_id, e),
        }
    }
    Ok(recomputed)
}

/// Spawns the hourly rollup loop. One failing organization does not stop the
/// sweep.
pub fn spawn_rollup_service(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let state = state.clone();
            let result =
                tokio::task::spawn_blocking(move || recompute_all(&state)).await;
            match result {
                Ok(Ok(count)) => log::info!("Recomputed {} rollup(s)", count),
                Ok(Err(e)) => log::error!("Rollup sweep failed: {}", e),
                Err(e) => log::error!("Rollup task panicked: {}", e),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_start_truncates_to_midnight() {
        let at = Utc::now();
        let start = day_start(at);
        assert_eq!(start.hour(), 0);
        assert_eq!(start.minute(), 0);
        assert_eq!(start.second(), 0);
        assert!(start <= at);
        assert!(at - start < Duration::days(1));
    }
}
