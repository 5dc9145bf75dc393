#[cfg(test)]
mod rollup_sweep_tests {
    use diesel::prelude::*;
    use diesel::r2d2::{ConnectionManager, Pool};
    use diesel_migrations::MigrationHarness;
    use learnserver::analytics::rollups::{
        recompute_course_rollup, recompute_organization_rollup, recompute_user_rollup,
        DAILY_PERIOD_MINUTES, SUBJECT_COURSE, SUBJECT_ORGANIZATION, SUBJECT_USER,
    };
    use learnserver::analytics::{analytics_rollups, AnalyticsRollup};
    use learnserver::learn::types::{CourseModule, CreateCourseRequest, Lesson, LessonKind};
    use learnserver::learn::LearnEngine;
    use learnserver::MIGRATIONS;
    use uuid::Uuid;

    fn subject_rollups(
        conn: &mut PgConnection,
        org_id: Uuid,
        subject_type: &str,
    ) -> Vec<AnalyticsRollup> {
        analytics_rollups::table
            .filter(analytics_rollups::organization_id.eq(org_id))
            .filter(analytics_rollups::subject_type.eq(subject_type))
            .load(conn)
            .expect("load rollups")
    }

    #[tokio::test]
    async fn test_recompute_writes_all_subject_types() {
        let database_url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                println!("Skipping test - DATABASE_URL not set");
                return;
            }
        };
        let mut conn = match learnserver::shared::utils::establish_pg_connection() {
            Ok(conn) => conn,
            Err(_) => {
                println!("Skipping test - Postgres not available");
                return;
            }
        };
        conn.run_pending_migrations(MIGRATIONS).expect("migrations");

        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder().max_size(2).build(manager).expect("pool");
        let engine = LearnEngine::new(pool);

        let org_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let module = CourseModule {
            id: Uuid::new_v4(),
            title: "Basics".to_string(),
            position: 1,
            lessons: vec![Lesson {
                id: Uuid::new_v4(),
                title: "Intro".to_string(),
                kind: LessonKind::Article,
                position: 1,
                estimated_minutes: 5,
                content_url: None,
                body: Some("text".to_string()),
                quiz: None,
            }],
        };
        let course = engine
            .create_course(
                org_id,
                CreateCourseRequest {
                    title: "Security Basics".to_string(),
                    description: None,
                    category: "general".to_string(),
                    modules: vec![module],
                },
                None,
            )
            .await
            .expect("create course");

        recompute_organization_rollup(&mut conn, org_id).expect("org rollup");
        recompute_course_rollup(&mut conn, course.id, org_id).expect("course rollup");
        recompute_user_rollup(&mut conn, org_id, user_id).expect("user rollup");

        let org_rows = subject_rollups(&mut conn, org_id, SUBJECT_ORGANIZATION);
        assert_eq!(org_rows.len(), 1);
        assert_eq!(org_rows[0].subject_id, org_id);
        assert_eq!(org_rows[0].period_minutes, DAILY_PERIOD_MINUTES);

        let course_rows = subject_rollups(&mut conn, org_id, SUBJECT_COURSE);
        assert_eq!(course_rows.len(), 1);
        assert_eq!(course_rows[0].subject_id, course.id);
        assert!(course_rows[0].metrics.get("steps").is_some());

        let user_rows = subject_rollups(&mut conn, org_id, SUBJECT_USER);
        assert_eq!(user_rows.len(), 1);
        assert_eq!(user_rows[0].subject_id, user_id);

        // A second recompute in the same period updates in place.
        recompute_course_rollup(&mut conn, course.id, org_id).expect("course rollup again");
        let course_rows = subject_rollups(&mut conn, org_id, SUBJECT_COURSE);
        assert_eq!(course_rows.len(), 1);
        assert!(course_rows[0].computed_at >= org_rows[0].computed_at);
    }
}
