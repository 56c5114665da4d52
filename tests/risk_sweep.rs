use chrono::{Duration, Utc};
use sqlx::Row;
use tempfile::TempDir;
use uuid::Uuid;

use campus_sentinel::db::{self, DbPool};
use campus_sentinel::dispatch::Dispatcher;
use campus_sentinel::models::{FactorKind, NotificationKind, Priority, RiskLevel, Role};
use campus_sentinel::notify::{ListFilter, Notifier};
use campus_sentinel::{directory, reminders, risk};

async fn setup() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}/test.db", dir.path().display());
    let pool = db::connect(&url).await.expect("connect");
    db::init_db(&pool).await.expect("migrate");
    (dir, pool)
}

fn notifier(pool: &DbPool) -> Notifier {
    Notifier::new(pool.clone(), std::sync::Arc::new(Dispatcher::new(pool.clone())))
}

async fn insert_user(pool: &DbPool, name: &str, email: &str, role: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, full_name, email, phone, role) VALUES (?, ?, ?, NULL, ?)")
        .bind(id)
        .bind(name)
        .bind(email)
        .bind(role)
        .execute(pool)
        .await
        .expect("insert user");
    id
}

async fn insert_attendance(pool: &DbPool, student_id: Uuid, days_ago: i64, status: &str) {
    sqlx::query(
        "INSERT INTO attendance_entries (id, student_id, subject, entry_date, status) \
         VALUES (?, ?, 'math', ?, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(Utc::now().date_naive() - Duration::days(days_ago))
    .bind(status)
    .execute(pool)
    .await
    .expect("insert attendance");
}

async fn insert_completed_attempt(pool: &DbPool, student_id: Uuid, percentage: f64) {
    let test_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO tests (id, course_id, title, test_date, total_marks) \
         VALUES (?, 'course-x', 'quiz', ?, 50)",
    )
    .bind(test_id)
    .bind(Utc::now().date_naive() - Duration::days(10))
    .execute(pool)
    .await
    .expect("insert test");

    sqlx::query(
        "INSERT INTO test_attempts (id, test_id, student_id, percentage, status, completed_at) \
         VALUES (?, ?, ?, ?, 'completed', ?)",
    )
    .bind(Uuid::new_v4())
    .bind(test_id)
    .bind(student_id)
    .bind(percentage)
    .bind(Utc::now())
    .execute(pool)
    .await
    .expect("insert attempt");
}

async fn profile_count(pool: &DbPool) -> i64 {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM risk_profiles")
        .fetch_one(pool)
        .await
        .expect("count");
    row.get("n")
}

#[tokio::test]
async fn sweep_then_low_attendance_reminder_end_to_end() {
    let (_dir, pool) = setup().await;
    let student = insert_user(&pool, "Avery Lee", "avery@campus.edu", "student").await;

    // 3 of 10 in-window days present, no completed attempts.
    for day in 1..=3 {
        insert_attendance(&pool, student, day, "present").await;
    }
    for day in 4..=10 {
        insert_attendance(&pool, student, day, "absent").await;
    }

    let sweep = risk::compute_all_risks(&pool).await.expect("sweep");
    assert_eq!(sweep.total, 1);
    assert_eq!(sweep.critical, 1);
    assert_eq!(sweep.at_risk, 0);
    assert_eq!(sweep.failed, 0);

    let profile = risk::profile_by_student(&pool, student)
        .await
        .expect("fetch")
        .expect("profile exists");
    assert_eq!(profile.risk_level, RiskLevel::Critical);
    assert_eq!(profile.attendance_percentage, 30);
    assert_eq!(profile.test_average, 0);
    assert_eq!(profile.factors.len(), 1);
    assert_eq!(profile.factors[0].kind, FactorKind::Attendance);

    let notifier = notifier(&pool);
    let reminded = reminders::low_attendance(&pool, &notifier)
        .await
        .expect("evaluator");
    assert_eq!(reminded, 1);

    let inbox = notifier
        .list_for_user(student, &ListFilter::default())
        .await
        .expect("inbox");
    assert_eq!(inbox.len(), 1);
    let n = &inbox[0];
    assert_eq!(n.kind, NotificationKind::Attendance);
    assert_eq!(n.priority, Priority::High);
    assert_eq!(
        n.metadata.get("attendancePercentage"),
        Some(&serde_json::json!(30))
    );
    assert!(n.sent_at.is_some());
}

#[tokio::test]
async fn recomputation_is_idempotent() {
    let (_dir, pool) = setup().await;
    let student = insert_user(&pool, "Jules Moreno", "jules@campus.edu", "student").await;
    insert_attendance(&pool, student, 2, "present").await;
    insert_attendance(&pool, student, 3, "absent").await;

    let first = risk::compute_risk(&pool, student).await.expect("first");
    let second = risk::compute_risk(&pool, student).await.expect("second");

    assert_eq!(profile_count(&pool).await, 1);
    assert_eq!(first.risk_level, second.risk_level);
    assert_eq!(first.factors, second.factors);
    assert_eq!(first.attendance_percentage, second.attendance_percentage);
}

#[tokio::test]
async fn no_data_defaults_are_benign() {
    let (_dir, pool) = setup().await;
    let student = insert_user(&pool, "Kiara Patel", "kiara@campus.edu", "student").await;

    let profile = risk::compute_risk(&pool, student).await.expect("compute");
    assert_eq!(profile.attendance_percentage, 100);
    assert_eq!(profile.test_average, 0);
    assert_eq!(profile.risk_level, RiskLevel::None);
    assert!(profile.factors.is_empty());
}

#[tokio::test]
async fn low_test_average_with_good_attendance_is_at_risk() {
    let (_dir, pool) = setup().await;
    let student = insert_user(&pool, "Noor Haddad", "noor@campus.edu", "student").await;
    for day in 1..=9 {
        insert_attendance(&pool, student, day, "present").await;
    }
    insert_attendance(&pool, student, 10, "absent").await;
    insert_completed_attempt(&pool, student, 45.0).await;

    let profile = risk::compute_risk(&pool, student).await.expect("compute");
    assert_eq!(profile.attendance_percentage, 90);
    assert_eq!(profile.test_average, 45);
    assert_eq!(profile.risk_level, RiskLevel::AtRisk);
    assert_eq!(profile.factors.len(), 1);
    assert_eq!(profile.factors[0].kind, FactorKind::Test);
}

#[tokio::test]
async fn upsert_never_touches_notes_or_incidents() {
    let (_dir, pool) = setup().await;
    let student = insert_user(&pool, "Sam Reyes", "sam@campus.edu", "student").await;

    let profile = risk::compute_risk(&pool, student).await.expect("compute");
    risk::add_note(&pool, student, "spoke with advisor", "dean")
        .await
        .expect("note");

    // Change the inputs and recompute; the note must survive the upsert.
    for day in 1..=10 {
        insert_attendance(&pool, student, day, "absent").await;
    }
    let updated = risk::compute_risk(&pool, student).await.expect("recompute");
    assert_eq!(updated.id, profile.id);
    assert_eq!(updated.risk_level, RiskLevel::Critical);

    let notes = risk::notes_for_profile(&pool, profile.id).await.expect("notes");
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].text, "spoke with advisor");
}

#[tokio::test]
async fn profile_for_creates_on_first_access() {
    let (_dir, pool) = setup().await;
    let student = insert_user(&pool, "Lena Fox", "lena@campus.edu", "student").await;

    assert_eq!(profile_count(&pool).await, 0);
    let profile = risk::profile_for(&pool, student).await.expect("create");
    assert_eq!(profile.risk_level, RiskLevel::None);
    assert_eq!(profile_count(&pool).await, 1);

    // Second access reads the stored row rather than recomputing.
    let again = risk::profile_for(&pool, student).await.expect("fetch");
    assert_eq!(again.id, profile.id);
    assert_eq!(profile_count(&pool).await, 1);
}

#[tokio::test]
async fn upcoming_test_reminders_hit_active_enrollees_only() {
    let (_dir, pool) = setup().await;
    let enrolled = insert_user(&pool, "Ada Osei", "ada@campus.edu", "student").await;
    let inactive = insert_user(&pool, "Ben Cho", "ben@campus.edu", "student").await;

    let today = Utc::now().date_naive();
    let test_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO tests (id, course_id, title, test_date, total_marks) \
         VALUES (?, 'math-101', 'Algebra midterm', ?, 100)",
    )
    .bind(test_id)
    .bind(today + Duration::days(3))
    .execute(&pool)
    .await
    .expect("insert test");

    // A test tomorrow is outside the (tomorrow, tomorrow+3] window.
    sqlx::query(
        "INSERT INTO tests (id, course_id, title, test_date, total_marks) \
         VALUES (?, 'math-101', 'Pop quiz', ?, 10)",
    )
    .bind(Uuid::new_v4())
    .bind(today + Duration::days(1))
    .execute(&pool)
    .await
    .expect("insert test");

    for (student, active) in [(enrolled, 1i64), (inactive, 0)] {
        sqlx::query("INSERT INTO enrollments (course_id, student_id, active) VALUES ('math-101', ?, ?)")
            .bind(student)
            .bind(active)
            .execute(&pool)
            .await
            .expect("enroll");
    }

    let notifier = notifier(&pool);
    let reminded = reminders::upcoming_tests(&pool, &notifier)
        .await
        .expect("evaluator");
    assert_eq!(reminded, 1);

    let inbox = notifier
        .list_for_user(enrolled, &ListFilter::default())
        .await
        .expect("inbox");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, NotificationKind::Test);
    assert_eq!(inbox[0].metadata.get("daysUntil"), Some(&serde_json::json!(3)));
    assert_eq!(
        inbox[0].metadata.get("totalMarks"),
        Some(&serde_json::json!(100))
    );

    let skipped = notifier
        .list_for_user(inactive, &ListFilter::default())
        .await
        .expect("inbox");
    assert!(skipped.is_empty());
}

#[tokio::test]
async fn fee_reminder_is_unconditional_for_students() {
    let (_dir, pool) = setup().await;
    insert_user(&pool, "Avery Lee", "avery@campus.edu", "student").await;
    insert_user(&pool, "Jules Moreno", "jules@campus.edu", "student").await;
    insert_user(&pool, "Marta Okafor", "marta@campus.edu", "teacher").await;

    let notifier = notifier(&pool);
    let reminded = reminders::fee_reminder(&pool, &notifier).await.expect("evaluator");
    assert_eq!(reminded, 2);

    let students = directory::users_by_role(&pool, Role::Student).await.expect("list");
    for student in students {
        let inbox = notifier
            .list_for_user(student.id, &ListFilter::default())
            .await
            .expect("inbox");
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, NotificationKind::Fee);
        assert_eq!(inbox[0].channels.len(), 3);
    }
}

#[tokio::test]
async fn teacher_alert_aggregates_critical_count() {
    let (_dir, pool) = setup().await;
    let teacher = insert_user(&pool, "Marta Okafor", "marta@campus.edu", "teacher").await;
    let notifier = notifier(&pool);

    // No critical students yet: evaluator stays silent.
    let alerted = reminders::teacher_alerts(&pool, &notifier).await.expect("evaluator");
    assert_eq!(alerted, 0);

    for (name, email) in [("A One", "a1@campus.edu"), ("B Two", "b2@campus.edu")] {
        let student = insert_user(&pool, name, email, "student").await;
        for day in 1..=10 {
            insert_attendance(&pool, student, day, "absent").await;
        }
        risk::compute_risk(&pool, student).await.expect("compute");
    }

    let alerted = reminders::teacher_alerts(&pool, &notifier).await.expect("evaluator");
    assert_eq!(alerted, 1);

    let inbox = notifier
        .list_for_user(teacher, &ListFilter::default())
        .await
        .expect("inbox");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, NotificationKind::Alert);
    assert_eq!(inbox[0].priority, Priority::High);
    assert_eq!(
        inbox[0].metadata.get("criticalCount"),
        Some(&serde_json::json!(2))
    );
}
