use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub type DbPool = SqlitePool;

/// Open (creating if necessary) the SQLite database behind `database_url`.
pub async fn connect(database_url: &str) -> anyhow::Result<DbPool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url: {database_url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to open database")?;

    Ok(pool)
}

pub async fn init_db(pool: &DbPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Load realistic seed data: a small roster, a rolling attendance window and a
/// handful of graded attempts. Idempotent, keyed on email / fixed ids.
pub async fn seed(pool: &DbPool) -> anyhow::Result<()> {
    let users = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Avery Lee",
            "avery.lee@campus.edu",
            Some("+15550100"),
            "student",
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Jules Moreno",
            "jules.moreno@campus.edu",
            Some("+15550101"),
            "student",
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "Kiara Patel",
            "kiara.patel@campus.edu",
            None,
            "student",
        ),
        (
            Uuid::parse_str("7be17f4e-5b1f-4e02-9b07-2e8cf79c3a11")?,
            "Marta Okafor",
            "marta.okafor@campus.edu",
            Some("+15550199"),
            "teacher",
        ),
    ];

    for (id, name, email, phone, role) in users {
        sqlx::query(
            r#"
            INSERT INTO users (id, full_name, email, phone, role)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (email) DO UPDATE
            SET full_name = excluded.full_name, phone = excluded.phone, role = excluded.role
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .bind(phone)
        .bind(role)
        .execute(pool)
        .await?;
    }

    let today = Utc::now().date_naive();

    // Avery: mostly absent over the last two weeks. Jules: solid attendance.
    let attendance = vec![
        ("avery.lee@campus.edu", 1i64, "math", "absent"),
        ("avery.lee@campus.edu", 2, "math", "absent"),
        ("avery.lee@campus.edu", 3, "physics", "present"),
        ("avery.lee@campus.edu", 5, "math", "absent"),
        ("avery.lee@campus.edu", 8, "physics", "absent"),
        ("avery.lee@campus.edu", 9, "math", "late"),
        ("jules.moreno@campus.edu", 1, "math", "present"),
        ("jules.moreno@campus.edu", 2, "math", "present"),
        ("jules.moreno@campus.edu", 3, "physics", "present"),
        ("jules.moreno@campus.edu", 5, "math", "present"),
        ("jules.moreno@campus.edu", 8, "physics", "absent"),
    ];

    for (email, days_ago, subject, status) in attendance {
        let student_id = user_id_by_email(pool, email).await?;
        sqlx::query(
            r#"
            INSERT INTO attendance_entries (id, student_id, subject, entry_date, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(subject)
        .bind(today - ChronoDuration::days(days_ago))
        .bind(status)
        .execute(pool)
        .await?;
    }

    let test_id = Uuid::parse_str("9f6c1f07-7f52-4b92-a7c5-4a2a9f3f1d20")?;
    sqlx::query(
        r#"
        INSERT INTO tests (id, course_id, title, test_date, total_marks)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET test_date = excluded.test_date
        "#,
    )
    .bind(test_id)
    .bind("math-101")
    .bind("Algebra midterm")
    .bind(today + ChronoDuration::days(3))
    .bind(100i64)
    .execute(pool)
    .await?;

    for email in ["avery.lee@campus.edu", "jules.moreno@campus.edu"] {
        let student_id = user_id_by_email(pool, email).await?;
        sqlx::query(
            r#"
            INSERT INTO enrollments (course_id, student_id, active)
            VALUES (?, ?, 1)
            ON CONFLICT (course_id, student_id) DO NOTHING
            "#,
        )
        .bind("math-101")
        .bind(student_id)
        .execute(pool)
        .await?;
    }

    let attempts = vec![
        ("jules.moreno@campus.edu", 82.0f64),
        ("jules.moreno@campus.edu", 74.0),
        ("kiara.patel@campus.edu", 28.0),
    ];

    for (email, percentage) in attempts {
        let student_id = user_id_by_email(pool, email).await?;
        sqlx::query(
            r#"
            INSERT INTO test_attempts (id, test_id, student_id, percentage, status, completed_at)
            VALUES (?, ?, ?, ?, 'completed', ?)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(test_id)
        .bind(student_id)
        .bind(percentage)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    }

    Ok(())
}

async fn user_id_by_email(pool: &DbPool, email: &str) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_one(pool)
        .await
        .with_context(|| format!("no user with email {email}"))?
        .get("id");
    Ok(id)
}

/// Import attendance entries from a CSV export of the attendance ledger.
/// Unknown students are created with the student role so partial exports load
/// cleanly.
pub async fn import_attendance_csv(
    pool: &DbPool,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        full_name: String,
        email: String,
        subject: String,
        status: String,
        entry_date: NaiveDate,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        row.status
            .parse::<crate::models::AttendanceStatus>()
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let student_id: Uuid = sqlx::query(
            r#"
            INSERT INTO users (id, full_name, email, phone, role)
            VALUES (?, ?, ?, NULL, 'student')
            ON CONFLICT (email) DO UPDATE
            SET full_name = excluded.full_name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.full_name)
        .bind(&row.email)
        .fetch_one(pool)
        .await?
        .get("id");

        let result = sqlx::query(
            r#"
            INSERT INTO attendance_entries (id, student_id, subject, entry_date, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(&row.subject)
        .bind(row.entry_date)
        .bind(&row.status)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}
