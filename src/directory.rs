//! Read-side queries against the adjacent platform data: the user directory,
//! the attendance ledger and the test/attempt ledger. This subsystem never
//! writes to any of these tables.

use std::str::FromStr;

use chrono::NaiveDate;
use sqlx::Row;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::{Error, Result};
use crate::models::{AttendanceEntry, AttendanceStatus, Role, TestAttempt, TestRecord, User};

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    Ok(User {
        id: row.get("id"),
        full_name: row.get("full_name"),
        email: row.get("email"),
        phone: row.get("phone"),
        role: Role::from_str(row.get("role"))?,
    })
}

pub async fn user_by_id(pool: &DbPool, id: Uuid) -> Result<User> {
    let row = sqlx::query("SELECT id, full_name, email, phone, role FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found("user", id.to_string()))?;
    user_from_row(&row)
}

pub async fn user_by_email(pool: &DbPool, email: &str) -> Result<User> {
    let row = sqlx::query("SELECT id, full_name, email, phone, role FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found("user", email))?;
    user_from_row(&row)
}

pub async fn users_by_role(pool: &DbPool, role: Role) -> Result<Vec<User>> {
    let rows = sqlx::query(
        "SELECT id, full_name, email, phone, role FROM users WHERE role = ? ORDER BY full_name",
    )
    .bind(role.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(user_from_row).collect()
}

/// Attendance entries for one student with `entry_date` in `[from, to]`.
pub async fn attendance_in_window(
    pool: &DbPool,
    student_id: Uuid,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<AttendanceEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT id, student_id, subject, entry_date, status
        FROM attendance_entries
        WHERE student_id = ? AND entry_date >= ? AND entry_date <= ?
        ORDER BY entry_date
        "#,
    )
    .bind(student_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        entries.push(AttendanceEntry {
            id: row.get("id"),
            student_id: row.get("student_id"),
            subject: row.get("subject"),
            entry_date: row.get("entry_date"),
            status: AttendanceStatus::from_str(row.get("status"))?,
        });
    }
    Ok(entries)
}

/// All completed attempts for a student, across every test.
pub async fn completed_attempts(pool: &DbPool, student_id: Uuid) -> Result<Vec<TestAttempt>> {
    let rows = sqlx::query(
        r#"
        SELECT id, test_id, student_id, percentage, completed_at
        FROM test_attempts
        WHERE student_id = ? AND status = 'completed'
        "#,
    )
    .bind(student_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| TestAttempt {
            id: row.get("id"),
            test_id: row.get("test_id"),
            student_id: row.get("student_id"),
            percentage: row.get("percentage"),
            completed_at: row.get("completed_at"),
        })
        .collect())
}

/// Tests with `test_date` in `(after, until]`.
pub async fn tests_between(
    pool: &DbPool,
    after: NaiveDate,
    until: NaiveDate,
) -> Result<Vec<TestRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, course_id, title, test_date, total_marks
        FROM tests
        WHERE test_date > ? AND test_date <= ?
        ORDER BY test_date
        "#,
    )
    .bind(after)
    .bind(until)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| TestRecord {
            id: row.get("id"),
            course_id: row.get("course_id"),
            title: row.get("title"),
            test_date: row.get("test_date"),
            total_marks: row.get("total_marks"),
        })
        .collect())
}

/// Students actively enrolled in a course.
pub async fn active_enrollees(pool: &DbPool, course_id: &str) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        "SELECT student_id FROM enrollments WHERE course_id = ? AND active = 1",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|row| row.get("student_id")).collect())
}
