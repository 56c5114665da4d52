//! Risk classification engine.
//!
//! Recomputes a behavioral/academic risk profile per student from a trailing
//! attendance window and the full set of completed test attempts. The rule
//! table is pure; persistence goes through a single upsert keyed on the
//! student so concurrent sweeps cannot create duplicate profiles.

use std::str::FromStr;

use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use sqlx::Row;
use tracing::{error, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::directory;
use crate::error::{Error, Result};
use crate::models::{
    AttendanceEntry, AttendanceStatus, FactorKind, RiskFactor, RiskIncident, RiskLevel, RiskNote,
    RiskProfile, RiskSweep, Role, TestAttempt,
};

pub const ATTENDANCE_WINDOW_DAYS: i64 = 30;

const ATTENDANCE_CRITICAL_BELOW: i64 = 40;
const ATTENDANCE_AT_RISK_BELOW: i64 = 60;
const TEST_CRITICAL_BELOW: i64 = 30;
const TEST_AT_RISK_BELOW: i64 = 50;

/// Concurrency bound for the per-student fan-out inside a full sweep.
const SWEEP_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub level: RiskLevel,
    pub factors: Vec<RiskFactor>,
}

/// Share of `present` entries, rounded to the nearest integer percentage.
/// An empty window means no data, not absence: it reports 100.
pub fn attendance_percentage(entries: &[AttendanceEntry]) -> i64 {
    if entries.is_empty() {
        return 100;
    }
    let present = entries
        .iter()
        .filter(|e| e.status == AttendanceStatus::Present)
        .count();
    ((present as f64 / entries.len() as f64) * 100.0).round() as i64
}

/// Mean completed-attempt percentage, rounded; 0 when there are no attempts.
pub fn test_average(attempts: &[TestAttempt]) -> i64 {
    if attempts.is_empty() {
        return 0;
    }
    let sum: f64 = attempts.iter().map(|a| a.percentage).sum();
    (sum / attempts.len() as f64).round() as i64
}

/// Apply the threshold rules in fixed precedence. Critical rules fire first
/// and both factor kinds can accumulate at the critical tier; the at-risk
/// rules only apply while the level is still unset. Test rules are skipped
/// entirely when the student has no completed attempts.
pub fn classify(attendance_pct: i64, test_avg: i64, has_attempts: bool) -> Classification {
    let mut level = RiskLevel::None;
    let mut factors = Vec::new();

    if attendance_pct < ATTENDANCE_CRITICAL_BELOW {
        level = RiskLevel::Critical;
        factors.push(RiskFactor {
            kind: FactorKind::Attendance,
            description: format!(
                "Very low attendance: {attendance_pct}% over the last {ATTENDANCE_WINDOW_DAYS} days"
            ),
        });
    }

    if has_attempts && test_avg < TEST_CRITICAL_BELOW {
        level = RiskLevel::Critical;
        factors.push(RiskFactor {
            kind: FactorKind::Test,
            description: format!("Very low test average: {test_avg}%"),
        });
    }

    if level == RiskLevel::None && attendance_pct < ATTENDANCE_AT_RISK_BELOW {
        level = RiskLevel::AtRisk;
        factors.push(RiskFactor {
            kind: FactorKind::Attendance,
            description: format!(
                "Low attendance: {attendance_pct}% over the last {ATTENDANCE_WINDOW_DAYS} days"
            ),
        });
    }

    if level == RiskLevel::None && has_attempts && test_avg < TEST_AT_RISK_BELOW {
        level = RiskLevel::AtRisk;
        factors.push(RiskFactor {
            kind: FactorKind::Test,
            description: format!("Low test average: {test_avg}%"),
        });
    }

    Classification { level, factors }
}

fn profile_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RiskProfile> {
    let factors: Vec<RiskFactor> = serde_json::from_str(row.get("factors"))?;
    Ok(RiskProfile {
        id: row.get("id"),
        student_id: row.get("student_id"),
        risk_level: RiskLevel::from_str(row.get("risk_level"))?,
        attendance_percentage: row.get("attendance_percentage"),
        test_average: row.get("test_average"),
        factors,
        last_calculated: row.get("last_calculated"),
    })
}

/// Recompute and persist the risk profile for one student.
///
/// The write is an atomic upsert on the student key; manual notes and
/// incidents hang off the profile id and are never touched here.
pub async fn compute_risk(pool: &DbPool, student_id: Uuid) -> Result<RiskProfile> {
    let user = directory::user_by_id(pool, student_id).await?;
    if user.role != Role::Student {
        return Err(Error::validation(format!(
            "user {student_id} is not a student"
        )));
    }

    let today = Utc::now().date_naive();
    let window_start = today - Duration::days(ATTENDANCE_WINDOW_DAYS);
    let entries = directory::attendance_in_window(pool, student_id, window_start, today).await?;
    let attempts = directory::completed_attempts(pool, student_id).await?;

    let attendance_pct = attendance_percentage(&entries);
    let test_avg = test_average(&attempts);
    let classification = classify(attendance_pct, test_avg, !attempts.is_empty());

    let factors_json = serde_json::to_string(&classification.factors)?;
    let row = sqlx::query(
        r#"
        INSERT INTO risk_profiles
            (id, student_id, risk_level, attendance_percentage, test_average, factors, last_calculated)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (student_id) DO UPDATE SET
            risk_level = excluded.risk_level,
            attendance_percentage = excluded.attendance_percentage,
            test_average = excluded.test_average,
            factors = excluded.factors,
            last_calculated = excluded.last_calculated
        RETURNING id, student_id, risk_level, attendance_percentage, test_average, factors, last_calculated
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(classification.level.as_str())
    .bind(attendance_pct)
    .bind(test_avg)
    .bind(&factors_json)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    profile_from_row(&row)
}

/// Recompute every student's profile. A failing student is logged and
/// counted, never fatal to the sweep.
pub async fn compute_all_risks(pool: &DbPool) -> Result<RiskSweep> {
    let students = directory::users_by_role(pool, Role::Student).await?;

    let outcomes: Vec<(Uuid, Result<RiskProfile>)> = stream::iter(students)
        .map(|student| {
            let pool = pool.clone();
            async move {
                let result = compute_risk(&pool, student.id).await;
                (student.id, result)
            }
        })
        .buffer_unordered(SWEEP_CONCURRENCY)
        .collect()
        .await;

    let mut sweep = RiskSweep::default();
    for (student_id, outcome) in outcomes {
        match outcome {
            Ok(profile) => {
                sweep.total += 1;
                match profile.risk_level {
                    RiskLevel::AtRisk => sweep.at_risk += 1,
                    RiskLevel::Critical => sweep.critical += 1,
                    RiskLevel::None => {}
                }
            }
            Err(e) if e.is_client_error() => {
                sweep.failed += 1;
                warn!(%student_id, error = %e, "risk computation skipped student");
            }
            Err(e) => {
                sweep.failed += 1;
                error!(%student_id, error = %e, "risk computation failed, skipping student");
            }
        }
    }

    Ok(sweep)
}

pub async fn profile_by_student(pool: &DbPool, student_id: Uuid) -> Result<Option<RiskProfile>> {
    let row = sqlx::query(
        r#"
        SELECT id, student_id, risk_level, attendance_percentage, test_average, factors, last_calculated
        FROM risk_profiles WHERE student_id = ?
        "#,
    )
    .bind(student_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(profile_from_row).transpose()
}

/// Fetch a student's profile, computing one on first access.
pub async fn profile_for(pool: &DbPool, student_id: Uuid) -> Result<RiskProfile> {
    match profile_by_student(pool, student_id).await? {
        Some(profile) => Ok(profile),
        None => compute_risk(pool, student_id).await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSort {
    Severity,
    Attendance,
    LastCalculated,
}

#[derive(Debug, Clone)]
pub struct ProfileSummary {
    pub profile: RiskProfile,
    pub student_name: String,
    pub student_email: String,
}

/// Profiles at `min_level` or worse, joined with the student identity.
pub async fn list_profiles(
    pool: &DbPool,
    min_level: RiskLevel,
    sort: ProfileSort,
) -> Result<Vec<ProfileSummary>> {
    let order = match sort {
        ProfileSort::Severity => {
            "CASE p.risk_level WHEN 'critical' THEN 0 WHEN 'at-risk' THEN 1 ELSE 2 END, p.attendance_percentage"
        }
        ProfileSort::Attendance => "p.attendance_percentage",
        ProfileSort::LastCalculated => "p.last_calculated DESC",
    };

    let levels: Vec<&str> = match min_level {
        RiskLevel::None => vec!["none", "at-risk", "critical"],
        RiskLevel::AtRisk => vec!["at-risk", "critical"],
        RiskLevel::Critical => vec!["critical"],
    };
    let placeholders = vec!["?"; levels.len()].join(", ");

    let query = format!(
        r#"
        SELECT p.id, p.student_id, p.risk_level, p.attendance_percentage,
               p.test_average, p.factors, p.last_calculated,
               u.full_name, u.email
        FROM risk_profiles p
        JOIN users u ON u.id = p.student_id
        WHERE p.risk_level IN ({placeholders})
        ORDER BY {order}
        "#
    );

    let mut rows = sqlx::query(&query);
    for level in levels {
        rows = rows.bind(level);
    }

    let records = rows.fetch_all(pool).await?;
    let mut summaries = Vec::with_capacity(records.len());
    for row in records {
        summaries.push(ProfileSummary {
            profile: profile_from_row(&row)?,
            student_name: row.get("full_name"),
            student_email: row.get("email"),
        });
    }
    Ok(summaries)
}

/// Profiles whose attendance is strictly below `threshold`, for the
/// low-attendance reminder rule.
pub async fn profiles_below_attendance(
    pool: &DbPool,
    threshold: i64,
) -> Result<Vec<ProfileSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT p.id, p.student_id, p.risk_level, p.attendance_percentage,
               p.test_average, p.factors, p.last_calculated,
               u.full_name, u.email
        FROM risk_profiles p
        JOIN users u ON u.id = p.student_id
        WHERE p.attendance_percentage < ?
        ORDER BY p.attendance_percentage
        "#,
    )
    .bind(threshold)
    .fetch_all(pool)
    .await?;

    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
        summaries.push(ProfileSummary {
            profile: profile_from_row(&row)?,
            student_name: row.get("full_name"),
            student_email: row.get("email"),
        });
    }
    Ok(summaries)
}

pub async fn count_critical(pool: &DbPool) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM risk_profiles WHERE risk_level = 'critical'")
        .fetch_one(pool)
        .await?;
    Ok(row.get("n"))
}

/// Append a staff note to a student's profile (created on first access).
pub async fn add_note(
    pool: &DbPool,
    student_id: Uuid,
    text: &str,
    added_by: &str,
) -> Result<RiskNote> {
    let profile = profile_for(pool, student_id).await?;
    let note = RiskNote {
        id: Uuid::new_v4(),
        profile_id: profile.id,
        text: text.to_string(),
        added_by: added_by.to_string(),
        created_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO risk_notes (id, profile_id, text, added_by, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(note.id)
    .bind(note.profile_id)
    .bind(&note.text)
    .bind(&note.added_by)
    .bind(note.created_at)
    .execute(pool)
    .await?;

    Ok(note)
}

/// Append a reported incident to a student's profile.
pub async fn add_incident(pool: &DbPool, incident: RiskIncident) -> Result<RiskIncident> {
    sqlx::query(
        r#"
        INSERT INTO risk_incidents
            (id, profile_id, incident_type, description, severity, incident_date, reported_by)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(incident.id)
    .bind(incident.profile_id)
    .bind(&incident.incident_type)
    .bind(&incident.description)
    .bind(&incident.severity)
    .bind(incident.incident_date)
    .bind(&incident.reported_by)
    .execute(pool)
    .await?;

    Ok(incident)
}

pub async fn notes_for_profile(pool: &DbPool, profile_id: Uuid) -> Result<Vec<RiskNote>> {
    let rows = sqlx::query(
        r#"
        SELECT id, profile_id, text, added_by, created_at
        FROM risk_notes WHERE profile_id = ? ORDER BY created_at
        "#,
    )
    .bind(profile_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| RiskNote {
            id: row.get("id"),
            profile_id: row.get("profile_id"),
            text: row.get("text"),
            added_by: row.get("added_by"),
            created_at: row.get("created_at"),
        })
        .collect())
}

pub async fn incidents_for_profile(pool: &DbPool, profile_id: Uuid) -> Result<Vec<RiskIncident>> {
    let rows = sqlx::query(
        r#"
        SELECT id, profile_id, incident_type, description, severity, incident_date, reported_by
        FROM risk_incidents WHERE profile_id = ? ORDER BY incident_date
        "#,
    )
    .bind(profile_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| RiskIncident {
            id: row.get("id"),
            profile_id: row.get("profile_id"),
            incident_type: row.get("incident_type"),
            description: row.get("description"),
            severity: row.get("severity"),
            incident_date: row.get("incident_date"),
            reported_by: row.get("reported_by"),
        })
        .collect())
}
