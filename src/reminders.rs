//! Reminder rule evaluators.
//!
//! Four stateless checks that read the ledgers and risk profiles and emit
//! notifications. None of them mutate profile or ledger state; each returns
//! the number of recipients addressed so job runs can be logged meaningfully.

use chrono::{Duration, Utc};
use tracing::warn;

use crate::db::DbPool;
use crate::directory;
use crate::error::Result;
use crate::models::{Channel, NewNotification, NotificationKind, Priority, Role};
use crate::notify::Notifier;
use crate::risk;

/// Students below this attendance percentage get a direct reminder.
pub const LOW_ATTENDANCE_THRESHOLD: i64 = 75;

/// Tests this many days out (exclusive of tomorrow itself) trigger reminders.
const UPCOMING_TEST_HORIZON_DAYS: i64 = 3;

/// One high-priority reminder per student whose recorded attendance sits
/// below the threshold.
pub async fn low_attendance(pool: &DbPool, notifier: &Notifier) -> Result<usize> {
    let profiles = risk::profiles_below_attendance(pool, LOW_ATTENDANCE_THRESHOLD).await?;

    let mut notified = 0usize;
    for summary in profiles {
        let pct = summary.profile.attendance_percentage;
        let new = NewNotification::new(
            NotificationKind::Attendance,
            "Low attendance warning",
            format!(
                "Your attendance is at {pct}% over the last {} days. \
                 Please attend your upcoming classes.",
                risk::ATTENDANCE_WINDOW_DAYS
            ),
        )
        .priority(Priority::High)
        .channels(vec![Channel::InApp, Channel::Email])
        .meta("attendancePercentage", pct);

        match notifier.send(summary.profile.student_id, new).await {
            Ok(_) => notified += 1,
            Err(e) => {
                warn!(
                    student = %summary.profile.student_id,
                    error = %e,
                    "low-attendance reminder failed, skipping student"
                );
            }
        }
    }
    Ok(notified)
}

/// Remind active enrollees about tests coming up in `(tomorrow, tomorrow+3]`.
pub async fn upcoming_tests(pool: &DbPool, notifier: &Notifier) -> Result<usize> {
    let today = Utc::now().date_naive();
    let tomorrow = today + Duration::days(1);
    let horizon = tomorrow + Duration::days(UPCOMING_TEST_HORIZON_DAYS);

    let tests = directory::tests_between(pool, tomorrow, horizon).await?;

    let mut notified = 0usize;
    for test in tests {
        let enrollees = directory::active_enrollees(pool, &test.course_id).await?;
        if enrollees.is_empty() {
            continue;
        }

        let days_until = (test.test_date - today).num_days();
        let new = NewNotification::new(
            NotificationKind::Test,
            format!("Upcoming test: {}", test.title),
            format!(
                "{} is scheduled in {days_until} days ({} marks total).",
                test.title, test.total_marks
            ),
        )
        .meta("testId", test.id.to_string())
        .meta("daysUntil", days_until)
        .meta("totalMarks", test.total_marks);

        let sent = notifier.send_bulk(&enrollees, new).await?;
        notified += sent.len();
    }
    Ok(notified)
}

/// Unconditional monthly payment reminder to every student.
pub async fn fee_reminder(pool: &DbPool, notifier: &Notifier) -> Result<usize> {
    let students = directory::users_by_role(pool, Role::Student).await?;
    let ids: Vec<_> = students.iter().map(|s| s.id).collect();

    let new = NewNotification::new(
        NotificationKind::Fee,
        "Monthly fee reminder",
        "Your monthly fee is due. Please complete the payment to keep your enrollment active.",
    )
    .channels(vec![Channel::InApp, Channel::Email, Channel::Sms]);

    let sent = notifier.send_bulk(&ids, new).await?;
    Ok(sent.len())
}

/// One aggregate alert to every teacher when any students sit at critical
/// risk. Teachers get the count, not one notification per student.
pub async fn teacher_alerts(pool: &DbPool, notifier: &Notifier) -> Result<usize> {
    let critical = risk::count_critical(pool).await?;
    if critical == 0 {
        return Ok(0);
    }

    let teachers = directory::users_by_role(pool, Role::Teacher).await?;
    let ids: Vec<_> = teachers.iter().map(|t| t.id).collect();

    let new = NewNotification::new(
        NotificationKind::Alert,
        "Students at critical risk",
        format!("{critical} student(s) are currently classified as critical risk. Please review their profiles."),
    )
    .priority(Priority::High)
    .meta("criticalCount", critical);

    let sent = notifier.send_bulk(&ids, new).await?;
    Ok(sent.len())
}
