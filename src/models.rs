use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            "admin" => Ok(Role::Admin),
            other => Err(Error::validation(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            "late" => Ok(AttendanceStatus::Late),
            other => Err(Error::validation(format!(
                "unknown attendance status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttendanceEntry {
    pub id: Uuid,
    pub student_id: Uuid,
    pub subject: String,
    pub entry_date: NaiveDate,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone)]
pub struct TestRecord {
    pub id: Uuid,
    pub course_id: String,
    pub title: String,
    pub test_date: NaiveDate,
    pub total_marks: i64,
}

#[derive(Debug, Clone)]
pub struct TestAttempt {
    pub id: Uuid,
    pub test_id: Uuid,
    pub student_id: Uuid,
    pub percentage: f64,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Risk classification, ordered by severity so listings can sort on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskLevel {
    None,
    AtRisk,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::None => "none",
            RiskLevel::AtRisk => "at-risk",
            RiskLevel::Critical => "critical",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "none" => Ok(RiskLevel::None),
            "at-risk" => Ok(RiskLevel::AtRisk),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(Error::validation(format!("unknown risk level: {other}"))),
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FactorKind {
    Attendance,
    Test,
}

/// Human-readable justification attached to a risk level at computation time.
/// The factor list is rebuilt from scratch on every recomputation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub kind: FactorKind,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct RiskProfile {
    pub id: Uuid,
    pub student_id: Uuid,
    pub risk_level: RiskLevel,
    pub attendance_percentage: i64,
    pub test_average: i64,
    pub factors: Vec<RiskFactor>,
    pub last_calculated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RiskNote {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub text: String,
    pub added_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RiskIncident {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub incident_type: String,
    pub description: String,
    pub severity: String,
    pub incident_date: NaiveDate,
    pub reported_by: String,
}

/// Outcome of a full risk sweep across every student.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskSweep {
    pub at_risk: usize,
    pub critical: usize,
    pub total: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Attendance,
    Test,
    Fee,
    Registration,
    Alert,
    Course,
    Assignment,
    Certificate,
    General,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Attendance => "attendance",
            NotificationKind::Test => "test",
            NotificationKind::Fee => "fee",
            NotificationKind::Registration => "registration",
            NotificationKind::Alert => "alert",
            NotificationKind::Course => "course",
            NotificationKind::Assignment => "assignment",
            NotificationKind::Certificate => "certificate",
            NotificationKind::General => "general",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "attendance" => Ok(NotificationKind::Attendance),
            "test" => Ok(NotificationKind::Test),
            "fee" => Ok(NotificationKind::Fee),
            "registration" => Ok(NotificationKind::Registration),
            "alert" => Ok(NotificationKind::Alert),
            "course" => Ok(NotificationKind::Course),
            "assignment" => Ok(NotificationKind::Assignment),
            "certificate" => Ok(NotificationKind::Certificate),
            "general" => Ok(NotificationKind::General),
            other => Err(Error::validation(format!(
                "unknown notification kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(Error::validation(format!("unknown priority: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    InApp,
    Email,
    Sms,
    Push,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::InApp => "in-app",
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub channels: Vec<Channel>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Payload for creating a notification; the store fills in id, read state and
/// timestamps.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub channels: Vec<Channel>,
    pub metadata: Metadata,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewNotification {
    pub fn new(
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            priority: Priority::Medium,
            channels: vec![Channel::InApp],
            metadata: Metadata::new(),
            scheduled_for: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = channels;
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn scheduled_for(mut self, when: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(when);
        self
    }
}
