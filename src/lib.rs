//! Recurring risk-assessment and notification-delivery engine for an
//! education platform: a risk classification sweep over attendance and test
//! ledgers, threshold-based reminder rules, multi-channel notification
//! delivery with scheduled flushing, and the cron orchestrator that ties the
//! jobs together.

pub mod db;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod notify;
pub mod reminders;
pub mod report;
pub mod risk;
pub mod scheduler;

pub use error::{Error, Result};
