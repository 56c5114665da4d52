use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use campus_sentinel::db;
use campus_sentinel::directory;
use campus_sentinel::dispatch::Dispatcher;
use campus_sentinel::models::{RiskIncident, RiskLevel};
use campus_sentinel::notify::{ListFilter, Notifier};
use campus_sentinel::reminders;
use campus_sentinel::report;
use campus_sentinel::risk;
use campus_sentinel::scheduler::{Context, Scheduler};

#[derive(Parser)]
#[command(name = "campus-sentinel")]
#[command(about = "Risk assessment and notification engine for the campus platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum RemindTarget {
    Attendance,
    Tests,
    Fees,
    Teachers,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import attendance entries from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run the job scheduler until interrupted
    Run,
    /// Recompute risk profiles for every student
    Sweep,
    /// Show a student's risk profile, computing it on first access
    Profile {
        #[arg(long)]
        email: String,
    },
    /// Append a staff note to a student's risk profile
    Note {
        #[arg(long)]
        email: String,
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "staff")]
        added_by: String,
    },
    /// Record an incident against a student's risk profile
    Incident {
        #[arg(long)]
        email: String,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "medium")]
        severity: String,
        #[arg(long, default_value = "staff")]
        reported_by: String,
    },
    /// Deliver all scheduled notifications that have come due
    Flush,
    /// Run one reminder rule evaluator
    Remind {
        #[arg(value_enum)]
        target: RemindTarget,
    },
    /// List a user's notifications
    Inbox {
        #[arg(long)]
        email: String,
        #[arg(long)]
        unread: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark one notification as read
    Read {
        #[arg(long)]
        id: Uuid,
    },
    /// Generate a markdown risk report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://campus_sentinel.db".to_string());

    let pool = db::connect(&database_url).await?;
    let dispatcher = Arc::new(Dispatcher::new(pool.clone()));
    let notifier = Notifier::new(pool.clone(), dispatcher);

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_attendance_csv(&pool, &csv).await?;
            println!("Inserted {inserted} attendance entries from {}.", csv.display());
        }
        Commands::Run => {
            let scheduler = Scheduler::new(Context {
                pool: pool.clone(),
                notifier,
            });
            let cancel = scheduler.cancellation_token();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for Ctrl-C");
                }
                cancel.cancel();
            });
            println!("Scheduler running; press Ctrl-C to stop.");

            scheduler.run_until_cancelled().await;
            println!("Scheduler stopped.");
        }
        Commands::Sweep => {
            let sweep = risk::compute_all_risks(&pool).await?;
            println!(
                "Swept {} students: {} at-risk, {} critical, {} failed.",
                sweep.total, sweep.at_risk, sweep.critical, sweep.failed
            );
        }
        Commands::Profile { email } => {
            let user = directory::user_by_email(&pool, &email).await?;
            let profile = risk::profile_for(&pool, user.id).await?;
            println!(
                "{} ({}) level {} attendance {}% test average {}%",
                user.full_name,
                user.email,
                profile.risk_level,
                profile.attendance_percentage,
                profile.test_average
            );
            for factor in &profile.factors {
                println!("- {}", factor.description);
            }
            for note in risk::notes_for_profile(&pool, profile.id).await? {
                println!("note ({}): {}", note.added_by, note.text);
            }
            for incident in risk::incidents_for_profile(&pool, profile.id).await? {
                println!(
                    "incident {} ({}, {}): {}",
                    incident.incident_type, incident.severity, incident.incident_date,
                    incident.description
                );
            }
        }
        Commands::Note {
            email,
            text,
            added_by,
        } => {
            let user = directory::user_by_email(&pool, &email).await?;
            risk::add_note(&pool, user.id, &text, &added_by).await?;
            println!("Note added.");
        }
        Commands::Incident {
            email,
            kind,
            description,
            severity,
            reported_by,
        } => {
            let user = directory::user_by_email(&pool, &email).await?;
            let profile = risk::profile_for(&pool, user.id).await?;
            risk::add_incident(
                &pool,
                RiskIncident {
                    id: Uuid::new_v4(),
                    profile_id: profile.id,
                    incident_type: kind,
                    description,
                    severity,
                    incident_date: Utc::now().date_naive(),
                    reported_by,
                },
            )
            .await?;
            println!("Incident recorded.");
        }
        Commands::Flush => {
            let delivered = notifier.flush_due().await?;
            println!("Delivered {delivered} scheduled notifications.");
        }
        Commands::Remind { target } => {
            let count = match target {
                RemindTarget::Attendance => reminders::low_attendance(&pool, &notifier).await?,
                RemindTarget::Tests => reminders::upcoming_tests(&pool, &notifier).await?,
                RemindTarget::Fees => reminders::fee_reminder(&pool, &notifier).await?,
                RemindTarget::Teachers => reminders::teacher_alerts(&pool, &notifier).await?,
            };
            println!("Reminded {count} recipients.");
        }
        Commands::Inbox {
            email,
            unread,
            limit,
        } => {
            let user = directory::user_by_email(&pool, &email).await?;
            let filter = ListFilter {
                kind: None,
                unread_only: unread,
                limit: Some(limit),
            };
            let notifications = notifier.list_for_user(user.id, &filter).await?;
            if notifications.is_empty() {
                println!("No notifications.");
            }
            for n in notifications {
                let state = if n.read { "read" } else { "unread" };
                println!("[{}] {} ({}, {}): {}", n.id, n.title, n.kind.as_str(), state, n.message);
            }
        }
        Commands::Read { id } => match notifier.mark_read(id).await? {
            Some(n) => println!("Marked read: {}", n.title),
            None => println!("No such notification."),
        },
        Commands::Report { out } => {
            let summaries =
                risk::list_profiles(&pool, RiskLevel::None, risk::ProfileSort::Severity).await?;
            let report = report::build_report(&summaries);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
