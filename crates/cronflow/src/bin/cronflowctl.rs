use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use cronflow::config::Config;
use cronflow::db;
use cronflow::jobs::cron::{parse_timezone, CronSchedule};
use cronflow::jobs::{JobsRepo, MaintenanceRepo, Page, RunEventsRepo, RunsRepo};

/// Operator tool for a cronflow database.
#[derive(Parser)]
#[command(name = "cronflowctl", version)]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Preview the next fire times of a cron expression.
    Next {
        expression: String,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
        /// Start point (RFC 3339); defaults to now.
        #[arg(long)]
        after: Option<DateTime<Utc>>,
    },
    /// List jobs, newest first.
    Jobs {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// List runs, newest first.
    Runs {
        #[arg(long)]
        job: Option<Uuid>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show the event log of one run.
    Events { run_id: Uuid },
    /// Run one retention sweep with the configured limits.
    Prune,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Next {
        expression,
        timezone,
        count,
        after,
    } = &cli.command
    {
        return print_next(expression, timezone, *count, after.unwrap_or_else(Utc::now));
    }

    let cfg = Config::from_env()?;
    let url = cli.database_url.unwrap_or(cfg.database_url.clone());
    let pool = db::make_pool(&url, &cfg.pool()).await?;
    db::run_migrations(&pool).await?;

    match cli.command {
        Command::Next { .. } => {}
        Command::Jobs { limit } => {
            let page = JobsRepo::new(pool.clone())
                .list(Page::jobs(None, Some(limit)))
                .await?;
            println!("{} job(s)", page.total);
            for job in page.items {
                println!(
                    "{}  {:<24} {:<8} {:<7} enabled={} next={}",
                    job.id,
                    job.name,
                    job.runner_type(),
                    job.trigger_type(),
                    job.enabled,
                    fmt_time(job.next_run_at),
                );
            }
        }
        Command::Runs { job, limit } => {
            let page = RunsRepo::new(pool.clone())
                .list(job, Page::jobs(None, Some(limit)))
                .await?;
            println!("{} run(s)", page.total);
            for run in page.items {
                println!(
                    "{}  job={} attempt={} {:<16} trigger={:<8} scheduled={} finished={}{}",
                    run.id,
                    run.job_id,
                    run.attempt,
                    run.status,
                    run.trigger,
                    run.scheduled_for.to_rfc3339(),
                    fmt_time(run.finished_at),
                    run.error.map(|e| format!(" error={e}")).unwrap_or_default(),
                );
            }
        }
        Command::Events { run_id } => {
            let page = RunEventsRepo::new(pool.clone())
                .list_for_run(run_id, Page::events(None, None))
                .await?;
            if page.total == 0 {
                println!("no events for run {run_id}");
            }
            for ev in page.items {
                println!(
                    "{}  {:<16} {}  {}",
                    ev.created_at.to_rfc3339(),
                    ev.event_type,
                    ev.message,
                    ev.data
                );
            }
        }
        Command::Prune => {
            let report = MaintenanceRepo::new(pool.clone())
                .prune(&cfg.retention, Utc::now())
                .await?;
            println!(
                "pruned runs_expired={} runs_over_cap={} events_expired={}",
                report.runs_expired, report.runs_over_cap, report.events_expired
            );
        }
    }

    pool.close().await;
    Ok(())
}

fn print_next(
    expression: &str,
    timezone: &str,
    count: usize,
    after: DateTime<Utc>,
) -> anyhow::Result<()> {
    let schedule = CronSchedule::parse(expression)?;
    let tz = parse_timezone(timezone)?;

    let mut t = after;
    for _ in 0..count {
        t = schedule.next_after(&tz, t)?;
        println!("{}  ({})", t.to_rfc3339(), t.with_timezone(&tz).to_rfc3339());
    }
    Ok(())
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}
