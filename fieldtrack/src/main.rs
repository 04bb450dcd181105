//! fieldtrack - operator CLI for the local GPS sample store
//!
//! This tool provides commands for:
//! - Checking configuration, store counts and service reachability
//! - Listing samples that have not reached the attendance service yet
//! - Flushing unsynced samples on demand
//! - Printing a thinned route and its statistics for one agent and day
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/fieldtrack/samples.db (~/.local/share/fieldtrack/samples.db)
//! - Config: $XDG_CONFIG_HOME/fieldtrack/config.toml (~/.config/fieldtrack/config.toml)

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use fieldtrack_core::display::{self, RouteSummary};
use fieldtrack_core::{Config, HttpRemote, LocalStore, SyncEngine};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "fieldtrack")]
#[command(about = "Inspect and sync locally recorded GPS samples")]
#[command(version)]
struct Args {
    /// Verbose output (also writes the log file)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, store counts and service status
    Status,

    /// List unsynced samples, oldest first
    Pending {
        /// Maximum number of samples to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Push every unsynced sample to the attendance service now
    Flush,

    /// Show one agent's route for a day
    Route {
        /// Agent (employee) id
        #[arg(long)]
        agent: String,

        /// Day to show, YYYY-MM-DD (UTC)
        #[arg(long)]
        date: NaiveDate,

        /// Grouping distance in meters for thinning (default: from config)
        #[arg(long)]
        proximity: Option<f64>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging if verbose
    let _log_guard = if args.verbose {
        Some(fieldtrack_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    tracing::info!("fieldtrack starting");

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Pending { limit } => cmd_pending(limit),
        Command::Flush => cmd_flush(&config),
        Command::Route {
            agent,
            date,
            proximity,
            json,
        } => cmd_route(&config, &agent, date, proximity, json),
    }
}

/// Open the store if it exists; `None` means nothing was ever recorded.
fn open_store() -> Result<Option<LocalStore>> {
    let db_path = Config::database_path();
    if !db_path.exists() {
        println!("Database not found at {}", db_path.display());
        return Ok(None);
    }

    tracing::info!(path = %db_path.display(), "Opening database");
    let store = LocalStore::open(&db_path).context("failed to open database")?;
    Ok(Some(store))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Fieldtrack Configuration");
    println!("========================");
    println!();

    let tracking = &config.tracking;
    println!("Sample Interval: {}s", tracking.sample_interval_secs);
    println!("Max Accuracy:    {} m", tracking.max_accuracy_m);
    println!("Min Distance:    {} m", tracking.min_distance_m);
    println!("Min Dwell:       {}s", tracking.min_dwell_secs);
    println!(
        "Cluster:         {} samples within {} m over {}s",
        tracking.cluster_cap, tracking.cluster_radius_m, tracking.cluster_window_secs
    );
    println!("Sync Interval:   {}s", config.sync.interval_secs);
    println!();

    let remote = &config.remote;
    println!("Remote Enabled:  {}", remote.enabled);
    println!(
        "Server URL:      {}",
        remote.server_url.as_deref().unwrap_or("<not set>")
    );
    println!(
        "API Key:         {}",
        if remote.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!();

    println!("Database:        {}", Config::database_path().display());
    if let Some(store) = open_store()? {
        let stats = store.stats().context("failed to read store counts")?;
        println!("Samples:         {}", stats.total_samples);
        println!("Unsynced:        {}", stats.unsynced);
        if stats.abandoned > 0 {
            println!("Abandoned:       {}", stats.abandoned);
        }
        println!("Sessions:        {}", stats.sessions);

        if let Some((session, stopped_at)) = store.latest_session()? {
            let state = match stopped_at {
                Some(at) => format!("stopped {}", at.format("%Y-%m-%d %H:%M:%S")),
                None => "open".to_string(),
            };
            println!(
                "Last Session:    {} (agent {}, started {}, {})",
                short_id(&session.session_id),
                session.agent_id,
                session.started_at.format("%Y-%m-%d %H:%M:%S"),
                state
            );
        }
    }

    println!();
    if remote.is_ready() {
        let client = HttpRemote::new(remote).context("failed to create HTTP client")?;
        let reachable = runtime()?.block_on(client.health_check()).unwrap_or(false);
        if reachable {
            println!("Status: Service reachable");
        } else {
            println!("Status: Service unreachable ({})", client.base_url());
        }
    } else {
        println!("Status: Remote sync not configured");
    }

    Ok(())
}

fn cmd_pending(limit: usize) -> Result<()> {
    let Some(store) = open_store()? else {
        return Ok(());
    };

    let total = store.count_unsynced()?;
    if total == 0 {
        println!("No unsynced samples.");
        return Ok(());
    }

    println!(
        "{:<24} {:<19} {:>11} {:>11} {:>5}  Last Error",
        "Captured At", "Kind", "Latitude", "Longitude", "Rej"
    );
    println!("{:-<90}", "");

    for record in store
        .unsynced_since(DateTime::<Utc>::UNIX_EPOCH, limit.max(1))
        .take(limit)
    {
        let record = record.context("failed to read unsynced samples")?;
        let sample = &record.sample;
        println!(
            "{:<24} {:<19} {:>11.6} {:>11.6} {:>5}  {}",
            sample.captured_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            sample.kind.as_str(),
            sample.latitude,
            sample.longitude,
            record.sync_rejections,
            record.last_sync_error.as_deref().unwrap_or("")
        );
    }

    if total > limit as i64 {
        println!();
        println!("... {} more (use --limit to show more)", total - limit as i64);
    }

    Ok(())
}

fn cmd_flush(config: &Config) -> Result<()> {
    if !config.remote.is_ready() {
        println!("Remote sync is not configured. Run 'status' for details.");
        return Ok(());
    }

    let Some(store) = open_store()? else {
        return Ok(());
    };

    let pending = store.count_unsynced()?;
    if pending == 0 {
        println!("No unsynced samples to flush.");
        return Ok(());
    }

    println!("Flushing {} unsynced sample(s)...", pending);

    let remote = HttpRemote::new(&config.remote).context("failed to create HTTP client")?;
    let engine = SyncEngine::new(Arc::new(store), remote, config.sync.clone());
    let report = runtime()?
        .block_on(engine.flush(DateTime::<Utc>::UNIX_EPOCH))
        .context("flush failed")?;
    tracing::info!(
        accepted = report.accepted,
        rejected = report.rejected,
        transport_failures = report.transport_failures,
        "On-demand flush finished"
    );

    println!();
    println!("Flush complete:");
    println!("  Accepted:            {}", report.accepted);
    println!("  Duplicates:          {}", report.duplicates);
    println!("  Rejected:            {}", report.rejected);
    println!("  Transport failures:  {}", report.transport_failures);
    if report.abandoned > 0 {
        println!("  Abandoned:           {}", report.abandoned);
    }
    println!("  Still unsynced:      {}", engine.pending_count()?);

    Ok(())
}

fn cmd_route(
    config: &Config,
    agent: &str,
    date: NaiveDate,
    proximity: Option<f64>,
    json: bool,
) -> Result<()> {
    let Some(store) = open_store()? else {
        return Ok(());
    };

    let from = date
        .and_hms_opt(0, 0, 0)
        .context("invalid date")?
        .and_utc();
    let to = from + chrono::Duration::days(1);

    let points = store
        .scan_range(agent, from, to)
        .context("failed to read samples")?;
    let proximity = match proximity {
        Some(meters) => {
            let display = fieldtrack_core::config::DisplayConfig { proximity_m: meters };
            display.validate().context("invalid --proximity")?;
            meters
        }
        None => config.display.proximity_m,
    };
    let thinned = display::thin(&points, proximity);
    let summary = RouteSummary::compute(&points);

    if json {
        let out = serde_json::json!({
            "agent_id": agent,
            "date": date.to_string(),
            "summary": summary,
            "points": thinned,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if points.is_empty() {
        println!("No samples for agent {} on {}.", agent, date);
        return Ok(());
    }

    println!("Route for agent {} on {}", agent, date);
    println!("================================");
    println!();
    println!("Samples:         {}", summary.point_count);
    println!("Distance:        {:.2} km", summary.distance_km);
    match summary.duration_secs {
        Some(secs) => println!("Duration:        {}", format_hms(secs)),
        None => println!("Duration:        <no check-in/check-out>"),
    }
    if let Some(speed) = summary.average_speed_kmh {
        println!("Average Speed:   {:.2} km/h", speed);
    }
    println!("Travel Time:     {}", format_hms(summary.travel_time_secs));
    println!("Work Hours:      {:.2}", summary.work_hours);
    println!("Rest Hours:      {:.2}", summary.rest_hours);
    println!("Segments:        {}", summary.segment_count);
    println!();

    println!(
        "Points ({} of {} after thinning at {} m):",
        thinned.len(),
        points.len(),
        proximity
    );
    for point in &thinned {
        let comment = point
            .comment
            .as_deref()
            .map(|c| format!("  \"{}\"", c))
            .unwrap_or_default();
        println!(
            "  {}  {:<19} {:>11.6} {:>11.6}{}",
            point.captured_at.format("%H:%M:%S"),
            point.kind.as_str(),
            point.latitude,
            point.longitude,
            comment
        );
    }

    Ok(())
}

fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}

fn format_hms(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
