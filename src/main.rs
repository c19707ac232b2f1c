use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::mpsc;

use feedstash::config::Config;
use feedstash::engine::Engine;
use feedstash::storage::FeedKind;
use feedstash::sync::SyncEvent;

/// Get the config directory path (~/.config/feedstash/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedstash"))
}

#[derive(Parser, Debug)]
#[command(
    name = "feedstash",
    version,
    about = "Offline feed cache for rate-limited listing APIs"
)]
struct Args {
    /// Config file (default: ~/.config/feedstash/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// State file (default: ~/.config/feedstash/state.json)
    #[arg(long, value_name = "FILE", global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch every subscription plus the popular listing
    Sync {
        /// Apply staged items once the pass finishes
        #[arg(long)]
        apply: bool,
    },
    /// Promote staged items into the visible feed
    Apply {
        /// subscribed or global (default: both)
        feed: Option<FeedKind>,
    },
    /// Show feeds, queue, rate limit and storage usage
    Status,
    /// List applied items, newest first
    List {
        #[arg(default_value = "subscribed")]
        feed: FeedKind,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Follow one or more sources
    Subscribe {
        #[arg(required = true)]
        sources: Vec<String>,
    },
    /// Stop following one or more sources
    Unsubscribe {
        #[arg(required = true)]
        sources: Vec<String>,
    },
    /// Keep an item regardless of eviction
    Pin { id: String },
    Unpin { id: String },
    /// Hide a source or an author everywhere
    Block {
        #[arg(long, conflicts_with = "author", required_unless_present = "author")]
        source: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },
    /// Write subscriptions, block-lists and pinned items to a file
    Export { file: PathBuf },
    /// Merge a previously exported file into the library
    Import { file: PathBuf },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let state_path = args
        .state
        .clone()
        .unwrap_or_else(|| config_dir.join("state.json"));

    if let Some(parent) = state_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
            restrict_permissions(parent);
        }
    }

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let (event_tx, mut event_rx) = mpsc::channel::<SyncEvent>(64);
    let engine = Engine::open_default(config, &state_path)
        .await?
        .with_events(event_tx);

    let outcome = run_command(&engine, args.command).await;

    while let Ok(event) = event_rx.try_recv() {
        print_event(&event);
    }

    // Save even when the command failed; state may have changed before the error.
    engine.shutdown().await?;
    outcome
}

async fn run_command(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Sync { apply } => {
            let report = engine.sync().await;
            if report.skipped {
                println!("A sync pass is already running.");
                return Ok(());
            }
            let staged: usize = report.staged.values().sum();
            println!(
                "Sync finished: {} job(s) completed, {} staged item(s), {} permanent failure(s)",
                report.completed,
                staged,
                report.failed_permanently.len()
            );
            if apply {
                let promoted = engine.apply(None).await;
                println!("Applied {promoted} item(s).");
            }
        }
        Command::Apply { feed } => {
            let promoted = engine.apply(feed).await;
            println!("Applied {promoted} item(s).");
        }
        Command::Status => print_status(engine).await?,
        Command::List { feed, limit } => {
            let items = engine.items(feed, limit).await;
            if items.is_empty() {
                println!("No items in the {feed} feed. Run `feedstash sync` first.");
            }
            for item in items {
                let created = chrono::DateTime::from_timestamp(item.created_at, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{:<12} {}  r/{:<16} {:>6}  {}",
                    item.id, created, item.source_key, item.score, item.title
                );
            }
        }
        Command::Subscribe { sources } => {
            for source in sources {
                if engine.subscribe(&source).await? {
                    println!("Subscribed to {source}");
                } else {
                    println!("Already subscribed to {source}");
                }
            }
        }
        Command::Unsubscribe { sources } => {
            for source in sources {
                if engine.unsubscribe(&source).await {
                    println!("Unsubscribed from {source}");
                } else {
                    println!("Not subscribed to {source}");
                }
            }
        }
        Command::Pin { id } => {
            if engine.pin(&id).await? {
                println!("Pinned {id}");
            } else {
                println!("{id} is already pinned");
            }
        }
        Command::Unpin { id } => {
            if engine.unpin(&id).await {
                println!("Unpinned {id}");
            } else {
                println!("{id} was not pinned");
            }
        }
        Command::Block { source, author } => {
            let removed = match (source, author) {
                (Some(source), _) => engine.block_source(&source).await?,
                (None, Some(author)) => engine.block_author(&author).await,
                (None, None) => anyhow::bail!("Specify --source or --author"),
            };
            println!("Blocked; {removed} item(s) removed.");
        }
        Command::Export { file } => {
            let doc = engine.export(&file).await?;
            println!(
                "Exported {} subscription(s) and {} pinned item(s) to {}",
                doc.subscriptions.len(),
                doc.pinned.len(),
                file.display()
            );
        }
        Command::Import { file } => {
            let summary = engine.import(&file).await?;
            println!(
                "Imported {} subscription(s), {} blocked source(s), {} blocked author(s), {} pinned item(s)",
                summary.subscriptions,
                summary.blocked_sources,
                summary.blocked_authors,
                summary.pinned
            );
        }
    }
    Ok(())
}

async fn print_status(engine: &Engine) -> Result<()> {
    let status = engine.status().await?;
    println!("State file: {}", status.state_path.display());
    println!(
        "Storage:    {} / {} bytes ({:.1}%)",
        status.quota.occupied_bytes,
        status.quota.quota_bytes,
        status.quota.ratio() * 100.0
    );
    for (kind, feed) in &status.feeds {
        println!(
            "Feed {:<10} {} applied, {} staged",
            kind.as_str(),
            feed.applied,
            feed.staged
        );
    }
    println!(
        "Library:    {} subscription(s), {} pinned, {} blocked source(s), {} blocked author(s)",
        status.subscriptions.len(),
        status.pinned,
        status.blocked_sources,
        status.blocked_authors
    );
    println!(
        "Rate limit: {} remaining, {} request(s) made",
        status.rate_limit.remaining, status.rate_limit.request_count
    );
    if status.jobs.is_empty() {
        println!("Queue:      empty");
    } else {
        println!("Queue:");
        for job in &status.jobs {
            println!(
                "  #{:<5} {:<10} {:?} (attempts: {})",
                job.id,
                job.target(),
                job.status,
                job.retries
            );
        }
    }
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::NewItems { feed, staged } => {
            println!("{staged} new item(s) in the {feed} feed. Run `feedstash apply` to show them.");
        }
        SyncEvent::InitialPopulationApplied { feed, applied } => {
            println!("Populated the {feed} feed with {applied} item(s).");
        }
        SyncEvent::JobFailedPermanently { job, last_error } => {
            eprintln!(
                "Warning: fetching {} failed permanently: {}",
                job.target(),
                last_error.as_deref().unwrap_or("too many retries")
            );
        }
        SyncEvent::SaveFailed { error } => {
            eprintln!("Warning: could not save state: {error}");
        }
    }
}

/// User-only access to the state directory.
fn restrict_permissions(dir: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "Failed to set state directory permissions to 0700"
            );
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}
