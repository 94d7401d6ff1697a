use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use relayfeed::config::Config;
use relayfeed::engine::{BatchReport, EngineSettings, FeedEngine};
use relayfeed::feed::{self, RelayChain};
use relayfeed::storage::{Feed, Item, JsonFileStore, ALL_CATEGORIES};
use relayfeed::util::{fit_width, format_relative, strip_control_chars, validate_link};

const TITLE_WIDTH: usize = 72;

/// Get the config directory path (~/.config/relayfeed/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("relayfeed"))
}

#[derive(Parser, Debug)]
#[command(
    name = "relayfeed",
    version,
    about = "RSS/Atom reader that fetches through fallback relays"
)]
struct Args {
    /// Config file (default: ~/.config/relayfeed/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a feed and fetch it once
    Add {
        url: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        category: String,
    },
    /// Remove a feed and its items
    Remove { id: String },
    /// List configured feeds
    Feeds,
    /// List categories
    Categories,
    /// Refresh every feed, or only stale ones
    Refresh {
        #[arg(long)]
        stale: bool,
    },
    /// Show the newest items
    List {
        #[arg(long, default_value = ALL_CATEGORIES)]
        category: String,
    },
    /// Mark an item read
    Read { id: String },
    /// Toggle an item's read flag
    Toggle { id: String },
    /// Mark every item read
    ReadAll,
    /// Open an item's link in the browser and mark it read
    Open { id: String },
    /// Import feeds from an OPML file
    Import { file: PathBuf },
    /// Export feeds to an OPML file
    Export { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
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
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let data_dir = config.data_dir.clone().unwrap_or(config_dir);
    let store = JsonFileStore::open(&data_dir)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;

    let client =
        feed::build_client(config.relay_timeout()).context("Failed to build HTTP client")?;
    let relays = RelayChain::from_config(&config.relays, &client, config.relay_timeout());
    if relays.is_empty() {
        eprintln!("Warning: no relays configured, every refresh will fail");
    }

    let engine = FeedEngine::open(
        relays,
        Arc::new(store),
        config.store_key.clone(),
        EngineSettings::from(&config),
    )
    .context("Failed to load reader state")?;

    run(&engine, &config, args.command).await
}

async fn run(engine: &FeedEngine, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Add {
            url,
            name,
            category,
        } => {
            let report = engine.add_feed(&url, &name, &category).await?;
            println!("Added {} [{}] ({})", report.feed.name, report.feed.category, report.feed.id);
            match report.initial_refresh {
                Ok(n) => println!("Fetched {n} item{}", if n == 1 { "" } else { "s" }),
                Err(e) => eprintln!("Feed added, but the first fetch failed: {e}"),
            }
        }
        Command::Remove { id } => match engine.delete_feed(&id).await {
            Some(feed) => println!("Removed {}", feed.name),
            None => anyhow::bail!("No feed with id {id}"),
        },
        Command::Feeds => {
            let now = Utc::now();
            for feed in engine.feeds().await {
                println!("{}", feed_line(&feed, now));
            }
        }
        Command::Categories => {
            for category in engine.feed_categories().await {
                println!("{category}");
            }
        }
        Command::Refresh { stale } => {
            let report = if stale {
                engine.refresh_stale(config.stale_after()).await
            } else {
                engine.refresh_all().await
            };
            match report {
                Some(report) => print_report(&report),
                None => println!("A refresh is already running"),
            }
        }
        Command::List { category } => {
            let items = engine.items_for_category(&category).await;
            if items.is_empty() {
                println!("No items");
            }
            let now = Utc::now();
            for item in &items {
                print_item(item, now);
            }
            println!("{} unread", engine.unread_count().await);
        }
        Command::Read { id } => {
            if !engine.mark_item_read(&id).await {
                anyhow::bail!("No item with id {id}");
            }
        }
        Command::Toggle { id } => match engine.toggle_item_read(&id).await {
            Some(true) => println!("Marked read"),
            Some(false) => println!("Marked unread"),
            None => anyhow::bail!("No item with id {id}"),
        },
        Command::ReadAll => {
            let n = engine.mark_all_read().await;
            println!("Marked {n} items read");
        }
        Command::Open { id } => {
            let item = engine
                .item(&id)
                .await
                .with_context(|| format!("No item with id {id}"))?;
            // SEC: only http(s) links reach open::that()
            let url = validate_link(&item.link)
                .with_context(|| format!("Refusing to open link {:?}", item.link))?;
            open::that(url.as_str()).context("Failed to open browser")?;
            engine.mark_item_read(&id).await;
        }
        Command::Import { file } => {
            let feeds = feed::parse_opml(&file)
                .await
                .with_context(|| format!("Failed to import {}", file.display()))?;
            let report = engine.import_feeds(feeds).await;
            println!(
                "Imported {} feeds ({} skipped). Run `relayfeed refresh` to fetch them.",
                report.added.len(),
                report.skipped
            );
        }
        Command::Export { file } => {
            let feeds = engine.feeds().await;
            feed::export_to_file(&feeds, &file)
                .with_context(|| format!("Failed to export to {}", file.display()))?;
            println!("Exported {} feeds to {}", feeds.len(), file.display());
        }
    }
    Ok(())
}

fn print_report(report: &BatchReport) {
    for outcome in &report.outcomes {
        let name = strip_control_chars(&outcome.feed_name);
        match &outcome.error {
            None => println!("  ok    {name} (+{})", outcome.items_added),
            Some(e) => println!("  FAIL  {name}: {e}"),
        }
    }
    match report.summary() {
        Some(summary) => println!("{summary}"),
        None => println!("No feeds to refresh"),
    }
    if let Some(e) = &report.storage_error {
        eprintln!("Warning: refreshed items could not be saved: {e}");
    }
}

// SEC-001: names and categories may come from an imported OPML file
fn feed_line(feed: &Feed, now: chrono::DateTime<Utc>) -> String {
    let fetched = feed
        .last_fetched_at
        .map(|at| format_relative(at, now))
        .unwrap_or_else(|| "never".to_string());
    format!(
        "{}  {} [{}]  {}  (fetched {})",
        feed.id,
        strip_control_chars(&feed.name),
        strip_control_chars(&feed.category),
        strip_control_chars(&feed.url),
        fetched
    )
}

fn print_item(item: &Item, now: chrono::DateTime<Utc>) {
    let marker = if item.read { ' ' } else { '*' };
    let title = strip_control_chars(&item.title);
    println!(
        "{marker} {}  {}",
        fit_width(&title, TITLE_WIDTH),
        format_relative(item.published_at, now)
    );
    if !item.summary.is_empty() {
        println!("    {}", strip_control_chars(&item.summary));
    }
    println!("    {}  {}", strip_control_chars(&item.link), item.id);
}
