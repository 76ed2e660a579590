use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use canopy::config::Config;
use canopy::feed::{read_opml, Fetcher};
use canopy::registry::{sort_snapshot, Registry};
use canopy::storage::{Database, DatabaseError};
use canopy::util::validate_feed_url;

/// Get the config directory path (~/.config/canopy/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("canopy"))
}

/// Creates `dir` if needed and restricts it to the current user.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "canopy", version, about = "Polls RSS and Atom feeds into a local SQLite store")]
struct Args {
    /// Config file (default: ~/.config/canopy/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every subscribed feed until interrupted
    Run,
    /// Add a feed URL to the subscription set
    Subscribe { url: String },
    /// Remove a feed and its stored items
    Unsubscribe { url: String },
    /// Print subscribed URLs
    List,
    /// Subscribe to every feed in an OPML file
    Import {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Print stored feeds as JSON, most recently updated first
    Snapshot,
    /// Print a feed's recent fetch attempts as JSON, newest first
    Fetches {
        url: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

async fn open_database(path: &Path, config: &Config) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db.with_item_window(config.item_window)),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: {}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

async fn run(db: Database, config: &Config) -> Result<()> {
    let fetcher = Fetcher::new(config.fetch_timeout(), config.allow_private_hosts)
        .context("Failed to build HTTP client")?;
    let registry = Registry::start(db, fetcher, config.registry_settings()).await?;

    let feeds = registry.subscriptions().await?.len();
    if feeds == 0 {
        eprintln!("Warning: no subscriptions. Add one with `canopy subscribe <url>`.");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    registry.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("canopy=info")),
        )
        .init();

    let args = Args::parse();

    let (config_dir, config_path) = match &args.config {
        Some(path) => (
            path.parent().map(Path::to_path_buf).unwrap_or_default(),
            path.clone(),
        ),
        None => {
            let dir = get_config_dir()?;
            ensure_private_dir(&dir)?;
            let path = dir.join("config.toml");
            (dir, path)
        }
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let db_path = config.database_path(&config_dir);
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_private_dir(parent)?;
    }
    let db = open_database(&db_path, &config).await?;

    match args.command {
        Command::Run => run(db, &config).await?,
        Command::Subscribe { url } => {
            let url = validate_feed_url(&url, config.allow_private_hosts)?;
            if db.subscribe(url.as_str()).await? {
                println!("Subscribed to {}", url);
            } else {
                println!("Already subscribed to {}", url);
            }
        }
        Command::Unsubscribe { url } => {
            let key = url::Url::parse(url.trim())
                .map(|u| u.to_string())
                .unwrap_or(url);
            if db.unsubscribe(&key).await? {
                println!("Unsubscribed from {}", key);
            } else {
                println!("Not subscribed to {}", key);
            }
        }
        Command::List => {
            for url in db.list_subscriptions().await? {
                println!("{}", url);
            }
        }
        Command::Import { path } => {
            // SEC-008: Canonicalize to resolve symlinks and prevent path traversal
            let path = path
                .canonicalize()
                .with_context(|| format!("Failed to resolve import file: {}", path.display()))?;
            if !std::fs::metadata(&path)?.is_file() {
                anyhow::bail!("Import path must be a regular file");
            }

            let entries = read_opml(&path, config.allow_private_hosts)
                .await
                .context("Failed to parse OPML file")?;
            let urls: Vec<String> = entries.iter().map(|e| e.url.to_string()).collect();
            let added = db.subscribe_many(&urls).await?;
            println!(
                "Imported {} feeds from {} ({} new)",
                urls.len(),
                path.display(),
                added
            );
        }
        Command::Snapshot => {
            let mut feeds = db.read_all().await?;
            sort_snapshot(&mut feeds);
            println!("{}", serde_json::to_string_pretty(&feeds)?);
        }
        Command::Fetches { url, limit } => {
            let key = url::Url::parse(url.trim())
                .map(|u| u.to_string())
                .unwrap_or(url);
            let fetches = db.recent_fetches(&key, limit).await?;
            println!("{}", serde_json::to_string_pretty(&fetches)?);
        }
    }

    Ok(())
}
