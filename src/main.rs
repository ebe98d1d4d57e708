use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use tidings::account::AccountContext;
use tidings::config::{AccountConfig, Config};
use tidings::provider::provider_for;
use tidings::storage::Database;
use tidings::sync::{refresh_account, ArticleRef, DiffCache, DiffLedger, SyncCoordinator};

/// Get the config directory path (~/.config/tidings/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("tidings"))
}

#[derive(Parser, Debug)]
#[command(name = "tidings", about = "Headless feed-reader sync client")]
struct Args {
    /// Config file (default: ~/.config/tidings/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Account id to operate on (default: first configured account)
    #[arg(long, value_name = "ID")]
    account: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the account's credentials against its service
    Validate,
    /// Pull the subscription tree and new items into storage
    Refresh,
    /// List feeds with unread counts
    Feeds,
    /// Change read-state for articles and sync the change through
    Mark {
        /// Article ids to change
        #[arg(required = true)]
        articles: Vec<i64>,
        /// Feed the articles belong to
        #[arg(long, value_name = "ID")]
        feed: i64,
        /// Mark as read
        #[arg(long, conflicts_with = "unread")]
        read: bool,
        /// Mark as unread
        #[arg(long)]
        unread: bool,
    },
    /// Star or unstar one article
    Star {
        article: i64,
        /// Remove the star instead of adding it
        #[arg(long)]
        remove: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // No accounts configured: everything runs against an implicit local
    // account, which at least makes feeds/mark usable offline
    let account_cfg = match config.find_account(args.account.as_deref()) {
        Some(found) => found.clone(),
        None if args.account.is_some() => {
            bail!(
                "account '{}' not found in {}",
                args.account.unwrap_or_default(),
                config_path.display()
            )
        }
        None => AccountConfig {
            id: "local".to_string(),
            name: Some("On This Device".to_string()),
            kind: tidings::AccountKind::Local,
            endpoint: None,
            username: None,
            password: None,
        },
    };
    let account = account_cfg.account();

    let db_path = config_dir.join("tidings.db");
    let db = Database::open(db_path.to_str().context("non-UTF8 config path")?).await?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("tidings/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let provider = provider_for(&account_cfg, client, config.retry.to_policy())?;
    let ledger = Arc::new(DiffLedger::new());

    match args.command {
        Command::Validate => {
            if provider.validate_credentials().await? {
                println!("credentials ok for account '{}'", account.id);
            } else {
                bail!("service rejected credentials for account '{}'", account.id);
            }
        }

        Command::Refresh => {
            let summary = refresh_account(&db, provider.as_ref(), &ledger, &account.id).await?;
            println!(
                "{}: {} feeds, {} new, {} updated",
                account.name, summary.feeds, summary.new_items, summary.updated_items
            );
        }

        Command::Feeds => {
            let feeds = db.feeds_with_unread_counts(&account.id).await?;
            if feeds.is_empty() {
                println!("no feeds; run `tidings refresh` first");
            }
            for feed in feeds {
                let group = feed.group_title.as_deref().unwrap_or("-");
                println!("{:>6}  {:>4} unread  [{}] {}", feed.id, feed.unread_count, group, feed.title);
            }
        }

        Command::Mark {
            articles,
            feed,
            read,
            unread,
        } => {
            // No explicit flag toggles the displayed value
            let desired = match (read, unread) {
                (true, _) => Some(false),
                (_, true) => Some(true),
                _ => None,
            };

            let cache = Arc::new(DiffCache::new(config_dir.join("pending")));
            let accounts = Arc::new(AccountContext::new(account.clone()));
            let mut coordinator = SyncCoordinator::new(
                db,
                Arc::clone(&ledger),
                cache,
                Arc::clone(&provider),
                accounts,
                config.quiet_period(),
            );
            coordinator.start();

            for article_id in articles {
                let outcome = coordinator
                    .queue_change(
                        ArticleRef {
                            article_id,
                            feed_id: feed,
                            group_id: None,
                        },
                        desired,
                    )
                    .await?;
                tracing::debug!(article_id, ?outcome, "queued change");
            }

            wait_for_drain(&coordinator, config.quiet_period()).await;
            coordinator.shutdown();
        }

        Command::Star { article, remove } => {
            if db.find_article(&account.id, article).await?.is_none() {
                bail!("article {article} not found for account '{}'", account.id);
            }
            let changed = db.set_starred(&account.id, article, !remove).await?;
            if !changed {
                println!("article {article} already in that state");
            }
            if account.kind.is_remote_syncing() {
                provider.push_starred_state(&[article], !remove).await?;
            }
        }
    }

    Ok(())
}

/// Block until both pipelines have drained, bounded so a dead provider
/// cannot hang the process. Pending remote pushes that miss the window
/// survive in the disk snapshot.
async fn wait_for_drain(coordinator: &SyncCoordinator, quiet: Duration) {
    let deadline = tokio::time::Instant::now() + quiet * 4 + Duration::from_secs(30);
    loop {
        let ledger = coordinator.ledger();
        if ledger.is_empty() && ledger.pending_remote_snapshot().is_empty() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("timed out waiting for pipelines to drain");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
