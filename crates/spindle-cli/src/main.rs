use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use spindle_adapters::{FixtureProvider, ProviderClient, SpotifyClient};
use spindle_core::{Answers, Feed, Library, Provider, Review, SortKey, SystemClock};
use spindle_storage::{MemoryStore, PgStore, RefreshCredential, TokenCipher};
use spindle_sync::{SyncConfig, SyncService};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "spindle")]
#[command(about = "Mirror music provider libraries into a local catalog")]
struct Cli {
    /// Serve provider data from a fixture bundle instead of the Spotify API.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Store a provider refresh token for a user and create their feed.
    Link {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value = "spotify")]
        provider: Provider,
        #[arg(long, env = "SPINDLE_REFRESH_TOKEN")]
        refresh_token: String,
    },
    /// List a user's feeds.
    Feeds {
        #[arg(long)]
        user: Uuid,
    },
    /// Sync one feed now.
    Sync {
        #[arg(long)]
        feed: Uuid,
    },
    /// Sync every stale feed once, sequentially.
    SyncStale,
    /// Run the task manager until ctrl-c.
    Serve,
    /// Print a user's library.
    Library {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value = "title")]
        sort: SortKey,
        #[arg(long)]
        desc: bool,
        #[arg(long)]
        json: bool,
    },
    /// Score an album review from three 1-5 answers.
    Score {
        #[arg(long)]
        consistency: u8,
        #[arg(long)]
        impact: u8,
        #[arg(long)]
        gut_check: u8,
    },
    /// Link, sync and print a library against an in-memory store. Needs --fixture.
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Score {
            consistency,
            impact,
            gut_check,
        } => {
            let answers = Answers::new(consistency, impact, gut_check)?;
            let review = Review::from_answers(answers);
            println!("{:.1} {}", review.score, review.label);
        }
        Commands::Demo => {
            let path = cli
                .fixture
                .as_deref()
                .context("demo needs --fixture <bundle.json>")?;
            run_demo(config, path).await?;
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        command => {
            let store = Arc::new(connect(&config).await?);
            let provider = build_provider(&config, cli.fixture.as_deref())?;
            let service =
                SyncService::new(config.clone(), store, provider, Arc::new(SystemClock));
            run_command(&config, &service, command).await?;
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    let mut store = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to database")?;
    match &config.token_secret {
        Some(secret) => {
            let cipher = TokenCipher::from_hex(secret).context("parsing SPOTIFY_TOKEN_SECRET")?;
            store = store.with_cipher(cipher);
        }
        None => warn!("SPOTIFY_TOKEN_SECRET is not set; credentials cannot be stored or read"),
    }
    Ok(store)
}

fn build_provider(config: &SyncConfig, fixture: Option<&Path>) -> Result<Arc<dyn ProviderClient>> {
    if let Some(path) = fixture {
        info!(path = %path.display(), "using fixture provider");
        return Ok(Arc::new(FixtureProvider::from_path(path)?));
    }
    let spotify = config
        .spotify()
        .context("SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET must be set")?;
    Ok(Arc::new(SpotifyClient::new(spotify)?))
}

async fn run_command(config: &SyncConfig, service: &SyncService, command: Commands) -> Result<()> {
    match command {
        Commands::Link {
            user,
            provider,
            refresh_token,
        } => {
            let feed = service
                .link_provider(user, provider, &RefreshCredential::new(refresh_token))
                .await?;
            print_feed(&feed);
        }
        Commands::Feeds { user } => {
            for feed in service.users_feeds(user).await? {
                print_feed(&feed);
            }
        }
        Commands::Sync { feed } => {
            let feed = service.sync_feed(feed).await?;
            print_feed(&feed);
        }
        Commands::SyncStale => {
            let stale = service.stale_feeds().await?;
            info!(count = stale.len(), "syncing stale feeds");
            let mut failed = 0usize;
            for feed in stale {
                match service.sync_feed(feed.id).await {
                    Ok(feed) => print_feed(&feed),
                    Err(err) => {
                        failed += 1;
                        warn!(feed_id = %feed.id, error = %err, "stale feed sync failed");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} feed sync(s) failed");
            }
        }
        Commands::Serve => {
            if !config.scheduler_enabled {
                bail!("scheduler disabled; set SPINDLE_SCHEDULER_ENABLED=true to serve");
            }
            let shutdown = CancellationToken::new();
            let mut manager = service.task_manager(&shutdown)?;
            manager.start().await.context("starting task manager")?;
            info!(cron = %config.stale_sync_cron, "serving; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
            shutdown.cancel();
            manager.stop().await;
        }
        Commands::Library {
            user,
            sort,
            desc,
            json,
        } => {
            let mut library = service.library(user).await?;
            library.sort(sort, !desc);
            print_library(&library, json)?;
        }
        other => bail!("{other:?} does not run against a sync service"),
    }
    Ok(())
}

async fn run_demo(config: SyncConfig, fixture: &Path) -> Result<()> {
    let provider = FixtureProvider::from_path(fixture)?;
    let kind = provider.provider();
    let service = SyncService::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(provider),
        Arc::new(SystemClock),
    );

    let user = Uuid::new_v4();
    let feed = service
        .link_provider(user, kind, &RefreshCredential::new("demo"))
        .await?;
    let feed = service.sync_feed(feed.id).await?;
    print_feed(&feed);

    let mut library = service.library(user).await?;
    library.sort(SortKey::Date, false);
    print_library(&library, false)
}

fn print_feed(feed: &Feed) {
    let completed = feed
        .last_sync_completed_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "feed={} user={} kind={} status={} last_completed={}",
        feed.id, feed.user_id, feed.kind, feed.sync_status, completed
    );
}

fn print_library(library: &Library, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(library)?);
        return Ok(());
    }
    println!(
        "{} albums, {} artists, {} tracks",
        library.albums.len(),
        library.artists.len(),
        library.tracks.len()
    );
    for album in &library.albums {
        let added = album
            .earliest_added_at()
            .map(|at| at.date_naive().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{added:>10}  {}  {}",
            album.first_artist_name().unwrap_or("(unknown artist)"),
            album.title
        );
    }
    Ok(())
}
