use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use halo_core::SyncMode;
use halo_store::{JobLedger, PgStore};
use halo_sync::{connect_services, maybe_build_scheduler, run_all, select_entities, SyncConfig};
use halo_web::AppState;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "halo-cli")]
#[command(about = "Halo PSA record sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync entities from Halo into the local store.
    Sync {
        /// Re-fetch everything and prune records Halo no longer has.
        #[arg(long)]
        full: bool,
        /// Limit the run to these entities (repeatable).
        #[arg(long = "entity")]
        entities: Vec<String>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the callback endpoint, and the scheduler when enabled.
    Serve,
    /// Fetch a fresh token to check the configured credentials.
    CheckAuth,
    /// Show recent sync jobs.
    Jobs {
        #[arg(long)]
        entity: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().load_settings_file()?;

    match cli.command.unwrap_or(Commands::Sync {
        full: false,
        entities: Vec::new(),
    }) {
        Commands::Sync { full, entities } => {
            let names = if entities.is_empty() {
                config.entities.clone()
            } else {
                entities
            };
            let specs = select_entities(&names)?;
            let (services, _, _) = connect_services(&config).await?;
            let summary = run_all(&services, SyncMode::from_full_flag(full), &specs).await;
            for entity in &summary.entities {
                match (&entity.counts, &entity.error) {
                    (Some(counts), _) => println!("{:<12} {counts}", entity.entity),
                    (None, Some(error)) => println!("{:<12} failed: {error}", entity.entity),
                    (None, None) => {}
                }
            }
            println!(
                "sync complete: run_id={} mode={} failures={}",
                summary.run_id,
                summary.mode,
                summary.failures()
            );
            if summary.failures() > 0 {
                bail!("{} entities failed to sync", summary.failures());
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let secret = config
                .callback_secret
                .clone()
                .context("HALO_CALLBACK_SECRET must be set to serve callbacks")?;
            let (services, _, _) = connect_services(&config).await?;
            if let Some(sched) = maybe_build_scheduler(&config, services.clone()).await? {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler started");
            }
            halo_web::serve(&config.bind_addr, AppState::with_services(secret, services)).await?;
        }
        Commands::CheckAuth => {
            let (_, _, client) = connect_services(&config).await?;
            client.check_auth().await.context("requesting token")?;
            println!("credentials accepted");
        }
        Commands::Jobs { entity, limit } => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            for job in store.recent(entity.as_deref(), limit).await? {
                let outcome = match job.success {
                    Some(true) => "ok",
                    Some(false) => "failed",
                    None => "running",
                };
                println!(
                    "{} {:<12} {:<11} {:<7} {} {}",
                    job.started_at.format("%Y-%m-%d %H:%M:%S"),
                    job.entity_name,
                    job.mode.as_str(),
                    outcome,
                    job.counts,
                    job.message.unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
