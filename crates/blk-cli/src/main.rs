use std::sync::Arc;

use anyhow::Result;
use blk_config::{report_unused_keys, ConfigConsumer, UnusedKeyPolicy};
use blk_reservation::{PgReservationStore, Sweeper, SystemClock};
use blk_schemas::NullSink;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "blk")]
#[command(about = "BlockDesk operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> site overrides...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Run one expiration sweep against the database and print the report
    Sweep {
        /// Layered config paths in merge order
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = blk_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = blk_db::status(&pool).await?;
                    println!("db_ok={} has_blocks_table={}", s.ok, s.has_blocks_table);
                }
                DbCmd::Migrate => {
                    blk_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = blk_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Sweep { config_paths } => {
            let loaded = if config_paths.is_empty() {
                blk_config::LoadedConfig::empty()?
            } else {
                let path_refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
                blk_config::load_layered_yaml(&path_refs)?
            };
            report_unused_keys(ConfigConsumer::Cli, &loaded.config_json, UnusedKeyPolicy::Warn)?;
            let policy = loaded.settings()?.policy()?;

            let pool = blk_db::connect_from_env().await?;
            // One-shot process: nobody is subscribed, so events go nowhere.
            let sweeper = Sweeper::new(
                Arc::new(PgReservationStore::new(pool)),
                Arc::new(NullSink),
                Arc::new(SystemClock),
                policy,
            );
            let report = sweeper.run_once().await?;

            let ids: Vec<String> = report
                .expired_blocks
                .iter()
                .map(|id| id.to_string())
                .collect();
            println!("config_hash={}", loaded.config_hash);
            println!("ran_at_utc={}", report.ran_at.to_rfc3339());
            println!("expired_blocks={}", report.expired_blocks.len());
            println!("expired_block_ids={}", ids.join(","));
            println!("expired_claims={}", report.expired_claims);
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
}
