use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "ctr")]
#[command(about = "Consent reconciliation operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands (reads CTR_DATABASE_URL)
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> environment -> overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Validate layered config and show the selected back ends
    ConfigCheck {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Audit journal utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply embedded SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Verify the hash chain of a journal file.
    Verify {
        #[arg(long)]
        journal: PathBuf,
    },

    /// Print a subject's records as JSON lines.
    List {
        #[arg(long)]
        journal: PathBuf,

        #[arg(long)]
        subject: String,

        /// Exclusive seq cursor.
        #[arg(long)]
        since: Option<u64>,
    },

    /// Print a subject's latest consent state.
    Latest {
        #[arg(long)]
        journal: PathBuf,

        #[arg(long)]
        subject: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    // Logs go to stderr; stdout carries command output only.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = ctr_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = ctr_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_audit_events_table={}",
                        s.ok, s.has_audit_events_table
                    );
                }
                DbCmd::Migrate => {
                    ctr_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let loaded = commands::config::load(&paths)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::ConfigCheck { paths } => commands::config::check(&paths)?,

        Commands::Audit { cmd } => match cmd {
            AuditCmd::Verify { journal } => commands::audit::verify(&journal)?,
            AuditCmd::List {
                journal,
                subject,
                since,
            } => commands::audit::list(&journal, &subject, since)?,
            AuditCmd::Latest { journal, subject } => commands::audit::latest(&journal, &subject)?,
        },
    }

    Ok(())
}
