use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serin_txn::clog::InMemoryCommitLog;
use serin_txn::config::TwoPhaseConfig;
use serin_txn::participant::InMemoryParticipantRegistry;
use serin_txn::recovery::{InMemorySubtransactionRegistry, RecoverContext};
use serin_txn::registry::{FixedLiveness, GxactRegistry};
use serin_txn::rmgr::RmgrTable;

/// SerinDB command-line interface (MVP).
#[derive(Parser)]
#[command(name = "serindb", author, version, about = "SerinDB CLI", long_about = None)]
struct Cli {
    /// Subcommands placeholder
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run health check and exit.
    HealthCheck,
    /// Inspect or recover prepared transactions left behind in `pg_twophase/`.
    #[command(subcommand)]
    Twophase(TwophaseCommand),
}

#[derive(Subcommand)]
enum TwophaseCommand {
    /// List every prepared transaction recoverable from a data directory.
    List(DataDirArgs),
    /// Run the recovery scanner against a data directory and report what changed.
    Recover(DataDirArgs),
}

#[derive(Args)]
struct DataDirArgs {
    /// Server data directory; its `pg_twophase` subdirectory is scanned.
    #[arg(long)]
    data_dir: PathBuf,

    /// Registry capacity to size the in-memory table with while scanning.
    #[arg(long, default_value_t = serin_txn::config::DEFAULT_MAX_PREPARED_XACTS)]
    max_prepared_xacts: usize,
}

async fn run_recovery(args: &DataDirArgs) -> anyhow::Result<(GxactRegistry, usize)> {
    let state_dir = args.data_dir.join("pg_twophase");
    let config = TwoPhaseConfig {
        max_prepared_xacts: args.max_prepared_xacts,
        state_dir: state_dir.clone(),
    };

    let mut next_xid = serin_txn::registry::Xid(u32::MAX);
    let _ = serin_txn::recovery::prescan(&state_dir, &mut next_xid)?;

    let registry = GxactRegistry::new(&config);
    let liveness = FixedLiveness::new();
    let clog = InMemoryCommitLog::new();
    let participants = InMemoryParticipantRegistry::new();
    let subxacts = InMemorySubtransactionRegistry::new();
    let rmgr = RmgrTable::new();

    let ctx = RecoverContext {
        clog: &clog,
        registry: &registry,
        liveness: &liveness,
        participants: &participants,
        subxacts: &subxacts,
        rmgr: &rmgr,
    };
    let recovered = serin_txn::recovery::recover(&state_dir, ctx).await?;
    Ok((registry, recovered))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _reload_handle = serin_log::init("./log", tracing::Level::INFO)?;

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::HealthCheck) => {
            if serindb::health_check() {
                println!("OK");
            } else {
                println!("FAILED");
            }
        }
        Some(Commands::Twophase(TwophaseCommand::List(args))) => {
            let (registry, _) = run_recovery(&args).await?;
            for gxact in registry.snapshot() {
                println!(
                    "xid={} gid=\"{}\" database={} owner={} children={}{}",
                    gxact.xid(),
                    gxact.gid(),
                    gxact.database(),
                    gxact.owner(),
                    gxact.children().len(),
                    if gxact.children_overflowed() { " (overflowed)" } else { "" },
                );
            }
        }
        Some(Commands::Twophase(TwophaseCommand::Recover(args))) => {
            let (registry, recovered) = run_recovery(&args).await?;
            println!("recovered {} prepared transaction(s) into {} slot(s)", recovered, registry.capacity());
        }
        None => {
            // Default behavior: print help (handled by clap auto) if no subcommand
        }
    }
    Ok(())
}
