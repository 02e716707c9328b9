/// Command-line surface for the hostbox daemon and its operator commands.
use crate::backup::{BackupLoop, BackupManager};
use crate::config::HostConfig;
use crate::host::HostService;
use crate::notify::Notifier;
use crate::recovery;
use crate::scheduler::QuotaScheduler;
use crate::state::StateStore;
use crate::supervisor::Supervisor;
use crate::tokens::TokenService;
use crate::types::{Notification, Tier, UserId};
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hosting daemon: reconcile, then serve until SIGTERM/SIGINT
    Serve,
    /// Print a summary of users and running projects
    Status,
    /// Take one backup bundle and rotate old ones
    Backup,
    /// Issue a file-channel link for a user's project
    Token {
        #[arg(long)]
        uid: UserId,
        #[arg(long)]
        project: String,
    },
    /// Move a user to a tier
    SetTier {
        #[arg(long)]
        uid: UserId,
        /// "free" or "premium"
        #[arg(long)]
        tier: String,
    },
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn shutdown_handler(_sig: i32) {
    // ASYNC-SIGNAL SAFETY: a relaxed store is the only thing that happens
    // here; the main loop notices and unwinds normally.
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, shutdown_handler as usize);
        libc::signal(libc::SIGINT, shutdown_handler as usize);
    }
}

fn build_service(config: Arc<HostConfig>) -> Result<(HostService, crossbeam_channel::Receiver<Notification>)> {
    let store = Arc::new(StateStore::open(config.state_path())?);
    let supervisor = Arc::new(Supervisor::new(Arc::clone(&config), Arc::clone(&store)));
    let tokens = Arc::new(TokenService::open(
        config.tokens_path(),
        config.token_lifetime,
    )?);
    let (notifier, rx) = Notifier::channel();
    Ok((
        HostService::new(config, store, supervisor, tokens, notifier),
        rx,
    ))
}

fn serve(config: Arc<HostConfig>) -> Result<()> {
    setup_signal_handlers();
    let (service, rx) = build_service(Arc::clone(&config))?;
    let supervisor = Arc::clone(service.supervisor());
    let store = Arc::clone(service.store());

    let report = recovery::reconcile(&supervisor, &store)?;
    info!(
        "boot reconcile: {} kept, {} restarted, {} dropped",
        report.kept, report.restarted, report.dropped
    );

    // Until a front-end is wired in, notifications land in the log.
    let drain = std::thread::Builder::new()
        .name("notify-drain".to_string())
        .spawn(move || {
            for event in rx.iter() {
                info!("event: {event:?}");
            }
        })?;

    // The background loops clone the service's notifier, so every event
    // lands in the single drained channel above.
    let scheduler = QuotaScheduler::spawn(
        Arc::clone(&supervisor),
        Arc::clone(&store),
        config.scheduler_interval,
        service.notifier().clone(),
    );
    let backups = BackupLoop::spawn(Arc::clone(&config), service.notifier().clone());

    info!("hostbox daemon ready (data at {})", config.data_dir.display());
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }
    info!("shutdown requested, stopping background loops");
    scheduler.shutdown();
    backups.shutdown();
    drop(service);
    let _ = drain.join();
    Ok(())
}

fn status(config: Arc<HostConfig>) -> Result<()> {
    let store = StateStore::open(config.state_path())?;
    let snap = store.snapshot();
    println!("users: {}", snap.users.len());
    let records = snap.all_run_records();
    println!("run records: {}", records.len());
    for (uid, key, record) in records {
        let live = if Supervisor::pid_alive(record.pid) {
            "alive"
        } else {
            "stale"
        };
        println!("  user {uid} {key} pid {} ({live})", record.pid);
    }
    Ok(())
}

pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = Arc::new(HostConfig::from_env());

    match cli.command {
        Commands::Serve => serve(config),
        Commands::Status => status(config),
        Commands::Backup => {
            let manager = BackupManager::new(config);
            let bundle = manager.run_and_rotate()?;
            println!("{}", bundle.display());
            Ok(())
        }
        Commands::Token { uid, project } => {
            let (service, _rx) = build_service(config)?;
            println!("{}", service.file_link(uid, &project)?);
            Ok(())
        }
        Commands::SetTier { uid, tier } => {
            let tier = match tier.as_str() {
                "free" => Tier::Free,
                "premium" => Tier::Premium,
                other => anyhow::bail!("unknown tier: {other}"),
            };
            let (service, _rx) = build_service(config)?;
            service.set_tier(uid, tier)?;
            Ok(())
        }
    }
}
