use anyhow::{Context as _, Result};
use std::{io::Write as _, sync::Arc};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use tokio::sync::Mutex;

use rayd::{
    config::{Cli, Command, Config, LinkArgs, X25519Args},
    engine::{EngineLauncher, XrayLauncher, XrayLauncherOptions, stats::EngineStats},
    state::{JsonSnapshotStore, StoreInit},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run(cli.config).await,
        Command::Compile => compile(&cli.config),
        Command::X25519(args) => x25519(args),
        Command::Link(args) => link(&cli.config, args),
    }
}

fn open_store(config: &Config) -> Result<JsonSnapshotStore> {
    JsonSnapshotStore::load_or_init(StoreInit {
        data_dir: config.data_dir.clone(),
    })
    .with_context(|| format!("open store under {}", config.data_dir.display()))
}

async fn run(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let api_port = store.state().engine.api_port;
    let store = Arc::new(Mutex::new(store));

    let launcher: Arc<dyn EngineLauncher> = Arc::new(XrayLauncher::new(
        XrayLauncherOptions::from_config(&config),
    ));
    let poller_options = rayd::stats::StatsPollerOptions::from_config(&config);
    let (flush, flushes) = rayd::stats::flush_channel(poller_options.flush_wait());
    let (supervisor, supervisor_task) =
        rayd::supervisor::spawn_supervisor(&config, launcher, Arc::new(flush));
    let (reconcile, reconcile_task) =
        rayd::reconcile::spawn_reconciler(&config, store.clone(), supervisor.clone());
    let (quota, quota_task) =
        rayd::quota::spawn_quota_worker(&config, store.clone(), reconcile.clone());

    let stats_addr = config.stats_api_addr_for(api_port);
    let stats: Arc<dyn EngineStats> = Arc::new(rayd::engine::stats::GrpcStats::new(stats_addr)?);
    let poller_task = rayd::stats::spawn_stats_poller_with_options(
        poller_options,
        store.clone(),
        stats,
        supervisor.subscribe(),
        quota.clone(),
        flushes,
    );

    info!(
        data_dir = %config.data_dir.display(),
        engine_bin = %config.engine_bin.display(),
        engine_config = %config.engine_config_path().display(),
        stats_api_addr = %stats_addr,
        "starting rayd"
    );

    shutdown_signal().await;
    info!("shutting down");

    drop(reconcile);
    reconcile_task.abort();
    // The poller must still be running: stopping the engine takes a final sample through it.
    if let Err(err) = supervisor.stop().await {
        warn!(error = %err, "engine did not stop cleanly");
    }
    poller_task.abort();
    quota.shutdown().await;
    let _ = quota_task.await;
    supervisor_task.abort();
    Ok(())
}

fn compile(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    match rayd::compiler::compile_store(&store, chrono::Utc::now()) {
        Ok(document) => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(document.as_bytes())?;
            stdout.write_all(b"\n")?;
            Ok(())
        }
        Err(errors) => {
            for issue in errors.issues() {
                eprintln!("error: {issue}");
            }
            anyhow::bail!("config rejected with {} issue(s)", errors.issues().len())
        }
    }
}

fn x25519(args: X25519Args) -> Result<()> {
    let keypair = match args.private_key {
        Some(private_key) => rayd::protocol::reality_keypair_from_private_key(&private_key)
            .map_err(|e| anyhow::anyhow!("invalid private key: {e}"))?,
        None => rayd::protocol::generate_reality_keypair(&mut rand::rngs::OsRng),
    };
    println!("Private key: {}", keypair.private_key);
    println!("Public key: {}", keypair.public_key);
    Ok(())
}

fn link(config: &Config, args: LinkArgs) -> Result<()> {
    let store = open_store(config)?;
    let client = store
        .get_client(&args.client_id)
        .with_context(|| format!("client not found: {}", args.client_id))?;
    let inbound = store
        .get_inbound(&client.inbound_id)
        .with_context(|| format!("inbound not found: {}", client.inbound_id))?;
    let link = rayd::links::share_link(&inbound, &client, &config.public_host)?;
    println!("{}", link.to_uri());
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}
