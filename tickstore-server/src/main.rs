//! Tickstore server - RPC and replication frontends over the engine

mod api;
mod config;
mod metrics;
mod rpc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tickstore_core::instance::Instance;
use tickstore_core::replication::{ReplicationReceiver, ReplicationSender};
use tickstore_core::trigger::{LoggingTrigger, TriggerMatchers};
use tickstore_core::writer::{CsmWriter, ErrorWriter};

use api::AppState;
use config::Config;
use rpc::RpcService;

const DISK_USAGE_MONITOR_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "tickstore", version, about = "Financial time-series database server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a tickstore database server
    #[command(alias = "s")]
    Start {
        /// Path to the YAML configuration file
        #[arg(short, long, default_value = "./tickstore.yml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start { config } => start(config).await,
    }
}

async fn start(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to read configuration from {:?}", config_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!(config = ?config_path, "starting tickstore");

    let start = Instant::now();

    // replication sender (primary side)
    let sender = if config.replication.enabled && !config.is_replica() {
        let sender = ReplicationSender::with_defaults();
        let listener = TcpListener::bind(("0.0.0.0", config.replication.listen_port))
            .await
            .context("failed to bind the replication listener")?;
        let tls = if config.replication.tls_enabled {
            Some(load_tls_acceptor(
                &config.replication.cert_file,
                &config.replication.key_file,
            )?)
        } else {
            None
        };
        tokio::spawn(sender.clone().serve(listener, tls));
        info!(port = config.replication.listen_port, "replication master up");
        Some(sender)
    } else {
        None
    };

    let mut matchers = TriggerMatchers::new();
    for trigger in &config.triggers {
        match trigger.module.as_str() {
            "logging" => matchers.register(&trigger.on, Arc::new(LoggingTrigger)),
            other => warn!(module = other, "unknown trigger module, skipping"),
        }
    }

    let instance = Instance::initialize(
        config.instance_config(),
        sender.clone(),
        Arc::new(matchers),
    )?;

    metrics::register_metrics();
    metrics::STARTUP_TIME.set(start.elapsed().as_secs_f64());
    info!(startup_ms = start.elapsed().as_millis() as u64, "engine up");
    tokio::spawn(metrics::run_disk_usage_monitor(
        config.root_directory.clone(),
        DISK_USAGE_MONITOR_INTERVAL,
    ));
    if let Some(sender) = &sender {
        let sender = sender.clone();
        tokio::spawn(async move {
            loop {
                metrics::REPLICATION_SUBSCRIBERS.set(sender.subscriber_count() as i64);
                metrics::REPLICATION_MAX_LAG.set(sender.max_lag() as i64);
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        });
    }

    // replicas replay the primary and reject external writes
    let (rpc_writer, read_only): (Arc<dyn CsmWriter>, bool) = if config.is_replica() {
        let mut receiver = ReplicationReceiver::new(
            config.replication.master_host.clone(),
            instance.catalog().clone(),
        );
        if config.replication.tls_enabled {
            receiver = receiver.with_tls(&config.replication.cert_file)?;
        }
        let receiver = Arc::new(receiver);
        let policy = config.retry_policy();
        tokio::spawn(async move {
            if let Err(e) = receiver.run_with_retry(policy).await {
                error!(error = %e, "replication receiver gave up");
            }
        });
        info!(master = %config.replication.master_host, "replication client up");
        (Arc::new(ErrorWriter), true)
    } else {
        (instance.writer().clone(), false)
    };

    let queryable = Arc::new(AtomicBool::new(false));
    let service = RpcService::new(
        instance.clone(),
        rpc_writer,
        queryable.clone(),
        read_only,
    );

    if let Some(addr) = &config.tcp_listen_url {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind rpc tcp listener on {}", addr))?;
        tokio::spawn(rpc::serve_tcp(listener, service.clone()));
    }

    let state = Arc::new(AppState {
        rpc: service,
    });
    let app = api::create_router(state);
    let listener = TcpListener::bind(&config.listen_url)
        .await
        .with_context(|| format!("failed to bind http listener on {}", config.listen_url))?;
    info!(addr = %config.listen_url, "http listener up");

    info!("enabling query access");
    queryable.store(true, Ordering::SeqCst);

    // SIGUSR1 dumps engine state without affecting it
    let dump_instance = instance.clone();
    tokio::spawn(async move {
        let Ok(mut usr1) = signal(SignalKind::user_defined1()) else {
            return;
        };
        while usr1.recv().await.is_some() {
            info!("state dump:\n{}", dump_instance.dump_state());
        }
    });

    let grace = config.stop_grace_period();
    let shutdown_flag = queryable.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_stop_signal().await;
            info!("initiating graceful shutdown");
            shutdown_flag.store(false, Ordering::SeqCst);
            info!(grace = ?grace, "waiting the grace period before stopping frontends");
            tokio::time::sleep(grace).await;
        })
        .await?;

    // frontends stopped and in-flight requests drained; checkpoint and exit
    instance.shutdown()?;
    info!("exiting");
    Ok(())
}

async fn wait_for_stop_signal() {
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
}

fn load_tls_acceptor(cert_file: &Path, key_file: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to read replication certificates")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
        .context("no private key found in the replication key file")?;
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build the replication TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
