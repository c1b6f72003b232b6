use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxy_probe::{
    config::Config,
    emitter::{drain_to, stream_run, ChannelWriter, ResultStreamEmitter},
    proxy::{CancelSignal, ProxyParser, WorkerPool},
    server::ProbeServer,
    telemetry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

/// A concurrent proxy prober with streaming results
#[derive(Parser)]
#[command(name = "proxy-probe")]
#[command(about = "A concurrent proxy prober with streaming results")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every proxy in a file and stream results to stdout as JSON lines
    Check {
        /// Input file containing proxies
        input: PathBuf,
        /// Number of concurrent workers
        #[arg(short = 'n', long)]
        workers: Option<usize>,
        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// URL to test proxies against
        #[arg(long)]
        test_url: Option<String>,
    },
    /// Parse proxies from a file and print them normalized
    Parse {
        /// Input file containing proxies
        input: PathBuf,
    },
    /// Serve the streaming test API over HTTP
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    telemetry::init(&config.log);

    match cli.command {
        Commands::Check {
            input,
            workers,
            timeout,
            test_url,
        } => {
            if let Some(workers) = workers {
                config.probe.workers = workers;
            }
            if let Some(timeout) = timeout {
                config.probe.timeout_secs = timeout;
            }
            if let Some(test_url) = test_url {
                config.probe.test_url = test_url;
            }
            config.validate()?;

            let proxies = ProxyParser::parse_file(&input)
                .with_context(|| format!("Failed to read proxies from {:?}", input))?;
            anyhow::ensure!(!proxies.is_empty(), "No proxies found in {:?}", input);
            info!("Loaded {} proxies from {:?}", proxies.len(), input);
            info!("Test URL: {}", config.probe.test_url);

            let pool = WorkerPool::new(config.checker_config());
            let (writer, rx) = ChannelWriter::channel();
            let output = tokio::spawn(drain_to(rx, tokio::io::stdout()));
            let emitter = Arc::new(ResultStreamEmitter::new(writer));
            let cancel = CancelSignal::new();

            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, aborting remaining probes");
                    on_interrupt.cancel();
                }
            });

            let report = stream_run(&pool, proxies, emitter, cancel).await?;
            output.await?.context("Failed to write results")?;
            if report.is_cancelled() {
                info!("Stopped early with {} results", report.outcomes().count());
            }
        }
        Commands::Parse { input } => {
            let lines = ProxyParser::parse_file(&input)
                .with_context(|| format!("Failed to read proxies from {:?}", input))?;

            for line in &lines {
                match ProxyParser::parse(line) {
                    Ok(proxy) => println!("{}", proxy.url()),
                    Err(e) => eprintln!("{}: {}", line, e),
                }
            }
        }
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            let server = ProbeServer::new(config.server.clone(), config.checker_config());
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let mut server_task = tokio::spawn(async move { server.run(shutdown_rx).await });

            let interrupted = tokio::select! {
                _ = shutdown_signal() => true,
                result = &mut server_task => {
                    result??;
                    false
                }
            };

            if interrupted {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
                server_task.await??;
            }
        }
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
