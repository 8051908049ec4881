//! fray CLI
//!
//! Subcommands: pull, proxy, status, prune, version.
//! Exit code is 0 on success and 1 on any fatal error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use fray::proxy::{self, ProxyOptions, ProxyState};
use fray::registry::RegistryClient;
use fray::store::{Layout, PullOptions, Puller, DEFAULT_CHUNK_SIZE, DEFAULT_PARALLEL};
use fray::{prune, version};

const CACHE_ENV_VAR: &str = "FRAY_CACHE_DIR";
const ROOT_CACHE_DIR: &str = "/var/lib/containers/fray";
const ROOTLESS_CACHE_DIR: &str = ".local/share/containers/fray";

const PULL_DEADLINE: Duration = Duration::from_secs(30 * 60);
const SHUTDOWN_WINDOW: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "fray", version, about = "Edge-native OCI image puller and pull-through cache")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pull an image to an OCI layout
    Pull {
        /// Image reference (e.g. docker.io/library/alpine:latest)
        image: String,

        /// Output directory
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,

        /// Chunk size in bytes
        #[arg(short = 'c', long = "chunk-size", default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Parallel chunk downloads
        #[arg(short = 'p', long = "parallel", default_value_t = DEFAULT_PARALLEL)]
        parallel: usize,

        /// Suppress the progress line
        #[arg(short = 's', long = "silent")]
        silent: bool,
    },

    /// Run the pull-through caching proxy
    Proxy {
        /// Listen address
        #[arg(short = 'l', long = "listen", default_value = ":5000")]
        listen: String,

        /// Cache directory
        #[arg(short = 'd', long = "data-dir")]
        data_dir: Option<PathBuf>,

        /// Chunk size in bytes
        #[arg(short = 'c', long = "chunk-size", default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Parallel chunk downloads
        #[arg(short = 'p', long = "parallel", default_value_t = DEFAULT_PARALLEL)]
        parallel: usize,
    },

    /// Show layout status
    Status {
        /// Layout directory
        dir: Option<PathBuf>,
    },

    /// Remove incomplete downloads and state files
    Prune {
        /// Report without deleting
        #[arg(long)]
        dry_run: bool,

        /// Layout directory
        dir: Option<PathBuf>,
    },

    /// Show version information
    Version {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CACHE_ENV_VAR) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    if is_root() {
        return PathBuf::from(ROOT_CACHE_DIR);
    }

    match dirs::home_dir() {
        Some(home) => home.join(ROOTLESS_CACHE_DIR),
        None => PathBuf::from("./fray-cache"),
    }
}

fn is_root() -> bool {
    // Effective uid 0 selects the system-wide cache path.
    unsafe { libc::geteuid() == 0 }
}

/// Accept ":5000" shorthand as well as full socket addresses.
fn parse_listen_addr(listen: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    if let Some(port) = listen.strip_prefix(':') {
        return format!("0.0.0.0:{}", port).parse();
    }
    listen.parse()
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let code = match cli.command {
        Commands::Pull {
            image,
            output,
            chunk_size,
            parallel,
            silent,
        } => cmd_pull(image, output, chunk_size, parallel, silent).await,
        Commands::Proxy {
            listen,
            data_dir,
            chunk_size,
            parallel,
        } => cmd_proxy(listen, data_dir, chunk_size, parallel).await,
        Commands::Status { dir } => cmd_status(dir),
        Commands::Prune { dry_run, dir } => cmd_prune(dry_run, dir),
        Commands::Version { json } => cmd_version(json),
    };

    std::process::exit(code);
}

async fn cmd_pull(
    image: String,
    output: Option<PathBuf>,
    chunk_size: usize,
    parallel: usize,
    silent: bool,
) -> i32 {
    let output = output.unwrap_or_else(default_cache_dir);

    let layout = match Layout::open(&output) {
        Ok(layout) => Arc::new(layout),
        Err(e) => {
            tracing::error!(error = %e, "open layout failed");
            return 1;
        }
    };

    let client = match RegistryClient::new() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!(error = %e, "create registry client failed");
            return 1;
        }
    };

    tracing::info!(image = %image, output = %output.display(), "pulling");

    let progress: Option<fray::store::ProgressFn> = if silent {
        None
    } else {
        Some(Box::new(|layer, fraction| {
            eprint!("\rlayer {} {:>3.0}%  ", layer, fraction * 100.0);
        }))
    };

    let puller = Puller::new(
        layout,
        client,
        PullOptions {
            chunk_size,
            parallel,
            on_progress: progress,
            ..Default::default()
        },
    );

    let start = std::time::Instant::now();
    let result = match tokio::time::timeout(PULL_DEADLINE, puller.pull(&image)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            if !silent {
                eprintln!();
            }
            tracing::error!(error = %e, "pull failed");
            return 1;
        }
        Err(_) => {
            if !silent {
                eprintln!();
            }
            tracing::error!("pull deadline exceeded");
            return 1;
        }
    };
    if !silent {
        eprintln!("\rdone        ");
    }

    let elapsed = start.elapsed();
    tracing::info!(
        digest = %result.digest,
        layers = result.layers,
        total_bytes = result.total_size,
        downloaded_bytes = result.downloaded,
        cached_bytes = result.cached,
        elapsed_ms = elapsed.as_millis() as u64,
        "pull complete"
    );

    0
}

async fn cmd_proxy(
    listen: String,
    data_dir: Option<PathBuf>,
    chunk_size: usize,
    parallel: usize,
) -> i32 {
    let data_dir = data_dir.unwrap_or_else(default_cache_dir);

    let addr = match parse_listen_addr(&listen) {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(listen = %listen, error = %e, "invalid listen address");
            return 1;
        }
    };

    let layout = match Layout::open(&data_dir) {
        Ok(layout) => Arc::new(layout),
        Err(e) => {
            tracing::error!(error = %e, "open cache failed");
            return 1;
        }
    };

    let client = match RegistryClient::new() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!(error = %e, "create registry client failed");
            return 1;
        }
    };

    let state = Arc::new(ProxyState::new(
        layout,
        client,
        ProxyOptions {
            chunk_size,
            parallel,
            ..Default::default()
        },
    ));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "bind failed");
            return 1;
        }
    };

    tracing::info!(
        listen = %addr,
        cache = %data_dir.display(),
        chunk_kb = chunk_size / 1024,
        parallel,
        "proxy starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, proxy::router(state)).with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let mut server = tokio::spawn(std::future::IntoFuture::into_future(server));

    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "server error");
                    1
                }
                Err(e) => {
                    tracing::error!(error = %e, "server task failed");
                    1
                }
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(());

            // In-flight requests get a bounded window to finish.
            if tokio::time::timeout(SHUTDOWN_WINDOW, server).await.is_err() {
                tracing::warn!("shutdown window elapsed, aborting outstanding work");
            }
            0
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler failed, using ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

fn cmd_status(dir: Option<PathBuf>) -> i32 {
    let dir = dir.unwrap_or_else(default_cache_dir);

    let layout = match Layout::open(&dir) {
        Ok(layout) => layout,
        Err(e) => {
            tracing::error!(error = %e, "open layout failed");
            return 1;
        }
    };

    let index = match layout.get_index() {
        Ok(index) => index,
        Err(e) => {
            tracing::error!(error = %e, "read index failed");
            return 1;
        }
    };

    let stats = match layout.get_stats() {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!(error = %e, "get stats failed");
            return 1;
        }
    };

    println!("layout:  {}", dir.display());
    println!("images:  {}", index.manifests.len());
    println!(
        "blobs:   {} ({})",
        stats.blob_count,
        prune::human_bytes(stats.total_size)
    );

    for manifest in &index.manifests {
        let name = manifest.ref_name().unwrap_or("(untagged)");
        println!("  {}  {}  {}", name, manifest.digest, manifest.size);
    }

    let state_dir = dir.join(".fray");
    if let Ok(entries) = std::fs::read_dir(&state_dir) {
        for entry in entries.flatten() {
            println!("  in progress: {}", entry.file_name().to_string_lossy());
        }
    }

    0
}

fn cmd_prune(dry_run: bool, dir: Option<PathBuf>) -> i32 {
    let dir = dir.unwrap_or_else(default_cache_dir);

    let opts = prune::Options {
        dry_run,
        on_item: Some(Box::new(move |item| {
            if dry_run {
                println!("would delete: {} ({})", item.path.display(), prune::human_bytes(item.bytes));
            }
        })),
        on_delete: Some(Box::new(|item, err| match err {
            Some(e) => tracing::warn!(path = %item.path.display(), error = %e, "failed to remove"),
            None => tracing::debug!(path = %item.path.display(), "removed"),
        })),
    };

    let result = match prune::run(&dir, &opts) {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(path = %dir.display(), error = %e, "prune failed");
            return 1;
        }
    };

    if result.files == 0 {
        println!("nothing to prune");
        return 0;
    }

    let action = if dry_run { "would prune" } else { "pruned" };
    println!(
        "{} {} files ({})",
        action,
        result.files,
        prune::human_bytes(result.bytes)
    );

    0
}

fn cmd_version(json: bool) -> i32 {
    let info = version::get();

    if json {
        match serde_json::to_string_pretty(&info) {
            Ok(out) => println!("{}", out),
            Err(_) => return 1,
        }
        return 0;
    }

    println!("fray {}", info);
    println!("  commit:    {}", info.commit);
    println!("  built:     {}", info.build_date);
    println!("  platform:  {}", info.platform);

    0
}
