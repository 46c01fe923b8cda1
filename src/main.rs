//! bitlit - Main entry point
//!
//! Downloads a torrent: discovers peers through the torrent's trackers (and
//! any `--peer` addresses), then runs the download session. The payload is
//! written as one file; a multi-file torrent lands as the concatenation of
//! its files in descriptor order.
//! Typing `p` + Enter toggles pause, `q` + Enter quits.

use anyhow::{Context, Result};
use bitlit::{
    CliArgs, CombinedSource, Config, DownloadCoordinator, PeerId, PeerSource, ProgressDisplay, ProgressSink,
    SessionContext, SessionStatus, StaticPeers, TorrentError, TorrentInfo, TorrentParser, TrackerClient,
};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!("PANIC occurred at {}:{}:{}", location.file(), location.line(), location.column());
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args)?;
    info!("bitlit starting");
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let torrent = Arc::new(load_torrent_file(&args.torrent_file).context("Failed to load torrent file")?);
    if !args.quiet {
        display_torrent_info(&torrent, &config);
    }

    let progress = Arc::new(ProgressDisplay::new(torrent.total_size(), torrent.piece_count(), args.quiet));
    let sink: Arc<dyn ProgressSink> = progress.clone();
    let peer_id = PeerId::generate();
    let source = build_peer_source(&torrent, &config, peer_id, sink.clone());

    let output_path = config.output_path(&torrent.name);
    let ctx = SessionContext::create(torrent.clone(), peer_id, config.session.clone(), output_path.clone(), sink)
        .await
        .map_err(|e| {
            error!("Failed to create output file '{}': {}", output_path.display(), e);
            e
        })?;
    let coordinator = DownloadCoordinator::new(ctx, source);

    let quit = Arc::new(Notify::new());
    spawn_input_loop(coordinator.clone(), quit.clone());

    tokio::select! {
        status = coordinator.run() => match status? {
            SessionStatus::Complete => {
                info!("Saved to {} after {:?}", output_path.display(), progress.elapsed());
                Ok(())
            }
            SessionStatus::Failed(e) => {
                error!("Download failed: {}", e);
                Err(e.into())
            }
            other => {
                warn!("Session stopped in state {:?}", other);
                Ok(())
            }
        },
        _ = quit.notified() => {
            info!("Quit requested, closing peers");
            coordinator.pause().await;
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing peers");
            coordinator.pause().await;
            Ok(())
        }
    }
}

/// Initialize logging based on verbosity settings
///
/// With `--log-file` all output goes to the file so the terminal only shows
/// the progress line.
fn init_logging(args: &CliArgs) -> Result<()> {
    let level = args.log_level();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path).map_err(|e| {
                TorrentError::config_error_with_field(
                    format!("Failed to open log file '{}': {}", path.display(), e),
                    "log_file",
                )
            })?;
            subscriber.with_ansi(false).with_writer(Mutex::new(file)).compact().init();
        }
        None if args.verbose => subscriber.with_writer(std::io::stderr).pretty().init(),
        None => subscriber.with_writer(std::io::stderr).compact().init(),
    }

    debug!("Logging initialized at level {:?}", level);
    Ok(())
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    info!("Loading torrent file: {}", path.display());
    let info = TorrentParser::parse_file(path).map_err(|e| {
        error!("Failed to parse torrent file '{}': {}", path.display(), e);
        e
    })?;
    info!("Successfully loaded torrent file: {}", info.name);
    Ok(info)
}

/// Display torrent information
fn display_torrent_info(torrent: &TorrentInfo, config: &Config) {
    println!("Torrent Information:");
    println!("  Name: {}", torrent.name);
    println!(
        "  Size: {} ({})",
        torrent.total_size(),
        ProgressDisplay::format_bytes(torrent.total_size())
    );
    println!("  Pieces: {}", torrent.piece_count());
    println!("  Piece length: {}", ProgressDisplay::format_bytes(torrent.piece_length));
    println!("  Info hash: {}", torrent.info_hash_hex());
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.output_dir.display());
    println!("  Listen port: {}", config.session.listen_port);
    println!("  Max connections: {}", config.session.max_connections);
    println!("  Tracker: {}", if config.use_tracker { "enabled" } else { "disabled" });
    if !config.peers.is_empty() {
        println!("  Manual peers: {}", config.peers.len());
    }
    println!();
    println!("Type 'p' + Enter to pause or resume, 'q' + Enter to quit");
    println!();
}

/// Trackers plus manual peers
fn build_peer_source(
    torrent: &TorrentInfo,
    config: &Config,
    peer_id: PeerId,
    sink: Arc<dyn ProgressSink>,
) -> Arc<dyn PeerSource> {
    let mut source = CombinedSource::new();
    if config.use_tracker {
        let tracker = TrackerClient::new(torrent, *peer_id.as_bytes(), config.session.listen_port)
            .with_timeouts(config.session.tracker_connect_timeout(), config.session.tracker_aggregation())
            .with_sink(sink);
        info!("Using {} tracker URLs", tracker.urls().len());
        source = source.with(Arc::new(tracker));
    }
    if !config.peers.is_empty() {
        source = source.with(Arc::new(StaticPeers::new(config.peers.clone())));
    }
    Arc::new(source)
}

/// Read pause/quit commands from stdin
fn spawn_input_loop(coordinator: DownloadCoordinator, quit: Arc<Notify>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match line.trim() {
                "p" => {
                    let paused = coordinator.toggle_pause().await;
                    info!("{}", if paused { "Paused" } else { "Resumed" });
                }
                "q" => {
                    quit.notify_one();
                    return;
                }
                "" => {}
                other => debug!("Ignoring input '{}'", other),
            }
        }
    });
}
