//! ClipBot - Entry Point
//!
//! Modes:
//! - Default: Telegram bot (runs download workers in-process when REDIS_URL is unset)
//! - --worker / -w: download worker consuming the Redis queue
//! - --recreate-db: drop and recreate the database tables

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use clipbot::{
    default_handlers, recover_interrupted, Config, ConversationStore, Dispatcher, DownloadWorker,
    MemoryTaskQueue, Messenger, RedisTaskQueue, Services, TaskQueue, TelegramMessenger,
    UpdatePoller, VideoSource, WorkerPool, YtDlp,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let worker_mode = args.iter().any(|a| a == "--worker" || a == "-w");
    let recreate_mode = args.iter().any(|a| a == "--recreate-db");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("ClipBot v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: clipbot [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --worker, -w       Run as download worker (requires REDIS_URL)");
        println!("  --recreate-db      Drop and recreate all tables, then exit");
        println!("  --help, -h         Show this help");
        println!();
        println!("Default: Run the Telegram bot");
        println!();
        println!("Environment variables:");
        println!("  TELEGRAM_BOT_TOKEN    Telegram bot token (or TELOXIDE_TOKEN)");
        println!("  CLIPBOT_DB_PATH       SQLite database path");
        println!("  REDIS_URL             Redis for the download queue (unset: in-process)");
        println!("  CLIPBOT_WORKER_SLOTS  Concurrent downloads per process (default: 1)");
        println!("  CLIPBOT_DOWNLOAD_DIR  Temporary download directory (default: videos)");
        println!("  CLIPBOT_MAX_FILE_MB   Largest file sent back (default: 50)");
        println!("  YTDLP_BIN             yt-dlp executable (default: yt-dlp)");
        return Ok(());
    }

    // Setup logging based on mode
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if worker_mode {
        // Headless worker - JSON to stderr
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;
    let store = Arc::new(ConversationStore::open(&config.db_path)?);

    if recreate_mode {
        store.recreate()?;
        info!("Database recreated at {}", config.db_path.display());
        return Ok(());
    }

    let shutdown = shutdown_signal();

    if worker_mode {
        info!("ClipBot Download Worker v{}", env!("CARGO_PKG_VERSION"));
        run_worker(config, store, shutdown).await
    } else {
        info!("ClipBot Telegram Bot v{}", env!("CARGO_PKG_VERSION"));
        run_bot(config, store, shutdown).await
    }
}

/// Flips to true on Ctrl-C
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = tx.send(true);
    });
    rx
}

async fn connect_messenger(config: &Config) -> anyhow::Result<Arc<dyn Messenger>> {
    let telegram = TelegramMessenger::new(config.require_token()?);
    telegram.connect().await?;
    Ok(Arc::new(telegram))
}

fn download_worker(
    config: &Config,
    store: Arc<ConversationStore>,
    messenger: Arc<dyn Messenger>,
    video: Arc<dyn VideoSource>,
    queue: Arc<dyn TaskQueue>,
) -> DownloadWorker {
    DownloadWorker::new(store, messenger, video, queue, "worker")
        .with_max_file_bytes(config.max_file_bytes)
}

async fn run_bot(
    config: Config,
    store: Arc<ConversationStore>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let messenger = connect_messenger(&config).await?;
    let video: Arc<dyn VideoSource> =
        Arc::new(YtDlp::new(config.ytdlp_bin.clone(), config.download_dir.clone()));

    let (queue, pool): (Arc<dyn TaskQueue>, Option<WorkerPool>) = match config.redis_queue() {
        Some(redis) => {
            info!("Publishing downloads to Redis stream {}", redis.stream);
            (Arc::new(RedisTaskQueue::connect(redis).await?), None)
        }
        None => {
            // Tasks queued before the restart are gone
            let recovered = recover_interrupted(&store, messenger.as_ref()).await?;
            if recovered > 0 {
                warn!("Reset {} conversation(s) with a lost download", recovered);
            }

            let queue: Arc<dyn TaskQueue> = Arc::new(MemoryTaskQueue::default());
            let worker = download_worker(
                &config,
                store.clone(),
                messenger.clone(),
                video.clone(),
                queue.clone(),
            );
            let pool = WorkerPool::spawn(&worker, config.worker_slots, shutdown.clone());
            info!("REDIS_URL not set, running {} in-process worker slot(s)", pool.len());
            (queue, Some(pool))
        }
    };

    let services = Services {
        store: store.clone(),
        messenger: messenger.clone(),
        video,
        queue,
    };
    let dispatcher = Arc::new(Dispatcher::with_handlers(
        store.clone(),
        default_handlers(&services),
    ));

    let poller = UpdatePoller::new(
        messenger,
        dispatcher,
        store,
        config.poll_timeout_secs,
        config.poll_idle,
    )?;
    poller.run(shutdown).await;

    if let Some(pool) = pool {
        pool.join().await;
    }
    Ok(())
}

async fn run_worker(
    config: Config,
    store: Arc<ConversationStore>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let Some(redis) = config.redis_queue() else {
        anyhow::bail!("--worker needs REDIS_URL; without it the bot runs workers in-process");
    };

    let messenger = connect_messenger(&config).await?;
    let video: Arc<dyn VideoSource> =
        Arc::new(YtDlp::new(config.ytdlp_bin.clone(), config.download_dir.clone()));
    let queue: Arc<dyn TaskQueue> = Arc::new(RedisTaskQueue::connect(redis).await?);

    let worker = download_worker(&config, store, messenger, video, queue);
    let pool = WorkerPool::spawn(&worker, config.worker_slots, shutdown);
    info!("Running {} worker slot(s)", pool.len());
    pool.join().await;
    Ok(())
}
