use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use loginwatch::alerting::{NotifyQueue, SessionNotifier};
use loginwatch::config::Config;
use loginwatch::input::{AsyncFileTailer, AsyncSyslogListener};
use loginwatch::models::{AuthEvent, AuthStatus};
use loginwatch::output::{OutputFormat, OutputHandler};
use loginwatch::persistence::SubscriberCache;
use loginwatch::tracking::Tracker;

const EVENT_QUEUE_SIZE: usize = 1024;

type InputError = Box<dyn Error + Send + Sync>;

/// Daemon entry point: tail the auth log and record every sshd event
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Load configuration
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config_found = config_path.exists();
    let config = if config_found {
        Config::from_file(&config_path)?
    } else {
        Config::default()
    };

    // Initialize logging; RUST_LOG wins over the configured level
    env_logger::Builder::new()
        .filter_level(config.log_filter())
        .parse_default_env()
        .init();

    log::info!("Starting loginwatch daemon...");
    if !config_found {
        log::warn!("Config file {:?} not found, using defaults", config_path);
    }

    // The store must open; nothing is recorded otherwise
    let db_path = config.db_path();
    let tracker = match Tracker::open(&db_path) {
        Ok(tracker) => Arc::new(tracker),
        Err(e) => {
            log::error!("Cannot open session store {:?}: {}", db_path, e);
            return Err(e.into());
        }
    };
    log::info!("Session store: {:?}", db_path);

    // Setup graceful shutdown signal handling
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        let _ = shutdown_tx.send(true);
    })?;

    let notify_queue = start_notifier(&config, &tracker)?;

    // Initialize output handler
    let mut output_handler = OutputHandler::new(
        OutputFormat::from_str(&config.output.format),
        config.output.file_path.clone(),
    )?;

    let (event_tx, mut event_rx) = mpsc::channel::<AuthEvent>(EVENT_QUEUE_SIZE);
    start_input(&config, event_tx)
        .await
        .map_err(|e| -> Box<dyn Error> { e })?;

    log::info!("Daemon running. Press Ctrl+C to stop.");

    // Main event processing loop
    loop {
        let event = tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => {
                    log::warn!("Input source stopped");
                    break;
                }
            },
        };

        if config.tracking.ignore_fails && event.status == AuthStatus::Failed {
            log::trace!("Ignoring failed attempt for {}", event.username);
            continue;
        }

        let status = event.status;
        let worker = Arc::clone(&tracker);
        let recorded = tokio::task::spawn_blocking(move || {
            let result = worker.record_event(&event);
            (event, result)
        })
        .await;

        let session = match recorded {
            Ok((_, Ok(session))) => session,
            Ok((event, Err(e))) => {
                log::warn!(
                    "Dropping {} event for {}@{}: {}",
                    event.status,
                    event.username,
                    event.remote_origin,
                    e
                );
                continue;
            }
            Err(e) => {
                log::error!("Recording task failed: {}", e);
                continue;
            }
        };

        if let Err(e) = output_handler.write_session(&session) {
            log::error!("Failed to write session: {}", e);
        }

        if status == AuthStatus::Accepted {
            if let Some(queue) = &notify_queue {
                queue.queue_session(session);
            }
        }
    }

    output_handler.flush()?;
    log::info!("loginwatch daemon stopped");
    Ok(())
}

/// Register configured webhooks and spawn the notifier, if enabled
fn start_notifier(config: &Config, tracker: &Tracker) -> Result<Option<NotifyQueue>, Box<dyn Error>> {
    if !config.alerting.enabled {
        return Ok(None);
    }

    let subscribers = Arc::new(SubscriberCache::new(Arc::clone(tracker.store())));
    for webhook in &config.alerting.webhooks {
        subscribers.upsert(webhook.to_subscriber())?;
        log::info!("Registered webhook subscriber {}", webhook.name);
    }

    let notifier = SessionNotifier::new(config.server.clone(), &config.alerting, subscribers);
    let (queue, rx) = SessionNotifier::create_channel(config.alerting.queue_size);
    tokio::spawn(notifier.run(rx));

    Ok(Some(queue))
}

/// Spawn the configured input source, feeding parsed events into `tx`
async fn start_input(config: &Config, tx: mpsc::Sender<AuthEvent>) -> Result<(), InputError> {
    match config.input.source_type.as_str() {
        "file" => {
            let path = config
                .input
                .file_path
                .clone()
                .ok_or("input.file_path is required for file input")?;
            let mut tailer = AsyncFileTailer::new(path.clone(), config.input.from_start)?;
            log::info!("Monitoring log file: {:?}", path);

            tokio::spawn(async move {
                if let Err(e) = tailer.run(tx).await {
                    log::error!("File tailer stopped: {}", e);
                }
            });
        }
        "syslog" => {
            let address = config
                .input
                .syslog_address
                .clone()
                .ok_or("input.syslog_address is required for syslog input")?;
            let mut listener = AsyncSyslogListener::new(&address).await?;
            log::info!("Listening on syslog: {}", address);

            tokio::spawn(async move {
                if let Err(e) = listener.run(tx).await {
                    log::error!("Syslog listener stopped: {}", e);
                }
            });
        }
        other => {
            return Err(format!("Unknown input source type: {}", other).into());
        }
    }

    Ok(())
}
