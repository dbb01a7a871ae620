use std::path::{Path, PathBuf};
use std::sync::Arc;
use structopt::StructOpt;

use loginwatch::config::Config;
use loginwatch::input::FileTailer;
use loginwatch::output::{OutputFormat, OutputHandler};
use loginwatch::persistence::subscribers::{Subscriber, SubscriberKind};
use loginwatch::persistence::{Store, SubscriberCache};
use loginwatch::tracking::Tracker;

/// loginwatch command line interface
#[derive(StructOpt, Debug)]
#[structopt(name = "loginwatch", about = "Query and maintain the loginwatch session store")]
pub struct Cli {
    /// Path to configuration file
    #[structopt(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Output format: json, jsonl or console (defaults to the configured one)
    #[structopt(short, long)]
    format: Option<String>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Show aggregate statistics
    Stats,
    /// List every session of a user
    Sessions {
        user: String,
    },
    /// Show one session
    Session {
        user: String,
        /// Remote origin; omit for sessions without one
        origin: Option<String>,
    },
    /// Check the stored statistics against the stored sessions
    Verify,
    /// Parse and display sshd events from a log file
    Parse {
        /// Path to log file
        #[structopt(short, long)]
        file: PathBuf,
        /// Number of events to show
        #[structopt(short, long, default_value = "10")]
        lines: usize,
    },
    /// List notification subscribers
    Subscribers,
    /// Add or replace a notification subscriber
    Subscribe {
        name: String,
        url: String,
        /// Payload kind: generic, slack or discord
        #[structopt(short, long, default_value = "generic")]
        kind: SubscriberKind,
    },
    /// Remove a notification subscriber
    Unsubscribe {
        name: String,
    },
    /// Stop notifying a subscriber
    Mute {
        name: String,
    },
    /// Resume notifying a subscriber
    Unmute {
        name: String,
    },
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let cli = Cli::from_args();

    if let Command::Config { output } = &cli.command {
        Config::default().to_file(output)?;
        println!("Default configuration written to: {:?}", output);
        return Ok(());
    }

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        log::info!("Config file {:?} not found, using defaults", cli.config);
        Config::default()
    };

    let format = OutputFormat::from_str(cli.format.as_deref().unwrap_or(&config.output.format));
    let mut output = OutputHandler::new(format, None)?;

    if let Command::Parse { file, lines } = &cli.command {
        if !file.exists() {
            eprintln!("File not found: {:?}", file);
            std::process::exit(1);
        }

        let mut tailer = FileTailer::new(file.clone())?.from_start(true);
        let events = tailer.read_events()?;
        let display_count = std::cmp::min(*lines, events.len());

        println!("Parsed {} event(s) (showing {}):\n", events.len(), display_count);
        for event in events.iter().take(display_count) {
            println!(
                "  {} User: {}, Origin: {}, Method: {}, Timestamp: {}",
                event.status,
                event.username,
                event.remote_origin,
                event.auth_method.as_deref().unwrap_or("-"),
                event.timestamp
            );
        }
        return Ok(());
    }

    let db_path = config.db_path();

    match cli.command {
        Command::Stats => {
            let tracker = Tracker::open_read_only(&db_path)?;
            output.write_stats(&tracker.stats()?)?;
        }
        Command::Sessions { user } => {
            let tracker = Tracker::open_read_only(&db_path)?;
            let sessions = tracker.user_sessions(&user)?;
            if sessions.is_empty() {
                eprintln!("No sessions for {}", user);
            }
            for session in sessions.values() {
                output.write_session(session)?;
            }
        }
        Command::Session { user, origin } => {
            let tracker = Tracker::open_read_only(&db_path)?;
            let session = tracker.session(&user, origin.as_deref().unwrap_or(""))?;
            if session.is_empty() {
                eprintln!("No session for {}@{}", user, origin.unwrap_or_default());
                std::process::exit(1);
            }
            output.write_session(&session)?;
        }
        Command::Verify => {
            let report = Tracker::open_read_only(&db_path)?.verify()?;
            output.write_consistency(&report)?;
            if !report.is_consistent() {
                std::process::exit(2);
            }
        }
        Command::Subscribers => {
            let subscribers = SubscriberCache::new(Arc::new(Store::open_read_only(&db_path)?));
            for subscriber in subscribers.all()?.iter() {
                println!(
                    "{} {} ({:?}){}",
                    subscriber.name,
                    subscriber.url,
                    subscriber.kind,
                    if subscriber.muted { " [muted]" } else { "" }
                );
            }
        }
        Command::Subscribe { name, url, kind } => {
            let subscribers = SubscriberCache::new(Arc::new(Store::open(&db_path)?));
            subscribers.upsert(Subscriber::new(name.clone(), url, kind))?;
            println!("Subscribed {}", name);
        }
        Command::Unsubscribe { name } => {
            let subscribers = SubscriberCache::new(Arc::new(Store::open(&db_path)?));
            if !subscribers.remove(&name)? {
                eprintln!("No subscriber named {}", name);
                std::process::exit(1);
            }
            println!("Removed {}", name);
        }
        Command::Mute { name } => set_muted(&db_path, &name, true)?,
        Command::Unmute { name } => set_muted(&db_path, &name, false)?,
        Command::Parse { .. } | Command::Config { .. } => {}
    }

    output.flush()?;
    Ok(())
}

fn set_muted(db_path: &Path, name: &str, muted: bool) -> Result<(), Box<dyn std::error::Error>> {
    let subscribers = SubscriberCache::new(Arc::new(Store::open(db_path)?));
    if !subscribers.set_muted(name, muted)? {
        eprintln!("No subscriber named {}", name);
        std::process::exit(1);
    }
    println!("{} {}", if muted { "Muted" } else { "Unmuted" }, name);
    Ok(())
}
