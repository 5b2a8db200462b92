use clap::{Args, Parser, Subcommand};
use duet_call_core::call::manager::PollIntervals;
use duet_call_core::call::{CallError, CallManager, Notice, NoticeReceiver, notice_channel};
use duet_call_core::config::Config;
use duet_call_core::media::SyntheticCapture;
use duet_call_core::store::{CallType, HttpCallStore, StoreConfig, StoreError};
use duet_call_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use duet_call_core::transport::webrtc::{WebRtcConfig, WebRtcConnector};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = Config::from_env();
    config.store_url = cli.store_url.clone();

    match cli.command {
        Command::Call(args) => handle_call(&config, &cli.user, args).await,
        Command::Listen(args) => handle_listen(&config, &cli.user, args).await,
        Command::History => handle_history(&config).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "duet",
    about = "Paired voice/video calling over WebRTC with store-polled signaling",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "DUET_STORE_URL",
        default_value = duet_call_core::config::DEFAULT_STORE_URL,
        help = "Base URL for the call-session store"
    )]
    store_url: String,

    #[arg(
        long,
        global = true,
        env = "DUET_USER_ID",
        default_value = "",
        help = "Identity of the local user"
    )]
    user: String,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "DUET_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "DUET_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Place a call to another user and stay on it until it ends
    Call(CallArgs),
    /// Wait for incoming calls and answer them
    Listen(ListenArgs),
    /// Print the call history recorded by the store
    History,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// User id to call
    receiver: String,

    /// Place a video call instead of voice
    #[arg(long)]
    video: bool,
}

#[derive(Args, Debug)]
struct ListenArgs {
    /// Decline every incoming call instead of accepting
    #[arg(long)]
    decline: bool,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("logging setup failed: {0}")]
    Logging(String),
    #[error("a local user id is required (--user or DUET_USER_ID)")]
    MissingUser,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Call(#[from] CallError),
}

fn build_manager(
    config: &Config,
    user: &str,
) -> Result<(Arc<CallManager>, NoticeReceiver), CliError> {
    if user.trim().is_empty() {
        return Err(CliError::MissingUser);
    }
    let store = Arc::new(HttpCallStore::new(StoreConfig::new(&config.store_url)?)?);
    let connector = Arc::new(WebRtcConnector::new(WebRtcConfig {
        stun_servers: config.stun_servers.clone(),
    }));
    let (notices, notice_rx) = notice_channel();
    let manager = CallManager::new(
        store,
        connector,
        Arc::new(SyntheticCapture),
        user,
        notices,
        PollIntervals {
            discovery: config.discovery_interval,
            engaged: config.engaged_interval,
        },
    );
    Ok((manager, notice_rx))
}

async fn handle_call(config: &Config, user: &str, args: CallArgs) -> Result<(), CliError> {
    let (manager, mut notices) = build_manager(config, user)?;
    let call_type = if args.video {
        CallType::Video
    } else {
        CallType::Voice
    };
    let session_id = manager.start_call(&args.receiver, call_type).await?;
    println!("📞 calling {} ({call_type}, session {session_id})", args.receiver);

    loop {
        tokio::select! {
            notice = notices.recv() => {
                let Some(notice) = notice else { break };
                match notice {
                    Notice::Incoming(_) => {}
                    Notice::Connected { session_id } => {
                        println!("✅ connected (session {session_id})");
                    }
                    Notice::Ended { reason, .. } => {
                        println!("☎️  call ended: {reason:?}");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("hanging up");
                // NoCall just means the far side beat us to it.
                match manager.hang_up().await {
                    Ok(()) | Err(CallError::NoCall) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
    Ok(())
}

async fn handle_listen(config: &Config, user: &str, args: ListenArgs) -> Result<(), CliError> {
    let (manager, mut notices) = build_manager(config, user)?;
    manager.start_discovery();
    println!("👂 waiting for calls to {user} (ctrl-c to quit)");

    loop {
        tokio::select! {
            notice = notices.recv() => {
                let Some(notice) = notice else { break };
                match notice {
                    Notice::Incoming(session) => {
                        println!(
                            "🔔 incoming {} call from {} (session {})",
                            session.call_type, session.caller_id, session.id
                        );
                        let outcome = if args.decline {
                            manager.decline(&session.id).await
                        } else {
                            manager.accept(&session.id).await
                        };
                        if let Err(err) = outcome {
                            eprintln!("could not answer: {err}");
                        }
                    }
                    Notice::Connected { session_id } => {
                        println!("✅ connected (session {session_id})");
                    }
                    Notice::Ended { session_id, reason } => {
                        match session_id {
                            Some(id) => println!("☎️  call {id} ended: {reason:?}"),
                            None => println!("☎️  call ended: {reason:?}"),
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                match manager.hang_up().await {
                    Ok(()) | Err(CallError::NoCall) => {}
                    Err(err) => eprintln!("hangup failed: {err}"),
                }
                break;
            }
        }
    }
    manager.stop_discovery();
    Ok(())
}

async fn handle_history(config: &Config) -> Result<(), CliError> {
    let store = HttpCallStore::new(StoreConfig::new(&config.store_url)?)?;
    let entries = duet_call_core::store::CallStore::get_call_history(&store).await?;
    if entries.is_empty() {
        println!("no calls recorded");
        return Ok(());
    }
    for entry in entries {
        let when = OffsetDateTime::from_unix_timestamp(entry.timestamp)
            .ok()
            .and_then(|ts| ts.format(&Rfc3339).ok())
            .unwrap_or_else(|| entry.timestamp.to_string());
        println!(
            "{when}  {:>8}  {:>5}  {} -> {}  {}s",
            entry.status, entry.call_type, entry.caller_id, entry.receiver_id, entry.duration_seconds
        );
    }
    Ok(())
}
