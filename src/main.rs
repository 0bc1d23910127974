use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use lumini::calls::{CallManager, CallManagerConfig, PeerLinkFactory};
use lumini::config::Config;
use lumini::media::simulated::SimulatedMediaDevices;
use lumini::relay::{FileDocumentStore, PollingRelay};
use lumini::{CallStatus, ConversationId, MediaKind};
use tokio::time::Instant;

// Two processes sharing a store directory can call each other:
//
//   lumini --store /tmp/calls --peer alice --conversation c1 listen --auto-answer
//   lumini --store /tmp/calls --peer bob --conversation c1 --hold 5 call --video

#[derive(Parser, Debug)]
#[command(name = "lumini", version, about = "Negotiate a call over a shared directory")]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory both participants use as their relay
    #[arg(long)]
    store: PathBuf,
    /// Local participant id
    #[arg(long)]
    peer: String,
    #[arg(long)]
    conversation: String,
    /// Hang up this many seconds after connecting
    #[arg(long)]
    hold: Option<u64>,
    /// Override the ring timeout in seconds; 0 rings forever
    #[arg(long)]
    ring_timeout: Option<u64>,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call the other participant
    Call {
        #[arg(long)]
        video: bool,
    },
    /// Wait for calls in the conversation
    Listen {
        #[arg(long)]
        auto_answer: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(run(cli))
}

async fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(secs) = cli.ring_timeout {
        config.call.ring_timeout_secs = (secs > 0).then_some(secs);
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.relay.poll_interval_ms = ms;
    }
    Ok(config)
}

#[cfg(feature = "webrtc")]
fn peer_links(_peer: &str) -> anyhow::Result<Arc<dyn PeerLinkFactory>> {
    Ok(Arc::new(lumini::calls::WebRtcPeerLinkFactory::new()?))
}

#[cfg(not(feature = "webrtc"))]
fn peer_links(peer: &str) -> anyhow::Result<Arc<dyn PeerLinkFactory>> {
    Ok(Arc::new(lumini::calls::SimulatedPeerLinkFactory::new(peer)))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli).await?;
    let store = FileDocumentStore::new(&cli.store)
        .await
        .with_context(|| format!("opening store {}", cli.store.display()))?;
    info!("Relay store at {}", store.base_path().display());
    let relay = Arc::new(PollingRelay::new(store, &config.relay));

    let manager = CallManager::new(
        cli.peer.as_str(),
        relay,
        Arc::new(SimulatedMediaDevices::new()),
        peer_links(&cli.peer)?,
        CallManagerConfig {
            call: config.call.clone(),
            ..Default::default()
        },
    );
    let conversation = ConversationId::from(cli.conversation.as_str());
    let session = manager.session(&conversation).await?;

    let mut status = session.events().status_changed.subscribe();
    let mut incoming = session.events().incoming_call.subscribe();
    let mut ended = session.events().call_ended.subscribe();
    let mut failed = session.events().call_failed.subscribe();

    let auto_answer = match cli.command {
        Command::Call { video } => {
            let kind = if video {
                MediaKind::Video
            } else {
                MediaKind::Audio
            };
            manager.start_call(&conversation, kind).await?;
            false
        }
        Command::Listen { auto_answer } => {
            info!("Listening for calls in {conversation} as {}", cli.peer);
            auto_answer
        }
    };
    let listening = matches!(cli.command, Command::Listen { .. });

    let hold = cli.hold.map(Duration::from_secs);
    let mut hang_up_at: Option<Instant> = None;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let at = hang_up_at;
        let deadline = async move {
            match at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, hanging up");
                break;
            }
            _ = deadline => {
                info!("Held the call for {}s, hanging up", hold.unwrap_or_default().as_secs());
                hang_up_at = None;
                session.hang_up().await;
            }
            Ok(change) = status.recv() => {
                info!("Call in {} is now {}", change.conversation_id, change.status);
                if change.status == CallStatus::Connected {
                    if let Ok(snapshot) = serde_json::to_string(&session.snapshot().await) {
                        debug!("{snapshot}");
                    }
                    hang_up_at = hold.map(|hold| Instant::now() + hold);
                }
            }
            Ok(call) = incoming.recv() => {
                info!("{} is calling ({})", call.caller, call.media_kind);
                if auto_answer {
                    if let Err(e) = manager.answer_call(&conversation).await {
                        warn!("Could not answer: {e}");
                    }
                } else {
                    info!("Not answering; Ctrl-C to decline");
                }
            }
            Ok(failure) = failed.recv() => {
                warn!("Call failed ({:?}): {}", failure.reason, failure.message);
            }
            Ok(end) = ended.recv() => {
                info!(
                    "Call ended: {:?}, connected for {}s",
                    end.reason,
                    end.duration_secs.unwrap_or(0)
                );
                hang_up_at = None;
                if !listening {
                    break;
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
