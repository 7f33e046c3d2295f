//! PeerLink CLI: run one side of a call, inspect signaling messages.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use peerlink_common::PeerRole;
use peerlink_core::{
    LocalMedia, NegotiationConfig, SessionConfig, SessionController, SessionEvent, WebRtcBackend,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(about = "PeerLink peer-to-peer session tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Role {
    /// Sends the first offer
    Sender,
    /// Answers the sender's offer
    Receiver,
}

impl From<Role> for PeerRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Sender => PeerRole::Initiator,
            Role::Receiver => PeerRole::Responder,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a call through a rendezvous server. The sender places its offer
    /// once Enter is pressed (or stdin closes), so start the receiver first.
    Call {
        #[arg(long, value_enum)]
        role: Role,

        /// Signaling WebSocket URL
        #[arg(
            long,
            env = "PEERLINK_SIGNALING_URL",
            default_value = "ws://127.0.0.1:5520/websocket"
        )]
        url: String,

        /// STUN/TURN URIs, comma or semicolon separated
        #[arg(long = "ice-server", env = "PEERLINK_ICE_SERVERS")]
        ice_servers: Option<String>,

        /// Negotiation timeout in seconds, 0 to disable
        #[arg(long, env = "PEERLINK_NEGOTIATION_TIMEOUT_SECS")]
        timeout_secs: Option<String>,

        #[arg(long)]
        no_audio: bool,

        #[arg(long)]
        no_video: bool,
    },

    /// Decode a signaling message and print it
    Decode {
        /// Raw JSON text of one message
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    peerlink_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Call {
            role,
            url,
            ice_servers,
            timeout_secs,
            no_audio,
            no_video,
        } => {
            let mut negotiation = NegotiationConfig::default()
                .with_overrides(ice_servers.as_deref(), timeout_secs.as_deref())?;
            negotiation.local_media = LocalMedia {
                audio: !no_audio,
                video: !no_video,
            };
            let config = SessionConfig {
                role: role.into(),
                signaling_url: url,
                negotiation,
            };
            call(config).await?;
        }
        Command::Decode { text } => {
            let message = peerlink_common::decode(&text).map_err(peerlink_common::Error::from)?;
            println!("{:#?}", message);
        }
    }

    Ok(())
}

/// The sender's offer goes out only once it is registered and the user has
/// confirmed the receiver is up; the receiver never places one.
#[derive(Debug)]
struct CallGate {
    enabled: bool,
    registered: bool,
    confirmed: bool,
    placed: bool,
}

impl CallGate {
    fn new(role: PeerRole) -> Self {
        Self {
            enabled: role == PeerRole::Initiator,
            registered: false,
            confirmed: false,
            placed: false,
        }
    }

    fn waiting_for_user(&self) -> bool {
        self.enabled && !self.confirmed
    }

    fn on_registered(&mut self) -> bool {
        self.registered = true;
        self.try_place()
    }

    fn on_confirmed(&mut self) -> bool {
        self.confirmed = true;
        self.try_place()
    }

    fn try_place(&mut self) -> bool {
        if self.enabled && self.registered && self.confirmed && !self.placed {
            self.placed = true;
            return true;
        }
        false
    }
}

async fn call(config: SessionConfig) -> Result<()> {
    let role = config.role;
    let backend = Arc::new(WebRtcBackend::new()?);
    let (session, mut events) = SessionController::start(config, backend).await?;
    session.connect_remote().await?;

    let mut gate = CallGate::new(role);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    if gate.waiting_for_user() {
        println!("press Enter to call once the receiver is registered");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                session.hangup().await;
            }
            line = stdin.next_line(), if gate.waiting_for_user() => {
                if line?.is_none() {
                    info!("stdin closed, placing the call");
                }
                if gate.on_confirmed() {
                    session.start_call().await?;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Registered(identity) => {
                        info!("registered as {}", identity);
                        if gate.on_registered() {
                            session.start_call().await?;
                        }
                    }
                    SessionEvent::RemoteStreamAvailable(stream) => {
                        println!("remote {} track {} in stream {}", stream.kind, stream.track_id, stream.stream_id);
                    }
                    SessionEvent::NegotiationFailed(err) => {
                        error!("negotiation failed: {}", err);
                        session.hangup().await;
                        return Err(err.into());
                    }
                    SessionEvent::Ended { reason } => {
                        info!("session ended: {}", reason);
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_waits_for_confirmation() {
        let mut gate = CallGate::new(PeerRole::Initiator);
        assert!(gate.waiting_for_user());
        assert!(!gate.on_registered());
        assert!(gate.on_confirmed());
        assert!(!gate.waiting_for_user());
        assert!(!gate.on_confirmed());
    }

    #[test]
    fn test_early_confirmation_waits_for_registration() {
        let mut gate = CallGate::new(PeerRole::Initiator);
        assert!(!gate.on_confirmed());
        assert!(gate.on_registered());
        assert!(!gate.on_registered());
    }

    #[test]
    fn test_receiver_never_places_offer() {
        let mut gate = CallGate::new(PeerRole::Responder);
        assert!(!gate.waiting_for_user());
        assert!(!gate.on_registered());
        assert!(!gate.on_confirmed());
    }
}
