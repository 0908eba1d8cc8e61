//! meshcall-core - Main entry point
//!
//! Joins one channel through the WebSocket signaling relay and keeps a mesh
//! of peer connections to everyone else in it until Ctrl-C.

use clap::Parser;
use log::{debug, error, info, warn};
use meshcall_core::args::Args;
use meshcall_core::config::Config;
use meshcall_core::transport::{forward_frames, RelaySettings, WebSocketRelay};
use meshcall_core::webrtc::{
    CallEngine, CallEvent, EngineSettings, LocalMediaSource, RemoteTrack, TransportFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Config is read before logging so its level can seed the filter
    let loaded = args.load_config();
    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        loaded
            .as_ref()
            .map(|cfg| cfg.logging.level.clone())
            .unwrap_or_else(|_| "info".to_string())
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("MESHCALL_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_sctp", log::LevelFilter::Error)
        .init();

    info!("meshcall-core v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            let mut cfg = Config::default();
            args.apply_overrides(&mut cfg);
            cfg
        }
    };

    if config.identity.user_id.is_empty() {
        config.identity.user_id = uuid::Uuid::new_v4().to_string();
        info!("Generated user id {}", config.identity.user_id);
    }
    if config.identity.display_name.is_empty() {
        config.identity.display_name = config.identity.user_id.clone();
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let (factory, media) = build_media(&config)?;

    // Connect to the relay
    let (relay, frames) = WebSocketRelay::spawn(RelaySettings::from_config(&config));
    let relay = Arc::new(relay);

    let (handle, events) = CallEngine::spawn(
        EngineSettings::from_config(&config),
        relay.clone(),
        factory,
        media,
    );
    tokio::spawn(forward_frames(frames, handle.clone()));
    tokio::spawn(log_events(events));

    info!(
        "Joined channel {} as {} ({})",
        config.relay.channel, config.identity.display_name, config.identity.user_id
    );

    // Wait for shutdown signal, logging the roster now and then
    let mut roster_interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = roster_interval.tick() => match handle.roster().await {
                Ok(sessions) => {
                    debug!("{} peer session(s)", sessions.len());
                    for session in sessions {
                        debug!(
                            "  {} ({}): {} {} {}",
                            session.user_id,
                            session.display_name,
                            session.status.negotiation_state.as_str(),
                            session.status.connectivity.as_str(),
                            session.status.health.as_str()
                        );
                    }
                }
                Err(e) => {
                    error!("Call engine stopped: {}", e);
                    break;
                }
            },
        }
    }

    if let Err(e) = handle.leave().await {
        warn!("Failed to leave call cleanly: {}", e);
    }
    relay.close().await;

    info!("meshcall-core stopped");
    Ok(())
}

/// Local tracks published to every peer; capture is outside this binary
#[cfg(feature = "webrtc-transport")]
fn build_media(
    config: &Config,
) -> Result<(Arc<dyn TransportFactory>, LocalMediaSource), Box<dyn std::error::Error>> {
    use meshcall_core::webrtc::rtc_transport::{LocalTrackBank, RtcTransportFactory};
    use meshcall_core::webrtc::MediaKind;

    let bank = LocalTrackBank::new();
    let media = LocalMediaSource::new();
    let stream_id = config.identity.user_id.as_str();
    if config.webrtc.send_audio {
        let (track, _rtp) = bank.create_track(MediaKind::Audio, stream_id);
        info!("Publishing audio track {}", track.id);
        media.add_track(track);
    }
    if config.webrtc.send_video {
        let (track, _rtp) = bank.create_track(MediaKind::Video, stream_id);
        info!("Publishing video track {}", track.id);
        media.add_track(track);
    }

    let factory: Arc<dyn TransportFactory> = Arc::new(RtcTransportFactory::new(config.webrtc.clone(), bank));
    Ok((factory, media))
}

#[cfg(not(feature = "webrtc-transport"))]
fn build_media(
    _config: &Config,
) -> Result<(Arc<dyn TransportFactory>, LocalMediaSource), Box<dyn std::error::Error>> {
    Err(Box::new(meshcall_core::CallError::FeatureDisabled))
}

async fn log_events(mut events: mpsc::UnboundedReceiver<CallEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            CallEvent::RemoteTrackAdded { user_id, track } => {
                info!("Remote {} track {} from {}", track.kind, track.id, user_id);
                tokio::spawn(watch_remote_track(user_id, track));
            }
            CallEvent::ParticipantConnectivityChanged { user_id, state } => {
                info!("Participant {} is {}", user_id, state.as_str());
            }
            CallEvent::ConnectivityError { user_id, message } => {
                warn!("Connectivity error with {}: {}", user_id, message);
            }
        }
    }
}

/// Drain a remote track, logging when media first flows
async fn watch_remote_track(user_id: String, track: RemoteTrack) {
    let mut packets: u64 = 0;
    loop {
        match track.read_packet().await {
            Ok(payload) => {
                if packets == 0 {
                    info!(
                        "First {} packet from {} ({} bytes)",
                        track.kind,
                        user_id,
                        payload.len()
                    );
                }
                packets += 1;
            }
            Err(e) => {
                debug!("Remote track {} from {} ended after {} packets: {}", track.id, user_id, packets, e);
                return;
            }
        }
    }
}
