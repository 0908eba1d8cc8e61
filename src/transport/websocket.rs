//! WebSocket relay client
//!
//! Keeps one connection to the signaling relay, reconnecting after a delay
//! when it drops. Outbound envelopes are queued on an unbounded channel and
//! written by the connection task, so `send` never waits on the network.
//! Envelopes queued while disconnected are written after the next connect.

use super::codec::{EnvelopeCodec, RelayControl};
use super::{RelayFrame, SignalingRelay};
use crate::config::Config;
use crate::webrtc::signaling::OutboundEnvelope;
use crate::webrtc::CallError;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tungstenite::protocol::Message;

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay connection settings
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub url: String,
    pub channel: String,
    pub user_id: String,
    pub display_name: String,
    pub reconnect_delay: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.relay.url.clone(),
            channel: config.relay.channel.clone(),
            user_id: config.identity.user_id.clone(),
            display_name: config.identity.display_name.clone(),
            reconnect_delay: Duration::from_millis(config.relay.reconnect_delay_ms),
        }
    }

    fn join_frame(&self) -> Result<String, CallError> {
        EnvelopeCodec::encode_control(&RelayControl::Join {
            channel: self.channel.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
        })
    }

    fn leave_frame(&self) -> Result<String, CallError> {
        EnvelopeCodec::encode_control(&RelayControl::Leave {
            channel: self.channel.clone(),
            user_id: self.user_id.clone(),
        })
    }
}

enum ConnectionEnd {
    Disconnected,
    Shutdown,
}

/// Signaling relay reached over a WebSocket
pub struct WebSocketRelay {
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketRelay {
    /// Start the connection task. Decoded inbound frames arrive on the
    /// returned receiver.
    pub fn spawn(settings: RelaySettings) -> (Self, mpsc::UnboundedReceiver<RelayFrame>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(settings, outbound_rx, frames_tx, shutdown_rx));

        let relay = Self {
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            task: parking_lot::Mutex::new(Some(task)),
        };
        (relay, frames_rx)
    }

    /// Send `leave` and close the connection
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl SignalingRelay for WebSocketRelay {
    fn send(&self, envelope: OutboundEnvelope) -> Result<(), CallError> {
        let text = EnvelopeCodec::encode(&envelope)?;
        self.outbound
            .send(text)
            .map_err(|_| CallError::Relay("relay connection task stopped".to_string()))
    }
}

async fn run(
    settings: RelaySettings,
    mut outbound: mpsc::UnboundedReceiver<String>,
    frames: mpsc::UnboundedSender<RelayFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match tokio_tungstenite::connect_async(settings.url.as_str()).await {
            Ok((stream, _response)) => {
                info!("Connected to signaling relay {}", settings.url);
                match serve(stream, &settings, &mut outbound, &frames, &mut shutdown).await {
                    ConnectionEnd::Shutdown => break,
                    ConnectionEnd::Disconnected => {
                        warn!("Signaling relay connection lost");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to connect to signaling relay {}: {}", settings.url, e);
            }
        }

        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(settings.reconnect_delay) => {
                debug!("Reconnecting to signaling relay");
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Signaling relay client stopped");
}

async fn serve(
    stream: RelayStream,
    settings: &RelaySettings,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    frames: &mpsc::UnboundedSender<RelayFrame>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let (mut write, mut read) = stream.split();

    match settings.join_frame() {
        Ok(join) => {
            if let Err(e) = write.send(Message::Text(join.into())).await {
                error!("Failed to join channel {}: {}", settings.channel, e);
                return ConnectionEnd::Disconnected;
            }
            info!("Joined channel {} as {}", settings.channel, settings.user_id);
        }
        Err(e) => {
            error!("Failed to encode join frame: {}", e);
            return ConnectionEnd::Shutdown;
        }
    }

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        warn!("Relay write failed: {}", e);
                        return ConnectionEnd::Disconnected;
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => break,
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let text: &str = text.as_ref();
                    match EnvelopeCodec::decode(text) {
                        Ok(frame) => {
                            if frames.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping relay frame: {}", e),
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring binary relay frame ({} bytes)", data.len());
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Relay read failed: {}", e);
                    return ConnectionEnd::Disconnected;
                }
            },
        }
    }

    // Flush what the engine queued before leaving
    while let Ok(text) = outbound.try_recv() {
        if write.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    if let Ok(leave) = settings.leave_frame() {
        let _ = write.send(Message::Text(leave.into())).await;
    }
    let _ = write.close().await;
    info!("Left channel {}", settings.channel);
    ConnectionEnd::Shutdown
}
