//! Channel listeners.
//!
//! The agent, client, and service endpoints are structurally identical:
//! one axum server per port, a plaintext health response on a plain GET of
//! the upgrade path, and a persistent WebSocket per peer. All three are
//! instances of the same [`ChannelServer`], differing only in their
//! [`Channel`] tag and accepted message types.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::ws::rejection::WebSocketUpgradeRejection,
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use switchboard_common::{
    envelope::Welcome, Correlations, Envelope, Payload, SwitchboardError,
};

use crate::bus::{Bus, BusEvent, Channel, ConnectionHandle};

#[derive(Clone)]
struct ChannelState {
    channel: Channel,
    bus: Bus,
    correlations: Arc<Correlations>,
}

/// One bound listening endpoint.
pub struct ChannelServer {
    pub channel: Channel,
    pub local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ChannelServer {
    /// Bind the channel on `addr` and start accepting peers. Returns once
    /// the listener is bound so callers can read the actual port.
    pub async fn bind(
        channel: Channel,
        addr: SocketAddr,
        bus: Bus,
        correlations: Arc<Correlations>,
    ) -> anyhow::Result<Self> {
        let state = ChannelState {
            channel,
            bus,
            correlations,
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let router = Router::new()
            .route("/", get(upgrade_or_health))
            .route("/ws", get(upgrade_or_health))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(channel = channel.name(), %local_addr, "Channel listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(channel = channel.name(), error = %e, "Channel server exited");
            }
        });

        Ok(Self {
            channel,
            local_addr,
            handle,
        })
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

/// Plain GETs get a trivial health line; upgrade requests get the
/// persistent message channel.
async fn upgrade_or_health(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<ChannelState>,
) -> Response {
    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_socket(state, socket))
            .into_response(),
        Err(_) => format!("{} channel ok\n", state.channel.name()).into_response(),
    }
}

async fn handle_socket(state: ChannelState, socket: WebSocket) {
    let connection_id = format!("conn_{}", uuid::Uuid::new_v4());
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let handle = ConnectionHandle::new(
        connection_id.clone(),
        state.channel,
        outbound_tx,
        state.correlations.clone(),
    );

    info!(
        channel = state.channel.name(),
        connection_id = %connection_id,
        "Peer connected"
    );

    let welcome = Payload::Welcome(Welcome {
        connection_id: connection_id.clone(),
        channel: state.channel.name().to_string(),
        message: format!("connected to switchboard {} channel", state.channel.name()),
    });
    match Envelope::new(&welcome) {
        Ok(envelope) => {
            let _ = handle.send(envelope);
        }
        Err(e) => warn!(error = %e, "Failed to build welcome envelope"),
    }

    state.bus.publish(BusEvent::Connected {
        handle: handle.clone(),
    });

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drain the outbound queue onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize outbound envelope");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader: one envelope per text frame.
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => process_frame(&state, &handle, &text),
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                let _ = handle.send(Envelope::error_reply(
                    None,
                    "binary frames are not supported",
                    Some("PROTOCOL_ERROR"),
                ));
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // No pending entry may outlive its connection.
    let swept = state.correlations.sweep_connection(&connection_id);
    if swept > 0 {
        debug!(connection_id = %connection_id, swept, "Swept pending correlations");
    }
    state.bus.publish(BusEvent::Disconnected {
        channel: state.channel,
        connection_id: connection_id.clone(),
    });
    writer.abort();

    info!(
        channel = state.channel.name(),
        connection_id = %connection_id,
        "Peer disconnected"
    );
}

/// Parse, correlate, validate, publish. Protocol and validation failures
/// are answered in place; the connection stays open.
fn process_frame(state: &ChannelState, handle: &ConnectionHandle, text: &str) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            let _ = handle.send(Envelope::error_reply(
                None,
                format!("malformed envelope: {e}"),
                Some("PROTOCOL_ERROR"),
            ));
            return;
        }
    };

    // A reply to an orchestrator-initiated wait never reaches the router.
    let Some(envelope) = state.correlations.resolve(envelope, &handle.id) else {
        return;
    };

    match envelope.payload() {
        Ok(payload) if state.channel.accepts(&envelope.kind) => {
            state.bus.publish(BusEvent::Inbound {
                channel: state.channel,
                connection_id: handle.id.clone(),
                payload,
                envelope,
            });
        }
        Ok(_) | Err(SwitchboardError::UnsupportedType { .. })
            if state.channel == Channel::Service =>
        {
            // Generic fallback: the service channel re-publishes anything it
            // does not recognize; the router warns when nothing consumes it.
            let payload = Payload::Custom {
                kind: envelope.kind.clone(),
                content: envelope.content.clone(),
            };
            state.bus.publish(BusEvent::Inbound {
                channel: state.channel,
                connection_id: handle.id.clone(),
                payload,
                envelope,
            });
        }
        Ok(payload) => {
            let _ = handle.send(Envelope::error_reply(
                Some(&envelope.id),
                format!(
                    "message type '{}' is not accepted on the {} channel",
                    payload.kind(),
                    state.channel.name()
                ),
                Some("UNSUPPORTED_TYPE"),
            ));
        }
        Err(e @ SwitchboardError::UnsupportedType { .. }) => {
            let _ = handle.send(Envelope::error_reply(
                Some(&envelope.id),
                e.to_string(),
                Some("UNSUPPORTED_TYPE"),
            ));
        }
        Err(e) => {
            let _ = handle.send(Envelope::error_reply(
                Some(&envelope.id),
                e.to_string(),
                Some(e.code()),
            ));
        }
    }
}
