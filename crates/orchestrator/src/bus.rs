//! The internal event bus and connection handles.
//!
//! Listeners never touch the registries. They publish typed [`BusEvent`]s
//! into the router's mailbox and receive outbound envelopes through a
//! [`ConnectionHandle`], which is what keeps the three listeners
//! independent, replaceable units.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use switchboard_common::{
    Correlations, Envelope, MatchBy, Payload, Result, SwitchboardError,
};

/// Which listening endpoint a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Agent,
    Client,
    Service,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Client => "client",
            Self::Service => "service",
        }
    }

    /// Message types each channel accepts from its peers. Anything else is
    /// answered with an `error` envelope, except on the service channel
    /// where unknown types fall through to the bus as custom events.
    pub fn accepts(&self, kind: &str) -> bool {
        let list: &[&str] = match self {
            Self::Agent => &[
                "agent.register",
                "agent.request",
                "service.request",
                "task.result",
                "task.error",
                "task.notification",
                "ping",
            ],
            Self::Client => &[
                "task.create",
                "task.status",
                "agent.list",
                "mcp.server.list",
                "mcp.server.register",
                "ping",
            ],
            Self::Service => &[
                "service.register",
                "service.status.update",
                "service.task.result",
                "service.task.notification",
                "service.error",
                "ping",
            ],
        };
        list.contains(&kind)
    }
}

/// Events flowing from the listeners (and spawned delegation tasks) into
/// the router.
#[derive(Debug)]
pub enum BusEvent {
    Connected {
        handle: ConnectionHandle,
    },
    Inbound {
        channel: Channel,
        connection_id: String,
        envelope: Envelope,
        payload: Payload,
    },
    Disconnected {
        channel: Channel,
        connection_id: String,
    },
    /// A spawned delegation or dispatch finished; the router applies the
    /// registry transition on its own thread of control.
    TaskFinished {
        task_id: String,
        outcome: TaskOutcome,
    },
}

/// Terminal outcome reported back to the router by a spawned wait.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed(serde_json::Value),
    Failed(serde_json::Value),
}

/// Publishing side of the router mailbox.
#[derive(Clone)]
pub struct Bus {
    tx: mpsc::UnboundedSender<BusEvent>,
}

impl Bus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: BusEvent) {
        if self.tx.send(event).is_err() {
            debug!("bus receiver dropped, event discarded");
        }
    }
}

/// Outbound side of one peer connection: a writer queue plus the shared
/// correlation map. Cheap to clone; the socket task owns the other end.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub channel: Channel,
    outbound: mpsc::UnboundedSender<Envelope>,
    correlations: Arc<Correlations>,
}

impl ConnectionHandle {
    pub fn new(
        id: impl Into<String>,
        channel: Channel,
        outbound: mpsc::UnboundedSender<Envelope>,
        correlations: Arc<Correlations>,
    ) -> Self {
        Self {
            id: id.into(),
            channel,
            outbound,
            correlations,
        }
    }

    pub fn correlations(&self) -> &Arc<Correlations> {
        &self.correlations
    }

    /// Queue an envelope for delivery. Fails when the connection is gone.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .map_err(|_| SwitchboardError::ConnectionClosed)
    }

    /// Send a request and await its reply. The pending entry is removed on
    /// reply, timeout, or connection close, whichever happens first; a send
    /// failure removes it immediately.
    pub async fn send_and_wait(
        &self,
        envelope: Envelope,
        match_by: MatchBy,
        timeout: Duration,
    ) -> Result<Envelope> {
        let key = Correlations::key_for(&envelope, &match_by);
        let kind = envelope.kind.clone();
        let rx = self.correlations.register(&envelope, &match_by, &self.id)?;

        if let Err(e) = self.send(envelope) {
            self.correlations.remove(&key);
            return Err(e);
        }

        self.correlations.wait(key, &kind, rx, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_common::envelope::PingPong;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(
            "conn-1",
            Channel::Agent,
            tx,
            Arc::new(Correlations::new()),
        );
        (handle, rx)
    }

    #[test]
    fn test_channel_accept_lists() {
        assert!(Channel::Agent.accepts("agent.register"));
        assert!(Channel::Agent.accepts("service.request"));
        assert!(!Channel::Agent.accepts("task.create"));

        assert!(Channel::Client.accepts("task.create"));
        assert!(Channel::Client.accepts("mcp.server.register"));
        assert!(!Channel::Client.accepts("service.register"));

        assert!(Channel::Service.accepts("service.task.result"));
        assert!(!Channel::Service.accepts("agent.register"));
    }

    #[test]
    fn test_connection_handle_is_debug_printable() {
        let (handle, _outbound) = handle();
        let text = format!("{handle:?}");
        assert!(text.contains("conn-1"));
        assert!(text.contains("pending: 0"));
    }

    #[tokio::test]
    async fn test_send_and_wait_round_trip() {
        let (handle, mut outbound) = handle();
        let request = Envelope::new(&Payload::Ping(PingPong::default())).unwrap();
        let correlations = handle.correlations().clone();

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .send_and_wait(request, MatchBy::RequestId, Duration::from_secs(1))
                    .await
            }
        });

        let sent = outbound.recv().await.unwrap();
        let reply = Envelope::reply_to(&sent.id, &Payload::Pong(PingPong::default())).unwrap();
        assert!(correlations.resolve(reply, "conn-1").is_none());

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.kind, "pong");
        assert_eq!(correlations.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_cleans_pending_entry() {
        let (handle, outbound) = handle();
        drop(outbound);
        let request = Envelope::new(&Payload::Ping(PingPong::default())).unwrap();
        let correlations = handle.correlations().clone();

        let err = handle
            .send_and_wait(request, MatchBy::RequestId, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::ConnectionClosed));
        assert_eq!(correlations.pending_count(), 0);
    }
}
