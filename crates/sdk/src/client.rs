//! WebSocket peer client.
//!
//! One client owns one connection to one channel endpoint. Outbound
//! envelopes go through a writer task; inbound frames are first offered to
//! the correlation map (so `send_and_wait` replies never surface twice) and
//! everything unconsumed lands in the inbound queue for [`PeerClient::recv`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use switchboard_common::{
    envelope::{AgentRegister, ServiceRegister},
    Correlations, Envelope, MatchBy, Payload, Result, SwitchboardError,
};

/// How this peer registers itself after connecting.
#[derive(Debug, Clone)]
pub enum Registration {
    Agent {
        name: String,
        capabilities: Vec<String>,
    },
    Service {
        name: String,
        capabilities: Vec<String>,
    },
    McpServer {
        name: String,
        capabilities: Vec<String>,
    },
}

impl Registration {
    fn payload(&self) -> Payload {
        match self {
            Self::Agent { name, capabilities } => Payload::AgentRegister(AgentRegister {
                id: None,
                name: name.clone(),
                capabilities: capabilities.clone(),
                manifest: None,
            }),
            Self::Service { name, capabilities } => Payload::ServiceRegister(ServiceRegister {
                id: None,
                name: name.clone(),
                capabilities: capabilities.clone(),
                manifest: None,
            }),
            Self::McpServer { name, capabilities } => Payload::McpServerRegister(ServiceRegister {
                id: None,
                name: name.clone(),
                capabilities: capabilities.clone(),
                manifest: None,
            }),
        }
    }
}

/// Builder for [`PeerClient`].
pub struct PeerClientBuilder {
    url: String,
    registration: Option<Registration>,
    timeout: Duration,
    reconnect_delay: Duration,
    max_connect_attempts: u32,
}

impl PeerClientBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            registration: None,
            timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
            max_connect_attempts: 5,
        }
    }

    /// Register as an agent once connected.
    pub fn register_as_agent(
        mut self,
        name: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        self.registration = Some(Registration::Agent {
            name: name.into(),
            capabilities,
        });
        self
    }

    /// Register as a backend service once connected.
    pub fn register_as_service(
        mut self,
        name: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        self.registration = Some(Registration::Service {
            name: name.into(),
            capabilities,
        });
        self
    }

    /// Register as an MCP server once connected (client channel).
    pub fn register_as_mcp_server(
        mut self,
        name: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        self.registration = Some(Registration::McpServer {
            name: name.into(),
            capabilities,
        });
        self
    }

    /// Timeout applied to `send_and_wait` calls. Default 30s.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fixed delay between connection attempts. Default 2s.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Connection attempts before giving up. Default 5.
    pub fn max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts.max(1);
        self
    }

    /// Dial the endpoint, performing registration when configured.
    pub async fn connect(self) -> Result<PeerClient> {
        let mut client = PeerClient {
            url: self.url,
            registration: self.registration,
            timeout: self.timeout,
            reconnect_delay: self.reconnect_delay,
            max_connect_attempts: self.max_connect_attempts,
            correlations: Arc::new(Correlations::new()),
            generation: 0,
            registered_id: None,
            transport: None,
        };
        client.reconnect().await?;
        Ok(client)
    }
}

struct Transport {
    outbound: mpsc::UnboundedSender<Envelope>,
    inbound: mpsc::UnboundedReceiver<(Envelope, Payload)>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    /// Correlation owner tag for this connection generation
    owner: String,
}

/// A connected peer.
pub struct PeerClient {
    url: String,
    registration: Option<Registration>,
    timeout: Duration,
    reconnect_delay: Duration,
    max_connect_attempts: u32,
    correlations: Arc<Correlations>,
    generation: u64,
    registered_id: Option<String>,
    transport: Option<Transport>,
}

impl PeerClient {
    pub fn builder(url: impl Into<String>) -> PeerClientBuilder {
        PeerClientBuilder::new(url)
    }

    /// Id assigned by the orchestrator at registration, when registered.
    pub fn registered_id(&self) -> Option<&str> {
        self.registered_id.as_deref()
    }

    /// (Re)establish the connection with the configured fixed backoff,
    /// re-registering when a registration is configured. Pending waits on
    /// the previous connection fail with a connection-closed error.
    pub async fn reconnect(&mut self) -> Result<()> {
        if let Some(transport) = self.transport.take() {
            transport.reader.abort();
            transport.writer.abort();
            self.correlations.sweep_connection(&transport.owner);
        }
        self.generation += 1;
        let owner = format!("peer-{}", self.generation);

        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => break stream,
                Err(e) if attempt < self.max_connect_attempts => {
                    debug!(
                        url = %self.url,
                        attempt,
                        error = %e,
                        "Connect failed, retrying"
                    );
                    tokio::time::sleep(self.reconnect_delay).await;
                }
                Err(e) => {
                    return Err(SwitchboardError::Connection(format!(
                        "failed to connect to {} after {} attempts: {e}",
                        self.url, attempt
                    )))
                }
            }
        };
        info!(url = %self.url, "Connected");

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<(Envelope, Payload)>();

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

        let correlations = self.correlations.clone();
        let reader_owner = owner.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "WebSocket read error");
                        break;
                    }
                };
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Dropped malformed inbound envelope");
                        continue;
                    }
                };
                let Some(envelope) = correlations.resolve(envelope, &reader_owner) else {
                    continue;
                };
                let payload = match envelope.payload() {
                    Ok(payload) => payload,
                    Err(SwitchboardError::UnsupportedType { .. }) => Payload::Custom {
                        kind: envelope.kind.clone(),
                        content: envelope.content.clone(),
                    },
                    Err(e) => {
                        warn!(kind = %envelope.kind, error = %e, "Dropped undecodable envelope");
                        continue;
                    }
                };
                if inbound_tx.send((envelope, payload)).is_err() {
                    break;
                }
            }
            correlations.sweep_connection(&reader_owner);
        });

        self.transport = Some(Transport {
            outbound: outbound_tx,
            inbound: inbound_rx,
            reader,
            writer,
            owner,
        });

        if let Some(registration) = self.registration.clone() {
            let id = self.register(&registration).await?;
            info!(id = %id, "Registered with orchestrator");
            self.registered_id = Some(id);
        }
        Ok(())
    }

    async fn register(&mut self, registration: &Registration) -> Result<String> {
        let reply = self.request(&registration.payload()).await?;
        match reply.payload()? {
            Payload::AgentRegistered(content) => Ok(content.agent_id),
            Payload::ServiceRegistered(content) => Ok(content.service_id),
            Payload::McpServerRegistered(content) => Ok(content.service_id),
            Payload::Error(content) => Err(SwitchboardError::Protocol(content.message)),
            other => Err(SwitchboardError::Protocol(format!(
                "unexpected registration reply '{}'",
                other.kind()
            ))),
        }
    }

    fn transport(&self) -> Result<&Transport> {
        self.transport
            .as_ref()
            .ok_or(SwitchboardError::ConnectionClosed)
    }

    /// Fire-and-forget send.
    pub fn send(&self, payload: &Payload) -> Result<Envelope> {
        let envelope = Envelope::new(payload)?;
        self.send_envelope(envelope.clone())?;
        Ok(envelope)
    }

    /// Send a raw envelope without correlation.
    pub fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.transport()?
            .outbound
            .send(envelope)
            .map_err(|_| SwitchboardError::ConnectionClosed)
    }

    /// Send a request and await the reply that echoes its id.
    pub async fn request(&self, payload: &Payload) -> Result<Envelope> {
        let envelope = Envelope::new(payload)?;
        self.send_and_wait(envelope, MatchBy::RequestId).await
    }

    /// Send a request and await its reply per `match_by`, under the
    /// configured timeout. The pending entry never outlives the call.
    pub async fn send_and_wait(&self, envelope: Envelope, match_by: MatchBy) -> Result<Envelope> {
        let transport = self.transport()?;
        let key = Correlations::key_for(&envelope, &match_by);
        let kind = envelope.kind.clone();
        let rx = self
            .correlations
            .register(&envelope, &match_by, &transport.owner)?;

        if let Err(e) = self.send_envelope(envelope) {
            self.correlations.remove(&key);
            return Err(e);
        }
        self.correlations.wait(key, &kind, rx, self.timeout).await
    }

    /// Reply to a received envelope, echoing its id as `requestId`.
    pub fn reply(&self, request: &Envelope, payload: &Payload) -> Result<()> {
        self.send_envelope(Envelope::reply_to(&request.id, payload)?)
    }

    /// Next inbound envelope that was not consumed by a pending wait.
    pub async fn recv(&mut self) -> Option<(Envelope, Payload)> {
        self.transport.as_mut()?.inbound.recv().await
    }

    /// Drop the connection. Pending waits fail with connection-closed.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.reader.abort();
            transport.writer.abort();
            self.correlations.sweep_connection(&transport.owner);
            info!(url = %self.url, "Connection closed");
        }
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.close();
    }
}
