//! Switchboard orchestrator.
//!
//! Three WebSocket listeners (agent, client, service), one router task that
//! owns all registries, and a shared correlation map for request/response
//! pairing. Peers speak the JSON envelope protocol from
//! [`switchboard_common`].

pub mod bus;
pub mod channel;
pub mod config;
pub mod registry;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use switchboard_common::Correlations;

use crate::bus::{Bus, Channel};
use crate::channel::ChannelServer;
use crate::config::OrchestratorConfig;
use crate::router::Router;

/// A running orchestrator: three bound listeners plus the router task.
pub struct Orchestrator {
    agent_server: ChannelServer,
    client_server: ChannelServer,
    service_server: ChannelServer,
    router: JoinHandle<()>,
}

impl Orchestrator {
    /// Bind all three channels and start routing. Returns once every
    /// listener is bound, so port 0 in the config resolves to real ports.
    pub async fn start(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let (bus, rx) = Bus::new();
        let correlations = Arc::new(Correlations::new());
        let router = Router::spawn(config.clone(), bus.clone(), rx);

        let agent_server = ChannelServer::bind(
            Channel::Agent,
            config.agent_addr()?,
            bus.clone(),
            correlations.clone(),
        )
        .await?;
        let client_server = ChannelServer::bind(
            Channel::Client,
            config.client_addr()?,
            bus.clone(),
            correlations.clone(),
        )
        .await?;
        let service_server = ChannelServer::bind(
            Channel::Service,
            config.service_addr()?,
            bus,
            correlations,
        )
        .await?;

        info!(
            agent = %agent_server.local_addr,
            client = %client_server.local_addr,
            service = %service_server.local_addr,
            "Switchboard orchestrator started"
        );

        Ok(Self {
            agent_server,
            client_server,
            service_server,
            router,
        })
    }

    pub fn agent_addr(&self) -> SocketAddr {
        self.agent_server.local_addr
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_server.local_addr
    }

    pub fn service_addr(&self) -> SocketAddr {
        self.service_server.local_addr
    }

    /// Stop the listeners and the router. In-flight connections drop.
    pub fn shutdown(&self) {
        self.agent_server.shutdown();
        self.client_server.shutdown();
        self.service_server.shutdown();
        self.router.abort();
        info!("Switchboard orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
