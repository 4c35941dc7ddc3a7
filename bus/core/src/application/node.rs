// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mesh Node - composition root for one broker domain
//!
//! [`MeshNode::build`] wires every service from a [`MeshConfigManifest`] and a
//! substrate backend; [`MeshNode::start`] connects and launches the background
//! tasks (ack listener, domain gateway, broadcast observer, sweeper) and resumes
//! persisted cross-domain deliveries. A node with `spec.node.gateway: false`
//! skips the gateway so an agent process can share a domain with its gateway
//! node over a broker. All tasks stop on [`MeshNode::shutdown`].

use anyhow::{Context, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::circuit_breakers::CircuitBreakerRegistry;
use crate::application::correlation::ReplyCorrelator;
use crate::application::dead_letter::DeadLetterManager;
use crate::application::gateway::DomainGateway;
use crate::application::help::HelpRequestManager;
use crate::application::registry::AgentRegistry;
use crate::application::router::MessageRouter;
use crate::application::store_forward::StoreForwardEngine;
use crate::application::sweeper::{MaintenanceSweeper, SweepReport};
use crate::domain::agent::{AgentId, DomainId, Presence};
use crate::domain::mesh_config::MeshConfigManifest;
use crate::domain::message::{Message, MessageType};
use crate::domain::transport::{ByteStream, Channels, PubSubBackend, TransportError};
use crate::infrastructure::codec::JsonCodec;
use crate::infrastructure::domain_link::PubSubDomainLink;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::repositories::build_repositories;
use crate::infrastructure::transport::ConnectionManager;

pub struct MeshNode {
    config: MeshConfigManifest,
    domain: DomainId,
    channels: Channels,
    event_bus: EventBus,
    connection: Arc<ConnectionManager>,
    registry: Arc<AgentRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    dead_letters: Arc<DeadLetterManager>,
    store_forward: Arc<StoreForwardEngine>,
    router: Arc<MessageRouter>,
    help: Arc<HelpRequestManager>,
    replies: ReplyCorrelator,
    link: Arc<PubSubDomainLink>,
    gateway: Arc<DomainGateway>,
    sweeper: Arc<MaintenanceSweeper>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    pub fn build(config: MeshConfigManifest, backend: Arc<dyn PubSubBackend>) -> Result<Arc<Self>> {
        config.validate().context("Configuration validation failed")?;

        let spec = &config.spec;
        let domain = config.domain();
        let channels = config.channels();
        let shutdown = CancellationToken::new();
        let event_bus = EventBus::with_default_capacity();

        let connection = Arc::new(ConnectionManager::new(
            backend,
            spec.transport.reconnect.clone(),
            spec.transport.ping_timeout,
        ));
        let registry = Arc::new(AgentRegistry::new(
            domain.clone(),
            spec.registry.trust_policy(),
            spec.registry.liveness_window,
            event_bus.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            spec.circuit_breaker.clone(),
            event_bus.clone(),
        ));

        let (store_forward_repo, dead_letter_repo) = build_repositories(&spec.store_forward.storage_backend())
            .context("Failed to open delivery state storage")?;

        let dead_letters = Arc::new(DeadLetterManager::new(
            dead_letter_repo,
            registry.clone(),
            event_bus.clone(),
            spec.dead_letter.replay_limit,
        ));
        let link = Arc::new(PubSubDomainLink::new(
            connection.clone(),
            channels.clone(),
            domain.clone(),
            spec.store_forward.ack_timeout,
        ));
        let store_forward = Arc::new(StoreForwardEngine::new(
            store_forward_repo,
            link.clone(),
            breakers.clone(),
            dead_letters.clone(),
            event_bus.clone(),
            spec.store_forward.clone(),
            shutdown.child_token(),
        ));
        let router = Arc::new(MessageRouter::new(
            connection.clone(),
            channels.clone(),
            domain.clone(),
            registry.clone(),
            store_forward.clone(),
        ));
        let help = Arc::new(HelpRequestManager::new(
            registry.clone(),
            router.clone(),
            event_bus.clone(),
            spec.help.default_timeout_minutes,
        ));
        let gateway = Arc::new(DomainGateway::new(
            connection.clone(),
            channels.clone(),
            domain.clone(),
            router.clone(),
        ));
        let sweeper = Arc::new(MaintenanceSweeper::new(
            help.clone(),
            registry.clone(),
            connection.clone(),
            dead_letters.clone(),
            store_forward.clone(),
            router.clone(),
            spec.sweeper.interval,
            spec.dead_letter.batch_size,
            shutdown.child_token(),
        ));

        info!(
            name = %config.metadata.name,
            domain = %domain,
            backend = connection.backend_name(),
            "Mesh node built"
        );

        Ok(Arc::new(Self {
            config,
            domain,
            channels,
            event_bus,
            connection,
            registry,
            breakers,
            dead_letters,
            store_forward,
            router,
            help,
            replies: ReplyCorrelator::new(),
            link,
            gateway,
            sweeper,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Connects to the substrate and starts every background task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.connection
            .connect()
            .await
            .context("Failed to connect to the pub/sub substrate")?;

        let ack_listener = self
            .link
            .start(self.shutdown.child_token())
            .await
            .context("Failed to subscribe to the ack channel")?;
        let gateway = if self.config.spec.node.gateway {
            Some(
                self.gateway
                    .clone()
                    .start(self.shutdown.child_token())
                    .await
                    .context("Failed to subscribe to the inbound domain channel")?,
            )
        } else {
            debug!(domain = %self.domain, "Gateway disabled, inbound forwards are left to the domain's gateway node");
            None
        };
        let observer = self
            .observe_broadcasts()
            .await
            .context("Failed to subscribe to the broadcast channel")?;

        let resumed = self
            .store_forward
            .recover()
            .await
            .context("Failed to reload pending deliveries")?;
        let sweeper = self.sweeper.clone().start();

        let mut tasks = self.tasks.lock();
        tasks.extend([ack_listener, observer, sweeper]);
        tasks.extend(gateway);
        drop(tasks);
        info!(domain = %self.domain, resumed, "Mesh node started");
        Ok(())
    }

    /// Stops every background task and waits for them to finish.
    pub async fn shutdown(&self) {
        info!(domain = %self.domain, "Mesh node shutting down");
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!(domain = %self.domain, "Mesh node stopped");
    }

    /// Feeds an inbound message into the node's bookkeeping: discovery
    /// announcements update the registry, every message refreshes its
    /// sender's liveness, help responses reach the help manager and replies
    /// reach their waiters.
    pub fn observe_inbound(&self, message: &Message) {
        match message.message_type() {
            MessageType::Discovery => self.record_presence(message),
            MessageType::HelpResponse => {
                self.registry.touch(message.source());
                self.help.handle_help_response(message);
            }
            _ => {
                self.registry.touch(message.source());
            }
        }
        self.replies.resolve(message);
    }

    fn record_presence(&self, message: &Message) {
        let presence = match serde_json::from_value::<Presence>(Value::Object(message.payload().clone())) {
            Ok(presence) => presence,
            Err(e) => {
                warn!(agent_id = %message.source(), "Ignoring malformed discovery payload: {}", e);
                self.registry.touch(message.source());
                return;
            }
        };
        self.registry.register_or_update(
            message.source().clone(),
            presence.capabilities,
            presence.specializations,
        );
        if let Some(availability) = presence.availability {
            if let Err(e) = self.registry.set_availability(message.source(), availability) {
                debug!("Availability not recorded: {}", e);
            }
        }
    }

    async fn observe_broadcasts(self: &Arc<Self>) -> Result<JoinHandle<()>, TransportError> {
        let channel = self.channels.broadcast();
        let mut stream = self.connection.subscribe(&channel).await?;
        let node = self.clone();
        let shutdown = self.shutdown.child_token();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = stream.next() => {
                        let Some(bytes) = item else {
                            warn!(channel = %channel, "Broadcast subscription ended");
                            break;
                        };
                        match JsonCodec::decode(&bytes) {
                            Ok(message) => node.observe_inbound(&message),
                            Err(e) => warn!(channel = %channel, "Discarding malformed broadcast: {}", e),
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        }))
    }

    /// Subscribes to one agent's direct channel.
    pub async fn subscribe_agent(&self, agent_id: &AgentId) -> Result<ByteStream, TransportError> {
        self.connection.subscribe(&self.channels.agent(agent_id)).await
    }

    pub async fn subscribe_broadcast(&self) -> Result<ByteStream, TransportError> {
        self.connection.subscribe(&self.channels.broadcast()).await
    }

    /// Runs one maintenance pass immediately.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.sweeper.sweep_cycle().await
    }

    pub fn config(&self) -> &MeshConfigManifest {
        &self.config
    }

    pub fn domain(&self) -> &DomainId {
        &self.domain
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterManager> {
        &self.dead_letters
    }

    pub fn store_forward(&self) -> &Arc<StoreForwardEngine> {
        &self.store_forward
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn help(&self) -> &Arc<HelpRequestManager> {
        &self.help
    }

    pub fn replies(&self) -> &ReplyCorrelator {
        &self.replies
    }
}
