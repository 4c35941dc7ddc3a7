// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use meshbus_core::application::correlation::CorrelationError;
use meshbus_core::application::help::HelpManagerError;
use meshbus_core::application::node::MeshNode;
use meshbus_core::application::router::{RouteError, RoutingDecision};
use meshbus_core::domain::agent::{AgentId, Availability, Presence};
use meshbus_core::domain::help::HelpRequestId;
use meshbus_core::domain::mesh_config::MeshConfigManifest;
use meshbus_core::domain::message::{Message, MessageType};
use meshbus_core::domain::transport::TransportError;
use meshbus_core::infrastructure::codec::JsonCodec;
use meshbus_core::infrastructure::transport::build_backend;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Help(#[from] HelpManagerError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error("Failed to encode presence: {0}")]
    Presence(#[from] serde_json::Error),

    #[error("Message {0} is not a help-wanted request")]
    NotHelpWanted(String),

    #[error(transparent)]
    Node(#[from] anyhow::Error),
}

type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// An agent's connection to a mesh node.
///
/// Cloning is cheap; clones share the handler table, so a clone can run
/// [`listen`](Self::listen) on its own task while the original keeps sending.
#[derive(Clone)]
pub struct AgentClient {
    agent_id: AgentId,
    node: Arc<MeshNode>,
    owns_node: bool,
    handlers: Arc<RwLock<HashMap<MessageType, Vec<Handler>>>>,
}

impl AgentClient {
    /// Attaches `agent_id` to a started node, reconnecting the node's
    /// transport first if it is unhealthy.
    pub async fn connect(node: Arc<MeshNode>, agent_id: impl Into<AgentId>) -> Result<Self, ClientError> {
        node.connection().ensure_connected().await?;
        let agent_id = agent_id.into();
        info!(agent_id = %agent_id, domain = %node.domain(), "Agent connected");
        Ok(Self {
            agent_id,
            node,
            owns_node: false,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Joins the mesh from a separate process.
    ///
    /// Starts a private node for `config.spec.node.domain` on the configured
    /// transport (normally `tcp` with a broker address). The node runs without
    /// a gateway: forwards into the domain are answered by the domain's gateway
    /// node, while this process still queues its own cross-domain sends. Its
    /// store-and-forward storage must not be shared with another process.
    pub async fn join(mut config: MeshConfigManifest, agent_id: impl Into<AgentId>) -> Result<Self, ClientError> {
        config.spec.node.gateway = false;
        let backend = build_backend(&config.spec.transport)?;
        let node = MeshNode::build(config, backend)?;
        node.start().await?;

        let mut client = Self::connect(node, agent_id).await?;
        client.owns_node = true;
        Ok(client)
    }

    /// Stops the node started by [`join`](Self::join). A client attached
    /// with [`connect`](Self::connect) leaves its node running.
    pub async fn close(&self) {
        if self.owns_node {
            self.node.shutdown().await;
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn node(&self) -> &Arc<MeshNode> {
        &self.node
    }

    /// New message from this agent.
    pub fn message(&self, message_type: MessageType) -> Message {
        Message::new(message_type, self.agent_id.clone())
    }

    /// Broadcasts a `discovery` announcement. The local registry is updated
    /// before the broadcast goes out.
    pub async fn announce_presence(
        &self,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        specializations: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<(), ClientError> {
        self.announce(Presence {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            specializations: specializations.into_iter().map(Into::into).collect(),
            availability: None,
        })
        .await
    }

    /// Re-announces with a new availability and no capability changes.
    pub async fn set_availability(&self, availability: Availability) -> Result<(), ClientError> {
        let current = self.node.registry().get(&self.agent_id);
        let presence = Presence {
            capabilities: current
                .as_ref()
                .map(|a| a.capabilities.iter().cloned().collect())
                .unwrap_or_default(),
            specializations: current
                .as_ref()
                .map(|a| a.specializations.iter().cloned().collect())
                .unwrap_or_default(),
            availability: Some(availability),
        };
        self.announce(presence).await
    }

    async fn announce(&self, presence: Presence) -> Result<(), ClientError> {
        let payload = match serde_json::to_value(&presence)? {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        let announcement = self.message(MessageType::Discovery).with_payload(payload);
        self.node.observe_inbound(&announcement);
        self.node.router().route(announcement).await?;
        debug!(agent_id = %self.agent_id, "Presence announced");
        Ok(())
    }

    /// Routes a message. Local and broadcast sends complete synchronously; a
    /// cross-domain send returns a handle to follow the delivery.
    pub async fn send(&self, message: Message) -> Result<RoutingDecision, ClientError> {
        Ok(self.node.router().route(message).await?)
    }

    /// Sends `message` and waits for the first inbound message correlated with it.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Message, ClientError> {
        let message = match message.correlation_id() {
            Some(_) => message,
            None => {
                let id = message.id().to_string();
                message.correlated_with(id)
            }
        };
        let correlation_id = message.correlation_id().unwrap_or_default().to_string();
        let pending = self.node.replies().register(correlation_id)?;
        self.send(message).await?;
        Ok(pending.wait(timeout).await?)
    }

    /// Adds a handler for one message type. Every handler registered for a
    /// type runs, in registration order.
    pub fn register_handler<F, Fut>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |message: Message| handler(message).boxed());
        self.handlers.write().entry(message_type).or_default().push(handler);
    }

    /// Receive loop over this agent's direct channel and the broadcast
    /// channel. Runs until `shutdown` fires or both subscriptions end.
    ///
    /// Direct messages are fed to the node first so help responses and
    /// correlated replies are accounted for; a message that completes a
    /// pending [`request`](Self::request) is not dispatched to handlers.
    /// Broadcasts sent by this agent are skipped.
    pub async fn listen(&self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let direct = self
            .node
            .subscribe_agent(&self.agent_id)
            .await?
            .map(|bytes| (true, bytes));
        let broadcast = self.node.subscribe_broadcast().await?.map(|bytes| (false, bytes));
        let mut inbound = futures::stream::select(direct, broadcast);
        info!(agent_id = %self.agent_id, "Agent listening");

        loop {
            tokio::select! {
                item = inbound.next() => {
                    let Some((is_direct, bytes)) = item else {
                        warn!(agent_id = %self.agent_id, "Agent subscriptions ended");
                        break;
                    };
                    let message = match JsonCodec::decode(&bytes) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(agent_id = %self.agent_id, "Discarding malformed message: {}", e);
                            continue;
                        }
                    };
                    if is_direct {
                        let was_reply = self.node.replies().resolve(&message);
                        self.node.observe_inbound(&message);
                        if was_reply {
                            continue;
                        }
                    } else if message.source() == &self.agent_id {
                        continue;
                    }
                    self.dispatch(message).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!(agent_id = %self.agent_id, "Agent stopped listening");
        Ok(())
    }

    async fn dispatch(&self, message: Message) {
        let handlers = self
            .handlers
            .read()
            .get(message.message_type())
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(message_type = %message.message_type(), "No handler registered");
            return;
        }

        for handler in handlers {
            let call = AssertUnwindSafe(async { handler(message.clone()).await });
            match call.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    message_id = %message.id(),
                    message_type = %message.message_type(),
                    "Handler failed: {}",
                    e
                ),
                Err(_) => error!(
                    message_id = %message.id(),
                    message_type = %message.message_type(),
                    "Handler panicked"
                ),
            }
        }
    }

    pub async fn request_help(
        &self,
        required_capabilities: impl IntoIterator<Item = impl Into<String>>,
        description: impl Into<String>,
        timeout_minutes: Option<u32>,
    ) -> Result<HelpRequestId, ClientError> {
        let capabilities: Vec<String> = required_capabilities.into_iter().map(Into::into).collect();
        Ok(self
            .node
            .help()
            .request_help(self.agent_id.clone(), capabilities, description, timeout_minutes)
            .await?)
    }

    /// Answers a `help-wanted` broadcast with a `help-response` to its requester.
    pub async fn offer_help(&self, wanted: &Message) -> Result<RoutingDecision, ClientError> {
        if wanted.message_type() != &MessageType::HelpWanted {
            return Err(ClientError::NotHelpWanted(wanted.id().to_string()));
        }
        let mut response = Message::reply_to(wanted, MessageType::HelpResponse, self.agent_id.clone());
        if let Some(request_id) = wanted.payload_str("requestId") {
            response = response.with_field("requestId", request_id);
        }
        self.send(response).await
    }

    pub async fn select_helper(&self, request_id: HelpRequestId, helper: impl Into<AgentId>) -> Result<(), ClientError> {
        Ok(self.node.help().select_helper(request_id, helper.into()).await?)
    }

    pub async fn complete_help(&self, request_id: HelpRequestId, success: bool) -> Result<(), ClientError> {
        Ok(self.node.help().complete_help(request_id, success).await?)
    }
}
