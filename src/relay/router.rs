//! Message routing
//!
//! Decides, for each inbound text frame, whether to broadcast it or deliver it
//! to one identity, and builds the outbound payload. The router holds no
//! state of its own; it reads the registry and queues frames on handles.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, DeliveryError, DeliveryResult,
};
use crate::server::{ClientEnvelope, RelayPayload, ServerMessage};

/// How directed messages reach connections other than the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectPolicy {
    /// Target gets a `receive` copy, every other connection except the
    /// sender gets a `send` copy
    #[default]
    Fanout,
    /// Only the target gets a copy
    Private,
}

/// Result of routing one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Frames queued for this many recipients
    Delivered(usize),
    /// Directed message for an identity that is not registered
    Dropped,
    /// Malformed input; an error acknowledgment went back to the sender
    Rejected,
}

/// Routes inbound messages between connections
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    policy: DirectPolicy,
}

impl Router {
    /// Create a router over the shared registry
    pub fn new(registry: Arc<ConnectionRegistry>, policy: DirectPolicy) -> Self {
        Self { registry, policy }
    }

    /// Route one inbound text frame from `sender`.
    ///
    /// Only a failure to queue the error acknowledgment for the sender is
    /// returned as an error. Per-recipient delivery failures are logged and
    /// skipped.
    pub async fn route(
        &self,
        sender: &ConnectionHandle,
        text: &str,
    ) -> DeliveryResult<RouteOutcome> {
        let envelope = match ClientEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Rejecting message from {}: {}", sender.id(), e);
                return Self::reject(sender);
            }
        };

        debug!("Routing {} message from {}", envelope.kind(), sender.id());

        match envelope {
            ClientEnvelope::Send { message } => {
                let delivered = self
                    .broadcast(&RelayPayload::sent(message), &[sender.id()])
                    .await?;
                Ok(RouteOutcome::Delivered(delivered))
            }
            ClientEnvelope::Receive { user } => {
                let delivered = self
                    .broadcast(&RelayPayload::received(user), &[sender.id()])
                    .await?;
                Ok(RouteOutcome::Delivered(delivered))
            }
            ClientEnvelope::Direct { target, message } => {
                self.direct(sender, &target, message).await
            }
        }
    }

    /// Route one inbound binary frame from `sender`.
    ///
    /// A UTF-8 payload is routed exactly like a text frame carrying the same
    /// bytes. Anything else is malformed input.
    pub async fn route_binary(
        &self,
        sender: &ConnectionHandle,
        data: &[u8],
    ) -> DeliveryResult<RouteOutcome> {
        match std::str::from_utf8(data) {
            Ok(text) => self.route(sender, text).await,
            Err(e) => {
                debug!("Rejecting binary message from {}: {}", sender.id(), e);
                Self::reject(sender)
            }
        }
    }

    fn reject(sender: &ConnectionHandle) -> DeliveryResult<RouteOutcome> {
        sender.send(&ServerMessage::invalid_format())?;
        Ok(RouteOutcome::Rejected)
    }

    async fn direct(
        &self,
        sender: &ConnectionHandle,
        target: &str,
        message: String,
    ) -> DeliveryResult<RouteOutcome> {
        let Some(recipient) = self.registry.lookup(target).await else {
            debug!(
                "Dropping direct message from {}: {} is not connected",
                sender.id(),
                target
            );
            return Ok(RouteOutcome::Dropped);
        };

        let mut delivered = 0;
        let private = ServerMessage::from(RelayPayload::received(message.clone()));
        match recipient.send(&private) {
            Ok(()) => delivered += 1,
            Err(e) => warn!("Direct delivery to {} failed: {}", target, e),
        }

        if self.policy == DirectPolicy::Fanout {
            delivered += self
                .broadcast(&RelayPayload::sent(message), &[sender.id(), recipient.id()])
                .await?;
        }

        Ok(RouteOutcome::Delivered(delivered))
    }

    /// Queue `payload` for every open connection not in `exclude`.
    ///
    /// Returns the number of connections the frame was queued for.
    async fn broadcast(
        &self,
        payload: &RelayPayload,
        exclude: &[ConnectionId],
    ) -> DeliveryResult<usize> {
        let text = ServerMessage::from(payload.clone()).to_json()?;
        let mut delivered = 0;

        for handle in self.registry.snapshot().await {
            if exclude.contains(&handle.id()) {
                continue;
            }
            match handle.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(e @ DeliveryError::QueueFull(_)) => warn!("Dropping broadcast frame: {}", e),
                // Recipient went away mid-broadcast
                Err(e) => debug!("Skipping recipient: {}", e),
            }
        }

        Ok(delivered)
    }
}
