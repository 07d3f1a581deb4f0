//! Channel endpoints over the broadcast transport.

use log::warn;
#[cfg(test)]
use mockall::mock;
use wasm_bindgen::JsValue;

#[mockall_double::double]
use crate::interop::broadcast::BroadcastPort;
use crate::interop;
use crate::quick_tab::ContainerId;
use crate::sync::{ContextId, SyncMessage, SyncOp};
use crate::util::errors::CustomError;

/// A page context's standing endpoint on its container's channel.
/// Exactly one is opened per context at startup and closed at teardown.
pub struct SyncChannel {
    container: ContainerId,
    origin: ContextId,
    port: BroadcastPort,
}

impl SyncChannel {
    /// Opens the endpoint and wires the receive path.
    /// The handler only ever observes validated messages from peers,
    /// fails if the browser indicates so.
    pub fn open(
        container: ContainerId,
        origin: ContextId,
        handler: impl Fn(SyncMessage) + 'static,
    ) -> Result<Self, CustomError> {
        let mut port = BroadcastPort::open(&container.channel_name())?;
        let own_origin = origin.clone();
        port.set_handler(move |value| dispatch_inbound(&own_origin, value, &handler));
        Ok(Self {
            container,
            origin,
            port,
        })
    }

    pub fn container(&self) -> &ContainerId {
        &self.container
    }

    /// Announces an operation to every peer of the container.
    /// Fails if the operation is invalid or the browser indicates so.
    pub fn publish(&self, op: SyncOp) -> Result<(), CustomError> {
        op.validate()?;
        let message = SyncMessage {
            op,
            origin: self.origin.clone(),
            trace_id: None,
        };
        self.port.post(&interop::to_jsvalue(&message))
    }

    /// Detaches the endpoint, no further messages are delivered.
    pub fn close(&self) {
        self.port.close();
    }
}

/// Validates and routes one raw inbound value.
/// Dropped values are logged, a handler never observes them.
fn dispatch_inbound(own_origin: &ContextId, value: JsValue, handler: &impl Fn(SyncMessage)) {
    let message = match interop::cast_or_standard_mismatch::<SyncMessage>(value) {
        Ok(message) => message,
        Err(error) => {
            warn!("dropping malformed broadcast: {error}");
            return;
        }
    };
    if message.origin == *own_origin {
        // loopback echo of our own publish
        return;
    }
    if let Err(error) = message.op.validate() {
        warn!("dropping invalid {} broadcast: {error}", message.op);
        return;
    }
    handler(message);
}

/// One-shot publisher for the background context, which is not a peer of
/// any channel and therefore does not hold standing endpoints.
pub struct Publisher {
    origin: ContextId,
}

impl Publisher {
    pub fn new(origin: ContextId) -> Self {
        Self { origin }
    }

    pub fn origin(&self) -> &ContextId {
        &self.origin
    }

    /// Opens the container's channel just long enough to post.
    /// Fails if the operation is invalid or the browser indicates so.
    pub fn publish(&self, container: &ContainerId, op: SyncOp) -> Result<(), CustomError> {
        op.validate()?;
        let port = BroadcastPort::open(&container.channel_name())?;
        let message = SyncMessage {
            op,
            origin: self.origin.clone(),
            trace_id: None,
        };
        let outcome = port.post(&interop::to_jsvalue(&message));
        port.close();
        outcome
    }
}

#[cfg(test)]
mock! {
    pub Publisher {
        pub fn new(origin: ContextId) -> Self;
        pub fn origin(&self) -> &ContextId;
        pub fn publish(&self, container: &ContainerId, op: SyncOp) -> Result<(), CustomError>;
    }
}
