//! Wrapper around the `BroadcastChannel` construct.
//! Delivery is scoped to the channel name, contexts listening on other
//! names never observe a posted value.

#[cfg(test)]
use mockall::mock;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{BroadcastChannel, MessageEvent};

use crate::util::errors::CustomError;

/// An open named channel endpoint.
/// The registered handler is dropped together with the port,
/// closing detaches the endpoint from the channel immediately.
pub struct BroadcastPort {
    channel: BroadcastChannel,
    handler: Option<Closure<dyn Fn(MessageEvent)>>,
}

impl BroadcastPort {
    /// Opens an endpoint on the named channel,
    /// fails if the browser indicates so.
    pub fn open(name: &str) -> Result<Self, CustomError> {
        let channel = BroadcastChannel::new(name).or(Err(CustomError::TransportFailure {
            verb: String::from("open"),
        }))?;
        Ok(Self {
            channel,
            handler: None,
        })
    }

    /// Registers the receive callback, replacing any previous one.
    /// The callback observes the raw message value.
    pub fn set_handler(&mut self, handler: impl Fn(JsValue) + 'static) {
        let closure = Closure::new(move |event: MessageEvent| handler(event.data()));
        self.channel
            .set_onmessage(Some(closure.as_ref().unchecked_ref()));
        self.handler = Some(closure);
    }

    /// Posts a value to every other endpoint of the channel,
    /// fails if the browser indicates so.
    pub fn post(&self, value: &JsValue) -> Result<(), CustomError> {
        self.channel
            .post_message(value)
            .or(Err(CustomError::TransportFailure {
                verb: String::from("post to"),
            }))
    }

    /// Detaches from the channel, no further messages are delivered.
    pub fn close(&self) {
        self.channel.close();
    }
}

impl Drop for BroadcastPort {
    fn drop(&mut self) {
        self.channel.set_onmessage(None);
        self.channel.close();
    }
}

#[cfg(test)]
mock! {
    pub BroadcastPort {
        pub fn open(name: &str) -> Result<Self, CustomError>;
        pub fn set_handler<T: Fn(JsValue) + 'static>(&mut self, handler: T);
        pub fn post(&self, value: &JsValue) -> Result<(), CustomError>;
        pub fn close(&self);
    }
}
