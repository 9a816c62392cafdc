use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::topics::{TopicSet, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};

/// Inbound payloads above this size are dropped unread.
pub const MAX_INBOUND_PAYLOAD: usize = 512;

/// Upper bound on messages handled per session tick.
pub const MAX_INBOUND_PER_TICK: usize = 16;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker session is not connected")]
    NotConnected,
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("broker transport: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub will_topic: String,
    pub will_payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Broker client seam. Every call must return within a bounded time.
pub trait BusTransport: Send {
    fn connect(&mut self, options: &SessionOptions) -> Result<(), BusError>;
    fn is_connected(&self) -> bool;
    fn subscribe(&mut self, topic: &str) -> Result<(), BusError>;
    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), BusError>;
    /// Next queued inbound message, without waiting.
    fn poll(&mut self) -> Option<InboundMessage>;
    fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    System = 1,
    Connection = 2,
    BusCommand = 3,
    Reboot = 4,
    PwmAutoChange = 5,
    SettingsChange = 6,
    Login = 7,
}

/// One entry of the remote event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub category: EventCategory,
    pub id: u16,
    pub title: String,
    pub data: String,
}

impl LogEvent {
    pub fn new(
        category: EventCategory,
        id: u16,
        title: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            category,
            id,
            title: title.into(),
            data: data.into(),
        }
    }
}

#[derive(Serialize)]
struct LogRecord<'a> {
    #[serde(rename = "Node")]
    node: u32,
    #[serde(rename = "Category")]
    category: u8,
    #[serde(rename = "ID")]
    id: u16,
    #[serde(rename = "Title")]
    title: &'a str,
    #[serde(rename = "Data")]
    data: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
    client_id: String,
}

pub struct MessageBusSession {
    transport: Box<dyn BusTransport>,
    topics: TopicSet,
    endpoint: Endpoint,
    node: u32,
}

impl MessageBusSession {
    pub fn new(
        transport: Box<dyn BusTransport>,
        topics: TopicSet,
        host: &str,
        port: u16,
        client_id: &str,
        node: u32,
    ) -> Self {
        Self {
            transport,
            topics,
            endpoint: Endpoint {
                host: host.to_string(),
                port,
                client_id: client_id.to_string(),
            },
            node,
        }
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Connects when needed. Returns `Ok(true)` when a new session came up.
    pub fn ensure_connected(&mut self, ip: &str) -> Result<bool, BusError> {
        if self.transport.is_connected() {
            return Ok(false);
        }

        let options = SessionOptions {
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            client_id: self.endpoint.client_id.clone(),
            will_topic: self.topics.state(),
            will_payload: PAYLOAD_OFFLINE.to_string(),
        };
        self.transport.connect(&options)?;
        info!(
            "broker session up at {}:{} as {}",
            options.host, options.port, options.client_id
        );

        // Never leave a half-open session; the next tick redoes the handshake.
        if let Err(err) = self.announce() {
            warn!("broker handshake failed: {err}");
            self.transport.disconnect();
            return Err(err);
        }
        self.log_event(&LogEvent::new(EventCategory::Connection, 1, "Node online", ip));
        Ok(true)
    }

    fn announce(&mut self) -> Result<(), BusError> {
        for topic in self.topics.subscriptions() {
            self.transport.subscribe(&topic)?;
        }
        let state = self.topics.state();
        self.publish(&state, PAYLOAD_ONLINE.as_bytes(), true)
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), BusError> {
        if !self.transport.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.transport.publish(topic, payload, retained)
    }

    pub fn publish_json<T: Serialize>(
        &mut self,
        topic: &str,
        body: &T,
        retained: bool,
    ) -> Result<(), BusError> {
        let payload =
            serde_json::to_vec(body).map_err(|err| BusError::Transport(err.to_string()))?;
        self.publish(topic, &payload, retained)
    }

    /// Logs locally and, when connected, mirrors the event to `<ns>/log`.
    pub fn log_event(&mut self, event: &LogEvent) {
        info!(
            "[{:?}/{}] {} {}",
            event.category, event.id, event.title, event.data
        );
        if !self.transport.is_connected() {
            return;
        }
        let record = LogRecord {
            node: self.node,
            category: event.category as u8,
            id: event.id,
            title: &event.title,
            data: &event.data,
        };
        let topic = self.topics.log();
        if let Err(err) = self.publish_json(&topic, &record, false) {
            warn!("failed to publish log event: {err}");
        }
    }

    /// Drains queued inbound messages, dropping oversized payloads.
    pub fn drain_inbound(&mut self) -> Vec<InboundMessage> {
        let mut messages = Vec::new();
        while messages.len() < MAX_INBOUND_PER_TICK {
            let Some(message) = self.transport.poll() else {
                break;
            };
            if message.payload.len() > MAX_INBOUND_PAYLOAD {
                warn!(
                    "dropping {} byte payload on {}",
                    message.payload.len(),
                    message.topic
                );
                continue;
            }
            messages.push(message);
        }
        messages
    }

    /// Switches broker parameters; the next tick reconnects with them.
    pub fn reconfigure(&mut self, topics: TopicSet, host: &str, port: u16, client_id: &str) {
        let endpoint = Endpoint {
            host: host.to_string(),
            port,
            client_id: client_id.to_string(),
        };
        if endpoint == self.endpoint && topics == self.topics {
            return;
        }
        info!("broker parameters changed, dropping session");
        self.transport.disconnect();
        self.topics = topics;
        self.endpoint = endpoint;
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }
}
