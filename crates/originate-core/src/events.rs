//! Origination lifecycle events

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::channel::Channel;
use crate::variables::Variables;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchEventKind {
    /// A leg was created by an originate call.
    ChannelOriginate,
}

#[derive(Debug, Clone)]
pub struct SwitchEvent {
    pub kind: SwitchEventKind,
    pub channel_uuid: String,
    pub channel_name: String,
    /// Channel data: profile fields and variables.
    pub headers: Variables,
    pub timestamp: DateTime<Utc>,
}

impl SwitchEvent {
    /// Build an event carrying the channel's data.
    pub fn for_channel(kind: SwitchEventKind, channel: &dyn Channel) -> Self {
        let mut headers = Variables::new();
        headers.insert("Unique-ID".to_string(), channel.uuid().to_string());
        headers.insert("Channel-Name".to_string(), channel.name().to_string());
        headers.insert("Channel-State".to_string(), channel.state().to_string());
        if let Some(profile) = channel.caller_profile() {
            headers.insert("Caller-Caller-ID-Name".to_string(), profile.caller_id_name);
            headers.insert("Caller-Caller-ID-Number".to_string(), profile.caller_id_number);
            headers.insert("Caller-Destination-Number".to_string(), profile.destination_number);
        }
        for (k, v) in channel.variables() {
            headers.insert(format!("variable_{}", k), v);
        }
        Self {
            kind,
            channel_uuid: channel.uuid().to_string(),
            channel_name: channel.name().to_string(),
            headers,
            timestamp: Utc::now(),
        }
    }
}

/// Event sink of the switch.
pub trait EventBus: Send + Sync {
    fn fire(&self, event: SwitchEvent);
}

/// Event bus fanning events out to any number of subscribers.
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<SwitchEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwitchEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventBus for BroadcastEventBus {
    fn fire(&self, event: SwitchEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}
