//! Interfaces consumed from the signaling and media core
//!
//! The engine never owns a channel's lifetime. Backends hand out
//! [`ChannelHandle`]s and keep driving their legs on their own tasks; the
//! engine only observes flags, issues commands and touches the originator's
//! media while racing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::errors::Result;
use crate::types::{
    CallDirection, CallerProfile, CauseCode, ChannelFlag, ChannelSnapshot, ChannelState, CodecImpl,
    Frame,
};
use crate::variables::Variables;

pub type ChannelHandle = Arc<dyn Channel>;

/// One call leg as exposed by its signaling backend.
#[async_trait]
pub trait Channel: Send + Sync {
    fn uuid(&self) -> &str;

    fn name(&self) -> &str;

    /// State, flags and cause read under one lock.
    fn snapshot(&self) -> ChannelSnapshot;

    fn state(&self) -> ChannelState {
        self.snapshot().state
    }

    fn is_ready(&self) -> bool {
        self.snapshot().is_ready()
    }

    fn cause(&self) -> CauseCode {
        self.snapshot().cause
    }

    fn direction(&self) -> CallDirection;

    fn caller_profile(&self) -> Option<CallerProfile>;

    fn set_flag(&self, flag: ChannelFlag, on: bool);

    fn set_state(&self, state: ChannelState);

    fn get_variable(&self, name: &str) -> Option<String>;

    /// `None` removes the variable.
    fn set_variable(&self, name: &str, value: Option<&str>);

    fn variables(&self) -> Variables;

    fn hangup(&self, cause: CauseCode);

    async fn answer(&self) -> Result<()>;

    async fn pre_answer(&self) -> Result<()>;

    /// Signal ringing toward this channel's peer.
    fn ring_ready(&self);

    fn add_state_handler(&self, handler: Arc<dyn StateHandler>);

    /// True once the backend drives this channel on its own task.
    fn is_running(&self) -> bool;

    fn start_independent_execution(&self) -> Result<()>;

    /// Register a notifier poked on every state or flag change.
    fn watch(&self, _notify: Arc<Notify>) {}

    fn read_codec(&self) -> Option<CodecImpl>;

    fn install_raw_codec(&self, codec: CodecImpl) -> Result<()>;

    fn restore_codec(&self);

    /// `Ok(None)` when no frame arrived within `timeout`.
    async fn read_frame(&self, timeout: Duration) -> Result<Option<Frame>>;

    async fn write_frame(&self, frame: &Frame) -> Result<()>;

    fn dequeue_dtmf(&self) -> Option<char>;

    async fn play_file(&self, path: &str) -> Result<()>;
}

/// Lifecycle hooks a backend invokes on state transitions.
pub trait StateHandler: Send + Sync {
    fn on_routing(&self, _channel: &dyn Channel) {}

    fn on_consume_media(&self, _channel: &dyn Channel) {}
}

/// Engine hooks for launched legs: a leg that reaches routing is parked in
/// consume-media until the race decides its fate.
#[derive(Debug, Default)]
pub struct OriginateStateHandler;

impl StateHandler for OriginateStateHandler {
    fn on_routing(&self, channel: &dyn Channel) {
        if channel.state() == ChannelState::Routing {
            channel.set_state(ChannelState::ConsumeMedia);
        }
    }
}

/// Creates outgoing legs for an endpoint type.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Returns the cause reported by the backend on failure.
    async fn create_outgoing_channel(
        &self,
        endpoint_type: &str,
        data: &str,
        profile: CallerProfile,
        variables: &Variables,
    ) -> std::result::Result<ChannelHandle, CauseCode>;
}

/// Rings a held call back into a leg instead of hanging it up.
#[async_trait]
pub trait CallBridge: Send + Sync {
    async fn bridge_to_held(&self, holding_uuid: &str, peer: &ChannelHandle) -> Result<()>;
}

/// Bridge used when the switch has no held calls to offer.
#[derive(Debug, Default)]
pub struct NoHoldingBridge;

#[async_trait]
impl CallBridge for NoHoldingBridge {
    async fn bridge_to_held(&self, holding_uuid: &str, _peer: &ChannelHandle) -> Result<()> {
        Err(crate::errors::OriginateError::channel(format!(
            "no held call {}",
            holding_uuid
        )))
    }
}
