//! In-memory loopback backend
//!
//! Channels that live entirely in process, driven by a [`LegScript`] on their
//! own task. Used for integration testing and demos without any signaling
//! stack: a script can ring, send early media, answer, press DTMF and hang up
//! after arbitrary delays, while the channel records every command the engine
//! issues (hangups, answers, frames written, codec changes).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::channel::{CallBridge, Channel, ChannelFactory, ChannelHandle, StateHandler};
use crate::errors::{OriginateError, Result};
use crate::types::{
    CallDirection, CallerProfile, CauseCode, ChannelFlag, ChannelFlags, ChannelSnapshot,
    ChannelState, CodecImpl, Frame,
};
use crate::variables::Variables;

/// One scripted action of a loopback channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegStep {
    Wait(Duration),
    RingReady,
    EarlyMedia,
    Answer,
    Dtmf(String),
    Hangup(CauseCode),
}

/// Scripted behaviour of a loopback channel. An empty script rings forever.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegScript {
    pub steps: Vec<LegStep>,
}

impl LegScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(mut self, ms: u64) -> Self {
        self.steps.push(LegStep::Wait(Duration::from_millis(ms)));
        self
    }

    pub fn ring(mut self) -> Self {
        self.steps.push(LegStep::RingReady);
        self
    }

    pub fn early_media(mut self) -> Self {
        self.steps.push(LegStep::EarlyMedia);
        self
    }

    pub fn answer(mut self) -> Self {
        self.steps.push(LegStep::Answer);
        self
    }

    pub fn dtmf(mut self, digits: impl Into<String>) -> Self {
        self.steps.push(LegStep::Dtmf(digits.into()));
        self
    }

    pub fn hangup(mut self, cause: CauseCode) -> Self {
        self.steps.push(LegStep::Hangup(cause));
        self
    }
}

#[derive(Debug)]
struct ChannelCore {
    state: ChannelState,
    flags: ChannelFlags,
    cause: CauseCode,
    variables: Variables,
    profile: Option<CallerProfile>,
}

#[derive(Debug, Default)]
struct MediaState {
    read_codec: Option<CodecImpl>,
    raw_codec: Option<CodecImpl>,
    written: Vec<Frame>,
    codec_restores: usize,
    played: Vec<String>,
}

pub struct LoopbackChannel {
    uuid: String,
    name: String,
    direction: CallDirection,
    core: Mutex<ChannelCore>,
    media: Mutex<MediaState>,
    dtmf: Mutex<VecDeque<char>>,
    handlers: Mutex<Vec<Arc<dyn StateHandler>>>,
    watchers: Mutex<Vec<Arc<Notify>>>,
    script: Mutex<Option<LegScript>>,
    hangup_calls: Mutex<Vec<CauseCode>>,
    ring_ready_sent: AtomicUsize,
    answer_calls: AtomicUsize,
    pre_answer_calls: AtomicUsize,
    fail_answer: AtomicBool,
    running: AtomicBool,
    self_ref: Weak<LoopbackChannel>,
}

impl std::fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("state", &self.core.lock().state)
            .finish()
    }
}

impl LoopbackChannel {
    fn build(
        name: impl Into<String>,
        direction: CallDirection,
        state: ChannelState,
        profile: Option<CallerProfile>,
    ) -> Arc<Self> {
        let uuid = uuid::Uuid::new_v4().to_string();
        Arc::new_cyclic(|weak| LoopbackChannel {
            uuid,
            name: name.into(),
            direction,
            core: Mutex::new(ChannelCore {
                state,
                flags: ChannelFlags::default(),
                cause: CauseCode::None,
                variables: Variables::new(),
                profile,
            }),
            media: Mutex::new(MediaState::default()),
            dtmf: Mutex::new(VecDeque::new()),
            handlers: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            script: Mutex::new(None),
            hangup_calls: Mutex::new(Vec::new()),
            ring_ready_sent: AtomicUsize::new(0),
            answer_calls: AtomicUsize::new(0),
            pre_answer_calls: AtomicUsize::new(0),
            fail_answer: AtomicBool::new(false),
            running: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    /// Bare channel in `Init`.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::build(name, CallDirection::Inbound, ChannelState::Init, None)
    }

    /// Inbound call already executing a dialplan, with PCMU 8 kHz / 20 ms media.
    pub fn originator(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let profile = CallerProfile::new("Originator", "1000").with_destination("9999");
        let channel = Self::build(name, CallDirection::Inbound, ChannelState::Execute, Some(profile));
        channel.media.lock().read_codec = Some(CodecImpl {
            name: "PCMU".to_string(),
            sample_rate: 8000,
            ptime_ms: 20,
            channels: 1,
            passthrough: false,
        });
        channel
    }

    /// Outgoing leg created by [`LoopbackFactory`].
    pub fn outbound(name: impl Into<String>, profile: CallerProfile) -> Arc<Self> {
        Self::build(name, CallDirection::Outbound, ChannelState::New, Some(profile))
    }

    pub fn with_script(self: Arc<Self>, script: LegScript) -> Arc<Self> {
        *self.script.lock() = Some(script);
        self
    }

    pub fn set_read_codec(&self, codec: Option<CodecImpl>) {
        self.media.lock().read_codec = codec;
    }

    /// Make the next `answer`/`pre_answer` fail.
    pub fn fail_answers(&self) {
        self.fail_answer.store(true, Ordering::SeqCst);
    }

    pub fn push_dtmf(&self, digits: &str) {
        self.dtmf.lock().extend(digits.chars());
        self.notify();
    }

    /// Run a script on this channel's own task without the routing preamble.
    pub fn run_script(&self, script: LegScript) {
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            run_steps(weak, script.steps).await;
        });
    }

    /// Every cause passed to `hangup`, including calls on a dead channel.
    pub fn hangup_calls(&self) -> Vec<CauseCode> {
        self.hangup_calls.lock().clone()
    }

    pub fn written_frames(&self) -> Vec<Frame> {
        self.media.lock().written.clone()
    }

    pub fn raw_codec(&self) -> Option<CodecImpl> {
        self.media.lock().raw_codec.clone()
    }

    pub fn codec_restores(&self) -> usize {
        self.media.lock().codec_restores
    }

    pub fn played_files(&self) -> Vec<String> {
        self.media.lock().played.clone()
    }

    pub fn ring_ready_sent(&self) -> usize {
        self.ring_ready_sent.load(Ordering::SeqCst)
    }

    pub fn answer_calls(&self) -> usize {
        self.answer_calls.load(Ordering::SeqCst)
    }

    pub fn pre_answer_calls(&self) -> usize {
        self.pre_answer_calls.load(Ordering::SeqCst)
    }

    fn notify(&self) {
        for watcher in self.watchers.lock().iter() {
            watcher.notify_one();
        }
    }

    fn update<F: FnOnce(&mut ChannelCore)>(&self, f: F) {
        f(&mut self.core.lock());
        self.notify();
    }

    fn handlers(&self) -> Vec<Arc<dyn StateHandler>> {
        self.handlers.lock().clone()
    }

    fn is_down(&self) -> bool {
        self.core.lock().state.is_down()
    }
}

async fn run_steps(weak: Weak<LoopbackChannel>, steps: Vec<LegStep>) {
    for step in steps {
        let Some(channel) = weak.upgrade() else {
            return;
        };
        if channel.is_down() {
            return;
        }
        match step {
            LegStep::Wait(duration) => {
                drop(channel);
                tokio::time::sleep(duration).await;
            }
            LegStep::RingReady => channel.update(|c| c.flags.ring_ready = true),
            LegStep::EarlyMedia => channel.update(|c| c.flags.early_media = true),
            LegStep::Answer => channel.update(|c| {
                c.flags.answered = true;
                c.state = ChannelState::ExchangeMedia.max(c.state);
            }),
            LegStep::Dtmf(digits) => channel.push_dtmf(&digits),
            LegStep::Hangup(cause) => channel.hangup(cause),
        }
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> ChannelSnapshot {
        let core = self.core.lock();
        ChannelSnapshot {
            state: core.state,
            flags: core.flags,
            cause: core.cause,
        }
    }

    fn direction(&self) -> CallDirection {
        self.direction
    }

    fn caller_profile(&self) -> Option<CallerProfile> {
        self.core.lock().profile.clone()
    }

    fn set_flag(&self, flag: ChannelFlag, on: bool) {
        self.update(|c| c.flags.set(flag, on));
    }

    fn set_state(&self, state: ChannelState) {
        let changed = {
            let mut core = self.core.lock();
            if core.state.is_down() || core.state == state {
                false
            } else {
                core.state = state;
                true
            }
        };
        if !changed {
            return;
        }
        self.notify();
        match state {
            ChannelState::Routing => {
                for handler in self.handlers() {
                    handler.on_routing(self);
                }
            }
            ChannelState::ConsumeMedia => {
                for handler in self.handlers() {
                    handler.on_consume_media(self);
                }
            }
            _ => {}
        }
    }

    fn get_variable(&self, name: &str) -> Option<String> {
        self.core.lock().variables.get(name).cloned()
    }

    fn set_variable(&self, name: &str, value: Option<&str>) {
        let mut core = self.core.lock();
        match value {
            Some(v) => {
                core.variables.insert(name.to_string(), v.to_string());
            }
            None => {
                core.variables.shift_remove(name);
            }
        }
    }

    fn variables(&self) -> Variables {
        self.core.lock().variables.clone()
    }

    fn hangup(&self, cause: CauseCode) {
        self.hangup_calls.lock().push(cause);
        let was_up = {
            let mut core = self.core.lock();
            if core.state.is_down() {
                false
            } else {
                core.state = ChannelState::Hangup;
                core.cause = cause;
                true
            }
        };
        if was_up {
            debug!("Hangup {} [{}]", self.name, cause);
            self.notify();
        }
    }

    async fn answer(&self) -> Result<()> {
        self.answer_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_answer.load(Ordering::SeqCst) || self.is_down() {
            return Err(OriginateError::channel(format!("{} cannot answer", self.name)));
        }
        self.update(|c| c.flags.answered = true);
        Ok(())
    }

    async fn pre_answer(&self) -> Result<()> {
        self.pre_answer_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_answer.load(Ordering::SeqCst) || self.is_down() {
            return Err(OriginateError::channel(format!("{} cannot pre-answer", self.name)));
        }
        self.update(|c| c.flags.early_media = true);
        Ok(())
    }

    fn ring_ready(&self) {
        self.ring_ready_sent.fetch_add(1, Ordering::SeqCst);
        self.update(|c| c.flags.ring_ready = true);
    }

    fn add_state_handler(&self, handler: Arc<dyn StateHandler>) {
        self.handlers.lock().push(handler);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start_independent_execution(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let weak = self.self_ref.clone();
        let steps = self.script.lock().take().unwrap_or_default().steps;
        tokio::spawn(async move {
            if let Some(channel) = weak.upgrade() {
                channel.set_state(ChannelState::Init);
                channel.set_state(ChannelState::Routing);
            }
            run_steps(weak, steps).await;
        });
        Ok(())
    }

    fn watch(&self, notify: Arc<Notify>) {
        self.watchers.lock().push(notify);
    }

    fn read_codec(&self) -> Option<CodecImpl> {
        self.media.lock().read_codec.clone()
    }

    fn install_raw_codec(&self, codec: CodecImpl) -> Result<()> {
        let mut media = self.media.lock();
        if media.read_codec.is_none() {
            return Err(OriginateError::media("no read codec"));
        }
        media.raw_codec = Some(codec);
        Ok(())
    }

    fn restore_codec(&self) {
        let mut media = self.media.lock();
        media.raw_codec = None;
        media.codec_restores += 1;
    }

    async fn read_frame(&self, timeout: Duration) -> Result<Option<Frame>> {
        if self.is_down() {
            return Err(OriginateError::channel(format!("{} is hung up", self.name)));
        }
        let codec = {
            let media = self.media.lock();
            media.raw_codec.clone().or_else(|| media.read_codec.clone())
        };
        let Some(codec) = codec else {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        };
        tokio::time::sleep(codec.packet_interval().min(timeout)).await;
        let silence = vec![0i16; codec.samples_per_packet()];
        Ok(Some(Frame::from_samples(&silence, codec.sample_rate, codec.channels)))
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        if self.is_down() {
            return Err(OriginateError::channel(format!("{} is hung up", self.name)));
        }
        self.media.lock().written.push(frame.clone());
        Ok(())
    }

    fn dequeue_dtmf(&self) -> Option<char> {
        self.dtmf.lock().pop_front()
    }

    async fn play_file(&self, path: &str) -> Result<()> {
        if self.is_down() {
            return Err(OriginateError::channel(format!("{} is hung up", self.name)));
        }
        self.media.lock().played.push(path.to_string());
        tokio::task::yield_now().await;
        Ok(())
    }
}

/// Factory creating scripted loopback legs, keyed by dial data.
pub struct LoopbackFactory {
    endpoint_types: Vec<String>,
    scripts: DashMap<String, LegScript>,
    rejects: DashMap<String, CauseCode>,
    created: Mutex<Vec<Arc<LoopbackChannel>>>,
    attempts: AtomicUsize,
}

impl LoopbackFactory {
    /// Accepts the `loopback` and `sofia` endpoint types.
    pub fn new() -> Self {
        Self::with_endpoint_types(["loopback", "sofia"])
    }

    pub fn with_endpoint_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoint_types: types.into_iter().map(Into::into).collect(),
            scripts: DashMap::new(),
            rejects: DashMap::new(),
            created: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Script for every leg dialed to `data`.
    pub fn script(&self, data: impl Into<String>, script: LegScript) -> &Self {
        self.scripts.insert(data.into(), script);
        self
    }

    /// Refuse creation of legs dialed to `data`.
    pub fn reject(&self, data: impl Into<String>, cause: CauseCode) -> &Self {
        self.rejects.insert(data.into(), cause);
        self
    }

    /// Creation attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<Arc<LoopbackChannel>> {
        self.created.lock().clone()
    }

    /// Legs created for `data`, in creation order.
    pub fn legs_for(&self, data: &str) -> Vec<Arc<LoopbackChannel>> {
        self.created
            .lock()
            .iter()
            .filter(|c| c.caller_profile().map(|p| p.destination_number == data).unwrap_or(false))
            .cloned()
            .collect()
    }
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelFactory for LoopbackFactory {
    async fn create_outgoing_channel(
        &self,
        endpoint_type: &str,
        data: &str,
        profile: CallerProfile,
        variables: &Variables,
    ) -> std::result::Result<ChannelHandle, CauseCode> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.endpoint_types.iter().any(|t| t == endpoint_type) {
            return Err(CauseCode::ChanNotImplemented);
        }
        if let Some(cause) = self.rejects.get(data) {
            return Err(*cause.value());
        }

        let script = self.scripts.get(data).map(|s| s.value().clone()).unwrap_or_default();
        let channel = LoopbackChannel::outbound(format!("{}/{}", endpoint_type, data), profile)
            .with_script(script);
        for (k, v) in variables {
            channel.set_variable(k, Some(v));
        }
        self.created.lock().push(channel.clone());
        Ok(channel)
    }
}

/// Bridge that records held-call bridges and marks the peer bridged.
#[derive(Default)]
pub struct RecordingBridge {
    bridged: Mutex<Vec<(String, String)>>,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(holding_uuid, peer_uuid)` pairs.
    pub fn bridged(&self) -> Vec<(String, String)> {
        self.bridged.lock().clone()
    }
}

#[async_trait]
impl CallBridge for RecordingBridge {
    async fn bridge_to_held(&self, holding_uuid: &str, peer: &ChannelHandle) -> Result<()> {
        self.bridged
            .lock()
            .push((holding_uuid.to_string(), peer.uuid().to_string()));
        peer.set_flag(ChannelFlag::Bridged, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OriginateStateHandler;

    #[tokio::test(start_paused = true)]
    async fn test_script_drives_flags() {
        let channel = LoopbackChannel::outbound("loopback/a", CallerProfile::default())
            .with_script(LegScript::new().wait(100).ring().wait(100).answer());
        channel.add_state_handler(Arc::new(OriginateStateHandler));
        channel.start_independent_execution().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.state(), ChannelState::ConsumeMedia);
        assert!(!channel.snapshot().flags.ring_ready);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(channel.snapshot().flags.ring_ready);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(channel.snapshot().flags.answered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_is_sticky_but_recorded() {
        let channel = LoopbackChannel::new("loopback/b");
        channel.hangup(CauseCode::UserBusy);
        channel.hangup(CauseCode::NoAnswer);
        assert_eq!(channel.cause(), CauseCode::UserBusy);
        assert_eq!(channel.hangup_calls(), vec![CauseCode::UserBusy, CauseCode::NoAnswer]);
        assert!(channel.read_frame(Duration::from_millis(20)).await.is_err());
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_endpoint() {
        let factory = LoopbackFactory::new();
        factory.reject("busy", CauseCode::UserBusy);
        let vars = Variables::new();

        let err = factory
            .create_outgoing_channel("iax", "x", CallerProfile::default(), &vars)
            .await
            .err();
        assert_eq!(err, Some(CauseCode::ChanNotImplemented));

        let err = factory
            .create_outgoing_channel("sofia", "busy", CallerProfile::default(), &vars)
            .await
            .err();
        assert_eq!(err, Some(CauseCode::UserBusy));
        assert_eq!(factory.attempts(), 2);
        assert!(factory.created().is_empty());
    }
}
