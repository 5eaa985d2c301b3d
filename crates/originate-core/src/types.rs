//! Common types shared by every stage of an originate call

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telephony disposition of a leg or a whole originate call.
///
/// The set mirrors the causes the signaling layer reports; the engine only
/// ever selects among them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CauseCode {
    None,
    UnallocatedNumber,
    NoRouteDestination,
    NormalClearing,
    UserBusy,
    NoUserResponse,
    NoAnswer,
    SubscriberAbsent,
    CallRejected,
    DestinationOutOfOrder,
    InvalidNumberFormat,
    NormalUnspecified,
    NormalTemporaryFailure,
    SwitchCongestion,
    ChanNotImplemented,
    IncompatibleDestination,
    RecoveryOnTimerExpire,
    Success,
    OriginatorCancel,
    LoseRace,
    ManagerRequest,
    AllottedTimeout,
    MediaTimeout,
    UserNotRegistered,
    ProgressTimeout,
    AttendedTransfer,
}

impl CauseCode {
    const ALL: [CauseCode; 26] = [
        CauseCode::None,
        CauseCode::UnallocatedNumber,
        CauseCode::NoRouteDestination,
        CauseCode::NormalClearing,
        CauseCode::UserBusy,
        CauseCode::NoUserResponse,
        CauseCode::NoAnswer,
        CauseCode::SubscriberAbsent,
        CauseCode::CallRejected,
        CauseCode::DestinationOutOfOrder,
        CauseCode::InvalidNumberFormat,
        CauseCode::NormalUnspecified,
        CauseCode::NormalTemporaryFailure,
        CauseCode::SwitchCongestion,
        CauseCode::ChanNotImplemented,
        CauseCode::IncompatibleDestination,
        CauseCode::RecoveryOnTimerExpire,
        CauseCode::Success,
        CauseCode::OriginatorCancel,
        CauseCode::LoseRace,
        CauseCode::ManagerRequest,
        CauseCode::AllottedTimeout,
        CauseCode::MediaTimeout,
        CauseCode::UserNotRegistered,
        CauseCode::ProgressTimeout,
        CauseCode::AttendedTransfer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::UnallocatedNumber => "UNALLOCATED_NUMBER",
            Self::NoRouteDestination => "NO_ROUTE_DESTINATION",
            Self::NormalClearing => "NORMAL_CLEARING",
            Self::UserBusy => "USER_BUSY",
            Self::NoUserResponse => "NO_USER_RESPONSE",
            Self::NoAnswer => "NO_ANSWER",
            Self::SubscriberAbsent => "SUBSCRIBER_ABSENT",
            Self::CallRejected => "CALL_REJECTED",
            Self::DestinationOutOfOrder => "DESTINATION_OUT_OF_ORDER",
            Self::InvalidNumberFormat => "INVALID_NUMBER_FORMAT",
            Self::NormalUnspecified => "NORMAL_UNSPECIFIED",
            Self::NormalTemporaryFailure => "NORMAL_TEMPORARY_FAILURE",
            Self::SwitchCongestion => "SWITCH_CONGESTION",
            Self::ChanNotImplemented => "CHAN_NOT_IMPLEMENTED",
            Self::IncompatibleDestination => "INCOMPATIBLE_DESTINATION",
            Self::RecoveryOnTimerExpire => "RECOVERY_ON_TIMER_EXPIRE",
            Self::Success => "SUCCESS",
            Self::OriginatorCancel => "ORIGINATOR_CANCEL",
            Self::LoseRace => "LOSE_RACE",
            Self::ManagerRequest => "MANAGER_REQUEST",
            Self::AllottedTimeout => "ALLOTTED_TIMEOUT",
            Self::MediaTimeout => "MEDIA_TIMEOUT",
            Self::UserNotRegistered => "USER_NOT_REGISTERED",
            Self::ProgressTimeout => "PROGRESS_TIMEOUT",
            Self::AttendedTransfer => "ATTENDED_TRANSFER",
        }
    }

    /// Numeric cause as carried in Q.850 / switch-specific reason headers.
    pub fn code(self) -> u16 {
        match self {
            Self::None => 0,
            Self::UnallocatedNumber => 1,
            Self::NoRouteDestination => 3,
            Self::NormalClearing => 16,
            Self::UserBusy => 17,
            Self::NoUserResponse => 18,
            Self::NoAnswer => 19,
            Self::SubscriberAbsent => 20,
            Self::CallRejected => 21,
            Self::DestinationOutOfOrder => 27,
            Self::InvalidNumberFormat => 28,
            Self::NormalUnspecified => 31,
            Self::NormalTemporaryFailure => 41,
            Self::SwitchCongestion => 42,
            Self::ChanNotImplemented => 66,
            Self::IncompatibleDestination => 88,
            Self::RecoveryOnTimerExpire => 102,
            Self::Success => 142,
            Self::OriginatorCancel => 487,
            Self::LoseRace => 502,
            Self::ManagerRequest => 503,
            Self::AllottedTimeout => 602,
            Self::MediaTimeout => 604,
            Self::UserNotRegistered => 606,
            Self::ProgressTimeout => 607,
            Self::AttendedTransfer => 800,
        }
    }

    /// Causes that say nothing about why a call failed.
    pub fn is_unset(self) -> bool {
        matches!(self, Self::None | Self::Success)
    }
}

impl fmt::Display for CauseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CauseCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<u16>() {
            return Self::ALL.iter().copied().find(|c| c.code() == code).ok_or(());
        }
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

/// Lifecycle state of a channel, ordered so that `state >= Hangup` means gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    New,
    Init,
    Routing,
    SoftExecute,
    Execute,
    ExchangeMedia,
    Park,
    ConsumeMedia,
    Hibernate,
    Reset,
    Hangup,
    Reporting,
    Destroy,
}

impl ChannelState {
    pub fn is_down(self) -> bool {
        self >= ChannelState::Hangup
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "CS_NEW",
            Self::Init => "CS_INIT",
            Self::Routing => "CS_ROUTING",
            Self::SoftExecute => "CS_SOFT_EXECUTE",
            Self::Execute => "CS_EXECUTE",
            Self::ExchangeMedia => "CS_EXCHANGE_MEDIA",
            Self::Park => "CS_PARK",
            Self::ConsumeMedia => "CS_CONSUME_MEDIA",
            Self::Hibernate => "CS_HIBERNATE",
            Self::Reset => "CS_RESET",
            Self::Hangup => "CS_HANGUP",
            Self::Reporting => "CS_REPORTING",
            Self::Destroy => "CS_DESTROY",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Channel flags the engine reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelFlag {
    Originating,
    Answered,
    EarlyMedia,
    RingReady,
    Transfer,
    Redirect,
    Bridged,
    ProxyMode,
}

/// Flag view of a channel, taken under one lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFlags {
    pub originating: bool,
    pub answered: bool,
    pub early_media: bool,
    pub ring_ready: bool,
    pub transfer: bool,
    pub redirect: bool,
    pub bridged: bool,
    pub proxy_mode: bool,
}

impl ChannelFlags {
    pub fn get(&self, flag: ChannelFlag) -> bool {
        match flag {
            ChannelFlag::Originating => self.originating,
            ChannelFlag::Answered => self.answered,
            ChannelFlag::EarlyMedia => self.early_media,
            ChannelFlag::RingReady => self.ring_ready,
            ChannelFlag::Transfer => self.transfer,
            ChannelFlag::Redirect => self.redirect,
            ChannelFlag::Bridged => self.bridged,
            ChannelFlag::ProxyMode => self.proxy_mode,
        }
    }

    pub fn set(&mut self, flag: ChannelFlag, on: bool) {
        let slot = match flag {
            ChannelFlag::Originating => &mut self.originating,
            ChannelFlag::Answered => &mut self.answered,
            ChannelFlag::EarlyMedia => &mut self.early_media,
            ChannelFlag::RingReady => &mut self.ring_ready,
            ChannelFlag::Transfer => &mut self.transfer,
            ChannelFlag::Redirect => &mut self.redirect,
            ChannelFlag::Bridged => &mut self.bridged,
            ChannelFlag::ProxyMode => &mut self.proxy_mode,
        };
        *slot = on;
    }
}

/// Consistent view of one channel at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub state: ChannelState,
    pub flags: ChannelFlags,
    pub cause: CauseCode,
}

impl ChannelSnapshot {
    /// Up and able to carry a call.
    pub fn is_ready(&self) -> bool {
        !self.state.is_down() && self.state != ChannelState::Reset
    }

    /// Left the race: hung up, reset, moved elsewhere, or released by its backend.
    pub fn is_gone(&self) -> bool {
        self.state.is_down()
            || self.state == ChannelState::Reset
            || self.flags.transfer
            || self.flags.redirect
            || self.flags.bridged
            || !self.flags.originating
    }
}

/// Caller identity and routing data attached to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerProfile {
    pub caller_id_name: String,
    pub caller_id_number: String,
    pub callee_id_name: Option<String>,
    pub callee_id_number: Option<String>,
    pub destination_number: String,
    pub context: String,
    pub dialplan: String,
    pub uuid: Option<String>,
    pub chan_name: Option<String>,
    pub privacy: Privacy,
    pub created: DateTime<Utc>,
}

pub const DEFAULT_CID_NAME: &str = "Unknown";
pub const DEFAULT_CID_NUMBER: &str = "0000000000";

impl CallerProfile {
    pub fn new(caller_id_name: impl Into<String>, caller_id_number: impl Into<String>) -> Self {
        Self {
            caller_id_name: caller_id_name.into(),
            caller_id_number: caller_id_number.into(),
            callee_id_name: None,
            callee_id_number: None,
            destination_number: String::new(),
            context: "default".to_string(),
            dialplan: "XML".to_string(),
            uuid: None,
            chan_name: None,
            privacy: Privacy::default(),
            created: Utc::now(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination_number = destination.into();
        self
    }
}

impl Default for CallerProfile {
    fn default() -> Self {
        Self::new(DEFAULT_CID_NAME, DEFAULT_CID_NUMBER)
    }
}

/// Caller-id presentation restrictions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Privacy {
    pub screen: bool,
    pub hide_name: bool,
    pub hide_number: bool,
}

impl Privacy {
    /// Parse an `origination_privacy` value such as `"screen+hide_name"`.
    pub fn parse(value: &str) -> Self {
        let mut privacy = Privacy::default();
        let lower = value.to_ascii_lowercase();
        if lower.contains("screen") {
            privacy.screen = true;
        }
        if lower.contains("hide_name") {
            privacy.hide_name = true;
        }
        if lower.contains("hide_number") {
            privacy.hide_number = true;
        }
        privacy
    }
}

/// Flags for one originate call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OriginateFlags {
    /// Return the first launched leg without racing.
    pub no_block: bool,
    /// Force forked-dial semantics even for a single leg.
    pub forked_dial: bool,
}

/// Final status of an originate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OriginateStatus {
    Success,
    Failure,
}

impl OriginateStatus {
    pub fn is_success(self) -> bool {
        self == OriginateStatus::Success
    }
}

/// Codec implementation as seen by the media layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecImpl {
    pub name: String,
    pub sample_rate: u32,
    pub ptime_ms: u32,
    pub channels: u16,
    /// Encoded media cannot be decoded to PCM.
    pub passthrough: bool,
}

impl CodecImpl {
    /// Raw signed 16-bit linear PCM at the given rate and packet time.
    pub fn linear(sample_rate: u32, ptime_ms: u32, channels: u16) -> Self {
        Self {
            name: "L16".to_string(),
            sample_rate,
            ptime_ms,
            channels,
            passthrough: false,
        }
    }

    pub fn samples_per_packet(&self) -> usize {
        (self.sample_rate as usize * self.ptime_ms as usize / 1000) * self.channels.max(1) as usize
    }

    pub fn packet_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ptime_ms.max(1) as u64)
    }
}

/// One media frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    pub samples: usize,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Frame {
    /// Build an L16 frame from little-endian samples.
    pub fn from_samples(samples: &[i16], sample_rate: u32, channels: u16) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        Self {
            data: Bytes::from(data),
            samples: samples.len(),
            sample_rate,
            channels,
        }
    }

    pub fn is_silent(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_code_names_round_trip() {
        for cause in CauseCode::ALL {
            assert_eq!(cause.as_str().parse::<CauseCode>(), Ok(cause));
        }
        assert_eq!("no_answer".parse::<CauseCode>(), Ok(CauseCode::NoAnswer));
        assert_eq!("487".parse::<CauseCode>(), Ok(CauseCode::OriginatorCancel));
        assert!("NOT_A_CAUSE".parse::<CauseCode>().is_err());
    }

    #[test]
    fn test_gone_classification() {
        let mut snap = ChannelSnapshot {
            state: ChannelState::ConsumeMedia,
            flags: ChannelFlags {
                originating: true,
                ..Default::default()
            },
            cause: CauseCode::None,
        };
        assert!(!snap.is_gone());
        assert!(snap.is_ready());

        snap.flags.bridged = true;
        assert!(snap.is_gone());

        snap.flags.bridged = false;
        snap.state = ChannelState::Reset;
        assert!(snap.is_gone());
        assert!(!snap.is_ready());

        snap.state = ChannelState::Routing;
        snap.flags.originating = false;
        assert!(snap.is_gone());
    }

    #[test]
    fn test_privacy_parse() {
        let p = Privacy::parse("screen+hide_number");
        assert!(p.screen);
        assert!(!p.hide_name);
        assert!(p.hide_number);
    }

    #[test]
    fn test_linear_codec_packet_size() {
        let codec = CodecImpl::linear(8000, 20, 1);
        assert_eq!(codec.samples_per_packet(), 160);
        let wide = CodecImpl::linear(16000, 30, 1);
        assert_eq!(wide.samples_per_packet(), 480);
    }
}
