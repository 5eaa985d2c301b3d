//! # Soft-switch Originate Core
//!
//! Call origination and fan-out dialing for a soft-switch.
//!
//! Given a dial string such as
//! `{originate_timeout=30}[leg_timeout=10]sofia/alice,sofia/bob|sofia/voicemail`,
//! the engine launches the legs of each AND-group in parallel, races them until
//! one answers (or sends early media, or is confirmed by DTMF), disposes of the
//! losers and hands the winner back to the caller. OR-groups are tried in order
//! and the whole sequence may be retried.
//!
//! ## Features
//!
//! - **Dial-string parsing**: global `{...}` and per-leg `[...]` variable blocks,
//!   `,` forks and `|` failover
//! - **Race coordination**: notification-driven, deterministic winner selection,
//!   overall/progress/per-leg deadlines, `fail_on_single_reject`, `leg_required`
//! - **Group confirmation**: DTMF key or dialplan application per leg
//! - **Ringback**: tone scripts, looping WAV files or comfort noise toward the
//!   originator while legs ring
//! - **Outcome resolution**: exactly-once leg disposal, originator
//!   answer/pre-answer, variable import, failed-leg XML CDRs, retries
//!
//! ## Architecture
//!
//! - `dialplan`: dial-string parser
//! - `context`: per-call variables and tuning
//! - `launcher`: leg creation through the channel factory
//! - `race`: race monitor and its state
//! - `ringback`: media pump toward the originator
//! - `confirm`: per-leg confirmation collectors
//! - `outcome`: loser disposal and overall cause
//! - `engine`: the public `originate` operation
//! - `channel`, `events`, `cdr`, `applications`: interfaces to the rest of the switch
//! - `loopback`: in-memory backend for tests and demos

pub mod applications;
pub mod cdr;
pub mod channel;
pub mod config;
pub mod confirm;
pub mod context;
pub mod dialplan;
pub mod engine;
pub mod errors;
pub mod events;
pub mod launcher;
pub mod logging;
pub mod loopback;
pub mod outcome;
pub mod race;
pub mod ringback;
pub mod supervisor;
pub mod types;
pub mod variables;

// Re-export key types
pub use applications::{Application, ApplicationRegistry, ApplicationTable};
pub use cdr::{CdrGenerator, XmlCdrGenerator};
pub use channel::{CallBridge, Channel, ChannelFactory, ChannelHandle, StateHandler};
pub use config::{DialTuning, EngineConfig, RejectPolicy};
pub use dialplan::{DialPlan, LegSpec, MAX_PEERS};
pub use engine::{OriginateEngine, OriginateOutcome, OriginateRequest, SwitchServices};
pub use errors::{OriginateError, Result};
pub use events::{BroadcastEventBus, EventBus, SwitchEvent, SwitchEventKind};
pub use logging::{parse_log_level, setup_logging, LoggingConfig};
pub use loopback::{LegScript, LoopbackChannel, LoopbackFactory, RecordingBridge};
pub use outcome::{Disposal, LegDisposition};
pub use race::RaceOutcome;
pub use types::{
    CallDirection, CallerProfile, CauseCode, ChannelFlag, ChannelState, OriginateFlags,
    OriginateStatus,
};
pub use variables::Variables;
