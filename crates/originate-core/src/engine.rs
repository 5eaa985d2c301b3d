//! Originate engine
//!
//! Entry point of the crate. [`OriginateEngine::originate`] parses a dial
//! string, then walks its OR-groups in order, launching and racing each
//! AND-group until one produces a winner. The whole sequence is retried up to
//! `originate_retries` times.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use softswitch_originate_core::{
//!     EngineConfig, LegScript, LoopbackFactory, OriginateEngine, OriginateRequest, SwitchServices,
//! };
//!
//! # async fn demo() -> softswitch_originate_core::Result<()> {
//! let factory = Arc::new(LoopbackFactory::new());
//! factory.script("1000", LegScript::new().wait(200).ring().wait(800).answer());
//!
//! let engine = OriginateEngine::new(SwitchServices::new(factory), EngineConfig::default());
//! let outcome = engine
//!     .originate(OriginateRequest::new("{originate_timeout=30}loopback/1000,loopback/1001").timeout(20))
//!     .await?;
//! println!("{} after {} attempt(s)", outcome.cause, outcome.attempts);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::applications::{ApplicationRegistry, ApplicationTable};
use crate::cdr::{CdrGenerator, XmlCdrGenerator};
use crate::channel::{CallBridge, ChannelFactory, ChannelHandle, NoHoldingBridge, StateHandler};
use crate::config::EngineConfig;
use crate::context::DialContext;
use crate::dialplan::{DialPlan, LegSpec, ParseOptions};
use crate::errors::{OriginateError, Result};
use crate::events::{BroadcastEventBus, EventBus};
use crate::launcher::LegLauncher;
use crate::outcome::{Disposal, LegDisposition, OutcomeResolver};
use crate::race::{RaceCoordinator, RaceOutcome, RaceReport};
use crate::ringback::RingbackStats;
use crate::types::{CallerProfile, CauseCode, ChannelFlag, OriginateFlags, OriginateStatus};
use crate::variables::{names, Variables};

/// Collaborators the engine consumes from the rest of the switch.
#[derive(Clone)]
pub struct SwitchServices {
    pub factory: Arc<dyn ChannelFactory>,
    pub events: Arc<dyn EventBus>,
    pub cdr: Arc<dyn CdrGenerator>,
    pub applications: Arc<dyn ApplicationRegistry>,
    pub bridge: Arc<dyn CallBridge>,
}

impl SwitchServices {
    /// Services around `factory` with a broadcast event bus, the XML CDR
    /// generator, an empty application table and no held calls.
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            factory,
            events: Arc::new(BroadcastEventBus::default()),
            cdr: Arc::new(XmlCdrGenerator),
            applications: Arc::new(ApplicationTable::new()),
            bridge: Arc::new(NoHoldingBridge),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_cdr(mut self, cdr: Arc<dyn CdrGenerator>) -> Self {
        self.cdr = cdr;
        self
    }

    pub fn with_applications(mut self, applications: Arc<dyn ApplicationRegistry>) -> Self {
        self.applications = applications;
        self
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn CallBridge>) -> Self {
        self.bridge = bridge;
        self
    }
}

/// One `originate` invocation.
#[derive(Clone)]
pub struct OriginateRequest {
    pub dial_string: String,
    pub originator: Option<ChannelHandle>,
    /// Seconds; 0 uses the engine default.
    pub timeout_secs: u32,
    pub variables: Option<Variables>,
    pub state_handlers: Option<Vec<Arc<dyn StateHandler>>>,
    pub cid_name_override: Option<String>,
    pub cid_num_override: Option<String>,
    pub caller_profile_override: Option<CallerProfile>,
    pub flags: OriginateFlags,
    pub cancel: Option<CancellationToken>,
    /// Cause forced on every leg when `cancel` fires.
    pub cancel_cause: CauseCode,
}

impl OriginateRequest {
    pub fn new(dial_string: impl Into<String>) -> Self {
        Self {
            dial_string: dial_string.into(),
            originator: None,
            timeout_secs: 0,
            variables: None,
            state_handlers: None,
            cid_name_override: None,
            cid_num_override: None,
            caller_profile_override: None,
            flags: OriginateFlags::default(),
            cancel: None,
            cancel_cause: CauseCode::OriginatorCancel,
        }
    }

    pub fn with_originator(mut self, originator: ChannelHandle) -> Self {
        self.originator = Some(originator);
        self
    }

    pub fn timeout(mut self, secs: u32) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn caller_id(mut self, name: impl Into<String>, number: impl Into<String>) -> Self {
        self.cid_name_override = Some(name.into());
        self.cid_num_override = Some(number.into());
        self
    }

    pub fn caller_profile(mut self, profile: CallerProfile) -> Self {
        self.caller_profile_override = Some(profile);
        self
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables
            .get_or_insert_with(Variables::new)
            .insert(name.into(), value.into());
        self
    }

    /// Replace the engine's own leg hooks.
    pub fn state_handlers(mut self, handlers: Vec<Arc<dyn StateHandler>>) -> Self {
        self.state_handlers = Some(handlers);
        self
    }

    pub fn no_block(mut self) -> Self {
        self.flags.no_block = true;
        self
    }

    pub fn forked_dial(mut self) -> Self {
        self.flags.forked_dial = true;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken, cause: CauseCode) -> Self {
        self.cancel = Some(token);
        self.cancel_cause = cause;
        self
    }
}

/// What an `originate` call produced.
#[derive(Clone)]
pub struct OriginateOutcome {
    pub winner: Option<ChannelHandle>,
    pub cause: CauseCode,
    pub status: OriginateStatus,
    /// Whole-sequence attempts made.
    pub attempts: u32,
    /// How every launched leg was disposed of, across groups and attempts.
    pub dispositions: Vec<LegDisposition>,
    /// How the last race ended, if any race ran.
    pub last_race: Option<RaceOutcome>,
    pub launch_failures: Vec<(LegSpec, CauseCode)>,
}

impl OriginateOutcome {
    fn pending() -> Self {
        Self {
            winner: None,
            cause: CauseCode::None,
            status: OriginateStatus::Failure,
            attempts: 0,
            dispositions: Vec::new(),
            last_race: None,
            launch_failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The winner, or the failure as an error.
    pub fn into_result(self) -> Result<ChannelHandle> {
        if let Some(winner) = self.winner.filter(|_| self.status.is_success()) {
            return Ok(winner);
        }
        Err(match self.last_race {
            Some(RaceOutcome::Timeout) => OriginateError::RaceTimeout,
            Some(RaceOutcome::Cancelled) => OriginateError::RaceCancelled(self.cause),
            None if !self.launch_failures.is_empty() => {
                let (spec, cause) = &self.launch_failures[self.launch_failures.len() - 1];
                OriginateError::Launch {
                    endpoint: spec.endpoint_type.clone(),
                    cause: *cause,
                }
            }
            _ => OriginateError::RaceAllRejected,
        })
    }
}

impl std::fmt::Debug for OriginateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginateOutcome")
            .field("winner", &self.winner.as_ref().map(|w| w.name().to_string()))
            .field("cause", &self.cause)
            .field("status", &self.status)
            .field("attempts", &self.attempts)
            .field("dispositions", &self.dispositions)
            .field("last_race", &self.last_race)
            .finish()
    }
}

pub struct OriginateEngine {
    services: SwitchServices,
    config: EngineConfig,
}

impl OriginateEngine {
    pub fn new(services: SwitchServices, config: EngineConfig) -> Self {
        Self { services, config }
    }

    pub fn services(&self) -> &SwitchServices {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dial `request.dial_string` and return the winning leg, if any.
    ///
    /// Only malformed dial strings are returned as errors; every other failure
    /// is reported through the outcome's cause and status.
    pub async fn originate(&self, request: OriginateRequest) -> Result<OriginateOutcome> {
        let plan = DialPlan::parse_with(
            &request.dial_string,
            ParseOptions {
                no_block: request.flags.no_block,
                max_peers: self.config.max_peers,
            },
        )?;
        let ctx = DialContext::prepare(&request, &plan, &self.config);
        let tuning = &ctx.tuning;
        info!(
            "Originate {} legs in {} groups, timeout {:?}, {} attempt(s)",
            plan.leg_count(),
            plan.or_groups.len(),
            tuning.timeout,
            tuning.retries
        );

        let mut outcome = OriginateOutcome::pending();
        'attempts: for attempt in 0..tuning.retries {
            if attempt > 0 {
                info!(
                    "Originate attempt {}/{} in {} ms",
                    attempt + 1,
                    tuning.retries,
                    tuning.retry_sleep.as_millis()
                );
                tokio::select! {
                    _ = tokio::time::sleep(tuning.retry_sleep) => {}
                    _ = ctx.cancel.cancelled() => {}
                }
            }
            if !self.may_continue(&ctx, &mut outcome) {
                break;
            }
            outcome.attempts = attempt + 1;

            for (group_idx, group) in plan.or_groups.iter().enumerate() {
                if !self.may_continue(&ctx, &mut outcome) {
                    break 'attempts;
                }
                debug!("Dialing OR group {}/{}", group_idx + 1, plan.or_groups.len());

                let notify = Arc::new(Notify::new());
                let forked = group.and_group.len() > 1
                    || plan.or_groups.len() > 1
                    || tuning.forked_dial
                    || ctx.flags.forked_dial;
                let launch = LegLauncher::new(&self.services, &ctx, notify.clone())
                    .launch_group(&group.and_group, forked)
                    .await;
                outcome.launch_failures.extend(launch.failures.iter().cloned());

                if ctx.flags.no_block {
                    if let Some(leg) = launch.legs.first() {
                        leg.channel.set_flag(ChannelFlag::Originating, false);
                        info!("Originate returning {} without waiting", leg.channel.name());
                        outcome.winner = Some(leg.channel.clone());
                        outcome.cause = CauseCode::Success;
                        outcome.status = OriginateStatus::Success;
                        outcome.dispositions.push(LegDisposition {
                            index: leg.index,
                            uuid: leg.channel.uuid().to_string(),
                            channel_name: leg.channel.name().to_string(),
                            disposal: Disposal::Promoted,
                        });
                        return Ok(outcome);
                    }
                }

                let race = if launch.legs.is_empty() {
                    warn!("No legs could be launched for OR group {}", group_idx + 1);
                    RaceReport {
                        outcome: RaceOutcome::AllRejected,
                        force_reason: None,
                        ring_seen: false,
                        progress_seen: false,
                        elapsed: Duration::ZERO,
                        confirmations: 0,
                        ringback: RingbackStats::default(),
                    }
                } else {
                    RaceCoordinator::new(&self.services, &ctx, &launch.legs, notify)
                        .run()
                        .instrument(info_span!("race", attempt = attempt + 1, group = group_idx + 1))
                        .await
                };

                let resolution = OutcomeResolver::new(&self.services, &ctx)
                    .resolve(&launch.legs, &race, launch.last_failure_cause())
                    .await;
                outcome.last_race = (!launch.legs.is_empty()).then_some(race.outcome);
                outcome.dispositions.extend(resolution.dispositions);
                outcome.cause = resolution.cause;
                outcome.status = resolution.status;
                outcome.winner = resolution.winner;

                if outcome.is_success() {
                    return Ok(outcome);
                }
                if race.outcome == RaceOutcome::Cancelled {
                    break 'attempts;
                }
            }
        }

        if outcome.cause == CauseCode::None {
            outcome.cause = CauseCode::OriginatorCancel;
        }
        if let Some(orig) = &ctx.originator {
            orig.set_variable(names::ORIGINATE_DISPOSITION, Some(outcome.cause.as_str()));
        }
        info!("Originate failed after {} attempt(s): {}", outcome.attempts, outcome.cause);
        Ok(outcome)
    }

    /// False once the requester cancelled or the originator went away.
    fn may_continue(&self, ctx: &DialContext, outcome: &mut OriginateOutcome) -> bool {
        if ctx.cancel.is_cancelled() {
            debug!("Originate cancelled before dialing");
            if outcome.cause == CauseCode::None {
                outcome.cause = ctx.cancel_cause;
            }
            return false;
        }
        if !ctx.originator_ready() {
            debug!("Originator gone, not dialing");
            if outcome.cause == CauseCode::None {
                outcome.cause = CauseCode::OriginatorCancel;
            }
            return false;
        }
        true
    }
}
