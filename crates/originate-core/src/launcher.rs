//! Leg launching
//!
//! Turns a [`LegSpec`] into a running outgoing channel: builds the caller
//! profile, asks the channel factory for a leg, installs variables and hooks,
//! announces the leg and hands it to its backend. The launcher never waits on
//! leg progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::channel::{ChannelHandle, OriginateStateHandler, StateHandler};
use crate::context::DialContext;
use crate::dialplan::{AndGroup, LegSpec};
use crate::engine::SwitchServices;
use crate::events::{SwitchEvent, SwitchEventKind};
use crate::types::{
    CallDirection, CallerProfile, CauseCode, ChannelFlag, ChannelSnapshot, Privacy,
    DEFAULT_CID_NAME, DEFAULT_CID_NUMBER,
};
use crate::variables::{is_true, names, parse_int, Variables};

/// Engine-side marks on a leg, shared with its confirmation collector.
#[derive(Debug, Default)]
struct LegMarks {
    tagged: bool,
    winner: bool,
    /// Race concluded; no further marks accepted.
    closed: bool,
}

/// Winner claim shared by every leg of one AND-group. Only one marker can
/// ever take it.
#[derive(Debug, Clone, Default)]
pub struct WinnerSlot(Arc<AtomicBool>);

impl WinnerSlot {
    fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to the marks of one leg. A default marker gets a slot of its own.
#[derive(Debug, Clone, Default)]
pub struct LegMarker {
    marks: Arc<Mutex<LegMarks>>,
    slot: WinnerSlot,
}

impl LegMarker {
    /// Marker for a leg racing inside the group owning `slot`.
    pub fn in_group(slot: &WinnerSlot) -> Self {
        Self {
            marks: Arc::default(),
            slot: slot.clone(),
        }
    }

    /// Tag the leg as awaiting confirmation. True only the first time.
    pub fn tag(&self) -> bool {
        let mut marks = self.marks.lock();
        if marks.tagged || marks.closed {
            return false;
        }
        marks.tagged = true;
        true
    }

    /// Mark the leg as confirmed winner. Fails once the race is closed or
    /// when a sibling already holds the group's winner slot.
    pub fn mark_winner(&self) -> bool {
        let mut marks = self.marks.lock();
        if marks.closed {
            return false;
        }
        if marks.winner {
            return true;
        }
        if !self.slot.claim() {
            return false;
        }
        marks.winner = true;
        true
    }

    pub fn close(&self) {
        self.marks.lock().closed = true;
    }

    pub fn is_tagged(&self) -> bool {
        self.marks.lock().tagged
    }

    pub fn is_winner(&self) -> bool {
        self.marks.lock().winner
    }

    /// `(tagged, winner)` read together.
    pub fn read(&self) -> (bool, bool) {
        let marks = self.marks.lock();
        (marks.tagged, marks.winner)
    }
}

/// A launched leg for the duration of one race.
pub struct LegRuntime {
    pub index: usize,
    pub spec: LegSpec,
    pub channel: ChannelHandle,
    pub profile: CallerProfile,
    pub marker: LegMarker,
    /// Hang up with `ALLOTTED_TIMEOUT` after this long.
    pub leg_timeout: Option<Duration>,
    /// Hang up with `PROGRESS_TIMEOUT` if no progress by then.
    pub leg_progress_timeout: Option<Duration>,
    /// Losing this leg ends the whole group.
    pub required: bool,
}

impl LegRuntime {
    pub fn snapshot(&self) -> ChannelSnapshot {
        self.channel.snapshot()
    }
}

impl std::fmt::Debug for LegRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegRuntime")
            .field("index", &self.index)
            .field("channel", &self.channel.name())
            .field("marker", &self.marker)
            .finish()
    }
}

/// Result of launching one AND-group.
#[derive(Debug, Default)]
pub struct LaunchReport {
    pub legs: Vec<LegRuntime>,
    /// Per-spec launch failures, in dial order.
    pub failures: Vec<(LegSpec, CauseCode)>,
}

impl LaunchReport {
    pub fn last_failure_cause(&self) -> Option<CauseCode> {
        self.failures.last().map(|(_, cause)| *cause)
    }
}

pub struct LegLauncher<'a> {
    services: &'a SwitchServices,
    ctx: &'a DialContext,
    notify: Arc<Notify>,
}

impl<'a> LegLauncher<'a> {
    pub fn new(services: &'a SwitchServices, ctx: &'a DialContext, notify: Arc<Notify>) -> Self {
        Self {
            services,
            ctx,
            notify,
        }
    }

    /// Launch every leg of a group. Failures do not stop sibling legs; in
    /// no-block mode the first successful leg ends the launch.
    pub async fn launch_group(&self, group: &AndGroup, forked: bool) -> LaunchReport {
        let mut report = LaunchReport::default();
        let slot = WinnerSlot::default();
        for spec in &group.legs {
            if !self.ctx.originator_ready() {
                debug!("Originator gone, not launching {}", spec);
                break;
            }
            match self.launch(report.legs.len(), spec, &slot, forked).await {
                Ok(leg) => {
                    report.legs.push(leg);
                    if self.ctx.flags.no_block {
                        break;
                    }
                }
                Err(cause) => report.failures.push((spec.clone(), cause)),
            }
        }
        report
    }

    pub async fn launch(
        &self,
        index: usize,
        spec: &LegSpec,
        slot: &WinnerSlot,
        forked: bool,
    ) -> Result<LegRuntime, CauseCode> {
        let profile = self.build_profile(spec);
        let vars = self.leg_variables(spec, forked);

        let channel = self
            .services
            .factory
            .create_outgoing_channel(&spec.endpoint_type, &spec.data, profile.clone(), &vars)
            .await
            .map_err(|cause| {
                error!(
                    "Cannot create outgoing channel of type [{}] cause: [{}]",
                    spec.endpoint_type, cause
                );
                cause
            })?;

        for (k, v) in &vars {
            channel.set_variable(k, Some(v));
        }

        self.services
            .events
            .fire(SwitchEvent::for_channel(SwitchEventKind::ChannelOriginate, channel.as_ref()));

        channel.set_flag(ChannelFlag::Originating, true);
        match &self.ctx.state_handlers {
            Some(handlers) => {
                for handler in handlers {
                    channel.add_state_handler(Arc::clone(handler));
                }
            }
            None => channel.add_state_handler(Arc::new(OriginateStateHandler) as Arc<dyn StateHandler>),
        }
        channel.watch(self.notify.clone());

        if !channel.is_running() {
            if let Err(e) = channel.start_independent_execution() {
                error!("Cannot start {}: {}", channel.name(), e);
                channel.hangup(CauseCode::DestinationOutOfOrder);
                return Err(CauseCode::DestinationOutOfOrder);
            }
        }

        let secs = |name: &str| {
            vars.get(name)
                .and_then(|v| parse_int(v))
                .filter(|n| *n > 0)
                .map(|n| Duration::from_secs(n as u64))
        };
        let leg = LegRuntime {
            index,
            spec: spec.clone(),
            profile,
            marker: LegMarker::in_group(slot),
            leg_timeout: secs(names::LEG_TIMEOUT),
            leg_progress_timeout: secs(names::LEG_PROGRESS_TIMEOUT),
            required: vars.get(names::LEG_REQUIRED).map(|v| is_true(v)).unwrap_or(false),
            channel,
        };
        info!("Originate leg {} launched: {}", index, leg.channel.name());
        Ok(leg)
    }

    fn build_profile(&self, spec: &LegSpec) -> CallerProfile {
        let ctx = self.ctx;
        let originator_profile = ctx.originator.as_ref().and_then(|o| o.caller_profile());
        let mut profile = ctx
            .profile_override
            .clone()
            .or_else(|| originator_profile.clone())
            .unwrap_or_else(|| {
                CallerProfile::new(
                    ctx.cid_name_override.as_deref().unwrap_or(DEFAULT_CID_NAME),
                    ctx.cid_num_override.as_deref().unwrap_or(DEFAULT_CID_NUMBER),
                )
            });

        if let (Some(orig), Some(orig_profile)) = (&ctx.originator, &originator_profile) {
            if ctx.profile_override.is_none() && orig.direction() == CallDirection::Outbound {
                // An outbound originator's far end becomes the new caller
                profile.caller_id_name = orig_profile
                    .callee_id_name
                    .clone()
                    .unwrap_or_else(|| orig_profile.destination_number.clone());
                profile.caller_id_number = orig_profile
                    .callee_id_number
                    .clone()
                    .unwrap_or_else(|| orig_profile.destination_number.clone());
            }
        }

        profile.uuid = None;
        profile.chan_name = None;
        profile.callee_id_name = None;
        profile.callee_id_number = None;
        profile.destination_number = spec.data.clone();
        profile.created = Utc::now();

        // Inline block, then the global block, then the request's override
        let leg_or = |name: &str, request: &Option<String>| {
            spec.variables
                .get(name)
                .or_else(|| ctx.variables.get(name))
                .cloned()
                .or_else(|| request.clone())
        };
        if let Some(name) = leg_or(names::ORIGINATION_CALLER_ID_NAME, &ctx.cid_name_override) {
            profile.caller_id_name = name;
        }
        if let Some(number) = leg_or(names::ORIGINATION_CALLER_ID_NUMBER, &ctx.cid_num_override) {
            profile.caller_id_number = number;
        }
        if let Some(privacy) = leg_or(names::ORIGINATION_PRIVACY, &None) {
            profile.privacy = Privacy::parse(&privacy);
        }
        profile
    }

    /// Variables installed on the new leg. Global variables win unless
    /// `local_var_clobber` lets the leg's inline block override them.
    fn leg_variables(&self, spec: &LegSpec, forked: bool) -> Variables {
        let globals = &self.ctx.variables;
        let clobber = spec
            .variables
            .get(names::LOCAL_VAR_CLOBBER)
            .or_else(|| globals.get(names::LOCAL_VAR_CLOBBER))
            .map(|v| is_true(v))
            .unwrap_or(false);

        let mut vars = Variables::new();
        let (first, second) = if clobber {
            (globals, &spec.variables)
        } else {
            (&spec.variables, globals)
        };
        for (k, v) in first.iter().chain(second.iter()) {
            vars.insert(k.clone(), v.clone());
        }
        vars.insert(
            names::ORIGINATE_EARLY_MEDIA.to_string(),
            self.ctx.tuning.early_ok.to_string(),
        );
        if forked {
            vars.insert(names::FORKED_DIAL.to_string(), "true".to_string());
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::dialplan::DialPlan;
    use crate::engine::OriginateRequest;
    use crate::loopback::{LoopbackChannel, LoopbackFactory};
    use pretty_assertions::assert_eq;

    fn setup(dial: &str, request: OriginateRequest) -> (Arc<LoopbackFactory>, SwitchServices, DialContext, DialPlan) {
        let factory = Arc::new(LoopbackFactory::new());
        let services = SwitchServices::new(factory.clone());
        let plan = DialPlan::parse(dial).unwrap();
        let ctx = DialContext::prepare(&request, &plan, &EngineConfig::default());
        (factory, services, ctx, plan)
    }

    #[tokio::test]
    async fn test_inline_caller_id_beats_global_and_request() {
        let dial = "{origination_caller_id_number=3000}[origination_caller_id_number=4000]sofia/a,sofia/b";
        let request = OriginateRequest::new(dial).caller_id("Desk", "2000");
        let (_factory, services, ctx, plan) = setup(dial, request);
        let launcher = LegLauncher::new(&services, &ctx, Arc::new(Notify::new()));

        let report = launcher.launch_group(&plan.or_groups[0].and_group, true).await;
        assert_eq!(report.legs.len(), 2);
        assert_eq!(report.legs[0].profile.caller_id_number, "4000");
        assert_eq!(report.legs[1].profile.caller_id_number, "3000");
        assert_eq!(report.legs[1].profile.caller_id_name, "Desk");
        assert_eq!(report.legs[0].profile.destination_number, "a");
    }

    #[tokio::test]
    async fn test_dial_string_caller_id_overrides_request() {
        let dial = "{origination_caller_id_number=3000}sofia/b";
        let request = OriginateRequest::new(dial).caller_id("Desk", "2000");
        let (_factory, services, ctx, plan) = setup(dial, request);
        let launcher = LegLauncher::new(&services, &ctx, Arc::new(Notify::new()));

        let report = launcher.launch_group(&plan.or_groups[0].and_group, false).await;
        assert_eq!(report.legs[0].profile.caller_id_number, "3000");
        assert_eq!(report.legs[0].profile.caller_id_name, "Desk");

        let dial = "sofia/b";
        let request = OriginateRequest::new(dial).caller_id("Desk", "2000");
        let (_factory, services, ctx, plan) = setup(dial, request);
        let launcher = LegLauncher::new(&services, &ctx, Arc::new(Notify::new()));
        let report = launcher.launch_group(&plan.or_groups[0].and_group, false).await;
        assert_eq!(report.legs[0].profile.caller_id_number, "2000");
    }

    #[tokio::test]
    async fn test_group_markers_share_one_winner() {
        let dial = "sofia/a,sofia/b";
        let (_factory, services, ctx, plan) = setup(dial, OriginateRequest::new(dial));
        let launcher = LegLauncher::new(&services, &ctx, Arc::new(Notify::new()));
        let report = launcher.launch_group(&plan.or_groups[0].and_group, true).await;

        let (a, b) = (&report.legs[0].marker, &report.legs[1].marker);
        assert!(b.mark_winner());
        assert!(!a.mark_winner());
        assert!(b.mark_winner());
        assert!(b.is_winner());
        assert!(!a.is_winner());

        // A new group starts with a free slot
        let again = launcher.launch_group(&plan.or_groups[0].and_group, true).await;
        assert!(again.legs[0].marker.mark_winner());
    }

    #[test]
    fn test_winner_slot_claimed_once_across_threads() {
        let slot = WinnerSlot::default();
        let markers: Vec<_> = (0..8).map(|_| LegMarker::in_group(&slot)).collect();
        let handles: Vec<_> = markers
            .iter()
            .cloned()
            .map(|m| std::thread::spawn(move || m.mark_winner()))
            .collect();
        let won = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(won, 1);
        assert!(slot.is_claimed());
        assert_eq!(markers.iter().filter(|m| m.is_winner()).count(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_does_not_stop_siblings() {
        let dial = "iax/a,sofia/b";
        let (factory, services, ctx, plan) = setup(dial, OriginateRequest::new(dial));
        let launcher = LegLauncher::new(&services, &ctx, Arc::new(Notify::new()));

        let report = launcher.launch_group(&plan.or_groups[0].and_group, true).await;
        assert_eq!(report.legs.len(), 1);
        assert_eq!(report.legs[0].index, 0);
        assert_eq!(report.last_failure_cause(), Some(CauseCode::ChanNotImplemented));
        assert_eq!(factory.attempts(), 2);
    }

    #[tokio::test]
    async fn test_leg_variables_and_flags() {
        let dial = "{leg_timeout=9,x=global}[x=local,leg_required=true]sofia/a";
        let (factory, services, ctx, plan) = setup(dial, OriginateRequest::new(dial));
        let launcher = LegLauncher::new(&services, &ctx, Arc::new(Notify::new()));

        let report = launcher.launch_group(&plan.or_groups[0].and_group, false).await;
        let leg = &report.legs[0];
        assert_eq!(leg.leg_timeout, Some(Duration::from_secs(9)));
        assert!(leg.required);
        assert_eq!(leg.channel.get_variable("x").as_deref(), Some("global"));
        assert_eq!(leg.channel.get_variable("originate_early_media").as_deref(), Some("true"));
        assert!(leg.channel.snapshot().flags.originating);
        assert!(leg.channel.is_running());
        assert_eq!(factory.created().len(), 1);
    }

    #[tokio::test]
    async fn test_local_var_clobber() {
        let dial = "{x=global,local_var_clobber=true}[x=local]sofia/a";
        let (_factory, services, ctx, plan) = setup(dial, OriginateRequest::new(dial));
        let launcher = LegLauncher::new(&services, &ctx, Arc::new(Notify::new()));
        let report = launcher.launch_group(&plan.or_groups[0].and_group, false).await;
        assert_eq!(report.legs[0].channel.get_variable("x").as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_outbound_originator_caller_id() {
        let dial = "sofia/b";
        let orig = LoopbackChannel::outbound("sofia/out", CallerProfile::new("Me", "100").with_destination("5551234"));
        let request = OriginateRequest::new(dial).with_originator(orig);
        let (_factory, services, ctx, plan) = setup(dial, request);
        let launcher = LegLauncher::new(&services, &ctx, Arc::new(Notify::new()));
        let report = launcher.launch_group(&plan.or_groups[0].and_group, false).await;
        assert_eq!(report.legs[0].profile.caller_id_number, "5551234");
    }

    #[test]
    fn test_marker_closes() {
        let marker = LegMarker::default();
        assert!(marker.tag());
        assert!(!marker.tag());
        marker.close();
        assert!(!marker.mark_winner());
        assert!(!marker.is_winner());
    }
}
