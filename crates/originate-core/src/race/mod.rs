//! Race coordination for one AND-group
//!
//! ## Features
//!
//! - Notification-driven monitor with the engine tick as coalescing window
//! - Deterministic winner selection in launch order from one snapshot per pass
//! - Overall and progress deadlines, per-leg `leg_timeout` and
//!   `leg_progress_timeout`
//! - Group confirmation through supervised collectors
//! - `fail_on_single_reject` and `leg_required` aborts
//! - Ringback armed on first progress, stopped before the race returns
//!
//! The coordinator never blocks on a leg. Legs poke the shared [`Notify`] on
//! every change; the monitor wakes on that or on the tick, whichever comes
//! first, and evaluates a fresh snapshot of every leg.

mod state;

pub use state::{RaceOutcome, RaceReport, RaceState};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::confirm::ConfirmationCollector;
use crate::context::DialContext;
use crate::engine::SwitchServices;
use crate::launcher::LegRuntime;
use crate::ringback::{RingbackHandle, RingbackPlayer, RingbackStats};
use crate::supervisor::TaskSupervisor;
use crate::types::{CauseCode, ChannelSnapshot, ChannelState};

pub struct RaceCoordinator<'a> {
    services: &'a SwitchServices,
    ctx: &'a DialContext,
    legs: &'a [LegRuntime],
    notify: Arc<Notify>,
}

impl<'a> RaceCoordinator<'a> {
    pub fn new(
        services: &'a SwitchServices,
        ctx: &'a DialContext,
        legs: &'a [LegRuntime],
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            services,
            ctx,
            legs,
            notify,
        }
    }

    /// Race the legs until a terminal state.
    pub async fn run(&self) -> RaceReport {
        let tuning = &self.ctx.tuning;
        let mut state = RaceState::new(Instant::now());
        let deadline = state.started + tuning.timeout;
        let progress_deadline = state.started + tuning.progress_timeout;
        let tick = self.ctx.config.tick();

        let supervisor = TaskSupervisor::child_of(
            &self.ctx.cancel,
            "originate-race",
            Duration::from_millis(self.ctx.config.collector_shutdown_ms),
        );
        let mut ringback = self.start_ringback(&supervisor);
        let mut ring_forwarded = false;
        let mut routed = false;
        let mut confirmations = 0;

        debug!(
            "Racing {} legs, timeout {:?}, progress timeout {:?}",
            self.legs.len(),
            tuning.timeout,
            tuning.progress_timeout
        );

        loop {
            if self.ctx.cancel.is_cancelled() {
                debug!("Originate cancelled by requester");
                state.force(self.ctx.cancel_cause);
                state.settle(RaceOutcome::Cancelled);
                break;
            }
            if !self.ctx.originator_ready() {
                debug!("Originator hung up, cancelling race");
                state.settle(RaceOutcome::Cancelled);
                break;
            }

            let now = Instant::now();
            if self.legs.is_empty() {
                state.settle(RaceOutcome::AllRejected);
                break;
            }

            self.enforce_leg_timers(&mut state, now);
            let snapshots: Vec<ChannelSnapshot> = self.legs.iter().map(LegRuntime::snapshot).collect();

            if !routed {
                routed = snapshots
                    .iter()
                    .all(|s| s.state >= ChannelState::Routing || s.is_gone());
            }
            if routed {
                let had_progress = state.has_progress();
                self.observe_progress(&mut state, &snapshots);
                if !had_progress && state.has_progress() {
                    self.on_first_progress(&state, &snapshots, ringback.as_ref(), &mut ring_forwarded);
                }
                confirmations += self.evaluate(&mut state, &snapshots, &supervisor);
                if state.is_settled() {
                    break;
                }
            }

            if !state.has_progress() && now >= progress_deadline {
                info!("Originate progress timeout after {:?}", state.elapsed());
                state.force(CauseCode::ProgressTimeout);
                state.settle(RaceOutcome::Timeout);
                break;
            }
            if now >= deadline {
                info!("Originate timeout after {:?}", state.elapsed());
                state.settle(RaceOutcome::Timeout);
                break;
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(tick) => {}
                _ = self.ctx.cancel.cancelled() => {}
            }
        }

        for leg in self.legs {
            leg.marker.close();
        }
        let ringback = match ringback.as_mut() {
            Some(handle) => handle.stop().await,
            None => RingbackStats::default(),
        };
        supervisor.shutdown().await;

        let outcome = state.outcome().unwrap_or(RaceOutcome::Timeout);
        info!("Race ended: {} after {:?}", outcome, state.elapsed());
        RaceReport {
            outcome,
            force_reason: state.force_reason(),
            ring_seen: state.ring_seen,
            progress_seen: state.progress_seen,
            elapsed: state.elapsed(),
            confirmations,
            ringback,
        }
    }

    fn start_ringback(&self, supervisor: &TaskSupervisor) -> Option<RingbackHandle> {
        let originator = self.ctx.originator.as_ref()?;
        originator.read_codec()?;
        let handle = RingbackPlayer::new(
            Arc::clone(originator),
            self.ctx.ringback.clone(),
            self.ctx.config.silence_level,
        )
        .spawn(&supervisor.token());
        if self.ctx.tuning.instant_ringback && self.ctx.ringback.is_some() {
            handle.arm();
        }
        Some(handle)
    }

    /// Hang up legs whose own timers expired.
    fn enforce_leg_timers(&self, state: &mut RaceState, now: Instant) {
        for leg in self.legs {
            let snap = leg.snapshot();
            if snap.is_gone() {
                continue;
            }
            if let Some(limit) = leg.leg_timeout {
                if now >= state.started + limit {
                    debug!("Leg {} exceeded leg_timeout", leg.channel.name());
                    leg.channel.hangup(CauseCode::AllottedTimeout);
                    continue;
                }
            }
            if let Some(limit) = leg.leg_progress_timeout {
                let progressed = snap.flags.ring_ready || snap.flags.early_media || snap.flags.answered;
                if !progressed && now >= state.started + limit {
                    debug!("Leg {} exceeded leg_progress_timeout", leg.channel.name());
                    leg.channel.hangup(CauseCode::ProgressTimeout);
                    state.force(CauseCode::ProgressTimeout);
                }
            }
        }
    }

    fn observe_progress(&self, state: &mut RaceState, snapshots: &[ChannelSnapshot]) {
        for snap in snapshots.iter().filter(|s| !s.state.is_down()) {
            if snap.flags.ring_ready && !state.ring_seen {
                state.ring_seen = true;
            }
            if snap.flags.early_media && !state.progress_seen {
                state.progress_seen = true;
            }
        }
    }

    /// Tell the originator the far end is alerting.
    fn on_first_progress(
        &self,
        state: &RaceState,
        snapshots: &[ChannelSnapshot],
        ringback: Option<&RingbackHandle>,
        ring_forwarded: &mut bool,
    ) {
        let Some(originator) = &self.ctx.originator else {
            return;
        };
        let tuning = &self.ctx.tuning;
        // Ringback keeps playing while tagged legs await confirmation
        if let (Some(handle), Some(_)) = (ringback, &self.ctx.ringback) {
            handle.arm();
            return;
        }
        let early_rings = tuning.early_as_ring && snapshots.len() == 1 && state.progress_seen;
        if (state.ring_seen || early_rings) && !tuning.ignore_ring_ready && !*ring_forwarded {
            debug!("Sending ring ready to {}", originator.name());
            originator.ring_ready();
            *ring_forwarded = true;
        }
    }

    /// One evaluation pass. Returns the number of collectors started.
    fn evaluate(&self, state: &mut RaceState, snapshots: &[ChannelSnapshot], supervisor: &TaskSupervisor) -> usize {
        let tuning = &self.ctx.tuning;
        let len = self.legs.len();
        let mut hangups = 0;
        let mut required_down = None;
        let mut rejected = None;
        let mut winner = None;
        let mut started = 0;

        for (leg, snap) in self.legs.iter().zip(snapshots) {
            if snap.is_gone() {
                hangups += 1;
                if leg.required && required_down.is_none() {
                    required_down = Some(snap.cause);
                }
                if rejected.is_none() && tuning.reject_policy.rejects(snap.cause) {
                    rejected = Some(snap.cause);
                }
                continue;
            }
            if winner.is_some() {
                continue;
            }

            let (tagged, confirmed) = leg.marker.read();
            if confirmed {
                winner = Some(leg.index);
                continue;
            }
            let candidate = !tagged
                && (snap.flags.answered
                    || (tuning.early_ok && snap.flags.early_media)
                    || (tuning.return_ring_ready && len == 1 && snap.flags.ring_ready));
            if !candidate {
                continue;
            }
            match &tuning.confirm {
                Some(confirm) => {
                    if leg.marker.tag() {
                        debug!("Leg {} awaiting confirmation", leg.channel.name());
                        let collector = ConfirmationCollector::new(
                            Arc::clone(&leg.channel),
                            leg.marker.clone(),
                            confirm.clone(),
                            Arc::clone(&self.services.applications),
                            self.ctx.config.tick(),
                        );
                        supervisor.spawn(format!("confirm-{}", leg.channel.name()), move |token| {
                            collector.run(token)
                        });
                        started += 1;
                    }
                }
                None => winner = Some(leg.index),
            }
        }
        state.hangups = hangups;

        if let Some(idx) = winner {
            info!("Originate leg {} won the race", self.legs[idx].channel.name());
            state.settle(RaceOutcome::Winner(idx));
        } else if let Some(cause) = required_down {
            warn!("Required leg down [{}], abandoning group", cause);
            for leg in self.legs {
                if !leg.snapshot().is_gone() {
                    leg.channel.hangup(cause);
                }
            }
            state.force(cause);
            state.settle(RaceOutcome::AllRejected);
        } else if hangups == len {
            debug!("All {} legs hung up", len);
            state.settle(RaceOutcome::AllRejected);
        } else if let Some(cause) = rejected.filter(|_| len > 1) {
            info!("Leg rejected with {}, failing group on single reject", cause);
            state.settle(RaceOutcome::AllRejected);
        }
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::config::EngineConfig;
    use crate::dialplan::DialPlan;
    use crate::engine::OriginateRequest;
    use crate::launcher::{LaunchReport, LegLauncher};
    use crate::loopback::{LegScript, LoopbackChannel, LoopbackFactory};
    use crate::types::ChannelFlag;

    struct Harness {
        factory: Arc<LoopbackFactory>,
        services: SwitchServices,
        ctx: DialContext,
        plan: DialPlan,
        notify: Arc<Notify>,
    }

    impl Harness {
        fn new(dial: &str, request: OriginateRequest, scripts: &[(&str, LegScript)]) -> Self {
            let factory = Arc::new(LoopbackFactory::new());
            for (data, script) in scripts {
                factory.script(*data, script.clone());
            }
            let services = SwitchServices::new(factory.clone());
            let plan = DialPlan::parse(dial).unwrap();
            let ctx = DialContext::prepare(&request, &plan, &EngineConfig::default());
            Self {
                factory,
                services,
                ctx,
                plan,
                notify: Arc::new(Notify::new()),
            }
        }

        async fn launch(&self) -> LaunchReport {
            LegLauncher::new(&self.services, &self.ctx, self.notify.clone())
                .launch_group(&self.plan.or_groups[0].and_group, true)
                .await
        }

        async fn race(&self, legs: &[LegRuntime]) -> RaceReport {
            RaceCoordinator::new(&self.services, &self.ctx, legs, self.notify.clone())
                .run()
                .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_wins_and_ties_go_to_lowest_index() {
        let dial = "sofia/a,sofia/b,sofia/c";
        let h = Harness::new(dial, OriginateRequest::new(dial), &[("a", LegScript::new().ring())]);
        let report = h.launch().await;
        report.legs[2].channel.set_flag(ChannelFlag::Answered, true);
        report.legs[1].channel.set_flag(ChannelFlag::Answered, true);
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::Winner(1));
        assert!(race.ring_seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_answer_wins() {
        let dial = "sofia/a,sofia/b";
        let h = Harness::new(
            dial,
            OriginateRequest::new(dial),
            &[("a", LegScript::new().ring()), ("b", LegScript::new().wait(500).answer())],
        );
        let report = h.launch().await;
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::Winner(1));
        assert!(race.elapsed >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_media_wins_unless_ignored() {
        let dial = "sofia/a";
        let h = Harness::new(dial, OriginateRequest::new(dial), &[("a", LegScript::new().wait(100).early_media())]);
        let report = h.launch().await;
        assert_eq!(h.race(&report.legs).await.outcome, RaceOutcome::Winner(0));

        let dial = "{ignore_early_media=true,originate_timeout=2}sofia/a";
        let h = Harness::new(dial, OriginateRequest::new(dial), &[("a", LegScript::new().wait(100).early_media())]);
        let report = h.launch().await;
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::Timeout);
        assert!(race.progress_seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_return_ring_ready_only_for_single_leg() {
        let dial = "{return_ring_ready=true}sofia/a";
        let h = Harness::new(dial, OriginateRequest::new(dial), &[("a", LegScript::new().wait(50).ring())]);
        let report = h.launch().await;
        assert_eq!(h.race(&report.legs).await.outcome, RaceOutcome::Winner(0));

        let dial = "{return_ring_ready=true,originate_timeout=1}sofia/a,sofia/b";
        let h = Harness::new(dial, OriginateRequest::new(dial), &[("a", LegScript::new().wait(50).ring())]);
        let report = h.launch().await;
        assert_eq!(h.race(&report.legs).await.outcome, RaceOutcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_hung_up() {
        let dial = "sofia/a,sofia/b";
        let h = Harness::new(
            dial,
            OriginateRequest::new(dial),
            &[
                ("a", LegScript::new().wait(100).hangup(CauseCode::UserBusy)),
                ("b", LegScript::new().wait(300).hangup(CauseCode::CallRejected)),
            ],
        );
        let report = h.launch().await;
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::AllRejected);
        assert!(race.elapsed >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_on_single_reject_cause_list() {
        let dial = "{fail_on_single_reject=USER_BUSY}sofia/a,sofia/b,sofia/c";
        let h = Harness::new(
            dial,
            OriginateRequest::new(dial),
            &[
                ("a", LegScript::new().wait(100).hangup(CauseCode::CallRejected)),
                ("b", LegScript::new().wait(200).hangup(CauseCode::UserBusy)),
            ],
        );
        let report = h.launch().await;
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::AllRejected);
        assert!(race.elapsed < Duration::from_secs(1));
        assert!(report.legs[2].channel.is_ready());

        let dial = "{fail_on_single_reject=USER_BUSY,originate_timeout=2}sofia/a,sofia/c";
        let h = Harness::new(
            dial,
            OriginateRequest::new(dial),
            &[("a", LegScript::new().wait(100).hangup(CauseCode::CallRejected))],
        );
        let report = h.launch().await;
        assert_eq!(h.race(&report.legs).await.outcome, RaceOutcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_leg_takes_group_down() {
        let dial = "[leg_required=true]sofia/a,sofia/b";
        let h = Harness::new(
            dial,
            OriginateRequest::new(dial),
            &[("a", LegScript::new().wait(100).hangup(CauseCode::UnallocatedNumber))],
        );
        let report = h.launch().await;
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::AllRejected);
        assert_eq!(race.force_reason, Some(CauseCode::UnallocatedNumber));
        assert_eq!(report.legs[1].channel.cause(), CauseCode::UnallocatedNumber);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_timeout() {
        let dial = "{progress_timeout=2,originate_timeout=30}sofia/a";
        let h = Harness::new(dial, OriginateRequest::new(dial), &[]);
        let report = h.launch().await;
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::Timeout);
        assert_eq!(race.force_reason, Some(CauseCode::ProgressTimeout));
        assert!(race.elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leg_timers() {
        let dial = "{originate_timeout=10}[leg_timeout=1]sofia/a,[leg_progress_timeout=2]sofia/b,sofia/c";
        let h = Harness::new(
            dial,
            OriginateRequest::new(dial),
            &[
                ("a", LegScript::new().ring()),
                ("c", LegScript::new().wait(4000).answer()),
            ],
        );
        let report = h.launch().await;
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::Winner(2));
        assert_eq!(report.legs[0].channel.cause(), CauseCode::AllottedTimeout);
        assert_eq!(report.legs[1].channel.cause(), CauseCode::ProgressTimeout);
        assert_eq!(race.force_reason, Some(CauseCode::ProgressTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_gates_the_winner() {
        let dial = "{group_confirm_key=5,group_confirm_read_timeout=1000}sofia/a,sofia/b";
        let h = Harness::new(
            dial,
            OriginateRequest::new(dial),
            &[
                ("a", LegScript::new().wait(100).answer()),
                ("b", LegScript::new().wait(200).answer().wait(300).dtmf("5")),
            ],
        );
        let report = h.launch().await;
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::Winner(1));
        assert_eq!(race.confirmations, 2);
        assert!(report.legs[0].marker.is_tagged());
        assert!(!report.legs[0].marker.is_winner());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_confirmations_yield_one_winner() {
        let dial = "{group_confirm_key=5}sofia/a,sofia/b";
        let script = LegScript::new().wait(100).answer().wait(300).dtmf("5");
        let h = Harness::new(dial, OriginateRequest::new(dial), &[("a", script.clone()), ("b", script)]);
        let report = h.launch().await;
        let race = h.race(&report.legs).await;

        let RaceOutcome::Winner(idx) = race.outcome else {
            panic!("expected a winner, got {:?}", race.outcome);
        };
        assert_eq!(race.confirmations, 2);
        let winners: Vec<usize> = report
            .legs
            .iter()
            .filter(|leg| leg.marker.is_winner())
            .map(|leg| leg.index)
            .collect();
        assert_eq!(winners, vec![idx]);
        assert!(report.legs.iter().all(|leg| leg.marker.is_tagged()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_originator_hangup_cancels() {
        let orig = LoopbackChannel::originator("sofia/in");
        orig.run_script(LegScript::new().wait(400).hangup(CauseCode::NormalClearing));
        let dial = "sofia/a,sofia/b";
        let h = Harness::new(dial, OriginateRequest::new(dial).with_originator(orig.clone()), &[]);
        let report = h.launch().await;
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::Cancelled);
        assert_eq!(race.force_reason, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requester_cancel_forces_cause() {
        let token = tokio_util::sync::CancellationToken::new();
        let dial = "sofia/a";
        let h = Harness::new(
            dial,
            OriginateRequest::new(dial).cancel_token(token.clone(), CauseCode::ManagerRequest),
            &[],
        );
        let report = h.launch().await;
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            canceller.cancel();
        });
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::Cancelled);
        assert_eq!(race.force_reason, Some(CauseCode::ManagerRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_forwarded_without_ringback() {
        let orig = LoopbackChannel::originator("sofia/in");
        let dial = "sofia/a";
        let h = Harness::new(
            dial,
            OriginateRequest::new(dial).with_originator(orig.clone()),
            &[("a", LegScript::new().wait(100).ring().wait(100).answer())],
        );
        let report = h.launch().await;
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::Winner(0));
        assert_eq!(orig.ring_ready_sent(), 1);
        assert!(orig.written_frames().is_empty());
        assert_eq!(h.factory.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ringback_plays_after_first_ring() {
        let orig = LoopbackChannel::originator("sofia/in");
        orig.set_variable("ringback", Some("%(1000,4000,440,480)"));
        let dial = "sofia/a";
        let h = Harness::new(
            dial,
            OriginateRequest::new(dial).with_originator(orig.clone()),
            &[("a", LegScript::new().wait(200).ring().wait(1000).answer())],
        );
        let report = h.launch().await;
        let race = h.race(&report.legs).await;
        assert_eq!(race.outcome, RaceOutcome::Winner(0));
        assert_eq!(orig.ring_ready_sent(), 0);
        assert!(race.ringback.frames_written >= 40, "{:?}", race.ringback);
        assert!(race.ringback.codec_restored);
        assert!(orig.raw_codec().is_none());
        assert_eq!(orig.written_frames().len() as u64, race.ringback.frames_written);
    }
}
