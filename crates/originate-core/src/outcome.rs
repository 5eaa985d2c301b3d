//! Race outcome resolution
//!
//! Turns a [`RaceReport`] into the final answer for one AND-group: every leg
//! is disposed of exactly once (promoted, hung up, bridged to a held call, or
//! left alone because it was already gone), the originator is answered or
//! pre-answered for the winner, and the overall cause is chosen.

use std::fmt;

use tracing::{debug, info, warn};

use crate::channel::ChannelHandle;
use crate::context::DialContext;
use crate::engine::SwitchServices;
use crate::launcher::LegRuntime;
use crate::race::{RaceOutcome, RaceReport};
use crate::types::{CauseCode, ChannelFlag, OriginateStatus};
use crate::variables::{names, parse_int, split_list};

/// What happened to one leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposal {
    /// Winner, left running for the caller.
    Promoted,
    HungUp(CauseCode),
    /// Already hung up, transferred or bridged before resolution.
    AlreadyDown(CauseCode),
    /// Bridged into the held call with this UUID.
    BridgedToHolding(String),
}

impl fmt::Display for Disposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposal::Promoted => write!(f, "promoted"),
            Disposal::HungUp(cause) => write!(f, "hangup({})", cause),
            Disposal::AlreadyDown(cause) => write!(f, "down({})", cause),
            Disposal::BridgedToHolding(uuid) => write!(f, "bridged({})", uuid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegDisposition {
    pub index: usize,
    pub uuid: String,
    pub channel_name: String,
    pub disposal: Disposal,
}

/// Final result of one AND-group.
pub struct Resolution {
    pub winner: Option<ChannelHandle>,
    pub cause: CauseCode,
    pub status: OriginateStatus,
    pub dispositions: Vec<LegDisposition>,
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("winner", &self.winner.as_ref().map(|w| w.name().to_string()))
            .field("cause", &self.cause)
            .field("status", &self.status)
            .field("dispositions", &self.dispositions)
            .finish()
    }
}

pub struct OutcomeResolver<'a> {
    services: &'a SwitchServices,
    ctx: &'a DialContext,
}

impl<'a> OutcomeResolver<'a> {
    pub fn new(services: &'a SwitchServices, ctx: &'a DialContext) -> Self {
        Self { services, ctx }
    }

    /// Resolve one AND-group. `launch_cause` is the cause of the last leg
    /// that could not be created, if any.
    pub async fn resolve(
        &self,
        legs: &[LegRuntime],
        race: &RaceReport,
        launch_cause: Option<CauseCode>,
    ) -> Resolution {
        let mut disposals: Vec<Option<Disposal>> = vec![None; legs.len()];
        let winner_idx = race.outcome.winner();
        let loser_reason = loser_cause(race.outcome, legs.len());

        for leg in legs {
            if Some(leg.index) == winner_idx {
                continue;
            }
            disposals[leg.index] = Some(self.dispose_loser(leg, race, loser_reason).await);
        }

        let mut winner = None;
        let mut demoted = None;
        if let Some(idx) = winner_idx {
            let leg = &legs[idx];
            match self.promote(leg).await {
                Ok(()) if self.ctx.originator_ready() => {
                    disposals[idx] = Some(Disposal::Promoted);
                    winner = Some(leg);
                }
                Ok(()) => demoted = Some(leg),
                Err(cause) => {
                    disposals[idx] = Some(Disposal::HungUp(cause));
                    demoted = Some(leg);
                }
            }
        }

        let success = winner.is_some();
        let cause = if success {
            CauseCode::Success
        } else {
            self.failure_cause(legs, race, demoted, launch_cause, loser_reason)
        };

        if let Some(orig) = &self.ctx.originator {
            let imported_from = if success { winner } else { demoted };
            if let Some(leg) = imported_from {
                self.import_variables(leg);
            }
            let disposition = if success { "call accepted" } else { cause.as_str() };
            orig.set_variable(names::ORIGINATE_DISPOSITION, Some(disposition));
        }

        for leg in legs {
            let slot = &mut disposals[leg.index];
            if !success && slot.is_none() {
                let snap = leg.snapshot();
                *slot = Some(if snap.flags.originating && !snap.is_gone() {
                    leg.channel.hangup(cause);
                    Disposal::HungUp(cause)
                } else {
                    Disposal::AlreadyDown(snap.cause)
                });
            }
            leg.channel.set_flag(ChannelFlag::Originating, false);
        }

        if !success {
            self.record_failed_cdrs(legs);
        }

        let dispositions: Vec<LegDisposition> = legs
            .iter()
            .zip(disposals)
            .map(|(leg, disposal)| LegDisposition {
                index: leg.index,
                uuid: leg.channel.uuid().to_string(),
                channel_name: leg.channel.name().to_string(),
                disposal: disposal.unwrap_or(Disposal::AlreadyDown(CauseCode::None)),
            })
            .collect();

        match winner {
            Some(leg) => info!("Originate resulted in success: [{}]", leg.channel.name()),
            None => info!("Originate resulted in failure: [{}]", cause),
        }

        Resolution {
            winner: winner.map(|leg| leg.channel.clone()),
            cause,
            status: if success {
                OriginateStatus::Success
            } else {
                OriginateStatus::Failure
            },
            dispositions,
        }
    }

    async fn dispose_loser(&self, leg: &LegRuntime, race: &RaceReport, reason: CauseCode) -> Disposal {
        let snap = leg.snapshot();
        if snap.is_gone() {
            return Disposal::AlreadyDown(snap.cause);
        }

        let holding = match (&self.ctx.originator, leg.index) {
            (Some(orig), 0) => {
                let holding = orig.get_variable(names::SOFT_HOLDING_UUID);
                orig.set_variable(names::SOFT_HOLDING_UUID, None);
                holding.filter(|h| !h.is_empty())
            }
            _ => None,
        };
        if let Some(holding) = holding.filter(|_| race.outcome != RaceOutcome::Timeout) {
            match self.services.bridge.bridge_to_held(&holding, &leg.channel).await {
                Ok(()) => {
                    debug!("Bridged {} to held call {}", leg.channel.name(), holding);
                    return Disposal::BridgedToHolding(holding);
                }
                Err(e) => warn!("Cannot bridge {} to held call {}: {}", leg.channel.name(), holding, e),
            }
        }

        let cause = race.force_reason.unwrap_or(reason);
        leg.channel.hangup(cause);
        Disposal::HungUp(cause)
    }

    /// Bring the originator's media up for the winner.
    async fn promote(&self, leg: &LegRuntime) -> Result<(), CauseCode> {
        let snap = leg.snapshot();
        let tuning = &self.ctx.tuning;
        let winning = snap.flags.answered
            || (tuning.early_ok && snap.flags.early_media)
            || (tuning.return_ring_ready && snap.flags.ring_ready);
        if snap.is_gone() {
            return Err(snap.cause);
        }

        if let Some(orig) = &self.ctx.originator {
            let established = if snap.flags.answered {
                orig.answer().await
            } else if snap.flags.early_media {
                orig.pre_answer().await
            } else {
                Ok(())
            };
            if let Err(e) = established {
                debug!("{} media establishment failed: {}", orig.name(), e);
                leg.channel.hangup(CauseCode::IncompatibleDestination);
                return Err(CauseCode::IncompatibleDestination);
            }
        }

        if !winning {
            let cause = leg.channel.cause();
            let cause = if cause.is_unset() { CauseCode::NoAnswer } else { cause };
            leg.channel.hangup(cause);
            return Err(cause);
        }
        Ok(())
    }

    fn failure_cause(
        &self,
        legs: &[LegRuntime],
        race: &RaceReport,
        peer: Option<&LegRuntime>,
        launch_cause: Option<CauseCode>,
        loser_reason: CauseCode,
    ) -> CauseCode {
        let known = |c: CauseCode| Some(c).filter(|c| *c != CauseCode::None);
        let mut cause = peer
            .map(|leg| leg.channel.cause())
            .or_else(|| legs.first().map(|leg| leg.channel.cause()))
            .and_then(known)
            .or_else(|| launch_cause.and_then(known))
            .or_else(|| (!legs.is_empty()).then_some(loser_reason))
            .or_else(|| self.ctx.originator.as_ref().map(|o| o.cause()).and_then(known))
            .unwrap_or(CauseCode::DestinationOutOfOrder);

        if cause.is_unset() {
            cause = CauseCode::OriginatorCancel;
        }
        match race.outcome {
            RaceOutcome::Cancelled => race.force_reason.unwrap_or(CauseCode::OriginatorCancel),
            RaceOutcome::Timeout => race.force_reason.unwrap_or(CauseCode::NoAnswer),
            _ if !self.ctx.originator_ready() => CauseCode::OriginatorCancel,
            _ => race.force_reason.unwrap_or(cause),
        }
    }

    /// Copy the `import` allow-list from the winner onto the originator.
    fn import_variables(&self, leg: &LegRuntime) {
        let Some(orig) = &self.ctx.originator else {
            return;
        };
        let Some(list) = leg
            .channel
            .get_variable(names::IMPORT)
            .or_else(|| orig.get_variable(names::IMPORT))
        else {
            return;
        };
        for name in split_list(&list) {
            if let Some(value) = leg.channel.get_variable(name) {
                debug!("Importing {}={} from {}", name, value, leg.channel.name());
                orig.set_variable(name, Some(&value));
            }
        }
    }

    /// Store one XML CDR per dialed leg on the originator.
    fn record_failed_cdrs(&self, legs: &[LegRuntime]) {
        let Some(orig) = &self.ctx.originator else {
            return;
        };
        let Some(prefix) = orig
            .get_variable(names::FAILED_XML_CDR_PREFIX)
            .or_else(|| self.ctx.variables.get(names::FAILED_XML_CDR_PREFIX).cloned())
            .filter(|p| !p.is_empty())
        else {
            return;
        };

        let total_var = format!("{}_total", prefix);
        let mut total = orig
            .get_variable(&total_var)
            .and_then(|v| parse_int(&v))
            .filter(|n| *n > 0)
            .unwrap_or(0);
        for leg in legs {
            match self.services.cdr.generate_xml_cdr(leg.channel.as_ref()) {
                Ok(xml) => {
                    total += 1;
                    orig.set_variable(&format!("{}_{}", prefix, total), Some(&xml));
                }
                Err(e) => warn!("Cannot generate CDR for {}: {}", leg.channel.name(), e),
            }
        }
        orig.set_variable(&total_var, Some(&total.to_string()));
    }
}

/// Hangup cause for a loser given how the race ended.
fn loser_cause(outcome: RaceOutcome, group_len: usize) -> CauseCode {
    match outcome {
        RaceOutcome::Timeout => CauseCode::NoAnswer,
        RaceOutcome::Cancelled => CauseCode::OriginatorCancel,
        RaceOutcome::Winner(_) if group_len > 1 => CauseCode::LoseRace,
        _ => CauseCode::NoAnswer,
    }
}
