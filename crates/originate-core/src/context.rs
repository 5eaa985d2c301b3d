//! Per-call dial context
//!
//! Everything one `originate` invocation needs is owned here: merged variables,
//! resolved tuning, the originator handle and the cancellation scope. Nothing
//! outlives the call.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{ChannelHandle, StateHandler};
use crate::config::{DialTuning, EngineConfig};
use crate::dialplan::DialPlan;
use crate::engine::OriginateRequest;
use crate::types::{CallerProfile, CauseCode, OriginateFlags};
use crate::variables::{names, non_empty, parse_int, split_list, Variables};

pub struct DialContext {
    pub originator: Option<ChannelHandle>,
    pub variables: Variables,
    pub tuning: DialTuning,
    pub config: EngineConfig,
    pub cid_name_override: Option<String>,
    pub cid_num_override: Option<String>,
    pub profile_override: Option<CallerProfile>,
    pub state_handlers: Option<Vec<Arc<dyn StateHandler>>>,
    pub flags: OriginateFlags,
    /// Fired by the requester to abort the dial.
    pub cancel: CancellationToken,
    pub cancel_cause: CauseCode,
    /// Ringback source toward the originator, if any.
    pub ringback: Option<String>,
}

impl DialContext {
    /// Merge variables in precedence order: request variables, originator
    /// `export_vars`, dial-string globals, then inherited originator variables
    /// that are still unset.
    pub fn prepare(request: &OriginateRequest, plan: &DialPlan, config: &EngineConfig) -> Self {
        let mut variables = request.variables.clone().unwrap_or_default();
        let originator = request.originator.clone();

        if let Some(orig) = &originator {
            if let Some(list) = orig.get_variable(names::EXPORT_VARS) {
                for name in split_list(&list) {
                    let name = name.strip_prefix("nolocal:").unwrap_or(name);
                    if let Some(value) = orig.get_variable(name) {
                        variables.insert(name.to_string(), value);
                    }
                }
            }
        }

        for (k, v) in &plan.variables {
            variables.insert(k.clone(), v.clone());
        }

        let mut call_timeout = None;
        if let Some(orig) = &originator {
            for name in names::INHERITED {
                if !variables.contains_key(*name) {
                    if let Some(value) = orig.get_variable(name) {
                        debug!("Inheriting {}={} from {}", name, value, orig.name());
                        variables.insert(name.to_string(), value);
                    }
                }
            }
            call_timeout = orig.get_variable(names::CALL_TIMEOUT);
            orig.set_variable(names::ORIGINATE_DISPOSITION, Some("failure"));
        }

        let tuning = DialTuning::resolve(
            &variables,
            request.timeout_secs,
            call_timeout.as_deref(),
            config,
        );
        let ringback = originator
            .as_ref()
            .and_then(|orig| resolve_ringback(orig, &variables));

        Self {
            originator,
            variables,
            tuning,
            config: config.clone(),
            cid_name_override: request.cid_name_override.clone(),
            cid_num_override: request.cid_num_override.clone(),
            profile_override: request.caller_profile_override.clone(),
            state_handlers: request.state_handlers.clone(),
            flags: request.flags,
            cancel: request.cancel.clone().unwrap_or_default(),
            cancel_cause: request.cancel_cause,
            ringback,
        }
    }

    /// Originator is absent or still ready.
    pub fn originator_ready(&self) -> bool {
        self.originator.as_ref().map(|o| o.is_ready()).unwrap_or(true)
    }
}

/// `transfer_ringback` for an answered originator, else `ringback`, else comfort
/// noise from `send_silence_when_idle`. Proxy-mode originators get nothing.
fn resolve_ringback(orig: &ChannelHandle, vars: &Variables) -> Option<String> {
    let snapshot = orig.snapshot();
    if snapshot.flags.proxy_mode {
        return None;
    }
    let lookup = |name: &str| {
        non_empty(vars, name)
            .map(str::to_string)
            .or_else(|| orig.get_variable(name).filter(|v| !v.is_empty()))
    };

    let mut ringback = None;
    if snapshot.flags.answered {
        ringback = lookup(names::TRANSFER_RINGBACK);
    }
    if ringback.is_none() {
        ringback = lookup(names::RINGBACK);
    }
    if ringback.is_none() {
        ringback = lookup(names::SEND_SILENCE_WHEN_IDLE)
            .and_then(|v| parse_int(&v))
            .filter(|n| *n > 0)
            .map(|n| format!("silence:{}", n));
    }
    ringback
}
