//! Per-leg confirmation collector
//!
//! A leg that would win a race while `group_confirm_key` is set is only
//! tagged. The collector then prompts the callee and waits for the key
//! sequence (or runs an application when the key is `exec`). Success marks
//! the leg as winner; the coordinator picks that up on its next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::applications::ApplicationRegistry;
use crate::channel::ChannelHandle;
use crate::config::ConfirmSpec;
use crate::launcher::LegMarker;
use crate::types::CauseCode;

pub struct ConfirmationCollector {
    leg: ChannelHandle,
    marker: LegMarker,
    spec: ConfirmSpec,
    applications: Arc<dyn ApplicationRegistry>,
    poll: Duration,
}

impl ConfirmationCollector {
    pub fn new(
        leg: ChannelHandle,
        marker: LegMarker,
        spec: ConfirmSpec,
        applications: Arc<dyn ApplicationRegistry>,
        poll: Duration,
    ) -> Self {
        Self {
            leg,
            marker,
            spec,
            applications,
            poll,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        if self.spec.is_exec() {
            self.run_application().await;
        } else {
            self.collect_digits(&token).await;
        }
    }

    async fn run_application(&self) {
        let Some(line) = self.spec.file.as_deref() else {
            warn!("group_confirm_key=exec without group_confirm_file on {}", self.leg.name());
            self.leg.hangup(CauseCode::DestinationOutOfOrder);
            return;
        };
        let (name, args) = match line.trim().split_once(char::is_whitespace) {
            Some((name, args)) => (name, Some(args.trim()).filter(|a| !a.is_empty())),
            None => (line.trim(), None),
        };
        let Some(app) = self.applications.get(name) else {
            warn!("Unknown confirm application '{}' for {}", name, self.leg.name());
            self.leg.hangup(CauseCode::DestinationOutOfOrder);
            return;
        };

        debug!("Running confirm application {} on {}", name, self.leg.name());
        if let Err(e) = app.execute(&self.leg, args).await {
            warn!("Confirm application {} failed on {}: {}", name, self.leg.name(), e);
        }
        if self.leg.is_ready() && self.marker.mark_winner() {
            info!("Leg {} confirmed by {}", self.leg.name(), name);
        }
    }

    async fn collect_digits(&self, token: &CancellationToken) {
        let want = self.spec.key.chars().count();
        while self.leg.is_ready() && !token.is_cancelled() {
            if let Some(file) = &self.spec.file {
                if let Err(e) = self.leg.play_file(file).await {
                    debug!("Confirm prompt failed on {}: {}", self.leg.name(), e);
                    return;
                }
            }

            let mut digits = String::new();
            let deadline = Instant::now() + self.spec.read_timeout;
            while digits.chars().count() < want && Instant::now() < deadline {
                if !self.leg.is_ready() {
                    return;
                }
                match self.leg.dequeue_dtmf() {
                    Some(d) => digits.push(d),
                    None => tokio::time::sleep(self.poll).await,
                }
            }

            if digits == self.spec.key {
                if self.marker.mark_winner() {
                    info!("Leg {} confirmed with key", self.leg.name());
                }
                return;
            }
            if !digits.is_empty() {
                debug!("Wrong confirm key '{}' on {}", digits, self.leg.name());
            }
            if let Some(error_file) = &self.spec.error_file {
                if self.leg.play_file(error_file).await.is_err() {
                    return;
                }
            }
        }
    }
}
