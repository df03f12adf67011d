//! Session orchestrator - the Idle/Arming/Recording/Stopping state machine.
//!
//! `start_session` drives one arm cycle to completion: it broadcasts
//! `CMD_START` with a near-future scheduled start, then waits on a signal
//! channel fed by [`SessionOrchestrator::handle_ack`] until every member has
//! acknowledged or the arming window closes. What happens on a shortfall is
//! the mode's call: strict aborts outright, degraded proceeds when the
//! configured quorum acknowledged.
//!
//! Locking discipline: the state mutex is synchronous and never held across
//! an await; all transport sends happen with the lock released.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, trace, warn};

use contracts::{
    DeviceId, DeviceState, Outbox, Payload, PayloadKind, SessionConfig, SessionMode,
    SessionOutcome, SessionSnapshot, SessionState, SharedClock,
};
use transport::Transport;

use crate::{ControllerError, Registry};

/// Wakes the in-flight arm/stop waiter.
enum Signal {
    /// A member acknowledged the pending command
    Ack,
    /// A member left the set; completion must be re-checked
    MembershipChanged,
    /// Operator abort
    Abort(String),
}

#[derive(Default)]
struct ActiveSession {
    session_id: Option<String>,
    state: SessionState,
    members: BTreeSet<String>,
    acked: BTreeSet<String>,
    excluded: BTreeSet<String>,
    /// Present only while a waiter is parked in `start_session`/`stop_session`
    signal: Option<mpsc::UnboundedSender<Signal>>,
}

/// What the arm wait loop decided.
enum ArmDecision {
    /// Every member acknowledged
    Full,
    /// Arming window closed with acks outstanding
    Deadline,
    Abort(String),
}

pub struct SessionOrchestrator<T: Transport> {
    transport: Arc<T>,
    outbox: Arc<Outbox>,
    registry: Arc<Registry>,
    clock: SharedClock,
    config: SessionConfig,
    active: Mutex<ActiveSession>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl<T: Transport> SessionOrchestrator<T> {
    pub fn new(
        transport: Arc<T>,
        outbox: Arc<Outbox>,
        registry: Arc<Registry>,
        clock: SharedClock,
        config: SessionConfig,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        Self {
            transport,
            outbox,
            registry,
            clock,
            config,
            active: Mutex::new(ActiveSession::default()),
            snapshot_tx,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Arm and start a session across every currently Ready device.
    ///
    /// Returns the arm outcome: `Complete` when the full member set is
    /// recording, `Degraded` when a quorum-satisfying subset is, `Aborted`
    /// otherwise. Shortfalls are an outcome, not an `Err`; `Err` is reserved
    /// for preconditions (busy, no ready devices).
    #[instrument(skip(self), fields(session_id))]
    pub async fn start_session(
        &self,
        session_id: Option<String>,
    ) -> Result<SessionOutcome, ControllerError> {
        let members = self.registry.ready_devices();
        if members.is_empty() {
            return Err(ControllerError::NoReadyDevices);
        }

        let session_id = session_id
            .unwrap_or_else(|| format!("session-{}", self.clock.now_nanos() / 1_000_000));
        tracing::Span::current().record("session_id", session_id.as_str());

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        {
            let mut active = self.active.lock().expect("session state poisoned");
            if active.state != SessionState::Idle {
                return Err(ControllerError::SessionActive {
                    state: active.state,
                });
            }
            active.session_id = Some(session_id.clone());
            active.state = SessionState::Arming;
            active.members = members.iter().map(|d| d.to_string()).collect();
            active.acked.clear();
            active.excluded.clear();
            active.signal = Some(signal_tx);
            self.publish(&active);
        }
        info!(members = members.len(), "arming session");

        let scheduled_start_nanos =
            self.clock.now_nanos() + self.config.start_delay_ms as i64 * 1_000_000;
        for device in &members {
            let cmd = self.outbox.message(Payload::CmdStart {
                session_id: session_id.clone(),
                scheduled_start_nanos,
            });
            if let Err(e) = self.transport.send(device, cmd).await {
                warn!(device = %device, error = %e, "start command failed, excluding member");
                self.drop_member(device);
            }
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.arming_timeout_ms);
        let decision = loop {
            {
                let active = self.active.lock().expect("session state poisoned");
                if active.members.is_empty() {
                    break ArmDecision::Abort("all members lost while arming".to_string());
                }
                if active.acked.len() == active.members.len() {
                    break ArmDecision::Full;
                }
            }
            match timeout_at(deadline, signal_rx.recv()).await {
                Ok(Some(Signal::Ack | Signal::MembershipChanged)) => continue,
                Ok(Some(Signal::Abort(reason))) => break ArmDecision::Abort(reason),
                Ok(None) => break ArmDecision::Abort("orchestrator dropped".to_string()),
                Err(_) => break ArmDecision::Deadline,
            }
        };

        let (outcome, stop_targets) = self.resolve_arm(&session_id, decision);
        if let Some(targets) = stop_targets {
            // Aborted after some members acked: tell them to stand down
            self.send_stop(&session_id, &targets).await;
            for id in &targets {
                let device = DeviceId::from(id.as_str());
                if self.registry.state(&device) == Some(DeviceState::Recording) {
                    self.registry.set_state(&device, DeviceState::Ready);
                }
            }
        }

        metrics::counter!(
            "capture_hub_sessions_total",
            "outcome" => outcome_label(&outcome)
        )
        .increment(1);
        info!(outcome = outcome_label(&outcome), "arm cycle finished");
        Ok(outcome)
    }

    /// Apply the arm decision under the lock; returns the outcome, plus the
    /// acked members to send CMD_STOP to when the session aborted.
    fn resolve_arm(
        &self,
        session_id: &str,
        decision: ArmDecision,
    ) -> (SessionOutcome, Option<Vec<String>>) {
        let mut active = self.active.lock().expect("session state poisoned");
        active.signal = None;

        let decision = match decision {
            // The deadline may fire in the same poll as the last ack
            ArmDecision::Deadline
                if !active.members.is_empty() && active.acked.len() == active.members.len() =>
            {
                ArmDecision::Full
            }
            other => other,
        };

        match decision {
            ArmDecision::Full => {
                let outcome = if active.excluded.is_empty() {
                    SessionOutcome::Complete {
                        session_id: session_id.to_string(),
                    }
                } else {
                    SessionOutcome::Degraded {
                        session_id: session_id.to_string(),
                        excluded: active.excluded.iter().cloned().collect(),
                    }
                };
                self.enter_recording(&mut active);
                (outcome, None)
            }
            ArmDecision::Deadline => {
                let required = self.config.required_acks(active.members.len());
                let quorum_ok = self.config.mode == SessionMode::Degraded
                    && !active.acked.is_empty()
                    && active.acked.len() >= required;

                if quorum_ok {
                    let stragglers: Vec<String> = active
                        .members
                        .difference(&active.acked)
                        .cloned()
                        .collect();
                    for id in &stragglers {
                        active.members.remove(id);
                        active.excluded.insert(id.clone());
                    }
                    warn!(
                        excluded = ?stragglers,
                        "arming window closed, proceeding with quorum"
                    );
                    let outcome = SessionOutcome::Degraded {
                        session_id: session_id.to_string(),
                        excluded: active.excluded.iter().cloned().collect(),
                    };
                    self.enter_recording(&mut active);
                    (outcome, None)
                } else {
                    let reason = format!(
                        "arming timeout: {}/{} members acknowledged",
                        active.acked.len(),
                        active.members.len()
                    );
                    let acked = active.acked.iter().cloned().collect();
                    self.reset(&mut active);
                    (
                        SessionOutcome::Aborted {
                            session_id: session_id.to_string(),
                            reason,
                        },
                        Some(acked),
                    )
                }
            }
            ArmDecision::Abort(reason) => {
                let acked = active.acked.iter().cloned().collect();
                self.reset(&mut active);
                (
                    SessionOutcome::Aborted {
                        session_id: session_id.to_string(),
                        reason,
                    },
                    Some(acked),
                )
            }
        }
    }

    /// Stop the running session, waiting best-effort for stop acks.
    #[instrument(skip(self))]
    pub async fn stop_session(&self) -> Result<SessionOutcome, ControllerError> {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (session_id, members, excluded) = {
            let mut active = self.active.lock().expect("session state poisoned");
            if active.state != SessionState::Recording {
                return Err(ControllerError::NoActiveSession);
            }
            active.state = SessionState::Stopping;
            active.acked.clear();
            active.signal = Some(signal_tx);
            self.publish(&active);
            (
                active.session_id.clone().unwrap_or_default(),
                active.members.clone(),
                active.excluded.clone(),
            )
        };
        info!(session_id = %session_id, members = members.len(), "stopping session");

        let targets: Vec<String> = members.iter().cloned().collect();
        self.send_stop(&session_id, &targets).await;

        // Stop acks are advisory; an unresponsive member cannot hold the
        // session open past the stop window
        let deadline = Instant::now() + Duration::from_millis(self.config.stop_timeout_ms);
        loop {
            {
                let active = self.active.lock().expect("session state poisoned");
                if active.acked.len() == active.members.len() {
                    break;
                }
            }
            match timeout_at(deadline, signal_rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }

        let unconfirmed: Vec<String> = {
            let mut active = self.active.lock().expect("session state poisoned");
            let unconfirmed = active.members.difference(&active.acked).cloned().collect();
            self.reset(&mut active);
            unconfirmed
        };
        if !unconfirmed.is_empty() {
            warn!(devices = ?unconfirmed, "stop not confirmed within window");
        }

        for id in &members {
            let device = DeviceId::from(id.as_str());
            if self.registry.state(&device) == Some(DeviceState::Recording) {
                self.registry.set_state(&device, DeviceState::Ready);
            }
        }

        let outcome = if excluded.is_empty() {
            SessionOutcome::Complete { session_id }
        } else {
            SessionOutcome::Degraded {
                session_id,
                excluded: excluded.into_iter().collect(),
            }
        };
        Ok(outcome)
    }

    /// Operator abort. While arming this wakes the parked waiter; while
    /// recording it tears the session down directly.
    pub async fn abort_session(&self, reason: impl Into<String>) -> Result<(), ControllerError> {
        let reason = reason.into();
        let action = {
            let mut active = self.active.lock().expect("session state poisoned");
            match active.state {
                SessionState::Arming => {
                    if let Some(signal) = &active.signal {
                        let _ = signal.send(Signal::Abort(reason.clone()));
                    }
                    None
                }
                SessionState::Recording => {
                    let session_id = active.session_id.clone().unwrap_or_default();
                    let members: Vec<String> = active.members.iter().cloned().collect();
                    self.reset(&mut active);
                    Some((session_id, members))
                }
                SessionState::Stopping => None,
                SessionState::Idle => return Err(ControllerError::NoActiveSession),
            }
        };

        if let Some((session_id, members)) = action {
            warn!(session_id = %session_id, reason = %reason, "session aborted");
            self.send_stop(&session_id, &members).await;
            for id in &members {
                let device = DeviceId::from(id.as_str());
                if self.registry.state(&device) == Some(DeviceState::Recording) {
                    self.registry.set_state(&device, DeviceState::Ready);
                }
            }
        }
        Ok(())
    }

    /// Route an inbound ACK to the phase that is waiting on it.
    pub fn handle_ack(&self, device_id: &DeviceId, ack_kind: PayloadKind) {
        let mut active = self.active.lock().expect("session state poisoned");
        match (active.state, ack_kind) {
            (SessionState::Arming, PayloadKind::CmdStart) => {
                if active.members.contains(device_id.as_str())
                    && active.acked.insert(device_id.to_string())
                {
                    debug!(device = %device_id, "start acknowledged");
                    self.registry.set_state(device_id, DeviceState::Recording);
                    if let Some(signal) = &active.signal {
                        let _ = signal.send(Signal::Ack);
                    }
                    self.publish(&active);
                }
            }
            (SessionState::Recording, PayloadKind::CmdStart) => {
                // Late joiner confirmed
                if active.excluded.remove(device_id.as_str()) {
                    active.members.insert(device_id.to_string());
                    active.acked.insert(device_id.to_string());
                    self.registry.set_state(device_id, DeviceState::Recording);
                    info!(device = %device_id, "device joined in-progress session");
                    self.publish(&active);
                }
            }
            (SessionState::Stopping, PayloadKind::CmdStop) => {
                if active.members.contains(device_id.as_str())
                    && active.acked.insert(device_id.to_string())
                {
                    if let Some(signal) = &active.signal {
                        let _ = signal.send(Signal::Ack);
                    }
                    self.publish(&active);
                }
            }
            _ => trace!(device = %device_id, kind = ?ack_kind, "ack outside any wait, ignored"),
        }
    }

    /// A member became unreachable or disconnected. While arming it stops
    /// counting toward the quorum; while recording the session continues with
    /// the remaining members.
    pub fn member_lost(&self, device_id: &DeviceId) {
        let mut active = self.active.lock().expect("session state poisoned");
        if !active.members.remove(device_id.as_str()) {
            return;
        }
        active.acked.remove(device_id.as_str());
        active.excluded.insert(device_id.to_string());
        metrics::counter!("capture_hub_session_members_lost_total").increment(1);

        match active.state {
            SessionState::Arming => {
                warn!(device = %device_id, "member lost while arming");
                if let Some(signal) = &active.signal {
                    let _ = signal.send(Signal::MembershipChanged);
                }
            }
            SessionState::Recording | SessionState::Stopping => {
                warn!(
                    device = %device_id,
                    remaining = active.members.len(),
                    "member lost, session continues"
                );
                if active.state == SessionState::Stopping {
                    if let Some(signal) = &active.signal {
                        let _ = signal.send(Signal::MembershipChanged);
                    }
                }
            }
            SessionState::Idle => {}
        }
        self.publish(&active);
    }

    /// Offer a recovered device a seat in the running session. Membership is
    /// granted only when its CMD_START ack comes back.
    pub async fn offer_rejoin(&self, device_id: &DeviceId) -> bool {
        if !self.config.allow_late_join {
            return false;
        }
        let session_id = {
            let active = self.active.lock().expect("session state poisoned");
            if active.state != SessionState::Recording
                || !active.excluded.contains(device_id.as_str())
            {
                return false;
            }
            active.session_id.clone().unwrap_or_default()
        };

        let scheduled_start_nanos =
            self.clock.now_nanos() + self.config.start_delay_ms as i64 * 1_000_000;
        let cmd = self.outbox.message(Payload::CmdStart {
            session_id: session_id.clone(),
            scheduled_start_nanos,
        });
        match self.transport.send(device_id, cmd).await {
            Ok(()) => {
                info!(device = %device_id, session_id = %session_id, "late-join offered");
                true
            }
            Err(e) => {
                debug!(device = %device_id, error = %e, "late-join offer failed");
                false
            }
        }
    }

    fn enter_recording(&self, active: &mut ActiveSession) {
        active.state = SessionState::Recording;
        for id in &active.members {
            self.registry
                .set_state(&DeviceId::from(id.as_str()), DeviceState::Recording);
        }
        self.publish(active);
    }

    fn reset(&self, active: &mut ActiveSession) {
        *active = ActiveSession::default();
        self.publish(active);
    }

    fn drop_member(&self, device_id: &DeviceId) {
        let mut active = self.active.lock().expect("session state poisoned");
        if active.members.remove(device_id.as_str()) {
            active.excluded.insert(device_id.to_string());
            if let Some(signal) = &active.signal {
                let _ = signal.send(Signal::MembershipChanged);
            }
            self.publish(&active);
        }
    }

    async fn send_stop(&self, session_id: &str, targets: &[String]) {
        for id in targets {
            let cmd = self.outbox.message(Payload::CmdStop {
                session_id: session_id.to_string(),
            });
            if let Err(e) = self.transport.send(&DeviceId::from(id.as_str()), cmd).await {
                debug!(device = %id, error = %e, "stop command not delivered");
            }
        }
    }

    fn publish(&self, active: &ActiveSession) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            session_id: active.session_id.clone(),
            state: active.state,
            members: active.members.clone(),
            acked: active.acked.clone(),
            excluded: active.excluded.clone(),
        });
    }
}

fn outcome_label(outcome: &SessionOutcome) -> &'static str {
    match outcome {
        SessionOutcome::Complete { .. } => "complete",
        SessionOutcome::Degraded { .. } => "degraded",
        SessionOutcome::Aborted { .. } => "aborted",
    }
}
