//! Synchronization controller: turns inbound payloads into an immutable
//! [`ViewModel`] and publishes it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientEvent, Condition, ConditionId, PartId, Phase, PhaseId, PhaseState},
    protocol::{CounterEvaluation, InboundMessage, PhaseRef, StateChange, StateInfo},
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    hierarchy::{build_forest, phase_context, PhaseContext, PhaseNode},
    notice::StatusNotice,
    scheduler::{Countdown, CountdownTick, TransitionScheduler},
};

const NOTICE_CAPACITY: usize = 256;

/// Everything the view renders. Server-derived fields come from the latest
/// state change, except the phase fields, which persist until a change
/// carries them again. `countdown` and `auto_transition_running` are local.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewModel {
    /// `None` until the first state change has been applied.
    pub current_state: Option<PhaseState>,
    pub state_info: Option<StateInfo>,
    pub current_phase: Option<Phase>,
    /// Bare phase type name sent by the oldest server revision.
    pub phase_label: Option<String>,
    pub phases: Vec<Phase>,
    pub phase_hierarchy: Vec<PhaseNode>,
    pub detached_phases: Vec<PhaseId>,
    pub phase_context: Option<PhaseContext>,
    pub conditions: Vec<Condition>,
    pub message: Option<String>,
    pub next_transition_at: Option<DateTime<Utc>>,
    pub countdown: Option<Countdown>,
    pub auto_transition_running: bool,
}

impl ViewModel {
    pub fn enabled_events(&self) -> &'static [ClientEvent] {
        self.current_state
            .as_ref()
            .map(PhaseState::enabled_events)
            .unwrap_or_default()
    }

    pub fn highlighted_transitions(&self) -> &'static [ClientEvent] {
        self.current_state
            .as_ref()
            .map(PhaseState::highlighted_transitions)
            .unwrap_or_default()
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state
            .as_ref()
            .is_some_and(PhaseState::is_terminal)
    }

    fn set_phase_list(&mut self, phases: Vec<Phase>) {
        let forest = build_forest(&phases);
        if !forest.detached.is_empty() {
            debug!(detached = ?forest.detached, "controller: phases left out of the hierarchy");
        }
        self.phase_hierarchy = forest.roots;
        self.detached_phases = forest.detached;
        self.phases = phases;
    }

    fn refresh_phase_context(&mut self) {
        self.phase_context = self
            .current_phase
            .as_ref()
            .map(|current| phase_context(&self.phases, current));
    }
}

/// Splits the payload's phase fields into the current phase record and the
/// bare label the oldest server revision sends instead.
fn split_phase(
    current_phase: Option<Phase>,
    phase: Option<PhaseRef>,
) -> (Option<Phase>, Option<String>) {
    match phase {
        Some(PhaseRef::Record(phase)) => (current_phase.or(Some(phase)), None),
        Some(PhaseRef::Name(name)) => (current_phase, Some(name)),
        None => (current_phase, None),
    }
}

pub struct SyncController {
    view: watch::Sender<Arc<ViewModel>>,
    notices: broadcast::Sender<StatusNotice>,
    scheduler: TransitionScheduler,
    live_updates: u64,
    /// Value of `live_updates` when a live change last carried a phase list.
    live_phase_list_at: u64,
    /// Value of `live_updates` when a live change last named the current phase.
    live_current_phase_at: u64,
}

impl SyncController {
    /// Countdown ticks arrive on the receiver paired with `ticks`; feed them
    /// back through [`SyncController::apply_tick`].
    pub fn new(ticks: mpsc::UnboundedSender<CountdownTick>) -> Self {
        let (view, _) = watch::channel(Arc::new(ViewModel::default()));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            view,
            notices,
            scheduler: TransitionScheduler::new(ticks),
            live_updates: 0,
            live_phase_list_at: 0,
            live_current_phase_at: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ViewModel>> {
        self.view.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<StatusNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn notice_sender(&self) -> broadcast::Sender<StatusNotice> {
        self.notices.clone()
    }

    pub fn view(&self) -> Arc<ViewModel> {
        self.view.borrow().clone()
    }

    /// Number of live state changes applied so far. Recorded when a
    /// snapshot request starts and checked again when it lands.
    pub fn live_updates(&self) -> u64 {
        self.live_updates
    }

    pub fn scheduler(&self) -> &TransitionScheduler {
        &self.scheduler
    }

    /// One socket frame, processed in arrival order.
    pub fn handle_frame(&mut self, raw: &str) {
        if let Some(message) = self.parse(raw) {
            if let InboundMessage::StateChange(change) = &message {
                self.live_updates += 1;
                if change.phases.is_some() {
                    self.live_phase_list_at = self.live_updates;
                }
                if change.phase.is_some() || change.current_phase.is_some() {
                    self.live_current_phase_at = self.live_updates;
                }
            }
            self.apply(message);
        }
    }

    /// Snapshot body fetched over HTTP. When live state changes were applied
    /// after the request was issued, the snapshot is stale: live fields win and
    /// only the phase list or current phase those changes left out is taken
    /// from it. Returns whether the view changed.
    pub fn handle_snapshot(&mut self, raw: &str, issued_at: u64) -> bool {
        let Some(message) = self.parse(raw) else {
            return false;
        };
        if issued_at == self.live_updates {
            self.apply(message);
            return true;
        }
        match message {
            InboundMessage::StateChange(change) => self.merge_stale_snapshot(*change, issued_at),
            InboundMessage::Error(error) => {
                debug!(issued_at, error = %error.error, "controller: stale snapshot error ignored");
                false
            }
        }
    }

    fn merge_stale_snapshot(&mut self, change: StateChange, issued_at: u64) -> bool {
        let take_phases = change.phases.is_some() && self.live_phase_list_at <= issued_at;
        let take_current = (change.phase.is_some() || change.current_phase.is_some())
            && self.live_current_phase_at <= issued_at;
        if !take_phases && !take_current {
            debug!(
                issued_at,
                live_updates = self.live_updates,
                "controller: stale snapshot discarded"
            );
            return false;
        }

        let mut next = (*self.view()).clone();
        if take_current {
            (next.current_phase, next.phase_label) = split_phase(change.current_phase, change.phase);
        }
        if let Some(phases) = change.phases.filter(|_| take_phases) {
            next.set_phase_list(phases);
        }
        next.refresh_phase_context();
        debug!(
            issued_at,
            take_phases, take_current, "controller: stale snapshot merged under live state"
        );
        self.publish(next);
        true
    }

    pub fn apply(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Error(error) => {
                warn!(error = %error.error, "controller: server reported an error");
                self.notify(StatusNotice::error(error.error));
            }
            InboundMessage::StateChange(change) => self.apply_state_change(*change),
        }
    }

    fn parse(&self, raw: &str) -> Option<InboundMessage> {
        match InboundMessage::parse(raw) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(error = %err, "controller: malformed payload discarded");
                self.notify(StatusNotice::warning(format!(
                    "discarded malformed message: {err}"
                )));
                None
            }
        }
    }

    fn apply_state_change(&mut self, change: StateChange) {
        let previous = self.view();
        let message = change.display_message().map(str::to_string);
        let StateChange {
            state,
            phase,
            current_phase,
            phases,
            conditions,
            info,
            next_transition_at,
            ..
        } = change;

        // A payload without phase fields keeps the phase list, tree and
        // current phase of the previous view.
        let mut next = ViewModel {
            current_phase: previous.current_phase.clone(),
            phase_label: previous.phase_label.clone(),
            phases: previous.phases.clone(),
            phase_hierarchy: previous.phase_hierarchy.clone(),
            detached_phases: previous.detached_phases.clone(),
            ..ViewModel::default()
        };
        if phase.is_some() || current_phase.is_some() {
            (next.current_phase, next.phase_label) = split_phase(current_phase, phase);
        }
        if let Some(phases) = phases {
            next.set_phase_list(phases);
        }
        next.refresh_phase_context();

        let mut auto_transition_running = previous.auto_transition_running;
        let countdown = if state.is_terminal() {
            self.scheduler.cancel();
            auto_transition_running = false;
            None
        } else if let Some(at) = next_transition_at {
            Some(self.scheduler.schedule(at))
        } else {
            self.scheduler.cancel();
            None
        };

        info!(
            state = %state,
            phases = next.phases.len(),
            conditions = conditions.len(),
            "controller: state change applied"
        );

        self.publish(ViewModel {
            current_state: Some(state),
            state_info: info,
            conditions,
            message: message.clone(),
            next_transition_at,
            countdown,
            auto_transition_running,
            ..next
        });

        if let Some(text) = message {
            self.notify(StatusNotice::info(text));
        }
    }

    /// Writes a counter response into the one part it belongs to. Unknown
    /// condition or part ids leave the view untouched.
    pub fn apply_counter_evaluation(
        &mut self,
        condition_id: ConditionId,
        part_id: PartId,
        evaluation: &CounterEvaluation,
    ) {
        let mut next = (*self.view()).clone();
        let part = next
            .conditions
            .iter_mut()
            .find(|condition| condition.id == condition_id)
            .and_then(|condition| condition.parts.iter_mut().find(|part| part.id == part_id));
        let Some(part) = part else {
            debug!(
                condition_id = condition_id.0,
                part_id = part_id.0,
                "controller: counter response for unknown part ignored"
            );
            return;
        };
        part.current_value = Some(evaluation.current_value);
        self.publish(next);
    }

    pub fn set_auto_transition_running(&mut self, running: bool) {
        let current = self.view();
        if current.auto_transition_running == running {
            return;
        }
        let mut next = (*current).clone();
        next.auto_transition_running = running;
        self.publish(next);
    }

    pub fn apply_tick(&mut self, tick: CountdownTick) {
        if !self.scheduler.accepts(&tick) {
            debug!(generation = tick.generation, "controller: stale countdown tick dropped");
            return;
        }
        let mut next = (*self.view()).clone();
        next.countdown = Some(tick.countdown);
        self.publish(next);
    }

    pub fn notify(&self, notice: StatusNotice) {
        notice.log();
        let _ = self.notices.send(notice);
    }

    /// Stops the countdown timer. The last view stays readable.
    pub fn teardown(&mut self) {
        self.scheduler.cancel();
    }

    fn publish(&self, view: ViewModel) {
        self.view.send_replace(Arc::new(view));
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
