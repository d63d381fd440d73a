use super::*;

use chrono::Duration as ChronoDuration;
use serde_json::{json, Value};
use shared::domain::ConditionPart;

use crate::notice::Severity;

fn controller() -> (SyncController, mpsc::UnboundedReceiver<CountdownTick>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SyncController::new(tx), rx)
}

fn phases_payload(state: &str) -> Value {
    json!({
        "type": "state_change",
        "state": state,
        "current_phase": {"id": 2, "name": "Setup", "parent_id": 1, "order": 1},
        "phases": [
            {"id": 1, "name": "Stage", "parent_id": 0, "order": 1},
            {"id": 2, "name": "Setup", "parent_id": 1, "order": 1},
            {"id": 3, "name": "Review", "parent_id": 1, "order": 2},
            {"id": 9, "name": "Lost", "parent_id": 77, "order": 1}
        ],
        "conditions": [
            {
                "id": 1,
                "label": "Counts",
                "kind": 2,
                "parts": [
                    {"id": 1, "label": "first", "comparison_operator": 4, "current_value": 0},
                    {"id": 2, "label": "second", "comparison_operator": 4, "current_value": 1}
                ]
            },
            {
                "id": 2,
                "label": "Other",
                "kind": 2,
                "parts": [{"id": 2, "label": "unrelated", "current_value": 7}]
            }
        ]
    })
}

fn with_transition_in(mut payload: Value, secs: i64) -> Value {
    let at = Utc::now() + ChronoDuration::seconds(secs);
    payload["next_transition_at"] = Value::String(at.to_rfc3339());
    payload
}

fn part(view: &ViewModel, condition: i64, part: i64) -> ConditionPart {
    view.conditions
        .iter()
        .find(|c| c.id == ConditionId(condition))
        .and_then(|c| c.part(PartId(part)))
        .cloned()
        .expect("part present")
}

#[tokio::test]
async fn state_change_replaces_view_and_builds_hierarchy() {
    let (mut controller, _ticks) = controller();
    controller.handle_frame(&phases_payload("next").to_string());

    let view = controller.view();
    assert_eq!(view.current_state, Some(PhaseState::Next));
    assert_eq!(view.phases.len(), 4);
    assert_eq!(view.phase_hierarchy.len(), 1);
    assert_eq!(view.phase_hierarchy[0].phase.id, PhaseId(1));
    let children: Vec<PhaseId> = view.phase_hierarchy[0]
        .children
        .iter()
        .map(|node| node.phase.id)
        .collect();
    assert_eq!(children, vec![PhaseId(2), PhaseId(3)]);
    assert_eq!(view.detached_phases, vec![PhaseId(9)]);

    let context = view.phase_context.as_ref().expect("context");
    assert_eq!(context.parent.as_ref().map(|p| p.id), Some(PhaseId(1)));
    assert!(context.children.is_empty());
    assert_eq!(view.enabled_events(), &[ClientEvent::Finish]);
    assert_eq!(
        view.highlighted_transitions(),
        &[ClientEvent::Activate, ClientEvent::Finish]
    );
    assert_eq!(view.countdown, None);
}

#[tokio::test]
async fn applying_the_same_payload_twice_is_idempotent() {
    let (mut controller, _ticks) = controller();
    let raw = phases_payload("active").to_string();

    controller.handle_frame(&raw);
    let first = controller.view();
    controller.handle_frame(&raw);
    let second = controller.view();

    assert_eq!(*first, *second);
    assert_eq!(second.phases.len(), 4);
    assert_eq!(second.conditions.len(), 2);
}

#[tokio::test]
async fn repeated_payload_with_countdown_keeps_server_fields_identical() {
    let (mut controller, _ticks) = controller();
    let raw = with_transition_in(phases_payload("active"), 120).to_string();

    controller.handle_frame(&raw);
    let first = controller.view();
    controller.handle_frame(&raw);
    let second = controller.view();

    assert_eq!(first.phases, second.phases);
    assert_eq!(first.phase_hierarchy, second.phase_hierarchy);
    assert_eq!(first.conditions, second.conditions);
    assert_eq!(first.next_transition_at, second.next_transition_at);
    assert!(matches!(second.countdown, Some(Countdown::Remaining(_))));
    assert!(controller.scheduler().is_active());
}

#[tokio::test]
async fn error_message_leaves_view_untouched() {
    let (mut controller, _ticks) = controller();
    let mut notices = controller.subscribe_notices();
    controller.handle_frame(&phases_payload("active").to_string());
    let before = controller.view();

    controller.handle_frame(r#"{"type":"error","error":"boom"}"#);

    assert_eq!(*controller.view(), *before);
    let notice = notices.try_recv().expect("notice");
    assert_eq!(notice.text, "boom");
    assert_eq!(notice.severity, Severity::Error);
}

#[tokio::test]
async fn malformed_payload_is_discarded_with_a_warning() {
    let (mut controller, _ticks) = controller();
    let mut notices = controller.subscribe_notices();
    controller.handle_frame(&phases_payload("active").to_string());
    let before = controller.view();

    controller.handle_frame("{not json");
    controller.handle_frame(r#"{"type":"state_change","phases":[]}"#);
    controller.handle_frame(r#"{"type":"state_change","state":"next","phases":"nope"}"#);

    assert_eq!(*controller.view(), *before);
    let mut warnings = 0;
    while let Ok(notice) = notices.try_recv() {
        assert_eq!(notice.severity, Severity::Warning);
        assert!(notice.text.starts_with("discarded malformed message"));
        warnings += 1;
    }
    assert_eq!(warnings, 3);
}

#[tokio::test]
async fn terminal_state_cancels_countdown_and_stops_auto_transition() {
    let (mut controller, _ticks) = controller();
    controller.set_auto_transition_running(true);

    controller.handle_frame(&with_transition_in(phases_payload("next"), 10).to_string());
    let view = controller.view();
    assert_eq!(view.countdown, Some(Countdown::Remaining(10)));
    assert!(view.auto_transition_running);
    assert!(controller.scheduler().is_active());

    controller.handle_frame(&with_transition_in(phases_payload("finish"), 10).to_string());
    let view = controller.view();
    assert_eq!(view.current_state, Some(PhaseState::Finish));
    assert_eq!(view.countdown, None);
    assert!(!view.auto_transition_running);
    assert!(!controller.scheduler().is_active());
    assert!(view.next_transition_at.is_some());
}

#[tokio::test]
async fn missing_transition_time_clears_countdown() {
    let (mut controller, _ticks) = controller();
    controller.handle_frame(&with_transition_in(phases_payload("active"), 30).to_string());
    assert!(controller.scheduler().is_active());

    controller.handle_frame(&phases_payload("active").to_string());
    assert_eq!(controller.view().countdown, None);
    assert!(!controller.scheduler().is_active());
}

#[tokio::test]
async fn live_change_without_phase_list_keeps_the_tree() {
    let (mut controller, _ticks) = controller();
    controller.handle_frame(&phases_payload("active").to_string());
    let before = controller.view();

    controller.handle_frame(
        &json!({
            "type": "state_change",
            "state": "next",
            "info": {"name": "next", "message": "interval: 5s"},
            "phase": "STAGE",
            "message": "interval: 5s"
        })
        .to_string(),
    );
    let view = controller.view();
    assert_eq!(view.current_state, Some(PhaseState::Next));
    assert_eq!(view.phases.len(), 4);
    assert_eq!(view.phase_hierarchy.len(), 1);
    assert_eq!(view.phase_hierarchy, before.phase_hierarchy);
    assert_eq!(view.detached_phases, vec![PhaseId(9)]);
    assert_eq!(view.phase_label.as_deref(), Some("STAGE"));
    assert_eq!(view.current_phase, None);
    assert_eq!(view.phase_context, None);

    controller.handle_frame(r#"{"state":"active"}"#);
    let view = controller.view();
    assert_eq!(view.phases.len(), 4);
    assert_eq!(view.phase_label.as_deref(), Some("STAGE"));
}

#[tokio::test]
async fn retained_phase_list_feeds_the_new_current_phase_context() {
    let (mut controller, _ticks) = controller();
    controller.handle_frame(&phases_payload("active").to_string());

    controller.handle_frame(
        &json!({
            "state": "next",
            "phase": {"id": 1, "name": "Stage", "parent_id": 0, "order": 1},
            "conditions": null
        })
        .to_string(),
    );
    let view = controller.view();
    assert_eq!(view.phases.len(), 4);
    assert!(view.conditions.is_empty());
    assert_eq!(view.current_phase.as_ref().map(|p| p.id), Some(PhaseId(1)));
    assert_eq!(view.phase_label, None);
    let context = view.phase_context.as_ref().expect("context");
    assert_eq!(context.parent, None);
    let children: Vec<PhaseId> = context.children.iter().map(|p| p.id).collect();
    assert_eq!(children, vec![PhaseId(2), PhaseId(3)]);

    controller.handle_frame(r#"{"state":"active","phases":[]}"#);
    let view = controller.view();
    assert!(view.phases.is_empty());
    assert!(view.phase_hierarchy.is_empty());
    assert!(view.detached_phases.is_empty());
    let context = view.phase_context.as_ref().expect("context");
    assert!(context.children.is_empty());
}

#[tokio::test]
async fn server_message_becomes_an_info_notice() {
    let (mut controller, _ticks) = controller();
    let mut notices = controller.subscribe_notices();

    controller.handle_frame(r#"{"state":"active","message":"phase started"}"#);
    controller.handle_frame(r#"{"state":"next","info":{"name":"next","message":"almost there"}}"#);
    controller.handle_frame(r#"{"state":"next","message":""}"#);

    let texts: Vec<String> = std::iter::from_fn(|| notices.try_recv().ok())
        .map(|notice| notice.text)
        .collect();
    assert_eq!(texts, vec!["phase started", "almost there"]);
    assert_eq!(controller.view().message, None);
}

#[tokio::test]
async fn counter_response_updates_only_its_part() {
    let (mut controller, _ticks) = controller();
    controller.handle_frame(&phases_payload("active").to_string());
    let before = controller.view();

    controller.apply_counter_evaluation(
        ConditionId(1),
        PartId(2),
        &CounterEvaluation {
            current_value: 3,
            is_satisfied: false,
            target_value: None,
        },
    );
    let after = controller.view();

    assert_eq!(part(&after, 1, 2).current_value, Some(3));
    assert_eq!(part(&after, 1, 1), part(&before, 1, 1));
    assert_eq!(part(&after, 2, 2), part(&before, 2, 2));
    assert_eq!(after.phases, before.phases);
    assert_eq!(after.current_state, before.current_state);

    controller.apply_counter_evaluation(
        ConditionId(42),
        PartId(1),
        &CounterEvaluation {
            current_value: 9,
            is_satisfied: true,
            target_value: Some(9),
        },
    );
    assert_eq!(*controller.view(), *after);
}

#[tokio::test]
async fn snapshot_older_than_live_update_never_overrides_live_state() {
    let (mut controller, _ticks) = controller();

    let issued = controller.live_updates();
    controller.handle_frame(r#"{"state":"active"}"#);
    assert!(!controller.handle_snapshot(r#"{"state":"ready"}"#, issued));
    assert_eq!(controller.view().current_state, Some(PhaseState::Active));

    let issued = controller.live_updates();
    assert!(controller.handle_snapshot(r#"{"state":"next"}"#, issued));
    assert_eq!(controller.view().current_state, Some(PhaseState::Next));

    controller.handle_frame(r#"{"type":"error","error":"ignored for staleness"}"#);
    assert_eq!(controller.live_updates(), issued);
}

#[tokio::test]
async fn stale_snapshot_fills_in_the_phase_list_live_frames_omit() {
    let (mut controller, _ticks) = controller();

    let issued = controller.live_updates();
    controller.handle_frame(r#"{"type":"state_change","state":"active","phase":"STAGE"}"#);
    assert!(controller.handle_snapshot(&phases_payload("ready").to_string(), issued));

    let view = controller.view();
    assert_eq!(view.current_state, Some(PhaseState::Active));
    assert!(view.conditions.is_empty());
    assert_eq!(view.phases.len(), 4);
    assert_eq!(view.phase_hierarchy.len(), 1);
    assert_eq!(view.detached_phases, vec![PhaseId(9)]);
    assert_eq!(view.phase_label.as_deref(), Some("STAGE"));
    assert_eq!(view.current_phase, None);

    controller.handle_frame(r#"{"state":"next"}"#);
    let view = controller.view();
    assert_eq!(view.current_state, Some(PhaseState::Next));
    assert_eq!(view.phases.len(), 4);
}

#[tokio::test]
async fn stale_snapshot_takes_current_phase_only_when_live_frames_named_none() {
    let (mut controller, _ticks) = controller();

    let issued = controller.live_updates();
    controller.handle_frame(r#"{"state":"active"}"#);
    assert!(controller.handle_snapshot(&phases_payload("ready").to_string(), issued));
    let view = controller.view();
    assert_eq!(view.current_state, Some(PhaseState::Active));
    assert_eq!(view.current_phase.as_ref().map(|p| p.id), Some(PhaseId(2)));
    let context = view.phase_context.as_ref().expect("context");
    assert_eq!(context.parent.as_ref().map(|p| p.id), Some(PhaseId(1)));

    let issued = controller.live_updates();
    controller.handle_frame(&phases_payload("next").to_string());
    let before = controller.view();
    assert!(!controller.handle_snapshot(
        &json!({
            "state": "ready",
            "current_phase": {"id": 3, "name": "Review", "parent_id": 1, "order": 2},
            "phases": [{"id": 3, "name": "Review", "parent_id": 0, "order": 1}]
        })
        .to_string(),
        issued
    ));
    assert_eq!(*controller.view(), *before);
}

#[tokio::test]
async fn only_current_ticks_update_the_countdown() {
    let (mut controller, _ticks) = controller();
    controller.handle_frame(&with_transition_in(phases_payload("active"), 30).to_string());
    let generation = controller.scheduler().generation();

    controller.apply_tick(CountdownTick {
        generation: generation.wrapping_sub(1),
        countdown: Countdown::Remaining(1),
    });
    assert_eq!(controller.view().countdown, Some(Countdown::Remaining(30)));

    controller.apply_tick(CountdownTick {
        generation,
        countdown: Countdown::Remaining(29),
    });
    assert_eq!(controller.view().countdown, Some(Countdown::Remaining(29)));

    controller.teardown();
    assert!(!controller.scheduler().is_active());
}

#[tokio::test]
async fn auto_transition_flag_survives_state_changes() {
    let (mut controller, _ticks) = controller();
    let mut view_rx = controller.subscribe();

    controller.set_auto_transition_running(true);
    assert!(view_rx.has_changed().expect("watch open"));
    let _ = view_rx.borrow_and_update();
    controller.set_auto_transition_running(true);
    assert!(!view_rx.has_changed().expect("watch open"));

    controller.handle_frame(r#"{"state":"active"}"#);
    assert!(controller.view().auto_transition_running);
    controller.set_auto_transition_running(false);
    assert!(!controller.view().auto_transition_running);
}
