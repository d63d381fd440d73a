use super::*;

use chrono::Duration as ChronoDuration;

fn in_millis(ms: i64) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::milliseconds(ms)
}

async fn drain_until_awaiting(
    rx: &mut mpsc::UnboundedReceiver<CountdownTick>,
) -> Vec<(Instant, CountdownTick)> {
    let mut ticks = Vec::new();
    while let Some(tick) = rx.recv().await {
        ticks.push((Instant::now(), tick));
        if tick.countdown == Countdown::AwaitingTransition {
            break;
        }
    }
    ticks
}

#[test]
fn countdown_renders_for_display() {
    assert_eq!(Countdown::Remaining(7).to_string(), "next transition in 7s");
    assert_eq!(Countdown::AwaitingTransition.to_string(), "awaiting transition");
}

#[test]
fn partial_seconds_round_up() {
    assert_eq!(ceil_secs(Duration::ZERO), 0);
    assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
    assert_eq!(ceil_secs(Duration::from_millis(9200)), 10);
    assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
}

#[tokio::test(start_paused = true)]
async fn counts_down_once_per_second_then_stops() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut scheduler = TransitionScheduler::new(tx);

    let started = Instant::now();
    assert_eq!(scheduler.schedule(in_millis(5000)), Countdown::Remaining(5));
    assert!(scheduler.is_active());

    let ticks = drain_until_awaiting(&mut rx).await;
    let values: Vec<Countdown> = ticks.iter().map(|(_, tick)| tick.countdown).collect();
    assert_eq!(
        values,
        vec![
            Countdown::Remaining(4),
            Countdown::Remaining(3),
            Countdown::Remaining(2),
            Countdown::Remaining(1),
            Countdown::AwaitingTransition,
        ]
    );
    for (n, (at, tick)) in ticks.iter().enumerate() {
        assert_eq!(*at - started, TICK * (n as u32 + 1));
        assert!(scheduler.accepts(tick));
    }

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err(), "no ticks after the terminal marker");
    assert!(!scheduler.is_active());
}

#[tokio::test(start_paused = true)]
async fn rescheduling_supersedes_the_running_timer() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut scheduler = TransitionScheduler::new(tx);

    scheduler.schedule(in_millis(5000));
    let first = rx.recv().await.expect("first tick");
    assert_eq!(first.countdown, Countdown::Remaining(4));
    let old_generation = scheduler.generation();

    assert_eq!(scheduler.schedule(in_millis(3000)), Countdown::Remaining(3));
    assert_ne!(scheduler.generation(), old_generation);

    let ticks = drain_until_awaiting(&mut rx).await;
    assert_eq!(ticks.len(), 3);
    assert!(ticks
        .iter()
        .all(|(_, tick)| tick.generation == scheduler.generation()));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(rx.try_recv().is_err(), "old timer must not keep ticking");
}

#[tokio::test(start_paused = true)]
async fn cancel_is_idempotent_and_silences_the_timer() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut scheduler = TransitionScheduler::new(tx);

    scheduler.cancel();
    scheduler.schedule(in_millis(10_000));
    scheduler.cancel();
    scheduler.cancel();
    assert!(!scheduler.is_active());

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn past_transition_time_needs_no_timer() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut scheduler = TransitionScheduler::new(tx);

    assert_eq!(
        scheduler.schedule(in_millis(-1500)),
        Countdown::AwaitingTransition
    );
    assert!(!scheduler.is_active());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn stale_ticks_are_rejected_after_cancel() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut scheduler = TransitionScheduler::new(tx);

    scheduler.schedule(in_millis(4000));
    let stale = CountdownTick {
        generation: scheduler.generation(),
        countdown: Countdown::Remaining(3),
    };
    assert!(scheduler.accepts(&stale));
    scheduler.cancel();
    assert!(!scheduler.accepts(&stale));
}
