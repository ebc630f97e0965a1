//! Live countdown for an armed device.
//!
//! Wraps [`ActivationWindow`] in a watch channel and drives it from a single
//! interval task. Tick times come from a monotonic clock anchored when the
//! window is armed, so wall clock jumps cannot stretch or cut the countdown.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use chrono::{DateTime, Utc};
use pumplink_core::activation::{ActivationWindow, TICK_INTERVAL, TickOutcome};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, info};

pub struct ActivationTracker {
    window: Arc<watch::Sender<ActivationWindow>>,
    timer: Option<JoinHandle<()>>,
    generation: Arc<AtomicU64>,
    live_timers: Arc<AtomicUsize>,
}

impl Default for ActivationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivationTracker {
    pub fn new() -> Self {
        let (window, _) = watch::channel(ActivationWindow::disarmed());
        Self {
            window: Arc::new(window),
            timer: None,
            generation: Arc::new(AtomicU64::new(0)),
            live_timers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replaces the deadline. Any running countdown stops before the new one
    /// is evaluated; a past or missing deadline leaves the window disarmed.
    pub fn set_active_until(&mut self, active_until: Option<DateTime<Utc>>) {
        self.cancel_timer();

        let anchor_wall = Utc::now();
        let window = ActivationWindow::starting(active_until, anchor_wall);
        let armed = window.is_armed();
        self.window.send_replace(window);

        if !armed {
            debug!(?active_until, "activation window disarmed");
            return;
        }

        info!(?active_until, "activation window armed");
        let generation = self.generation.load(Ordering::Acquire);
        let guard = LiveTimer::register(&self.live_timers);
        let window = Arc::clone(&self.window);
        let current_generation = Arc::clone(&self.generation);

        self.timer = Some(tokio::spawn(async move {
            let _guard = guard;
            let anchor = Instant::now();
            let mut ticks = interval_at(anchor + TICK_INTERVAL, TICK_INTERVAL);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticks.tick().await;
                let Ok(elapsed) = chrono::Duration::from_std(anchor.elapsed()) else {
                    break;
                };
                let now = anchor_wall + elapsed;

                let mut finished = false;
                window.send_if_modified(|current| {
                    if current_generation.load(Ordering::Acquire) != generation {
                        finished = true;
                        return false;
                    }
                    let (changed, outcome) = advance(current, now);
                    finished = outcome == TickOutcome::Expired;
                    changed
                });

                if finished {
                    debug!("activation countdown finished");
                    break;
                }
            }
        }));
    }

    pub fn window(&self) -> ActivationWindow {
        self.window.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ActivationWindow> {
        self.window.subscribe()
    }

    /// Countdown tasks that have not yet wound down. Never more than one once
    /// a cancelled task has been reaped.
    pub fn active_timers(&self) -> usize {
        self.live_timers.load(Ordering::Acquire)
    }

    fn cancel_timer(&mut self) {
        // Bumping the generation stops a cancelled task from publishing even
        // if it is mid-tick on another worker.
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for ActivationTracker {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Moves `window` forward to `now`. The flag is true only when what a
/// subscriber renders (label or armed state) differs afterwards.
fn advance(window: &mut ActivationWindow, now: DateTime<Utc>) -> (bool, TickOutcome) {
    let was_armed = window.is_armed();
    let shown = window.label().to_owned();
    let outcome = window.tick(now);
    let changed = window.is_armed() != was_armed || window.label() != shown;
    (changed, outcome)
}

struct LiveTimer {
    count: Arc<AtomicUsize>,
}

impl LiveTimer {
    fn register(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self {
            count: Arc::clone(count),
        }
    }
}

impl Drop for LiveTimer {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}
