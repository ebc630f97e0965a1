//! Countdown arithmetic for an armed device.
//!
//! The window is armed exactly while `active_until` lies in the future. The
//! client drives [`ActivationWindow::tick`] once per [`TICK_INTERVAL`].

use std::time::Duration;

use chrono::{DateTime, Utc};

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActivationWindow {
    active_until: Option<DateTime<Utc>>,
    remaining: Duration,
    label: String,
    is_armed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Running,
    Expired,
}

impl ActivationWindow {
    pub fn disarmed() -> Self {
        Self::default()
    }

    /// A window for a server-supplied deadline, already evaluated at `now`.
    pub fn starting(active_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let Some(until) = active_until.filter(|until| *until > now) else {
            return Self::disarmed();
        };

        let mut window = Self {
            active_until: Some(until),
            is_armed: true,
            ..Self::default()
        };
        window.tick(now);
        window
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let Some(until) = self.active_until else {
            return TickOutcome::Expired;
        };

        match (until - now).to_std() {
            Ok(remaining) if !remaining.is_zero() => {
                self.remaining = remaining;
                self.label = format_remaining(remaining);
                TickOutcome::Running
            }
            _ => {
                *self = Self::disarmed();
                TickOutcome::Expired
            }
        }
    }

    pub fn active_until(&self) -> Option<DateTime<Utc>> {
        self.active_until
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    /// `MM:SS` while armed, empty otherwise.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_armed(&self) -> bool {
        self.is_armed
    }
}

/// Zero-padded `MM:SS`. Minutes do not roll over into hours.
pub fn format_remaining(remaining: Duration) -> String {
    let total = remaining.as_secs();
    format!("{:02}:{:02}", total / 60, total % 60)
}
