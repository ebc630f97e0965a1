//! Circular duration dial.
//!
//! A single-finger drag is mapped onto an angle measured clockwise from
//! 12 o'clock. Ten degrees make one minute. The bottom 60 degrees of the
//! circle (300..360) are a dead zone: an update landing there is dropped so
//! the indicator can never wrap from the maximum back to the minimum.
//!
//! Everything the renderer needs (indicator position, progress ring offset,
//! label) is derived from the angle inside the same call that changes it.

use std::f64::consts::PI;

use crate::CoreError;

/// Circumference of the progress ring, in drawing units.
pub const CIRCLE_LENGTH: f64 = 1000.0;
pub const MAX_ANGLE_DEGREES: f64 = 300.0;
pub const DEGREES_PER_MINUTE: f64 = 10.0;
pub const HAPTIC_STEP_DEGREES: f64 = 20.0;
pub const TICK_MINUTES: [u32; 16] = [0, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 22, 24, 26, 28, 30];

// Upper end of the fill interpolation range, deliberately past the dead zone.
const FILL_ANGLE_SPAN: f64 = 330.0;
// Nanodegree grid; keeps atan2 noise from flickering across thresholds.
const ANGLE_QUANTUM: f64 = 1e9;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Dial center and radius in screen coordinates (y grows downwards).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DialGeometry {
    pub center: Point,
    pub radius: f64,
}

impl DialGeometry {
    pub fn new(center: Point) -> Self {
        Self {
            center,
            radius: CIRCLE_LENGTH / (2.0 * PI),
        }
    }

    pub fn with_radius(center: Point, radius: f64) -> Result<Self, CoreError> {
        if !radius.is_finite() || radius <= 0.0 {
            return Err(CoreError::InvalidDialRadius(radius));
        }
        Ok(Self { center, radius })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickLabel {
    pub minutes: u32,
    pub anchor: Point,
}

/// Angle of a pointer offset from the dial center, clockwise from straight up.
pub fn angle_from_offset(dx: f64, dy: f64) -> f64 {
    let degrees = dy.atan2(dx).to_degrees() + 90.0 + 360.0;
    ((degrees * ANGLE_QUANTUM).round() / ANGLE_QUANTUM) % 360.0
}

pub fn is_reachable(angle: f64) -> bool {
    angle <= MAX_ANGLE_DEGREES
}

pub fn duration_minutes(angle: f64) -> u32 {
    (angle / DEGREES_PER_MINUTE).round() as u32
}

pub fn duration_label(angle: f64) -> String {
    let minutes = duration_minutes(angle);
    if (angle / DEGREES_PER_MINUTE).floor() < 2.0 {
        format!("{minutes} minute")
    } else {
        format!("{minutes} minutes")
    }
}

/// Dash offset of the progress ring; the ring is empty at 0 degrees.
pub fn ring_offset(angle: f64) -> f64 {
    CIRCLE_LENGTH * (1.0 - angle / 360.0)
}

pub fn indicator_position(geometry: &DialGeometry, angle: f64) -> Point {
    let theta = (angle - 90.0).to_radians();
    Point::new(
        geometry.center.x + geometry.radius * theta.cos(),
        geometry.center.y + geometry.radius * theta.sin(),
    )
}

/// Height of the liquid fill drawn inside the dial.
pub fn fill_height(geometry: &DialGeometry, angle: f64) -> f64 {
    let level = angle.max(1.0);
    1.0 + (level - 1.0) * (geometry.radius * 2.0 - 1.0) / (FILL_ANGLE_SPAN - 1.0)
}

pub fn tick_labels(geometry: &DialGeometry) -> Vec<TickLabel> {
    TICK_MINUTES
        .iter()
        .map(|&minutes| TickLabel {
            minutes,
            anchor: indicator_position(geometry, f64::from(minutes) * DEGREES_PER_MINUTE),
        })
        .collect()
}

/// Rate limiter for tactile feedback during a drag.
///
/// The anchor only ever moves along the 20 degree grid, so a sweep pulses
/// once per grid line crossed no matter how finely the drag was sampled.
/// A single update still pulses at most once, however far it jumps.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HapticCursor {
    last_triggered: f64,
}

impl HapticCursor {
    pub fn last_triggered(&self) -> f64 {
        self.last_triggered
    }

    pub fn should_pulse(&mut self, angle: f64) -> bool {
        let delta = angle - self.last_triggered;
        if delta.abs() < HAPTIC_STEP_DEGREES {
            return false;
        }
        self.last_triggered += HAPTIC_STEP_DEGREES * (delta / HAPTIC_STEP_DEGREES).trunc();
        true
    }

    pub fn reset(&mut self) {
        self.last_triggered = 0.0;
    }
}

/// Receives the dial's side effects. Called synchronously from the update.
pub trait DialFeedback {
    fn duration_changed(&mut self, label: &str);

    fn haptic_pulse(&mut self) {}
}

impl DialFeedback for () {
    fn duration_changed(&mut self, _label: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DragUpdate {
    Moved { angle: f64, pulsed: bool },
    Unchanged,
    /// The pointer is over the forbidden arc; nothing changed.
    DeadZone,
}

#[derive(Debug)]
pub struct DialEngine<F> {
    geometry: DialGeometry,
    angle: f64,
    indicator: Point,
    ring_offset: f64,
    drag_origin: Option<Point>,
    haptics: HapticCursor,
    feedback: F,
}

impl<F: DialFeedback> DialEngine<F> {
    pub fn new(geometry: DialGeometry, feedback: F) -> Self {
        Self {
            geometry,
            angle: 0.0,
            indicator: indicator_position(&geometry, 0.0),
            ring_offset: ring_offset(0.0),
            drag_origin: None,
            haptics: HapticCursor::default(),
            feedback,
        }
    }

    /// Pins the drag origin to wherever the indicator currently sits, so the
    /// drag resumes from there instead of jumping to the finger.
    pub fn begin_drag(&mut self) {
        self.drag_origin = Some(self.indicator);
    }

    /// `translation` is the pointer's accumulated movement since the drag began.
    pub fn update_drag(&mut self, translation: Point) -> DragUpdate {
        let origin = *self.drag_origin.get_or_insert(self.indicator);
        let dx = origin.x + translation.x - self.geometry.center.x;
        let dy = origin.y + translation.y - self.geometry.center.y;

        let angle = angle_from_offset(dx, dy);
        if !is_reachable(angle) {
            return DragUpdate::DeadZone;
        }
        if angle == self.angle {
            return DragUpdate::Unchanged;
        }
        self.apply_angle(angle)
    }

    pub fn end_drag(&mut self) {
        self.drag_origin = None;
    }

    /// Runs a complete drag whose pointer comes to rest on the circle at `angle`.
    pub fn drag_to(&mut self, angle: f64) -> DragUpdate {
        self.begin_drag();
        let target = indicator_position(&self.geometry, angle);
        let translation = Point::new(target.x - self.indicator.x, target.y - self.indicator.y);
        let update = self.update_drag(translation);
        self.end_drag();
        update
    }

    pub fn reset(&mut self) {
        self.drag_origin = None;
        self.haptics.reset();
        if self.angle != 0.0 {
            self.angle = 0.0;
            self.indicator = indicator_position(&self.geometry, 0.0);
            self.ring_offset = ring_offset(0.0);
            self.feedback.duration_changed(&duration_label(0.0));
        }
    }

    fn apply_angle(&mut self, angle: f64) -> DragUpdate {
        self.angle = angle;
        self.indicator = indicator_position(&self.geometry, angle);
        self.ring_offset = ring_offset(angle);

        let pulsed = self.haptics.should_pulse(angle);
        if pulsed {
            self.feedback.haptic_pulse();
        }
        self.feedback.duration_changed(&duration_label(angle));
        DragUpdate::Moved { angle, pulsed }
    }

    pub fn angle(&self) -> f64 {
        self.angle
    }

    pub fn duration_minutes(&self) -> u32 {
        duration_minutes(self.angle)
    }

    pub fn label(&self) -> String {
        duration_label(self.angle)
    }

    pub fn ring_offset(&self) -> f64 {
        self.ring_offset
    }

    pub fn indicator(&self) -> Point {
        self.indicator
    }

    pub fn fill_height(&self) -> f64 {
        fill_height(&self.geometry, self.angle)
    }

    pub fn geometry(&self) -> &DialGeometry {
        &self.geometry
    }

    pub fn is_dragging(&self) -> bool {
        self.drag_origin.is_some()
    }

    pub fn feedback(&self) -> &F {
        &self.feedback
    }

    pub fn into_feedback(self) -> F {
        self.feedback
    }
}
