//! Stick and trigger calibration.
//!
//! Sticks are normalized from the raw byte domain through a learned center
//! and half-range, clamped by an octagonal gate captured during calibration
//! (the physical GameCube gate), then passed through a small radial
//! dead-zone. Triggers run through a three-point base/bump/max curve that
//! models the mechanical detent of the analog trigger.

use std::sync::Mutex;

use tracing::warn;

use crate::input::RawSample;

pub const DEFAULT_CENTER: f64 = 128.0;
pub const DEFAULT_RANGE: f64 = 100.0;

/// Radial dead-zone in normalized units, to eat rest jitter.
pub const DEAD_ZONE: f64 = 0.05;

/// Normalized output at the bump point when bump mode is off.
pub const BUMP_KINK: f64 = 0.8;

/// Learned octagon gate: eight normalized extents, one per 45° sector
/// starting at 0° (east), counter-clockwise.
pub type Octagon = [(f64, f64); 8];

/// `clamp((v - c) / r, -1, 1)`. A degenerate range falls back to the
/// default so a bad calibration never produces NaN or unbounded output.
pub fn normalize(v: f64, center: f64, range: f64) -> f64 {
    let range = if range > 0.0 { range } else { DEFAULT_RANGE };
    ((v - center) / range).clamp(-1.0, 1.0)
}

/// Per-stick calibration (raw byte domain).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StickCal {
    pub center_x: f64,
    pub center_y: f64,
    pub range_x: f64,
    pub range_y: f64,
    pub octagon: Option<Octagon>,
}

impl Default for StickCal {
    fn default() -> Self {
        Self {
            center_x: DEFAULT_CENTER,
            center_y: DEFAULT_CENTER,
            range_x: DEFAULT_RANGE,
            range_y: DEFAULT_RANGE,
            octagon: None,
        }
    }
}

impl StickCal {
    pub fn is_degenerate(&self) -> bool {
        self.range_x <= 0.0 || self.range_y <= 0.0
    }

    /// Full normalization chain: center/range, octagon gate, dead-zone.
    pub fn apply(&self, raw: (u8, u8)) -> (f64, f64) {
        let x = normalize(raw.0 as f64, self.center_x, self.range_x);
        let y = normalize(raw.1 as f64, self.center_y, self.range_y);
        let (x, y) = match &self.octagon {
            Some(oct) => clamp_to_octagon((x, y), oct),
            None => (x, y),
        };
        apply_dead_zone((x, y))
    }
}

/// Per-trigger calibration (raw byte domain).
///
/// Invariant: `0 <= base < bump < max <= 255`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriggerCal {
    pub base: f64,
    pub bump: f64,
    pub max: f64,
}

impl Default for TriggerCal {
    fn default() -> Self {
        Self {
            base: 0.0,
            bump: 190.0,
            max: 255.0,
        }
    }
}

impl TriggerCal {
    pub fn is_degenerate(&self) -> bool {
        !(self.base < self.bump && self.bump < self.max)
    }

    /// Normalize a raw trigger value to 0-255.
    ///
    /// With `bump_is_full` the output saturates at the bump; otherwise the
    /// curve is the two-segment map `[base→0, bump→BUMP_KINK, max→1]`.
    pub fn apply(&self, raw: u8, bump_is_full: bool) -> u8 {
        let t = raw as f64;
        if self.is_degenerate() {
            // Degenerate calibration: identity.
            return raw;
        }
        if t <= self.base {
            return 0;
        }

        let out = if bump_is_full {
            ((t - self.base) / (self.bump - self.base)).clamp(0.0, 1.0)
        } else if t <= self.bump {
            BUMP_KINK * (t - self.base) / (self.bump - self.base)
        } else {
            BUMP_KINK + (1.0 - BUMP_KINK) * ((t - self.bump) / (self.max - self.bump)).min(1.0)
        };
        (out * 255.0).round().clamp(0.0, 255.0) as u8
    }
}

/// Radial dead-zone around the origin.
pub fn apply_dead_zone(p: (f64, f64)) -> (f64, f64) {
    if (p.0 * p.0 + p.1 * p.1).sqrt() < DEAD_ZONE {
        (0.0, 0.0)
    } else {
        p
    }
}

/// Distance from the origin to the octagon boundary along `dir`.
///
/// `dir` need not be normalized. Returns the scale `t` such that `t * dir`
/// lies on the boundary.
fn boundary_scale(dir: (f64, f64), oct: &Octagon) -> f64 {
    let theta = angle_of(dir);
    for i in 0..8 {
        let a = oct[i];
        let b = oct[(i + 1) % 8];
        if !sector_contains(angle_of(a), angle_of(b), theta) {
            continue;
        }
        // Intersect the ray t*dir with the segment a + s*(b - a).
        let e = (b.0 - a.0, b.1 - a.1);
        let denom = dir.0 * e.1 - dir.1 * e.0;
        if denom.abs() < 1e-9 {
            break;
        }
        let t = (a.0 * e.1 - a.1 * e.0) / denom;
        if t > 0.0 {
            return t;
        }
    }
    // Edge lookup failed (collinear or malformed gate): fall back to the
    // nearest vertex radius so the gate never expands a point outward.
    oct.iter()
        .map(|v| (v.0 * v.0 + v.1 * v.1).sqrt())
        .fold(f64::INFINITY, f64::min)
}

fn angle_of(p: (f64, f64)) -> f64 {
    let a = p.1.atan2(p.0);
    if a < 0.0 {
        a + std::f64::consts::TAU
    } else {
        a
    }
}

/// Whether `theta` lies in the arc from `start` to `end` going CCW.
fn sector_contains(start: f64, end: f64, theta: f64) -> bool {
    let span = (end - start).rem_euclid(std::f64::consts::TAU);
    let off = (theta - start).rem_euclid(std::f64::consts::TAU);
    off <= span + 1e-9
}

/// Project a normalized point onto the octagon if it lies outside,
/// preserving direction. Points inside pass through unchanged.
pub fn clamp_to_octagon(p: (f64, f64), oct: &Octagon) -> (f64, f64) {
    let mag = (p.0 * p.0 + p.1 * p.1).sqrt();
    if mag < 1e-9 {
        return p;
    }
    let limit = boundary_scale(p, oct);
    if mag <= limit {
        p
    } else {
        let scale = limit / mag;
        (p.0 * scale, p.1 * scale)
    }
}

// ── Calibration acquisition ─────────────────────────────────────────

/// In-progress stick calibration for one stick.
///
/// Tracks per-axis extremes and the farthest raw point seen in each 45°
/// sector, measured from the running center estimate.
#[derive(Clone, Debug)]
pub struct StickSession {
    min_x: f64,
    max_x: f64,
    min_y: f64,
    max_y: f64,
    best: [Option<(f64, f64, f64)>; 8], // (dist², raw_x, raw_y)
}

impl StickSession {
    pub fn new() -> Self {
        Self {
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            min_y: f64::INFINITY,
            max_y: f64::NEG_INFINITY,
            best: [None; 8],
        }
    }

    pub fn update(&mut self, raw: (u8, u8)) {
        let (x, y) = (raw.0 as f64, raw.1 as f64);
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);

        let cx = (self.min_x + self.max_x) / 2.0;
        let cy = (self.min_y + self.max_y) / 2.0;
        let (dx, dy) = (x - cx, y - cy);
        let dist2 = dx * dx + dy * dy;
        if dist2 < 1.0 {
            return;
        }
        let sector =
            ((angle_of((dx, dy)) / std::f64::consts::TAU * 8.0).floor() as usize).min(7);
        match self.best[sector] {
            Some((d, _, _)) if d >= dist2 => {}
            _ => self.best[sector] = Some((dist2, x, y)),
        }
    }

    /// Snapshot of the captured sector points, for live rendering.
    pub fn points(&self) -> Vec<(f64, f64)> {
        self.best
            .iter()
            .flatten()
            .map(|&(_, x, y)| (x, y))
            .collect()
    }

    /// Finish the session: center = midpoint, range = half-range, octagon =
    /// normalized sector extents. Sectors never reached fall back to a unit
    /// vertex at the sector midpoint.
    pub fn finish(self) -> StickCal {
        if !self.min_x.is_finite() || self.max_x - self.min_x < 1.0 {
            warn!("[CAL] Stick calibration captured no usable range, keeping defaults");
            return StickCal::default();
        }

        let center_x = (self.min_x + self.max_x) / 2.0;
        let center_y = (self.min_y + self.max_y) / 2.0;
        let range_x = (self.max_x - self.min_x) / 2.0;
        let range_y = ((self.max_y - self.min_y) / 2.0).max(1.0);

        let mut octagon = [(0.0, 0.0); 8];
        for (i, slot) in octagon.iter_mut().enumerate() {
            *slot = match self.best[i] {
                Some((_, x, y)) => (
                    normalize(x, center_x, range_x),
                    normalize(y, center_y, range_y),
                ),
                None => {
                    let mid = (i as f64 + 0.5) / 8.0 * std::f64::consts::TAU;
                    (mid.cos(), mid.sin())
                }
            };
        }

        StickCal {
            center_x,
            center_y,
            range_x,
            range_y,
            octagon: Some(octagon),
        }
    }
}

/// Three-step trigger calibration wizard: rest → bump → max, both triggers
/// sampled together.
#[derive(Clone, Copy, Debug, Default)]
pub struct TriggerWizard {
    step: u8,
    latest: (u8, u8),
    rest: (u8, u8),
    bump: (u8, u8),
}

/// Result of advancing the wizard: the new step plus the UI strings for it.
pub type WizardStep = (u8, &'static str, &'static str);

impl TriggerWizard {
    pub fn is_active(&self) -> bool {
        self.step != 0
    }

    /// Feed the most recent raw trigger pair; called from the pipeline.
    pub fn feed(&mut self, triggers: (u8, u8)) {
        self.latest = triggers;
    }

    /// Advance the wizard. Returns the new step and its UI strings, or
    /// `None` once the final capture completes (the result is then
    /// available from [`TriggerWizard::take_result`]).
    pub fn next_step(&mut self) -> Option<WizardStep> {
        self.step += 1;
        match self.step {
            1 => Some((
                1,
                "Capture Resting",
                "Release both triggers fully, then capture",
            )),
            2 => {
                self.rest = self.latest;
                Some((
                    2,
                    "Capture Bump",
                    "Pull both triggers to the first hard stop, then capture",
                ))
            }
            3 => {
                self.bump = self.latest;
                Some((
                    3,
                    "Capture Max",
                    "Squeeze both triggers all the way in, then capture",
                ))
            }
            _ => {
                self.step = 0;
                None
            }
        }
    }

    /// Build the calibrations from the captured points, enforcing
    /// `base < bump < max` per side.
    pub fn take_result(&self) -> (TriggerCal, TriggerCal) {
        let build = |base: u8, bump: u8, max: u8| {
            let base = base as f64;
            let bump = (bump as f64).max(base + 1.0);
            let max = (max as f64).max(bump + 1.0).min(255.0);
            // Re-check after the 255 cap.
            let bump = bump.min(max - 1.0);
            let base = base.min(bump - 1.0).max(0.0);
            TriggerCal { base, bump, max }
        };
        (
            build(self.rest.0, self.bump.0, self.latest.0),
            build(self.rest.1, self.bump.1, self.latest.1),
        )
    }
}

// ── Per-slot calibrator ─────────────────────────────────────────────

/// Full calibration profile for one slot.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Profile {
    pub stick_left: StickCal,
    pub stick_right: StickCal,
    pub trigger_left: TriggerCal,
    pub trigger_right: TriggerCal,
    /// Mirrored from the global settings: trigger saturates at the bump.
    pub bump_is_full: bool,
}

impl Profile {
    /// Describe any degenerate ranges in this profile. Normalization
    /// recovers by falling back to defaults (sticks) or identity
    /// (triggers), but the condition is worth reporting once.
    pub fn degeneracy(&self) -> Option<String> {
        let mut parts = Vec::new();
        if self.stick_left.is_degenerate() {
            parts.push("left stick range");
        }
        if self.stick_right.is_degenerate() {
            parts.push("right stick range");
        }
        if self.trigger_left.is_degenerate() {
            parts.push("left trigger curve");
        }
        if self.trigger_right.is_degenerate() {
            parts.push("right trigger curve");
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

/// One fully calibrated sample, ready for dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CalibratedSample {
    pub buttons: crate::input::ButtonSet,
    pub left: (f64, f64),
    pub right: (f64, f64),
    pub trigger_left: u8,
    pub trigger_right: u8,
}

struct CalState {
    profile: Profile,
    stick_session: Option<(StickSession, StickSession)>,
    wizard: TriggerWizard,
}

/// Shared per-slot calibration state. The input pipeline feeds samples
/// through it; the UI thread reads copies and drives the sessions.
pub struct Calibrator {
    state: Mutex<CalState>,
}

impl Calibrator {
    pub fn new(profile: Profile) -> Self {
        Self {
            state: Mutex::new(CalState {
                profile,
                stick_session: None,
                wizard: TriggerWizard::default(),
            }),
        }
    }

    pub fn profile(&self) -> Profile {
        self.state.lock().unwrap().profile
    }

    pub fn set_profile(&self, profile: Profile) {
        self.state.lock().unwrap().profile = profile;
    }

    /// Calibrate one raw sample, feeding any active calibration session.
    pub fn process(&self, raw: &RawSample) -> CalibratedSample {
        let mut st = self.state.lock().unwrap();
        if let Some((left, right)) = st.stick_session.as_mut() {
            left.update(raw.left_stick);
            right.update(raw.right_stick);
        }
        if st.wizard.is_active() {
            st.wizard.feed(raw.triggers);
        }

        let p = &st.profile;
        CalibratedSample {
            buttons: raw.buttons,
            left: p.stick_left.apply(raw.left_stick),
            right: p.stick_right.apply(raw.right_stick),
            trigger_left: p.trigger_left.apply(raw.triggers.0, p.bump_is_full),
            trigger_right: p.trigger_right.apply(raw.triggers.1, p.bump_is_full),
        }
    }

    pub fn stick_calibrating(&self) -> bool {
        self.state.lock().unwrap().stick_session.is_some()
    }

    pub fn start_stick_calibration(&self) {
        let mut st = self.state.lock().unwrap();
        st.stick_session = Some((StickSession::new(), StickSession::new()));
    }

    /// Finish stick calibration and install the learned values.
    pub fn finish_stick_calibration(&self) {
        let mut st = self.state.lock().unwrap();
        if let Some((left, right)) = st.stick_session.take() {
            st.profile.stick_left = left.finish();
            st.profile.stick_right = right.finish();
        }
    }

    /// Advance the trigger wizard; installs the result on completion.
    pub fn trigger_next_step(&self) -> Option<WizardStep> {
        let mut st = self.state.lock().unwrap();
        let step = st.wizard.next_step();
        if step.is_none() {
            let (left, right) = st.wizard.take_result();
            st.profile.trigger_left = left;
            st.profile.trigger_right = right;
        }
        step
    }

    /// Captured sector points of the in-progress calibration, for live
    /// octagon rendering. Empty when no session is active.
    pub fn live_points(&self) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let st = self.state.lock().unwrap();
        match &st.stick_session {
            Some((l, r)) => (l.points(), r.points()),
            None => (Vec::new(), Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_stays_in_range() {
        for v in 0..=255u16 {
            let n = normalize(v as f64, 128.0, 100.0);
            assert!((-1.0..=1.0).contains(&n), "normalize({v}) = {n}");
        }
    }

    #[test]
    fn normalize_center_is_zero() {
        assert_eq!(normalize(128.0, 128.0, 100.0), 0.0);
        assert_eq!(normalize(37.0, 37.0, 5.0), 0.0);
    }

    #[test]
    fn normalize_is_monotonic() {
        let mut prev = f64::NEG_INFINITY;
        for v in 0..=255u16 {
            let n = normalize(v as f64, 128.0, 80.0);
            assert!(n >= prev);
            prev = n;
        }
    }

    #[test]
    fn normalize_degenerate_range_falls_back() {
        let n = normalize(228.0, 128.0, 0.0);
        assert_eq!(n, 1.0); // default range 100
    }

    fn unit_octagon() -> Octagon {
        let mut oct = [(0.0, 0.0); 8];
        for (i, v) in oct.iter_mut().enumerate() {
            let a = i as f64 / 8.0 * std::f64::consts::TAU;
            *v = (a.cos(), a.sin());
        }
        oct
    }

    #[test]
    fn octagon_inside_passes_through() {
        let oct = unit_octagon();
        let p = (0.3, -0.2);
        assert_eq!(clamp_to_octagon(p, &oct), p);
    }

    #[test]
    fn octagon_projection_contains_and_preserves_direction() {
        let oct = unit_octagon();
        for deg in (0..360).step_by(7) {
            let a = (deg as f64).to_radians();
            let p = (2.0 * a.cos(), 2.0 * a.sin());
            let q = clamp_to_octagon(p, &oct);
            let mag = (q.0 * q.0 + q.1 * q.1).sqrt();
            // On or inside the boundary (octagon inradius is cos(22.5°)).
            assert!(mag <= 1.0 + 1e-6, "angle {deg}: mag {mag}");
            assert!(mag >= (22.5f64).to_radians().cos() - 1e-6);
            // Direction preserved.
            let cross = p.0 * q.1 - p.1 * q.0;
            assert!(cross.abs() < 1e-6);
            let dot = p.0 * q.0 + p.1 * q.1;
            assert!(dot > 0.0);
        }
    }

    #[test]
    fn octagon_never_expands() {
        let oct = unit_octagon();
        let p = (0.1, 0.05);
        let q = clamp_to_octagon(p, &oct);
        let before = (p.0 * p.0 + p.1 * p.1).sqrt();
        let after = (q.0 * q.0 + q.1 * q.1).sqrt();
        assert!(after <= before + 1e-9);
    }

    #[test]
    fn dead_zone_zeroes_rest_jitter() {
        assert_eq!(apply_dead_zone((0.01, -0.02)), (0.0, 0.0));
        assert_eq!(apply_dead_zone((0.3, 0.0)), (0.3, 0.0));
    }

    #[test]
    fn stick_apply_neutral_and_full() {
        let cal = StickCal::default();
        assert_eq!(cal.apply((128, 128)), (0.0, 0.0));
        let (x, y) = cal.apply((228, 128));
        assert_eq!((x, y), (1.0, 0.0));
    }

    #[test]
    fn trigger_below_base_is_zero() {
        let cal = TriggerCal {
            base: 30.0,
            bump: 200.0,
            max: 250.0,
        };
        assert_eq!(cal.apply(0, false), 0);
        assert_eq!(cal.apply(30, false), 0);
        assert_eq!(cal.apply(30, true), 0);
    }

    #[test]
    fn trigger_bump_mode_saturates_at_bump() {
        let cal = TriggerCal {
            base: 30.0,
            bump: 200.0,
            max: 250.0,
        };
        assert_eq!(cal.apply(200, true), 255);
        assert_eq!(cal.apply(250, true), 255);
    }

    #[test]
    fn trigger_two_segment_curve() {
        let cal = TriggerCal {
            base: 30.0,
            bump: 200.0,
            max: 250.0,
        };
        // At the bump the output is the kink constant.
        assert_eq!(cal.apply(200, false), (BUMP_KINK * 255.0).round() as u8);
        assert_eq!(cal.apply(200, false), 204);
        assert_eq!(cal.apply(250, false), 255);
        assert_eq!(cal.apply(255, false), 255);
    }

    #[test]
    fn trigger_is_monotonic() {
        let cal = TriggerCal {
            base: 25.0,
            bump: 180.0,
            max: 240.0,
        };
        for mode in [false, true] {
            let mut prev = 0u8;
            for raw in 0..=255u8 {
                let out = cal.apply(raw, mode);
                assert!(out >= prev, "raw {raw} mode {mode}: {out} < {prev}");
                prev = out;
            }
        }
    }

    #[test]
    fn trigger_degenerate_is_identity() {
        let cal = TriggerCal {
            base: 100.0,
            bump: 100.0,
            max: 100.0,
        };
        assert_eq!(cal.apply(42, false), 42);
        assert_eq!(cal.apply(200, true), 200);
    }

    #[test]
    fn stick_session_learns_center_and_range() {
        let mut session = StickSession::new();
        // Sweep a circle of radius 90 around (120, 130).
        for deg in 0..360 {
            let a = (deg as f64).to_radians();
            let x = (120.0 + 90.0 * a.cos()).round() as u8;
            let y = (130.0 + 90.0 * a.sin()).round() as u8;
            session.update((x, y));
        }
        let cal = session.finish();
        assert!((cal.center_x - 120.0).abs() < 1.5, "cx {}", cal.center_x);
        assert!((cal.center_y - 130.0).abs() < 1.5, "cy {}", cal.center_y);
        assert!((cal.range_x - 90.0).abs() < 1.5);
        assert!((cal.range_y - 90.0).abs() < 1.5);
        let oct = cal.octagon.expect("octagon learned");
        for (x, y) in oct {
            let mag = (x * x + y * y).sqrt();
            assert!((mag - 1.0).abs() < 0.1, "octagon vertex at {mag}");
        }
    }

    #[test]
    fn stick_session_without_samples_keeps_defaults() {
        let session = StickSession::new();
        assert_eq!(session.finish(), StickCal::default());
    }

    #[test]
    fn trigger_wizard_walks_three_steps() {
        let mut w = TriggerWizard::default();
        assert!(!w.is_active());

        let (step, _, _) = w.next_step().unwrap();
        assert_eq!(step, 1);
        assert!(w.is_active());

        w.feed((28, 31)); // resting
        let (step, _, _) = w.next_step().unwrap();
        assert_eq!(step, 2);

        w.feed((198, 202)); // bump
        let (step, _, _) = w.next_step().unwrap();
        assert_eq!(step, 3);

        w.feed((251, 249)); // max
        assert!(w.next_step().is_none());
        assert!(!w.is_active());

        let (left, right) = w.take_result();
        assert_eq!(left.base, 28.0);
        assert_eq!(left.bump, 198.0);
        assert_eq!(left.max, 251.0);
        assert_eq!(right.base, 31.0);
        assert!(right.base < right.bump && right.bump < right.max);
    }

    #[test]
    fn trigger_wizard_enforces_ordering() {
        let mut w = TriggerWizard::default();
        w.next_step();
        w.feed((200, 200));
        w.next_step(); // rest = 200
        w.next_step(); // bump = 200
        w.next_step(); // max = 200
        let (left, _) = w.take_result();
        assert!(left.base < left.bump && left.bump < left.max);
        assert!(left.max <= 255.0);
    }

    #[test]
    fn calibrator_feeds_sessions() {
        let cal = Calibrator::new(Profile::default());
        cal.start_stick_calibration();
        assert!(cal.stick_calibrating());

        let mut raw = RawSample::default();
        raw.left_stick = (228, 128);
        raw.right_stick = (28, 128);
        cal.process(&raw);
        raw.left_stick = (28, 228);
        cal.process(&raw);

        let (left_pts, _) = cal.live_points();
        assert!(!left_pts.is_empty());

        cal.finish_stick_calibration();
        assert!(!cal.stick_calibrating());
        assert!(cal.profile().stick_left.octagon.is_some());
    }
}
