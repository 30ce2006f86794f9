//! Measurement-range selection with anti-chatter hysteresis.
//!
//! Each channel carries two arming flags. Escalating into range 3 disarms
//! further escalation, and dropping into range 1 disarms further
//! de-escalation. Any transition in the opposite direction re-arms the
//! flag, so a saturated channel settles instead of oscillating.

use log::{debug, warn};

use crate::codec::ChannelCount;
pub use crate::codec::Range;

pub const DEFAULT_TOP_VOLTAGE: f64 = 4.6;
pub const DEFAULT_BOTTOM_VOLTAGE: f64 = 0.6;

// ============================================================================
// Channel State
// ============================================================================

/// Per-channel range and hysteresis state.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelState {
    pub range: Range,
    pub armed_up: bool,
    pub armed_down: bool,
    pub last_voltage: Option<f64>,
    pub last_resistance: Option<f64>,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            range: Range::R1,
            armed_up: true,
            armed_down: true,
            last_voltage: None,
            last_resistance: None,
        }
    }
}

/// State of every channel of one device session.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSet {
    channels: Vec<ChannelState>,
}

impl ChannelSet {
    pub fn new(count: ChannelCount) -> Self {
        Self {
            channels: vec![ChannelState::default(); count.get()],
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, channel: usize) -> Option<&ChannelState> {
        self.channels.get(channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelState> {
        self.channels.iter()
    }

    pub fn ranges(&self) -> Vec<Range> {
        self.channels.iter().map(|c| c.range).collect()
    }

    /// Remember the latest readings.
    pub fn record(&mut self, voltages: &[f64], resistances: &[f64]) {
        for (i, state) in self.channels.iter_mut().enumerate() {
            state.last_voltage = voltages.get(i).copied();
            state.last_resistance = resistances.get(i).copied();
        }
    }

    /// Force ranges without touching the arming flags.
    fn force_ranges(&mut self, ranges: &[Range]) {
        for (state, &range) in self.channels.iter_mut().zip(ranges) {
            state.range = range;
        }
    }
}

// ============================================================================
// Thresholds
// ============================================================================

/// Saturation thresholds that trigger a range change.
#[derive(Debug, Clone, PartialEq)]
pub enum Thresholds {
    /// Same limits for every range and channel.
    Fixed { top: f64, bottom: f64 },
    /// Limits per range (outer index `0..3`) and per channel.
    Calibrated {
        top: [Vec<f64>; 3],
        bottom: [Vec<f64>; 3],
    },
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds::Fixed {
            top: DEFAULT_TOP_VOLTAGE,
            bottom: DEFAULT_BOTTOM_VOLTAGE,
        }
    }
}

impl Thresholds {
    /// Returns `(top, bottom)` for a channel in the given range.
    ///
    /// Channels missing from a calibrated table fall back to the fixed limits.
    pub fn limits(&self, range: Range, channel: usize) -> (f64, f64) {
        match self {
            Thresholds::Fixed { top, bottom } => (*top, *bottom),
            Thresholds::Calibrated { top, bottom } => (
                top[range.index()]
                    .get(channel)
                    .copied()
                    .unwrap_or(DEFAULT_TOP_VOLTAGE),
                bottom[range.index()]
                    .get(channel)
                    .copied()
                    .unwrap_or(DEFAULT_BOTTOM_VOLTAGE),
            ),
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoRangeController {
    thresholds: Thresholds,
}

impl AutoRangeController {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Apply one reading to one channel. Returns true if the range changed.
    pub fn step(&self, channel: usize, state: &mut ChannelState, u: f64) -> bool {
        let before = state.range;
        let (top, bottom) = self.thresholds.limits(before, channel);

        if u > top && state.armed_up {
            state.range = before.up();
            if state.range == Range::R3 {
                state.armed_up = false;
            }
            state.armed_down = true;
        } else if u < bottom && state.armed_down {
            state.range = before.down();
            state.armed_up = true;
            if state.range == Range::R1 {
                state.armed_down = false;
            }
        }
        state.range != before
    }

    /// Apply one tick of readings. Returns true if any channel changed range.
    pub fn update(&self, set: &mut ChannelSet, voltages: &[f64]) -> bool {
        let mut changed = false;
        for (channel, (state, &u)) in set.channels.iter_mut().zip(voltages).enumerate() {
            if self.step(channel, state, u) {
                debug!("Channel {channel}: range -> {} (u = {u:.4})", state.range.as_u8());
                changed = true;
            }
        }
        changed
    }
}

// ============================================================================
// Range Mode
// ============================================================================

/// Externally forced ranges, queried once per tick.
pub type RangeSource = Box<dyn FnMut() -> Vec<Range> + Send>;

/// How ranges are chosen for a session.
pub enum RangeMode {
    /// Single-range hardware: never send range frames.
    Disabled,
    Auto(AutoRangeController),
    /// Ranges supplied externally; sent only when they differ from the current ones.
    Solid(RangeSource),
}

impl std::fmt::Debug for RangeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeMode::Disabled => f.write_str("Disabled"),
            RangeMode::Auto(c) => f.debug_tuple("Auto").field(c).finish(),
            RangeMode::Solid(_) => f.write_str("Solid(..)"),
        }
    }
}

impl RangeMode {
    /// Solid mode with a constant range vector.
    pub fn fixed(ranges: Vec<Range>) -> Self {
        RangeMode::Solid(Box::new(move || ranges.clone()))
    }

    /// Update `set` from this tick's voltages; returns the vector to transmit, if any.
    pub fn apply(&mut self, set: &mut ChannelSet, voltages: &[f64]) -> Option<Vec<Range>> {
        match self {
            RangeMode::Disabled => None,
            RangeMode::Auto(controller) => controller.update(set, voltages).then(|| set.ranges()),
            RangeMode::Solid(source) => {
                let wanted = source();
                if wanted.len() != set.len() {
                    warn!(
                        "Ignoring forced ranges for {} channels on a {}-channel device",
                        wanted.len(),
                        set.len()
                    );
                    return None;
                }
                if wanted == set.ranges() {
                    return None;
                }
                set.force_ranges(&wanted);
                Some(wanted)
            }
        }
    }
}
