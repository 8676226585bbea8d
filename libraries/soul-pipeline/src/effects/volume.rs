//! Volume with an independent modifier
//!
//! The user-facing level (0-100%) and a modifier (fades, ducking) combine
//! multiplicatively into one linear gain:
//!
//! ```text
//! gain = level × 0.01 × modifier
//! ```
//!
//! so a fade can run while the user moves the slider, and neither
//! overwrites the other.

/// Volume level plus modifier
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Volume level (0-100)
    level: u8,

    /// Multiplier from fades or ducking (>= 0)
    modifier: f64,
}

impl Volume {
    /// Create a volume at `level` (clamped to 100) with unity modifier
    pub fn new(level: u8) -> Self {
        Self {
            level: level.min(100),
            modifier: 1.0,
        }
    }

    /// Set volume level (0-100)
    pub fn set_level(&mut self, level: u8) {
        self.level = level.min(100);
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Set the modifier; negative and non-finite values read as 0
    pub fn set_modifier(&mut self, modifier: f64) {
        self.modifier = if modifier.is_finite() {
            modifier.max(0.0)
        } else {
            0.0
        };
    }

    pub fn modifier(&self) -> f64 {
        self.modifier
    }

    /// Combined linear gain
    pub fn gain(&self) -> f64 {
        f64::from(self.level) * 0.01 * self.modifier
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::new(100)
    }
}
