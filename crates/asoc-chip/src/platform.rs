//! Platform constants and board models.
//!
//! The first target is the A3PE prototype kit carrying an ASoCv3 board.
//! The system clock below is the FPGA fabric clock; event timestamps are
//! counted in ticks of it.

/// System clock frequency in Hz.
pub const CLK_SYS_HZ: u32 = 100_000_000;

/// Largest valid sample value (12-bit digitizer).
pub const SAMPLE_MAX: u16 = (1 << 12) - 1;

/// Board model selected in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardModel {
    /// ASoCv3 evaluation board, 4 channels.
    Asocv3,
    /// Software board used for dry runs and CI. Same geometry as ASoCv3.
    Simulated,
}

impl BoardModel {
    /// All models, in the order they are listed to users.
    pub const ALL: &'static [Self] = &[Self::Asocv3, Self::Simulated];

    /// Parse a model name as written in configuration files.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "asocv3" => Some(Self::Asocv3),
            "simulated" | "sim" => Some(Self::Simulated),
            _ => None,
        }
    }

    /// Canonical name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Asocv3 => "asocv3",
            Self::Simulated => "simulated",
        }
    }

    /// Number of analog input channels.
    #[must_use]
    pub const fn channel_count(&self) -> usize {
        match self {
            Self::Asocv3 | Self::Simulated => 4,
        }
    }

    /// Samples stored per storage window.
    #[must_use]
    pub const fn samples_per_window(&self) -> usize {
        match self {
            Self::Asocv3 | Self::Simulated => 32,
        }
    }

    /// Number of storage windows per channel.
    #[must_use]
    pub const fn max_windows(&self) -> u16 {
        match self {
            Self::Asocv3 | Self::Simulated => 512,
        }
    }

    /// Digitizer resolution.
    #[must_use]
    pub const fn sample_bits(&self) -> u32 {
        12
    }
}

impl std::fmt::Display for BoardModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Convert a tick count of [`CLK_SYS_HZ`] into seconds.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ticks_to_seconds(ticks: u64) -> f64 {
    ticks as f64 / f64::from(CLK_SYS_HZ)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_round_trip() {
        for model in BoardModel::ALL {
            assert_eq!(BoardModel::from_name(model.name()), Some(*model));
        }
        assert_eq!(BoardModel::from_name(" ASOCV3 "), Some(BoardModel::Asocv3));
        assert_eq!(BoardModel::from_name("aardvarc"), None);
    }

    #[test]
    fn sample_max_matches_resolution() {
        assert_eq!(u32::from(SAMPLE_MAX), (1 << BoardModel::Asocv3.sample_bits()) - 1);
    }

    #[test]
    fn one_second_of_ticks() {
        assert!((ticks_to_seconds(u64::from(CLK_SYS_HZ)) - 1.0).abs() < f64::EPSILON);
    }
}
