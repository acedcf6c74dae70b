//! Read window set-up.
//!
//! The digitizer writes continuously into a ring of storage windows. On a
//! trigger it keeps writing `write_after_trig` more windows, then reads
//! `windows` windows starting `lookback` windows behind the write pointer.

/// Read window parameters, in storage windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadWindow {
    /// Windows read out per event.
    pub windows: u16,
    /// Windows behind the write pointer where readout starts.
    pub lookback: u16,
    /// Windows written after the trigger before readout.
    pub write_after_trig: u16,
}

impl Default for ReadWindow {
    fn default() -> Self {
        Self {
            windows: 8,
            lookback: 8,
            write_after_trig: 4,
        }
    }
}

/// Which read window field is out of range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadWindowError {
    /// `windows` is zero or beyond the storage depth.
    Windows {
        /// Requested value
        value: u16,
        /// Storage depth
        max: u16,
    },
    /// `lookback` is beyond the storage depth.
    Lookback {
        /// Requested value
        value: u16,
        /// Storage depth
        max: u16,
    },
    /// `write_after_trig` is beyond the storage depth.
    WriteAfterTrig {
        /// Requested value
        value: u16,
        /// Storage depth
        max: u16,
    },
}

impl std::fmt::Display for ReadWindowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Windows { value, max } => {
                write!(f, "read window: windows={value} must be in 1..={max}")
            }
            Self::Lookback { value, max } => {
                write!(f, "read window: lookback={value} exceeds {max}")
            }
            Self::WriteAfterTrig { value, max } => {
                write!(f, "read window: write_after_trig={value} exceeds {max}")
            }
        }
    }
}

impl std::error::Error for ReadWindowError {}

impl ReadWindow {
    /// Build from the `num windows, lookback, write after trigger` triple.
    #[must_use]
    pub const fn new(windows: u16, lookback: u16, write_after_trig: u16) -> Self {
        Self {
            windows,
            lookback,
            write_after_trig,
        }
    }

    /// Check every field against the storage depth.
    ///
    /// # Errors
    ///
    /// Returns the first field that is out of range.
    pub const fn validate(&self, max_windows: u16) -> Result<(), ReadWindowError> {
        if self.windows == 0 || self.windows > max_windows {
            return Err(ReadWindowError::Windows {
                value: self.windows,
                max: max_windows,
            });
        }
        if self.lookback > max_windows {
            return Err(ReadWindowError::Lookback {
                value: self.lookback,
                max: max_windows,
            });
        }
        if self.write_after_trig > max_windows {
            return Err(ReadWindowError::WriteAfterTrig {
                value: self.write_after_trig,
                max: max_windows,
            });
        }
        Ok(())
    }

    /// Samples per channel in one event.
    #[must_use]
    pub const fn samples_per_channel(&self, samples_per_window: usize) -> usize {
        self.windows as usize * samples_per_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_window_is_valid() {
        assert!(ReadWindow::default().validate(512).is_ok());
    }

    #[test]
    fn zero_windows_rejected() {
        let err = ReadWindow::new(0, 0, 0).validate(512).unwrap_err();
        assert_eq!(err, ReadWindowError::Windows { value: 0, max: 512 });
    }

    #[test]
    fn first_offending_field_reported() {
        let err = ReadWindow::new(4, 600, 700).validate(512).unwrap_err();
        assert!(matches!(err, ReadWindowError::Lookback { value: 600, .. }));
        let err = ReadWindow::new(4, 4, 700).validate(512).unwrap_err();
        assert!(err.to_string().contains("write_after_trig=700"));
    }

    #[test]
    fn samples_scale_with_windows() {
        assert_eq!(ReadWindow::new(3, 0, 0).samples_per_channel(32), 96);
    }
}
