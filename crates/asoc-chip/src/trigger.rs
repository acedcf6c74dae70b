//! Trigger and lookback modes.
//!
//! Names follow the capture tools: `imm`, `ext`, `self` for the trigger and
//! `forced`, `trig` for lookback.

/// How acquisition is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TriggerMode {
    /// Triggers continuously without any signal.
    Immediate,
    /// Trigger input on the board, or software triggers.
    #[default]
    External,
    /// Triggers on analog signals crossing the per-channel thresholds.
    SelfTrigger,
}

impl TriggerMode {
    /// Parse the short name (`imm`, `ext`, `self`).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "imm" | "immediate" => Some(Self::Immediate),
            "ext" | "external" => Some(Self::External),
            "self" => Some(Self::SelfTrigger),
            _ => None,
        }
    }

    /// Short name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Immediate => "imm",
            Self::External => "ext",
            Self::SelfTrigger => "self",
        }
    }

    /// Value written to the trigger mode register.
    #[must_use]
    pub const fn register_value(&self) -> u32 {
        match self {
            Self::Immediate => 0,
            Self::External => 1,
            Self::SelfTrigger => 2,
        }
    }

    /// Decode a trigger mode register value.
    #[must_use]
    pub const fn from_register(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Immediate),
            1 => Some(Self::External),
            2 => Some(Self::SelfTrigger),
            _ => None,
        }
    }

    /// Whether this mode needs per-channel thresholds.
    #[must_use]
    pub const fn needs_thresholds(&self) -> bool {
        matches!(self, Self::SelfTrigger)
    }
}

impl std::fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the read window is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LookbackMode {
    /// Read the windows at the write pointer when forced.
    Forced,
    /// Read relative to the trigger position.
    #[default]
    Trigger,
}

impl LookbackMode {
    /// Parse the short name (`forced`, `trig`).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "forced" => Some(Self::Forced),
            "trig" | "trigger" => Some(Self::Trigger),
            _ => None,
        }
    }

    /// Short name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Forced => "forced",
            Self::Trigger => "trig",
        }
    }

    /// Value written to the lookback mode register.
    #[must_use]
    pub const fn register_value(&self) -> u32 {
        match self {
            Self::Forced => 0,
            Self::Trigger => 1,
        }
    }
}

impl std::fmt::Display for LookbackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_names_match_capture_tools() {
        assert_eq!(TriggerMode::from_name("imm"), Some(TriggerMode::Immediate));
        assert_eq!(TriggerMode::from_name("ext"), Some(TriggerMode::External));
        assert_eq!(TriggerMode::from_name("self"), Some(TriggerMode::SelfTrigger));
        assert_eq!(TriggerMode::from_name("auto"), None);
    }

    #[test]
    fn trigger_register_encoding_is_reversible() {
        for mode in [TriggerMode::Immediate, TriggerMode::External, TriggerMode::SelfTrigger] {
            assert_eq!(TriggerMode::from_register(mode.register_value()), Some(mode));
        }
        assert_eq!(TriggerMode::from_register(7), None);
    }

    #[test]
    fn only_self_trigger_needs_thresholds() {
        assert!(TriggerMode::SelfTrigger.needs_thresholds());
        assert!(!TriggerMode::External.needs_thresholds());
    }

    #[test]
    fn lookback_defaults_to_trigger() {
        assert_eq!(LookbackMode::default(), LookbackMode::Trigger);
        assert_eq!(LookbackMode::from_name("forced"), Some(LookbackMode::Forced));
    }
}
