//! Register map and register presets
//!
//! [`RegisterMap`] resolves register names to bridge addresses. It starts
//! from the default layout in [`asoc_chip::regs`] and can be overridden by a
//! TOML file for boards whose bridge decodes a different layout:
//!
//! ```toml
//! [registers]
//! status = 0x22
//! dac_base = 0x40
//! ```
//!
//! [`RegisterPreset`] is a named list of register values applied after reset,
//! used to bring a board to a known configuration:
//!
//! ```toml
//! [values]
//! read_windows = 16
//! dac_base = 0x0800
//! ```

use crate::config::AsocConfig;
use crate::error::{AsocError, Result};
use asoc_chip::regs::{self, names};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Name → address table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    entries: BTreeMap<String, u16>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterMapFile {
    registers: BTreeMap<String, u16>,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            entries: regs::DEFAULT_MAP
                .iter()
                .map(|(name, addr)| ((*name).to_string(), *addr))
                .collect(),
        }
    }
}

impl RegisterMap {
    /// Default layout with overrides from a TOML file.
    ///
    /// Names not already in the default layout are accepted as additional
    /// registers so presets can refer to them.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| AsocError::config(format!("{}: {e}", path.display())))
    }

    /// Default layout with overrides from TOML text.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the text is not a valid map.
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: RegisterMapFile =
            toml::from_str(text).map_err(|e| AsocError::config(e.to_string()))?;
        let mut map = Self::default();
        for (name, addr) in file.registers {
            debug!("Register map override: {name} = {addr:#06x}");
            map.entries.insert(name, addr);
        }
        for base in [names::TRIGGER_THRESHOLD_BASE, names::DAC_BASE] {
            let addr = map.resolve(base)?;
            if addr.checked_add(regs::CHANNEL_BANK_LEN - 1).is_none() {
                return Err(AsocError::config(format!(
                    "{base} = {addr:#06x}: bank exceeds address space"
                )));
            }
        }
        Ok(map)
    }

    /// Register map for a configuration: the override file when one is
    /// named, the default layout otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the override file is unusable.
    pub fn for_config(config: &AsocConfig) -> Result<Self> {
        match &config.files.register_map {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Address of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`AsocError::UnknownRegister`] if the name is not mapped.
    pub fn resolve(&self, name: &str) -> Result<u16> {
        self.entries
            .get(name)
            .copied()
            .ok_or_else(|| AsocError::unknown_register(name))
    }

    /// Address of the trigger threshold register for `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bank base is unmapped or the channel is out of
    /// the bank.
    pub fn trigger_threshold(&self, channel: usize) -> Result<u16> {
        self.bank(names::TRIGGER_THRESHOLD_BASE, channel)
    }

    /// Address of the bias DAC register for `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bank base is unmapped or the channel is out of
    /// the bank.
    pub fn dac(&self, channel: usize) -> Result<u16> {
        self.bank(names::DAC_BASE, channel)
    }

    fn bank(&self, base: &str, channel: usize) -> Result<u16> {
        let base_addr = self.resolve(base)?;
        let offset = u16::try_from(channel)
            .ok()
            .filter(|c| *c < regs::CHANNEL_BANK_LEN)
            .ok_or_else(|| AsocError::config(format!("channel {channel} outside {base} bank")))?;
        base_addr
            .checked_add(offset)
            .ok_or_else(|| AsocError::config(format!("{base} bank exceeds address space")))
    }

    /// Iterate over `(name, address)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u16)> {
        self.entries.iter().map(|(n, a)| (n.as_str(), *a))
    }
}

/// Register values applied as a block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterPreset {
    values: BTreeMap<String, u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterPresetFile {
    values: BTreeMap<String, u32>,
}

impl RegisterPreset {
    /// Load a preset file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| AsocError::config(format!("{}: {e}", path.display())))
    }

    /// Parse preset TOML text.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the text is not a valid preset.
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: RegisterPresetFile =
            toml::from_str(text).map_err(|e| AsocError::config(e.to_string()))?;
        Ok(Self { values: file.values })
    }

    /// Resolve every name against `map`, in name order.
    ///
    /// Writes to `control` are refused: a preset must not start or reset
    /// the board behind the controller's back.
    ///
    /// # Errors
    ///
    /// Returns the first unknown register, or a config error for `control`.
    pub fn resolve(&self, map: &RegisterMap) -> Result<Vec<(u16, u32)>> {
        self.values
            .iter()
            .map(|(name, value)| {
                if name == names::CONTROL {
                    return Err(AsocError::config("register preset may not write `control`"));
                }
                Ok((map.resolve(name)?, *value))
            })
            .collect()
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the preset holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_resolves_all_names() {
        let map = RegisterMap::default();
        for (name, addr) in regs::DEFAULT_MAP {
            assert_eq!(map.resolve(name).unwrap(), *addr);
        }
        assert!(matches!(
            map.resolve("nope"),
            Err(AsocError::UnknownRegister { .. })
        ));
    }

    #[test]
    fn overrides_replace_and_extend() {
        let map = RegisterMap::from_toml(
            "[registers]\nstatus = 0x42\nscratch = 0x7F\n",
        )
        .unwrap();
        assert_eq!(map.resolve(names::STATUS).unwrap(), 0x42);
        assert_eq!(map.resolve("scratch").unwrap(), 0x7F);
        assert_eq!(map.resolve(names::CONTROL).unwrap(), regs::CONTROL);
    }

    #[test]
    fn channel_banks_follow_base() {
        let map = RegisterMap::from_toml("[registers]\ndac_base = 0x100\n").unwrap();
        assert_eq!(map.dac(3).unwrap(), 0x103);
        assert_eq!(map.trigger_threshold(1).unwrap(), regs::TRIGGER_THRESHOLD_BASE + 1);
        assert!(map.dac(16).is_err());
    }

    #[test]
    fn bank_past_end_of_address_space_rejected() {
        let err = RegisterMap::from_toml("[registers]\ndac_base = 0xFFFF\n").unwrap_err();
        assert!(err.to_string().contains("exceeds address space"), "{err}");
        let err =
            RegisterMap::from_toml("[registers]\ntrigger_threshold_base = 0xFFF1\n").unwrap_err();
        assert!(matches!(err, AsocError::Config { .. }));

        let map = RegisterMap::from_toml("[registers]\ndac_base = 0xFFF0\n").unwrap();
        assert_eq!(map.dac(15).unwrap(), 0xFFFF);
    }

    #[test]
    fn malformed_map_is_config_error() {
        assert!(matches!(
            RegisterMap::from_toml("[registers]\nstatus = \"x\"\n"),
            Err(AsocError::Config { .. })
        ));
    }

    #[test]
    fn preset_resolves_in_name_order() {
        let preset =
            RegisterPreset::from_toml("[values]\nread_windows = 16\nchannel_enable = 3\n").unwrap();
        let writes = preset.resolve(&RegisterMap::default()).unwrap();
        assert_eq!(
            writes,
            vec![(regs::CHANNEL_ENABLE, 3), (regs::READ_WINDOWS, 16)]
        );
    }

    #[test]
    fn preset_refuses_control_and_unknown_names() {
        let map = RegisterMap::default();
        let preset = RegisterPreset::from_toml("[values]\ncontrol = 2\n").unwrap();
        assert!(matches!(preset.resolve(&map), Err(AsocError::Config { .. })));
        let preset = RegisterPreset::from_toml("[values]\nbogus = 2\n").unwrap();
        assert!(matches!(preset.resolve(&map), Err(AsocError::UnknownRegister { .. })));
    }
}
