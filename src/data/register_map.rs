//! Model register maps
//!
//! Which EC registers a model uses is configuration data, not code. A map
//! only names addresses; it never grants write access. Every write still has
//! to pass the static allowlist in `backend::address`.
//!
//! The built-in table carries the community-documented OMEN layout. Models
//! that match no entry and have no override in settings are unsupported and
//! the engine runs read-only.

use serde::{Deserialize, Serialize};

/// EC register layout for one hardware family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMap {
    pub name: String,
    /// Duty percent per channel (write)
    pub fan_percent: Vec<u16>,
    /// Target speed in 100 RPM units per channel (write)
    pub fan_rpm_units: Vec<u16>,
    /// Highest value the RPM-unit registers accept
    pub max_rpm_units: u8,
    /// Manual fan control toggle
    pub manual_toggle: Option<u16>,
    pub manual_on: u8,
    pub manual_off: u8,
    /// Countdown after which firmware reclaims fan control
    pub watchdog: Option<u16>,
    pub boost: Option<u16>,
    pub boost_on: u8,
    pub boost_off: u8,
    pub performance_mode: Option<u16>,
    /// Fan state register (normal / off)
    pub fan_state: Option<u16>,
    pub fan_state_normal: u8,
    /// Current speed in 100 RPM units per channel (read)
    pub rpm_unit_readback: Vec<u16>,
    /// Current speed as 16-bit little-endian pairs per channel (read)
    pub rpm_word_readback: Vec<(u16, u16)>,
    /// Current duty percent per channel (read)
    pub percent_readback: Vec<u16>,
    pub cpu_temperature: Option<u16>,
    pub gpu_temperature: Option<u16>,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::omen_community()
    }
}

impl RegisterMap {
    /// Layout shared by most OMEN and Victus boards
    pub fn omen_community() -> Self {
        Self {
            name: "omen-community".to_string(),
            fan_percent: vec![0x2C, 0x2D],
            fan_rpm_units: vec![0x34, 0x35],
            max_rpm_units: crate::constants::fan::DEFAULT_MAX_LEVEL,
            manual_toggle: Some(0x62),
            manual_on: 0x06,
            manual_off: 0x00,
            watchdog: Some(0x63),
            boost: Some(0xEC),
            boost_on: 0x0C,
            boost_off: 0x00,
            performance_mode: Some(0x95),
            fan_state: Some(0xF4),
            fan_state_normal: 0x00,
            rpm_unit_readback: vec![],
            rpm_word_readback: vec![(0xB0, 0xB1), (0xB2, 0xB3)],
            percent_readback: vec![0x2E, 0x2F],
            cpu_temperature: Some(0x57),
            gpu_temperature: Some(0xB7),
        }
    }

    /// Number of fan channels this map drives
    pub fn channel_count(&self) -> usize {
        self.fan_percent
            .len()
            .max(self.fan_rpm_units.len())
            .max(self.rpm_word_readback.len())
    }
}

/// Model pattern → register map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMapEntry {
    /// Case-insensitive substrings of the model key
    pub patterns: Vec<String>,
    pub map: RegisterMap,
}

/// Lookup table from model key to register map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMapTable {
    entries: Vec<RegisterMapEntry>,
}

impl Default for RegisterMapTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RegisterMapTable {
    pub fn builtin() -> Self {
        Self {
            entries: vec![RegisterMapEntry {
                patterns: vec!["omen".to_string(), "victus".to_string()],
                map: RegisterMap::omen_community(),
            }],
        }
    }

    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Entries added later take precedence
    pub fn insert(&mut self, entry: RegisterMapEntry) {
        self.entries.insert(0, entry);
    }

    pub fn lookup(&self, model_key: &str) -> Option<&RegisterMap> {
        let key = model_key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|e| e.patterns.iter().any(|p| key.contains(&p.to_ascii_lowercase())))
            .map(|e| &e.map)
    }

    /// Resolve the map for a model, an explicit override winning
    pub fn resolve(&self, model_key: &str, override_map: Option<&RegisterMap>) -> Option<RegisterMap> {
        override_map
            .cloned()
            .or_else(|| self.lookup(model_key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_model() {
        let table = RegisterMapTable::builtin();
        let map = table.lookup("OMEN by HP Laptop 16-b1xxx").unwrap();
        assert_eq!(map.fan_percent, vec![0x2C, 0x2D]);
        assert_eq!(map.channel_count(), 2);
    }

    #[test]
    fn test_unknown_model_has_no_map() {
        let table = RegisterMapTable::builtin();
        assert!(table.lookup("ThinkPad X1 Carbon").is_none());
        assert!(table.resolve("ThinkPad X1 Carbon", None).is_none());
    }

    #[test]
    fn test_override_wins() {
        let table = RegisterMapTable::builtin();
        let mut custom = RegisterMap::omen_community();
        custom.name = "custom".into();
        let resolved = table.resolve("OMEN 17", Some(&custom)).unwrap();
        assert_eq!(resolved.name, "custom");
    }

    #[test]
    fn test_inserted_entry_takes_precedence() {
        let mut table = RegisterMapTable::builtin();
        let mut map = RegisterMap::omen_community();
        map.name = "transcend".into();
        map.boost = None;
        table.insert(RegisterMapEntry {
            patterns: vec!["transcend".into()],
            map,
        });
        assert_eq!(table.lookup("OMEN Transcend 14").unwrap().name, "transcend");
        assert_eq!(table.lookup("OMEN 16").unwrap().name, "omen-community");
    }
}
