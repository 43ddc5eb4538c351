//! Persistent calibration settings.
//!
//! On-disk format is JSON at `gc_controller_settings.json` in the working
//! directory. Three historical shapes exist:
//!
//!   v1: one flat calibration object (pre-multi-controller), with the old
//!       `left_bump`-style trigger key names.
//!   v2: `{ global, slots: { "0".."3" } }` with a per-slot
//!       `preferred_ble_address` and a flat `known_ble_addresses` list.
//!   v3: like v2, but per-device BLE calibration lives only in
//!       `global.known_ble_devices`, keyed by uppercase MAC.
//!
//! Loads migrate everything to v3 in memory; saves always write v3,
//! atomically (temp file + rename). Unknown keys are preserved so newer
//! builds can round-trip through older ones.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::calibration::{Octagon, Profile, StickCal, TriggerCal};
use crate::error::{GcError, Result};

pub const SETTINGS_FILE: &str = "gc_controller_settings.json";
const CURRENT_VERSION: u64 = 3;

/// v1 → v2 trigger key renames.
const TRIGGER_KEY_RENAMES: [(&str, &str); 7] = [
    ("left_base", "trigger_left_base"),
    ("left_bump", "trigger_left_bump"),
    ("left_max", "trigger_left_max"),
    ("right_base", "trigger_right_base"),
    ("right_bump", "trigger_right_bump"),
    ("right_max", "trigger_right_max"),
    ("bump_100_percent", "trigger_bump_100_percent"),
];

/// Keys that live in `global`, not under a slot.
const GLOBAL_KEYS: [&str; 4] = [
    "auto_connect",
    "emulation_mode",
    "trigger_bump_100_percent",
    "known_ble_devices",
];

/// Which virtual-pad backend a slot binds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmulationMode {
    #[default]
    Xbox360,
    DolphinPipe,
    Dsu,
}

impl std::fmt::Display for EmulationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmulationMode::Xbox360 => write!(f, "Xbox 360"),
            EmulationMode::DolphinPipe => write!(f, "Dolphin pipe"),
            EmulationMode::Dsu => write!(f, "DSU"),
        }
    }
}

/// Per-slot (or per-BLE-device) calibration, as persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotCalibration {
    pub stick_left_center_x: f64,
    pub stick_left_center_y: f64,
    pub stick_left_range_x: f64,
    pub stick_left_range_y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stick_left_octagon: Option<Vec<[f64; 2]>>,
    pub stick_right_center_x: f64,
    pub stick_right_center_y: f64,
    pub stick_right_range_x: f64,
    pub stick_right_range_y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stick_right_octagon: Option<Vec<[f64; 2]>>,
    pub trigger_left_base: f64,
    pub trigger_left_bump: f64,
    pub trigger_left_max: f64,
    pub trigger_right_base: f64,
    pub trigger_right_bump: f64,
    pub trigger_right_max: f64,
    /// Forward-compatibility: keys we don't know yet survive a round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for SlotCalibration {
    fn default() -> Self {
        let stick = StickCal::default();
        let trigger = TriggerCal::default();
        Self {
            stick_left_center_x: stick.center_x,
            stick_left_center_y: stick.center_y,
            stick_left_range_x: stick.range_x,
            stick_left_range_y: stick.range_y,
            stick_left_octagon: None,
            stick_right_center_x: stick.center_x,
            stick_right_center_y: stick.center_y,
            stick_right_range_x: stick.range_x,
            stick_right_range_y: stick.range_y,
            stick_right_octagon: None,
            trigger_left_base: trigger.base,
            trigger_left_bump: trigger.bump,
            trigger_left_max: trigger.max,
            trigger_right_base: trigger.base,
            trigger_right_bump: trigger.bump,
            trigger_right_max: trigger.max,
            extra: Map::new(),
        }
    }
}

fn octagon_from_json(v: &Option<Vec<[f64; 2]>>) -> Option<Octagon> {
    let v = v.as_ref()?;
    if v.len() != 8 {
        return None;
    }
    let mut oct = [(0.0, 0.0); 8];
    for (i, p) in v.iter().enumerate() {
        oct[i] = (p[0], p[1]);
    }
    Some(oct)
}

fn octagon_to_json(oct: &Option<Octagon>) -> Option<Vec<[f64; 2]>> {
    oct.map(|o| o.iter().map(|&(x, y)| [x, y]).collect())
}

impl SlotCalibration {
    /// Build the runtime profile; `bump_is_full` is mirrored in from the
    /// global settings so every consumer of a slot profile sees it.
    pub fn to_profile(&self, bump_is_full: bool) -> Profile {
        Profile {
            stick_left: StickCal {
                center_x: self.stick_left_center_x,
                center_y: self.stick_left_center_y,
                range_x: self.stick_left_range_x,
                range_y: self.stick_left_range_y,
                octagon: octagon_from_json(&self.stick_left_octagon),
            },
            stick_right: StickCal {
                center_x: self.stick_right_center_x,
                center_y: self.stick_right_center_y,
                range_x: self.stick_right_range_x,
                range_y: self.stick_right_range_y,
                octagon: octagon_from_json(&self.stick_right_octagon),
            },
            trigger_left: TriggerCal {
                base: self.trigger_left_base,
                bump: self.trigger_left_bump,
                max: self.trigger_left_max,
            },
            trigger_right: TriggerCal {
                base: self.trigger_right_base,
                bump: self.trigger_right_bump,
                max: self.trigger_right_max,
            },
            bump_is_full,
        }
    }

    /// Fold a runtime profile back into the persisted shape.
    pub fn update_from_profile(&mut self, p: &Profile) {
        self.stick_left_center_x = p.stick_left.center_x;
        self.stick_left_center_y = p.stick_left.center_y;
        self.stick_left_range_x = p.stick_left.range_x;
        self.stick_left_range_y = p.stick_left.range_y;
        self.stick_left_octagon = octagon_to_json(&p.stick_left.octagon);
        self.stick_right_center_x = p.stick_right.center_x;
        self.stick_right_center_y = p.stick_right.center_y;
        self.stick_right_range_x = p.stick_right.range_x;
        self.stick_right_range_y = p.stick_right.range_y;
        self.stick_right_octagon = octagon_to_json(&p.stick_right.octagon);
        self.trigger_left_base = p.trigger_left.base;
        self.trigger_left_bump = p.trigger_left.bump;
        self.trigger_left_max = p.trigger_left.max;
        self.trigger_right_base = p.trigger_right.base;
        self.trigger_right_bump = p.trigger_right.bump;
        self.trigger_right_max = p.trigger_right.max;
    }
}

/// Settings that apply to the whole application rather than one slot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub auto_connect: bool,
    pub emulation_mode: EmulationMode,
    pub trigger_bump_100_percent: bool,
    /// Per-device calibration, keyed by uppercase colon-separated MAC, so a
    /// wireless controller calibrates identically in any slot.
    pub known_ble_devices: BTreeMap<String, SlotCalibration>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// In-memory working settings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Settings {
    pub global: GlobalSettings,
    pub slots: [SlotCalibration; 4],
}

impl Settings {
    pub fn profile(&self, slot: usize) -> Profile {
        self.slots[slot].to_profile(self.global.trigger_bump_100_percent)
    }

    pub fn apply_profile(&mut self, slot: usize, profile: &Profile) {
        self.slots[slot].update_from_profile(profile);
        self.global.trigger_bump_100_percent = profile.bump_is_full;
    }

    /// Calibration for a known wireless device, if any.
    pub fn device_profile(&self, addr: &str) -> Option<Profile> {
        self.global
            .known_ble_devices
            .get(&addr.to_uppercase())
            .map(|c| c.to_profile(self.global.trigger_bump_100_percent))
    }

    pub fn remember_device(&mut self, addr: &str, profile: &Profile) {
        let entry = self
            .global
            .known_ble_devices
            .entry(addr.to_uppercase())
            .or_default();
        entry.update_from_profile(profile);
    }
}

/// On-disk v3 document.
#[derive(Serialize, Deserialize)]
struct SettingsFileV3 {
    version: u64,
    global: GlobalSettings,
    slots: BTreeMap<String, SlotCalibration>,
}

/// Loads and saves the settings file.
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(SETTINGS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, migrating older formats. A missing file yields
    /// defaults; a malformed file is an error (the caller reports it and
    /// keeps defaults).
    pub fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| GcError::Persistence(format!("read {}: {e}", self.path.display())))?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| GcError::Persistence(format!("parse settings: {e}")))?;

        let migrated = migrate_to_v3(value)?;
        let file: SettingsFileV3 = serde_json::from_value(migrated)
            .map_err(|e| GcError::Persistence(format!("decode settings: {e}")))?;

        let mut settings = Settings {
            global: file.global,
            slots: Default::default(),
        };
        for (key, cal) in file.slots {
            if let Ok(idx @ 0..=3) = key.parse::<usize>() {
                settings.slots[idx] = cal;
            }
        }
        info!("[SETTINGS] Loaded {}", self.path.display());
        Ok(settings)
    }

    /// Write the current settings as v3, atomically.
    pub fn save(&self, settings: &Settings) -> Result<()> {
        let file = SettingsFileV3 {
            version: CURRENT_VERSION,
            global: settings.global.clone(),
            slots: settings
                .slots
                .iter()
                .enumerate()
                .map(|(i, c)| (i.to_string(), c.clone()))
                .collect(),
        };
        let text = serde_json::to_string_pretty(&file)
            .map_err(|e| GcError::Persistence(format!("encode settings: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)
            .map_err(|e| GcError::Persistence(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| GcError::Persistence(format!("rename settings: {e}")))?;
        info!("[SETTINGS] Saved {}", self.path.display());
        Ok(())
    }
}

// ── Migration ───────────────────────────────────────────────────────

fn rename_trigger_keys(map: &mut Map<String, Value>) {
    for (old, new) in TRIGGER_KEY_RENAMES {
        if let Some(v) = map.remove(old) {
            map.entry(new.to_string()).or_insert(v);
        }
    }
}

/// Migrate any historical settings document to the v3 shape.
fn migrate_to_v3(value: Value) -> Result<Value> {
    let Value::Object(mut root) = value else {
        return Err(GcError::Persistence(
            "settings root is not an object".into(),
        ));
    };

    let version = root.get("version").and_then(Value::as_u64).unwrap_or(1);
    match version {
        1 => Ok(migrate_v1(root)),
        2 => Ok(migrate_v2(root)),
        3 => Ok(Value::Object(root)),
        other => Err(GcError::Persistence(format!(
            "unknown settings version {other}"
        ))),
    }
}

/// v1: one flat calibration dict. Apply to slot 0; pull global keys up.
fn migrate_v1(mut flat: Map<String, Value>) -> Value {
    flat.remove("version");
    rename_trigger_keys(&mut flat);

    let mut global = Map::new();
    for key in GLOBAL_KEYS {
        if let Some(v) = flat.remove(key) {
            global.insert(key.to_string(), v);
        }
    }

    json!({
        "version": 3,
        "global": global,
        "slots": { "0": flat },
    })
}

/// v2 → v3: fold per-slot `preferred_ble_address` and the flat
/// `known_ble_addresses` list into `global.known_ble_devices`.
fn migrate_v2(mut root: Map<String, Value>) -> Value {
    let mut global = match root.remove("global") {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    };
    let mut slots = match root.remove("slots") {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    };

    let mut devices = match global.remove("known_ble_devices") {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    };

    // Old flat address list → empty device entries.
    if let Some(Value::Array(addrs)) = global.remove("known_ble_addresses") {
        for addr in addrs {
            if let Some(addr) = addr.as_str() {
                devices
                    .entry(addr.to_uppercase())
                    .or_insert_with(|| json!({}));
            }
        }
    }

    for slot in slots.values_mut() {
        let Value::Object(slot) = slot else { continue };
        rename_trigger_keys(slot);
        if let Some(addr) = slot.remove("preferred_ble_address") {
            if let Some(addr) = addr.as_str() {
                // The slot's calibration doubles as the device calibration.
                let mut entry = slot.clone();
                entry.remove("preferred_ble_address");
                devices.insert(addr.to_uppercase(), Value::Object(entry));
            }
        }
    }

    global.insert("known_ble_devices".into(), Value::Object(devices));

    json!({
        "version": 3,
        "global": global,
        "slots": slots,
    })
}
