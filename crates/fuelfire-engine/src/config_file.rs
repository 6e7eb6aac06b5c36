//! Line-oriented editing of the engine's namelist-style configuration file.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::EngineError;

/// Parameter group headers, in the order they appear in the file.
pub const GROUPS: [&str; 15] = [
    "&GETBASIC",
    "&GETDEMO",
    "&GETAREA",
    "&GETWIND",
    "&GETFUEL",
    "&GETSTRIKE",
    "&GETSTATES",
    "&GETLOW",
    "&GETMOD",
    "&GETHIGH",
    "&GETVHIGH",
    "&GETEXTREME",
    "&GETSUPPRESS",
    "&GETOUTPUT",
    "&GETMOSAIC",
];

/// A family of related parameters with named value sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetBundle {
    pub name: &'static str,
    /// `(group, parameter)` pairs, in the order preset values are listed.
    pub keys: &'static [(&'static str, &'static str)],
    pub presets: &'static [(&'static str, &'static [&'static str])],
}

impl PresetBundle {
    pub fn find(name: &str) -> Option<&'static PresetBundle> {
        BUNDLES.iter().find(|bundle| bundle.name == name)
    }

    pub fn values(&self, preset: &str) -> Option<&'static [&'static str]> {
        self.presets
            .iter()
            .find(|(name, _)| *name == preset)
            .map(|(_, values)| *values)
    }

    pub fn preset_names(&self) -> impl Iterator<Item = &'static str> {
        self.presets.iter().map(|(name, _)| *name)
    }
}

pub const FUEL: PresetBundle = PresetBundle {
    name: "fuel",
    keys: &[
        ("&GETFUEL", "IMMATURE_FUEL_FACTOR"),
        ("&GETFUEL", "MATURE_FUEL_FACTOR"),
    ],
    presets: &[
        ("1-04", &["1", "0.4"]),
        ("1p5-04", &["1.5", "0.4"]),
        ("2-04", &["2", "0.4"]),
        ("2p5-04", &["2.5", "0.4"]),
        ("3-04", &["3", "0.4"]),
        ("4-04", &["4", "0.4"]),
        ("6-04", &["6", "0.4"]),
        ("8-04", &["8", "0.4"]),
    ],
};

pub const RISK: PresetBundle = PresetBundle {
    name: "risk",
    keys: &[
        ("&GETSTATES", "NO_FREQ"),
        ("&GETSTATES", "LO_FREQ"),
        ("&GETSTATES", "MOD_FREQ"),
        ("&GETSTATES", "HI_FREQ"),
        ("&GETSTATES", "VHI_FREQ"),
        ("&GETSTATES", "EX_FREQ"),
    ],
    presets: &[
        ("Def", &["0", "540", "250", "65", "5", "1"]),
        ("ONLY_L", &["0", "100", "0", "0", "0", "0"]),
        ("ONLY_M", &["0", "0", "100", "0", "0", "0"]),
        ("ONLY_H", &["0", "0", "0", "100", "0", "0"]),
        ("ONLY_E", &["0", "0", "0", "0", "100", "100"]),
    ],
};

pub const SUPPRESSION: PresetBundle = PresetBundle {
    name: "sup",
    keys: &[
        ("&GETSUPPRESS", "BEGIN_AT_STEP"),
        ("&GETSUPPRESS", "CANCEL_AT_STEP"),
    ],
    presets: &[("SUP", &["0", "9000"]), ("NOSUP", &["9000", "9001"])],
};

pub const BUNDLES: [PresetBundle; 3] = [FUEL, RISK, SUPPRESSION];

/// Loaded configuration lines plus a `(group, parameter) -> line` index.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
    lines: Vec<String>,
    params: HashMap<&'static str, HashMap<String, usize>>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path).map_err(|err| EngineError::io(path, err))?;
        Ok(Self::parse(path, &text))
    }

    fn parse(path: &Path, text: &str) -> Self {
        let lines: Vec<String> = text.split_inclusive('\n').map(str::to_owned).collect();
        let params = map_params(&lines);
        Self {
            path: path.to_path_buf(),
            lines,
            params,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current raw value of a parameter, trimmed.
    pub fn get(&self, group: &str, key: &str) -> Result<&str, EngineError> {
        let line = self.line_of(group, key)?;
        let text = &self.lines[line];
        let value = text.split_once('=').map_or("", |(_, value)| value);
        Ok(value.trim())
    }

    fn line_of(&self, group: &str, key: &str) -> Result<usize, EngineError> {
        let group_upper = group.to_uppercase();
        let params = self
            .params
            .get(group_upper.as_str())
            .ok_or_else(|| EngineError::UnknownGroup(group.to_string()))?;
        params
            .get(&key.trim().to_uppercase())
            .copied()
            .ok_or_else(|| EngineError::UnknownParameter {
                group: group.to_string(),
                key: key.to_string(),
            })
    }

    /// Replace the value of one parameter, keeping everything up to `=`.
    pub fn set(&mut self, group: &str, key: &str, value: &str) -> Result<(), EngineError> {
        let line = self.line_of(group, key)?;
        let current = &self.lines[line];
        let prefix = current.find('=').map_or("", |eq| &current[..=eq]);
        self.lines[line] = format!("{prefix} {value} \n");
        debug!(group, key, value, "set parameter");
        Ok(())
    }

    pub fn apply_preset(&mut self, bundle: &str, preset: &str) -> Result<(), EngineError> {
        let found =
            PresetBundle::find(bundle).ok_or_else(|| EngineError::UnknownBundle(bundle.to_string()))?;
        let values = found
            .values(preset)
            .ok_or_else(|| EngineError::UnknownPreset {
                bundle: bundle.to_string(),
                preset: preset.to_string(),
            })?;
        for (&(group, key), value) in found.keys.iter().zip(values) {
            self.set(group, key, value)?;
        }
        Ok(())
    }

    /// Apply each `(bundle, preset)` pair, set the caption, and write the file.
    pub fn preset_modify(
        &mut self,
        presets: &[(&str, &str)],
        caption: &str,
    ) -> Result<(), EngineError> {
        for &(bundle, preset) in presets {
            self.apply_preset(bundle, preset)?;
        }
        self.set("&GETBASIC", "CAPTION", caption)?;
        self.write()
    }

    pub fn write(&self) -> Result<(), EngineError> {
        fs::write(&self.path, self.lines.concat()).map_err(|err| EngineError::io(&self.path, err))
    }
}

/// Index `key = value` lines by group. A group opens on the first line
/// containing its header (or a later one) and closes on a lone `/`.
fn map_params(lines: &[String]) -> HashMap<&'static str, HashMap<String, usize>> {
    let mut params: HashMap<&'static str, HashMap<String, usize>> =
        GROUPS.iter().map(|&group| (group, HashMap::new())).collect();
    let mut next = 0;
    let mut open: Option<&'static str> = None;

    for (index, raw) in lines.iter().enumerate() {
        let line = raw.trim().to_uppercase();
        match open {
            Some(group) => {
                if line == "/" {
                    open = None;
                } else if line.matches('=').count() == 1 {
                    if let Some((key, _)) = line.split_once('=') {
                        if let Some(entries) = params.get_mut(group) {
                            entries.insert(key.trim().to_string(), index);
                        }
                    }
                }
            }
            None => {
                if let Some(offset) = GROUPS[next..].iter().position(|g| line.contains(g)) {
                    let found = next + offset;
                    open = Some(GROUPS[found]);
                    next = (found + 1).min(GROUPS.len() - 1);
                }
            }
        }
    }
    params
}
