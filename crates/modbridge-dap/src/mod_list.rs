//! `mod-list.json` handling for launch-time mod overrides.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::launch::LaunchError;

pub const MOD_LIST_FILE: &str = "mod-list.json";

/// Value of one `adjustMods` entry: enable/disable, or pin a version (which
/// also enables the mod).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModAdjustment {
    Enabled(bool),
    Version(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModEntry {
    pub name: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModList {
    #[serde(default)]
    pub mods: Vec<ModEntry>,
}

/// The launch-time changes to apply to a [`ModList`].
#[derive(Debug, Clone, Copy)]
pub struct ModOverrides<'a> {
    pub adjust: &'a BTreeMap<String, ModAdjustment>,
    /// Disable every mod not named in `adjust`.
    pub disable_extra: bool,
    pub allow_disable_base: bool,
    /// Mod carrying the debug hook; always enabled.
    pub hook_mod: &'a str,
    pub base_mod: &'a str,
    /// Mod owning the scenario being loaded, if any.
    pub scenario_mod: Option<&'a str>,
}

impl ModList {
    pub fn path_in(mod_directory: &Path) -> PathBuf {
        mod_directory.join(MOD_LIST_FILE)
    }

    /// Read the list from `mod_directory`. A missing file is an empty list.
    pub async fn load(mod_directory: &Path) -> Result<Self, LaunchError> {
        let path = Self::path_in(mod_directory);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(LaunchError::ModListIo { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|err| LaunchError::ModListParse {
            path,
            message: err.to_string(),
        })
    }

    pub async fn save(&self, mod_directory: &Path) -> Result<(), LaunchError> {
        let path = Self::path_in(mod_directory);
        let mut bytes = serde_json::to_vec_pretty(self).map_err(|err| LaunchError::ModListParse {
            path: path.clone(),
            message: err.to_string(),
        })?;
        bytes.push(b'\n');
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| LaunchError::ModListIo { path, source })
    }

    pub fn get(&self, name: &str) -> Option<&ModEntry> {
        self.mods.iter().find(|entry| entry.name == name)
    }

    fn entry_mut(&mut self, name: &str) -> &mut ModEntry {
        match self.mods.iter().position(|entry| entry.name == name) {
            Some(pos) => &mut self.mods[pos],
            None => {
                self.mods.push(ModEntry {
                    name: name.to_string(),
                    enabled: true,
                    version: None,
                });
                let last = self.mods.len() - 1;
                &mut self.mods[last]
            }
        }
    }

    fn is_enabled(&self, name: &str) -> bool {
        self.get(name).map_or(true, |entry| entry.enabled)
    }

    /// Apply `overrides`, rejecting combinations that would leave the target
    /// unable to run the requested session.
    pub fn apply(&mut self, overrides: ModOverrides<'_>) -> Result<(), LaunchError> {
        if let Some(ModAdjustment::Enabled(false)) = overrides.adjust.get(overrides.hook_mod) {
            return Err(LaunchError::DisablesHookMod(overrides.hook_mod.to_string()));
        }

        if overrides.disable_extra {
            for entry in &mut self.mods {
                if !overrides.adjust.contains_key(&entry.name) {
                    entry.enabled = false;
                }
            }
        }

        for (name, adjustment) in overrides.adjust {
            let entry = self.entry_mut(name);
            match adjustment {
                ModAdjustment::Enabled(enabled) => entry.enabled = *enabled,
                ModAdjustment::Version(version) => {
                    entry.enabled = true;
                    entry.version = Some(version.clone());
                }
            }
        }

        self.entry_mut(overrides.hook_mod).enabled = true;

        if !overrides.allow_disable_base && !self.is_enabled(overrides.base_mod) {
            return Err(LaunchError::DisablesBaseMod(overrides.base_mod.to_string()));
        }
        if let Some(scenario_mod) = overrides.scenario_mod {
            if !self.is_enabled(scenario_mod) {
                return Err(LaunchError::DisablesScenarioMod(scenario_mod.to_string()));
            }
        }
        Ok(())
    }
}
