//! Launch request validation and target command construction.
//!
//! Everything here runs before the target is spawned: a launch that fails
//! validation never starts a process.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use modbridge_config::AdapterConfig;
use modbridge_process::CommandSpec;
use serde::Deserialize;
use thiserror::Error;

use crate::mod_list::{ModAdjustment, ModList, ModOverrides};

const MOD_DIRECTORY_FLAG: &str = "--mod-directory";
const LOAD_SCENARIO_FLAG: &str = "--load-scenario";

/// Target flags that must be followed by a value.
const VALUE_FLAGS: &[&str] = &[
    "--config",
    MOD_DIRECTORY_FLAG,
    LOAD_SCENARIO_FLAG,
    "--load-game",
    "--benchmark",
    "--mp-load-game",
    "--start-server",
    "--executable-path",
];

/// Flags that choose what the target loads; at most one may be given.
const SESSION_SELECTORS: &[&str] = &[
    LOAD_SCENARIO_FLAG,
    "--load-game",
    "--benchmark",
    "--mp-load-game",
    "--start-server",
];

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("launch.program is required")]
    MissingProgram,
    #[error("argument {flag} expects a value")]
    MissingValue { flag: String },
    #[error("arguments {first} and {second} cannot be combined")]
    ConflictingArguments { first: String, second: String },
    #[error("invalid scenario {0:?}; expected `mod/scenario` or `scenario`")]
    InvalidScenario(String),
    #[error("adjustMods/disableExtraMods need a mod directory (modsPath or --mod-directory)")]
    ModDirectoryRequired,
    #[error("cannot disable base mod {0:?} without allowDisableBaseMod")]
    DisablesBaseMod(String),
    #[error("cannot disable debug hook mod {0:?}")]
    DisablesHookMod(String),
    #[error("cannot disable mod {0:?}: it provides the scenario being loaded")]
    DisablesScenarioMod(String),
    #[error("failed to access {}: {source}", path.display())]
    ModListIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid mod list {}: {message}", path.display())]
    ModListParse { path: PathBuf, message: String },
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// `launch` request arguments.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArguments {
    /// Target executable.
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Arguments passed through to the target.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mods_path: Option<PathBuf>,
    #[serde(default)]
    pub adjust_mods: BTreeMap<String, ModAdjustment>,
    #[serde(default)]
    pub disable_extra_mods: bool,
    #[serde(default)]
    pub allow_disable_base_mod: bool,
    #[serde(default)]
    pub stop_on_entry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioRef {
    pub mod_name: Option<String>,
    pub name: String,
}

impl ScenarioRef {
    fn parse(value: &str) -> Result<Self, LaunchError> {
        let invalid = || LaunchError::InvalidScenario(value.to_string());
        match value.split_once('/') {
            Some((mod_name, name)) => {
                if mod_name.is_empty() || name.is_empty() || name.contains('/') {
                    return Err(invalid());
                }
                Ok(Self {
                    mod_name: Some(mod_name.to_string()),
                    name: name.to_string(),
                })
            }
            None if value.is_empty() => Err(invalid()),
            None => Ok(Self {
                mod_name: None,
                name: value.to_string(),
            }),
        }
    }
}

/// Pass-through arguments after validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetArgs {
    pub mod_directory: Option<PathBuf>,
    pub scenario: Option<ScenarioRef>,
    /// Everything except `--mod-directory`, in the original order.
    pub forwarded: Vec<String>,
}

/// Check the pass-through argument vector.
pub fn validate_args(args: &[String]) -> Result<TargetArgs, LaunchError> {
    let mut parsed = TargetArgs::default();
    let mut selector: Option<&str> = None;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let Some(flag) = VALUE_FLAGS.iter().copied().find(|flag| *flag == arg.as_str()) else {
            if arg.starts_with("--") {
                tracing::debug!(target: "modbridge.dap", arg = %arg, "forwarding unrecognized argument");
            }
            parsed.forwarded.push(arg.clone());
            continue;
        };

        let value = match iter.next() {
            Some(value) if !value.starts_with("--") => value,
            _ => {
                return Err(LaunchError::MissingValue {
                    flag: flag.to_string(),
                })
            }
        };

        if SESSION_SELECTORS.contains(&flag) {
            if let Some(first) = selector {
                return Err(LaunchError::ConflictingArguments {
                    first: first.to_string(),
                    second: flag.to_string(),
                });
            }
            selector = Some(flag);
        }

        match flag {
            MOD_DIRECTORY_FLAG => {
                parsed.mod_directory = Some(PathBuf::from(value));
                continue;
            }
            LOAD_SCENARIO_FLAG => parsed.scenario = Some(ScenarioRef::parse(value)?),
            _ => {}
        }
        parsed.forwarded.push(flag.to_string());
        parsed.forwarded.push(value.clone());
    }

    Ok(parsed)
}

/// A validated launch, ready to spawn.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub command: CommandSpec,
    pub stop_on_entry: bool,
}

/// Validate `arguments`, apply mod overrides to the mod list on disk and build
/// the target command line.
pub async fn prepare(
    arguments: LaunchArguments,
    adapter: &AdapterConfig,
) -> Result<LaunchPlan, LaunchError> {
    let program = arguments.program.clone().ok_or(LaunchError::MissingProgram)?;
    let target_args = validate_args(&arguments.args)?;

    let mod_directory = target_args
        .mod_directory
        .clone()
        .or_else(|| arguments.mods_path.clone())
        .map(|dir| resolve_against(arguments.cwd.as_deref(), dir));
    let has_overrides = !arguments.adjust_mods.is_empty() || arguments.disable_extra_mods;

    let mut args = target_args.forwarded.clone();
    match mod_directory {
        Some(mod_directory) => {
            let mut mods = ModList::load(&mod_directory).await?;
            mods.apply(ModOverrides {
                adjust: &arguments.adjust_mods,
                disable_extra: arguments.disable_extra_mods,
                allow_disable_base: arguments.allow_disable_base_mod,
                hook_mod: &adapter.hook_mod,
                base_mod: &adapter.base_mod,
                scenario_mod: target_args
                    .scenario
                    .as_ref()
                    .and_then(|scenario| scenario.mod_name.as_deref()),
            })?;
            mods.save(&mod_directory).await?;
            tracing::debug!(
                target: "modbridge.dap",
                mod_directory = %mod_directory.display(),
                enabled = mods.mods.iter().filter(|entry| entry.enabled).count(),
                "mod list updated"
            );

            args.push(MOD_DIRECTORY_FLAG.to_string());
            args.push(mod_directory.display().to_string());
        }
        None if has_overrides => return Err(LaunchError::ModDirectoryRequired),
        None => {}
    }

    let command = CommandSpec::new(&program, &args)
        .with_cwd(arguments.cwd.clone())
        .with_env(arguments.env.clone());
    Ok(LaunchPlan {
        command,
        stop_on_entry: arguments.stop_on_entry,
    })
}

fn resolve_against(cwd: Option<&Path>, dir: PathBuf) -> PathBuf {
    match cwd {
        Some(cwd) if dir.is_relative() => cwd.join(dir),
        _ => dir,
    }
}
