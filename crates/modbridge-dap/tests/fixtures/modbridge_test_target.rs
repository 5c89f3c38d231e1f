//! Stand-in target for the integration tests.
//!
//! Accepts the target command line the adapter builds
//! (`--load-scenario <mod>/<scenario> --mod-directory <dir>`), checks the mod
//! list the adapter wrote and runs the mock debug hook over stdio.

use std::{
    env, fs,
    path::{Path, PathBuf},
    process,
};

use modbridge_wire::wire::mock::{MockRuntime, MockRuntimeConfig, MockScenario};

const HOOK_MOD: &str = "debugadapter";

fn usage(message: &str) -> ! {
    eprintln!("modbridge_test_target: {message}");
    process::exit(2);
}

/// A missing mod list means "all mods enabled".
fn hook_enabled(mod_directory: Option<&Path>) -> bool {
    let Some(mod_directory) = mod_directory else {
        return true;
    };
    let Ok(text) = fs::read_to_string(mod_directory.join("mod-list.json")) else {
        return true;
    };
    let Ok(list) = serde_json::from_str::<serde_json::Value>(&text) else {
        usage("mod-list.json is not valid JSON");
    };
    list["mods"].as_array().is_some_and(|mods| {
        mods.iter()
            .any(|entry| entry["name"] == HOOK_MOD && entry["enabled"] == true)
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mut scenario: Option<String> = None;
    let mut mod_directory: Option<PathBuf> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--load-scenario" => scenario = args.next(),
            "--mod-directory" => mod_directory = args.next().map(PathBuf::from),
            _ => {}
        }
    }

    let Some(scenario) = scenario else {
        usage("--load-scenario is required");
    };
    let Some((mod_name, scenario_name)) = scenario.split_once('/') else {
        usage("expected --load-scenario <mod>/<scenario>");
    };
    let Some(kind) = MockScenario::from_name(scenario_name) else {
        usage(&format!("unknown scenario {scenario_name:?}"));
    };

    let script = mod_directory
        .clone()
        .unwrap_or_default()
        .join(mod_name)
        .join("scenarios")
        .join(scenario_name)
        .join("control.lua");

    let mut config = MockRuntimeConfig::new(script.display().to_string(), kind);
    config.hook_enabled = hook_enabled(mod_directory.as_deref());

    let served = MockRuntime::new(config)
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await;
    if let Err(err) = served {
        eprintln!("modbridge_test_target: {err}");
        process::exit(1);
    }
    // Exit explicitly; a pending stdin read would otherwise hold the runtime open.
    process::exit(0);
}
