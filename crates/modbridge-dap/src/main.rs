use clap::Parser;
use modbridge_config::BridgeConfig;
use std::path::PathBuf;

/// Debug adapter for scripting runtimes that expose a modbridge debug hook.
///
/// Speaks DAP over stdio.
#[derive(Debug, Parser)]
#[command(name = "modbridge-dap", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `MODBRIDGE_CONFIG` is used as a fallback. When neither is
    /// provided the adapter uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Install logging and the panic hook before anything can fail, so failures
    // in request handlers are recorded.
    let config = load_config(cli.config);
    modbridge_dap::hardening::init(&config);

    modbridge_dap::server::run_stdio(config).await
}

fn load_config(cli_path: Option<PathBuf>) -> BridgeConfig {
    let Some(path) = BridgeConfig::resolve_path(cli_path.as_deref()) else {
        return BridgeConfig::default();
    };

    match BridgeConfig::load_from_path_with_diagnostics(&path) {
        Ok((config, diagnostics)) => {
            for key in &diagnostics.unknown_keys {
                eprintln!("modbridge-dap: {}: unknown key `{key}`", path.display());
            }
            for warning in &diagnostics.warnings {
                eprintln!("modbridge-dap: {}: {warning}", path.display());
            }
            config
        }
        Err(err) => {
            eprintln!(
                "modbridge-dap: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            BridgeConfig::default()
        }
    }
}
