use std::sync::Once;

use modbridge_config::{init_tracing, BridgeConfig};

static PANIC_HOOK: Once = Once::new();

/// Initialize structured logging and install a global panic hook for the
/// adapter process.
///
/// Logs go to stderr or a file, never stdout: stdout carries the DAP stream.
pub fn init(config: &BridgeConfig) {
    init_tracing(&config.logging);
    install_panic_hook(config.logging.include_backtrace);
}

fn install_panic_hook(include_backtrace: bool) {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let message = panic_message(info);
            let location = info.location().map(|loc| loc.to_string());
            let backtrace = include_backtrace
                .then(|| std::backtrace::Backtrace::force_capture().to_string());

            tracing::event!(
                target: "modbridge.panic",
                tracing::Level::ERROR,
                panic.message = %message,
                panic.location = %location.as_deref().unwrap_or("<unknown>"),
                panic.backtrace = backtrace.as_deref(),
                "panic captured"
            );
            previous(info);
        }));
    });
}

fn panic_message(info: &std::panic::PanicHookInfo<'_>) -> String {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "panic payload (non-string)".to_owned()
    }
}
