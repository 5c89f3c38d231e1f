use std::time::Duration;

use modbridge_config::{BridgeConfig, ConfigError, ConfigWarning};

#[test]
fn empty_file_yields_defaults() {
    let (config, diagnostics) = BridgeConfig::load_from_str_with_diagnostics("").unwrap();
    assert_eq!(config, BridgeConfig::default());
    assert!(diagnostics.is_empty());
}

#[test]
fn partial_sections_keep_remaining_defaults() {
    let text = r#"
[logging]
level = "debug"

[adapter]
kill_grace_ms = 250
"#;
    let (config, diagnostics) = BridgeConfig::load_from_str_with_diagnostics(text).unwrap();
    assert!(diagnostics.is_empty());
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.stderr);
    assert_eq!(config.adapter.kill_grace(), Duration::from_millis(250));
    assert_eq!(config.adapter.hook_mod, "debugadapter");
}

#[test]
fn unknown_keys_are_reported() {
    let text = r#"
[logging]
levle = "debug"

[adaptor]
x = 1
"#;
    let (config, diagnostics) = BridgeConfig::load_from_str_with_diagnostics(text).unwrap();
    assert_eq!(config.logging.level, "info");
    assert_eq!(
        diagnostics.unknown_keys,
        vec!["adaptor".to_owned(), "logging.levle".to_owned()]
    );
}

#[test]
fn out_of_range_values_fall_back_with_warnings() {
    let text = r#"
[adapter]
max_output_line_bytes = 10
max_string_len = 0
hook_mod = "  "
"#;
    let (config, diagnostics) = BridgeConfig::load_from_str_with_diagnostics(text).unwrap();
    assert_eq!(config.adapter, Default::default());
    let paths: Vec<_> = diagnostics
        .warnings
        .iter()
        .filter_map(|warning| match warning {
            ConfigWarning::InvalidValue { toml_path, .. } => Some(toml_path.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        paths,
        vec![
            "adapter.max_output_line_bytes",
            "adapter.max_string_len",
            "adapter.hook_mod"
        ]
    );
}

#[test]
fn invalid_level_directive_is_replaced() {
    let text = r#"
[logging]
level = "modbridge=loud"
"#;
    let (config, diagnostics) = BridgeConfig::load_from_str_with_diagnostics(text).unwrap();
    assert_eq!(config.logging.level, "info");
    assert!(matches!(
        diagnostics.warnings.as_slice(),
        [ConfigWarning::LoggingLevelInvalid { .. }]
    ));
}

#[test]
fn type_errors_are_toml_errors() {
    let err = BridgeConfig::load_from_str_with_diagnostics("[adapter]\nkill_grace_ms = \"soon\"\n")
        .unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
}

#[test]
fn load_from_path_reads_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("modbridge.toml");
    std::fs::write(&path, "[logging]\njson = true\n").unwrap();

    let config = BridgeConfig::load_from_path(&path).unwrap();
    assert!(config.logging.json);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = BridgeConfig::load_from_path(dir.path().join("absent.toml")).unwrap_err();
    match err {
        ConfigError::Io { path, .. } => assert!(path.ends_with("absent.toml")),
        other => panic!("expected io error, got {other:?}"),
    }
}

#[test]
fn explicit_path_wins_over_environment() {
    let explicit = std::path::Path::new("/tmp/explicit.toml");
    assert_eq!(
        BridgeConfig::resolve_path(Some(explicit)).as_deref(),
        Some(explicit)
    );
}
