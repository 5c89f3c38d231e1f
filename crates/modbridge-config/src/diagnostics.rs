use serde::de::DeserializeOwned;

/// Non-fatal findings produced while loading a config file.
///
/// Callers always get a usable `BridgeConfig` when deserialization succeeds;
/// diagnostics describe keys that were ignored and values that were replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiagnostics {
    /// Keys present in the TOML that the schema does not know (for example
    /// `adapter.kill_grace`), collected via `serde_ignored`.
    pub unknown_keys: Vec<String>,
    pub warnings: Vec<ConfigWarning>,
}

impl ConfigDiagnostics {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unknown_keys.is_empty() && self.warnings.is_empty()
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    InvalidValue {
        toml_path: String,
        message: String,
    },
    LoggingLevelInvalid {
        value: String,
        normalized: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::InvalidValue { toml_path, message } => {
                write!(f, "{toml_path}: {message}")
            }
            ConfigWarning::LoggingLevelInvalid { value, normalized } => write!(
                f,
                "logging.level: {value:?} is not a valid filter (normalized to {normalized:?}); falling back to info"
            ),
        }
    }
}

pub(crate) fn deserialize_toml_with_unknown_keys<T: DeserializeOwned>(
    text: &str,
) -> Result<(T, Vec<String>), toml::de::Error> {
    let mut unknown = Vec::<String>::new();
    let deserializer = toml::de::Deserializer::new(text);
    let value = serde_ignored::deserialize(deserializer, |path| {
        // `serde_ignored::Path` renders with a leading `.` for root paths.
        unknown.push(path.to_string().trim_start_matches('.').to_string());
    })?;
    unknown.sort();
    unknown.dedup();
    Ok((value, unknown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn unknown_keys_use_dotted_paths() {
        #[derive(Debug, Deserialize)]
        struct Root {
            #[allow(dead_code)]
            #[serde(default)]
            section: Section,
        }

        #[derive(Debug, Default, Deserialize)]
        struct Section {
            #[allow(dead_code)]
            #[serde(default)]
            known: bool,
        }

        let text = r#"
[section]
known = true
typo = 1
"#;

        let (_value, unknown) = deserialize_toml_with_unknown_keys::<Root>(text).expect("parse");
        assert_eq!(unknown, vec!["section.typo"]);
    }
}
