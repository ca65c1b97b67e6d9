use crate::config::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Load configuration from a JSON file. A missing path (or `None`) yields
/// the default configuration so the gateway can run unconfigured.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let Some(path) = config_path else {
        return Ok(Config::default());
    };

    if !path.exists() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: Config = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?;
    Ok(config)
}

/// Validate a loaded config, returning human-readable warnings for the
/// `check-config` command. Nothing here is fatal.
pub fn lint_config(config: &Config) -> Vec<String> {
    let mut warnings = Vec::new();

    for (name, source) in &config.webhooks {
        if source.secret.is_none() {
            warnings.push(format!(
                "webhook source '{}' has no secret — signature checks will be skipped",
                name
            ));
        }
        if source.allowed_events.is_empty() {
            warnings.push(format!(
                "webhook source '{}' has an empty event allowlist — all deliveries will be rejected",
                name
            ));
        }
        for event in &source.error_events {
            if !source.allowed_events.contains(event) {
                warnings.push(format!(
                    "webhook source '{}': error event '{}' is not in the allowlist",
                    name, event
                ));
            }
        }
    }

    if config.retry.backoff_factor < 1.0 {
        warnings.push("retry.backoffFactor < 1.0 — backoff will shrink between attempts".into());
    }
    if config.worker.concurrency == 0 {
        warnings.push("worker.concurrency is 0 — webhook events will never be processed".into());
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookSourceConfig;
    use std::io::Write;

    #[test]
    fn missing_path_yields_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.gateway.port, 8600);

        let config = load_config(Some(Path::new("/nonexistent/config.json"))).unwrap();
        assert_eq!(config.gateway.port, 8600);
    }

    #[test]
    fn loads_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"gateway": {{"host": "0.0.0.0", "port": 7000}}}}"#).unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.gateway.host, "0.0.0.0");
        assert_eq!(config.gateway.port, 7000);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }

    #[test]
    fn lint_flags_missing_secret_and_allowlist() {
        let mut config = Config::default();
        config.webhooks.insert(
            "github".to_string(),
            WebhookSourceConfig {
                secret: None,
                allowed_events: vec![],
                ..WebhookSourceConfig::default()
            },
        );

        let warnings = lint_config(&config);
        assert!(warnings.iter().any(|w| w.contains("no secret")));
        assert!(warnings.iter().any(|w| w.contains("empty event allowlist")));
    }

    #[test]
    fn lint_flags_error_event_outside_allowlist() {
        let mut config = Config::default();
        config.webhooks.insert(
            "github".to_string(),
            WebhookSourceConfig {
                secret: Some("s".into()),
                allowed_events: vec!["push".into()],
                error_events: vec!["workflow_run".into()],
                ..WebhookSourceConfig::default()
            },
        );

        let warnings = lint_config(&config);
        assert!(warnings.iter().any(|w| w.contains("workflow_run")));
    }
}
