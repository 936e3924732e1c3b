use std::path::Path;

use config::{Config, Environment as EnvironmentSource, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::{Environment, GatewayConfig};

/// Load configuration using the config crate.
///
/// Sources, lowest precedence first: built-in defaults, the optional file
/// (YAML, JSON, TOML or INI by extension), `GATEWAY_*` variables (nested keys
/// separated by `__`), then the well-known deployment variables handled by
/// [`apply_env_overrides`].
pub async fn load_config(config_path: Option<&str>) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: Option<&str>) -> Result<GatewayConfig> {
    let mut builder = Config::builder();

    if let Some(config_path) = config_path {
        let path = Path::new(config_path);

        // Determine file format based on extension
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            Some("toml") => FileFormat::Toml,
            Some("ini") => FileFormat::Ini,
            _ => FileFormat::Toml,
        };

        builder = builder.add_source(File::new(config_path, format).required(true));
    }

    let settings = builder
        .add_source(
            EnvironmentSource::with_prefix("GATEWAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| {
            format!(
                "Failed to build config from {}",
                config_path.unwrap_or("<environment>")
            )
        })?;

    let mut gateway_config: GatewayConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.unwrap_or("<environment>")
        )
    })?;

    apply_env_overrides(&mut gateway_config, |key| std::env::var(key).ok())?;

    Ok(gateway_config)
}

/// Apply the conventional deployment variables on top of a loaded config.
///
/// `PORT`, `JWT_SECRET`, `CORS_ORIGIN` (comma separated), `LOG_LEVEL`,
/// `GATEWAY_ENV` / `NODE_ENV`, `OTEL_EXPORTER_OTLP_ENDPOINT` and
/// `<SERVICE>_SERVICE_URL` for every configured service.
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("PORT") {
        config.port = Some(
            port.trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {port}"))?,
        );
    }

    if let Some(secret) = lookup("JWT_SECRET") {
        config.jwt_secret = Some(secret);
    }

    if let Some(origins) = lookup("CORS_ORIGIN") {
        config.cors_origins = origins
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
    }

    if let Some(level) = lookup("LOG_LEVEL") {
        config.log_level = level;
    }

    if let Some(env) = lookup("GATEWAY_ENV").or_else(|| lookup("NODE_ENV")) {
        config.environment = env
            .parse::<Environment>()
            .map_err(|e| eyre::eyre!("Invalid environment: {e}"))?;
    }

    if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.otlp_endpoint = Some(endpoint);
    }

    for (name, service) in config.services.iter_mut() {
        let key = format!("{}_SERVICE_URL", name.to_ascii_uppercase().replace('-', "_"));
        if let Some(url) = lookup(&key) {
            tracing::debug!("Service '{}' url overridden by {}", name, key);
            service.url = url;
        }
    }

    Ok(())
}
