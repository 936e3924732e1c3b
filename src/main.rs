use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use gatehouse::{
    GatewayService, HttpClientAdapter, HttpHandler,
    config::{GatewayConfig, GatewayConfigValidator, LogFormat, load_config},
    metrics, tracing_setup,
    utils::{DrainOutcome, GracefulShutdown},
};

const RATE_LIMIT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file; environment variables alone are enough when omitted
    #[clap(short, long)]
    config: Option<String>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate the configuration and exit
    Validate {
        #[clap(short, long)]
        config: Option<String>,
    },
    /// Write a starter configuration file
    Init {
        #[clap(short, long, default_value = "gatehouse.toml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(config.or(args.config)).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(config.or(args.config)).await,
        None => serve(args.config).await,
    }
}

async fn serve(config_path: Option<String>) -> Result<()> {
    let config = load_config(config_path.as_deref())
        .await
        .wrap_err("Failed to load configuration")?;

    tracing_setup::init_tracing_with_config(&config.log_level, config.log_format == LogFormat::Json)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    GatewayConfigValidator::validate(&config).wrap_err("Invalid configuration")?;
    for warning in GatewayConfigValidator::warnings(&config) {
        tracing::warn!("{}", warning);
    }

    // Must run before the gateway builds its instruments.
    let meter_provider = metrics::init_metrics_exporter(config.otlp_endpoint.as_deref())
        .map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    let config = Arc::new(config);
    let http_client =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);
    let gateway = Arc::new(
        GatewayService::new(config.clone(), http_client)
            .context("Failed to build gateway service")?,
    );

    let purge_task = gateway
        .limiters()
        .clone()
        .spawn_purge_task(RATE_LIMIT_PURGE_INTERVAL);

    let shutdown = Arc::new(GracefulShutdown::new(config.shutdown_timeout()));
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let app = HttpHandler::new(gateway.clone()).router();

    let addr_str = config.effective_listen_addr();
    let addr: SocketAddr = addr_str
        .parse()
        .with_context(|| format!("Invalid listen address: {addr_str}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    tracing::info!(
        "Gatehouse {} listening on http://{} (environment: {})",
        env!("CARGO_PKG_VERSION"),
        addr,
        config.environment
    );
    for name in gateway.registry().names() {
        if let Some(service) = gateway.registry().get(name) {
            tracing::info!("Upstream service {}", service);
        }
    }

    let mut stop_accepting = shutdown.shutdown_token();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        stop_accepting.wait_for_shutdown().await;
    })
    .into_future();

    let outcome = shutdown.drain(server).await?;
    purge_task.abort();

    if outcome == DrainOutcome::TimedOut {
        tracing::warn!("Shutdown completed with requests still in flight");
    } else {
        tracing::info!("Graceful shutdown completed");
    }

    if let Some(provider) = meter_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!("Failed to flush metrics exporter: {}", e);
        }
    }

    Ok(())
}

/// Validate configuration and exit
async fn validate_config_command(config_path: Option<String>) -> Result<()> {
    let source = config_path.as_deref().unwrap_or("<environment>");
    println!("Validating configuration: {source}");

    if let Some(path) = config_path.as_deref() {
        if !Path::new(path).exists() {
            return Err(eyre!("Configuration file '{path}' not found"));
        }
    }

    let config: GatewayConfig = load_config(config_path.as_deref())
        .await
        .wrap_err("Configuration parsing failed")?;
    println!("Configuration parsing: OK");

    GatewayConfigValidator::validate(&config).wrap_err("Configuration validation failed")?;
    println!("Configuration validation: OK");
    println!();
    println!("Summary:");
    println!("  Listen address: {}", config.effective_listen_addr());
    println!("  Environment:    {}", config.environment);
    println!("  Services:       {}", config.services.len());
    println!("  Routes:         {}", config.routes.len());
    println!(
        "  JWT secret:     {}",
        if config.jwt_secret().is_some() {
            "configured"
        } else {
            "missing"
        }
    );

    let warnings = GatewayConfigValidator::warnings(&config);
    if !warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }
    Ok(())
}

/// Write a starter configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        return Err(eyre!("Configuration file '{config_path}' already exists"));
    }

    let default_config = r#"# Gatehouse API gateway configuration
#
# Every value can also be set through GATEWAY__<KEY> variables, and the usual
# deployment variables (PORT, JWT_SECRET, CORS_ORIGIN, LOG_LEVEL, NODE_ENV,
# <SERVICE>_SERVICE_URL) take precedence over this file.

listen_addr = "0.0.0.0:3000"
environment = "development"
log_level = "info"
log_format = "json"
cors_origins = []
# jwt_secret = "change-me"

[services.usuarios]
display_name = "Users Service"
url = "http://localhost:8080"
health_check_path = "/health"
timeout_ms = 30000

[services.productos]
display_name = "Products Service"
url = "http://localhost:3001"

[[routes]]
prefix = "/api/auth"
service = "usuarios"
kind = "auth_proxy"

[[routes]]
prefix = "/api/usuarios"
service = "usuarios"
kind = "protected"

[[routes]]
prefix = "/api/productos"
service = "productos"
kind = "protected"

[rate_limits.global]
window = "15m"
max_requests = 100
message = "Too many requests from this IP"

[rate_limits.auth]
window = "15m"
max_requests = 10
message = "Too many authentication attempts"

[rate_limits.api]
window = "1m"
max_requests = 50
message = "Too many API requests"

[health_cache]
ttl_secs = 30
probe_timeout_secs = 5
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("Run 'gatehouse serve --config {config_path}' to start the gateway");
    Ok(())
}
