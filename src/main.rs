use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use gantry::{
    AdminApi, GatewayService, HealthChecker, HttpClientAdapter, ListenerSet, Reinitializer,
    config::{ServerConfig, ServerConfigValidator, load_config},
    interceptors::BuiltinInterceptorFactory,
    ports::http_client::HttpClient,
    tracing_setup,
    utils::{GracefulShutdown, ShutdownToken},
};
use tokio::task::JoinSet;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "gantry.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "gantry.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "gantry.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "gantry.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    tracing_setup::init_tracing(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    ServerConfigValidator::validate(&config).context("Invalid configuration")?;
    tracing::info!("Loaded configuration from {config_path}");

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);
    let gateway_service = Arc::new(
        GatewayService::from_config(
            &config,
            http_client.clone(),
            Arc::new(BuiltinInterceptorFactory),
        )
        .await?,
    );

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        signal_handler_shutdown.run_signal_handler().await;
    });

    let mut tasks = JoinSet::new();

    let health_checker = HealthChecker::new(
        gateway_service.clone(),
        http_client.clone(),
        config.health_check.clone(),
    );
    let token = graceful_shutdown.shutdown_token();
    tasks.spawn(async move {
        health_checker.run(token).await;
        Ok(())
    });

    let reinitializer = Reinitializer::new(
        gateway_service.clone(),
        Duration::from_secs(config.reinit_interval_secs),
    );
    let token = graceful_shutdown.shutdown_token();
    tasks.spawn(async move {
        reinitializer.run(token).await;
        Ok(())
    });

    let listeners = Arc::new(ListenerSet::new(
        gateway_service.clone(),
        graceful_shutdown.clone(),
    ));
    listeners
        .listen_all()
        .await
        .context("Failed to bind proxy listeners")?;

    if let Some(admin) = &config.admin {
        let addr: SocketAddr = admin
            .listen_addr
            .parse()
            .context("Failed to parse admin listen address")?;
        let router = AdminApi::new(gateway_service.clone())
            .with_listeners(listeners.clone())
            .router();
        let token = graceful_shutdown.shutdown_token();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin API to {addr}"))?;
        tracing::info!("Admin API listening on {}", addr);
        tasks.spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal(token))
                .await
                .context("Admin API server error")
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("{:?}", e);
                graceful_shutdown.trigger_shutdown(gantry::utils::ShutdownReason::Force);
            }
            Err(e) => tracing::error!("Task failed: {}", e),
        }
    }
    listeners.wait().await;

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

async fn shutdown_signal(token: ShutdownToken) {
    let reason = token.wait_for_shutdown().await;
    tracing::info!("Shutdown signal received: {:?}", reason);
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config: ServerConfig = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:?}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            let internal = config.proxies.iter().filter(|p| p.internal).count();
            println!("Configuration validation: OK");
            println!();
            println!("Configuration Summary:");
            println!("   Proxies: {} ({} internal)", config.proxies.len(), internal);
            println!("   Health Checks: {}", config.health_check.enabled);
            println!(
                "   Admin API: {}",
                config
                    .admin
                    .as_ref()
                    .map_or("disabled", |a| a.listen_addr.as_str())
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Gantry API Gateway Configuration

logging:
  level: info
  format: pretty

admin:
  listen_addr: "127.0.0.1:9901"

health_check:
  enabled: true
  interval_secs: 10
  timeout_secs: 2
  path: /health
  unhealthy_threshold: 3
  healthy_threshold: 2

proxies:
  # Answer liveness probes without touching a backend
  - name: ping
    port: 8080
    path: { pattern: /ping }
    interceptors:
      - type: static_response
        body: pong

  # Everything under /api goes through the internal "orders" proxy
  - name: api
    port: 8080
    path: { pattern: /api }
    interceptors:
      - type: request_id
      - type: access_log
    target: { type: url, url: "internal://orders" }

  - name: orders
    internal: true
    interceptors:
      - type: rate_limit
        by: ip
        requests: 100
        period: 1s
    target:
      type: balancer
      name: orders-pool
      strategy: round_robin
      nodes:
        - { host: localhost, port: 3001 }
        - { host: localhost, port: 3002 }
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'gantry serve --config {config_path}' to start the gateway");
    Ok(())
}
