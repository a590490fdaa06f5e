use std::{future::IntoFuture, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use rampart::{
    adapters::{
        BasicAuthenticator, FileConfigProvider, HealthChecker, HttpClientAdapter,
        HttpConfigProvider, HttpHandler, StaticDiscovery,
    },
    config::{
        GatewayConfig, GatewayConfigValidator, LogFormat, LoggingConfig, SAMPLE_CONFIG,
        loader::load_config_unchecked,
    },
    core::GatewayService,
    customers::{self, CustomersConfig},
    metrics,
    ports::{config_provider::ConfigProvider, http_client::HttpClient},
    tracing_setup,
    utils::{ChangeDebouncer, ShutdownSignal},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long open connections and streams get to finish after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const CONFIG_RELOAD_DEBOUNCE: Duration = Duration::from_secs(2);
const REMOTE_CONFIG_POLL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "rampart.toml")]
    config: String,

    /// Override `logging.format` from the configuration
    #[clap(long, value_enum, global = true)]
    log_format: Option<LogFormatArg>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "rampart.toml")]
        config: String,
    },
    /// Write a sample configuration file
    Init {
        #[clap(short, long, default_value = "rampart.toml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file or http(s) URL serving JSON
        #[clap(short, long, default_value = "rampart.toml")]
        config: String,
    },
    /// Run the demo customers upstream
    Customers {
        #[clap(short, long, default_value = "127.0.0.1:8080")]
        listen: String,
        /// Calls per id that fail before /error/{id} succeeds
        #[clap(long, default_value_t = 5)]
        error_failures: u32,
        /// Customer feed cadence, e.g. 1s or 250ms
        #[clap(long, default_value = "1s", value_parser = humantime::parse_duration)]
        interval: Duration,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Json,
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Pretty => LogFormat::Pretty,
        }
    }
}

fn create_config_provider(config_path: &str) -> Result<Arc<dyn ConfigProvider>> {
    if config_path.starts_with("http://") || config_path.starts_with("https://") {
        Ok(Arc::new(HttpConfigProvider::new(config_path, REMOTE_CONFIG_POLL)?))
    } else {
        Ok(Arc::new(FileConfigProvider::new(config_path)?))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let log_format = args.log_format.map(LogFormat::from);

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Customers {
            listen,
            error_failures,
            interval,
        }) => {
            customers_command(
                &listen,
                CustomersConfig {
                    error_failures,
                    interval,
                    ..CustomersConfig::default()
                },
                log_format,
            )
            .await
        }
        Some(Commands::Serve { config }) => serve(&config, log_format).await,
        None => serve(&args.config, log_format).await,
    }
}

async fn serve(config_path: &str, log_format: Option<LogFormat>) -> Result<()> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let crypto_installed = rustls::crypto::CryptoProvider::install_default(provider).is_ok();

    let config_provider =
        create_config_provider(config_path).context("Failed to create config provider")?;
    let config = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;

    let mut logging = config.logging.clone();
    if let Some(format) = log_format {
        logging.format = format;
    }
    tracing_setup::init_tracing(&logging)?;
    if !crypto_installed {
        tracing::debug!("A rustls crypto provider was already installed");
    }
    let prometheus = metrics::init_metrics()?;
    tokio::spawn(metrics::run_upkeep(prometheus));

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);
    let discovery = Arc::new(
        StaticDiscovery::from_config(&config, None).context("Invalid service instances")?,
    );
    let gateway = Arc::new(
        GatewayService::new(
            &config,
            discovery.clone(),
            Arc::new(BasicAuthenticator::new(&config.users)),
            http_client.clone(),
        )
        .await
        .context("Failed to build route table")?,
    );

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.listen_for_signals().await {
                tracing::error!("Signal handler error: {:#}", e);
            }
        });
    }

    let health_task =
        spawn_health_checker(&config, discovery.clone(), http_client.clone(), &shutdown);
    let watcher = tokio::spawn(watch_config(
        config_provider,
        config.clone(),
        gateway.clone(),
        discovery,
        http_client,
        health_task,
        shutdown.clone(),
    ));

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    for route in gateway.router().snapshot().routes() {
        tracing::info!(
            "Configured route '{}': {} -> {}",
            route.id,
            route.path.as_str(),
            route.target.describe()
        );
    }
    tracing::info!("Rampart gateway listening on {}", addr);
    println!("Rampart gateway listening on {addr}");

    let app = HttpHandler::new(gateway).into_router();
    let graceful = {
        let shutdown = shutdown.clone();
        async move { shutdown.triggered().await }
    };
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful);

    let result = tokio::select! {
        result = server.into_future() => result.context("Server error"),
        _ = async {
            shutdown.triggered().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            tracing::warn!("Connections still open after {:?}, forcing shutdown", SHUTDOWN_GRACE);
            Ok(())
        }
    };

    shutdown.trigger();
    if let Err(e) = watcher.await {
        tracing::warn!("Config watcher ended abnormally: {}", e);
    }
    tracing::info!("Graceful shutdown completed");
    result
}

/// Running health checker and the token that stops it.
struct HealthTask {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HealthTask {
    async fn stop(self) {
        self.stop.cancel();
        if let Some(handle) = self.handle {
            let _ = handle.await;
        }
    }
}

fn spawn_health_checker(
    config: &GatewayConfig,
    discovery: Arc<StaticDiscovery>,
    http_client: Arc<dyn HttpClient>,
    shutdown: &ShutdownSignal,
) -> HealthTask {
    let stop = shutdown.token();
    if !config.health_check.enabled {
        tracing::info!("Health checking is disabled");
        return HealthTask { stop, handle: None };
    }

    let checker = HealthChecker::new(discovery, http_client, config.health_check.clone());
    let token = stop.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = checker.run(token).await {
            tracing::error!("Health checker error: {:#}", e);
        }
    });
    HealthTask {
        stop,
        handle: Some(handle),
    }
}

/// Apply configuration changes until shutdown. Invalid configurations are
/// logged and the running one is kept.
async fn watch_config(
    provider: Arc<dyn ConfigProvider>,
    mut current: GatewayConfig,
    gateway: Arc<GatewayService>,
    mut discovery: Arc<StaticDiscovery>,
    http_client: Arc<dyn HttpClient>,
    mut health_task: HealthTask,
    shutdown: ShutdownSignal,
) {
    let mut changes = ChangeDebouncer::new(provider.watch(), CONFIG_RELOAD_DEBOUNCE);
    tracing::info!("Config watcher task started");

    while changes.next_reload(&shutdown).await {
        let config = match provider.load_config().await {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to reload configuration, keeping the old one: {:#}", e);
                continue;
            }
        };

        let next_discovery = match StaticDiscovery::from_config(&config, Some(discovery.as_ref())) {
            Ok(next) => Arc::new(next),
            Err(e) => {
                tracing::error!("Rejected reloaded services: {}", e);
                continue;
            }
        };

        match gateway
            .reload(
                &config,
                next_discovery.clone(),
                Arc::new(BasicAuthenticator::new(&config.users)),
            )
            .await
        {
            Ok(version) => {
                tracing::info!("Configuration reloaded, route table v{}", version);
                if config.listen_addr != current.listen_addr {
                    tracing::warn!(
                        "listen_addr changed to {}; restart to apply it",
                        config.listen_addr
                    );
                }
                health_task.stop().await;
                health_task = spawn_health_checker(
                    &config,
                    next_discovery.clone(),
                    http_client.clone(),
                    &shutdown,
                );
                discovery = next_discovery;
                current = config;
            }
            Err(e) => tracing::error!("Rejected reloaded routes: {}", e),
        }
    }

    health_task.stop().await;
    tracing::info!("Config watcher task is shutting down");
}

async fn customers_command(
    listen: &str,
    config: CustomersConfig,
    log_format: Option<LogFormat>,
) -> Result<()> {
    tracing_setup::init_tracing(&LoggingConfig {
        format: log_format.unwrap_or_default(),
        ..LoggingConfig::default()
    })?;

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind to {listen}"))?;
    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.listen_for_signals().await {
                tracing::error!("Signal handler error: {:#}", e);
            }
        });
    }
    println!("Customers service listening on {}", listener.local_addr()?);
    customers::serve(listener, config, shutdown.token()).await
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        return Err(eyre!("Configuration file '{config_path}' not found"));
    }

    let config = load_config_unchecked(config_path)
        .await
        .context("Configuration parsing failed")?;
    println!("Configuration parsing: OK");

    GatewayConfigValidator::validate(&config).context("Configuration validation failed")?;
    StaticDiscovery::from_config(&config, None).context("Invalid service instances")?;
    println!("Configuration validation: OK");
    println!();
    println!("Configuration summary:");
    println!("  listen address: {}", config.listen_addr);
    println!("  routes:         {}", config.routes.len());
    println!("  services:       {}", config.services.len());
    println!("  users:          {}", config.users.len());
    println!("  health checks:  {}", config.health_check.enabled);
    Ok(())
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        return Err(eyre!("Configuration file '{config_path}' already exists"));
    }

    tokio::fs::write(path, SAMPLE_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("Created sample configuration at: {config_path}");
    println!("  Run 'rampart customers' and 'rampart serve --config {config_path}' to try it");
    Ok(())
}
