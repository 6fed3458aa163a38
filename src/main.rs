use mockgate::alias::{AliasSource, AliasStore, StaticAliases};
use mockgate::api::{ApiServer, Credentials, VERSION};
use mockgate::config::Config;
use mockgate::controller::LifecycleController;
use mockgate::registry::InstanceRegistry;
use mockgate::routing::{AliasMode, RoutingPublisher};
use mockgate::store::ConfigStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// What the binary was asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the API server
    Serve,
    /// Write the routing documents once and exit
    Generate,
    /// Verify the mock-server executable and exit
    Check,
}

fn parse_args(args: &[String]) -> (Command, PathBuf) {
    let mut command = Command::Serve;
    let mut rest = args;

    if let Some(first) = args.first() {
        let parsed = match first.as_str() {
            "serve" => Some(Command::Serve),
            "generate" => Some(Command::Generate),
            "check" => Some(Command::Check),
            _ => None,
        };
        if let Some(parsed) = parsed {
            command = parsed;
            rest = &args[1..];
        }
    }

    let config_path = rest
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mockgate.toml"));
    (command, config_path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mockgate=debug".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, config_path) = parse_args(&args);

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), ?command, version = VERSION, "Configuration loaded");

    for dir in config.required_dirs() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            error!(path = %dir.display(), error = %e, "Failed to create directory");
            anyhow::anyhow!("Failed to create directory '{}': {}", dir.display(), e)
        })?;
    }

    match command {
        Command::Generate => generate(&config),
        Command::Check => {
            let controller = build_controller(&config, Arc::new(StaticAliases::default()))?;
            controller.check_cli().await?;
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

fn build_controller(
    config: &Config,
    aliases: Arc<dyn AliasSource>,
) -> anyhow::Result<LifecycleController> {
    let store = ConfigStore::new(&config.paths.configs_dir, &config.mock.document_extension);
    let publisher = RoutingPublisher::from_config(config, aliases);
    let controller =
        LifecycleController::new(config, Arc::new(InstanceRegistry::new()), store, publisher)?;
    Ok(controller)
}

/// First-time bootstrap: the alias database may not exist yet
fn generate(config: &Config) -> anyhow::Result<()> {
    let publisher = RoutingPublisher::from_config(config, Arc::new(StaticAliases::default()));
    publisher.publish_static()?;
    publisher.publish_dynamic(&[], AliasMode::Skip)?;
    info!("Routing configuration generated");
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let aliases = AliasStore::open(&config.paths.database)?;
    let controller = Arc::new(build_controller(&config, Arc::new(aliases))?);

    if let Err(e) = controller.check_cli().await {
        error!(error = %e, "Mock server executable check failed");
        return Err(e.into());
    }

    controller.publisher().publish_static()?;
    controller.regenerate(AliasMode::Query)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;
    let (user, password) = config
        .server
        .credentials()
        .ok_or_else(|| anyhow::anyhow!("server.api_key must have the form user:password"))?;

    let api_server = Arc::new(ApiServer::new(
        bind_addr,
        Arc::clone(&controller),
        shutdown_rx,
        Credentials::new(user, password),
    ));

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        configs_dir = %config.paths.configs_dir.display(),
        logs_dir = %config.paths.logs_dir.display(),
        "Starting control panel"
    );

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    controller.shutdown();
    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args_defaults() {
        assert_eq!(
            parse_args(&[]),
            (Command::Serve, PathBuf::from("mockgate.toml"))
        );
    }

    #[test]
    fn test_parse_args_command_and_path() {
        assert_eq!(
            parse_args(&args(&["generate", "/etc/mockgate.toml"])),
            (Command::Generate, PathBuf::from("/etc/mockgate.toml"))
        );
        assert_eq!(
            parse_args(&args(&["check"])),
            (Command::Check, PathBuf::from("mockgate.toml"))
        );
    }

    #[test]
    fn test_parse_args_bare_path_serves() {
        assert_eq!(
            parse_args(&args(&["custom.toml"])),
            (Command::Serve, PathBuf::from("custom.toml"))
        );
    }
}
