#![forbid(unsafe_code)]

use argh::FromArgs;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod cache;
mod configuration;
mod driver;
mod notify;
mod oci;
mod proxy;
mod registry;
mod server;

use configuration::Configuration;
use notify::Broadcaster;
use proxy::ProxyCache;
use registry::Registry;

#[derive(FromArgs, Debug)]
/// An OCI-compliant, docker-compatible container image registry
struct GlobalArguments {
    /// the path to the configuration file, defaults to `config.toml`
    #[argh(option, short = 'c', default = "GlobalArguments::default_config_path()")]
    config: String,

    #[argh(subcommand)]
    command: SubCommand,
}

impl GlobalArguments {
    fn default_config_path() -> String {
        "config.toml".to_string()
    }
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum SubCommand {
    Serve(ServeOptions),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "serve", description = "Run the registry server")]
struct ServeOptions {}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let arguments: GlobalArguments = argh::from_env();
    let config = Configuration::load(&arguments.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer())
            .init();

        match arguments.command {
            SubCommand::Serve(_) => run_server(config).await,
        }
    })
}

async fn run_server(config: Configuration) -> Result<(), Box<dyn std::error::Error>> {
    let _http_secret = config.http.resolve_secret();

    let backend = config.storage.backend();
    let driver = driver::build_driver(&backend);
    let cache = cache::build_cache(&config.cache)?;

    let proxy = match &config.proxy {
        Some(proxy_config) => Some(ProxyCache::new(
            proxy_config,
            driver.clone(),
            cache.clone(),
        )?),
        None => None,
    };

    let notifier = if config.notifications.endpoints.is_empty() {
        Broadcaster::disabled()
    } else {
        Broadcaster::new(&config.notifications.endpoints)
    };

    let registry = Arc::new(Registry::new(
        &config,
        driver,
        cache,
        proxy,
        notifier,
    )?);

    // proxy registries take no uploads, nothing to purge
    let _purger = if config.proxy.is_none() {
        registry::spawn_upload_purger(registry.clone(), config.storage.upload_purging.clone())
    } else {
        None
    };

    if config.storage.readonly.enabled {
        info!("Read-only mode: all writes will be rejected");
    }

    let access = server::build_access_controller(&config.auth);
    let state = Arc::new(server::ServerState { registry, access });

    server::serve(&config.server, state).await?;
    Ok(())
}
