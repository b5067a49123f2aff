use std::sync::Arc;
use std::time::Duration;
use stormgate::api;
use stormgate::logger::*;
use stormgate::metrics;
use stormgate::server::*;
use stormgate::settings::*;
use tokio::signal;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logger = Logger::new_bootstrap();

    let project_settings = parse_settings(cli.settings.as_deref())?;
    info!(?project_settings);
    let logger_config = LogConfig {
        filter: project_settings.log.filter.clone(),
    };
    logger.reload_from_config(&logger_config)?;

    let address: std::net::SocketAddr = cli
        .address
        .as_deref()
        .unwrap_or(&project_settings.http.address)
        .parse()?;
    if cli.check {
        info!(%address, "settings ok");
        return Ok(());
    }

    let recorder = metrics::install_recorder()?;
    let server = Arc::new(
        Server::try_new(&project_settings)
            .await?
            .with_metrics(recorder),
    );

    let (bound, serving) = warp::serve(api::app(server.clone()))
        .try_bind_with_graceful_shutdown(address, async {
            if let Err(e) = signal::ctrl_c().await {
                error!("could not listen for SIGINT: {}", e);
            }
            info!("shutdown signal received");
        })?;
    info!(%bound, "listening");
    serving.await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server.shutdown()).await {
        Ok(_) => info!("server shutdown successfully"),
        Err(_) => {
            error!("server shutdown timed out, dropping pending work");
            server.abort();
        }
    }

    Ok(())
}
