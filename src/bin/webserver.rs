// This is where we will create the default webserver for running the binary
// locally

use anyhow::Result;
use clap::Parser;
use lmstudio_sidecar::application::{
    application::Application, config::configuration::Configuration,
};
use lmstudio_sidecar::webserver::router;
use std::net::SocketAddr;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let configuration = Configuration::parse();

    // We get the logging setup first
    Application::install_logging(&configuration);
    info!(
        lmstudio = %configuration.lmstudio_base_url,
        "LM Studio sidecar starting"
    );

    let (tx, rx) = oneshot::channel();

    // Spawn a task to listen for signals
    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
            return;
        }
        let _ = tx.send(());
    });

    let application = Application::initialize(configuration).await?;
    debug!("initialized application");

    tokio::select! {
        result = start(application) => {
            if let Err(err) = &result {
                error!(?err, "sidecar failed");
            }
            result?;
        }
        _ = rx => {
            debug!("Signal received, cleaning up...");
        }
    }

    Ok(())
}

pub async fn start(app: Application) -> Result<()> {
    let bind = SocketAddr::new(app.config.host.parse()?, app.config.port);
    info!(%bind, "webserver listening");

    axum::Server::bind(&bind)
        .serve(router(app).into_make_service())
        .await?;

    Ok(())
}
