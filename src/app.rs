use crate::{
    config::Config,
    decoder::MediaDecoder,
    executor::InferenceExecutor,
    handler::DetectionPipeline,
    model_service,
    server::{HttpServer, SharedState},
    telemetry::Metrics,
};
use anyhow::Context;
use std::sync::Arc;
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let ffmpeg = MediaDecoder::new(config.decoder.clone())
        .probe()
        .await
        .with_context(|| format!("ffmpeg not usable at {:?}", config.decoder.ffmpeg_path))?;
    tracing::info!("Found {}", ffmpeg);

    let model_config = config.model.clone();
    let slots = config.executor.worker_count;
    let model = match tokio::task::spawn_blocking(move || model_service::load(&model_config, slots))
        .await?
    {
        Ok(model) => model,
        Err(e) => {
            tracing::error!("Failed to load model: {}", e);
            return Err(e.into());
        }
    };

    let executor = Arc::new(
        InferenceExecutor::new(model.clone(), &config.executor)
            .context("failed to start inference workers")?,
    );
    let pipeline = Arc::new(DetectionPipeline::new(
        model.clone(),
        executor.clone(),
        &config,
    ));
    let metrics = Arc::new(Metrics::new()?);

    let state = SharedState {
        pipeline,
        model,
        metrics,
    };
    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Server stopped with an error: {}", e),
        Err(e) => tracing::error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    match Arc::try_unwrap(executor) {
        Ok(executor) => tokio::task::spawn_blocking(move || executor.shutdown()).await?,
        Err(_) => tracing::warn!("Inference executor still in use, not waiting for workers"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
