use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pdfrag::api;
use pdfrag::config::PipelineArgs;
use pdfrag::telemetry;
use pdfrag::AppContext;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "pdfrag-server",
    about = "HTTP API for uploading PDFs and asking questions about them"
)]
struct ServerCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "PDFRAG_BIND", default_value = "127.0.0.1:8000")]
    bind: String,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();
    let cli = ServerCli::parse();
    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;

    // blocking HTTP clients must be built and dropped outside the async runtime
    let settings = cli.pipeline.build_settings()?;
    let context = Arc::new(
        AppContext::initialize(&settings).context("failed to initialise the pipeline")?,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(serve(addr, Arc::clone(&context)))?;
    drop(runtime);

    context
        .persist()
        .context("failed to persist the vector index on shutdown")?;
    info!("pdfrag-server shutdown complete");
    Ok(())
}

async fn serve(addr: SocketAddr, context: Arc<AppContext>) -> Result<()> {
    let app = api::router(context);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("pdfrag-server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
