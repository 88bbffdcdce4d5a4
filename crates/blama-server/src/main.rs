use std::net::SocketAddr;
use std::sync::Arc;

use blama_infer::{InstanceParams, Model, ModelParams};
use blama_runtime::MockLoader;
use blama_server::{run_server, AppState, Server, ServerConfig};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    blama_engine::init_library();

    let config = ServerConfig::from_env()?;
    tracing::info!("loading model {}", config.model.display());

    let progress = |p: f32| {
        tracing::debug!("loading: {:3.0}%", p * 100.0);
    };

    // reference backend; a native GGUF runtime plugs in behind the same
    // loader trait
    let loader = MockLoader::default();
    let model = Model::load(
        &loader,
        &config.model,
        ModelParams::default(),
        Some(&progress),
    )?;

    let server = Arc::new(Server::new(model, InstanceParams::default())?);
    let state = AppState { server };

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("listening on {addr}");
    run_server(state, addr).await
}
