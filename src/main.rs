use rust_rudp::config::Config;
use rust_rudp::engine::Engine;
use rust_rudp::logger;
use rust_rudp::server::{start_signal_handler, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::load()?;
    logger::init(&cfg.logging)?;

    // Runtime for signal handling and the blocking server loop
    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();

    if let Some(workers) = cfg.server.workers {
        runtime_builder.worker_threads(workers);
        tracing::info!("[CONFIG] Using {workers} worker threads");
    } else {
        tracing::info!("[CONFIG] Using default worker threads (CPU cores)");
    }

    let runtime = runtime_builder.build()?;

    runtime.block_on(async_main(cfg))
}

async fn async_main(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::with_config(cfg.transport.clone())?;
    let server = Server::new(&engine, cfg.server.clone())?;
    let addr = server.local_addr()?;

    start_signal_handler(server.stop_handle());
    logger::log_server_start(&addr, &cfg.server, &cfg.logging);

    let result = server
        .serve(|connection| {
            let socket = connection.socket().clone();
            let reply = socket.clone();
            connection.on_data(move |data| {
                if let Err(e) = reply.send(data) {
                    logger::log_warning(&format!("Echo to {} failed: {e}", reply.id()));
                }
            });
            connection.on_close(move || {
                if let Ok(stats) = socket.stats(false) {
                    logger::log_connection_stats(socket.id(), &stats);
                }
            });
            true
        })
        .await;

    result.map_err(|e| {
        logger::log_error(&format!("Server stopped with error: {e}"));
        e.into()
    })
}
