// Stream bridge host for Linux: engine thread, loopback engine, HTTP/1.1 front door.

mod config;
mod echo;
mod listener;

use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("bridge-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!(version = VERSION, ?cfg, "starting");

    let (client, provisional) = bridge_core::Client::new(cfg.bridge.clone());

    // Engine objects are single-threaded; they live on their own thread and runtime.
    let engine_thread = std::thread::Builder::new()
        .name("bridge-engine".into())
        .spawn(move || -> anyhow::Result<()> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let engine = provisional.start(Box::new(echo::EchoListener::new()));
            rt.block_on(engine.run());
            Ok(())
        })?;

    let bind: std::net::SocketAddr = format!("127.0.0.1:{}", cfg.listen_port).parse()?;
    let front = listener::Front::new(client.clone(), cfg.bridge.async_mode, cfg.pull_chunk);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::select! {
            r = listener::run(bind, front) => r,
            r = shutdown_signal() => r,
        }
    })?;

    tracing::info!(stats = ?client.stats(), "shutting down");
    client.shutdown();
    match engine_thread.join() {
        Ok(r) => r?,
        Err(_) => anyhow::bail!("engine thread panicked"),
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
