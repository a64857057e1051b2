use citadel::config::Config;
use citadel::server::Server;

use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};

fn main() -> anyhow::Result<()> {
    let cfg = Config::load();
    let _log_guard = init_logging(&cfg);

    let mut server = Server::new(&cfg)?;
    server.run();

    Ok(())
}

/// Wires `tracing` to a daily-rotated file through a bounded, lossy async
/// writer. The returned guard flushes the queue on shutdown.
fn init_logging(cfg: &Config) -> Option<WorkerGuard> {
    if !cfg.open_log {
        return None;
    }
    let level = match cfg.log_level {
        0 => tracing::Level::DEBUG,
        1 => tracing::Level::INFO,
        2 => tracing::Level::WARN,
        _ => tracing::Level::ERROR,
    };
    let appender = tracing_appender::rolling::daily("./log", "citadel.log");
    let (writer, guard) = NonBlockingBuilder::default()
        .buffered_lines_limit(cfg.log_queue_size)
        .lossy(true)
        .finish(appender);

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Some(guard)
}
