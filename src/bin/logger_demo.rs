use portal_link::logger::*;

fn main() -> anyhow::Result<()> {
    let logger = Logger::new_bootstrap();
    trace!("bootstrap trace log");
    debug!("bootstrap debug log");
    info!("bootstrap info log");

    let config = LogConfig::new("debug");
    logger.reload_from_config(&config)?;
    trace!("application trace log");
    debug!(attempt = 1, "application debug log");
    info!(state = "connected", "application info log");

    Ok(())
}
