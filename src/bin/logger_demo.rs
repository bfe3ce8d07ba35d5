use courier::logger::*;

fn main() -> anyhow::Result<()> {
    let logger = Logger::new_bootstrap();
    trace!("bootstrap trace log");
    debug!("bootstrap debug log");
    info!("bootstrap info log");

    let config = LogConfig {
        filter: "courier=trace,info".to_string(),
    };
    logger.reload_from_config(&config)?;
    info!(filter = %logger.current_filter()?, "filter reloaded");
    trace!(target: "courier::sync", "sync trace log");
    debug!(target: "courier::sync", "sync debug log");
    info!("application info log");

    let bad = LogConfig {
        filter: "courier=[".to_string(),
    };
    if let Err(e) = logger.reload_from_config(&bad) {
        warn!("invalid filter rejected: {e}");
    }

    Ok(())
}
