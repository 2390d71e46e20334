use nsbroker::Broker;

use crate::config::MergedConfig;
use crate::error::CliResult;

pub async fn execute(config: MergedConfig) -> CliResult<()> {
    let broker = Broker::new(config.broker);
    if config.stdio {
        broker.serve_stdio().await?;
    } else {
        broker.run().await?;
    }
    tracing::info!("broker stopped");
    Ok(())
}
