use std::time::{SystemTime, UNIX_EPOCH};

use pcp_sdn::forwarder::LoggingForwarder;
use pcp_sdn::{Config, Controller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.default_nat_pool_config.external_ips().is_empty() {
        log::warn!("external NAT pool is empty, no mappings can ever be created");
        return Ok(());
    }

    let start_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let _controller = Controller::new(config, LoggingForwarder, start_time);

    // The OpenFlow session transport that would feed this controller
    // `ForwarderEvent`s is an integration crate's job, not this one's
    // (spec.md §1); wired to a `LoggingForwarder` there is nothing for the
    // controller to do but wait.
    log::warn!(
        "no OpenFlow transport is linked in this build; the controller is idle until an \
         integration crate drives it with ForwarderChannel events"
    );
    std::future::pending::<()>().await;
    Ok(())
}
