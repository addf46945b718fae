//! Tracing subscriber setup shared by the CLI and embedders.

use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `level` applies to this crate; dependency chatter from the streaming stack
/// and HTTP client is capped so it does not drown out playback logs.
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let level_filter: filter::LevelFilter = level.parse()?;

    let targets = filter::Targets::new()
        .with_default(filter::LevelFilter::WARN)
        .with_target("tandem_player", level_filter)
        .with_target("tandem", level_filter)
        .with_target("librespot_core", filter::LevelFilter::INFO)
        .with_target("librespot_playback", filter::LevelFilter::INFO)
        .with_target("hyper", filter::LevelFilter::INFO)
        .with_target("reqwest", filter::LevelFilter::INFO)
        .with_target("symphonia", filter::LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(targets)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}
