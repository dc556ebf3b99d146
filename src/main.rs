use log::info;

use voxscribe::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Show info for our code, warn for noisy libraries
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        "info,serenity=warn,songbird=warn,tracing=warn,rustls=warn,h2=warn,hyper=warn,tungstenite=warn",
    ))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let config = Config::from_env()?;
    info!(
        "voxscribe starting (stt: {}, silence: {}ms)",
        config.stt_url,
        config.silence.as_millis()
    );

    voxscribe::discord::run(config).await
}
