use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use jobwire::{
    config::Config,
    logging,
    manager::{QueueManager, Role},
};
use tracing::info;

/// Publish a JSON job to a queue or a fan-out exchange.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    /// The job payload, as JSON.
    pub payload: String,

    /// Broadcast to this exchange instead of the configured queue. Required
    /// for host-scoped queues.
    #[arg(long, short)]
    pub exchange: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Cli::parse();
    logging::init(&args.options)?;
    args.options.validate()?;

    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload is not valid JSON")?;

    let manager = QueueManager::connect(&args.options, Role::Publisher).await?;
    let published = match &args.exchange {
        Some(exchange) => manager.publish_to_exchange(&payload, exchange).await,
        None => manager.publish(&payload).await,
    };

    let report = manager.close().await;
    report.log();
    published?;

    info!(
        destination = args.exchange.as_deref().unwrap_or(&args.options.queue),
        "job published"
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_exchange_publish() {
        let cli = Cli::parse_from([
            "jobwire",
            "--queue",
            "ipfs-pin-queue",
            "--amqp-uri",
            "amqp://broker:5672",
            "--host-id",
            "api",
            "--exchange",
            "ipfs-pin-removal",
            r#"{"cid":"Qm123"}"#,
        ]);
        assert_eq!(cli.exchange.as_deref(), Some("ipfs-pin-removal"));
        assert_eq!(cli.options.host_id.as_deref(), Some("api"));
        assert!(cli.options.validate().is_ok());
    }
}
