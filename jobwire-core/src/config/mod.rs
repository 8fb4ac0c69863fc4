//! Shared process configuration.
//!
//! [`Config`] is a [`clap`] argument group meant to be flattened into a
//! binary's own CLI. Every option is also read from the environment, so a
//! worker can be configured entirely through a `.env` file or container
//! environment.
//!
//! ```no_run
//! use clap::Parser;
//! use jobwire::config::Config;
//!
//! #[derive(Parser, Debug)]
//! pub struct Cli {
//!     #[command(flatten)]
//!     pub options: Config,
//! }
//!
//! let cli = Cli::parse();
//! let category = cli.options.category().unwrap();
//! ```

use std::path::PathBuf;

use clap::{ArgAction, Args, ValueEnum};

use crate::{
    error::{QueueError, Result},
    topology::QueueCategory,
};

/// Default number of unacknowledged deliveries a channel may hold.
pub const DEFAULT_PREFETCH: u16 = 10;
/// Default number of redeliveries a retryable failure is granted.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;
const LOCAL_AMQP_URI: &str = "amqp://localhost:5672";
const HELP_HEADING: &str = "Queue options";

/// Represents the main configuration structure.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// The queue category this process serves, e.g. `ipfs-pin-queue`.
    #[arg(long, short, help_heading = HELP_HEADING, env = "JOBWIRE_QUEUE")]
    pub queue: String,

    /// Provides the URI for the AMQP broker.
    #[arg(long, help_heading = HELP_HEADING, env = "AMQP_URI")]
    pub amqp_uri: String,

    /// Maximum number of unacknowledged deliveries held by this process.
    #[arg(
        long,
        help_heading = HELP_HEADING,
        env = "JOBWIRE_PREFETCH",
        default_value_t = DEFAULT_PREFETCH
    )]
    pub prefetch: u16,

    /// Determines the payload encoding.
    #[arg(
        long,
        short,
        help_heading = HELP_HEADING,
        env = "JOBWIRE_SERIALIZER",
        value_enum,
        default_value_t = Serializer::Json
    )]
    pub serializer: Serializer,

    /// Identity of this node, used to scope queues bound to fan-out
    /// exchanges.
    #[arg(long, help_heading = HELP_HEADING, env = "HOSTNAME")]
    pub host_id: Option<String>,

    /// How many times a message failing with a retryable error is requeued
    /// before it is dead-lettered.
    #[arg(
        long,
        help_heading = HELP_HEADING,
        env = "JOBWIRE_MAX_REDELIVERIES",
        default_value_t = DEFAULT_MAX_REDELIVERIES
    )]
    pub max_redeliveries: u32,

    /// Route rejected messages to a per-queue dead-letter queue.
    #[arg(
        long,
        help_heading = HELP_HEADING,
        env = "JOBWIRE_DEAD_LETTER",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub dead_letter: bool,

    /// Directory for the `<queue>_service.log` file. Logs go to stderr when
    /// unset.
    #[arg(long, help_heading = HELP_HEADING, env = "JOBWIRE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Consumer tag announced to the broker. Defaults to `jobwire-<queue>`.
    #[arg(long, help_heading = HELP_HEADING, env = "JOBWIRE_CONSUMER_TAG")]
    pub consumer_tag: Option<String>,
}

impl Config {
    /// Configuration for the given queue against a broker on localhost, with
    /// every other option defaulted.
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            amqp_uri: LOCAL_AMQP_URI.to_string(),
            prefetch: DEFAULT_PREFETCH,
            serializer: Default::default(),
            host_id: None,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            dead_letter: true,
            log_dir: None,
            consumer_tag: None,
        }
    }

    /// The configured queue category.
    ///
    /// Fails with [`QueueError::InvalidCategory`] if the name is unknown.
    pub fn category(&self) -> Result<QueueCategory> {
        self.queue.parse()
    }

    /// The consumer tag to announce for the configured category.
    pub fn consumer_tag(&self) -> String {
        self.consumer_tag
            .clone()
            .unwrap_or_else(|| format!("jobwire-{}", self.queue))
    }

    /// Checks option combinations clap cannot express.
    pub fn validate(&self) -> Result<()> {
        let category = self.category()?;
        if category.is_host_scoped() && self.host_id.is_none() {
            return Err(QueueError::Config(format!(
                "queue `{category}` is host scoped and requires --host-id or HOSTNAME"
            )));
        }
        Ok(())
    }
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Json,
    Cbor,
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        options: Config,
    }

    #[test]
    fn parses_defaults() {
        let cli = Cli::parse_from([
            "test",
            "--queue",
            "dfa-queue",
            "--amqp-uri",
            "amqp://broker:5672",
        ]);
        assert_eq!(cli.options.amqp_uri, "amqp://broker:5672");
        assert_eq!(cli.options.prefetch, DEFAULT_PREFETCH);
        assert_eq!(cli.options.serializer, Serializer::Json);
        assert!(cli.options.dead_letter);
        assert_eq!(cli.options.consumer_tag(), "jobwire-dfa-queue");
        assert_eq!(cli.options.category().unwrap(), QueueCategory::DatabaseFileAdd);
    }

    #[test]
    fn dead_letter_can_be_disabled() {
        let cli = Cli::parse_from([
            "test",
            "--queue",
            "dfa-queue",
            "--amqp-uri",
            "amqp://broker:5672",
            "--dead-letter",
            "false",
        ]);
        assert!(!cli.options.dead_letter);
    }

    #[test]
    fn broker_uri_is_required() {
        if std::env::var_os("AMQP_URI").is_some() {
            return;
        }
        let err = Cli::try_parse_from(["test", "--queue", "dfa-queue"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn unknown_queue_is_invalid_category() {
        let config = Config::for_queue("not-a-queue");
        assert!(matches!(config.category(), Err(QueueError::InvalidCategory(_))));
    }

    #[test]
    fn host_scoped_queue_requires_host() {
        let mut config = Config::for_queue("ipfs-pin-queue");
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
        config.host_id = Some("node-1".to_string());
        assert!(config.validate().is_ok());
    }
}
