use thiserror::Error;

/// Failure categories of a migration run.
///
/// `Configuration` and the two connection variants are fatal and bubble up
/// to the entry point. `Parse` and `Delivery` stay scoped to the message
/// they belong to: the offending message is logged and skipped or counted,
/// and the run moves on.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("configuration validation failed:\n{}", .0.join("\n"))]
    Configuration(Vec<String>),

    #[error("source connection failed: {0}")]
    SourceConnection(String),

    #[error("destination connection failed: {0}")]
    DestinationConnection(String),

    #[error("cannot parse message: {0}")]
    Parse(String),

    #[error("failed to send email: {0}")]
    Delivery(String),
}
