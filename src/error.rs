//! Error types for the bridge.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),
}

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// IMAP mailbox errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Connection to {host}:{port} failed: {reason}")]
    Connection {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Login failed for {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("Failed to select folder {folder}: {reason}")]
    Folder { folder: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ledger (dedup store) errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Failed to open ledger: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),
}

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;
