//! Bridge configuration, built from environment variables.

use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

/// Default ledger path when `DATABASE_URL` is unset.
const DEFAULT_DATABASE_URL: &str = "sqlite:///messages.db";

/// Runtime configuration for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_username: String,
    pub imap_password: String,
    pub imap_use_ssl: bool,
    /// Folders to poll, already trimmed.
    pub folders: Vec<String>,
    pub check_interval: Duration,
    /// Maximum number of headers fetched per IMAP round trip.
    pub batch_size: usize,
    pub ntfy_topic: String,
    pub ntfy_title: String,
    pub ntfy_icon: String,
    pub ntfy_priority: u8,
    /// Local path backing the dedup ledger.
    pub database_path: String,
}

impl BridgeConfig {
    /// Build config from environment variables.
    ///
    /// Missing required keys produce a typed error so startup can exit
    /// before the poll loop is entered.
    pub fn from_env() -> Result<Self, ConfigError> {
        let imap_host = required(&["IMAP_HOST"], "Set it to the IMAP server hostname.")?;

        let imap_port: u16 = std::env::var("IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let imap_username = required(
            &["IMAP_USER", "IMAP_USERNAME"],
            "Set it to the mailbox login name.",
        )?;
        let imap_password = required(
            &["IMAP_PASS", "IMAP_PASSWORD"],
            "Set it to the mailbox password.",
        )?;

        let imap_use_ssl = env_any(&["IMAP_SSL", "IMAP_USE_SSL"])
            .map(|s| s.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        let folders = parse_folders(
            &std::env::var("IMAP_FOLDERS").unwrap_or_else(|_| "INBOX".to_string()),
        );

        let check_interval_secs: u64 = std::env::var("CHECK_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let batch_size: usize = std::env::var("BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(50);

        let ntfy_topic = required(&["NTFY_TOPIC"], "Set it to the ntfy topic URL.")?;
        let ntfy_title = std::env::var("NTFY_TITLE").unwrap_or_default();
        let ntfy_icon = std::env::var("NTFY_ICON").unwrap_or_default();
        let ntfy_priority = clamp_priority(std::env::var("NTFY_PRIORITY").ok().as_deref());

        let database_path = database_path(
            &std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
        );

        Ok(Self {
            imap_host,
            imap_port,
            imap_username,
            imap_password,
            imap_use_ssl,
            folders,
            check_interval: Duration::from_secs(check_interval_secs),
            batch_size,
            ntfy_topic,
            ntfy_title,
            ntfy_icon,
            ntfy_priority,
            database_path,
        })
    }
}

/// First non-empty value among the given environment keys.
fn env_any(keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
}

/// Like [`env_any`], but a missing value is a configuration error.
fn required(keys: &[&str], hint: &str) -> Result<String, ConfigError> {
    env_any(keys).ok_or_else(|| ConfigError::MissingRequired {
        key: keys[0].to_string(),
        hint: hint.to_string(),
    })
}

/// Split a comma-separated folder list, trimming entries and dropping empties.
fn parse_folders(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse an ntfy priority, clamping anything outside 1–5 back to the default 3.
fn clamp_priority(raw: Option<&str>) -> u8 {
    match raw {
        None => 3,
        Some(s) => match s.trim().parse::<u8>() {
            Ok(p) if (1..=5).contains(&p) => p,
            _ => {
                warn!(value = %s, "Invalid NTFY_PRIORITY, using default 3");
                3
            }
        },
    }
}

/// Reduce a `sqlite:` URL to a local filesystem path.
///
/// `sqlite:///rel.db` → `rel.db`, `sqlite:////abs.db` → `/abs.db`;
/// anything without a recognized scheme is used as a path verbatim.
fn database_path(url: &str) -> String {
    let path = url
        .strip_prefix("sqlite:///")
        .or_else(|| url.strip_prefix("sqlite://"))
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    if path.is_empty() {
        "messages.db".to_string()
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folders_are_trimmed_and_filtered() {
        assert_eq!(
            parse_folders("INBOX, Archive ,  ,Work"),
            vec!["INBOX", "Archive", "Work"]
        );
    }

    #[test]
    fn single_default_folder() {
        assert_eq!(parse_folders("INBOX"), vec!["INBOX"]);
    }

    #[test]
    fn priority_in_range_is_kept() {
        assert_eq!(clamp_priority(Some("1")), 1);
        assert_eq!(clamp_priority(Some("5")), 5);
    }

    #[test]
    fn priority_out_of_range_clamps_to_default() {
        assert_eq!(clamp_priority(Some("0")), 3);
        assert_eq!(clamp_priority(Some("6")), 3);
        assert_eq!(clamp_priority(Some("99")), 3);
    }

    #[test]
    fn priority_non_numeric_clamps_to_default() {
        assert_eq!(clamp_priority(Some("high")), 3);
        assert_eq!(clamp_priority(Some("")), 3);
    }

    #[test]
    fn priority_unset_is_default() {
        assert_eq!(clamp_priority(None), 3);
    }

    #[test]
    fn database_url_relative() {
        assert_eq!(database_path("sqlite:///messages.db"), "messages.db");
    }

    #[test]
    fn database_url_absolute() {
        assert_eq!(database_path("sqlite:////var/lib/bridge.db"), "/var/lib/bridge.db");
    }

    #[test]
    fn database_plain_path_passes_through() {
        assert_eq!(database_path("./data/bridge.db"), "./data/bridge.db");
    }

    #[test]
    fn database_empty_url_falls_back() {
        assert_eq!(database_path("sqlite://"), "messages.db");
    }
}
