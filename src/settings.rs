use std::env;
use std::fmt;

use log::warn;

use crate::error::MigrationError;

const DEFAULT_SOURCE_PORT: u16 = 995;
const DEFAULT_DEST_PORT: u16 = 587;

// Mail-retrieval variant configured for the source account. Retrieval
// itself always speaks IMAP against the source host; the selector is
// configuration surface carried through from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceProtocol {
    Imap,
    Pop3,
}

impl SourceProtocol {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "imap" => Some(SourceProtocol::Imap),
            "pop3" => Some(SourceProtocol::Pop3),
            _ => None,
        }
    }
}

impl fmt::Display for SourceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceProtocol::Imap => write!(f, "imap"),
            SourceProtocol::Pop3 => write!(f, "pop3"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub email: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub protocol: SourceProtocol,
    pub mailbox: Option<String>,
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub email: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub accept_invalid_certs: bool,
}

pub fn load_source_config() -> SourceConfig {
    source_from_lookup(|key| env::var(key).ok())
}

pub fn load_destination_config() -> DestinationConfig {
    destination_from_lookup(|key| env::var(key).ok())
}

fn source_from_lookup<G: Fn(&str) -> Option<String>>(get: G) -> SourceConfig {
    let protocol = match optional(&get, "SOURCE_PROTOCOL") {
        None => SourceProtocol::Pop3,
        Some(raw) => SourceProtocol::parse(&raw).unwrap_or_else(|| {
            warn!("SOURCE_PROTOCOL {:?} is not recognized, assuming pop3", raw);
            SourceProtocol::Pop3
        }),
    };

    SourceConfig {
        email: get("SOURCE_EMAIL").unwrap_or_default(),
        password: get("SOURCE_PASSWORD").unwrap_or_default(),
        host: get("SOURCE_HOST").unwrap_or_default(),
        port: parse_port(optional(&get, "SOURCE_PORT"), DEFAULT_SOURCE_PORT, "SOURCE_PORT"),
        protocol,
        mailbox: optional(&get, "SOURCE_MAILBOX"),
        accept_invalid_certs: flag_enabled(optional(&get, "SOURCE_ACCEPT_INVALID_CERTS")),
    }
}

fn destination_from_lookup<G: Fn(&str) -> Option<String>>(get: G) -> DestinationConfig {
    DestinationConfig {
        email: get("DEST_EMAIL").unwrap_or_default(),
        password: get("DEST_PASSWORD").unwrap_or_default(),
        host: get("DEST_HOST").unwrap_or_default(),
        port: parse_port(optional(&get, "DEST_PORT"), DEFAULT_DEST_PORT, "DEST_PORT"),
        // Only the literal string "false" turns transport security off.
        use_tls: optional(&get, "DEST_USE_TLS").as_deref() != Some("false"),
        accept_invalid_certs: flag_enabled(optional(&get, "DEST_ACCEPT_INVALID_CERTS")),
    }
}

// Empty strings behave like unset variables for everything optional.
fn optional<G: Fn(&str) -> Option<String>>(get: &G, key: &str) -> Option<String> {
    get(key).filter(|value| !value.is_empty())
}

fn flag_enabled(raw: Option<String>) -> bool {
    raw.as_deref() == Some("true")
}

fn parse_port(raw: Option<String>, default: u16, var: &str) -> u16 {
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(port) => port,
            Err(_) => {
                warn!("{} {:?} is not a valid port, using {}", var, raw, default);
                default
            }
        },
    }
}

// Checks both halves of the configuration and reports every missing
// required field at once, one line per violation, before anything touches
// the network.
pub fn validate_config(
    source: &SourceConfig,
    dest: &DestinationConfig,
) -> Result<(), MigrationError> {
    let mut errors = Vec::new();

    if source.email.is_empty() {
        errors.push("SOURCE_EMAIL is required".to_string());
    }
    if source.password.is_empty() {
        errors.push("SOURCE_PASSWORD is required".to_string());
    }
    if source.host.is_empty() {
        errors.push("SOURCE_HOST is required".to_string());
    }
    if dest.email.is_empty() {
        errors.push("DEST_EMAIL is required".to_string());
    }
    if dest.password.is_empty() {
        errors.push("DEST_PASSWORD is required".to_string());
    }
    if dest.host.is_empty() {
        errors.push("DEST_HOST is required".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(MigrationError::Configuration(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value).to_string())
        }
    }

    fn required_source() -> Vec<(&'static str, &'static str)> {
        vec![
            ("SOURCE_EMAIL", "old@example.com"),
            ("SOURCE_PASSWORD", "hunter2"),
            ("SOURCE_HOST", "mail.example.com"),
        ]
    }

    fn required_dest() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DEST_EMAIL", "new@example.net"),
            ("DEST_PASSWORD", "hunter3"),
            ("DEST_HOST", "smtp.example.net"),
        ]
    }

    #[test]
    fn source_defaults_apply() {
        let config = source_from_lookup(lookup(&required_source()));
        assert_eq!(config.email, "old@example.com");
        assert_eq!(config.port, 995);
        assert_eq!(config.protocol, SourceProtocol::Pop3);
        assert_eq!(config.mailbox, None);
        assert!(!config.accept_invalid_certs);
    }

    #[test]
    fn destination_defaults_apply() {
        let config = destination_from_lookup(lookup(&required_dest()));
        assert_eq!(config.port, 587);
        assert!(config.use_tls);
        assert!(!config.accept_invalid_certs);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let mut pairs = required_source();
        pairs.push(("SOURCE_PORT", "993"));
        pairs.push(("SOURCE_PROTOCOL", "IMAP"));
        pairs.push(("SOURCE_MAILBOX", "Archive"));
        pairs.push(("SOURCE_ACCEPT_INVALID_CERTS", "true"));
        let config = source_from_lookup(lookup(&pairs));
        assert_eq!(config.port, 993);
        assert_eq!(config.protocol, SourceProtocol::Imap);
        assert_eq!(config.mailbox.as_deref(), Some("Archive"));
        assert!(config.accept_invalid_certs);
    }

    #[test]
    fn unknown_protocol_falls_back_to_pop3() {
        let mut pairs = required_source();
        pairs.push(("SOURCE_PROTOCOL", "smtp"));
        let config = source_from_lookup(lookup(&pairs));
        assert_eq!(config.protocol, SourceProtocol::Pop3);
    }

    #[test]
    fn unparseable_port_falls_back_to_default() {
        let mut pairs = required_source();
        pairs.push(("SOURCE_PORT", "banana"));
        let config = source_from_lookup(lookup(&pairs));
        assert_eq!(config.port, 995);
    }

    #[test]
    fn empty_mailbox_counts_as_unset() {
        let mut pairs = required_source();
        pairs.push(("SOURCE_MAILBOX", ""));
        let config = source_from_lookup(lookup(&pairs));
        assert_eq!(config.mailbox, None);
    }

    #[test]
    fn only_literal_false_disables_tls() {
        for (raw, expected) in [("false", false), ("FALSE", true), ("0", true), ("no", true)] {
            let mut pairs = required_dest();
            pairs.push(("DEST_USE_TLS", raw));
            let config = destination_from_lookup(lookup(&pairs));
            assert_eq!(config.use_tls, expected, "DEST_USE_TLS={}", raw);
        }
    }

    #[test]
    fn complete_config_validates() {
        let source = source_from_lookup(lookup(&required_source()));
        let dest = destination_from_lookup(lookup(&required_dest()));
        assert!(validate_config(&source, &dest).is_ok());
    }

    fn validation_errors(source: &SourceConfig, dest: &DestinationConfig) -> Vec<String> {
        match validate_config(source, dest) {
            Err(MigrationError::Configuration(errors)) => errors,
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn every_missing_field_is_reported_at_once() {
        let source = source_from_lookup(lookup(&[]));
        let dest = destination_from_lookup(lookup(&[]));
        let errors = validation_errors(&source, &dest);
        assert_eq!(
            errors,
            vec![
                "SOURCE_EMAIL is required",
                "SOURCE_PASSWORD is required",
                "SOURCE_HOST is required",
                "DEST_EMAIL is required",
                "DEST_PASSWORD is required",
                "DEST_HOST is required",
            ]
        );
    }

    #[test]
    fn one_missing_field_yields_one_line() {
        let pairs: Vec<_> = required_source()
            .into_iter()
            .filter(|(name, _)| *name != "SOURCE_PASSWORD")
            .collect();
        let source = source_from_lookup(lookup(&pairs));
        let dest = destination_from_lookup(lookup(&required_dest()));
        let errors = validation_errors(&source, &dest);
        assert_eq!(errors, vec!["SOURCE_PASSWORD is required"]);
    }

    #[test]
    fn empty_string_counts_as_missing() {
        let mut pairs = required_dest();
        pairs[0] = ("DEST_EMAIL", "");
        let source = source_from_lookup(lookup(&required_source()));
        let dest = destination_from_lookup(lookup(&pairs));
        let errors = validation_errors(&source, &dest);
        assert_eq!(errors, vec!["DEST_EMAIL is required"]);
    }

    #[test]
    fn configuration_error_displays_every_line() {
        let source = source_from_lookup(lookup(&[]));
        let dest = destination_from_lookup(lookup(&required_dest()));
        let err = validate_config(&source, &dest).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.starts_with("configuration validation failed:\n"));
        assert_eq!(rendered.matches("is required").count(), 3);
    }
}
