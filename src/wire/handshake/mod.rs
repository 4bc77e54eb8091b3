use std::fmt;
use std::fs;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const PROTOCOL_VERSION: i64 = 2;
pub const GREETING_PREFIX: &str = "HI ";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerGreeting {
    #[serde(rename = "v")]
    pub version: i64,
    #[serde(rename = "s", default)]
    pub salt: Option<String>,
    #[serde(rename = "i", default)]
    pub iterations: Option<u32>,
}

impl ServerGreeting {
    pub fn requires_password(&self) -> bool {
        self.salt.as_deref().is_some_and(|salt| !salt.is_empty())
    }
}

/// Payload of the `HELLO` command.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientData {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wid: Option<String>,
    pub pid: u32,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwdhash: Option<String>,
    pub v: i64,
}

#[derive(Debug)]
pub enum HandshakeError {
    MissingGreeting { line: String },
    InvalidGreeting(serde_json::Error),
    PasswordRequired,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingGreeting { line } => write!(f, "expected HI greeting, got '{line}'"),
            Self::InvalidGreeting(source) => write!(f, "invalid HI greeting payload: {source}"),
            Self::PasswordRequired => {
                write!(f, "broker requires a password but none is configured")
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

pub fn parse_greeting(line: &str) -> Result<ServerGreeting, HandshakeError> {
    let Some(payload) = line.strip_prefix(GREETING_PREFIX) else {
        return Err(HandshakeError::MissingGreeting {
            line: line.to_owned(),
        });
    };

    serde_json::from_str(payload.trim()).map_err(HandshakeError::InvalidGreeting)
}

/// `hex(sha256^iterations(password + salt))`, iterations below 1 count as 1.
pub fn hash_password(password: &str, salt: &str, iterations: u32) -> String {
    let mut digest = Sha256::digest(format!("{password}{salt}").as_bytes());
    for _ in 1..iterations.max(1) {
        digest = Sha256::digest(digest);
    }
    hex::encode(digest)
}

pub fn build_client_data(
    greeting: &ServerGreeting,
    password: Option<&str>,
    wid: Option<&str>,
    labels: &[String],
) -> Result<ClientData, HandshakeError> {
    let pwdhash = match (greeting.salt.as_deref(), greeting.requires_password()) {
        (Some(salt), true) => {
            let password = password
                .filter(|value| !value.is_empty())
                .ok_or(HandshakeError::PasswordRequired)?;
            Some(hash_password(password, salt, greeting.iterations.unwrap_or(1)))
        }
        _ => None,
    };

    Ok(ClientData {
        hostname: local_hostname(),
        wid: wid.filter(|value| !value.is_empty()).map(str::to_owned),
        pid: std::process::id(),
        labels: labels.to_vec(),
        pwdhash,
        v: PROTOCOL_VERSION,
    })
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

#[cfg(test)]
mod tests {
    use super::{
        build_client_data, hash_password, parse_greeting, HandshakeError, ServerGreeting,
        PROTOCOL_VERSION,
    };

    #[test]
    fn parses_greeting_with_and_without_salt() {
        let open = parse_greeting(r#"HI {"v":2}"#).expect("plain greeting should parse");
        assert_eq!(open.version, 2);
        assert!(!open.requires_password());

        let secured =
            parse_greeting(r#"HI {"v":2,"s":"123456789abc","i":1735}"#).expect("salted greeting");
        assert_eq!(secured.salt.as_deref(), Some("123456789abc"));
        assert_eq!(secured.iterations, Some(1735));
        assert!(secured.requires_password());
    }

    #[test]
    fn rejects_non_greeting_lines() {
        assert!(matches!(
            parse_greeting("OK"),
            Err(HandshakeError::MissingGreeting { .. })
        ));
        assert!(matches!(
            parse_greeting("HI {not json"),
            Err(HandshakeError::InvalidGreeting(_))
        ));
    }

    #[test]
    fn single_iteration_hash_matches_plain_sha256() {
        assert_eq!(
            hash_password("", "", 1),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(hash_password("pwd", "salt", 0), hash_password("pwd", "salt", 1));
        assert_ne!(hash_password("pwd", "salt", 2), hash_password("pwd", "salt", 1));
    }

    #[test]
    fn client_data_carries_hash_only_when_broker_demands_it() {
        let labels = vec!["rust".to_owned()];
        let open = ServerGreeting {
            version: 2,
            salt: None,
            iterations: None,
        };
        let data = build_client_data(&open, Some("secret"), Some("wid-1"), &labels)
            .expect("open broker should accept");
        assert!(data.pwdhash.is_none());
        assert_eq!(data.wid.as_deref(), Some("wid-1"));
        assert_eq!(data.v, PROTOCOL_VERSION);

        let secured = ServerGreeting {
            version: 2,
            salt: Some("abc".to_owned()),
            iterations: Some(3),
        };
        let data = build_client_data(&secured, Some("secret"), None, &labels)
            .expect("password is configured");
        assert_eq!(data.pwdhash, Some(hash_password("secret", "abc", 3)));
        assert!(data.wid.is_none());

        let missing = build_client_data(&secured, None, None, &labels);
        assert!(matches!(missing, Err(HandshakeError::PasswordRequired)));
    }
}
