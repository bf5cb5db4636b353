use crate::net::access::{self, AccessError, AccessList, Rule};
use serde_derive::Deserialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The configuration record the core consumes, loaded from a JSON file in
/// the shape the options are named here. Unknown keys are refused at init.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub max_clients: usize,
    pub idle_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub ssl: bool,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub chat_max_nickname_len: usize,
    pub chat_max_message_len: usize,
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
    pub allow_file: Option<PathBuf>,
    pub deny_file: Option<PathBuf>,
    pub verbose: bool,
    pub telnet: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_clients: 50,
            idle_timeout_ms: None,
            connect_timeout_ms: None,
            ssl: false,
            ssl_cert: None,
            ssl_key: None,
            chat_max_nickname_len: 32,
            chat_max_message_len: 1024,
            allow_list: Vec::new(),
            deny_list: Vec::new(),
            allow_file: None,
            deny_file: None,
            verbose: false,
            telnet: false,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(String),
    Invalid(String),
    Unsupported(String),
    Access(AccessError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config file i/o error: {}", err),
            ConfigError::Parse(reason) => write!(f, "config parse error: {}", reason),
            ConfigError::Invalid(reason) => write!(f, "invalid configuration: {}", reason),
            ConfigError::Unsupported(reason) => write!(f, "unsupported configuration: {}", reason),
            ConfigError::Access(err) => write!(f, "access rules: {}", err),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<AccessError> for ConfigError {
    fn from(err: AccessError) -> Self {
        ConfigError::Access(err)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let file = fs::File::open(path)?;
        serde_json::from_reader(file).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Init-time sanity: incompatible or unusable combinations are refused
    /// before any socket is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssl {
            return Err(ConfigError::Unsupported(
                "ssl requested but no TLS backend is linked in".to_owned(),
            ));
        }
        if (self.ssl_cert.is_some() || self.ssl_key.is_some()) && !self.ssl {
            return Err(ConfigError::Invalid(
                "ssl_cert/ssl_key are meaningless without ssl".to_owned(),
            ));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1".to_owned()));
        }
        if self.chat_max_nickname_len == 0 || self.chat_max_nickname_len > 256 {
            return Err(ConfigError::Invalid(
                "chat_max_nickname_len must be in 1..=256".to_owned(),
            ));
        }
        if self.chat_max_message_len == 0 {
            return Err(ConfigError::Invalid(
                "chat_max_message_len must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Assembles the access list from inline rules and rule files.
    pub fn build_access_list(&self) -> Result<AccessList, ConfigError> {
        let mut list = AccessList::new();

        for rule in &self.allow_list {
            list.push_allow(parse_rule(rule)?);
        }
        for rule in &self.deny_list {
            list.push_deny(parse_rule(rule)?);
        }
        if let Some(path) = &self.allow_file {
            for rule in access::load_rules(path)? {
                list.push_allow(rule);
            }
        }
        if let Some(path) = &self.deny_file {
            for rule in access::load_rules(path)? {
                list.push_deny(rule);
            }
        }

        Ok(list)
    }
}

fn parse_rule(text: &str) -> Result<Rule, ConfigError> {
    Rule::parse(text).map_err(|reason| {
        ConfigError::Access(AccessError::BadRule {
            rule: text.to_owned(),
            reason,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::IpAddr;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_clients, 50);
        assert_eq!(config.chat_max_nickname_len, 32);
        assert_eq!(config.chat_max_message_len, 1024);
        assert!(!config.ssl);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_json_record() {
        let mut path = std::env::temp_dir();
        path.push(format!("zigcat-config-{}.json", std::process::id()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            br#"{
                "max_clients": 10,
                "idle_timeout_ms": 30000,
                "chat_max_message_len": 512,
                "deny_list": ["10.0.0.0/8"],
                "telnet": true
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.max_clients, 10);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.chat_max_message_len, 512);
        assert!(config.telnet);
        // Unset keys keep their defaults.
        assert_eq!(config.chat_max_nickname_len, 32);

        let list = config.build_access_list().unwrap();
        let denied: IpAddr = "10.1.2.3".parse().unwrap();
        let allowed: IpAddr = "8.8.8.8".parse().unwrap();
        assert_eq!(list.evaluate(denied), crate::net::access::Verdict::Denied);
        assert_eq!(list.evaluate(allowed), crate::net::access::Verdict::Allowed);
    }

    #[test]
    fn test_unknown_keys_refused() {
        let err = serde_json::from_str::<Config>(r#"{"bogus_option": 1}"#).unwrap_err();
        assert!(err.to_string().contains("bogus_option"));
    }

    #[test]
    fn test_ssl_without_backend_refused() {
        let mut config = Config::default();
        config.ssl = true;
        match config.validate().unwrap_err() {
            ConfigError::Unsupported(_) => {}
            other => panic!("Unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_cert_without_ssl_refused() {
        let mut config = Config::default();
        config.ssl_cert = Some(PathBuf::from("cert.pem"));
        match config.validate().unwrap_err() {
            ConfigError::Invalid(_) => {}
            other => panic!("Unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_threshold_validation() {
        let mut config = Config::default();
        config.chat_max_nickname_len = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_clients = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_inline_rule_refused() {
        let mut config = Config::default();
        config.allow_list.push("not-an-ip".to_owned());
        match config.build_access_list().unwrap_err() {
            ConfigError::Access(AccessError::BadRule { .. }) => {}
            other => panic!("Unexpected error {:?}", other),
        }
    }
}
