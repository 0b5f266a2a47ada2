// Mailtrace: Reconstruction of Mail Flows Across SMTP Relays from Syslog Data
// Copyright (C) 2024-2025 The mailtrace developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Configuration model, loaded from YAML with environment overrides.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::parser::SyslogFormat;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("missing required config section {0:?}")]
    MissingSection(&'static str),
    #[error("invalid value {value:?} for config key {key:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("cannot initialize backend: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Ssh,
    Opensearch,
}

/// Per-host log layout for the shell aggregator. The entry named `default`
/// applies to hosts without their own entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    #[serde(default = "default_log_files")]
    pub log_files: Vec<String>,
    #[serde(default = "default_format")]
    pub format: SyslogFormat,
    #[serde(default = "default_time_format")]
    pub time_format: String,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_files: default_log_files(),
            format: default_format(),
            time_format: default_time_format(),
            time_zone: default_time_zone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SshConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    #[serde(default)]
    pub sudo: bool,
    pub sudo_pass: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// OpenSSH client config supplying HostName/User/Port/IdentityFile
    /// defaults for hosts not covered by the fields above.
    pub ssh_config_file: Option<String>,
    #[serde(default)]
    pub host_config: HashMap<String, HostConfig>,
    /// Optional map from logical host name to the address to connect to.
    #[serde(default)]
    pub hosts: HashMap<String, String>,
}

/// Field names inside the search index documents.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Mapping {
    #[serde(default = "default_facility_field")]
    pub facility: String,
    #[serde(default = "default_hostname_field")]
    pub hostname: String,
    #[serde(default = "default_message_field")]
    pub message: String,
    #[serde(default = "default_timestamp_field")]
    pub timestamp: String,
    #[serde(default = "default_service_field")]
    pub service: String,
}

impl Default for Mapping {
    fn default() -> Self {
        Self {
            facility: default_facility_field(),
            hostname: default_hostname_field(),
            message: default_message_field(),
            timestamp: default_timestamp_field(),
            service: default_service_field(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenSearchConfig {
    pub host: String,
    #[serde(default = "default_opensearch_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub index: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub verify_certs: bool,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub mapping: Mapping,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TracingConfig {
    #[serde(default = "default_sleep_seconds")]
    pub sleep_seconds: u64,
    #[serde(default = "default_hold_rounds")]
    pub hold_rounds: u32,
    #[serde(default = "default_go_back_seconds")]
    pub go_back_seconds: u64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            sleep_seconds: default_sleep_seconds(),
            hold_rounds: default_hold_rounds(),
            go_back_seconds: default_go_back_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub method: Method,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub ssh_config: Option<SshConfig>,
    pub opensearch_config: Option<OpenSearchConfig>,
    /// Cluster alias -> physical member hosts.
    #[serde(default)]
    pub clusters: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub tracing: TracingConfig,
    /// DNS suffix appended to bare hostnames.
    pub domain: Option<String>,
    /// Relay tags that mark final delivery besides `local`.
    #[serde(default = "default_final_relays")]
    pub final_relays: Vec<String>,
    #[serde(default = "default_max_parallel_queries")]
    pub max_parallel_queries: usize,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables win over file contents.
    pub fn apply_env_overrides(&mut self) {
        if let (Some(ssh), Ok(password)) =
            (self.ssh_config.as_mut(), std::env::var("MAILTRACE_SSH_PASSWORD"))
        {
            ssh.password = Some(password);
        }
        if let (Some(ssh), Ok(password)) =
            (self.ssh_config.as_mut(), std::env::var("MAILTRACE_SUDO_PASSWORD"))
        {
            ssh.sudo_pass = Some(password);
        }
        if let (Some(os), Ok(password)) = (
            self.opensearch_config.as_mut(),
            std::env::var("MAILTRACE_OPENSEARCH_PASSWORD"),
        ) {
            os.password = Some(password);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.method {
            Method::Ssh if self.ssh_config.is_none() => {
                return Err(ConfigError::MissingSection("ssh_config"))
            }
            Method::Opensearch if self.opensearch_config.is_none() => {
                return Err(ConfigError::MissingSection("opensearch_config"))
            }
            _ => {}
        }
        self.log_level()?;
        if self.max_parallel_queries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_parallel_queries",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn log_level(&self) -> Result<log::LevelFilter, ConfigError> {
        Ok(match self.log_level.as_str() {
            "DEBUG" => log::LevelFilter::Debug,
            "INFO" => log::LevelFilter::Info,
            "WARNING" => log::LevelFilter::Warn,
            // the log crate has no level above error
            "ERROR" | "CRITICAL" => log::LevelFilter::Error,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "log_level",
                    value: other.to_string(),
                })
            }
        })
    }

    /// Physical members of a cluster alias, or the host itself when the name
    /// is not an alias.
    pub fn cluster_members(&self, host: &str) -> Vec<String> {
        match self.clusters.get(host) {
            Some(members) => members.clone(),
            None => vec![host.to_string()],
        }
    }

    /// Every physical host named by the clusters configuration, first
    /// mention wins, duplicates removed.
    pub fn all_cluster_hosts(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        for members in self.clusters.values() {
            for member in members {
                if !hosts.contains(member) {
                    hosts.push(member.clone());
                }
            }
        }
        hosts
    }

    /// Log layout for one host, falling back to the `default` entry.
    pub fn host_config(&self, host: &str) -> HostConfig {
        let Some(ssh) = self.ssh_config.as_ref() else {
            return HostConfig::default();
        };
        ssh.host_config
            .get(host)
            .or_else(|| ssh.host_config.get("default"))
            .cloned()
            .unwrap_or_default()
    }

    pub fn qualify(&self, host: &str) -> String {
        crate::util::qualify(host, self.domain.as_deref())
    }
}

fn default_log_files() -> Vec<String> {
    vec!["/var/log/mail.log".to_string()]
}

fn default_format() -> SyslogFormat {
    SyslogFormat::Syslog
}

fn default_time_format() -> String {
    "%b %d %H:%M:%S".to_string()
}

fn default_time_zone() -> String {
    "+00:00".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_opensearch_port() -> u16 {
    9200
}

fn default_facility_field() -> String {
    "facility".to_string()
}

fn default_hostname_field() -> String {
    "hostname".to_string()
}

fn default_message_field() -> String {
    "message".to_string()
}

fn default_timestamp_field() -> String {
    "@timestamp".to_string()
}

fn default_service_field() -> String {
    "programname".to_string()
}

fn default_sleep_seconds() -> u64 {
    60
}

fn default_hold_rounds() -> u32 {
    2
}

fn default_go_back_seconds() -> u64 {
    10
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_final_relays() -> Vec<String> {
    vec!["local".to_string()]
}

fn default_max_parallel_queries() -> usize {
    8
}

#[cfg(test)]
mod test_config {
    use super::*;

    const MINIMAL: &str = r#"
method: ssh
ssh_config:
  username: loguser
  host_config:
    default:
      log_files: [/var/log/mail.log, /var/log/mail.log.1]
    mx1.example.com:
      format: rfc5424
clusters:
  mx-us: [mx1.example.com, mx2.example.com]
  mx-eu: [mx3.example.com]
domain: example.com
"#;

    #[test]
    fn minimal_config_with_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.method, Method::Ssh);
        assert_eq!(config.log_level().unwrap(), log::LevelFilter::Info);
        assert_eq!(config.tracing.sleep_seconds, 60);
        assert_eq!(config.tracing.hold_rounds, 2);
        assert_eq!(config.tracing.go_back_seconds, 10);
        assert_eq!(config.max_parallel_queries, 8);
        assert_eq!(config.final_relays, vec!["local".to_string()]);
    }

    #[test]
    fn host_config_fallback() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(config.host_config("mx2.example.com").log_files.len(), 2);
        assert_eq!(
            config.host_config("mx1.example.com").format,
            SyslogFormat::Rfc5424
        );
    }

    #[test]
    fn cluster_resolution() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(
            config.cluster_members("mx-us"),
            vec!["mx1.example.com", "mx2.example.com"]
        );
        assert_eq!(config.cluster_members("mx9"), vec!["mx9"]);
        assert_eq!(config.all_cluster_hosts().len(), 3);
        assert_eq!(config.qualify("mx9"), "mx9.example.com");
    }

    #[test]
    fn method_requires_its_section() {
        let config: Config = serde_yaml::from_str("method: opensearch\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingSection("opensearch_config"))
        ));
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.log_level = "LOUD".to_string();
        assert!(config.validate().is_err());
    }
}
