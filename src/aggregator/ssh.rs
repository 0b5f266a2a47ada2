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
//! Shell aggregator: reads mail logs over SSH.
//!
//! One `query` opens a single session, reads the configured log files
//! sequentially and closes the session before returning. Keyword filtering
//! happens host-side via `grep -F`; parsing happens client-side with the
//! per-host parser configuration. ssh2 is synchronous, so the whole query
//! runs on the blocking pool.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;

use super::{finalize, Aggregator, AggregatorError};
use crate::config::{Config, ConfigError, HostConfig, SshConfig};
use crate::parser::LineParser;
use crate::records::LogRecord;
use crate::util::{parse_offset, TimeWindow};

pub struct ShellAggregator {
    ssh: SshConfig,
    domain: Option<String>,
}

impl ShellAggregator {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let ssh = config
            .ssh_config
            .clone()
            .ok_or(ConfigError::MissingSection("ssh_config"))?;
        Ok(Self { ssh, domain: config.domain.clone() })
    }

    fn host_config(&self, host: &str) -> HostConfig {
        self.ssh
            .host_config
            .get(host)
            .or_else(|| self.ssh.host_config.get("default"))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Aggregator for ShellAggregator {
    async fn query(
        &self,
        host: &str,
        keywords: &[String],
        window: TimeWindow,
    ) -> Result<Vec<LogRecord>, AggregatorError> {
        let task = QueryTask {
            host: crate::util::qualify(host, self.domain.as_deref()),
            host_config: self.host_config(host),
            ssh: self.ssh.clone(),
            keywords: keywords.to_vec(),
            window,
        };
        tokio::task::spawn_blocking(move || task.run())
            .await
            .map_err(|e| AggregatorError::Backend {
                host: host.to_string(),
                reason: format!("query task panicked: {e}"),
            })?
    }
}

/// Everything one blocking query needs, owned.
struct QueryTask {
    host: String,
    host_config: HostConfig,
    ssh: SshConfig,
    keywords: Vec<String>,
    window: TimeWindow,
}

impl QueryTask {
    fn run(self) -> Result<Vec<LogRecord>, AggregatorError> {
        let connect_err = |reason: String| AggregatorError::Connect {
            host: self.host.clone(),
            reason,
        };

        let file_entry = self
            .ssh
            .ssh_config_file
            .as_deref()
            .map(|path| SshFileEntry::resolve(Path::new(path), &self.host))
            .unwrap_or_default();

        let address = self
            .ssh
            .hosts
            .get(&self.host)
            .cloned()
            .or(file_entry.host_name)
            .unwrap_or_else(|| self.host.clone());
        let port = file_entry.port.unwrap_or(22);
        let username = self
            .ssh
            .username
            .clone()
            .or(file_entry.user)
            .ok_or_else(|| AggregatorError::Auth {
                host: self.host.clone(),
                reason: "no username configured".to_string(),
            })?;
        let private_key = self.ssh.private_key.clone().or(file_entry.identity_file);

        let timeout = Duration::from_secs(self.ssh.timeout);
        let addr = (address.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err(format!("{address} does not resolve")))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Session::new().map_err(|e| connect_err(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout((self.ssh.timeout * 1000) as u32);
        session.handshake().map_err(|e| connect_err(e.to_string()))?;

        self.authenticate(&session, &username, private_key.as_deref())?;

        let tz = parse_offset(&self.host_config.time_zone).map_err(|e| {
            AggregatorError::Backend { host: self.host.clone(), reason: e.to_string() }
        })?;
        let parser = LineParser::new(
            self.host_config.format,
            self.host_config.time_format.clone(),
            tz,
            self.window.end,
        );

        let mut records = Vec::new();
        let mut dropped = 0usize;
        for file in &self.host_config.log_files {
            let output = self.read_file(&session, file)?;
            for line in output.lines() {
                match parser.parse(line) {
                    Ok(mut record) => {
                        if record.host.is_empty() {
                            record.host = self.host.clone();
                        }
                        records.push(record);
                    }
                    Err(_) => dropped += 1,
                }
            }
        }
        if dropped > 0 {
            log::debug!("[{}] dropped {dropped} malformed log lines", self.host);
        }

        // session and its TCP stream close on drop, also on the error paths
        Ok(finalize(records, &self.keywords, self.window))
    }

    fn authenticate(
        &self,
        session: &Session,
        username: &str,
        private_key: Option<&str>,
    ) -> Result<(), AggregatorError> {
        let auth_err = |reason: String| AggregatorError::Auth {
            host: self.host.clone(),
            reason,
        };

        if let Some(password) = self.ssh.password.as_deref() {
            session
                .userauth_password(username, password)
                .map_err(|e| auth_err(e.to_string()))?;
        } else if let Some(key) = private_key {
            session
                .userauth_pubkey_file(username, None, Path::new(key), None)
                .map_err(|e| auth_err(e.to_string()))?;
        } else {
            return Err(auth_err("no password or private key configured".to_string()));
        }

        if !session.authenticated() {
            return Err(auth_err("authentication incomplete".to_string()));
        }
        Ok(())
    }

    /// Run the read command for one log file and collect its stdout.
    fn read_file(&self, session: &Session, file: &str) -> Result<String, AggregatorError> {
        let backend_err = |reason: String| AggregatorError::Backend {
            host: self.host.clone(),
            reason,
        };

        let command = read_command(file, &self.keywords, self.ssh.sudo);
        let mut channel = session
            .channel_session()
            .map_err(|e| backend_err(e.to_string()))?;
        channel.exec(&command).map_err(|e| backend_err(e.to_string()))?;

        if self.ssh.sudo {
            if let Some(sudo_pass) = self.ssh.sudo_pass.as_deref() {
                channel
                    .write_all(format!("{sudo_pass}\n").as_bytes())
                    .map_err(|e| backend_err(e.to_string()))?;
            }
            let _ = channel.send_eof();
        }

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| backend_err(e.to_string()))?;
        let mut stderr = String::new();
        let _ = channel.stderr().read_to_string(&mut stderr);
        channel.wait_close().map_err(|e| backend_err(e.to_string()))?;

        // grep exits 1 on zero matches, anything above is a real failure
        let status = channel.exit_status().map_err(|e| backend_err(e.to_string()))?;
        if status > 1 {
            return Err(AggregatorError::MissingSource {
                host: self.host.clone(),
                reason: format!("{file}: exit {status}: {}", stderr.trim()),
            });
        }
        Ok(stdout)
    }
}

/// Build the host-side read command. Filtering is a plain substring match,
/// one `-e` per keyword; an empty keyword list reads the whole file.
fn read_command(file: &str, keywords: &[String], sudo: bool) -> String {
    let mut command = String::new();
    if sudo {
        command.push_str("sudo -S -p '' ");
    }
    if keywords.is_empty() {
        command.push_str("cat -- ");
        command.push_str(&shell_quote(file));
    } else {
        command.push_str("grep -F -h");
        for keyword in keywords {
            command.push_str(" -e ");
            command.push_str(&shell_quote(keyword));
        }
        command.push_str(" -- ");
        command.push_str(&shell_quote(file));
    }
    command
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The subset of an OpenSSH client config honoured when resolving a host:
/// `HostName`, `User`, `Port` and `IdentityFile`.
#[derive(Debug, Default, PartialEq, Eq)]
struct SshFileEntry {
    host_name: Option<String>,
    user: Option<String>,
    port: Option<u16>,
    identity_file: Option<String>,
}

impl SshFileEntry {
    fn resolve(path: &Path, host: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_str(&contents, host),
            Err(e) => {
                log::debug!("cannot read ssh config {}: {e}", path.display());
                Self::default()
            }
        }
    }

    fn from_str(contents: &str, host: &str) -> Self {
        let mut entry = Self::default();
        let mut in_scope = false;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((keyword, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            let value = value.trim();
            if keyword.eq_ignore_ascii_case("Host") {
                in_scope = value.split_whitespace().any(|p| p == host || p == "*");
                continue;
            }
            if !in_scope {
                continue;
            }
            match keyword.to_ascii_lowercase().as_str() {
                "hostname" => entry.host_name.get_or_insert_with(|| value.to_string()),
                "user" => entry.user.get_or_insert_with(|| value.to_string()),
                "identityfile" => {
                    entry.identity_file.get_or_insert_with(|| expand_tilde(value))
                }
                "port" => {
                    if entry.port.is_none() {
                        entry.port = value.parse().ok();
                    }
                    continue;
                }
                _ => continue,
            };
        }
        entry
    }
}

fn expand_tilde(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest).display().to_string(),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod test_ssh {
    use super::*;

    #[test]
    fn read_commands() {
        assert_eq!(
            read_command("/var/log/mail.log", &[], false),
            "cat -- '/var/log/mail.log'"
        );
        assert_eq!(
            read_command("/var/log/mail.log", &["ABC123".to_string()], false),
            "grep -F -h -e 'ABC123' -- '/var/log/mail.log'"
        );
        assert_eq!(
            read_command(
                "/var/log/mail.log",
                &["a@b".to_string(), "x'y".to_string()],
                true
            ),
            r"sudo -S -p '' grep -F -h -e 'a@b' -e 'x'\''y' -- '/var/log/mail.log'"
        );
    }

    #[test]
    fn ssh_file_resolution() {
        let contents = "\
# fleet access
Host mx1.example.com mx2.example.com
    HostName 192.0.2.10
    User logreader
    Port 2222

Host *
    User fallback
    IdentityFile /etc/mailtrace/id_ed25519
";
        let entry = SshFileEntry::from_str(contents, "mx1.example.com");
        assert_eq!(entry.host_name.as_deref(), Some("192.0.2.10"));
        assert_eq!(entry.user.as_deref(), Some("logreader"));
        assert_eq!(entry.port, Some(2222));
        assert_eq!(
            entry.identity_file.as_deref(),
            Some("/etc/mailtrace/id_ed25519")
        );

        let other = SshFileEntry::from_str(contents, "relay.example.com");
        assert_eq!(other.user.as_deref(), Some("fallback"));
        assert_eq!(other.host_name, None);
    }
}
