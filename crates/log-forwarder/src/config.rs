// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::error::ForwarderError;

pub const DEFAULT_BUFFER_SIZE: usize = 1_000_000;
pub const DEFAULT_WS_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MTU_INTERFACE: &str = "eth0";
pub const DEFAULT_LOG_BACKENDS: &str = "tsuru,syslog";

/// Configuration for the log forwarder supervisor.
///
/// Usually built from the process environment with
/// [`LogForwarderConfig::from_env`]; tests fill the fields directly.
#[derive(Debug, Clone)]
pub struct LogForwarderConfig {
    /// Listen URL, `udp://host:port` or `tcp://host:port`.
    pub bind_address: String,
    /// Downstream syslog sink URLs, same schemes as the bind address.
    pub forward_addresses: Vec<String>,
    /// tsuru API endpoint; empty disables the websocket sink.
    pub tsuru_endpoint: String,
    /// Token sent as `Authorization: bearer <token>` on the websocket
    /// handshake.
    pub tsuru_token: String,
    /// Container runtime endpoint used to resolve container identity.
    pub docker_endpoint: String,
    /// IANA timezone name used only when rendering syslog timestamps.
    /// `None` renders in the process-local zone.
    pub syslog_timezone: Option<String>,
    /// Interface whose MTU bounds UDP syslog datagrams.
    pub mtu_interface: String,
    /// Capacity of each sink channel.
    pub buffer_size: usize,
    /// Websocket heartbeat period.
    pub ws_ping_interval: Duration,
    /// Bytes inserted between the syslog header and the content.
    pub syslog_extra_start: Option<String>,
    /// Bytes appended after the content.
    pub syslog_extra_end: Option<String>,
    /// Enabled backends, subset of `tsuru` and `syslog`.
    pub log_backends: Vec<String>,
    /// Extra PEM root certificate trusted for `wss` endpoints.
    pub tls_root_ca_pem: Option<Vec<u8>>,
}

impl Default for LogForwarderConfig {
    fn default() -> Self {
        Self {
            bind_address: String::new(),
            forward_addresses: Vec::new(),
            tsuru_endpoint: String::new(),
            tsuru_token: String::new(),
            docker_endpoint: String::new(),
            syslog_timezone: None,
            mtu_interface: DEFAULT_MTU_INTERFACE.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            ws_ping_interval: DEFAULT_WS_PING_INTERVAL,
            syslog_extra_start: None,
            syslog_extra_end: None,
            log_backends: split_list(DEFAULT_LOG_BACKENDS),
            tls_root_ca_pem: None,
        }
    }
}

impl LogForwarderConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        let extra_start = string_env_or_default("", &["LOG_SYSLOG_MESSAGE_EXTRA_START"]);
        let extra_end = string_env_or_default("", &["LOG_SYSLOG_MESSAGE_EXTRA_END"]);
        let timezone =
            string_env_or_default("", &["LOG_SYSLOG_TIMEZONE", "SYSLOG_TIMEZONE"]);
        Self {
            bind_address: string_env_or_default("", &["SYSLOG_LISTEN_ADDRESS"]),
            forward_addresses: list_env_or_default(
                "",
                &["LOG_SYSLOG_FORWARD_ADDRESSES", "SYSLOG_FORWARD_ADDRESSES"],
            ),
            tsuru_endpoint: string_env_or_default("", &["TSURU_ENDPOINT"]),
            tsuru_token: string_env_or_default("", &["TSURU_TOKEN"]),
            docker_endpoint: string_env_or_default("", &["DOCKER_ENDPOINT"]),
            syslog_timezone: (!timezone.is_empty()).then_some(timezone),
            mtu_interface: string_env_or_default(
                DEFAULT_MTU_INTERFACE,
                &["LOG_SYSLOG_MTU_NETWORK_INTERFACE"],
            ),
            buffer_size: int_env_or_default(
                DEFAULT_BUFFER_SIZE,
                &["LOG_SYSLOG_BUFFER_SIZE", "LOG_BUFFER_SIZE"],
            ),
            ws_ping_interval: seconds_env_or_default(
                DEFAULT_WS_PING_INTERVAL,
                &["LOG_WS_PING_INTERVAL"],
            ),
            syslog_extra_start: (!extra_start.is_empty()).then(|| expand_env(&extra_start)),
            syslog_extra_end: (!extra_end.is_empty()).then(|| expand_env(&extra_end)),
            log_backends: list_env_or_default(DEFAULT_LOG_BACKENDS, &["LOG_BACKENDS"]),
            tls_root_ca_pem: None,
        }
    }

    pub(crate) fn enabled_backends(&self) -> Result<EnabledBackends, ForwarderError> {
        let mut enabled = EnabledBackends::default();
        for name in &self.log_backends {
            match name.trim() {
                "tsuru" => enabled.tsuru = true,
                "syslog" => enabled.syslog = true,
                "" => {}
                other => return Err(ForwarderError::UnknownBackend(other.to_string())),
            }
        }
        Ok(enabled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EnabledBackends {
    pub(crate) tsuru: bool,
    pub(crate) syslog: bool,
}

/// Returns the first non-empty value among `names`. Names after the first
/// are deprecated aliases and reading one warns.
pub(crate) fn string_env_or_default(default: &str, names: &[&str]) -> String {
    for (i, name) in names.iter().enumerate() {
        if let Ok(value) = env::var(name) {
            if !value.is_empty() {
                if i > 0 {
                    warn!(
                        "The environment variable {} is deprecated. Please set {} in the future.",
                        name, names[0]
                    );
                }
                return value;
            }
        }
    }
    default.to_string()
}

pub(crate) fn list_env_or_default(default: &str, names: &[&str]) -> Vec<String> {
    split_list(&string_env_or_default(default, names))
}

pub(crate) fn int_env_or_default(default: usize, names: &[&str]) -> usize {
    let value = string_env_or_default("", names);
    if value.is_empty() {
        return default;
    }
    match value.parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(
                "invalid value for {}. Using the default value of {}",
                names.join(" or "),
                default
            );
            default
        }
    }
}

pub(crate) fn seconds_env_or_default(default: Duration, names: &[&str]) -> Duration {
    let value = string_env_or_default("", names);
    if value.is_empty() {
        return default;
    }
    match value.parse::<f64>() {
        Ok(seconds) if seconds > 0.0 => Duration::from_secs_f64(seconds),
        _ => {
            warn!(
                "invalid value for {}. Using the default value of {:?}",
                names.join(" or "),
                default
            );
            default
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Substitutes `$VAR` and `${VAR}` references with values from the process
/// environment. Unset variables expand to the empty string.
pub(crate) fn expand_env(input: &str) -> String {
    let mut expanded = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(current) = chars.next() {
        if current != '$' {
            expanded.push(current);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if closed {
                    expanded.push_str(&env::var(&name).unwrap_or_default());
                } else {
                    expanded.push_str("${");
                    expanded.push_str(&name);
                }
            }
            Some(&next) if next.is_ascii_alphanumeric() || next == '_' => {
                let mut name = String::new();
                while let Some(&inner) = chars.peek() {
                    if inner.is_ascii_alphanumeric() || inner == '_' {
                        name.push(inner);
                        chars.next();
                    } else {
                        break;
                    }
                }
                expanded.push_str(&env::var(&name).unwrap_or_default());
            }
            _ => expanded.push('$'),
        }
    }
    expanded
}
