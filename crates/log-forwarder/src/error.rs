// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced while configuring or starting the log forwarder.
///
/// Everything here is fatal at start-up; failures after start (write errors,
/// missed heartbeats, full channels) are handled inside the workers and never
/// propagate to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("invalid protocol {0:?}, expected tcp or udp")]
    InvalidProtocol(String),

    #[error("unable to parse {url:?}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("missing host or port in {0:?}")]
    MissingHostPort(String),

    #[error("[log forwarder] unable to connect to {url:?}: {cause}")]
    Dial { url: String, cause: String },

    #[error("[ws forwarder] unable to connect to {url:?}: {cause}")]
    WsDial { url: String, cause: String },

    #[error("unable to bind to {url:?}: {source}")]
    Bind {
        url: String,
        source: std::io::Error,
    },

    #[error("unknown log backend {0:?}, expected tsuru or syslog")]
    UnknownBackend(String),

    #[error("unable to create container runtime client: {0}")]
    RuntimeClient(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_protocol_display() {
        let err = ForwarderError::InvalidProtocol("xudp".to_string());
        assert_eq!(err.to_string(), "invalid protocol \"xudp\", expected tcp or udp");
    }

    #[test]
    fn test_dial_display() {
        let err = ForwarderError::Dial {
            url: "xudp://127.0.0.1:1234".to_string(),
            cause: "invalid protocol \"xudp\", expected tcp or udp".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "[log forwarder] unable to connect to \"xudp://127.0.0.1:1234\": invalid protocol \"xudp\", expected tcp or udp"
        );
    }
}
