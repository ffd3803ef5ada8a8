// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::ForwarderError;
use crate::forwarder::MessageHandler;

// Large enough for any datagram a runtime will emit; oversized payloads are
// truncated by the socket layer.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proto {
    Tcp,
    Udp,
}

/// Validated bind address. Splitting validation from binding lets start-up
/// reject a bad scheme before any socket or downstream dial exists.
#[derive(Debug, Clone)]
pub(crate) struct BindSpec {
    proto: Proto,
    addr: String,
}

impl BindSpec {
    pub(crate) fn parse(address: &str) -> Result<Self, ForwarderError> {
        let url = Url::parse(address).map_err(|source| ForwarderError::InvalidUrl {
            url: address.to_string(),
            source,
        })?;
        let proto = match url.scheme() {
            "tcp" => Proto::Tcp,
            "udp" => Proto::Udp,
            other => return Err(ForwarderError::InvalidProtocol(other.to_string())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| ForwarderError::MissingHostPort(address.to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| ForwarderError::MissingHostPort(address.to_string()))?;
        Ok(Self {
            proto,
            addr: format!("{host}:{port}"),
        })
    }

    pub(crate) async fn bind(&self) -> Result<SyslogListener, ForwarderError> {
        let bind_error = |source| ForwarderError::Bind {
            url: self.addr.clone(),
            source,
        };
        match self.proto {
            Proto::Udp => {
                let socket = UdpSocket::bind(&self.addr).await.map_err(bind_error)?;
                Ok(SyslogListener::Udp(socket))
            }
            Proto::Tcp => {
                let listener = TcpListener::bind(&self.addr).await.map_err(bind_error)?;
                Ok(SyslogListener::Tcp(listener))
            }
        }
    }
}

/// Ingress socket feeding the shared message handler.
///
/// The bind is a process-lifetime resource: there is no retry and no
/// reconnect, and ingest errors never push back on producers.
#[derive(Debug)]
pub(crate) enum SyslogListener {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

impl SyslogListener {
    pub(crate) fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Self::Udp(socket) => socket.local_addr(),
            Self::Tcp(listener) => listener.local_addr(),
        }
    }

    pub(crate) async fn run(self, handler: Arc<MessageHandler>, cancel: CancellationToken) {
        match self {
            Self::Udp(socket) => run_udp(socket, handler, cancel).await,
            Self::Tcp(listener) => run_tcp(listener, handler, cancel).await,
        }
    }
}

async fn run_udp(socket: UdpSocket, handler: Arc<MessageHandler>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _peer)) => handler.handle_line(&buf[..len]).await,
                Err(err) => warn!("syslog listener read error: {err}"),
            },
            () = cancel.cancelled() => break,
        }
    }
}

async fn run_tcp(listener: TcpListener, handler: Arc<MessageHandler>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("syslog connection from {peer}");
                    tokio::spawn(run_tcp_conn(stream, Arc::clone(&handler), cancel.clone()));
                }
                Err(err) => warn!("syslog listener accept error: {err}"),
            },
            () = cancel.cancelled() => break,
        }
    }
}

async fn run_tcp_conn(stream: TcpStream, handler: Arc<MessageHandler>, cancel: CancellationToken) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(1024);
    loop {
        line.clear();
        tokio::select! {
            read = reader.read_until(b'\n', &mut line) => match read {
                Ok(0) => break,
                Ok(_) => handler.handle_line(&line).await,
                Err(err) => {
                    debug!("syslog connection read error: {err}");
                    break;
                }
            },
            () = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_udp_and_tcp() {
        let spec = BindSpec::parse("udp://0.0.0.0:59317").expect("udp");
        assert_eq!(spec.proto, Proto::Udp);
        assert_eq!(spec.addr, "0.0.0.0:59317");

        let spec = BindSpec::parse("tcp://127.0.0.1:1514").expect("tcp");
        assert_eq!(spec.proto, Proto::Tcp);
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        let err = BindSpec::parse("xudp://0.0.0.0:59317").expect_err("scheme");
        assert_eq!(err.to_string(), "invalid protocol \"xudp\", expected tcp or udp");
    }

    #[test]
    fn test_parse_requires_port() {
        let err = BindSpec::parse("udp://0.0.0.0").expect_err("port");
        assert!(err.to_string().contains("missing host or port"));
    }
}
