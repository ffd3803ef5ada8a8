// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use crate::buffer::BufferPool;
use crate::error::ForwarderError;
use crate::syslog::SyslogMessage;

pub(crate) const DEFAULT_MTU: usize = 1500;

// Exaggerated a bit due to possibility of ipv6 extensions, ipsec, etc.
const UDP_HEADER_RESERVE: usize = 100;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const FLUSH_PERIOD: Duration = Duration::from_secs(1);

/// Reads the MTU of a host interface, falling back to [`DEFAULT_MTU`] when
/// the interface cannot be read.
pub(crate) fn interface_mtu(interface: &str) -> usize {
    match read_interface_mtu(interface) {
        Ok(mtu) if mtu > 0 => mtu,
        Ok(_) => DEFAULT_MTU,
        Err(err) => {
            warn!("unable to read mtu from interface, using default {DEFAULT_MTU}: {err}");
            DEFAULT_MTU
        }
    }
}

fn read_interface_mtu(interface: &str) -> io::Result<usize> {
    let contents = std::fs::read_to_string(format!("/sys/class/net/{interface}/mtu"))?;
    contents
        .trim()
        .parse()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Outbound connection of one syslog sink.
#[derive(Debug)]
pub(crate) enum SinkConn {
    /// Write-coalescing stream, flushed on a timer.
    Tcp(BufWriter<TcpStream>),
    /// Connected datagram socket.
    Udp(UdpSocket),
}

/// Worker forwarding rendered syslog lines to one downstream URL.
///
/// Owns its dial state: a failed write drops the connection and the next
/// message redials. UDP payloads larger than the interface MTU are split
/// into header/chunk/trailer fragments before sending.
#[derive(Debug)]
pub(crate) struct SyslogForwarder {
    address: String,
    pool: Arc<BufferPool>,
    mtu: usize,
}

impl SyslogForwarder {
    pub(crate) fn new(address: String, pool: Arc<BufferPool>, mtu: usize) -> Self {
        Self { address, pool, mtu }
    }

    pub(crate) async fn connect(&self) -> Result<SinkConn, ForwarderError> {
        let url = Url::parse(&self.address).map_err(|err| self.dial_error(err.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| self.dial_error("missing host".to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| self.dial_error("missing port".to_string()))?;
        let target = format!("{host}:{port}");
        match url.scheme() {
            "tcp" => {
                let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&target))
                    .await
                    .map_err(|_| self.dial_error("connect timed out".to_string()))?
                    .map_err(|err| self.dial_error(err.to_string()))?;
                Ok(SinkConn::Tcp(BufWriter::new(stream)))
            }
            "udp" => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .map_err(|err| self.dial_error(err.to_string()))?;
                socket
                    .connect(&target)
                    .await
                    .map_err(|err| self.dial_error(err.to_string()))?;
                Ok(SinkConn::Udp(socket))
            }
            other => Err(self.dial_error(format!(
                "invalid protocol {other:?}, expected tcp or udp"
            ))),
        }
    }

    fn dial_error(&self, cause: String) -> ForwarderError {
        ForwarderError::Dial {
            url: self.address.clone(),
            cause,
        }
    }

    fn message_limit(&self, conn: &SinkConn) -> usize {
        match conn {
            SinkConn::Tcp(_) => 0,
            SinkConn::Udp(_) => self.mtu.saturating_sub(UDP_HEADER_RESERVE),
        }
    }

    pub(crate) async fn run(
        self,
        conn: SinkConn,
        mut rx: mpsc::Receiver<SyslogMessage>,
        cancel: CancellationToken,
    ) {
        let mut conn = Some(conn);
        let mut flush_tick = interval(FLUSH_PERIOD);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(mut message) = message else { break };
                    if conn.is_none() {
                        match self.connect().await {
                            Ok(fresh) => conn = Some(fresh),
                            Err(err) => {
                                warn!("{err}");
                                self.pool.put(message.buffer);
                                continue;
                            }
                        }
                    }
                    let outcome = match conn.as_mut() {
                        Some(active) => self.process(active, &mut message).await,
                        None => Ok(()),
                    };
                    self.pool.put(message.buffer);
                    if let Err(err) = outcome {
                        // Dropping the connection also clears its write
                        // deadline state; the next message redials.
                        warn!(
                            "[log forwarder] write to {:?} failed, reconnecting: {err}",
                            self.address
                        );
                        conn = None;
                    }
                }
                _ = flush_tick.tick() => {
                    if let Some(active) = conn.as_mut() {
                        if let Err(err) = flush(active).await {
                            warn!(
                                "[log forwarder] flush to {:?} failed, reconnecting: {err}",
                                self.address
                            );
                            conn = None;
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        if let Some(mut active) = conn {
            let _ = flush(&mut active).await;
        }
    }

    /// Writes one message, splitting the content region when it exceeds the
    /// datagram limit. Fragments share the original header and trailer; the
    /// final remainder reuses the message buffer in place.
    async fn process(&self, conn: &mut SinkConn, message: &mut SyslogMessage) -> io::Result<()> {
        let full_len = message.buffer.len();
        let limit = self.message_limit(conn);
        if limit == 0 || full_len <= limit {
            return write_part(conn, &message.buffer).await;
        }

        let header_end = message.header_end;
        let content_end = message.content_end;
        let trailer_len = full_len - content_end;
        let available = limit.saturating_sub(header_end + trailer_len);
        if available == 0 {
            // Header and trailer alone exceed the limit; send unsplit and
            // let the network layer reject it.
            return write_part(conn, &message.buffer).await;
        }

        let mut offset = header_end;
        while content_end - offset > available {
            let mut part = self.pool.get();
            part.extend_from_slice(&message.buffer[..header_end]);
            part.extend_from_slice(&message.buffer[offset..offset + available]);
            part.extend_from_slice(&message.buffer[content_end..]);
            let outcome = write_part(conn, &part).await;
            self.pool.put(part);
            outcome?;
            offset += available;
        }

        let remainder = content_end - offset;
        if remainder > 0 {
            message.buffer.copy_within(offset..content_end, header_end);
            message
                .buffer
                .copy_within(content_end..full_len, header_end + remainder);
            message.buffer.truncate(header_end + remainder + trailer_len);
            return write_part(conn, &message.buffer).await;
        }
        Ok(())
    }
}

async fn write_part(conn: &mut SinkConn, buf: &[u8]) -> io::Result<()> {
    match conn {
        SinkConn::Tcp(writer) => timeout(WRITE_TIMEOUT, writer.write_all(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?,
        SinkConn::Udp(socket) => {
            let sent = timeout(WRITE_TIMEOUT, socket.send(buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??;
            if sent < buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write, sent {sent} of {} bytes", buf.len()),
                ));
            }
            Ok(())
        }
    }
}

async fn flush(conn: &mut SinkConn) -> io::Result<()> {
    match conn {
        SinkConn::Tcp(writer) => timeout(WRITE_TIMEOUT, writer.flush())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "flush timed out"))?,
        SinkConn::Udp(_) => Ok(()),
    }
}
