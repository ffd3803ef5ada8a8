//! Websocket sink forwarding enriched records to the tsuru log endpoint.
//!
//! One JSON object per record, newline terminated. The session is kept
//! alive with a protocol-level ping/pong heartbeat: a pong carrying the
//! ping's payload must arrive before the next ping fires, otherwise the
//! session is declared dead and redialed. Dials are paced to at most one
//! per heartbeat interval.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::error::ForwarderError;
use crate::identity::AppIdentity;
use crate::notify::DropNotifier;
use crate::parser::RawRecord;

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

type WsSession = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Log line in the shape the platform ingests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Applog {
    #[serde(rename = "Date")]
    pub date: DateTime<Utc>,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "AppName")]
    pub app_name: String,
    #[serde(rename = "Unit")]
    pub unit: String,
}

/// Submission side of the websocket sink.
#[derive(Debug)]
pub(crate) struct TsuruBackend {
    tx: mpsc::Sender<Applog>,
    notify: DropNotifier,
}

impl TsuruBackend {
    pub(crate) fn new(tx: mpsc::Sender<Applog>) -> Self {
        Self {
            tx,
            notify: DropNotifier::new("tsuru"),
        }
    }

    pub(crate) fn send_record(&self, record: &RawRecord<'_>, identity: &AppIdentity) {
        let entry = Applog {
            date: record.timestamp,
            message: String::from_utf8_lossy(record.content).into_owned(),
            source: identity.process_name.clone(),
            app_name: identity.app_name.clone(),
            unit: identity.unit_id.clone(),
        };
        if self.tx.try_send(entry).is_err() {
            self.notify.record_drop();
        }
    }
}

enum SessionEnd {
    Stop,
    Failed,
}

/// Worker owning the single websocket session to the platform.
#[derive(Debug)]
pub(crate) struct TsuruForwarder {
    url: Url,
    token: String,
    ping_interval: Duration,
    tls_root_ca_pem: Option<Vec<u8>>,
}

impl TsuruForwarder {
    /// Builds a forwarder for an endpoint given as `http(s)` or `ws(s)`.
    pub(crate) fn new(
        endpoint: &str,
        token: &str,
        ping_interval: Duration,
        tls_root_ca_pem: Option<Vec<u8>>,
    ) -> Result<Self, ForwarderError> {
        let mut url = Url::parse(endpoint).map_err(|source| ForwarderError::InvalidUrl {
            url: endpoint.to_string(),
            source,
        })?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(ForwarderError::WsDial {
                    url: endpoint.to_string(),
                    cause: format!("invalid protocol {other:?}, expected ws or wss"),
                })
            }
        };
        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            return Err(ForwarderError::WsDial {
                url: endpoint.to_string(),
                cause: format!("unable to switch scheme to {scheme:?}"),
            });
        }
        Ok(Self {
            url,
            token: token.to_string(),
            ping_interval,
            tls_root_ca_pem,
        })
    }

    /// Initial dial, fatal at start-up.
    pub(crate) async fn connect(&self) -> Result<WsSession, ForwarderError> {
        self.dial().await.map_err(|cause| ForwarderError::WsDial {
            url: self.url.to_string(),
            cause,
        })
    }

    async fn dial(&self) -> Result<WsSession, String> {
        let mut request = self
            .url
            .clone()
            .into_client_request()
            .map_err(|err| err.to_string())?;
        let authorization = HeaderValue::from_str(&format!("bearer {}", self.token))
            .map_err(|err| err.to_string())?;
        request.headers_mut().insert(AUTHORIZATION, authorization);

        let connector = match &self.tls_root_ca_pem {
            Some(pem) => {
                let certificate =
                    native_tls::Certificate::from_pem(pem).map_err(|err| err.to_string())?;
                let connector = native_tls::TlsConnector::builder()
                    .add_root_certificate(certificate)
                    .build()
                    .map_err(|err| err.to_string())?;
                Some(Connector::NativeTls(connector))
            }
            None => None,
        };

        let (session, _response) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|err| err.to_string())?;
        Ok(session)
    }

    pub(crate) async fn run(
        self,
        session: WsSession,
        mut rx: mpsc::Receiver<Applog>,
        cancel: CancellationToken,
    ) {
        let mut session = Some(session);
        let mut last_dial = Instant::now();
        loop {
            let active = match session.take() {
                Some(active) => active,
                None => match self.redial_paced(&mut last_dial, &cancel).await {
                    Some(active) => active,
                    None => return,
                },
            };
            match self.run_session(active, &mut rx, &cancel).await {
                SessionEnd::Stop => return,
                SessionEnd::Failed => {}
            }
        }
    }

    /// Runs one connected session until stop or failure.
    async fn run_session(
        &self,
        session: WsSession,
        rx: &mut mpsc::Receiver<Applog>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut writer, mut reader) = session.split();
        let mut ping_tick = interval(self.ping_interval);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong: Option<Vec<u8>> = None;
        let mut ping_seq: u64 = 0;

        loop {
            tokio::select! {
                entry = rx.recv() => {
                    let Some(entry) = entry else { return SessionEnd::Stop };
                    let line = match serde_json::to_string(&entry) {
                        Ok(line) => line,
                        Err(err) => {
                            warn!("unable to encode log entry: {err}");
                            continue;
                        }
                    };
                    if !send_frame(&mut writer, Message::Text(format!("{line}\n"))).await {
                        // The entry is lost; the channel keeps buffering
                        // while we redial.
                        return SessionEnd::Failed;
                    }
                }
                _ = ping_tick.tick() => {
                    if awaiting_pong.take().is_some() {
                        error!("no pong response in {:?}", self.ping_interval);
                        return SessionEnd::Failed;
                    }
                    ping_seq += 1;
                    let payload = ping_seq.to_be_bytes().to_vec();
                    if !send_frame(&mut writer, Message::Ping(payload.clone())).await {
                        return SessionEnd::Failed;
                    }
                    awaiting_pong = Some(payload);
                }
                frame = reader.next() => {
                    match frame {
                        Some(Ok(Message::Pong(payload))) => {
                            if awaiting_pong.as_deref() == Some(payload.as_slice()) {
                                awaiting_pong = None;
                            }
                        }
                        // Nothing is expected from the peer besides pongs.
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("log stream closed by peer");
                            return SessionEnd::Failed;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            debug!("log stream read failed: {err}");
                            return SessionEnd::Failed;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = writer.close().await;
                    return SessionEnd::Stop;
                }
            }
        }
    }

    /// Redials no faster than once per heartbeat interval. Returns `None`
    /// on cancellation.
    async fn redial_paced(
        &self,
        last_dial: &mut Instant,
        cancel: &CancellationToken,
    ) -> Option<WsSession> {
        loop {
            let since = last_dial.elapsed();
            if since < self.ping_interval {
                let delay = self.ping_interval - since;
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return None,
                }
            }
            *last_dial = Instant::now();
            match self.dial().await {
                Ok(session) => return Some(session),
                Err(err) => warn!("unable to reconnect log stream: {err}"),
            }
            if cancel.is_cancelled() {
                return None;
            }
        }
    }
}

/// Sends one frame with a bounded deadline. Returns false when the session
/// should be dropped.
async fn send_frame(writer: &mut SplitSink<WsSession, Message>, frame: Message) -> bool {
    match timeout(WRITE_TIMEOUT, writer.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!("log stream write failed, reconnecting: {err}");
            false
        }
        Err(_) => {
            warn!("log stream write timed out, reconnecting");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_applog_wire_shape() {
        let entry = Applog {
            date: Utc.with_ymd_and_hms(2015, 6, 5, 16, 13, 47).unwrap(),
            message: "mymsg".to_string(),
            source: "procx".to_string(),
            app_name: "coolappname".to_string(),
            unit: "00dfa98fe8e0".to_string(),
        };
        let encoded = serde_json::to_string(&entry).expect("encode");
        assert_eq!(
            encoded,
            r#"{"Date":"2015-06-05T16:13:47Z","Message":"mymsg","Source":"procx","AppName":"coolappname","Unit":"00dfa98fe8e0"}"#
        );
        let decoded: Applog = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_endpoint_scheme_conversion() {
        let forwarder =
            TsuruForwarder::new("http://example.com/", "tok", Duration::from_secs(30), None)
                .expect("forwarder");
        assert_eq!(forwarder.url.scheme(), "ws");

        let forwarder =
            TsuruForwarder::new("https://example.com/", "tok", Duration::from_secs(30), None)
                .expect("forwarder");
        assert_eq!(forwarder.url.scheme(), "wss");

        let forwarder =
            TsuruForwarder::new("ws://example.com/", "tok", Duration::from_secs(30), None)
                .expect("forwarder");
        assert_eq!(forwarder.url.scheme(), "ws");
    }

    #[test]
    fn test_endpoint_rejects_unknown_scheme() {
        let err = TsuruForwarder::new("ftp://example.com/", "tok", Duration::from_secs(30), None)
            .expect_err("scheme");
        assert!(err
            .to_string()
            .contains("invalid protocol \"ftp\", expected ws or wss"));
    }
}
