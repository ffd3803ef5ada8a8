// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog sink: line rendering and fan-out to the per-URL forwarder workers.

mod forwarder;

pub(crate) use forwarder::{interface_mtu, SyslogForwarder};

use std::io::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::buffer::BufferPool;
use crate::identity::AppIdentity;
use crate::notify::DropNotifier;
use crate::parser::RawRecord;

/// Container ids are rendered with this many leading characters, matching
/// what the runtime prints in process listings.
pub(crate) const CONTAINER_ID_TRIM_SIZE: usize = 12;

/// Timestamp layout of the rendered line, `Mon  d hh:mm:ss`.
const STAMP_FORMAT: &str = "%b %e %H:%M:%S";

/// Pre-rendered syslog line travelling through a sink channel.
///
/// The offsets delimit the content region so oversized UDP payloads can be
/// split without re-rendering: `buffer[..header_end]` is the header plus the
/// optional prefix, `buffer[content_end..]` the optional suffix plus the
/// newline.
#[derive(Debug)]
pub(crate) struct SyslogMessage {
    pub(crate) buffer: Vec<u8>,
    pub(crate) header_end: usize,
    pub(crate) content_end: usize,
}

/// Timezone used only for rendering; record timestamps stay UTC.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SyslogTimezone {
    Local,
    Named(chrono_tz::Tz),
}

impl SyslogTimezone {
    /// Resolves an optional IANA name, falling back to the process-local
    /// zone when the name does not parse.
    pub(crate) fn resolve(name: Option<&str>) -> Self {
        match name {
            Some(name) => match name.parse() {
                Ok(tz) => Self::Named(tz),
                Err(err) => {
                    warn!("unable to parse syslog timezone format: {err}");
                    Self::Local
                }
            },
            None => Self::Local,
        }
    }

    fn append_stamp(&self, timestamp: DateTime<Utc>, buffer: &mut Vec<u8>) {
        match self {
            // io::Write on Vec<u8> cannot fail.
            Self::Local => {
                let _ = write!(
                    buffer,
                    "{}",
                    timestamp.with_timezone(&chrono::Local).format(STAMP_FORMAT)
                );
            }
            Self::Named(tz) => {
                let _ = write!(buffer, "{}", timestamp.with_timezone(tz).format(STAMP_FORMAT));
            }
        }
    }
}

/// Renders enriched records into syslog lines and distributes them to every
/// configured forward address.
#[derive(Debug)]
pub(crate) struct SyslogBackend {
    senders: Vec<mpsc::Sender<SyslogMessage>>,
    pool: Arc<BufferPool>,
    timezone: SyslogTimezone,
    extra_start: Vec<u8>,
    extra_end: Vec<u8>,
    notify: DropNotifier,
}

impl SyslogBackend {
    pub(crate) fn new(
        senders: Vec<mpsc::Sender<SyslogMessage>>,
        pool: Arc<BufferPool>,
        timezone: SyslogTimezone,
        extra_start: Option<&str>,
        extra_end: Option<&str>,
    ) -> Self {
        Self {
            senders,
            pool,
            timezone,
            extra_start: extra_start
                .map(|extra| format!("{extra} ").into_bytes())
                .unwrap_or_default(),
            extra_end: extra_end
                .map(|extra| format!(" {extra}").into_bytes())
                .unwrap_or_default(),
            notify: DropNotifier::new("syslog"),
        }
    }

    pub(crate) fn send_record(&self, record: &RawRecord<'_>, identity: &AppIdentity) {
        if self.senders.is_empty() {
            return;
        }
        let short_id = short_container_id(record.container_id);
        let mut buffer = self.pool.get();
        let _ = write!(buffer, "<{}>", record.priority);
        self.timezone.append_stamp(record.timestamp, &mut buffer);
        buffer.push(b' ');
        buffer.extend_from_slice(short_id.as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(identity.app_name.as_bytes());
        buffer.push(b'[');
        buffer.extend_from_slice(identity.process_name.as_bytes());
        buffer.extend_from_slice(b"]: ");
        buffer.extend_from_slice(&self.extra_start);
        let header_end = buffer.len();
        buffer.extend_from_slice(record.content);
        let content_end = buffer.len();
        buffer.extend_from_slice(&self.extra_end);
        buffer.push(b'\n');

        // Every sink but the last gets a pooled copy; the last one takes the
        // original buffer, keeping the single-sink case allocation free.
        let last = self.senders.len() - 1;
        for sender in &self.senders[..last] {
            let mut copy = self.pool.get();
            copy.extend_from_slice(&buffer);
            self.submit(
                sender,
                SyslogMessage {
                    buffer: copy,
                    header_end,
                    content_end,
                },
            );
        }
        self.submit(
            &self.senders[last],
            SyslogMessage {
                buffer,
                header_end,
                content_end,
            },
        );
    }

    fn submit(&self, sender: &mpsc::Sender<SyslogMessage>, message: SyslogMessage) {
        if let Err(err) = sender.try_send(message) {
            let message = match err {
                TrySendError::Full(message) | TrySendError::Closed(message) => message,
            };
            self.pool.put(message.buffer);
            self.notify.record_drop();
        }
    }
}

pub(crate) fn short_container_id(container_id: &str) -> &str {
    container_id.get(..CONTAINER_ID_TRIM_SIZE).unwrap_or(container_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_line;
    use std::io;
    use std::sync::Mutex;

    fn identity() -> AppIdentity {
        AppIdentity {
            app_name: "coolappname".to_string(),
            process_name: "procx".to_string(),
            unit_id: "00dfa98fe8e0deadbeef".to_string(),
        }
    }

    fn backend_with(
        capacity: usize,
        sinks: usize,
        timezone: SyslogTimezone,
        extra_start: Option<&str>,
        extra_end: Option<&str>,
    ) -> (SyslogBackend, Vec<mpsc::Receiver<SyslogMessage>>) {
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..sinks {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            receivers.push(rx);
        }
        let backend = SyslogBackend::new(
            senders,
            Arc::new(BufferPool::new()),
            timezone,
            extra_start,
            extra_end,
        );
        (backend, receivers)
    }

    #[tokio::test]
    async fn test_render_with_named_timezone() {
        let tz = SyslogTimezone::resolve(Some("America/Grenada"));
        let (backend, mut receivers) = backend_with(8, 1, tz, None, None);
        let line = b"<30>2015-06-05T16:13:47Z myhost docker/00dfa98fe8e0: mymsg\n";
        let record = parse_line(line);
        backend.send_record(&record, &identity());

        let message = receivers[0].try_recv().expect("message");
        assert_eq!(
            message.buffer,
            b"<30>Jun  5 12:13:47 00dfa98fe8e0 coolappname[procx]: mymsg\n"
        );
        assert_eq!(&message.buffer[message.header_end..message.content_end], b"mymsg");
    }

    #[tokio::test]
    async fn test_render_offsets_with_extras() {
        let tz = SyslogTimezone::resolve(Some("America/Grenada"));
        let (backend, mut receivers) = backend_with(8, 1, tz, Some("PRE"), Some("POST"));
        let record = parse_line(b"<30>2015-06-05T16:13:47Z myhost docker/00dfa98fe8e0: mymsg\n");
        backend.send_record(&record, &identity());

        let message = receivers[0].try_recv().expect("message");
        assert_eq!(
            message.buffer,
            b"<30>Jun  5 12:13:47 00dfa98fe8e0 coolappname[procx]: PRE mymsg POST\n"
        );
        assert_eq!(&message.buffer[message.header_end..message.content_end], b"mymsg");
        assert!(message.buffer[..message.header_end].ends_with(b"PRE "));
        assert!(message.buffer[message.content_end..].starts_with(b" POST"));
    }

    #[tokio::test]
    async fn test_container_id_is_trimmed() {
        let tz = SyslogTimezone::resolve(Some("America/Grenada"));
        let (backend, mut receivers) = backend_with(8, 1, tz, None, None);
        let record = parse_line(
            b"<30>2015-06-05T16:13:47Z myhost docker/00dfa98fe8e0deadbeefdeadbeef: mymsg\n",
        );
        backend.send_record(&record, &identity());

        let message = receivers[0].try_recv().expect("message");
        let rendered = String::from_utf8(message.buffer).expect("utf8");
        assert!(rendered.contains(" 00dfa98fe8e0 "));
        assert!(!rendered.contains("deadbeef"));
    }

    #[tokio::test]
    async fn test_fan_out_renders_identical_copies() {
        let tz = SyslogTimezone::resolve(Some("America/Grenada"));
        let (backend, mut receivers) = backend_with(8, 3, tz, None, None);
        let record = parse_line(b"<30>2015-06-05T16:13:47Z myhost docker/00dfa98fe8e0: mymsg\n");
        backend.send_record(&record, &identity());

        let first = receivers[0].try_recv().expect("message");
        for receiver in &mut receivers[1..] {
            let message = receiver.try_recv().expect("message");
            assert_eq!(message.buffer, first.buffer);
            assert_eq!(message.header_end, first.header_end);
            assert_eq!(message.content_end, first.content_end);
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_parser() {
        let tz = SyslogTimezone::resolve(Some("UTC"));
        let (backend, mut receivers) = backend_with(8, 1, tz, None, None);
        let record = parse_line(b"<30>2015-06-05T16:13:47Z myhost docker/00dfa98fe8e0: hello world\n");
        backend.send_record(&record, &identity());

        let message = receivers[0].try_recv().expect("message");
        let reparsed = parse_line(&message.buffer);
        assert_eq!(reparsed.priority, record.priority);
        assert_eq!(reparsed.hostname, "00dfa98fe8e0");
        assert_eq!(reparsed.tag, "coolappname");
        assert_eq!(reparsed.proc_id, Some("procx"));
        assert_eq!(reparsed.content, b"hello world");
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock poisoned").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_and_reports() {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let tz = SyslogTimezone::resolve(Some("UTC"));
        // Capacity of one and no consumer, so almost every record drops.
        let (backend, receivers) = backend_with(1, 1, tz, None, None);
        let backend = Arc::new(backend);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    let record =
                        parse_line(b"<30>2015-06-05T16:13:47Z myhost docker/00dfa98fe8e0: hey\n");
                    backend.send_record(&record, &identity());
                }
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        drop(receivers);

        let contents =
            String::from_utf8_lossy(&capture.0.lock().expect("lock poisoned")).into_owned();
        assert!(
            contents.contains("Dropping log messages to syslog due to full channel buffer"),
            "unexpected log output: {contents}"
        );
    }
}
