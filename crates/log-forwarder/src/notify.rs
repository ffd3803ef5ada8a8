// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::error;

const NOTIFY_PERIOD: Duration = Duration::from_secs(60);

/// Rate-limited reporter for messages dropped on a full sink channel.
///
/// Every sender records its drops here; at most one diagnostic per minute is
/// emitted per backend, carrying the number of drops since the previous
/// notice.
#[derive(Debug)]
pub(crate) struct DropNotifier {
    backend: &'static str,
    dropped: AtomicU64,
    next_notice: Mutex<Instant>,
}

impl DropNotifier {
    pub(crate) fn new(backend: &'static str) -> Self {
        Self {
            backend,
            dropped: AtomicU64::new(0),
            // First drop reports immediately.
            next_notice: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::expect_used)]
        let mut next_notice = self.next_notice.lock().expect("lock poisoned");
        if Instant::now() >= *next_notice {
            let dropped = self.dropped.swap(0, Ordering::Relaxed);
            error!(
                "Dropping log messages to {} due to full channel buffer ({} messages dropped since last notice)",
                self.backend, dropped
            );
            *next_notice = Instant::now() + NOTIFY_PERIOD;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

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

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().expect("lock poisoned")).into_owned()
        }
    }

    #[test]
    fn test_first_drop_reports_then_rate_limits() {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let notifier = DropNotifier::new("syslog");
        notifier.record_drop();
        notifier.record_drop();
        notifier.record_drop();

        let contents = capture.contents();
        let notices = contents
            .matches("Dropping log messages to syslog due to full channel buffer")
            .count();
        assert_eq!(notices, 1, "unexpected log output: {contents}");
        assert!(contents.contains("(1 messages dropped since last notice)"));
    }

    #[test]
    fn test_drops_accumulate_until_next_notice() {
        let notifier = DropNotifier::new("syslog");
        notifier.record_drop();
        // The first drop was reported and reset the counter; later drops in
        // the same minute accumulate.
        notifier.record_drop();
        notifier.record_drop();
        assert_eq!(notifier.dropped.load(Ordering::Relaxed), 2);
    }
}
