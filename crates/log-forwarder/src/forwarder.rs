// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Supervisor owning the listener and sink worker lifecycles.
//!
//! `start` acquires every fallible resource up front (downstream dials, the
//! websocket session, the ingress socket) and only then spawns workers, so a
//! start-up failure leaves nothing running and surfaces the first error
//! unchanged. `stop` fans a cancellation out to every worker and waits for
//! the drain.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::config::LogForwarderConfig;
use crate::error::ForwarderError;
use crate::identity::IdentityResolver;
use crate::listener::BindSpec;
use crate::parser::parse_line;
use crate::syslog::{interface_mtu, SyslogBackend, SyslogForwarder, SyslogTimezone};
use crate::tsuru::{TsuruBackend, TsuruForwarder};

/// Parses, enriches, and distributes one ingested line. Shared by every
/// listener task.
#[derive(Debug)]
pub(crate) struct MessageHandler {
    resolver: IdentityResolver,
    syslog: Option<SyslogBackend>,
    tsuru: Option<TsuruBackend>,
    messages_counter: AtomicU64,
}

impl MessageHandler {
    pub(crate) async fn handle_line(&self, line: &[u8]) {
        if line.is_empty() || line == b"\n" {
            return;
        }
        self.messages_counter.fetch_add(1, Ordering::Relaxed);
        let record = parse_line(line);
        if record.container_id.is_empty() {
            // Not addressable to a tenant.
            return;
        }
        let Some(identity) = self.resolver.resolve(record.container_id).await else {
            return;
        };
        if let Some(syslog) = &self.syslog {
            syslog.send_record(&record, &identity);
        }
        if let Some(tsuru) = &self.tsuru {
            tsuru.send_record(&record, &identity);
        }
    }
}

/// Running log forwarder.
///
/// Obtained from [`LogForwarder::start`]; consumed by [`LogForwarder::stop`],
/// which makes a second start without an intervening stop unrepresentable.
#[derive(Debug)]
pub struct LogForwarder {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    handler: Arc<MessageHandler>,
    bind_addr: SocketAddr,
}

impl LogForwarder {
    /// Validates the configuration, dials every sink, binds the listener,
    /// and spawns the workers. The first failure aborts start-up and is
    /// returned unchanged.
    pub async fn start(config: LogForwarderConfig) -> Result<Self, ForwarderError> {
        let backends = config.enabled_backends()?;
        let bind_spec = BindSpec::parse(&config.bind_address)?;
        let pool = Arc::new(BufferPool::new());

        // Resource acquisition happens before any worker is spawned, so an
        // error below needs no teardown.
        let mut syslog_workers = Vec::new();
        let mut syslog_senders = Vec::new();
        if backends.syslog && !config.forward_addresses.is_empty() {
            let mtu = interface_mtu(&config.mtu_interface);
            for address in &config.forward_addresses {
                let worker = SyslogForwarder::new(address.clone(), Arc::clone(&pool), mtu);
                let conn = worker.connect().await?;
                let (tx, rx) = mpsc::channel(config.buffer_size);
                syslog_senders.push(tx);
                syslog_workers.push((worker, conn, rx));
            }
        }

        let mut tsuru_worker = None;
        let mut tsuru_backend = None;
        if backends.tsuru && !config.tsuru_endpoint.is_empty() {
            let worker = TsuruForwarder::new(
                &config.tsuru_endpoint,
                &config.tsuru_token,
                config.ws_ping_interval,
                config.tls_root_ca_pem.clone(),
            )?;
            let session = worker.connect().await?;
            let (tx, rx) = mpsc::channel(config.buffer_size);
            tsuru_backend = Some(TsuruBackend::new(tx));
            tsuru_worker = Some((worker, session, rx));
        }

        let resolver = IdentityResolver::new(&config.docker_endpoint)?;
        let listener = bind_spec.bind().await?;
        let bind_addr = listener.local_addr().map_err(|source| ForwarderError::Bind {
            url: config.bind_address.clone(),
            source,
        })?;

        let syslog_backend = (!syslog_senders.is_empty()).then(|| {
            SyslogBackend::new(
                syslog_senders,
                Arc::clone(&pool),
                SyslogTimezone::resolve(config.syslog_timezone.as_deref()),
                config.syslog_extra_start.as_deref(),
                config.syslog_extra_end.as_deref(),
            )
        });

        let handler = Arc::new(MessageHandler {
            resolver,
            syslog: syslog_backend,
            tsuru: tsuru_backend,
            messages_counter: AtomicU64::new(0),
        });

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        for (worker, conn, rx) in syslog_workers {
            tasks.push(tokio::spawn(worker.run(conn, rx, cancel.clone())));
        }
        if let Some((worker, session, rx)) = tsuru_worker {
            tasks.push(tokio::spawn(worker.run(session, rx, cancel.clone())));
        }
        tasks.push(tokio::spawn(
            listener.run(Arc::clone(&handler), cancel.clone()),
        ));

        Ok(Self {
            cancel,
            tasks,
            handler,
            bind_addr,
        })
    }

    /// Address the listener actually bound, useful when the configured port
    /// was 0.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Number of syslog lines ingested so far.
    pub fn messages_processed(&self) -> u64 {
        self.handler.messages_counter.load(Ordering::Relaxed)
    }

    /// Signals every worker to stop and waits for the drain. Sockets close
    /// when the workers drop them.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
