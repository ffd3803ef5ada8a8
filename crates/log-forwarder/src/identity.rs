// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Container identity resolution.
//!
//! The syslog tag only carries a short container id. Addressing a record to
//! a tenant needs the application name, the process name, and the full
//! container id, all of which come from a single inspect call against the
//! container runtime. Results are cached for the process lifetime since
//! containers are immutable once created.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::ForwarderError;

const APP_NAME_ENV: &str = "TSURU_APPNAME=";
const PROCESS_NAME_ENV: &str = "TSURU_PROCESSNAME=";

const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Application identity attached to every forwarded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub app_name: String,
    pub process_name: String,
    /// Full container id as reported by the runtime; the short id used for
    /// the lookup is a prefix of it.
    pub unit_id: String,
}

#[derive(Debug, Deserialize)]
struct ContainerInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Config", default)]
    config: ContainerConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Env", default)]
    env: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum IdentityError {
    #[error("container inspect request failed: {0}")]
    Request(#[from] reqwest::Error),
}

type CacheEntry = Arc<OnceCell<Option<AppIdentity>>>;

/// Resolves short container ids to [`AppIdentity`] values, with a
/// process-lifetime cache and per-key single-flight on cold misses.
#[derive(Debug)]
pub struct IdentityResolver {
    endpoint: String,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl IdentityResolver {
    pub fn new(endpoint: &str) -> Result<Self, ForwarderError> {
        let client = reqwest::Client::builder()
            .timeout(INSPECT_TIMEOUT)
            .build()
            .map_err(|err| ForwarderError::RuntimeClient(err.to_string()))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Looks up the identity for a short container id.
    ///
    /// Returns `None` both for containers that carry no application identity
    /// (cached, since container environment is immutable) and for transient
    /// runtime errors (not cached, retried on the next record). Concurrent
    /// misses for the same id collapse into one inspect call.
    pub async fn resolve(&self, container_id: &str) -> Option<AppIdentity> {
        if container_id.is_empty() || self.endpoint.is_empty() {
            return None;
        }
        let entry = {
            #[allow(clippy::expect_used)]
            let mut cache = self.cache.lock().expect("lock poisoned");
            cache.entry(container_id.to_string()).or_default().clone()
        };
        match entry.get_or_try_init(|| self.inspect(container_id)).await {
            Ok(Some(identity)) => Some(identity.clone()),
            Ok(None) => None,
            Err(err) => {
                debug!("unable to resolve container {container_id}: {err}");
                None
            }
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<AppIdentity>, IdentityError> {
        let url = format!("{}/containers/{}/json", self.endpoint, container_id);
        let container: ContainerInspect = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut app_name = None;
        let mut process_name = None;
        for variable in &container.config.env {
            if let Some(value) = variable.strip_prefix(APP_NAME_ENV) {
                app_name = Some(value.to_string());
            } else if let Some(value) = variable.strip_prefix(PROCESS_NAME_ENV) {
                process_name = Some(value.to_string());
            }
        }
        match (app_name, process_name) {
            (Some(app_name), Some(process_name)) => Ok(Some(AppIdentity {
                app_name,
                process_name,
                unit_id: container.id,
            })),
            // Not a tsuru application container. Expected for system
            // containers, so no log here.
            _ => Ok(None),
        }
    }
}
