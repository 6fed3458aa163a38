//! In-memory table of running mock server instances, keyed by port
//!
//! The registry is the only shared mutable state in the control layer. A
//! single readers-writer lock guards the table: lookups and snapshots run
//! concurrently, `add`/`remove`/`drain` are exclusive. Nothing slow (spawning,
//! probing, writing routing documents) ever happens while the lock is held.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;
use tokio::process::Child;
use tracing::debug;

/// Externally visible description of a running instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub port: u16,
    pub config_file: String,
    pub start_time: DateTime<Utc>,
    #[serde(rename = "uuid", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// A tracked mock server: its description plus the resources it owns
pub struct MockInstance {
    info: InstanceInfo,
    process: Mutex<Option<Child>>,
    log_sink: Mutex<Option<File>>,
}

impl MockInstance {
    pub fn new(port: u16, config_file: impl Into<String>) -> Self {
        Self {
            info: InstanceInfo {
                port,
                config_file: config_file.into(),
                start_time: Utc::now(),
                correlation_id: None,
                pid: None,
            },
            process: Mutex::new(None),
            log_sink: Mutex::new(None),
        }
    }

    /// Attach the client-supplied correlation tag (builder pattern)
    pub fn with_correlation_id(mut self, id: Option<String>) -> Self {
        self.info.correlation_id = id;
        self
    }

    /// Attach the spawned process (builder pattern)
    pub fn with_process(mut self, child: Child) -> Self {
        self.info.pid = child.id();
        self.process = Mutex::new(Some(child));
        self
    }

    /// Attach the log file the process writes into (builder pattern)
    pub fn with_log_sink(mut self, file: File) -> Self {
        self.log_sink = Mutex::new(Some(file));
        self
    }

    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }

    pub fn port(&self) -> u16 {
        self.info.port
    }

    pub fn config_file(&self) -> &str {
        &self.info.config_file
    }

    pub fn has_log_sink(&self) -> bool {
        self.log_sink.lock().is_some()
    }

    pub fn has_process(&self) -> bool {
        self.process.lock().is_some()
    }

    /// Run `f` against the process handle, if one is attached
    pub fn with_child<R>(&self, f: impl FnOnce(&mut Child) -> R) -> Option<R> {
        self.process.lock().as_mut().map(f)
    }

    /// Take ownership of the process handle
    pub fn take_process(&self) -> Option<Child> {
        self.process.lock().take()
    }

    /// Close the log sink and drop the process handle. Idempotent.
    ///
    /// Dropping the handle does not kill the process.
    pub fn release(&self) {
        if let Some(file) = self.log_sink.lock().take() {
            drop(file);
            debug!(port = self.info.port, "Closed instance log sink");
        }
        self.process.lock().take();
    }
}

impl std::fmt::Debug for MockInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockInstance")
            .field("info", &self.info)
            .field("has_process", &self.has_process())
            .field("has_log_sink", &self.has_log_sink())
            .finish()
    }
}

/// Concurrency-safe table of running instances
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<u16, Arc<MockInstance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `port`.
    ///
    /// The caller is responsible for having probed the port first. An
    /// overwritten entry is released.
    pub fn add(&self, port: u16, instance: MockInstance) -> Arc<MockInstance> {
        let instance = Arc::new(instance);
        let previous = self.instances.write().insert(port, Arc::clone(&instance));
        if let Some(previous) = previous {
            previous.release();
        }
        instance
    }

    /// Remove the entry for `port`, closing its log sink. Absent ports are a no-op.
    pub fn remove(&self, port: u16) -> Option<Arc<MockInstance>> {
        let removed = self.instances.write().remove(&port);
        if let Some(ref instance) = removed {
            instance.release();
        }
        removed
    }

    /// Remove the entry for `port` only if `predicate` accepts it.
    ///
    /// The check and the removal happen under one write lock, so an entry
    /// that replaced the expected one is left alone.
    pub fn remove_if(
        &self,
        port: u16,
        predicate: impl FnOnce(&Arc<MockInstance>) -> bool,
    ) -> Option<Arc<MockInstance>> {
        let removed = {
            let mut instances = self.instances.write();
            match instances.get(&port) {
                Some(current) if predicate(current) => instances.remove(&port),
                _ => None,
            }
        };
        if let Some(ref instance) = removed {
            instance.release();
        }
        removed
    }

    pub fn get(&self, port: u16) -> Option<Arc<MockInstance>> {
        self.instances.read().get(&port).cloned()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.instances.read().contains_key(&port)
    }

    /// Snapshot of every running instance, sorted by port
    pub fn list(&self) -> Vec<InstanceInfo> {
        let mut infos: Vec<InstanceInfo> = self
            .instances
            .read()
            .values()
            .map(|instance| instance.info.clone())
            .collect();
        infos.sort_by_key(|info| info.port);
        infos
    }

    /// Port of the first instance running `config_file`, if any.
    ///
    /// Several instances may share a document; which one is returned then is
    /// unspecified.
    pub fn find_by_config(&self, config_file: &str) -> Option<u16> {
        self.instances
            .read()
            .iter()
            .find(|(_, instance)| instance.info.config_file == config_file)
            .map(|(port, _)| *port)
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Empty the table, releasing every handle. Processes keep running.
    pub fn drain(&self) -> usize {
        let drained: Vec<Arc<MockInstance>> = {
            let mut instances = self.instances.write();
            instances.drain().map(|(_, instance)| instance).collect()
        };
        for instance in &drained {
            instance.release();
        }
        drained.len()
    }
}
