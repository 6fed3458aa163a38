//! Mock server lifecycle: start, stop and catalog operations
//!
//! Every operation validates first and mutates last. A failed start leaves
//! the registry untouched; a stop that cannot signal the process keeps the
//! entry so the process is never lost track of. Routing resynthesis always
//! runs after the registry mutation it reflects, and its failure is only
//! logged.

use crate::config::Config;
use crate::error::ControlError;
use crate::port::{is_port_free, PortPolicy};
use crate::registry::{InstanceInfo, InstanceRegistry, MockInstance};
use crate::routing::{AliasMode, RoutingPublisher};
use crate::store::{sanitize_filename, ConfigFile, ConfigStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// The mock-server command line with `{data}` and `{port}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCommand {
    program: String,
    args: Vec<String>,
}

impl MockCommand {
    pub fn parse(command_line: &str) -> Result<Self, ControlError> {
        let mut words = shell_words::split(command_line)
            .map_err(|e| ControlError::InvalidInput(format!("invalid mock command: {}", e)))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| ControlError::InvalidInput("mock command is empty".to_string()))?;

        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments with the placeholders filled in
    pub fn args_for(&self, data: &Path, port: u16) -> Vec<String> {
        let data = data.to_string_lossy();
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{data}", &data).replace("{port}", &port))
            .collect()
    }
}

/// Body of a start request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub port: i64,
    pub config_file: String,
    #[serde(rename = "uuid", default)]
    pub correlation_id: Option<String>,
}

impl StartRequest {
    pub fn new(port: i64, config_file: impl Into<String>) -> Self {
        Self {
            port,
            config_file: config_file.into(),
            correlation_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedInstance {
    pub port: u16,
    pub config_file: String,
    pub start_time: DateTime<Utc>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoppedInstance {
    pub port: u16,
    pub status: &'static str,
}

/// Running instances joined with the document catalog
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: Vec<InstanceInfo>,
    pub available: Vec<ConfigFile>,
}

/// Owns the registry and drives every instance state transition
pub struct LifecycleController {
    registry: Arc<InstanceRegistry>,
    store: ConfigStore,
    publisher: RoutingPublisher,
    policy: PortPolicy,
    command: MockCommand,
    version_args: Vec<String>,
    logs_dir: PathBuf,
    upload_dir: PathBuf,
    grace_period: Duration,
    proxy_mode: bool,
    proxy_base_url: Option<String>,
    public_hostname: String,
}

impl LifecycleController {
    pub fn new(
        config: &Config,
        registry: Arc<InstanceRegistry>,
        store: ConfigStore,
        publisher: RoutingPublisher,
    ) -> Result<Self, ControlError> {
        Ok(Self {
            registry,
            store,
            publisher,
            policy: PortPolicy::from(&config.mock),
            command: MockCommand::parse(&config.mock.command)?,
            version_args: config.mock.version_args.clone(),
            logs_dir: config.paths.logs_dir.clone(),
            upload_dir: config.paths.upload_dir.clone(),
            grace_period: config.mock.shutdown_grace_period(),
            proxy_mode: config.routing.proxy_mode,
            proxy_base_url: config.routing.proxy_base_url.clone(),
            public_hostname: config.server.public_hostname.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn publisher(&self) -> &RoutingPublisher {
        &self.publisher
    }

    pub fn policy(&self) -> &PortPolicy {
        &self.policy
    }

    /// Launch a mock server for a stored document
    pub async fn start(&self, request: StartRequest) -> Result<StartedInstance, ControlError> {
        if request.config_file.trim().is_empty() {
            return Err(ControlError::InvalidInput("configFile is required".to_string()));
        }

        let port = self.policy.validate(request.port)?;
        if !is_port_free(port).await {
            return Err(ControlError::PortInUse(port));
        }
        if !self.store.exists(&request.config_file) {
            return Err(ControlError::NotFound(format!(
                "configuration file {} does not exist",
                request.config_file
            )));
        }

        let config_file = sanitize_filename(&request.config_file);
        let data_path = self.store.path(&config_file);
        let log_file = self.open_log(port)?;
        let child = self.spawn(&data_path, port, &log_file)?;
        let pid = child.id();

        let instance = self.registry.add(
            port,
            MockInstance::new(port, &config_file)
                .with_correlation_id(request.correlation_id)
                .with_process(child)
                .with_log_sink(log_file),
        );
        info!(port, config_file = %config_file, pid, "Mock server started");

        self.resynthesize();

        Ok(StartedInstance {
            port,
            config_file,
            start_time: instance.info().start_time,
            status: "running",
            pid,
        })
    }

    fn open_log(&self, port: u16) -> Result<fs::File, ControlError> {
        fs::create_dir_all(&self.logs_dir).map_err(|e| {
            ControlError::io(
                format!("failed to create log directory {}", self.logs_dir.display()),
                e,
            )
        })?;

        let path = self.logs_dir.join(format!("mock-{}.log", port));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ControlError::io(format!("failed to open log file {}", path.display()), e))
    }

    fn spawn(
        &self,
        data_path: &Path,
        port: u16,
        log_file: &fs::File,
    ) -> Result<Child, ControlError> {
        let stdout = log_file
            .try_clone()
            .map_err(|e| ControlError::io("failed to attach log file", e))?;
        let stderr = log_file
            .try_clone()
            .map_err(|e| ControlError::io("failed to attach log file", e))?;

        let args = self.command.args_for(data_path, port);
        debug!(program = %self.command.program(), ?args, "Spawning mock server");

        let mut cmd = Command::new(self.command.program());
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));

        cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                ControlError::ExternalToolUnavailable {
                    program: self.command.program().to_string(),
                    source: e,
                }
            }
            _ => ControlError::io("failed to start mock server", e),
        })
    }

    /// Terminate the instance on `port` and forget it
    pub async fn stop(&self, port: u16) -> Result<StoppedInstance, ControlError> {
        self.stop_with(port, terminate)
    }

    fn stop_with(
        &self,
        port: u16,
        signal: impl FnOnce(&MockInstance) -> io::Result<()>,
    ) -> Result<StoppedInstance, ControlError> {
        let instance = self.registry.get(port).ok_or_else(|| {
            ControlError::NotFound(format!("no mock server running on port {}", port))
        })?;

        signal(&instance).map_err(|e| {
            ControlError::io(format!("failed to stop mock server on port {}", port), e)
        })?;

        let child = instance.take_process();
        // A start may have claimed the port while the signal was in flight.
        if self
            .registry
            .remove_if(port, |current| Arc::ptr_eq(current, &instance))
            .is_none()
        {
            debug!(port, "Port was reused during stop, leaving the new instance");
        }
        info!(port, config_file = %instance.config_file(), "Mock server stopped");

        if let Some(child) = child {
            tokio::spawn(reap(port, child, self.grace_period));
        }

        self.resynthesize();

        Ok(StoppedInstance {
            port,
            status: "stopped",
        })
    }

    /// Running instances plus the catalog with usage filled in
    ///
    /// An in-use document reports the port it is actually running on.
    pub fn status(&self) -> Result<StatusReport, ControlError> {
        let running = self.registry.list();
        let mut available = self.store.list()?;
        for config in &mut available {
            if let Some(port) = self.registry.find_by_config(&config.filename) {
                config.in_use = true;
                config.port = port;
            }
        }

        Ok(StatusReport { running, available })
    }

    /// The catalog with usage and the public URL of each document
    pub fn list_configs(
        &self,
        request_host: Option<&str>,
    ) -> Result<Vec<ConfigFile>, ControlError> {
        let mut configs = self.store.list()?;
        for config in &mut configs {
            if let Some(port) = self.registry.find_by_config(&config.filename) {
                config.in_use = true;
                if config.port == 0 {
                    config.port = port;
                }
            }
            config.url = self.mock_url(config.port, request_host);
        }
        Ok(configs)
    }

    /// Public URL of a mock server, `None` without a port
    pub fn mock_url(&self, port: u16, request_host: Option<&str>) -> Option<String> {
        if port == 0 {
            return None;
        }

        let url = if self.proxy_mode {
            match &self.proxy_base_url {
                Some(base) => format!("{}/{}", base.trim_end_matches('/'), port),
                None => format!(
                    "http://{}/{}",
                    request_host.unwrap_or(&self.public_hostname),
                    port
                ),
            }
        } else {
            format!("http://{}:{}", self.public_hostname, port)
        };
        Some(url)
    }

    /// Delete a document no running instance references
    pub fn delete_config(&self, filename: &str) -> Result<(), ControlError> {
        if !self.store.exists(filename) {
            return Err(ControlError::NotFound(format!(
                "configuration file {} does not exist",
                filename
            )));
        }

        let name = sanitize_filename(filename);
        if let Some(port) = self.registry.find_by_config(&name) {
            return Err(ControlError::ConfigInUse {
                filename: name,
                port,
            });
        }

        self.store.delete(&name)
    }

    /// Store an uploaded document, returns its sanitized name
    pub fn upload_config(&self, filename: &str, bytes: &[u8]) -> Result<String, ControlError> {
        let name = sanitize_filename(filename);
        if !self.store.has_document_extension(&name) {
            return Err(ControlError::InvalidInput(format!(
                "only .{} files are allowed",
                self.store.extension()
            )));
        }

        self.store.save_bytes(&self.upload_dir, &name, bytes)
    }

    pub fn download_config(&self, filename: &str) -> Result<Vec<u8>, ControlError> {
        self.store.read(filename)
    }

    /// Run the mock-server executable with its version arguments
    pub async fn check_cli(&self) -> Result<String, ControlError> {
        let program = self.command.program().to_string();
        let output = Command::new(&program)
            .args(&self.version_args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ControlError::ExternalToolUnavailable {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ControlError::ExternalToolUnavailable {
                program,
                source: io::Error::new(
                    io::ErrorKind::Other,
                    format!("version check exited with {}", output.status),
                ),
            });
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(program = %program, version = %version, "Mock server executable available");
        Ok(version)
    }

    /// Rewrite the dynamic routing document from the current registry
    pub fn regenerate(&self, mode: AliasMode) -> anyhow::Result<usize> {
        self.publisher.publish_dynamic(&self.registry.list(), mode)
    }

    fn resynthesize(&self) {
        if let Err(e) = self.regenerate(AliasMode::Query) {
            warn!(
                error = %e,
                "Failed to regenerate routing configuration, it stays stale until the next change"
            );
        }
    }

    /// Release every tracked handle. The processes keep running.
    pub fn shutdown(&self) -> usize {
        let released = self.registry.drain();
        info!(released, "Released mock server handles");
        released
    }
}

/// Ask the process to exit. A process that is already gone counts as stopped.
fn terminate(instance: &MockInstance) -> io::Result<()> {
    instance.with_child(signal_terminate).unwrap_or(Ok(()))
}

#[cfg(unix)]
fn signal_terminate(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };

    debug!(pid, "Sending SIGTERM to mock server");
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child) -> io::Result<()> {
    match child.start_kill() {
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}

/// Wait out the grace period, then kill
async fn reap(port: u16, mut child: Child, grace_period: Duration) {
    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(port, ?status, "Mock server exited");
        }
        Ok(Err(e)) => {
            warn!(port, error = %e, "Error waiting for mock server to exit");
        }
        Err(_) => {
            warn!(
                port,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}
