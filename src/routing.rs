//! Reverse-proxy routing documents
//!
//! The dynamic document is rebuilt from scratch on every change: it is a pure
//! function of the running instances and the active aliases, never patched
//! in place. Maps are ordered so identical inputs always render to identical
//! bytes. The static document (entry point, file provider, dashboard) does not
//! depend on any runtime state.

use crate::alias::{Alias, AliasSource};
use crate::config::Config;
use crate::error::ControlError;
use crate::registry::InstanceInfo;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Middleware shared by every instance router
pub const STRIP_API_MIDDLEWARE: &str = "strip-api";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub http: HttpConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub routers: BTreeMap<String, Router>,
    pub services: BTreeMap<String, Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middlewares: Option<BTreeMap<String, Middleware>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<String>,
    pub rule: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub load_balancer: LoadBalancer,
}

impl Service {
    pub fn single(url: impl Into<String>) -> Self {
        Self {
            load_balancer: LoadBalancer {
                servers: vec![Server { url: url.into() }],
            },
        }
    }

    /// Backend URLs of this service
    pub fn urls(&self) -> Vec<&str> {
        self.load_balancer.servers.iter().map(|s| s.url.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Middleware {
    pub strip_prefix: StripPrefix,
}

impl Middleware {
    pub fn strip(prefix: impl Into<String>) -> Self {
        Self {
            strip_prefix: StripPrefix {
                prefixes: vec![prefix.into()],
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripPrefix {
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticConfig {
    pub entry_points: BTreeMap<String, EntryPoint>,
    pub providers: Providers,
    pub api: ApiToggle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Providers {
    pub file: FileProvider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProvider {
    pub directory: String,
    pub watch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiToggle {
    pub insecure: bool,
    pub dashboard: bool,
}

/// Fixed addresses the routing documents point at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTargets {
    /// The control panel's own API, routed under `/mock`
    pub backend_url: String,
    /// The static frontend, routed under `/`
    pub frontend_url: String,
    /// Entry point instance routers attach to
    pub entry_point: String,
    /// Listen address of that entry point
    pub entry_point_address: String,
    /// Directory watched by the file provider
    pub provider_dir: PathBuf,
}

impl RoutingTargets {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backend_url: format!("http://localhost:{}", config.server.port),
            frontend_url: config.routing.frontend_url.clone(),
            entry_point: config.routing.entry_point.clone(),
            entry_point_address: config.routing.entry_point_address.clone(),
            provider_dir: parent_dir(&config.routing.dynamic_config),
        }
    }
}

impl Default for RoutingTargets {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn path_prefix_rule(prefix: &str) -> String {
    format!("PathPrefix(`{}`)", prefix)
}

fn local_url(port: u16) -> String {
    format!("http://localhost:{}", port)
}

/// Router and service names owned by the fixed routes
const FIXED_ROUTE_NAMES: [&str; 3] = ["api", "backend", "frontend"];

/// Whether an alias name would share a key with a fixed or instance route
fn alias_collides(name: &str, instances: &[InstanceInfo]) -> bool {
    FIXED_ROUTE_NAMES.contains(&name)
        || instances.iter().any(|instance| {
            name == format!("mock-{}", instance.port)
                || name == format!("mock-{}-service", instance.port)
        })
}

/// Build the dynamic routing document
pub fn synthesize_dynamic(
    instances: &[InstanceInfo],
    aliases: &[Alias],
    targets: &RoutingTargets,
) -> DynamicConfig {
    let mut routers = BTreeMap::new();
    let mut services = BTreeMap::new();
    let mut middlewares = BTreeMap::new();

    for alias in aliases.iter().filter(|a| a.is_active) {
        if alias_collides(&alias.name, instances) {
            warn!(
                alias = %alias.name,
                port = alias.port,
                "Skipping alias that collides with a reserved route name"
            );
            continue;
        }

        let middleware = format!("strip-{}", alias.name);
        let prefix = format!("/{}", alias.name);

        routers.insert(
            alias.name.clone(),
            Router {
                entry_points: Vec::new(),
                rule: path_prefix_rule(&prefix),
                service: alias.name.clone(),
                middlewares: vec![middleware.clone()],
            },
        );
        services.insert(alias.name.clone(), Service::single(local_url(alias.port)));
        middlewares.insert(middleware, Middleware::strip(prefix));
    }

    for instance in instances {
        let router = format!("mock-{}", instance.port);
        let service = format!("mock-{}-service", instance.port);

        routers.insert(
            router,
            Router {
                entry_points: vec![targets.entry_point.clone()],
                rule: path_prefix_rule(&format!("/api/{}", instance.port)),
                service: service.clone(),
                middlewares: vec![STRIP_API_MIDDLEWARE.to_string()],
            },
        );
        services.insert(service, Service::single(local_url(instance.port)));
    }
    if !instances.is_empty() {
        middlewares.insert(STRIP_API_MIDDLEWARE.to_string(), Middleware::strip("/api"));
    }

    routers.insert(
        "api".to_string(),
        Router {
            entry_points: Vec::new(),
            rule: path_prefix_rule("/mock"),
            service: "backend".to_string(),
            middlewares: Vec::new(),
        },
    );
    services.insert("backend".to_string(), Service::single(targets.backend_url.clone()));

    routers.insert(
        "frontend".to_string(),
        Router {
            entry_points: Vec::new(),
            rule: path_prefix_rule("/"),
            service: "frontend".to_string(),
            middlewares: Vec::new(),
        },
    );
    services.insert("frontend".to_string(), Service::single(targets.frontend_url.clone()));

    DynamicConfig {
        http: HttpConfig {
            routers,
            services,
            middlewares: if middlewares.is_empty() {
                None
            } else {
                Some(middlewares)
            },
        },
    }
}

/// Build the static entry-point document
pub fn synthesize_static(targets: &RoutingTargets) -> StaticConfig {
    let mut entry_points = BTreeMap::new();
    entry_points.insert(
        targets.entry_point.clone(),
        EntryPoint {
            address: targets.entry_point_address.clone(),
        },
    );

    StaticConfig {
        entry_points,
        providers: Providers {
            file: FileProvider {
                directory: targets.provider_dir.to_string_lossy().into_owned(),
                watch: true,
            },
        },
        api: ApiToggle {
            insecure: true,
            dashboard: true,
        },
    }
}

pub fn render_dynamic(config: &DynamicConfig) -> Result<String> {
    serde_yaml::to_string(config).context("Failed to serialize dynamic routing configuration")
}

pub fn render_static(config: &StaticConfig) -> Result<String> {
    serde_yaml::to_string(config).context("Failed to serialize static routing configuration")
}

/// Replace `path` with `contents` via a temp file in the same directory
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create routing directory {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Where aliases come from when the dynamic document is rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasMode {
    /// Query the alias source, degrading to no aliases on failure
    Query,
    /// Treat the alias set as empty (first-time bootstrap)
    Skip,
}

/// Writes the routing documents to their well-known paths
pub struct RoutingPublisher {
    dynamic_path: PathBuf,
    static_path: PathBuf,
    targets: RoutingTargets,
    aliases: Arc<dyn AliasSource>,
}

impl RoutingPublisher {
    pub fn new(
        dynamic_path: impl Into<PathBuf>,
        static_path: impl Into<PathBuf>,
        targets: RoutingTargets,
        aliases: Arc<dyn AliasSource>,
    ) -> Self {
        Self {
            dynamic_path: dynamic_path.into(),
            static_path: static_path.into(),
            targets,
            aliases,
        }
    }

    pub fn from_config(config: &Config, aliases: Arc<dyn AliasSource>) -> Self {
        Self::new(
            config.routing.dynamic_config.clone(),
            config.routing.static_config.clone(),
            RoutingTargets::from_config(config),
            aliases,
        )
    }

    pub fn dynamic_path(&self) -> &Path {
        &self.dynamic_path
    }

    pub fn static_path(&self) -> &Path {
        &self.static_path
    }

    pub fn targets(&self) -> &RoutingTargets {
        &self.targets
    }

    /// Active aliases; a failing source is logged and treated as empty
    pub fn load_aliases(&self, mode: AliasMode) -> Vec<Alias> {
        match mode {
            AliasMode::Skip => Vec::new(),
            AliasMode::Query => match self.aliases.active_aliases() {
                Ok(aliases) => aliases,
                Err(e) => {
                    let degraded = ControlError::DependencyDegraded(format!("{:#}", e));
                    warn!(
                        code = degraded.code().as_header_value(),
                        error = %degraded,
                        "Failed to get aliases, routing without them"
                    );
                    Vec::new()
                }
            },
        }
    }

    /// Rebuild and write the dynamic document, returns the alias count used
    pub fn publish_dynamic(&self, instances: &[InstanceInfo], mode: AliasMode) -> Result<usize> {
        let aliases = self.load_aliases(mode);
        let document = synthesize_dynamic(instances, &aliases, &self.targets);
        write_atomic(&self.dynamic_path, &render_dynamic(&document)?)?;

        info!(
            path = %self.dynamic_path.display(),
            instances = instances.len(),
            aliases = aliases.len(),
            "Generated dynamic routing configuration"
        );
        Ok(aliases.len())
    }

    pub fn publish_static(&self) -> Result<()> {
        let document = synthesize_static(&self.targets);
        write_atomic(&self.static_path, &render_static(&document)?)?;

        info!(path = %self.static_path.display(), "Generated static routing configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::StaticAliases;
    use chrono::Utc;

    fn instance(port: u16) -> InstanceInfo {
        InstanceInfo {
            port,
            config_file: format!("mock-{}.json", port),
            start_time: Utc::now(),
            correlation_id: None,
            pid: None,
        }
    }

    struct FailingAliases;

    impl AliasSource for FailingAliases {
        fn active_aliases(&self) -> Result<Vec<Alias>> {
            anyhow::bail!("database is locked")
        }
    }

    #[test]
    fn test_empty_state_has_only_fixed_routes() {
        let doc = synthesize_dynamic(&[], &[], &RoutingTargets::default());

        let routers: Vec<_> = doc.http.routers.keys().map(String::as_str).collect();
        assert_eq!(routers, vec!["api", "frontend"]);
        assert_eq!(doc.http.routers["api"].rule, "PathPrefix(`/mock`)");
        assert_eq!(doc.http.routers["frontend"].rule, "PathPrefix(`/`)");
        assert_eq!(doc.http.services["backend"].urls(), vec!["http://localhost:3600"]);
        assert_eq!(doc.http.services["frontend"].urls(), vec!["http://localhost:3005"]);
        assert!(doc.http.middlewares.is_none());

        let yaml = render_dynamic(&doc).unwrap();
        assert!(!yaml.contains("middlewares"));
    }

    #[test]
    fn test_alias_routes() {
        let aliases = vec![Alias::active("billing", 9101)];
        let doc = synthesize_dynamic(&[], &aliases, &RoutingTargets::default());

        let router = &doc.http.routers["billing"];
        assert_eq!(router.rule, "PathPrefix(`/billing`)");
        assert_eq!(router.service, "billing");
        assert_eq!(router.middlewares, vec!["strip-billing".to_string()]);
        assert!(router.entry_points.is_empty());
        assert_eq!(doc.http.services["billing"].urls(), vec!["http://localhost:9101"]);

        let middlewares = doc.http.middlewares.unwrap();
        assert_eq!(
            middlewares["strip-billing"].strip_prefix.prefixes,
            vec!["/billing".to_string()]
        );
        assert!(!middlewares.contains_key(STRIP_API_MIDDLEWARE));
    }

    #[test]
    fn test_inactive_alias_is_ignored() {
        let mut alias = Alias::active("billing", 9101);
        alias.is_active = false;
        let doc = synthesize_dynamic(&[], &[alias], &RoutingTargets::default());
        assert!(!doc.http.routers.contains_key("billing"));
    }

    #[test]
    fn test_instance_routes_share_strip_api() {
        let doc = synthesize_dynamic(
            &[instance(9001), instance(9002)],
            &[],
            &RoutingTargets::default(),
        );

        for port in [9001u16, 9002] {
            let router = &doc.http.routers[&format!("mock-{}", port)];
            assert_eq!(router.rule, format!("PathPrefix(`/api/{}`)", port));
            assert_eq!(router.service, format!("mock-{}-service", port));
            assert_eq!(router.middlewares, vec![STRIP_API_MIDDLEWARE.to_string()]);
            assert_eq!(router.entry_points, vec!["web".to_string()]);
            assert_eq!(
                doc.http.services[&format!("mock-{}-service", port)].urls(),
                vec![format!("http://localhost:{}", port)]
            );
        }

        let middlewares = doc.http.middlewares.unwrap();
        assert_eq!(middlewares.len(), 1);
        assert_eq!(
            middlewares[STRIP_API_MIDDLEWARE].strip_prefix.prefixes,
            vec!["/api".to_string()]
        );
    }

    #[test]
    fn test_colliding_aliases_are_skipped() {
        let aliases = vec![
            Alias::active("frontend", 9500),
            Alias::active("backend", 9501),
            Alias::active("api", 9502),
            Alias::active("mock-9001", 9503),
            Alias::active("billing", 9101),
        ];
        let doc = synthesize_dynamic(&[instance(9001)], &aliases, &RoutingTargets::default());

        assert_eq!(doc.http.routers["frontend"].rule, "PathPrefix(`/`)");
        assert_eq!(doc.http.services["frontend"].urls(), vec!["http://localhost:3005"]);
        assert_eq!(doc.http.routers["api"].service, "backend");
        assert!(!doc.http.routers.contains_key("backend"));
        assert_eq!(doc.http.routers["mock-9001"].rule, "PathPrefix(`/api/9001`)");
        assert_eq!(doc.http.services["mock-9001-service"].urls(), vec!["http://localhost:9001"]);
        assert!(!doc.http.services.contains_key("mock-9001"));

        let middlewares = doc.http.middlewares.unwrap();
        let names: Vec<_> = middlewares.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["strip-api", "strip-billing"]);
        assert_eq!(middlewares["strip-api"].strip_prefix.prefixes, vec!["/api"]);
        assert_eq!(doc.http.routers.len(), 4);
    }

    #[test]
    fn test_render_is_deterministic() {
        let aliases = vec![Alias::active("zeta", 9200), Alias::active("alpha", 9201)];
        let forward = vec![instance(9003), instance(9001), instance(9002)];
        let mut reversed = forward.clone();
        reversed.reverse();

        let targets = RoutingTargets::default();
        let a = render_dynamic(&synthesize_dynamic(&forward, &aliases, &targets)).unwrap();
        let b = render_dynamic(&synthesize_dynamic(&reversed, &aliases, &targets)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rendered_yaml_uses_proxy_keys() {
        let doc = synthesize_dynamic(&[instance(9001)], &[], &RoutingTargets::default());
        let yaml = render_dynamic(&doc).unwrap();

        assert!(yaml.contains("entryPoints:"));
        assert!(yaml.contains("loadBalancer:"));
        assert!(yaml.contains("stripPrefix:"));
        assert!(yaml.contains("url: http://localhost:9001"));

        let parsed: DynamicConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_static_document() {
        let mut config = Config::default();
        config.routing.dynamic_config = PathBuf::from("/etc/proxy/dynamic/routes.yml");
        let doc = synthesize_static(&RoutingTargets::from_config(&config));

        assert_eq!(doc.entry_points["web"].address, ":80");
        assert_eq!(doc.providers.file.directory, "/etc/proxy/dynamic");
        assert!(doc.providers.file.watch);
        assert!(doc.api.insecure);
        assert!(doc.api.dashboard);

        let yaml = render_static(&doc).unwrap();
        assert!(yaml.contains("entryPoints:"));
        assert!(
            yaml.contains("address: :80")
                || yaml.contains("address: ':80'")
                || yaml.contains("address: \":80\"")
        );
    }

    #[test]
    fn test_publish_writes_both_documents() {
        let dir = tempfile::TempDir::new().unwrap();
        let dynamic = dir.path().join("traefik").join("dynamic.yml");
        let statik = dir.path().join("traefik").join("traefik.yml");
        let publisher = RoutingPublisher::new(
            &dynamic,
            &statik,
            RoutingTargets::default(),
            Arc::new(StaticAliases(vec![Alias::active("billing", 9101)])),
        );

        assert_eq!(publisher.publish_dynamic(&[instance(9001)], AliasMode::Query).unwrap(), 1);
        publisher.publish_static().unwrap();

        let written = std::fs::read_to_string(&dynamic).unwrap();
        assert!(written.contains("PathPrefix(`/billing`)"));
        assert!(written.contains("PathPrefix(`/api/9001`)"));
        assert!(std::fs::read_to_string(&statik).unwrap().contains("watch: true"));
    }

    #[test]
    fn test_publish_overwrites_and_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let dynamic = dir.path().join("dynamic.yml");
        std::fs::write(&dynamic, "hand: edited\n").unwrap();
        let publisher = RoutingPublisher::new(
            &dynamic,
            dir.path().join("traefik.yml"),
            RoutingTargets::default(),
            Arc::new(StaticAliases::default()),
        );

        publisher.publish_dynamic(&[instance(9001)], AliasMode::Query).unwrap();
        let first = std::fs::read(&dynamic).unwrap();
        publisher.publish_dynamic(&[instance(9001)], AliasMode::Query).unwrap();
        let second = std::fs::read(&dynamic).unwrap();

        assert_eq!(first, second);
        assert!(!String::from_utf8(first).unwrap().contains("hand"));
    }

    #[test]
    fn test_failing_alias_source_degrades_to_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let publisher = RoutingPublisher::new(
            dir.path().join("dynamic.yml"),
            dir.path().join("traefik.yml"),
            RoutingTargets::default(),
            Arc::new(FailingAliases),
        );

        assert!(publisher.load_aliases(AliasMode::Query).is_empty());
        assert_eq!(publisher.publish_dynamic(&[], AliasMode::Query).unwrap(), 0);
    }

    #[test]
    fn test_skip_mode_does_not_query() {
        let publisher = RoutingPublisher::new(
            "dynamic.yml",
            "traefik.yml",
            RoutingTargets::default(),
            Arc::new(StaticAliases(vec![Alias::active("billing", 9101)])),
        );
        assert!(publisher.load_aliases(AliasMode::Skip).is_empty());
        assert_eq!(publisher.load_aliases(AliasMode::Query).len(), 1);
    }
}
