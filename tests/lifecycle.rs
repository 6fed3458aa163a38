//! End-to-end behavior of the control layer without the HTTP front end

use std::sync::Arc;
use std::thread;

use mockgate::alias::{Alias, AliasStore};
use mockgate::config::Config;
use mockgate::controller::{LifecycleController, StartRequest};
use mockgate::registry::{InstanceRegistry, MockInstance};
use mockgate::routing::{
    render_dynamic, synthesize_dynamic, AliasMode, RoutingPublisher, RoutingTargets,
};
use mockgate::store::{sanitize_filename, ConfigStore};
use tempfile::TempDir;
use tokio::net::TcpListener;

fn build(dir: &TempDir, aliases: AliasStore) -> LifecycleController {
    let mut config = Config::default();
    config.paths.configs_dir = dir.path().join("configs");
    config.paths.upload_dir = dir.path().join("uploads");
    config.paths.logs_dir = dir.path().join("logs");
    config.routing.dynamic_config = dir.path().join("routing").join("dynamic.yml");
    config.routing.static_config = dir.path().join("routing").join("traefik.yml");
    config.mock.command = "sleep 60".to_string();
    config.mock.allow_any_port = true;
    config.mock.shutdown_grace_period_secs = 1;

    std::fs::create_dir_all(&config.paths.configs_dir).unwrap();
    for name in ["alpha.json", "beta.json"] {
        std::fs::write(config.paths.configs_dir.join(name), r#"{"name":"mock"}"#).unwrap();
    }

    let store = ConfigStore::new(&config.paths.configs_dir, "json");
    let publisher = RoutingPublisher::from_config(&config, Arc::new(aliases));
    LifecycleController::new(&config, Arc::new(InstanceRegistry::new()), store, publisher).unwrap()
}

#[test]
fn test_sanitized_names_never_traverse() {
    let names = [
        "../../etc/passwd",
        "..\\..\\boot.ini",
        ".../...//x",
        "a/../b",
        "....\\\\....",
        "normal.json",
    ];
    for name in names {
        let clean = sanitize_filename(name);
        assert!(!clean.contains(".."), "{:?} -> {:?}", name, clean);
        assert!(!clean.contains('/'), "{:?} -> {:?}", name, clean);
        assert!(!clean.contains('\\'), "{:?} -> {:?}", name, clean);
    }
}

#[tokio::test]
async fn test_occupied_port_conflict_leaves_registry_alone() {
    let dir = TempDir::new().unwrap();
    let controller = build(&dir, AliasStore::open_in_memory().unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let err = controller
        .start(StartRequest::new(port as i64, "alpha.json"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(controller.registry().get(port).is_none());
    assert!(controller.registry().is_empty());
}

#[tokio::test]
async fn test_missing_document_spawns_nothing() {
    let dir = TempDir::new().unwrap();
    let controller = build(&dir, AliasStore::open_in_memory().unwrap());

    let err = controller
        .start(StartRequest::new(9555, "gamma.json"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(controller.registry().is_empty());
    assert!(!dir.path().join("logs").join("mock-9555.log").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_same_document_on_two_ports() {
    let dir = TempDir::new().unwrap();
    let aliases = AliasStore::open_in_memory().unwrap();
    aliases
        .upsert_alias(&Alias {
            name: "billing".to_string(),
            port: 9101,
            file_name: "alpha.json".to_string(),
            is_active: true,
        })
        .unwrap();
    let controller = build(&dir, aliases);

    let mut listeners = Vec::new();
    for _ in 0..2 {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let ports: Vec<u16> = listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect();
    drop(listeners);

    for &port in &ports {
        let started = controller
            .start(StartRequest::new(port as i64, "alpha.json"))
            .await
            .unwrap();
        assert_eq!(started.config_file, "alpha.json");
        assert_eq!(controller.registry().get(port).unwrap().config_file(), "alpha.json");
    }

    let routing = std::fs::read_to_string(dir.path().join("routing").join("dynamic.yml")).unwrap();
    for &port in &ports {
        assert!(routing.contains(&format!("mock-{}-service", port)));
    }
    assert!(routing.contains("strip-billing"));
    assert!(routing.contains("strip-api"));

    assert!(controller.delete_config("alpha.json").unwrap_err().is_conflict());
    controller.delete_config("beta.json").unwrap();
    assert!(!controller.store().exists("beta.json"));

    for &port in &ports {
        controller.stop(port).await.unwrap();
        assert!(controller.registry().get(port).is_none());
    }

    let routing = std::fs::read_to_string(dir.path().join("routing").join("dynamic.yml")).unwrap();
    assert!(!routing.contains("strip-api"));
    assert!(routing.contains("strip-billing"));
}

#[test]
fn test_regenerate_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let controller = build(&dir, AliasStore::open_in_memory().unwrap());
    controller.registry().add(9002, MockInstance::new(9002, "beta.json"));
    controller.registry().add(9001, MockInstance::new(9001, "alpha.json"));

    let path = dir.path().join("routing").join("dynamic.yml");
    controller.regenerate(AliasMode::Query).unwrap();
    let first = std::fs::read(&path).unwrap();
    controller.regenerate(AliasMode::Query).unwrap();
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first, second);

    let expected = render_dynamic(&synthesize_dynamic(
        &controller.registry().list(),
        &[],
        controller.publisher().targets(),
    ))
    .unwrap();
    assert_eq!(String::from_utf8(first).unwrap(), expected);
}

#[test]
fn test_zero_state_document_has_two_routers() {
    let doc = synthesize_dynamic(&[], &[], &RoutingTargets::default());
    assert_eq!(doc.http.routers.len(), 2);
    assert_eq!(doc.http.services.len(), 2);
    assert!(doc.http.middlewares.is_none());
}

#[test]
fn test_concurrent_registry_churn() {
    let registry = Arc::new(InstanceRegistry::new());
    let workers: Vec<_> = (0..16u16)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for round in 0..50u16 {
                    let port = 10_000 + worker * 100 + round;
                    registry.add(port, MockInstance::new(port, "alpha.json"));
                    let _ = registry.list();
                    assert!(registry.get(port).is_some());
                    registry.remove(port);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert!(registry.is_empty());
}
