//! End-to-end bootstrap: load a minimal on-disk config, wire a `Manager`
//! against it, and confirm the project/node identifiers and module roster
//! come out the other side. The bus connects lazily (`rumqttc` never blocks
//! on an actual broker handshake in `connect`), so this runs without a
//! broker present, same as the teacher's `casparian_schema` end-to-end
//! contract tests run against an in-memory fixture rather than a live
//! service.

use std::io::Write;

use sensorflow_manager::Manager;
use tokio::sync::mpsc;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp config file");
    file.write_all(contents.as_bytes()).expect("write config");
    file.flush().expect("flush config");
    file
}

#[tokio::test]
async fn bootstrap_reads_project_and_node_from_config() {
    let config = write_config(
        r#"{
            "core": {
                "project": { "name": "Demo Project", "id": "demo" },
                "node": { "name": "Node One", "id": "node1" },
                "intercom": { "mqtt": { "host": "127.0.0.1", "port": 1883 } },
                "modules": {}
            },
            "sensors": {}
        }"#,
    );

    let (_tx, rx) = mpsc::unbounded_channel();
    let manager = Manager::bootstrap(config.path(), rx).await.expect("bootstrap must succeed");

    assert_eq!(manager.project_id(), "demo");
    assert_eq!(manager.node_id(), "node1");
    assert!(manager.module_names().is_empty());
}

#[tokio::test]
async fn bootstrap_instantiates_configured_modules_via_the_registry() {
    let config = write_config(
        r#"{
            "core": {
                "project": { "name": "Demo Project", "id": "demo" },
                "node": { "name": "Node One", "id": "node1" },
                "intercom": { "mqtt": { "host": "127.0.0.1", "port": 1883 } },
                "modules": { "pre1": "modules.processing.PreProcessor", "sink1": "modules.export.NullSink" }
            },
            "sensors": {},
            "pre1": {},
            "sink1": {}
        }"#,
    );

    let (_tx, rx) = mpsc::unbounded_channel();
    let mut manager = Manager::bootstrap(config.path(), rx).await.expect("bootstrap must succeed");

    let mut names = manager.module_names();
    names.sort_unstable();
    assert_eq!(names, vec!["pre1", "sink1"]);

    manager.kill_all();
}

#[tokio::test]
async fn bootstrap_rejects_unknown_class_path() {
    let config = write_config(
        r#"{
            "core": {
                "project": { "name": "Demo Project", "id": "demo" },
                "node": { "name": "Node One", "id": "node1" },
                "intercom": { "mqtt": { "host": "127.0.0.1", "port": 1883 } },
                "modules": { "ts1": "modules.totalstation.TotalStation" }
            },
            "sensors": {}
        }"#,
    );

    let (_tx, rx) = mpsc::unbounded_channel();
    let err = Manager::bootstrap(config.path(), rx).await.expect_err("unknown class path must fail bootstrap");
    assert!(matches!(err, sensorflow_manager::ManagerError::UnknownClass(_, _)));
}
