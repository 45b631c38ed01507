use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lsbroker::{build_managers, server_config, FileEditor};
use lsbroker_config::{load_config, load_from_str};
use lsbroker_lsp::{ConnectionKind, LspError, ProjectPath};
use tempfile::TempDir;

const CONFIG: &str = r#"
[manager]
restart_limit = 2
shutdown_timeout_secs = 1

[servers.python]
command = "pylsp"
extensions = ["py"]
connection = "socket"
args = ["--tcp", "--port", "{port}"]

[servers.rust]
command = "lsbroker-test-no-such-binary"
extensions = ["rs"]
initialize_timeout_secs = 10

[servers.rust.initialization_options]
checkOnSave = false
"#;

#[test]
fn config_entries_become_launch_settings() {
    let config = load_from_str(CONFIG).unwrap();
    let rust = server_config("rust", &config.servers["rust"]).unwrap();
    assert_eq!(rust.language_id, "rust");
    assert_eq!(rust.connection, ConnectionKind::Stdio);
    assert_eq!(rust.initialize_timeout, Some(Duration::from_secs(10)));
    assert_eq!(
        rust.initialization_options,
        Some(serde_json::json!({ "checkOnSave": false }))
    );

    let python = server_config("python", &config.servers["python"]).unwrap();
    assert_eq!(python.connection, ConnectionKind::Socket);
    assert_eq!(python.args.last().map(String::as_str), Some("{port}"));
}

#[test]
fn one_manager_per_server_kind() {
    let config = load_from_str(CONFIG).unwrap();
    let managers = build_managers(&config).unwrap();
    let names: Vec<_> = managers.iter().map(|m| m.server_name()).collect();
    assert_eq!(names, vec!["python", "rust"]);
    assert_eq!(managers[1].options().restart_limit, 2);
    assert_eq!(managers[1].options().shutdown_timeout, Duration::from_secs(1));
    assert_eq!(managers[1].options().restart_window, Duration::from_secs(180));
}

#[tokio::test]
async fn missing_server_binary_reports_start_failure() {
    let tmp = TempDir::new().unwrap();
    let cfg_dir = tmp.path().join("config");
    std::fs::create_dir_all(&cfg_dir).unwrap();
    std::fs::write(cfg_dir.join("config.toml"), CONFIG).unwrap();
    let project = tmp.path().join("project");
    std::fs::create_dir_all(project.join("src")).unwrap();
    std::fs::write(project.join("src/main.rs"), "fn main() {}\n").unwrap();

    let config = load_config(&cfg_dir, Some(&project)).unwrap();
    let managers = build_managers(&config).unwrap();
    let rust = &managers[1];
    rust.project_paths_changed([ProjectPath::canonical(&project)])
        .await;
    rust.start_listening().await;

    let editor = Arc::new(FileEditor::new(1, Path::new("src/main.rs"), &project));
    let err = rust.editor_opened(editor).await.unwrap_err();
    assert!(matches!(err, LspError::StartFailed { .. }));
    assert!(rust.get_active_servers().is_empty());
    assert!(!rust.is_starting(&ProjectPath::canonical(&project)));

    // Files the server does not handle never start anything.
    let python = &managers[0];
    python
        .project_paths_changed([ProjectPath::canonical(&project)])
        .await;
    python.start_listening().await;
    let editor = Arc::new(FileEditor::new(2, Path::new("src/main.rs"), &project));
    assert!(python.editor_opened(editor).await.unwrap().is_none());

    rust.stop_all_servers().await;
    python.stop_all_servers().await;
}
