#![allow(deprecated)] // cargo_bin is deprecated but still functional

use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A workspace with a SQLite-backed config file.
struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("lodestar.toml");
        let db = dir.path().join("lodestar.db");
        fs::write(
            &config,
            format!(
                "[metadata]\ntype = \"sqlite\"\npath = \"{}\"\n\n[retention]\nbatch_size = 10\n",
                db.display()
            ),
        )
        .unwrap();
        Self { dir, config }
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn lodestar(&self) -> Command {
        let mut cmd = Command::cargo_bin("lodestar").unwrap();
        cmd.env_remove("RUST_LOG")
            .env_remove("LODESTAR_CONFIG")
            .arg("--config")
            .arg(&self.config);
        cmd
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.lodestar().args(args).output().unwrap();
        assert!(
            output.status.success(),
            "lodestar {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn help_lists_commands() {
    Command::cargo_bin("lodestar")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("recompute"))
        .stdout(contains("reclaim-references"))
        .stdout(contains("closest"));
}

#[test]
fn recompute_then_resolve_closest_upload() {
    let ws = Workspace::new();
    let graph = ws.write("graph.txt", "c1\nc2 c1\nc3 c2\n");
    let refs = ws.write(
        "refs.json",
        r#"{"c3": [{"name": "main", "type": "branch", "is_default_branch": true}]}"#,
    );

    let upload = ws.json(&[
        "upload",
        "add",
        "--repository",
        "1",
        "--commit",
        "c1",
        "--indexer",
        "scip-go",
    ]);
    let upload_id = upload["id"].as_i64().unwrap();
    assert_eq!(upload["state"], "completed");

    let status = ws.json(&["status", "--repository", "1"]);
    assert_eq!(status["stale"], true);

    let stats = ws.json(&[
        "recompute",
        "--repository",
        "1",
        "--graph",
        path_arg(&graph),
        "--refs",
        path_arg(&refs),
    ]);
    assert_eq!(stats["nearest_uploads"]["inserted"], 1);
    assert_eq!(stats["links"]["inserted"], 2);
    assert_eq!(stats["visible_at_tip"]["inserted"], 1);

    let status = ws.json(&["status", "--repository", "1"]);
    assert_eq!(status["stale"], false);

    let dumps = ws.json(&[
        "closest",
        "--repository",
        "1",
        "--commit",
        "c3",
        "--path",
        "cmd/main.go",
    ]);
    let dumps = dumps.as_array().unwrap();
    assert_eq!(dumps.len(), 1);
    assert_eq!(dumps[0]["id"].as_i64(), Some(upload_id));
    assert_eq!(dumps[0]["visible_at_tip"], true);

    let fragment = ws.write("fragment.txt", "c4 c3\n");
    let dumps = ws.json(&[
        "closest",
        "--repository",
        "1",
        "--commit",
        "c4",
        "--graph",
        path_arg(&fragment),
    ]);
    assert_eq!(dumps.as_array().unwrap().len(), 1);

    let page = ws.json(&[
        "commits",
        "--upload",
        &upload_id.to_string(),
        "--limit",
        "2",
    ]);
    assert_eq!(page["commits"], serde_json::json!(["c1", "c2"]));
    assert_eq!(page["next"], "c2");
}

#[test]
fn dirty_reports_marked_repositories() {
    let ws = Workspace::new();

    let marked = ws.json(&["mark-dirty", "--repository", "5"]);
    assert_eq!(marked["dirty_token"], 1);

    let report = ws.json(&["dirty"]);
    let repositories = report["repositories"].as_array().unwrap();
    assert_eq!(repositories.len(), 1);
    assert_eq!(repositories[0]["repository_id"], 5);
    assert!(report["max_stale_age_secs"].as_i64().unwrap() >= 0);
}

#[test]
fn reclaim_deletes_expired_unreferenced_upload() {
    let ws = Workspace::new();
    let upload = ws.json(&[
        "upload",
        "add",
        "--repository",
        "2",
        "--commit",
        "c1",
        "--indexer",
        "scip-go",
    ]);
    let id = upload["id"].as_i64().unwrap().to_string();

    let expired = ws.json(&["upload", "expire", "--ids", &id]);
    assert_eq!(expired[0]["expired"], true);

    let stats = ws.json(&["reclaim-references"]);
    assert_eq!(stats["scanned"], 1);
    assert_eq!(stats["deleted"], 1);

    let upload = ws.json(&["upload", "show", "--id", &id]);
    assert_eq!(upload["state"], "deleting");

    let stats = ws.json(&["reclaim-traversal"]);
    assert_eq!(stats["root"], serde_json::Value::Null);
}

#[test]
fn delete_unknown_upload_fails() {
    let ws = Workspace::new();
    ws.lodestar()
        .args(["upload", "delete", "--id", "404"])
        .assert()
        .failure()
        .stderr(contains("upload 404 not found"));
}

#[test]
fn recompute_rejects_cyclic_graph() {
    let ws = Workspace::new();
    let graph = ws.write("graph.txt", "a b\nb a\n");
    ws.lodestar()
        .args(["recompute", "--repository", "1", "--graph", path_arg(&graph)])
        .assert()
        .failure()
        .stderr(contains("invalid commit graph"));
}

#[test]
fn invalid_configuration_is_reported() {
    let ws = Workspace::new();
    let config = ws.write("bad.toml", "[metadata]\ntype = \"postgres\"\n");
    Command::cargo_bin("lodestar")
        .unwrap()
        .env_remove("LODESTAR_CONFIG")
        .arg("--config")
        .arg(&config)
        .arg("dirty")
        .assert()
        .failure()
        .stderr(contains("invalid configuration"));
}
