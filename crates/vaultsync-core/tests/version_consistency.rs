//! Ensures all workspace crates use `version.workspace = true`, that
//! the workspace version matches what the library reports, and that the
//! release profile keeps panics catchable.

use std::path::{Path, PathBuf};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(Path::parent)
        .expect("crate lives two levels below the workspace root")
        .to_path_buf()
}

fn read_toml(path: &Path) -> toml::Value {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
    raw.parse()
        .unwrap_or_else(|e| panic!("parse {}: {e}", path.display()))
}

/// Read the workspace version from the root Cargo.toml.
fn workspace_version() -> String {
    let doc = read_toml(&workspace_root().join("Cargo.toml"));
    doc["workspace"]["package"]["version"]
        .as_str()
        .expect("workspace.package.version")
        .to_string()
}

#[test]
fn all_members_use_workspace_version() {
    let root = workspace_root();
    let doc = read_toml(&root.join("Cargo.toml"));
    let members = doc["workspace"]["members"]
        .as_array()
        .expect("workspace.members");
    assert!(!members.is_empty());

    for member in members {
        let member = member.as_str().expect("member path");
        let manifest = read_toml(&root.join(member).join("Cargo.toml"));
        let inherits = manifest["package"]["version"]
            .get("workspace")
            .and_then(toml::Value::as_bool);
        assert_eq!(
            inherits,
            Some(true),
            "{member} should use version.workspace = true"
        );
    }
}

#[test]
fn workspace_version_matches_library_version() {
    let ws_version = workspace_version();
    assert_eq!(
        ws_version,
        vaultsync_core::VERSION,
        "workspace version ({}) != vaultsync_core::VERSION ({})",
        ws_version,
        vaultsync_core::VERSION
    );
}

#[test]
fn internal_dependency_pins_workspace_version() {
    let doc = read_toml(&workspace_root().join("Cargo.toml"));
    let pinned = doc["workspace"]["dependencies"]["vaultsync-core"]["version"]
        .as_str()
        .expect("vaultsync-core dependency version");
    assert_eq!(pinned, workspace_version());
}

#[test]
fn release_profile_unwinds_on_panic() {
    let doc = read_toml(&workspace_root().join("Cargo.toml"));
    let panic = doc
        .get("profile")
        .and_then(|p| p.get("release"))
        .and_then(|r| r.get("panic"))
        .and_then(toml::Value::as_str);
    // The event bus catches handler panics with `catch_unwind`.
    assert_ne!(panic, Some("abort"), "[profile.release] must not set panic = \"abort\"");
}
