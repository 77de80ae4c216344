//! Tests for prefab-core: manifest loading, merging, and errors

use prefab_core::*;
use std::path::Path;

fn pkg(name: &str) -> Package {
    Package::new(name)
}

fn dir(path: &str) -> Directory {
    Directory {
        path: path.into(),
        mode: None,
    }
}

fn fragment(packages: &[&str], dirs: &[&str]) -> Manifest {
    Manifest {
        packages: packages.iter().map(|p| pkg(p)).collect(),
        directories: dirs.iter().map(|d| dir(d)).collect(),
        ..Default::default()
    }
}

// ===========================================================================
// Merge
// ===========================================================================

#[test]
fn merge_appends_other_after_base() {
    let merged = fragment(&["git"], &["/srv"]).merged(fragment(&["nginx", "git"], &["/srv/www"]));
    let names: Vec<_> = merged.packages.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["git", "nginx", "git"]);
    assert_eq!(merged.directories, vec![dir("/srv"), dir("/srv/www")]);
}

#[test]
fn merge_is_associative() {
    let a = fragment(&["a1", "a2"], &["/a"]);
    let b = fragment(&["b1"], &[]);
    let c = fragment(&["c1", "c2"], &["/c"]);

    let left = a.clone().merged(b.clone()).merged(c.clone());
    let right = a.merged(b.merged(c));
    assert_eq!(left, right);
}

#[test]
fn merge_with_empty_is_identity() {
    let a = fragment(&["nginx"], &["/srv"]);
    assert_eq!(a.clone().merged(Manifest::default()), a);
    assert_eq!(Manifest::default().merged(a.clone()), a);
}

#[test]
fn collect_merges_in_iteration_order() {
    let merged: Manifest = vec![fragment(&["one"], &[]), fragment(&["two"], &[])]
        .into_iter()
        .collect();
    let names: Vec<_> = merged.packages.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["one", "two"]);
}

// ===========================================================================
// Loading
// ===========================================================================

#[test]
fn load_json_uses_wire_field_names() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("web.json");
    std::fs::write(
        &path,
        r#"{
            "apt_packages": [{"name": "nginx", "version": "1.18.0"}],
            "personal_package_archives": [{"name": "nginx/stable"}],
            "postgres_databases": [{"name": "app", "owner": "app"}],
            "postgres_database_users": [{"name": "app"}],
            "ruby_bundles": [{"directory": "/srv/app"}],
            "templates": [{"source": "nginx.conf.tmpl", "destination": "/etc/nginx/nginx.conf"}]
        }"#,
    )
    .unwrap();

    let m = Manifest::load(&path).unwrap();
    assert_eq!(m.packages[0].qualified_name(), "nginx=1.18.0");
    assert_eq!(m.package_archives[0].name, "nginx/stable");
    assert_eq!(m.databases[0].owner.as_deref(), Some("app"));
    assert!(!m.database_users[0].superuser);
    assert!(!m.bundles[0].deployment);
    assert_eq!(m.templates[0].source, tmp.path().join("nginx.conf.tmpl"));
    assert_eq!(m.len(), 6);
}

#[test]
fn load_yaml_by_extension() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("base.yaml");
    std::fs::write(
        &path,
        "users:\n  - name: deploy\n    shell: /bin/bash\nservices:\n  - name: ssh\n",
    )
    .unwrap();

    let m = Manifest::load(&path).unwrap();
    assert_eq!(m.users[0].name, "deploy");
    assert_eq!(m.users[0].shell.as_deref(), Some("/bin/bash"));
    assert_eq!(m.services[0].name, "ssh");
}

#[test]
fn load_reports_path_on_bad_input() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = Manifest::load(&path).unwrap_err();
    assert!(matches!(err, Error::InvalidManifest { .. }));
    assert!(err.to_string().contains("broken.json"));

    let missing = Manifest::load(Path::new("/nonexistent/prefab.json")).unwrap_err();
    assert!(matches!(missing, Error::InvalidManifest { .. }));
}

#[test]
fn to_json_round_trips() {
    let m = fragment(&["nginx"], &["/srv"]);
    assert_eq!(Manifest::from_json(&m.to_json()).unwrap(), m);
}

// ===========================================================================
// Errors
// ===========================================================================

#[test]
fn apply_failed_display_includes_kind_and_cause() {
    let err = Error::apply_failed(
        ResourceKind::Service,
        "nginx",
        Error::command_failed("systemctl enable --now nginx", "exit status: 1", "unit not found"),
    );
    let msg = err.to_string();
    assert!(msg.starts_with("service nginx:"));
    assert!(msg.contains("unit not found"));
}

#[test]
fn cancelled_is_detectable() {
    assert!(Error::Cancelled.is_cancelled());
    assert!(!Error::Internal("boom".into()).is_cancelled());
}
