//! Standalone spec files and fragment rendering.

use serde_json::json;

use confcom::policy::rego::{extract_namespace, extract_svn, render_fragment};
use confcom::policy::spec_file::{build_from_spec_file, load_spec_file};
use confcom::policy::{BuildOptions, DenyWildcards};

#[test]
fn spec_file_compiles_and_renders_as_fragment() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("spec.json");
    let document = json!({
        "version": "1.0",
        "containers": [{
            "name": "app",
            "properties": {
                "image": "contoso.azurecr.io/app:1.0",
                "command": ["/app", "--serve"],
                "environmentVariables": [{"name": "PORT", "value": "8080", "regex": false}],
                "volumeMounts": [{"mountType": "secret", "mountPath": "/secrets", "readonly": true}],
                "execProcesses": [{"command": ["/app", "--health"], "signals": []}]
            }
        }]
    });
    std::fs::write(&path, document.to_string()).expect("write spec");

    let loaded = load_spec_file(&path).expect("loads");
    let spec = build_from_spec_file(&loaded, &BuildOptions::default(), &DenyWildcards)
        .expect("compiles");
    assert_eq!(spec.containers[0].command, vec!["/app", "--serve"]);
    assert_eq!(spec.containers[0].env_rules[0].pattern, "PORT=8080");
    assert_eq!(spec.containers[0].mounts[0].options, vec!["rbind", "rshared", "ro"]);

    let text = render_fragment(&spec, "contoso_app", "3").expect("renders");
    assert_eq!(extract_namespace(&text).as_deref(), Some("contoso_app"));
    assert_eq!(extract_svn(&text), Some(3));
    assert!(text.contains("\"PORT=8080\""));
}

#[test]
fn top_level_array_spec_file_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("spec.json");
    std::fs::write(&path, "[]").expect("write spec");
    assert!(load_spec_file(&path).is_err());
}
