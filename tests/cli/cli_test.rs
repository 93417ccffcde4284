//! CLI contract tests.

use std::path::Path;

use assert_cmd::Command;
use base64::Engine;
use serde_json::{json, Value};

fn confcom(dir: &Path) -> Command {
    let mut cmd = match Command::cargo_bin("confcom") {
        Ok(cmd) => cmd,
        Err(err) => panic!("confcom binary should build: {err}"),
    };
    cmd.env("CONFCOM_CONFIG_PATH", dir.join("absent.toml"))
        .env("RUST_LOG", "warn");
    cmd
}

fn write_json(path: &Path, value: &Value) {
    std::fs::write(path, value.to_string()).expect("write json");
}

fn template() -> Value {
    json!({
        "parameters": {
            "image": {"type": "string", "defaultValue": "nginx:1.25"}
        },
        "resources": [{
            "type": "Microsoft.ContainerInstance/containerGroups",
            "name": "web",
            "properties": {
                "containers": [{
                    "name": "web",
                    "properties": {
                        "image": "[parameters('image')]",
                        "command": ["nginx", "-g", "daemon off;"],
                        "environmentVariables": [{"name": "MODE", "value": "prod"}]
                    }
                }]
            }
        }]
    })
}

#[test]
fn help_lists_subcommands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = confcom(dir.path()).arg("--help").output().expect("runs");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["policy", "fragment", "sign", "verify", "import", "discover", "push", "attach"] {
        assert!(stdout.contains(subcommand), "missing {subcommand} in help");
    }
}

#[test]
fn policy_from_template_as_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    let template_path = dir.path().join("template.json");
    let parameters_path = dir.path().join("parameters.json");
    write_json(&template_path, &template());
    write_json(
        &parameters_path,
        &json!({"parameters": {"image": {"value": "contoso.azurecr.io/web:2.0"}}}),
    );

    let output = confcom(dir.path())
        .args(["policy", "--template"])
        .arg(&template_path)
        .arg("--parameters")
        .arg(&parameters_path)
        .args(["--output", "json"])
        .output()
        .expect("runs");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let policy: Value = serde_json::from_slice(&output.stdout).expect("json policy");
    assert_eq!(policy["containers"][0]["id"], "contoso.azurecr.io/web:2.0");
    let env = policy["containers"][0]["env_rules"][0]["pattern"].clone();
    assert_eq!(env, "MODE=prod");
}

#[test]
fn policy_rego_written_to_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let template_path = dir.path().join("template.json");
    let out_path = dir.path().join("policy.rego");
    write_json(&template_path, &template());

    confcom(dir.path())
        .args(["policy", "--template"])
        .arg(&template_path)
        .arg("--out-file")
        .arg(&out_path)
        .assert()
        .success();

    let text = std::fs::read_to_string(&out_path).expect("rego written");
    assert!(text.starts_with("package policy"));
    assert!(text.contains("nginx:1.25"));
}

#[test]
fn policy_without_resources_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let template_path = dir.path().join("template.json");
    write_json(&template_path, &json!({"resources": []}));

    let output = confcom(dir.path())
        .args(["policy", "--template"])
        .arg(&template_path)
        .output()
        .expect("runs");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn import_requires_image_or_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    confcom(dir.path())
        .args(["import", "--minimum-svn", "1", "--fragments-json"])
        .arg(dir.path().join("imports.json"))
        .assert()
        .failure();
}

#[test]
fn template_only_flags_are_rejected_with_spec_file_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("spec.json");
    write_json(&input, &json!({"version": "1.0", "containers": []}));

    for flag in [["--exclude-default-fragments"].as_slice(), ["--infrastructure-svn", "2"].as_slice()] {
        let output = confcom(dir.path())
            .args(["policy", "--input"])
            .arg(&input)
            .args(flag)
            .output()
            .expect("runs");
        assert!(!output.status.success(), "{flag:?} accepted with --input");
        assert!(output.stdout.is_empty());
    }
}

#[test]
fn policy_injected_into_template() {
    let dir = tempfile::tempdir().expect("tempdir");
    let template_path = dir.path().join("template.json");
    write_json(&template_path, &template());

    let output = confcom(dir.path())
        .args(["policy", "--inject", "--template"])
        .arg(&template_path)
        .output()
        .expect("runs");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let (group, hash) = stdout.trim().split_once(' ').expect("group and hash");
    assert_eq!(group, "web");
    assert_eq!(hash.len(), 64);
    assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));

    let text = std::fs::read_to_string(&template_path).expect("template rewritten");
    let rewritten: Value = serde_json::from_str(&text).expect("json template");
    let encoded = rewritten["resources"][0]["properties"]["confidentialComputeProperties"]
        ["ccePolicy"]
        .as_str()
        .expect("policy injected");
    let rego = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .expect("base64 policy");
    let rego = String::from_utf8(rego).expect("utf-8 policy");
    assert!(rego.starts_with("package policy"));
    assert!(rego.contains("nginx:1.25"));
    assert_eq!(
        rewritten["parameters"]["image"]["defaultValue"],
        "nginx:1.25",
        "template expressions are kept unevaluated"
    );
}

#[test]
fn inject_requires_template() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("spec.json");
    write_json(&input, &json!({"version": "1.0", "containers": []}));
    confcom(dir.path())
        .args(["policy", "--inject", "--input"])
        .arg(&input)
        .assert()
        .failure();
}
