//! Coverage for config parsing and path resolution.

use std::path::PathBuf;
use std::time::Duration;

use confcom::config::{config_dir, ConfcomConfig, TimeoutsConfig};
use confcom::registry::FRAGMENT_ARTIFACT_TYPE;
use confcom::trust::Algorithm;

#[test]
fn default_timeouts() {
    let timeouts = TimeoutsConfig::default();
    assert_eq!(timeouts.signing_secs, 60);
    assert_eq!(timeouts.registry_secs, 120);
}

#[test]
fn config_dir_resolves() {
    let path = match config_dir() {
        Ok(path) => path,
        Err(err) => panic!("config_dir should resolve: {err}"),
    };
    assert!(path.ends_with(".confcom"));
}

#[test]
fn full_toml_round_trips_every_section() {
    let config = ConfcomConfig::from_toml(
        r#"
        [tools]
        sign1util = "/opt/cose/sign1util"
        oras = "/opt/oras/oras"

        [timeouts]
        signing_secs = 10
        registry_secs = 30

        [signing]
        algorithm = "es512"

        [registry]
        artifact_type = "application/x-test-frag"

        [paths]
        scratch_dir = "/var/tmp/confcom-scratch"
        "#,
    );
    let config = match config {
        Ok(config) => config,
        Err(err) => panic!("config should parse: {err}"),
    };
    assert_eq!(config.tools.sign1util, "/opt/cose/sign1util");
    assert_eq!(config.tools.oras, "/opt/oras/oras");
    assert_eq!(config.signing_timeout(), Duration::from_secs(10));
    assert_eq!(config.registry_timeout(), Duration::from_secs(30));
    assert_eq!(config.algorithm().expect("valid algorithm"), Algorithm::ES512);
    assert_eq!(config.registry.artifact_type, "application/x-test-frag");
    assert_eq!(
        config.paths.scratch_dir,
        PathBuf::from("/var/tmp/confcom-scratch")
    );
}

#[test]
fn empty_toml_is_all_defaults() {
    let config = ConfcomConfig::from_toml("").expect("empty config parses");
    assert_eq!(config.registry.artifact_type, FRAGMENT_ARTIFACT_TYPE);
    assert_eq!(config.algorithm().expect("valid default"), Algorithm::ES384);
    assert!(config.paths.scratch_dir.ends_with("confcom"));
}

#[test]
fn unknown_algorithm_is_reported_on_use() {
    let config = ConfcomConfig::from_toml("[signing]\nalgorithm = \"RS1\"\n").expect("parses");
    assert!(config.algorithm().is_err());
}

#[test]
fn mistyped_field_is_rejected() {
    assert!(ConfcomConfig::from_toml("[timeouts]\nsigning_secs = \"soon\"\n").is_err());
}
