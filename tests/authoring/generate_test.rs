//! Fragment authoring through the signer and registry seams.

use std::path::{Path, PathBuf};

use serde_json::json;

use confcom::authoring::{generate_fragment, FragmentRequest, Publish, SigningMaterial};
use confcom::error::ConfcomError;
use confcom::policy::spec_file::build_from_spec_file;
use confcom::policy::{BuildOptions, DenyWildcards, FragmentInclude, PolicySpec};
use confcom::trust::{generate_import_statement, Algorithm};

use crate::support::{FakeRegistry, FakeSigner};

fn spec() -> PolicySpec {
    let document = json!({
        "containers": [{
            "name": "sidecar",
            "properties": {
                "image": "contoso.azurecr.io/sidecar:2.1",
                "command": ["/sidecar"]
            }
        }]
    });
    match build_from_spec_file(&document, &BuildOptions::default(), &DenyWildcards) {
        Ok(spec) => spec,
        Err(err) => panic!("spec should compile: {err}"),
    }
}

fn signing(dir: &Path) -> SigningMaterial {
    let key = dir.join("key.pem");
    let chain = dir.join("chain.pem");
    std::fs::write(&key, "KEY").expect("key");
    std::fs::write(&chain, "CHAIN").expect("chain");
    SigningMaterial {
        key,
        chain,
        algorithm: Algorithm::ES384,
    }
}

fn request(output_dir: PathBuf) -> FragmentRequest {
    FragmentRequest {
        namespace: "contoso_sidecar".to_owned(),
        svn: "4".to_owned(),
        feed: None,
        output_dir,
        signing: None,
        publish: None,
    }
}

#[tokio::test]
async fn unsigned_fragment_is_only_rendered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signer = FakeSigner::new();
    let registry = FakeRegistry::default();

    let outcome = generate_fragment(&spec(), &request(dir.path().join("out")), &signer, &registry)
        .await
        .expect("renders");

    assert_eq!(outcome.rego_path, dir.path().join("out/contoso_sidecar.rego"));
    assert_eq!(outcome.feed, "contoso.azurecr.io/sidecar");
    assert!(outcome.signed_path.is_none());
    assert!(outcome.issuer.is_none());
    let text = std::fs::read_to_string(&outcome.rego_path).expect("rego written");
    assert!(text.starts_with("package contoso_sidecar"));
    assert!(text.contains("svn := \"4\""));
    assert!(signer.signed.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn signed_fragment_is_attached_and_importable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signer = FakeSigner::new();
    let registry = FakeRegistry::default();
    let mut request = request(dir.path().to_path_buf());
    request.signing = Some(signing(dir.path()));
    request.publish = Some(Publish::AttachTo("contoso.azurecr.io/sidecar:2.1".to_owned()));

    let outcome = generate_fragment(&spec(), &request, &signer, &registry)
        .await
        .expect("signs");

    let signed = outcome.signed_path.clone().expect("signed path");
    assert_eq!(signed, dir.path().join("contoso_sidecar.rego.cose"));
    assert_eq!(outcome.issuer.as_deref(), Some(signer.issuer.as_str()));

    let sign_requests = signer.signed.lock().expect("lock").clone();
    assert_eq!(sign_requests.len(), 1);
    assert_eq!(sign_requests[0].feed.as_deref(), Some("contoso.azurecr.io/sidecar"));
    assert_eq!(sign_requests[0].issuer.as_deref(), Some(signer.issuer.as_str()));

    let attached = registry.attached.lock().expect("lock").clone();
    assert_eq!(
        attached,
        vec![("contoso.azurecr.io/sidecar:2.1".to_owned(), signed.clone())]
    );
    assert!(registry.pushed.lock().expect("lock").is_empty());

    let import = generate_import_statement(&signer, &signed, "4")
        .await
        .expect("imports");
    assert_eq!(import.feed, "contoso.azurecr.io/sidecar");
    assert_eq!(import.issuer, signer.issuer);
    assert_eq!(
        import.includes,
        vec![FragmentInclude::Containers, FragmentInclude::Fragments]
    );
}

#[tokio::test]
async fn explicit_feed_and_push_destination_are_used() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signer = FakeSigner::new();
    let registry = FakeRegistry::default();
    let mut request = request(dir.path().to_path_buf());
    request.feed = Some("contoso.azurecr.io/fragments/sidecar".to_owned());
    request.signing = Some(signing(dir.path()));
    request.publish = Some(Publish::PushTo(
        "contoso.azurecr.io/fragments/sidecar:4".to_owned(),
    ));

    let outcome = generate_fragment(&spec(), &request, &signer, &registry)
        .await
        .expect("signs");
    assert_eq!(outcome.feed, "contoso.azurecr.io/fragments/sidecar");
    let pushed = registry.pushed.lock().expect("lock").clone();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].1, "contoso.azurecr.io/fragments/sidecar:4");
}

#[tokio::test]
async fn publishing_without_signing_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signer = FakeSigner::new();
    let registry = FakeRegistry::default();
    let mut request = request(dir.path().to_path_buf());
    request.publish = Some(Publish::PushTo("contoso.azurecr.io/x:1".to_owned()));

    let result = generate_fragment(&spec(), &request, &signer, &registry).await;
    assert!(matches!(result, Err(ConfcomError::UserInput(_))));
    assert!(!dir.path().join("contoso_sidecar.rego").exists());
}

#[tokio::test]
async fn invalid_namespace_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signer = FakeSigner::new();
    let registry = FakeRegistry::default();
    let mut request = request(dir.path().to_path_buf());
    request.namespace = "not a package".to_owned();

    let result = generate_fragment(&spec(), &request, &signer, &registry).await;
    assert!(matches!(result, Err(ConfcomError::UserInput(_))));
}
