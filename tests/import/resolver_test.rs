//! Import resolution against in-memory registry and signer fakes.

use std::path::Path;

use confcom::error::{ConfcomError, TrustError};
use confcom::import::{ImportResolver, ImportsFile};
use confcom::policy::FragmentInclude;

use crate::support::{fragment_payload, verifier_output, FakeRegistry, FakeSigner};

const ISSUER: &str = "did:x509:0:sha256:abc::subject:CN:Contoso";
const FEED: &str = "contoso.azurecr.io/infra";

fn envelope(svn: u64) -> String {
    verifier_output(ISSUER, FEED, &fragment_payload("infra", svn))
}

fn scratch_entries(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn fragments_at_or_above_minimum_are_imported() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let registry = FakeRegistry::default()
        .with_artifact("sha256:five", &envelope(5))
        .with_artifact("sha256:seven", &envelope(7));
    let signer = FakeSigner::new();
    let resolver = ImportResolver::new(&registry, &signer, scratch.path());

    let imports = resolver
        .resolve_all("contoso.azurecr.io/app:v1", "5")
        .await
        .expect("resolves");

    // Both envelopes share issuer, feed and minimum, so they collapse.
    assert_eq!(imports.len(), 1);
    let import = &imports[0];
    assert_eq!(import.issuer, ISSUER);
    assert_eq!(import.feed, FEED);
    assert_eq!(import.minimum_svn, "5");
    assert_eq!(
        import.includes,
        vec![FragmentInclude::Containers, FragmentInclude::Fragments]
    );
    assert_eq!(signer.checked.lock().expect("lock").len(), 2);
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn fragment_below_minimum_fails_the_whole_resolution() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let registry = FakeRegistry::default()
        .with_artifact("sha256:seven", &envelope(7))
        .with_artifact("sha256:three", &envelope(3));
    let signer = FakeSigner::new();
    let resolver = ImportResolver::new(&registry, &signer, scratch.path());

    match resolver.resolve_all("contoso.azurecr.io/app:v1", "5").await {
        Err(ConfcomError::Trust(TrustError::SvnBelowMinimum {
            feed,
            found,
            minimum,
        })) => {
            assert_eq!(feed, FEED);
            assert_eq!(found, 3);
            assert_eq!(minimum, 5);
        }
        other => panic!("expected svn gate failure, got {other:?}"),
    }
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn scratch_is_cleaned_when_verification_fails() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let registry = FakeRegistry::default().with_artifact("sha256:bad", "INVALID envelope");
    let signer = FakeSigner::new();
    let resolver = ImportResolver::new(&registry, &signer, scratch.path());

    let result = resolver.resolve_all("nginx", "1").await;
    assert!(matches!(
        result,
        Err(ConfcomError::Trust(TrustError::VerificationFailed { .. }))
    ));
    let pulled_to = registry.pulled_to.lock().expect("lock").clone();
    assert_eq!(pulled_to.len(), 1);
    assert!(!pulled_to[0].exists());
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn malformed_digest_never_becomes_a_scratch_path() {
    let root = tempfile::tempdir().expect("tempdir");
    let scratch = root.path().join("scratch");
    let neighbour = root.path().join("keep.txt");
    std::fs::write(&neighbour, "keep").expect("write neighbour");

    for digest in ["..", ".", "sha256:../../etc"] {
        let registry = FakeRegistry::default().with_artifact(digest, &envelope(5));
        let signer = FakeSigner::new();
        let resolver = ImportResolver::new(&registry, &signer, &scratch);

        let result = resolver.resolve_all("nginx", "1").await;
        assert!(
            matches!(result, Err(ConfcomError::UnexpectedOutput { .. })),
            "{digest:?} gave {result:?}"
        );
        assert!(registry.pulled_to.lock().expect("lock").is_empty());
        assert!(neighbour.exists(), "{digest:?} removed a file outside scratch");
    }
}

#[tokio::test]
async fn missing_svn_in_payload_is_rejected() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let registry = FakeRegistry::default().with_artifact(
        "sha256:nosvn",
        &verifier_output(ISSUER, FEED, "package infra\ncontainers := []\n"),
    );
    let signer = FakeSigner::new();
    let resolver = ImportResolver::new(&registry, &signer, scratch.path());
    assert!(matches!(
        resolver.resolve_all("nginx", "1").await,
        Err(ConfcomError::Trust(TrustError::MissingSvn { .. }))
    ));
}

#[tokio::test]
async fn no_attached_fragments_yields_empty_list() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let registry = FakeRegistry::default();
    let signer = FakeSigner::new();
    let resolver = ImportResolver::new(&registry, &signer, scratch.path());
    let imports = resolver.resolve_all("nginx", "1").await.expect("resolves");
    assert!(imports.is_empty());
}

#[tokio::test]
async fn invalid_minimum_is_rejected_before_contacting_registry() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let registry = FakeRegistry::default().with_artifact("sha256:five", &envelope(5));
    let signer = FakeSigner::new();
    let resolver = ImportResolver::new(&registry, &signer, scratch.path());
    assert!(matches!(
        resolver.resolve_all("nginx", "five").await,
        Err(ConfcomError::Trust(TrustError::InvalidSvn(_)))
    ));
    assert!(registry.pulled_to.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn local_envelope_resolves_and_appends_to_imports_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signed = dir.path().join("infra.rego.cose");
    std::fs::write(&signed, envelope(2)).expect("write envelope");
    let imports_path = dir.path().join("imports.json");
    std::fs::write(
        &imports_path,
        r#"{"version": "1", "fragments": [
            {"issuer": "did:x509:other", "feed": "other/feed", "minimum_svn": "1", "includes": ["containers"]}
        ]}"#,
    )
    .expect("write imports");

    let registry = FakeRegistry::default();
    let signer = FakeSigner::new();
    let resolver = ImportResolver::new(&registry, &signer, dir.path().join("scratch"));
    let import = resolver.resolve_path(&signed, "2").await.expect("resolves");

    let mut file = ImportsFile::load(&imports_path).expect("loads");
    file.append([import.clone(), import]);
    file.write(&imports_path).expect("writes");

    let reloaded = ImportsFile::load(&imports_path).expect("reloads");
    assert_eq!(reloaded.fragments().len(), 2);
    assert_eq!(reloaded.fragments()[1].feed, FEED);

    let text = std::fs::read_to_string(&imports_path).expect("read");
    let document: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(document["version"], "1");
}

#[tokio::test]
async fn local_envelope_below_minimum_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signed = dir.path().join("infra.rego.cose");
    std::fs::write(&signed, envelope(1)).expect("write envelope");
    let registry = FakeRegistry::default();
    let signer = FakeSigner::new();
    let resolver = ImportResolver::new(&registry, &signer, dir.path());
    assert!(matches!(
        resolver.resolve_path(&signed, "2").await,
        Err(ConfcomError::Trust(TrustError::SvnBelowMinimum { found: 1, .. }))
    ));
}
