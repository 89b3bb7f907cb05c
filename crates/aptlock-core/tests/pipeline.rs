use aptlock_core::buildspec::{DEB_HASHES_PATH, INSTALLED_LIST_PATH};
use aptlock_core::{Builder, BuilderOptions, CoreError, Phase};
use aptlock_engine::{BuildEngine, EngineCall, MockEngine, MockFailure};
use aptlock_schema::{parse_manifest_str, Lock, LockDiff, Manifest};
use std::sync::Arc;
use std::time::Duration;

const INSTALLED: &str = "bash/stable,now 5.1-2 amd64 [installed]\n\
                         coreutils/stable,now 8.32-4 amd64 [installed,automatic]\n\
                         WARNING: apt does not have a stable CLI interface.\n";
const HASHES: &str = "aaaa  bash_5.1-2_amd64.deb\n";

fn manifest() -> Manifest {
    parse_manifest_str(
        r#"{"image": "acme/base", "distro": "bookworm", "packages": {"bash": "stable"}}"#,
    )
    .unwrap()
}

fn engine() -> MockEngine {
    MockEngine::new()
        .with_base_parent(Some("sha256:feedface"))
        .with_file(INSTALLED_LIST_PATH, INSTALLED)
        .with_file(DEB_HASHES_PATH, HASHES)
}

fn builder(engine: &Arc<MockEngine>) -> Builder {
    let engine: Arc<dyn BuildEngine> = engine.clone();
    Builder::new(engine, BuilderOptions::default())
}

#[tokio::test]
async fn lock_builds_manifest_target_and_pins_parent() {
    let engine = Arc::new(engine());
    let extraction = builder(&engine).lock(&manifest(), None).await.unwrap();

    let lock = extraction.lock;
    assert_eq!(lock.image, "debian@sha256:feedface");
    assert_eq!(lock.package_count(), 2);
    assert_eq!(lock.packages["bash"].filehash, "aaaa");
    assert!(lock.packages["coreutils"].filehash.is_empty());
    assert_eq!(extraction.skipped_lines.len(), 1);

    let calls = engine.calls();
    match &calls[0] {
        EngineCall::Build { tag, target, dockerfile } => {
            assert_eq!(tag, "aptlock-manifest/acme/base");
            assert_eq!(target.as_deref(), Some("manifest"));
            assert!(dockerfile.starts_with("FROM debian:bookworm-slim AS base\n"));
        }
        other => panic!("expected a build first, got {other:?}"),
    }
    assert_eq!(calls[1], EngineCall::Inspect("aptlock-manifest/acme/base".to_owned()));
    assert_eq!(calls[2], EngineCall::Create("aptlock-manifest/acme/base".to_owned()));
    assert!(!calls.iter().any(|c| matches!(c, EngineCall::Start(_))));
}

#[tokio::test]
async fn lock_removes_container() {
    let engine = Arc::new(engine());
    builder(&engine).lock(&manifest(), None).await.unwrap();
    assert!(engine.live_containers().is_empty());
    assert!(matches!(engine.calls().last(), Some(EngineCall::Remove(_))));
}

#[tokio::test]
async fn lock_removes_container_when_extraction_fails() {
    let engine = Arc::new(
        MockEngine::new().with_file(INSTALLED_LIST_PATH, INSTALLED),
    );
    let err = builder(&engine).lock(&manifest(), None).await.unwrap_err();
    assert!(matches!(err, CoreError::CopyFile { ref path, .. } if path == DEB_HASHES_PATH));
    assert_eq!(err.phase(), Phase::ExtractLock);
    assert!(engine.live_containers().is_empty());
}

#[tokio::test]
async fn removal_failure_is_not_fatal() {
    let engine = Arc::new(engine().failing(MockFailure::Remove));
    let extraction = builder(&engine).lock(&manifest(), None).await.unwrap();
    assert_eq!(extraction.lock.package_count(), 2);
}

#[tokio::test]
async fn missing_parent_fails_inspect() {
    let engine = Arc::new(engine().with_base_parent(None));
    let err = builder(&engine).lock(&manifest(), None).await.unwrap_err();
    assert!(matches!(err, CoreError::MissingParent { .. }));
    assert_eq!(err.phase(), Phase::Inspect);
}

#[tokio::test]
async fn inspect_failure_is_reported_as_inspect() {
    let engine = Arc::new(engine().failing(MockFailure::Inspect));
    let err = builder(&engine).lock(&manifest(), None).await.unwrap_err();
    assert!(matches!(err, CoreError::Inspect { .. }));
    assert!(err.to_string().starts_with("inspect: "));
}

#[tokio::test]
async fn build_failures_are_distinguished() {
    let step = Arc::new(engine().failing(MockFailure::Step));
    let err = builder(&step).build(&manifest(), None).await.unwrap_err();
    assert!(matches!(err, CoreError::BuildStep { .. }));

    let decode = Arc::new(engine().failing(MockFailure::Decode));
    let err = builder(&decode).build(&manifest(), None).await.unwrap_err();
    assert!(matches!(err, CoreError::ProgressDecode { .. }));

    let transport = Arc::new(engine().failing(MockFailure::Transport));
    let err = builder(&transport).build(&manifest(), None).await.unwrap_err();
    assert!(matches!(err, CoreError::Build { .. }));
    assert_eq!(err.phase(), Phase::Build);
}

#[tokio::test]
async fn failed_build_never_reaches_inspect() {
    let engine = Arc::new(engine().failing(MockFailure::Step));
    builder(&engine).lock(&manifest(), None).await.unwrap_err();
    assert_eq!(engine.calls().len(), 1);
}

#[tokio::test]
async fn build_uses_final_target_and_lock_base() {
    let engine = Arc::new(engine());
    let mut lock = Lock::new("debian@sha256:deadbeef");
    lock.packages.insert(
        "bash".into(),
        aptlock_schema::LockedPackage {
            version: "5.1-2".to_owned(),
            architecture: "amd64".to_owned(),
            filename: "bash_5.1-2_amd64.deb".to_owned(),
            filehash: "aaaa".to_owned(),
        },
    );
    let outcome = builder(&engine).build(&manifest(), Some(&lock)).await.unwrap();
    assert_eq!(outcome.tag, "aptlock-build/acme/base");
    assert!(outcome.image_id.is_some());

    match &engine.calls()[0] {
        EngineCall::Build { target, dockerfile, .. } => {
            assert!(target.is_none());
            assert!(dockerfile.starts_with("FROM debian@sha256:deadbeef AS base\n"));
            assert!(dockerfile.contains("sha512sum -c SHASUMS"));
        }
        other => panic!("unexpected call {other:?}"),
    }
}

#[tokio::test]
async fn relock_is_idempotent() {
    let engine = Arc::new(engine());
    let b = builder(&engine);
    let first = b.lock(&manifest(), None).await.unwrap().lock;
    let second = b.lock(&manifest(), Some(&first)).await.unwrap().lock;
    assert_eq!(first.image, second.image);
    assert_eq!(
        first.packages.keys().collect::<Vec<_>>(),
        second.packages.keys().collect::<Vec<_>>()
    );
    assert!(LockDiff::between(&first, &second).is_empty());
}

#[tokio::test]
async fn deadline_cancels_build() {
    let engine = Arc::new(engine().with_build_delay(Duration::from_millis(200)));
    let options = BuilderOptions {
        timeout: Duration::from_millis(50),
        ..BuilderOptions::default()
    };
    let b = Builder::new(engine.clone(), options);
    let err = b.lock(&manifest(), None).await.unwrap_err();
    assert!(matches!(err, CoreError::Timeout { phase: Phase::Build, .. }));
    assert!(!engine.calls().iter().any(|c| matches!(c, EngineCall::Create(_))));
}

#[tokio::test]
async fn export_write_failure_removes_container() {
    let engine = Arc::new(engine());
    let out = std::path::Path::new("/nonexistent/aptlock/out.tar");
    let err = builder(&engine).export(&manifest(), None, Some(out)).await.unwrap_err();
    assert!(matches!(err, CoreError::ExportWrite { .. }));
    assert!(engine.calls().iter().any(|c| matches!(c, EngineCall::Create(_))));
    assert!(engine.live_containers().is_empty());
    assert!(engine.imported("acme/base").is_none());
}

#[tokio::test]
async fn export_imports_rootfs_as_manifest_image() {
    let engine = Arc::new(engine().with_output(b"pretend this is a tar stream".to_vec(), 0));
    let outcome = builder(&engine).export(&manifest(), None, None).await.unwrap();

    assert_eq!(outcome.tag, "aptlock-build/acme/base");
    assert_eq!(outcome.image, "acme/base");
    assert!(outcome.image_id.is_some());
    assert!(outcome.path.is_none());
    assert_eq!(outcome.bytes, 28);
    assert_eq!(
        engine.imported("acme/base").unwrap().as_ref(),
        b"pretend this is a tar stream"
    );
    assert!(engine.live_containers().is_empty());

    let calls = engine.calls();
    let attach = calls.iter().position(|c| matches!(c, EngineCall::Attach(_))).unwrap();
    let start = calls.iter().position(|c| matches!(c, EngineCall::Start(_))).unwrap();
    let import = calls.iter().position(|c| matches!(c, EngineCall::Import { .. })).unwrap();
    assert!(attach < start);
    assert!(start < import);
    assert_eq!(
        calls[import],
        EngineCall::Import {
            reference: "acme/base".to_owned(),
            bytes: 28,
        }
    );
}

#[tokio::test]
async fn export_also_writes_requested_tarball() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("rootfs.tar");
    let engine = Arc::new(engine().with_output(b"pretend this is a tar stream".to_vec(), 0));
    let outcome = builder(&engine).export(&manifest(), None, Some(&out)).await.unwrap();

    assert_eq!(outcome.path.as_deref(), Some(out.as_path()));
    assert_eq!(std::fs::read(&out).unwrap(), b"pretend this is a tar stream");
    assert!(engine.imported("acme/base").is_some());
}

#[tokio::test]
async fn export_nonzero_exit_imports_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("rootfs.tar");
    let engine = Arc::new(engine().with_output(b"partial".to_vec(), 2));
    let err = builder(&engine).export(&manifest(), None, Some(&out)).await.unwrap_err();
    assert!(matches!(err, CoreError::ExportExit { code: 2 }));
    assert_eq!(err.phase(), Phase::Export);
    assert!(!out.exists());
    assert!(engine.imported("acme/base").is_none());
    assert!(engine.live_containers().is_empty());
}

#[tokio::test]
async fn export_import_rejection_is_an_export_error() {
    let engine = Arc::new(engine().with_output(b"not a tar".to_vec(), 0).failing(MockFailure::Import));
    let err = builder(&engine).export(&manifest(), None, None).await.unwrap_err();
    assert!(matches!(err, CoreError::Export { ref context, .. } if context.contains("acme/base")));
    assert!(err.is_engine_error());
    assert!(engine.live_containers().is_empty());
}
