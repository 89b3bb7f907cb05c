use super::{json_pretty, spin_fail, spin_ok, Context, Failure, EXIT_SUCCESS};
use aptlock_core::{Builder, CoreError};
use aptlock_schema::{LockDiff, PackageName};
use console::Style;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct UpdateReport<'a> {
    lockfile: &'a Path,
    image: &'a str,
    packages: usize,
    hashed: usize,
    skipped_lines: &'a [String],
    missing_hashes: &'a [PackageName],
    diff: &'a LockDiff,
}

/// Re-resolve the package set and rewrite the lock file.
///
/// With `fresh`, the existing lock does not pin the rebuild.
pub async fn run(ctx: &Context, builder: &Builder, fresh: bool) -> Result<u8, Failure> {
    let project = ctx.load_project()?;
    let pin = if fresh { None } else { project.lock.as_ref() };
    let pb = ctx.spinner(&format!("resolving {}...", project.manifest.image));

    let extraction = match builder.lock(&project.manifest, pin).await {
        Ok(extraction) => extraction,
        Err(e) => {
            spin_fail(pb.as_ref(), "lock failed");
            return Err(e.into());
        }
    };

    let lock = &extraction.lock;
    let written = lock
        .validate()
        .and_then(|()| lock.write_to_file(&project.lock_path))
        .map_err(|source| CoreError::WriteLock {
            path: project.lock_path.clone(),
            source,
        });
    if let Err(e) = written {
        spin_fail(pb.as_ref(), "writing lock failed");
        return Err(e.into());
    }
    spin_ok(pb.as_ref(), &format!("wrote {}", project.lock_path.display()));
    tracing::info!(path = %project.lock_path.display(), "wrote lockfile");

    let previous = project.lock.clone().unwrap_or_default();
    let diff = LockDiff::between(&previous, lock);

    if ctx.json {
        let report = UpdateReport {
            lockfile: &project.lock_path,
            image: &lock.image,
            packages: lock.package_count(),
            hashed: lock.hashed_packages().count(),
            skipped_lines: &extraction.skipped_lines,
            missing_hashes: &extraction.missing_hashes,
            diff: &diff,
        };
        println!("{}", json_pretty(&report)?);
    } else {
        println!(
            "locked {} packages ({} with hashes) on {}",
            lock.package_count(),
            lock.hashed_packages().count(),
            lock.image
        );
        for line in render_diff(&diff) {
            println!("{line}");
        }
        if !extraction.skipped_lines.is_empty() {
            println!(
                "warning: skipped {} unrecognised output lines",
                extraction.skipped_lines.len()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

fn render_diff(diff: &LockDiff) -> Vec<String> {
    if diff.is_empty() {
        return vec!["no changes".to_owned()];
    }
    let added = Style::new().green();
    let removed = Style::new().red();
    let changed = Style::new().yellow();

    let mut lines = Vec::new();
    if let Some((from, to)) = &diff.image_changed {
        let from = if from.is_empty() { "(none)" } else { from.as_str() };
        lines.push(changed.apply_to(format!("  image: {from} -> {to}")).to_string());
    }
    for (name, version) in &diff.added {
        lines.push(added.apply_to(format!("  + {name} {version}")).to_string());
    }
    for change in &diff.changed {
        lines.push(
            changed
                .apply_to(format!("  ~ {} {} -> {}", change.name, change.from, change.to))
                .to_string(),
        );
    }
    for (name, version) in &diff.removed {
        lines.push(removed.apply_to(format!("  - {name} {version}")).to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use aptlock_core::buildspec::{DEB_HASHES_PATH, INSTALLED_LIST_PATH};
    use crate::commands::EXIT_ENGINE_ERROR;
    use aptlock_core::BuilderConfig;
    use aptlock_engine::{MockEngine, MockFailure};
    use aptlock_schema::{Lock, LockedPackage, LOCK_FILENAME, MANIFEST_FILENAME};
    use std::sync::Arc;

    const MANIFEST: &str = r#"{"image": "acme/base", "distro": "bookworm", "packages": {"bash": "stable"}}"#;
    const OLD_LOCK: &str = r#"{
  "image": "debian@sha256:deadbeef",
  "packages": {
    "bash": {"version": "5.1-2", "architecture": "amd64", "filename": "", "filehash": ""}
  }
}
"#;

    fn project(dir: &Path) -> Context {
        std::fs::write(dir.join(MANIFEST_FILENAME), MANIFEST).unwrap();
        std::fs::write(dir.join(LOCK_FILENAME), OLD_LOCK).unwrap();
        Context {
            dir: dir.to_path_buf(),
            manifest_name: MANIFEST_FILENAME.to_owned(),
            lock_name: LOCK_FILENAME.to_owned(),
            config: BuilderConfig::default(),
            json: true,
            progress: false,
        }
    }

    #[tokio::test]
    async fn failed_resolution_keeps_previous_lock() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = project(dir.path());
        let builder = ctx.builder_with(Arc::new(MockEngine::new().failing(MockFailure::Step)));

        let failure = run(&ctx, &builder, false).await.unwrap_err();
        assert_eq!(failure.code, EXIT_ENGINE_ERROR);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(LOCK_FILENAME)).unwrap(),
            OLD_LOCK
        );
    }

    #[tokio::test]
    async fn resolution_rewrites_lock() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = project(dir.path());
        let engine = MockEngine::new()
            .with_base_parent(Some("sha256:feedface"))
            .with_file(INSTALLED_LIST_PATH, "bash/stable,now 5.2-1 amd64 [installed]\n")
            .with_file(DEB_HASHES_PATH, "aaaa  bash_5.2-1_amd64.deb\n");
        let builder = ctx.builder_with(Arc::new(engine));

        assert_eq!(run(&ctx, &builder, false).await.unwrap(), EXIT_SUCCESS);
        let lock = Lock::read_from_file(&dir.path().join(LOCK_FILENAME)).unwrap();
        assert_eq!(lock.image, "debian@sha256:feedface");
        assert_eq!(lock.packages["bash"].version, "5.2-1");
        assert_eq!(lock.packages["bash"].filehash, "aaaa");
    }

    fn lock(image: &str, packages: &[(&str, &str)]) -> Lock {
        let mut lock = Lock::new(image);
        for (name, version) in packages {
            lock.packages.insert(
                PackageName::from(*name),
                LockedPackage {
                    version: (*version).to_owned(),
                    architecture: "amd64".to_owned(),
                    ..LockedPackage::default()
                },
            );
        }
        lock
    }

    #[test]
    fn render_diff_lists_every_change() {
        console::set_colors_enabled(false);
        let old = lock("debian@sha256:aaa", &[("bash", "5.1-2"), ("gzip", "1.10-4")]);
        let new = lock("debian@sha256:bbb", &[("bash", "5.2-1"), ("curl", "7.88-1")]);
        let lines = render_diff(&LockDiff::between(&old, &new));
        assert_eq!(
            lines,
            vec![
                "  image: debian@sha256:aaa -> debian@sha256:bbb",
                "  + curl 7.88-1",
                "  ~ bash 5.1-2 -> 5.2-1",
                "  - gzip 1.10-4",
            ]
        );
    }

    #[test]
    fn render_diff_first_lock() {
        console::set_colors_enabled(false);
        let new = lock("debian@sha256:bbb", &[("bash", "5.2-1")]);
        let lines = render_diff(&LockDiff::between(&Lock::default(), &new));
        assert_eq!(lines[0], "  image: (none) -> debian@sha256:bbb");
    }

    #[test]
    fn render_diff_unchanged() {
        let same = lock("debian@sha256:aaa", &[("bash", "5.1-2")]);
        assert_eq!(render_diff(&LockDiff::between(&same, &same)), vec!["no changes"]);
    }
}
