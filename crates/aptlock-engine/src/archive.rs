use crate::EngineError;
use std::io::Read;

/// Create the build context: a tar archive holding only `Dockerfile`.
pub fn build_context(dockerfile: &str) -> Result<Vec<u8>, EngineError> {
    single_file_archive("Dockerfile", dockerfile.as_bytes(), 0o400)
}

/// Cut `dockerfile` after the stage named `target`, making it the last stage.
///
/// Stages after the target are dropped; stages before it are kept whole, so
/// the result builds exactly what a `--target` build would.
pub fn dockerfile_through(dockerfile: &str, target: &str) -> Result<String, EngineError> {
    let mut out = String::with_capacity(dockerfile.len());
    let mut found = false;
    for line in dockerfile.lines() {
        if is_from_line(line) {
            if found {
                break;
            }
            found = stage_name(line) == Some(target);
        }
        out.push_str(line);
        out.push('\n');
    }
    if found {
        Ok(out)
    } else {
        Err(EngineError::NotFound(format!("no build stage named '{target}'")))
    }
}

fn is_from_line(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("FROM"))
}

/// `FROM [--flags] <image> AS <name>` names a stage.
fn stage_name(line: &str) -> Option<&str> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [.., as_kw, name] if words.len() >= 4 && as_kw.eq_ignore_ascii_case("AS") => Some(*name),
        _ => None,
    }
}

pub(crate) fn single_file_archive(
    name: &str,
    content: &[u8],
    mode: u32,
) -> Result<Vec<u8>, EngineError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_entry_type(tar::EntryType::Regular);

    let mut ar = tar::Builder::new(Vec::new());
    ar.append_data(&mut header, name, content)?;
    Ok(ar.into_inner()?)
}

/// Unwrap an archive expected to hold exactly one file and return its bytes.
pub fn single_entry(archive: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut ar = tar::Archive::new(archive);
    let mut entries = ar
        .entries()
        .map_err(|e| EngineError::Archive(format!("reading entries: {e}")))?;
    let mut entry = entries
        .next()
        .ok_or_else(|| EngineError::Archive("archive is empty".to_owned()))?
        .map_err(|e| EngineError::Archive(format!("reading header: {e}")))?;
    if entry.header().entry_type() != tar::EntryType::Regular {
        return Err(EngineError::Archive(format!(
            "expected a regular file, found {:?}",
            entry.header().entry_type()
        )));
    }

    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(|e| EngineError::Archive(format!("reading content: {e}")))?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_context_contains_dockerfile() {
        let ctx = build_context("FROM scratch\n").unwrap();
        let mut ar = tar::Archive::new(ctx.as_slice());
        let mut entries = ar.entries().unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("Dockerfile"));
        assert_eq!(entry.header().mode().unwrap(), 0o400);
        assert!(entries.next().is_none());
    }

    #[test]
    fn build_context_is_deterministic() {
        assert_eq!(build_context("FROM a\n").unwrap(), build_context("FROM a\n").unwrap());
    }

    const STAGED: &str = "FROM debian:bookworm-slim AS base
RUN apt-get update
FROM base AS build
RUN echo build
FROM build AS manifest
RUN apt list --installed -qq | tee /apt-installed.txt
FROM build
CMD [\"/usr/bin/bash\"]
";

    #[test]
    fn dockerfile_through_ends_at_target() {
        let cut = dockerfile_through(STAGED, "manifest").unwrap();
        assert!(cut.ends_with("FROM build AS manifest\nRUN apt list --installed -qq | tee /apt-installed.txt\n"));
        assert!(cut.starts_with("FROM debian:bookworm-slim AS base\n"));
        assert!(!cut.contains("CMD"));
    }

    #[test]
    fn dockerfile_through_first_stage() {
        let cut = dockerfile_through(STAGED, "base").unwrap();
        assert_eq!(cut, "FROM debian:bookworm-slim AS base\nRUN apt-get update\n");
    }

    #[test]
    fn dockerfile_through_flags_and_case() {
        let text = "from --platform=linux/amd64 debian as base\nRUN true\nFROM base\n";
        assert_eq!(
            dockerfile_through(text, "base").unwrap(),
            "from --platform=linux/amd64 debian as base\nRUN true\n"
        );
    }

    #[test]
    fn dockerfile_through_unknown_stage() {
        assert!(matches!(
            dockerfile_through(STAGED, "missing"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn single_entry_unwraps_content() {
        let ar = single_file_archive("apt-installed.txt", b"bash/stable 5.1-2 amd64 100\n", 0o644)
            .unwrap();
        assert_eq!(single_entry(&ar).unwrap(), b"bash/stable 5.1-2 amd64 100\n");
    }

    #[test]
    fn single_entry_rejects_garbage() {
        assert!(matches!(
            single_entry(b"definitely not a tar archive, but long enough to be read as a header block maybe"),
            Err(EngineError::Archive(_))
        ));
    }

    #[test]
    fn single_entry_rejects_empty_archive() {
        let ar = tar::Builder::new(Vec::new()).into_inner().unwrap();
        assert!(matches!(single_entry(&ar), Err(EngineError::Archive(_))));
    }
}
