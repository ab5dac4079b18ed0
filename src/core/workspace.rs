//! Output workspace preparation.
//!
//! Before any stage runs, the Java sources are copied into the output
//! directory (stages rewrite files in place there) and, if the scripts
//! directory ships a `checksums.sha256` manifest, every listed script is
//! checked against it.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

/// Manifest of expected script digests, relative to the scripts directory
pub const CHECKSUM_MANIFEST: &str = "checksums.sha256";

/// Progress reported once the workspace is ready
pub const WORKSPACE_READY_PROGRESS: f64 = 0.25;

/// Failures while preparing a run
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Source directory not found: {}", .0.display())]
    MissingSource(PathBuf),

    #[error("Invalid source pattern: {0}")]
    Pattern(String),

    #[error("Failed to copy {}: {source}", .path.display())]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed checksum line {line}: {content}")]
    Manifest { line: usize, content: String },

    #[error("Script listed in checksums is missing: {}", .0.display())]
    MissingScript(PathBuf),

    #[error("Checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

/// Copy every `*.java` file under `source_dir` into `output_dir`, keeping
/// relative paths. Returns the copied destination paths.
pub async fn prepare_output(
    source_dir: &Path,
    output_dir: &Path,
) -> Result<Vec<PathBuf>, WorkspaceError> {
    if !source_dir.is_dir() {
        return Err(WorkspaceError::MissingSource(source_dir.to_path_buf()));
    }

    let pattern = format!(
        "{}/**/*.java",
        glob::Pattern::escape(&source_dir.to_string_lossy())
    );
    // Collect before copying so an output dir inside the source is not rescanned.
    let sources: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| WorkspaceError::Pattern(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();

    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|source| WorkspaceError::Copy {
            path: output_dir.to_path_buf(),
            source,
        })?;

    let mut copied = Vec::with_capacity(sources.len());
    for path in sources {
        let relative = match path.strip_prefix(source_dir) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let destination = output_dir.join(relative);

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| WorkspaceError::Copy {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::copy(&path, &destination)
            .await
            .map_err(|source| WorkspaceError::Copy {
                path: path.clone(),
                source,
            })?;

        debug!(file = %relative.display(), "Copied source file");
        copied.push(destination);
    }

    info!(count = copied.len(), output = %output_dir.display(), "Prepared output directory");
    Ok(copied)
}

/// Verify scripts against `checksums.sha256`, if present.
///
/// Returns the number of verified scripts (zero when there is no manifest).
pub async fn verify_scripts(scripts_dir: &Path) -> Result<usize, WorkspaceError> {
    let manifest = scripts_dir.join(CHECKSUM_MANIFEST);
    if !manifest.exists() {
        debug!("No checksum manifest, skipping script verification");
        return Ok(0);
    }

    let content = tokio::fs::read_to_string(&manifest)
        .await
        .map_err(|source| WorkspaceError::Read {
            path: manifest.clone(),
            source,
        })?;

    let mut verified = 0;
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (expected, file) = parse_manifest_line(line).ok_or_else(|| WorkspaceError::Manifest {
            line: index + 1,
            content: line.to_string(),
        })?;

        let path = scripts_dir.join(file);
        if !path.is_file() {
            return Err(WorkspaceError::MissingScript(path));
        }

        let actual = file_digest(&path).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(WorkspaceError::ChecksumMismatch {
                path,
                expected: expected.to_string(),
                actual,
            });
        }
        verified += 1;
    }

    info!(verified, "Verified stage scripts");
    Ok(verified)
}

/// `<hex>  <file>` as written by `sha256sum` (a `*` before the name marks binary mode)
fn parse_manifest_line(line: &str) -> Option<(&str, &str)> {
    let (digest, rest) = line.split_once(char::is_whitespace)?;
    let file = rest.trim_start().trim_start_matches('*');
    let is_digest = digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit());
    if !is_digest || file.is_empty() {
        return None;
    }
    Some((digest, file))
}

/// Hex SHA-256 of a file's contents
pub async fn file_digest(path: &Path) -> Result<String, WorkspaceError> {
    let content = tokio::fs::read(path)
        .await
        .map_err(|source| WorkspaceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn sha256_hex(content: &str) -> String {
        hex::encode(Sha256::digest(content.as_bytes()))
    }

    #[tokio::test]
    async fn test_prepare_copies_java_sources() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let out = temp.path().join("out");
        write(&src.join("Main.java"), "class Main {}");
        write(&src.join("pkg/util/Helper.java"), "class Helper {}");
        write(&src.join("README.md"), "docs");

        let copied = prepare_output(&src, &out).await.unwrap();

        assert_eq!(copied.len(), 2);
        assert_eq!(
            std::fs::read_to_string(out.join("pkg/util/Helper.java")).unwrap(),
            "class Helper {}"
        );
        assert!(out.join("Main.java").exists());
        assert!(!out.join("README.md").exists());
    }

    #[tokio::test]
    async fn test_prepare_missing_source() {
        let temp = TempDir::new().unwrap();
        let result = prepare_output(&temp.path().join("nope"), &temp.path().join("out")).await;
        assert!(matches!(result, Err(WorkspaceError::MissingSource(_))));
    }

    #[tokio::test]
    async fn test_verify_without_manifest() {
        let temp = TempDir::new().unwrap();
        assert_eq!(verify_scripts(temp.path()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_verify_good_and_bad_checksums() {
        let temp = TempDir::new().unwrap();
        write(&temp.path().join("main.py"), "print('hi')\n");
        write(&temp.path().join("levelObfuscate.py"), "pass\n");

        let manifest = format!(
            "{}  main.py\n# comment\n{} *levelObfuscate.py\n",
            sha256_hex("print('hi')\n"),
            sha256_hex("pass\n"),
        );
        write(&temp.path().join(CHECKSUM_MANIFEST), &manifest);
        assert_eq!(verify_scripts(temp.path()).await.unwrap(), 2);

        write(&temp.path().join("main.py"), "print('tampered')\n");
        let result = verify_scripts(temp.path()).await;
        assert!(matches!(result, Err(WorkspaceError::ChecksumMismatch { .. })));
    }

    #[tokio::test]
    async fn test_verify_missing_script() {
        let temp = TempDir::new().unwrap();
        write(
            &temp.path().join(CHECKSUM_MANIFEST),
            &format!("{}  gone.py\n", sha256_hex("x")),
        );

        let result = verify_scripts(temp.path()).await;
        assert!(matches!(result, Err(WorkspaceError::MissingScript(_))));
    }

    #[test]
    fn test_manifest_line_parsing() {
        let digest = "a".repeat(64);
        assert_eq!(
            parse_manifest_line(&format!("{}  main.py", digest)),
            Some((digest.as_str(), "main.py"))
        );
        assert!(parse_manifest_line("abc main.py").is_none());
        assert!(parse_manifest_line(&digest).is_none());
    }
}
