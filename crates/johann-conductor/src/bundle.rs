use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::JohannConfig;

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// sha256 over the JSON-encoded, sorted list of per-file sha256 digests of
/// every file matched by `manifest` (globs relative to `root`).
pub fn calculate_codehash(root: &Path, manifest: &[String]) -> Result<String> {
    let mut files = BTreeSet::new();
    for pattern in manifest {
        let full = root.join(pattern);
        let entries = glob::glob(&full.to_string_lossy())
            .map_err(|e| anyhow!("invalid codehash pattern '{}': {}", pattern, e))?;
        for entry in entries {
            let path = entry?;
            if path.is_file() {
                files.insert(path);
            }
        }
    }
    let mut digests = Vec::with_capacity(files.len());
    for path in &files {
        digests.push(sha256_file(path)?);
    }
    digests.sort();
    let encoded = serde_json::to_string(&digests)?;
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn excluded_from_bundle(rel: &Path) -> bool {
    rel.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        name.starts_with('.')
            || name == "__pycache__"
            || name == "scores"
            || name.starts_with("minirepo")
            || name.ends_with(".log")
            || (name.starts_with("johann.") && name.ends_with(".zip"))
            || name.contains(".zip.tmp.")
    })
}

/// Zips `root` into `dest`, skipping dot-files, caches, scores, logs and
/// earlier bundles. Written to a temp file first, then renamed into place.
pub fn create_bundle(root: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension(format!("zip.tmp.{}", std::process::id()));
    let file = fs::File::create(&tmp).map_err(|e| anyhow!("failed to create {}: {}", tmp.display(), e))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let walker = walkdir::WalkDir::new(root).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(root).unwrap_or(e.path());
        rel.as_os_str().is_empty() || !excluded_from_bundle(rel)
    });
    for entry in walker {
        let entry = entry?;
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };
        let name = rel.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut source = fs::File::open(entry.path())?;
            io::copy(&mut source, &mut zip)?;
        }
    }
    let mut file = zip.finish()?;
    file.flush()?;
    fs::rename(&tmp, dest)?;
    Ok(())
}

/// The conductor's code version and the bundle that ships it.
#[derive(Debug, Clone)]
pub struct CodeVersion {
    pub codehash: String,
    source_root: PathBuf,
    bundle_dir: PathBuf,
    build_lock: Arc<Mutex<()>>,
}

impl CodeVersion {
    pub fn from_config(config: &JohannConfig) -> Result<CodeVersion> {
        let codehash = calculate_codehash(&config.source_root, &config.codehash_files)?;
        debug!("conductor codehash {}", codehash);
        Ok(CodeVersion {
            codehash,
            source_root: config.source_root.clone(),
            bundle_dir: config.bundle_dir.clone(),
            build_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.bundle_dir.join(format!("johann.{}.zip", self.codehash))
    }

    /// Builds the bundle for this code version unless it already exists.
    pub fn ensure_bundle(&self) -> Result<PathBuf> {
        let _guard = self.build_lock.lock();
        let path = self.bundle_path();
        if path.is_file() {
            debug!("bundle {} already present", path.display());
            return Ok(path);
        }
        create_bundle(&self.source_root, &path)?;
        debug!("created bundle {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Read;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "johann_bundle_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(dir.join("agent")).expect("mkdir");
        fs::write(dir.join("agent").join("main.py"), "print('hi')\n").expect("write");
        fs::write(dir.join("requirements.txt"), "celery\n").expect("write");
        dir
    }

    fn manifest() -> Vec<String> {
        vec!["agent/**/*".to_string(), "requirements.txt".to_string()]
    }

    #[test]
    fn codehash_is_stable_and_content_sensitive() {
        let root = temp_root("hash");
        let first = calculate_codehash(&root, &manifest()).expect("hash");
        assert_eq!(first, calculate_codehash(&root, &manifest()).expect("hash again"));
        assert_eq!(first.len(), 64);

        fs::write(root.join("agent").join("main.py"), "print('changed')\n").expect("write");
        assert_ne!(first, calculate_codehash(&root, &manifest()).expect("changed"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn codehash_ignores_files_outside_manifest() {
        let root = temp_root("manifest");
        let before = calculate_codehash(&root, &manifest()).expect("hash");
        fs::write(root.join("notes.md"), "unrelated").expect("write");
        assert_eq!(before, calculate_codehash(&root, &manifest()).expect("hash"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn bundle_skips_excluded_entries() {
        let root = temp_root("zip");
        fs::create_dir_all(root.join("scores")).expect("mkdir");
        fs::write(root.join("scores").join("s.yaml"), "name: s").expect("write");
        fs::write(root.join(".env"), "SECRET=1").expect("write");
        fs::write(root.join("run.log"), "log").expect("write");

        let dest = root.join("out").join("johann.test.zip");
        create_bundle(&root, &dest).expect("bundle");
        let file = fs::File::open(&dest).expect("open");
        let mut archive = zip::ZipArchive::new(file).expect("archive");
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert!(names.iter().any(|n| n == "agent/main.py"));
        assert!(names.iter().any(|n| n == "requirements.txt"));
        assert!(!names.iter().any(|n| n.starts_with("scores")));
        assert!(!names.iter().any(|n| n == ".env" || n == "run.log"));

        let mut body = String::new();
        archive
            .by_name("agent/main.py")
            .expect("entry")
            .read_to_string(&mut body)
            .expect("read");
        assert_eq!(body, "print('hi')\n");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn ensure_bundle_builds_once_per_hash() {
        let root = temp_root("version");
        let config = JohannConfig {
            source_root: root.clone(),
            bundle_dir: root.join("bundles"),
            codehash_files: manifest(),
            ..JohannConfig::default()
        };
        let version = CodeVersion::from_config(&config).expect("version");
        let path = version.ensure_bundle().expect("bundle");
        assert!(path.ends_with(format!("johann.{}.zip", version.codehash)));
        let modified = fs::metadata(&path).expect("meta").modified().expect("mtime");
        let again = version.ensure_bundle().expect("bundle again");
        assert_eq!(path, again);
        assert_eq!(modified, fs::metadata(&again).expect("meta").modified().expect("mtime"));
        let _ = fs::remove_dir_all(root);
    }
}
