use log::debug;
use offload_api::Fingerprint;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::Path;

/// Bump when the entry layout or the binary image format changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Human-readable sidecar written next to each entry. Never read back for
/// validity; the entry header alone decides hits.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgramMeta {
    pub program: String,
    pub fingerprint: Fingerprint,
    pub entry_points: Vec<String>,
    pub image_bytes: usize,
    pub backend: String,
    pub version: Option<u32>,
}

/// Reads a cache entry; a missing file is `Ok(None)`.
pub fn read_entry(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Replaces `path` with `bytes` through a temporary file in the same
/// directory, so readers see either the old entry or the new one.
pub fn write_entry(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Writes the JSON sidecar. Returns whether it landed; failures are only
/// logged since nothing reads the sidecar back.
pub fn persist_program_meta(path: &Path, meta: &ProgramMeta) -> bool {
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            debug!(
                "program cache: failed to create {} for metadata: {err}",
                parent.display()
            );
        }
    }
    let json = match serde_json::to_vec_pretty(meta) {
        Ok(json) => json,
        Err(err) => {
            debug!("program cache: failed to encode metadata for '{}': {err}", meta.program);
            return false;
        }
    };
    match std::fs::write(path, json) {
        Ok(()) => true,
        Err(err) => {
            debug!(
                "program cache: failed to write metadata {}: {err}",
                path.display()
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_entries_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_entry(&dir.path().join("absent.bin")).unwrap().is_none());
    }

    #[test]
    fn write_replaces_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("p.bin");
        write_entry(&path, b"first").unwrap();
        write_entry(&path, b"second").unwrap();
        assert_eq!(read_entry(&path).unwrap().unwrap(), b"second");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    fn sample_meta() -> ProgramMeta {
        ProgramMeta {
            program: "p".into(),
            fingerprint: Fingerprint::new("n", "v", "d"),
            entry_points: vec!["main".into()],
            image_bytes: 20,
            backend: "in-process".into(),
            version: Some(CACHE_FORMAT_VERSION),
        }
    }

    #[test]
    fn meta_sidecar_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        assert!(persist_program_meta(&path, &sample_meta()));
        let meta: ProgramMeta = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(meta.program, "p");
        assert_eq!(meta.version, Some(CACHE_FORMAT_VERSION));
    }

    #[test]
    fn unwritable_sidecar_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let path = blocker.join("p.json");
        assert!(!persist_program_meta(&path, &sample_meta()));
        assert!(!path.exists());
    }
}
