//! Compiled-program cache keyed by device identity.
//!
//! One file per program at `<dir>/<program>.bin`. An entry is used only when
//! its header matches the current device fingerprint byte for byte and its
//! image links on the device; anything else is a miss that recompiles and
//! rewrites the entry.

pub mod header;
pub mod metrics;
pub mod persist;

use log::{debug, info, warn};
use offload_api::{Fingerprint, OffloadError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::kernels::ProgramSpec;
use crate::session::{AcceleratorSession, Program};
use header::{CacheHeader, HeaderError, HeaderField};
use metrics::CacheMetrics;
use persist::{ProgramMeta, CACHE_FORMAT_VERSION};

/// Why a cached entry was not used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheMiss {
    Missing,
    Unreadable(String),
    Truncated { field: HeaderField },
    FingerprintMismatch { field: HeaderField },
    EmptyImage,
    LinkFailed(String),
}

impl fmt::Display for CacheMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheMiss::Missing => f.write_str("no cache entry"),
            CacheMiss::Unreadable(err) => write!(f, "entry unreadable: {err}"),
            CacheMiss::Truncated { field } => write!(f, "entry truncated in {field}"),
            CacheMiss::FingerprintMismatch { field } => write!(f, "{field} differs"),
            CacheMiss::EmptyImage => f.write_str("entry has no binary image"),
            CacheMiss::LinkFailed(reason) => write!(f, "cached image rejected: {reason}"),
        }
    }
}

impl From<HeaderError> for CacheMiss {
    fn from(err: HeaderError) -> Self {
        match err {
            HeaderError::Truncated(field) => CacheMiss::Truncated { field },
            HeaderError::Mismatch(field) => CacheMiss::FingerprintMismatch { field },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramOrigin {
    CacheHit,
    Compiled { miss: CacheMiss },
}

impl ProgramOrigin {
    pub fn is_hit(&self) -> bool {
        matches!(self, ProgramOrigin::CacheHit)
    }
}

impl fmt::Display for ProgramOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramOrigin::CacheHit => f.write_str("cache hit"),
            ProgramOrigin::Compiled { miss } => write!(f, "compiled ({miss})"),
        }
    }
}

pub struct CompiledProgram {
    pub program: Program,
    pub origin: ProgramOrigin,
}

pub struct ProgramCache {
    dir: PathBuf,
    source_dir: Option<PathBuf>,
    metrics: CacheMetrics,
}

impl ProgramCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            source_dir: None,
            metrics: CacheMetrics::new(),
        }
    }

    /// Reads kernel sources from `dir` instead of the embedded copies.
    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    /// Per-user cache directory, else a scratch directory under `target/`.
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .map(|d| d.join("offload").join("programs"))
            .unwrap_or_else(|| PathBuf::from("target/tmp/offload-programs"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn path_for(&self, spec: &ProgramSpec) -> PathBuf {
        self.dir.join(format!("{}.bin", spec.name))
    }

    fn meta_path_for(&self, spec: &ProgramSpec) -> PathBuf {
        self.dir.join(format!("{}.json", spec.name))
    }

    /// Header of the current entry for `spec`, if one can be read.
    pub fn inspect(&self, spec: &ProgramSpec) -> Option<(CacheHeader, usize)> {
        let bytes = persist::read_entry(&self.path_for(spec)).ok()??;
        CacheHeader::parse(&bytes).map(|(header, image)| (header, image.len()))
    }

    /// Loads the cached binary for the session's device, or compiles the
    /// program and refreshes the cache. Only compilation and source errors
    /// are fatal.
    pub fn get_program(
        &self,
        session: &AcceleratorSession,
        spec: &ProgramSpec,
    ) -> Result<CompiledProgram> {
        let fingerprint = session.device().fingerprint();
        let path = self.path_for(spec);
        let miss = match self.load_cached(session, spec, &path, &fingerprint) {
            Ok(program) => {
                self.metrics.inc_hit();
                info!("program cache: hit for '{}' at {}", spec.name, path.display());
                return Ok(CompiledProgram {
                    program,
                    origin: ProgramOrigin::CacheHit,
                });
            }
            Err(miss) => miss,
        };
        self.metrics.inc_miss();
        info!("program cache: miss for '{}' ({miss}), compiling", spec.name);

        let source = self.load_source(spec)?;
        let ctx = session.context();
        let started = Instant::now();
        let id = ctx.compile(spec.name, &source, spec.entry_points)?;
        let program = Program::new(Arc::clone(ctx), id, spec.name);
        self.metrics
            .set_last_compile_millis(started.elapsed().as_millis() as u64);
        debug!(
            "program cache: compiled '{}' in {} ms",
            spec.name,
            self.metrics.last_compile_millis()
        );

        let image = program.binary()?;
        self.store(session, spec, &path, &fingerprint, &image);
        Ok(CompiledProgram {
            program,
            origin: ProgramOrigin::Compiled { miss },
        })
    }

    fn load_cached(
        &self,
        session: &AcceleratorSession,
        spec: &ProgramSpec,
        path: &Path,
        fingerprint: &Fingerprint,
    ) -> std::result::Result<Program, CacheMiss> {
        let bytes = persist::read_entry(path)
            .map_err(|err| CacheMiss::Unreadable(err.to_string()))?
            .ok_or(CacheMiss::Missing)?;
        let image = CacheHeader::from_fingerprint(fingerprint).strip(&bytes)?;
        if image.is_empty() {
            return Err(CacheMiss::EmptyImage);
        }
        let ctx = session.context();
        match ctx.load_binary(spec.name, image, spec.entry_points) {
            Ok(id) => Ok(Program::new(Arc::clone(ctx), id, spec.name)),
            Err(err) => {
                if !err.is_recoverable() {
                    warn!("program cache: unexpected error loading '{}': {err}", spec.name);
                }
                Err(CacheMiss::LinkFailed(err.to_string()))
            }
        }
    }

    fn load_source(&self, spec: &ProgramSpec) -> Result<String> {
        match &self.source_dir {
            Some(dir) => {
                let path = dir.join(spec.source_file);
                debug!("program cache: reading source {}", path.display());
                std::fs::read_to_string(&path).map_err(|source| OffloadError::Source { path, source })
            }
            None => Ok(spec.embedded_source.to_string()),
        }
    }

    /// Writes the entry and its sidecar. Failures are logged, never returned.
    fn store(
        &self,
        session: &AcceleratorSession,
        spec: &ProgramSpec,
        path: &Path,
        fingerprint: &Fingerprint,
        image: &[u8],
    ) {
        let bytes = CacheHeader::from_fingerprint(fingerprint).encode(image);
        if let Err(err) = persist::write_entry(path, &bytes) {
            warn!(
                "program cache: could not write {}: {err}",
                path.display()
            );
            return;
        }
        persist::persist_program_meta(
            &self.meta_path_for(spec),
            &ProgramMeta {
                program: spec.name.to_string(),
                fingerprint: fingerprint.clone(),
                entry_points: spec.entry_points.iter().map(|e| e.to_string()).collect(),
                image_bytes: image.len(),
                backend: session.device().backend.clone(),
                version: Some(CACHE_FORMAT_VERSION),
            },
        );
        debug!(
            "program cache: stored '{}' ({} byte image) at {}",
            spec.name,
            image.len(),
            path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;
    use crate::simple_provider::InProcessPlatform;
    use offload_api::QueueProperties;

    fn session() -> AcceleratorSession {
        AcceleratorSession::open(&InProcessPlatform::new(), QueueProperties::default()).unwrap()
    }

    #[test]
    fn second_lookup_hits() {
        let dir = tempfile::tempdir().unwrap();
        let session = session();
        let cache = ProgramCache::new(dir.path());
        let first = cache.get_program(&session, &kernels::FINDMAX).unwrap();
        assert_eq!(first.origin, ProgramOrigin::Compiled { miss: CacheMiss::Missing });
        let second = cache.get_program(&session, &kernels::FINDMAX).unwrap();
        assert!(second.origin.is_hit());
        assert_eq!(cache.metrics().counters(), (1, 1));
        assert!(dir.path().join("findmax.json").exists());
    }

    #[test]
    fn empty_image_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let session = session();
        let cache = ProgramCache::new(dir.path());
        let header = CacheHeader::from_fingerprint(&session.device().fingerprint());
        std::fs::write(cache.path_for(&kernels::MATVEC), header.to_bytes()).unwrap();
        let compiled = cache.get_program(&session, &kernels::MATVEC).unwrap();
        assert_eq!(compiled.origin, ProgramOrigin::Compiled { miss: CacheMiss::EmptyImage });
    }

    #[test]
    fn source_dir_errors_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let session = session();
        let cache = ProgramCache::new(dir.path()).with_source_dir(dir.path().join("nowhere"));
        let err = cache.get_program(&session, &kernels::GEMM).err().unwrap();
        assert!(matches!(err, OffloadError::Source { .. }));
    }

    #[test]
    fn compile_errors_carry_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("matvec.wgsl"), "fn broken( {").unwrap();
        let session = session();
        let cache = ProgramCache::new(dir.path().join("cache")).with_source_dir(&src);
        match cache.get_program(&session, &kernels::MATVEC) {
            Err(OffloadError::Compile { program, log }) => {
                assert_eq!(program, "matvec");
                assert!(!log.is_empty());
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("broken source compiled"),
        }
        assert!(!cache.path_for(&kernels::MATVEC).exists());
    }
}
