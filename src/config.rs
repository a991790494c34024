//! Shared-memory bootstrap configuration.
//!
//! [`ShmConfig`] carries the few knobs the bootstrap needs. Values come from
//! [`Default`], from builder-style setters, or from the environment via
//! [`ShmConfig::from_env`]. [`ShmConfig::with_env`] lays the environment over
//! an existing configuration instead of the defaults.
//!
//! # Environment Variables
//!
//! | Variable | Field | Format |
//! |----------|-------|--------|
//! | `FERROLATTICE_SHM_BYTES` | `bytes` | integer, optional `K`/`M`/`G` suffix |
//! | `FERROLATTICE_SHM_HUGEPAGES` | `hugepages` | `1`/`0`, `true`/`false` |
//! | `FERROLATTICE_SHM_BACKEND` | `backend` | `mmap` or `shmopen` |
//! | `FERROLATTICE_SHM_PATH` | `dir` | directory |
//! | `FERROLATTICE_SHM_PREFIX` | `prefix` | region name prefix |
//! | `FERROLATTICE_MAX_LOG2_RANKS_PER_NODE` | `max_log2_ranks_per_node` | integer |

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default shared allocation per rank (128 MiB).
pub const DEFAULT_SHM_BYTES: usize = 128 * 1024 * 1024;

/// Default ceiling on log2(ranks per node).
pub const MAX_LOG2_RANKS_PER_NODE: u32 = 16;

const HUGEPAGE_MOUNT: &str = "/dev/hugepages";
const SHM_MOUNT: &str = "/dev/shm";

/// How node regions are created and attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShmBackend {
    /// Every node rank opens (creating if needed) and maps every region.
    #[default]
    PerRankMmap,
    /// Node rank 0 creates every region; the others attach after a barrier.
    SingleCreator,
}

/// Bootstrap configuration for node shared memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmConfig {
    /// Bytes per rank window.
    pub bytes: usize,
    /// Prefer huge-page backed regions.
    pub hugepages: bool,
    /// Ceiling on log2(ranks per node).
    pub max_log2_ranks_per_node: u32,
    /// Region creation strategy.
    pub backend: ShmBackend,
    /// Directory holding the named regions; `None` picks a platform default.
    pub dir: Option<PathBuf>,
    /// Region name prefix; regions are named `{prefix}_{node}_{rank}`.
    pub prefix: String,
}

impl Default for ShmConfig {
    fn default() -> Self {
        ShmConfig {
            bytes: DEFAULT_SHM_BYTES,
            hugepages: false,
            max_log2_ranks_per_node: MAX_LOG2_RANKS_PER_NODE,
            backend: ShmBackend::default(),
            dir: None,
            prefix: "ferrolattice_shm".to_string(),
        }
    }
}

impl ShmConfig {
    /// Read the configuration from `FERROLATTICE_*` environment variables,
    /// starting from the defaults.
    pub fn from_env() -> Result<Self> {
        ShmConfig::default().with_env()
    }

    /// Override the fields of `self` that are set in the environment.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a value that does not parse.
    pub fn with_env(self) -> Result<Self> {
        let mut config = self;
        if let Some(v) = var("FERROLATTICE_SHM_BYTES") {
            config.bytes = parse_bytes(&v).ok_or_else(|| invalid("FERROLATTICE_SHM_BYTES", &v))?;
        }
        if let Some(v) = var("FERROLATTICE_SHM_HUGEPAGES") {
            config.hugepages =
                parse_bool(&v).ok_or_else(|| invalid("FERROLATTICE_SHM_HUGEPAGES", &v))?;
        }
        if let Some(v) = var("FERROLATTICE_SHM_BACKEND") {
            config.backend = match v.to_ascii_lowercase().as_str() {
                "mmap" => ShmBackend::PerRankMmap,
                "shmopen" => ShmBackend::SingleCreator,
                _ => return Err(invalid("FERROLATTICE_SHM_BACKEND", &v)),
            };
        }
        if let Some(v) = var("FERROLATTICE_SHM_PATH") {
            config.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("FERROLATTICE_SHM_PREFIX") {
            config.prefix = v;
        }
        if let Some(v) = var("FERROLATTICE_MAX_LOG2_RANKS_PER_NODE") {
            config.max_log2_ranks_per_node = v
                .parse()
                .map_err(|_| invalid("FERROLATTICE_MAX_LOG2_RANKS_PER_NODE", &v))?;
        }
        Ok(config)
    }

    /// Set the bytes per rank window.
    pub fn with_bytes(mut self, bytes: usize) -> Self {
        self.bytes = bytes;
        self
    }

    /// Set the huge-page hint.
    pub fn with_hugepages(mut self, hugepages: bool) -> Self {
        self.hugepages = hugepages;
        self
    }

    /// Set the region creation strategy.
    pub fn with_backend(mut self, backend: ShmBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the region directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Set the region name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Directory the regions are created in.
    ///
    /// An explicit `dir` always wins. Otherwise the huge-page mount is used
    /// when the hint is set and the mount exists, then `/dev/shm`, then the
    /// system temp directory.
    pub fn region_dir(&self) -> PathBuf {
        self.region_dir_among(Path::new(HUGEPAGE_MOUNT), Path::new(SHM_MOUNT))
    }

    fn region_dir_among(&self, hugepage_mount: &Path, shm_mount: &Path) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        if self.hugepages && hugepage_mount.is_dir() {
            return hugepage_mount.to_path_buf();
        }
        if shm_mount.is_dir() {
            shm_mount.to_path_buf()
        } else {
            env::temp_dir()
        }
    }

    /// Path of the region owned by node rank `rank` on node `node`.
    pub fn region_path(&self, node: usize, rank: usize) -> PathBuf {
        self.region_dir()
            .join(format!("{}_{}_{}", self.prefix, node, rank))
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn invalid(key: &str, value: &str) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `1024`, `64K`, `128M`, `2G` (binary multiples).
fn parse_bytes(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 10),
        'm' | 'M' => (&s[..s.len() - 1], 20),
        'g' | 'G' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: usize = digits.trim().parse().ok()?;
    n.checked_mul(1usize << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_byte_suffixes() {
        assert_eq!(parse_bytes("4096"), Some(4096));
        assert_eq!(parse_bytes("64K"), Some(64 * 1024));
        assert_eq!(parse_bytes("128m"), Some(128 << 20));
        assert_eq!(parse_bytes("2G"), Some(2 << 30));
        assert_eq!(parse_bytes("lots"), None);
        assert_eq!(parse_bytes(""), None);
    }

    #[test]
    fn explicit_dir_wins() {
        let c = ShmConfig::default()
            .with_dir("/tmp/lattice")
            .with_prefix("job7");
        assert_eq!(
            c.region_path(1, 3),
            PathBuf::from("/tmp/lattice/job7_1_3")
        );
    }

    #[test]
    fn default_dir_falls_back_in_order() {
        let mounts = tempfile::tempdir().unwrap();
        let huge = mounts.path().join("hugepages");
        let shm = mounts.path().join("shm");
        std::fs::create_dir(&huge).unwrap();
        std::fs::create_dir(&shm).unwrap();
        let missing = mounts.path().join("missing");

        let hinted = ShmConfig::default().with_hugepages(true);
        let plain = ShmConfig::default();
        assert_eq!(hinted.region_dir_among(&huge, &shm), huge);
        assert_eq!(plain.region_dir_among(&huge, &shm), shm);
        assert_eq!(hinted.region_dir_among(&missing, &shm), shm);
        assert_eq!(hinted.region_dir_among(&missing, &missing), env::temp_dir());
        assert_eq!(
            hinted.with_dir(&missing).region_dir_among(&huge, &shm),
            missing
        );
    }

    /// Environment mutation is kept in a single test so parallel tests never
    /// observe each other's variables.
    #[test]
    fn env_var_parsing() {
        env::set_var("FERROLATTICE_SHM_BYTES", "8M");
        env::set_var("FERROLATTICE_SHM_HUGEPAGES", "true");
        env::set_var("FERROLATTICE_SHM_BACKEND", "shmopen");
        env::set_var("FERROLATTICE_SHM_PREFIX", "run42");
        env::set_var("FERROLATTICE_MAX_LOG2_RANKS_PER_NODE", "6");
        let c = ShmConfig::from_env().unwrap();
        assert_eq!(c.bytes, 8 << 20);
        assert!(c.hugepages);
        assert_eq!(c.backend, ShmBackend::SingleCreator);
        assert_eq!(c.prefix, "run42");
        assert_eq!(c.max_log2_ranks_per_node, 6);

        env::set_var("FERROLATTICE_SHM_BACKEND", "sysv");
        assert!(matches!(
            ShmConfig::from_env(),
            Err(Error::InvalidConfig { .. })
        ));

        env::remove_var("FERROLATTICE_SHM_BYTES");
        env::remove_var("FERROLATTICE_SHM_HUGEPAGES");
        env::remove_var("FERROLATTICE_SHM_BACKEND");
        env::remove_var("FERROLATTICE_SHM_PREFIX");
        env::remove_var("FERROLATTICE_MAX_LOG2_RANKS_PER_NODE");
        assert_eq!(ShmConfig::from_env().unwrap(), ShmConfig::default());

        // Layered over a caller's base, only variables that are set apply.
        let base = ShmConfig::default().with_bytes(1 << 20).with_prefix("demo");
        assert_eq!(base.clone().with_env().unwrap(), base);
        env::set_var("FERROLATTICE_SHM_BYTES", "2M");
        let c = base.with_env().unwrap();
        assert_eq!(c.bytes, 2 << 20);
        assert_eq!(c.prefix, "demo");
        env::remove_var("FERROLATTICE_SHM_BYTES");
    }
}
