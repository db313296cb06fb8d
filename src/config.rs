//! Immutable engine configuration.
//!
//! The original block-I/O layer keeps a handful of globals
//! (`nvme_glb`, `glb_criteria`, `bio_chk_*`, `bio_scm_rdma`, `bio_spdk_*`)
//! that are fixed after initialization. Per the Design Notes, this crate
//! models them as a single immutable [`EngineConfig`] parsed once at
//! startup and plumbed through every constructor by reference or `Arc`,
//! rather than as mutable process-global state.
//!
//! Parsing uses `figment`, layering a JSON file over environment
//! overrides, matching the config-loading idiom used throughout the
//! teacher workspace.

use std::path::Path;

use figment::providers::{Env, Format, Json};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Device role bitmask, matching the wire-visible values in spec §6.
pub const ROLE_DATA: u16 = 1;
/// Device carries metadata blobs.
pub const ROLE_META: u16 = 2;
/// Device carries WAL blobs.
pub const ROLE_WAL: u16 = 4;

/// Inclusive PCI bus-id range used to filter hot-plug events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusIdRange {
    /// First bus id considered, inclusive.
    pub begin: u32,
    /// Last bus id considered, inclusive.
    pub end: u32,
}

impl BusIdRange {
    /// Whether `bus` falls within `[begin, end]`.
    #[must_use]
    pub fn contains(&self, bus: u32) -> bool {
        bus >= self.begin && bus <= self.end
    }
}

/// Acceleration engine selection for checksum/copy offload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccelEngine {
    /// Plain CPU implementation (CRC32, memcpy).
    #[default]
    Software,
    /// SPDK `accel` hardware-offload engine.
    Spdk,
}

/// `accel_props` config entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccelProps {
    /// Which engine services checksum/copy/move requests.
    #[serde(default)]
    pub engine: AccelEngine,
    /// Opt-in bitmask of which operations are offloaded.
    #[serde(default)]
    pub opt_mask: u32,
}

/// `spdk_rpc_server` config entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcServerConfig {
    /// Whether the RPC server is enabled.
    #[serde(default)]
    pub enable: bool,
    /// Unix socket or TCP address to bind.
    #[serde(default)]
    pub sock_addr: Option<String>,
}

/// `auto_faulty` config entry (spec §4.E "Auto-faulty detector").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoFaultyConfig {
    /// Whether the auto-faulty detector runs at all.
    #[serde(default)]
    pub enable: bool,
    /// Declare FAULTY once `read_errs + write_errs` exceeds this.
    #[serde(default = "default_max_io_errs")]
    pub max_io_errs: u32,
    /// Declare FAULTY once `checksum_errs` exceeds this.
    #[serde(default = "default_max_csum_errs")]
    pub max_csum_errs: u32,
}

const fn default_max_io_errs() -> u32 {
    10
}

const fn default_max_csum_errs() -> u32 {
    u32::MAX
}

impl Default for AutoFaultyConfig {
    fn default() -> Self {
        Self {
            enable: true,
            max_io_errs: default_max_io_errs(),
            max_csum_errs: default_max_csum_errs(),
        }
    }
}

/// One `attach_controller` entry under `subsystems.bdev.config[]`.
///
/// `name`'s suffix after the last `_` encodes the role bitmask (0-7,
/// `DATA=1 | META=2 | WAL=4`); a device with role 0 is DATA-only per
/// spec §3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdevConfig {
    /// PCI bus-device-function address.
    pub traddr: String,
    /// SPDK bdev name, e.g. `"Nvme0n1_7"`.
    pub name: String,
}

impl BdevConfig {
    /// Decodes the role bitmask from the name suffix.
    ///
    /// A name with no parseable `_<digit>` suffix, or a suffix of 0, is
    /// treated as DATA-only (role bit `ROLE_DATA`), matching "A device
    /// with role=0 is treated as DATA-only" in spec §3.
    #[must_use]
    pub fn role_mask(&self) -> u16 {
        let suffix = self.name.rsplit('_').next().unwrap_or("0");
        match suffix.parse::<u16>() {
            Ok(0) | Err(_) => ROLE_DATA,
            Ok(bits) => bits & (ROLE_DATA | ROLE_META | ROLE_WAL),
        }
    }
}

/// Chunk/pool sizing knobs (spec §9, `bio_chk_*`, `bio_scm_rdma`, `bio_spdk_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Pages per DMA chunk (default 2048 * 4 KiB = 8 MiB).
    #[serde(default = "default_chk_pages")]
    pub bio_chk_pages: u32,
    /// Page size in bytes, must stay 4 KiB-aligned.
    #[serde(default = "default_page_sz")]
    pub bio_dma_page_sz: u32,
    /// Hard cap on the number of chunks a single pool may grow to.
    #[serde(default = "default_chk_cnt_max")]
    pub bio_chk_cnt_max: u32,
    /// Whether SCM (PM) regions may be handed out directly for RDMA
    /// without staging through a DMA chunk.
    #[serde(default)]
    pub bio_scm_rdma: bool,
    /// Max blobs unmapped in a single batched `unmap` call.
    #[serde(default = "default_max_unmap_cnt")]
    pub bio_spdk_max_unmap_cnt: u32,
    /// Milliseconds `spdk_subsystem_fini` is allowed before fini is
    /// considered hung.
    #[serde(default = "default_subsys_timeout_ms")]
    pub bio_spdk_subsys_timeout_ms: u64,
}

const fn default_chk_pages() -> u32 {
    2048
}
const fn default_page_sz() -> u32 {
    4096
}
const fn default_chk_cnt_max() -> u32 {
    0 // 0 == unbounded
}
const fn default_max_unmap_cnt() -> u32 {
    32
}
const fn default_subsys_timeout_ms() -> u64 {
    25_000
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            bio_chk_pages: default_chk_pages(),
            bio_dma_page_sz: default_page_sz(),
            bio_chk_cnt_max: default_chk_cnt_max(),
            bio_scm_rdma: false,
            bio_spdk_max_unmap_cnt: default_max_unmap_cnt(),
            bio_spdk_subsys_timeout_ms: default_subsys_timeout_ms(),
        }
    }
}

impl ChunkConfig {
    /// Chunk size in bytes.
    #[must_use]
    pub fn chunk_bytes(&self) -> u64 {
        u64::from(self.bio_chk_pages) * u64::from(self.bio_dma_page_sz)
    }
}

/// Top-level immutable engine configuration (`daos_data.config[]` in spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Inclusive bus filter for hot-plug events, if configured.
    #[serde(default)]
    pub hotplug_busid_range: Option<BusIdRange>,
    /// Acceleration engine selection.
    #[serde(default)]
    pub accel_props: AccelProps,
    /// RPC/telemetry server bind config.
    #[serde(default)]
    pub spdk_rpc_server: RpcServerConfig,
    /// Auto-faulty detector thresholds.
    #[serde(default)]
    pub auto_faulty: AutoFaultyConfig,
    /// Configured bdevs (`subsystems.bdev.config[].attach_controller`).
    #[serde(default)]
    pub bdevs: Vec<BdevConfig>,
    /// DMA chunk/pool sizing.
    #[serde(default)]
    pub chunk: ChunkConfig,
    /// Skip the periodic SMART/health-log collection entirely.
    #[serde(default)]
    pub bypass_health_collect: bool,
}

impl EngineConfig {
    /// Loads configuration from a JSON file, with `BIO_` prefixed
    /// environment variables overlaid on top (e.g. `BIO_BYPASS_HEALTH_COLLECT=true`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Figment::new()
            .merge(Json::file(path.as_ref()))
            .merge(Env::prefixed("BIO_").split("_"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Builds a config directly from a JSON string, used by tests.
    pub fn from_json(data: &str) -> Result<Self> {
        Figment::new()
            .merge(Json::string(data))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.auto_faulty.max_io_errs, 10);
        assert_eq!(cfg.auto_faulty.max_csum_errs, u32::MAX);
        assert_eq!(cfg.chunk.chunk_bytes(), 8 * 1024 * 1024);
    }

    #[test]
    fn bdev_role_mask_decodes_suffix() {
        let data = BdevConfig {
            traddr: "0000:81:00.0".into(),
            name: "Nvme0n1_7".into(),
        };
        assert_eq!(data.role_mask(), ROLE_DATA | ROLE_META | ROLE_WAL);

        let wal_only = BdevConfig {
            traddr: "0000:82:00.0".into(),
            name: "Nvme1n1_4".into(),
        };
        assert_eq!(wal_only.role_mask(), ROLE_WAL);

        let no_suffix = BdevConfig {
            traddr: "0000:83:00.0".into(),
            name: "Nvme2n1".into(),
        };
        assert_eq!(no_suffix.role_mask(), ROLE_DATA);
    }

    #[test]
    fn from_json_round_trip() {
        let json = r#"{
            "hotplug_busid_range": {"begin": 128, "end": 143},
            "auto_faulty": {"enable": true, "max_io_errs": 5, "max_csum_errs": 2}
        }"#;
        let cfg = EngineConfig::from_json(json).unwrap();
        assert!(cfg.auto_faulty.enable);
        assert_eq!(cfg.auto_faulty.max_io_errs, 5);
        assert_eq!(cfg.hotplug_busid_range, Some(BusIdRange { begin: 128, end: 143 }));
    }
}
