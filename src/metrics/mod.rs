//! Telemetry: latency statistics and operational counters/gauges.
//!
//! Kept deliberately small — the RPC/telemetry emitters that would export
//! these as Prometheus gauges are an external collaborator per spec §1;
//! this module only defines the counters themselves and a text dump.

mod latency;
mod operational;

pub use latency::{compute_latency_percentiles, LatencyStats};
pub use operational::{ChunkTypeCounters, DeviceErrorCounters, EngineMetrics};
