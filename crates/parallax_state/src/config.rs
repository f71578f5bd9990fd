//! # Configuration
//!
//! Runtime knobs for the synchronization core, fixed at construction.

use std::path::PathBuf;

/// Configuration for [`ServerGameState`](crate::server::ServerGameState).
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Master switch. When false the ingest path and drop handler are
    /// inert; the host is expected not to drive the tick either.
    pub enabled: bool,
    /// Only replicate entities near each client's focus. Disabling
    /// this replicates everything to everyone.
    pub distance_culling: bool,
    /// Stretch sync cadence for entities that are far away or outside
    /// the client's view frustum.
    pub radius_frequency: bool,
    /// Flat-file replication trace. `None` disables tracing entirely.
    pub log_file: Option<PathBuf>,
    /// Worker threads assembling outbound frames.
    pub workers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            distance_culling: true,
            radius_frequency: true,
            log_file: None,
            workers: std::thread::available_parallelism()
                .map(|n| n.get().min(4))
                .unwrap_or(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert!(!config.enabled);
        assert!(config.distance_culling);
        assert!(config.radius_frequency);
        assert!(config.log_file.is_none());
        assert!(config.workers >= 1);
    }
}
