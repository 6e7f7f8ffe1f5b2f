// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Producer configuration.
//!
//! A plain `serde`-derived struct with a `Default` impl, optionally loaded
//! from a JSON file on disk and overridable by CLI flags in `main.rs`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_MAX_FRAMES;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Path to the shared-memory-backed file the `ShmProvider` maps.
    pub shm_path: String,
    /// Total size in bytes of the SHM region.
    pub shm_size: usize,
    /// Number of frame ring slots (default: 2).
    pub max_frames: u32,
    /// Target ticks per second for the service loop's outer driver.
    pub target_fps: u32,
    /// Opaque host identifier stamped into the header at Initialize.
    pub host_id: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            shm_path: "/dev/shm/lg-capture".to_string(),
            shm_size: 64 * 1024 * 1024,
            max_frames: DEFAULT_MAX_FRAMES,
            target_fps: 60,
            host_id: 0,
        }
    }
}

impl ProducerConfig {
    /// Load from a JSON config file, falling back to `Default` for any
    /// field the file omits (via `#[serde(default)]`).
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let config = serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(config)
    }
}
