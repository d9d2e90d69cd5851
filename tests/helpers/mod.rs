#![allow(dead_code)]

use engram::config::{CacheConfig, DatabaseConfig, EngramConfig, VectorConfig};
use engram::MemoryService;
use tempfile::TempDir;

/// Embedding dimension used across integration tests. Small enough to keep
/// scans instant, large enough to exercise real vectors.
pub const DIMS: usize = 16;

/// A ready-to-use service backed by a fresh temporary database file. The
/// directory lives as long as the harness.
pub struct TestHarness {
    pub service: MemoryService,
    pub config: EngramConfig,
    _dir: TempDir,
}

pub fn test_service() -> TestHarness {
    test_service_with(|_| {})
}

/// Build a harness, letting the caller tweak the config before the service
/// initializes.
pub fn test_service_with(tweak: impl FnOnce(&mut EngramConfig)) -> TestHarness {
    let dir = TempDir::new().expect("create temp dir");
    let mut config = EngramConfig {
        database: DatabaseConfig {
            url: format!("file:{}", dir.path().join("engram.db").display()),
            ..DatabaseConfig::default()
        },
        cache: CacheConfig {
            max_size: 100,
            ttl_ms: 60_000,
            update_age_on_get: true,
        },
        vector: VectorConfig { dimensions: DIMS },
        ..EngramConfig::default()
    };
    tweak(&mut config);

    let service = MemoryService::new(config.clone());
    service.initialize().expect("initialize service");
    TestHarness {
        service,
        config,
        _dir: dir,
    }
}

/// Deterministic unit vector with a spike at `seed`. Distinct seeds are
/// orthogonal.
pub fn test_embedding(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    v[seed % DIMS] = 1.0;
    v
}

/// An embedding with high (but not perfect) cosine similarity to `base`.
pub fn similar_embedding(base: &[f32]) -> Vec<f32> {
    let mut v = base.to_vec();
    let len = v.len();
    for i in 0..3 {
        v[(i * 5) % len] += 0.05;
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
