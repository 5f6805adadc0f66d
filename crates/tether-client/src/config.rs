use crate::error::{ClientError, Result};
use serde::Deserialize;
use std::fs;

// Engine configuration sourced from environment variables, optionally
// overridden by a YAML file named in TETHER_CONFIG.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Worker tasks per consumer binding.
    pub worker_count: usize,
    // Max time the arrival callback waits for a worker to claim a message.
    pub handoff_timeout_ms: u64,
    // Processing time after which the watchdog warns about a message.
    pub max_processing_time_ms: u64,
    // Delivery attempts before a failing message is republished to the
    // error queue instead of requeued.
    pub max_delivery_attempts: u32,
    // Optional error-queue name override; defaults to "<endpoint>.errors".
    pub error_queue_name: Option<String>,
}

const DEFAULT_WORKER_COUNT: usize = 1;
const DEFAULT_HANDOFF_TIMEOUT_MS: u64 = 1000;
const DEFAULT_MAX_PROCESSING_TIME_MS: u64 = 60_000;
const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct EngineConfigOverride {
    worker_count: Option<usize>,
    handoff_timeout_ms: Option<u64>,
    max_processing_time_ms: Option<u64>,
    max_delivery_attempts: Option<u32>,
    error_queue_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            handoff_timeout_ms: DEFAULT_HANDOFF_TIMEOUT_MS,
            max_processing_time_ms: DEFAULT_MAX_PROCESSING_TIME_MS,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            error_queue_name: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let worker_count = std::env::var("TETHER_WORKER_COUNT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_WORKER_COUNT);
        let handoff_timeout_ms = std::env::var("TETHER_HANDOFF_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_HANDOFF_TIMEOUT_MS);
        let max_processing_time_ms = std::env::var("TETHER_MAX_PROCESSING_TIME_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_PROCESSING_TIME_MS);
        let max_delivery_attempts = std::env::var("TETHER_MAX_DELIVERY_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_DELIVERY_ATTEMPTS);
        let error_queue_name = std::env::var("TETHER_ERROR_QUEUE").ok().filter(|value| !value.is_empty());
        Self {
            worker_count,
            handoff_timeout_ms,
            max_processing_time_ms,
            max_delivery_attempts,
            error_queue_name,
        }
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env();
        if let Ok(path) = std::env::var("TETHER_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path).map_err(|err| {
                ClientError::IllegalConfiguration(format!("read TETHER_CONFIG {path}: {err}"))
            })?;
            let override_cfg: EngineConfigOverride =
                serde_yaml::from_str(&contents).map_err(|err| {
                    ClientError::IllegalConfiguration(format!("parse engine config yaml: {err}"))
                })?;
            if let Some(value) = override_cfg.worker_count.filter(|value| *value > 0) {
                config.worker_count = value;
            }
            if let Some(value) = override_cfg.handoff_timeout_ms.filter(|value| *value > 0) {
                config.handoff_timeout_ms = value;
            }
            if let Some(value) = override_cfg
                .max_processing_time_ms
                .filter(|value| *value > 0)
            {
                config.max_processing_time_ms = value;
            }
            if let Some(value) = override_cfg.max_delivery_attempts.filter(|value| *value > 0) {
                config.max_delivery_attempts = value;
            }
            if let Some(value) = override_cfg.error_queue_name {
                config.error_queue_name = Some(value);
            }
        }
        Ok(config)
    }
}
