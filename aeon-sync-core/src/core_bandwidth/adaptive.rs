//! Compression level selection from network and device conditions
//!
//! Slow links push the level up, weak or battery-constrained devices pull
//! it down. A recommendation is applied only when it is confident or far
//! from the current level, so noisy samples do not make the level thrash.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

const SAMPLE_WINDOW: usize = 20;
const NETWORK_WEIGHT: f64 = 0.6;
const DEVICE_WEIGHT: f64 = 0.4;
const CONFIDENCE_TO_APPLY: f64 = 0.7;
const LEVEL_JUMP_TO_APPLY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSample {
    pub bandwidth_kbps: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub cpu_cores: usize,
    /// 0.0..=1.0, `None` on mains power
    pub battery_level: Option<f64>,
    pub low_power_mode: bool,
}

impl DeviceProfile {
    /// Profile of the current machine, assumed on mains power
    pub fn detect() -> Self {
        Self { cpu_cores: num_cpus::get(), battery_level: None, low_power_mode: false }
    }

    /// 0.0..=1.0, higher means more CPU to spend on compression
    pub fn factor(&self) -> f64 {
        let mut factor = match self.cpu_cores {
            n if n >= 8 => 1.0,
            n if n >= 4 => 0.75,
            n if n >= 2 => 0.5,
            _ => 0.25,
        };
        if self.low_power_mode {
            factor *= 0.5;
        }
        if self.battery_level.is_some_and(|b| b < 0.2) {
            factor *= 0.5;
        }
        factor
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::detect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionRecommendation {
    pub level: u8,
    pub confidence: f64,
    pub network_factor: f64,
    pub device_factor: f64,
    pub reason: String,
}

pub struct AdaptiveCompressionOptimizer {
    current_level: u8,
    device: DeviceProfile,
    samples: VecDeque<NetworkSample>,
}

impl AdaptiveCompressionOptimizer {
    pub fn new(initial_level: u8, device: DeviceProfile) -> Self {
        Self { current_level: initial_level.clamp(1, 9), device, samples: VecDeque::with_capacity(SAMPLE_WINDOW) }
    }

    pub fn current_level(&self) -> u8 {
        self.current_level
    }

    pub fn set_device_profile(&mut self, device: DeviceProfile) {
        self.device = device;
    }

    pub fn record_network_sample(&mut self, sample: NetworkSample) {
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// 0.0..=1.0, higher means a slower link that benefits from compression
    fn network_factor(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.5;
        }
        let n = self.samples.len() as f64;
        let bandwidth = self.samples.iter().map(|s| s.bandwidth_kbps).sum::<f64>() / n;
        let latency = self.samples.iter().map(|s| s.latency_ms).sum::<f64>() / n;

        let base = match bandwidth {
            b if b < 256.0 => 1.0,
            b if b < 1_024.0 => 0.75,
            b if b < 5_000.0 => 0.5,
            b if b < 20_000.0 => 0.3,
            _ => 0.1,
        };
        let latency_penalty = if latency > 200.0 { 0.1 } else { 0.0 };
        f64::min(base + latency_penalty, 1.0)
    }

    /// More samples and steadier bandwidth mean higher confidence
    fn confidence(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let n = self.samples.len() as f64;
        let coverage = (n / 5.0).min(1.0);

        let mean = self.samples.iter().map(|s| s.bandwidth_kbps).sum::<f64>() / n;
        let stability = if mean <= 0.0 {
            0.0
        } else {
            let variance = self.samples.iter().map(|s| (s.bandwidth_kbps - mean).powi(2)).sum::<f64>() / n;
            1.0 - (variance.sqrt() / mean).min(1.0)
        };
        0.5 * coverage + 0.5 * stability
    }

    pub fn recommend(&self) -> CompressionRecommendation {
        let network_factor = self.network_factor();
        let device_factor = self.device.factor();
        let score = NETWORK_WEIGHT * network_factor + DEVICE_WEIGHT * device_factor;
        let level = (1.0 + score * 8.0).round().clamp(1.0, 9.0) as u8;

        let reason = if network_factor >= 0.75 {
            "slow network"
        } else if device_factor <= 0.25 {
            "constrained device"
        } else {
            "balanced conditions"
        };

        CompressionRecommendation {
            level,
            confidence: self.confidence(),
            network_factor,
            device_factor,
            reason: reason.to_string(),
        }
    }

    /// Adopt `rec` if it is confident or differs sharply from the current level
    ///
    /// # Returns
    /// Whether the level changed.
    pub fn apply(&mut self, rec: &CompressionRecommendation) -> bool {
        let jump = rec.level.abs_diff(self.current_level);
        if rec.level == self.current_level {
            return false;
        }
        if rec.confidence > CONFIDENCE_TO_APPLY || jump > LEVEL_JUMP_TO_APPLY {
            debug!(from = self.current_level, to = rec.level, confidence = rec.confidence, "Adjusting compression level");
            self.current_level = rec.level;
            return true;
        }
        false
    }
}
