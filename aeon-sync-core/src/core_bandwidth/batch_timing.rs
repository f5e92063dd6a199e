//! Send-now-or-defer decisions for outgoing batches

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

const TRANSFER_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    pub fn classify(latency_ms: f64, bandwidth_kbps: f64) -> Self {
        if latency_ms < 50.0 && bandwidth_kbps >= 10_000.0 {
            NetworkQuality::Excellent
        } else if latency_ms < 150.0 && bandwidth_kbps >= 2_000.0 {
            NetworkQuality::Good
        } else if latency_ms < 400.0 && bandwidth_kbps >= 256.0 {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPriority {
    Critical,
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSample {
    pub duration_ms: f64,
    pub bytes: usize,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchRequest {
    pub priority: BatchPriority,
    pub user_triggered: bool,
    /// How long the oldest item in the batch has been waiting
    pub waited: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingDecision {
    pub send_now: bool,
    pub delay: Duration,
    pub reason: &'static str,
}

impl SchedulingDecision {
    fn now(reason: &'static str) -> Self {
        Self { send_now: true, delay: Duration::ZERO, reason }
    }

    fn defer(delay: Duration, reason: &'static str) -> Self {
        Self { send_now: false, delay, reason }
    }
}

pub struct BatchTimingOptimizer {
    quality: NetworkQuality,
    transfers: VecDeque<TransferSample>,
    /// A batch is sent regardless of conditions once it has waited this long
    max_wait: Duration,
}

impl BatchTimingOptimizer {
    pub fn new(max_wait: Duration) -> Self {
        Self { quality: NetworkQuality::Good, transfers: VecDeque::with_capacity(TRANSFER_WINDOW), max_wait }
    }

    pub fn quality(&self) -> NetworkQuality {
        self.quality
    }

    pub fn update_network(&mut self, latency_ms: f64, bandwidth_kbps: f64) {
        self.quality = NetworkQuality::classify(latency_ms, bandwidth_kbps);
    }

    pub fn record_transfer(&mut self, sample: TransferSample) {
        if self.transfers.len() == TRANSFER_WINDOW {
            self.transfers.pop_front();
        }
        self.transfers.push_back(sample);
    }

    /// Share of recent transfers that failed or ran over twice the median duration
    pub fn congestion(&self) -> f64 {
        if self.transfers.is_empty() {
            return 0.0;
        }
        let mut durations: Vec<f64> = self.transfers.iter().filter(|t| t.success).map(|t| t.duration_ms).collect();
        durations.sort_by(f64::total_cmp);
        let median = durations.get(durations.len() / 2).copied().unwrap_or(0.0);

        let congested = self
            .transfers
            .iter()
            .filter(|t| !t.success || (median > 0.0 && t.duration_ms > median * 2.0))
            .count();
        congested as f64 / self.transfers.len() as f64
    }

    pub fn decide(&self, request: &BatchRequest) -> SchedulingDecision {
        if request.priority == BatchPriority::Critical {
            return SchedulingDecision::now("critical priority");
        }
        if request.user_triggered {
            return SchedulingDecision::now("user triggered");
        }
        if request.waited >= self.max_wait {
            return SchedulingDecision::now("maximum wait reached");
        }

        let congestion = self.congestion();
        match (request.priority, self.quality) {
            (BatchPriority::High, _) if congestion <= 0.7 => SchedulingDecision::now("high priority"),
            (BatchPriority::High, _) => SchedulingDecision::defer(Duration::from_secs(1), "heavy congestion"),

            (BatchPriority::Normal, NetworkQuality::Excellent | NetworkQuality::Good) if congestion < 0.5 => {
                SchedulingDecision::now("good network")
            }
            (BatchPriority::Normal, NetworkQuality::Poor) => {
                SchedulingDecision::defer(Duration::from_secs(5), "poor network")
            }
            (BatchPriority::Normal, _) => SchedulingDecision::defer(Duration::from_secs(2), "degraded network"),

            (BatchPriority::Low, NetworkQuality::Excellent) if congestion < 0.3 => {
                SchedulingDecision::now("idle excellent network")
            }
            (BatchPriority::Low, NetworkQuality::Poor) => {
                SchedulingDecision::defer(Duration::from_secs(30), "poor network")
            }
            (BatchPriority::Low, _) => SchedulingDecision::defer(Duration::from_secs(10), "low priority"),

            (BatchPriority::Critical, _) => SchedulingDecision::now("critical priority"),
        }
    }
}

impl Default for BatchTimingOptimizer {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(priority: BatchPriority) -> BatchRequest {
        BatchRequest { priority, user_triggered: false, waited: Duration::ZERO }
    }

    fn congested(optimizer: &mut BatchTimingOptimizer) {
        for _ in 0..10 {
            optimizer.record_transfer(TransferSample { duration_ms: 0.0, bytes: 0, success: false });
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(NetworkQuality::classify(20.0, 50_000.0), NetworkQuality::Excellent);
        assert_eq!(NetworkQuality::classify(100.0, 5_000.0), NetworkQuality::Good);
        assert_eq!(NetworkQuality::classify(300.0, 500.0), NetworkQuality::Fair);
        assert_eq!(NetworkQuality::classify(900.0, 50.0), NetworkQuality::Poor);
    }

    #[test]
    fn test_critical_always_sends() {
        let mut optimizer = BatchTimingOptimizer::default();
        optimizer.update_network(2_000.0, 10.0);
        congested(&mut optimizer);
        assert!(optimizer.decide(&request(BatchPriority::Critical)).send_now);
    }

    #[test]
    fn test_user_trigger_and_max_wait_override_deferral() {
        let mut optimizer = BatchTimingOptimizer::default();
        optimizer.update_network(2_000.0, 10.0);
        assert!(!optimizer.decide(&request(BatchPriority::Low)).send_now);

        let user = BatchRequest { user_triggered: true, ..request(BatchPriority::Low) };
        assert!(optimizer.decide(&user).send_now);

        let stale = BatchRequest { waited: Duration::from_secs(31), ..request(BatchPriority::Low) };
        assert!(optimizer.decide(&stale).send_now);
    }

    #[test]
    fn test_normal_priority_tracks_quality() {
        let mut optimizer = BatchTimingOptimizer::default();
        optimizer.update_network(20.0, 50_000.0);
        assert!(optimizer.decide(&request(BatchPriority::Normal)).send_now);

        optimizer.update_network(900.0, 50.0);
        let decision = optimizer.decide(&request(BatchPriority::Normal));
        assert!(!decision.send_now);
        assert_eq!(decision.delay, Duration::from_secs(5));
    }

    #[test]
    fn test_congestion_defers_high_priority() {
        let mut optimizer = BatchTimingOptimizer::default();
        assert!(optimizer.decide(&request(BatchPriority::High)).send_now);
        congested(&mut optimizer);
        assert_eq!(optimizer.congestion(), 1.0);
        assert!(!optimizer.decide(&request(BatchPriority::High)).send_now);
    }

    #[test]
    fn test_congestion_counts_slow_transfers() {
        let mut optimizer = BatchTimingOptimizer::default();
        for _ in 0..3 {
            optimizer.record_transfer(TransferSample { duration_ms: 100.0, bytes: 10, success: true });
        }
        optimizer.record_transfer(TransferSample { duration_ms: 500.0, bytes: 10, success: true });
        assert_eq!(optimizer.congestion(), 0.25);
    }
}
