//! Bandwidth optimization: delta encoding, compression, and send timing

pub mod adaptive;
pub mod batch_timing;
pub mod compression;
pub mod delta;

pub use adaptive::{AdaptiveCompressionOptimizer, CompressionRecommendation, DeviceProfile, NetworkSample};
pub use batch_timing::{
    BatchPriority, BatchRequest, BatchTimingOptimizer, NetworkQuality, SchedulingDecision, TransferSample,
};
pub use compression::{CompressedBatch, CompressionAlgorithm, CompressionEngine, CompressionStats};
pub use delta::{DeltaOperation, DeltaStats, DeltaSyncOptimizer, DeltaType, ReconstructedOperation};
