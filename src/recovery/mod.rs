pub mod congestion;
pub mod ecn;
pub mod loss;
pub mod rtt;

pub use congestion::{CongestionController, CongestionState};
pub use ecn::{EcnResult, EcnTracker};
pub use loss::{LossDetector, LossEvent, LossResult, SentPacket};
pub use rtt::RttEstimator;
