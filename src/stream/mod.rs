pub mod manager;
pub mod stream;

pub use manager::{StreamLimits, StreamManager};
pub use stream::{stream_id, RecvState, SendState, Stream};
