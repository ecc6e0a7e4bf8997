pub mod stage;
pub mod transport;

pub use stage::SendStage;
pub use transport::{ChunkSender, UdpSink};
