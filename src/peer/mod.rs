pub mod connection;
pub mod data_channel;
pub mod ice;
#[cfg(test)]
pub(crate) mod loopback;
pub mod negotiation;
pub mod state;
pub mod transport;
pub mod types;

pub use negotiation::{NegotiationOutcome, NegotiationSink, Negotiator};
pub use state::{ConnectionPhase, NegotiationFlags, PhaseCell};
pub use transport::{ChannelEvent, DataPipe, PeerEvent, PeerFactory, PeerTransport};
pub use types::{ControlMessage, SdpRole, ServerConfig};
