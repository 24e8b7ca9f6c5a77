//! The chorus media plane: a UDP selective forwarding unit.
//!
//! The server decrypts nothing. It reads the plaintext media header,
//! consults per-session routing state and forwards ciphertext verbatim to
//! every other subscribed participant in the room, with NACK retransmits
//! served from a short-TTL cache and PLI/RR relayed to stream owners.

pub mod metrics;
pub mod retransmit;
pub mod router;
pub mod server;
pub mod session;

pub use metrics::{MetricsSnapshot, SfuMetrics};
pub use retransmit::RetransmitBuffer;
pub use router::{PacketSink, Router};
pub use server::{SfuConfig, SfuError, UdpServer, DEFAULT_WORKERS};
pub use session::{Session, SessionManager};
