//! Real-time conversational streaming core for the Miko companion backend.
//!
//! One authorized WebSocket connection owns one [`processor::MessageProcessor`].
//! Each chat message becomes a *turn*: a producer task drains the agent event
//! stream while a consumer task folds tokens into normalized, sentence-sized
//! `tts_ready_chunk` events, the two joined by bounded queues and a two-phase
//! end-of-stream barrier that keeps the terminal event last on the wire.

pub mod agent;
pub mod auth;
pub mod chunker;
pub mod normalizer;
mod pipeline;
pub mod processor;
pub mod protocol;
pub mod server;
pub mod supervisor;
pub mod turn;

pub use agent::{AgentEvent, AgentHandle, AgentSink, AgentStream, AgentStreamRequest};
pub use auth::TokenValidator;
pub use chunker::{ChunkSplitter, DEFAULT_MIN_CHUNK_LEN};
pub use normalizer::{default_rules, NormalizedChunk, TextNormalizer};
pub use processor::{MessageProcessor, ProcessorStats, StreamSettings};
pub use protocol::{ClientMessage, ServerEvent};
pub use server::{AssetCatalog, AvatarSwitch, ConnectionManager, ConnectionSettings};
pub use supervisor::TaskSupervisor;
pub use turn::TurnStatus;
