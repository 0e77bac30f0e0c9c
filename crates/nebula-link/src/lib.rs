//! Persistent game-backend session client: transport failover, wire framing,
//! heartbeat health monitoring and the request/response engine.

pub mod channel;
pub mod client;
pub mod codec;
pub mod compression;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod failover;
pub mod framing;
pub mod heartbeat;
pub mod message;
pub mod orchestrator;
pub mod platform;
pub mod request;
pub mod restart;
pub mod stats;
pub mod store;
pub mod value;

pub use channel::{AttemptId, ChannelKind, Endpoint, TransportError};
pub use client::{Client, ClientEvent};
pub use codec::{DecodeError, EncodeError, Opcode, WireCodec};
pub use config::{ChannelEntryConfig, LinkConfig};
pub use context::{Authenticator, ClientContext, NoAuth};
pub use diagnostics::LinkDiagnostics;
pub use error::{EngineError, RequestError};
pub use message::{Message, MsgPackCodec, PayloadCodec};
pub use orchestrator::{ConnectionState, TransportInfo};
pub use request::{Callback, RequestHandle, RequestState};
pub use restart::RestartPolicy;
pub use store::{EndpointStore, FileEndpointStore, MemoryEndpointStore};
pub use value::{Payload, Value};
