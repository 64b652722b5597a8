//! Wire protocol for the waypost control plane.
//!
//! Every WebSocket frame on both the runtime and the client side is a JSON
//! [`Envelope`] whose `type` field selects the payload schema. The payload is
//! carried as raw JSON and decoded lazily by the receiver, so a dispatcher can
//! switch on [`MessageKind`] without paying for payloads it will not use.

mod agent;
mod envelope;
mod payloads;

pub use agent::{AgentCaps, AgentDescriptor, ExecModel};
pub use envelope::{DecodeError, Envelope, MessageKind};
pub use payloads::*;
