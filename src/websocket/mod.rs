//! WebSocket signaling for the relay
//!
//! This module handles the upgrade of inbound connections, the per-connection
//! read and write pumps, and the registry that routes messages between them
//! and keeps every peer informed of who is online.

mod connection;
mod message;
mod registry;
mod server;

pub use connection::{inbound_pump, outbound_pump, Session, SessionConfig};
pub use message::{Frame, Message, PresenceList, USER_LIST};
pub use registry::{
    CollisionPolicy, RegisterOutcome, Registry, RegistryEvent, RegistryHandle, RouteOutcome,
    SessionHandle, SessionRef,
};
pub use server::{ServerOptions, WebSocketServer};
