//! Packet dispatch for the chat front end.
//!
//! Every packet kind is declared with an explicit parent ([`PacketKind`]),
//! forming a tree rooted at [`AnyPacket`]. The [`Router`] keeps one
//! [`Pipeline`] per registered kind: an ordered list of [`Middleware`]
//! followed by exactly one [`Handler`]. A packet runs through the pipeline
//! of its own kind, or of its nearest registered ancestor.
//!
//! Inheritance rules:
//!
//! - A pipeline created for a kind starts as a copy of its nearest
//!   registered ancestor's middleware and handler.
//! - Middleware registered on a kind is also appended to the end of every
//!   pipeline that already exists below it.
//! - Registering a handler only ever replaces the handler of that one kind.
//! - The handler always runs last, whenever it was registered.

pub mod kind;
pub mod logging;
pub mod middleware;
pub mod packet;
pub mod router;

pub use kind::{AnyPacket, Lineage, PacketKind, PacketType};
pub use logging::TracingMiddleware;
pub use middleware::{handler_fn, Handler, HandlerFn, Middleware, Next, NoopHandler};
pub use packet::{Client, Packet, PacketContext};
pub use router::{Pipeline, Router};
