//! Replication wire protocol: pgoutput message bodies, the decoder, and
//! the streaming replication client.

mod client;
mod decoder;
mod message;

pub use client::{ReplicationClient, ReplicationFrame, ReplicationStream};
pub use decoder::{DecodeError, PgOutputDecoder};
pub use message::*;
