//! Virtual streams
//!
//! A virtual stream is a byte pipe between an ingress and an exit, carried
//! hop by hop over peer links. The engine opens streams along source-routed
//! paths, relays frames at transit agents, enforces stream limits, and tears
//! everything down on errors or peer loss. Payload is encrypted end to end;
//! transit agents only ever see ciphertext.

pub mod conduit;
pub mod crypto;
pub mod engine;

pub use conduit::{ConduitReader, ConduitWriter};
pub use engine::{ExitConnector, ExitSocket, OpenFailure, StreamEngine, StreamStat};
