//! Command monitoring.
//!
//! A [`CommandListener`] observes each command exchange. Clients without a
//! listener never build events.

use std::fmt;
use std::time::Duration;

use lodestar_bson::Document;

use crate::error::DriverError;
use crate::topology::ServerAddress;

/// A command is about to be written.
#[derive(Debug, Clone, Copy)]
pub struct CommandStartedEvent<'a> {
    /// Name of the command.
    pub command_name: &'a str,
    /// Target database.
    pub database: &'a str,
    /// Command document as given by the caller.
    pub command: &'a Document,
    /// Request id of the frame.
    pub request_id: i32,
    /// Selected server.
    pub address: &'a ServerAddress,
    /// Connection used.
    pub connection_id: Option<u64>,
}

/// A command got a successful reply.
#[derive(Debug, Clone, Copy)]
pub struct CommandSucceededEvent<'a> {
    /// Name of the command.
    pub command_name: &'a str,
    /// Request id of the frame.
    pub request_id: i32,
    /// Server that answered.
    pub address: &'a ServerAddress,
    /// Time from write to decoded reply.
    pub duration: Duration,
    /// Reply document.
    pub reply: &'a Document,
}

/// A command failed after it was started.
#[derive(Debug, Clone, Copy)]
pub struct CommandFailedEvent<'a> {
    /// Name of the command.
    pub command_name: &'a str,
    /// Request id of the frame.
    pub request_id: i32,
    /// Server the command was sent to.
    pub address: &'a ServerAddress,
    /// Time from write to failure.
    pub duration: Duration,
    /// The failure.
    pub error: &'a DriverError,
}

/// Observer of command exchanges. Every method defaults to doing nothing.
pub trait CommandListener: Send + Sync + fmt::Debug {
    /// Called before the request frame is written.
    fn started(&self, _event: &CommandStartedEvent<'_>) {}

    /// Called after a successful reply was decoded.
    fn succeeded(&self, _event: &CommandSucceededEvent<'_>) {}

    /// Called when the exchange or the reply failed.
    fn failed(&self, _event: &CommandFailedEvent<'_>) {}
}
