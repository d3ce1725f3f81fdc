//! The module containing the controller's error type.

use hybmem_common::ProtocolError;

/// Errors that end a controller operation. Channel failures are fatal to the
/// whole daemon; everything else degrades locally.
#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    /// The inspector channel failed.
    #[error("inspector channel lost: {0}")]
    Channel(#[from] std::io::Error),
    /// The inspector sent something the protocol cannot parse.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// An exchange response did not carry two equal halves.
    #[error("malformed exchange response")]
    UnpairedExchange,
}
