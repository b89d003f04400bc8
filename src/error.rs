use thiserror::Error;

use crate::frame::FrameError;

/// Failure opening or configuring the raw CAN bus socket.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("target CAN interface couldn't be found")]
    Lookup(#[source] nix::Error),
    #[error("failed to open or configure the CAN socket")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for OpenError {
    fn from(e: std::io::Error) -> Self {
        OpenError::Io(e)
    }
}

/// Failure sending a frame on the bus.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("frame could not be constructed")]
    Frame(#[from] FrameError),
    #[error("write to the CAN socket failed or was short")]
    Io(#[source] std::io::Error),
}

/// Failure allocating a virtual port for a newly discovered node.
#[derive(Debug, Error)]
pub enum VportError {
    #[error("failed to allocate a pseudo-terminal pair")]
    Pty(#[source] std::io::Error),
    #[error("failed to publish the symlink at {path}")]
    Symlink {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to register a filesystem watch")]
    Watch(#[source] nix::Error),
}

/// Failure standing up the gateway as a whole.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to open the CAN bus")]
    Open(#[from] OpenError),
    #[error("failed to initialize the filesystem watch subsystem")]
    Watch(#[source] nix::Error),
    #[error("failed to spawn the multiplexer worker")]
    Spawn(#[source] std::io::Error),
}
