//! A userspace gateway that multiplexes a single CAN bus into one virtual
//! serial port (PTY) per discovered remote node.
//!
//! # An introduction to CAN
//!
//! The CAN bus was originally designed to allow microcontrollers inside a
//! vehicle to communicate over a single shared bus. Messages called *frames*
//! are multicast to all devices on the bus; each carries an 11 or 29 bit
//! identifier and up to 8 bytes of payload. The Linux socketcan subsystem
//! makes the bus available as a regular networking device: opening an
//! interface gives a socket that receives every frame sent on it, and any
//! number of sockets can be open on the same interface at once.
//!
//! # What this crate adds on top of that
//!
//! A CAN bus has no notion of "connections" — every frame is a broadcast.
//! This crate layers a small discovery/addressing protocol over a reserved
//! band of identifiers (see [`protocol`]) so that each node that announces
//! itself gets a dedicated pseudo-terminal at a deterministic symlink path,
//! and bytes written to or read from that PTY are carried as CAN frames
//! addressed to that node specifically. [`Gateway`] is the owning handle for
//! one running instance of this; [`gateway::Config`] controls where its
//! ports get published and how it paces its liveness checks.
//!
//! # RawFd
//!
//! Raw access to the underlying bus socket is available through the
//! `AsRawFd` implementation on [`socket::CanBus`], for callers that want to
//! fold it into their own polling loop instead of using [`Gateway::init`].

pub(crate) mod constants;
pub mod error;
pub mod frame;
pub mod gateway;
mod liveness;
mod mux;
pub mod protocol;
mod retry;
pub mod socket;
pub mod table;
mod util;
pub mod vport;
pub mod watch;

pub use error::{GatewayError, OpenError, SendError, VportError};
pub use frame::{CanFilter, CanFrame, FrameError};
pub use gateway::{Config, Gateway};
