// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * MEI common types and traits.
 *
 * Copyright (c) 2024 Code Construct
 */

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Intel Management Engine Interface (MEI)
//!
//! This crate provides the session layer for talking to a management engine
//! client over a MEI (also known as HECI) character device.
//!
//! A [`Session`] connects to one ME client, identified by a [`ClientId`],
//! then exchanges opaque messages with it. Platform bindings implement
//! [`DeviceNode`] and [`Device`]; `mei-linux` provides the Linux
//! `/dev/meiN` implementation.
//!
//! Any failure during connect or transfer closes the device and returns
//! the session to its unconnected state. Callers decide whether to
//! reconnect.

use core::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

mod session;

pub use session::Session;

/// Identifies a management engine client to connect to.
///
/// Stored in the kernel's `uuid_le` byte order: the first three fields
/// are little-endian, the trailing eight bytes are in wire order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ClientId(pub [u8; 16]);

impl ClientId {
    /// Construct from the usual UUID fields, as with the kernel's
    /// `UUID_LE()` macro.
    pub const fn new(a: u32, b: u16, c: u16, d: [u8; 8]) -> Self {
        let a = a.to_le_bytes();
        let b = b.to_le_bytes();
        let c = c.to_le_bytes();
        ClientId([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d[0], d[1], d[2],
            d[3], d[4], d[5], d[6], d[7],
        ])
    }

    /// Returns this client ID as a standard UUID.
    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_bytes_le(self.0)
    }
}

impl From<Uuid> for ClientId {
    fn from(u: Uuid) -> Self {
        ClientId(u.to_bytes_le())
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ClientId::from)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_uuid().fmt(f)
    }
}

/// Properties of a connected client, as negotiated with the driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientProperties {
    /// Largest message the client accepts, in bytes
    pub max_msg_length: u32,
    /// Client protocol version
    pub protocol_version: u8,
}

/// Direction of a readiness wait
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interest {
    /// A message is available to read
    Readable,
    /// The device has accepted the written message
    Writable,
}

/// A MEI device node, not yet opened.
pub trait DeviceNode {
    /// Handle type produced by [`open`](Self::open)
    type Device: Device;

    /// Open the node for reading and writing.
    fn open(&self) -> io::Result<Self::Device>;

    /// Whether the calling process has administrative privilege.
    ///
    /// Used to tell "needs root" apart from other open failures.
    fn privileged(&self) -> bool;
}

/// An open MEI device handle.
///
/// The handle is released on drop.
pub trait Device {
    /// Connect this handle to the client `id`.
    fn connect_client(&mut self, id: &ClientId) -> io::Result<ClientProperties>;

    /// Write one message, returning the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read one message into `buf`, returning its length.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Wait for readiness.
    ///
    /// Returns `Ok(false)` if `timeout` passed with no event. A `None`
    /// timeout waits indefinitely.
    fn wait(
        &mut self,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> io::Result<bool>;
}

/// An error type for MEI sessions.
///
/// Apart from [`Error::NotInitialized`] and [`Error::MessageTooLong`], which
/// are raised before any I/O takes place, every error leaves the session
/// closed.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The device exists, but this process lacks privilege to open it
    #[error("Permission denied opening MEI device, run with root privilege")]
    PermissionDenied(#[source] io::Error),
    /// The device node is missing or busy
    #[error("Cannot establish a handle to the MEI driver: {0}")]
    DeviceUnavailable(#[source] io::Error),
    /// The driver rejected the connect-client request
    #[error("MEI connect client failed: {0}")]
    ConnectRejected(#[source] io::Error),
    /// The client connected with an unsupported protocol version
    #[error("MEI protocol version {negotiated} not supported, need {requested}")]
    ProtocolVersionMismatch {
        /// Version requested by the caller
        requested: u8,
        /// Version reported by the client
        negotiated: u8,
    },
    /// The session is not connected
    #[error("MEI session not connected")]
    NotInitialized,
    /// Message exceeds the client's negotiated maximum length
    #[error("MEI message length {len} exceeds client maximum {max}")]
    MessageTooLong {
        /// Requested message length
        len: usize,
        /// Negotiated maximum
        max: usize,
    },
    /// Writing to the device failed
    #[error("MEI write failed: {0}")]
    WriteFailed(#[source] io::Error),
    /// The device did not confirm the write before the deadline
    #[error("MEI write timed out")]
    SendTimeout,
    /// Waiting on the device failed
    #[error("MEI wait failed: {0}")]
    WaitFailed(#[source] io::Error),
    /// Reading from the device failed
    #[error("MEI read failed: {0}")]
    ReadFailed(#[source] io::Error),
    /// No message arrived before the deadline
    #[error("MEI read timed out")]
    RecvTimeout,
}

impl Error {
    /// Returns the OS error number underlying this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::PermissionDenied(e)
            | Self::DeviceUnavailable(e)
            | Self::ConnectRejected(e)
            | Self::WriteFailed(e)
            | Self::WaitFailed(e)
            | Self::ReadFailed(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// MEI result type
pub type Result<T> = core::result::Result<T, Error>;
