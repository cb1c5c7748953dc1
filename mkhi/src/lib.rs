// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * MKHI messaging over MEI
 *
 * Copyright (c) 2024 Code Construct
 */

#![forbid(unsafe_code)]

//! # ME Kernel Host Interface (MKHI)
//!
//! MKHI is a command protocol served by the management engine's fixed
//! address client. Messages start with a four byte [`MkhiHeader`],
//! followed by command-specific data.
//!
//! [`MkhiClient`] wraps a [`mei::Session`] connected to
//! [`MKHI_FIXED_CLIENT`]. On Linux, fixed address clients may need to be
//! enabled first, see `mei_linux::MeiNode::allow_fixed_address()`.

use core::fmt;
use std::time::Duration;

use nom::{
    combinator::map, number::complete::le_u16, number::complete::le_u32,
    sequence::tuple, IResult,
};
use thiserror::Error;

use mei::ClientId;

mod client;

pub use client::MkhiClient;

/// The MKHI fixed address client
pub const MKHI_FIXED_CLIENT: ClientId = ClientId::new(
    0x55213584,
    0x9a29,
    0x4916,
    [0xba, 0xdf, 0x0f, 0xb7, 0xed, 0x68, 0x2a, 0xeb],
);

/// Generic command group
pub const MKHI_GROUP_GEN: u8 = 0xff;

/// Get Firmware Version command, in [`MKHI_GROUP_GEN`]
pub const GEN_GET_FW_VERSION_CMD: u8 = 0x02;

/// Get Firmware Version request
pub const GEN_GET_FW_VERSION: MkhiHeader =
    MkhiHeader::request(MKHI_GROUP_GEN, GEN_GET_FW_VERSION_CMD);

/// Send timeout used when none is given
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(20000);

type VResult<I, O> = IResult<I, O>;

/// MKHI error type
#[derive(Error, Debug)]
pub enum MkhiError {
    /// MEI transport error
    #[error("MEI error: {0}")]
    Mei(#[from] mei::Error),
    /// Malformed or unexpected response
    #[error("MKHI protocol error: {0}")]
    Protocol(String),
    /// The command completed with a failure result
    #[error(
        "MKHI command (group 0x{group:02x}, command 0x{command:02x}) failed with 0x{result:02x}"
    )]
    Command {
        /// Command group
        group: u8,
        /// Command
        command: u8,
        /// Result code from the response
        result: u8,
    },
}

/// MKHI result type
pub type Result<T> = core::result::Result<T, MkhiError>;

/// MKHI message header.
///
/// On the wire this is a single little-endian `u32`:
///
/// | bits   | field       |
/// |--------|-------------|
/// | 0..8   | group id    |
/// | 8..15  | command     |
/// | 15     | is response |
/// | 16..24 | reserved    |
/// | 24..32 | result      |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MkhiHeader {
    /// Command group
    pub group_id: u8,
    /// Command, 7 bits
    pub command: u8,
    /// Set in responses
    pub is_response: bool,
    /// Result code, zero on success
    pub result: u8,
}

impl MkhiHeader {
    /// Encoded length
    pub const LEN: usize = 4;

    const COMMAND_MASK: u8 = 0x7f;

    /// A request header for `command` in `group_id`.
    pub const fn request(group_id: u8, command: u8) -> Self {
        Self {
            group_id,
            command: command & Self::COMMAND_MASK,
            is_response: false,
            result: 0,
        }
    }

    /// Pack into the wire `u32`. Bits beyond the command width are dropped.
    pub const fn to_u32(&self) -> u32 {
        self.group_id as u32
            | ((self.command & Self::COMMAND_MASK) as u32) << 8
            | (self.is_response as u32) << 15
            | (self.result as u32) << 24
    }

    /// Unpack from the wire `u32`. The reserved byte is ignored.
    pub const fn from_u32(v: u32) -> Self {
        Self {
            group_id: v as u8,
            command: (v >> 8) as u8 & Self::COMMAND_MASK,
            is_response: v & (1 << 15) != 0,
            result: (v >> 24) as u8,
        }
    }

    /// Encode to bytes
    pub const fn to_bytes(&self) -> [u8; Self::LEN] {
        self.to_u32().to_le_bytes()
    }

    /// Parse a header
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(le_u32, Self::from_u32)(buf)
    }

    /// Returns whether `self` is a response to `req`.
    pub fn responds_to(&self, req: &MkhiHeader) -> bool {
        self.is_response
            && self.group_id == req.group_id
            && self.command == req.command
    }
}

/// A firmware version
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FwVersion {
    pub minor: u16,
    pub major: u16,
    pub build: u16,
    pub hotfix: u16,
}

impl FwVersion {
    /// Parse from minor, major, build, hotfix little-endian fields
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(
            tuple((le_u16, le_u16, le_u16, le_u16)),
            |(minor, major, build, hotfix)| Self {
                minor,
                major,
                build,
                hotfix,
            },
        )(buf)
    }
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.hotfix, self.build
        )
    }
}

/// Get Firmware Version response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FwVersionResponse {
    /// Response header
    pub header: MkhiHeader,
    /// Main firmware code version
    pub code: FwVersion,
    /// Fault tolerant partition (recovery) version
    pub nftp: FwVersion,
}

impl FwVersionResponse {
    /// Encoded length
    pub const LEN: usize = MkhiHeader::LEN + 16;

    /// Parse a response
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(
            tuple((MkhiHeader::parse, FwVersion::parse, FwVersion::parse)),
            |(header, code, nftp)| Self { header, code, nftp },
        )(buf)
    }
}
