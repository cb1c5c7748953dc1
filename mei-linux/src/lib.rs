// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * MEI support through the Linux kernel character device
 *
 * Copyright (c) 2024 Code Construct
 */

#![warn(missing_docs)]

//! Interface for the Linux MEI character device.
//!
//! This crate provides a minimal wrapper around the `/dev/meiN` device
//! nodes, implementing the [`mei::DeviceNode`] and [`mei::Device`] traits
//! with standard file operations, [`libc::poll`] and the MEI connect ioctl.
//!
//! ```no_run
//! use mei::{ClientId, Session};
//! use mei_linux::MeiNode;
//! use std::time::Duration;
//!
//! let client: ClientId = "55213584-9a29-4916-badf-0fb7ed682aeb".parse()?;
//! let mut session = Session::new(MeiNode::default(), false);
//! let props = session.connect(&client, 0)?;
//!
//! session.send(&[0xff, 0x02, 0x00, 0x00], Duration::from_secs(5))?;
//! let mut buf = vec![0u8; props.max_msg_length as usize];
//! let len = session.recv(&mut buf, Some(Duration::from_secs(5)))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use core::mem;
use std::fs::{File, OpenOptions};
use std::io::{Error, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[allow(unused)]
use log::{debug, trace, warn};

use mei::{ClientId, ClientProperties, Interest};

/* until we have these in libc... */
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(non_camel_case_types)]
struct mei_client {
    max_msg_length: u32,
    protocol_version: u8,
    #[allow(dead_code)]
    reserved: [u8; 3],
}

#[repr(C)]
#[allow(non_camel_case_types)]
union mei_connect_client_data {
    in_client_uuid: [u8; 16],
    out_client_properties: mei_client,
}

const fn iowr(typ: u8, nr: u8, size: usize) -> u32 {
    const IOC_READ_WRITE: u32 = 3;
    (IOC_READ_WRITE << 30)
        | ((size as u32) << 16)
        | ((typ as u32) << 8)
        | nr as u32
}

const IOCTL_MEI_CONNECT_CLIENT: u32 =
    iowr(b'H', 0x01, mem::size_of::<mei_connect_client_data>());

/// Default MEI device node
pub const MEI_DEFAULT_DEVICE: &str = "/dev/mei0";

const DEBUGFS_MEI: &str = "/sys/kernel/debug";

/// A MEI device node path.
#[derive(Debug, Clone)]
pub struct MeiNode {
    path: PathBuf,
}

impl MeiNode {
    /// Create a node for the device at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the device path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the device name, such as `mei0`
    pub fn name(&self) -> Option<&str> {
        self.path.file_name()?.to_str()
    }

    /// Returns the debugfs control file for fixed address clients.
    pub fn fixed_address_control(&self) -> Option<PathBuf> {
        let name = self.name()?;
        Some(
            [DEBUGFS_MEI, name, "allow_fixed_address"]
                .iter()
                .collect(),
        )
    }

    /// Allow connections to fixed address clients, such as MKHI.
    ///
    /// Requires debugfs to be mounted, and root privilege.
    pub fn allow_fixed_address(&self) -> std::io::Result<()> {
        let ctl = self.fixed_address_control().ok_or_else(|| {
            Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no device name in {}", self.path.display()),
            )
        })?;
        debug!("enabling fixed address clients via {}", ctl.display());
        std::fs::write(&ctl, b"Y")
    }
}

impl Default for MeiNode {
    fn default() -> Self {
        Self::new(MEI_DEFAULT_DEVICE)
    }
}

impl mei::DeviceNode for MeiNode {
    type Device = MeiDevice;

    fn open(&self) -> std::io::Result<MeiDevice> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&self.path)?;
        debug!("opened {}", self.path.display());
        Ok(MeiDevice(f))
    }

    fn privileged(&self) -> bool {
        // safety: geteuid() cannot fail
        unsafe { libc::geteuid() == 0 }
    }
}

// Milliseconds for poll(), rounded up. None waits forever.
fn poll_timeout(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// An open MEI device.
///
/// The device is closed on drop.
pub struct MeiDevice(File);

impl mei::Device for MeiDevice {
    fn connect_client(
        &mut self,
        id: &ClientId,
    ) -> std::io::Result<ClientProperties> {
        let mut data = mei_connect_client_data {
            in_client_uuid: id.0,
        };
        let fd = self.as_raw_fd();

        let rc = unsafe {
            libc::ioctl(
                fd,
                IOCTL_MEI_CONNECT_CLIENT as _,
                &mut data as *mut mei_connect_client_data,
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }

        // safety: on success the driver has filled the output properties
        let cl = unsafe { data.out_client_properties };
        Ok(ClientProperties {
            max_msg_length: cl.max_msg_length,
            protocol_version: cl.protocol_version,
        })
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }

    fn wait(
        &mut self,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> std::io::Result<bool> {
        let events = match interest {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
        };
        let mut pfd = libc::pollfd {
            fd: self.as_raw_fd(),
            events,
            revents: 0,
        };

        let rc = unsafe { libc::poll(&mut pfd, 1, poll_timeout(timeout)) };

        if rc < 0 {
            return Err(Error::last_os_error());
        }
        if rc == 0 {
            return Ok(false);
        }
        if pfd.revents & events != 0 {
            Ok(true)
        } else {
            // POLLERR, POLLHUP or POLLNVAL
            trace!("poll revents 0x{:x}", pfd.revents);
            Err(Error::new(
                std::io::ErrorKind::Other,
                format!("device error, poll events 0x{:x}", pfd.revents),
            ))
        }
    }
}

impl AsRawFd for MeiDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for MeiDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl From<File> for MeiDevice {
    /// Wrap an already-open device file.
    fn from(f: File) -> Self {
        MeiDevice(f)
    }
}
