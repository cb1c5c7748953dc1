// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * MEI client sessions.
 *
 * Copyright (c) 2024 Code Construct
 */

use std::io;
use std::time::Duration;

#[allow(unused)]
use log::{debug, log, trace, warn, Level};

use crate::{
    ClientId, ClientProperties, Device, DeviceNode, Error, Interest, Result,
};

/// An open device, connected to a client.
struct Connection<D> {
    dev: D,
    client: ClientId,
    props: ClientProperties,
}

/// A session with one management engine client.
///
/// A new `Session` is not connected. [`connect`](Session::connect) opens the
/// device node and negotiates client properties; after that
/// [`send`](Session::send) and [`recv`](Session::recv) may be used.
///
/// Any transfer failure closes the device, after which the session must be
/// connected again. A `Session` is not intended for concurrent use; callers
/// sharing one between threads must serialise access themselves.
pub struct Session<N: DeviceNode> {
    node: N,
    conn: Option<Connection<N::Device>>,
    verbose: bool,
}

impl<N: DeviceNode> Session<N> {
    /// Create an unconnected session for `node`.
    ///
    /// With `verbose` set, negotiation and transfer details are logged at
    /// `info` level rather than `debug`.
    pub fn new(node: N, verbose: bool) -> Self {
        Self {
            node,
            conn: None,
            verbose,
        }
    }

    fn msg_level(&self) -> Level {
        if self.verbose {
            Level::Info
        } else {
            Level::Debug
        }
    }

    /// Connect to client `client`.
    ///
    /// If `protocol_version` is non-zero, the client must report exactly
    /// that version, otherwise the connection is dropped and
    /// [`Error::ProtocolVersionMismatch`] returned. Zero accepts any version.
    ///
    /// An existing connection is closed first.
    pub fn connect(
        &mut self,
        client: &ClientId,
        protocol_version: u8,
    ) -> Result<ClientProperties> {
        self.close();
        let lvl = self.msg_level();

        // The device is dropped, and so closed, on any early return.
        let mut dev = self.node.open().map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied
                && !self.node.privileged()
            {
                Error::PermissionDenied(e)
            } else {
                Error::DeviceUnavailable(e)
            }
        })?;

        let props = dev.connect_client(client).map_err(|e| {
            warn!("connect to client {client} failed: {e}");
            Error::ConnectRejected(e)
        })?;

        log!(lvl, "max_message_length {}", props.max_msg_length);
        log!(lvl, "protocol_version {}", props.protocol_version);

        if protocol_version > 0 && props.protocol_version != protocol_version
        {
            warn!(
                "client {client} protocol version {} not supported",
                props.protocol_version
            );
            return Err(Error::ProtocolVersionMismatch {
                requested: protocol_version,
                negotiated: props.protocol_version,
            });
        }

        self.conn = Some(Connection {
            dev,
            client: *client,
            props,
        });
        Ok(props)
    }

    /// Close the session.
    ///
    /// Has no effect on an unconnected session.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!("closing connection to client {}", conn.client);
        }
    }

    // Closes the session on a fatal transfer error
    fn teardown(&mut self, e: Error) -> Error {
        warn!("{e}, closing session");
        self.close();
        e
    }

    /// Send a message.
    ///
    /// After the write, waits up to `timeout` for the device to confirm it.
    /// Returns the number of bytes written.
    pub fn send(&mut self, buf: &[u8], timeout: Duration) -> Result<usize> {
        let lvl = self.msg_level();
        let conn = self.conn.as_mut().ok_or(Error::NotInitialized)?;

        let max = conn.props.max_msg_length as usize;
        if buf.len() > max {
            return Err(Error::MessageTooLong {
                len: buf.len(),
                max,
            });
        }

        log!(lvl, "call write length = {}", buf.len());
        trace!("tx {:02x?}", buf);

        let res = conn.dev.write(buf).map_err(Error::WriteFailed).and_then(
            |written| match conn.dev.wait(Interest::Writable, Some(timeout)) {
                Ok(true) => Ok(written),
                Ok(false) => Err(Error::SendTimeout),
                Err(e) => Err(Error::WaitFailed(e)),
            },
        );

        match res {
            Ok(written) => {
                log!(lvl, "write success");
                Ok(written)
            }
            Err(e) => Err(self.teardown(e)),
        }
    }

    /// Receive a message into `buf`.
    ///
    /// With a `timeout`, waits that long for a message to become available
    /// before reading. `None` blocks in the read itself.
    ///
    /// Returns the length of the message, which may be shorter than `buf`.
    pub fn recv(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let lvl = self.msg_level();
        let conn = self.conn.as_mut().ok_or(Error::NotInitialized)?;

        log!(lvl, "call read length = {}", buf.len());

        let ready = match timeout {
            None => Ok(()),
            Some(t) => match conn.dev.wait(Interest::Readable, Some(t)) {
                Ok(true) => Ok(()),
                Ok(false) => Err(Error::RecvTimeout),
                Err(e) => Err(Error::WaitFailed(e)),
            },
        };
        let res = ready
            .and_then(|()| conn.dev.read(buf).map_err(Error::ReadFailed));

        match res {
            Ok(len) => {
                log!(lvl, "read succeeded with result {len}");
                trace!("rx {:02x?}", &buf[..len.min(buf.len())]);
                Ok(len)
            }
            Err(e) => Err(self.teardown(e)),
        }
    }

    /// Returns `true` if the session is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Returns the negotiated client properties, if connected.
    pub fn properties(&self) -> Option<ClientProperties> {
        self.conn.as_ref().map(|c| c.props)
    }

    /// Returns the connected client, if any.
    pub fn client_id(&self) -> Option<ClientId> {
        self.conn.as_ref().map(|c| c.client)
    }

    /// Returns the verbose setting
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Borrow the device node
    pub fn node(&self) -> &N {
        &self.node
    }
}
