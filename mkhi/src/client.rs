// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * MKHI requester.
 *
 * Copyright (c) 2024 Code Construct
 */

use std::time::Duration;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use mei::{ClientProperties, DeviceNode, Session};

use crate::{
    FwVersionResponse, MkhiError, MkhiHeader, Result, DEFAULT_SEND_TIMEOUT,
    GEN_GET_FW_VERSION, MKHI_FIXED_CLIENT,
};

/// A MKHI requester.
///
/// Each command is a single request/response exchange. Transport failures
/// close the underlying session; the client does not reconnect by itself,
/// see [`reconnect`](Self::reconnect).
pub struct MkhiClient<N: DeviceNode> {
    session: Session<N>,
    timeout: Duration,
}

impl<N: DeviceNode> MkhiClient<N> {
    /// Connect to the MKHI client on `node`.
    ///
    /// `timeout` bounds each send and receive. A zero timeout selects
    /// [`DEFAULT_SEND_TIMEOUT`].
    pub fn new(node: N, timeout: Duration, verbose: bool) -> Result<Self> {
        let timeout = if timeout.is_zero() {
            DEFAULT_SEND_TIMEOUT
        } else {
            timeout
        };
        let mut session = Session::new(node, verbose);
        session.connect(&MKHI_FIXED_CLIENT, 0)?;
        Ok(Self { session, timeout })
    }

    /// Re-establish the connection after a failure.
    pub fn reconnect(&mut self) -> Result<ClientProperties> {
        Ok(self.session.connect(&MKHI_FIXED_CLIENT, 0)?)
    }

    /// Returns the transfer timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Borrow the underlying session
    pub fn session(&mut self) -> &mut Session<N> {
        &mut self.session
    }

    /// Take the underlying session
    pub fn into_session(self) -> Session<N> {
        self.session
    }

    /// Send a request and receive the response into `resp`.
    ///
    /// Returns the received portion of `resp`. The response is not
    /// interpreted.
    pub fn command<'f>(
        &mut self,
        req: &[u8],
        resp: &'f mut [u8],
    ) -> Result<&'f mut [u8]> {
        self.session.send(req, self.timeout)?;
        let len = self.session.recv(resp, Some(self.timeout))?;
        Ok(&mut resp[..len])
    }

    /// Query firmware versions.
    pub fn get_fw_version(&mut self) -> Result<FwVersionResponse> {
        let req = GEN_GET_FW_VERSION;
        let mut buf = [0u8; FwVersionResponse::LEN];
        let rsp = self.command(&req.to_bytes(), &mut buf)?;

        let (_, header) = MkhiHeader::parse(rsp).map_err(|e| {
            MkhiError::Protocol(format!("short response header: {e:?}"))
        })?;
        check_response(&req, &header)?;

        let (_, r) = FwVersionResponse::parse(rsp).map_err(|_| {
            MkhiError::Protocol(format!(
                "short firmware version response, {} bytes",
                rsp.len()
            ))
        })?;
        debug!("firmware version {}, recovery {}", r.code, r.nftp);
        Ok(r)
    }
}

fn check_response(req: &MkhiHeader, rsp: &MkhiHeader) -> Result<()> {
    if !rsp.responds_to(req) {
        return Err(MkhiError::Protocol(format!(
            "unexpected response {rsp:?} to request {req:?}"
        )));
    }
    if rsp.result != 0 {
        return Err(MkhiError::Command {
            group: rsp.group_id,
            command: rsp.command,
            result: rsp.result,
        });
    }
    Ok(())
}
