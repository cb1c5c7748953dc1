// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2024 Code Construct
 */

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use mei::{
    ClientId, ClientProperties, Device, DeviceNode, Error, Interest, Session,
};
use proptest::prelude::*;

const EACCES: i32 = 13;
const ENOENT: i32 = 2;
const EIO: i32 = 5;
const ENODEV: i32 = 19;
const EINTR: i32 = 4;

const CLIENT: ClientId = ClientId::new(
    0x55213584,
    0x9a29,
    0x4916,
    [0xba, 0xdf, 0x0f, 0xb7, 0xed, 0x68, 0x2a, 0xeb],
);

const TIMEOUT: Duration = Duration::from_millis(5000);

fn start_log() {
    let _ = env_logger::Builder::new()
        .filter(None, log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

#[derive(Clone, Copy, Debug)]
enum WaitResult {
    Ready,
    Timeout,
    Fail(i32),
}

/// Behaviour of the mock device
#[derive(Clone, Debug)]
struct Script {
    open_err: Option<i32>,
    privileged: bool,
    connect: Result<ClientProperties, i32>,
    write: Result<(), i32>,
    write_wait: WaitResult,
    read_wait: WaitResult,
    read: Result<Vec<u8>, i32>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            open_err: None,
            privileged: false,
            connect: Ok(ClientProperties {
                max_msg_length: 512,
                protocol_version: 1,
            }),
            write: Ok(()),
            write_wait: WaitResult::Ready,
            read_wait: WaitResult::Ready,
            read: Ok(vec![]),
        }
    }
}

/// Observations of device use, shared between the test and the mock
#[derive(Default, Debug)]
struct Record {
    opens: usize,
    closes: usize,
    io_calls: usize,
    written: Vec<Vec<u8>>,
    waits: Vec<(Interest, Option<Duration>)>,
}

type Shared = Rc<RefCell<Record>>;

struct MockNode {
    script: Script,
    record: Shared,
}

struct MockDevice {
    script: Script,
    record: Shared,
}

impl DeviceNode for MockNode {
    type Device = MockDevice;

    fn open(&self) -> io::Result<MockDevice> {
        if let Some(e) = self.script.open_err {
            return Err(io::Error::from_raw_os_error(e));
        }
        self.record.borrow_mut().opens += 1;
        Ok(MockDevice {
            script: self.script.clone(),
            record: self.record.clone(),
        })
    }

    fn privileged(&self) -> bool {
        self.script.privileged
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.record.borrow_mut().closes += 1;
    }
}

impl Device for MockDevice {
    fn connect_client(
        &mut self,
        id: &ClientId,
    ) -> io::Result<ClientProperties> {
        assert_eq!(*id, CLIENT);
        self.script.connect.map_err(io::Error::from_raw_os_error)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut r = self.record.borrow_mut();
        r.io_calls += 1;
        self.script.write.map_err(io::Error::from_raw_os_error)?;
        r.written.push(buf.to_vec());
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.record.borrow_mut().io_calls += 1;
        let msg = self
            .script
            .read
            .as_ref()
            .map_err(|e| io::Error::from_raw_os_error(*e))?;
        let len = msg.len().min(buf.len());
        buf[..len].copy_from_slice(&msg[..len]);
        Ok(len)
    }

    fn wait(
        &mut self,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> io::Result<bool> {
        let mut r = self.record.borrow_mut();
        r.io_calls += 1;
        r.waits.push((interest, timeout));
        let res = match interest {
            Interest::Writable => self.script.write_wait,
            Interest::Readable => self.script.read_wait,
        };
        match res {
            WaitResult::Ready => Ok(true),
            WaitResult::Timeout => Ok(false),
            WaitResult::Fail(e) => Err(io::Error::from_raw_os_error(e)),
        }
    }
}

fn session(script: Script) -> (Session<MockNode>, Shared) {
    let record = Shared::default();
    let node = MockNode {
        script,
        record: record.clone(),
    };
    (Session::new(node, true), record)
}

fn connected(script: Script) -> (Session<MockNode>, Shared) {
    let (mut s, r) = session(script);
    s.connect(&CLIENT, 0).unwrap();
    (s, r)
}

#[test]
fn connect_negotiates() {
    start_log();
    let (mut s, r) = session(Script::default());
    assert!(!s.is_connected());
    assert_eq!(s.properties(), None);

    let props = s.connect(&CLIENT, 1).unwrap();
    assert_eq!(props.max_msg_length, 512);
    assert_eq!(props.protocol_version, 1);
    assert!(s.is_connected());
    assert_eq!(s.properties(), Some(props));
    assert_eq!(s.client_id(), Some(CLIENT));
    assert_eq!(r.borrow().opens, 1);
    assert_eq!(r.borrow().closes, 0);
}

#[test]
fn close_idempotent() {
    start_log();
    let (mut s, r) = connected(Script::default());
    s.close();
    s.close();
    assert!(!s.is_connected());
    assert_eq!(r.borrow().closes, 1);

    // never connected
    let (mut s, r) = session(Script::default());
    s.close();
    s.close();
    assert_eq!(r.borrow().closes, 0);
}

#[test]
fn drop_closes() {
    start_log();
    let (s, r) = connected(Script::default());
    drop(s);
    assert_eq!(r.borrow().closes, 1);
}

#[test]
fn reconnect_closes_previous() {
    start_log();
    let (mut s, r) = connected(Script::default());
    s.connect(&CLIENT, 0).unwrap();
    assert!(s.is_connected());
    assert_eq!(r.borrow().opens, 2);
    assert_eq!(r.borrow().closes, 1);
}

proptest! {
    #[test]
    fn version_mismatch_rejected(
        requested in 1..=255u8,
        negotiated in 0..=255u8,
    ) {
        prop_assume!(requested != negotiated);
        start_log();
        let script = Script {
            connect: Ok(ClientProperties {
                max_msg_length: 512,
                protocol_version: negotiated,
            }),
            ..Default::default()
        };
        let (mut s, r) = session(script);
        let res = s.connect(&CLIENT, requested);
        let is_mismatch = matches!(
            res,
            Err(Error::ProtocolVersionMismatch { requested: req, negotiated: neg })
                if req == requested && neg == negotiated
        );
        prop_assert!(is_mismatch);
        prop_assert!(!s.is_connected());
        prop_assert_eq!(r.borrow().opens, 1);
        prop_assert_eq!(r.borrow().closes, 1);
    }

    #[test]
    fn any_version_accepted(negotiated in 0..=255u8) {
        start_log();
        let script = Script {
            connect: Ok(ClientProperties {
                max_msg_length: 512,
                protocol_version: negotiated,
            }),
            ..Default::default()
        };
        let (mut s, _r) = session(script);
        let props = s.connect(&CLIENT, 0).unwrap();
        prop_assert_eq!(props.protocol_version, negotiated);
        prop_assert!(s.is_connected());
    }
}

#[test]
fn connect_rejected() {
    start_log();
    let script = Script {
        connect: Err(ENODEV),
        ..Default::default()
    };
    let (mut s, r) = session(script);
    let e = s.connect(&CLIENT, 0).unwrap_err();
    assert!(matches!(e, Error::ConnectRejected(_)));
    assert_eq!(e.os_code(), Some(ENODEV));
    assert!(!s.is_connected());
    assert_eq!(r.borrow().closes, 1);
}

#[test]
fn not_initialized() {
    start_log();
    let (mut s, r) = session(Script::default());
    let mut buf = [0u8; 16];
    assert!(matches!(
        s.send(&[1, 2, 3], TIMEOUT),
        Err(Error::NotInitialized)
    ));
    assert!(matches!(
        s.recv(&mut buf, Some(TIMEOUT)),
        Err(Error::NotInitialized)
    ));
    assert_eq!(r.borrow().opens, 0);
    assert_eq!(r.borrow().io_calls, 0);

    // and after an explicit close
    s.connect(&CLIENT, 0).unwrap();
    s.close();
    assert!(matches!(s.send(&[1], TIMEOUT), Err(Error::NotInitialized)));
    assert!(matches!(s.recv(&mut buf, None), Err(Error::NotInitialized)));
    assert_eq!(r.borrow().io_calls, 0);
}

#[test]
fn roundtrip() {
    start_log();
    let response: Vec<u8> = (0x10..0x20).collect();
    let script = Script {
        read: Ok(response.clone()),
        ..Default::default()
    };
    let (mut s, r) = connected(script);

    let header = [0xff, 0x02, 0x00, 0x00, 0x00];
    assert_eq!(s.send(&header, TIMEOUT).unwrap(), 5);

    let mut buf = [0u8; 16];
    assert_eq!(s.recv(&mut buf, Some(TIMEOUT)).unwrap(), 16);
    assert_eq!(buf.as_slice(), response.as_slice());

    assert!(s.is_connected());
    let r = r.borrow();
    assert_eq!(r.written, vec![header.to_vec()]);
    assert_eq!(
        r.waits,
        vec![
            (Interest::Writable, Some(TIMEOUT)),
            (Interest::Readable, Some(TIMEOUT)),
        ]
    );
    assert_eq!(r.closes, 0);
}

#[test]
fn short_read() {
    start_log();
    let script = Script {
        read: Ok(vec![1, 2, 3, 4]),
        ..Default::default()
    };
    let (mut s, _r) = connected(script);
    let mut buf = [0u8; 20];
    assert_eq!(s.recv(&mut buf, None).unwrap(), 4);
    assert_eq!(&buf[..4], &[1, 2, 3, 4]);
}

#[test]
fn recv_without_deadline_does_not_wait() {
    start_log();
    let script = Script {
        read: Ok(vec![9]),
        read_wait: WaitResult::Timeout,
        ..Default::default()
    };
    let (mut s, r) = connected(script);
    let mut buf = [0u8; 4];
    assert_eq!(s.recv(&mut buf, None).unwrap(), 1);
    assert!(r.borrow().waits.is_empty());
}

#[test]
fn send_timeout() {
    start_log();
    let script = Script {
        write_wait: WaitResult::Timeout,
        ..Default::default()
    };
    let (mut s, r) = connected(script);
    let e = s.send(&[0xff, 0x02, 0, 0, 0], TIMEOUT).unwrap_err();
    assert!(matches!(e, Error::SendTimeout));
    assert!(!s.is_connected());
    assert_eq!(
        r.borrow().waits,
        vec![(Interest::Writable, Some(Duration::from_millis(5000)))]
    );
    assert_eq!(r.borrow().closes, 1);
}

fn check_teardown(script: Script, recv: bool, expect: fn(&Error) -> bool) {
    let (mut s, r) = connected(script);
    let mut buf = [0u8; 16];
    let e = if recv {
        s.recv(&mut buf, Some(TIMEOUT)).unwrap_err()
    } else {
        s.send(&[1, 2, 3, 4], TIMEOUT).unwrap_err()
    };
    assert!(expect(&e), "unexpected error {e:?}");
    assert!(!s.is_connected());
    assert_eq!(s.properties(), None);
    assert_eq!(r.borrow().closes, 1);

    // no further I/O once torn down
    let calls = r.borrow().io_calls;
    assert!(matches!(s.send(&[1], TIMEOUT), Err(Error::NotInitialized)));
    assert!(matches!(s.recv(&mut buf, None), Err(Error::NotInitialized)));
    s.close();
    assert_eq!(r.borrow().io_calls, calls);
    assert_eq!(r.borrow().closes, 1);
}

#[test]
fn fatal_errors_teardown() {
    start_log();
    check_teardown(
        Script {
            write: Err(EIO),
            ..Default::default()
        },
        false,
        |e| matches!(e, Error::WriteFailed(_)) && e.os_code() == Some(EIO),
    );
    check_teardown(
        Script {
            write_wait: WaitResult::Timeout,
            ..Default::default()
        },
        false,
        |e| matches!(e, Error::SendTimeout),
    );
    check_teardown(
        Script {
            write_wait: WaitResult::Fail(EINTR),
            ..Default::default()
        },
        false,
        |e| matches!(e, Error::WaitFailed(_)) && e.os_code() == Some(EINTR),
    );
    check_teardown(
        Script {
            read: Err(EIO),
            ..Default::default()
        },
        true,
        |e| matches!(e, Error::ReadFailed(_)) && e.os_code() == Some(EIO),
    );
    check_teardown(
        Script {
            read_wait: WaitResult::Timeout,
            ..Default::default()
        },
        true,
        |e| matches!(e, Error::RecvTimeout),
    );
    check_teardown(
        Script {
            read_wait: WaitResult::Fail(EIO),
            ..Default::default()
        },
        true,
        |e| matches!(e, Error::WaitFailed(_)),
    );
}

#[test]
fn message_too_long() {
    start_log();
    let script = Script {
        connect: Ok(ClientProperties {
            max_msg_length: 4,
            protocol_version: 1,
        }),
        ..Default::default()
    };
    let (mut s, r) = connected(script);
    let e = s.send(&[0u8; 5], TIMEOUT).unwrap_err();
    assert!(matches!(e, Error::MessageTooLong { len: 5, max: 4 }));
    // rejected before I/O, session stays up
    assert!(s.is_connected());
    assert_eq!(r.borrow().io_calls, 0);
    assert_eq!(s.send(&[0u8; 4], TIMEOUT).unwrap(), 4);
}

#[test]
fn permission_denied() {
    start_log();
    let script = Script {
        open_err: Some(EACCES),
        privileged: false,
        ..Default::default()
    };
    let (mut s, _r) = session(script);
    let e = s.connect(&CLIENT, 0).unwrap_err();
    assert!(matches!(e, Error::PermissionDenied(_)), "{e:?}");
    assert!(!s.is_connected());
}

#[test]
fn device_missing() {
    start_log();
    for privileged in [false, true] {
        let script = Script {
            open_err: Some(ENOENT),
            privileged,
            ..Default::default()
        };
        let (mut s, _r) = session(script);
        let e = s.connect(&CLIENT, 0).unwrap_err();
        assert!(matches!(e, Error::DeviceUnavailable(_)), "{e:?}");
        assert_eq!(e.os_code(), Some(ENOENT));
    }
}

#[test]
fn privileged_access_failure() {
    start_log();
    // root is not told to become root
    let script = Script {
        open_err: Some(EACCES),
        privileged: true,
        ..Default::default()
    };
    let (mut s, _r) = session(script);
    let e = s.connect(&CLIENT, 0).unwrap_err();
    assert!(matches!(e, Error::DeviceUnavailable(_)), "{e:?}");
}
