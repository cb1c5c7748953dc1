// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Simple MEI example: connect to a client and report its properties.
 *
 * Copyright (c) 2024 Code Construct
 */

use mei::{ClientId, Session};
use mei_linux::MeiNode;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // MKHI fixed address client
    const CLIENT: ClientId = ClientId::new(
        0x55213584,
        0x9a29,
        0x4916,
        [0xba, 0xdf, 0x0f, 0xb7, 0xed, 0x68, 0x2a, 0xeb],
    );

    // Opening /dev/mei0 typically needs root
    let mut session = Session::new(MeiNode::default(), true);

    // Any protocol version is acceptable here
    let props = session.connect(&CLIENT, 0)?;

    println!(
        "client {CLIENT}: max message length {}, protocol version {}",
        props.max_msg_length, props.protocol_version
    );

    session.close();
    Ok(())
}
