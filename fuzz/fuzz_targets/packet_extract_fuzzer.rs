//! Fuzz target for packet extraction on hostile input
//!
//! # Strategy
//!
//! - Every length prefix kind plus one- and multi-byte separators
//! - Raw attacker-controlled bytes, including oversized declared lengths and
//!   unterminated VarInts
//!
//! # Invariants
//!
//! - Extraction never panics
//! - `rest` is a strict suffix of the input (progress on every packet)
//! - The packet lies entirely before `rest`
//! - Extraction is deterministic

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tinytcp_proto::{FramingProtocol, LengthPrefix, LengthPrefixed, SplitBySeparator};

#[derive(Debug, Arbitrary)]
enum Protocol {
    Prefixed(u8),
    Newline,
    Crlf,
    Custom(Vec<u8>),
}

#[derive(Debug, Arbitrary)]
struct Input {
    protocol: Protocol,
    data: Vec<u8>,
}

fn build(protocol: Protocol) -> Option<Box<dyn FramingProtocol>> {
    Some(match protocol {
        Protocol::Prefixed(kind) => {
            let prefix = LengthPrefix::ALL[kind as usize % LengthPrefix::ALL.len()];
            Box::new(LengthPrefixed::new(prefix))
        },
        Protocol::Newline => Box::new(SplitBySeparator::newline()),
        Protocol::Crlf => Box::new(SplitBySeparator::new(*b"\r\n").ok()?),
        Protocol::Custom(separator) => Box::new(SplitBySeparator::new(separator).ok()?),
    })
}

fuzz_target!(|input: Input| {
    let Some(protocol) = build(input.protocol) else {
        return;
    };

    let mut buf = &input.data[..];
    while let Some((packet, rest)) = protocol.extract_packet(buf) {
        assert!(rest.len() < buf.len(), "extraction must consume input");
        assert!(packet.len() <= buf.len() - rest.len(), "packet must precede rest");
        assert_eq!(&buf[buf.len() - rest.len()..], rest, "rest must be a suffix");

        let again = protocol.extract_packet(buf).expect("deterministic");
        assert_eq!(again, (packet, rest));

        buf = rest;
    }
});
