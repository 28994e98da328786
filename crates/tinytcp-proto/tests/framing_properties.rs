//! Property-based tests for packet extraction.
//!
//! These verify the framing laws for all inputs, not just examples: encoding
//! followed by extraction is the identity, and a truncated buffer never
//! yields a packet or gets modified.

use bytes::BytesMut;
use proptest::prelude::*;
use tinytcp_proto::{FramingProtocol, LengthPrefix, LengthPrefixed, SplitBySeparator};

fn arbitrary_prefix() -> impl Strategy<Value = LengthPrefix> {
    prop::sample::select(LengthPrefix::ALL.to_vec())
}

/// Payloads free of `\n`, so that separator framing can carry them.
fn line_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>().prop_filter("no newline", |b| *b != b'\n'), 0..256)
}

fn extract_all<P: FramingProtocol>(protocol: &P, mut buf: &[u8]) -> (Vec<Vec<u8>>, Vec<u8>) {
    let mut packets = Vec::new();
    while let Some((packet, rest)) = protocol.extract_packet(buf) {
        packets.push(packet.to_vec());
        buf = rest;
    }
    (packets, buf.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_length_prefix_roundtrip(
        prefix in arbitrary_prefix(),
        payload in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let protocol = LengthPrefixed::new(prefix);
        let mut buf = BytesMut::new();
        protocol.encode_packet(&payload, &mut buf).expect("payload fits every prefix");

        let (packet, rest) = protocol.extract_packet(&buf).expect("full packet is buffered");

        // PROPERTY: extract(encode(p)) == (p, [])
        prop_assert_eq!(packet, &payload[..]);
        prop_assert!(rest.is_empty());
    }

    #[test]
    fn prop_truncated_packet_is_not_extracted(
        prefix in arbitrary_prefix(),
        payload in prop::collection::vec(any::<u8>(), 1..512),
        cut in any::<prop::sample::Index>(),
    ) {
        let protocol = LengthPrefixed::new(prefix);
        let mut buf = BytesMut::new();
        protocol.encode_packet(&payload, &mut buf).expect("payload fits every prefix");

        let truncated = buf[..cut.index(buf.len())].to_vec();
        let before = truncated.clone();

        // PROPERTY: fewer bytes than prefix + length never extract, input untouched
        prop_assert!(protocol.extract_packet(&truncated).is_none());
        prop_assert_eq!(truncated, before);
    }

    #[test]
    fn prop_separator_stream_yields_every_payload(
        payloads in prop::collection::vec(line_payload(), 0..32),
    ) {
        let protocol = SplitBySeparator::newline();
        let mut stream = BytesMut::new();
        for payload in &payloads {
            protocol.encode_packet(payload, &mut stream).expect("payload has no separator");
        }

        let (packets, rest) = extract_all(&protocol, &stream);

        prop_assert_eq!(packets, payloads);
        prop_assert!(rest.is_empty());
    }

    #[test]
    fn prop_concatenated_prefixed_packets_extract_in_order(
        prefix in arbitrary_prefix(),
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..128), 0..16),
    ) {
        let protocol = LengthPrefixed::new(prefix);
        let mut stream = BytesMut::new();
        for payload in &payloads {
            protocol.encode_packet(payload, &mut stream).expect("payload fits every prefix");
        }

        let (packets, rest) = extract_all(&protocol, &stream);

        prop_assert_eq!(packets, payloads);
        prop_assert!(rest.is_empty());
    }
}
