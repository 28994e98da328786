//! Property tests for packet reassembly across read boundaries.
//!
//! A scripted stream replays an encoded packet sequence cut at arbitrary
//! points; the framing loop must deliver exactly the encoded packets, in
//! order, for every cut and every read buffer size.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::BytesMut;
use proptest::prelude::*;
use tinytcp::{
    Closer, DeadlineSetter, FramingConfig, FramingProtocol, LengthPrefix, LengthPrefixed,
    OverflowPolicy, PacketHandler, Reader, SocketError, SplitBySeparator, Writer, read_packets,
};
use tokio::time::Instant;

/// Replays fixed chunks, then reports end of stream.
struct ScriptedStream {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    closed: AtomicBool,
}

impl ScriptedStream {
    fn new(stream: &[u8], cuts: &[usize]) -> Self {
        let mut chunks = VecDeque::new();
        let mut start = 0;
        for &cut in cuts {
            if cut > start && cut < stream.len() {
                chunks.push_back(stream[start..cut].to_vec());
                start = cut;
            }
        }
        chunks.push_back(stream[start..].to_vec());
        Self { chunks: Mutex::new(chunks), closed: AtomicBool::new(false) }
    }
}

#[async_trait]
impl Reader for ScriptedStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let mut chunks = self.chunks.lock().unwrap();
        let Some(mut chunk) = chunks.pop_front() else {
            self.closed.store(true, Ordering::SeqCst);
            return Err(SocketError::EndOfStream);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            chunks.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

#[async_trait]
impl Writer for ScriptedStream {
    async fn write(&self, buf: &[u8]) -> Result<usize, SocketError> {
        Ok(buf.len())
    }
}

#[async_trait]
impl Closer for ScriptedStream {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DeadlineSetter for ScriptedStream {
    fn set_read_deadline(&self, _deadline: Option<Instant>) -> Result<(), SocketError> {
        Ok(())
    }

    fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<(), SocketError> {
        Ok(())
    }
}

#[derive(Default)]
struct Collect(Vec<Vec<u8>>);

#[async_trait]
impl PacketHandler for Collect {
    async fn on_packet(&mut self, packet: &[u8]) {
        self.0.push(packet.to_vec());
    }
}

fn run_framing(
    protocol: &dyn FramingProtocol,
    stream: &ScriptedStream,
    config: &FramingConfig,
) -> Vec<Vec<u8>> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let mut collect = Collect::default();
    runtime.block_on(read_packets(stream, protocol, config, &mut collect));
    assert!(stream.is_closed());
    collect.0
}

fn encode_all(protocol: &dyn FramingProtocol, payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for payload in payloads {
        protocol.encode_packet(payload, &mut buf).unwrap();
    }
    buf.to_vec()
}

fn unlimited(read_buffer_size: usize) -> FramingConfig {
    FramingConfig { read_buffer_size, max_packet_size: 0, ..FramingConfig::default() }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_prefixed_stream_survives_any_chunking(
        prefix in prop::sample::select(LengthPrefix::ALL.to_vec()),
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 0..12),
        cuts in prop::collection::vec(0usize..4096, 0..20),
        read_buffer_size in 1usize..128,
    ) {
        let protocol = LengthPrefixed::new(prefix);
        let mut cuts = cuts;
        cuts.sort_unstable();

        let stream = ScriptedStream::new(&encode_all(&protocol, &payloads), &cuts);
        let packets = run_framing(&protocol, &stream, &unlimited(read_buffer_size));

        prop_assert_eq!(packets, payloads);
    }

    #[test]
    fn prop_separator_stream_survives_any_chunking(
        payloads in prop::collection::vec(
            prop::collection::vec(any::<u8>().prop_filter("no separator", |b| *b != b'\n'), 0..200),
            0..12,
        ),
        cuts in prop::collection::vec(0usize..2048, 0..20),
        read_buffer_size in 1usize..64,
    ) {
        let protocol = SplitBySeparator::newline();
        let mut cuts = cuts;
        cuts.sort_unstable();

        let stream = ScriptedStream::new(&encode_all(&protocol, &payloads), &cuts);
        let packets = run_framing(&protocol, &stream, &unlimited(read_buffer_size));

        prop_assert_eq!(packets, payloads);
    }

    #[test]
    fn prop_multibyte_separator_split_across_reads(
        payloads in prop::collection::vec(prop::collection::vec(b'a'..=b'z', 0..50), 1..8),
        read_buffer_size in 1usize..8,
    ) {
        let protocol = SplitBySeparator::new(*b"\r\n").unwrap();
        let stream = ScriptedStream::new(&encode_all(&protocol, &payloads), &[]);
        let packets = run_framing(&protocol, &stream, &unlimited(read_buffer_size));

        prop_assert_eq!(packets, payloads);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_default_limits_keep_every_packet_under_the_limit(
        use_prefix in any::<bool>(),
        payloads in prop::collection::vec(
            prop::collection::vec(any::<u8>().prop_map(|b| if b == b'\n' { b' ' } else { b }), 0..16_000),
            1..6,
        ),
        cuts in prop::collection::vec(0usize..80_000, 0..40),
    ) {
        let protocol: Box<dyn FramingProtocol> = if use_prefix {
            Box::new(LengthPrefixed::new(LengthPrefix::U32Be))
        } else {
            Box::new(SplitBySeparator::newline())
        };
        let mut cuts = cuts;
        cuts.sort_unstable();

        let stream = ScriptedStream::new(&encode_all(&*protocol, &payloads), &cuts);
        let packets = run_framing(&*protocol, &stream, &FramingConfig::default());

        prop_assert_eq!(packets, payloads);
    }
}

#[test]
fn large_packet_completed_by_a_crowded_read_is_delivered() {
    let protocol = SplitBySeparator::newline();
    let mut payloads = vec![vec![b'a'; 3999], vec![b'b'; 12_999]];
    payloads.extend(std::iter::repeat_n(b"ok".to_vec(), 2000));

    // One chunk, so every read fills the whole default read buffer.
    let stream = ScriptedStream::new(&encode_all(&protocol, &payloads), &[]);
    let packets = run_framing(&protocol, &stream, &FramingConfig::default());

    assert_eq!(packets.len(), 2002);
    assert_eq!(packets, payloads);
}

#[test]
fn oversized_packet_between_valid_ones_is_skipped() {
    let protocol = LengthPrefixed::new(LengthPrefix::U16Be);
    let payloads = vec![b"first".to_vec(), vec![0xAB; 98], b"last".to_vec()];
    let encoded = encode_all(&protocol, &payloads);

    // The oversized packet spans exactly two reads, so both are discarded
    // and the next read starts on a packet boundary.
    let stream = ScriptedStream::new(&encoded, &[7, 7 + 100]);
    let config = FramingConfig {
        read_buffer_size: 50,
        max_packet_size: 32,
        overflow_policy: OverflowPolicy::DropAndResync,
        ..FramingConfig::default()
    };

    let packets = run_framing(&protocol, &stream, &config);

    assert_eq!(packets, vec![b"first".to_vec(), b"last".to_vec()]);
}
