//! Fuzz target for packet reassembly across arbitrary read boundaries
//!
//! Drives the real framing loop (`tinytcp::read_packets`) over a scripted
//! stream that hands out the encoded bytes in chunks of arbitrary sizes,
//! with arbitrary read buffer sizes and packet limits.
//!
//! # Invariants
//!
//! - The loop terminates and closes the stream at end of input
//! - When every encoded packet fits the limit, every packet is recovered
//!   exactly once, in order

#![no_main]

use std::{
    collections::VecDeque,
    sync::{
        Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use arbitrary::Arbitrary;
use async_trait::async_trait;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tinytcp::{
    Closer, DeadlineSetter, FramingConfig, OverflowPolicy, PacketHandler, Reader, SocketError,
    Writer, read_packets,
};
use tinytcp_proto::{FramingProtocol, LengthPrefix, LengthPrefixed, SplitBySeparator};
use tokio::{runtime::Runtime, time::Instant};

#[derive(Debug, Arbitrary)]
struct Input {
    prefix: Option<u8>,
    payloads: Vec<Vec<u8>>,
    chunk_sizes: Vec<u8>,
    read_buffer_size: u8,
    max_packet_size: Option<u16>,
    close_on_overflow: bool,
}

struct Chunked {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    closed: AtomicBool,
}

impl Chunked {
    fn new(stream: &[u8], sizes: &[u8]) -> Self {
        let mut chunks = VecDeque::new();
        let mut sizes = sizes.iter().map(|s| usize::from(*s).max(1)).cycle();
        let mut offset = 0;
        while offset < stream.len() {
            let end = sizes.next().map_or(stream.len(), |size| (offset + size).min(stream.len()));
            chunks.push_back(stream[offset..end].to_vec());
            offset = end;
        }
        Self { chunks: Mutex::new(chunks), closed: AtomicBool::new(false) }
    }
}

#[async_trait]
impl Reader for Chunked {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let mut chunks = self.chunks.lock().unwrap();
        let Some(mut chunk) = chunks.pop_front() else {
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
impl Writer for Chunked {
    async fn write(&self, buf: &[u8]) -> Result<usize, SocketError> {
        Ok(buf.len())
    }
}

#[async_trait]
impl Closer for Chunked {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DeadlineSetter for Chunked {
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

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap()
    })
}

fuzz_target!(|input: Input| {
    let protocol: Box<dyn FramingProtocol> = match input.prefix {
        Some(kind) => {
            Box::new(LengthPrefixed::new(LengthPrefix::ALL[kind as usize % LengthPrefix::ALL.len()]))
        },
        None => Box::new(SplitBySeparator::newline()),
    };

    let mut stream = BytesMut::new();
    let mut expected = Vec::new();
    let mut largest = 0;
    for payload in input.payloads {
        let before = stream.len();
        if protocol.encode_packet(&payload, &mut stream).is_ok() {
            largest = largest.max(stream.len() - before);
            expected.push(payload);
        }
    }

    let config = FramingConfig {
        read_buffer_size: usize::from(input.read_buffer_size).max(1),
        max_packet_size: input.max_packet_size.map_or(0, usize::from),
        overflow_policy: if input.close_on_overflow {
            OverflowPolicy::CloseConnection
        } else {
            OverflowPolicy::DropAndResync
        },
        idle_timeout: None,
    };

    let chunked = Chunked::new(&stream, &input.chunk_sizes);
    let mut collect = Collect::default();
    runtime().block_on(read_packets(&chunked, &*protocol, &config, &mut collect));

    assert!(chunked.is_closed());
    if config.max_packet_size == 0 || largest <= config.max_packet_size {
        assert_eq!(collect.0, expected);
    }
});
