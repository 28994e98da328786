//! tinytcp echo server.
//!
//! Frames every connection with the selected protocol and writes each packet
//! back, re-encoded with the same protocol.
//!
//! # Usage
//!
//! ```bash
//! # Line protocol on the default port
//! tinytcp-echo --bind 0.0.0.0:7000
//!
//! # 32-bit length prefixes over TLS
//! tinytcp-echo --framing u32 --cert cert.pem --key key.pem
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use clap::{Parser, ValueEnum};
use tinytcp::{
    FramingContext, FramingProtocol, LengthPrefix, LengthPrefixed, PacketFramingHandler,
    PacketHandler, Server, ServerConfig, Socket, SplitBySeparator, TaskPerConnection, TlsConfig,
    run_until,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Raw TCP echo server
#[derive(Parser, Debug)]
#[command(name = "tinytcp-echo")]
#[command(about = "Echo packets back to TCP clients")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = ServerConfig::DEFAULT_ADDRESS)]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long, requires = "key")]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long, requires = "cert")]
    key: Option<String>,

    /// Maximum concurrent clients (0 = unbounded)
    #[arg(long, default_value = "0")]
    max_clients: usize,

    /// Packet framing
    #[arg(long, value_enum, default_value_t = Framing::Line)]
    framing: Framing,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Framing {
    /// Newline terminated packets
    Line,
    /// 16-bit big-endian length prefix
    U16,
    /// 32-bit big-endian length prefix
    U32,
    /// VarInt length prefix
    Varint,
}

impl Framing {
    fn protocol(self) -> Arc<dyn FramingProtocol> {
        match self {
            Self::Line => Arc::new(SplitBySeparator::newline()),
            Self::U16 => Arc::new(LengthPrefixed::new(LengthPrefix::U16Be)),
            Self::U32 => Arc::new(LengthPrefixed::new(LengthPrefix::U32Be)),
            Self::Varint => Arc::new(LengthPrefixed::new(LengthPrefix::VarInt)),
        }
    }
}

struct Echo {
    socket: Arc<Socket>,
    protocol: Arc<dyn FramingProtocol>,
    out: BytesMut,
}

#[async_trait]
impl PacketHandler for Echo {
    async fn on_packet(&mut self, packet: &[u8]) {
        self.out.clear();
        if let Err(err) = self.protocol.encode_packet(packet, &mut self.out) {
            tracing::warn!(socket_id = self.socket.id(), error = %err, "Cannot echo packet");
            return;
        }
        if let Err(err) = self.socket.write(&self.out).await {
            tracing::debug!(socket_id = self.socket.id(), error = %err, "Echo write failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("tinytcp echo server starting");
    tracing::info!("Binding to {} ({:?} framing)", args.bind, args.framing);

    let config = ServerConfig {
        address: args.bind,
        max_clients: args.max_clients,
        tls: args.cert.zip(args.key).map(|(cert, key)| TlsConfig::new(cert, key)),
        ..ServerConfig::default()
    };

    let protocol = args.framing.protocol();
    let handler =
        PacketFramingHandler::new(Arc::clone(&protocol), move |ctx: &mut FramingContext| {
            let echo = Echo {
                socket: Arc::clone(ctx.socket()),
                protocol: Arc::clone(&protocol),
                out: BytesMut::new(),
            };
            ctx.set_packet_handler(echo);
        });

    let server = Server::new(config, TaskPerConnection::new(handler));
    server.on_metrics_update(|metrics| {
        tracing::debug!(
            connections = metrics.connections,
            reads_per_second = metrics.reads_per_second,
            writes_per_second = metrics.writes_per_second,
            "Traffic"
        );
    });

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    run_until(&server, shutdown).await?;

    tracing::info!("tinytcp echo server exited");
    Ok(())
}
