//! Co-signing daemon binary.
//!
//! Runs next to the hardware signing device, opens a session for one image,
//! and serves it to the remote co-signer until it calls `finish`.

use clap::Parser;
use cosign_device::HostDevice;
use cosign_signer::{
    AlwaysRetry, ConsoleOperator, Digest, ImageKind, ImageParser, MagicImageParser, Operator,
    ParsedImage, RetryPolicy, ServerConfig, Session, SignerBridge, SignerServer, DEFAULT_PORT,
    DEFAULT_RETRY_DELAY,
};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Collaborative firmware signing daemon.
#[derive(Parser, Debug)]
#[command(name = "cosign-signer-daemon")]
#[command(about = "Expose a hardware signer to a remote co-signer")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "COSIGN_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port to listen on
    #[arg(long, env = "COSIGN_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Path to the device host agent socket
    #[arg(long, env = "COSIGN_DEVICE_SOCKET", default_value = "/run/cosign-device.sock")]
    device_socket: PathBuf,

    /// Image file to sign; its type and digest are detected
    #[arg(long)]
    image: Option<PathBuf>,

    /// Image type (bootloader, vendorheader, firmware), used with --digest
    #[arg(long = "type")]
    kind: Option<ImageKind>,

    /// Image digest as hex, used with --type
    #[arg(long)]
    digest: Option<String>,

    /// Give up a device operation after this many failed attempts (default: never)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Pause between device attempts, in milliseconds
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY.as_millis() as u64)]
    retry_delay_ms: u64,

    /// Retry with another passphrase without asking when the device key is not accepted
    #[arg(long)]
    yes: bool,
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting cosign-signer-daemon");
    info!("Device socket: {:?}", args.device_socket);

    let image = match resolve_image(
        args.image.as_deref(),
        args.kind,
        args.digest.as_deref(),
        &MagicImageParser,
    ) {
        Ok(image) => image,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let identity = image.identity();
    let key_path = image.kind.key_path();
    info!(
        "Signing {}: digest={}, path={}",
        identity.name, identity.digest, key_path
    );

    let device = match HostDevice::connect(&args.device_socket) {
        Ok(device) => device,
        Err(e) => {
            error!("No signing device available: {}", e);
            std::process::exit(1);
        }
    };

    let policy = match args.max_retries {
        Some(max) => RetryPolicy::bounded(max),
        None => RetryPolicy::unbounded(),
    }
    .with_delay(Duration::from_millis(args.retry_delay_ms));

    let operator: Box<dyn Operator> = if args.yes {
        Box::new(AlwaysRetry)
    } else {
        Box::new(ConsoleOperator)
    };

    let bridge = SignerBridge::new(device, identity.name.clone())
        .with_policy(policy)
        .with_operator(operator)
        .with_allowed_public_keys(image.allowed_public_keys);

    let session = match Session::start(identity, key_path, bridge) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to obtain commitment: {}", e);
            std::process::exit(1);
        }
    };

    let config = ServerConfig {
        bind: SocketAddr::new(args.bind, args.port),
        ..ServerConfig::default()
    };

    let server = match SignerServer::new(config, session) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to create server: {}", e);
            std::process::exit(1);
        }
    };

    info!("Signer ready, waiting for the remote co-signer...");

    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Co-signing finished");
}

/// Work out which image to sign from the command line.
fn resolve_image(
    image: Option<&Path>,
    kind: Option<ImageKind>,
    digest: Option<&str>,
    parser: &dyn ImageParser,
) -> Result<ParsedImage, String> {
    match (image, kind, digest) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
            Err("--image cannot be combined with --type or --digest".to_string())
        }
        (Some(path), None, None) => {
            let bytes = std::fs::read(path)
                .map_err(|e| format!("Failed to read image {:?}: {}", path, e))?;
            parser
                .parse(&bytes)
                .map_err(|e| format!("Failed to parse image {:?}: {}", path, e))
        }
        (None, Some(kind), Some(digest)) => {
            let digest = Digest::from_hex(digest).map_err(|e| format!("Invalid --digest: {}", e))?;
            Ok(ParsedImage {
                kind,
                digest,
                allowed_public_keys: None,
            })
        }
        (None, Some(_), None) => Err("--type requires --digest".to_string()),
        (None, None, Some(_)) => Err("--digest requires --type".to_string()),
        (None, None, None) => {
            Err("Either --image or both --type and --digest must be given".to_string())
        }
    }
}
