//! Co-signing RPC server implementation.
//!
//! Listens on TCP and serves the session to the remote peer. Connections are
//! handled one at a time, one request per connection, so at most one device
//! operation is ever in flight. A `Finish` request ends [`SignerServer::run`]
//! and closes the listener.

use crate::protocol::{CommitmentRequest, Request, Response, SignatureRequest};
use crate::session::{Session, SessionError, SessionState};
use cosign_device::frame::{read_frame, write_frame};
use cosign_device::{Commitment, FrameError, SigningDevice};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Port the endpoint listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 33333;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: SocketAddr,
    /// Deadline for receiving a request and sending its response. Device
    /// operations in between are not bounded.
    pub io_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            io_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Errors from the co-signing server and client.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
}

/// Co-signing RPC server.
pub struct SignerServer<D> {
    listener: TcpListener,
    io_timeout: Option<Duration>,
    session: Mutex<Session<D>>,
}

impl<D: SigningDevice> SignerServer<D> {
    /// Bind the endpoint for an already started session.
    pub fn new(config: ServerConfig, session: Session<D>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind)?;
        info!("Co-signing server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            io_timeout: config.io_timeout,
            session: Mutex::new(session),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the peer finishes the session (blocking).
    pub fn run(self) -> Result<(), ServerError> {
        {
            let session = self.lock_session();
            info!(
                "Serving session: name={}, digest={}, path={}, pubkey=0x{}",
                session.identity().name,
                session.identity().digest,
                session.key_path(),
                hex::encode(&session.commitment().public_key)
            );
        }

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(e) = self.handle_connection(stream) {
                        error!("Error handling connection: {}", e);
                    }
                    if self.lock_session().state() == SessionState::Finished {
                        break;
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }

        info!("Session finished, closing endpoint");
        Ok(())
    }

    /// Handle a single connection.
    fn handle_connection(&self, mut stream: TcpStream) -> Result<(), ServerError> {
        debug!("New connection from {}", stream.peer_addr()?);
        stream.set_read_timeout(self.io_timeout)?;
        stream.set_write_timeout(self.io_timeout)?;

        let request: Request = read_frame(&mut stream)?;
        let response = self.handle_request(request);
        write_frame(&mut stream, &response)?;

        Ok(())
    }

    fn handle_request(&self, request: Request) -> Response {
        let mut session = self.lock_session();

        match request {
            Request::GetCommitment(req) => match session.get_commitment(&req.name, &req.digest) {
                Ok(commitment) => Response::Commitment {
                    public_key: commitment.public_key,
                    commitment: commitment.commitment,
                },
                Err(e) => error_response(e),
            },
            Request::GetSignature(req) => {
                debug!(
                    "Signature request: name={}, id={}, R_len={}, P_len={}",
                    req.name,
                    req.request_id,
                    req.aggregate_commitment.len(),
                    req.aggregate_public_key.len()
                );
                let result = session.get_signature(
                    &req.name,
                    &req.digest,
                    &req.aggregate_commitment,
                    &req.aggregate_public_key,
                );
                match result {
                    Ok(signature) => Response::Signature {
                        signature,
                        request_id: req.request_id,
                    },
                    Err(e) => error_response(e),
                }
            }
            Request::Finish => {
                session.finish();
                Response::Finished
            }
            Request::Ping => Response::Pong,
        }
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Session<D>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn error_response(error: SessionError) -> Response {
    match error {
        SessionError::ProtocolMismatch { .. } | SessionError::Finished => {
            warn!("Request rejected: {}", error);
            Response::Rejected {
                reason: error.to_string(),
            }
        }
        SessionError::Bridge(_) => {
            error!("Request failed: {}", error);
            Response::Error {
                message: error.to_string(),
            }
        }
    }
}

/// Client used by the remote peer.
pub struct SignerClient {
    addr: SocketAddr,
    read_timeout: Option<Duration>,
}

impl SignerClient {
    /// Create a new client. No read timeout is applied by default since the
    /// signer may wait on a physical confirmation.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            read_timeout: None,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Connect to the server and send a request.
    fn send_request(&self, request: &Request) -> Result<Response, ServerError> {
        let mut stream = TcpStream::connect(self.addr)?;
        stream.set_read_timeout(self.read_timeout)?;

        write_frame(&mut stream, request)?;
        let response = read_frame(&mut stream)?;
        Ok(response)
    }

    /// Fetch the signer's commitment.
    pub fn get_commitment(&self, name: &str, digest: &[u8]) -> Result<Commitment, ServerError> {
        let response = self.send_request(&Request::GetCommitment(CommitmentRequest {
            name: name.to_string(),
            digest: digest.to_vec(),
        }))?;

        match response {
            Response::Commitment {
                public_key,
                commitment,
            } => Ok(Commitment {
                public_key,
                commitment,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch the signer's partial signature for the given round.
    pub fn get_signature(
        &self,
        name: &str,
        digest: &[u8],
        aggregate_commitment: &[u8],
        aggregate_public_key: &[u8],
    ) -> Result<Vec<u8>, ServerError> {
        let req = SignatureRequest::new(
            name,
            digest.to_vec(),
            aggregate_commitment.to_vec(),
            aggregate_public_key.to_vec(),
        );
        let request_id = req.request_id;
        let response = self.send_request(&Request::GetSignature(req))?;

        match response {
            Response::Signature {
                signature,
                request_id: echoed,
            } if echoed == request_id => Ok(signature),
            Response::Signature { .. } => {
                Err(ServerError::Protocol("Request ID mismatch".to_string()))
            }
            other => Err(unexpected(other)),
        }
    }

    /// End the session on the signer.
    pub fn finish(&self) -> Result<(), ServerError> {
        match self.send_request(&Request::Finish)? {
            Response::Finished => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Ping the server.
    pub fn ping(&self) -> Result<(), ServerError> {
        match self.send_request(&Request::Ping)? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> ServerError {
    match response {
        Response::Rejected { reason } => ServerError::Rejected(reason),
        Response::Error { message } => ServerError::Protocol(format!("Error: {}", message)),
        _ => ServerError::Protocol("Unexpected response".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::SignerBridge;
    use crate::image::{Digest, ImageKind, SignRequestIdentity};
    use crate::test_utils::{DeviceCalls, ScriptedDevice};
    use std::thread;

    const DIGEST: [u8; 32] = [0xAA; 32];

    fn create_test_server() -> (SignerServer<ScriptedDevice>, SocketAddr, DeviceCalls) {
        let device = ScriptedDevice::new();
        let calls = device.calls();
        let identity = SignRequestIdentity::new(ImageKind::Firmware, Digest::from(DIGEST));
        let bridge = SignerBridge::new(device, "firmware");
        let session = Session::start(identity, ImageKind::Firmware.key_path(), bridge).unwrap();

        let config = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        let server = SignerServer::new(config, session).unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr, calls)
    }

    #[test]
    fn test_default_config_binds_all_interfaces() {
        let config = ServerConfig::default();
        assert!(config.bind.ip().is_unspecified());
        assert_eq!(config.bind.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_ping() {
        let (server, addr, _) = create_test_server();

        let server_handle = thread::spawn(move || {
            if let Ok((stream, _)) = server.listener.accept() {
                let _ = server.handle_connection(stream);
            }
        });

        let client = SignerClient::new(addr);
        assert!(client.ping().is_ok());

        server_handle.join().unwrap();
    }

    #[test]
    fn test_full_session_over_tcp() {
        let (server, addr, calls) = create_test_server();
        let server_handle = thread::spawn(move || server.run());

        let client = SignerClient::new(addr);

        let commitment = client.get_commitment("firmware", &DIGEST).unwrap();
        assert_eq!(client.get_commitment("firmware", &DIGEST).unwrap(), commitment);
        assert_eq!(commitment.public_key, ScriptedDevice::DEFAULT_PUBLIC_KEY.to_vec());

        let sig1 = client.get_signature("firmware", &DIGEST, b"R1", b"P1").unwrap();
        let sig1_again = client.get_signature("firmware", &DIGEST, b"R1", b"P1").unwrap();
        assert_eq!(sig1, sig1_again);
        assert_eq!(calls.signs(), 1);

        let sig2 = client.get_signature("firmware", &DIGEST, b"R2", b"P1").unwrap();
        assert_ne!(sig1, sig2);
        assert_eq!(calls.signs(), 2);
        assert_eq!(calls.commits(), 1);

        client.finish().unwrap();
        server_handle.join().unwrap().unwrap();

        assert!(client.ping().is_err());
    }

    #[test]
    fn test_mismatch_is_rejected_and_session_continues() {
        let (server, addr, calls) = create_test_server();
        let server_handle = thread::spawn(move || server.run());

        let client = SignerClient::new(addr);

        match client.get_commitment("bootloader", &DIGEST) {
            Err(ServerError::Rejected(reason)) => {
                assert!(reason.contains("bootloader"));
                assert!(reason.contains("firmware"));
            }
            other => panic!("Expected Rejected, got {:?}", other),
        }
        assert!(matches!(
            client.get_signature("firmware", &[0u8; 32], b"R1", b"P1"),
            Err(ServerError::Rejected(_))
        ));
        assert_eq!(calls.signs(), 0);

        assert!(client.get_commitment("firmware", &DIGEST).is_ok());
        assert!(client.get_signature("firmware", &DIGEST, b"R1", b"P1").is_ok());

        client.finish().unwrap();
        server_handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_finish_right_after_start() {
        let (server, addr, calls) = create_test_server();
        let server_handle = thread::spawn(move || server.run());

        let client = SignerClient::new(addr);
        client.finish().unwrap();
        server_handle.join().unwrap().unwrap();

        assert!(client.get_commitment("firmware", &DIGEST).is_err());
        assert_eq!(calls.signs(), 0);
    }

    #[test]
    fn test_garbage_connection_does_not_stop_server() {
        let (server, addr, _) = create_test_server();
        let server_handle = thread::spawn(move || server.run());

        {
            use std::io::Write;
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        }

        let client = SignerClient::new(addr);
        assert!(client.ping().is_ok());
        client.finish().unwrap();
        server_handle.join().unwrap().unwrap();
    }
}
