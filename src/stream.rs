//! Buffered, timeout-aware, TLS-capable duplex stream for the control
//! connection.

use crate::cert::CertificateValidationBus;
use crate::config::{ClientCertificate, IpPreference, TlsProtocol};
use crate::error::{FtpError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::crypto::{CryptoProvider, ring};
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, trace, warn};

/// Receive buffer size for the control connection's BufReader.
const BUFREADER_CAPACITY: usize = 64 * 1024;

/// Large receive/send socket buffers to reduce syscalls on busy transfers.
const RECV_BUFFER_SIZE: usize = 1024 * 1024;
const SEND_BUFFER_SIZE: usize = 256 * 1024;

enum Transport {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<TlsStream<TcpStream>>),
    /// Transient value held only for the instant between taking ownership
    /// of the old transport and installing the new one in `activate_tls`.
    Empty,
}

/// A duplex byte stream that starts plaintext and can be upgraded to TLS in
/// place, without the caller ever observing a half-upgraded state.
pub struct ByteLineStream {
    transport: Transport,
    last_io: tokio::time::Instant,
}

impl ByteLineStream {
    /// Resolve every A/AAAA candidate for `host:port`, filter by
    /// `ip_preference`, and attempt each in order with `connect_timeout`;
    /// the first success wins. Fails with `NetworkUnreachable` when
    /// resolution yields no matching candidate or every attempt fails.
    pub async fn connect(
        host: &str,
        port: u16,
        ip_preference: IpPreference,
        connect_timeout: Duration,
    ) -> Result<Self> {
        debug!(
            "connecting to {}:{} (ip preference {:?})",
            host, port, ip_preference
        );
        let addr = format!("{host}:{port}");
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host(&addr)
            .await
            .map_err(FtpError::TransportBroken)?
            .filter(|candidate| match ip_preference {
                IpPreference::Any => true,
                IpPreference::Ipv4Only => candidate.is_ipv4(),
                IpPreference::Ipv6Only => candidate.is_ipv6(),
            })
            .collect();

        if candidates.is_empty() {
            return Err(FtpError::NetworkUnreachable(format!(
                "no address matching {ip_preference:?} resolved for {addr}"
            )));
        }

        let mut last_error = None;
        for candidate in candidates {
            match Self::connect_one(candidate, connect_timeout).await {
                Ok(tcp_stream) => {
                    return Ok(Self {
                        transport: Transport::Plain(BufReader::with_capacity(
                            BUFREADER_CAPACITY,
                            tcp_stream,
                        )),
                        last_io: tokio::time::Instant::now(),
                    });
                }
                Err(e) => {
                    warn!("connect attempt to {} failed: {}", candidate, e);
                    last_error = Some(e);
                }
            }
        }

        Err(FtpError::NetworkUnreachable(format!(
            "every candidate address for {addr} failed; last error: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Open and tune a single TCP connection to `socket_addr`.
    async fn connect_one(socket_addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
        let domain = if socket_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(FtpError::TransportBroken)?;
        socket.set_nodelay(true).map_err(FtpError::TransportBroken)?;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            warn!("failed to set receive buffer size: {}", e);
        }
        if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_SIZE) {
            warn!("failed to set send buffer size: {}", e);
        }

        let tcp_stream = timeout(
            connect_timeout,
            tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
                socket.connect(&socket_addr.into())?;
                socket.set_nonblocking(true)?;
                Ok(socket.into())
            }),
        )
        .await
        .map_err(|_| FtpError::ConnectTimeout)?
        .map_err(|e| FtpError::TransportBroken(std::io::Error::other(e.to_string())))?
        .map_err(FtpError::TransportBroken)?;

        TcpStream::from_std(tcp_stream).map_err(FtpError::TransportBroken)
    }

    /// Upgrade the current plaintext socket to TLS, presenting `host` for
    /// SNI, offering `client_certs` for mutual TLS, and restricting the
    /// handshake to `protocols` (empty means the implementation's default
    /// set). Consumes the plain transport and installs the resulting
    /// `TlsStream` in its place; on failure, the stream is left unusable
    /// (the caller should treat the session as broken).
    pub async fn activate_tls(
        &mut self,
        host: &str,
        validation: &CertificateValidationBus,
        client_certs: &[ClientCertificate],
        protocols: &[TlsProtocol],
        handshake_timeout: Duration,
    ) -> Result<()> {
        let _ = CryptoProvider::install_default(ring::default_provider());

        let tcp = match std::mem::replace(&mut self.transport, Transport::Empty) {
            Transport::Plain(buf) => buf.into_inner(),
            Transport::Tls(buf) => {
                // Already TLS; put it back and bail out rather than silently
                // no-op, since double activation indicates a caller bug.
                self.transport = Transport::Tls(buf);
                return Err(FtpError::InvalidConfiguration(
                    "TLS already active on this stream".into(),
                ));
            }
            Transport::Empty => unreachable!("transport taken twice"),
        };

        let client_config = validation.client_config(client_certs, protocols)?;
        let connector = TlsConnector::from(Arc::new(client_config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| FtpError::TlsValidationRejected(format!("invalid host name: {e}")))?;

        let tls_stream = timeout(handshake_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| FtpError::ConnectTimeout)?
            .map_err(|e| FtpError::TlsValidationRejected(e.to_string()))?;

        self.transport =
            Transport::Tls(BufReader::with_capacity(BUFREADER_CAPACITY, tls_stream));
        Ok(())
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// Read the next CRLF- or LF-terminated line, excluding the terminator.
    /// Returns `Ok(None)` on clean EOF.
    pub async fn read_line(&mut self, read_timeout: Duration) -> Result<Option<String>> {
        let read_future = async {
            let mut buf = Vec::with_capacity(256);
            let n = match &mut self.transport {
                Transport::Plain(r) => r.read_until(b'\n', &mut buf).await,
                Transport::Tls(r) => r.read_until(b'\n', &mut buf).await,
                Transport::Empty => unreachable!("transport taken and never restored"),
            }
            .map_err(FtpError::TransportBroken)?;

            if n == 0 {
                return Ok(None);
            }
            while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                buf.pop();
            }
            let line = String::from_utf8_lossy(&buf).into_owned();
            trace!("< {}", line);
            Ok(Some(line))
        };

        let result = timeout(read_timeout, read_future)
            .await
            .map_err(|_| FtpError::ReadTimeout)?;
        self.last_io = tokio::time::Instant::now();
        result
    }

    /// Write `text` followed by CRLF. Arguments to `PASS` are redacted in
    /// the trace log, never in the bytes actually sent.
    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        if text.splitn(2, ' ').next() == Some("PASS") {
            trace!("> PASS ****");
        } else {
            trace!("> {}", text);
        }
        let line = format!("{text}\r\n");
        match &mut self.transport {
            Transport::Plain(r) => {
                r.get_mut().write_all(line.as_bytes()).await?;
                r.get_mut().flush().await?;
            }
            Transport::Tls(r) => {
                r.get_mut().write_all(line.as_bytes()).await?;
                r.get_mut().flush().await?;
            }
            Transport::Empty => unreachable!("transport taken and never restored"),
        }
        self.last_io = tokio::time::Instant::now();
        Ok(())
    }

    /// Non-blocking peek for already-arrived bytes sitting unread on the
    /// socket. Attempts a zero-timeout buffer fill so data the kernel has
    /// already delivered is picked up without blocking for more. Always 0
    /// over TLS, since the decrypted buffer is opaque to a plain socket
    /// peek.
    pub async fn bytes_available(&mut self) -> usize {
        match &mut self.transport {
            Transport::Plain(r) => {
                match timeout(Duration::from_millis(0), r.fill_buf()).await {
                    Ok(Ok(buf)) => buf.len(),
                    _ => 0,
                }
            }
            Transport::Tls(_) => 0,
            Transport::Empty => 0,
        }
    }

    /// Read and discard whatever is currently buffered (plaintext only).
    /// Returns the discarded bytes so the caller can log them verbatim.
    pub fn drain_buffered(&mut self) -> Vec<u8> {
        match &mut self.transport {
            Transport::Plain(r) => {
                let buffered = r.buffer().to_vec();
                std::pin::Pin::new(r).consume(buffered.len());
                buffered
            }
            Transport::Tls(_) | Transport::Empty => Vec::new(),
        }
    }

    /// The remote address of the control connection, used as the default
    /// data-channel host for passive mode.
    pub fn peer_addr(&self) -> Result<std::net::SocketAddr> {
        match &self.transport {
            Transport::Plain(r) => r.get_ref().peer_addr().map_err(FtpError::TransportBroken),
            Transport::Tls(r) => r
                .get_ref()
                .0
                .peer_addr()
                .map_err(FtpError::TransportBroken),
            Transport::Empty => Err(FtpError::NotConnected),
        }
    }

    /// The local address of the control connection, used as the default
    /// announced address for active mode.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        match &self.transport {
            Transport::Plain(r) => r.get_ref().local_addr().map_err(FtpError::TransportBroken),
            Transport::Tls(r) => r
                .get_ref()
                .0
                .local_addr()
                .map_err(FtpError::TransportBroken),
            Transport::Empty => Err(FtpError::NotConnected),
        }
    }

    /// If `poll_interval` has elapsed since the last I/O, actively probe
    /// the socket and report whether it is still usable.
    pub async fn poll_liveness(&mut self, poll_interval: Duration) -> bool {
        if self.last_io.elapsed() < poll_interval {
            return true;
        }
        let probe = match &self.transport {
            Transport::Plain(r) => r.get_ref().peer_addr(),
            Transport::Tls(r) => r.get_ref().get_ref().0.peer_addr(),
            Transport::Empty => return false,
        };
        probe.is_ok()
    }
}
