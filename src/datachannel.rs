//! Opens data connections (PASV/EPSV/PORT/EPRT) for transfers.

use crate::cert::CertificateValidationBus;
use crate::config::{DataChannelMode, FtpDataType, SessionConfig};
use crate::error::{FtpError, Result};
use crate::ratelimit::BandwidthLimiter;
use crate::reply::Reply;
use crate::session::ControlSession;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::debug;

/// A connected data-channel byte stream, optionally TLS-wrapped. Pair it
/// with the [`BandwidthLimiter`] returned alongside it from
/// [`DataChannelFactory::open_data_channel`] to pace the transfer a caller
/// drives over it.
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for DataStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            DataStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            DataStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            DataStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            DataStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            DataStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// The outcome of asking the control connection to prepare a passive or
/// active data channel: the command(s) to send before opening it, and how
/// to open it.
pub(crate) enum ChannelPlan {
    /// Connect out to this address (server is listening).
    ConnectTo(SocketAddr),
    /// Listen on this local address and accept one inbound connection
    /// (server will connect in).
    AcceptOn(SocketAddr),
}

/// Resolves passive/active data-channel setup and produces a connected,
/// optionally TLS-wrapped, optionally rate-limited stream.
///
/// The factory is created once per [`crate::session::ControlSession`] and
/// remembers which of EPSV/PASV or EPRT/PORT last worked, so an
/// `AutoPassive`/`AutoActive` session doesn't re-probe the unsupported
/// command on every transfer.
pub struct DataChannelFactory {
    config: Arc<SessionConfig>,
    sticky_passive_fallback: bool,
    sticky_active_fallback: bool,
}

impl DataChannelFactory {
    pub fn new(config: Arc<SessionConfig>) -> Self {
        Self {
            config,
            sticky_passive_fallback: false,
            sticky_active_fallback: false,
        }
    }

    /// Parse a PASV reply body like
    /// `"Entering Passive Mode (127,0,0,1,234,5)."` into a socket address.
    pub(crate) fn parse_pasv(message: &str) -> Result<SocketAddr> {
        let start = message
            .find('(')
            .ok_or_else(|| FtpError::ProtocolError(format!("no PASV tuple in: {message}")))?;
        let end = message[start..]
            .find(')')
            .map(|e| start + e)
            .ok_or_else(|| FtpError::ProtocolError(format!("unterminated PASV tuple: {message}")))?;
        let nums: Vec<u16> = message[start + 1..end]
            .split(',')
            .map(|s| s.trim().parse::<u16>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| FtpError::ProtocolError(format!("malformed PASV tuple: {message}")))?;
        if nums.len() != 6 {
            return Err(FtpError::ProtocolError(format!(
                "expected 6 PASV fields, got {}: {message}",
                nums.len()
            )));
        }
        let ip = Ipv4Addr::new(
            nums[0] as u8,
            nums[1] as u8,
            nums[2] as u8,
            nums[3] as u8,
        );
        let port = nums[4] * 256 + nums[5];
        Ok(SocketAddr::new(IpAddr::V4(ip), port))
    }

    /// Parse an EPSV reply body like `"Entering Extended Passive Mode
    /// (|||52311|)."` into a port, to be combined with the control
    /// connection's peer host.
    pub(crate) fn parse_epsv(message: &str) -> Result<u16> {
        let start = message
            .find('(')
            .ok_or_else(|| FtpError::ProtocolError(format!("no EPSV tuple in: {message}")))?;
        let end = message[start..]
            .find(')')
            .map(|e| start + e)
            .ok_or_else(|| FtpError::ProtocolError(format!("unterminated EPSV tuple: {message}")))?;
        let inner = &message[start + 1..end];
        let port_str = inner.trim_matches('|');
        port_str
            .parse::<u16>()
            .map_err(|_| FtpError::ProtocolError(format!("malformed EPSV tuple: {message}")))
    }

    /// Format the PORT command argument for an IPv4 local address.
    pub(crate) fn format_port(addr: SocketAddr) -> Result<String> {
        let IpAddr::V4(ip) = addr.ip() else {
            return Err(FtpError::InvalidConfiguration(
                "PORT requires an IPv4 local address; use EPRT for IPv6".into(),
            ));
        };
        let octets = ip.octets();
        let [p1, p2] = addr.port().to_be_bytes();
        Ok(format!(
            "{},{},{},{},{},{}",
            octets[0], octets[1], octets[2], octets[3], p1, p2
        ))
    }

    /// Format the EPRT command argument for any local address.
    pub(crate) fn format_eprt(addr: SocketAddr) -> String {
        let proto = if addr.is_ipv4() { 1 } else { 2 };
        format!("|{}|{}|{}|", proto, addr.ip(), addr.port())
    }

    /// Bind a local listener for active mode, honoring the configured
    /// candidate port list (or an ephemeral port if empty).
    async fn bind_active_listener(&self) -> Result<TcpListener> {
        if self.config.active_ports.is_empty() {
            return TcpListener::bind("0.0.0.0:0")
                .await
                .map_err(FtpError::TransportBroken);
        }
        for port in &self.config.active_ports {
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", *port)).await {
                return Ok(listener);
            }
        }
        Err(FtpError::InvalidConfiguration(
            "no configured active port was available to bind".into(),
        ))
    }

    /// Negotiate the transfer type if it differs from `current`, returning
    /// the new current type. Callers should update their own session state
    /// with the result.
    pub async fn negotiate_type<F, Fut>(
        requested: FtpDataType,
        current: FtpDataType,
        mut execute: F,
    ) -> Result<FtpDataType>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<Reply>>,
    {
        if requested == current {
            return Ok(current);
        }
        let cmd = match requested {
            FtpDataType::Ascii => "TYPE A",
            FtpDataType::Binary => "TYPE I",
        };
        let reply = execute(cmd.to_string()).await?;
        if !reply.is_success() {
            return Err(FtpError::CommandFailed(reply));
        }
        Ok(requested)
    }

    /// Whether the factory has memoized a fallback to the non-extended
    /// passive command for this session.
    pub fn passive_uses_fallback(&self) -> bool {
        self.sticky_passive_fallback
    }

    /// Whether the factory has memoized a fallback to the non-extended
    /// active command for this session.
    pub fn active_uses_fallback(&self) -> bool {
        self.sticky_active_fallback
    }

    /// Record that EPSV was rejected and PASV should be used going forward
    /// for the lifetime of this session (when mode is `AutoPassive`).
    pub(crate) fn remember_passive_fallback(&mut self) {
        self.sticky_passive_fallback = true;
        debug!("EPSV unsupported, falling back to PASV for the remainder of the session");
    }

    /// Record that EPRT was rejected and PORT should be used going forward
    /// for the lifetime of this session (when mode is `AutoActive`).
    pub(crate) fn remember_active_fallback(&mut self) {
        self.sticky_active_fallback = true;
        debug!("EPRT unsupported, falling back to PORT for the remainder of the session");
    }

    /// Which passive command to issue next, accounting for sticky fallback.
    pub(crate) fn passive_command(&self) -> &'static str {
        match self.config.data_channel_mode {
            DataChannelMode::Pasv | DataChannelMode::PasvEx => "PASV",
            DataChannelMode::Epsv => "EPSV",
            DataChannelMode::AutoPassive if self.sticky_passive_fallback => "PASV",
            _ => "EPSV",
        }
    }

    /// Which active command to issue next, accounting for sticky fallback.
    pub(crate) fn active_command(&self) -> &'static str {
        match self.config.data_channel_mode {
            DataChannelMode::Port => "PORT",
            DataChannelMode::Eprt => "EPRT",
            DataChannelMode::AutoActive if self.sticky_active_fallback => "PORT",
            _ => "EPRT",
        }
    }

    /// Connect a plain TCP socket according to `plan`.
    pub(crate) async fn open_plain(
        &self,
        plan: ChannelPlan,
    ) -> Result<TcpStream> {
        match plan {
            ChannelPlan::ConnectTo(addr) => {
                tokio::time::timeout(self.config.data_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| FtpError::ConnectTimeout)?
                    .map_err(FtpError::TransportBroken)
            }
            ChannelPlan::AcceptOn(bind_addr) => {
                let listener = if bind_addr.port() == 0 {
                    self.bind_active_listener().await?
                } else {
                    TcpListener::bind(bind_addr)
                        .await
                        .map_err(FtpError::TransportBroken)?
                };
                let (stream, _peer) =
                    tokio::time::timeout(self.config.data_timeout, listener.accept())
                        .await
                        .map_err(|_| FtpError::ConnectTimeout)?
                        .map_err(FtpError::TransportBroken)?;
                Ok(stream)
            }
        }
    }

    /// Wrap an already-connected plain socket in TLS, reusing the control
    /// connection's certificate validation policy.
    pub(crate) async fn wrap_tls(
        &self,
        tcp: TcpStream,
        host: &str,
        validation: &CertificateValidationBus,
    ) -> Result<TlsStream<TcpStream>> {
        let client_config =
            validation.client_config(&self.config.client_certificates, &self.config.tls_protocols)?;
        let connector = TlsConnector::from(Arc::new(client_config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| FtpError::TlsValidationRejected(format!("invalid host name: {e}")))?;
        tokio::time::timeout(self.config.data_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| FtpError::ConnectTimeout)?
            .map_err(|e| FtpError::TlsValidationRejected(e.to_string()))
    }

    /// Apply the configured upload/download rate cap to a freshly opened
    /// stream, if any.
    pub fn rate_limiter_for(&self, upload: bool) -> Option<BandwidthLimiter> {
        let kbps = if upload {
            self.config.upload_rate_kbps
        } else {
            self.config.download_rate_kbps
        };
        kbps.map(|k| BandwidthLimiter::new(k * 1024, None))
    }

    /// Negotiate transfer type, open PASV/EPSV/PORT/EPRT, wrap TLS if the
    /// control connection confirmed `PROT P`, and pair the resulting stream
    /// with a rate limiter for the given direction.
    pub async fn open_data_channel(
        &mut self,
        session: &mut ControlSession,
        data_type: FtpDataType,
        upload: bool,
    ) -> Result<(DataStream, Option<BandwidthLimiter>)> {
        let current = session.current_type();
        let new_type =
            Self::negotiate_type(data_type, current, |cmd| session.execute(&cmd)).await?;
        session.set_current_type(new_type);

        let passive = matches!(
            self.config.data_channel_mode,
            DataChannelMode::AutoPassive
                | DataChannelMode::Pasv
                | DataChannelMode::Epsv
                | DataChannelMode::PasvEx
        );

        let tcp = if passive {
            self.open_passive(session).await?
        } else {
            self.open_active(session).await?
        };

        let stream = if session.is_tls() && self.config.encrypt_data_channel {
            let host = session.config().host.clone();
            let tls = self.wrap_tls(tcp, &host, session.validation()).await?;
            DataStream::Tls(Box::new(tls))
        } else {
            DataStream::Plain(tcp)
        };

        Ok((stream, self.rate_limiter_for(upload)))
    }

    async fn open_passive(&mut self, session: &mut ControlSession) -> Result<TcpStream> {
        let cmd = self.passive_command();
        let reply = session.execute(cmd).await?;

        if reply.is_error() && self.config.data_channel_mode == DataChannelMode::AutoPassive && cmd == "EPSV" {
            self.remember_passive_fallback();
            let reply = session.execute("PASV").await?;
            if !reply.is_success() {
                return Err(FtpError::CommandFailed(reply));
            }
            let addr = Self::parse_pasv(&reply.message)?;
            return self.open_plain(ChannelPlan::ConnectTo(addr)).await;
        }
        if !reply.is_success() {
            return Err(FtpError::CommandFailed(reply));
        }

        let mut addr = if cmd == "EPSV" {
            let port = Self::parse_epsv(&reply.message)?;
            SocketAddr::new(session.peer_addr()?.ip(), port)
        } else {
            Self::parse_pasv(&reply.message)?
        };

        if self.config.data_channel_mode == DataChannelMode::PasvEx && is_private_ipv4(addr.ip()) {
            addr = SocketAddr::new(session.peer_addr()?.ip(), addr.port());
        }

        self.open_plain(ChannelPlan::ConnectTo(addr)).await
    }

    async fn open_active(&mut self, session: &mut ControlSession) -> Result<TcpStream> {
        let cmd = self.active_command();
        let local_ip = match &self.config.local_address_resolver {
            Some(resolver) => resolver.resolve(),
            None => session.local_addr()?.ip(),
        };
        let listener = self.bind_active_listener().await?;
        let bound_port = listener
            .local_addr()
            .map_err(FtpError::TransportBroken)?
            .port();
        let announce_addr = SocketAddr::new(local_ip, bound_port);

        let command = if cmd == "EPRT" {
            format!("EPRT {}", Self::format_eprt(announce_addr))
        } else {
            format!("PORT {}", Self::format_port(announce_addr)?)
        };
        let reply = session.execute(&command).await?;

        if reply.is_error() && self.config.data_channel_mode == DataChannelMode::AutoActive && cmd == "EPRT" {
            self.remember_active_fallback();
            let command = format!("PORT {}", Self::format_port(announce_addr)?);
            let reply = session.execute(&command).await?;
            if !reply.is_success() {
                return Err(FtpError::CommandFailed(reply));
            }
        } else if !reply.is_success() {
            return Err(FtpError::CommandFailed(reply));
        }

        let (stream, _peer) = tokio::time::timeout(self.config.data_timeout, listener.accept())
            .await
            .map_err(|_| FtpError::ConnectTimeout)?
            .map_err(FtpError::TransportBroken)?;
        Ok(stream)
    }
}

/// Whether `ip` falls in an RFC 1918 private range, used by `PasvEx` to
/// decide whether to substitute the control connection's peer host for an
/// unroutable advertised data address.
fn is_private_ipv4(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || o[0] == 127
        }
        IpAddr::V6(_) => false,
    }
}
