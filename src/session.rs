//! The control-connection state machine.

use crate::capabilities::CapabilityRegistry;
use crate::cert::CertificateValidationBus;
use crate::config::{EncryptionMode, FtpDataType, SessionConfig};
use crate::error::{FtpError, Result};
use crate::reply::{Reply, ReplyParser};
use crate::stream::ByteLineStream;
use std::sync::Arc;
use tracing::{debug, trace};

/// Where a [`ControlSession`] is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    /// Never connected, or disposed.
    Idle,
    Connected,
    Disposed,
}

/// A single FTP/FTPS control connection: greeting, authentication,
/// capability discovery, and command/reply exchange.
///
/// Cloned sessions (see [`crate::clone::SessionCloner`]) share the same
/// [`SessionConfig`] but own an independent [`ByteLineStream`] and skip
/// `FEAT` discovery, since the capability set is assumed identical to the
/// parent.
#[must_use]
pub struct ControlSession {
    stream: ByteLineStream,
    config: Arc<SessionConfig>,
    validation: CertificateValidationBus,
    capabilities: CapabilityRegistry,
    current_type: FtpDataType,
    state: LifecycleState,
    is_clone: bool,
}

impl ControlSession {
    /// Connect, authenticate, and discover capabilities per the configured
    /// encryption mode. See the module-level procedure steps below.
    ///
    /// 1. Resolve certificate validation policy from `config.allow_insecure_tls`.
    /// 2. Open the TCP control connection.
    /// 3. If `Implicit`, activate TLS immediately, before any FTP bytes.
    /// 4. Read the greeting reply; fail unless it is a success reply.
    /// 5. If `Explicit`, send `AUTH TLS` and activate TLS on success.
    /// 6. Authenticate via `USER`/`PASS`.
    /// 7. If the control connection is encrypted and `encrypt_data_channel`
    ///    is set, send `PBSZ 0` then `PROT P`.
    /// 8. Unless this is a clone, send `FEAT` and parse the capability set.
    /// 9. If `auto_utf8` and the server advertised `UTF8`, send `OPTS UTF8 ON`.
    /// 10. Send `SYST` (best-effort; failure is not fatal).
    pub async fn connect(config: Arc<SessionConfig>) -> Result<Self> {
        Self::connect_as(config, false).await
    }

    pub(crate) async fn connect_as(config: Arc<SessionConfig>, is_clone: bool) -> Result<Self> {
        let validation = if is_clone {
            CertificateValidationBus::trusted_host()
        } else {
            CertificateValidationBus::new(config.allow_insecure_tls)
        };
        let mut stream = ByteLineStream::connect(
            &config.host,
            config.effective_port(),
            config.ip_preference,
            config.connect_timeout,
        )
        .await?;

        if config.encryption == EncryptionMode::Implicit {
            stream
                .activate_tls(
                    &config.host,
                    &validation,
                    &config.client_certificates,
                    &config.tls_protocols,
                    config.connect_timeout,
                )
                .await?;
        }

        let mut session = Self {
            stream,
            config,
            validation,
            capabilities: CapabilityRegistry::new(),
            current_type: FtpDataType::Ascii,
            state: LifecycleState::Idle,
            is_clone,
        };

        let greeting = session.get_reply().await?;
        if !greeting.is_success() {
            return Err(FtpError::CommandFailed(greeting));
        }
        session.state = LifecycleState::Connected;

        if session.config.encryption == EncryptionMode::Explicit {
            let reply = session.execute_always("AUTH TLS").await?;
            if !reply.is_success() {
                return Err(FtpError::TlsUnavailable(reply.message));
            }
            session
                .stream
                .activate_tls(
                    &session.config.host,
                    &session.validation,
                    &session.config.client_certificates,
                    &session.config.tls_protocols,
                    session.config.connect_timeout,
                )
                .await?;
        }

        session.authenticate().await?;

        if session.stream.is_tls() && session.config.encrypt_data_channel {
            let pbsz = session.execute_always("PBSZ 0").await?;
            if !pbsz.is_success() {
                return Err(FtpError::CommandFailed(pbsz));
            }
            let prot = session.execute_always("PROT P").await?;
            if !prot.is_success() {
                return Err(FtpError::CommandFailed(prot));
            }
        }

        if !session.is_clone {
            let feat = session.execute_always("FEAT").await?;
            if feat.is_success() {
                session.capabilities = CapabilityRegistry::parse(&feat.info_messages);
            }
        }

        if session.config.auto_utf8 && session.capabilities.has("UTF8") {
            let _ = session.execute_always("OPTS UTF8 ON").await?;
        }

        let _ = session.execute_always("SYST").await;

        Ok(session)
    }

    async fn authenticate(&mut self) -> Result<()> {
        debug!("authenticating as {}", self.config.username);
        let user_reply = self
            .execute_always(&format!("USER {}", self.config.username))
            .await?;

        if user_reply.is_success() && user_reply.code_str() != "331" {
            return Ok(());
        }
        if !user_reply.is_intermediate() {
            return Err(FtpError::AuthenticationFailed(user_reply));
        }

        let pass_reply = self
            .execute_always(&format!("PASS {}", self.config.password))
            .await?;
        if !pass_reply.is_success() {
            return Err(FtpError::AuthenticationFailed(pass_reply));
        }
        debug!("authentication successful");
        Ok(())
    }

    /// Execute a command on the control connection: reconcile stale data
    /// (unless plaintext reconciliation is disabled or the socket is TLS),
    /// then reconnect if disconnected (unless the command is `QUIT`, which
    /// gets a synthetic success reply instead), send the command, and parse
    /// the reply.
    pub async fn execute(&mut self, command: &str) -> Result<Reply> {
        if command.eq_ignore_ascii_case("QUIT") && self.state != LifecycleState::Connected {
            return Ok(Reply::synthetic(*b"200", "Connection already closed."));
        }

        if self.state == LifecycleState::Disposed {
            return Err(FtpError::AlreadyDisposed);
        }

        if self.state == LifecycleState::Connected && self.reconcile_stale_data().await {
            self.state = LifecycleState::Idle;
        }

        if self.state == LifecycleState::Idle {
            self.reconnect().await?;
        }

        self.execute_always(command).await
    }

    /// If stale-data checking is enabled and the control stream is
    /// plaintext, read and discard any bytes the server has already sent
    /// but that no prior `Execute` consumed, logging them verbatim. Returns
    /// whether stale data was found (the caller must treat the connection
    /// as broken and reconnect).
    async fn reconcile_stale_data(&mut self) -> bool {
        if !self.config.check_stale_data || self.stream.is_tls() {
            return false;
        }
        if self.stream.bytes_available().await == 0 {
            return false;
        }
        let discarded = self.stream.drain_buffered();
        trace!(
            "discarding stale control-connection data: {:?}",
            String::from_utf8_lossy(&discarded)
        );
        true
    }

    /// Tear down and re-establish the control connection in place,
    /// preserving configuration and clone status.
    async fn reconnect(&mut self) -> Result<()> {
        let fresh = Self::connect_as(Arc::clone(&self.config), self.is_clone).await?;
        *self = fresh;
        Ok(())
    }

    /// Execute a command without lifecycle or stale-data checks, for use
    /// during [`Self::connect_as`] before `state` is set to `Connected`.
    async fn execute_always(&mut self, command: &str) -> Result<Reply> {
        self.stream.write_line(command).await?;
        self.get_reply().await
    }

    async fn get_reply(&mut self) -> Result<Reply> {
        let read_timeout = self.config.read_timeout;
        let stream = &mut self.stream;
        ReplyParser::parse(|| stream.read_line(read_timeout)).await
    }

    /// Send `QUIT` and close the underlying socket, unless
    /// `ungraceful_disconnect` is set, in which case the socket is simply
    /// closed. Errors sending `QUIT` are swallowed; the stream is always
    /// considered closed afterward.
    pub async fn disconnect(&mut self) {
        if self.state != LifecycleState::Connected {
            self.state = LifecycleState::Idle;
            return;
        }
        if !self.config.ungraceful_disconnect {
            let _ = self.execute_always("QUIT").await;
        }
        self.state = LifecycleState::Idle;
    }

    /// Idempotent teardown: disconnect if still connected, then mark the
    /// session unusable for any further command.
    pub async fn dispose(&mut self) {
        if self.state == LifecycleState::Disposed {
            return;
        }
        self.disconnect().await;
        self.state = LifecycleState::Disposed;
    }

    pub fn is_connected(&self) -> bool {
        self.state == LifecycleState::Connected
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn current_type(&self) -> FtpDataType {
        self.current_type
    }

    pub fn set_current_type(&mut self, ty: FtpDataType) {
        self.current_type = ty;
    }

    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.config
    }

    pub(crate) fn validation(&self) -> &CertificateValidationBus {
        &self.validation
    }

    /// The control connection's peer address, used as the default
    /// data-channel host for passive mode.
    pub fn peer_addr(&self) -> Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    /// The control connection's local address, used as the default
    /// announced address for active mode.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.stream.local_addr()
    }

    /// Issue a liveness probe if the configured poll interval has elapsed.
    pub async fn poll_liveness(&mut self) -> bool {
        match self.config.poll_interval {
            Some(interval) => self.stream.poll_liveness(interval).await,
            None => true,
        }
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        if self.state == LifecycleState::Connected {
            debug!("ControlSession dropped while still connected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_server(
        script: impl FnOnce(tokio::net::TcpStream) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            + Send
            + 'static,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            script(sock).await;
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn cleartext_anonymous_auth_succeeds() {
        let (addr, handle) = spawn_server(|mut sock| {
            Box::pin(async move {
                sock.write_all(b"220 Welcome\r\n").await.unwrap();
                let mut buf = [0u8; 256];
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"USER anonymous\r\n");
                sock.write_all(b"331 Need password\r\n").await.unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"PASS anonymous\r\n");
                sock.write_all(b"230 Logged in\r\n").await.unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"FEAT\r\n");
                sock.write_all(b"211-Features:\r\n UTF8\r\n211 End\r\n")
                    .await
                    .unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"OPTS UTF8 ON\r\n");
                sock.write_all(b"200 OK\r\n").await.unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"SYST\r\n");
                sock.write_all(b"215 UNIX Type: L8\r\n").await.unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"QUIT\r\n");
                sock.write_all(b"221 Bye\r\n").await.unwrap();
            })
        })
        .await;

        let mut config = SessionConfig::anonymous(addr.ip().to_string());
        config.port = addr.port();
        let mut session = ControlSession::connect(Arc::new(config)).await.unwrap();
        assert!(session.is_connected());
        assert!(session.capabilities().has("UTF8"));
        session.disconnect().await;
        assert!(!session.is_connected());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failed_greeting_is_command_failed() {
        let (addr, handle) = spawn_server(|mut sock| {
            Box::pin(async move {
                sock.write_all(b"421 Service unavailable\r\n")
                    .await
                    .unwrap();
            })
        })
        .await;

        let mut config = SessionConfig::anonymous(addr.ip().to_string());
        config.port = addr.port();
        let err = ControlSession::connect(Arc::new(config)).await.unwrap_err();
        assert!(matches!(err, FtpError::CommandFailed(_)));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_password_is_authentication_failed() {
        let (addr, handle) = spawn_server(|mut sock| {
            Box::pin(async move {
                sock.write_all(b"220 Welcome\r\n").await.unwrap();
                let mut buf = [0u8; 256];
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"USER anonymous\r\n");
                sock.write_all(b"331 Need password\r\n").await.unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"PASS anonymous\r\n");
                sock.write_all(b"530 Login incorrect\r\n").await.unwrap();
            })
        })
        .await;

        let mut config = SessionConfig::anonymous(addr.ip().to_string());
        config.port = addr.port();
        let err = ControlSession::connect(Arc::new(config)).await.unwrap_err();
        assert!(matches!(err, FtpError::AuthenticationFailed(_)));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn quit_after_dispose_returns_synthetic_reply() {
        let (addr, handle) = spawn_server(|mut sock| {
            Box::pin(async move {
                sock.write_all(b"220 Welcome\r\n").await.unwrap();
                let mut buf = [0u8; 256];
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"USER anonymous\r\n");
                sock.write_all(b"331 Need password\r\n").await.unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"PASS anonymous\r\n");
                sock.write_all(b"230 Logged in\r\n").await.unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"FEAT\r\n");
                sock.write_all(b"211-Features:\r\n211 End\r\n")
                    .await
                    .unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"SYST\r\n");
                sock.write_all(b"215 UNIX\r\n").await.unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"QUIT\r\n");
                sock.write_all(b"221 Bye\r\n").await.unwrap();
            })
        })
        .await;

        let mut config = SessionConfig::anonymous(addr.ip().to_string());
        config.port = addr.port();
        let mut session = ControlSession::connect(Arc::new(config)).await.unwrap();
        session.dispose().await;
        let reply = session.execute("QUIT").await.unwrap();
        assert_eq!(reply.code_str(), "200");

        let err = session.execute("NOOP").await.unwrap_err();
        assert!(matches!(err, FtpError::AlreadyDisposed));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ungraceful_disconnect_skips_quit() {
        let (addr, handle) = spawn_server(|mut sock| {
            Box::pin(async move {
                sock.write_all(b"220 Welcome\r\n").await.unwrap();
                let mut buf = [0u8; 256];
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"USER anonymous\r\n");
                sock.write_all(b"331 Need password\r\n").await.unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"PASS anonymous\r\n");
                sock.write_all(b"230 Logged in\r\n").await.unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"FEAT\r\n");
                sock.write_all(b"211-Features:\r\n211 End\r\n")
                    .await
                    .unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"SYST\r\n");
                sock.write_all(b"215 UNIX\r\n").await.unwrap();
                // No QUIT should arrive; confirm the peer just disappears.
                let mut buf = [0u8; 16];
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(n, 0);
            })
        })
        .await;

        let mut config = SessionConfig::anonymous(addr.ip().to_string());
        config.port = addr.port();
        config.ungraceful_disconnect = true;
        let mut session = ControlSession::connect(Arc::new(config)).await.unwrap();
        session.disconnect().await;
        drop(session);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stale_data_triggers_reconnect_before_next_command() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection: normal connect handshake, then an
            // unsolicited extra reply the client never asked for.
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"220 Welcome\r\n").await.unwrap();
            let mut buf = [0u8; 256];
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"USER anonymous\r\n");
            sock.write_all(b"331 Need password\r\n").await.unwrap();
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"PASS anonymous\r\n");
            sock.write_all(b"230 Logged in\r\n").await.unwrap();
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"FEAT\r\n");
            sock.write_all(b"211-Features:\r\n211 End\r\n").await.unwrap();
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"SYST\r\n");
            sock.write_all(b"215 UNIX\r\n").await.unwrap();
            sock.write_all(b"250 unsolicited leftover reply\r\n")
                .await
                .unwrap();

            // Second connection: the client must reconnect from scratch
            // before sending PWD.
            let (mut sock2, _) = listener.accept().await.unwrap();
            sock2.write_all(b"220 Welcome again\r\n").await.unwrap();
            let n = sock2.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"USER anonymous\r\n");
            sock2.write_all(b"331 Need password\r\n").await.unwrap();
            let n = sock2.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"PASS anonymous\r\n");
            sock2.write_all(b"230 Logged in\r\n").await.unwrap();
            let n = sock2.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"FEAT\r\n");
            sock2
                .write_all(b"211-Features:\r\n211 End\r\n")
                .await
                .unwrap();
            let n = sock2.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"SYST\r\n");
            sock2.write_all(b"215 UNIX\r\n").await.unwrap();
            let n = sock2.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"PWD\r\n");
            sock2
                .write_all(b"257 \"/\" is current directory\r\n")
                .await
                .unwrap();
        });

        let mut config = SessionConfig::anonymous(addr.ip().to_string());
        config.port = addr.port();
        let mut session = ControlSession::connect(Arc::new(config)).await.unwrap();

        // Give the unsolicited reply time to land in the kernel socket
        // buffer before probing for it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let reply = session.execute("PWD").await.unwrap();
        assert_eq!(reply.code_str(), "257");
        handle_drop_and_join(session, server).await;
    }

    async fn handle_drop_and_join(session: ControlSession, server: tokio::task::JoinHandle<()>) {
        drop(session);
        server.await.unwrap();
    }
}
