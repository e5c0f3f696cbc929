//! FTP/FTPS session configuration

use std::sync::Arc;
use std::time::Duration;

/// How the control connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EncryptionMode {
    /// Cleartext control connection; no AUTH TLS is attempted.
    None,
    /// Cleartext greeting, then `AUTH TLS` upgrades the existing socket.
    Explicit,
    /// TLS handshake happens before any FTP bytes are exchanged.
    Implicit,
}

/// How the data channel is opened for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataChannelMode {
    /// Try EPSV first, fall back to PASV and remember the choice.
    AutoPassive,
    /// Try EPRT first, fall back to PORT and remember the choice.
    AutoActive,
    /// Always use PASV.
    Pasv,
    /// Always use EPSV.
    Epsv,
    /// Like Pasv, but substitutes the control host when the advertised
    /// data host is private/unroutable.
    PasvEx,
    /// Always use PORT.
    Port,
    /// Always use EPRT.
    Eprt,
}

/// ASCII vs binary transfer type, negotiated via the `TYPE` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FtpDataType {
    Ascii,
    Binary,
}

/// Which address family to prefer when a hostname resolves to more than
/// one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IpPreference {
    /// Try every resolved candidate regardless of family.
    Any,
    /// Only attempt IPv4 candidates.
    Ipv4Only,
    /// Only attempt IPv6 candidates.
    Ipv6Only,
}

/// TLS protocol version the client is willing to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TlsProtocol {
    Tls12,
    Tls13,
}

/// A client certificate chain and its private key, presented for mutual
/// TLS. Stored as DER bytes (leaf first) rather than rustls's borrowed
/// certificate types so `SessionConfig` can derive `Clone`/`serde` without
/// depending on a certificate's lifetime.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientCertificate {
    /// DER-encoded certificate chain, leaf certificate first.
    pub chain: Vec<Vec<u8>>,
    /// DER-encoded PKCS#8 private key matching the leaf certificate.
    pub private_key: Vec<u8>,
}

/// Which parser a higher layer should use to interpret a `LIST` reply
/// body. The parsers themselves are outside this crate's scope (see
/// §1 PURPOSE & SCOPE); this only records the caller's selection so it
/// travels with the rest of the session configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ListingParser {
    /// Detect the format from the reply body.
    Auto,
    Unix,
    Dos,
    Mlsd,
    Vms,
}

/// Resolves the local address a client announces to the server for
/// active-mode data connections (`PORT`/`EPRT`), overriding the control
/// socket's own local address. Useful behind NAT, where the control
/// socket's local address is not the address the server can reach.
#[derive(Clone)]
pub struct AddressResolver(Arc<dyn Fn() -> std::net::IpAddr + Send + Sync>);

impl AddressResolver {
    /// Wrap a closure that produces the address to announce.
    pub fn new(resolver: impl Fn() -> std::net::IpAddr + Send + Sync + 'static) -> Self {
        Self(Arc::new(resolver))
    }

    /// Invoke the resolver.
    pub fn resolve(&self) -> std::net::IpAddr {
        (self.0)()
    }
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AddressResolver(..)")
    }
}

/// Connection and behavior configuration for an FTP/FTPS session.
///
/// # Example
///
/// ```
/// use ftp_session_rs::SessionConfig;
///
/// let config = SessionConfig::explicit_tls("ftp.example.com", "user", "pass");
/// ```
#[must_use]
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Server hostname or address.
    pub host: String,

    /// Server port. 0 means "infer from encryption mode": 21 for
    /// None/Explicit, 990 for Implicit.
    pub port: u16,

    /// How the control connection is secured.
    pub encryption: EncryptionMode,

    /// Accept self-signed or otherwise invalid server certificates.
    ///
    /// **Security warning:** disables certificate validation. Only use this
    /// for testing or with servers you trust on a secure network.
    #[cfg_attr(feature = "serde", serde(default))]
    pub allow_insecure_tls: bool,

    /// Username for authentication.
    pub username: String,

    /// Password for authentication.
    pub password: String,

    /// Data channel mode.
    #[cfg_attr(feature = "serde", serde(default = "default_data_channel_mode"))]
    pub data_channel_mode: DataChannelMode,

    /// Require the data channel to be TLS-protected (PBSZ 0 / PROT P) when
    /// the control connection is encrypted.
    #[cfg_attr(feature = "serde", serde(default = "default_true"))]
    pub encrypt_data_channel: bool,

    /// Timeout for establishing the control connection.
    #[cfg_attr(feature = "serde", serde(default = "default_connect_timeout"))]
    pub connect_timeout: Duration,

    /// Timeout for reading a control-connection reply.
    #[cfg_attr(feature = "serde", serde(default = "default_read_timeout"))]
    pub read_timeout: Duration,

    /// Timeout for establishing (connect or accept) a data connection.
    #[cfg_attr(feature = "serde", serde(default = "default_data_timeout"))]
    pub data_timeout: Duration,

    /// Minimum interval between liveness polls of an otherwise-idle control
    /// socket. `None` disables polling.
    #[cfg_attr(feature = "serde", serde(default))]
    pub poll_interval: Option<Duration>,

    /// Enable TCP keep-alive on the control socket.
    #[cfg_attr(feature = "serde", serde(default = "default_true"))]
    pub keep_alive: bool,

    /// Before sending a command, discard and reconnect if unread bytes are
    /// sitting on a plaintext control socket (guards against a previous
    /// command whose reply was never consumed). Always a no-op over TLS.
    #[cfg_attr(feature = "serde", serde(default = "default_true"))]
    pub check_stale_data: bool,

    /// Skip `QUIT` on disconnect and close the socket immediately.
    #[cfg_attr(feature = "serde", serde(default))]
    pub ungraceful_disconnect: bool,

    /// Chunk size used when copying bytes across a data connection.
    #[cfg_attr(feature = "serde", serde(default = "default_chunk_size"))]
    pub transfer_chunk_size: usize,

    /// Number of attempts a higher layer should retry a failed control
    /// operation. The core itself never retries automatically.
    #[cfg_attr(feature = "serde", serde(default = "default_retry_attempts"))]
    pub retry_attempts: u32,

    /// Upload rate cap in KB/s. `None` means unlimited.
    #[cfg_attr(feature = "serde", serde(default))]
    pub upload_rate_kbps: Option<u64>,

    /// Download rate cap in KB/s. `None` means unlimited.
    #[cfg_attr(feature = "serde", serde(default))]
    pub download_rate_kbps: Option<u64>,

    /// Automatically switch to UTF-8 text encoding once the server
    /// advertises the UTF8 capability.
    #[cfg_attr(feature = "serde", serde(default = "default_true"))]
    pub auto_utf8: bool,

    /// Local ports the client may bind to for active-mode data channels.
    /// Empty means an ephemeral port is chosen.
    #[cfg_attr(feature = "serde", serde(default))]
    pub active_ports: Vec<u16>,

    /// Which address family to prefer when the host resolves to more than
    /// one candidate address.
    #[cfg_attr(feature = "serde", serde(default = "default_ip_preference"))]
    pub ip_preference: IpPreference,

    /// TLS protocol versions the client offers. Empty means the
    /// implementation's default set (currently TLS 1.2 and 1.3).
    #[cfg_attr(feature = "serde", serde(default))]
    pub tls_protocols: Vec<TlsProtocol>,

    /// Client certificates presented for mutual TLS, both on the control
    /// connection and (per §4.5) on data channels opened under it. Empty
    /// means no client certificate is offered.
    #[cfg_attr(feature = "serde", serde(default))]
    pub client_certificates: Vec<ClientCertificate>,

    /// Which listing-reply parser a higher layer should select for `LIST`
    /// output. Carried here so the choice travels with the rest of the
    /// session configuration; this crate does not parse listings itself.
    #[cfg_attr(feature = "serde", serde(default = "default_listing_parser"))]
    pub listing_parser: ListingParser,

    /// Locale identifier (e.g. `"en-US"`) a listing parser should use when
    /// interpreting month names and other culture-specific date tokens.
    /// `None` means the parser should fall back to its own default.
    #[cfg_attr(feature = "serde", serde(default))]
    pub listing_culture: Option<String>,

    /// Offset, in seconds, to apply to server-reported timestamps (e.g.
    /// from `MDTM` or a `LIST`/`MLSD` entry) to correct for a server clock
    /// that is not in UTC.
    #[cfg_attr(feature = "serde", serde(default))]
    pub time_offset_seconds: i64,

    /// Overrides the local address announced in `PORT`/`EPRT` commands.
    /// `None` means the control connection's own local address is used.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub local_address_resolver: Option<AddressResolver>,
}

fn default_true() -> bool {
    true
}

fn default_data_channel_mode() -> DataChannelMode {
    DataChannelMode::AutoPassive
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_data_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_retry_attempts() -> u32 {
    1
}

fn default_ip_preference() -> IpPreference {
    IpPreference::Any
}

fn default_listing_parser() -> ListingParser {
    ListingParser::Auto
}

impl SessionConfig {
    /// Build a configuration with the given host, port, encryption mode,
    /// and credentials. Remaining fields take their defaults.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        encryption: EncryptionMode,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            encryption,
            allow_insecure_tls: false,
            username: username.into(),
            password: password.into(),
            data_channel_mode: default_data_channel_mode(),
            encrypt_data_channel: true,
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            data_timeout: default_data_timeout(),
            poll_interval: None,
            keep_alive: true,
            check_stale_data: true,
            ungraceful_disconnect: false,
            transfer_chunk_size: default_chunk_size(),
            retry_attempts: default_retry_attempts(),
            upload_rate_kbps: None,
            download_rate_kbps: None,
            auto_utf8: true,
            active_ports: Vec::new(),
            ip_preference: default_ip_preference(),
            tls_protocols: Vec::new(),
            client_certificates: Vec::new(),
            listing_parser: default_listing_parser(),
            listing_culture: None,
            time_offset_seconds: 0,
            local_address_resolver: None,
        }
    }

    /// Resolve the effective port: the configured port, or the mode's
    /// standard port when `port` is 0.
    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        match self.encryption {
            EncryptionMode::None | EncryptionMode::Explicit => 21,
            EncryptionMode::Implicit => 990,
        }
    }

    /// Cleartext connection on the standard port (21), anonymous login.
    pub fn anonymous(host: impl Into<String>) -> Self {
        Self::new(host, 0, EncryptionMode::None, "anonymous", "anonymous")
    }

    /// Cleartext connection with explicit credentials.
    pub fn plain(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, 0, EncryptionMode::None, username, password)
    }

    /// Explicit FTPS (`AUTH TLS`) on the standard port (21).
    pub fn explicit_tls(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, 0, EncryptionMode::Explicit, username, password)
    }

    /// Implicit FTPS on the standard secure port (990).
    pub fn implicit_tls(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, 0, EncryptionMode::Implicit, username, password)
    }

    /// Like [`Self::implicit_tls`] but accepts invalid server certificates.
    ///
    /// **Security warning:** disables certificate validation, making the
    /// connection vulnerable to man-in-the-middle attacks. Only use this
    /// for testing or with servers you trust on a secure network.
    pub fn implicit_tls_insecure(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let mut config = Self::implicit_tls(host, username, password);
        config.allow_insecure_tls = true;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sets_all_fields() {
        let config = SessionConfig::new("ftp.example.com", 21, EncryptionMode::None, "u", "p");
        assert_eq!(config.host, "ftp.example.com");
        assert_eq!(config.port, 21);
        assert_eq!(config.encryption, EncryptionMode::None);
        assert!(!config.allow_insecure_tls);
        assert_eq!(config.username, "u");
        assert_eq!(config.password, "p");
    }

    #[test]
    fn anonymous_helper() {
        let config = SessionConfig::anonymous("ftp.example.com");
        assert_eq!(config.username, "anonymous");
        assert_eq!(config.password, "anonymous");
        assert_eq!(config.encryption, EncryptionMode::None);
    }

    #[test]
    fn effective_port_infers_from_mode() {
        let plain = SessionConfig::plain("h", "u", "p");
        assert_eq!(plain.effective_port(), 21);

        let explicit = SessionConfig::explicit_tls("h", "u", "p");
        assert_eq!(explicit.effective_port(), 21);

        let implicit = SessionConfig::implicit_tls("h", "u", "p");
        assert_eq!(implicit.effective_port(), 990);
    }

    #[test]
    fn explicit_port_overrides_inference() {
        let mut config = SessionConfig::implicit_tls("h", "u", "p");
        config.port = 2121;
        assert_eq!(config.effective_port(), 2121);
    }

    #[test]
    fn implicit_tls_insecure_sets_flag() {
        let config = SessionConfig::implicit_tls_insecure("localhost", "u", "p");
        assert_eq!(config.encryption, EncryptionMode::Implicit);
        assert!(config.allow_insecure_tls);
    }

    #[test]
    fn defaults_match_spec() {
        let config = SessionConfig::anonymous("h");
        assert_eq!(config.data_channel_mode, DataChannelMode::AutoPassive);
        assert!(config.encrypt_data_channel);
        assert!(config.check_stale_data);
        assert!(!config.ungraceful_disconnect);
        assert_eq!(config.retry_attempts, 1);
        assert!(config.auto_utf8);
        assert_eq!(config.ip_preference, IpPreference::Any);
        assert!(config.tls_protocols.is_empty());
        assert!(config.client_certificates.is_empty());
        assert_eq!(config.listing_parser, ListingParser::Auto);
        assert!(config.listing_culture.is_none());
        assert_eq!(config.time_offset_seconds, 0);
        assert!(config.local_address_resolver.is_none());
    }

    #[test]
    fn address_resolver_is_invoked() {
        let resolver = AddressResolver::new(|| std::net::IpAddr::from([203, 0, 113, 7]));
        assert_eq!(resolver.resolve(), std::net::IpAddr::from([203, 0, 113, 7]));
    }
}
