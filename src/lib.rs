//! Async FTP/FTPS control-connection engine.
//!
//! [`ControlSession`] drives the command/reply exchange over a
//! [`ByteLineStream`], handling implicit and explicit TLS, `USER`/`PASS`
//! authentication, `FEAT` capability discovery, and `PBSZ`/`PROT` data
//! channel protection. [`crate::datachannel::DataChannelFactory`] resolves
//! PASV/EPSV/PORT/EPRT data connections for a transfer, and
//! [`crate::clone::SessionCloner`] opens sibling control connections for
//! concurrent transfers.
//!
//! # Example
//!
//! ```no_run
//! use ftp_session_rs::{ControlSession, SessionConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::explicit_tls("ftp.example.com", "user", "pass");
//! let mut session = ControlSession::connect(Arc::new(config)).await?;
//! let reply = session.execute("PWD").await?;
//! println!("{reply}");
//! session.dispose().await;
//! # Ok(())
//! # }
//! ```

mod capabilities;
mod cert;
mod clone;
mod config;
mod datachannel;
mod error;
/// Bandwidth rate limiting
pub mod ratelimit;
mod reply;
mod session;
mod stream;

pub use capabilities::{CapabilityRegistry, HashAlgorithm};
pub use cert::CertificateValidationBus;
pub use clone::SessionCloner;
pub use config::{
    AddressResolver, ClientCertificate, DataChannelMode, EncryptionMode, FtpDataType,
    IpPreference, ListingParser, SessionConfig, TlsProtocol,
};
pub use datachannel::{DataChannelFactory, DataStream};
pub use error::{FtpError, Result};
pub use ratelimit::BandwidthLimiter;
pub use reply::{Reply, ReplyKind, ReplyParser};
pub use session::ControlSession;
pub use stream::ByteLineStream;
