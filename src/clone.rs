//! Sibling session creation for concurrent transfers.

use crate::config::SessionConfig;
use crate::error::Result;
use crate::session::ControlSession;
use std::sync::Arc;

/// Produces sibling [`ControlSession`]s that share a parent session's
/// configuration, for running a data transfer on its own control
/// connection concurrently with the parent.
///
/// A cloned session skips `FEAT` discovery (the capability set is assumed
/// identical to the session it was cloned from) but otherwise goes through
/// the full connect procedure, including its own `USER`/`PASS` exchange,
/// since FTP servers do not support handing off an authenticated session
/// to a second socket.
pub struct SessionCloner {
    config: Arc<SessionConfig>,
}

impl SessionCloner {
    /// Build a cloner from a live session's configuration.
    pub fn new(source: &ControlSession) -> Self {
        Self {
            config: Arc::clone(source.config()),
        }
    }

    /// Open a new, fully authenticated sibling control connection.
    pub async fn clone_session(&self) -> Result<ControlSession> {
        ControlSession::connect_as(Arc::clone(&self.config), true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn clone_skips_feat_but_authenticates_independently() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut sock, _) = listener.accept().await.unwrap();
                sock.write_all(b"220 Welcome\r\n").await.unwrap();
                let mut buf = [0u8; 256];
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"USER anonymous\r\n");
                sock.write_all(b"331 Need password\r\n").await.unwrap();
                let n = sock.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"PASS anonymous\r\n");
                sock.write_all(b"230 Logged in\r\n").await.unwrap();
                // No FEAT expected for the clone; the parent still issues it.
                let n = sock.read(&mut buf).await.unwrap();
                let sent = &buf[..n];
                if sent == b"FEAT\r\n" {
                    sock.write_all(b"211-Features:\r\n211 End\r\n")
                        .await
                        .unwrap();
                    let n = sock.read(&mut buf).await.unwrap();
                    assert_eq!(&buf[..n], b"SYST\r\n");
                } else {
                    assert_eq!(sent, b"SYST\r\n");
                }
                sock.write_all(b"215 UNIX\r\n").await.unwrap();
            }
        });

        let mut config = SessionConfig::anonymous(addr.ip().to_string());
        config.port = addr.port();
        let parent = ControlSession::connect(Arc::new(config)).await.unwrap();

        let cloner = SessionCloner::new(&parent);
        let child = cloner.clone_session().await.unwrap();
        assert!(child.is_connected());
        assert!(child.capabilities().list().is_empty());

        server.await.unwrap();
    }
}
