//! User-space TLS plumbing over non-blocking raw FDs
//!
//! The reactor drives a rustls [`ClientConnection`] by hand: record bytes
//! move through [`FdIo`] (a thin `Read`/`Write` over the raw descriptor)
//! and plaintext is drained into the session's inbound buffer. After the
//! handshake, sessions configured for it hand their keys to the kernel
//! (see [`crate::ktls`]) and leave user-space TLS entirely.

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::sync::Arc;

/// `Read`/`Write` adapter over a raw non-blocking FD.
pub(crate) struct FdIo(pub RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: buf is valid for writes of buf.len() bytes.
            let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                #[allow(clippy::cast_sign_loss)]
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            // SAFETY: buf is valid for reads of buf.len() bytes.
            let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                #[allow(clippy::cast_sign_loss)]
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Build a client config with the bundled webpki roots. Secret extraction
/// must be enabled when the session will be kernel-offloaded.
#[must_use]
pub fn default_client_config(enable_secret_extraction: bool) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.enable_secret_extraction = enable_secret_extraction;
    Arc::new(config)
}

/// Per-session user-space TLS state.
pub(crate) struct TlsSession {
    pub conn: ClientConnection,
    /// Hand keys to the kernel once the handshake completes
    pub offload_when_ready: bool,
}

impl TlsSession {
    pub fn new(
        config: Arc<ClientConfig>,
        server_name: &str,
        offload_when_ready: bool,
    ) -> Result<Self, rustls::Error> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| rustls::Error::General(format!("invalid server name {server_name}")))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(Self {
            conn,
            offload_when_ready,
        })
    }

    /// Flush pending TLS records to the socket. Returns false if the
    /// socket would block with records still pending.
    pub fn flush_tls(&mut self, fd: RawFd) -> io::Result<bool> {
        let mut io = FdIo(fd);
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut io) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
