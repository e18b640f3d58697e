//! TLS handshake overlay, backed directly by `rustls`'s sans-IO connection.
//!
//! # Why
//! `rustls::ClientConnection`/`ServerConnection` already expose exactly the
//! push/pull buffer-draining shape a `TlsSession` collaborator needs
//! (`handshake()`, `direction()`, `read`/`write` driven by callbacks) —
//! there is no async-runtime adaptation to do, which is why this crate
//! depends on `rustls` directly rather than through an `AsyncRead`/
//! `AsyncWrite` wrapper crate.
//!
//! # How
//! `TlsOverlay` owns the session plus the ciphertext reader/writer pair
//! (the throttled stream one layer down) while the handshake is driven; once
//! `drive_handshake` reports [`HandshakeStatus::Done`], `into_streams` splits
//! it into a [`TlsInputStream`]/[`TlsOutputStream`] pair sharing the same
//! session behind an `Arc<Mutex<_>>`, which then sit under the buffered
//! layer per the chain in §4.5.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::{ClientConnection, ServerConnection};
use rustls_pki_types::ServerName;

use crate::error::{EvdError, ErrorKind, Result};
use crate::stream::{Readable, Writable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    InProgress,
    Done,
}

enum Role {
    Client(ClientConnection),
    Server(ServerConnection),
}

/// Adapts a `&mut dyn Readable`/`Writable` pair to `std::io::Read`/`Write`
/// for the span of a single `rustls` call, translating `WouldBlock`
/// faithfully so `rustls`'s own partial-progress handling still applies.
struct ReadAdapter<'a>(&'a mut dyn Readable);
impl io::Read for ReadAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

struct WriteAdapter<'a>(&'a mut dyn Writable);
impl io::Write for WriteAdapter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn tls_err(e: impl std::error::Error + Send + Sync + 'static) -> EvdError {
    EvdError::new(ErrorKind::TlsHandshake, e.to_string()).with_cause(e)
}

pub struct TlsSession {
    role: Role,
}

impl TlsSession {
    pub fn new_client(config: Arc<rustls::ClientConfig>, server_name: ServerName<'static>) -> Result<Self> {
        let conn = ClientConnection::new(config, server_name).map_err(tls_err)?;
        Ok(Self { role: Role::Client(conn) })
    }

    pub fn new_server(config: Arc<rustls::ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config).map_err(tls_err)?;
        Ok(Self { role: Role::Server(conn) })
    }

    fn wants_read(&self) -> bool {
        match &self.role {
            Role::Client(c) => c.wants_read(),
            Role::Server(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match &self.role {
            Role::Client(c) => c.wants_write(),
            Role::Server(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match &self.role {
            Role::Client(c) => c.is_handshaking(),
            Role::Server(c) => c.is_handshaking(),
        }
    }

    pub fn direction(&self) -> Direction {
        if self.wants_write() {
            Direction::Write
        } else {
            Direction::Read
        }
    }

    fn write_tls(&mut self, w: &mut dyn io::Write) -> io::Result<usize> {
        match &mut self.role {
            Role::Client(c) => c.write_tls(w),
            Role::Server(c) => c.write_tls(w),
        }
    }

    fn read_tls(&mut self, r: &mut dyn io::Read) -> io::Result<usize> {
        match &mut self.role {
            Role::Client(c) => c.read_tls(r),
            Role::Server(c) => c.read_tls(r),
        }
    }

    fn process_new_packets(&mut self) -> Result<()> {
        match &mut self.role {
            Role::Client(c) => c.process_new_packets().map(|_| ()).map_err(tls_err),
            Role::Server(c) => c.process_new_packets().map(|_| ()).map_err(tls_err),
        }
    }

    fn drain_outgoing(&mut self, ciphertext_out: &mut dyn Writable) -> Result<()> {
        let mut w = WriteAdapter(ciphertext_out);
        while self.wants_write() {
            match self.write_tls(&mut w) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(EvdError::new(ErrorKind::TlsHandshake, e.to_string())),
            }
        }
        Ok(())
    }

    /// Drive one step of the handshake: flush any pending outgoing record,
    /// then try to absorb one incoming record. Returns `Done` once
    /// `is_handshaking()` goes false, matching the `handshake() -> {0,1,-1}`
    /// contract's success case.
    pub fn handshake(&mut self, ciphertext_in: &mut dyn Readable, ciphertext_out: &mut dyn Writable) -> Result<HandshakeStatus> {
        self.drain_outgoing(ciphertext_out)?;

        if self.wants_read() {
            let mut r = ReadAdapter(ciphertext_in);
            match self.read_tls(&mut r) {
                Ok(0) => {}
                Ok(_) => self.process_new_packets()?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(EvdError::new(ErrorKind::TlsHandshake, e.to_string())),
            }
        }

        self.drain_outgoing(ciphertext_out)?;

        if self.is_handshaking() {
            Ok(HandshakeStatus::InProgress)
        } else {
            Ok(HandshakeStatus::Done)
        }
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        let result = match &mut self.role {
            Role::Client(c) => c.reader().read(buf),
            Role::Server(c) => c.reader().read(buf),
        };
        match result {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(EvdError::would_block()),
            Err(e) => Err(EvdError::from_io(e)),
        }
    }

    fn write_plaintext(&mut self, buf: &[u8]) -> Result<usize> {
        use std::io::Write;
        let result = match &mut self.role {
            Role::Client(c) => c.writer().write(buf),
            Role::Server(c) => c.writer().write(buf),
        };
        result.map_err(EvdError::from_io)
    }

    pub fn close(&mut self, ciphertext_out: &mut dyn Writable) -> Result<()> {
        match &mut self.role {
            Role::Client(c) => c.send_close_notify(),
            Role::Server(c) => c.send_close_notify(),
        }
        self.drain_outgoing(ciphertext_out)
    }
}

/// Owns the session plus its ciphertext pair while a handshake is in
/// progress; splits into a stream pair once done.
pub struct TlsOverlay<R, W> {
    session: Arc<Mutex<TlsSession>>,
    ciphertext_in: R,
    ciphertext_out: W,
}

impl<R: Readable, W: Writable> TlsOverlay<R, W> {
    pub fn new(session: TlsSession, ciphertext_in: R, ciphertext_out: W) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            ciphertext_in,
            ciphertext_out,
        }
    }

    pub fn direction(&self) -> Direction {
        self.session.lock().direction()
    }

    pub fn drive_handshake(&mut self) -> Result<HandshakeStatus> {
        let mut session = self.session.lock();
        session.handshake(&mut self.ciphertext_in, &mut self.ciphertext_out)
    }

    pub fn into_streams(self) -> (TlsInputStream<R>, TlsOutputStream<W>) {
        (
            TlsInputStream {
                session: self.session.clone(),
                ciphertext_in: self.ciphertext_in,
            },
            TlsOutputStream {
                session: self.session,
                ciphertext_out: self.ciphertext_out,
            },
        )
    }
}

pub struct TlsInputStream<R> {
    session: Arc<Mutex<TlsSession>>,
    ciphertext_in: R,
}

impl<R: Readable> Readable for TlsInputStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut session = self.session.lock();
        match session.read_plaintext(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() != ErrorKind::WouldBlock => return Err(e),
            Err(_) => {}
        }
        let mut r = ReadAdapter(&mut self.ciphertext_in);
        match session.read_tls(&mut r) {
            Ok(0) => Err(EvdError::would_block()),
            Ok(_) => {
                session.process_new_packets()?;
                session.read_plaintext(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(EvdError::would_block()),
            Err(e) => Err(EvdError::new(ErrorKind::TlsHandshake, e.to_string())),
        }
    }
}

pub struct TlsOutputStream<W> {
    session: Arc<Mutex<TlsSession>>,
    ciphertext_out: W,
}

impl<W: Writable> Writable for TlsOutputStream<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut session = self.session.lock();
        let n = session.write_plaintext(buf)?;
        session.drain_outgoing(&mut self.ciphertext_out)?;
        Ok(n)
    }
}

impl<W: Writable> TlsOutputStream<W> {
    /// Send `close_notify` and flush it to the ciphertext layer.
    pub fn close(&mut self) -> Result<()> {
        let mut session = self.session.lock();
        session.close(&mut self.ciphertext_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use std::collections::VecDeque;
    use std::sync::Arc as StdArc;

    /// One direction of an in-memory ciphertext link between a paired client
    /// and server session.
    #[derive(Clone, Default)]
    struct SharedPipe(Arc<Mutex<VecDeque<u8>>>);

    impl Readable for SharedPipe {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut q = self.0.lock();
            if q.is_empty() {
                return Err(EvdError::would_block());
            }
            let n = buf.len().min(q.len());
            for b in buf.iter_mut().take(n) {
                *b = q.pop_front().unwrap();
            }
            Ok(n)
        }
    }
    impl Writable for SharedPipe {
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            self.0.lock().extend(buf);
            Ok(buf.len())
        }
    }

    fn self_signed_server_config() -> Arc<rustls::ServerConfig> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = certified.cert.der().clone();
        let key_der = PrivateKeyDer::try_from(certified.key_pair.serialize_der()).unwrap();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();
        StdArc::new(config)
    }

    fn insecure_client_config() -> Arc<rustls::ClientConfig> {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(StdArc::new(NoVerify))
            .with_no_client_auth();
        StdArc::new(config)
    }

    /// Pumps both sides' `handshake()` against a pair of shared in-memory
    /// ciphertext pipes until both report `Done`, then exchanges one
    /// plaintext message each way to prove the session is actually usable.
    #[test]
    fn client_and_server_complete_handshake_and_exchange_data() {
        let client_to_server = SharedPipe::default();
        let server_to_client = SharedPipe::default();

        let client_session = TlsSession::new_client(insecure_client_config(), ServerName::try_from("localhost").unwrap()).unwrap();
        let server_session = TlsSession::new_server(self_signed_server_config()).unwrap();

        let mut client = TlsOverlay::new(client_session, server_to_client.clone(), client_to_server.clone());
        let mut server = TlsOverlay::new(server_session, client_to_server, server_to_client);

        let mut client_done = false;
        let mut server_done = false;
        for _ in 0..32 {
            if !client_done && client.drive_handshake().unwrap() == HandshakeStatus::Done {
                client_done = true;
            }
            if !server_done && server.drive_handshake().unwrap() == HandshakeStatus::Done {
                server_done = true;
            }
            if client_done && server_done {
                break;
            }
        }
        assert!(client_done && server_done, "handshake did not converge");

        let (_client_in, mut client_out) = client.into_streams();
        let (mut server_in, _server_out) = server.into_streams();

        client_out.write(b"hello from client").unwrap();
        let mut buf = [0u8; 64];
        let n = server_in.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello from client");
    }

    #[derive(Debug)]
    struct NoVerify;
    impl rustls::client::danger::ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }
        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }
        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }
        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
        }
    }
}
