//! Connection transport (design §2.K / §6): opening the byte stream the
//! engine runs its protocol over. Authentication and the TLS handshake
//! itself are assumed already negotiated by whatever drives this crate in
//! production; what lives here is just "dial this address, optionally wrap
//! it in TLS", split between a `TCP` and a `TLS` opener.

use anyhow::Context as _;
use std::io::{self, Read, Write};
use std::net::{self, ToSocketAddrs as _};
use std::time::Duration;

/// Something that can produce a fresh, connected `Read + Write` stream.
/// Kept as a trait (rather than an enum over the two variants) so tests can
/// plug in an in-process loopback opener without touching real sockets.
pub trait Open {
  type RW: Read + Write;

  fn open(&self) -> anyhow::Result<Self::RW>;
}

pub struct Tcp<'a> {
  pub address: &'a str,
  pub port: u16,
  pub timeout: Option<Duration>,
}

impl<'a> Open for Tcp<'a> {
  type RW = net::TcpStream;

  fn open(&self) -> anyhow::Result<Self::RW> {
    let &Self { address, port, timeout } = self;
    let address = (address, port)
      .to_socket_addrs()?
      .next()
      .with_context(|| format!("couldn't resolve {address}:{port}"))?;
    log::debug!("connecting to {address:?} with timeout {timeout:?}");
    Ok(match timeout {
      Some(duration) => {
        let stream = net::TcpStream::connect_timeout(&address, duration)?;
        stream.set_read_timeout(Some(duration))?;
        stream
      }
      None => net::TcpStream::connect(address)?,
    })
  }
}

pub struct Tls<'a>(pub Tcp<'a>);

#[ouroboros::self_referencing]
pub struct TlsStream {
  tcp_stream: net::TcpStream,
  tls_connection: rustls::ClientConnection,
  #[borrows(mut tcp_stream, mut tls_connection)]
  #[covariant]
  tls_stream: rustls::Stream<'this, rustls::ClientConnection, net::TcpStream>,
}

impl Read for TlsStream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.tls_stream.read(buf))
  }
}

impl Write for TlsStream {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.tls_stream.write(buf))
  }

  fn flush(&mut self) -> io::Result<()> {
    self.with_mut(|fields| fields.tls_stream.flush())
  }
}

impl<'a> Open for Tls<'a> {
  type RW = TlsStream;

  fn open(&self) -> anyhow::Result<Self::RW> {
    let mut root_store = rustls::RootCertStore::empty();
    for certificate in rustls_native_certs::load_native_certs()? {
      root_store.add(&rustls::Certificate(certificate.0))?
    }
    Ok(
      TlsStreamBuilder {
        tcp_stream: self.0.open()?,
        tls_connection: rustls::ClientConnection::new(
          std::sync::Arc::new(
            rustls::ClientConfig::builder()
              .with_safe_defaults()
              .with_root_certificates(root_store)
              .with_no_client_auth(),
          ),
          self.0.address.try_into().with_context(|| format!("couldn't convert {} to server name", self.0.address))?,
        )?,
        tls_stream_builder: |tcp_stream, tls_connection| rustls::Stream::new(tls_connection, tcp_stream),
      }
      .build(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tcp_open_rejects_unresolvable_address() {
    let tcp = Tcp { address: "", port: 0, timeout: Some(Duration::from_millis(50)) };
    assert!(tcp.open().is_err());
  }
}
