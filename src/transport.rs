//! Blocking point-to-point transport, plus the signed/unsigned combinators
//! the engine drives every phase through.
//!
//! `Transport` is a trait (rather than a hardcoded socket call) so phase
//! logic can be exercised in tests without binding real ports if a fake
//! implementation is substituted; `TcpTransport` is the only production
//! implementation.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use rand_core::CryptoRngCore;

use crate::codec::{self, WireMessage};
use crate::crypto::rsa_ops::{PrivateKey, PublicKey};
use crate::crypto::sign;
use crate::error::{Error, Result};
use crate::node::PartyId;

const LEN_PREFIX_BYTES: usize = 4;
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// A blocking, length-framed point-to-point transport.
pub trait Transport {
    /// Opens a connection to `addr`, writes one length-prefixed frame, and
    /// closes the connection.
    fn send(&self, addr: SocketAddr, bytes: &[u8]) -> Result<()>;

    /// Binds `bind_addr`, blocks until exactly `n` inbound connections have
    /// each delivered one length-prefixed frame, and returns the payloads
    /// together with their source addresses, in arrival order.
    fn recv_n(&self, bind_addr: SocketAddr, n: usize) -> Result<Vec<(Vec<u8>, SocketAddr)>>;
}

/// Production transport: plain TCP sockets on `(ip, port)`.
///
/// `read_timeout`, when set, is applied to each accepted connection; a peer
/// that never finishes writing its frame then surfaces as
/// [`Error::TransportFailed`] instead of blocking forever. The protocol
/// itself defines no timeout at all, so this is an operational knob
/// layered on top.
pub struct TcpTransport {
    pub read_timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { read_timeout: None }
    }

    pub fn with_read_timeout(read_timeout: Duration) -> Self {
        Self {
            read_timeout: Some(read_timeout),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn write_frame(mut stream: &TcpStream, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::CiphertextFraming("frame exceeds u32 length"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(bytes)?;
    stream.flush()?;
    stream.shutdown(std::net::Shutdown::Write).ok();
    Ok(())
}

fn read_frame(mut stream: &TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_PREFIX_BYTES];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(Error::CiphertextFraming("frame length exceeds sanity cap"));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// How long to keep retrying a refused connection before giving up. A
/// listener on the other side may not have bound its socket yet (the
/// protocol has no phase barrier across nodes), so a handful of retries
/// absorbs that startup race without masking a genuinely dead peer for
/// long. This is connection-establishment plumbing, not a protocol-level
/// retry: once a frame is accepted and read, failures are fatal as usual.
const CONNECT_RETRY_BUDGET: Duration = Duration::from_secs(5);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
    let deadline = std::time::Instant::now() + CONNECT_RETRY_BUDGET;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused
                && std::time::Instant::now() < deadline =>
            {
                std::thread::sleep(CONNECT_RETRY_INTERVAL);
            }
            Err(e) => return Err(Error::from(e)),
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, addr: SocketAddr, bytes: &[u8]) -> Result<()> {
        let stream = connect_with_retry(addr)?;
        write_frame(&stream, bytes)
    }

    fn recv_n(&self, bind_addr: SocketAddr, n: usize) -> Result<Vec<(Vec<u8>, SocketAddr)>> {
        let listener = TcpListener::bind(bind_addr)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let (stream, peer) = listener.accept()?;
            if let Some(timeout) = self.read_timeout {
                stream.set_read_timeout(Some(timeout))?;
            }
            let payload = read_frame(&stream)?;
            out.push((payload, peer));
        }
        Ok(out)
    }
}

/// Sends `msg` unsigned. Used only for the Phase 1 bootstrap messages,
/// where no K1 identity yet exists to sign under.
pub fn unsigned_send(transport: &impl Transport, addr: SocketAddr, msg: &WireMessage) -> Result<()> {
    let payload = codec::encode(msg)?;
    transport.send(addr, &payload)
}

/// Receives `n` unsigned messages, decoding each to a [`WireMessage`].
pub fn unsigned_recv_n(
    transport: &impl Transport,
    bind_addr: SocketAddr,
    n: usize,
) -> Result<Vec<(WireMessage, SocketAddr)>> {
    let frames = transport.recv_n(bind_addr, n)?;
    frames
        .into_iter()
        .map(|(bytes, addr)| Ok((codec::decode(&bytes)?, addr)))
        .collect()
}

/// Signs `msg` under the caller's K1 and sends it.
pub fn signed_send(
    transport: &impl Transport,
    addr: SocketAddr,
    signer: PartyId,
    k1_priv: &PrivateKey,
    msg: &WireMessage,
    rng: &mut impl CryptoRngCore,
) -> Result<()> {
    let payload = codec::encode(msg)?;
    let blob = sign::sign(signer, k1_priv, &payload, rng)?;
    transport.send(addr, &blob)
}

/// Receives `n` signed messages, verifying each against `k1_keyset` and
/// decoding the recovered payload. Returns `(signer, message)` pairs in
/// arrival order.
pub fn verified_recv_n(
    transport: &impl Transport,
    bind_addr: SocketAddr,
    n: usize,
    k1_keyset: &BTreeMap<PartyId, PublicKey>,
) -> Result<Vec<(PartyId, WireMessage)>> {
    let frames = transport.recv_n(bind_addr, n)?;
    frames
        .into_iter()
        .map(|(bytes, _addr)| {
            let (signer, payload) = sign::verify(k1_keyset, &bytes)?;
            let msg = codec::decode(&payload)?;
            Ok((signer, msg))
        })
        .collect()
}
