//! Outbound connection pool
//!
//! Idle connections to peer hosts, reused across forwards. Connecting and
//! writing are retried with exponential backoff; once a request has been
//! written it is never sent again, so a lost response surfaces as an error
//! instead of a second apply.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{CradleError, Result};
use crate::protocol::{read_response, write_frame, Frame, Response};
use crate::router::CancelToken;

/// Retry and timeout settings for outbound traffic
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub connect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,

    /// How long to wait for a peer's response once the request is written
    pub forward_timeout: Duration,
    pub write_timeout: Duration,
    pub max_idle_per_peer: usize,
}

impl From<&Config> for PoolOptions {
    fn from(config: &Config) -> Self {
        Self {
            connect_attempts: config.connect_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            forward_timeout: config.forward_timeout(),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            max_idle_per_peer: config.max_idle_per_peer,
        }
    }
}

/// Exponential backoff capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: base, 2*base, 4*base, ... up to max
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// One framed TCP connection to a peer host
pub struct PeerConnection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl PeerConnection {
    pub fn connect(addr: &str, options: &PoolOptions) -> Result<Self> {
        let target = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| CradleError::Config(format!("address {} did not resolve", addr)))?;
        let stream = TcpStream::connect_timeout(&target, options.forward_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(options.forward_timeout))?;
        stream.set_write_timeout(Some(options.write_timeout))?;

        let read_stream = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
        })
    }

    pub fn send(&mut self, frame: &Frame) -> Result<()> {
        write_frame(&mut self.writer, frame)
    }

    pub fn receive(&mut self) -> Result<Response> {
        read_response(&mut self.reader)
    }

    /// False once the peer has closed its end
    fn is_alive(&self) -> bool {
        let stream = self.reader.get_ref();
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let alive = match stream.peek(&mut byte) {
            // Unsolicited bytes or EOF both mean the connection is unusable
            Ok(_) => false,
            Err(e) => e.kind() == ErrorKind::WouldBlock,
        };
        alive && stream.set_nonblocking(false).is_ok()
    }
}

/// Pooled connections keyed by peer address
pub struct ConnectionPool {
    idle: Mutex<HashMap<String, Vec<PeerConnection>>>,
    options: PoolOptions,
}

impl ConnectionPool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            options,
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Send `frame` to `addr` and wait for the response.
    pub fn forward(&self, addr: &str, frame: &Frame, cancel: &CancelToken) -> Result<Response> {
        let mut backoff = Backoff::new(self.options.backoff_base, self.options.backoff_max);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(CradleError::Timeout(format!("forward to {} cancelled", addr)));
            }

            let sent = self
                .checkout(addr)
                .and_then(|mut conn| conn.send(frame).map(|()| conn));
            let mut conn = match sent {
                Ok(conn) => conn,
                Err(e) if attempt < self.options.connect_attempts => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "Forward to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        addr,
                        attempt,
                        self.options.connect_attempts,
                        e,
                        delay
                    );
                    thread::sleep(delay);
                    continue;
                }
                Err(e) => {
                    return Err(CradleError::ConnectionFailure {
                        addr: addr.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
            };

            // Written: from here on the request is never resent
            return match conn.receive() {
                Ok(response) => {
                    self.checkin(addr, conn);
                    Ok(response)
                }
                Err(CradleError::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    Err(CradleError::Timeout(format!(
                        "no response from {} within {:?}",
                        addr, self.options.forward_timeout
                    )))
                }
                Err(e) => Err(CradleError::ConnectionFailure {
                    addr: addr.to_string(),
                    attempts: attempt,
                    reason: format!("lost after request was sent: {}", e),
                }),
            };
        }
    }

    fn checkout(&self, addr: &str) -> Result<PeerConnection> {
        loop {
            let pooled = self.idle.lock().get_mut(addr).and_then(Vec::pop);
            match pooled {
                Some(conn) if conn.is_alive() => return Ok(conn),
                Some(_) => {
                    tracing::debug!("Discarding stale connection to {}", addr);
                }
                None => break,
            }
        }
        tracing::debug!("Opening connection to {}", addr);
        PeerConnection::connect(addr, &self.options)
    }

    fn checkin(&self, addr: &str, conn: PeerConnection) {
        let mut idle = self.idle.lock();
        let conns = idle.entry(addr.to_string()).or_default();
        if conns.len() < self.options.max_idle_per_peer {
            conns.push(conn);
        }
    }

    /// Idle connections currently held for `addr`
    pub fn idle_count(&self, addr: &str) -> usize {
        self.idle.lock().get(addr).map_or(0, Vec::len)
    }

    /// Drop every idle connection
    pub fn clear(&self) {
        self.idle.lock().clear();
    }
}
