//! Connection Handler
//!
//! Handles one inbound connection from a client or a peer host.

use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::RecvTimeoutError;

use crate::error::{CradleError, Result};
use crate::protocol::{read_frame, write_response, Frame, Request, Response};
use crate::router::{CancelToken, Envelope};

use super::ConnectionManager;

/// How often a waiting connection checks whether its peer went away
const PEER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handles a single inbound connection
pub struct Connection {
    /// TCP stream reader (buffered for efficiency)
    reader: BufReader<TcpStream>,

    /// TCP stream writer (buffered for efficiency)
    writer: BufWriter<TcpStream>,

    manager: Arc<ConnectionManager>,

    /// Peer address for logging
    peer_addr: String,

    request_timeout: Duration,
}

impl Connection {
    /// Create a new connection handler
    ///
    /// Sets up buffered I/O; timeouts are applied by [`Connection::set_timeouts`]
    pub fn new(stream: TcpStream, manager: Arc<ConnectionManager>) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        let read_stream = stream.try_clone()?;
        let request_timeout = manager.config().request_timeout();

        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
            manager,
            peer_addr,
            request_timeout,
        })
    }

    /// Configure connection timeouts
    pub fn set_timeouts(&mut self, read_ms: u64, write_ms: u64) -> Result<()> {
        if read_ms > 0 {
            self.reader
                .get_ref()
                .set_read_timeout(Some(Duration::from_millis(read_ms)))?;
        }
        if write_ms > 0 {
            self.writer
                .get_ref()
                .set_write_timeout(Some(Duration::from_millis(write_ms)))?;
        }
        Ok(())
    }

    /// Handle the connection (blocking until closed)
    ///
    /// Reads frames in a loop and sends one response per frame.
    pub fn handle(&mut self) -> Result<()> {
        tracing::debug!("Connection established from {}", self.peer_addr);

        loop {
            let frame = match read_frame(&mut self.reader) {
                Ok(frame) => frame,
                Err(CradleError::Io(ref e)) if is_disconnect(e.kind()) => {
                    tracing::debug!("Peer {} disconnected", self.peer_addr);
                    return Ok(());
                }
                Err(CradleError::Io(ref e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    tracing::debug!("Idle timeout for {}", self.peer_addr);
                    return Ok(());
                }
                Err(e @ CradleError::MalformedRequest(_)) => {
                    // The frame was fully read; the stream is still in sync
                    tracing::debug!("Malformed frame from {}: {}", self.peer_addr, e);
                    self.send_response(Response::from_error(&e))?;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Error reading from {}: {}", self.peer_addr, e);
                    let _ = self.send_response(Response::from_error(&e));
                    return Err(e);
                }
            };

            tracing::trace!("Received {:?} frame from {}", frame.kind(), self.peer_addr);

            let response = self.execute(frame);

            if let Err(e) = self.send_response(response) {
                if let CradleError::Io(ref io_err) = e {
                    if is_disconnect(io_err.kind()) || io_err.kind() == ErrorKind::BrokenPipe {
                        tracing::debug!(
                            "Peer {} disconnected before response could be sent: {}",
                            self.peer_addr,
                            e
                        );
                        return Ok(());
                    }
                }
                tracing::warn!("Error writing to {}: {}", self.peer_addr, e);
                return Err(e);
            }
        }
    }

    fn execute(&self, frame: Frame) -> Response {
        match frame {
            Frame::Request(request) => self.await_reply(request),
            Frame::Admin(command) => self.manager.execute_admin(command),
            Frame::Directory => self.manager.directory_response(),
            Frame::Ping => Response::message("PONG"),
        }
    }

    /// Queue the request for routing and wait for its single reply.
    ///
    /// The cancel token fires when the deadline passes or the peer hangs up,
    /// which stops a forward that is still retrying.
    fn await_reply(&self, request: Request) -> Response {
        let cancel = CancelToken::new();
        let (envelope, reply) = Envelope::with_cancel(request, cancel.clone());
        self.manager.dispatch(envelope);

        let deadline = Instant::now() + self.request_timeout;
        loop {
            match reply.recv_timeout(PEER_POLL_INTERVAL) {
                Ok(response) => return response,
                Err(RecvTimeoutError::Disconnected) => {
                    return Response::error("request dropped without a reply");
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            if self.peer_gone() {
                cancel.cancel();
                return Response::from_error(&CradleError::Timeout(format!(
                    "peer {} went away",
                    self.peer_addr
                )));
            }
            if Instant::now() >= deadline {
                cancel.cancel();
                return Response::from_error(&CradleError::Timeout(format!(
                    "no reply within {:?}",
                    self.request_timeout
                )));
            }
        }
    }

    fn peer_gone(&self) -> bool {
        let stream = self.reader.get_ref();
        if stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut byte = [0u8; 1];
        let gone = match stream.peek(&mut byte) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => e.kind() != ErrorKind::WouldBlock,
        };
        let _ = stream.set_nonblocking(false);
        gone
    }

    fn send_response(&mut self, response: Response) -> Result<()> {
        write_response(&mut self.writer, &response)
    }

    /// Get the peer address string
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}

fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}
