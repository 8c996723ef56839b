//! Blocking client
//!
//! Speaks the framed protocol to one host. Used by the CLI, by peers
//! fetching each other's directory, and by tests.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{CradleError, Result};
use crate::keyspace::{Directory, KeyRange};
use crate::protocol::{
    read_response, write_frame, AdminCommand, Frame, ListFilter, Payload, Request, Response,
};
use crate::storage::Record;

/// Synchronous connection to a CradleKV host
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    addr: String,
}

impl Client {
    pub fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_timeout(addr, Duration::from_secs(10))
    }

    pub fn connect_with_timeout(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(|e| CradleError::ConnectionFailure {
            addr: addr.to_string(),
            attempts: 1,
            reason: e.to_string(),
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let read_stream = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
            addr: addr.to_string(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one frame and read its response, whatever the status
    pub fn call(&mut self, frame: &Frame) -> Result<Response> {
        write_frame(&mut self.writer, frame)?;
        read_response(&mut self.reader)
    }

    pub fn request(&mut self, request: Request) -> Result<Response> {
        self.call(&Frame::Request(request))
    }

    /// `Ok(None)` when the key does not exist
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.request(Request::get(key))?.into_result() {
            Ok(Some(Payload::Value(value))) => Ok(Some(value)),
            Ok(other) => Err(unexpected("GET", other)),
            Err(CradleError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.request(Request::put(key, value))?.into_result()?;
        Ok(())
    }

    /// One LIST round trip: records plus the key to continue from
    pub fn list_page(&mut self, start: &[u8], filter: ListFilter) -> Result<(Vec<Record>, Option<Vec<u8>>)> {
        match self.request(Request::list(start, filter))?.into_result()? {
            Some(Payload::Records { records, resume }) => Ok((records, resume)),
            other => Err(unexpected("LIST", other)),
        }
    }

    /// Follow `resume` keys across routers until the listing is complete
    /// or `filter.limit` records have been collected.
    pub fn list(&mut self, start: &[u8], filter: ListFilter) -> Result<Vec<Record>> {
        let mut all = Vec::new();
        let mut next = Some(start.to_vec());
        while let Some(start) = next.take() {
            let mut page_filter = filter.clone();
            if let Some(limit) = filter.limit {
                let left = limit as usize - all.len();
                page_filter.limit = Some(left as u32);
            }
            let (records, resume) = self.list_page(&start, page_filter)?;
            all.extend(records);
            let limit_reached = filter.limit.map_or(false, |limit| all.len() >= limit as usize);
            if !limit_reached {
                next = resume;
            }
        }
        Ok(all)
    }

    pub fn ping(&mut self) -> Result<String> {
        match self.call(&Frame::Ping)?.into_result()? {
            Some(Payload::Message(text)) => Ok(text),
            other => Err(unexpected("PING", other)),
        }
    }

    pub fn directory(&mut self) -> Result<Directory> {
        match self.call(&Frame::Directory)?.into_result()? {
            Some(Payload::Directory(directory)) => Ok(directory),
            other => Err(unexpected("DIRECTORY", other)),
        }
    }

    /// Run an admin command; returns the host's confirmation text
    pub fn admin(&mut self, command: AdminCommand) -> Result<String> {
        match self.call(&Frame::Admin(command))?.into_result()? {
            Some(Payload::Message(text)) => Ok(text),
            None => Ok(String::new()),
            other => Err(unexpected("ADMIN", other)),
        }
    }

    pub fn create_node(&mut self, name: &str, range: KeyRange) -> Result<String> {
        self.admin(AdminCommand::CreateNode {
            name: name.to_string(),
            range,
        })
    }

    pub fn split_node(&mut self, name: &str, boundary: &[u8]) -> Result<String> {
        self.admin(AdminCommand::Split {
            name: name.to_string(),
            boundary: boundary.to_vec(),
        })
    }
}

fn unexpected(what: &str, payload: Option<Payload>) -> CradleError {
    CradleError::Protocol(format!("unexpected {} payload: {:?}", what, payload))
}
