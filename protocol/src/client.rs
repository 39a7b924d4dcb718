//! Blocking RPC client for the sandbox control socket.

use crate::{
    buffer::{self, Request, Response},
    ControlAddress,
};
use fd_queue::UnixStream;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    os::unix::net::UnixStream as StdUnixStream,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] buffer::Error),

    #[error("encoding argument for {method}: {source}")]
    Encode {
        method: String,
        source: serde_json::Error,
    },

    #[error("decoding result of {method}: {source}")]
    Decode {
        method: String,
        source: serde_json::Error,
    },

    /// The error string produced by the remote method. Error types do not
    /// cross the RPC boundary, so callers match on substrings.
    #[error("{0}")]
    Remote(String),
}

/// A connection to a control server. One outstanding call at a time; the
/// supervisor opens a fresh connection per operation.
pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Connects to the control server at `addr`.
    pub fn connect(addr: &ControlAddress) -> Result<Client, ClientError> {
        let stream = match addr {
            ControlAddress::Path(path) => UnixStream::connect(path)?,
            ControlAddress::Abstract(name) => {
                UnixStream::from(connect_abstract(name)?)
            }
        };
        Ok(Client { stream })
    }

    /// Calls `method` with `arg`, donating `files`, and decodes the result.
    pub fn call<A, R, F>(&mut self, method: &str, arg: &A, files: &[F]) -> Result<R, ClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
        F: AsRawFd,
    {
        let (value, _files) = self.call_with_files(method, arg, files)?;
        serde_json::from_value(value).map_err(|source| ClientError::Decode {
            method: method.to_string(),
            source,
        })
    }

    /// Like `call`, but also returns descriptors the server sent back.
    pub fn call_with_files<A, F>(
        &mut self,
        method: &str,
        arg: &A,
        files: &[F],
    ) -> Result<(serde_json::Value, Vec<OwnedFd>), ClientError>
    where
        A: Serialize,
        F: AsRawFd,
    {
        let argument = serde_json::to_value(arg).map_err(|source| ClientError::Encode {
            method: method.to_string(),
            source,
        })?;
        let request = Request {
            method: method.to_string(),
            argument,
        };
        log::debug!("control call: {}", method);
        buffer::write_request(&mut self.stream, &request, files)?;

        let (response, files) = buffer::read_response(&mut self.stream)?;
        match response {
            Response {
                error: Some(message),
                ..
            } => Err(ClientError::Remote(message)),
            Response { result, .. } => {
                Ok((result.unwrap_or(serde_json::Value::Null), files))
            }
        }
    }
}

/// Connects to a socket in the abstract namespace. `std` only dials
/// filesystem paths, so this goes through the raw socket interface.
fn connect_abstract(name: &str) -> Result<StdUnixStream, std::io::Error> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let name_bytes = name.as_bytes();
    if name_bytes.len() + 1 > addr.sun_path.len() {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    }
    // sun_path[0] stays 0: that is what marks the address abstract.
    for (i, b) in name_bytes.iter().enumerate() {
        addr.sun_path[i + 1] = *b as libc::c_char;
    }
    let len = (std::mem::size_of::<libc::sa_family_t>() + 1 + name_bytes.len())
        as libc::socklen_t;
    let rc = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(StdUnixStream::from(fd))
}
