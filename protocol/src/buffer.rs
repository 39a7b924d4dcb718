//! Frame codec: length-prefixed JSON bodies with an ordered file payload.
//!
//! Descriptors are enqueued on the socket ahead of the bytes they belong
//! to, so by the time a receiver has read a full frame body the kernel has
//! already delivered the matching SCM_RIGHTS payload.

use fd_queue::{DequeueFd, EnqueueFd};
use serde_json::Value;
use std::{
    io::{Read, Write},
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};
use thiserror::Error;

/// Frames larger than this are rejected rather than buffered.
pub const MAX_FRAME_BYTES: usize = 1 << 24;

/// Most descriptors a single frame may carry.
pub const MAX_FRAME_FILES: usize = 128;

const HEADER_BYTES: usize = 8;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge(usize),

    #[error("frame carries {0} files, limit is {MAX_FRAME_FILES}")]
    TooManyFiles(usize),

    #[error("file queue full error")]
    FileQueueFull(#[from] fd_queue::QueueFullError),

    #[error("peer closed the connection")]
    Disconnected,

    #[error("malformed frame body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame promised {expected} files but only {received} arrived")]
    MissingFiles { expected: usize, received: usize },
}

/// An RPC request envelope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Request {
    pub method: String,
    pub argument: Value,
}

/// An RPC response envelope. Exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Writes one frame: the file payload first, then the 8-byte header
/// (body length, file count, both little-endian u32), then the body.
pub fn write_frame<S, F>(stream: &mut S, body: &[u8], files: &[F]) -> Result<(), Error>
where
    S: Write + EnqueueFd,
    F: AsRawFd,
{
    if body.len() > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge(body.len()));
    }
    if files.len() > MAX_FRAME_FILES {
        return Err(Error::TooManyFiles(files.len()));
    }
    for file in files {
        stream.enqueue(file)?;
    }
    let mut header = [0u8; HEADER_BYTES];
    header[..4].copy_from_slice(&(body.len() as u32).to_le_bytes());
    header[4..].copy_from_slice(&(files.len() as u32).to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

/// Reads one frame, returning the body bytes and any received descriptors.
pub fn read_frame<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<OwnedFd>), Error>
where
    S: Read + DequeueFd,
{
    let mut header = [0u8; HEADER_BYTES];
    read_exact_or_disconnect(stream, &mut header)?;
    let body_len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
    let file_count = u32::from_le_bytes(header[4..].try_into().unwrap()) as usize;
    if body_len > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge(body_len));
    }
    if file_count > MAX_FRAME_FILES {
        return Err(Error::TooManyFiles(file_count));
    }

    let mut body = vec![0u8; body_len];
    read_exact_or_disconnect(stream, &mut body)?;

    let mut files = Vec::with_capacity(file_count);
    while files.len() < file_count {
        match stream.dequeue() {
            Some(raw) => files.push(unsafe { OwnedFd::from_raw_fd(raw) }),
            None => {
                return Err(Error::MissingFiles {
                    expected: file_count,
                    received: files.len(),
                })
            }
        }
    }
    Ok((body, files))
}

/// Serializes and writes a request frame.
pub fn write_request<S, F>(stream: &mut S, request: &Request, files: &[F]) -> Result<(), Error>
where
    S: Write + EnqueueFd,
    F: AsRawFd,
{
    let body = serde_json::to_vec(request)?;
    write_frame(stream, &body, files)
}

/// Reads and parses a request frame.
pub fn read_request<S>(stream: &mut S) -> Result<(Request, Vec<OwnedFd>), Error>
where
    S: Read + DequeueFd,
{
    let (body, files) = read_frame(stream)?;
    Ok((serde_json::from_slice(&body)?, files))
}

/// Serializes and writes a response frame.
pub fn write_response<S, F>(stream: &mut S, response: &Response, files: &[F]) -> Result<(), Error>
where
    S: Write + EnqueueFd,
    F: AsRawFd,
{
    let body = serde_json::to_vec(response)?;
    write_frame(stream, &body, files)
}

/// Reads and parses a response frame.
pub fn read_response<S>(stream: &mut S) -> Result<(Response, Vec<OwnedFd>), Error>
where
    S: Read + DequeueFd,
{
    let (body, files) = read_frame(stream)?;
    Ok((serde_json::from_slice(&body)?, files))
}

fn read_exact_or_disconnect<S: Read>(stream: &mut S, buf: &mut [u8]) -> Result<(), Error> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Disconnected),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fd_queue::UnixStream;
    use std::{fs::File, io::Seek};

    #[test]
    fn frame_roundtrip_no_files() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let request = Request {
            method: "Lifecycle.Pause".into(),
            argument: Value::Null,
        };
        write_request(&mut a, &request, &[] as &[File]).unwrap();
        let (received, files) = read_request(&mut b).unwrap();
        assert_eq!(received.method, "Lifecycle.Pause");
        assert!(files.is_empty());
    }

    #[test]
    fn frame_roundtrip_with_file() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let mut payload = tempfile::tempfile().unwrap();
        use std::io::Write as _;
        payload.write_all(b"checkpoint image").unwrap();
        payload.rewind().unwrap();

        let request = Request {
            method: "containerManager.Checkpoint".into(),
            argument: serde_json::json!({"key": null}),
        };
        write_request(&mut a, &request, &[payload]).unwrap();
        let (received, mut files) = read_request(&mut b).unwrap();
        assert_eq!(received.method, "containerManager.Checkpoint");
        assert_eq!(files.len(), 1);

        let mut contents = String::new();
        let mut file = File::from(files.pop().unwrap());
        use std::io::Read as _;
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "checkpoint image");
    }

    #[test]
    fn oversized_frame_rejected() {
        let (mut a, _b) = UnixStream::pair().unwrap();
        let body = vec![0u8; MAX_FRAME_BYTES + 1];
        match write_frame(&mut a, &body, &[] as &[File]) {
            Err(Error::FrameTooLarge(_)) => {}
            other => panic!("expected FrameTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn disconnect_reported() {
        let (a, mut b) = UnixStream::pair().unwrap();
        drop(a);
        match read_frame(&mut b) {
            Err(Error::Disconnected) => {}
            other => panic!("expected Disconnected, got {:?}", other.map(|_| ())),
        }
    }
}
