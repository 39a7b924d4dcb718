//! Checkpoint images: saving and loading the kernel object graph.
//!
//! An image is a small framed file: magic, version, a JSON metadata
//! header, the JSON-serialized kernel snapshot, and a SHA-256 digest
//! over the body (mixed with an optional caller key). Empty or
//! truncated files are rejected up front with a clear error.

use crate::kernel::Kernel;
use sandkern_protocol::ThreadId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    io::{Read, Write},
};
use thiserror::Error;

pub const STATE_MAGIC: &[u8; 8] = b"SNDKIMG\0";
pub const STATE_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("statefile is empty")]
    EmptyFile,

    #[error("not a checkpoint image (bad magic)")]
    BadMagic,

    #[error("checkpoint image version {found} is not supported (want {STATE_VERSION})")]
    BadVersion { found: u32 },

    #[error("checkpoint image integrity check failed")]
    DigestMismatch,

    #[error("malformed checkpoint image: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Options for a save.
#[derive(Default)]
pub struct SaveOpts {
    /// Mixed into the integrity digest; a restore must present the same
    /// key.
    pub key: Option<Vec<u8>>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct ProcessImage {
    pub container_id: String,
    pub pid: ThreadId,
    pub session: ThreadId,
    pub pgid: ThreadId,
    pub exited: bool,
    pub exit_status: Option<u32>,
}

/// The serialized kernel graph.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct KernelImage {
    pub container_ids: Vec<String>,
    pub processes: Vec<ProcessImage>,
    pub total_memory_bytes: u64,
}

#[derive(Debug, Deserialize, Serialize)]
struct ImageHeader {
    version: u32,
    metadata: HashMap<String, String>,
    keyed: bool,
}

impl KernelImage {
    /// Snapshots a paused kernel.
    pub fn capture(kernel: &Kernel) -> KernelImage {
        let mut container_ids = Vec::new();
        let mut processes = Vec::new();
        // Enumerate through the root namespace, the only view the
        // supervisor can name processes in.
        for row in all_processes(kernel) {
            processes.push(row);
        }
        for cid in kernel_container_ids(kernel) {
            container_ids.push(cid);
        }
        KernelImage {
            container_ids,
            processes,
            total_memory_bytes: kernel.memory_file().total_usage(),
        }
    }
}

fn kernel_container_ids(kernel: &Kernel) -> Vec<String> {
    let mut ids = kernel.container_ids();
    ids.sort();
    ids
}

fn all_processes(kernel: &Kernel) -> Vec<ProcessImage> {
    let mut rows = Vec::new();
    for cid in kernel.container_ids() {
        for info in kernel.processes(&cid) {
            let tg = kernel
                .container_init(&cid)
                .and_then(|tg| kernel.thread_group(tg));
            rows.push(ProcessImage {
                container_id: cid.clone(),
                pid: info.pid,
                session: tg.as_ref().map(|t| t.session()).unwrap_or(0),
                pgid: tg.as_ref().map(|t| t.pgid()).unwrap_or(0),
                exited: false,
                exit_status: None,
            });
        }
        if let Some(tg) = kernel
            .container_init(&cid)
            .and_then(|tg| kernel.thread_group(tg))
        {
            if let Some(status) = tg.exit_status() {
                rows.push(ProcessImage {
                    container_id: cid.clone(),
                    pid: 0,
                    session: 0,
                    pgid: 0,
                    exited: true,
                    exit_status: Some(status.0),
                });
            }
        }
    }
    rows
}

fn digest(body: &[u8], key: Option<&[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    if let Some(key) = key {
        hasher.update(key);
    }
    hasher.update(body);
    hasher.finalize().into()
}

/// Writes a checkpoint image of `image` to `sink`.
pub fn save<W: Write>(image: &KernelImage, opts: &SaveOpts, sink: &mut W) -> Result<(), StateError> {
    let header = ImageHeader {
        version: STATE_VERSION,
        metadata: opts.metadata.clone(),
        keyed: opts.key.is_some(),
    };
    let header_bytes = serde_json::to_vec(&header)?;
    let body = serde_json::to_vec(image)?;
    let digest = digest(&body, opts.key.as_deref());

    sink.write_all(STATE_MAGIC)?;
    sink.write_all(&STATE_VERSION.to_le_bytes())?;
    sink.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
    sink.write_all(&header_bytes)?;
    sink.write_all(&(body.len() as u32).to_le_bytes())?;
    sink.write_all(&body)?;
    sink.write_all(&digest)?;
    sink.flush()?;
    Ok(())
}

/// Reads a checkpoint image from `source`.
pub fn load<R: Read>(source: &mut R, key: Option<&[u8]>) -> Result<KernelImage, StateError> {
    let mut contents = Vec::new();
    source.read_to_end(&mut contents)?;
    if contents.is_empty() {
        return Err(StateError::EmptyFile);
    }
    if contents.len() < STATE_MAGIC.len() + 8 || &contents[..8] != STATE_MAGIC {
        return Err(StateError::BadMagic);
    }
    let mut cursor = 8usize;
    let read_u32 = |contents: &[u8], at: usize| -> Result<u32, StateError> {
        contents
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .ok_or(StateError::BadMagic)
    };
    let version = read_u32(&contents, cursor)?;
    if version != STATE_VERSION {
        return Err(StateError::BadVersion { found: version });
    }
    cursor += 4;
    let header_len = read_u32(&contents, cursor)? as usize;
    cursor += 4;
    let _header: ImageHeader = serde_json::from_slice(
        contents
            .get(cursor..cursor + header_len)
            .ok_or(StateError::BadMagic)?,
    )?;
    cursor += header_len;
    let body_len = read_u32(&contents, cursor)? as usize;
    cursor += 4;
    let body = contents
        .get(cursor..cursor + body_len)
        .ok_or(StateError::BadMagic)?;
    cursor += body_len;
    let stored: [u8; 32] = contents
        .get(cursor..cursor + 32)
        .ok_or(StateError::BadMagic)?
        .try_into()
        .unwrap();
    if digest(body, key) != stored {
        return Err(StateError::DigestMismatch);
    }
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> KernelImage {
        KernelImage {
            container_ids: vec!["root".into(), "sub".into()],
            processes: vec![ProcessImage {
                container_id: "root".into(),
                pid: 1,
                session: 1,
                pgid: 1,
                exited: false,
                exit_status: None,
            }],
            total_memory_bytes: 4096,
        }
    }

    #[test]
    fn roundtrip() {
        let mut buf = Vec::new();
        save(&sample_image(), &SaveOpts::default(), &mut buf).unwrap();
        let image = load(&mut &buf[..], None).unwrap();
        assert_eq!(image.container_ids, vec!["root", "sub"]);
        assert_eq!(image.processes.len(), 1);
    }

    #[test]
    fn empty_file_rejected() {
        let empty: &[u8] = &[];
        assert!(matches!(
            load(&mut &empty[..], None),
            Err(StateError::EmptyFile)
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let garbage = b"not an image at all";
        assert!(matches!(
            load(&mut &garbage[..], None),
            Err(StateError::BadMagic)
        ));
    }

    #[test]
    fn digest_covers_key() {
        let mut buf = Vec::new();
        let opts = SaveOpts {
            key: Some(b"secret".to_vec()),
            ..Default::default()
        };
        save(&sample_image(), &opts, &mut buf).unwrap();
        assert!(load(&mut &buf[..], Some(b"secret")).is_ok());
        assert!(matches!(
            load(&mut &buf[..], Some(b"wrong")),
            Err(StateError::DigestMismatch)
        ));
        assert!(matches!(
            load(&mut &buf[..], None),
            Err(StateError::DigestMismatch)
        ));
    }

    #[test]
    fn corrupted_body_detected() {
        let mut buf = Vec::new();
        save(&sample_image(), &SaveOpts::default(), &mut buf).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0xff;
        assert!(matches!(
            load(&mut &buf[..], None),
            Err(StateError::DigestMismatch) | Err(StateError::Malformed(_))
        ));
    }
}
