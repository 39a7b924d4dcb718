//! The sentry-facing filesystem broker contract.
//!
//! The broker ("gofer") runs outside the sandbox and owns the host
//! filesystem; the sentry reaches it over the donated `io-fds`
//! connections. Only the contract lives here: the message shapes and
//! the handshake. The broker's transport internals are a separate
//! program.

/// Protocol version negotiated at mount time; mismatches are fatal.
pub const GOFER_PROTOCOL_VERSION: u32 = 1;

/// The first frame on every gofer connection.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct GoferHandshake {
    pub version: u32,
    /// Whether the connection may create host Unix sockets, per the
    /// host-uds mode.
    pub allow_socket_create: bool,
    /// Read-only connections refuse every mutating request.
    pub read_only: bool,
}

/// Requests the sentry may issue. File identity is a connection-scoped
/// integer id minted by Walk; donated descriptors ride alongside Open
/// responses.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum GoferRequest {
    /// Resolve path components relative to a known file id.
    Walk { from: u64, names: Vec<String> },
    /// Open a walked file; the reply donates a host descriptor.
    Open { file: u64, flags: u32 },
    Stat { file: u64 },
    Create { dir: u64, name: String, mode: u32 },
    Mkdir { dir: u64, name: String, mode: u32 },
    Unlink { dir: u64, name: String },
    Rename { dir: u64, name: String, new_dir: u64, new_name: String },
    Symlink { dir: u64, name: String, target: String },
    ReadLink { file: u64 },
    SetAttr { file: u64, mode: Option<u32>, uid: Option<u32>, gid: Option<u32>, size: Option<u64> },
    /// Drop a file id.
    Close { file: u64 },
}

/// Replies, in request order. `Errno` carries the failing operation's
/// host errno.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum GoferResponse {
    Walked { files: Vec<u64> },
    /// The donated descriptor index accompanies the frame.
    Opened { file: u64, fd_index: usize },
    Stat {
        mode: u32,
        uid: u32,
        gid: u32,
        size: u64,
        mtime: i64,
    },
    Created { file: u64, fd_index: usize },
    Link { target: String },
    Ok,
    Errno(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_shapes_serialize() {
        let request = GoferRequest::Walk {
            from: 1,
            names: vec!["etc".into(), "hosts".into()],
        };
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: GoferRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, request);

        let response = GoferResponse::Errno(libc::ENOENT);
        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: GoferResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, response);
    }
}
