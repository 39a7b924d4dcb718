//! Multi-threaded RPC server: one handler object per method namespace,
//! one thread per connection, bounded drain on shutdown.

use crate::{
    buffer::{self, Request, Response},
    methods, ControlAddress,
};
use fd_queue::UnixStream;
use serde_json::Value;
use std::{
    collections::HashMap,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    os::unix::net::UnixListener,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown method {0:?}")]
    UnknownMethod(String),

    #[error("malformed method name {0:?}")]
    BadMethodName(String),

    #[error("decoding argument of {method}: {source}")]
    DecodeArgument {
        method: String,
        source: serde_json::Error,
    },

    #[error("{0}")]
    Handler(String),
}

/// The value + files a handler returns on success.
pub struct CallResult {
    pub result: Value,
    pub files: Vec<OwnedFd>,
}

impl CallResult {
    pub fn empty() -> CallResult {
        CallResult {
            result: Value::Null,
            files: Vec::new(),
        }
    }

    pub fn value<T: serde::Serialize>(value: &T) -> Result<CallResult, ServerError> {
        Ok(CallResult {
            result: serde_json::to_value(value)
                .map_err(|err| ServerError::Handler(err.to_string()))?,
            files: Vec::new(),
        })
    }
}

/// One registered method namespace (`containerManager`, `Lifecycle`, ...).
pub trait Handler: Send + Sync {
    fn namespace(&self) -> &'static str;

    /// Dispatches the bare method name. `files` is the frame's ordered
    /// descriptor payload.
    fn call(
        &self,
        method: &str,
        argument: Value,
        files: Vec<OwnedFd>,
    ) -> Result<CallResult, ServerError>;
}

/// Creates a listening socket at the given address, returning its FD.
/// Used by the supervisor, which then donates the FD to the sandbox.
pub fn create_socket(addr: &ControlAddress) -> Result<OwnedFd, std::io::Error> {
    match addr {
        ControlAddress::Path(path) => {
            // A stale socket file would make bind fail with EADDRINUSE.
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            let listener = UnixListener::bind(path)?;
            Ok(OwnedFd::from(listener))
        }
        ControlAddress::Abstract(name) => bind_abstract(name),
    }
}

fn bind_abstract(name: &str) -> Result<OwnedFd, std::io::Error> {
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
    for (i, b) in name_bytes.iter().enumerate() {
        addr.sun_path[i + 1] = *b as libc::c_char;
    }
    let len = (std::mem::size_of::<libc::sa_family_t>() + 1 + name_bytes.len())
        as libc::socklen_t;
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

/// Counts in-flight RPCs so `stop` can drain them.
struct Inflight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Inflight {
    fn begin(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .drained
                .wait_timeout(count, deadline - now)
                .unwrap();
            count = guard;
        }
        true
    }
}

/// The control server. Handlers are registered before `start_serving`;
/// the accept loop runs on its own thread.
pub struct Server {
    listener: UnixListener,
    handlers: Arc<HashMap<&'static str, Arc<dyn Handler>>>,
    stopping: Arc<AtomicBool>,
    inflight: Arc<Inflight>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl Server {
    /// Wraps an already-bound listening socket FD (donated by the
    /// supervisor). Takes ownership of the descriptor.
    pub fn from_fd(fd: RawFd) -> Result<Server, ServerError> {
        let listener = unsafe { UnixListener::from_raw_fd(fd) };
        Ok(Server {
            listener,
            handlers: Arc::new(HashMap::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            inflight: Arc::new(Inflight {
                count: Mutex::new(0),
                drained: Condvar::new(),
            }),
            accept_thread: None,
        })
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        let handlers = Arc::get_mut(&mut self.handlers)
            .expect("register must be called before start_serving");
        let namespace = handler.namespace();
        if handlers.insert(namespace, handler).is_some() {
            panic!("duplicate handler registered for namespace {namespace:?}");
        }
    }

    /// Starts accepting connections. Returns immediately.
    pub fn start_serving(&mut self) -> Result<(), ServerError> {
        let listener = self.listener.try_clone()?;
        let handlers = Arc::clone(&self.handlers);
        let stopping = Arc::clone(&self.stopping);
        let inflight = Arc::clone(&self.inflight);
        self.accept_thread = Some(thread::spawn(move || loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if stopping.load(Ordering::Acquire) {
                        break;
                    }
                    let handlers = Arc::clone(&handlers);
                    let stopping = Arc::clone(&stopping);
                    let inflight = Arc::clone(&inflight);
                    thread::spawn(move || {
                        serve_connection(UnixStream::from(stream), handlers, stopping, inflight)
                    });
                }
                Err(err) => {
                    if !stopping.load(Ordering::Acquire) {
                        log::warn!("control server accept failed: {}", err);
                    }
                    break;
                }
            }
        }));
        Ok(())
    }

    /// Stops accepting new calls and waits up to `timeout` for in-flight
    /// ones to finish; anything still running after that is abandoned.
    pub fn stop(&mut self, timeout: Duration) {
        self.stopping.store(true, Ordering::Release);
        // Shut the listener down so accept() returns.
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        if !self.inflight.wait_drained(timeout) {
            log::warn!(
                "control server stopped with RPCs still outstanding after {:?}",
                timeout
            );
        }
    }
}

fn serve_connection(
    mut stream: UnixStream,
    handlers: Arc<HashMap<&'static str, Arc<dyn Handler>>>,
    stopping: Arc<AtomicBool>,
    inflight: Arc<Inflight>,
) {
    loop {
        let (request, files) = match buffer::read_request(&mut stream) {
            Ok(frame) => frame,
            Err(buffer::Error::Disconnected) => return,
            Err(err) => {
                log::warn!("control connection error: {}", err);
                return;
            }
        };
        if stopping.load(Ordering::Acquire) {
            return;
        }
        inflight.begin();
        let outcome = dispatch(&handlers, request, files);
        let (response, files) = match outcome {
            Ok(call) => (
                Response {
                    result: Some(call.result),
                    error: None,
                },
                call.files,
            ),
            Err(err) => (
                Response {
                    result: None,
                    error: Some(err.to_string()),
                },
                Vec::new(),
            ),
        };
        let write_result = buffer::write_response(&mut stream, &response, &files);
        inflight.end();
        if let Err(err) = write_result {
            log::warn!("control response write failed: {}", err);
            return;
        }
    }
}

fn dispatch(
    handlers: &HashMap<&'static str, Arc<dyn Handler>>,
    request: Request,
    files: Vec<OwnedFd>,
) -> Result<CallResult, ServerError> {
    let (namespace, method) = methods::split(&request.method)
        .ok_or_else(|| ServerError::BadMethodName(request.method.clone()))?;
    let handler = handlers
        .get(namespace)
        .ok_or_else(|| ServerError::UnknownMethod(request.method.clone()))?;
    log::debug!("control dispatch: {}", request.method);
    handler.call(method, request.argument, files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;

    struct Echo;

    impl Handler for Echo {
        fn namespace(&self) -> &'static str {
            "echo"
        }

        fn call(
            &self,
            method: &str,
            argument: Value,
            _files: Vec<OwnedFd>,
        ) -> Result<CallResult, ServerError> {
            match method {
                "Reflect" => Ok(CallResult {
                    result: argument,
                    files: Vec::new(),
                }),
                "Fail" => Err(ServerError::Handler("requested failure".into())),
                other => Err(ServerError::UnknownMethod(format!("echo.{other}"))),
            }
        }
    }

    fn start_test_server(dir: &std::path::Path) -> (Server, ControlAddress) {
        let addr = ControlAddress::Path(dir.join("test.sock"));
        let fd = create_socket(&addr).unwrap();
        unsafe {
            assert_eq!(libc::listen(fd.as_raw_fd(), 16), 0);
        }
        let mut server = Server::from_fd(std::os::fd::IntoRawFd::into_raw_fd(fd)).unwrap();
        server.register(Arc::new(Echo));
        server.start_serving().unwrap();
        (server, addr)
    }

    #[test]
    fn roundtrip_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, addr) = start_test_server(dir.path());

        let mut client = Client::connect(&addr).unwrap();
        let out: String = client
            .call("echo.Reflect", &"ping".to_string(), &[] as &[std::fs::File])
            .unwrap();
        assert_eq!(out, "ping");

        let err = client
            .call::<_, Value, std::fs::File>("echo.Fail", &Value::Null, &[])
            .unwrap_err();
        assert!(err.to_string().contains("requested failure"));

        let err = client
            .call::<_, Value, std::fs::File>("nosuch.Method", &Value::Null, &[])
            .unwrap_err();
        assert!(err.to_string().contains("unknown method"));

        server.stop(Duration::from_secs(1));
    }
}
