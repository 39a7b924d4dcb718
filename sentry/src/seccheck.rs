//! Trace point / sink plumbing for in-sentry security checks.
//!
//! A session is a named set of enabled points wired to sinks. Sessions are
//! process-wide state behind their own mutex; the registry must be
//! populated before the host seccomp filter is installed, since sinks may
//! need to open host resources.

use sandkern_protocol::{SessionConfig, SinkConfig};
use std::{
    collections::HashMap,
    fmt,
    os::fd::OwnedFd,
    sync::{Arc, Mutex},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeccheckError {
    #[error("session {0:?} already exists")]
    SessionExists(String),

    #[error("session {0:?} not found")]
    SessionNotFound(String),

    #[error("unknown trace point {0:?}")]
    UnknownPoint(String),

    #[error("sink {name:?} requires a donated file")]
    SinkMissingFile { name: String },
}

/// Every point the sentry can emit. Points are cheap to test when no
/// session subscribes to them.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Point {
    ContainerStart,
    TaskExit,
    ExecveEnter,
    CloneEnter,
    UnimplementedSyscall,
    SignalDeliver,
}

impl Point {
    pub fn parse(name: &str) -> Option<Point> {
        Some(match name {
            "container/start" => Point::ContainerStart,
            "sentry/task_exit" => Point::TaskExit,
            "syscall/execve/enter" => Point::ExecveEnter,
            "syscall/clone/enter" => Point::CloneEnter,
            "sentry/unimplemented_syscall" => Point::UnimplementedSyscall,
            "sentry/signal_deliver" => Point::SignalDeliver,
            _ => return None,
        })
    }
}

/// A sink consumes emitted events. The only built-in sink writes JSON
/// lines to a donated descriptor.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    fn emit(&self, point: Point, payload: &serde_json::Value);
}

struct FdSink {
    name: String,
    file: Mutex<std::fs::File>,
}

impl Sink for FdSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn emit(&self, point: Point, payload: &serde_json::Value) {
        use std::io::Write;
        let line = serde_json::json!({
            "point": format!("{:?}", point),
            "payload": payload,
        });
        let mut file = self.file.lock().unwrap();
        if let Err(err) = writeln!(file, "{}", line) {
            log::warn!("seccheck sink {:?} write failed: {}", self.name, err);
        }
    }
}

struct Session {
    config: SessionConfig,
    points: Vec<Point>,
    sinks: Vec<Arc<dyn Sink>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.config.name)
            .field("points", &self.points)
            .finish()
    }
}

/// The process-wide session registry.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, Session>>,
}

lazy_static! {
    static ref GLOBAL: Registry = Registry::default();
}

/// The global registry used by kernel emit sites.
pub fn global() -> &'static Registry {
    &GLOBAL
}

impl Registry {
    /// Creates a session from its wire configuration. `force` replaces an
    /// existing session of the same name. `files` are the donated sink
    /// descriptors, indexed by `SinkConfig::fd_index`.
    pub fn create(
        &self,
        config: &SessionConfig,
        force: bool,
        mut files: Vec<Option<OwnedFd>>,
    ) -> Result<(), SeccheckError> {
        let mut points = Vec::with_capacity(config.points.len());
        for name in &config.points {
            points.push(Point::parse(name).ok_or_else(|| SeccheckError::UnknownPoint(name.clone()))?);
        }

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(config.sinks.len());
        for sink in &config.sinks {
            sinks.push(build_sink(sink, &mut files)?);
        }

        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&config.name) {
            if !force {
                return Err(SeccheckError::SessionExists(config.name.clone()));
            }
            sessions.remove(&config.name);
        }
        log::info!(
            "seccheck session {:?} created with {} points, {} sinks",
            config.name,
            points.len(),
            sinks.len()
        );
        sessions.insert(
            config.name.clone(),
            Session {
                config: config.clone(),
                points,
                sinks,
            },
        );
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), SeccheckError> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SeccheckError::SessionNotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<SessionConfig> {
        let sessions = self.sessions.lock().unwrap();
        sessions.values().map(|s| s.config.clone()).collect()
    }

    /// True when at least one session subscribes to `point`; emit sites
    /// test this before building payloads.
    pub fn enabled(&self, point: Point) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions.values().any(|s| s.points.contains(&point))
    }

    pub fn emit(&self, point: Point, payload: serde_json::Value) {
        let sessions = self.sessions.lock().unwrap();
        for session in sessions.values() {
            if session.points.contains(&point) {
                for sink in &session.sinks {
                    sink.emit(point, &payload);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn clear_for_test(&self) {
        self.sessions.lock().unwrap().clear();
    }
}

fn build_sink(
    config: &SinkConfig,
    files: &mut [Option<OwnedFd>],
) -> Result<Arc<dyn Sink>, SeccheckError> {
    let fd_index = config.fd_index.ok_or_else(|| SeccheckError::SinkMissingFile {
        name: config.name.clone(),
    })?;
    let file = files
        .get_mut(fd_index)
        .and_then(|slot| slot.take())
        .ok_or_else(|| SeccheckError::SinkMissingFile {
            name: config.name.clone(),
        })?;
    Ok(Arc::new(FdSink {
        name: config.name.clone(),
        file: Mutex::new(std::fs::File::from(file)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek};

    fn config(name: &str, points: &[&str]) -> SessionConfig {
        SessionConfig {
            name: name.into(),
            points: points.iter().map(|p| p.to_string()).collect(),
            sinks: vec![SinkConfig {
                name: "file".into(),
                fd_index: Some(0),
            }],
        }
    }

    #[test]
    fn create_emit_delete() {
        let registry = Registry::default();
        let mut sink_file = tempfile::tempfile().unwrap();
        let reader = sink_file.try_clone().unwrap();
        let files = vec![Some(OwnedFd::from(sink_file.try_clone().unwrap()))];

        registry
            .create(&config("s1", &["sentry/task_exit"]), false, files)
            .unwrap();
        assert!(registry.enabled(Point::TaskExit));
        assert!(!registry.enabled(Point::ExecveEnter));

        registry.emit(Point::TaskExit, serde_json::json!({"tid": 7}));

        let mut reader = reader;
        reader.rewind().unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert!(out.contains("TaskExit"));
        drop(sink_file);

        registry.delete("s1").unwrap();
        assert!(!registry.enabled(Point::TaskExit));
        assert!(matches!(
            registry.delete("s1"),
            Err(SeccheckError::SessionNotFound(_))
        ));
    }

    #[test]
    fn duplicate_requires_force() {
        let registry = Registry::default();
        let mk_files = || vec![Some(OwnedFd::from(tempfile::tempfile().unwrap()))];
        registry
            .create(&config("dup", &["container/start"]), false, mk_files())
            .unwrap();
        assert!(matches!(
            registry.create(&config("dup", &["container/start"]), false, mk_files()),
            Err(SeccheckError::SessionExists(_))
        ));
        registry
            .create(&config("dup", &["sentry/task_exit"]), true, mk_files())
            .unwrap();
        assert!(registry.enabled(Point::TaskExit));
    }

    #[test]
    fn unknown_point_rejected() {
        let registry = Registry::default();
        let files = vec![Some(OwnedFd::from(tempfile::tempfile().unwrap()))];
        assert!(matches!(
            registry.create(&config("bad", &["nope"]), false, files),
            Err(SeccheckError::UnknownPoint(_))
        ));
    }
}
