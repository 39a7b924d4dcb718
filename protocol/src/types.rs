use std::fmt;

/// A container ID. By convention the root container shares the sandbox ID.
pub type ContainerId = String;

/// A thread ID in a PID namespace, as seen by the application.
pub type ThreadId = i32;

/// Wait status in the Linux wait(2) bit layout: `exit << 8` for normal
/// exits, the signal number in the low byte for signalled deaths.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct WaitStatus(pub u32);

impl WaitStatus {
    pub fn from_exit_code(code: i32) -> Self {
        WaitStatus(((code as u32) & 0xff) << 8)
    }

    pub fn from_signal(signo: i32) -> Self {
        WaitStatus((signo as u32) & 0x7f)
    }

    pub fn exited(&self) -> bool {
        self.0 & 0x7f == 0
    }

    pub fn exit_status(&self) -> i32 {
        ((self.0 >> 8) & 0xff) as i32
    }

    pub fn signaled(&self) -> bool {
        !self.exited()
    }

    pub fn signal(&self) -> i32 {
        (self.0 & 0x7f) as i32
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.exited() {
            write!(f, "exit status {}", self.exit_status())
        } else {
            write!(f, "killed by signal {}", self.signal())
        }
    }
}

/// How a signal is routed into a container.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum SignalDeliveryMode {
    /// Deliver to the thread group with the given PID, or to the container
    /// init when PID is 0.
    ToProcess,
    /// Deliver to every thread group in the container. PID must be 0.
    ToAllProcesses,
    /// Deliver to the foreground process group of the TTY session the
    /// given process belongs to. Only valid for host-TTY processes.
    ToForegroundProcessGroup,
}

impl fmt::Display for SignalDeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignalDeliveryMode::ToProcess => write!(f, "Process"),
            SignalDeliveryMode::ToAllProcesses => write!(f, "All"),
            SignalDeliveryMode::ToForegroundProcessGroup => {
                write!(f, "Foreground Process Group")
            }
        }
    }
}

/// Where a control socket lives: a filesystem path, or a name in the
/// abstract socket namespace.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum ControlAddress {
    Path(std::path::PathBuf),
    Abstract(String),
}

impl ControlAddress {
    pub fn is_abstract(&self) -> bool {
        matches!(self, ControlAddress::Abstract(_))
    }
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ControlAddress::Path(p) => write!(f, "{}", p.display()),
            ControlAddress::Abstract(name) => write!(f, "@{}", name),
        }
    }
}

/// Log levels understood by the `Logging.Change` control method.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Deserialize, Serialize)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
