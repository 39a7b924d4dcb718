use crate::types::*;
use std::collections::HashMap;

/// Arguments to containerManager.CreateSubcontainer. A TTY file may ride
/// along as the only donated descriptor.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CreateArgs {
    pub cid: ContainerId,
}

/// Arguments to containerManager.StartSubcontainer.
///
/// The donated descriptors arrive in this order: stdin/stdout/stderr
/// (absent when a terminal is used), then `num_overlay_filestore_fds`
/// overlay backing files, then the gofer connection FDs.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StartArgs {
    pub cid: ContainerId,
    /// The container process to run: argv, env, cwd, terminal flag.
    pub process: ProcessSpec,
    pub num_overlay_filestore_fds: usize,
    pub num_gofer_fds: usize,
}

/// The subset of an OCI process description the sentry needs to spawn an
/// application process.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub terminal: bool,
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
}

/// Arguments to containerManager.ExecuteAsync.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecArgs {
    pub container_id: ContainerId,
    pub process: ProcessSpec,
    /// FD numbers the donated files should occupy in the new process.
    pub guest_fds: Vec<i32>,
}

/// Arguments to containerManager.Signal.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignalArgs {
    pub cid: ContainerId,
    pub signo: i32,
    /// PID relative to the root PID namespace; 0 addresses the container
    /// init.
    pub pid: ThreadId,
    pub mode: SignalDeliveryMode,
}

/// Arguments to containerManager.WaitPID.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaitPidArgs {
    pub pid: ThreadId,
    pub cid: ContainerId,
}

/// Arguments to containerManager.Restore. The donated descriptors are the
/// state file, optionally followed by the platform device file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RestoreOpts {
    pub sandbox_id: String,
}

/// Arguments to containerManager.Checkpoint. The single donated descriptor
/// is the destination state file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SaveOpts {
    /// Optional key mixed into the image integrity digest.
    pub key: Option<Vec<u8>>,
    /// Extra metadata stored in the image envelope.
    pub metadata: HashMap<String, String>,
}

/// Arguments to containerManager.PortForward. The single donated
/// descriptor is the local endpoint to splice with the container port.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PortForwardOpts {
    pub container_id: ContainerId,
    pub port: u16,
}

/// One process row returned by containerManager.Processes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProcessInfo {
    pub uid: u32,
    pub pid: ThreadId,
    pub ppid: ThreadId,
    pub threads: Vec<ThreadId>,
    pub stime: String,
    pub time: String,
    pub cmd: String,
}

/// Event payload returned by containerManager.Event.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EventOut {
    pub event: Event,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Event {
    pub id: ContainerId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventStats,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EventStats {
    pub memory_total_bytes: u64,
    pub memory_mapped_bytes: u64,
    pub pids_current: u64,
}

/// Arguments to Usage.Collect.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MemoryUsageOpts {
    /// When set, update expensive stats before returning.
    pub full: bool,
}

/// Result of Usage.Collect, broken down by allocation kind.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MemoryUsage {
    pub system: u64,
    pub anonymous: u64,
    pub page_cache: u64,
    pub tmpfs: u64,
    pub mapped: u64,
    pub ramdiskfs: u64,
    pub total: u64,
}

/// Arguments to Usage.UsageFD.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MemoryUsageFileOpts {
    pub version: u64,
}

/// Arguments to Logging.Change.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingArgs {
    pub set_level: bool,
    pub level: LogLevel,
}

/// Arguments to the profile collectors. The single donated descriptor is
/// the output file; duration/delay is in seconds.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProfileOpts {
    pub duration_secs: u64,
}

/// A named seccheck trace session configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionConfig {
    pub name: String,
    pub points: Vec<String>,
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SinkConfig {
    pub name: String,
    /// Index into the donated FD list, when the sink writes to a file.
    pub fd_index: Option<usize>,
}

/// Arguments to containerManager.CreateTraceSession.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CreateTraceSessionArgs {
    pub config: SessionConfig,
    pub force: bool,
}

/// A single cgroupfs control file inside the sandbox.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CgroupControlFile {
    pub controller: String,
    pub path: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CgroupsReadArgs {
    pub args: Vec<CgroupControlFile>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CgroupsWriteArg {
    pub file: CgroupControlFile,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CgroupsWriteArgs {
    pub args: Vec<CgroupsWriteArg>,
}

/// Per-file outcome for cgroup reads and writes: the value read, or the
/// failing operation's description.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CgroupsResult {
    pub value: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CgroupsResults {
    pub results: Vec<CgroupsResult>,
}

/// Registration snapshot returned by Metrics.GetRegisteredMetrics. The
/// supervisor captures this right after boot, before any container task
/// exists, and validates later exports against it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MetricRegistration {
    pub metric_names: Vec<String>,
    pub stage: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricsExportOpts {
    /// Only export metrics matching this prefix filter, if set.
    pub only_metrics: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricsExportData {
    pub snapshot: HashMap<String, u64>,
}
