//! Names of every method exposed by the sandbox control server.

/// containerManager.Checkpoint checkpoints a container.
pub const CONT_MGR_CHECKPOINT: &str = "containerManager.Checkpoint";

/// containerManager.CreateSubcontainer creates a sub-container.
pub const CONT_MGR_CREATE_SUBCONTAINER: &str = "containerManager.CreateSubcontainer";

/// containerManager.DestroySubcontainer stops a sub-container and frees all
/// associated resources in the sandbox.
pub const CONT_MGR_DESTROY_SUBCONTAINER: &str = "containerManager.DestroySubcontainer";

/// containerManager.Event gets stats about the container.
pub const CONT_MGR_EVENT: &str = "containerManager.Event";

/// containerManager.ExecuteAsync executes a command in a container.
pub const CONT_MGR_EXECUTE_ASYNC: &str = "containerManager.ExecuteAsync";

/// containerManager.PortForward starts port forwarding with the sandbox.
pub const CONT_MGR_PORT_FORWARD: &str = "containerManager.PortForward";

/// containerManager.Processes lists processes running in a container.
pub const CONT_MGR_PROCESSES: &str = "containerManager.Processes";

/// containerManager.Restore restores a container from a statefile.
pub const CONT_MGR_RESTORE: &str = "containerManager.Restore";

/// containerManager.Signal sends a signal to a container.
pub const CONT_MGR_SIGNAL: &str = "containerManager.Signal";

/// containerManager.StartSubcontainer starts a sub-container inside a
/// running sandbox.
pub const CONT_MGR_START_SUBCONTAINER: &str = "containerManager.StartSubcontainer";

/// containerManager.Wait waits on the init process of the container and
/// returns its wait status.
pub const CONT_MGR_WAIT: &str = "containerManager.Wait";

/// containerManager.WaitPID waits on a process with a certain PID in the
/// sandbox and returns its wait status.
pub const CONT_MGR_WAIT_PID: &str = "containerManager.WaitPID";

/// containerManager.StartRoot starts the root container.
pub const CONT_MGR_START_ROOT: &str = "containerManager.StartRoot";

/// containerManager.CreateTraceSession starts a trace session.
pub const CONT_MGR_CREATE_TRACE_SESSION: &str = "containerManager.CreateTraceSession";

/// containerManager.DeleteTraceSession deletes a trace session.
pub const CONT_MGR_DELETE_TRACE_SESSION: &str = "containerManager.DeleteTraceSession";

/// containerManager.ListTraceSessions lists trace sessions.
pub const CONT_MGR_LIST_TRACE_SESSIONS: &str = "containerManager.ListTraceSessions";

/// containerManager.ProcfsDump dumps sandbox procfs state.
pub const CONT_MGR_PROCFS_DUMP: &str = "containerManager.ProcfsDump";

/// debug.Stacks collects sandbox stacks for debugging.
pub const DEBUG_STACKS: &str = "debug.Stacks";

pub const PROFILE_CPU: &str = "Profile.CPU";
pub const PROFILE_HEAP: &str = "Profile.Heap";
pub const PROFILE_BLOCK: &str = "Profile.Block";
pub const PROFILE_MUTEX: &str = "Profile.Mutex";
pub const PROFILE_TRACE: &str = "Profile.Trace";

pub const LOGGING_CHANGE: &str = "Logging.Change";

pub const LIFECYCLE_PAUSE: &str = "Lifecycle.Pause";
pub const LIFECYCLE_RESUME: &str = "Lifecycle.Resume";

pub const USAGE_COLLECT: &str = "Usage.Collect";
pub const USAGE_USAGE_FD: &str = "Usage.UsageFD";

pub const METRICS_GET_REGISTERED: &str = "Metrics.GetRegisteredMetrics";
pub const METRICS_EXPORT: &str = "Metrics.Export";

pub const CGROUPS_READ_CONTROL_FILES: &str = "Cgroups.ReadControlFiles";
pub const CGROUPS_WRITE_CONTROL_FILES: &str = "Cgroups.WriteControlFiles";

/// Splits a dotted method name into its namespace and bare method.
pub fn split(method: &str) -> Option<(&str, &str)> {
    let (ns, name) = method.split_once('.')?;
    if ns.is_empty() || name.is_empty() {
        return None;
    }
    Some((ns, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_dotted() {
        assert_eq!(
            split(CONT_MGR_START_ROOT),
            Some(("containerManager", "StartRoot"))
        );
        assert_eq!(split(LIFECYCLE_PAUSE), Some(("Lifecycle", "Pause")));
        assert_eq!(split("nodot"), None);
        assert_eq!(split(".StartRoot"), None);
        assert_eq!(split("Lifecycle."), None);
    }
}
