//! Supervisor-to-sentry control plane, end to end over a real socket.
//!
//! These tests run the sentry's controller in-process and drive it with
//! the supervisor's Sandbox client, exactly as a spawned sandbox would
//! be driven, minus the process and namespace setup.

use sandkern::sandbox::Sandbox;
use sandkern_protocol::{server::create_socket, ControlAddress, ExecArgs, ProcessSpec};
use sandkern_sentry::control::Controller;
use sandkern_sentry::loader::{Loader, LoaderArgs};
use std::{os::fd::IntoRawFd, path::Path, sync::Arc};

struct Harness {
    _dir: tempfile::TempDir,
    loader: Arc<Loader>,
    controller: Controller,
    sandbox: Sandbox,
}

fn start_harness(id: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let loader = Loader::new(LoaderArgs {
        sandbox_id: id.to_string(),
        platform_name: "sim".to_string(),
        ..Default::default()
    })
    .unwrap();

    let addr = ControlAddress::Path(dir.path().join(format!("sandkern-{id}.sock")));
    let fd = create_socket(&addr).unwrap();
    let mut controller = Controller::new(fd.into_raw_fd(), Arc::clone(&loader)).unwrap();
    controller.start_serving().unwrap();

    // The boot thread parks on the start gate until StartRoot arrives.
    {
        let loader = Arc::clone(&loader);
        std::thread::spawn(move || loader.run());
    }

    // A supervisor-side handle pointing at the live control socket; the
    // process fields never get set because nothing was spawned.
    let sandbox: Sandbox = serde_json::from_value(serde_json::json!({
        "id": id,
        "podName": "",
        "namespace": "",
        "pid": 0,
        "uid": 0,
        "gid": 0,
        "cgroup": null,
        "originalOomScoreAdj": 0,
        "registeredMetrics": null,
        "metricMetadata": {},
        "metricServerAddress": "",
        "control_address": {"Path": dir.path().join(format!("sandkern-{id}.sock"))},
        "mountHints": null,
    }))
    .unwrap();

    Harness {
        _dir: dir,
        loader,
        controller,
        sandbox,
    }
}

#[test]
fn start_root_then_wait_reports_exit() {
    let mut h = start_harness("root");
    h.sandbox.start_root().unwrap();
    assert!(h.loader.kernel().container_init("root").is_some());

    let status = h.sandbox.wait("root").unwrap();
    assert!(status.exited());
    assert_eq!(status.exit_status(), 0);
    h.controller.stop();
}

#[test]
fn second_start_root_is_refused() {
    let mut h = start_harness("dup");
    h.sandbox.start_root().unwrap();
    let err = h.sandbox.start_root().unwrap_err();
    assert!(err.to_string().contains("already started"), "{err}");
    h.controller.stop();
}

#[test]
fn exec_and_wait_pid_in_subcontainer() {
    let mut h = start_harness("pods");
    h.sandbox.start_root().unwrap();

    h.sandbox.create_subcontainer(&Default::default(), "sub", None).unwrap();
    h.sandbox
        .start_subcontainer(
            &sandkern_protocol::StartArgs {
                cid: "sub".into(),
                process: ProcessSpec {
                    terminal: true,
                    ..Default::default()
                },
                num_overlay_filestore_fds: 0,
                num_gofer_fds: 1,
            },
            vec![],
            vec![],
            vec![tempfile::tempfile().unwrap()],
        )
        .unwrap();

    let pid = h
        .sandbox
        .execute(&ExecArgs {
            container_id: "sub".into(),
            process: ProcessSpec {
                argv: vec!["/bin/echo".into(), "hi".into()],
                ..Default::default()
            },
            guest_fds: vec![],
        })
        .unwrap();
    assert!(pid > 1);

    let status = h.sandbox.wait_pid("sub", pid).unwrap();
    assert!(status.exited());
    assert_eq!(status.exit_status(), 0);
    h.controller.stop();
}

#[test]
fn signal_unknown_container_is_remote_error() {
    let mut h = start_harness("sigerr");
    h.sandbox.start_root().unwrap();
    let err = h.sandbox.signal_container("ghost", 15, false).unwrap_err();
    assert!(err.to_string().contains("ghost"), "{err}");
    h.controller.stop();
}

#[test]
fn cgroup_write_errors_name_the_operation() {
    let mut h = start_harness("cg");
    h.sandbox.start_root().unwrap();

    let file = sandkern_protocol::CgroupControlFile {
        controller: "memory".into(),
        path: "/".into(),
        name: "memory.max".into(),
    };
    // Reading before any write fails, and the error names the file.
    let err = h
        .sandbox
        .cgroups_read_control_file(file.clone())
        .unwrap_err();
    assert!(err.to_string().contains("memory.max"), "{err}");

    h.sandbox
        .cgroups_write_control_file(file.clone(), "1048576")
        .unwrap();
    assert_eq!(h.sandbox.cgroups_read_control_file(file).unwrap(), "1048576");

    // An invalid write's error carries the operation's arguments.
    let bad = sandkern_protocol::CgroupControlFile {
        controller: "cpu".into(),
        path: "/".into(),
        name: "cpu.max".into(),
    };
    let err = h
        .sandbox
        .cgroups_write_control_file(bad, "")
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("cpu.max"), "{message}");
    assert!(message.contains("empty value"), "{message}");
    h.controller.stop();
}

#[test]
fn usage_fd_returns_exactly_two_files() {
    let mut h = start_harness("usage");
    h.sandbox.start_root().unwrap();
    let (mut data, mut version) = h.sandbox.usage_fd().unwrap();
    use std::io::{Read, Seek};
    let mut snapshot = String::new();
    data.rewind().unwrap();
    data.read_to_string(&mut snapshot).unwrap();
    assert!(snapshot.contains("total"));
    let mut stamp = String::new();
    version.rewind().unwrap();
    version.read_to_string(&mut stamp).unwrap();
    assert_eq!(stamp, "1");
    h.controller.stop();
}

#[test]
fn checkpoint_restore_over_the_wire() {
    let mut h = start_harness("ckpt");
    h.sandbox.start_root().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("image");
    let image = std::fs::File::create(&image_path).unwrap();
    h.sandbox
        .checkpoint("ckpt", image, &Default::default())
        .unwrap();
    assert!(std::fs::metadata(&image_path).unwrap().len() > 0);

    h.sandbox
        .restore(&Default::default(), "ckpt", Path::new(&image_path))
        .unwrap();
    assert!(h.loader.was_restored());
    assert!(h.loader.kernel().container_init("ckpt").is_some());
    h.controller.stop();
}

#[test]
fn trace_sessions_roundtrip() {
    let mut h = start_harness("trace");
    h.sandbox.start_root().unwrap();

    let config = sandkern_protocol::SessionConfig {
        name: "audit".into(),
        points: vec!["container/start".into()],
        sinks: vec![sandkern_protocol::SinkConfig {
            name: "file".into(),
            fd_index: Some(0),
        }],
    };
    h.sandbox
        .create_trace_session(&config, false, vec![tempfile::tempfile().unwrap()])
        .unwrap();
    let sessions = h.sandbox.list_trace_sessions().unwrap();
    assert!(sessions.iter().any(|s| s.name == "audit"));
    h.sandbox.delete_trace_session("audit").unwrap();
    let sessions = h.sandbox.list_trace_sessions().unwrap();
    assert!(!sessions.iter().any(|s| s.name == "audit"));
    h.controller.stop();
}
