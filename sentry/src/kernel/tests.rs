use super::*;
use crate::{
    platform::{SimAddressSpace, SimPlatform, SwitchResult},
    syscalls::SyscallTable,
    usage::MemoryAccounting,
    vfs::tmpfs::TmpfsType,
};
use sandkern_protocol::SignalDeliveryMode;

fn new_kernel() -> Arc<Kernel> {
    let accounting = Arc::new(MemoryAccounting::new());
    let mf = MemoryFile::new(accounting).unwrap();
    let vfs = Arc::new(VirtualFilesystem::new());
    vfs.register_filesystem(Arc::new(TmpfsType));
    let mntns = MountNamespace::new();
    vfs.mount_root(&mntns, "tmpfs", "", Default::default())
        .unwrap();
    Kernel::new(Arc::new(SimPlatform), mf, vfs, mntns)
}

fn spawn_container(kernel: &Arc<Kernel>, cid: &str) -> (ThreadGroupId, TaskId, ThreadId) {
    let (tg, task, pid) = kernel
        .create_process(CreateProcessArgs {
            container_id: cid.to_string(),
            creds: Credentials::new_root(),
            pidns: None,
            tty: None,
        })
        .unwrap();
    if kernel.container_init(cid).is_none() {
        kernel.register_container(cid, tg).unwrap();
    }
    (tg, task, pid)
}

#[test]
fn first_process_is_pid_one_everywhere() {
    let kernel = new_kernel();
    let (tg, task, root_pid) = spawn_container(&kernel, "root");
    assert_eq!(root_pid, 1);
    // In its own (child) namespace the task is also pid 1.
    assert_eq!(kernel.local_tid_of(task), Some(1));
    let group = kernel.thread_group(tg).unwrap();
    assert_eq!(group.session(), 1);
    assert_eq!(group.pgid(), 1);
    assert_eq!(kernel.global_init(), Some(tg));
}

#[test]
fn sigterm_terminates_and_wait_reports_signal() {
    let kernel = new_kernel();
    let (_tg, _task, _pid) = spawn_container(&kernel, "root");
    kernel
        .signal("root", 0, signal::SIGTERM, SignalDeliveryMode::ToProcess)
        .unwrap();
    let status = kernel.wait_container("root").unwrap();
    assert!(status.signaled());
    assert_eq!(status.signal(), signal::SIGTERM);
}

#[test]
fn concurrent_waiters_observe_one_status() {
    let kernel = new_kernel();
    spawn_container(&kernel, "root");
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let kernel = Arc::clone(&kernel);
            std::thread::spawn(move || kernel.wait_container("root").unwrap())
        })
        .collect();
    kernel
        .signal("root", 0, signal::SIGKILL, SignalDeliveryMode::ToProcess)
        .unwrap();
    for waiter in waiters {
        assert_eq!(
            waiter.join().unwrap(),
            WaitStatus::from_signal(signal::SIGKILL)
        );
    }
}

#[test]
fn signal_all_requires_pid_zero_and_hits_every_group() {
    let kernel = new_kernel();
    let (tg_a, task_a, _) = spawn_container(&kernel, "root");
    let (task_b, _tid) = kernel.clone_task(task_a, true, false, false).unwrap();
    let tg_b = kernel.task(task_b).unwrap().thread_group();

    assert!(matches!(
        kernel.signal("root", 5, signal::SIGKILL, SignalDeliveryMode::ToAllProcesses),
        Err(KernelError::PidMustBeZero(5))
    ));

    kernel
        .signal("root", 0, signal::SIGKILL, SignalDeliveryMode::ToAllProcesses)
        .unwrap();
    assert!(kernel.thread_group(tg_a).unwrap().is_exited());
    assert!(kernel.thread_group(tg_b).unwrap().is_exited());
    assert!(!kernel.is_paused());
}

#[test]
fn foreground_group_signaling_falls_back_without_pgid() {
    let kernel = new_kernel();
    let tty = Tty::new(0);
    let (tg, _task, _pid) = kernel
        .create_process(CreateProcessArgs {
            container_id: "root".into(),
            creds: Credentials::new_root(),
            pidns: None,
            tty: Some(Arc::clone(&tty)),
        })
        .unwrap();
    kernel.register_container("root", tg).unwrap();

    // No foreground pgid set: falls back to ToProcess and terminates.
    kernel
        .signal(
            "root",
            0,
            signal::SIGTERM,
            SignalDeliveryMode::ToForegroundProcessGroup,
        )
        .unwrap();
    assert!(kernel.thread_group(tg).unwrap().is_exited());
}

#[test]
fn foreground_group_signaling_targets_pgid() {
    let kernel = new_kernel();
    let tty = Tty::new(0);
    let (tg, task, _pid) = kernel
        .create_process(CreateProcessArgs {
            container_id: "root".into(),
            creds: Credentials::new_root(),
            pidns: None,
            tty: Some(Arc::clone(&tty)),
        })
        .unwrap();
    kernel.register_container("root", tg).unwrap();

    // A second process inherits the session; point the TTY at its pgid.
    let (other_task, _) = kernel.clone_task(task, true, false, false).unwrap();
    let other_tg_id = kernel.task(other_task).unwrap().thread_group();
    let other_tg = kernel.thread_group(other_tg_id).unwrap();
    let other_root_tid = kernel.root_tid_of(other_task).unwrap();
    other_tg.set_session(other_tg.session(), other_root_tid);
    tty.set_foreground_pgid(other_root_tid);

    kernel
        .signal(
            "root",
            0,
            signal::SIGKILL,
            SignalDeliveryMode::ToForegroundProcessGroup,
        )
        .unwrap();
    assert!(other_tg.is_exited());
    assert!(!kernel.thread_group(tg).unwrap().is_exited());
}

#[test]
fn clone_controls_sharing() {
    let kernel = new_kernel();
    let (_tg, task_id, _) = spawn_container(&kernel, "root");
    let parent = kernel.task(task_id).unwrap();

    let (thread_id, _) = kernel.clone_task(task_id, false, true, true).unwrap();
    let thread = kernel.task(thread_id).unwrap();
    assert_eq!(thread.thread_group(), parent.thread_group());
    assert!(Arc::ptr_eq(&thread.fd_table(), &parent.fd_table()));
    assert!(Arc::ptr_eq(&thread.mm(), &parent.mm()));

    let (child_id, child_pid) = kernel.clone_task(task_id, true, false, false).unwrap();
    let child = kernel.task(child_id).unwrap();
    assert_ne!(child.thread_group(), parent.thread_group());
    assert!(!Arc::ptr_eq(&child.fd_table(), &parent.fd_table()));
    assert!(!Arc::ptr_eq(&child.mm(), &parent.mm()));
    assert!(child_pid > 1);
    let child_tg = kernel.thread_group(child.thread_group()).unwrap();
    assert_eq!(child_tg.parent(), Some(parent.thread_group()));
}

#[test]
fn pause_blocks_process_creation() {
    let kernel = new_kernel();
    spawn_container(&kernel, "root");
    kernel.pause();
    let creator = {
        let kernel = Arc::clone(&kernel);
        std::thread::spawn(move || {
            kernel
                .create_process(CreateProcessArgs {
                    container_id: "late".into(),
                    creds: Credentials::new_root(),
                    pidns: None,
                    tty: None,
                })
                .unwrap()
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(30));
    assert!(!creator.is_finished());
    kernel.unpause();
    creator.join().unwrap();
}

#[test]
fn execve_resets_handlers_and_cloexec_fds() {
    let kernel = new_kernel();
    let (tg_id, task_id, _) = spawn_container(&kernel, "root");
    let task = kernel.task(task_id).unwrap();
    let tg = kernel.thread_group(tg_id).unwrap();

    tg.with_handlers(|h| {
        h.set_action(
            signal::SIGTERM,
            crate::arch::SigAction {
                handler: 0x1000,
                ..Default::default()
            },
        )
        .unwrap()
    });
    let old_mm = task.mm();
    kernel.execve(task_id).unwrap();
    assert!(tg.with_handlers(|h| h.action(signal::SIGTERM)).is_none());
    assert!(!Arc::ptr_eq(&old_mm, &task.mm()));
}

#[test]
fn run_task_dispatches_syscalls_until_exit() {
    let kernel = new_kernel();
    let (_tg, task_id, _) = spawn_container(&kernel, "root");
    let task = kernel.task(task_id).unwrap();

    // Script one exit_group(7) syscall.
    task.with_arch(|arch| {
        let ctx = arch.amd64_mut();
        ctx.regs.orig_rax = 231;
        ctx.regs.rdi = 7;
    });
    let space = Arc::new(SimAddressSpace::default());
    space.push_switch_result(SwitchResult::Syscall);

    let table = SyscallTable::amd64();
    kernel.run_task(task_id, space, &table);

    let status = kernel.wait_container("root").unwrap();
    assert!(status.exited());
    assert_eq!(status.exit_status(), 7);
}

#[test]
fn dispatch_returns_pid_and_enosys() {
    let kernel = new_kernel();
    let (_tg, task_id, _) = spawn_container(&kernel, "root");
    let task = kernel.task(task_id).unwrap();
    let table = SyscallTable::amd64();

    task.with_arch(|arch| arch.amd64_mut().regs.orig_rax = 39); // getpid
    let outcome = crate::syscalls::dispatch(&kernel, task_id, &task, &table);
    assert_eq!(outcome, crate::syscalls::Outcome::Return(1));

    crate::unimpl::reset_for_test();
    task.with_arch(|arch| arch.amd64_mut().regs.orig_rax = 9999);
    let outcome = crate::syscalls::dispatch(&kernel, task_id, &task, &table);
    assert_eq!(
        outcome,
        crate::syscalls::Outcome::Return(-(libc::ENOSYS as i64))
    );
}

#[test]
fn processes_lists_container_rows() {
    let kernel = new_kernel();
    let (_tg, task_id, pid) = spawn_container(&kernel, "root");
    kernel.clone_task(task_id, true, false, false).unwrap();
    let rows = kernel.processes("root");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].pid, pid);
    assert!(kernel.processes("nope").is_empty());
}

#[test]
fn wait_pid_scopes_to_container() {
    let kernel = new_kernel();
    let (_tg, task_id, _) = spawn_container(&kernel, "root");
    let (child_task, child_pid) = kernel.clone_task(task_id, true, false, false).unwrap();
    let child_root_pid = kernel.root_tid_of(child_task).unwrap();
    let _ = child_pid;

    assert!(kernel.wait_pid("wrong", child_root_pid).is_err());

    let waiter = {
        let kernel = Arc::clone(&kernel);
        std::thread::spawn(move || kernel.wait_pid("root", child_root_pid).unwrap())
    };
    let child_tg = kernel.task(child_task).unwrap().thread_group();
    let tg = kernel.thread_group(child_tg).unwrap();
    kernel.kill_group(&tg, WaitStatus::from_exit_code(0));
    assert_eq!(waiter.join().unwrap(), WaitStatus::from_exit_code(0));
}
