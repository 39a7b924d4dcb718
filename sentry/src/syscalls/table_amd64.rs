//! amd64 syscall table entries and handlers.

use super::{ret, Handler, Outcome, SyscallContext, SyscallEntry};
use crate::{
    arch::{ArgShape, SigAction, SignalStack, SyscallArgument},
    kernel::{signal, TaskState},
    mm::{AccessType, MMapOpts, MRemapOpts, SpecialMappable},
    vfs::FdFlags,
};
use sandkern_protocol::{SignalDeliveryMode, WaitStatus};
use std::sync::Arc;

const P: ArgShape = ArgShape::Pointer;
const U: ArgShape = ArgShape::Uint;
const I: ArgShape = ArgShape::Int;
const I32: ArgShape = ArgShape::Int32;
const U32: ArgShape = ArgShape::Uint32;
const FD: ArgShape = ArgShape::Fd;

fn entry(name: &'static str, shapes: [ArgShape; 6], handler: Handler) -> SyscallEntry {
    SyscallEntry {
        name,
        shapes,
        handler,
    }
}

/// The implemented subset, keyed by amd64 syscall number.
pub fn entries() -> Vec<(u64, SyscallEntry)> {
    vec![
        (0, entry("read", [FD, P, U, U, U, U], sys_read)),
        (1, entry("write", [FD, P, U, U, U, U], sys_write)),
        (3, entry("close", [FD, U, U, U, U, U], sys_close)),
        (9, entry("mmap", [P, U, I32, I32, FD, U], sys_mmap)),
        (10, entry("mprotect", [P, U, I32, U, U, U], sys_mprotect)),
        (11, entry("munmap", [P, U, U, U, U, U], sys_munmap)),
        (12, entry("brk", [P, U, U, U, U, U], sys_brk)),
        (13, entry("rt_sigaction", [I32, P, P, U, U, U], sys_rt_sigaction)),
        (14, entry("rt_sigprocmask", [I32, P, P, U, U, U], sys_rt_sigprocmask)),
        (15, entry("rt_sigreturn", [U, U, U, U, U, U], sys_rt_sigreturn)),
        (16, entry("ioctl", [FD, U, P, U, U, U], sys_ioctl)),
        (24, entry("sched_yield", [U, U, U, U, U, U], sys_sched_yield)),
        (25, entry("mremap", [P, U, U, I32, P, U], sys_mremap)),
        (26, entry("msync", [P, U, I32, U, U, U], sys_msync)),
        (32, entry("dup", [FD, U, U, U, U, U], sys_dup)),
        (35, entry("nanosleep", [P, P, U, U, U, U], sys_nanosleep)),
        (39, entry("getpid", [U, U, U, U, U, U], sys_getpid)),
        (60, entry("exit", [I32, U, U, U, U, U], sys_exit)),
        (61, entry("wait4", [I32, P, I32, P, U, U], sys_wait4)),
        (62, entry("kill", [I32, I32, U, U, U, U], sys_kill)),
        (63, entry("uname", [P, U, U, U, U, U], sys_uname)),
        (102, entry("getuid", [U, U, U, U, U, U], sys_getuid)),
        (104, entry("getgid", [U, U, U, U, U, U], sys_getgid)),
        (107, entry("geteuid", [U, U, U, U, U, U], sys_geteuid)),
        (108, entry("getegid", [U, U, U, U, U, U], sys_getegid)),
        (110, entry("getppid", [U, U, U, U, U, U], sys_getppid)),
        (131, entry("sigaltstack", [P, P, U, U, U, U], sys_sigaltstack)),
        (149, entry("mlock", [P, U, U, U, U, U], sys_mlock)),
        (150, entry("munlock", [P, U, U, U, U, U], sys_munlock)),
        (158, entry("arch_prctl", [I32, P, U, U, U, U], sys_arch_prctl)),
        (186, entry("gettid", [U, U, U, U, U, U], sys_gettid)),
        (206, entry("io_setup", [U32, P, U, U, U, U], sys_io_setup)),
        (207, entry("io_destroy", [U, U, U, U, U, U], sys_io_destroy)),
        (208, entry("io_getevents", [U, I, I, P, P, U], sys_io_getevents)),
        (209, entry("io_submit", [U, I, P, U, U, U], sys_io_submit)),
        (210, entry("io_cancel", [U, P, P, U, U, U], sys_io_cancel)),
        (231, entry("exit_group", [I32, U, U, U, U, U], sys_exit_group)),
    ]
}

const MAX_RW_COUNT: u64 = 1 << 20;

fn sys_read(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let fd = args[0].fd();
    let buf = args[1].pointer();
    let count = args[2].uint().min(MAX_RW_COUNT) as usize;
    let file = match ctx.task.fd_table().get(fd) {
        Some(file) => file,
        None => return ret(Err(libc::EBADF)),
    };
    let mut data = vec![0u8; count];
    let n = match file.read(&mut data) {
        Ok(n) => n,
        Err(err) => return ret(Err(err.to_errno())),
    };
    match ctx.task.mm().copy_out(buf, &data[..n]) {
        Ok(()) => ret(Ok(n as u64)),
        Err(err) => ret(Err(err.to_errno())),
    }
}

fn sys_write(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let fd = args[0].fd();
    let buf = args[1].pointer();
    let count = args[2].uint().min(MAX_RW_COUNT) as usize;
    let file = match ctx.task.fd_table().get(fd) {
        Some(file) => file,
        None => return ret(Err(libc::EBADF)),
    };
    let data = match ctx.task.mm().copy_in(buf, count) {
        Ok(data) => data,
        Err(err) => return ret(Err(err.to_errno())),
    };
    match file.write(&data) {
        Ok(n) => ret(Ok(n as u64)),
        Err(err) => ret(Err(err.to_errno())),
    }
}

fn sys_close(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    match ctx.task.fd_table().remove(args[0].fd()) {
        Some(_) => ret(Ok(0)),
        None => ret(Err(libc::EBADF)),
    }
}

fn sys_dup(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let table = ctx.task.fd_table();
    match table.get(args[0].fd()) {
        Some(file) => ret(Ok(table.insert(0, file, FdFlags::empty()) as u64)),
        None => ret(Err(libc::EBADF)),
    }
}

fn sys_mmap(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let addr = args[0].pointer();
    let length = args[1].uint();
    let prot = args[2].int() as i32;
    let flags = args[3].int() as i32;
    let _fd = args[4].fd();

    if flags & libc::MAP_ANONYMOUS == 0 {
        // File mappings go through the gofer path, which is not routed
        // through this table entry.
        return ret(Err(libc::ENODEV));
    }
    let shared = flags & libc::MAP_SHARED != 0;
    let mm = ctx.task.mm();
    let mappable = if shared {
        let rounded = match crate::arch::page_round_up(length) {
            Some(r) if r > 0 => r,
            _ => return ret(Err(libc::EINVAL)),
        };
        match SpecialMappable::new_shared_anon(Arc::clone(mm.memory_file()), rounded) {
            Ok(sm) => Some(sm as Arc<dyn crate::mm::Mappable>),
            Err(err) => return ret(Err(err.to_errno())),
        }
    } else {
        None
    };
    let opts = MMapOpts {
        length,
        addr,
        fixed: flags & libc::MAP_FIXED != 0,
        unmap: flags & libc::MAP_FIXED != 0,
        perms: AccessType::from_prot(prot),
        max_perms: AccessType::ANY_ACCESS,
        private: !shared,
        grows_down: flags & libc::MAP_GROWSDOWN != 0,
        mappable,
        offset: 0,
    };
    match mm.mmap(opts) {
        Ok(addr) => ret(Ok(addr)),
        Err(err) => ret(Err(err.to_errno())),
    }
}

fn sys_munmap(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    match ctx.task.mm().munmap(args[0].pointer(), args[1].uint()) {
        Ok(()) => ret(Ok(0)),
        Err(err) => ret(Err(err.to_errno())),
    }
}

fn sys_mprotect(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let prot = args[2].int() as i32;
    match ctx
        .task
        .mm()
        .mprotect(args[0].pointer(), args[1].uint(), AccessType::from_prot(prot))
    {
        Ok(()) => ret(Ok(0)),
        Err(err) => ret(Err(err.to_errno())),
    }
}

fn sys_mremap(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    const MREMAP_MAYMOVE: i32 = 1;
    const MREMAP_FIXED: i32 = 2;
    let flags = args[3].int() as i32;
    let opts = MRemapOpts {
        may_move: flags & MREMAP_MAYMOVE != 0,
        new_addr: (flags & MREMAP_FIXED != 0).then(|| args[4].pointer()),
    };
    match ctx
        .task
        .mm()
        .mremap(args[0].pointer(), args[1].uint(), args[2].uint(), opts)
    {
        Ok(addr) => ret(Ok(addr)),
        Err(err) => ret(Err(err.to_errno())),
    }
}

fn sys_msync(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    match ctx.task.mm().msync(args[0].pointer(), args[1].uint()) {
        Ok(()) => ret(Ok(0)),
        Err(err) => ret(Err(err.to_errno())),
    }
}

fn sys_mlock(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    match ctx.task.mm().mlock(args[0].pointer(), args[1].uint()) {
        Ok(()) => ret(Ok(0)),
        Err(err) => ret(Err(err.to_errno())),
    }
}

fn sys_munlock(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    match ctx.task.mm().munlock(args[0].pointer(), args[1].uint()) {
        Ok(()) => ret(Ok(0)),
        Err(err) => ret(Err(err.to_errno())),
    }
}

fn sys_brk(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    ret(Ok(ctx.task.mm().brk(args[0].pointer())))
}

fn sys_rt_sigaction(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let signo = args[0].int() as i32;
    let act_ptr = args[1].pointer();
    let old_ptr = args[2].pointer();
    let tg = match ctx.kernel.thread_group(ctx.task.thread_group()) {
        Some(tg) => tg,
        None => return ret(Err(libc::ESRCH)),
    };

    let new_act = if act_ptr != 0 {
        let bytes = match ctx.task.mm().copy_in(act_ptr, 32) {
            Ok(bytes) => bytes,
            Err(err) => return ret(Err(err.to_errno())),
        };
        let word = |i: usize| u64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
        Some(SigAction {
            handler: word(0),
            flags: word(1),
            restorer: word(2),
            mask: word(3),
        })
    } else {
        None
    };

    let old = match new_act {
        Some(act) => match tg.with_handlers(|h| h.set_action(signo, act)) {
            Ok(old) => old,
            Err(()) => return ret(Err(libc::EINVAL)),
        },
        None => tg.with_handlers(|h| h.action(signo)).unwrap_or_default(),
    };

    if old_ptr != 0 {
        let mut bytes = [0u8; 32];
        bytes[0..8].copy_from_slice(&old.handler.to_le_bytes());
        bytes[8..16].copy_from_slice(&old.flags.to_le_bytes());
        bytes[16..24].copy_from_slice(&old.restorer.to_le_bytes());
        bytes[24..32].copy_from_slice(&old.mask.to_le_bytes());
        if let Err(err) = ctx.task.mm().copy_out(old_ptr, &bytes) {
            return ret(Err(err.to_errno()));
        }
    }
    ret(Ok(0))
}

fn sys_rt_sigprocmask(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    const SIG_BLOCK: i32 = 0;
    const SIG_UNBLOCK: i32 = 1;
    const SIG_SETMASK: i32 = 2;
    let how = args[0].int() as i32;
    let set_ptr = args[1].pointer();
    let old_ptr = args[2].pointer();

    let old_mask = ctx.task.with_signal_state(|s| s.mask);
    if set_ptr != 0 {
        let bytes = match ctx.task.mm().copy_in(set_ptr, 8) {
            Ok(bytes) => bytes,
            Err(err) => return ret(Err(err.to_errno())),
        };
        let new = u64::from_le_bytes(bytes.try_into().unwrap());
        let applied = match how {
            SIG_BLOCK => old_mask | new,
            SIG_UNBLOCK => old_mask & !new,
            SIG_SETMASK => new,
            _ => return ret(Err(libc::EINVAL)),
        };
        ctx.task.with_signal_state(|s| s.mask = applied);
    }
    if old_ptr != 0 {
        if let Err(err) = ctx.task.mm().copy_out(old_ptr, &old_mask.to_le_bytes()) {
            return ret(Err(err.to_errno()));
        }
    }
    ret(Ok(0))
}

fn sys_rt_sigreturn(ctx: &SyscallContext, _args: &[SyscallArgument; 6]) -> Outcome {
    let sp = ctx.task.with_arch(|arch| arch.stack());
    let frame_addr = sp.wrapping_sub(8);
    let frame = match ctx.task.mm().copy_in(frame_addr, crate::arch::FRAME_SIZE) {
        Ok(frame) => frame,
        Err(err) => return ret(Err(err.to_errno())),
    };
    let restored = ctx.task.with_arch(|arch| arch.signal_restore(&frame));
    match restored {
        Ok((mask, alt)) => {
            ctx.task.with_signal_state(|s| {
                s.mask = mask;
                s.alt_stack = alt;
            });
            Outcome::Return(ctx.task.with_arch(|arch| arch.return_value()) as i64)
        }
        Err(_) => {
            // A corrupt frame is fatal, as it is on Linux.
            if let Some(tg) = ctx.kernel.thread_group(ctx.task.thread_group()) {
                ctx.kernel
                    .kill_group(&tg, WaitStatus::from_signal(signal::SIGSEGV));
            }
            Outcome::Exited
        }
    }
}

fn sys_sigaltstack(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let new_ptr = args[0].pointer();
    let old_ptr = args[1].pointer();
    let old = ctx.task.with_signal_state(|s| s.alt_stack);
    if old_ptr != 0 {
        let mut bytes = [0u8; 24];
        bytes[0..8].copy_from_slice(&old.addr.to_le_bytes());
        bytes[8..12].copy_from_slice(&old.flags.to_le_bytes());
        bytes[16..24].copy_from_slice(&old.size.to_le_bytes());
        if let Err(err) = ctx.task.mm().copy_out(old_ptr, &bytes) {
            return ret(Err(err.to_errno()));
        }
    }
    if new_ptr != 0 {
        let bytes = match ctx.task.mm().copy_in(new_ptr, 24) {
            Ok(bytes) => bytes,
            Err(err) => return ret(Err(err.to_errno())),
        };
        let stack = SignalStack {
            addr: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            size: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        };
        ctx.task.with_signal_state(|s| s.alt_stack = stack);
    }
    ret(Ok(0))
}

fn sys_ioctl(_ctx: &SyscallContext, _args: &[SyscallArgument; 6]) -> Outcome {
    ret(Err(libc::ENOTTY))
}

fn sys_sched_yield(_ctx: &SyscallContext, _args: &[SyscallArgument; 6]) -> Outcome {
    std::thread::yield_now();
    ret(Ok(0))
}

fn sys_nanosleep(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let req_ptr = args[0].pointer();
    let bytes = match ctx.task.mm().copy_in(req_ptr, 16) {
        Ok(bytes) => bytes,
        Err(err) => return ret(Err(err.to_errno())),
    };
    let secs = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let nanos = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
    if secs < 0 || !(0..1_000_000_000).contains(&nanos) {
        return ret(Err(libc::EINVAL));
    }
    // Sleeps are capped so a runaway request cannot wedge the executor.
    let duration = std::time::Duration::new(secs.min(1) as u64, nanos as u32);
    std::thread::sleep(duration);
    ret(Ok(0))
}

fn sys_getpid(ctx: &SyscallContext, _args: &[SyscallArgument; 6]) -> Outcome {
    let tg = match ctx.kernel.thread_group(ctx.task.thread_group()) {
        Some(tg) => tg,
        None => return ret(Err(libc::ESRCH)),
    };
    match tg
        .leader()
        .and_then(|leader| ctx.kernel.local_tid_of(leader))
    {
        Some(tgid) => ret(Ok(tgid as u64)),
        None => ret(Err(libc::ESRCH)),
    }
}

fn sys_gettid(ctx: &SyscallContext, _args: &[SyscallArgument; 6]) -> Outcome {
    match ctx.kernel.local_tid_of(ctx.task_id) {
        Some(tid) => ret(Ok(tid as u64)),
        None => ret(Err(libc::ESRCH)),
    }
}

fn sys_getppid(ctx: &SyscallContext, _args: &[SyscallArgument; 6]) -> Outcome {
    let parent_tgid = ctx
        .kernel
        .thread_group(ctx.task.thread_group())
        .and_then(|tg| tg.parent())
        .and_then(|parent| ctx.kernel.thread_group(parent))
        .and_then(|parent| parent.leader())
        .and_then(|leader| ctx.kernel.local_tid_of(leader))
        .unwrap_or(0);
    ret(Ok(parent_tgid as u64))
}

fn sys_getuid(ctx: &SyscallContext, _args: &[SyscallArgument; 6]) -> Outcome {
    ret(Ok(ctx.task.creds().real_kuid.0 as u64))
}

fn sys_geteuid(ctx: &SyscallContext, _args: &[SyscallArgument; 6]) -> Outcome {
    ret(Ok(ctx.task.creds().effective_kuid.0 as u64))
}

fn sys_getgid(ctx: &SyscallContext, _args: &[SyscallArgument; 6]) -> Outcome {
    ret(Ok(ctx.task.creds().real_kgid.0 as u64))
}

fn sys_getegid(ctx: &SyscallContext, _args: &[SyscallArgument; 6]) -> Outcome {
    ret(Ok(ctx.task.creds().effective_kgid.0 as u64))
}

fn sys_uname(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    const FIELD: usize = 65;
    let mut buf = vec![0u8; FIELD * 6];
    for (i, value) in [
        "Linux",
        "sandkern",
        "4.4.0",
        "#1 SMP",
        "x86_64",
        "(none)",
    ]
    .iter()
    .enumerate()
    {
        let bytes = value.as_bytes();
        buf[i * FIELD..i * FIELD + bytes.len()].copy_from_slice(bytes);
    }
    match ctx.task.mm().copy_out(args[0].pointer(), &buf) {
        Ok(()) => ret(Ok(0)),
        Err(err) => ret(Err(err.to_errno())),
    }
}

fn sys_arch_prctl(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    const ARCH_SET_FS: i32 = 0x1002;
    const ARCH_GET_FS: i32 = 0x1003;
    match args[0].int() as i32 {
        ARCH_SET_FS => {
            let ok = ctx.task.with_arch(|arch| arch.set_tls(args[1].pointer()));
            if ok {
                ret(Ok(0))
            } else {
                ret(Err(libc::EPERM))
            }
        }
        ARCH_GET_FS => {
            let tls = ctx.task.with_arch(|arch| arch.tls());
            match ctx.task.mm().copy_out(args[1].pointer(), &tls.to_le_bytes()) {
                Ok(()) => ret(Ok(0)),
                Err(err) => ret(Err(err.to_errno())),
            }
        }
        _ => ret(Err(libc::EINVAL)),
    }
}

fn sys_kill(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let pid = args[0].int() as i32;
    let signo = args[1].int() as i32;
    let cid = ctx.task.container_id().to_string();
    let target = if pid > 0 { pid } else { 0 };
    match ctx
        .kernel
        .signal(&cid, target, signo, SignalDeliveryMode::ToProcess)
    {
        Ok(()) => ret(Ok(0)),
        Err(_) => ret(Err(libc::ESRCH)),
    }
}

fn sys_wait4(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let pid = args[0].int() as i32;
    let status_ptr = args[1].pointer();
    if pid <= 0 {
        // Wait-any needs child bookkeeping this table does not route.
        return ret(Err(libc::ECHILD));
    }
    let cid = ctx.task.container_id().to_string();
    let status = match ctx.kernel.wait_pid(&cid, pid) {
        Ok(status) => status,
        Err(_) => return ret(Err(libc::ECHILD)),
    };
    if status_ptr != 0 {
        if let Err(err) = ctx.task.mm().copy_out(status_ptr, &status.0.to_le_bytes()) {
            return ret(Err(err.to_errno()));
        }
    }
    ret(Ok(pid as u64))
}

fn sys_exit(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let code = args[0].int() as i32;
    ctx.task.set_state(TaskState::Zombie);
    ctx.kernel
        .task_exit(ctx.task_id, WaitStatus::from_exit_code(code));
    Outcome::Exited
}

fn sys_exit_group(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let code = args[0].int() as i32;
    if let Some(tg) = ctx.kernel.thread_group(ctx.task.thread_group()) {
        ctx.kernel
            .kill_group(&tg, WaitStatus::from_exit_code(code));
    }
    Outcome::Exited
}

fn sys_io_setup(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let nr_events = args[0].uint() as u32;
    let ctx_ptr = args[1].pointer();
    if nr_events == 0 || ctx_ptr == 0 {
        return ret(Err(libc::EINVAL));
    }
    let id = match ctx.task.mm().new_aio_context(nr_events) {
        Ok(id) => id,
        Err(err) => return ret(Err(err.to_errno())),
    };
    match ctx.task.mm().copy_out(ctx_ptr, &id.to_le_bytes()) {
        Ok(()) => ret(Ok(0)),
        Err(err) => {
            ctx.task.mm().destroy_aio_context(id);
            ret(Err(err.to_errno()))
        }
    }
}

fn sys_io_destroy(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    match ctx.task.mm().destroy_aio_context(args[0].uint()) {
        Some(aio) => {
            aio.drain();
            ret(Ok(0))
        }
        None => ret(Err(libc::EINVAL)),
    }
}

fn sys_io_submit(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let id = args[0].uint();
    let nr = args[1].int();
    let iocbpp = args[2].pointer();
    if nr < 0 {
        return ret(Err(libc::EINVAL));
    }
    let aio = match ctx.task.mm().lookup_aio_context(id) {
        Some(aio) => aio,
        None => return ret(Err(libc::EINVAL)),
    };
    let mut submitted: i64 = 0;
    for i in 0..nr {
        match aio.prepare() {
            Ok(()) => {}
            Err(crate::mm::PrepareError::Again) => {
                return if submitted > 0 {
                    Outcome::Return(submitted)
                } else {
                    ret(Err(libc::EAGAIN))
                }
            }
            Err(crate::mm::PrepareError::Invalid) => return ret(Err(libc::EINVAL)),
        }
        // The iocb's aio_data rides through to the completion event.
        let data = ctx
            .task
            .mm()
            .copy_in(iocbpp + (i as u64) * 8, 8)
            .ok()
            .and_then(|ptr_bytes| {
                let iocb_ptr = u64::from_le_bytes(ptr_bytes.try_into().unwrap());
                ctx.task.mm().copy_in(iocb_ptr, 8).ok()
            })
            .map(|data_bytes| u64::from_le_bytes(data_bytes.try_into().unwrap()))
            .unwrap_or(0);
        aio.finish_request(data);
        submitted += 1;
    }
    Outcome::Return(submitted)
}

fn sys_io_getevents(ctx: &SyscallContext, args: &[SyscallArgument; 6]) -> Outcome {
    let id = args[0].uint();
    let min_nr = args[1].int();
    let nr = args[2].int();
    let events_ptr = args[3].pointer();
    if nr < 0 || min_nr < 0 || min_nr > nr {
        return ret(Err(libc::EINVAL));
    }
    let aio = match ctx.task.mm().lookup_aio_context(id) {
        Some(aio) => aio,
        None => return ret(Err(libc::EINVAL)),
    };
    let mut collected: i64 = 0;
    while collected < nr {
        match aio.pop_request() {
            Some(data) => {
                // struct io_event: data, obj, res, res2.
                let mut event = [0u8; 32];
                event[0..8].copy_from_slice(&data.to_le_bytes());
                if let Err(err) = ctx
                    .task
                    .mm()
                    .copy_out(events_ptr + (collected as u64) * 32, &event)
                {
                    return ret(Err(err.to_errno()));
                }
                collected += 1;
            }
            None => {
                if collected >= min_nr {
                    break;
                }
                match aio.wait_channel() {
                    Some(channel) => {
                        if !channel.wait() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    Outcome::Return(collected)
}

fn sys_io_cancel(_ctx: &SyscallContext, _args: &[SyscallArgument; 6]) -> Outcome {
    // Completions are immediate here, so there is never a cancelable
    // in-flight request; Linux returns EAGAIN for that case.
    ret(Err(libc::EAGAIN))
}
