//! Task credentials: kernel-side uids, gids, capabilities, user
//! namespace membership.

use bitflags::bitflags;

/// A uid as the kernel tracks it, before user-namespace translation.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Kuid(pub u32);

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Kgid(pub u32);

pub const ROOT_KUID: Kuid = Kuid(0);
pub const ROOT_KGID: Kgid = Kgid(0);
pub const NOBODY_KUID: Kuid = Kuid(65534);
pub const NOBODY_KGID: Kgid = Kgid(65534);

bitflags! {
    /// The capability bits the sentry distinguishes.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Capabilities: u64 {
        const CHOWN = 1 << 0;
        const DAC_OVERRIDE = 1 << 1;
        const FOWNER = 1 << 3;
        const KILL = 1 << 5;
        const SETGID = 1 << 6;
        const SETUID = 1 << 7;
        const SETPCAP = 1 << 8;
        const NET_BIND_SERVICE = 1 << 10;
        const NET_RAW = 1 << 13;
        const IPC_LOCK = 1 << 14;
        const SYS_CHROOT = 1 << 18;
        const SYS_PTRACE = 1 << 19;
        const SYS_ADMIN = 1 << 21;
        const SYS_NICE = 1 << 23;
        const SYS_RESOURCE = 1 << 24;
        const AUDIT_WRITE = 1 << 29;
    }
}

/// An identifier for a user namespace; the root namespace is 0.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct UserNamespaceId(pub u64);

#[derive(Debug, Clone)]
pub struct Credentials {
    pub real_kuid: Kuid,
    pub effective_kuid: Kuid,
    pub saved_kuid: Kuid,
    pub real_kgid: Kgid,
    pub effective_kgid: Kgid,
    pub saved_kgid: Kgid,
    pub extra_kgids: Vec<Kgid>,
    pub permitted_caps: Capabilities,
    pub effective_caps: Capabilities,
    pub user_namespace: UserNamespaceId,
}

impl Credentials {
    /// Root in the root user namespace.
    pub fn new_root() -> Credentials {
        Credentials {
            real_kuid: ROOT_KUID,
            effective_kuid: ROOT_KUID,
            saved_kuid: ROOT_KUID,
            real_kgid: ROOT_KGID,
            effective_kgid: ROOT_KGID,
            saved_kgid: ROOT_KGID,
            extra_kgids: Vec::new(),
            permitted_caps: Capabilities::all(),
            effective_caps: Capabilities::all(),
            user_namespace: UserNamespaceId(0),
        }
    }

    /// An unprivileged user.
    pub fn new_user(kuid: Kuid, kgid: Kgid, extra_kgids: Vec<Kgid>) -> Credentials {
        Credentials {
            real_kuid: kuid,
            effective_kuid: kuid,
            saved_kuid: kuid,
            real_kgid: kgid,
            effective_kgid: kgid,
            saved_kgid: kgid,
            extra_kgids,
            permitted_caps: Capabilities::empty(),
            effective_caps: Capabilities::empty(),
            user_namespace: UserNamespaceId(0),
        }
    }

    pub fn has_capability(&self, cap: Capabilities) -> bool {
        self.effective_caps.contains(cap)
    }

    pub fn in_group(&self, kgid: Kgid) -> bool {
        self.effective_kgid == kgid || self.extra_kgids.contains(&kgid)
    }

    /// setuid(2) core rule: unprivileged callers may only switch among
    /// their real, effective and saved ids.
    pub fn set_uid(&mut self, kuid: Kuid) -> Result<(), ()> {
        if self.has_capability(Capabilities::SETUID) {
            self.real_kuid = kuid;
            self.effective_kuid = kuid;
            self.saved_kuid = kuid;
            return Ok(());
        }
        if kuid == self.real_kuid || kuid == self.saved_kuid || kuid == self.effective_kuid {
            self.effective_kuid = kuid;
            return Ok(());
        }
        Err(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprivileged_setuid_restricted() {
        let mut creds = Credentials::new_user(Kuid(1000), Kgid(1000), vec![]);
        assert!(creds.set_uid(Kuid(0)).is_err());
        assert!(creds.set_uid(Kuid(1000)).is_ok());

        let mut root = Credentials::new_root();
        assert!(root.set_uid(Kuid(1000)).is_ok());
        assert_eq!(root.real_kuid, Kuid(1000));
    }

    #[test]
    fn group_membership() {
        let creds = Credentials::new_user(Kuid(1000), Kgid(1000), vec![Kgid(44), Kgid(20)]);
        assert!(creds.in_group(Kgid(1000)));
        assert!(creds.in_group(Kgid(44)));
        assert!(!creds.in_group(Kgid(0)));
    }
}
