//! Resource limits, the rlimit(2) pairs a thread group carries.

/// RLIM_INFINITY.
pub const INFINITY: u64 = u64::MAX;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Limit {
    pub cur: u64,
    pub max: u64,
}

impl Limit {
    pub const fn unlimited() -> Limit {
        Limit {
            cur: INFINITY,
            max: INFINITY,
        }
    }

    pub const fn fixed(cur: u64, max: u64) -> Limit {
        Limit { cur, max }
    }
}

/// The limits a thread group shares. Defaults follow the values a fresh
/// Linux session would see.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LimitSet {
    pub stack: Limit,
    pub data: Limit,
    pub address_space: Limit,
    pub core: Limit,
    pub cpu: Limit,
    pub file_size: Limit,
    pub number_of_files: Limit,
    pub memory_locked: Limit,
    pub nproc: Limit,
}

impl Default for LimitSet {
    fn default() -> Self {
        LimitSet {
            stack: Limit::fixed(8 << 20, INFINITY),
            data: Limit::unlimited(),
            address_space: Limit::unlimited(),
            core: Limit::fixed(0, INFINITY),
            cpu: Limit::unlimited(),
            file_size: Limit::unlimited(),
            number_of_files: Limit::fixed(1024, 4096),
            memory_locked: Limit::fixed(64 << 10, 64 << 10),
            nproc: Limit::unlimited(),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LimitType {
    Stack,
    Data,
    AddressSpace,
    Core,
    Cpu,
    FileSize,
    NumberOfFiles,
    MemoryLocked,
    Nproc,
}

impl LimitSet {
    pub fn get(&self, which: LimitType) -> Limit {
        match which {
            LimitType::Stack => self.stack,
            LimitType::Data => self.data,
            LimitType::AddressSpace => self.address_space,
            LimitType::Core => self.core,
            LimitType::Cpu => self.cpu,
            LimitType::FileSize => self.file_size,
            LimitType::NumberOfFiles => self.number_of_files,
            LimitType::MemoryLocked => self.memory_locked,
            LimitType::Nproc => self.nproc,
        }
    }

    /// Sets a limit, enforcing that an unprivileged caller may not raise
    /// the hard limit.
    pub fn set(
        &mut self,
        which: LimitType,
        value: Limit,
        privileged: bool,
    ) -> Result<Limit, SetLimitError> {
        let slot = match which {
            LimitType::Stack => &mut self.stack,
            LimitType::Data => &mut self.data,
            LimitType::AddressSpace => &mut self.address_space,
            LimitType::Core => &mut self.core,
            LimitType::Cpu => &mut self.cpu,
            LimitType::FileSize => &mut self.file_size,
            LimitType::NumberOfFiles => &mut self.number_of_files,
            LimitType::MemoryLocked => &mut self.memory_locked,
            LimitType::Nproc => &mut self.nproc,
        };
        if value.cur > value.max {
            return Err(SetLimitError::CurAboveMax);
        }
        if value.max > slot.max && !privileged {
            return Err(SetLimitError::RaisingMax);
        }
        Ok(std::mem::replace(slot, value))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SetLimitError {
    CurAboveMax,
    RaisingMax,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprivileged_cannot_raise_max() {
        let mut limits = LimitSet::default();
        let result = limits.set(
            LimitType::NumberOfFiles,
            Limit::fixed(100, 1 << 20),
            false,
        );
        assert_eq!(result, Err(SetLimitError::RaisingMax));

        let old = limits
            .set(LimitType::NumberOfFiles, Limit::fixed(100, 4096), false)
            .unwrap();
        assert_eq!(old.cur, 1024);
        assert_eq!(limits.number_of_files.cur, 100);
    }

    #[test]
    fn cur_above_max_rejected() {
        let mut limits = LimitSet::default();
        let result = limits.set(LimitType::Stack, Limit::fixed(2, 1), true);
        assert_eq!(result, Err(SetLimitError::CurAboveMax));
    }
}
