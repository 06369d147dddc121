//! `THREADINFOCLASS` and the typed payloads of the classes the runtime knows.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::handle::{ClientId, Handle};
use crate::status::NtStatus;
use crate::time::FileTime;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[num_enum(error_type(name = NtStatus, constructor = ThreadInfoClass::unknown))]
#[repr(u32)]
pub enum ThreadInfoClass {
    Basic = 0,
    Times = 1,
    Priority = 2,
    BasePriority = 3,
    AffinityMask = 4,
    ImpersonationToken = 5,
    DescriptorTableEntry = 6,
    EnableAlignmentFaultFixup = 7,
    EventPair = 8,
    QuerySetWin32StartAddress = 9,
    ZeroTlsCell = 10,
    PerformanceCount = 11,
    AmILastThread = 12,
    IdealProcessor = 13,
    PriorityBoost = 14,
    SetTlsArrayAddress = 15,
    IsIoPending = 16,
    HideFromDebugger = 17,
}

impl ThreadInfoClass {
    fn unknown(_raw: u32) -> NtStatus {
        NtStatus::INVALID_INFO_CLASS
    }
}

/// `THREAD_BASIC_INFORMATION`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct ThreadBasicInformation {
    pub exit_status: NtStatus,
    pub teb_base: u64,
    pub client_id: ClientId,
    pub affinity_mask: u64,
    pub priority: i32,
    pub base_priority: i32,
}

/// `KERNEL_USER_TIMES`; kernel and user times are relative tick counts.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct KernelUserTimes {
    pub create_time: FileTime,
    pub exit_time: FileTime,
    pub kernel_time: i64,
    pub user_time: i64,
}

/// A typed information value, used both as query result and as set argument.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadInformation {
    Basic(ThreadBasicInformation),
    Times(KernelUserTimes),
    Priority(i32),
    BasePriority(i32),
    AffinityMask(u64),
    ImpersonationToken(Handle),
    QuerySetWin32StartAddress(u64),
    ZeroTlsCell(u32),
    AmILastThread(bool),
    HideFromDebugger(bool),
}

impl ThreadInformation {
    pub fn class(&self) -> ThreadInfoClass {
        match self {
            Self::Basic(_) => ThreadInfoClass::Basic,
            Self::Times(_) => ThreadInfoClass::Times,
            Self::Priority(_) => ThreadInfoClass::Priority,
            Self::BasePriority(_) => ThreadInfoClass::BasePriority,
            Self::AffinityMask(_) => ThreadInfoClass::AffinityMask,
            Self::ImpersonationToken(_) => ThreadInfoClass::ImpersonationToken,
            Self::QuerySetWin32StartAddress(_) => ThreadInfoClass::QuerySetWin32StartAddress,
            Self::ZeroTlsCell(_) => ThreadInfoClass::ZeroTlsCell,
            Self::AmILastThread(_) => ThreadInfoClass::AmILastThread,
            Self::HideFromDebugger(_) => ThreadInfoClass::HideFromDebugger,
        }
    }
}

/// `THREAD_PRIORITY_IDLE` and `THREAD_PRIORITY_TIME_CRITICAL`: the only
/// priorities accepted outside the -2..=2 range.
pub const PRIORITY_SATURATION: i32 = 15;

pub fn is_valid_priority(priority: i32) -> bool {
    (-2..=2).contains(&priority) || priority.abs() == PRIORITY_SATURATION
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_class_from_raw() {
        assert_eq!(ThreadInfoClass::try_from(0u32), Ok(ThreadInfoClass::Basic));
        assert_eq!(
            ThreadInfoClass::try_from(17u32),
            Ok(ThreadInfoClass::HideFromDebugger)
        );
        assert_eq!(
            ThreadInfoClass::try_from(18u32),
            Err(NtStatus::INVALID_INFO_CLASS)
        );
        assert_eq!(u32::from(ThreadInfoClass::ZeroTlsCell), 10);
    }

    #[test]
    fn test_priority_range() {
        assert!(is_valid_priority(0));
        assert!(is_valid_priority(-2));
        assert!(is_valid_priority(15));
        assert!(is_valid_priority(-15));
        assert!(!is_valid_priority(3));
        assert!(!is_valid_priority(-16));
    }
}
