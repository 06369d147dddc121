#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
#[repr(transparent)]
// An NTSTATUS. Unknown values are allowed since the server may forward
// codes we don't name, so this is a newtype rather than an enum.
pub struct NtStatus(u32);

pub type NtResult<T> = Result<T, NtStatus>;

/// Severity, from the top two bits of the code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Severity {
    Success,
    Informational,
    Warning,
    Error,
}

impl NtStatus {
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const WAIT_0: Self = Self(0x0000_0000);
    pub const USER_APC: Self = Self(0x0000_00C0);
    pub const ALERTED: Self = Self(0x0000_0101);
    pub const TIMEOUT: Self = Self(0x0000_0102);
    pub const PENDING: Self = Self(0x0000_0103);
    pub const UNSUCCESSFUL: Self = Self(0xC000_0001);
    pub const NOT_IMPLEMENTED: Self = Self(0xC000_0002);
    pub const INVALID_INFO_CLASS: Self = Self(0xC000_0003);
    pub const INFO_LENGTH_MISMATCH: Self = Self(0xC000_0004);
    pub const INVALID_HANDLE: Self = Self(0xC000_0008);
    pub const INVALID_CID: Self = Self(0xC000_000B);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);
    pub const NO_MEMORY: Self = Self(0xC000_0017);
    pub const ACCESS_DENIED: Self = Self(0xC000_0022);
    pub const OBJECT_TYPE_MISMATCH: Self = Self(0xC000_0024);
    pub const SUSPEND_COUNT_EXCEEDED: Self = Self(0xC000_004A);
    pub const THREAD_IS_TERMINATING: Self = Self(0xC000_004B);
    pub const INSUFFICIENT_RESOURCES: Self = Self(0xC000_009A);
    pub const PIPE_DISCONNECTED: Self = Self(0xC000_00B0);
    pub const PROCESS_IS_TERMINATING: Self = Self(0xC000_010A);
    pub const TOO_MANY_OPENED_FILES: Self = Self(0xC000_011F);
    pub const INVALID_THREAD: Self = Self(0xC000_071C);

    // Aliases

    /// Exit code reported for threads that haven't exited yet.
    pub const STILL_ACTIVE: Self = Self::PENDING;

    pub const fn from_u32(val: u32) -> Self {
        Self(val)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn severity(self) -> Severity {
        match self.0 >> 30 {
            0 => Severity::Success,
            1 => Severity::Informational,
            2 => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Success and informational codes count as success, like `NT_SUCCESS`.
    pub const fn is_success(self) -> bool {
        matches!(self.severity(), Severity::Success | Severity::Informational)
    }

    pub const fn is_error(self) -> bool {
        matches!(self.severity(), Severity::Error)
    }

    /// `Ok(self)` for success codes, `Err(self)` otherwise. Informational
    /// codes such as [`NtStatus::TIMEOUT`] are returned as `Ok` so callers can
    /// distinguish them.
    pub fn ok(self) -> NtResult<NtStatus> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self)
        }
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::SUCCESS => "STATUS_SUCCESS",
            Self::USER_APC => "STATUS_USER_APC",
            Self::ALERTED => "STATUS_ALERTED",
            Self::TIMEOUT => "STATUS_TIMEOUT",
            Self::PENDING => "STATUS_PENDING",
            Self::UNSUCCESSFUL => "STATUS_UNSUCCESSFUL",
            Self::NOT_IMPLEMENTED => "STATUS_NOT_IMPLEMENTED",
            Self::INVALID_INFO_CLASS => "STATUS_INVALID_INFO_CLASS",
            Self::INFO_LENGTH_MISMATCH => "STATUS_INFO_LENGTH_MISMATCH",
            Self::INVALID_HANDLE => "STATUS_INVALID_HANDLE",
            Self::INVALID_CID => "STATUS_INVALID_CID",
            Self::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            Self::NO_MEMORY => "STATUS_NO_MEMORY",
            Self::ACCESS_DENIED => "STATUS_ACCESS_DENIED",
            Self::OBJECT_TYPE_MISMATCH => "STATUS_OBJECT_TYPE_MISMATCH",
            Self::SUSPEND_COUNT_EXCEEDED => "STATUS_SUSPEND_COUNT_EXCEEDED",
            Self::THREAD_IS_TERMINATING => "STATUS_THREAD_IS_TERMINATING",
            Self::INSUFFICIENT_RESOURCES => "STATUS_INSUFFICIENT_RESOURCES",
            Self::PIPE_DISCONNECTED => "STATUS_PIPE_DISCONNECTED",
            Self::PROCESS_IS_TERMINATING => "STATUS_PROCESS_IS_TERMINATING",
            Self::TOO_MANY_OPENED_FILES => "STATUS_TOO_MANY_OPENED_FILES",
            Self::INVALID_THREAD => "STATUS_INVALID_THREAD",
            _ => return None,
        })
    }
}

impl From<NtStatus> for u32 {
    fn from(val: NtStatus) -> u32 {
        val.0
    }
}

impl From<u32> for NtStatus {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl core::fmt::Debug for NtStatus {
    fn fmt(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => write!(formatter, "NtStatus::{name}"),
            None => write!(formatter, "NtStatus::<{:#010x}>", self.0),
        }
    }
}

impl core::fmt::Display for NtStatus {
    fn fmt(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => write!(formatter, "{name} ({:#010x})", self.0),
            None => write!(formatter, "{:#010x}", self.0),
        }
    }
}

impl core::error::Error for NtStatus {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_severity() {
        assert_eq!(NtStatus::SUCCESS.severity(), Severity::Success);
        assert_eq!(NtStatus::TIMEOUT.severity(), Severity::Success);
        assert_eq!(NtStatus::ACCESS_DENIED.severity(), Severity::Error);
        assert_eq!(NtStatus::from_u32(0x8000_0005).severity(), Severity::Warning);
        assert_eq!(NtStatus::from_u32(0x4000_0000).severity(), Severity::Informational);
    }

    #[test]
    fn test_ok() {
        assert_eq!(NtStatus::SUCCESS.ok(), Ok(NtStatus::SUCCESS));
        assert_eq!(NtStatus::USER_APC.ok(), Ok(NtStatus::USER_APC));
        assert_eq!(NtStatus::NO_MEMORY.ok(), Err(NtStatus::NO_MEMORY));
        assert!(!NtStatus::PENDING.is_error());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(
            format!("{:?}", NtStatus::INVALID_HANDLE),
            "NtStatus::STATUS_INVALID_HANDLE"
        );
        assert_eq!(
            format!("{}", NtStatus::NO_MEMORY),
            "STATUS_NO_MEMORY (0xc0000017)"
        );
        assert_eq!(
            format!("{:?}", NtStatus::from_u32(0xC0FF_EE00)),
            "NtStatus::<0xc0ffee00>"
        );
    }

    #[test]
    fn test_still_active_is_pending() {
        assert_eq!(NtStatus::STILL_ACTIVE.to_u32(), 259);
    }
}
