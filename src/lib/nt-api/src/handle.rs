/// A kernel object handle, valid only within the process whose handle table
/// holds it. The two pseudo handles are valid everywhere.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    pub const NULL: Self = Self(0);
    /// `NtCurrentProcess()`, i.e. `(HANDLE)-1`.
    pub const CURRENT_PROCESS: Self = Self(u64::MAX);
    /// `NtCurrentThread()`, i.e. `(HANDLE)-2`.
    pub const CURRENT_THREAD: Self = Self(u64::MAX - 1);

    pub const fn from_raw(val: u64) -> Self {
        Self(val)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }

    pub const fn is_pseudo(self) -> bool {
        self.0 == Self::CURRENT_PROCESS.0 || self.0 == Self::CURRENT_THREAD.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Self::CURRENT_PROCESS => f.write_str("Handle::CURRENT_PROCESS"),
            Self::CURRENT_THREAD => f.write_str("Handle::CURRENT_THREAD"),
            Self(val) => write!(f, "Handle({val:#x})"),
        }
    }
}

/// `CLIENT_ID`: process and thread ids, as laid out in the TEB.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[repr(C)]
pub struct ClientId {
    pub process: u64,
    pub thread: u64,
}

impl ClientId {
    pub fn new(process: u32, thread: u32) -> Self {
        Self {
            process: process.into(),
            thread: thread.into(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.process as u32
    }

    pub fn tid(&self) -> u32 {
        self.thread as u32
    }
}
