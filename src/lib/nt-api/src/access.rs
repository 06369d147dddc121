use bitflags::bitflags;

/// Standard rights shared by every object type.
const SYNCHRONIZE: u32 = 0x0010_0000;
const STANDARD_RIGHTS_REQUIRED: u32 = 0x000F_0000;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct ThreadAccess: u32 {
        const TERMINATE = 0x0001;
        const SUSPEND_RESUME = 0x0002;
        const GET_CONTEXT = 0x0008;
        const SET_CONTEXT = 0x0010;
        const SET_INFORMATION = 0x0020;
        const QUERY_INFORMATION = 0x0040;
        const SET_THREAD_TOKEN = 0x0080;
        const IMPERSONATE = 0x0100;
        const DIRECT_IMPERSONATION = 0x0200;
        const SET_LIMITED_INFORMATION = 0x0400;
        const QUERY_LIMITED_INFORMATION = 0x0800;
        const RESUME = 0x1000;
        const DELETE = 0x0001_0000;
        const READ_CONTROL = 0x0002_0000;
        const WRITE_DAC = 0x0004_0000;
        const WRITE_OWNER = 0x0008_0000;
        const SYNCHRONIZE = SYNCHRONIZE;
        const ALL_ACCESS = STANDARD_RIGHTS_REQUIRED | SYNCHRONIZE | 0xFFFF;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct ProcessAccess: u32 {
        const TERMINATE = 0x0001;
        const CREATE_THREAD = 0x0002;
        const VM_OPERATION = 0x0008;
        const VM_READ = 0x0010;
        const VM_WRITE = 0x0020;
        const DUP_HANDLE = 0x0040;
        const CREATE_PROCESS = 0x0080;
        const SET_QUOTA = 0x0100;
        const SET_INFORMATION = 0x0200;
        const QUERY_INFORMATION = 0x0400;
        const SUSPEND_RESUME = 0x0800;
        const QUERY_LIMITED_INFORMATION = 0x1000;
        const SYNCHRONIZE = SYNCHRONIZE;
        const ALL_ACCESS = STANDARD_RIGHTS_REQUIRED | SYNCHRONIZE | 0xFFFF;
    }
}
