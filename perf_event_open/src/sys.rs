#![allow(non_upper_case_globals)]

use std::io;
use std::mem;

use libc::{self, c_int, c_ulong, pid_t};

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;
pub const PERF_TYPE_HW_CACHE: u32 = 3;
pub const PERF_TYPE_RAW: u32 = 4;
pub const PERF_TYPE_BREAKPOINT: u32 = 5;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
pub const PERF_COUNT_HW_BUS_CYCLES: u64 = 6;
pub const PERF_COUNT_HW_STALLED_CYCLES_FRONTEND: u64 = 7;
pub const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 8;
pub const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_CPU_MIGRATIONS: u64 = 4;
pub const PERF_COUNT_SW_PAGE_FAULTS_MIN: u64 = 5;
pub const PERF_COUNT_SW_PAGE_FAULTS_MAJ: u64 = 6;
pub const PERF_COUNT_SW_ALIGNMENT_FAULTS: u64 = 7;
pub const PERF_COUNT_SW_EMULATION_FAULTS: u64 = 8;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

pub const PERF_COUNT_HW_CACHE_L1D: u64 = 0;
pub const PERF_COUNT_HW_CACHE_L1I: u64 = 1;
pub const PERF_COUNT_HW_CACHE_LL: u64 = 2;
pub const PERF_COUNT_HW_CACHE_DTLB: u64 = 3;
pub const PERF_COUNT_HW_CACHE_ITLB: u64 = 4;
pub const PERF_COUNT_HW_CACHE_BPU: u64 = 5;
pub const PERF_COUNT_HW_CACHE_NODE: u64 = 6;

pub const PERF_COUNT_HW_CACHE_OP_READ: u64 = 0;
pub const PERF_COUNT_HW_CACHE_OP_WRITE: u64 = 1;
pub const PERF_COUNT_HW_CACHE_OP_PREFETCH: u64 = 2;

pub const PERF_COUNT_HW_CACHE_RESULT_ACCESS: u64 = 0;
pub const PERF_COUNT_HW_CACHE_RESULT_MISS: u64 = 1;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;
pub const PERF_SAMPLE_READ: u64 = 1 << 4;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_ID: u64 = 1 << 6;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_PERIOD: u64 = 1 << 8;
pub const PERF_SAMPLE_STREAM_ID: u64 = 1 << 9;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub const PERF_SAMPLE_BRANCH_STACK: u64 = 1 << 11;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;
pub const PERF_SAMPLE_WEIGHT: u64 = 1 << 14;
pub const PERF_SAMPLE_DATA_SRC: u64 = 1 << 15;
pub const PERF_SAMPLE_IDENTIFIER: u64 = 1 << 16;
pub const PERF_SAMPLE_TRANSACTION: u64 = 1 << 17;
pub const PERF_SAMPLE_REGS_INTR: u64 = 1 << 18;

pub const PERF_SAMPLE_REGS_ABI_NONE: u64 = 0;
pub const PERF_SAMPLE_REGS_ABI_32: u64 = 1;
pub const PERF_SAMPLE_REGS_ABI_64: u64 = 2;

pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
pub const PERF_FORMAT_ID: u64 = 1 << 2;
pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

pub const PERF_SAMPLE_BRANCH_USER: u64 = 1 << 0;
pub const PERF_SAMPLE_BRANCH_KERNEL: u64 = 1 << 1;
pub const PERF_SAMPLE_BRANCH_HV: u64 = 1 << 2;
pub const PERF_SAMPLE_BRANCH_ANY: u64 = 1 << 3;
pub const PERF_SAMPLE_BRANCH_ANY_CALL: u64 = 1 << 4;
pub const PERF_SAMPLE_BRANCH_ANY_RETURN: u64 = 1 << 5;
pub const PERF_SAMPLE_BRANCH_IND_CALL: u64 = 1 << 6;

pub const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const PERF_ATTR_FLAG_INHERIT: u64 = 1 << 1;
pub const PERF_ATTR_FLAG_PINNED: u64 = 1 << 2;
pub const PERF_ATTR_FLAG_EXCLUSIVE: u64 = 1 << 3;
pub const PERF_ATTR_FLAG_EXCLUDE_USER: u64 = 1 << 4;
pub const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const PERF_ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;
pub const PERF_ATTR_FLAG_EXCLUDE_IDLE: u64 = 1 << 7;
pub const PERF_ATTR_FLAG_MMAP: u64 = 1 << 8;
pub const PERF_ATTR_FLAG_COMM: u64 = 1 << 9;
pub const PERF_ATTR_FLAG_FREQ: u64 = 1 << 10;
pub const PERF_ATTR_FLAG_INHERIT_STAT: u64 = 1 << 11;
pub const PERF_ATTR_FLAG_ENABLE_ON_EXEC: u64 = 1 << 12;
pub const PERF_ATTR_FLAG_TASK: u64 = 1 << 13;
pub const PERF_ATTR_FLAG_WATERMARK: u64 = 1 << 14;
pub const PERF_ATTR_FLAG_PRECISE_IP_SHIFT: u64 = 15;
pub const PERF_ATTR_FLAG_PRECISE_IP_MASK: u64 = 3 << PERF_ATTR_FLAG_PRECISE_IP_SHIFT;
pub const PERF_ATTR_FLAG_MMAP_DATA: u64 = 1 << 17;
pub const PERF_ATTR_FLAG_SAMPLE_ID_ALL: u64 = 1 << 18;
pub const PERF_ATTR_FLAG_EXCLUDE_HOST: u64 = 1 << 19;
pub const PERF_ATTR_FLAG_EXCLUDE_GUEST: u64 = 1 << 20;
pub const PERF_ATTR_FLAG_EXCLUDE_CALLCHAIN_KERNEL: u64 = 1 << 21;
pub const PERF_ATTR_FLAG_EXCLUDE_CALLCHAIN_USER: u64 = 1 << 22;
pub const PERF_ATTR_FLAG_MMAP2: u64 = 1 << 23;

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_READ: u32 = 8;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;
pub const PERF_RECORD_AUX: u32 = 11;

pub const PERF_RECORD_MISC_CPUMODE_MASK: u16 = 7;
pub const PERF_RECORD_MISC_KERNEL: u16 = 1;
pub const PERF_RECORD_MISC_USER: u16 = 2;
pub const PERF_RECORD_MISC_COMM_EXEC: u16 = 1 << 13;
pub const PERF_RECORD_MISC_EXACT_IP: u16 = 1 << 14;

pub const PERF_CONTEXT_HV: u64 = -32_i64 as u64;
pub const PERF_CONTEXT_KERNEL: u64 = -128_i64 as u64;
pub const PERF_CONTEXT_USER: u64 = -512_i64 as u64;
pub const PERF_CONTEXT_MAX: u64 = -4095_i64 as u64;

pub const PERF_FLAG_FD_NO_GROUP: c_ulong = 1 << 0;
pub const PERF_FLAG_FD_OUTPUT: c_ulong = 1 << 1;
pub const PERF_FLAG_PID_CGROUP: c_ulong = 1 << 2;
pub const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

pub const PERF_ATTR_SIZE_VER5: u32 = 112;

#[cfg(any(target_arch = "mips", target_arch = "mips64", target_arch = "powerpc", target_arch = "powerpc64"))]
mod ioc {
    pub const NONE: u64 = 1;
    pub const READ: u64 = 2;
    pub const WRITE: u64 = 4;
    pub const SIZEBITS: u64 = 13;
    pub const DIRSHIFT: u64 = 29;
}

#[cfg(not(any(target_arch = "mips", target_arch = "mips64", target_arch = "powerpc", target_arch = "powerpc64")))]
mod ioc {
    pub const NONE: u64 = 0;
    pub const READ: u64 = 2;
    pub const WRITE: u64 = 1;
    pub const SIZEBITS: u64 = 14;
    pub const DIRSHIFT: u64 = 30;
}

const fn ioc( dir: u64, kind: u64, nr: u64, size: u64 ) -> u64 {
    (dir << ioc::DIRSHIFT) | ((size & ((1 << ioc::SIZEBITS) - 1)) << 16) | (kind << 8) | nr
}

const PERF_IOC_MAGIC: u64 = b'$' as u64;

pub const PERF_EVENT_IOC_ENABLE: u64 = ioc( ioc::NONE, PERF_IOC_MAGIC, 0, 0 );
pub const PERF_EVENT_IOC_DISABLE: u64 = ioc( ioc::NONE, PERF_IOC_MAGIC, 1, 0 );
pub const PERF_EVENT_IOC_REFRESH: u64 = ioc( ioc::NONE, PERF_IOC_MAGIC, 2, 0 );
pub const PERF_EVENT_IOC_RESET: u64 = ioc( ioc::NONE, PERF_IOC_MAGIC, 3, 0 );
pub const PERF_EVENT_IOC_SET_OUTPUT: u64 = ioc( ioc::NONE, PERF_IOC_MAGIC, 5, 0 );
pub const PERF_EVENT_IOC_ID: u64 = ioc( ioc::READ, PERF_IOC_MAGIC, 7, 8 );
pub const PERF_EVENT_IOC_PAUSE_OUTPUT: u64 = ioc( ioc::WRITE, PERF_IOC_MAGIC, 9, 4 );

/// The `perf_event_attr` structure as of `PERF_ATTR_SIZE_VER5`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct PerfEventAttr {
    pub kind: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub bp_addr_or_config1: u64,
    pub bp_len_or_config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved: u16
}

impl Default for PerfEventAttr {
    fn default() -> Self {
        let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
        attr.size = mem::size_of::< PerfEventAttr >() as u32;
        attr
    }
}

impl PerfEventAttr {
    #[inline]
    pub fn has_flag( &self, flag: u64 ) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub fn set_flag( &mut self, flag: u64, value: bool ) {
        if value {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    pub fn precise_ip( &self ) -> u64 {
        (self.flags & PERF_ATTR_FLAG_PRECISE_IP_MASK) >> PERF_ATTR_FLAG_PRECISE_IP_SHIFT
    }

    pub fn set_precise_ip( &mut self, value: u64 ) {
        self.flags &= !PERF_ATTR_FLAG_PRECISE_IP_MASK;
        self.flags |= (value << PERF_ATTR_FLAG_PRECISE_IP_SHIFT) & PERF_ATTR_FLAG_PRECISE_IP_MASK;
    }

    /// Serializes the structure exactly as the kernel lays it out.
    pub fn as_bytes( &self ) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts( self as *const PerfEventAttr as *const u8, mem::size_of::< PerfEventAttr >() )
        }
    }

    /// Builds an attr from a possibly differently sized on-disk copy.
    ///
    /// Copies `min( bytes.len(), size_of::< PerfEventAttr >() )` bytes and zero-fills the rest.
    pub fn from_bytes( bytes: &[u8] ) -> Self {
        let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
        let length = std::cmp::min( bytes.len(), mem::size_of::< PerfEventAttr >() );
        unsafe {
            std::ptr::copy_nonoverlapping( bytes.as_ptr(), &mut attr as *mut PerfEventAttr as *mut u8, length );
        }
        attr
    }
}

#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub reserved: [u8; 116 * 8],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64
}

pub fn sys_perf_event_open( attr: &PerfEventAttr, pid: pid_t, cpu: c_int, group_fd: c_int, flags: c_ulong ) -> io::Result< c_int > {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            flags
        )
    };

    if fd < 0 {
        Err( io::Error::last_os_error() )
    } else {
        Ok( fd as c_int )
    }
}

#[test]
fn test_struct_sizes() {
    assert_eq!( mem::size_of::< PerfEventAttr >(), PERF_ATTR_SIZE_VER5 as usize );
    assert_eq!( mem::size_of::< PerfEventMmapPage >(), 1088 );
}

#[test]
fn test_ioctl_numbers() {
    if cfg!( target_arch = "x86_64" ) || cfg!( target_arch = "aarch64" ) {
        assert_eq!( PERF_EVENT_IOC_ENABLE, 0x2400 );
        assert_eq!( PERF_EVENT_IOC_SET_OUTPUT, 0x2405 );
        assert_eq!( PERF_EVENT_IOC_ID, 0x80082407 );
    }
}

#[test]
fn test_attr_from_short_bytes() {
    let mut attr = PerfEventAttr::default();
    attr.kind = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_CPU_CLOCK;
    attr.sample_max_stack = 127;

    let short = &attr.as_bytes()[ 0..64 ];
    let copy = PerfEventAttr::from_bytes( short );
    assert_eq!( copy.kind, PERF_TYPE_SOFTWARE );
    assert_eq!( copy.config, PERF_COUNT_SW_CPU_CLOCK );
    assert_eq!( copy.sample_max_stack, 0 );

    let mut long = attr.as_bytes().to_vec();
    long.extend_from_slice( &[0xff; 16] );
    assert_eq!( PerfEventAttr::from_bytes( &long ), attr );
}
