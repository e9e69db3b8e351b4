use crate::record::RegsUser;

macro_rules! mask {
    ($item:tt, $($next_item:tt),+) => { mask!( $item ) | mask!( $($next_item),+ ) };
    ($item:tt) => { (1_u64 << $item) };
    () => { 0 };
}

macro_rules! define_regs {
    (sp = $sp:expr, fp = $fp:expr, ip = $ip:expr, $($perf_reg:tt => $name:expr),+) => {
        pub const REG_MASK: u64 = mask!( $($perf_reg),+ );
        pub const SP: u32 = $sp;
        pub const FP: u32 = $fp;
        pub const IP: u32 = $ip;

        pub fn reg_name( reg: u32 ) -> Option< &'static str > {
            match reg {
                $($perf_reg => Some( $name ),)+
                _ => None
            }
        }
    }
}

pub mod amd64 {
    // DS, ES, FS and GS are rejected by the kernel when sampled.
    define_regs!(
        sp = 7, fp = 6, ip = 8,
        0 => "rax",
        1 => "rbx",
        2 => "rcx",
        3 => "rdx",
        4 => "rsi",
        5 => "rdi",
        6 => "rbp",
        7 => "rsp",
        8 => "rip",
        9 => "flags",
        10 => "cs",
        11 => "ss",
        16 => "r8",
        17 => "r9",
        18 => "r10",
        19 => "r11",
        20 => "r12",
        21 => "r13",
        22 => "r14",
        23 => "r15"
    );
}

pub mod arm {
    define_regs!(
        sp = 13, fp = 11, ip = 15,
        0 => "r0",
        1 => "r1",
        2 => "r2",
        3 => "r3",
        4 => "r4",
        5 => "r5",
        6 => "r6",
        7 => "r7",
        8 => "r8",
        9 => "r9",
        10 => "r10",
        11 => "fp",
        12 => "ip",
        13 => "sp",
        14 => "lr",
        15 => "pc"
    );
}

pub mod arm64 {
    define_regs!(
        sp = 31, fp = 29, ip = 32,
        0 => "x0", 1 => "x1", 2 => "x2", 3 => "x3", 4 => "x4", 5 => "x5", 6 => "x6", 7 => "x7",
        8 => "x8", 9 => "x9", 10 => "x10", 11 => "x11", 12 => "x12", 13 => "x13", 14 => "x14", 15 => "x15",
        16 => "x16", 17 => "x17", 18 => "x18", 19 => "x19", 20 => "x20", 21 => "x21", 22 => "x22", 23 => "x23",
        24 => "x24", 25 => "x25", 26 => "x26", 27 => "x27", 28 => "x28", 29 => "x29", 30 => "lr",
        31 => "sp",
        32 => "pc"
    );
}

pub mod native {
    #[cfg(target_arch = "x86_64")]
    pub use super::amd64::*;

    #[cfg(target_arch = "arm")]
    pub use super::arm::*;

    #[cfg(target_arch = "aarch64")]
    pub use super::arm64::*;

    #[cfg(not(any(target_arch = "x86_64", target_arch = "arm", target_arch = "aarch64")))]
    mod unsupported {
        pub const REG_MASK: u64 = 0;
        pub const SP: u32 = 0;
        pub const FP: u32 = 0;
        pub const IP: u32 = 0;

        pub fn reg_name( _: u32 ) -> Option< &'static str > {
            None
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "arm", target_arch = "aarch64")))]
    pub use self::unsupported::*;
}

/// A `RegsUser` dump paired with the register numbers of the mask it was sampled with.
pub struct SampledRegs< 'a > {
    regs: &'a RegsUser
}

impl< 'a > SampledRegs< 'a > {
    pub fn new( regs: &'a RegsUser ) -> Self {
        SampledRegs { regs }
    }

    /// Returns the value of register `reg`, if it was sampled.
    pub fn get( &self, reg: u32 ) -> Option< u64 > {
        if reg >= 64 || self.regs.mask & (1 << reg) == 0 {
            return None;
        }

        let index = (self.regs.mask & ((1 << reg) - 1)).count_ones() as usize;
        self.regs.regs.get( index ).cloned()
    }

    pub fn iter( &self ) -> impl Iterator< Item = (u32, u64) > + 'a {
        let mask = self.regs.mask;
        (0..64).filter( move |reg| mask & (1 << reg) != 0 ).zip( self.regs.regs.iter().cloned() )
    }
}

#[test]
fn test_sampled_regs() {
    let regs = RegsUser { abi: 2, mask: (1 << 3) | (1 << 7) | (1 << 8), regs: vec![ 10, 20, 30 ] };
    let sampled = SampledRegs::new( &regs );
    assert_eq!( sampled.get( amd64::SP ), Some( 20 ) );
    assert_eq!( sampled.get( amd64::IP ), Some( 30 ) );
    assert_eq!( sampled.get( 4 ), None );
    assert_eq!( sampled.iter().collect::< Vec< _ > >(), vec![ (3, 10), (7, 20), (8, 30) ] );
    assert_eq!( amd64::reg_name( 8 ), Some( "rip" ) );
    assert_eq!( arm64::REG_MASK, 0x1_ffff_ffff );
}
