use std::io;

use byteorder::{ByteOrder, NativeEndian};
use perf_event_open::sys::PERF_SAMPLE_REGS_ABI_32;

use crate::perf_regs::{self, SampledRegs};
use crate::record::{RegsUser, StackUser};
use crate::thread_tree::ThreadEntry;

const MAX_FRAMES: usize = 1024;

/// Turns a sampled user register set and stack dump into `(ip, sp)` frames, innermost first.
pub trait OfflineUnwinder {
    fn unwind( &mut self, thread: &ThreadEntry, regs: &RegsUser, stack: &StackUser ) -> Vec< (u64, u64) >;
}

/// A range of consecutively executed instructions decoded from a hardware trace.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct InstrRange {
    pub cpu: u32,
    pub start_addr: u64,
    pub end_addr: u64,
    pub branch_taken_count: u64,
    pub branch_not_taken_count: u64
}

/// Decodes raw hardware trace bytes into executed instruction ranges.
pub trait EtmDecoder {
    fn decode( &mut self, cpu: u32, data: &[u8], callback: &mut dyn FnMut( InstrRange ) ) -> io::Result< () >;
}

/// Reads words out of a user stack dump which starts at `sp`.
pub struct StackReader< 'a > {
    base: u64,
    data: &'a [u8],
    word_size: usize
}

impl< 'a > StackReader< 'a > {
    pub fn new( regs: &RegsUser, stack: &'a StackUser, sp: u64 ) -> Self {
        let valid_size = if stack.dynamic_size == 0 {
            stack.data.len()
        } else {
            std::cmp::min( stack.dynamic_size as usize, stack.data.len() )
        };

        StackReader {
            base: sp,
            data: &stack.data[ ..valid_size ],
            word_size: if regs.abi == PERF_SAMPLE_REGS_ABI_32 { 4 } else { 8 }
        }
    }

    #[inline]
    pub fn word_size( &self ) -> u64 {
        self.word_size as u64
    }

    pub fn read_word( &self, address: u64 ) -> Option< u64 > {
        let offset = address.checked_sub( self.base )? as usize;
        let bytes = self.data.get( offset..offset.checked_add( self.word_size )? )?;
        if self.word_size == 4 {
            Some( NativeEndian::read_u32( bytes ) as u64 )
        } else {
            Some( NativeEndian::read_u64( bytes ) )
        }
    }
}

/// Follows the chain of saved frame pointers through the stack dump.
///
/// Only works for code compiled with frame pointers; stops at the first frame
/// record which points outside of the dump or doesn't move up the stack.
pub struct FramePointerUnwinder {
    sp_reg: u32,
    fp_reg: u32,
    ip_reg: u32
}

impl FramePointerUnwinder {
    pub fn new( sp_reg: u32, fp_reg: u32, ip_reg: u32 ) -> Self {
        FramePointerUnwinder { sp_reg, fp_reg, ip_reg }
    }

    pub fn native() -> Self {
        FramePointerUnwinder::new( perf_regs::native::SP, perf_regs::native::FP, perf_regs::native::IP )
    }
}

impl OfflineUnwinder for FramePointerUnwinder {
    fn unwind( &mut self, thread: &ThreadEntry, regs: &RegsUser, stack: &StackUser ) -> Vec< (u64, u64) > {
        let sampled = SampledRegs::new( regs );
        let (ip, sp) = match (sampled.get( self.ip_reg ), sampled.get( self.sp_reg )) {
            (Some( ip ), Some( sp )) => (ip, sp),
            _ => {
                debug!( "Sample of thread {} lacks the ip or sp register", thread.tid );
                return Vec::new();
            }
        };

        let mut frames = vec![ (ip, sp) ];
        let mut fp = match sampled.get( self.fp_reg ) {
            Some( fp ) => fp,
            None => return frames
        };

        let reader = StackReader::new( regs, stack, sp );
        let word_size = reader.word_size();
        while frames.len() < MAX_FRAMES {
            let (next_fp, return_address) = match (reader.read_word( fp ), reader.read_word( fp.wrapping_add( word_size ) )) {
                (Some( next_fp ), Some( return_address )) => (next_fp, return_address),
                _ => break
            };

            if return_address == 0 {
                break;
            }

            frames.push( (return_address, fp + 2 * word_size) );
            if next_fp <= fp {
                break;
            }

            fp = next_fp;
        }

        trace!( "Unwound {} frames for thread {}", frames.len(), thread.tid );
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use perf_event_open::sys::PERF_SAMPLE_REGS_ABI_64;
    use std::sync::Arc;

    fn thread() -> ThreadEntry {
        ThreadEntry {
            pid: 10,
            tid: 11,
            comm: Arc::from( "main" ),
            exited: false
        }
    }

    fn regs( ip: u64, sp: u64, fp: u64 ) -> RegsUser {
        let mask = (1 << perf_regs::amd64::FP) | (1 << perf_regs::amd64::SP) | (1 << perf_regs::amd64::IP);
        RegsUser { abi: PERF_SAMPLE_REGS_ABI_64, mask, regs: vec![ fp, sp, ip ] }
    }

    fn stack( words: &[u64] ) -> StackUser {
        let mut data = Vec::new();
        for &word in words {
            data.write_u64::< NativeEndian >( word ).unwrap();
        }

        let dynamic_size = data.len() as u64;
        StackUser { data, dynamic_size }
    }

    #[test]
    fn test_frame_pointer_chain() {
        let sp = 0x7000;
        // Two frame records at 0x7010 and 0x7030; the outermost ends the chain with a null return address.
        let stack = stack( &[
            0, 0,
            0x7030, 0x4000_1234,
            0, 0,
            0x0, 0x4000_5678,
            0, 0
        ]);

        let mut unwinder = FramePointerUnwinder::new( perf_regs::amd64::SP, perf_regs::amd64::FP, perf_regs::amd64::IP );
        let frames = unwinder.unwind( &thread(), &regs( 0x4000_0000, sp, 0x7010 ), &stack );
        assert_eq!( frames, vec![
            (0x4000_0000, 0x7000),
            (0x4000_1234, 0x7020),
            (0x4000_5678, 0x7040)
        ]);
    }

    #[test]
    fn test_frame_pointer_outside_of_the_dump() {
        let stack = stack( &[ 0x9000, 0x4000_1234 ] );
        let mut unwinder = FramePointerUnwinder::new( perf_regs::amd64::SP, perf_regs::amd64::FP, perf_regs::amd64::IP );
        let frames = unwinder.unwind( &thread(), &regs( 0x4000_0000, 0x7000, 0x8000 ), &stack );
        assert_eq!( frames, vec![ (0x4000_0000, 0x7000) ] );
    }

    #[test]
    fn test_missing_registers() {
        let regs = RegsUser { abi: PERF_SAMPLE_REGS_ABI_64, mask: 0, regs: Vec::new() };
        let mut unwinder = FramePointerUnwinder::native();
        assert!( unwinder.unwind( &thread(), &regs, &stack( &[] ) ).is_empty() );
    }

    #[test]
    fn test_stack_reader_respects_dynamic_size() {
        let mut stack = stack( &[ 1, 2, 3 ] );
        stack.dynamic_size = 16;
        let regs = regs( 0, 0x1000, 0 );
        let reader = StackReader::new( &regs, &stack, 0x1000 );
        assert_eq!( reader.read_word( 0x1008 ), Some( 2 ) );
        assert_eq!( reader.read_word( 0x1010 ), None );
        assert_eq!( reader.read_word( 0xff8 ), None );
    }
}
