use std::fmt;
use std::io::{self, Read};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use perf_event_open::sys::*;

use crate::build_id::{BuildId, BUILD_ID_SIZE};
use crate::utils::{align, invalid_data, until_nul, HexValue};

pub const RECORD_HEADER_SIZE: usize = 8;

pub const PERF_RECORD_USER_DEFINED_TYPE_START: u32 = 64;
pub const PERF_RECORD_TRACING_DATA: u32 = 66;
pub const PERF_RECORD_BUILD_ID: u32 = 67;

pub const SIMPLE_PERF_RECORD_TYPE_START: u32 = 32768;
pub const SIMPLE_PERF_RECORD_SPLIT: u32 = 32772;
pub const SIMPLE_PERF_RECORD_SPLIT_END: u32 = 32773;
pub const SIMPLE_PERF_RECORD_EVENT_ID: u32 = 32774;
pub const SIMPLE_PERF_RECORD_TRACING_DATA: u32 = 32777;

pub const MAX_RECORD_SIZE_IN_KERNEL_FORMAT: usize = 65535;

/// The `{type, misc, size}` prefix of every record.
///
/// Records of our own types store the upper 16 bits of `size` in `misc`,
/// which lifts the size limit from 64 KiB to 4 GiB.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RecordHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u32
}

impl RecordHeader {
    pub fn parse( bytes: &[u8] ) -> io::Result< Self > {
        let mut cur = io::Cursor::new( bytes );
        let kind = cur.read_u32::< NativeEndian >()?;
        let misc = cur.read_u16::< NativeEndian >()?;
        let size = cur.read_u16::< NativeEndian >()?;

        let header = if kind >= SIMPLE_PERF_RECORD_TYPE_START {
            RecordHeader { kind, misc: 0, size: ((misc as u32) << 16) | size as u32 }
        } else {
            RecordHeader { kind, misc, size: size as u32 }
        };

        if (header.size as usize) < RECORD_HEADER_SIZE {
            return Err( invalid_data( format!( "record of type {} has an invalid size of {}", header.kind, header.size ) ) );
        }

        Ok( header )
    }

    pub fn write_to( &self, output: &mut Vec< u8 > ) -> io::Result< () > {
        output.write_u32::< NativeEndian >( self.kind )?;
        if self.kind >= SIMPLE_PERF_RECORD_TYPE_START {
            output.write_u16::< NativeEndian >( (self.size >> 16) as u16 )?;
            output.write_u16::< NativeEndian >( self.size as u16 )?;
        } else {
            if self.size as usize > MAX_RECORD_SIZE_IN_KERNEL_FORMAT {
                return Err( invalid_data( format!( "record of type {} is too large: {} bytes", self.kind, self.size ) ) );
            }
            output.write_u16::< NativeEndian >( self.misc )?;
            output.write_u16::< NativeEndian >( self.size as u16 )?;
        }

        Ok(())
    }
}

/// The `sample_id` block appended to non-sample records when `sample_id_all` is set.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct SampleId {
    pub sample_id_all: bool,
    pub sample_type: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
    pub cpu: u32
}

impl SampleId {
    pub fn new( attr: &PerfEventAttr, pid: u32, tid: u32, time: u64, id: u64, cpu: u32 ) -> Self {
        SampleId {
            sample_id_all: attr.has_flag( PERF_ATTR_FLAG_SAMPLE_ID_ALL ),
            sample_type: attr.sample_type,
            pid,
            tid,
            time,
            id,
            stream_id: 0,
            cpu
        }
    }

    pub fn size_for( attr: &PerfEventAttr ) -> usize {
        if !attr.has_flag( PERF_ATTR_FLAG_SAMPLE_ID_ALL ) {
            return 0;
        }

        let mask = PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_ID | PERF_SAMPLE_STREAM_ID | PERF_SAMPLE_CPU | PERF_SAMPLE_IDENTIFIER;
        (attr.sample_type & mask).count_ones() as usize * 8
    }

    fn parse( attr: &PerfEventAttr, data: &[u8] ) -> io::Result< Self > {
        let mut sample_id = SampleId {
            sample_id_all: attr.has_flag( PERF_ATTR_FLAG_SAMPLE_ID_ALL ),
            sample_type: attr.sample_type,
            .. SampleId::default()
        };

        if !sample_id.sample_id_all {
            return Ok( sample_id );
        }

        let mut cur = io::Cursor::new( data );
        let sample_type = attr.sample_type;
        if sample_type & PERF_SAMPLE_TID != 0 {
            sample_id.pid = cur.read_u32::< NativeEndian >()?;
            sample_id.tid = cur.read_u32::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_TIME != 0 {
            sample_id.time = cur.read_u64::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_ID != 0 {
            sample_id.id = cur.read_u64::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_STREAM_ID != 0 {
            sample_id.stream_id = cur.read_u64::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_CPU != 0 {
            sample_id.cpu = cur.read_u32::< NativeEndian >()?;
            let _ = cur.read_u32::< NativeEndian >()?; // Reserved field; is always zero.
        }
        if sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
            sample_id.id = cur.read_u64::< NativeEndian >()?;
        }

        Ok( sample_id )
    }

    fn write_to( &self, output: &mut Vec< u8 > ) -> io::Result< () > {
        if !self.sample_id_all {
            return Ok(());
        }

        let sample_type = self.sample_type;
        if sample_type & PERF_SAMPLE_TID != 0 {
            output.write_u32::< NativeEndian >( self.pid )?;
            output.write_u32::< NativeEndian >( self.tid )?;
        }
        if sample_type & PERF_SAMPLE_TIME != 0 {
            output.write_u64::< NativeEndian >( self.time )?;
        }
        if sample_type & PERF_SAMPLE_ID != 0 {
            output.write_u64::< NativeEndian >( self.id )?;
        }
        if sample_type & PERF_SAMPLE_STREAM_ID != 0 {
            output.write_u64::< NativeEndian >( self.stream_id )?;
        }
        if sample_type & PERF_SAMPLE_CPU != 0 {
            output.write_u32::< NativeEndian >( self.cpu )?;
            output.write_u32::< NativeEndian >( 0 )?;
        }
        if sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
            output.write_u64::< NativeEndian >( self.id )?;
        }

        Ok(())
    }

    fn time( &self ) -> Option< u64 > {
        if self.sample_id_all && self.sample_type & PERF_SAMPLE_TIME != 0 {
            Some( self.time )
        } else {
            None
        }
    }

    fn cpu( &self ) -> Option< u32 > {
        if self.sample_id_all && self.sample_type & PERF_SAMPLE_CPU != 0 {
            Some( self.cpu )
        } else {
            None
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MmapRecord {
    pub pid: u32,
    pub tid: u32,
    pub address: u64,
    pub length: u64,
    pub page_offset: u64,
    pub filename: String,
    pub sample_id: SampleId
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Mmap2Record {
    pub pid: u32,
    pub tid: u32,
    pub address: u64,
    pub length: u64,
    pub page_offset: u64,
    pub major: u32,
    pub minor: u32,
    pub inode: u64,
    pub inode_generation: u64,
    pub protection: u32,
    pub flags: u32,
    pub filename: String,
    pub sample_id: SampleId
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommRecord {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
    pub sample_id: SampleId
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExitOrForkRecord {
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
    pub sample_id: SampleId
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LostRecord {
    pub id: u64,
    pub lost: u64,
    pub sample_id: SampleId
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ThrottleRecord {
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
    pub sample_id: SampleId
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BranchStackItem {
    pub from: u64,
    pub to: u64,
    pub flags: u64
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RegsUser {
    pub abi: u64,
    pub mask: u64,
    pub regs: Vec< u64 >
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StackUser {
    pub data: Vec< u8 >,
    pub dynamic_size: u64
}

#[derive(Clone, PartialEq, Eq, Default)]
pub struct SampleRecord {
    pub sample_type: u64,
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub addr: u64,
    pub id: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub period: u64,
    pub callchain: Vec< u64 >,
    pub raw: Vec< u8 >,
    pub branch_stack: Vec< BranchStackItem >,
    pub regs_user: Option< RegsUser >,
    pub stack_user: Option< StackUser >
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BuildIdRecord {
    pub pid: u32,
    pub build_id: BuildId,
    pub filename: String
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct EventIdEntry {
    pub attr_index: u64,
    pub event_id: u64
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RecordBody {
    Mmap( MmapRecord ),
    Mmap2( Mmap2Record ),
    Comm( CommRecord ),
    Exit( ExitOrForkRecord ),
    Fork( ExitOrForkRecord ),
    Lost( LostRecord ),
    Throttle( ThrottleRecord ),
    Unthrottle( ThrottleRecord ),
    Sample( SampleRecord ),
    BuildId( BuildIdRecord ),
    TracingData( Vec< u8 > ),
    EventId( Vec< EventIdEntry > ),
    Unknown {
        kind: u32,
        payload: Vec< u8 >
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Record {
    pub misc: u16,
    pub body: RecordBody
}

impl fmt::Debug for SampleRecord {
    fn fmt( &self, fmt: &mut fmt::Formatter ) -> Result< (), fmt::Error > {
        fmt.debug_map()
            .entry( &"ip", &HexValue( self.ip ) )
            .entry( &"pid", &self.pid )
            .entry( &"tid", &self.tid )
            .entry( &"time", &self.time )
            .entry( &"id", &self.id )
            .entry( &"cpu", &self.cpu )
            .entry( &"period", &self.period )
            .entry( &"callchain.len", &self.callchain.len() )
            .entry( &"branch_stack.len", &self.branch_stack.len() )
            .entry( &"stack_user.len", &self.stack_user.as_ref().map( |stack| stack.data.len() ).unwrap_or( 0 ) )
            .finish()
    }
}

fn read_bytes< R: Read >( cur: &mut R, length: usize ) -> io::Result< Vec< u8 > > {
    let mut buffer = vec![ 0; length ];
    cur.read_exact( &mut buffer )?;
    Ok( buffer )
}

fn write_padded_string( output: &mut Vec< u8 >, string: &str, alignment: usize ) {
    let length = align( string.len() + 1, alignment );
    output.extend_from_slice( string.as_bytes() );
    output.resize( output.len() + length - string.len(), 0 );
}

fn string_between( data: &[u8], start: usize, end: usize ) -> io::Result< String > {
    if start > end || end > data.len() {
        return Err( invalid_data( "string field exceeds the record" ) );
    }

    Ok( String::from_utf8_lossy( until_nul( &data[ start..end ] ) ).into_owned() )
}

/// The sample_id block sits at the end of the record, after any variable-length field.
fn split_sample_id( attr: &PerfEventAttr, data: &[u8] ) -> io::Result< (usize, SampleId) > {
    let tail_size = SampleId::size_for( attr );
    if data.len() < tail_size {
        return Err( invalid_data( "record is too short for its sample_id block" ) );
    }

    let tail_start = data.len() - tail_size;
    let sample_id = SampleId::parse( attr, &data[ tail_start.. ] )?;
    Ok( (tail_start, sample_id) )
}

impl SampleRecord {
    fn parse( attr: &PerfEventAttr, data: &[u8] ) -> io::Result< Self > {
        let sample_type = attr.sample_type;
        let mut cur = io::Cursor::new( data );
        let mut sample = SampleRecord {
            sample_type,
            .. SampleRecord::default()
        };

        if sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
            sample.id = cur.read_u64::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_IP != 0 {
            sample.ip = cur.read_u64::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_TID != 0 {
            sample.pid = cur.read_u32::< NativeEndian >()?;
            sample.tid = cur.read_u32::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_TIME != 0 {
            sample.time = cur.read_u64::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_ADDR != 0 {
            sample.addr = cur.read_u64::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_ID != 0 {
            sample.id = cur.read_u64::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_STREAM_ID != 0 {
            sample.stream_id = cur.read_u64::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_CPU != 0 {
            sample.cpu = cur.read_u32::< NativeEndian >()?;
            let _ = cur.read_u32::< NativeEndian >()?; // Reserved field; is always zero.
        }
        if sample_type & PERF_SAMPLE_PERIOD != 0 {
            sample.period = cur.read_u64::< NativeEndian >()?;
        }
        if sample_type & PERF_SAMPLE_READ != 0 {
            return Err( invalid_data( "PERF_SAMPLE_READ is not supported" ) );
        }
        if sample_type & PERF_SAMPLE_CALLCHAIN != 0 {
            let length = cur.read_u64::< NativeEndian >()?;
            if length > (data.len() / 8) as u64 {
                return Err( invalid_data( format!( "callchain of {} entries exceeds the record", length ) ) );
            }

            sample.callchain.reserve( length as usize );
            for _ in 0..length {
                sample.callchain.push( cur.read_u64::< NativeEndian >()? );
            }
        }
        if sample_type & PERF_SAMPLE_RAW != 0 {
            let size = cur.read_u32::< NativeEndian >()?;
            sample.raw = read_bytes( &mut cur, size as usize )?;
        }
        if sample_type & PERF_SAMPLE_BRANCH_STACK != 0 {
            let count = cur.read_u64::< NativeEndian >()?;
            if count > (data.len() / 24) as u64 {
                return Err( invalid_data( format!( "branch stack of {} entries exceeds the record", count ) ) );
            }

            for _ in 0..count {
                let from = cur.read_u64::< NativeEndian >()?;
                let to = cur.read_u64::< NativeEndian >()?;
                let flags = cur.read_u64::< NativeEndian >()?;
                sample.branch_stack.push( BranchStackItem { from, to, flags } );
            }
        }
        if sample_type & PERF_SAMPLE_REGS_USER != 0 {
            let abi = cur.read_u64::< NativeEndian >()?;
            let mask = attr.sample_regs_user;
            let mut regs = Vec::new();
            if abi != 0 {
                for _ in 0..mask.count_ones() {
                    regs.push( cur.read_u64::< NativeEndian >()? );
                }
            }
            sample.regs_user = Some( RegsUser { abi, mask, regs } );
        }
        if sample_type & PERF_SAMPLE_STACK_USER != 0 {
            let size = cur.read_u64::< NativeEndian >()?;
            if size > data.len() as u64 {
                return Err( invalid_data( format!( "user stack of {} bytes exceeds the record", size ) ) );
            }

            let stack = read_bytes( &mut cur, size as usize )?;
            let dynamic_size = if size != 0 {
                cur.read_u64::< NativeEndian >()?
            } else {
                0
            };
            sample.stack_user = Some( StackUser { data: stack, dynamic_size } );
        }

        let unsupported = PERF_SAMPLE_WEIGHT | PERF_SAMPLE_DATA_SRC | PERF_SAMPLE_TRANSACTION | PERF_SAMPLE_REGS_INTR;
        if sample_type & unsupported != 0 {
            return Err( invalid_data( format!( "unsupported sample_type bits: {:?}", HexValue( sample_type & unsupported ) ) ) );
        }

        if cur.position() != data.len() as u64 {
            return Err( invalid_data( format!( "sample record has {} trailing bytes", data.len() as u64 - cur.position() ) ) );
        }

        Ok( sample )
    }

    fn write_to( &self, output: &mut Vec< u8 > ) -> io::Result< () > {
        let sample_type = self.sample_type;
        if sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
            output.write_u64::< NativeEndian >( self.id )?;
        }
        if sample_type & PERF_SAMPLE_IP != 0 {
            output.write_u64::< NativeEndian >( self.ip )?;
        }
        if sample_type & PERF_SAMPLE_TID != 0 {
            output.write_u32::< NativeEndian >( self.pid )?;
            output.write_u32::< NativeEndian >( self.tid )?;
        }
        if sample_type & PERF_SAMPLE_TIME != 0 {
            output.write_u64::< NativeEndian >( self.time )?;
        }
        if sample_type & PERF_SAMPLE_ADDR != 0 {
            output.write_u64::< NativeEndian >( self.addr )?;
        }
        if sample_type & PERF_SAMPLE_ID != 0 {
            output.write_u64::< NativeEndian >( self.id )?;
        }
        if sample_type & PERF_SAMPLE_STREAM_ID != 0 {
            output.write_u64::< NativeEndian >( self.stream_id )?;
        }
        if sample_type & PERF_SAMPLE_CPU != 0 {
            output.write_u32::< NativeEndian >( self.cpu )?;
            output.write_u32::< NativeEndian >( 0 )?;
        }
        if sample_type & PERF_SAMPLE_PERIOD != 0 {
            output.write_u64::< NativeEndian >( self.period )?;
        }
        if sample_type & PERF_SAMPLE_CALLCHAIN != 0 {
            output.write_u64::< NativeEndian >( self.callchain.len() as u64 )?;
            for &ip in &self.callchain {
                output.write_u64::< NativeEndian >( ip )?;
            }
        }
        if sample_type & PERF_SAMPLE_RAW != 0 {
            output.write_u32::< NativeEndian >( self.raw.len() as u32 )?;
            output.extend_from_slice( &self.raw );
        }
        if sample_type & PERF_SAMPLE_BRANCH_STACK != 0 {
            output.write_u64::< NativeEndian >( self.branch_stack.len() as u64 )?;
            for item in &self.branch_stack {
                output.write_u64::< NativeEndian >( item.from )?;
                output.write_u64::< NativeEndian >( item.to )?;
                output.write_u64::< NativeEndian >( item.flags )?;
            }
        }
        if sample_type & PERF_SAMPLE_REGS_USER != 0 {
            match self.regs_user {
                Some( ref regs_user ) => {
                    output.write_u64::< NativeEndian >( regs_user.abi )?;
                    if regs_user.abi != 0 {
                        for &reg in &regs_user.regs {
                            output.write_u64::< NativeEndian >( reg )?;
                        }
                    }
                },
                None => output.write_u64::< NativeEndian >( 0 )?
            }
        }
        if sample_type & PERF_SAMPLE_STACK_USER != 0 {
            match self.stack_user {
                Some( ref stack ) if !stack.data.is_empty() => {
                    output.write_u64::< NativeEndian >( stack.data.len() as u64 )?;
                    output.extend_from_slice( &stack.data );
                    output.write_u64::< NativeEndian >( stack.dynamic_size )?;
                },
                _ => output.write_u64::< NativeEndian >( 0 )?
            }
        }

        Ok(())
    }

    /// Splits the callchain into kernel and user ips, dropping the `PERF_CONTEXT_*` markers.
    pub fn split_callchain( &self ) -> (Vec< u64 >, Vec< u64 >) {
        let mut kernel_ips = Vec::new();
        let mut user_ips = Vec::new();
        let mut in_kernel = false;
        for &ip in &self.callchain {
            if ip >= PERF_CONTEXT_MAX {
                if ip == PERF_CONTEXT_KERNEL {
                    in_kernel = true;
                } else if ip == PERF_CONTEXT_USER {
                    in_kernel = false;
                }
                continue;
            }

            if in_kernel {
                kernel_ips.push( ip );
            } else {
                user_ips.push( ip );
            }
        }

        (kernel_ips, user_ips)
    }
}

impl Record {
    pub fn new( misc: u16, body: RecordBody ) -> Self {
        Record { misc, body }
    }

    pub fn kind( &self ) -> u32 {
        match self.body {
            RecordBody::Mmap( .. ) => PERF_RECORD_MMAP,
            RecordBody::Mmap2( .. ) => PERF_RECORD_MMAP2,
            RecordBody::Comm( .. ) => PERF_RECORD_COMM,
            RecordBody::Exit( .. ) => PERF_RECORD_EXIT,
            RecordBody::Fork( .. ) => PERF_RECORD_FORK,
            RecordBody::Lost( .. ) => PERF_RECORD_LOST,
            RecordBody::Throttle( .. ) => PERF_RECORD_THROTTLE,
            RecordBody::Unthrottle( .. ) => PERF_RECORD_UNTHROTTLE,
            RecordBody::Sample( .. ) => PERF_RECORD_SAMPLE,
            RecordBody::BuildId( .. ) => PERF_RECORD_BUILD_ID,
            RecordBody::TracingData( .. ) => SIMPLE_PERF_RECORD_TRACING_DATA,
            RecordBody::EventId( .. ) => SIMPLE_PERF_RECORD_EVENT_ID,
            RecordBody::Unknown { kind, .. } => kind
        }
    }

    #[inline]
    pub fn in_kernel( &self ) -> bool {
        self.misc & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL
    }

    fn sample_id( &self ) -> Option< &SampleId > {
        match self.body {
            RecordBody::Mmap( ref record ) => Some( &record.sample_id ),
            RecordBody::Mmap2( ref record ) => Some( &record.sample_id ),
            RecordBody::Comm( ref record ) => Some( &record.sample_id ),
            RecordBody::Exit( ref record ) | RecordBody::Fork( ref record ) => Some( &record.sample_id ),
            RecordBody::Lost( ref record ) => Some( &record.sample_id ),
            RecordBody::Throttle( ref record ) | RecordBody::Unthrottle( ref record ) => Some( &record.sample_id ),
            _ => None
        }
    }

    /// The kernel timestamp of the record, if its layout carries one.
    pub fn timestamp( &self ) -> Option< u64 > {
        match self.body {
            RecordBody::Sample( ref sample ) if sample.sample_type & PERF_SAMPLE_TIME != 0 => Some( sample.time ),
            RecordBody::Sample( .. ) => None,
            _ => self.sample_id().and_then( |sample_id| sample_id.time() )
        }
    }

    pub fn cpu( &self ) -> Option< u32 > {
        match self.body {
            RecordBody::Sample( ref sample ) if sample.sample_type & PERF_SAMPLE_CPU != 0 => Some( sample.cpu ),
            RecordBody::Sample( .. ) => None,
            _ => self.sample_id().and_then( |sample_id| sample_id.cpu() )
        }
    }

    /// Parses one complete record (header included) using the attr that produced it.
    pub fn parse( attr: &PerfEventAttr, bytes: &[u8] ) -> io::Result< Record > {
        let header = RecordHeader::parse( bytes )?;
        if header.size as usize != bytes.len() {
            return Err( invalid_data( format!( "record header claims {} bytes while {} are present", header.size, bytes.len() ) ) );
        }

        let data = &bytes[ RECORD_HEADER_SIZE.. ];
        let mut cur = io::Cursor::new( data );
        let body = match header.kind {
            PERF_RECORD_MMAP => {
                let (tail_start, sample_id) = split_sample_id( attr, data )?;
                let pid = cur.read_u32::< NativeEndian >()?;
                let tid = cur.read_u32::< NativeEndian >()?;
                let address = cur.read_u64::< NativeEndian >()?;
                let length = cur.read_u64::< NativeEndian >()?;
                let page_offset = cur.read_u64::< NativeEndian >()?;
                let filename = string_between( data, cur.position() as usize, tail_start )?;
                RecordBody::Mmap( MmapRecord { pid, tid, address, length, page_offset, filename, sample_id } )
            },
            PERF_RECORD_MMAP2 => {
                let (tail_start, sample_id) = split_sample_id( attr, data )?;
                let pid = cur.read_u32::< NativeEndian >()?;
                let tid = cur.read_u32::< NativeEndian >()?;
                let address = cur.read_u64::< NativeEndian >()?;
                let length = cur.read_u64::< NativeEndian >()?;
                let page_offset = cur.read_u64::< NativeEndian >()?;
                let major = cur.read_u32::< NativeEndian >()?;
                let minor = cur.read_u32::< NativeEndian >()?;
                let inode = cur.read_u64::< NativeEndian >()?;
                let inode_generation = cur.read_u64::< NativeEndian >()?;
                let protection = cur.read_u32::< NativeEndian >()?;
                let flags = cur.read_u32::< NativeEndian >()?;
                let filename = string_between( data, cur.position() as usize, tail_start )?;
                RecordBody::Mmap2( Mmap2Record {
                    pid,
                    tid,
                    address,
                    length,
                    page_offset,
                    major,
                    minor,
                    inode,
                    inode_generation,
                    protection,
                    flags,
                    filename,
                    sample_id
                })
            },
            PERF_RECORD_COMM => {
                let (tail_start, sample_id) = split_sample_id( attr, data )?;
                let pid = cur.read_u32::< NativeEndian >()?;
                let tid = cur.read_u32::< NativeEndian >()?;
                let comm = string_between( data, cur.position() as usize, tail_start )?;
                RecordBody::Comm( CommRecord { pid, tid, comm, sample_id } )
            },
            PERF_RECORD_EXIT | PERF_RECORD_FORK => {
                let (_, sample_id) = split_sample_id( attr, data )?;
                let record = ExitOrForkRecord {
                    pid: cur.read_u32::< NativeEndian >()?,
                    ppid: cur.read_u32::< NativeEndian >()?,
                    tid: cur.read_u32::< NativeEndian >()?,
                    ptid: cur.read_u32::< NativeEndian >()?,
                    time: cur.read_u64::< NativeEndian >()?,
                    sample_id
                };

                if header.kind == PERF_RECORD_EXIT {
                    RecordBody::Exit( record )
                } else {
                    RecordBody::Fork( record )
                }
            },
            PERF_RECORD_LOST => {
                let (_, sample_id) = split_sample_id( attr, data )?;
                let id = cur.read_u64::< NativeEndian >()?;
                let lost = cur.read_u64::< NativeEndian >()?;
                RecordBody::Lost( LostRecord { id, lost, sample_id } )
            },
            PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE => {
                let (_, sample_id) = split_sample_id( attr, data )?;
                let record = ThrottleRecord {
                    time: cur.read_u64::< NativeEndian >()?,
                    id: cur.read_u64::< NativeEndian >()?,
                    stream_id: cur.read_u64::< NativeEndian >()?,
                    sample_id
                };

                if header.kind == PERF_RECORD_THROTTLE {
                    RecordBody::Throttle( record )
                } else {
                    RecordBody::Unthrottle( record )
                }
            },
            PERF_RECORD_SAMPLE => RecordBody::Sample( SampleRecord::parse( attr, data )? ),
            PERF_RECORD_BUILD_ID => {
                let pid = cur.read_u32::< NativeEndian >()?;
                let build_id = read_bytes( &mut cur, BUILD_ID_SIZE + 4 )?;
                let filename = string_between( data, cur.position() as usize, data.len() )?;
                RecordBody::BuildId( BuildIdRecord {
                    pid,
                    build_id: BuildId::new( &build_id[ ..BUILD_ID_SIZE ] ),
                    filename
                })
            },
            SIMPLE_PERF_RECORD_TRACING_DATA => {
                let size = cur.read_u32::< NativeEndian >()?;
                RecordBody::TracingData( read_bytes( &mut cur, size as usize )? )
            },
            SIMPLE_PERF_RECORD_EVENT_ID => {
                let count = cur.read_u64::< NativeEndian >()?;
                if count > (data.len() / 16) as u64 {
                    return Err( invalid_data( format!( "event id record claims {} entries", count ) ) );
                }

                let mut entries = Vec::with_capacity( count as usize );
                for _ in 0..count {
                    let attr_index = cur.read_u64::< NativeEndian >()?;
                    let event_id = cur.read_u64::< NativeEndian >()?;
                    entries.push( EventIdEntry { attr_index, event_id } );
                }
                RecordBody::EventId( entries )
            },
            kind => RecordBody::Unknown {
                kind,
                payload: data.to_vec()
            }
        };

        Ok( Record { misc: header.misc, body } )
    }

    pub fn write_to( &self, output: &mut Vec< u8 > ) -> io::Result< () > {
        let start = output.len();
        output.resize( start + RECORD_HEADER_SIZE, 0 );

        match self.body {
            RecordBody::Mmap( ref record ) => {
                output.write_u32::< NativeEndian >( record.pid )?;
                output.write_u32::< NativeEndian >( record.tid )?;
                output.write_u64::< NativeEndian >( record.address )?;
                output.write_u64::< NativeEndian >( record.length )?;
                output.write_u64::< NativeEndian >( record.page_offset )?;
                write_padded_string( output, &record.filename, 8 );
                record.sample_id.write_to( output )?;
            },
            RecordBody::Mmap2( ref record ) => {
                output.write_u32::< NativeEndian >( record.pid )?;
                output.write_u32::< NativeEndian >( record.tid )?;
                output.write_u64::< NativeEndian >( record.address )?;
                output.write_u64::< NativeEndian >( record.length )?;
                output.write_u64::< NativeEndian >( record.page_offset )?;
                output.write_u32::< NativeEndian >( record.major )?;
                output.write_u32::< NativeEndian >( record.minor )?;
                output.write_u64::< NativeEndian >( record.inode )?;
                output.write_u64::< NativeEndian >( record.inode_generation )?;
                output.write_u32::< NativeEndian >( record.protection )?;
                output.write_u32::< NativeEndian >( record.flags )?;
                write_padded_string( output, &record.filename, 8 );
                record.sample_id.write_to( output )?;
            },
            RecordBody::Comm( ref record ) => {
                output.write_u32::< NativeEndian >( record.pid )?;
                output.write_u32::< NativeEndian >( record.tid )?;
                write_padded_string( output, &record.comm, 8 );
                record.sample_id.write_to( output )?;
            },
            RecordBody::Exit( ref record ) | RecordBody::Fork( ref record ) => {
                output.write_u32::< NativeEndian >( record.pid )?;
                output.write_u32::< NativeEndian >( record.ppid )?;
                output.write_u32::< NativeEndian >( record.tid )?;
                output.write_u32::< NativeEndian >( record.ptid )?;
                output.write_u64::< NativeEndian >( record.time )?;
                record.sample_id.write_to( output )?;
            },
            RecordBody::Lost( ref record ) => {
                output.write_u64::< NativeEndian >( record.id )?;
                output.write_u64::< NativeEndian >( record.lost )?;
                record.sample_id.write_to( output )?;
            },
            RecordBody::Throttle( ref record ) | RecordBody::Unthrottle( ref record ) => {
                output.write_u64::< NativeEndian >( record.time )?;
                output.write_u64::< NativeEndian >( record.id )?;
                output.write_u64::< NativeEndian >( record.stream_id )?;
                record.sample_id.write_to( output )?;
            },
            RecordBody::Sample( ref sample ) => sample.write_to( output )?,
            RecordBody::BuildId( ref record ) => {
                output.write_u32::< NativeEndian >( record.pid )?;
                output.extend_from_slice( record.build_id.as_bytes() );
                output.extend_from_slice( &[0; 4] );
                write_padded_string( output, &record.filename, 64 );
            },
            RecordBody::TracingData( ref data ) => {
                output.write_u32::< NativeEndian >( data.len() as u32 )?;
                output.extend_from_slice( data );
                let padded = align( output.len() - start, 8 );
                output.resize( start + padded, 0 );
            },
            RecordBody::EventId( ref entries ) => {
                output.write_u64::< NativeEndian >( entries.len() as u64 )?;
                for entry in entries {
                    output.write_u64::< NativeEndian >( entry.attr_index )?;
                    output.write_u64::< NativeEndian >( entry.event_id )?;
                }
            },
            RecordBody::Unknown { ref payload, .. } => {
                output.extend_from_slice( payload );
            }
        }

        let size = output.len() - start;
        if size > u32::max_value() as usize {
            output.truncate( start );
            return Err( invalid_data( "record exceeds 4 GiB" ) );
        }

        let header = RecordHeader {
            kind: self.kind(),
            misc: self.misc,
            size: size as u32
        };

        let mut header_bytes = Vec::with_capacity( RECORD_HEADER_SIZE );
        if let Err( err ) = header.write_to( &mut header_bytes ) {
            output.truncate( start );
            return Err( err );
        }

        output[ start..start + RECORD_HEADER_SIZE ].copy_from_slice( &header_bytes );
        Ok(())
    }

    pub fn to_bytes( &self ) -> io::Result< Vec< u8 > > {
        let mut output = Vec::new();
        self.write_to( &mut output )?;
        Ok( output )
    }

    pub fn comm( attr: &PerfEventAttr, pid: u32, tid: u32, comm: &str, time: u64, event_id: u64 ) -> Record {
        Record::new( 0, RecordBody::Comm( CommRecord {
            pid,
            tid,
            comm: comm.to_owned(),
            sample_id: SampleId::new( attr, pid, tid, time, event_id, 0 )
        }))
    }

    pub fn mmap2( attr: &PerfEventAttr, in_kernel: bool, mut record: Mmap2Record, time: u64, event_id: u64 ) -> Record {
        record.sample_id = SampleId::new( attr, record.pid, record.tid, time, event_id, 0 );
        let misc = if in_kernel { PERF_RECORD_MISC_KERNEL } else { PERF_RECORD_MISC_USER };
        Record::new( misc, RecordBody::Mmap2( record ) )
    }

    pub fn kernel_mmap( attr: &PerfEventAttr, address: u64, length: u64, page_offset: u64, filename: &str, event_id: u64 ) -> Record {
        Record::new( PERF_RECORD_MISC_KERNEL, RecordBody::Mmap( MmapRecord {
            pid: u32::max_value(),
            tid: u32::max_value(),
            address,
            length,
            page_offset,
            filename: filename.to_owned(),
            sample_id: SampleId::new( attr, u32::max_value(), u32::max_value(), 0, event_id, 0 )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_attr::create_default_perf_event_attr;
    use crate::event_type::find_event_type_by_name;

    fn default_attr() -> PerfEventAttr {
        let event_type = find_event_type_by_name( "cpu-clock" ).unwrap();
        create_default_perf_event_attr( &event_type )
    }

    fn round_trip( attr: &PerfEventAttr, record: &Record ) -> Record {
        let bytes = record.to_bytes().unwrap();
        assert_eq!( bytes.len() % 8, 0 );
        Record::parse( attr, &bytes ).unwrap()
    }

    #[test]
    fn test_header_of_large_own_record() {
        let mut bytes = Vec::new();
        let header = RecordHeader { kind: SIMPLE_PERF_RECORD_TRACING_DATA, misc: 0, size: 0x12345 };
        header.write_to( &mut bytes ).unwrap();
        assert_eq!( RecordHeader::parse( &bytes ).unwrap(), header );

        let header = RecordHeader { kind: PERF_RECORD_SAMPLE, misc: 0, size: 0x12345 };
        assert!( header.write_to( &mut Vec::new() ).is_err() );
    }

    #[test]
    fn test_comm_record() {
        let attr = default_attr();
        let record = Record::comm( &attr, 10, 11, "worker-thread", 1234, 7 );
        let parsed = round_trip( &attr, &record );
        assert_eq!( parsed, record );
        assert_eq!( parsed.timestamp(), Some( 1234 ) );
    }

    #[test]
    fn test_sample_record_with_callchain() {
        let mut attr = default_attr();
        attr.sample_type |= PERF_SAMPLE_CALLCHAIN | PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
        attr.sample_regs_user = 0b111;

        let sample = SampleRecord {
            sample_type: attr.sample_type,
            ip: 0x1000,
            pid: 1,
            tid: 2,
            time: 99,
            id: 5,
            cpu: 3,
            period: 10000,
            callchain: vec![ PERF_CONTEXT_KERNEL, 0xffff0000, PERF_CONTEXT_USER, 0x1000, 0x2000 ],
            regs_user: Some( RegsUser { abi: 2, mask: 0b111, regs: vec![ 1, 2, 3 ] } ),
            stack_user: Some( StackUser { data: vec![ 0xaa; 64 ], dynamic_size: 32 } ),
            .. SampleRecord::default()
        };

        let record = Record::new( PERF_RECORD_MISC_USER, RecordBody::Sample( sample.clone() ) );
        let parsed = round_trip( &attr, &record );
        assert_eq!( parsed, record );
        assert_eq!( parsed.cpu(), Some( 3 ) );
        assert_eq!( sample.split_callchain(), (vec![ 0xffff0000 ], vec![ 0x1000, 0x2000 ]) );
    }

    #[test]
    fn test_truncated_sample_is_an_error() {
        let attr = default_attr();
        let record = Record::new( 0, RecordBody::Sample( SampleRecord {
            sample_type: attr.sample_type,
            .. SampleRecord::default()
        }));

        let mut bytes = record.to_bytes().unwrap();
        bytes.truncate( bytes.len() - 8 );
        let size = bytes.len() as u16;
        bytes[ 6..8 ].copy_from_slice( &size.to_ne_bytes() );
        assert!( Record::parse( &attr, &bytes ).is_err() );
    }

    #[test]
    fn test_build_id_and_event_id_records() {
        let attr = default_attr();
        let record = Record::new( PERF_RECORD_MISC_KERNEL, RecordBody::BuildId( BuildIdRecord {
            pid: u32::max_value(),
            build_id: BuildId::new( &[1, 2, 3, 4] ),
            filename: "[kernel.kallsyms]".to_owned()
        }));
        assert_eq!( round_trip( &attr, &record ), record );

        let record = Record::new( 0, RecordBody::EventId( vec![
            EventIdEntry { attr_index: 0, event_id: 100 },
            EventIdEntry { attr_index: 1, event_id: 200 }
        ]));
        assert_eq!( round_trip( &attr, &record ), record );
    }

    #[test]
    fn test_unknown_record_is_preserved() {
        let attr = default_attr();
        let record = Record::new( 3, RecordBody::Unknown { kind: 70, payload: vec![ 1, 2, 3, 4, 5, 6, 7, 8 ] } );
        assert_eq!( round_trip( &attr, &record ), record );
    }
}
