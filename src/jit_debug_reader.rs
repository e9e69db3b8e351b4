use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, NativeEndian};
use tempfile::NamedTempFile;

use crate::dso::JIT_SYMFILE_PREFIX;
use crate::elf::{self, ElfFile};
use crate::maps::{self, Region};
use crate::record::{Record, RecordBody};

/// Upper bound of entries walked per poll, so a huge list can't stall capture.
const MAX_LINKED_LIST_LENGTH: usize = 1024;

/// Symfiles bigger than this aren't worth copying out of the target.
const MAX_JIT_SYMFILE_SIZE: u64 = 1024 * 1024;

const JIT_DESCRIPTOR_SYMBOL: &str = "__jit_debug_descriptor";
const DEX_DESCRIPTOR_SYMBOL: &str = "__dex_debug_descriptor";
const DESCRIPTOR_MAGIC: &[u8; 8] = b"Android1";

/// JIT compiled code of one process, with its symbols copied into a local ELF file.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct JitSymFile {
    pub pid: u32,
    pub addr: u64,
    pub len: u64,
    pub file_path: PathBuf
}

/// A dex file the runtime loaded, located inside a file on disk.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DexSymFile {
    pub pid: u32,
    pub dex_file_offset: u64,
    pub file_path: String
}

/// Read-only access to another process.
pub trait RemoteMemoryReader {
    fn read_memory( &mut self, pid: u32, address: u64, output: &mut [u8] ) -> io::Result< () >;

    fn read_maps( &mut self, pid: u32 ) -> io::Result< Vec< Region > > {
        maps::read_process_maps( pid )
    }
}

/// Reads with `process_vm_readv`, without stopping the target.
pub struct ProcessVmReader;

impl RemoteMemoryReader for ProcessVmReader {
    fn read_memory( &mut self, pid: u32, address: u64, output: &mut [u8] ) -> io::Result< () > {
        let local = libc::iovec {
            iov_base: output.as_mut_ptr() as *mut libc::c_void,
            iov_len: output.len()
        };

        let remote = libc::iovec {
            iov_base: address as usize as *mut libc::c_void,
            iov_len: output.len()
        };

        let result = unsafe { libc::process_vm_readv( pid as libc::pid_t, &local, 1, &remote, 1, 0 ) };
        if result < 0 {
            return Err( io::Error::last_os_error() );
        }

        if result as usize != output.len() {
            return Err( io::Error::new( io::ErrorKind::UnexpectedEof, format!( "short read of {} bytes at 0x{:x} in {}", output.len(), address, pid ) ) );
        }

        Ok(())
    }
}

/// The arch independent part of a JIT or dex descriptor.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
struct Descriptor {
    action_seqlock: u32,
    action_timestamp: u64,
    first_entry_addr: u64
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct CodeEntry {
    addr: u64,
    symfile_addr: u64,
    symfile_size: u64
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct RawCodeEntry {
    next_addr: u64,
    prev_addr: u64,
    symfile_addr: u64,
    symfile_size: u64,
    register_timestamp: u64
}

/// Wire layout of the runtime's debug interface structures for a given pointer width.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct Layout {
    is_64bit: bool
}

impl Layout {
    fn descriptor_size( &self ) -> usize {
        if self.is_64bit { 56 } else { 48 }
    }

    fn code_entry_size( &self ) -> usize {
        if self.is_64bit {
            40
        } else if cfg!( any( target_arch = "x86", target_arch = "x86_64" ) ) {
            // i386 aligns 64-bit fields to 4 bytes.
            28
        } else {
            32
        }
    }

    fn pointer( &self, data: &[u8], offset: usize ) -> u64 {
        if self.is_64bit {
            NativeEndian::read_u64( &data[ offset.. ] )
        } else {
            NativeEndian::read_u32( &data[ offset.. ] ) as u64
        }
    }

    fn parse_descriptor( &self, data: &[u8] ) -> Option< Descriptor > {
        if data.len() < self.descriptor_size() {
            return None;
        }

        let pointer_size = if self.is_64bit { 8 } else { 4 };
        let first_entry_offset = 8 + pointer_size;
        let magic_offset = first_entry_offset + pointer_size;
        let version = NativeEndian::read_u32( &data[ 0.. ] );
        let magic = &data[ magic_offset..magic_offset + 8 ];
        let sizeof_descriptor = NativeEndian::read_u32( &data[ magic_offset + 12.. ] ) as usize;
        let sizeof_entry = NativeEndian::read_u32( &data[ magic_offset + 16.. ] ) as usize;
        if version != 1 || magic != DESCRIPTOR_MAGIC || sizeof_descriptor != self.descriptor_size() || sizeof_entry != self.code_entry_size() {
            return None;
        }

        Some( Descriptor {
            action_seqlock: NativeEndian::read_u32( &data[ magic_offset + 20.. ] ),
            action_timestamp: NativeEndian::read_u64( &data[ self.descriptor_size() - 8.. ] ),
            first_entry_addr: self.pointer( data, first_entry_offset )
        })
    }

    fn parse_code_entry( &self, data: &[u8] ) -> RawCodeEntry {
        let pointer_size = if self.is_64bit { 8 } else { 4 };
        let size_offset = self.code_entry_size() - 16;
        RawCodeEntry {
            next_addr: self.pointer( data, 0 ),
            prev_addr: self.pointer( data, pointer_size ),
            symfile_addr: self.pointer( data, pointer_size * 2 ),
            symfile_size: NativeEndian::read_u64( &data[ size_offset.. ] ),
            register_timestamp: NativeEndian::read_u64( &data[ size_offset + 8.. ] )
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ProcessState {
    Uninitialized,
    Initialized,
    /// No libart.so, or the process is gone.
    Disabled
}

struct Process {
    pid: u32,
    state: ProcessState,
    layout: Layout,
    descriptors_addr: u64,
    descriptors_size: usize,
    jit_descriptor_offset: usize,
    dex_descriptor_offset: usize,
    last_jit_descriptor: Descriptor,
    last_dex_descriptor: Descriptor
}

impl Process {
    fn new( pid: u32 ) -> Self {
        Process {
            pid,
            state: ProcessState::Uninitialized,
            layout: Layout { is_64bit: true },
            descriptors_addr: 0,
            descriptors_size: 0,
            jit_descriptor_offset: 0,
            dex_descriptor_offset: 0,
            last_jit_descriptor: Descriptor::default(),
            last_dex_descriptor: Descriptor::default()
        }
    }
}

/// Polls the debug interface of the Android runtime in live processes for newly JIT compiled code and loaded dex files.
///
/// The target keeps running, so every read may be torn; the descriptors' seqlocks are the only synchronization.
pub struct JitDebugReader< M: RemoteMemoryReader = ProcessVmReader > {
    memory: M,
    processes: HashMap< u32, Process >,
    symfile_dir: Option< PathBuf >,
    keep_symfiles: bool,
    symfiles: Vec< NamedTempFile >
}

impl JitDebugReader< ProcessVmReader > {
    pub fn new( keep_symfiles: bool ) -> Self {
        JitDebugReader::with_memory_reader( ProcessVmReader, keep_symfiles )
    }
}

impl< M: RemoteMemoryReader > JitDebugReader< M > {
    pub fn with_memory_reader( memory: M, keep_symfiles: bool ) -> Self {
        JitDebugReader {
            memory,
            processes: HashMap::new(),
            symfile_dir: None,
            keep_symfiles,
            symfiles: Vec::new()
        }
    }

    /// Where symfiles are created; the system temporary directory by default.
    pub fn set_symfile_dir< P: AsRef< Path > >( &mut self, path: P ) {
        self.symfile_dir = Some( path.as_ref().to_owned() );
    }

    pub fn monitor_process( &mut self, pid: u32 ) {
        self.processes.entry( pid ).or_insert_with( || Process::new( pid ) );
    }

    pub fn is_monitoring( &self, pid: u32 ) -> bool {
        self.processes.get( &pid ).map( |process| process.state != ProcessState::Disabled ).unwrap_or( false )
    }

    /// Starts monitoring processes which map libart.so, and stops when they exit.
    pub fn update_record( &mut self, record: &Record ) {
        match record.body {
            RecordBody::Mmap2( ref mmap ) if !record.in_kernel() && is_art_library( &mmap.filename ) => {
                self.monitor_process( mmap.pid );
            },
            RecordBody::Mmap( ref mmap ) if !record.in_kernel() && is_art_library( &mmap.filename ) => {
                self.monitor_process( mmap.pid );
            },
            RecordBody::Exit( ref exit ) if exit.pid == exit.tid => {
                self.processes.remove( &exit.pid );
            },
            _ => {}
        }
    }

    /// Reads new JIT code and dex files of every monitored process.
    pub fn read_all_processes( &mut self ) -> (Vec< JitSymFile >, Vec< DexSymFile >) {
        let mut jit_symfiles = Vec::new();
        let mut dex_symfiles = Vec::new();
        let mut pids: Vec< u32 > = self.processes.keys().cloned().collect();
        pids.sort();
        for pid in pids {
            let (jit, dex) = self.read_process( pid );
            jit_symfiles.extend( jit );
            dex_symfiles.extend( dex );
        }

        (jit_symfiles, dex_symfiles)
    }

    pub fn read_process( &mut self, pid: u32 ) -> (Vec< JitSymFile >, Vec< DexSymFile >) {
        let mut process = match self.processes.remove( &pid ) {
            Some( process ) => process,
            None => return (Vec::new(), Vec::new())
        };

        let result = self.read_process_update( &mut process );
        self.processes.insert( pid, process );
        result
    }

    fn read_process_update( &mut self, process: &mut Process ) -> (Vec< JitSymFile >, Vec< DexSymFile >) {
        let mut jit_symfiles = Vec::new();
        let mut dex_symfiles = Vec::new();
        if !self.initialize_process( process ) {
            return (jit_symfiles, dex_symfiles);
        }

        let (jit_descriptor, dex_descriptor) = match self.read_descriptors( process ) {
            Some( descriptors ) => descriptors,
            None => return (jit_symfiles, dex_symfiles)
        };

        if jit_descriptor.action_seqlock == process.last_jit_descriptor.action_seqlock &&
            dex_descriptor.action_seqlock == process.last_dex_descriptor.action_seqlock
        {
            return (jit_symfiles, dex_symfiles);
        }

        if let Some( symfiles ) = self.read_new_symfiles( process, &jit_descriptor, true ) {
            jit_symfiles = symfiles.0;
            process.last_jit_descriptor = jit_descriptor;
        }

        if let Some( symfiles ) = self.read_new_symfiles( process, &dex_descriptor, false ) {
            dex_symfiles = symfiles.1;
            process.last_dex_descriptor = dex_descriptor;
        }

        (jit_symfiles, dex_symfiles)
    }

    /// Returns `None` when nothing consistent could be read; the old state is kept then.
    fn read_new_symfiles( &mut self, process: &Process, descriptor: &Descriptor, is_jit: bool ) -> Option< (Vec< JitSymFile >, Vec< DexSymFile >) > {
        let old_descriptor = if is_jit { &process.last_jit_descriptor } else { &process.last_dex_descriptor };
        if descriptor.action_seqlock == old_descriptor.action_seqlock {
            return None;
        }

        // An odd seqlock means the runtime is in the middle of an update.
        if descriptor.action_seqlock & 1 != 0 {
            return None;
        }

        let entries = self.read_new_code_entries( process, descriptor, old_descriptor.action_timestamp )?;
        if !self.is_descriptor_unchanged( process, descriptor, is_jit ) {
            return None;
        }

        if entries.is_empty() {
            return Some( (Vec::new(), Vec::new()) );
        }

        let symfiles = if is_jit {
            (self.read_jit_symfiles( process, &entries ), Vec::new())
        } else {
            (Vec::new(), self.read_dex_symfiles( process, &entries ))
        };

        if !self.is_descriptor_unchanged( process, descriptor, is_jit ) {
            debug!( "The {} descriptor of {} changed while reading symfiles", if is_jit { "jit" } else { "dex" }, process.pid );
            return None;
        }

        Some( symfiles )
    }

    fn is_descriptor_unchanged( &mut self, process: &Process, descriptor: &Descriptor, is_jit: bool ) -> bool {
        match self.read_descriptors( process ) {
            Some( (jit_descriptor, dex_descriptor) ) => {
                let current = if is_jit { jit_descriptor } else { dex_descriptor };
                current.action_seqlock == descriptor.action_seqlock
            },
            None => false
        }
    }

    fn initialize_process( &mut self, process: &mut Process ) -> bool {
        match process.state {
            ProcessState::Initialized => return true,
            ProcessState::Disabled => return false,
            ProcessState::Uninitialized => {}
        }

        let regions = match self.memory.read_maps( process.pid ) {
            Ok( regions ) => regions,
            Err( error ) => {
                debug!( "Can't read the maps of {}: {}", process.pid, error );
                process.state = ProcessState::Disabled;
                return false;
            }
        };

        let art_lib_path = match regions.iter().find( |region| is_art_library( &region.name ) ) {
            Some( region ) => region.name.clone(),
            None => {
                debug!( "{} doesn't use the Android runtime", process.pid );
                process.state = ProcessState::Disabled;
                return false;
            }
        };

        let min_vaddr_in_memory = match regions.iter().find( |region| region.is_executable && region.name == art_lib_path ) {
            Some( region ) => region.start,
            // Not mapped executable yet; try again on the next poll.
            None => return false
        };

        let is_64bit = art_lib_path.contains( "lib64" );
        let addresses = ElfFile::open( &art_lib_path ).and_then( |elf| {
            let (min_vaddr_in_file, _) = elf::read_min_executable_vaddr( elf.bytes() )?.unwrap_or( (0, 0) );
            let addresses = elf::read_dynamic_symbol_addresses( elf.bytes(), &[ JIT_DESCRIPTOR_SYMBOL, DEX_DESCRIPTOR_SYMBOL ] )?;
            Ok( (min_vaddr_in_file, addresses) )
        });

        let (jit_addr, dex_addr) = match addresses {
            Ok( (min_vaddr_in_file, ref addresses) ) => {
                let relocate = |vaddr: Option< u64 >| vaddr?.checked_sub( min_vaddr_in_file )?.checked_add( min_vaddr_in_memory );
                match (relocate( addresses[ 0 ] ), relocate( addresses[ 1 ] )) {
                (Some( jit ), Some( dex )) => (jit, dex),
                _ => {
                    warn!( "{} doesn't export usable JIT debug descriptors", art_lib_path );
                    process.state = ProcessState::Disabled;
                    return false;
                }
                }
            },
            Err( error ) => {
                warn!( "Failed to read {}: {}", art_lib_path, error );
                process.state = ProcessState::Disabled;
                return false;
            }
        };

        self.set_descriptor_addresses( process, is_64bit, jit_addr, dex_addr );
        true
    }

    fn set_descriptor_addresses( &self, process: &mut Process, is_64bit: bool, jit_addr: u64, dex_addr: u64 ) {
        process.layout = Layout { is_64bit };
        process.descriptors_addr = jit_addr.min( dex_addr );
        process.descriptors_size = (jit_addr.max( dex_addr ) - process.descriptors_addr) as usize + process.layout.descriptor_size();
        if process.descriptors_size >= 4096 {
            warn!( "The JIT descriptors of {} are unexpectedly far apart ({} bytes)", process.pid, process.descriptors_size );
        }

        process.jit_descriptor_offset = (jit_addr - process.descriptors_addr) as usize;
        process.dex_descriptor_offset = (dex_addr - process.descriptors_addr) as usize;
        process.state = ProcessState::Initialized;
    }

    fn read_descriptors( &mut self, process: &Process ) -> Option< (Descriptor, Descriptor) > {
        let mut buffer = vec![ 0; process.descriptors_size ];
        if let Err( error ) = self.memory.read_memory( process.pid, process.descriptors_addr, &mut buffer ) {
            debug!( "Failed to read the JIT descriptors of {}: {}", process.pid, error );
            return None;
        }

        let jit = process.layout.parse_descriptor( &buffer[ process.jit_descriptor_offset.. ] )?;
        let dex = process.layout.parse_descriptor( &buffer[ process.dex_descriptor_offset.. ] )?;
        Some( (jit, dex) )
    }

    /// Walks the entry list from its head down to entries registered before `last_action_timestamp`.
    ///
    /// Returns `None` when the list looks broken, which can happen since the target keeps mutating it.
    fn read_new_code_entries( &mut self, process: &Process, descriptor: &Descriptor, last_action_timestamp: u64 ) -> Option< Vec< CodeEntry > > {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        let mut buffer = vec![ 0; process.layout.code_entry_size() ];
        let mut current_addr = descriptor.first_entry_addr;
        let mut prev_addr = 0;
        while entries.len() < MAX_LINKED_LIST_LENGTH && current_addr != 0 {
            if !seen.insert( current_addr ) {
                debug!( "Cycle in the code entry list of {} at 0x{:x}", process.pid, current_addr );
                return None;
            }

            if self.memory.read_memory( process.pid, current_addr, &mut buffer ).is_err() {
                return None;
            }

            let entry = process.layout.parse_code_entry( &buffer );
            if entry.prev_addr != prev_addr || entry.symfile_addr == 0 || entry.symfile_size == 0 {
                return None;
            }

            if entry.symfile_addr.checked_add( entry.symfile_size ).is_none() {
                debug!( "Code entry of {} at 0x{:x} has an out of range symfile: 0x{:x} + 0x{:x}", process.pid, current_addr, entry.symfile_addr, entry.symfile_size );
                return None;
            }

            // Entries are ordered by decreasing registration time.
            if entry.register_timestamp <= last_action_timestamp {
                break;
            }

            entries.push( CodeEntry {
                addr: current_addr,
                symfile_addr: entry.symfile_addr,
                symfile_size: entry.symfile_size
            });

            prev_addr = current_addr;
            current_addr = entry.next_addr;
        }

        Some( entries )
    }

    fn create_symfile( &mut self, data: &[u8] ) -> io::Result< PathBuf > {
        let mut builder = tempfile::Builder::new();
        builder.prefix( JIT_SYMFILE_PREFIX );
        let mut file = match self.symfile_dir {
            Some( ref dir ) => builder.tempfile_in( dir )?,
            None => builder.tempfile()?
        };

        file.write_all( data )?;
        file.flush()?;
        if self.keep_symfiles {
            let (_, path) = file.keep().map_err( |error| error.error )?;
            return Ok( path );
        }

        let path = file.path().to_owned();
        self.symfiles.push( file );
        Ok( path )
    }

    fn read_jit_symfiles( &mut self, process: &Process, entries: &[CodeEntry] ) -> Vec< JitSymFile > {
        let mut output = Vec::new();
        for entry in entries {
            if entry.symfile_size > MAX_JIT_SYMFILE_SIZE {
                continue;
            }

            let mut data = vec![ 0; entry.symfile_size as usize ];
            if self.memory.read_memory( process.pid, entry.symfile_addr, &mut data ).is_err() {
                continue;
            }

            if !data.starts_with( b"\x7fELF" ) {
                continue;
            }

            let mut min_addr = u64::max_value();
            let mut max_addr = 0;
            let mut out_of_range = false;
            let result = elf::read_symbols( &data, |symbol| {
                match symbol.vaddr.checked_add( symbol.len ) {
                    Some( end ) => {
                        trace!( "JIT symbol {} at 0x{:x}..0x{:x}", symbol.name, symbol.vaddr, end );
                        min_addr = min_addr.min( symbol.vaddr );
                        max_addr = max_addr.max( end );
                    },
                    None => out_of_range = true
                }
            });

            if out_of_range {
                debug!( "JIT symfile of {} at 0x{:x} has a symbol past the end of the address space", process.pid, entry.symfile_addr );
                continue;
            }

            if result.is_err() || min_addr >= max_addr {
                continue;
            }

            match self.create_symfile( &data ) {
                Ok( file_path ) => output.push( JitSymFile {
                    pid: process.pid,
                    addr: min_addr,
                    len: max_addr - min_addr,
                    file_path
                }),
                Err( error ) => warn!( "Failed to store JIT symbols of {}: {}", process.pid, error )
            }
        }

        output
    }

    fn read_dex_symfiles( &mut self, process: &Process, entries: &[CodeEntry] ) -> Vec< DexSymFile > {
        let mut regions = match self.memory.read_maps( process.pid ) {
            Ok( regions ) => regions,
            Err( _ ) => return Vec::new()
        };
        regions.sort_by_key( |region| region.start );

        let mut output = Vec::new();
        for entry in entries {
            let index = match regions.binary_search_by_key( &entry.symfile_addr, |region| region.start ) {
                Ok( index ) => index,
                Err( 0 ) => continue,
                Err( index ) => index - 1
            };

            let region = &regions[ index ];
            match entry.symfile_addr.checked_add( entry.symfile_size ) {
                Some( end ) if end <= region.end => {},
                _ => continue
            }

            // Dex files which only exist in memory can't be symbolized later.
            if !Path::new( &region.name ).is_file() {
                continue;
            }

            let dex_file_offset = entry.symfile_addr - region.start + region.file_offset;
            trace!( "Dex file {}+0x{:x} in [0x{:x}-0x{:x}] with size {}", region.name, dex_file_offset, region.start, region.end, entry.symfile_size );
            output.push( DexSymFile {
                pid: process.pid,
                dex_file_offset,
                file_path: region.name.clone()
            });
        }

        output
    }
}

fn is_art_library( path: &str ) -> bool {
    path.ends_with( "/libart.so" ) || path.ends_with( "/libartd.so" )
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::collections::BTreeMap;

    const PID: u32 = 1234;
    const JIT_DESCRIPTOR_ADDR: u64 = 0x1000;
    const DEX_DESCRIPTOR_ADDR: u64 = 0x1038;

    #[derive(Default)]
    struct FakeProcess {
        memory: BTreeMap< u64, Vec< u8 > >,
        regions: Vec< Region >,
        /// Bumps the jit seqlock by two after every descriptor read.
        concurrent_writer: bool
    }

    impl FakeProcess {
        fn put( &mut self, address: u64, data: Vec< u8 > ) {
            self.memory.insert( address, data );
        }
    }

    impl RemoteMemoryReader for FakeProcess {
        fn read_memory( &mut self, _: u32, address: u64, output: &mut [u8] ) -> io::Result< () > {
            let (&start, data) = self.memory.range_mut( ..=address ).next_back()
                .ok_or_else( || io::Error::new( io::ErrorKind::Other, "unmapped" ) )?;

            let offset = (address - start) as usize;
            if offset + output.len() > data.len() {
                return Err( io::Error::new( io::ErrorKind::Other, "unmapped" ) );
            }

            output.copy_from_slice( &data[ offset..offset + output.len() ] );
            if self.concurrent_writer && start == JIT_DESCRIPTOR_ADDR {
                let seqlock = NativeEndian::read_u32( &data[ 44.. ] );
                NativeEndian::write_u32( &mut data[ 44.. ], seqlock + 2 );
            }

            Ok(())
        }

        fn read_maps( &mut self, _: u32 ) -> io::Result< Vec< Region > > {
            Ok( self.regions.clone() )
        }
    }

    fn descriptor_64( seqlock: u32, timestamp: u64, first_entry: u64 ) -> Vec< u8 > {
        let mut data = Vec::new();
        data.write_u32::< NativeEndian >( 1 ).unwrap();
        data.write_u32::< NativeEndian >( 0 ).unwrap();
        data.write_u64::< NativeEndian >( 0 ).unwrap();
        data.write_u64::< NativeEndian >( first_entry ).unwrap();
        data.extend_from_slice( DESCRIPTOR_MAGIC );
        data.write_u32::< NativeEndian >( 0 ).unwrap();
        data.write_u32::< NativeEndian >( 56 ).unwrap();
        data.write_u32::< NativeEndian >( 40 ).unwrap();
        data.write_u32::< NativeEndian >( seqlock ).unwrap();
        data.write_u64::< NativeEndian >( timestamp ).unwrap();
        assert_eq!( data.len(), 56 );
        data
    }

    fn code_entry_64( next: u64, prev: u64, symfile_addr: u64, symfile_size: u64, timestamp: u64 ) -> Vec< u8 > {
        let mut data = Vec::new();
        for &value in &[ next, prev, symfile_addr, symfile_size, timestamp ] {
            data.write_u64::< NativeEndian >( value ).unwrap();
        }
        data
    }

    fn reader( fake: FakeProcess ) -> JitDebugReader< FakeProcess > {
        let mut reader = JitDebugReader::with_memory_reader( fake, false );
        let mut process = Process::new( PID );
        reader.set_descriptor_addresses( &mut process, true, JIT_DESCRIPTOR_ADDR, DEX_DESCRIPTOR_ADDR );
        reader.processes.insert( PID, process );
        reader
    }

    fn descriptors( jit: Vec< u8 >, dex: Vec< u8 > ) -> Vec< u8 > {
        let mut data = jit;
        data.extend( dex );
        data
    }

    fn last_jit_descriptor( reader: &JitDebugReader< FakeProcess > ) -> Descriptor {
        reader.processes[ &PID ].last_jit_descriptor
    }

    #[test]
    fn test_self_referencing_list_is_ignored() {
        let mut fake = FakeProcess::default();
        fake.put( JIT_DESCRIPTOR_ADDR, descriptors( descriptor_64( 2, 100, 0x2000 ), descriptor_64( 0, 0, 0 ) ) );
        fake.put( 0x2000, code_entry_64( 0x2000, 0, 0x3000, 0x100, 200 ) );

        let mut reader = reader( fake );
        let (jit, dex) = reader.read_all_processes();
        assert!( jit.is_empty() );
        assert!( dex.is_empty() );
        assert_eq!( last_jit_descriptor( &reader ), Descriptor::default() );
    }

    #[test]
    fn test_symfile_past_the_end_of_the_address_space_is_ignored() {
        let mut fake = FakeProcess::default();
        fake.put( JIT_DESCRIPTOR_ADDR, descriptors( descriptor_64( 2, 100, 0x2000 ), descriptor_64( 0, 0, 0 ) ) );
        fake.put( 0x2000, code_entry_64( 0, 0, u64::max_value() - 0x10, 0x100, 200 ) );

        let mut reader = reader( fake );
        let (jit, dex) = reader.read_all_processes();
        assert!( jit.is_empty() );
        assert!( dex.is_empty() );
        assert_eq!( last_jit_descriptor( &reader ), Descriptor::default() );
    }

    #[test]
    fn test_broken_back_link_is_ignored() {
        let mut fake = FakeProcess::default();
        fake.put( JIT_DESCRIPTOR_ADDR, descriptors( descriptor_64( 2, 100, 0x2000 ), descriptor_64( 0, 0, 0 ) ) );
        fake.put( 0x2000, code_entry_64( 0x2100, 0, 0x3000, 0x100, 200 ) );
        fake.put( 0x2100, code_entry_64( 0, 0x1111, 0x3000, 0x100, 150 ) );

        let mut reader = reader( fake );
        reader.read_all_processes();
        assert_eq!( last_jit_descriptor( &reader ), Descriptor::default() );
    }

    #[test]
    fn test_descriptor_state_advances_on_a_consistent_read() {
        let mut fake = FakeProcess::default();
        fake.put( JIT_DESCRIPTOR_ADDR, descriptors( descriptor_64( 2, 100, 0x2000 ), descriptor_64( 0, 0, 0 ) ) );
        fake.put( 0x2000, code_entry_64( 0, 0, 0x3000, 0x10, 200 ) );
        fake.put( 0x3000, vec![ 0; 0x10 ] );

        let mut reader = reader( fake );
        let (jit, _) = reader.read_all_processes();

        // The symfile isn't an ELF file, but the list itself was read consistently.
        assert!( jit.is_empty() );
        assert_eq!( last_jit_descriptor( &reader ), Descriptor { action_seqlock: 2, action_timestamp: 100, first_entry_addr: 0x2000 } );
    }

    #[test]
    fn test_torn_read_is_discarded() {
        let mut fake = FakeProcess::default();
        fake.concurrent_writer = true;
        fake.put( JIT_DESCRIPTOR_ADDR, descriptors( descriptor_64( 2, 100, 0x2000 ), descriptor_64( 0, 0, 0 ) ) );
        fake.put( 0x2000, code_entry_64( 0, 0, 0x3000, 0x10, 200 ) );

        let mut reader = reader( fake );
        reader.read_all_processes();
        assert_eq!( last_jit_descriptor( &reader ), Descriptor::default() );
    }

    #[test]
    fn test_update_in_progress_is_skipped() {
        let mut fake = FakeProcess::default();
        fake.put( JIT_DESCRIPTOR_ADDR, descriptors( descriptor_64( 3, 100, 0 ), descriptor_64( 0, 0, 0 ) ) );

        let mut reader = reader( fake );
        reader.read_all_processes();
        assert_eq!( last_jit_descriptor( &reader ), Descriptor::default() );
    }

    #[test]
    fn test_dex_entries_resolve_to_file_offsets() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join( "base.vdex" );
        std::fs::write( &path, vec![ 0; 0x4000 ] ).unwrap();
        let path = path.to_str().unwrap().to_owned();

        let mut fake = FakeProcess::default();
        fake.put( JIT_DESCRIPTOR_ADDR, descriptors( descriptor_64( 0, 0, 0 ), descriptor_64( 4, 300, 0x2000 ) ) );
        fake.put( 0x2000, code_entry_64( 0x2100, 0, 0x7000_1100, 0x800, 300 ) );
        fake.put( 0x2100, code_entry_64( 0, 0x2000, 0x9000_0000, 0x800, 250 ) );
        fake.regions = maps::parse( &format!(
            "70000000-70004000 r--p 00001000 fd:05 1234 {}\n90000000-90001000 rw-p 00000000 00:00 0 [anon:dalvik-DEX data]\n",
            path
        ));

        let mut reader = reader( fake );
        let (_, dex) = reader.read_all_processes();
        assert_eq!( dex, vec![ DexSymFile { pid: PID, dex_file_offset: 0x2100, file_path: path } ] );
        assert_eq!( reader.processes[ &PID ].last_dex_descriptor.action_seqlock, 4 );

        // Nothing changed since, so nothing is reported again.
        let (_, dex) = reader.read_all_processes();
        assert!( dex.is_empty() );
    }

    #[test]
    fn test_process_without_art_is_disabled() {
        let mut fake = FakeProcess::default();
        fake.regions = maps::parse( "400000-401000 r-xp 00000000 fd:05 1 /system/bin/toybox\n" );

        let mut reader = JitDebugReader::with_memory_reader( fake, false );
        reader.monitor_process( PID );
        assert!( reader.is_monitoring( PID ) );
        reader.read_all_processes();
        assert!( !reader.is_monitoring( PID ) );
    }

    #[test]
    fn test_code_entry_layouts() {
        let layout = Layout { is_64bit: false };
        let mut data = Vec::new();
        data.write_u32::< NativeEndian >( 0x10 ).unwrap();
        data.write_u32::< NativeEndian >( 0x20 ).unwrap();
        data.write_u32::< NativeEndian >( 0x30 ).unwrap();
        if layout.code_entry_size() == 32 {
            data.write_u32::< NativeEndian >( 0 ).unwrap();
        }
        data.write_u64::< NativeEndian >( 0x40 ).unwrap();
        data.write_u64::< NativeEndian >( 0x50 ).unwrap();
        assert_eq!( data.len(), layout.code_entry_size() );

        assert_eq!( layout.parse_code_entry( &data ), RawCodeEntry {
            next_addr: 0x10,
            prev_addr: 0x20,
            symfile_addr: 0x30,
            symfile_size: 0x40,
            register_timestamp: 0x50
        });
    }
}
