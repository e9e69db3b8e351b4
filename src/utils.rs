use std::fmt;
use std::fs::{self, read, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use libc;

pub struct HexValue( pub u64 );

impl fmt::Debug for HexValue {
    fn fmt( &self, fmt: &mut fmt::Formatter ) -> Result< (), fmt::Error > {
        write!( fmt, "0x{:016X}", self.0 )
    }
}

impl fmt::Display for HexValue {
    fn fmt( &self, fmt: &mut fmt::Formatter ) -> Result< (), fmt::Error > {
        write!( fmt, "0x{:x}", self.0 )
    }
}

pub fn read_string_lossy< P: AsRef< Path > >( path: P ) -> io::Result< String > {
    let data = read( path )?;
    Ok( String::from_utf8_lossy( &data ).into_owned() )
}

#[inline]
pub fn align( value: usize, alignment: usize ) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Returns the NUL-terminated prefix of `bytes`.
pub fn until_nul( bytes: &[u8] ) -> &[u8] {
    let length = bytes.iter().position( |&byte| byte == 0 ).unwrap_or( bytes.len() );
    &bytes[ ..length ]
}

pub fn invalid_data< S: Into< String > >( message: S ) -> io::Error {
    io::Error::new( io::ErrorKind::InvalidData, message.into() )
}

lazy_static! {
    static ref STOP_FLAG: AtomicBool = AtomicBool::new( false );
}

/// Turns SIGINT, SIGTERM and SIGCHLD into a flag polled by the capture loop.
#[derive(Clone)]
pub struct StopSignalHandler {
}

impl StopSignalHandler {
    pub fn new() -> Self {
        STOP_FLAG.store( false, Ordering::Relaxed ); // To initialize the `lazy_static`.

        extern fn handler( _: libc::c_int ) {
            STOP_FLAG.store( true, Ordering::Relaxed );
        }

        unsafe {
            libc::signal( libc::SIGINT, handler as libc::size_t );
            libc::signal( libc::SIGTERM, handler as libc::size_t );
            libc::signal( libc::SIGCHLD, handler as libc::size_t );
        }
        StopSignalHandler {}
    }

    pub fn was_triggered( &self ) -> bool {
        STOP_FLAG.load( Ordering::Relaxed )
    }
}

fn parse_cpu_list( list: &str ) -> Vec< u32 > {
    let mut cpus = Vec::new();
    for item in list.trim().split( ',' ).filter( |item| !item.is_empty() ) {
        let mut range = item.splitn( 2, '-' );
        let first = range.next().and_then( |value| value.trim().parse::< u32 >().ok() );
        let last = range.next().and_then( |value| value.trim().parse::< u32 >().ok() );
        match (first, last) {
            (Some( first ), Some( last )) => cpus.extend( first..=last ),
            (Some( first ), None) => cpus.push( first ),
            _ => warn!( "Ignoring malformed cpu list entry: {:?}", item )
        }
    }

    cpus
}

pub fn get_online_cpus() -> Vec< u32 > {
    match fs::read_to_string( "/sys/devices/system/cpu/online" ) {
        Ok( list ) => {
            let cpus = parse_cpu_list( &list );
            if !cpus.is_empty() {
                return cpus;
            }
        },
        Err( err ) => debug!( "Cannot read the online cpu list: {}", err )
    }

    (0..num_cpus::get() as u32).collect()
}

pub fn read_comm( pid: u32, tid: u32 ) -> Option< String > {
    let comm_path = format!( "/proc/{}/task/{}/comm", pid, tid );
    let mut fp = File::open( &comm_path ).ok()?;
    let mut buffer = Vec::new();
    fp.read_to_end( &mut buffer ).ok()?;

    let name = until_nul( &buffer );
    let name = String::from_utf8_lossy( name );
    Some( name.trim_end_matches( '\n' ).to_owned() )
}

/// Lists `(tid, comm)` for every thread of `pid`, including the main thread.
pub fn get_threads_in_process( pid: u32 ) -> io::Result< Vec< (u32, Option< String >) > > {
    let mut output = Vec::new();
    for entry in fs::read_dir( format!( "/proc/{}/task", pid ) )? {
        if let Ok( entry ) = entry {
            let tid: u32 = match entry.file_name().to_string_lossy().parse() {
                Ok( tid ) => tid,
                Err( _ ) => continue
            };

            output.push( (tid, read_comm( pid, tid )) );
        }
    }

    output.sort_by_key( |&(tid, _)| tid );
    Ok( output )
}

pub fn get_pid_of_thread( tid: u32 ) -> io::Result< u32 > {
    let status = read_string_lossy( format!( "/proc/{}/status", tid ) )?;
    for line in status.lines() {
        if line.starts_with( "Tgid:" ) {
            if let Ok( pid ) = line[ 5.. ].trim().parse() {
                return Ok( pid );
            }
        }
    }

    Err( invalid_data( format!( "no Tgid in /proc/{}/status", tid ) ) )
}

/// Pids of every process currently visible in `/proc`.
pub fn get_all_processes() -> io::Result< Vec< u32 > > {
    let mut pids: Vec< u32 > = fs::read_dir( "/proc" )?
        .filter_map( |entry| entry.ok() )
        .filter_map( |entry| entry.file_name().to_string_lossy().parse().ok() )
        .collect();

    pids.sort();
    Ok( pids )
}

/// The current `CLOCK_MONOTONIC` time in nanoseconds, the clock perf events are stamped with.
pub fn monotonic_time() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime( libc::CLOCK_MONOTONIC, &mut ts );
    }

    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[test]
fn test_parse_cpu_list() {
    assert_eq!( parse_cpu_list( "0-3\n" ), vec![ 0, 1, 2, 3 ] );
    assert_eq!( parse_cpu_list( "0,2-3,7" ), vec![ 0, 2, 3, 7 ] );
    assert_eq!( parse_cpu_list( "" ), Vec::< u32 >::new() );
}

#[test]
fn test_align() {
    assert_eq!( align( 0, 8 ), 0 );
    assert_eq!( align( 1, 8 ), 8 );
    assert_eq!( align( 13, 64 ), 64 );
}
