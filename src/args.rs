use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;

use crate::event_selection_set::MAX_DUMP_STACK_SIZE;

pub const DEFAULT_DWARF_STACK_SIZE: u32 = 8192;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CallGraph {
    FramePointer,
    Dwarf( u32 )
}

impl FromStr for CallGraph {
    type Err = String;
    fn from_str( value: &str ) -> Result< Self, Self::Err > {
        let mut iter = value.splitn( 2, ',' );
        match (iter.next(), iter.next()) {
            (Some( "fp" ), None) => Ok( CallGraph::FramePointer ),
            (Some( "dwarf" ), None) => Ok( CallGraph::Dwarf( DEFAULT_DWARF_STACK_SIZE ) ),
            (Some( "dwarf" ), Some( size )) => {
                let size: u32 = size.parse().map_err( |_| format!( "invalid stack size '{}'", size ) )?;
                if size == 0 || size % 8 != 0 || size > MAX_DUMP_STACK_SIZE {
                    return Err( format!( "the stack size must be a positive multiple of 8 no larger than {}", MAX_DUMP_STACK_SIZE ) );
                }

                Ok( CallGraph::Dwarf( size ) )
            },
            _ => Err( format!( "unknown call graph kind '{}'; expected 'fp' or 'dwarf[,size]'", value ) )
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SortKey {
    Comm,
    Pid,
    Tid,
    Dso,
    Symbol
}

impl FromStr for SortKey {
    type Err = String;
    fn from_str( value: &str ) -> Result< Self, Self::Err > {
        match value {
            "comm" => Ok( SortKey::Comm ),
            "pid" => Ok( SortKey::Pid ),
            "tid" => Ok( SortKey::Tid ),
            "dso" => Ok( SortKey::Dso ),
            "symbol" => Ok( SortKey::Symbol ),
            _ => Err( format!( "unknown sort key '{}'", value ) )
        }
    }
}

impl SortKey {
    pub fn as_str( &self ) -> &'static str {
        match *self {
            SortKey::Comm => "Command",
            SortKey::Pid => "Pid",
            SortKey::Tid => "Tid",
            SortKey::Dso => "Shared Object",
            SortKey::Symbol => "Symbol"
        }
    }
}

#[derive(StructOpt, Debug)]
#[structopt(rename_all = "kebab-case", setting = structopt::clap::AppSettings::TrailingVarArg)]
pub struct RecordArgs {
    /// The event to sample; a comma separated list opens the events as one group; can be specified multiple times
    #[structopt(long, short = "e", number_of_values = 1)]
    pub event: Vec< String >,

    /// Records the given processes
    #[structopt(long, short = "p", use_delimiter = true)]
    pub pid: Vec< u32 >,

    /// Records the given threads
    #[structopt(long, short = "t", use_delimiter = true)]
    pub tid: Vec< u32 >,

    /// Records every process in the system
    #[structopt(short = "a")]
    pub system_wide: bool,

    /// Records only on the given cpus
    #[structopt(long, use_delimiter = true)]
    pub cpu: Vec< u32 >,

    /// The sampling frequency, in samples per second
    #[structopt(long, short = "F", conflicts_with = "period")]
    pub freq: Option< u64 >,

    /// The number of events between two samples
    #[structopt(long, short = "c")]
    pub period: Option< u64 >,

    /// Samples call chains by walking frame pointers; same as `--call-graph fp`
    #[structopt(short = "g", conflicts_with = "call-graph")]
    pub fp_call_graph: bool,

    /// How to sample call chains: `fp` or `dwarf[,stack size]`
    #[structopt(long)]
    pub call_graph: Option< CallGraph >,

    /// Samples taken branches
    #[structopt(short = "b")]
    pub branch_any: bool,

    /// The number of data pages of each ring buffer; must be a power of two
    #[structopt(long, short = "m")]
    pub mmap_pages: Option< usize >,

    /// Stops recording after this many seconds
    #[structopt(long)]
    pub duration: Option< f64 >,

    /// The file to which the records will be written
    #[structopt(long, short = "o", default_value = "perf.data", parse(from_os_str))]
    pub output: PathBuf,

    /// Doesn't follow threads created after the recording starts
    #[structopt(long)]
    pub no_inherit: bool,

    /// Doesn't read JIT and dex debug information of Java processes
    #[structopt(long)]
    pub no_jit: bool,

    /// The command to launch and record
    pub command: Vec< String >
}

impl RecordArgs {
    pub fn call_graph( &self ) -> Option< CallGraph > {
        if self.fp_call_graph {
            Some( CallGraph::FramePointer )
        } else {
            self.call_graph
        }
    }
}

#[derive(StructOpt, Debug)]
#[structopt(rename_all = "kebab-case")]
pub struct ReportArgs {
    /// The record file to read
    #[structopt(long, short = "i", default_value = "perf.data", parse(from_os_str))]
    pub input: PathBuf,

    /// A directory which mirrors the device's filesystem and contains binaries with symbols
    #[structopt(long, parse(from_os_str))]
    pub symfs: Option< PathBuf >,

    /// The kernel image to read kernel symbols from
    #[structopt(long, parse(from_os_str))]
    pub vmlinux: Option< PathBuf >,

    /// A copy of /proc/kallsyms to read kernel symbols from
    #[structopt(long, parse(from_os_str))]
    pub kallsyms: Option< PathBuf >,

    /// Prints C++ symbols in their mangled form
    #[structopt(long)]
    pub no_demangle: bool,

    /// Keeps the frames of the Java runtime's own code
    #[structopt(long)]
    pub show_art_frames: bool,

    /// Doesn't merge JIT compiled frames with their interpreted counterparts
    #[structopt(long)]
    pub no_convert_jit_frames: bool,

    /// The keys by which the samples will be grouped
    #[structopt(long, use_delimiter = true, default_value = "comm,pid,tid,dso,symbol")]
    pub sort: Vec< SortKey >,

    /// Prints the call chains of every entry
    #[structopt(short = "g")]
    pub print_call_chains: bool
}

#[derive(StructOpt, Debug)]
#[structopt(rename_all = "kebab-case")]
pub struct DumpArgs {
    /// The record file to read
    #[structopt(long, short = "i", default_value = "perf.data", parse(from_os_str))]
    pub input: PathBuf,

    /// Outputs a JSON-formatted summary instead of every record
    #[structopt(long)]
    pub json: bool
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "simpleperf",
    setting = structopt::clap::AppSettings::ArgRequiredElseHelp
)]
pub enum Opt {
    /// Records samples of the given events into a record file
    #[structopt(name = "record")]
    Record( RecordArgs ),

    /// Summarizes the samples of a record file
    #[structopt(name = "report")]
    Report( ReportArgs ),

    /// Prints the raw contents of a record file
    #[structopt(name = "dump")]
    Dump( DumpArgs ),

    /// Lists the supported event types
    #[structopt(name = "list")]
    List
}

#[test]
fn test_parse_call_graph() {
    assert_eq!( "fp".parse(), Ok( CallGraph::FramePointer ) );
    assert_eq!( "dwarf".parse(), Ok( CallGraph::Dwarf( DEFAULT_DWARF_STACK_SIZE ) ) );
    assert_eq!( "dwarf,16384".parse(), Ok( CallGraph::Dwarf( 16384 ) ) );
    assert!( "dwarf,100".parse::< CallGraph >().is_err() );
    assert!( "dwarf,65536".parse::< CallGraph >().is_err() );
    assert!( "lbr".parse::< CallGraph >().is_err() );
}

#[test]
fn test_parse_record_args() {
    let opt = Opt::from_iter( &[ "simpleperf", "record", "-e", "cpu-cycles,instructions", "-e", "cache-misses:u", "-p", "10,11", "-g", "--no-jit", "-o", "out.data" ] );
    let args = match opt {
        Opt::Record( args ) => args,
        _ => panic!()
    };

    assert_eq!( args.event, vec![ "cpu-cycles,instructions", "cache-misses:u" ] );
    assert_eq!( args.pid, vec![ 10, 11 ] );
    assert_eq!( args.call_graph(), Some( CallGraph::FramePointer ) );
    assert!( args.no_jit );
    assert_eq!( args.output, PathBuf::from( "out.data" ) );
    assert!( args.command.is_empty() );
}

#[test]
fn test_parse_report_args() {
    let opt = Opt::from_iter( &[ "simpleperf", "report", "--sort", "dso,symbol", "--show-art-frames" ] );
    let args = match opt {
        Opt::Report( args ) => args,
        _ => panic!()
    };

    assert_eq!( args.sort, vec![ SortKey::Dso, SortKey::Symbol ] );
    assert!( args.show_art_frames );
    assert_eq!( args.input, PathBuf::from( "perf.data" ) );
}
