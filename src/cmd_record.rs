use std::collections::BTreeMap;
use std::error::Error;
use std::fs::File;
use std::io::{self, Seek, Write};
use std::os::unix::io::FromRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libc::{c_int, pid_t};
use perf_event_open::sys::{PerfEventAttr, PERF_SAMPLE_BRANCH_ANY};

use crate::args::{self, CallGraph};
use crate::dso::{is_jit_symfile_path, read_build_id_of_file, DsoConfig, DsoType, DEFAULT_KERNEL_MMAP_NAME};
use crate::event_selection_set::{EventSelectionSet, RecordSink, SelectionId, DEFAULT_MAX_MMAP_PAGES, DEFAULT_MIN_MMAP_PAGES};
use crate::jit_debug_reader::JitDebugReader;
use crate::kallsyms;
use crate::maps;
use crate::record::{BuildIdRecord, EventIdEntry, Mmap2Record, Record, RecordBody, SampleId};
use crate::record_file::{AttrWithIds, FileFeature, FEAT_ARCH, FEAT_OSRELEASE};
use crate::record_file_writer::RecordFileWriter;
use crate::thread_tree::ThreadTree;
use crate::utils::{get_all_processes, get_online_cpus, get_pid_of_thread, get_threads_in_process, monotonic_time, read_string_lossy, StopSignalHandler};

const FALLBACK_EVENT: &str = "cpu-clock";
const DEFAULT_EVENT: &str = "cpu-cycles";

/// A command started stopped right before `exec`, so that events with
/// `enable_on_exec` are opened before it runs.
struct Workload {
    child: Child,
    start_pipe: Option< File >
}

impl Workload {
    fn create( command: &[String] ) -> io::Result< Self > {
        let mut fds: [c_int; 2] = [0; 2];
        if unsafe { libc::pipe2( fds.as_mut_ptr(), libc::O_CLOEXEC ) } < 0 {
            return Err( io::Error::last_os_error() );
        }

        let (read_fd, write_fd) = (fds[ 0 ], fds[ 1 ]);
        let mut builder = Command::new( &command[ 0 ] );
        builder.args( &command[ 1.. ] );
        unsafe {
            builder.pre_exec( move || {
                // Otherwise the child would keep its own start signal alive.
                libc::close( write_fd );
                let mut byte = 0_u8;
                let result = libc::read( read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1 );
                if result != 1 {
                    return Err( io::Error::new( io::ErrorKind::Other, "the profiler went away" ) );
                }

                Ok(())
            });
        }

        let child = builder.spawn();
        unsafe {
            libc::close( read_fd );
        }

        let start_pipe = unsafe { File::from_raw_fd( write_fd ) };
        let child = child.map_err( |error| io::Error::new( error.kind(), format!( "failed to launch {:?}: {}", command[ 0 ], error ) ) )?;
        Ok( Workload { child, start_pipe: Some( start_pipe ) } )
    }

    fn pid( &self ) -> u32 {
        self.child.id()
    }

    fn start( &mut self ) -> io::Result< () > {
        if let Some( mut pipe ) = self.start_pipe.take() {
            pipe.write_all( &[1] )?;
        }

        Ok(())
    }
}

impl Drop for Workload {
    fn drop( &mut self ) {
        // Closing the pipe without writing makes the child fail its `exec`.
        self.start_pipe = None;
        if let Ok( None ) = self.child.try_wait() {
            let _ = self.child.kill();
        }

        let _ = self.child.wait();
    }
}

fn add_events( set: &mut EventSelectionSet, args: &args::RecordArgs, events: &[String] ) -> io::Result< () > {
    for spec in events {
        let names: Vec< &str > = spec.split( ',' ).filter( |name| !name.is_empty() ).collect();
        let leader = set.add_event_group( &names )?;
        for selection in 0..names.len() {
            let id = SelectionId { group: leader.group, selection };
            if let Some( period ) = args.period {
                set.set_sample_period( id, period )?;
            } else if let Some( freq ) = args.freq {
                set.set_sample_freq( id, freq )?;
            }
        }
    }

    match args.call_graph() {
        Some( CallGraph::FramePointer ) => set.enable_fp_call_chain_sampling(),
        Some( CallGraph::Dwarf( size ) ) => set.enable_dwarf_call_chain_sampling( size )?,
        None => {}
    }

    if args.branch_any {
        set.set_branch_sampling( PERF_SAMPLE_BRANCH_ANY )?;
    }

    set.set_inherit( !args.no_inherit );
    Ok(())
}

fn open_events( args: &args::RecordArgs, events: &[String], workload: Option< &Workload >, cpus: &[c_int] ) -> io::Result< EventSelectionSet > {
    let mut set = EventSelectionSet::new();
    add_events( &mut set, args, events )?;
    if let Some( workload ) = workload {
        set.add_monitored_processes( Some( workload.pid() as pid_t ) );
        set.set_enable_on_exec( true );
    } else if !args.system_wide {
        set.add_monitored_processes( args.pid.iter().map( |&pid| pid as pid_t ) );
        set.add_monitored_threads( args.tid.iter().map( |&tid| tid as pid_t ) );
    }

    set.open_event_files_for_threads_on_cpus( cpus )?;
    Ok( set )
}

fn explain_open_failure( error: &io::Error ) {
    if error.kind() != io::ErrorKind::PermissionDenied {
        return;
    }

    if let Ok( perf_event_paranoid ) = read_string_lossy( "/proc/sys/kernel/perf_event_paranoid" ) {
        let perf_event_paranoid = perf_event_paranoid.trim();
        if perf_event_paranoid != "-1" && perf_event_paranoid != "0" {
            warn!( "The '/proc/sys/kernel/perf_event_paranoid' is set to '{}', which is probably why you can't start the profiling", perf_event_paranoid );
            warn!( "You can try lowering it before trying to start the profiling again:" );
            warn!( "    echo '-1' | sudo tee /proc/sys/kernel/perf_event_paranoid" );
        }
    }
}

/// Everything the capture loop needs to persist records and track what they touch.
struct Recorder< W: Write + Seek > {
    writer: RecordFileWriter< W >,
    tree: ThreadTree,
    jit: Option< JitDebugReader >,
    attr: PerfEventAttr,
    event_id: u64,
    sample_count: u64,
    lost_count: u64
}

impl< W: Write + Seek > Recorder< W > {
    fn write( &mut self, record: Record ) -> io::Result< () > {
        match record.body {
            RecordBody::Sample( ref sample ) => {
                self.sample_count += 1;
                let thread = self.tree.find_thread_or_new( sample.pid, sample.tid );
                let (kernel_ips, user_ips) = sample.split_callchain();
                let hits = std::iter::once( (sample.ip, record.in_kernel()) )
                    .chain( kernel_ips.into_iter().map( |ip| (ip, true) ) )
                    .chain( user_ips.into_iter().map( |ip| (ip, false) ) );

                for (ip, in_kernel) in hits {
                    let map = self.tree.find_map( &thread, ip, in_kernel );
                    self.tree.dso_mut( map.dso ).mark_hit();
                }
            },
            RecordBody::Lost( ref lost ) => self.lost_count += lost.lost,
            _ => {
                self.tree.update( &record );
                if let Some( ref mut jit ) = self.jit {
                    jit.update_record( &record );
                }
            }
        }

        self.writer.write_record( &record )
    }

    fn synthesize_mmap( &mut self, pid: u32, tid: u32, region: &maps::Region, time: u64 ) -> io::Result< () > {
        let record = Record::mmap2( &self.attr, false, Mmap2Record {
            pid,
            tid,
            address: region.start,
            length: region.end - region.start,
            page_offset: region.file_offset,
            major: region.major,
            minor: region.minor,
            inode: region.inode,
            inode_generation: 0,
            protection: region.protection(),
            flags: region.flags(),
            filename: region.name.clone(),
            sample_id: SampleId::default()
        }, time, self.event_id );

        self.write( record )
    }

    fn synthesize_kernel_records( &mut self ) -> io::Result< () > {
        let symbols = kallsyms::read_kernel_symbols( kallsyms::KALLSYMS_PATH ).unwrap_or_default();
        let start = match kallsyms::get_kernel_start_address( &symbols ) {
            Some( start ) => start,
            None => {
                warn!( "Kernel addresses aren't visible; kernel samples won't be symbolized" );
                return Ok(());
            }
        };

        let record = Record::kernel_mmap( &self.attr, start, u64::max_value() - start, start, DEFAULT_KERNEL_MMAP_NAME, self.event_id );
        self.write( record )?;

        for module in kallsyms::get_loaded_modules() {
            if module.address == 0 {
                continue;
            }

            let name = format!( "[{}]", module.name );
            let record = Record::kernel_mmap( &self.attr, module.address, module.size, 0, &name, self.event_id );
            self.write( record )?;
        }

        Ok(())
    }

    fn synthesize_process_records( &mut self, pid: u32 ) -> io::Result< () > {
        let threads = match get_threads_in_process( pid ) {
            Ok( threads ) => threads,
            Err( error ) => {
                debug!( "Failed to list the threads of process {}: {}", pid, error );
                return Ok(());
            }
        };

        let time = monotonic_time();
        for (tid, comm) in &threads {
            if let Some( ref comm ) = *comm {
                let record = Record::comm( &self.attr, pid, *tid, comm, time, self.event_id );
                self.write( record )?;
            }
        }

        let regions = match maps::read_process_maps( pid ) {
            Ok( regions ) => regions,
            Err( error ) => {
                debug!( "Failed to read the maps of process {}: {}", pid, error );
                return Ok(());
            }
        };

        for region in regions.iter().filter( |region| region.is_executable ) {
            self.synthesize_mmap( pid, pid, region, time )?;
        }

        Ok(())
    }

    fn read_jit_debug_info( &mut self ) -> io::Result< () > {
        let (symfiles, dex_files) = match self.jit {
            Some( ref mut jit ) => jit.read_all_processes(),
            None => return Ok(())
        };

        let time = monotonic_time();
        for symfile in symfiles {
            let end = match symfile.addr.checked_add( symfile.len ) {
                Some( end ) => end,
                None => {
                    debug!( "Skipping JIT symfile {:?}: 0x{:x} + 0x{:x} is out of range", symfile.file_path, symfile.addr, symfile.len );
                    continue;
                }
            };

            let region = maps::Region {
                start: symfile.addr,
                end,
                is_read: true,
                is_write: false,
                is_executable: true,
                is_shared: false,
                file_offset: 0,
                major: 0,
                minor: 0,
                inode: 0,
                name: symfile.file_path.to_string_lossy().into_owned()
            };

            self.synthesize_mmap( symfile.pid, symfile.pid, &region, time )?;
        }

        for dex_file in dex_files {
            self.tree.add_dex_file_offset( &dex_file.file_path, dex_file.dex_file_offset );
        }

        Ok(())
    }

    /// Build ids of every binary which was hit by a sample.
    fn collect_build_ids( &mut self ) -> Vec< BuildIdRecord > {
        let mut output = Vec::new();
        let config = self.tree.config().clone();
        let ids: Vec< _ > = self.tree.dso_ids().collect();
        for id in ids {
            let dso = self.tree.dso( id );
            if !dso.has_hits() {
                continue;
            }

            let (build_id, pid) = match dso.kind() {
                DsoType::Kernel => (kallsyms::get_kernel_build_id(), u32::max_value()),
                DsoType::KernelModule => {
                    let name = dso.path().trim_start_matches( '[' ).trim_end_matches( ']' );
                    (kallsyms::get_module_build_id( name ), u32::max_value())
                },
                DsoType::ElfFile => (read_build_id_of_file( &config, dso.path() ), 0),
                DsoType::DexFile | DsoType::UnknownFile => continue
            };

            if let Some( build_id ) = build_id {
                output.push( BuildIdRecord {
                    pid,
                    build_id,
                    filename: dso.path().to_owned()
                });
            }
        }

        output
    }

    /// Symbols and dex offsets which can't be recovered once the process is gone.
    fn collect_file_features( &mut self ) -> Vec< FileFeature > {
        let ids: Vec< _ > = self.tree.dso_ids().collect();
        let mut output = Vec::new();
        for id in ids {
            let dso = self.tree.dso_mut( id );
            if !dso.has_hits() {
                continue;
            }

            let needs_feature = dso.kind() == DsoType::DexFile || is_jit_symfile_path( dso.path() );
            if needs_feature {
                output.push( dso.file_feature() );
            }
        }

        output
    }
}

impl< W: Write + Seek > RecordSink for Recorder< W > {
    fn on_record( &mut self, record: Record ) -> io::Result< () > {
        self.write( record )
    }

    fn on_tick( &mut self ) -> io::Result< () > {
        self.read_jit_debug_info()
    }
}

fn os_release() -> String {
    read_string_lossy( "/proc/sys/kernel/osrelease" ).map( |release| release.trim().to_owned() ).unwrap_or_default()
}

fn arch_name() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86" => "x86",
        "arm" => "arm",
        other => other
    }
}

fn record( args: &args::RecordArgs, output_created: &mut bool ) -> Result< (), Box< dyn Error > > {
    if args.command.is_empty() && args.pid.is_empty() && args.tid.is_empty() && !args.system_wide {
        return Err( "nothing to record; pass a command, -p, -t or -a".into() );
    }

    let mut workload = if args.command.is_empty() {
        None
    } else {
        Some( Workload::create( &args.command )? )
    };

    let cpus: Vec< c_int > = if args.cpu.is_empty() {
        get_online_cpus().into_iter().map( |cpu| cpu as c_int ).collect()
    } else {
        args.cpu.iter().map( |&cpu| cpu as c_int ).collect()
    };

    let user_picked_events = !args.event.is_empty();
    let events = if user_picked_events { args.event.clone() } else { vec![ DEFAULT_EVENT.to_owned() ] };
    let mut set = match open_events( args, &events, workload.as_ref(), &cpus ) {
        Ok( set ) => set,
        Err( error ) if !user_picked_events => {
            info!( "Failed to open '{}' ({}); falling back to '{}'", DEFAULT_EVENT, error, FALLBACK_EVENT );
            open_events( args, &[ FALLBACK_EVENT.to_owned() ], workload.as_ref(), &cpus ).map_err( |error| {
                explain_open_failure( &error );
                error
            })?
        },
        Err( error ) => {
            explain_open_failure( &error );
            return Err( error.into() );
        }
    };

    info!( "Opened {} event files", set.fd_count() );

    let max_pages = args.mmap_pages.unwrap_or( DEFAULT_MAX_MMAP_PAGES );
    set.mmap_event_files( DEFAULT_MIN_MMAP_PAGES.min( max_pages ), max_pages )?;
    set.prepare_to_read()?;

    let attrs: Vec< AttrWithIds > = set.attrs_with_ids();
    let first = attrs.first().ok_or( "no events were opened" )?;
    let attr = first.attr;
    let event_id = first.ids.first().cloned().unwrap_or( 0 );

    let mut writer = RecordFileWriter::create( &args.output )?;
    *output_created = true;
    writer.write_attr_section( &attrs )?;

    let mut recorder = Recorder {
        writer,
        tree: ThreadTree::new( Arc::new( DsoConfig::default() ) ),
        jit: if args.no_jit { None } else { Some( JitDebugReader::new( false ) ) },
        attr,
        event_id,
        sample_count: 0,
        lost_count: 0
    };

    let pids: Vec< u32 > = if let Some( ref workload ) = workload {
        vec![ workload.pid() ]
    } else if args.system_wide {
        get_all_processes()?
    } else {
        let mut pids: Vec< u32 > = set.monitored_processes().iter().map( |&pid| pid as u32 ).collect();
        for &tid in set.monitored_threads() {
            match get_pid_of_thread( tid as u32 ) {
                Ok( pid ) => pids.push( pid ),
                Err( error ) => warn!( "Failed to find the process of thread {}: {}", tid, error )
            }
        }

        pids.sort();
        pids.dedup();
        pids
    };

    recorder.synthesize_kernel_records()?;
    for &pid in &pids {
        // A launched command hasn't exec'd yet; the kernel reports its mappings itself.
        if workload.is_none() {
            recorder.synthesize_process_records( pid )?;
        }

        if let Some( ref mut jit ) = recorder.jit {
            jit.monitor_process( pid );
        }
    }

    let stop = StopSignalHandler::new();
    match workload {
        Some( ref mut workload ) => workload.start()?,
        None => set.set_enabled( true )?
    }

    info!( "Recording..." );
    let deadline = args.duration.map( |seconds| Instant::now() + Duration::from_secs_f64( seconds ) );
    set.read_until_stopped( &stop, deadline, &mut recorder )?;
    set.set_enabled( false )?;

    let event_ids = Record::new( 0, RecordBody::EventId(
        attrs.iter().enumerate()
            .flat_map( |(attr_index, attr)| attr.ids.iter().map( move |&event_id| EventIdEntry { attr_index: attr_index as u64, event_id } ) )
            .collect()
    ));
    recorder.writer.write_record( &event_ids )?;

    let build_ids = recorder.collect_build_ids();
    let files = recorder.collect_file_features();
    let cmdline: Vec< String > = std::env::args().collect();

    let mut meta_info = BTreeMap::new();
    meta_info.insert( "event_names".to_owned(), set.event_names().join( "," ) );
    meta_info.insert( "system_wide_collection".to_owned(), args.system_wide.to_string() );
    meta_info.insert( "simpleperf_version".to_owned(), env!( "CARGO_PKG_VERSION" ).to_owned() );
    meta_info.insert( "timestamp".to_owned(), monotonic_time().to_string() );

    let Recorder { mut writer, sample_count, lost_count, .. } = recorder;
    writer.write_build_id_feature( &build_ids )?;
    writer.write_file_feature( &files )?;
    writer.write_cmdline_feature( &cmdline )?;
    writer.write_string_feature( FEAT_OSRELEASE, &os_release() )?;
    writer.write_string_feature( FEAT_ARCH, arch_name() )?;
    writer.write_meta_info_feature( &meta_info )?;
    if args.branch_any {
        writer.write_branch_stack_feature()?;
    }

    writer.finalize()?.flush()?;

    info!( "Samples recorded: {}. Samples lost: {}.", sample_count, lost_count );
    if lost_count > 0 {
        warn!( "Lost {} samples; try increasing --mmap-pages or lowering the sampling frequency", lost_count );
    }

    Ok(())
}

pub fn main( args: args::RecordArgs ) -> Result< (), Box< dyn Error > > {
    let mut output_created = false;
    let result = record( &args, &mut output_created );
    if result.is_err() && output_created {
        // A partial file would claim to be a complete recording.
        let _ = std::fs::remove_file( &args.output );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_attr::create_default_perf_event_attr;
    use crate::event_type::find_event_type_by_name;
    use crate::record::SampleRecord;
    use crate::record_file_reader::RecordFileReader;
    use perf_event_open::sys::{PERF_ATTR_FLAG_FREQ, PERF_RECORD_MISC_KERNEL, PERF_RECORD_MISC_USER, PERF_SAMPLE_CALLCHAIN};
    use std::io::Cursor;
    use structopt::StructOpt;

    fn record_args( argv: &[&str] ) -> args::RecordArgs {
        let argv: Vec< &str > = [ "simpleperf", "record" ].iter().chain( argv ).cloned().collect();
        match args::Opt::from_iter( argv ) {
            args::Opt::Record( args ) => args,
            _ => unreachable!()
        }
    }

    #[test]
    fn test_event_lists_become_groups() {
        let args = record_args( &[ "-e", "cpu-cycles,instructions", "-e", "cpu-clock", "-c", "5000", "-g", "-p", "1" ] );
        let mut set = EventSelectionSet::new();
        add_events( &mut set, &args, &args.event ).unwrap();

        assert_eq!( set.groups().len(), 2 );
        assert_eq!( set.groups()[ 0 ].selections.len(), 2 );
        assert_eq!( set.event_names(), vec![ "cpu-cycles", "instructions", "cpu-clock" ] );
        for (_, selection) in set.selections() {
            assert!( !selection.attr.has_flag( PERF_ATTR_FLAG_FREQ ) );
            assert_eq!( selection.attr.sample_period_or_freq, 5000 );
            assert!( selection.attr.sample_type & PERF_SAMPLE_CALLCHAIN != 0 );
        }
    }

    #[test]
    fn test_duplicate_events_are_rejected() {
        let args = record_args( &[ "-e", "cpu-cycles", "-e", "cpu-cycles", "-p", "1" ] );
        let mut set = EventSelectionSet::new();
        assert!( add_events( &mut set, &args, &args.event ).is_err() );
    }

    #[test]
    fn test_recorder_tracks_hits_and_losses() {
        let mut attr = create_default_perf_event_attr( &find_event_type_by_name( "cpu-clock" ).unwrap() );
        attr.sample_type |= PERF_SAMPLE_CALLCHAIN;
        let attrs = [ AttrWithIds { attr, ids: vec![ 7 ] } ];
        let mut writer = RecordFileWriter::new( Cursor::new( Vec::new() ) ).unwrap();
        writer.write_attr_section( &attrs ).unwrap();

        let mut recorder = Recorder {
            writer,
            tree: ThreadTree::new( Arc::new( DsoConfig::default() ) ),
            jit: None,
            attr,
            event_id: 7,
            sample_count: 0,
            lost_count: 0
        };

        let region = maps::Region {
            start: 0x1000,
            end: 0x3000,
            is_read: true,
            is_write: false,
            is_executable: true,
            is_shared: false,
            file_offset: 0,
            major: 0,
            minor: 0,
            inode: 0,
            name: "/system/lib64/libfoo.so".to_owned()
        };

        recorder.synthesize_mmap( 10, 10, &region, 100 ).unwrap();
        recorder.on_record( Record::new( PERF_RECORD_MISC_USER, RecordBody::Sample( SampleRecord {
            sample_type: attr.sample_type,
            ip: 0x1800,
            pid: 10,
            tid: 10,
            time: 200,
            id: 7,
            period: 1,
            callchain: vec![ 0x1800, 0x2400 ],
            ..SampleRecord::default()
        }))).unwrap();
        recorder.on_record( Record::new( PERF_RECORD_MISC_KERNEL, RecordBody::Lost( crate::record::LostRecord {
            id: 7,
            lost: 4,
            sample_id: SampleId::new( &attr, 10, 10, 300, 7, 0 )
        }))).unwrap();

        assert_eq!( recorder.sample_count, 1 );
        assert_eq!( recorder.lost_count, 4 );

        let dso = recorder.tree.find_dso_by_path( "/system/lib64/libfoo.so" ).unwrap();
        assert!( recorder.tree.dso( dso ).has_hits() );
        assert!( recorder.collect_file_features().is_empty() );

        let bytes = recorder.writer.finalize().unwrap().into_inner();
        let mut reader = RecordFileReader::new( Cursor::new( bytes ) ).unwrap();
        let mut kinds = Vec::new();
        while let Some( (_, record) ) = reader.read_record().unwrap() {
            kinds.push( record.kind() );
        }

        assert_eq!( kinds.len(), 3 );
    }

    #[test]
    fn test_arch_name() {
        if cfg!( target_arch = "aarch64" ) {
            assert_eq!( arch_name(), "arm64" );
        } else if cfg!( target_arch = "x86_64" ) {
            assert_eq!( arch_name(), "x86_64" );
        }
    }
}
