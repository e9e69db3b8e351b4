use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::time::Instant;

use libc::{c_int, pid_t};

use perf_event_open::sys::*;
use perf_event_open::{EventFd, PerfCounter};

use crate::event_attr::{create_default_perf_event_attr, is_timestamp_supported, AttrResolver};
use crate::event_type::{parse_event_type, EventTypeAndModifier};
use crate::perf_regs;
use crate::record::{Record, RecordHeader, RECORD_HEADER_SIZE};
use crate::record_cache::RecordCache;
use crate::record_file::AttrWithIds;
use crate::utils::{get_threads_in_process, StopSignalHandler};

/// The largest user stack dump the kernel accepts, rounded down to a multiple of 8.
pub const MAX_DUMP_STACK_SIZE: u32 = 65528;

pub const DEFAULT_MIN_MMAP_PAGES: usize = 4;
pub const DEFAULT_MAX_MMAP_PAGES: usize = 256;

const POLL_TIMEOUT_MS: c_int = 100;

const VALID_BRANCH_SAMPLE_TYPES: &[u64] = &[
    PERF_SAMPLE_BRANCH_ANY,
    PERF_SAMPLE_BRANCH_ANY_CALL,
    PERF_SAMPLE_BRANCH_ANY_RETURN,
    PERF_SAMPLE_BRANCH_IND_CALL
];

/// Addresses one selection: its group and its position inside the group.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct SelectionId {
    pub group: usize,
    pub selection: usize
}

pub struct EventSelection {
    pub event_type_modifier: EventTypeAndModifier,
    pub attr: PerfEventAttr,
    fds: Vec< usize >
}

impl EventSelection {
    pub fn name( &self ) -> &str {
        &self.event_type_modifier.name
    }
}

/// Selections which the PMU schedules together.
#[derive(Default)]
pub struct EventSelectionGroup {
    pub selections: Vec< EventSelection >
}

/// Files opened for every member of a group on one (thread, cpu) pair, the leader first.
pub struct OpenedPair< T > {
    pub tid: pid_t,
    pub cpu: c_int,
    pub files: Vec< T >
}

/// Opens a group with `selection_count` members on every pair of `threads` and `cpus`.
///
/// `open` gets the selection index, the thread, the cpu and the already opened
/// group leader. A pair is kept only if every member opened; fails when no pair
/// was kept.
pub fn open_group< T, F >( selection_count: usize, threads: &[pid_t], cpus: &[c_int], mut open: F ) -> io::Result< Vec< OpenedPair< T > > >
    where F: FnMut( usize, pid_t, c_int, Option< &T > ) -> io::Result< T >
{
    let mut pairs = Vec::new();
    let mut last_error = None;
    for &tid in threads {
        let mut opened_on_some_cpu = false;
        'cpus: for &cpu in cpus {
            let mut files: Vec< T > = Vec::with_capacity( selection_count );
            for selection in 0..selection_count {
                match open( selection, tid, cpu, files.first() ) {
                    Ok( file ) => files.push( file ),
                    Err( error ) => {
                        last_error = Some( error );
                        continue 'cpus;
                    }
                }
            }

            opened_on_some_cpu = true;
            pairs.push( OpenedPair { tid, cpu, files } );
        }

        if !opened_on_some_cpu {
            // Most likely the thread exited in the meantime.
            debug!( "Failed to open any event file for thread {}", tid );
        }
    }

    if pairs.is_empty() {
        let error = last_error.unwrap_or_else( || io::Error::new( io::ErrorKind::InvalidInput, "no threads or cpus to monitor" ) );
        return Err( io::Error::new( error.kind(), format!( "failed to open any event file: {}", error ) ) );
    }

    Ok( pairs )
}

/// Receives records in timestamp order from `EventSelectionSet::read_until_stopped`.
pub trait RecordSink {
    fn on_record( &mut self, record: Record ) -> io::Result< () >;

    /// Called once per poll loop iteration.
    fn on_tick( &mut self ) -> io::Result< () > {
        Ok(())
    }
}

impl< F > RecordSink for F where F: FnMut( Record ) -> io::Result< () > {
    fn on_record( &mut self, record: Record ) -> io::Result< () > {
        self( record )
    }
}

#[derive(Clone, Debug)]
pub struct CounterInfo {
    pub tid: pid_t,
    pub cpu: c_int,
    pub counter: PerfCounter
}

#[derive(Clone, Debug)]
pub struct CountersInfo {
    pub id: SelectionId,
    pub event_name: String,
    pub counters: Vec< CounterInfo >
}

/// Every monitored event, the opened event files, and the ring buffers they write into.
pub struct EventSelectionSet {
    groups: Vec< EventSelectionGroup >,
    processes: BTreeSet< pid_t >,
    threads: BTreeSet< pid_t >,
    fds: Vec< EventFd >,
    fd_selection: Vec< SelectionId >,
    buffer_owners: Vec< usize >,
    resolver: AttrResolver,
    /// Attrs indexed the way `resolver` answers; filled in by `prepare_to_read`.
    read_attrs: Vec< PerfEventAttr >,
    cache: RecordCache< Record >,
    read_buffer: Vec< u8 >
}

impl Default for EventSelectionSet {
    fn default() -> Self {
        EventSelectionSet::new()
    }
}

impl EventSelectionSet {
    pub fn new() -> Self {
        EventSelectionSet {
            groups: Vec::new(),
            processes: BTreeSet::new(),
            threads: BTreeSet::new(),
            fds: Vec::new(),
            fd_selection: Vec::new(),
            buffer_owners: Vec::new(),
            resolver: AttrResolver::default(),
            read_attrs: Vec::new(),
            cache: RecordCache::with_defaults( true ),
            read_buffer: Vec::new()
        }
    }

    pub fn is_empty( &self ) -> bool {
        self.groups.is_empty()
    }

    pub fn groups( &self ) -> &[EventSelectionGroup] {
        &self.groups
    }

    pub fn selections( &self ) -> impl Iterator< Item = (SelectionId, &EventSelection) > {
        self.groups.iter().enumerate().flat_map( |(group_index, group)| {
            group.selections.iter().enumerate().map( move |(index, selection)| {
                (SelectionId { group: group_index, selection: index }, selection)
            })
        })
    }

    fn selections_mut( &mut self ) -> impl Iterator< Item = &mut EventSelection > {
        self.groups.iter_mut().flat_map( |group| group.selections.iter_mut() )
    }

    pub fn selection( &self, id: SelectionId ) -> Option< &EventSelection > {
        self.groups.get( id.group ).and_then( |group| group.selections.get( id.selection ) )
    }

    fn selection_mut( &mut self, id: SelectionId ) -> io::Result< &mut EventSelection > {
        self.groups.get_mut( id.group )
            .and_then( |group| group.selections.get_mut( id.selection ) )
            .ok_or_else( || io::Error::new( io::ErrorKind::InvalidInput, format!( "no event selection {:?}", id ) ) )
    }

    pub fn event_names( &self ) -> Vec< String > {
        self.selections().map( |(_, selection)| selection.name().to_owned() ).collect()
    }

    pub fn add_event_type( &mut self, event_spec: &str ) -> io::Result< SelectionId > {
        self.add_event_group( &[ event_spec ] )
    }

    /// Adds events which must be scheduled together; returns the id of the group leader.
    pub fn add_event_group< S: AsRef< str > >( &mut self, event_specs: &[S] ) -> io::Result< SelectionId > {
        if event_specs.is_empty() {
            return Err( io::Error::new( io::ErrorKind::InvalidInput, "empty event group" ) );
        }

        let mut group = EventSelectionGroup::default();
        for event_spec in event_specs {
            let event_type_modifier = parse_event_type( event_spec.as_ref() )?;
            let is_duplicate = self.selections().map( |(_, selection)| selection )
                .chain( group.selections.iter() )
                .any( |selection| selection.event_type_modifier.name == event_type_modifier.name );

            if is_duplicate {
                return Err( io::Error::new( io::ErrorKind::InvalidInput, format!( "event type '{}' appears more than once", event_type_modifier.name ) ) );
            }

            let mut attr = create_default_perf_event_attr( &event_type_modifier.event_type );
            attr.set_flag( PERF_ATTR_FLAG_EXCLUDE_USER, event_type_modifier.exclude_user );
            attr.set_flag( PERF_ATTR_FLAG_EXCLUDE_KERNEL, event_type_modifier.exclude_kernel );
            attr.set_flag( PERF_ATTR_FLAG_EXCLUDE_HV, event_type_modifier.exclude_hv );
            attr.set_flag( PERF_ATTR_FLAG_EXCLUDE_HOST, event_type_modifier.exclude_host );
            attr.set_flag( PERF_ATTR_FLAG_EXCLUDE_GUEST, event_type_modifier.exclude_guest );
            attr.set_precise_ip( event_type_modifier.precise_ip );

            // Only one event has to report mmaps and comms.
            if !self.groups.is_empty() || !group.selections.is_empty() {
                attr.set_flag( PERF_ATTR_FLAG_MMAP, false );
                attr.set_flag( PERF_ATTR_FLAG_COMM, false );
            }

            group.selections.push( EventSelection {
                event_type_modifier,
                attr,
                fds: Vec::new()
            });
        }

        self.groups.push( group );
        self.union_sample_type();
        Ok( SelectionId { group: self.groups.len() - 1, selection: 0 } )
    }

    /// Gives every selection the same sample layout, since records of several
    /// events can share one ring buffer.
    fn union_sample_type( &mut self ) {
        let sample_type = self.selections().fold( 0, |sample_type, (_, selection)| sample_type | selection.attr.sample_type );
        for selection in self.selections_mut() {
            selection.attr.sample_type = sample_type;
        }
    }

    pub fn set_sample_freq( &mut self, id: SelectionId, freq: u64 ) -> io::Result< () > {
        if freq == 0 {
            return Err( io::Error::new( io::ErrorKind::InvalidInput, "the sample frequency must be positive" ) );
        }

        let attr = &mut self.selection_mut( id )?.attr;
        attr.set_flag( PERF_ATTR_FLAG_FREQ, true );
        attr.sample_period_or_freq = freq;
        Ok(())
    }

    pub fn set_sample_period( &mut self, id: SelectionId, period: u64 ) -> io::Result< () > {
        if period == 0 {
            return Err( io::Error::new( io::ErrorKind::InvalidInput, "the sample period must be positive" ) );
        }

        let attr = &mut self.selection_mut( id )?.attr;
        attr.set_flag( PERF_ATTR_FLAG_FREQ, false );
        attr.sample_period_or_freq = period;
        Ok(())
    }

    /// Starts the events when the monitored command execs instead of when they're enabled.
    pub fn set_enable_on_exec( &mut self, enable: bool ) {
        for selection in self.selections_mut() {
            selection.attr.set_flag( PERF_ATTR_FLAG_ENABLE_ON_EXEC, enable );
            if enable {
                selection.attr.set_flag( PERF_ATTR_FLAG_DISABLED, true );
            }
        }
    }

    pub fn set_sample_id_all( &mut self, enable: bool ) {
        for selection in self.selections_mut() {
            selection.attr.set_flag( PERF_ATTR_FLAG_SAMPLE_ID_ALL, enable );
        }
    }

    pub fn set_inherit( &mut self, enable: bool ) {
        for selection in self.selections_mut() {
            selection.attr.set_flag( PERF_ATTR_FLAG_INHERIT, enable );
        }
    }

    /// Samples branch stacks of `branch_sample_type`; zero turns branch sampling off.
    pub fn set_branch_sampling( &mut self, branch_sample_type: u64 ) -> io::Result< () > {
        let filter = branch_sample_type & !(PERF_SAMPLE_BRANCH_USER | PERF_SAMPLE_BRANCH_KERNEL | PERF_SAMPLE_BRANCH_HV);
        if branch_sample_type != 0 && !VALID_BRANCH_SAMPLE_TYPES.contains( &filter ) {
            return Err( io::Error::new( io::ErrorKind::InvalidInput, format!( "invalid branch sample type 0x{:x}", branch_sample_type ) ) );
        }

        for selection in self.selections_mut() {
            if branch_sample_type == 0 {
                selection.attr.sample_type &= !PERF_SAMPLE_BRANCH_STACK;
            } else {
                selection.attr.sample_type |= PERF_SAMPLE_BRANCH_STACK;
            }
            selection.attr.branch_sample_type = branch_sample_type;
        }

        Ok(())
    }

    pub fn enable_fp_call_chain_sampling( &mut self ) {
        for selection in self.selections_mut() {
            selection.attr.sample_type |= PERF_SAMPLE_CALLCHAIN;
        }
    }

    /// Samples kernel call chains plus user registers and `dump_stack_size` bytes of user stack for offline unwinding.
    pub fn enable_dwarf_call_chain_sampling( &mut self, dump_stack_size: u32 ) -> io::Result< () > {
        if dump_stack_size % 8 != 0 || dump_stack_size == 0 || dump_stack_size > MAX_DUMP_STACK_SIZE {
            return Err( io::Error::new( io::ErrorKind::InvalidInput, format!(
                "invalid stack dump size {}; it must be a positive multiple of 8 no larger than {}",
                dump_stack_size,
                MAX_DUMP_STACK_SIZE
            )));
        }

        if perf_regs::native::REG_MASK == 0 {
            return Err( io::Error::new( io::ErrorKind::Other, "dwarf call graphs aren't supported on this architecture" ) );
        }

        for selection in self.selections_mut() {
            selection.attr.sample_type |= PERF_SAMPLE_CALLCHAIN | PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
            selection.attr.set_flag( PERF_ATTR_FLAG_EXCLUDE_CALLCHAIN_USER, true );
            selection.attr.sample_regs_user = perf_regs::native::REG_MASK;
            selection.attr.sample_stack_user = dump_stack_size;
        }

        Ok(())
    }

    pub fn add_monitored_processes< I: IntoIterator< Item = pid_t > >( &mut self, pids: I ) {
        self.processes.extend( pids );
    }

    pub fn add_monitored_threads< I: IntoIterator< Item = pid_t > >( &mut self, tids: I ) {
        self.threads.extend( tids );
    }

    pub fn monitored_processes( &self ) -> &BTreeSet< pid_t > {
        &self.processes
    }

    pub fn monitored_threads( &self ) -> &BTreeSet< pid_t > {
        &self.threads
    }

    pub fn has_monitored_target( &self ) -> bool {
        !self.processes.is_empty() || !self.threads.is_empty()
    }

    fn threads_to_open( &self ) -> Vec< pid_t > {
        let mut threads = self.threads.clone();
        for &pid in &self.processes {
            match get_threads_in_process( pid as u32 ) {
                Ok( tids ) => threads.extend( tids.into_iter().map( |(tid, _)| tid as pid_t ) ),
                Err( error ) => warn!( "Failed to list the threads of process {}: {}", pid, error )
            }
        }

        threads.into_iter().collect()
    }

    /// Opens every group on every monitored thread and every cpu in `cpus`.
    ///
    /// Monitoring the whole system means opening on thread `-1`.
    pub fn open_event_files_for_threads_on_cpus( &mut self, cpus: &[c_int] ) -> io::Result< () > {
        let threads = if self.has_monitored_target() { self.threads_to_open() } else { vec![ -1 ] };
        for group_index in 0..self.groups.len() {
            let attrs: Vec< PerfEventAttr > = self.groups[ group_index ].selections.iter().map( |selection| selection.attr ).collect();
            let pairs = open_group( attrs.len(), &threads, cpus, |selection, tid, cpu, leader| {
                EventFd::open( &attrs[ selection ], tid, cpu, leader )
            }).map_err( |error| {
                io::Error::new( error.kind(), format!( "{} (event group #{})", error, group_index ) )
            })?;

            debug!( "Opened event group #{} on {} (thread, cpu) pairs", group_index, pairs.len() );
            for pair in pairs {
                for (selection, fd) in pair.files.into_iter().enumerate() {
                    let index = self.fds.len();
                    self.fds.push( fd );
                    self.fd_selection.push( SelectionId { group: group_index, selection } );
                    self.groups[ group_index ].selections[ selection ].fds.push( index );
                }
            }
        }

        Ok(())
    }

    pub fn fd_count( &self ) -> usize {
        self.fds.len()
    }

    /// The attrs with the event ids of their opened files, in the order records refer to them.
    pub fn attrs_with_ids( &self ) -> Vec< AttrWithIds > {
        self.selections().map( |(_, selection)| AttrWithIds {
            attr: selection.attr,
            ids: selection.fds.iter().map( |&index| self.fds[ index ].id() ).collect()
        }).collect()
    }

    /// Maps one ring buffer per cpu, trying smaller sizes down to `min_pages` when memory is short.
    pub fn mmap_event_files( &mut self, min_pages: usize, max_pages: usize ) -> io::Result< () > {
        let min_pages = min_pages.max( 1 ).next_power_of_two();
        let mut pages = max_pages.max( min_pages ).next_power_of_two();

        let mut owners: BTreeMap< c_int, usize > = BTreeMap::new();
        for (index, fd) in self.fds.iter().enumerate() {
            owners.entry( fd.cpu() ).or_insert( index );
        }

        let owners: Vec< usize > = owners.values().cloned().collect();
        loop {
            match self.create_buffers( &owners, pages ) {
                Ok(()) => break,
                Err( error ) => {
                    for &owner in &owners {
                        self.fds[ owner ].release_mapped_buffer();
                    }

                    if pages <= min_pages {
                        return Err( io::Error::new( error.kind(), format!( "failed to mmap ring buffers of {} pages: {}", pages, error ) ) );
                    }

                    pages /= 2;
                    debug!( "Retrying with ring buffers of {} pages", pages );
                }
            }
        }

        for index in 0..self.fds.len() {
            if owners.contains( &index ) {
                continue;
            }

            let owner = match owners.iter().find( |&&owner| self.fds[ owner ].cpu() == self.fds[ index ].cpu() ) {
                Some( &owner ) => owner,
                None => continue
            };

            share_buffer( &mut self.fds, index, owner )?;
        }

        info!( "Mapped {} ring buffers of {} pages each", owners.len(), pages );
        self.buffer_owners = owners;
        Ok(())
    }

    fn create_buffers( &mut self, owners: &[usize], pages: usize ) -> io::Result< () > {
        for &owner in owners {
            self.fds[ owner ].create_mapped_buffer( pages )?;
        }

        Ok(())
    }

    /// Readies the reorder cache and the event id lookup; call after the files are mmaped.
    pub fn prepare_to_read( &mut self ) -> io::Result< () > {
        let attrs: Vec< PerfEventAttr > = self.selections().map( |(_, selection)| selection.attr ).collect();
        let mut resolver = AttrResolver::new( &attrs )?;
        for (attr_index, (_, selection)) in self.selections().enumerate() {
            for &fd in &selection.fds {
                resolver.add_event_id( self.fds[ fd ].id(), attr_index );
            }
        }

        self.resolver = resolver;

        let has_timestamp = attrs.iter().all( is_timestamp_supported );
        self.read_attrs = attrs;
        self.cache = RecordCache::with_defaults( has_timestamp );
        for &owner in &self.buffer_owners {
            self.cache.add_source( owner as u32 );
        }

        Ok(())
    }

    pub fn set_enabled( &self, enabled: bool ) -> io::Result< () > {
        for fd in &self.fds {
            fd.set_enabled( enabled )?;
        }

        Ok(())
    }

    fn poll( &self ) -> io::Result< () > {
        let mut poll_fds: Vec< libc::pollfd > = self.buffer_owners.iter().map( |&owner| self.fds[ owner ].poll_fd() ).collect();
        let result = unsafe { libc::poll( poll_fds.as_mut_ptr(), poll_fds.len() as _, POLL_TIMEOUT_MS ) };
        if result < 0 {
            let error = io::Error::last_os_error();
            if error.kind() != io::ErrorKind::Interrupted {
                return Err( error );
            }
        }

        Ok(())
    }

    fn parse_records( &mut self, source: u32 ) {
        let mut offset = 0;
        while offset + RECORD_HEADER_SIZE <= self.read_buffer.len() {
            let header = match RecordHeader::parse( &self.read_buffer[ offset.. ] ) {
                Ok( header ) => header,
                Err( error ) => {
                    warn!( "Dropping {} bytes of a ring buffer: {}", self.read_buffer.len() - offset, error );
                    break;
                }
            };

            let size = header.size as usize;
            if size < RECORD_HEADER_SIZE || offset + size > self.read_buffer.len() {
                warn!( "Dropping {} bytes of a ring buffer after a record of size {}", self.read_buffer.len() - offset, size );
                break;
            }

            let bytes = &self.read_buffer[ offset..offset + size ];
            offset += size;

            let attr_index = self.resolver.attr_index_for( header.kind, bytes );
            let attr = match self.read_attrs.get( attr_index ) {
                Some( attr ) => attr,
                None => {
                    warn!( "Skipping a record of type {}: the event files weren't prepared for reading", header.kind );
                    continue;
                }
            };

            match Record::parse( attr, bytes ) {
                Ok( record ) => {
                    let timestamp = record.timestamp();
                    self.cache.push( source, timestamp, record );
                },
                Err( error ) => warn!( "Skipping a malformed record of type {}: {}", header.kind, error )
            }
        }
    }

    /// Drains every ring buffer once and passes the records which are safe to emit to `sink`.
    pub fn read_mmap_event_data< S: RecordSink + ?Sized >( &mut self, sink: &mut S ) -> io::Result< () > {
        for owner_index in 0..self.buffer_owners.len() {
            let owner = self.buffer_owners[ owner_index ];
            self.read_buffer.clear();
            self.fds[ owner ].read_available_data( &mut self.read_buffer );

            self.parse_records( owner as u32 );
            self.cache.mark_drained( owner as u32 );
        }

        while let Some( record ) = self.cache.pop() {
            sink.on_record( record )?;
        }

        Ok(())
    }

    /// Drains the ring buffers a final time and flushes every cached record.
    pub fn finish_read_mmap_event_data< S: RecordSink + ?Sized >( &mut self, sink: &mut S ) -> io::Result< () > {
        self.read_mmap_event_data( sink )?;
        for record in self.cache.pop_all() {
            sink.on_record( record )?;
        }

        Ok(())
    }

    /// Polls the ring buffers until `stop` triggers or `deadline` passes, then flushes.
    pub fn read_until_stopped< S: RecordSink + ?Sized >( &mut self, stop: &StopSignalHandler, deadline: Option< Instant >, sink: &mut S ) -> io::Result< () > {
        loop {
            if stop.was_triggered() {
                debug!( "Stopping the capture after a signal" );
                break;
            }

            if deadline.map( |deadline| Instant::now() >= deadline ).unwrap_or( false ) {
                debug!( "Stopping the capture after its duration elapsed" );
                break;
            }

            self.poll()?;
            self.read_mmap_event_data( sink )?;
            sink.on_tick()?;
        }

        self.finish_read_mmap_event_data( sink )
    }

    pub fn read_counters( &self ) -> io::Result< Vec< CountersInfo > > {
        let mut output = Vec::new();
        for (id, selection) in self.selections() {
            let mut counters = Vec::with_capacity( selection.fds.len() );
            for &index in &selection.fds {
                let fd = &self.fds[ index ];
                counters.push( CounterInfo {
                    tid: fd.tid(),
                    cpu: fd.cpu(),
                    counter: fd.read_counter()?
                });
            }

            output.push( CountersInfo {
                id,
                event_name: selection.name().to_owned(),
                counters
            });
        }

        Ok( output )
    }

    /// Which selection the event file with the given kernel event id belongs to.
    pub fn selection_of_event_id( &self, event_id: u64 ) -> Option< SelectionId > {
        self.fds.iter().position( |fd| fd.id() == event_id ).map( |index| self.fd_selection[ index ] )
    }
}

fn share_buffer( fds: &mut [EventFd], member: usize, owner: usize ) -> io::Result< () > {
    if member < owner {
        let (head, tail) = fds.split_at_mut( owner );
        head[ member ].share_mapped_buffer( &tail[ 0 ] )
    } else {
        let (head, tail) = fds.split_at_mut( member );
        tail[ 0 ].share_mapped_buffer( &head[ owner ] )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBody;
    use quickcheck::{Arbitrary, Gen};

    fn comm_records( set: &EventSelectionSet, names: &[&str] ) -> Vec< u8 > {
        let attr = set.selections().next().unwrap().1.attr;
        let mut bytes = Vec::new();
        for (index, name) in names.iter().enumerate() {
            bytes.extend( Record::comm( &attr, 7, 7, name, 100 + index as u64, 0 ).to_bytes().unwrap() );
        }
        bytes
    }

    #[test]
    fn test_ring_buffer_bytes_are_parsed_with_the_prepared_attrs() {
        let mut set = EventSelectionSet::new();
        set.add_event_type( "cpu-clock" ).unwrap();

        set.read_buffer = comm_records( &set, &[ "early" ] );
        set.parse_records( 0 );
        assert!( set.cache.pop_all().is_empty() );

        set.prepare_to_read().unwrap();
        assert_eq!( set.read_attrs.len(), 1 );
        for _ in 0..2 {
            set.read_buffer = comm_records( &set, &[ "first", "second" ] );
            set.parse_records( 0 );
        }

        let names: Vec< String > = set.cache.pop_all().into_iter().filter_map( |record| match record.body {
            RecordBody::Comm( comm ) => Some( comm.comm ),
            _ => None
        }).collect();
        assert_eq!( names, vec![ "first", "first", "second", "second" ] );
    }

    fn sample_type_of( set: &EventSelectionSet, index: usize ) -> u64 {
        set.selections().nth( index ).unwrap().1.attr.sample_type
    }

    #[test]
    fn test_add_events() {
        let mut set = EventSelectionSet::new();
        let first = set.add_event_type( "cpu-cycles:u" ).unwrap();
        let group = set.add_event_group( &[ "instructions", "cache-misses:k" ] ).unwrap();
        assert_eq!( first, SelectionId { group: 0, selection: 0 } );
        assert_eq!( group, SelectionId { group: 1, selection: 0 } );
        assert_eq!( set.event_names(), vec![ "cpu-cycles:u", "instructions", "cache-misses:k" ] );

        let cycles = set.selection( first ).unwrap();
        assert!( cycles.attr.has_flag( PERF_ATTR_FLAG_EXCLUDE_KERNEL ) );
        assert!( !cycles.attr.has_flag( PERF_ATTR_FLAG_EXCLUDE_USER ) );
        assert!( cycles.attr.has_flag( PERF_ATTR_FLAG_MMAP ) );

        let misses = set.selection( SelectionId { group: 1, selection: 1 } ).unwrap();
        assert!( misses.attr.has_flag( PERF_ATTR_FLAG_EXCLUDE_USER ) );
        assert!( !misses.attr.has_flag( PERF_ATTR_FLAG_MMAP ) );
        assert!( !misses.attr.has_flag( PERF_ATTR_FLAG_COMM ) );

        assert!( set.add_event_type( "instructions" ).is_err() );
        assert!( set.add_event_type( "no-such-event" ).is_err() );
        assert!( set.add_event_group::< &str >( &[] ).is_err() );
        assert_eq!( set.groups().len(), 2 );
    }

    #[test]
    fn test_sample_type_is_unioned() {
        let mut set = EventSelectionSet::new();
        set.add_event_type( "cpu-cycles" ).unwrap();
        set.enable_fp_call_chain_sampling();
        set.add_event_type( "instructions" ).unwrap();
        assert_ne!( sample_type_of( &set, 1 ) & PERF_SAMPLE_CALLCHAIN, 0 );
        assert_eq!( sample_type_of( &set, 0 ), sample_type_of( &set, 1 ) );
    }

    #[test]
    fn test_setters_address_one_selection() {
        let mut set = EventSelectionSet::new();
        let first = set.add_event_type( "cpu-cycles" ).unwrap();
        let second = set.add_event_type( "instructions" ).unwrap();
        set.set_sample_period( second, 100000 ).unwrap();
        set.set_sample_freq( first, 1000 ).unwrap();

        let first = set.selection( first ).unwrap();
        let second = set.selection( second ).unwrap();
        assert!( first.attr.has_flag( PERF_ATTR_FLAG_FREQ ) );
        assert_eq!( first.attr.sample_period_or_freq, 1000 );
        assert!( !second.attr.has_flag( PERF_ATTR_FLAG_FREQ ) );
        assert_eq!( second.attr.sample_period_or_freq, 100000 );

        assert!( set.set_sample_freq( SelectionId { group: 5, selection: 0 }, 1000 ).is_err() );
        assert!( set.set_sample_period( SelectionId { group: 0, selection: 0 }, 0 ).is_err() );
    }

    #[test]
    fn test_set_wide_setters() {
        let mut set = EventSelectionSet::new();
        set.add_event_group( &[ "cpu-cycles", "instructions" ] ).unwrap();

        set.set_inherit( true );
        set.set_enable_on_exec( true );
        assert!( set.selections().all( |(_, selection)| selection.attr.has_flag( PERF_ATTR_FLAG_INHERIT ) ) );
        assert!( set.selections().all( |(_, selection)| selection.attr.has_flag( PERF_ATTR_FLAG_ENABLE_ON_EXEC ) ) );

        assert!( set.set_branch_sampling( PERF_SAMPLE_BRANCH_ANY | PERF_SAMPLE_BRANCH_USER ).is_ok() );
        assert_ne!( sample_type_of( &set, 1 ) & PERF_SAMPLE_BRANCH_STACK, 0 );
        assert!( set.set_branch_sampling( PERF_SAMPLE_BRANCH_ANY | PERF_SAMPLE_BRANCH_IND_CALL ).is_err() );
        set.set_branch_sampling( 0 ).unwrap();
        assert_eq!( sample_type_of( &set, 0 ) & PERF_SAMPLE_BRANCH_STACK, 0 );

        assert!( set.enable_dwarf_call_chain_sampling( 100 ).is_err() );
        assert!( set.enable_dwarf_call_chain_sampling( MAX_DUMP_STACK_SIZE + 8 ).is_err() );
        if perf_regs::native::REG_MASK != 0 {
            set.enable_dwarf_call_chain_sampling( 8192 ).unwrap();
            let attr = set.selections().next().unwrap().1.attr;
            assert_eq!( attr.sample_stack_user, 8192 );
            assert!( attr.has_flag( PERF_ATTR_FLAG_EXCLUDE_CALLCHAIN_USER ) );
            assert_ne!( attr.sample_type & PERF_SAMPLE_STACK_USER, 0 );
        }
    }

    /// Which (selection, thread, cpu) triples fail to open.
    #[derive(Clone, Debug)]
    struct OpenScenario {
        selection_count: usize,
        threads: Vec< pid_t >,
        cpus: Vec< c_int >,
        failures: Vec< (usize, pid_t, c_int) >
    }

    impl Arbitrary for OpenScenario {
        fn arbitrary( g: &mut Gen ) -> Self {
            let selection_count = usize::arbitrary( g ) % 3 + 1;
            let threads: Vec< pid_t > = (0..u8::arbitrary( g ) % 3 + 1).map( |tid| tid as pid_t + 100 ).collect();
            let cpus: Vec< c_int > = (0..u8::arbitrary( g ) % 4 + 1).map( |cpu| cpu as c_int ).collect();
            let mut failures = Vec::new();
            for selection in 0..selection_count {
                for &tid in &threads {
                    for &cpu in &cpus {
                        if u8::arbitrary( g ) % 3 == 0 {
                            failures.push( (selection, tid, cpu) );
                        }
                    }
                }
            }

            OpenScenario { selection_count, threads, cpus, failures }
        }
    }

    quickcheck! {
        fn opened_files_form_complete_groups( scenario: OpenScenario ) -> bool {
            let mut leaders_were_passed = true;
            let result = open_group( scenario.selection_count, &scenario.threads, &scenario.cpus, |selection, tid, cpu, leader| {
                if (selection == 0) != leader.is_none() {
                    leaders_were_passed = false;
                }

                if scenario.failures.contains( &(selection, tid, cpu) ) {
                    return Err( io::Error::new( io::ErrorKind::PermissionDenied, "denied" ) );
                }

                Ok( (selection, tid, cpu) )
            });

            let complete_pairs = scenario.threads.iter()
                .flat_map( |&tid| scenario.cpus.iter().map( move |&cpu| (tid, cpu) ) )
                .filter( |&(tid, cpu)| (0..scenario.selection_count).all( |selection| !scenario.failures.contains( &(selection, tid, cpu) ) ) )
                .count();

            match result {
                Ok( pairs ) => {
                    let kept: usize = pairs.iter().map( |pair| pair.files.len() ).sum();
                    leaders_were_passed &&
                        pairs.len() == complete_pairs &&
                        kept == complete_pairs * scenario.selection_count &&
                        pairs.iter().all( |pair| pair.files.iter().enumerate().all( |(index, &file)| file == (index, pair.tid, pair.cpu) ) )
                },
                Err( _ ) => leaders_were_passed && complete_pairs == 0
            }
        }
    }
}
