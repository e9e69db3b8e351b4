use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::dso::{is_jit_cache_path, Dso, DsoConfig, DsoType, Symbol, DEFAULT_KERNEL_MMAP_NAME, UNKNOWN_DSO_NAME};
use crate::read_apk::{is_apk_path, ApkInspector, EMBEDDED_PATH_SEPARATOR};
use crate::record::{Record, RecordBody};
use crate::record_file::FileFeature;

/// A stable handle of a `Dso` owned by a `ThreadTree`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct DsoId( usize );

impl DsoId {
    #[inline]
    pub fn index( &self ) -> usize {
        self.0
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MapEntry {
    pub start_addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub time: u64,
    pub dso: DsoId,
    pub in_kernel: bool
}

impl MapEntry {
    #[inline]
    pub fn end_addr( &self ) -> u64 {
        self.start_addr.saturating_add( self.len )
    }

    #[inline]
    pub fn contains( &self, addr: u64 ) -> bool {
        addr >= self.start_addr && addr - self.start_addr < self.len
    }
}

/// Non-overlapping mappings ordered by their start address.
#[derive(Clone, Default, Debug)]
pub struct MapSet {
    maps: BTreeMap< u64, MapEntry >
}

impl MapSet {
    /// Inserts `map`, cutting whatever part of older mappings it overlaps. Empty mappings are ignored.
    ///
    /// Unmaps are never recorded, so this is the only way stale ranges go away.
    pub fn insert( &mut self, map: MapEntry ) {
        if map.len == 0 {
            return;
        }

        let overlapping: Vec< MapEntry > = self.maps.range( ..map.end_addr() )
            .map( |(_, old)| *old )
            .filter( |old| old.end_addr() > map.start_addr )
            .collect();

        for old in overlapping {
            self.maps.remove( &old.start_addr );
            if old.start_addr < map.start_addr {
                let before = MapEntry {
                    len: map.start_addr - old.start_addr,
                    ..old
                };
                self.maps.insert( before.start_addr, before );
            }

            if old.end_addr() > map.end_addr() {
                let after = MapEntry {
                    start_addr: map.end_addr(),
                    len: old.end_addr() - map.end_addr(),
                    pgoff: old.pgoff + (map.end_addr() - old.start_addr),
                    ..old
                };
                self.maps.insert( after.start_addr, after );
            }
        }

        self.maps.insert( map.start_addr, map );
    }

    pub fn find( &self, addr: u64 ) -> Option< &MapEntry > {
        self.maps.range( ..=addr ).next_back().map( |(_, map)| map ).filter( |map| map.contains( addr ) )
    }

    pub fn iter( &self ) -> impl Iterator< Item = &MapEntry > {
        self.maps.values()
    }

    pub fn len( &self ) -> usize {
        self.maps.len()
    }

    pub fn is_empty( &self ) -> bool {
        self.maps.is_empty()
    }
}

/// A snapshot of a thread; `comm` is the name the thread had when the snapshot was taken.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ThreadEntry {
    pub pid: u32,
    pub tid: u32,
    pub comm: Arc< str >,
    pub exited: bool
}

fn user_dso_type( filename: &str ) -> DsoType {
    if filename.ends_with( ".dex" ) || filename.ends_with( ".vdex" ) || filename.ends_with( ".jar" ) {
        DsoType::DexFile
    } else if is_jit_cache_path( filename ) {
        DsoType::ElfFile
    } else if filename.is_empty() ||
        filename.starts_with( '[' ) ||
        filename.starts_with( "//anon" ) ||
        filename.starts_with( "/dev/" ) ||
        filename.starts_with( "/memfd:" ) ||
        filename.starts_with( "/anon_hugepage" )
    {
        DsoType::UnknownFile
    } else {
        DsoType::ElfFile
    }
}

/// Threads and the mappings of their processes, rebuilt from COMM, FORK, EXIT and MMAP records.
pub struct ThreadTree {
    config: Arc< DsoConfig >,
    threads: HashMap< u32, ThreadEntry >,
    process_maps: HashMap< u32, MapSet >,
    kernel_maps: MapSet,
    dsos: Vec< Dso >,
    kernel_dso: DsoId,
    module_dsos: HashMap< String, DsoId >,
    user_dsos: HashMap< String, DsoId >,
    unknown_map: MapEntry,
    apk_inspector: ApkInspector
}

impl ThreadTree {
    pub fn new( config: Arc< DsoConfig > ) -> Self {
        let unknown_dso = Dso::new( DsoType::UnknownFile, 0, UNKNOWN_DSO_NAME, config.clone() );
        let kernel_dso = Dso::new( DsoType::Kernel, 1, DEFAULT_KERNEL_MMAP_NAME, config.clone() );
        ThreadTree {
            config,
            threads: HashMap::new(),
            process_maps: HashMap::new(),
            kernel_maps: MapSet::default(),
            dsos: vec![ unknown_dso, kernel_dso ],
            kernel_dso: DsoId( 1 ),
            module_dsos: HashMap::new(),
            user_dsos: HashMap::new(),
            unknown_map: MapEntry {
                start_addr: 0,
                len: u64::max_value(),
                pgoff: 0,
                time: 0,
                dso: DsoId( 0 ),
                in_kernel: false
            },
            apk_inspector: ApkInspector::new()
        }
    }

    pub fn config( &self ) -> &Arc< DsoConfig > {
        &self.config
    }

    #[inline]
    pub fn dso( &self, id: DsoId ) -> &Dso {
        &self.dsos[ id.0 ]
    }

    #[inline]
    pub fn dso_mut( &mut self, id: DsoId ) -> &mut Dso {
        &mut self.dsos[ id.0 ]
    }

    pub fn dso_ids( &self ) -> impl Iterator< Item = DsoId > {
        (0..self.dsos.len()).map( DsoId )
    }

    pub fn kernel_dso( &self ) -> DsoId {
        self.kernel_dso
    }

    pub fn find_dso_by_path( &self, path: &str ) -> Option< DsoId > {
        if path == DEFAULT_KERNEL_MMAP_NAME {
            return Some( self.kernel_dso );
        }

        self.user_dsos.get( path ).or_else( || self.module_dsos.get( path ) ).cloned()
    }

    #[inline]
    pub fn unknown_map( &self ) -> MapEntry {
        self.unknown_map
    }

    fn allocate_dso( &mut self, kind: DsoType, path: &str ) -> DsoId {
        let id = DsoId( self.dsos.len() );
        self.dsos.push( Dso::new( kind, id.0 as u64, path, self.config.clone() ) );
        id
    }

    fn find_kernel_dso_or_new( &mut self, filename: &str ) -> DsoId {
        if filename.starts_with( DEFAULT_KERNEL_MMAP_NAME ) {
            return self.kernel_dso;
        }

        if let Some( &id ) = self.module_dsos.get( filename ) {
            return id;
        }

        let id = self.allocate_dso( DsoType::KernelModule, filename );
        self.module_dsos.insert( filename.to_owned(), id );
        id
    }

    fn find_user_dso_or_new( &mut self, filename: &str ) -> DsoId {
        if let Some( &id ) = self.user_dsos.get( filename ) {
            return id;
        }

        let id = self.allocate_dso( user_dso_type( filename ), filename );
        self.user_dsos.insert( filename.to_owned(), id );
        id
    }

    fn thread_entry_or_new( &mut self, pid: u32, tid: u32 ) -> &mut ThreadEntry {
        let leader_comm = if tid != pid {
            self.threads.get( &pid ).map( |leader| leader.comm.clone() )
        } else {
            None
        };
        let comm = leader_comm.unwrap_or_else( || Arc::from( "unknown" ) );

        self.process_maps.entry( pid ).or_insert_with( MapSet::default );
        let thread = self.threads.entry( tid ).or_insert_with( || ThreadEntry { pid, tid, comm: comm.clone(), exited: false } );
        if thread.pid != pid || thread.exited {
            // The tid was reused.
            *thread = ThreadEntry { pid, tid, comm, exited: false };
        }

        thread
    }

    /// Returns a snapshot of the thread, creating it on first reference.
    pub fn find_thread_or_new( &mut self, pid: u32, tid: u32 ) -> ThreadEntry {
        self.thread_entry_or_new( pid, tid ).clone()
    }

    pub fn find_thread( &self, tid: u32 ) -> Option< &ThreadEntry > {
        self.threads.get( &tid )
    }

    pub fn add_thread( &mut self, pid: u32, tid: u32, comm: &str ) {
        let thread = self.thread_entry_or_new( pid, tid );
        if &*thread.comm != comm {
            thread.comm = Arc::from( comm );
        }
    }

    pub fn fork_thread( &mut self, pid: u32, tid: u32, ppid: u32, ptid: u32 ) {
        let parent_comm = self.thread_entry_or_new( ppid, ptid ).comm.clone();
        self.thread_entry_or_new( pid, tid ).comm = parent_comm;
        // The child's maps can already be known from synthesized mmap records.
        let child_has_maps = self.process_maps.get( &pid ).map( |maps| !maps.is_empty() ).unwrap_or( false );
        if pid != ppid && !child_has_maps {
            let parent_maps = self.process_maps.get( &ppid ).cloned().unwrap_or_default();
            self.process_maps.insert( pid, parent_maps );
        }
    }

    pub fn exit_thread( &mut self, pid: u32, tid: u32 ) {
        if let Some( thread ) = self.threads.get_mut( &tid ) {
            if thread.pid == pid {
                thread.exited = true;
            }
        }
    }

    pub fn add_kernel_map( &mut self, start_addr: u64, len: u64, pgoff: u64, time: u64, filename: &str ) {
        // The kernel image is reported with a zero length on some devices.
        if len == 0 {
            return;
        }

        let dso = self.find_kernel_dso_or_new( filename );
        if self.dsos[ dso.0 ].kind() == DsoType::KernelModule {
            self.dsos[ dso.0 ].set_module_base( start_addr );
        }

        self.kernel_maps.insert( MapEntry {
            start_addr,
            len,
            pgoff,
            time,
            dso,
            in_kernel: true
        });
    }

    pub fn add_thread_map( &mut self, pid: u32, tid: u32, start_addr: u64, len: u64, pgoff: u64, time: u64, filename: &str ) {
        let mut pgoff = pgoff;
        let mut filename = filename.to_owned();
        if is_apk_path( &filename ) {
            let debug_file_path = self.config.debug_file_path( &filename );
            if let Some( elf ) = self.apk_inspector.find_elf_by_offset( &debug_file_path, pgoff ) {
                filename = format!( "{}{}{}", filename, EMBEDDED_PATH_SEPARATOR, elf.entry_name );
                pgoff -= elf.entry_offset;
            }
        }

        self.thread_entry_or_new( pid, tid );
        let dso = self.find_user_dso_or_new( &filename );
        self.process_maps.entry( pid ).or_insert_with( MapSet::default ).insert( MapEntry {
            start_addr,
            len,
            pgoff,
            time,
            dso,
            in_kernel: false
        });
    }

    /// Marks a dex file at `dex_file_offset` inside `path`; the Dso behind `path` becomes a dex Dso.
    pub fn add_dex_file_offset( &mut self, path: &str, dex_file_offset: u64 ) {
        let id = self.find_user_dso_or_new( path );
        if self.dsos[ id.0 ].kind() != DsoType::DexFile {
            let offsets = self.dsos[ id.0 ].dex_file_offsets().to_vec();
            self.dsos[ id.0 ] = Dso::new( DsoType::DexFile, id.0 as u64, path, self.config.clone() );
            for offset in offsets {
                self.dsos[ id.0 ].add_dex_file_offset( offset );
            }
        }

        self.dsos[ id.0 ].add_dex_file_offset( dex_file_offset );
    }

    /// Restores symbols and dex offsets which were saved into the record file.
    pub fn apply_file_feature( &mut self, file: &FileFeature ) {
        if DsoType::from_file_type( file.dso_type ) == DsoType::DexFile {
            for &offset in &file.dex_file_offsets {
                self.add_dex_file_offset( &file.path, offset );
            }
        }

        if file.symbols.is_empty() {
            return;
        }

        let id = match self.find_dso_by_path( &file.path ) {
            Some( id ) => id,
            None => self.find_user_dso_or_new( &file.path )
        };

        let symbols = file.symbols.iter().map( |symbol| Symbol::new( symbol.name.clone(), symbol.vaddr, symbol.len as u64 ) ).collect();
        self.dsos[ id.0 ].set_symbols( symbols );
    }

    pub fn thread_maps( &self, thread: &ThreadEntry ) -> Option< &MapSet > {
        self.process_maps.get( &thread.pid )
    }

    pub fn kernel_maps( &self ) -> &MapSet {
        &self.kernel_maps
    }

    /// Finds the mapping containing `ip`, looking only at kernel or user mappings.
    pub fn find_map( &self, thread: &ThreadEntry, ip: u64, in_kernel: bool ) -> MapEntry {
        let map = if in_kernel {
            self.kernel_maps.find( ip )
        } else {
            self.thread_maps( thread ).and_then( |maps| maps.find( ip ) )
        };

        map.cloned().unwrap_or( self.unknown_map )
    }

    /// Finds the mapping containing `ip` when it isn't known whether it's a kernel address.
    pub fn find_map_any( &self, thread: &ThreadEntry, ip: u64 ) -> MapEntry {
        self.thread_maps( thread )
            .and_then( |maps| maps.find( ip ) )
            .or_else( || self.kernel_maps.find( ip ) )
            .cloned()
            .unwrap_or( self.unknown_map )
    }

    /// Resolves `ip` inside `map`, returning the symbol and the address in the file.
    pub fn find_symbol( &mut self, map: &MapEntry, ip: u64 ) -> (Option< Symbol >, u64) {
        let dso = &mut self.dsos[ map.dso.0 ];
        let vaddr_in_file = dso.ip_to_vaddr_in_file( ip, map.start_addr, map.pgoff );
        (dso.find_symbol( vaddr_in_file ).cloned(), vaddr_in_file)
    }

    pub fn find_kernel_symbol( &mut self, ip: u64 ) -> Option< Symbol > {
        let kernel_dso = self.kernel_dso;
        self.dsos[ kernel_dso.0 ].find_symbol( ip ).cloned()
    }

    /// Forgets threads and mappings while keeping the loaded Dsos.
    pub fn clear_thread_and_map( &mut self ) {
        self.threads.clear();
        self.process_maps.clear();
        self.kernel_maps = MapSet::default();
    }

    /// Applies a COMM, FORK, EXIT or MMAP record; must see records in the order they were generated.
    pub fn update( &mut self, record: &Record ) {
        let time = record.timestamp().unwrap_or( 0 );
        match record.body {
            RecordBody::Mmap( ref mmap ) => {
                if record.in_kernel() {
                    self.add_kernel_map( mmap.address, mmap.length, mmap.page_offset, time, &mmap.filename );
                } else {
                    self.add_thread_map( mmap.pid, mmap.tid, mmap.address, mmap.length, mmap.page_offset, time, &mmap.filename );
                }
            },
            RecordBody::Mmap2( ref mmap ) => {
                if record.in_kernel() {
                    self.add_kernel_map( mmap.address, mmap.length, mmap.page_offset, time, &mmap.filename );
                } else {
                    self.add_thread_map( mmap.pid, mmap.tid, mmap.address, mmap.length, mmap.page_offset, time, &mmap.filename );
                }
            },
            RecordBody::Comm( ref comm ) => {
                self.add_thread( comm.pid, comm.tid, &comm.comm );
            },
            RecordBody::Fork( ref fork ) => {
                self.fork_thread( fork.pid, fork.tid, fork.ppid, fork.ptid );
            },
            RecordBody::Exit( ref exit ) => {
                self.exit_thread( exit.pid, exit.tid );
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_attr::create_default_perf_event_attr;
    use crate::event_type::find_event_type_by_name;
    use crate::record::{ExitOrForkRecord, Mmap2Record, SampleId};
    use perf_event_open::sys::PerfEventAttr;

    fn tree() -> ThreadTree {
        ThreadTree::new( Arc::new( DsoConfig::default() ) )
    }

    fn attr() -> PerfEventAttr {
        create_default_perf_event_attr( &find_event_type_by_name( "cpu-clock" ).unwrap() )
    }

    fn ranges( maps: &MapSet ) -> Vec< (u64, u64, u64) > {
        maps.iter().map( |map| (map.start_addr, map.end_addr(), map.pgoff) ).collect()
    }

    #[test]
    fn test_overlapping_map_truncates_the_older_one() {
        let mut tree = tree();
        tree.add_thread_map( 1, 1, 0x2000, 0x2000, 0, 0, "/system/lib64/liba.so" );
        tree.add_thread_map( 1, 1, 0x3000, 0x1000, 0, 1, "/system/lib64/libb.so" );

        let thread = tree.find_thread_or_new( 1, 1 );
        let maps = tree.thread_maps( &thread ).unwrap();
        assert_eq!( ranges( maps ), vec![ (0x2000, 0x3000, 0), (0x3000, 0x4000, 0) ] );

        let first = tree.find_map( &thread, 0x2fff, false );
        let second = tree.find_map( &thread, 0x3000, false );
        assert_eq!( tree.dso( first.dso ).path(), "/system/lib64/liba.so" );
        assert_eq!( tree.dso( second.dso ).path(), "/system/lib64/libb.so" );
    }

    #[test]
    fn test_map_inside_an_older_one_splits_it() {
        let mut maps = MapSet::default();
        let entry = |start_addr, len, pgoff, dso| MapEntry { start_addr, len, pgoff, time: 0, dso: DsoId( dso ), in_kernel: false };
        maps.insert( entry( 0x1000, 0x4000, 0x100, 2 ) );
        maps.insert( entry( 0x2000, 0x1000, 0, 3 ) );
        assert_eq!( ranges( &maps ), vec![ (0x1000, 0x2000, 0x100), (0x2000, 0x3000, 0), (0x3000, 0x5000, 0x2100) ] );

        maps.insert( entry( 0x0, 0x10000, 0, 4 ) );
        assert_eq!( ranges( &maps ), vec![ (0x0, 0x10000, 0) ] );
        assert_eq!( maps.find( 0x10000 ), None );
    }

    #[test]
    fn test_empty_map_is_ignored() {
        let mut maps = MapSet::default();
        let entry = |start_addr, len| MapEntry { start_addr, len, pgoff: 0, time: 0, dso: DsoId( 2 ), in_kernel: false };
        maps.insert( entry( 0x1000, 0x2000 ) );
        maps.insert( entry( 0x1800, 0 ) );
        assert_eq!( ranges( &maps ), vec![ (0x1000, 0x3000, 0) ] );
        assert_eq!( maps.find( 0x1800 ).map( |map| map.start_addr ), Some( 0x1000 ) );

        maps.insert( entry( 0x5000, 0 ) );
        assert_eq!( maps.len(), 1 );
        assert_eq!( maps.find( 0x5000 ), None );
    }

    #[test]
    fn test_find_map_falls_back_to_unknown() {
        let mut tree = tree();
        tree.add_kernel_map( 0xffffffff81000000, 0x1000000, 0, 0, DEFAULT_KERNEL_MMAP_NAME );
        tree.add_kernel_map( 0xffffffffa0000000, 0x10000, 0, 0, "[virtio_net]" );
        tree.add_thread_map( 10, 10, 0x400000, 0x1000, 0, 0, "/system/bin/app" );
        let thread = tree.find_thread_or_new( 10, 10 );

        assert_eq!( tree.find_map( &thread, 0xffffffff81000100, true ).dso, tree.kernel_dso() );
        assert_eq!( tree.find_map( &thread, 0xffffffff81000100, false ), tree.unknown_map() );
        assert_eq!( tree.find_map( &thread, 0x400100, true ), tree.unknown_map() );
        assert_eq!( tree.find_map_any( &thread, 0xffffffff81000100 ).dso, tree.kernel_dso() );

        let module = tree.find_map( &thread, 0xffffffffa0000010, true );
        assert_eq!( tree.dso( module.dso ).kind(), DsoType::KernelModule );
        assert_eq!( tree.dso( tree.unknown_map().dso ).path(), UNKNOWN_DSO_NAME );
    }

    #[test]
    fn test_threads_share_the_maps_of_their_process() {
        let mut tree = tree();
        tree.add_thread( 100, 100, "app" );
        tree.add_thread_map( 100, 100, 0x1000, 0x1000, 0, 0, "/system/lib64/libc.so" );
        tree.add_thread( 100, 101, "worker" );

        let worker = tree.find_thread_or_new( 100, 101 );
        assert_eq!( &*worker.comm, "worker" );
        assert_eq!( tree.dso( tree.find_map( &worker, 0x1800, false ).dso ).path(), "/system/lib64/libc.so" );

        let renamed_later = {
            let snapshot = tree.find_thread_or_new( 100, 100 );
            tree.add_thread( 100, 100, "renamed" );
            snapshot
        };
        assert_eq!( &*renamed_later.comm, "app" );
        assert_eq!( &*tree.find_thread_or_new( 100, 100 ).comm, "renamed" );
    }

    #[test]
    fn test_update_from_records() {
        let attr = attr();
        let mut tree = tree();
        tree.update( &Record::comm( &attr, 200, 200, "parent", 1, 0 ) );
        tree.update( &Record::mmap2( &attr, false, Mmap2Record {
            pid: 200,
            tid: 200,
            address: 0x7000,
            length: 0x1000,
            page_offset: 0,
            major: 0,
            minor: 0,
            inode: 0,
            inode_generation: 0,
            protection: 5,
            flags: 2,
            filename: "/system/lib64/libparent.so".to_owned(),
            sample_id: SampleId::default()
        }, 2, 0 ) );

        let fork = ExitOrForkRecord { pid: 201, ppid: 200, tid: 201, ptid: 200, time: 3, sample_id: SampleId::new( &attr, 201, 201, 3, 0, 0 ) };
        tree.update( &Record::new( 0, RecordBody::Fork( fork.clone() ) ) );

        let child = tree.find_thread_or_new( 201, 201 );
        assert_eq!( &*child.comm, "parent" );
        assert_eq!( tree.dso( tree.find_map( &child, 0x7010, false ).dso ).path(), "/system/lib64/libparent.so" );

        // The child's own mappings don't leak into the parent.
        tree.add_thread_map( 201, 201, 0x9000, 0x1000, 0, 4, "/system/lib64/libchild.so" );
        let parent = tree.find_thread_or_new( 200, 200 );
        assert_eq!( tree.find_map( &parent, 0x9000, false ), tree.unknown_map() );

        tree.update( &Record::new( 0, RecordBody::Exit( fork ) ) );
        assert!( tree.find_thread( 201 ).unwrap().exited );
        assert!( !tree.find_thread_or_new( 201, 201 ).exited );
    }

    #[test]
    fn test_fork_keeps_the_maps_the_child_already_has() {
        let attr = attr();
        let mut tree = tree();
        tree.add_thread_map( 300, 300, 0x7000, 0x1000, 0, 1, "/system/lib64/libparent.so" );
        tree.add_thread_map( 301, 301, 0x9000, 0x1000, 0, 2, "/system/lib64/libchild.so" );

        let fork = ExitOrForkRecord { pid: 301, ppid: 300, tid: 301, ptid: 300, time: 3, sample_id: SampleId::new( &attr, 301, 301, 3, 0, 0 ) };
        tree.update( &Record::new( 0, RecordBody::Fork( fork ) ) );

        let child = tree.find_thread_or_new( 301, 301 );
        assert_eq!( tree.dso( tree.find_map( &child, 0x9010, false ).dso ).path(), "/system/lib64/libchild.so" );
        assert_eq!( tree.find_map( &child, 0x7010, false ), tree.unknown_map() );
    }

    #[test]
    fn test_find_symbol_through_a_map() {
        let mut tree = tree();
        tree.add_thread_map( 1, 1, 0x10000, 0x2000, 0, 0, "/data/local/tmp/jit" );
        let thread = tree.find_thread_or_new( 1, 1 );
        let map = tree.find_map( &thread, 0x10010, false );
        tree.dso_mut( map.dso ).set_symbols( vec![ Symbol::new( "foo", 0x10, 0x20 ) ] );

        // Not an ELF file on disk, so no segment adjustment applies.
        let (symbol, vaddr) = tree.find_symbol( &map, 0x10018 );
        assert_eq!( vaddr, 0x18 );
        assert_eq!( symbol.map( |symbol| symbol.name().to_owned() ), Some( "foo".to_owned() ) );

        let unknown_map = tree.unknown_map();
        let (symbol, _) = tree.find_symbol( &unknown_map, 0x1234 );
        assert_eq!( symbol, None );
    }

    #[test]
    fn test_dex_file_offset_converts_the_dso() {
        let mut tree = tree();
        tree.add_thread_map( 1, 1, 0x10000, 0x2000, 0, 0, "/data/app/base.apk" );
        let id = tree.find_dso_by_path( "/data/app/base.apk" ).unwrap();
        assert_eq!( tree.dso( id ).kind(), DsoType::ElfFile );

        tree.add_dex_file_offset( "/data/app/base.apk", 0x100 );
        tree.add_dex_file_offset( "/data/app/base.apk", 0x100 );
        assert_eq!( tree.dso( id ).kind(), DsoType::DexFile );
        assert_eq!( tree.dso( id ).dex_file_offsets(), &[ 0x100 ] );
        assert_eq!( user_dso_type( "/system/framework/boot.vdex" ), DsoType::DexFile );
        assert_eq!( tree.dso_mut( id ).file_feature().dex_file_offsets, vec![ 0x100 ] );
        assert_eq!( user_dso_type( "[anon:dalvik-jit-code-cache]" ), DsoType::UnknownFile );
    }

    #[test]
    fn test_symbols_restored_from_the_file_feature() {
        let mut recording = tree();
        recording.add_thread_map( 7, 7, 0x7000_0000, 0x1000, 0, 0, "/tmp/simpleperf-jit-7" );
        let id = recording.find_dso_by_path( "/tmp/simpleperf-jit-7" ).unwrap();
        recording.dso_mut( id ).set_symbols( vec![ Symbol::new( "int Main.get()", 0x7000_0100, 0x20 ) ] );
        let feature = recording.dso_mut( id ).file_feature();

        let mut reporting = tree();
        reporting.apply_file_feature( &feature );
        reporting.add_thread_map( 7, 7, 0x7000_0000, 0x1000, 0, 0, "/tmp/simpleperf-jit-7" );
        let thread = reporting.find_thread_or_new( 7, 7 );
        let map = reporting.find_map( &thread, 0x7000_0110, false );
        let (symbol, vaddr) = reporting.find_symbol( &map, 0x7000_0110 );
        assert_eq!( vaddr, 0x7000_0110 );
        assert_eq!( symbol.unwrap().name(), "int Main.get()" );
    }
}
