use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, NativeEndian};

use crate::call_chain::{CallChainReportBuilder, CallChainReportEntry};
use crate::dso::{DsoConfig, UNKNOWN_DSO_NAME};
use crate::event_attr::is_timestamp_supported;
use crate::record::{Record, RecordBody, SampleRecord};
use crate::record_cache::RecordCache;
use crate::record_file_reader::RecordFileReader;
use crate::thread_tree::ThreadTree;
use crate::unwinder::{EtmDecoder, InstrRange, OfflineUnwinder};

pub const PERF_RECORD_AUXTRACE: u32 = 71;

/// `size`, `offset`, `reference`, `idx`, `tid`, `cpu` and a reserved word precede the trace bytes.
const AUXTRACE_FIXED_SIZE: usize = 40;
const AUXTRACE_CPU_OFFSET: usize = 32;

/// One fully resolved sample.
#[derive(Clone, Debug)]
pub struct ReportSample {
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub comm: Arc< str >,
    pub time: u64,
    pub cpu: u32,
    pub period: u64,
    pub event_name: String,
    pub symbol_name: String,
    pub symbol_addr: u64,
    pub dso_name: String,
    pub vaddr_in_file: u64,
    /// Every resolved frame, innermost first; the first entry describes `ip` itself.
    pub call_chain: Vec< CallChainReportEntry >
}

/// Replays a record file and resolves its samples one at a time.
pub struct ReportLib< R: Read + Seek = BufReader< File > > {
    reader: RecordFileReader< R >,
    tree: ThreadTree,
    builder: CallChainReportBuilder,
    cache: RecordCache< (usize, Record) >,
    pending: VecDeque< (usize, Record) >,
    event_names: Vec< String >,
    unwinder: Option< Box< dyn OfflineUnwinder > >,
    etm: Option< (Box< dyn EtmDecoder >, Box< dyn FnMut( InstrRange ) >) >,
    end_of_data: bool
}

impl ReportLib< BufReader< File > > {
    pub fn open< P: AsRef< Path > >( path: P, config: DsoConfig ) -> io::Result< Self > {
        ReportLib::new( RecordFileReader::open( path )?, config )
    }
}

impl< R: Read + Seek > ReportLib< R > {
    pub fn new( mut reader: RecordFileReader< R >, mut config: DsoConfig ) -> io::Result< Self > {
        let build_ids = reader.build_id_map()?;
        debug!( "The record file has build ids for {} binaries", build_ids.len() );
        for (path, build_id) in build_ids {
            config.build_ids.entry( path ).or_insert( build_id );
        }

        let mut tree = ThreadTree::new( Arc::new( config ) );
        for file in reader.read_file_feature()? {
            tree.apply_file_feature( &file );
        }

        let event_names = reader.event_names()?;
        let has_timestamp = reader.attrs().iter().all( |attr| is_timestamp_supported( &attr.attr ) );
        reader.rewind();

        Ok( ReportLib {
            reader,
            tree,
            builder: CallChainReportBuilder::new(),
            cache: RecordCache::with_defaults( has_timestamp ),
            pending: VecDeque::new(),
            event_names,
            unwinder: None,
            etm: None,
            end_of_data: false
        })
    }

    pub fn set_show_art_frames( &mut self, show: bool ) {
        self.builder.set_remove_art_frame( !show );
    }

    pub fn set_convert_jit_frames( &mut self, convert: bool ) {
        self.builder.set_convert_jit_frame( convert );
    }

    /// Unwinds the user stack dumps of samples recorded with dwarf call graphs.
    pub fn set_unwinder( &mut self, unwinder: Box< dyn OfflineUnwinder > ) {
        self.unwinder = Some( unwinder );
    }

    /// Decodes the hardware trace carried by AUXTRACE records; decoded ranges go to `callback`.
    pub fn set_etm_decoder< F >( &mut self, decoder: Box< dyn EtmDecoder >, callback: F ) where F: FnMut( InstrRange ) + 'static {
        self.etm = Some( (decoder, Box::new( callback )) );
    }

    pub fn event_names( &self ) -> &[String] {
        &self.event_names
    }

    pub fn thread_tree( &self ) -> &ThreadTree {
        &self.tree
    }

    pub fn reader( &mut self ) -> &mut RecordFileReader< R > {
        &mut self.reader
    }

    fn next_record( &mut self ) -> io::Result< Option< (usize, Record) > > {
        loop {
            if let Some( entry ) = self.pending.pop_front() {
                return Ok( Some( entry ) );
            }

            if self.end_of_data {
                return Ok( None );
            }

            match self.reader.read_record()? {
                Some( (attr_index, record) ) => {
                    let timestamp = record.timestamp();
                    self.cache.push( 0, timestamp, (attr_index, record) );
                    while let Some( entry ) = self.cache.pop() {
                        self.pending.push_back( entry );
                    }
                },
                None => {
                    self.end_of_data = true;
                    self.pending.extend( self.cache.pop_all() );
                }
            }
        }
    }

    /// Returns the next sample in timestamp order, or `None` once the file is exhausted.
    ///
    /// Every other record only updates the thread tree. A sample is always
    /// returned even when nothing about it resolves.
    pub fn next_sample( &mut self ) -> io::Result< Option< ReportSample > > {
        while let Some( (attr_index, record) ) = self.next_record()? {
            let in_kernel = record.in_kernel();
            match record.body {
                RecordBody::Sample( sample ) => return Ok( Some( self.resolve_sample( attr_index, sample, in_kernel ) ) ),
                RecordBody::Unknown { kind: PERF_RECORD_AUXTRACE, ref payload } => self.decode_aux_trace( payload ),
                _ => self.tree.update( &record )
            }
        }

        Ok( None )
    }

    fn decode_aux_trace( &mut self, payload: &[u8] ) {
        let (decoder, callback) = match self.etm {
            Some( (ref mut decoder, ref mut callback) ) => (decoder, callback),
            None => return
        };

        if payload.len() < AUXTRACE_FIXED_SIZE {
            warn!( "Skipping a truncated AUXTRACE record of {} bytes", payload.len() );
            return;
        }

        let cpu = NativeEndian::read_u32( &payload[ AUXTRACE_CPU_OFFSET.. ] );
        if let Err( error ) = decoder.decode( cpu, &payload[ AUXTRACE_FIXED_SIZE.. ], &mut **callback ) {
            warn!( "Failed to decode {} bytes of hardware trace from cpu {}: {}", payload.len() - AUXTRACE_FIXED_SIZE, cpu, error );
        }
    }

    fn resolve_sample( &mut self, attr_index: usize, sample: SampleRecord, in_kernel: bool ) -> ReportSample {
        let thread = self.tree.find_thread_or_new( sample.pid, sample.tid );
        let (kernel_ips, mut user_ips) = sample.split_callchain();
        if let (Some( unwinder ), Some( regs ), Some( stack )) = (self.unwinder.as_mut(), sample.regs_user.as_ref(), sample.stack_user.as_ref()) {
            let frames = unwinder.unwind( &thread, regs, stack );
            if !frames.is_empty() {
                user_ips = frames.into_iter().map( |(ip, _)| ip ).collect();
            }
        }

        let mut ips = Vec::with_capacity( kernel_ips.len() + user_ips.len() + 1 );
        let kernel_ip_count;
        if kernel_ips.is_empty() && user_ips.is_empty() {
            ips.push( sample.ip );
            kernel_ip_count = if in_kernel { 1 } else { 0 };
        } else {
            kernel_ip_count = kernel_ips.len();
            ips.extend( kernel_ips );
            ips.extend( user_ips );
        }

        let call_chain = self.builder.build( &mut self.tree, &thread, &ips, kernel_ip_count );
        let event_name = self.event_names.get( attr_index ).cloned().unwrap_or_default();
        let mut output = ReportSample {
            ip: sample.ip,
            pid: sample.pid,
            tid: sample.tid,
            comm: thread.comm.clone(),
            time: sample.time,
            cpu: sample.cpu,
            period: sample.period,
            event_name,
            symbol_name: UNKNOWN_DSO_NAME.to_owned(),
            symbol_addr: 0,
            dso_name: UNKNOWN_DSO_NAME.to_owned(),
            vaddr_in_file: 0,
            call_chain
        };

        if let Some( entry ) = output.call_chain.first() {
            output.symbol_name = entry.symbol_name().to_owned();
            output.symbol_addr = entry.symbol.as_ref().map( |symbol| symbol.addr ).unwrap_or( 0 );
            output.dso_name = entry.dso_name.clone();
            output.vaddr_in_file = entry.vaddr_in_file;
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    use perf_event_open::sys::*;

    use crate::event_attr::create_default_perf_event_attr;
    use crate::event_type::find_event_type_by_name;
    use crate::record::{Mmap2Record, SampleId};
    use crate::record_file::{AttrWithIds, FileFeature, FileSymbol, DSO_TYPE_ELF_FILE};
    use crate::record_file_writer::RecordFileWriter;

    fn attr() -> PerfEventAttr {
        let mut attr = create_default_perf_event_attr( &find_event_type_by_name( "cpu-cycles" ).unwrap() );
        attr.sample_type |= PERF_SAMPLE_CALLCHAIN;
        attr
    }

    fn sample( attr: &PerfEventAttr, pid: u32, tid: u32, ip: u64, time: u64, callchain: Vec< u64 > ) -> Record {
        Record::new( PERF_RECORD_MISC_USER, RecordBody::Sample( SampleRecord {
            sample_type: attr.sample_type,
            ip,
            pid,
            tid,
            time,
            addr: 0,
            id: 7,
            stream_id: 0,
            cpu: 1,
            period: 1000,
            callchain,
            raw: Vec::new(),
            branch_stack: Vec::new(),
            regs_user: None,
            stack_user: None
        }))
    }

    fn mmap( attr: &PerfEventAttr, pid: u32, address: u64, length: u64, filename: &str, time: u64 ) -> Record {
        Record::mmap2( attr, false, Mmap2Record {
            pid,
            tid: pid,
            address,
            length,
            page_offset: 0,
            major: 0,
            minor: 0,
            inode: 0,
            inode_generation: 0,
            protection: 5,
            flags: 2,
            filename: filename.to_owned(),
            sample_id: SampleId::default()
        }, time, 7 )
    }

    fn write_file( records: &[Record], files: &[FileFeature] ) -> Cursor< Vec< u8 > > {
        let attr = attr();
        let mut writer = RecordFileWriter::new( Cursor::new( Vec::new() ) ).unwrap();
        writer.write_attr_section( &[ AttrWithIds { attr, ids: vec![ 7 ] } ] ).unwrap();
        for record in records {
            writer.write_record( record ).unwrap();
        }

        if !files.is_empty() {
            writer.write_file_feature( files ).unwrap();
        }

        let mut output = writer.finalize().unwrap();
        output.set_position( 0 );
        output
    }

    fn open( data: Cursor< Vec< u8 > > ) -> ReportLib< Cursor< Vec< u8 > > > {
        let reader = RecordFileReader::new( data ).unwrap();
        ReportLib::new( reader, DsoConfig::default() ).unwrap()
    }

    fn collect( lib: &mut ReportLib< Cursor< Vec< u8 > > > ) -> Vec< ReportSample > {
        let mut output = Vec::new();
        while let Some( sample ) = lib.next_sample().unwrap() {
            output.push( sample );
        }

        output
    }

    #[test]
    fn test_samples_resolve_through_the_file_feature() {
        let attr = attr();
        let records = vec![
            Record::comm( &attr, 100, 100, "app", 1, 7 ),
            mmap( &attr, 100, 0x10000, 0x1000, "/data/local/tmp/libnative.so", 2 ),
            sample( &attr, 100, 100, 0x10010, 10, vec![ PERF_CONTEXT_USER, 0x10010, 0x10110 ] ),
            sample( &attr, 100, 100, 0x50000, 11, Vec::new() )
        ];

        let files = vec![ FileFeature {
            path: "/data/local/tmp/libnative.so".to_owned(),
            dso_type: DSO_TYPE_ELF_FILE,
            min_vaddr: 0,
            symbols: vec![
                FileSymbol { vaddr: 0x0, len: 0x100, name: "leaf".to_owned() },
                FileSymbol { vaddr: 0x100, len: 0x100, name: "caller".to_owned() }
            ],
            dex_file_offsets: Vec::new()
        }];

        let mut lib = open( write_file( &records, &files ) );
        let samples = collect( &mut lib );
        assert_eq!( samples.len(), 2 );

        let first = &samples[ 0 ];
        assert_eq!( &*first.comm, "app" );
        assert_eq!( first.event_name, "event0" );
        assert_eq!( first.period, 1000 );
        assert_eq!( first.dso_name, "/data/local/tmp/libnative.so" );
        assert_eq!( first.symbol_name, "leaf" );
        assert_eq!( first.call_chain.len(), 2 );
        assert_eq!( first.call_chain[ 1 ].symbol_name(), "caller" );

        let second = &samples[ 1 ];
        assert_eq!( second.symbol_name, "unknown" );
        assert_eq!( second.call_chain.len(), 1 );
        assert!( lib.next_sample().unwrap().is_none() );
    }

    #[test]
    fn test_samples_come_out_in_timestamp_order() {
        let attr = attr();
        let records = vec![
            sample( &attr, 1, 1, 0x1000, 30, Vec::new() ),
            sample( &attr, 1, 1, 0x2000, 10, Vec::new() ),
            sample( &attr, 1, 1, 0x3000, 20, Vec::new() )
        ];

        let mut lib = open( write_file( &records, &[] ) );
        let times: Vec< u64 > = collect( &mut lib ).iter().map( |sample| sample.time ).collect();
        assert_eq!( times, vec![ 10, 20, 30 ] );
    }

    #[test]
    fn test_sample_keeps_the_comm_current_at_sample_time() {
        let attr = attr();
        let records = vec![
            Record::comm( &attr, 5, 5, "before", 1, 7 ),
            sample( &attr, 5, 5, 0x1000, 2, Vec::new() ),
            Record::comm( &attr, 5, 5, "after", 3, 7 ),
            sample( &attr, 5, 5, 0x1000, 4, Vec::new() )
        ];

        let mut lib = open( write_file( &records, &[] ) );
        let comms: Vec< String > = collect( &mut lib ).iter().map( |sample| sample.comm.to_string() ).collect();
        assert_eq!( comms, vec![ "before", "after" ] );
    }

    struct FixedUnwinder;

    impl OfflineUnwinder for FixedUnwinder {
        fn unwind( &mut self, _: &crate::thread_tree::ThreadEntry, _: &crate::record::RegsUser, _: &crate::record::StackUser ) -> Vec< (u64, u64) > {
            vec![ (0x10010, 0x7000), (0x10110, 0x7100) ]
        }
    }

    #[test]
    fn test_unwinder_supplies_user_frames() {
        let mut attr = attr();
        attr.sample_type |= PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
        attr.sample_regs_user = 0b111;
        attr.sample_stack_user = 16;

        let mut record = sample( &attr, 3, 3, 0x10010, 5, Vec::new() );
        if let RecordBody::Sample( ref mut sample ) = record.body {
            sample.regs_user = Some( crate::record::RegsUser { abi: PERF_SAMPLE_REGS_ABI_64, mask: 0b111, regs: vec![ 1, 2, 3 ] } );
            sample.stack_user = Some( crate::record::StackUser { data: vec![ 0; 16 ], dynamic_size: 16 } );
        }

        let mut writer = RecordFileWriter::new( Cursor::new( Vec::new() ) ).unwrap();
        writer.write_attr_section( &[ AttrWithIds { attr, ids: vec![ 7 ] } ] ).unwrap();
        writer.write_record( &mmap( &attr, 3, 0x10000, 0x1000, "/system/lib64/libc.so", 1 ) ).unwrap();
        writer.write_record( &record ).unwrap();
        let mut data = writer.finalize().unwrap();
        data.set_position( 0 );

        let mut lib = open( data );
        lib.set_unwinder( Box::new( FixedUnwinder ) );
        let sample = lib.next_sample().unwrap().unwrap();
        let ips: Vec< u64 > = sample.call_chain.iter().map( |entry| entry.ip ).collect();
        assert_eq!( ips, vec![ 0x10010, 0x10110 ] );
        assert_eq!( sample.dso_name, "/system/lib64/libc.so" );
    }

    struct RangeDecoder;

    impl EtmDecoder for RangeDecoder {
        fn decode( &mut self, cpu: u32, data: &[u8], callback: &mut dyn FnMut( InstrRange ) ) -> io::Result< () > {
            for chunk in data.chunks( 16 ) {
                if chunk.len() < 16 {
                    return Err( io::Error::new( io::ErrorKind::InvalidData, "truncated range" ) );
                }

                callback( InstrRange {
                    cpu,
                    start_addr: NativeEndian::read_u64( &chunk[ ..8 ] ),
                    end_addr: NativeEndian::read_u64( &chunk[ 8.. ] ),
                    branch_taken_count: 1,
                    branch_not_taken_count: 0
                });
            }

            Ok(())
        }
    }

    #[test]
    fn test_aux_trace_is_fed_to_the_decoder() {
        let attr = attr();
        let mut payload = vec![ 0; AUXTRACE_FIXED_SIZE ];
        NativeEndian::write_u32( &mut payload[ AUXTRACE_CPU_OFFSET.. ], 3 );
        let mut range = [0; 16];
        NativeEndian::write_u64( &mut range[ ..8 ], 0x1000 );
        NativeEndian::write_u64( &mut range[ 8.. ], 0x1040 );
        payload.extend_from_slice( &range );

        let records = vec![
            Record::new( 0, RecordBody::Unknown { kind: PERF_RECORD_AUXTRACE, payload } ),
            sample( &attr, 1, 1, 0x1000, 5, Vec::new() )
        ];

        let ranges = Rc::new( RefCell::new( Vec::new() ) );
        let mut lib = open( write_file( &records, &[] ) );
        let sink = ranges.clone();
        lib.set_etm_decoder( Box::new( RangeDecoder ), move |range| sink.borrow_mut().push( range ) );
        assert_eq!( collect( &mut lib ).len(), 1 );
        assert_eq!( *ranges.borrow(), vec![ InstrRange {
            cpu: 3,
            start_addr: 0x1000,
            end_addr: 0x1040,
            branch_taken_count: 1,
            branch_not_taken_count: 0
        }]);
    }
}
