use std::collections::BTreeMap;
use std::error::Error;
use std::io::{self, Read, Seek, Write};

use perf_event_open::sys::*;

use crate::args;
use crate::event_attr::{dump_perf_event_attr, sample_type_to_string};
use crate::record::*;
use crate::record_file::{feature_name, FEAT_ARCH, FEAT_OSRELEASE};
use crate::record_file_reader::RecordFileReader;
use crate::utils::HexValue;

pub fn record_kind_name( kind: u32 ) -> &'static str {
    match kind {
        PERF_RECORD_MMAP => "mmap",
        PERF_RECORD_LOST => "lost",
        PERF_RECORD_COMM => "comm",
        PERF_RECORD_EXIT => "exit",
        PERF_RECORD_THROTTLE => "throttle",
        PERF_RECORD_UNTHROTTLE => "unthrottle",
        PERF_RECORD_FORK => "fork",
        PERF_RECORD_READ => "read",
        PERF_RECORD_SAMPLE => "sample",
        PERF_RECORD_MMAP2 => "mmap2",
        PERF_RECORD_AUX => "aux",
        PERF_RECORD_TRACING_DATA => "tracing_data",
        PERF_RECORD_BUILD_ID => "build_id",
        crate::report_lib::PERF_RECORD_AUXTRACE => "auxtrace",
        SIMPLE_PERF_RECORD_EVENT_ID => "event_id",
        SIMPLE_PERF_RECORD_TRACING_DATA => "tracing_data",
        _ => "unknown"
    }
}

#[derive(Serialize, Debug)]
struct AttrSummary {
    name: String,
    kind: u32,
    config: u64,
    sample_type: String,
    ids: Vec< u64 >
}

#[derive(Serialize, Debug)]
struct BuildIdSummary {
    filename: String,
    build_id: String,
    in_kernel: bool
}

#[derive(Serialize, Default, Debug)]
struct Summary {
    attrs: Vec< AttrSummary >,
    record_counts: BTreeMap< &'static str, u64 >,
    sample_count_per_event: BTreeMap< String, u64 >,
    lost_count: u64,
    features: Vec< &'static str >,
    cmdline: Vec< String >,
    arch: Option< String >,
    os_release: Option< String >,
    build_ids: Vec< BuildIdSummary >,
    meta_info: BTreeMap< String, String >
}

fn summarize< R: Read + Seek >( reader: &mut RecordFileReader< R > ) -> io::Result< Summary > {
    let mut summary = Summary::default();
    let event_names = reader.event_names()?;
    for (index, attr) in reader.attrs().iter().enumerate() {
        summary.attrs.push( AttrSummary {
            name: event_names.get( index ).cloned().unwrap_or_default(),
            kind: attr.attr.kind,
            config: attr.attr.config,
            sample_type: sample_type_to_string( attr.attr.sample_type ),
            ids: attr.ids.clone()
        });
    }

    summary.features = reader.feature_sections().keys().map( |&feature| feature_name( feature ) ).collect();
    summary.cmdline = reader.read_cmdline_feature()?;
    summary.arch = reader.read_string_feature( FEAT_ARCH )?;
    summary.os_release = reader.read_string_feature( FEAT_OSRELEASE )?;
    summary.meta_info = reader.read_meta_info_feature()?;
    summary.build_ids = reader.read_build_id_feature()?.into_iter().map( |build_id| BuildIdSummary {
        in_kernel: build_id.pid == u32::max_value(),
        build_id: build_id.build_id.to_string(),
        filename: build_id.filename
    }).collect();

    let mut counts = BTreeMap::new();
    let mut per_event = BTreeMap::new();
    let mut lost_count = 0;
    reader.read_data_section( false, |attr_index, record| {
        *counts.entry( record_kind_name( record.kind() ) ).or_insert( 0 ) += 1;
        match record.body {
            RecordBody::Sample( .. ) => {
                let name = event_names.get( attr_index ).cloned().unwrap_or_default();
                *per_event.entry( name ).or_insert( 0 ) += 1;
            },
            RecordBody::Lost( ref lost ) => lost_count += lost.lost,
            _ => {}
        }

        true
    })?;

    summary.record_counts = counts;
    summary.sample_count_per_event = per_event;
    summary.lost_count = lost_count;
    Ok( summary )
}

fn dump< R: Read + Seek >( reader: &mut RecordFileReader< R >, mut fp: impl Write ) -> io::Result< () > {
    let header = reader.header().clone();
    writeln!( fp, "magic: {}", String::from_utf8_lossy( &header.magic ) )?;
    writeln!( fp, "header_size: {}", header.header_size )?;
    writeln!( fp, "attr_size: {}", header.attr_size )?;
    writeln!( fp, "attrs[file section]: offset {}, size {}", header.attrs.offset, header.attrs.size )?;
    writeln!( fp, "data[file section]: offset {}, size {}", header.data.offset, header.data.size )?;

    let event_names = reader.event_names()?;
    for (index, attr) in reader.attrs().iter().enumerate() {
        let name = event_names.get( index ).map( |name| name.as_str() ).unwrap_or( "" );
        writeln!( fp, "attr {}: {}", index + 1, name )?;
        write!( fp, "{}", dump_perf_event_attr( &attr.attr, 2 ) )?;
        let ids: Vec< _ > = attr.ids.iter().map( |id| id.to_string() ).collect();
        writeln!( fp, "  ids: {}", ids.join( ", " ) )?;
    }

    let mut result = Ok(());
    reader.read_data_section( false, |attr_index, record| {
        let line = format!( "record {}: in_kernel {}, attr {}\n  {:?}", record_kind_name( record.kind() ), record.in_kernel() as u8, attr_index, record.body );
        match writeln!( fp, "{}", line ) {
            Ok(()) => true,
            Err( error ) => {
                result = Err( error );
                false
            }
        }
    })?;
    result?;

    let features: Vec< _ > = reader.feature_sections().iter().map( |(&feature, desc)| (feature, desc.offset, desc.size) ).collect();
    for (feature, offset, size) in features {
        writeln!( fp, "feature section for {}: offset {}, size {}", feature_name( feature ), offset, size )?;
    }

    for build_id in reader.read_build_id_feature()? {
        writeln!( fp, "  build_id {} for {:?} (pid {:?})", build_id.build_id, build_id.filename, HexValue( build_id.pid as u64 ) )?;
    }

    let cmdline = reader.read_cmdline_feature()?;
    if !cmdline.is_empty() {
        writeln!( fp, "  cmdline: {}", cmdline.join( " " ) )?;
    }

    for file in reader.read_file_feature()? {
        writeln!( fp, "  file {:?}: type {}, min_vaddr {:?}, {} symbols, {} dex file offsets", file.path, file.dso_type, HexValue( file.min_vaddr ), file.symbols.len(), file.dex_file_offsets.len() )?;
    }

    for (key, value) in reader.read_meta_info_feature()? {
        writeln!( fp, "  {} = {}", key, value )?;
    }

    Ok(())
}

pub fn main( args: args::DumpArgs ) -> Result< (), Box< dyn Error > > {
    let mut reader = RecordFileReader::open( &args.input )?;
    let stdout = io::stdout();
    let stdout = stdout.lock();
    if args.json {
        let summary = summarize( &mut reader )?;
        let mut stdout = stdout;
        serde_json::to_writer_pretty( &mut stdout, &summary )?;
        writeln!( stdout )?;
    } else {
        dump( &mut reader, stdout )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_attr::create_default_perf_event_attr;
    use crate::event_type::find_event_type_by_name;
    use crate::record_file::AttrWithIds;
    use crate::record_file_writer::RecordFileWriter;
    use std::io::Cursor;

    fn recorded_file() -> Vec< u8 > {
        let mut attr = create_default_perf_event_attr( &find_event_type_by_name( "cpu-clock" ).unwrap() );
        attr.sample_type |= PERF_SAMPLE_ID;
        let mut writer = RecordFileWriter::new( Cursor::new( Vec::new() ) ).unwrap();
        writer.write_attr_section( &[ AttrWithIds { attr, ids: vec![ 5 ] } ] ).unwrap();
        writer.write_record( &Record::comm( &attr, 10, 10, "main", 100, 5 ) ).unwrap();
        writer.write_record( &Record::new( PERF_RECORD_MISC_KERNEL, RecordBody::Lost( LostRecord {
            id: 5,
            lost: 3,
            sample_id: SampleId::new( &attr, 10, 10, 200, 5, 0 )
        }))).unwrap();

        let mut meta_info = BTreeMap::new();
        meta_info.insert( "event_names".to_owned(), "cpu-clock".to_owned() );
        writer.write_meta_info_feature( &meta_info ).unwrap();
        writer.write_cmdline_feature( &[ "simpleperf".to_owned(), "record".to_owned() ] ).unwrap();
        writer.write_string_feature( FEAT_ARCH, "arm64" ).unwrap();
        writer.finalize().unwrap().into_inner()
    }

    #[test]
    fn test_summary() {
        let mut reader = RecordFileReader::new( Cursor::new( recorded_file() ) ).unwrap();
        let summary = summarize( &mut reader ).unwrap();
        assert_eq!( summary.attrs.len(), 1 );
        assert_eq!( summary.attrs[ 0 ].name, "cpu-clock" );
        assert_eq!( summary.attrs[ 0 ].ids, vec![ 5 ] );
        assert_eq!( summary.record_counts.get( "comm" ), Some( &1 ) );
        assert_eq!( summary.record_counts.get( "lost" ), Some( &1 ) );
        assert_eq!( summary.lost_count, 3 );
        assert_eq!( summary.cmdline, vec![ "simpleperf", "record" ] );
        assert_eq!( summary.arch.as_ref().map( |arch| arch.as_str() ), Some( "arm64" ) );

        let json = serde_json::to_value( &summary ).unwrap();
        assert_eq!( json[ "meta_info" ][ "event_names" ], "cpu-clock" );
    }

    #[test]
    fn test_dump_lists_records_and_features() {
        let mut reader = RecordFileReader::new( Cursor::new( recorded_file() ) ).unwrap();
        let mut output = Vec::new();
        dump( &mut reader, &mut output ).unwrap();
        let output = String::from_utf8( output ).unwrap();

        assert!( output.starts_with( "magic: PERFILE2\n" ) );
        assert!( output.contains( "attr 1: cpu-clock" ) );
        assert!( output.contains( "record comm:" ) );
        assert!( output.contains( "record lost: in_kernel 1" ) );
        assert!( output.contains( "  cmdline: simpleperf record" ) );
        assert!( output.contains( "  event_names = cpu-clock" ) );
    }
}
