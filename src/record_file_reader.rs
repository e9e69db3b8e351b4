use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt};

use perf_event_open::sys::PerfEventAttr;

use crate::event_attr::{is_timestamp_supported, AttrResolver};
use crate::record::{
    BuildIdRecord,
    Record,
    RecordBody,
    RecordHeader,
    PERF_RECORD_BUILD_ID,
    RECORD_HEADER_SIZE,
    SIMPLE_PERF_RECORD_SPLIT,
    SIMPLE_PERF_RECORD_SPLIT_END
};
use crate::record_cache::RecordCache;
use crate::record_file::*;
use crate::utils::invalid_data;

/// Bigger on-disk attrs can only come from a corrupt header.
const MAX_FILE_ATTR_SIZE: u64 = 4096;

pub struct RecordFileReader< R: Read + Seek > {
    input: R,
    file_size: u64,
    header: FileHeader,
    attrs: Vec< AttrWithIds >,
    resolver: AttrResolver,
    feature_sections: BTreeMap< u32, SectionDesc >,
    data_bytes_read: u64,
    needs_seek: bool
}

impl RecordFileReader< BufReader< File > > {
    pub fn open< P: AsRef< Path > >( path: P ) -> io::Result< Self > {
        let path = path.as_ref();
        let fp = File::open( path ).map_err( |err| {
            io::Error::new( err.kind(), format!( "failed to open record file {:?}: {}", path, err ) )
        })?;

        RecordFileReader::new( BufReader::new( fp ) )
    }
}

impl< R: Read + Seek > RecordFileReader< R > {
    pub fn new( mut input: R ) -> io::Result< Self > {
        let file_size = input.seek( SeekFrom::End( 0 ) )?;
        input.seek( SeekFrom::Start( 0 ) )?;
        let header = FileHeader::read( &mut input )?;

        let mut reader = RecordFileReader {
            input,
            file_size,
            header,
            attrs: Vec::new(),
            resolver: AttrResolver::default(),
            feature_sections: BTreeMap::new(),
            data_bytes_read: 0,
            needs_seek: true
        };

        reader.read_attr_section()?;
        reader.read_feature_section_descriptors()?;
        Ok( reader )
    }

    /// Checks that a section lies within the file before anything is allocated for it.
    fn check_section( &self, name: &str, section: &SectionDesc ) -> io::Result< () > {
        match section.offset.checked_add( section.size ) {
            Some( end ) if end <= self.file_size => Ok(()),
            _ => Err( invalid_data( format!(
                "the {} section (offset {}, size {}) lies outside of the {} byte record file",
                name, section.offset, section.size, self.file_size
            )))
        }
    }

    fn read_attr_section( &mut self ) -> io::Result< () > {
        if self.header.attr_size > MAX_FILE_ATTR_SIZE {
            return Err( invalid_data( format!( "invalid attr size in the file header: {}", self.header.attr_size ) ) );
        }

        let attrs_section = self.header.attrs;
        self.check_section( "attr", &attrs_section )?;

        let attr_size = self.header.attr_size as usize;
        let attr_count = (self.header.attrs.size / self.header.attr_size) as usize;
        if attr_size != FILE_ATTR_SIZE {
            debug!( "The attr size in the file ({}) doesn't match the expected size ({})", attr_size, FILE_ATTR_SIZE );
        }

        if attr_count == 0 {
            return Err( invalid_data( "the record file has no attrs" ) );
        }

        self.input.seek( SeekFrom::Start( self.header.attrs.offset ) )?;
        let mut file_attrs = Vec::with_capacity( attr_count );
        let mut buffer = vec![ 0; attr_size ];
        for _ in 0..attr_count {
            self.input.read_exact( &mut buffer )?;

            // The size of perf_event_attr grows with the kernel version.
            let perf_event_attr_size = attr_size - SECTION_DESC_SIZE;
            let attr = PerfEventAttr::from_bytes( &buffer[ ..perf_event_attr_size ] );
            let ids = SectionDesc::read( &mut &buffer[ perf_event_attr_size.. ] )?;
            file_attrs.push( (attr, ids) );
        }

        let attrs: Vec< _ > = file_attrs.iter().map( |&(attr, _)| attr ).collect();
        self.resolver = AttrResolver::new( &attrs )?;

        for (index, (attr, ids_section)) in file_attrs.into_iter().enumerate() {
            self.check_section( "event id", &ids_section )?;
            self.input.seek( SeekFrom::Start( ids_section.offset ) )?;
            let mut ids = Vec::with_capacity( (ids_section.size / 8) as usize );
            for _ in 0..ids_section.size / 8 {
                let id = self.input.read_u64::< NativeEndian >()?;
                self.resolver.add_event_id( id, index );
                ids.push( id );
            }

            self.attrs.push( AttrWithIds { attr, ids } );
        }

        Ok(())
    }

    fn read_feature_section_descriptors( &mut self ) -> io::Result< () > {
        let table_offset = self.header.data.offset.checked_add( self.header.data.size )
            .ok_or_else( || invalid_data( "the data section overflows the file offsets" ) )?;
        self.input.seek( SeekFrom::Start( table_offset ) )?;
        for feature in self.header.feature_ids() {
            let section = SectionDesc::read( &mut self.input )?;
            self.check_section( feature_name( feature ), &section )?;
            self.feature_sections.insert( feature, section );
        }

        Ok(())
    }

    pub fn header( &self ) -> &FileHeader {
        &self.header
    }

    pub fn attrs( &self ) -> &[AttrWithIds] {
        &self.attrs
    }

    pub fn feature_sections( &self ) -> &BTreeMap< u32, SectionDesc > {
        &self.feature_sections
    }

    pub fn has_feature( &self, feature: u32 ) -> bool {
        self.feature_sections.contains_key( &feature )
    }

    /// Rewinds to the start of the data section.
    pub fn rewind( &mut self ) {
        self.data_bytes_read = 0;
        self.needs_seek = true;
    }

    fn read_bytes( &mut self, length: usize ) -> io::Result< Vec< u8 > > {
        let mut buffer = vec![ 0; length ];
        self.input.read_exact( &mut buffer )?;
        self.data_bytes_read += length as u64;
        Ok( buffer )
    }

    fn read_record_header( &mut self ) -> io::Result< (RecordHeader, [u8; RECORD_HEADER_SIZE]) > {
        let mut raw_header = [0; RECORD_HEADER_SIZE];
        self.input.read_exact( &mut raw_header )?;
        self.data_bytes_read += RECORD_HEADER_SIZE as u64;
        let header = RecordHeader::parse( &raw_header )?;
        if self.data_bytes_read - RECORD_HEADER_SIZE as u64 + header.size as u64 > self.header.data.size {
            return Err( invalid_data( format!(
                "record of type {} with size {} runs past the end of the data section",
                header.kind,
                header.size
            )));
        }

        Ok( (header, raw_header) )
    }

    /// Reads the raw bytes of the next logical record, joining SPLIT chunks.
    fn read_raw_record( &mut self ) -> io::Result< (RecordHeader, Vec< u8 >) > {
        let (header, raw_header) = self.read_record_header()?;
        if header.kind != SIMPLE_PERF_RECORD_SPLIT {
            let mut bytes = Vec::with_capacity( header.size as usize );
            bytes.extend_from_slice( &raw_header );
            let body = self.read_bytes( header.size as usize - RECORD_HEADER_SIZE )?;
            bytes.extend_from_slice( &body );
            return Ok( (header, bytes) );
        }

        let mut bytes = Vec::new();
        let mut chunk_header = header;
        while chunk_header.kind == SIMPLE_PERF_RECORD_SPLIT {
            let chunk = self.read_bytes( chunk_header.size as usize - RECORD_HEADER_SIZE )?;
            bytes.extend_from_slice( &chunk );
            chunk_header = self.read_record_header()?.0;
        }

        if chunk_header.kind != SIMPLE_PERF_RECORD_SPLIT_END {
            return Err( invalid_data( "SPLIT records are not followed by a SPLIT_END record" ) );
        }

        let leftover = chunk_header.size as usize - RECORD_HEADER_SIZE;
        if leftover != 0 {
            self.read_bytes( leftover )?;
        }

        let header = RecordHeader::parse( &bytes )?;
        if header.size as usize != bytes.len() {
            return Err( invalid_data( format!( "split record claims {} bytes while {} were joined", header.size, bytes.len() ) ) );
        }

        Ok( (header, bytes) )
    }

    fn process_event_id_record( &mut self, record: &Record ) {
        if let RecordBody::EventId( ref entries ) = record.body {
            for entry in entries {
                let index = entry.attr_index as usize;
                if index >= self.attrs.len() {
                    warn!( "Event id {} refers to a nonexistent attr #{}", entry.event_id, index );
                    continue;
                }

                self.attrs[ index ].ids.push( entry.event_id );
                self.resolver.add_event_id( entry.event_id, index );
            }
        }
    }

    /// Reads the next record in file order along with the index of its attr.
    ///
    /// I/O errors and records that overrun the data section are fatal since the
    /// following record boundaries can't be trusted. A record whose body fails to
    /// parse is logged and skipped.
    pub fn read_record( &mut self ) -> io::Result< Option< (usize, Record) > > {
        if self.needs_seek {
            self.input.seek( SeekFrom::Start( self.header.data.offset + self.data_bytes_read ) )?;
            self.needs_seek = false;
        }

        while self.data_bytes_read < self.header.data.size {
            let (header, bytes) = self.read_raw_record()?;
            let attr_index = self.resolver.attr_index_for( header.kind, &bytes );
            let record = match Record::parse( &self.attrs[ attr_index ].attr, &bytes ) {
                Ok( record ) => record,
                Err( err ) => {
                    warn!( "Skipping a malformed record of type {} ({} bytes): {}", header.kind, bytes.len(), err );
                    continue;
                }
            };

            self.process_event_id_record( &record );
            return Ok( Some( (attr_index, record) ) );
        }

        Ok( None )
    }

    /// Feeds every record of the data section to `callback`.
    ///
    /// With `sorted` the records pass through the same reorder cache that's used
    /// during capture, so they come out in timestamp order. The callback returns
    /// `false` to stop early.
    pub fn read_data_section< F >( &mut self, sorted: bool, mut callback: F ) -> io::Result< () >
        where F: FnMut( usize, Record ) -> bool
    {
        self.rewind();
        let has_timestamp = self.attrs.iter().all( |attr| is_timestamp_supported( &attr.attr ) );
        let mut cache = RecordCache::with_defaults( has_timestamp );

        while let Some( (attr_index, record) ) = self.read_record()? {
            if !sorted {
                if !callback( attr_index, record ) {
                    return Ok(());
                }
                continue;
            }

            let timestamp = record.timestamp();
            cache.push( 0, timestamp, (attr_index, record) );
            while let Some( (attr_index, record) ) = cache.pop() {
                if !callback( attr_index, record ) {
                    return Ok(());
                }
            }
        }

        for (attr_index, record) in cache.pop_all() {
            if !callback( attr_index, record ) {
                break;
            }
        }

        Ok(())
    }

    /// Returns the raw blob of a feature section, or `None` if the file doesn't have it.
    pub fn read_feature_section( &mut self, feature: u32 ) -> io::Result< Option< Vec< u8 > > > {
        let section = match self.feature_sections.get( &feature ) {
            Some( &section ) => section,
            None => return Ok( None )
        };

        self.needs_seek = true;
        self.input.seek( SeekFrom::Start( section.offset ) )?;
        let mut data = vec![ 0; section.size as usize ];
        self.input.read_exact( &mut data )?;
        Ok( Some( data ) )
    }

    pub fn read_string_feature( &mut self, feature: u32 ) -> io::Result< Option< String > > {
        match self.read_feature_section( feature )? {
            Some( data ) => Ok( Some( read_feature_string( &mut io::Cursor::new( data ) )? ) ),
            None => Ok( None )
        }
    }

    pub fn read_cmdline_feature( &mut self ) -> io::Result< Vec< String > > {
        let data = match self.read_feature_section( FEAT_CMDLINE )? {
            Some( data ) => data,
            None => return Ok( Vec::new() )
        };

        let mut cur = io::Cursor::new( data );
        let count = cur.read_u32::< NativeEndian >()?;
        let mut cmdline = Vec::new();
        for _ in 0..count {
            cmdline.push( read_feature_string( &mut cur )? );
        }

        Ok( cmdline )
    }

    pub fn read_build_id_feature( &mut self ) -> io::Result< Vec< BuildIdRecord > > {
        let data = match self.read_feature_section( FEAT_BUILD_ID )? {
            Some( data ) => data,
            None => return Ok( Vec::new() )
        };

        let attr = self.attrs[ 0 ].attr;
        let mut output = Vec::new();
        let mut offset = 0;
        while offset + RECORD_HEADER_SIZE <= data.len() {
            // Some writers store these records with a zero type.
            let mut header_bytes = [0; RECORD_HEADER_SIZE];
            header_bytes.copy_from_slice( &data[ offset..offset + RECORD_HEADER_SIZE ] );
            header_bytes[ ..4 ].copy_from_slice( &PERF_RECORD_BUILD_ID.to_ne_bytes() );
            let header = RecordHeader::parse( &header_bytes )?;
            let size = header.size as usize;
            if size < RECORD_HEADER_SIZE || offset + size > data.len() {
                return Err( invalid_data( "truncated build id feature" ) );
            }

            let mut bytes = data[ offset..offset + size ].to_vec();
            bytes[ ..4 ].copy_from_slice( &header_bytes[ ..4 ] );
            if let RecordBody::BuildId( record ) = Record::parse( &attr, &bytes )?.body {
                output.push( record );
            }

            offset += size;
        }

        Ok( output )
    }

    pub fn read_meta_info_feature( &mut self ) -> io::Result< BTreeMap< String, String > > {
        let data = match self.read_feature_section( FEAT_META_INFO )? {
            Some( data ) => data,
            None => return Ok( BTreeMap::new() )
        };

        let mut strings = data.split( |&byte| byte == 0 ).map( |bytes| String::from_utf8_lossy( bytes ).into_owned() );
        let mut output = BTreeMap::new();
        while let (Some( key ), Some( value )) = (strings.next(), strings.next()) {
            if key.is_empty() {
                break;
            }
            output.insert( key, value );
        }

        Ok( output )
    }

    pub fn read_tracing_data_feature( &mut self ) -> io::Result< Option< Vec< u8 > > > {
        self.read_feature_section( FEAT_TRACING_DATA )
    }

    pub fn read_debug_unwind_feature( &mut self ) -> io::Result< Option< Vec< u8 > > > {
        self.read_feature_section( FEAT_DEBUG_UNWIND )
    }

    pub fn read_file_feature( &mut self ) -> io::Result< Vec< FileFeature > > {
        match self.read_feature_section( FEAT_FILE )? {
            Some( data ) => FileFeature::parse_all( &data ),
            None => Ok( Vec::new() )
        }
    }

    /// Maps every binary with a recorded build id to that id.
    pub fn build_id_map( &mut self ) -> io::Result< HashMap< String, crate::build_id::BuildId > > {
        Ok( self.read_build_id_feature()?.into_iter().map( |record| (record.filename, record.build_id) ).collect() )
    }

    /// Event names stored by the recorder in the meta info, one per attr.
    pub fn event_names( &mut self ) -> io::Result< Vec< String > > {
        let info = self.read_meta_info_feature()?;
        let names: Vec< String > = info.get( "event_names" )
            .map( |names| names.split( ',' ).map( |name| name.to_owned() ).collect() )
            .unwrap_or_default();

        Ok( (0..self.attrs.len()).map( |index| {
            names.get( index ).cloned().unwrap_or_else( || format!( "event{}", index ) )
        }).collect() )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use perf_event_open::sys::*;
    use quickcheck::{Arbitrary, Gen};

    use crate::build_id::BuildId;
    use crate::event_attr::create_default_perf_event_attr;
    use crate::event_type::find_event_type_by_name;
    use crate::record::{EventIdEntry, SampleRecord, SIMPLE_PERF_RECORD_TRACING_DATA};
    use crate::record_file_writer::RecordFileWriter;

    fn attr( name: &str ) -> PerfEventAttr {
        create_default_perf_event_attr( &find_event_type_by_name( name ).unwrap() )
    }

    fn sample( attr: &PerfEventAttr, id: u64, time: u64, ip: u64 ) -> Record {
        Record::new( PERF_RECORD_MISC_USER, RecordBody::Sample( SampleRecord {
            sample_type: attr.sample_type,
            ip,
            pid: 100,
            tid: 101,
            time,
            id,
            cpu: 1,
            period: 1000,
            .. SampleRecord::default()
        }))
    }

    fn write_file( attrs: &[AttrWithIds], records: &[Record] ) -> Vec< u8 > {
        let mut writer = RecordFileWriter::new( Cursor::new( Vec::new() ) ).unwrap();
        writer.write_attr_section( attrs ).unwrap();
        for record in records {
            writer.write_record( record ).unwrap();
        }
        writer.finalize().unwrap().into_inner()
    }

    fn read_all( bytes: Vec< u8 >, sorted: bool ) -> Vec< (usize, Record) > {
        let mut reader = RecordFileReader::new( Cursor::new( bytes ) ).unwrap();
        let mut output = Vec::new();
        reader.read_data_section( sorted, |index, record| {
            output.push( (index, record) );
            true
        }).unwrap();
        output
    }

    #[test]
    fn test_zero_attrs_are_rejected() {
        let mut writer = RecordFileWriter::new( Cursor::new( Vec::new() ) ).unwrap();
        assert!( writer.write_attr_section( &[] ).is_err() );
        assert!( writer.write_record( &Record::comm( &attr( "cpu-clock" ), 1, 1, "a", 0, 0 ) ).is_err() );

        let mut bytes = Vec::new();
        FileHeader {
            attrs: SectionDesc { offset: FILE_HEADER_SIZE as u64, size: 0 },
            data: SectionDesc { offset: FILE_HEADER_SIZE as u64, size: 0 },
            .. FileHeader::default()
        }.write( &mut bytes ).unwrap();
        assert!( RecordFileReader::new( Cursor::new( bytes ) ).is_err() );
    }

    #[test]
    fn test_round_trip_with_a_single_attr() {
        let attr = attr( "cpu-clock" );
        let records = vec![
            Record::comm( &attr, 100, 101, "app", 5, 7 ),
            sample( &attr, 7, 10, 0x1000 ),
            Record::new( 0, RecordBody::Unknown { kind: 70, payload: vec![ 9; 16 ] } )
        ];

        let bytes = write_file( &[ AttrWithIds { attr, ids: vec![ 7 ] } ], &records );
        let mut reader = RecordFileReader::new( Cursor::new( bytes.clone() ) ).unwrap();
        assert_eq!( reader.attrs().len(), 1 );
        assert_eq!( reader.attrs()[ 0 ].attr, attr );
        assert_eq!( reader.attrs()[ 0 ].ids, vec![ 7 ] );
        assert!( reader.read_record().unwrap().is_some() );

        let output = read_all( bytes, false );
        let expected: Vec< _ > = records.into_iter().map( |record| (0, record) ).collect();
        assert_eq!( output, expected );
    }

    #[test]
    fn test_round_trip_with_multiple_attrs() {
        let first = attr( "cpu-clock" );
        let mut second = attr( "task-clock" );
        second.sample_type |= PERF_SAMPLE_CALLCHAIN;

        let mut callchain_sample = sample( &second, 20, 3, 0x2000 );
        if let RecordBody::Sample( ref mut sample ) = callchain_sample.body {
            sample.callchain = vec![ PERF_CONTEXT_USER, 0x2000, 0x3000 ];
        }

        let records = vec![
            sample( &first, 10, 1, 0x1000 ),
            Record::comm( &second, 100, 101, "app", 2, 20 ),
            callchain_sample,
            Record::new( 0, RecordBody::EventId( vec![ EventIdEntry { attr_index: 1, event_id: 30 } ] ) ),
            sample( &second, 30, 4, 0x4000 ),
            sample( &first, 99, 5, 0x5000 )
        ];

        let attrs = [
            AttrWithIds { attr: first, ids: vec![ 10, 11 ] },
            AttrWithIds { attr: second, ids: vec![ 20 ] }
        ];

        let output = read_all( write_file( &attrs, &records ), false );
        let indices: Vec< _ > = output.iter().map( |&(index, _)| index ).collect();
        // An unknown event id falls back to the first attr.
        assert_eq!( indices, vec![ 0, 1, 1, 0, 1, 0 ] );

        let parsed: Vec< _ > = output.into_iter().map( |(_, record)| record ).collect();
        assert_eq!( parsed, records );
    }

    #[test]
    fn test_split_records_are_joined() {
        let attr = attr( "cpu-clock" );
        let tracing_data: Vec< u8 > = (0..200_000).map( |value| value as u8 ).collect();
        let records = vec![
            Record::new( 0, RecordBody::TracingData( tracing_data ) ),
            Record::comm( &attr, 1, 1, "after", 0, 0 )
        ];

        let bytes = write_file( &[ AttrWithIds { attr, ids: vec![] } ], &records );
        let data_offset = FileHeader::read( &mut Cursor::new( &bytes ) ).unwrap().data.offset as usize;
        let first_kind = u32::from_ne_bytes( [
            bytes[ data_offset ],
            bytes[ data_offset + 1 ],
            bytes[ data_offset + 2 ],
            bytes[ data_offset + 3 ]
        ]);
        assert_eq!( first_kind, SIMPLE_PERF_RECORD_SPLIT );

        let output = read_all( bytes, false );
        assert_eq!( output.len(), 2 );
        assert_eq!( output[ 0 ].1.kind(), SIMPLE_PERF_RECORD_TRACING_DATA );
        assert_eq!( output[ 0 ].1, records[ 0 ] );
        assert_eq!( output[ 1 ].1, records[ 1 ] );
    }

    #[test]
    fn test_sorted_reading() {
        let attr = attr( "cpu-clock" );
        let records = vec![
            sample( &attr, 1, 300, 3 ),
            sample( &attr, 1, 100, 1 ),
            sample( &attr, 1, 200, 2 )
        ];

        let output = read_all( write_file( &[ AttrWithIds { attr, ids: vec![ 1 ] } ], &records ), true );
        let times: Vec< _ > = output.iter().map( |(_, record)| record.timestamp().unwrap() ).collect();
        assert_eq!( times, vec![ 100, 200, 300 ] );
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let attr = attr( "cpu-clock" );
        let mut writer = RecordFileWriter::new( Cursor::new( Vec::new() ) ).unwrap();
        writer.write_attr_section( &[ AttrWithIds { attr, ids: vec![] } ] ).unwrap();

        let mut bogus = Vec::new();
        RecordHeader { kind: PERF_RECORD_SAMPLE, misc: 0, size: 16 }.write_to( &mut bogus ).unwrap();
        bogus.extend_from_slice( &[0; 8] );
        writer.write_record_bytes( &bogus ).unwrap();
        writer.write_record( &sample( &attr, 1, 1, 0x1000 ) ).unwrap();
        let bytes = writer.finalize().unwrap().into_inner();

        let output = read_all( bytes, false );
        assert_eq!( output.len(), 1 );
        assert_eq!( output[ 0 ].1, sample( &attr, 1, 1, 0x1000 ) );
    }

    #[test]
    fn test_truncated_data_section_is_fatal() {
        let attr = attr( "cpu-clock" );
        let mut bytes = write_file( &[ AttrWithIds { attr, ids: vec![] } ], &[ sample( &attr, 1, 1, 0x1000 ) ] );
        let header = FileHeader::read( &mut Cursor::new( &bytes ) ).unwrap();
        let end = (header.data.offset + header.data.size) as usize;

        // Claim a size which runs past the data section.
        let size_offset = header.data.offset as usize + 6;
        bytes[ size_offset..size_offset + 2 ].copy_from_slice( &(header.data.size as u16 + 8).to_ne_bytes() );
        bytes.truncate( end );

        let mut reader = RecordFileReader::new( Cursor::new( bytes ) ).unwrap();
        assert!( reader.read_data_section( false, |_, _| true ).is_err() );
    }

    #[test]
    fn test_sections_outside_of_the_file_are_rejected() {
        let header_with = |attr_size: u64, attrs: SectionDesc| {
            let mut bytes = Vec::new();
            FileHeader {
                attr_size,
                attrs,
                data: SectionDesc { offset: FILE_HEADER_SIZE as u64, size: 0 },
                .. FileHeader::default()
            }.write( &mut bytes ).unwrap();
            bytes
        };

        let huge = header_with( 17, SectionDesc { offset: FILE_HEADER_SIZE as u64, size: u64::max_value() } );
        let error = RecordFileReader::new( Cursor::new( huge ) ).err().unwrap();
        assert_eq!( error.kind(), io::ErrorKind::InvalidData );

        let past_the_end = header_with( FILE_ATTR_SIZE as u64, SectionDesc { offset: FILE_HEADER_SIZE as u64, size: FILE_ATTR_SIZE as u64 } );
        let error = RecordFileReader::new( Cursor::new( past_the_end ) ).err().unwrap();
        assert_eq!( error.kind(), io::ErrorKind::InvalidData );

        let wide_attr = header_with( 1 << 20, SectionDesc { offset: FILE_HEADER_SIZE as u64, size: 1 << 20 } );
        let error = RecordFileReader::new( Cursor::new( wide_attr ) ).err().unwrap();
        assert_eq!( error.kind(), io::ErrorKind::InvalidData );

        // A valid file whose feature section points past its end.
        let attr = attr( "cpu-clock" );
        let mut writer = RecordFileWriter::new( Cursor::new( Vec::new() ) ).unwrap();
        writer.write_attr_section( &[ AttrWithIds { attr, ids: vec![ 1 ] } ] ).unwrap();
        writer.write_string_feature( FEAT_ARCH, "arm64" ).unwrap();
        let mut bytes = writer.finalize().unwrap().into_inner();
        let header = FileHeader::read( &mut Cursor::new( &bytes ) ).unwrap();
        let size_offset = (header.data.offset + header.data.size) as usize + 8;
        bytes[ size_offset..size_offset + 8 ].copy_from_slice( &u64::max_value().to_ne_bytes() );
        let error = RecordFileReader::new( Cursor::new( bytes ) ).err().unwrap();
        assert_eq!( error.kind(), io::ErrorKind::InvalidData );
    }

    #[test]
    fn test_shorter_on_disk_attr() {
        let mut attr = attr( "cpu-clock" );
        let short_size = 64;
        attr.size = short_size as u32;

        let mut header = FileHeader::default();
        header.attr_size = (short_size + SECTION_DESC_SIZE) as u64;
        header.attrs = SectionDesc { offset: FILE_HEADER_SIZE as u64, size: header.attr_size };
        header.data = SectionDesc { offset: FILE_HEADER_SIZE as u64 + header.attr_size, size: 0 };

        let mut bytes = Vec::new();
        header.write( &mut bytes ).unwrap();
        bytes.extend_from_slice( &attr.as_bytes()[ ..short_size ] );
        SectionDesc { offset: 0, size: 0 }.write( &mut bytes ).unwrap();

        let reader = RecordFileReader::new( Cursor::new( bytes ) ).unwrap();
        let read = reader.attrs()[ 0 ].attr;
        assert_eq!( read.sample_type, attr.sample_type );
        assert_eq!( read.config, attr.config );
        assert_eq!( read.sample_regs_user, 0 );
        assert_eq!( read.aux_watermark, 0 );
    }

    #[test]
    fn test_features() {
        let attr = attr( "cpu-clock" );
        let mut writer = RecordFileWriter::new( Cursor::new( Vec::new() ) ).unwrap();
        writer.write_attr_section( &[ AttrWithIds { attr, ids: vec![] } ] ).unwrap();
        writer.write_record( &sample( &attr, 1, 1, 0x1000 ) ).unwrap();

        let cmdline = vec![ "simpleperf".to_owned(), "record".to_owned(), "-p".to_owned(), "1".to_owned() ];
        writer.write_cmdline_feature( &cmdline ).unwrap();
        writer.write_string_feature( FEAT_ARCH, "x86_64" ).unwrap();
        writer.write_branch_stack_feature().unwrap();
        writer.write_build_id_feature( &[
            BuildIdRecord { pid: u32::max_value(), build_id: BuildId::new( &[0xab; 20] ), filename: "[kernel.kallsyms]".to_owned() },
            BuildIdRecord { pid: 0, build_id: BuildId::new( &[1, 2, 3] ), filename: "/system/lib64/libc.so".to_owned() }
        ]).unwrap();

        let mut info = BTreeMap::new();
        info.insert( "event_names".to_owned(), "cpu-clock".to_owned() );
        info.insert( "product".to_owned(), "test".to_owned() );
        writer.write_meta_info_feature( &info ).unwrap();
        let bytes = writer.finalize().unwrap().into_inner();

        let mut reader = RecordFileReader::new( Cursor::new( bytes ) ).unwrap();
        assert_eq!(
            reader.feature_sections().keys().cloned().collect::< Vec< _ > >(),
            vec![ FEAT_BUILD_ID, FEAT_ARCH, FEAT_CMDLINE, FEAT_BRANCH_STACK, FEAT_META_INFO ]
        );
        assert_eq!( reader.read_cmdline_feature().unwrap(), cmdline );
        assert_eq!( reader.read_string_feature( FEAT_ARCH ).unwrap(), Some( "x86_64".to_owned() ) );
        assert_eq!( reader.read_string_feature( FEAT_OSRELEASE ).unwrap(), None );
        assert_eq!( reader.read_feature_section( FEAT_BRANCH_STACK ).unwrap(), Some( Vec::new() ) );
        assert_eq!( reader.read_meta_info_feature().unwrap(), info );
        assert_eq!( reader.event_names().unwrap(), vec![ "cpu-clock".to_owned() ] );

        let build_ids = reader.read_build_id_feature().unwrap();
        assert_eq!( build_ids.len(), 2 );
        assert_eq!( build_ids[ 1 ].filename, "/system/lib64/libc.so" );
        assert_eq!( build_ids[ 1 ].build_id, BuildId::new( &[1, 2, 3] ) );

        // Reading features in between doesn't disturb the data section.
        let mut count = 0;
        reader.read_data_section( false, |_, _| { count += 1; true } ).unwrap();
        assert_eq!( count, 1 );
    }

    #[test]
    fn test_build_id_record_sizes_are_checked() {
        let attr = attr( "cpu-clock" );
        let mut writer = RecordFileWriter::new( Cursor::new( Vec::new() ) ).unwrap();
        writer.write_attr_section( &[ AttrWithIds { attr, ids: vec![] } ] ).unwrap();
        writer.write_build_id_feature( &[
            BuildIdRecord { pid: 0, build_id: BuildId::new( &[1, 2, 3] ), filename: "/system/lib64/libc.so".to_owned() }
        ]).unwrap();
        let bytes = writer.finalize().unwrap().into_inner();

        let header = FileHeader::read( &mut Cursor::new( &bytes ) ).unwrap();
        let descriptor = (header.data.offset + header.data.size) as usize;
        let section = (&bytes[ descriptor..descriptor + 8 ]).read_u64::< NativeEndian >().unwrap() as usize;

        for &size in &[ 0u16, 4, 0xffff ] {
            let mut bytes = bytes.clone();
            bytes[ section + 6..section + 8 ].copy_from_slice( &size.to_ne_bytes() );
            let mut reader = RecordFileReader::new( Cursor::new( bytes ) ).unwrap();
            assert_eq!( reader.read_build_id_feature().err().unwrap().kind(), io::ErrorKind::InvalidData );
        }
    }

    #[derive(Clone, Debug)]
    struct Samples( Vec< (bool, u64, u64) > );

    impl Arbitrary for Samples {
        fn arbitrary( g: &mut Gen ) -> Self {
            let length = usize::arbitrary( g ) % 32;
            Samples( (0..length).map( |_| (bool::arbitrary( g ), u64::arbitrary( g ), u64::arbitrary( g )) ).collect() )
        }
    }

    quickcheck! {
        fn written_samples_read_back_with_their_attr( samples: Samples ) -> bool {
            let first = attr( "cpu-clock" );
            let second = attr( "page-faults" );
            let attrs = [
                AttrWithIds { attr: first, ids: vec![ 1 ] },
                AttrWithIds { attr: second, ids: vec![ 2 ] }
            ];

            let records: Vec< _ > = samples.0.iter().map( |&(is_second, time, ip)| {
                if is_second {
                    (1, sample( &second, 2, time, ip ))
                } else {
                    (0, sample( &first, 1, time, ip ))
                }
            }).collect();

            let plain: Vec< _ > = records.iter().map( |(_, record)| record.clone() ).collect();
            read_all( write_file( &attrs, &plain ), false ) == records
        }
    }
}
