use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{NativeEndian, WriteBytesExt};

use crate::record::{
    BuildIdRecord,
    Record,
    RecordBody,
    RecordHeader,
    MAX_RECORD_SIZE_IN_KERNEL_FORMAT,
    RECORD_HEADER_SIZE,
    SIMPLE_PERF_RECORD_SPLIT,
    SIMPLE_PERF_RECORD_SPLIT_END
};
use crate::record_file::*;
use crate::utils::invalid_data;

/// Writes a record file in two passes.
///
/// The header is reserved up front and records are streamed out right after
/// the attr section. Feature blobs are kept in memory and `finalize` lays out
/// the feature table behind the data section before patching the header.
pub struct RecordFileWriter< W: Write + Seek > {
    output: W,
    header: FileHeader,
    position: u64,
    data_started: bool,
    features: BTreeMap< u32, Vec< u8 > >
}

impl RecordFileWriter< BufWriter< File > > {
    pub fn create< P: AsRef< Path > >( path: P ) -> io::Result< Self > {
        let path = path.as_ref();
        let fp = File::create( path ).map_err( |err| {
            io::Error::new( err.kind(), format!( "failed to create record file {:?}: {}", path, err ) )
        })?;

        RecordFileWriter::new( BufWriter::new( fp ) )
    }
}

impl< W: Write + Seek > RecordFileWriter< W > {
    pub fn new( mut output: W ) -> io::Result< Self > {
        let header = FileHeader::default();
        output.seek( SeekFrom::Start( 0 ) )?;
        output.write_all( &[0; FILE_HEADER_SIZE] )?;

        Ok( RecordFileWriter {
            output,
            header,
            position: FILE_HEADER_SIZE as u64,
            data_started: false,
            features: BTreeMap::new()
        })
    }

    fn write_bytes( &mut self, bytes: &[u8] ) -> io::Result< () > {
        self.output.write_all( bytes )?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Writes the id arrays followed by one `{attr, ids}` entry per attr.
    ///
    /// Must be called exactly once, before any record is written.
    pub fn write_attr_section( &mut self, attrs: &[AttrWithIds] ) -> io::Result< () > {
        if self.data_started || self.header.attrs.size != 0 {
            return Err( io::Error::new( io::ErrorKind::Other, "the attr section has already been written" ) );
        }

        if attrs.is_empty() {
            return Err( io::Error::new( io::ErrorKind::InvalidInput, "a record file needs at least one attr" ) );
        }

        let mut id_offset = self.position;
        let mut id_section = Vec::new();
        for attr in attrs {
            for &id in &attr.ids {
                id_section.write_u64::< NativeEndian >( id )?;
            }
        }
        self.write_bytes( &id_section )?;

        let attr_section_offset = self.position;
        let mut attr_section = Vec::with_capacity( attrs.len() * FILE_ATTR_SIZE );
        for attr in attrs {
            attr_section.extend_from_slice( attr.attr.as_bytes() );
            let ids = SectionDesc {
                offset: id_offset,
                size: (attr.ids.len() * 8) as u64
            };
            ids.write( &mut attr_section )?;
            id_offset += ids.size;
        }
        self.write_bytes( &attr_section )?;

        self.header.attrs = SectionDesc {
            offset: attr_section_offset,
            size: attr_section.len() as u64
        };
        self.header.data = SectionDesc {
            offset: self.position,
            size: 0
        };

        Ok(())
    }

    /// Appends one record to the data section, splitting it into
    /// SPLIT chunks if it doesn't fit the 16-bit kernel size field.
    pub fn write_record( &mut self, record: &Record ) -> io::Result< () > {
        let bytes = record.to_bytes()?;
        self.write_record_bytes( &bytes )
    }

    pub fn write_record_bytes( &mut self, bytes: &[u8] ) -> io::Result< () > {
        if self.header.attrs.size == 0 {
            return Err( io::Error::new( io::ErrorKind::Other, "records written before the attr section" ) );
        }

        self.data_started = true;
        let start = self.position;
        if bytes.len() <= MAX_RECORD_SIZE_IN_KERNEL_FORMAT {
            self.write_bytes( bytes )?;
        } else {
            let mut chunk_buffer = Vec::with_capacity( MAX_RECORD_SIZE_IN_KERNEL_FORMAT );
            for chunk in bytes.chunks( MAX_RECORD_SIZE_IN_KERNEL_FORMAT - RECORD_HEADER_SIZE ) {
                chunk_buffer.clear();
                RecordHeader {
                    kind: SIMPLE_PERF_RECORD_SPLIT,
                    misc: 0,
                    size: (chunk.len() + RECORD_HEADER_SIZE) as u32
                }.write_to( &mut chunk_buffer )?;
                chunk_buffer.extend_from_slice( chunk );
                self.write_bytes( &chunk_buffer )?;
            }

            chunk_buffer.clear();
            RecordHeader {
                kind: SIMPLE_PERF_RECORD_SPLIT_END,
                misc: 0,
                size: RECORD_HEADER_SIZE as u32
            }.write_to( &mut chunk_buffer )?;
            self.write_bytes( &chunk_buffer )?;
        }

        self.header.data.size += self.position - start;
        Ok(())
    }

    pub fn data_section_size( &self ) -> u64 {
        self.header.data.size
    }

    /// Stores a raw feature blob; a later call for the same feature replaces it.
    pub fn write_feature( &mut self, feature: u32, data: Vec< u8 > ) -> io::Result< () > {
        if feature >= FEAT_MAX_NUM {
            return Err( io::Error::new( io::ErrorKind::InvalidInput, format!( "invalid feature id: {}", feature ) ) );
        }

        self.features.insert( feature, data );
        Ok(())
    }

    pub fn write_string_feature( &mut self, feature: u32, value: &str ) -> io::Result< () > {
        let mut data = Vec::new();
        write_feature_string( &mut data, value );
        self.write_feature( feature, data )
    }

    pub fn write_cmdline_feature( &mut self, cmdline: &[String] ) -> io::Result< () > {
        let mut data = Vec::new();
        data.write_u32::< NativeEndian >( cmdline.len() as u32 )?;
        for arg in cmdline {
            write_feature_string( &mut data, arg );
        }

        self.write_feature( FEAT_CMDLINE, data )
    }

    pub fn write_build_id_feature( &mut self, build_ids: &[BuildIdRecord] ) -> io::Result< () > {
        let mut data = Vec::new();
        for build_id in build_ids {
            let in_kernel = build_id.pid == u32::max_value();
            let misc = if in_kernel {
                perf_event_open::sys::PERF_RECORD_MISC_KERNEL
            } else {
                perf_event_open::sys::PERF_RECORD_MISC_USER
            };

            Record::new( misc, RecordBody::BuildId( build_id.clone() ) ).write_to( &mut data )?;
        }

        self.write_feature( FEAT_BUILD_ID, data )
    }

    pub fn write_branch_stack_feature( &mut self ) -> io::Result< () > {
        self.write_feature( FEAT_BRANCH_STACK, Vec::new() )
    }

    pub fn write_tracing_data_feature( &mut self, data: &[u8] ) -> io::Result< () > {
        self.write_feature( FEAT_TRACING_DATA, data.to_vec() )
    }

    /// Key/value pairs stored as consecutive NUL-terminated strings.
    pub fn write_meta_info_feature( &mut self, info: &BTreeMap< String, String > ) -> io::Result< () > {
        let mut data = Vec::new();
        for (key, value) in info {
            if key.contains( '\0' ) || value.contains( '\0' ) {
                return Err( invalid_data( format!( "meta info entry {:?} contains a NUL byte", key ) ) );
            }

            data.extend_from_slice( key.as_bytes() );
            data.push( 0 );
            data.extend_from_slice( value.as_bytes() );
            data.push( 0 );
        }

        self.write_feature( FEAT_META_INFO, data )
    }

    pub fn write_file_feature( &mut self, files: &[FileFeature] ) -> io::Result< () > {
        let mut data = Vec::new();
        for file in files {
            file.write_to( &mut data )?;
        }

        self.write_feature( FEAT_FILE, data )
    }

    /// Lays out the feature table and blobs, then patches the header.
    ///
    /// Consumes the writer; the returned sink holds a complete file.
    pub fn finalize( mut self ) -> io::Result< W > {
        if self.header.attrs.size == 0 {
            return Err( io::Error::new( io::ErrorKind::Other, "can't finalize a record file without an attr section" ) );
        }

        let features = std::mem::replace( &mut self.features, BTreeMap::new() );
        let table_size = features.len() * SECTION_DESC_SIZE;
        let mut blob_offset = self.position + table_size as u64;
        let mut table = Vec::with_capacity( table_size );
        for (&feature, data) in &features {
            self.header.set_feature( feature );
            SectionDesc {
                offset: blob_offset,
                size: data.len() as u64
            }.write( &mut table )?;
            blob_offset += data.len() as u64;
        }

        self.write_bytes( &table )?;
        for data in features.values() {
            self.write_bytes( data )?;
        }

        let mut header = Vec::with_capacity( FILE_HEADER_SIZE );
        self.header.write( &mut header )?;
        self.output.seek( SeekFrom::Start( 0 ) )?;
        self.output.write_all( &header )?;
        self.output.seek( SeekFrom::Start( self.position ) )?;
        self.output.flush()?;

        debug!( "Finalized a record file with {} bytes of records and {} features", self.header.data.size, features.len() );
        Ok( self.output )
    }
}

