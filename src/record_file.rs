use std::io::{self, Read, Write};
use std::mem;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use perf_event_open::sys::PerfEventAttr;

use crate::utils::invalid_data;

pub const PERF_MAGIC: &[u8; 8] = b"PERFILE2";

pub const FEAT_RESERVED: u32 = 0;
pub const FEAT_TRACING_DATA: u32 = 1;
pub const FEAT_BUILD_ID: u32 = 2;
pub const FEAT_HOSTNAME: u32 = 3;
pub const FEAT_OSRELEASE: u32 = 4;
pub const FEAT_VERSION: u32 = 5;
pub const FEAT_ARCH: u32 = 6;
pub const FEAT_NRCPUS: u32 = 7;
pub const FEAT_CPUDESC: u32 = 8;
pub const FEAT_CPUID: u32 = 9;
pub const FEAT_TOTAL_MEM: u32 = 10;
pub const FEAT_CMDLINE: u32 = 11;
pub const FEAT_EVENT_DESC: u32 = 12;
pub const FEAT_CPU_TOPOLOGY: u32 = 13;
pub const FEAT_NUMA_TOPOLOGY: u32 = 14;
pub const FEAT_BRANCH_STACK: u32 = 15;
pub const FEAT_PMU_MAPPINGS: u32 = 16;
pub const FEAT_GROUP_DESC: u32 = 17;
pub const FEAT_AUXTRACE: u32 = 18;

pub const FEAT_SIMPLEPERF_START: u32 = 128;
pub const FEAT_FILE: u32 = FEAT_SIMPLEPERF_START;
pub const FEAT_META_INFO: u32 = 129;
pub const FEAT_DEBUG_UNWIND: u32 = 130;
pub const FEAT_DEBUG_UNWIND_FILE: u32 = 131;
pub const FEAT_FILE2: u32 = 132;
pub const FEAT_MAX_NUM: u32 = 256;

pub const FEATURE_BITMAP_SIZE: usize = (FEAT_MAX_NUM / 8) as usize;
pub const FILE_HEADER_SIZE: usize = 8 + 8 + 8 + 3 * SECTION_DESC_SIZE + FEATURE_BITMAP_SIZE;
pub const SECTION_DESC_SIZE: usize = 16;
pub const FILE_ATTR_SIZE: usize = mem::size_of::< PerfEventAttr >() + SECTION_DESC_SIZE;

pub fn feature_name( feature: u32 ) -> &'static str {
    match feature {
        FEAT_TRACING_DATA => "tracing_data",
        FEAT_BUILD_ID => "build_id",
        FEAT_HOSTNAME => "hostname",
        FEAT_OSRELEASE => "osrelease",
        FEAT_VERSION => "version",
        FEAT_ARCH => "arch",
        FEAT_NRCPUS => "nrcpus",
        FEAT_CPUDESC => "cpudesc",
        FEAT_CPUID => "cpuid",
        FEAT_TOTAL_MEM => "total_mem",
        FEAT_CMDLINE => "cmdline",
        FEAT_EVENT_DESC => "event_desc",
        FEAT_CPU_TOPOLOGY => "cpu_topology",
        FEAT_NUMA_TOPOLOGY => "numa_topology",
        FEAT_BRANCH_STACK => "branch_stack",
        FEAT_PMU_MAPPINGS => "pmu_mappings",
        FEAT_GROUP_DESC => "group_desc",
        FEAT_AUXTRACE => "auxtrace",
        FEAT_FILE => "file",
        FEAT_META_INFO => "meta_info",
        FEAT_DEBUG_UNWIND => "debug_unwind",
        FEAT_DEBUG_UNWIND_FILE => "debug_unwind_file",
        FEAT_FILE2 => "file2",
        _ => "unknown"
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct SectionDesc {
    pub offset: u64,
    pub size: u64
}

impl SectionDesc {
    pub fn read< R: Read >( input: &mut R ) -> io::Result< Self > {
        let offset = input.read_u64::< NativeEndian >()?;
        let size = input.read_u64::< NativeEndian >()?;
        Ok( SectionDesc { offset, size } )
    }

    pub fn write< W: Write >( &self, output: &mut W ) -> io::Result< () > {
        output.write_u64::< NativeEndian >( self.offset )?;
        output.write_u64::< NativeEndian >( self.size )
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileHeader {
    pub magic: [u8; 8],
    pub header_size: u64,
    pub attr_size: u64,
    pub attrs: SectionDesc,
    pub data: SectionDesc,
    pub event_types: SectionDesc,
    pub features: [u8; FEATURE_BITMAP_SIZE]
}

impl Default for FileHeader {
    fn default() -> Self {
        FileHeader {
            magic: *PERF_MAGIC,
            header_size: FILE_HEADER_SIZE as u64,
            attr_size: FILE_ATTR_SIZE as u64,
            attrs: SectionDesc::default(),
            data: SectionDesc::default(),
            event_types: SectionDesc::default(),
            features: [0; FEATURE_BITMAP_SIZE]
        }
    }
}

impl FileHeader {
    pub fn read< R: Read >( input: &mut R ) -> io::Result< Self > {
        let mut header = FileHeader::default();
        input.read_exact( &mut header.magic )?;
        if &header.magic != PERF_MAGIC {
            return Err( invalid_data( format!( "not a record file: bad magic {:?}", String::from_utf8_lossy( &header.magic ) ) ) );
        }

        header.header_size = input.read_u64::< NativeEndian >()?;
        header.attr_size = input.read_u64::< NativeEndian >()?;
        header.attrs = SectionDesc::read( input )?;
        header.data = SectionDesc::read( input )?;
        header.event_types = SectionDesc::read( input )?;
        input.read_exact( &mut header.features )?;

        if header.attr_size <= SECTION_DESC_SIZE as u64 {
            return Err( invalid_data( format!( "invalid attr size in the file header: {}", header.attr_size ) ) );
        }

        Ok( header )
    }

    pub fn write< W: Write >( &self, output: &mut W ) -> io::Result< () > {
        output.write_all( &self.magic )?;
        output.write_u64::< NativeEndian >( self.header_size )?;
        output.write_u64::< NativeEndian >( self.attr_size )?;
        self.attrs.write( output )?;
        self.data.write( output )?;
        self.event_types.write( output )?;
        output.write_all( &self.features )
    }

    pub fn has_feature( &self, feature: u32 ) -> bool {
        feature < FEAT_MAX_NUM && self.features[ (feature / 8) as usize ] & (1 << (feature % 8)) != 0
    }

    pub fn set_feature( &mut self, feature: u32 ) {
        self.features[ (feature / 8) as usize ] |= 1 << (feature % 8);
    }

    /// Set feature ids in ascending order, which is also the order of the descriptor table.
    pub fn feature_ids( &self ) -> Vec< u32 > {
        (0..FEAT_MAX_NUM).filter( |&feature| self.has_feature( feature ) ).collect()
    }
}

/// An attr as stored in the file, with the kernel event ids assigned to it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AttrWithIds {
    pub attr: PerfEventAttr,
    pub ids: Vec< u64 >
}

/// Length-prefixed, NUL-terminated and 64-byte padded string as stored in feature sections.
pub fn write_feature_string( output: &mut Vec< u8 >, string: &str ) {
    let length = crate::utils::align( string.len() + 1, 64 );
    // Writing into a Vec cannot fail.
    let _ = output.write_u32::< NativeEndian >( length as u32 );
    output.extend_from_slice( string.as_bytes() );
    output.resize( output.len() + length - string.len(), 0 );
}

pub fn read_feature_string< R: Read >( input: &mut R ) -> io::Result< String > {
    let length = input.read_u32::< NativeEndian >()?;
    let mut buffer = vec![ 0; length as usize ];
    input.read_exact( &mut buffer )?;
    Ok( String::from_utf8_lossy( crate::utils::until_nul( &buffer ) ).into_owned() )
}

/// `DsoType` values as stored in the file feature.
pub const DSO_TYPE_KERNEL: u32 = 0;
pub const DSO_TYPE_KERNEL_MODULE: u32 = 1;
pub const DSO_TYPE_ELF_FILE: u32 = 2;
pub const DSO_TYPE_DEX_FILE: u32 = 3;
pub const DSO_TYPE_UNKNOWN_FILE: u32 = 4;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileSymbol {
    pub vaddr: u64,
    pub len: u32,
    pub name: String
}

/// Symbols of one binary which may be gone by the time the file is reported,
/// like JIT compiled code, plus the offsets of dex files inside it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileFeature {
    pub path: String,
    pub dso_type: u32,
    pub min_vaddr: u64,
    pub symbols: Vec< FileSymbol >,
    pub dex_file_offsets: Vec< u64 >
}

fn push_c_string( output: &mut Vec< u8 >, string: &str ) {
    output.extend_from_slice( string.as_bytes() );
    output.push( 0 );
}

fn read_c_string( cur: &mut io::Cursor< &[u8] > ) -> io::Result< String > {
    let data = *cur.get_ref();
    let start = cur.position() as usize;
    let length = data.get( start.. )
        .and_then( |rest| rest.iter().position( |&byte| byte == 0 ) )
        .ok_or_else( || invalid_data( "unterminated string in the file feature" ) )?;

    cur.set_position( (start + length + 1) as u64 );
    Ok( String::from_utf8_lossy( &data[ start..start + length ] ).into_owned() )
}

impl FileFeature {
    /// Appends `{ u32 size, path, type, min_vaddr, symbols, [dex offsets] }`.
    pub fn write_to( &self, output: &mut Vec< u8 > ) -> io::Result< () > {
        let mut body = Vec::new();
        push_c_string( &mut body, &self.path );
        body.write_u32::< NativeEndian >( self.dso_type )?;
        body.write_u64::< NativeEndian >( self.min_vaddr )?;
        body.write_u32::< NativeEndian >( self.symbols.len() as u32 )?;
        for symbol in &self.symbols {
            body.write_u64::< NativeEndian >( symbol.vaddr )?;
            body.write_u32::< NativeEndian >( symbol.len )?;
            push_c_string( &mut body, &symbol.name );
        }

        if self.dso_type == DSO_TYPE_DEX_FILE {
            body.write_u32::< NativeEndian >( self.dex_file_offsets.len() as u32 )?;
            for &offset in &self.dex_file_offsets {
                body.write_u64::< NativeEndian >( offset )?;
            }
        }

        output.write_u32::< NativeEndian >( body.len() as u32 )?;
        output.extend_from_slice( &body );
        Ok(())
    }

    /// Parses every entry of a file feature blob.
    pub fn parse_all( data: &[u8] ) -> io::Result< Vec< FileFeature > > {
        let mut output = Vec::new();
        let mut offset = 0;
        while offset + 4 <= data.len() {
            let size = io::Cursor::new( &data[ offset.. ] ).read_u32::< NativeEndian >()? as usize;
            let body = data.get( offset + 4..offset + 4 + size ).ok_or_else( || invalid_data( "truncated file feature" ) )?;
            output.push( FileFeature::parse( body )? );
            offset += 4 + size;
        }

        Ok( output )
    }

    fn parse( body: &[u8] ) -> io::Result< FileFeature > {
        let mut cur = io::Cursor::new( body );
        let path = read_c_string( &mut cur )?;
        let dso_type = cur.read_u32::< NativeEndian >()?;
        let min_vaddr = cur.read_u64::< NativeEndian >()?;
        let symbol_count = cur.read_u32::< NativeEndian >()?;
        let mut symbols = Vec::new();
        for _ in 0..symbol_count {
            let vaddr = cur.read_u64::< NativeEndian >()?;
            let len = cur.read_u32::< NativeEndian >()?;
            let name = read_c_string( &mut cur )?;
            symbols.push( FileSymbol { vaddr, len, name } );
        }

        let mut dex_file_offsets = Vec::new();
        if dso_type == DSO_TYPE_DEX_FILE {
            let count = cur.read_u32::< NativeEndian >()?;
            for _ in 0..count {
                dex_file_offsets.push( cur.read_u64::< NativeEndian >()? );
            }
        }

        Ok( FileFeature { path, dso_type, min_vaddr, symbols, dex_file_offsets } )
    }
}

#[test]
fn test_file_header_layout() {
    assert_eq!( FILE_HEADER_SIZE, 104 );
    assert_eq!( FILE_ATTR_SIZE, 128 );

    let mut header = FileHeader::default();
    header.set_feature( FEAT_BUILD_ID );
    header.set_feature( FEAT_META_INFO );
    header.data = SectionDesc { offset: 1000, size: 24 };

    let mut bytes = Vec::new();
    header.write( &mut bytes ).unwrap();
    assert_eq!( bytes.len(), FILE_HEADER_SIZE );

    let read = FileHeader::read( &mut io::Cursor::new( &bytes ) ).unwrap();
    assert_eq!( read, header );
    assert_eq!( read.feature_ids(), vec![ FEAT_BUILD_ID, FEAT_META_INFO ] );

    bytes[ 0 ] = b'X';
    assert!( FileHeader::read( &mut io::Cursor::new( &bytes ) ).is_err() );
}

#[test]
fn test_feature_string() {
    let mut bytes = Vec::new();
    write_feature_string( &mut bytes, "arm64" );
    assert_eq!( bytes.len(), 4 + 64 );
    assert_eq!( read_feature_string( &mut io::Cursor::new( &bytes ) ).unwrap(), "arm64" );
}

#[test]
fn test_file_feature() {
    let files = vec![
        FileFeature {
            path: "/tmp/simpleperf-jit-1".to_owned(),
            dso_type: DSO_TYPE_ELF_FILE,
            min_vaddr: 0,
            symbols: vec![
                FileSymbol { vaddr: 0x7000_1000, len: 0x40, name: "void com.example.Main.run()".to_owned() },
                FileSymbol { vaddr: 0x7000_1040, len: 0x10, name: "int com.example.Main.get()".to_owned() }
            ],
            dex_file_offsets: Vec::new()
        },
        FileFeature {
            path: "/data/app/base.apk".to_owned(),
            dso_type: DSO_TYPE_DEX_FILE,
            min_vaddr: 0,
            symbols: Vec::new(),
            dex_file_offsets: vec![ 0x100, 0x2000 ]
        }
    ];

    let mut data = Vec::new();
    for file in &files {
        file.write_to( &mut data ).unwrap();
    }

    assert_eq!( FileFeature::parse_all( &data ).unwrap(), files );
    assert!( FileFeature::parse_all( &data[ ..data.len() - 3 ] ).is_err() );
}
