use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use memmap::Mmap;

use crate::utils::invalid_data;

const DEX_MAGIC: &[u8; 4] = b"dex\n";
const DEX_HEADER_SIZE: usize = 0x70;
const CLASS_DEF_SIZE: usize = 32;
const METHOD_ID_SIZE: usize = 8;

/// A method with bytecode; `offset` is relative to the start of the containing file.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DexFileSymbol {
    pub offset: u64,
    pub len: u64,
    pub name: String
}

struct DexHeader {
    file_size: usize,
    string_ids_size: usize,
    string_ids_off: usize,
    type_ids_size: usize,
    type_ids_off: usize,
    method_ids_size: usize,
    method_ids_off: usize,
    class_defs_size: usize,
    class_defs_off: usize
}

struct DexFile< 'a > {
    data: &'a [u8],
    header: DexHeader
}

fn u32_at( data: &[u8], offset: usize ) -> io::Result< u32 > {
    data.get( offset..offset + 4 )
        .ok_or_else( || invalid_data( format!( "dex offset {:#x} is out of bounds", offset ) ) )?
        .read_u32::< LittleEndian >()
}

fn u16_at( data: &[u8], offset: usize ) -> io::Result< u16 > {
    data.get( offset..offset + 2 )
        .ok_or_else( || invalid_data( format!( "dex offset {:#x} is out of bounds", offset ) ) )?
        .read_u16::< LittleEndian >()
}

fn read_uleb128< R: Read >( input: &mut R ) -> io::Result< u64 > {
    let mut value = 0;
    let mut shift = 0;
    loop {
        let byte = input.read_u8()?;
        if shift < 64 {
            value |= ((byte & 0x7f) as u64) << shift;
        }
        if byte & 0x80 == 0 {
            return Ok( value );
        }
        shift += 7;
        if shift >= 35 {
            return Err( invalid_data( "uleb128 value is too long" ) );
        }
    }
}

/// `Lcom/example/Foo;` becomes `com.example.Foo`; primitive and array types keep their descriptor.
fn pretty_descriptor( descriptor: &str ) -> String {
    if descriptor.starts_with( 'L' ) && descriptor.ends_with( ';' ) {
        descriptor[ 1..descriptor.len() - 1 ].replace( '/', "." )
    } else {
        descriptor.to_owned()
    }
}

impl< 'a > DexFile< 'a > {
    fn parse( data: &'a [u8] ) -> io::Result< Self > {
        if data.len() < DEX_HEADER_SIZE || &data[ ..4 ] != DEX_MAGIC {
            return Err( invalid_data( "not a dex file" ) );
        }

        let field = |offset: usize| u32_at( data, offset ).map( |value| value as usize );
        let header = DexHeader {
            file_size: field( 32 )?,
            string_ids_size: field( 56 )?,
            string_ids_off: field( 60 )?,
            type_ids_size: field( 64 )?,
            type_ids_off: field( 68 )?,
            method_ids_size: field( 88 )?,
            method_ids_off: field( 92 )?,
            class_defs_size: field( 96 )?,
            class_defs_off: field( 100 )?
        };

        if header.file_size > data.len() || header.file_size < DEX_HEADER_SIZE {
            return Err( invalid_data( format!( "dex file claims {} bytes while {} are available", header.file_size, data.len() ) ) );
        }

        Ok( DexFile {
            data: &data[ ..header.file_size ],
            header
        })
    }

    fn string( &self, index: usize ) -> io::Result< String > {
        if index >= self.header.string_ids_size {
            return Err( invalid_data( format!( "string index {} is out of bounds", index ) ) );
        }

        let offset = u32_at( self.data, self.header.string_ids_off + index * 4 )? as usize;
        let mut cur = self.data.get( offset.. ).ok_or_else( || invalid_data( "string data is out of bounds" ) )?;
        read_uleb128( &mut cur )?;
        let end = cur.iter().position( |&byte| byte == 0 ).unwrap_or( cur.len() );
        Ok( String::from_utf8_lossy( &cur[ ..end ] ).into_owned() )
    }

    fn type_descriptor( &self, index: usize ) -> io::Result< String > {
        if index >= self.header.type_ids_size {
            return Err( invalid_data( format!( "type index {} is out of bounds", index ) ) );
        }

        let string_index = u32_at( self.data, self.header.type_ids_off + index * 4 )?;
        self.string( string_index as usize )
    }

    fn method_name( &self, index: usize ) -> io::Result< String > {
        if index >= self.header.method_ids_size {
            return Err( invalid_data( format!( "method index {} is out of bounds", index ) ) );
        }

        let offset = self.header.method_ids_off + index * METHOD_ID_SIZE;
        let class_index = u16_at( self.data, offset )?;
        let name_index = u32_at( self.data, offset + 4 )?;
        let class_name = pretty_descriptor( &self.type_descriptor( class_index as usize )? );
        let name = self.string( name_index as usize )?;
        Ok( format!( "{}.{}", class_name, name ) )
    }

    fn for_each_method_with_code< F >( &self, mut callback: F ) -> io::Result< () >
        where F: FnMut( usize, usize, usize ) -> io::Result< () >
    {
        for class in 0..self.header.class_defs_size {
            let class_def = self.header.class_defs_off + class * CLASS_DEF_SIZE;
            let class_data_off = u32_at( self.data, class_def + 24 )? as usize;
            if class_data_off == 0 {
                continue;
            }

            let mut cur = self.data.get( class_data_off.. ).ok_or_else( || invalid_data( "class data is out of bounds" ) )?;
            let static_fields = read_uleb128( &mut cur )?;
            let instance_fields = read_uleb128( &mut cur )?;
            let direct_methods = read_uleb128( &mut cur )?;
            let virtual_methods = read_uleb128( &mut cur )?;

            for _ in 0..static_fields + instance_fields {
                read_uleb128( &mut cur )?;
                read_uleb128( &mut cur )?;
            }

            for &count in &[ direct_methods, virtual_methods ] {
                // Method indices are delta encoded and restart for each list.
                let mut method_index = 0;
                for _ in 0..count {
                    method_index += read_uleb128( &mut cur )? as usize;
                    let _access_flags = read_uleb128( &mut cur )?;
                    let code_off = read_uleb128( &mut cur )? as usize;
                    if code_off == 0 {
                        continue;
                    }

                    let insns_size = u32_at( self.data, code_off + 12 )? as usize;
                    callback( method_index, code_off + 16, insns_size * 2 )?;
                }
            }
        }

        Ok(())
    }
}

/// Reads method symbols of the dex files found at `dex_file_offsets` inside `data`.
pub fn read_symbols_from_dex_file_in_memory( data: &[u8], dex_file_offsets: &[u64] ) -> io::Result< Vec< DexFileSymbol > > {
    let mut symbols = Vec::new();
    for &dex_file_offset in dex_file_offsets {
        let dex_data = data.get( dex_file_offset as usize.. ).ok_or_else( || {
            invalid_data( format!( "dex file offset {:#x} exceeds the file", dex_file_offset ) )
        })?;

        let dex = DexFile::parse( dex_data )?;
        dex.for_each_method_with_code( |method_index, insns_offset, insns_len| {
            symbols.push( DexFileSymbol {
                offset: dex_file_offset + insns_offset as u64,
                len: insns_len as u64,
                name: dex.method_name( method_index )?
            });
            Ok(())
        })?;
    }

    Ok( symbols )
}

pub fn read_symbols_from_dex_file< P: AsRef< Path > >( path: P, dex_file_offsets: &[u64] ) -> io::Result< Vec< DexFileSymbol > > {
    let fp = File::open( path.as_ref() )?;
    let mmap = unsafe { Mmap::map( &fp )? };
    read_symbols_from_dex_file_in_memory( &mmap, dex_file_offsets )
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn write_u32( data: &mut Vec< u8 >, offset: usize, value: u32 ) {
        data[ offset..offset + 4 ].copy_from_slice( &value.to_le_bytes() );
    }

    fn push_uleb128( data: &mut Vec< u8 >, mut value: u64 ) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                data.push( byte );
                return;
            }
            data.push( byte | 0x80 );
        }
    }

    /// Builds a dex file with one class which has a direct and a virtual method
    /// of `insns_sizes[ 0 ]` and `insns_sizes[ 1 ]` code units respectively.
    pub fn build_dex( class_descriptor: &str, method_names: [&str; 2], insns_sizes: [u32; 2] ) -> Vec< u8 > {
        let strings = [ class_descriptor, method_names[ 0 ], method_names[ 1 ] ];
        let string_ids_off = DEX_HEADER_SIZE;
        let type_ids_off = string_ids_off + strings.len() * 4;
        let method_ids_off = type_ids_off + 4;
        let class_defs_off = method_ids_off + 2 * METHOD_ID_SIZE;
        let mut data = vec![ 0; class_defs_off + CLASS_DEF_SIZE ];

        data[ ..8 ].copy_from_slice( b"dex\n035\0" );
        write_u32( &mut data, 56, strings.len() as u32 );
        write_u32( &mut data, 60, string_ids_off as u32 );
        write_u32( &mut data, 64, 1 );
        write_u32( &mut data, 68, type_ids_off as u32 );
        write_u32( &mut data, 88, 2 );
        write_u32( &mut data, 92, method_ids_off as u32 );
        write_u32( &mut data, 96, 1 );
        write_u32( &mut data, 100, class_defs_off as u32 );

        for (index, string) in strings.iter().enumerate() {
            let offset = data.len();
            write_u32( &mut data, string_ids_off + index * 4, offset as u32 );
            push_uleb128( &mut data, string.len() as u64 );
            data.extend_from_slice( string.as_bytes() );
            data.push( 0 );
        }

        write_u32( &mut data, type_ids_off, 0 );
        for method in 0..2 {
            let offset = method_ids_off + method * METHOD_ID_SIZE;
            data[ offset..offset + 2 ].copy_from_slice( &0_u16.to_le_bytes() );
            write_u32( &mut data, offset + 4, method as u32 + 1 );
        }

        while data.len() % 4 != 0 {
            data.push( 0 );
        }

        let mut code_offsets = Vec::new();
        for &insns_size in &insns_sizes {
            code_offsets.push( data.len() );
            data.extend_from_slice( &[0; 12] );
            data.extend_from_slice( &insns_size.to_le_bytes() );
            data.resize( data.len() + insns_size as usize * 2, 0 );
            while data.len() % 4 != 0 {
                data.push( 0 );
            }
        }

        let class_data_off = data.len();
        write_u32( &mut data, class_defs_off + 24, class_data_off as u32 );
        for &value in &[ 0, 0, 1, 1 ] {
            push_uleb128( &mut data, value );
        }
        for (method, &code_offset) in code_offsets.iter().enumerate() {
            push_uleb128( &mut data, method as u64 );
            push_uleb128( &mut data, 1 );
            push_uleb128( &mut data, code_offset as u64 );
        }

        let file_size = data.len() as u32;
        write_u32( &mut data, 32, file_size );
        data
    }

    #[test]
    fn test_read_dex_symbols() {
        let dex = build_dex( "Lcom/example/MainActivity;", [ "onCreate", "run" ], [ 3, 5 ] );
        let symbols = read_symbols_from_dex_file_in_memory( &dex, &[ 0 ] ).unwrap();
        assert_eq!( symbols.len(), 2 );
        assert_eq!( symbols[ 0 ].name, "com.example.MainActivity.onCreate" );
        assert_eq!( symbols[ 0 ].len, 6 );
        assert_eq!( symbols[ 1 ].name, "com.example.MainActivity.run" );
        assert_eq!( symbols[ 1 ].len, 10 );
        assert!( symbols[ 0 ].offset < symbols[ 1 ].offset );
    }

    #[test]
    fn test_dex_at_offset_inside_a_bigger_file() {
        let dex = build_dex( "LFoo;", [ "a", "b" ], [ 1, 1 ] );
        let mut file = vec![ 0xff; 0x1000 ];
        file.extend_from_slice( &dex );

        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join( "base.vdex" );
        std::fs::write( &path, &file ).unwrap();

        let symbols = read_symbols_from_dex_file( &path, &[ 0x1000 ] ).unwrap();
        let in_place = read_symbols_from_dex_file_in_memory( &dex, &[ 0 ] ).unwrap();
        assert_eq!( symbols[ 0 ].name, "Foo.a" );
        assert_eq!( symbols[ 0 ].offset, in_place[ 0 ].offset + 0x1000 );

        assert!( read_symbols_from_dex_file( &path, &[ 0 ] ).is_err() );
        assert!( read_symbols_from_dex_file( &path, &[ 0x100000 ] ).is_err() );
    }
}
