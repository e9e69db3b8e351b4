use std::fs::File;
use std::io;
use std::ops::Range;
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt};
use goblin::elf::header::EM_ARM;
use goblin::elf::note::NT_GNU_BUILD_ID;
use goblin::elf::program_header::{PF_X, PT_LOAD};
use goblin::elf::section_header::SHF_EXECINSTR;
use goblin::elf::sym::{STT_FUNC, STT_NOTYPE};
use goblin::elf::Elf;
use memmap::Mmap;

use crate::build_id::BuildId;
use crate::utils::{align, invalid_data};

/// A memory mapped ELF image, possibly embedded at an offset inside a bigger file.
pub struct ElfFile {
    mmap: Mmap,
    range: Range< usize >
}

impl ElfFile {
    pub fn open< P: AsRef< Path > >( path: P ) -> io::Result< Self > {
        ElfFile::open_at( path, 0, None )
    }

    /// Maps `size` bytes at `offset` of the file, or everything past `offset` when `size` is `None`.
    pub fn open_at< P: AsRef< Path > >( path: P, offset: u64, size: Option< u64 > ) -> io::Result< Self > {
        let fp = File::open( path.as_ref() )?;
        let mmap = unsafe { Mmap::map( &fp )? };
        let start = offset as usize;
        let end = match size {
            Some( size ) => start + size as usize,
            None => mmap.len()
        };

        if start > end || end > mmap.len() {
            return Err( invalid_data( format!( "ELF range {}..{} exceeds the file {:?}", start, end, path.as_ref() ) ) );
        }

        let elf = ElfFile { mmap, range: start..end };
        parse( elf.bytes() )?;
        Ok( elf )
    }

    #[inline]
    pub fn bytes( &self ) -> &[u8] {
        &self.mmap[ self.range.clone() ]
    }
}

fn parse( bytes: &[u8] ) -> io::Result< Elf > {
    Elf::parse( bytes ).map_err( |err| invalid_data( format!( "not a valid ELF file: {}", err ) ) )
}

/// A code symbol; `vaddr` is the address the linker assigned.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ElfSymbol {
    pub name: String,
    pub vaddr: u64,
    pub len: u64
}

/// Calls `callback` for every code symbol of the ELF image.
///
/// Prefers the full `.symtab` and falls back to `.dynsym` for stripped binaries.
pub fn read_symbols< F: FnMut( ElfSymbol ) >( bytes: &[u8], mut callback: F ) -> io::Result< () > {
    let elf = parse( bytes )?;
    let is_arm = elf.header.e_machine == EM_ARM;
    let is_in_text_section = |index: usize| {
        elf.section_headers.get( index ).map( |header| header.sh_flags & SHF_EXECINSTR as u64 != 0 ).unwrap_or( false )
    };

    let (symtab, strtab) = if elf.syms.len() != 0 {
        (&elf.syms, &elf.strtab)
    } else {
        (&elf.dynsyms, &elf.dynstrtab)
    };

    for sym in symtab.iter() {
        let kind = sym.st_type();
        let is_label = kind == STT_NOTYPE && is_in_text_section( sym.st_shndx );
        if (kind != STT_FUNC && !is_label) || sym.st_value == 0 {
            continue;
        }

        let name = match strtab.get_at( sym.st_name ) {
            Some( name ) if !name.is_empty() => name,
            _ => continue
        };

        // ARM mapping symbols mark code/data transitions and aren't real functions.
        if is_arm && (name.starts_with( "$a" ) || name.starts_with( "$t" ) || name.starts_with( "$d" )) {
            continue;
        }

        let mut vaddr = sym.st_value;
        if is_arm {
            // The lowest bit selects Thumb mode.
            vaddr &= !1;
        }

        callback( ElfSymbol {
            name: name.to_owned(),
            vaddr,
            len: sym.st_size
        });
    }

    Ok(())
}

/// Finds the addresses of the given exported symbols.
pub fn read_dynamic_symbol_addresses( bytes: &[u8], names: &[&str] ) -> io::Result< Vec< Option< u64 > > > {
    let elf = parse( bytes )?;
    let mut output = vec![ None; names.len() ];
    for sym in elf.dynsyms.iter() {
        if sym.st_value == 0 {
            continue;
        }

        if let Some( name ) = elf.dynstrtab.get_at( sym.st_name ) {
            if let Some( index ) = names.iter().position( |&wanted| wanted == name ) {
                output[ index ] = Some( sym.st_value );
            }
        }
    }

    Ok( output )
}

/// The GNU build id note of the image, if it has one.
pub fn read_build_id( bytes: &[u8] ) -> io::Result< Option< BuildId > > {
    let elf = parse( bytes )?;
    let notes = elf.iter_note_headers( bytes ).into_iter().chain( elf.iter_note_sections( bytes, None ) );
    for iter in notes {
        for note in iter {
            let note = match note {
                Ok( note ) => note,
                Err( _ ) => break
            };

            if note.n_type == NT_GNU_BUILD_ID && note.name == "GNU" {
                return Ok( Some( BuildId::new( note.desc ) ) );
            }
        }
    }

    Ok( None )
}

/// Parses a raw note section, as exposed by `/sys/kernel/notes`.
pub fn parse_build_id_notes( notes: &[u8] ) -> Option< BuildId > {
    let mut cur = io::Cursor::new( notes );
    while (cur.position() as usize) + 12 <= notes.len() {
        let name_size = cur.read_u32::< NativeEndian >().ok()? as usize;
        let desc_size = cur.read_u32::< NativeEndian >().ok()? as usize;
        let kind = cur.read_u32::< NativeEndian >().ok()?;

        let name_start = cur.position() as usize;
        let desc_start = name_start + align( name_size, 4 );
        let desc_end = desc_start + desc_size;
        if desc_end > notes.len() {
            return None;
        }

        let name = &notes[ name_start..name_start + name_size ];
        if kind == NT_GNU_BUILD_ID && name.starts_with( b"GNU" ) {
            return Some( BuildId::new( &notes[ desc_start..desc_end ] ) );
        }

        cur.set_position( (desc_start + align( desc_size, 4 )) as u64 );
    }

    None
}

/// The virtual address and file offset of the first executable segment.
///
/// Needed to translate between file offsets (as seen in mmaps) and symbol addresses.
pub fn read_min_executable_vaddr( bytes: &[u8] ) -> io::Result< Option< (u64, u64) > > {
    let elf = parse( bytes )?;
    let segment = elf.program_headers.iter()
        .find( |header| header.p_type == PT_LOAD && header.p_flags & PF_X != 0 )
        .map( |header| (header.p_vaddr, header.p_offset) );

    Ok( segment )
}

pub fn is_64_bit( bytes: &[u8] ) -> io::Result< bool > {
    Ok( parse( bytes )?.is_64 )
}

#[test]
fn test_parse_build_id_notes() {
    let mut notes = Vec::new();
    // A note of another kind which must be skipped.
    notes.extend_from_slice( &5_u32.to_ne_bytes() );
    notes.extend_from_slice( &2_u32.to_ne_bytes() );
    notes.extend_from_slice( &1_u32.to_ne_bytes() );
    notes.extend_from_slice( b"Linux\0\0\0" );
    notes.extend_from_slice( &[1, 2, 0, 0] );

    notes.extend_from_slice( &4_u32.to_ne_bytes() );
    notes.extend_from_slice( &20_u32.to_ne_bytes() );
    notes.extend_from_slice( &NT_GNU_BUILD_ID.to_ne_bytes() );
    notes.extend_from_slice( b"GNU\0" );
    notes.extend_from_slice( &[0xcd; 20] );

    assert_eq!( parse_build_id_notes( &notes ), Some( BuildId::new( &[0xcd; 20] ) ) );
    assert_eq!( parse_build_id_notes( &notes[ ..20 ] ), None );
}

#[test]
fn test_read_own_executable() {
    let path = std::env::current_exe().unwrap();
    let elf = ElfFile::open( &path ).unwrap();

    let mut count = 0;
    read_symbols( elf.bytes(), |symbol| {
        assert!( !symbol.name.is_empty() );
        count += 1;
    }).unwrap();
    assert!( count > 0 );

    assert!( read_min_executable_vaddr( elf.bytes() ).unwrap().is_some() );
    assert_eq!( read_dynamic_symbol_addresses( elf.bytes(), &[ "__no_such_symbol__" ] ).unwrap(), vec![ None ] );
}

#[test]
fn test_not_an_elf() {
    assert!( read_symbols( b"definitely not an ELF file", |_| {} ).is_err() );
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join( "file" );
    std::fs::write( &path, b"\x7fELF" ).unwrap();
    assert!( ElfFile::open( &path ).is_err() );
}
