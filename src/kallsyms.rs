use std::io;
use std::path::Path;

use crate::build_id::BuildId;
use crate::elf::parse_build_id_notes;
use crate::utils::read_string_lossy;

pub const KALLSYMS_PATH: &str = "/proc/kallsyms";
pub const PROC_MODULES_PATH: &str = "/proc/modules";
pub const KERNEL_NOTES_PATH: &str = "/sys/kernel/notes";

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KernelSymbol {
    pub address: u64,
    pub kind: char,
    pub name: String,
    pub module: Option< String >
}

impl KernelSymbol {
    /// Whether `nm` classifies the symbol as code.
    pub fn is_function( &self ) -> bool {
        match self.kind {
            't' | 'T' | 'w' | 'W' => true,
            _ => false
        }
    }
}

/// A loaded kernel module, as listed in `/proc/modules`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KernelModule {
    pub name: String,
    pub address: u64,
    pub size: u64
}

/// Parses lines of the form `ffffffffa005c4e4 t symbol_name\t[module]`.
pub fn parse_kallsyms( kallsyms: &str ) -> Vec< KernelSymbol > {
    let mut symbols = Vec::new();
    for line in kallsyms.lines() {
        let mut iter = line.split_whitespace();
        let address = match iter.next().and_then( |address| u64::from_str_radix( address, 16 ).ok() ) {
            Some( address ) => address,
            None => continue
        };

        let kind = match iter.next().and_then( |kind| kind.chars().next() ) {
            Some( kind ) => kind,
            None => continue
        };

        let name = match iter.next() {
            Some( name ) => name,
            None => continue
        };

        let module = iter.next().and_then( |module| {
            if module.len() > 2 && module.starts_with( '[' ) && module.ends_with( ']' ) {
                Some( module[ 1..module.len() - 1 ].to_owned() )
            } else {
                None
            }
        });

        symbols.push( KernelSymbol {
            address,
            kind,
            name: name.to_owned(),
            module
        });
    }

    symbols
}

/// Reads kernel function symbols.
///
/// Returns an empty list when `kptr_restrict` hides the addresses.
pub fn read_kernel_symbols< P: AsRef< Path > >( path: P ) -> io::Result< Vec< KernelSymbol > > {
    let path = path.as_ref();
    let symbols = parse_kallsyms( &read_string_lossy( path )? );
    if !symbols.is_empty() && symbols.iter().all( |symbol| symbol.address == 0 ) {
        warn!( "All symbol addresses in {:?} are zero; is /proc/sys/kernel/kptr_restrict set?", path );
        return Ok( Vec::new() );
    }

    Ok( symbols.into_iter().filter( |symbol| symbol.is_function() ).collect() )
}

/// Parses lines of the form `nf_defrag_ipv6 34768 1 nf_conntrack_ipv6, Live 0xffffffffa0fe5000`.
pub fn parse_proc_modules( modules: &str ) -> Vec< KernelModule > {
    let mut output = Vec::new();
    for line in modules.lines() {
        let fields: Vec< _ > = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }

        let size = match fields[ 1 ].parse() {
            Ok( size ) => size,
            Err( _ ) => continue
        };

        if !fields[ 5 ].starts_with( "0x" ) {
            continue;
        }

        let address = match u64::from_str_radix( &fields[ 5 ][ 2.. ], 16 ) {
            Ok( address ) => address,
            Err( _ ) => continue
        };

        output.push( KernelModule {
            name: fields[ 0 ].to_owned(),
            address,
            size
        });
    }

    if !output.is_empty() && output.iter().all( |module| module.address == 0 ) {
        debug!( "Addresses in /proc/modules are all zero; ignoring kernel modules" );
        return Vec::new();
    }

    output
}

pub fn get_loaded_modules() -> Vec< KernelModule > {
    match read_string_lossy( PROC_MODULES_PATH ) {
        Ok( modules ) => parse_proc_modules( &modules ),
        Err( error ) => {
            debug!( "Failed to read {}: {}", PROC_MODULES_PATH, error );
            Vec::new()
        }
    }
}

/// The address of `_stext`, where the kernel image mapping starts.
pub fn get_kernel_start_address( symbols: &[KernelSymbol] ) -> Option< u64 > {
    symbols.iter()
        .find( |symbol| symbol.name == "_stext" )
        .or_else( || symbols.iter().find( |symbol| symbol.name == "_text" ) )
        .map( |symbol| symbol.address )
        .filter( |&address| address != 0 )
}

pub fn get_kernel_build_id() -> Option< BuildId > {
    let notes = std::fs::read( KERNEL_NOTES_PATH ).ok()?;
    parse_build_id_notes( &notes )
}

pub fn get_module_build_id( module: &str ) -> Option< BuildId > {
    let notes = std::fs::read( format!( "/sys/module/{}/notes/.note.gnu.build-id", module ) ).ok()?;
    parse_build_id_notes( &notes )
}

#[test]
fn test_parse_kallsyms() {
    let kallsyms = "\
ffffffff81000000 T _text
ffffffff81000000 T _stext
ffffffff81001000 t do_one_initcall
ffffffff81002000 d some_data
ffffffff81003000 W weak_function
ffffffffa005c4e4 t sas_ata_init\t[libsas]
broken line
";

    let symbols = parse_kallsyms( kallsyms );
    assert_eq!( symbols.len(), 6 );
    assert_eq!( symbols[ 2 ].name, "do_one_initcall" );
    assert!( symbols[ 2 ].is_function() );
    assert!( !symbols[ 3 ].is_function() );
    assert!( symbols[ 4 ].is_function() );
    assert_eq!( symbols[ 5 ].module.as_ref().map( |module| module.as_str() ), Some( "libsas" ) );
    assert_eq!( symbols[ 5 ].address, 0xffffffffa005c4e4 );
    assert_eq!( get_kernel_start_address( &symbols ), Some( 0xffffffff81000000 ) );
}

#[test]
fn test_parse_proc_modules() {
    let modules = "\
nf_defrag_ipv6 34768 1 nf_conntrack_ipv6, Live 0xffffffffa0fe5000
virtio_net 53248 0 - Live 0xffffffffc0100000 (E)
truncated 100
";

    let modules = parse_proc_modules( modules );
    assert_eq!( modules, vec![
        KernelModule { name: "nf_defrag_ipv6".to_owned(), address: 0xffffffffa0fe5000, size: 34768 },
        KernelModule { name: "virtio_net".to_owned(), address: 0xffffffffc0100000, size: 53248 }
    ]);

    assert!( parse_proc_modules( "foo 100 0 - Live 0x0000000000000000\n" ).is_empty() );
}

#[test]
fn test_restricted_kallsyms_yield_nothing() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join( "kallsyms" );
    std::fs::write( &path, "0000000000000000 T _text\n0000000000000000 t foo\n" ).unwrap();
    assert!( read_kernel_symbols( &path ).unwrap().is_empty() );

    std::fs::write( &path, "ffffffff81000000 T _text\nffffffff81000100 d data\n" ).unwrap();
    assert_eq!( read_kernel_symbols( &path ).unwrap().len(), 1 );
}
