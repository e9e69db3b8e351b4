use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cpp_demangle;

use crate::build_id::BuildId;
use crate::elf::{self, ElfFile};
use crate::kallsyms::{self, KernelSymbol};
use crate::read_apk::{split_embedded_path, ApkInspector};
use crate::read_dex_file::read_symbols_from_dex_file;
use crate::record_file::{
    FileFeature,
    FileSymbol,
    DSO_TYPE_DEX_FILE,
    DSO_TYPE_ELF_FILE,
    DSO_TYPE_KERNEL,
    DSO_TYPE_KERNEL_MODULE,
    DSO_TYPE_UNKNOWN_FILE
};

pub const DEFAULT_KERNEL_MMAP_NAME: &str = "[kernel.kallsyms]";
pub const UNKNOWN_DSO_NAME: &str = "unknown";

/// Directory searched first for unstripped copies of system binaries.
const DEBUG_DIR: &str = "/usr/lib/debug";

/// Prefix of temporary ELF files holding symbols of JIT compiled code.
pub const JIT_SYMFILE_PREFIX: &str = "simpleperf-jit-";

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum DsoType {
    Kernel,
    KernelModule,
    ElfFile,
    DexFile,
    UnknownFile
}

impl DsoType {
    pub fn as_str( &self ) -> &'static str {
        match *self {
            DsoType::Kernel => "dso_kernel",
            DsoType::KernelModule => "dso_kernel_module",
            DsoType::ElfFile => "dso_elf_file",
            DsoType::DexFile => "dso_dex_file",
            DsoType::UnknownFile => "dso_unknown_file"
        }
    }

    pub fn file_type( &self ) -> u32 {
        match *self {
            DsoType::Kernel => DSO_TYPE_KERNEL,
            DsoType::KernelModule => DSO_TYPE_KERNEL_MODULE,
            DsoType::ElfFile => DSO_TYPE_ELF_FILE,
            DsoType::DexFile => DSO_TYPE_DEX_FILE,
            DsoType::UnknownFile => DSO_TYPE_UNKNOWN_FILE
        }
    }

    pub fn from_file_type( value: u32 ) -> DsoType {
        match value {
            DSO_TYPE_KERNEL => DsoType::Kernel,
            DSO_TYPE_KERNEL_MODULE => DsoType::KernelModule,
            DSO_TYPE_ELF_FILE => DsoType::ElfFile,
            DSO_TYPE_DEX_FILE => DsoType::DexFile,
            _ => DsoType::UnknownFile
        }
    }
}

impl fmt::Display for DsoType {
    fn fmt( &self, fmt: &mut fmt::Formatter ) -> fmt::Result {
        fmt.write_str( self.as_str() )
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Symbol {
    pub addr: u64,
    pub len: u64,
    raw_name: String,
    demangled_name: Option< String >
}

impl Symbol {
    pub fn new< S: Into< String > >( name: S, addr: u64, len: u64 ) -> Self {
        Symbol {
            addr,
            len,
            raw_name: name.into(),
            demangled_name: None
        }
    }

    /// The demangled name when demangling is enabled, else the raw one.
    pub fn name( &self ) -> &str {
        self.demangled_name.as_ref().map( |name| name.as_str() ).unwrap_or( &self.raw_name )
    }

    pub fn raw_name( &self ) -> &str {
        &self.raw_name
    }

    #[inline]
    pub fn contains( &self, vaddr: u64 ) -> bool {
        vaddr >= self.addr && vaddr - self.addr < self.len
    }
}

/// Per-session settings consulted while loading symbols.
#[derive(Clone, Debug)]
pub struct DsoConfig {
    pub demangle: bool,
    pub symfs_dir: Option< PathBuf >,
    pub vmlinux: Option< PathBuf >,
    /// Contents of a kallsyms file to use instead of `/proc/kallsyms`.
    pub kallsyms: Option< String >,
    pub build_ids: HashMap< String, BuildId >
}

impl Default for DsoConfig {
    fn default() -> Self {
        DsoConfig {
            demangle: true,
            symfs_dir: None,
            vmlinux: None,
            kallsyms: None,
            build_ids: HashMap::new()
        }
    }
}

impl DsoConfig {
    pub fn set_symfs_dir< P: AsRef< Path > >( &mut self, path: P ) -> io::Result< () > {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err( io::Error::new( io::ErrorKind::NotFound, format!( "symfs directory {:?} doesn't exist", path ) ) );
        }

        self.symfs_dir = Some( path.to_owned() );
        Ok(())
    }

    pub fn set_build_ids< I: IntoIterator< Item = (String, BuildId) > >( &mut self, build_ids: I ) {
        self.build_ids = build_ids.into_iter().collect();
    }

    pub fn expected_build_id( &self, path: &str ) -> Option< BuildId > {
        self.build_ids.get( path ).cloned().filter( |build_id| !build_id.is_empty() )
    }

    /// The file symbols for `path` are read from: `<symfs>/<path>` when it exists, else `path`.
    ///
    /// For embedded paths only the archive part is looked up in the symfs directory.
    pub fn debug_file_path( &self, path: &str ) -> String {
        let symfs_dir = match self.symfs_dir {
            Some( ref symfs_dir ) => symfs_dir,
            None => return path.to_owned()
        };

        let (file, suffix) = match split_embedded_path( path ) {
            Some( (apk, _) ) => (apk, &path[ apk.len().. ]),
            None => (path, "")
        };

        let candidate = symfs_dir.join( file.trim_start_matches( '/' ) );
        if candidate.is_file() {
            format!( "{}{}", candidate.to_string_lossy(), suffix )
        } else {
            path.to_owned()
        }
    }
}

fn demangle_cpp_symbol( symbol: &str ) -> Option< String > {
    cpp_demangle::Symbol::new( symbol ).ok()
        .and_then( |symbol| symbol.demangle( &cpp_demangle::DemangleOptions::new() ).ok() )
}

/// Demangles a C++ name; symbols the dynamic linker renamed with a `__dl_` prefix come out as `[linker]name`.
pub fn demangle( name: &str ) -> String {
    let (prefix, name) = if name.starts_with( "__dl_" ) {
        ("[linker]", &name[ 5.. ])
    } else {
        ("", name)
    };

    let demangled = if name.starts_with( "_Z" ) {
        demangle_cpp_symbol( name )
    } else {
        None
    };

    format!( "{}{}", prefix, demangled.as_ref().map( |name| name.as_str() ).unwrap_or( name ) )
}

/// Infers missing lengths: each symbol extends to the next one, the last one to the top of the address space.
fn fixup_symbol_length( symbols: &mut Vec< Symbol > ) {
    symbols.sort_by_key( |symbol| symbol.addr );
    symbols.dedup_by_key( |symbol| symbol.addr );

    let count = symbols.len();
    for index in 0..count {
        if symbols[ index ].len != 0 {
            continue;
        }

        symbols[ index ].len = if index + 1 < count {
            symbols[ index + 1 ].addr - symbols[ index ].addr
        } else {
            u64::max_value() - symbols[ index ].addr
        };
    }
}

fn module_name( path: &str ) -> &str {
    let name = path.rsplit( '/' ).next().unwrap_or( path );
    name.trim_start_matches( '[' ).trim_end_matches( ']' ).trim_end_matches( ".ko" )
}

fn check_build_id( path: &str, expected: Option< BuildId >, actual: Option< BuildId > ) {
    match (expected, actual) {
        (Some( expected ), Some( actual )) if expected != actual => {
            warn!( "Build id mismatch for {}: expected {}, found {}; symbols may be wrong", path, expected, actual );
        },
        (Some( expected ), None) => {
            debug!( "{} has no build id, expected {}", path, expected );
        },
        _ => {}
    }
}

/// A binary image mapped into a profiled process, with a lazily loaded symbol table.
pub struct Dso {
    kind: DsoType,
    id: u64,
    path: String,
    debug_file_path: String,
    config: Arc< DsoConfig >,
    symbols: Vec< Symbol >,
    is_loaded: bool,
    min_executable_vaddr: Option< (u64, u64) >,
    dex_file_offsets: Vec< u64 >,
    module_base: Option< u64 >,
    has_hits: bool
}

impl fmt::Debug for Dso {
    fn fmt( &self, fmt: &mut fmt::Formatter ) -> fmt::Result {
        fmt.debug_struct( "Dso" )
            .field( "kind", &self.kind )
            .field( "id", &self.id )
            .field( "path", &self.path )
            .field( "is_loaded", &self.is_loaded )
            .field( "symbols.len", &self.symbols.len() )
            .finish()
    }
}

impl Dso {
    pub fn new( kind: DsoType, id: u64, path: &str, config: Arc< DsoConfig > ) -> Self {
        let debug_file_path = config.debug_file_path( path );
        Dso {
            kind,
            id,
            path: path.to_owned(),
            debug_file_path,
            config,
            symbols: Vec::new(),
            is_loaded: false,
            min_executable_vaddr: None,
            dex_file_offsets: Vec::new(),
            module_base: None,
            has_hits: false
        }
    }

    #[inline]
    pub fn kind( &self ) -> DsoType {
        self.kind
    }

    #[inline]
    pub fn id( &self ) -> u64 {
        self.id
    }

    #[inline]
    pub fn path( &self ) -> &str {
        &self.path
    }

    pub fn debug_file_path( &self ) -> &str {
        &self.debug_file_path
    }

    pub fn file_name( &self ) -> &str {
        self.path.rsplit( '/' ).next().unwrap_or( &self.path )
    }

    pub fn has_hits( &self ) -> bool {
        self.has_hits
    }

    pub fn mark_hit( &mut self ) {
        self.has_hits = true;
    }

    /// Whether the code in this image is Java code, either interpreted from dex or JIT compiled.
    pub fn is_for_java_method( &self ) -> bool {
        match self.kind {
            DsoType::DexFile => true,
            DsoType::ElfFile => is_jit_symfile_path( &self.path ) || is_jit_cache_path( &self.path ),
            _ => false
        }
    }

    pub fn dex_file_offsets( &self ) -> &[u64] {
        &self.dex_file_offsets
    }

    /// Registers a dex file found at `offset` inside this file; symbols are reloaded on next lookup.
    pub fn add_dex_file_offset( &mut self, offset: u64 ) {
        if self.dex_file_offsets.contains( &offset ) {
            return;
        }

        self.dex_file_offsets.push( offset );
        if self.is_loaded {
            self.is_loaded = false;
            self.symbols.clear();
        }
    }

    pub fn set_module_base( &mut self, address: u64 ) {
        self.module_base = Some( address );
    }

    /// Replaces the symbol table, inferring missing lengths.
    pub fn set_symbols( &mut self, mut symbols: Vec< Symbol > ) {
        fixup_symbol_length( &mut symbols );
        self.symbols = symbols;
        self.is_loaded = true;
    }

    /// What a report needs to symbolize this image without having the file at hand.
    pub fn file_feature( &mut self ) -> FileFeature {
        let (min_vaddr, _) = self.min_executable_vaddr();
        let symbols = if self.kind == DsoType::DexFile {
            Vec::new()
        } else {
            self.symbols().iter().map( |symbol| FileSymbol {
                vaddr: symbol.addr,
                len: symbol.len.min( u32::max_value() as u64 ) as u32,
                name: symbol.name().to_owned()
            }).collect()
        };

        FileFeature {
            path: self.path.clone(),
            dso_type: self.kind.file_type(),
            min_vaddr,
            symbols,
            dex_file_offsets: self.dex_file_offsets.clone()
        }
    }

    pub fn symbols( &mut self ) -> &[Symbol] {
        self.load_symbols();
        &self.symbols
    }

    pub fn is_loaded( &self ) -> bool {
        self.is_loaded
    }

    /// The virtual address and file offset of the first executable segment; zero for non-ELF images.
    pub fn min_executable_vaddr( &mut self ) -> (u64, u64) {
        if self.kind != DsoType::ElfFile {
            return (0, 0);
        }

        if let Some( value ) = self.min_executable_vaddr {
            return value;
        }

        let value = match open_elf( &self.debug_file_path ).and_then( |elf| elf::read_min_executable_vaddr( elf.bytes() ) ) {
            Ok( Some( value ) ) => value,
            Ok( None ) => (0, 0),
            Err( error ) => {
                debug!( "Failed to read the executable segment of {}: {}", self.debug_file_path, error );
                (0, 0)
            }
        };

        self.min_executable_vaddr = Some( value );
        value
    }

    /// Translates an instruction pointer inside a mapping of this image into an address symbols are keyed by.
    pub fn ip_to_vaddr_in_file( &mut self, ip: u64, map_start: u64, map_page_offset: u64 ) -> u64 {
        match self.kind {
            DsoType::Kernel | DsoType::KernelModule => ip,
            // Symbols of JIT compiled code carry their runtime addresses.
            DsoType::ElfFile if is_jit_symfile_path( &self.path ) => ip,
            DsoType::ElfFile => {
                let (min_vaddr, file_offset) = self.min_executable_vaddr();
                ip.wrapping_sub( map_start ).wrapping_add( map_page_offset ).wrapping_sub( file_offset ).wrapping_add( min_vaddr )
            },
            // Call chain entries can be resolved against a map that doesn't contain them.
            DsoType::DexFile | DsoType::UnknownFile => ip.wrapping_sub( map_start ).wrapping_add( map_page_offset )
        }
    }

    pub fn find_symbol( &mut self, vaddr_in_file: u64 ) -> Option< &Symbol > {
        self.load_symbols();
        let index = match self.symbols.binary_search_by_key( &vaddr_in_file, |symbol| symbol.addr ) {
            Ok( index ) => index,
            Err( 0 ) => return None,
            Err( index ) => index - 1
        };

        let symbol = &self.symbols[ index ];
        if symbol.contains( vaddr_in_file ) {
            Some( symbol )
        } else {
            None
        }
    }

    pub fn load_symbols( &mut self ) {
        if self.is_loaded {
            return;
        }

        self.is_loaded = true;
        let result = match self.kind {
            DsoType::Kernel => self.load_kernel(),
            DsoType::KernelModule => self.load_kernel_module(),
            DsoType::ElfFile => self.load_elf_file(),
            DsoType::DexFile => self.load_dex_file(),
            DsoType::UnknownFile => Ok( Vec::new() )
        };

        match result {
            Ok( mut symbols ) => {
                if self.config.demangle {
                    for symbol in &mut symbols {
                        let demangled = demangle( &symbol.raw_name );
                        if demangled != symbol.raw_name {
                            symbol.demangled_name = Some( demangled );
                        }
                    }
                }

                fixup_symbol_length( &mut symbols );
                debug!( "Loaded {} symbols from {}", symbols.len(), self.path );
                self.symbols = symbols;
            },
            Err( error ) => {
                debug!( "Failed to load symbols of {} ({}): {}", self.path, self.kind, error );
                self.symbols.clear();
            }
        }
    }

    fn load_kernel( &self ) -> io::Result< Vec< Symbol > > {
        let expected_build_id = self.config.expected_build_id( &self.path );
        if let Some( ref vmlinux ) = self.config.vmlinux {
            let elf = ElfFile::open( vmlinux )?;
            check_build_id( &vmlinux.to_string_lossy(), expected_build_id, elf::read_build_id( elf.bytes() )? );
            return read_elf_symbols( &elf );
        }

        let kernel_symbols = if let Some( ref kallsyms ) = self.config.kallsyms {
            let symbols = kallsyms::parse_kallsyms( kallsyms );
            if !symbols.is_empty() && symbols.iter().all( |symbol| symbol.address == 0 ) {
                warn!( "All symbol addresses in the supplied kallsyms are zero" );
                return Ok( Vec::new() );
            }
            symbols.into_iter().filter( KernelSymbol::is_function ).collect()
        } else {
            if let Some( expected ) = expected_build_id {
                let actual = kallsyms::get_kernel_build_id();
                if actual.as_ref().map( |actual| *actual != expected ).unwrap_or( false ) {
                    warn!( "The running kernel doesn't match the recorded one (build id {}), not reading {}", expected, kallsyms::KALLSYMS_PATH );
                    return Ok( Vec::new() );
                }
            }

            kallsyms::read_kernel_symbols( kallsyms::KALLSYMS_PATH )?
        };

        Ok( kernel_symbols.into_iter()
            .filter( |symbol| symbol.module.is_none() )
            .map( |symbol| Symbol::new( symbol.name, symbol.address, 0 ) )
            .collect() )
    }

    fn load_kernel_module( &self ) -> io::Result< Vec< Symbol > > {
        let name = module_name( &self.path );
        let kernel_symbols = match self.config.kallsyms {
            Some( ref kallsyms ) => kallsyms::parse_kallsyms( kallsyms ).into_iter().filter( KernelSymbol::is_function ).collect(),
            None if self.config.symfs_dir.is_none() => kallsyms::read_kernel_symbols( kallsyms::KALLSYMS_PATH ).unwrap_or_default(),
            None => Vec::new()
        };

        let symbols: Vec< _ > = kernel_symbols.into_iter()
            .filter( |symbol| symbol.address != 0 && symbol.module.as_ref().map( |module| module == name ).unwrap_or( false ) )
            .map( |symbol| Symbol::new( symbol.name, symbol.address, 0 ) )
            .collect();

        if !symbols.is_empty() {
            return Ok( symbols );
        }

        // Without usable kallsyms, relocate the module's own text symbols by its load address.
        let base = match self.module_base {
            Some( base ) => base,
            None => return Ok( Vec::new() )
        };

        let elf = ElfFile::open( &self.debug_file_path )?;
        check_build_id( &self.debug_file_path, self.config.expected_build_id( &self.path ), elf::read_build_id( elf.bytes() )? );
        let mut symbols = read_elf_symbols( &elf )?;
        for symbol in &mut symbols {
            symbol.addr += base;
        }

        Ok( symbols )
    }

    fn load_elf_file( &self ) -> io::Result< Vec< Symbol > > {
        let mut candidates = Vec::new();
        if self.config.symfs_dir.is_none() && self.path.starts_with( '/' ) {
            candidates.push( format!( "{}{}", DEBUG_DIR, self.path ) );
        }
        candidates.push( self.debug_file_path.clone() );

        let mut last_error = None;
        for candidate in candidates {
            if split_embedded_path( &candidate ).is_none() && !Path::new( &candidate ).is_file() {
                continue;
            }

            let elf = match open_elf( &candidate ) {
                Ok( elf ) => elf,
                Err( error ) => {
                    last_error = Some( error );
                    continue;
                }
            };

            check_build_id( &candidate, self.config.expected_build_id( &self.path ), elf::read_build_id( elf.bytes() )? );
            return read_elf_symbols( &elf );
        }

        Err( last_error.unwrap_or_else( || io::Error::new( io::ErrorKind::NotFound, format!( "{} not found", self.debug_file_path ) ) ) )
    }

    fn load_dex_file( &self ) -> io::Result< Vec< Symbol > > {
        if self.dex_file_offsets.is_empty() {
            return Ok( Vec::new() );
        }

        let symbols = read_symbols_from_dex_file( &self.debug_file_path, &self.dex_file_offsets )?;
        Ok( symbols.into_iter().map( |symbol| Symbol::new( symbol.name, symbol.offset, symbol.len ) ).collect() )
    }
}

pub fn is_jit_symfile_path( path: &str ) -> bool {
    path.rsplit( '/' ).next().map( |name| name.starts_with( JIT_SYMFILE_PREFIX ) ).unwrap_or( false )
}

/// Anonymous mappings holding the code of the ART JIT.
pub fn is_jit_cache_path( path: &str ) -> bool {
    path.contains( "jit-cache" ) || path.contains( "jit-zygote-cache" ) || path.contains( "dalvik-jit-code-cache" )
}

fn open_elf( path: &str ) -> io::Result< ElfFile > {
    if let Some( (apk_path, entry_name) ) = split_embedded_path( path ) {
        let embedded = ApkInspector::new().find_elf_by_name( apk_path, entry_name ).ok_or_else( || {
            io::Error::new( io::ErrorKind::NotFound, format!( "no stored entry {} in {}", entry_name, apk_path ) )
        })?;

        return ElfFile::open_at( apk_path, embedded.entry_offset, Some( embedded.entry_size ) );
    }

    ElfFile::open( path )
}

fn read_elf_symbols( elf: &ElfFile ) -> io::Result< Vec< Symbol > > {
    let mut symbols = Vec::new();
    elf::read_symbols( elf.bytes(), |symbol| {
        symbols.push( Symbol::new( symbol.name, symbol.vaddr, symbol.len ) );
    })?;

    Ok( symbols )
}

/// Reads the build id of the file behind `path`, looking through symfs and into archives.
pub fn read_build_id_of_file( config: &DsoConfig, path: &str ) -> Option< BuildId > {
    let debug_file_path = config.debug_file_path( path );
    let elf = open_elf( &debug_file_path ).ok()?;
    elf::read_build_id( elf.bytes() ).ok()?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_dex_file::tests::build_dex;

    fn config() -> Arc< DsoConfig > {
        Arc::new( DsoConfig::default() )
    }

    #[test]
    fn test_find_symbol_after_length_fixup() {
        let mut dso = Dso::new( DsoType::ElfFile, 0, "/system/lib64/libfoo.so", config() );
        dso.set_symbols( vec![
            Symbol::new( "b", 0x1010, 0 ),
            Symbol::new( "a", 0x1000, 0x10 )
        ]);

        assert_eq!( dso.find_symbol( 0x1005 ).map( |symbol| symbol.name() ), Some( "a" ) );
        assert_eq!( dso.find_symbol( 0x1010 ).map( |symbol| symbol.name() ), Some( "b" ) );
        assert_eq!( dso.find_symbol( 0x1020 ).map( |symbol| symbol.name() ), Some( "b" ) );
        assert_eq!( dso.find_symbol( 0x0fff ), None );
        assert_eq!( dso.find_symbol( u64::max_value() - 1 ).map( |symbol| symbol.name() ), Some( "b" ) );
    }

    #[test]
    fn test_gap_between_symbols() {
        let mut dso = Dso::new( DsoType::ElfFile, 0, "libfoo.so", config() );
        dso.set_symbols( vec![
            Symbol::new( "a", 0x1000, 0x8 ),
            Symbol::new( "b", 0x1010, 0x8 )
        ]);

        assert_eq!( dso.find_symbol( 0x100c ), None );
        assert_eq!( dso.find_symbol( 0x1017 ).map( |symbol| symbol.name() ), Some( "b" ) );
        assert_eq!( dso.find_symbol( 0x1018 ), None );
    }

    #[test]
    fn test_demangle() {
        assert_eq!( demangle( "_Z3foov" ), "foo()" );
        assert_eq!( demangle( "__dl__Z3foov" ), "[linker]foo()" );
        assert_eq!( demangle( "__dl_strlen" ), "[linker]strlen" );
        assert_eq!( demangle( "main" ), "main" );
    }

    #[test]
    fn test_kernel_symbols_from_kallsyms() {
        let mut config = DsoConfig::default();
        config.kallsyms = Some( "\
ffffffff81000000 T _text
ffffffff81000100 t do_work
ffffffff81000200 d some_data
ffffffffa0000000 t module_function\t[virtio_net]
ffffffffa0000100 t other_module_function\t[other]
".to_owned() );
        let config = Arc::new( config );

        let mut kernel = Dso::new( DsoType::Kernel, 0, DEFAULT_KERNEL_MMAP_NAME, config.clone() );
        assert_eq!( kernel.ip_to_vaddr_in_file( 0xffffffff81000150, 0xffffffff81000000, 0 ), 0xffffffff81000150 );
        assert_eq!( kernel.find_symbol( 0xffffffff81000150 ).map( |symbol| symbol.name() ), Some( "do_work" ) );
        assert_eq!( kernel.symbols().len(), 2 );

        let mut module = Dso::new( DsoType::KernelModule, 1, "[virtio_net]", config );
        assert_eq!( module.find_symbol( 0xffffffffa0000010 ).map( |symbol| symbol.name() ), Some( "module_function" ) );
        assert_eq!( module.symbols().len(), 1 );
    }

    #[test]
    fn test_restricted_kallsyms_give_no_symbols() {
        let mut config = DsoConfig::default();
        config.kallsyms = Some( "0000000000000000 T _text\n0000000000000000 t do_work\n".to_owned() );
        let mut kernel = Dso::new( DsoType::Kernel, 0, DEFAULT_KERNEL_MMAP_NAME, Arc::new( config ) );
        assert_eq!( kernel.find_symbol( 0 ), None );
        assert!( kernel.is_loaded() );
    }

    #[test]
    fn test_dex_file_symbols() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join( "base.vdex" );
        let mut contents = vec![ 0; 0x100 ];
        contents.extend_from_slice( &build_dex( "Lcom/example/Main;", [ "onCreate", "run" ], [ 4, 8 ] ) );
        std::fs::write( &path, &contents ).unwrap();

        let mut dso = Dso::new( DsoType::DexFile, 0, path.to_str().unwrap(), config() );
        assert!( dso.symbols().is_empty() );
        assert!( dso.is_for_java_method() );

        dso.add_dex_file_offset( 0x100 );
        let names: Vec< _ > = dso.symbols().iter().map( |symbol| symbol.name().to_owned() ).collect();
        assert_eq!( names, vec![ "com.example.Main.onCreate".to_owned(), "com.example.Main.run".to_owned() ] );

        let run = dso.symbols()[ 1 ].clone();
        assert_eq!( run.len, 16 );
        assert_eq!( dso.ip_to_vaddr_in_file( 0x7000_0000 + run.addr, 0x7000_0000, 0 ), run.addr );
        assert_eq!( dso.find_symbol( run.addr + 2 ).map( |symbol| symbol.name() ), Some( "com.example.Main.run" ) );
    }

    #[test]
    fn test_elf_symbols_of_own_executable() {
        let path = std::env::current_exe().unwrap();
        let path = path.to_str().unwrap();

        let elf = ElfFile::open( path ).unwrap();
        let mut sized = None;
        elf::read_symbols( elf.bytes(), |symbol| {
            if sized.is_none() && symbol.len > 4 {
                sized = Some( symbol );
            }
        }).unwrap();
        let sized = sized.unwrap();

        // A bogus expected build id only produces a warning.
        let mut config = DsoConfig::default();
        config.build_ids.insert( path.to_owned(), BuildId::new( &[ 0xab; 20 ] ) );
        let mut dso = Dso::new( DsoType::ElfFile, 0, path, Arc::new( config ) );
        let symbol = dso.find_symbol( sized.vaddr + 1 ).cloned().unwrap();
        assert_eq!( symbol.addr, sized.vaddr );
        assert!( !dso.is_for_java_method() );
    }

    #[test]
    fn test_missing_file_degrades_to_no_symbols() {
        let mut dso = Dso::new( DsoType::ElfFile, 0, "/no/such/library.so", config() );
        assert_eq!( dso.find_symbol( 0x1000 ), None );
        assert_eq!( dso.min_executable_vaddr(), (0, 0) );
    }

    #[test]
    fn test_ip_below_the_map_start_wraps() {
        let mut unknown = Dso::new( DsoType::UnknownFile, 0, "[unknown]", config() );
        assert_eq!( unknown.ip_to_vaddr_in_file( 0x1000, 0x2000, 0 ), 0u64.wrapping_sub( 0x1000 ) );
        assert_eq!( unknown.ip_to_vaddr_in_file( 0x1000, 0x2000, 0x1000 ), 0 );
        assert_eq!( unknown.find_symbol( 0u64.wrapping_sub( 0x1000 ) ), None );

        let mut missing = Dso::new( DsoType::ElfFile, 0, "/no/such/library.so", config() );
        assert_eq!( missing.ip_to_vaddr_in_file( 0x10, 0x7000, 0 ), 0u64.wrapping_sub( 0x6ff0 ) );
    }

    #[test]
    fn test_symfs_lookup() {
        let directory = tempfile::tempdir().unwrap();
        std::fs::create_dir_all( directory.path().join( "system/lib64" ) ).unwrap();
        std::fs::write( directory.path().join( "system/lib64/libc.so" ), b"" ).unwrap();

        let mut config = DsoConfig::default();
        assert!( config.set_symfs_dir( directory.path().join( "missing" ) ).is_err() );
        config.set_symfs_dir( directory.path() ).unwrap();

        let expected = directory.path().join( "system/lib64/libc.so" );
        assert_eq!( config.debug_file_path( "/system/lib64/libc.so" ), expected.to_str().unwrap() );
        assert_eq!( config.debug_file_path( "/system/lib64/libm.so" ), "/system/lib64/libm.so" );
        assert_eq!( module_name( "/lib/modules/virtio_net.ko" ), "virtio_net" );
        assert!( is_jit_symfile_path( "/tmp/simpleperf-jit-1234" ) );
        assert!( is_jit_cache_path( "[anon:dalvik-jit-code-cache]" ) );
        assert!( is_jit_cache_path( "/memfd:jit-zygote-cache (deleted)" ) );
        assert!( !is_jit_cache_path( "/system/lib64/libart.so" ) );
    }
}
