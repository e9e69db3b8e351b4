use std::collections::HashMap;
use std::fs::File;
use std::io;

use zip::{CompressionMethod, ZipArchive};

/// Separates the archive from the entry in paths like `base.apk!/lib/arm64/libfoo.so`.
pub const EMBEDDED_PATH_SEPARATOR: &str = "!/";

/// A stored (uncompressed) zip entry, which the runtime can map straight from the archive.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EmbeddedElf {
    pub apk_path: String,
    pub entry_name: String,
    pub entry_offset: u64,
    pub entry_size: u64
}

impl EmbeddedElf {
    pub fn path( &self ) -> String {
        format!( "{}{}{}", self.apk_path, EMBEDDED_PATH_SEPARATOR, self.entry_name )
    }

    pub fn contains_offset( &self, offset: u64 ) -> bool {
        offset >= self.entry_offset && offset < self.entry_offset + self.entry_size
    }
}

pub fn split_embedded_path( path: &str ) -> Option< (&str, &str) > {
    let index = path.find( EMBEDDED_PATH_SEPARATOR )?;
    Some( (&path[ ..index ], &path[ index + EMBEDDED_PATH_SEPARATOR.len().. ]) )
}

pub fn is_apk_path( path: &str ) -> bool {
    path.ends_with( ".apk" ) || path.ends_with( ".zip" )
}

fn open_archive( apk_path: &str ) -> io::Result< ZipArchive< File > > {
    let fp = File::open( apk_path )?;
    ZipArchive::new( fp ).map_err( |err| io::Error::new( io::ErrorKind::InvalidData, format!( "{}: {}", apk_path, err ) ) )
}

fn scan< F: FnMut( &EmbeddedElf ) -> bool >( apk_path: &str, mut predicate: F ) -> io::Result< Option< EmbeddedElf > > {
    let mut archive = open_archive( apk_path )?;
    for index in 0..archive.len() {
        let entry = match archive.by_index( index ) {
            Ok( entry ) => entry,
            Err( err ) => {
                debug!( "Failed to read entry #{} of {}: {}", index, apk_path, err );
                continue;
            }
        };

        let elf = EmbeddedElf {
            apk_path: apk_path.to_owned(),
            entry_name: entry.name().to_owned(),
            entry_offset: entry.data_start(),
            entry_size: entry.compressed_size()
        };

        if !predicate( &elf ) {
            continue;
        }

        if entry.compression() != CompressionMethod::Stored {
            warn!( "{} is compressed inside {}, so it can't be mapped directly", elf.entry_name, apk_path );
            return Ok( None );
        }

        return Ok( Some( elf ) );
    }

    Ok( None )
}

/// Finds embedded shared libraries by name or by a file offset seen in an mmap.
///
/// Lookups are cached per archive, misses included.
#[derive(Default)]
pub struct ApkInspector {
    by_offset: HashMap< (String, u64), Option< EmbeddedElf > >,
    by_name: HashMap< (String, String), Option< EmbeddedElf > >
}

impl ApkInspector {
    pub fn new() -> Self {
        ApkInspector::default()
    }

    pub fn find_elf_by_offset( &mut self, apk_path: &str, file_offset: u64 ) -> Option< EmbeddedElf > {
        if !is_apk_path( apk_path ) {
            return None;
        }

        if let Some( cached ) = self.by_offset.get( &(apk_path.to_owned(), file_offset) ) {
            return cached.clone();
        }

        let result = scan( apk_path, |elf| elf.entry_name.ends_with( ".so" ) && elf.contains_offset( file_offset ) )
            .unwrap_or_else( |err| {
                debug!( "Failed to inspect {}: {}", apk_path, err );
                None
            });

        if let Some( ref elf ) = result {
            self.by_name.insert( (apk_path.to_owned(), elf.entry_name.clone()), result.clone() );
        }

        self.by_offset.insert( (apk_path.to_owned(), file_offset), result.clone() );
        result
    }

    pub fn find_elf_by_name( &mut self, apk_path: &str, entry_name: &str ) -> Option< EmbeddedElf > {
        let key = (apk_path.to_owned(), entry_name.to_owned());
        if let Some( cached ) = self.by_name.get( &key ) {
            return cached.clone();
        }

        let result = scan( apk_path, |elf| elf.entry_name == entry_name ).unwrap_or_else( |err| {
            debug!( "Failed to inspect {}: {}", apk_path, err );
            None
        });

        self.by_name.insert( key, result.clone() );
        result
    }
}
