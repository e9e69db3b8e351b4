use std::io;

use regex::Regex;

/// One line of `/proc/<pid>/maps`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub is_read: bool,
    pub is_write: bool,
    pub is_executable: bool,
    pub is_shared: bool,
    pub file_offset: u64,
    pub major: u32,
    pub minor: u32,
    pub inode: u64,
    pub name: String
}

impl Region {
    /// The `prot` bits of an equivalent `mmap` call.
    pub fn protection( &self ) -> u32 {
        let mut prot = 0;
        if self.is_read {
            prot |= libc::PROT_READ as u32;
        }
        if self.is_write {
            prot |= libc::PROT_WRITE as u32;
        }
        if self.is_executable {
            prot |= libc::PROT_EXEC as u32;
        }
        prot
    }

    pub fn flags( &self ) -> u32 {
        if self.is_shared {
            libc::MAP_SHARED as u32
        } else {
            libc::MAP_PRIVATE as u32
        }
    }
}

lazy_static! {
    static ref MAPS_REGEX: Regex = Regex::new( r"^([0-9a-f]+)-([0-9a-f]+) (.)(.)(.)(.) ([0-9a-f]+) ([0-9a-f]+):([0-9a-f]+) (\d+)\s*(.*)$" ).unwrap();
}

fn parse_line( line: &str ) -> Option< Region > {
    let caps = MAPS_REGEX.captures( line )?;
    let hex = |index: usize| u64::from_str_radix( caps.get( index )?.as_str(), 16 ).ok();

    Some( Region {
        start: hex( 1 )?,
        end: hex( 2 )?,
        is_read: &caps[ 3 ] == "r",
        is_write: &caps[ 4 ] == "w",
        is_executable: &caps[ 5 ] == "x",
        is_shared: &caps[ 6 ] == "s",
        file_offset: hex( 7 )?,
        major: hex( 8 )? as u32,
        minor: hex( 9 )? as u32,
        inode: caps[ 10 ].parse().ok()?,
        name: caps[ 11 ].to_owned()
    })
}

/// Parses a maps file, skipping (and logging) lines that don't look like mappings.
pub fn parse( maps: &str ) -> Vec< Region > {
    let mut output = Vec::new();
    for line in maps.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        match parse_line( line ) {
            Some( region ) => output.push( region ),
            None => warn!( "Unparsable maps line: {:?}", line )
        }
    }

    output
}

pub fn read_process_maps( pid: u32 ) -> io::Result< Vec< Region > > {
    let maps = crate::utils::read_string_lossy( format!( "/proc/{}/maps", pid ) )?;
    Ok( parse( &maps ) )
}

#[test]
fn test_parse() {
    let maps = r#"
5d2b8f2000-5d2b8f7000 r-xp 00002000 fd:05 1234                           /system/bin/app_process64
7b4b1a3000-7b4b1b3000 rw-s 00000000 00:05 20714                          /dev/ashmem/dalvik-jit-code-cache (deleted)
7b5c400000-7b5c800000 r-xp 00094000 fd:05 2701                           /data/app/com.example-1/base.apk
7fc7d3e000-7fc7d5f000 rw-p 00000000 00:00 0                              [stack]
garbage
"#;

    let regions = parse( maps );
    assert_eq!( regions.len(), 4 );
    assert_eq!(
        regions[ 0 ],
        Region {
            start: 0x5d2b8f2000,
            end: 0x5d2b8f7000,
            is_read: true,
            is_write: false,
            is_executable: true,
            is_shared: false,
            file_offset: 0x2000,
            major: 0xfd,
            minor: 0x05,
            inode: 1234,
            name: "/system/bin/app_process64".to_owned()
        }
    );

    assert!( regions[ 1 ].is_shared );
    assert_eq!( regions[ 1 ].name, "/dev/ashmem/dalvik-jit-code-cache (deleted)" );
    assert_eq!( regions[ 1 ].flags(), libc::MAP_SHARED as u32 );
    assert_eq!( regions[ 2 ].file_offset, 0x94000 );
    assert_eq!( regions[ 2 ].protection(), (libc::PROT_READ | libc::PROT_EXEC) as u32 );
    assert_eq!( regions[ 3 ].name, "[stack]" );
    assert!( parse( "" ).is_empty() );
}
