use std::fmt;

pub const BUILD_ID_SIZE: usize = 20;

/// A GNU build id, zero-padded to 20 bytes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct BuildId( [u8; BUILD_ID_SIZE] );

impl BuildId {
    pub fn new( bytes: &[u8] ) -> Self {
        let mut data = [0; BUILD_ID_SIZE];
        let length = std::cmp::min( bytes.len(), BUILD_ID_SIZE );
        data[ ..length ].copy_from_slice( &bytes[ ..length ] );
        BuildId( data )
    }

    pub fn from_hex( string: &str ) -> Option< Self > {
        let string = string.trim_start_matches( "0x" );
        if string.len() % 2 != 0 || string.len() > BUILD_ID_SIZE * 2 {
            return None;
        }

        let mut bytes = Vec::with_capacity( string.len() / 2 );
        for index in (0..string.len()).step_by( 2 ) {
            bytes.push( u8::from_str_radix( string.get( index..index + 2 )?, 16 ).ok()? );
        }

        Some( BuildId::new( &bytes ) )
    }

    #[inline]
    pub fn as_bytes( &self ) -> &[u8] {
        &self.0
    }

    pub fn is_empty( &self ) -> bool {
        self.0.iter().all( |&byte| byte == 0 )
    }
}

impl fmt::Display for BuildId {
    fn fmt( &self, fmt: &mut fmt::Formatter ) -> Result< (), fmt::Error > {
        write!( fmt, "0x" )?;
        for byte in self.0.iter() {
            write!( fmt, "{:02x}", byte )?;
        }
        Ok(())
    }
}

impl fmt::Debug for BuildId {
    fn fmt( &self, fmt: &mut fmt::Formatter ) -> Result< (), fmt::Error > {
        write!( fmt, "BuildId({})", self )
    }
}

#[test]
fn test_build_id_hex() {
    let build_id = BuildId::from_hex( "0x0123456789abcdef0123456789abcdef01234567" ).unwrap();
    assert_eq!( build_id.as_bytes()[ 0 ], 0x01 );
    assert_eq!( build_id.to_string(), "0x0123456789abcdef0123456789abcdef01234567" );

    let short = BuildId::from_hex( "abcd" ).unwrap();
    assert_eq!( short.as_bytes()[ ..3 ], [0xab, 0xcd, 0x00] );
    assert!( !short.is_empty() );
    assert!( BuildId::default().is_empty() );
    assert!( BuildId::from_hex( "abc" ).is_none() );
}
