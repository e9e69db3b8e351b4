use std::collections::HashMap;
use std::io;

use byteorder::{ByteOrder, NativeEndian};
use perf_event_open::sys::*;

use crate::event_type::EventType;
use crate::utils::HexValue;

pub const DEFAULT_SAMPLE_FREQ: u64 = 4000;

pub fn create_default_perf_event_attr( event_type: &EventType ) -> PerfEventAttr {
    let mut attr = PerfEventAttr::default();
    attr.kind = event_type.kind;
    attr.config = event_type.config;
    attr.set_flag( PERF_ATTR_FLAG_DISABLED, true );
    attr.read_format = PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING | PERF_FORMAT_ID;
    attr.sample_type |=
        PERF_SAMPLE_IP |
        PERF_SAMPLE_TID |
        PERF_SAMPLE_TIME |
        PERF_SAMPLE_PERIOD |
        PERF_SAMPLE_CPU |
        PERF_SAMPLE_ID;

    if attr.kind == PERF_TYPE_TRACEPOINT {
        attr.sample_type |= PERF_SAMPLE_RAW;
        attr.sample_period_or_freq = 1;
    } else {
        attr.set_flag( PERF_ATTR_FLAG_FREQ, true );
        attr.sample_period_or_freq = DEFAULT_SAMPLE_FREQ;
    }

    attr.set_flag( PERF_ATTR_FLAG_MMAP, true );
    attr.set_flag( PERF_ATTR_FLAG_COMM, true );
    // Lets us recover the attr of non-sample records when several attrs share one buffer.
    attr.set_flag( PERF_ATTR_FLAG_SAMPLE_ID_ALL, true );
    attr
}

#[inline]
pub fn is_timestamp_supported( attr: &PerfEventAttr ) -> bool {
    attr.has_flag( PERF_ATTR_FLAG_SAMPLE_ID_ALL ) && attr.sample_type & PERF_SAMPLE_TIME != 0
}

#[inline]
pub fn is_cpu_supported( attr: &PerfEventAttr ) -> bool {
    attr.has_flag( PERF_ATTR_FLAG_SAMPLE_ID_ALL ) && attr.sample_type & PERF_SAMPLE_CPU != 0
}

fn count_u64_fields( flags: u64 ) -> usize {
    flags.count_ones() as usize * 8
}

/// Where the event id lives in records produced by any of `attrs`.
///
/// Returns `(position in SAMPLE records, counted from the start of the record;
/// position in other records, counted back from the end of the record)`.
pub fn get_common_event_id_positions_for_attrs( attrs: &[PerfEventAttr] ) -> io::Result< (usize, usize) > {
    let first = match attrs.first() {
        Some( attr ) => attr,
        None => return Err( io::Error::new( io::ErrorKind::InvalidInput, "no attrs to compute event id positions for" ) )
    };

    let identifier_enabled = attrs.iter().all( |attr| attr.sample_type & PERF_SAMPLE_IDENTIFIER != 0 );
    let id_enabled = attrs.iter().all( |attr| attr.sample_type & PERF_SAMPLE_ID != 0 );

    let flags_before_id_mask = PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_ADDR;
    let flags_before_id = first.sample_type & flags_before_id_mask;
    let flags_before_id_are_the_same = attrs.iter().all( |attr| attr.sample_type & flags_before_id_mask == flags_before_id );

    let position_in_sample_records = if identifier_enabled {
        8
    } else if id_enabled && flags_before_id_are_the_same {
        8 + count_u64_fields( flags_before_id )
    } else {
        return Err( io::Error::new( io::ErrorKind::InvalidData, "the attrs don't have a common event id position in sample records" ) );
    };

    if !attrs.iter().all( |attr| attr.has_flag( PERF_ATTR_FLAG_SAMPLE_ID_ALL ) ) {
        return Err( io::Error::new( io::ErrorKind::InvalidData, "some attrs don't enable sample_id_all, so non-sample records can't be attributed" ) );
    }

    let flags_after_id_mask = PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_CPU | PERF_SAMPLE_STREAM_ID;
    let flags_after_id = first.sample_type & flags_after_id_mask;
    let flags_after_id_are_the_same = attrs.iter().all( |attr| attr.sample_type & flags_after_id_mask == flags_after_id );

    let reverse_position_in_non_sample_records = if identifier_enabled {
        8
    } else if id_enabled && flags_after_id_are_the_same {
        8 + count_u64_fields( flags_after_id )
    } else {
        return Err( io::Error::new( io::ErrorKind::InvalidData, "the attrs don't have a common event id position in non-sample records" ) );
    };

    Ok( (position_in_sample_records, reverse_position_in_non_sample_records) )
}

/// Recovers which attr produced a raw record from the event id the kernel embeds in it.
#[derive(Clone, Default, Debug)]
pub struct AttrResolver {
    attr_count: usize,
    position_in_sample_records: usize,
    reverse_position_in_non_sample_records: usize,
    event_id_to_attr: HashMap< u64, usize >
}

impl AttrResolver {
    pub fn new( attrs: &[PerfEventAttr] ) -> io::Result< Self > {
        let mut resolver = AttrResolver {
            attr_count: attrs.len(),
            ..AttrResolver::default()
        };

        if attrs.len() > 1 {
            let (position, reverse_position) = get_common_event_id_positions_for_attrs( attrs )?;
            resolver.position_in_sample_records = position;
            resolver.reverse_position_in_non_sample_records = reverse_position;
        }

        Ok( resolver )
    }

    pub fn add_event_id( &mut self, event_id: u64, attr_index: usize ) {
        self.event_id_to_attr.insert( event_id, attr_index );
    }

    /// Returns the attr index of the record `bytes` (header included); falls back to the first attr.
    pub fn attr_index_for( &self, kind: u32, bytes: &[u8] ) -> usize {
        if self.attr_count <= 1 || kind >= crate::record::PERF_RECORD_USER_DEFINED_TYPE_START {
            return 0;
        }

        let size = bytes.len();
        let position = if kind == PERF_RECORD_SAMPLE {
            if size < self.position_in_sample_records + 8 {
                return 0;
            }
            self.position_in_sample_records
        } else {
            if size < self.reverse_position_in_non_sample_records || self.reverse_position_in_non_sample_records < 8 {
                return 0;
            }
            size - self.reverse_position_in_non_sample_records
        };

        let event_id = NativeEndian::read_u64( &bytes[ position..position + 8 ] );
        match self.event_id_to_attr.get( &event_id ) {
            Some( &index ) => index,
            None => {
                trace!( "No attr has event id {}; using the first one", event_id );
                0
            }
        }
    }
}

const SAMPLE_TYPE_NAMES: &[(u64, &str)] = &[
    (PERF_SAMPLE_IP, "ip"),
    (PERF_SAMPLE_TID, "tid"),
    (PERF_SAMPLE_TIME, "time"),
    (PERF_SAMPLE_ADDR, "addr"),
    (PERF_SAMPLE_READ, "read"),
    (PERF_SAMPLE_CALLCHAIN, "callchain"),
    (PERF_SAMPLE_ID, "id"),
    (PERF_SAMPLE_CPU, "cpu"),
    (PERF_SAMPLE_PERIOD, "period"),
    (PERF_SAMPLE_STREAM_ID, "stream_id"),
    (PERF_SAMPLE_RAW, "raw"),
    (PERF_SAMPLE_BRANCH_STACK, "branch_stack"),
    (PERF_SAMPLE_REGS_USER, "regs_user"),
    (PERF_SAMPLE_STACK_USER, "stack_user"),
    (PERF_SAMPLE_IDENTIFIER, "identifier")
];

pub fn sample_type_to_string( sample_type: u64 ) -> String {
    let names: Vec< _ > = SAMPLE_TYPE_NAMES.iter()
        .filter( |&&(bit, _)| sample_type & bit != 0 )
        .map( |&(_, name)| name )
        .collect();

    names.join( ", " )
}

pub fn dump_perf_event_attr( attr: &PerfEventAttr, indent: usize ) -> String {
    let pad = " ".repeat( indent );
    let mut output = String::new();
    output.push_str( &format!( "{}type {}, size {}, config {:?}\n", pad, attr.kind, attr.size, HexValue( attr.config ) ) );
    if attr.has_flag( PERF_ATTR_FLAG_FREQ ) {
        output.push_str( &format!( "{}sample_freq {}\n", pad, attr.sample_period_or_freq ) );
    } else {
        output.push_str( &format!( "{}sample_period {}\n", pad, attr.sample_period_or_freq ) );
    }
    output.push_str( &format!( "{}sample_type ({})\n", pad, sample_type_to_string( attr.sample_type ) ) );
    output.push_str( &format!( "{}read_format {:?}\n", pad, HexValue( attr.read_format ) ) );
    output.push_str( &format!(
        "{}disabled {}, inherit {}, exclude_user {}, exclude_kernel {}, mmap {}, comm {}, sample_id_all {}, mmap2 {}\n",
        pad,
        attr.has_flag( PERF_ATTR_FLAG_DISABLED ) as u8,
        attr.has_flag( PERF_ATTR_FLAG_INHERIT ) as u8,
        attr.has_flag( PERF_ATTR_FLAG_EXCLUDE_USER ) as u8,
        attr.has_flag( PERF_ATTR_FLAG_EXCLUDE_KERNEL ) as u8,
        attr.has_flag( PERF_ATTR_FLAG_MMAP ) as u8,
        attr.has_flag( PERF_ATTR_FLAG_COMM ) as u8,
        attr.has_flag( PERF_ATTR_FLAG_SAMPLE_ID_ALL ) as u8,
        attr.has_flag( PERF_ATTR_FLAG_MMAP2 ) as u8
    ));
    output.push_str( &format!( "{}precise_ip {}, branch_sample_type {:?}\n", pad, attr.precise_ip(), HexValue( attr.branch_sample_type ) ) );
    output.push_str( &format!( "{}sample_regs_user {:?}, sample_stack_user {}\n", pad, HexValue( attr.sample_regs_user ), attr.sample_stack_user ) );
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_type::find_event_type_by_name;

    fn attr( sample_type: u64 ) -> PerfEventAttr {
        let mut attr = create_default_perf_event_attr( &find_event_type_by_name( "cpu-cycles" ).unwrap() );
        attr.sample_type = sample_type;
        attr
    }

    #[test]
    fn test_default_attr() {
        let attr = create_default_perf_event_attr( &find_event_type_by_name( "cpu-clock" ).unwrap() );
        assert!( is_timestamp_supported( &attr ) );
        assert!( attr.has_flag( PERF_ATTR_FLAG_FREQ ) );
        assert_eq!( attr.sample_period_or_freq, DEFAULT_SAMPLE_FREQ );
        assert_eq!( attr.read_format, PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING | PERF_FORMAT_ID );
        assert_eq!( sample_type_to_string( attr.sample_type ), "ip, tid, time, id, cpu, period" );
    }

    #[test]
    fn test_event_id_positions_with_id() {
        let common = PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_ID | PERF_SAMPLE_CPU;
        let attrs = [ attr( common | PERF_SAMPLE_PERIOD ), attr( common | PERF_SAMPLE_CALLCHAIN ) ];

        // header + ip + tid + time
        // cpu + id, counted from the end
        assert_eq!( get_common_event_id_positions_for_attrs( &attrs ).unwrap(), (32, 16) );
    }

    #[test]
    fn test_event_id_positions_with_identifier() {
        let attrs = [
            attr( PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_IP ),
            attr( PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_TIME | PERF_SAMPLE_ADDR )
        ];

        assert_eq!( get_common_event_id_positions_for_attrs( &attrs ).unwrap(), (8, 8) );
    }

    #[test]
    fn test_event_id_positions_mismatch() {
        let attrs = [
            attr( PERF_SAMPLE_ID | PERF_SAMPLE_IP ),
            attr( PERF_SAMPLE_ID | PERF_SAMPLE_TIME )
        ];
        assert!( get_common_event_id_positions_for_attrs( &attrs ).is_err() );

        let mut no_sample_id_all = attr( PERF_SAMPLE_ID | PERF_SAMPLE_IP );
        no_sample_id_all.set_flag( PERF_ATTR_FLAG_SAMPLE_ID_ALL, false );
        let attrs = [ attr( PERF_SAMPLE_ID | PERF_SAMPLE_IP ), no_sample_id_all ];
        assert!( get_common_event_id_positions_for_attrs( &attrs ).is_err() );
    }
}
