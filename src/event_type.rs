use std::io;

use perf_event_open::sys::*;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EventType {
    pub name: String,
    pub kind: u32,
    pub config: u64
}

impl EventType {
    fn new( name: &str, kind: u32, config: u64 ) -> Self {
        EventType {
            name: name.to_owned(),
            kind,
            config
        }
    }
}

/// An event type plus the exclusion and precision flags parsed from its `:modifier` suffix.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EventTypeAndModifier {
    pub name: String,
    pub event_type: EventType,
    pub modifier: String,
    pub exclude_user: bool,
    pub exclude_kernel: bool,
    pub exclude_hv: bool,
    pub exclude_host: bool,
    pub exclude_guest: bool,
    pub precise_ip: u64
}

const HARDWARE_EVENTS: &[(&str, u64)] = &[
    ("cpu-cycles", PERF_COUNT_HW_CPU_CYCLES),
    ("instructions", PERF_COUNT_HW_INSTRUCTIONS),
    ("cache-references", PERF_COUNT_HW_CACHE_REFERENCES),
    ("cache-misses", PERF_COUNT_HW_CACHE_MISSES),
    ("branch-instructions", PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    ("branch-misses", PERF_COUNT_HW_BRANCH_MISSES),
    ("bus-cycles", PERF_COUNT_HW_BUS_CYCLES),
    ("stalled-cycles-frontend", PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
    ("stalled-cycles-backend", PERF_COUNT_HW_STALLED_CYCLES_BACKEND)
];

const SOFTWARE_EVENTS: &[(&str, u64)] = &[
    ("cpu-clock", PERF_COUNT_SW_CPU_CLOCK),
    ("task-clock", PERF_COUNT_SW_TASK_CLOCK),
    ("page-faults", PERF_COUNT_SW_PAGE_FAULTS),
    ("context-switches", PERF_COUNT_SW_CONTEXT_SWITCHES),
    ("cpu-migrations", PERF_COUNT_SW_CPU_MIGRATIONS),
    ("minor-faults", PERF_COUNT_SW_PAGE_FAULTS_MIN),
    ("major-faults", PERF_COUNT_SW_PAGE_FAULTS_MAJ),
    ("alignment-faults", PERF_COUNT_SW_ALIGNMENT_FAULTS),
    ("emulation-faults", PERF_COUNT_SW_EMULATION_FAULTS)
];

const CACHE_UNITS: &[(&str, u64)] = &[
    ("L1-dcache", PERF_COUNT_HW_CACHE_L1D),
    ("L1-icache", PERF_COUNT_HW_CACHE_L1I),
    ("LLC", PERF_COUNT_HW_CACHE_LL),
    ("dTLB", PERF_COUNT_HW_CACHE_DTLB),
    ("iTLB", PERF_COUNT_HW_CACHE_ITLB),
    ("branch", PERF_COUNT_HW_CACHE_BPU),
    ("node", PERF_COUNT_HW_CACHE_NODE)
];

const CACHE_OPS: &[(&str, u64)] = &[
    ("load", PERF_COUNT_HW_CACHE_OP_READ),
    ("store", PERF_COUNT_HW_CACHE_OP_WRITE),
    ("prefetch", PERF_COUNT_HW_CACHE_OP_PREFETCH)
];

lazy_static! {
    static ref EVENT_TYPES: Vec< EventType > = {
        let mut types = Vec::new();
        for &(name, config) in HARDWARE_EVENTS {
            types.push( EventType::new( name, PERF_TYPE_HARDWARE, config ) );
        }

        for &(name, config) in SOFTWARE_EVENTS {
            types.push( EventType::new( name, PERF_TYPE_SOFTWARE, config ) );
        }

        for &(unit, unit_id) in CACHE_UNITS {
            for &(op, op_id) in CACHE_OPS {
                let config = unit_id | (op_id << 8);
                let access = config | (PERF_COUNT_HW_CACHE_RESULT_ACCESS << 16);
                let miss = config | (PERF_COUNT_HW_CACHE_RESULT_MISS << 16);
                types.push( EventType::new( &format!( "{}-{}s", unit, op ), PERF_TYPE_HW_CACHE, access ) );
                types.push( EventType::new( &format!( "{}-{}-misses", unit, op ), PERF_TYPE_HW_CACHE, miss ) );
            }
        }

        types
    };
}

pub fn all_event_types() -> &'static [EventType] {
    EVENT_TYPES.as_slice()
}

/// Finds a named event, or parses a raw `rNNNN` event.
pub fn find_event_type_by_name( name: &str ) -> Option< EventType > {
    if let Some( event_type ) = EVENT_TYPES.iter().find( |event_type| event_type.name == name ) {
        return Some( event_type.clone() );
    }

    if name.len() > 1 && name.starts_with( 'r' ) {
        if let Ok( config ) = u64::from_str_radix( &name[ 1.. ], 16 ) {
            return Some( EventType::new( name, PERF_TYPE_RAW, config ) );
        }
    }

    None
}

/// Parses `name[:modifiers]`, where modifiers are any of `u`, `k`, `h`, `G`, `H` and `p`.
pub fn parse_event_type( event_spec: &str ) -> io::Result< EventTypeAndModifier > {
    let (name, modifier) = match event_spec.rfind( ':' ) {
        Some( index ) => (&event_spec[ ..index ], &event_spec[ index + 1.. ]),
        None => (event_spec, "")
    };

    let event_type = find_event_type_by_name( name ).ok_or_else( || {
        io::Error::new( io::ErrorKind::InvalidInput, format!( "unknown event type '{}'", name ) )
    })?;

    let mut result = EventTypeAndModifier {
        name: event_spec.to_owned(),
        event_type,
        modifier: modifier.to_owned(),
        exclude_user: false,
        exclude_kernel: false,
        exclude_hv: false,
        exclude_host: false,
        exclude_guest: false,
        precise_ip: 0
    };

    if modifier.contains( |ch: char| ch == 'u' || ch == 'k' || ch == 'h' ) {
        result.exclude_user = true;
        result.exclude_kernel = true;
        result.exclude_hv = true;
    }

    for ch in modifier.chars() {
        match ch {
            'u' => result.exclude_user = false,
            'k' => result.exclude_kernel = false,
            'h' => result.exclude_hv = false,
            'G' => result.exclude_host = true,
            'H' => result.exclude_guest = true,
            'p' => result.precise_ip += 1,
            _ => {
                return Err( io::Error::new( io::ErrorKind::InvalidInput, format!( "unknown event modifier '{}' in '{}'", ch, event_spec ) ) );
            }
        }
    }

    if result.precise_ip > 3 {
        return Err( io::Error::new( io::ErrorKind::InvalidInput, format!( "too many 'p' modifiers in '{}'", event_spec ) ) );
    }

    Ok( result )
}

fn kind_name( kind: u32 ) -> &'static str {
    match kind {
        PERF_TYPE_HARDWARE => "hardware",
        PERF_TYPE_SOFTWARE => "software",
        PERF_TYPE_HW_CACHE => "hw-cache",
        PERF_TYPE_RAW => "raw",
        PERF_TYPE_TRACEPOINT => "tracepoint",
        PERF_TYPE_BREAKPOINT => "breakpoint",
        _ => "unknown"
    }
}

pub fn print_event_types() {
    for event_type in all_event_types() {
        println!( "  {:<32} # {} event", event_type.name, kind_name( event_type.kind ) );
    }
    println!( "  {:<32} # raw PMU event", "rNNNN" );
}

#[test]
fn test_find_event_type() {
    let event_type = find_event_type_by_name( "cpu-cycles" ).unwrap();
    assert_eq!( event_type.kind, PERF_TYPE_HARDWARE );
    assert_eq!( event_type.config, PERF_COUNT_HW_CPU_CYCLES );

    let event_type = find_event_type_by_name( "LLC-load-misses" ).unwrap();
    assert_eq!( event_type.kind, PERF_TYPE_HW_CACHE );
    assert_eq!( event_type.config, PERF_COUNT_HW_CACHE_LL | (PERF_COUNT_HW_CACHE_RESULT_MISS << 16) );

    let event_type = find_event_type_by_name( "r1b" ).unwrap();
    assert_eq!( event_type.kind, PERF_TYPE_RAW );
    assert_eq!( event_type.config, 0x1b );

    assert!( find_event_type_by_name( "no-such-event" ).is_none() );
    assert!( find_event_type_by_name( "r" ).is_none() );
}

#[test]
fn test_parse_modifiers() {
    let event = parse_event_type( "cpu-cycles:u" ).unwrap();
    assert!( !event.exclude_user );
    assert!( event.exclude_kernel );
    assert!( event.exclude_hv );
    assert_eq!( event.name, "cpu-cycles:u" );

    let event = parse_event_type( "instructions:kpp" ).unwrap();
    assert!( event.exclude_user );
    assert!( !event.exclude_kernel );
    assert_eq!( event.precise_ip, 2 );

    let event = parse_event_type( "cpu-clock" ).unwrap();
    assert!( !event.exclude_user && !event.exclude_kernel );

    assert!( parse_event_type( "cpu-clock:x" ).is_err() );
    assert!( parse_event_type( "cpu-clock:pppp" ).is_err() );
}
