use std::collections::HashMap;
use std::error::Error;
use std::io::{self, Write};

use perf_event_open::sys::PERF_SAMPLE_STACK_USER;

use crate::args::{self, SortKey};
use crate::dso::DsoConfig;
use crate::report_lib::{ReportLib, ReportSample};
use crate::unwinder::FramePointerUnwinder;
use crate::utils::read_string_lossy;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
enum KeyValue {
    Text( String ),
    Number( u32 )
}

impl KeyValue {
    fn of( key: SortKey, sample: &ReportSample ) -> Self {
        match key {
            SortKey::Comm => KeyValue::Text( sample.comm.to_string() ),
            SortKey::Pid => KeyValue::Number( sample.pid ),
            SortKey::Tid => KeyValue::Number( sample.tid ),
            SortKey::Dso => KeyValue::Text( sample.dso_name.clone() ),
            SortKey::Symbol => KeyValue::Text( sample.symbol_name.clone() )
        }
    }

    fn as_text( &self ) -> String {
        match *self {
            KeyValue::Text( ref text ) => text.clone(),
            KeyValue::Number( number ) => number.to_string()
        }
    }
}

#[derive(Default)]
struct Entry {
    period: u64,
    samples: u64,
    /// Distinct call chains, by the symbols of their frames.
    call_chains: HashMap< Vec< String >, u64 >
}

/// Samples grouped by the selected keys, one table per event.
struct Report {
    sort: Vec< SortKey >,
    collect_call_chains: bool,
    events: Vec< (String, HashMap< Vec< KeyValue >, Entry >) >
}

impl Report {
    fn new( sort: Vec< SortKey >, collect_call_chains: bool ) -> Self {
        Report {
            sort,
            collect_call_chains,
            events: Vec::new()
        }
    }

    fn add( &mut self, sample: &ReportSample ) {
        let key: Vec< _ > = self.sort.iter().map( |&key| KeyValue::of( key, sample ) ).collect();
        let index = match self.events.iter().position( |(name, _)| *name == sample.event_name ) {
            Some( index ) => index,
            None => {
                self.events.push( (sample.event_name.clone(), HashMap::new()) );
                self.events.len() - 1
            }
        };

        let entry = self.events[ index ].1.entry( key ).or_insert_with( Entry::default );
        entry.period += sample.period;
        entry.samples += 1;

        if self.collect_call_chains && sample.call_chain.len() > 1 {
            let frames = sample.call_chain.iter().map( |frame| frame.symbol_name().to_owned() ).collect();
            *entry.call_chains.entry( frames ).or_insert( 0 ) += sample.period;
        }
    }

    fn write( &self, mut fp: impl Write ) -> io::Result< () > {
        for (event_name, entries) in &self.events {
            let total_period: u64 = entries.values().map( |entry| entry.period ).sum();
            let total_samples: u64 = entries.values().map( |entry| entry.samples ).sum();
            writeln!( fp, "Event: {}", event_name )?;
            writeln!( fp, "Samples: {}", total_samples )?;
            writeln!( fp, "Event count: {}", total_period )?;
            writeln!( fp )?;

            let mut rows: Vec< _ > = entries.iter().collect();
            rows.sort_by( |(lhs_key, lhs), (rhs_key, rhs)| rhs.period.cmp( &lhs.period ).then_with( || lhs_key.cmp( rhs_key ) ) );

            let rows: Vec< (String, Vec< String >, &Entry) > = rows.into_iter().map( |(key, entry)| {
                let overhead = if total_period == 0 { 0.0 } else { entry.period as f64 * 100.0 / total_period as f64 };
                (format!( "{:.2}%", overhead ), key.iter().map( |value| value.as_text() ).collect(), entry)
            }).collect();

            let mut widths: Vec< usize > = self.sort.iter().map( |key| key.as_str().len() ).collect();
            for (_, columns, _) in &rows {
                for (width, column) in widths.iter_mut().zip( columns ) {
                    *width = std::cmp::max( *width, column.len() );
                }
            }

            write!( fp, "{:<9}", "Overhead" )?;
            for (key, width) in self.sort.iter().zip( &widths ) {
                write!( fp, "  {:<width$}", key.as_str(), width = *width )?;
            }
            writeln!( fp )?;

            for (overhead, columns, entry) in rows {
                write!( fp, "{:<9}", overhead )?;
                for (column, width) in columns.iter().zip( &widths ) {
                    write!( fp, "  {:<width$}", column, width = *width )?;
                }
                writeln!( fp )?;

                let mut call_chains: Vec< _ > = entry.call_chains.iter().collect();
                call_chains.sort_by( |lhs, rhs| rhs.1.cmp( lhs.1 ) );
                for (frames, period) in call_chains {
                    writeln!( fp, "          |-- {:.2}%", *period as f64 * 100.0 / entry.period as f64 )?;
                    for frame in frames {
                        writeln!( fp, "          |      {}", frame )?;
                    }
                }
            }

            writeln!( fp )?;
        }

        Ok(())
    }
}

fn dso_config( args: &args::ReportArgs ) -> Result< DsoConfig, Box< dyn Error > > {
    let mut config = DsoConfig::default();
    config.demangle = !args.no_demangle;
    if let Some( ref symfs ) = args.symfs {
        config.set_symfs_dir( symfs )?;
    }

    config.vmlinux = args.vmlinux.clone();
    if let Some( ref path ) = args.kallsyms {
        config.kallsyms = Some( read_string_lossy( path )? );
    }

    Ok( config )
}

pub fn main( args: args::ReportArgs ) -> Result< (), Box< dyn Error > > {
    let mut lib = ReportLib::open( &args.input, dso_config( &args )? )?;
    lib.set_show_art_frames( args.show_art_frames );
    lib.set_convert_jit_frames( !args.no_convert_jit_frames );

    let has_stack_dumps = lib.reader().attrs().iter().any( |attr| attr.attr.sample_type & PERF_SAMPLE_STACK_USER != 0 );
    if has_stack_dumps {
        lib.set_unwinder( Box::new( FramePointerUnwinder::native() ) );
    }

    let mut report = Report::new( args.sort.clone(), args.print_call_chains );
    while let Some( sample ) = lib.next_sample()? {
        report.add( &sample );
    }

    let stdout = io::stdout();
    let stdout = stdout.lock();
    report.write( stdout )?;
    Ok(())
}
