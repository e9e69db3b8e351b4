#[macro_use]
extern crate log;

use std::env;
use std::error::Error;
use std::process::exit;
use structopt::StructOpt;

use simpleperf_core::{
    args,
    cmd_dump,
    cmd_record,
    cmd_report,
    event_type
};

fn main_impl() -> Result< (), Box< dyn Error > > {
    if env::var( "RUST_LOG" ).is_err() {
        env::set_var( "RUST_LOG", "simpleperf=info,simpleperf_core=info" );
    }

    env_logger::init();

    let opt = args::Opt::from_args();
    match opt {
        args::Opt::Record( args ) => {
            if args.command.is_empty() && args.duration.is_none() {
                info!( "Press Ctrl-C to stop the recording" );
            }

            cmd_record::main( args )?;
        },
        args::Opt::Report( args ) => {
            cmd_report::main( args )?;
        },
        args::Opt::Dump( args ) => {
            cmd_dump::main( args )?;
        },
        args::Opt::List => {
            event_type::print_event_types();
        }
    }

    Ok(())
}

fn main() {
    if let Err( error ) = main_impl() {
        eprintln!( "error: {}", error );
        exit( 1 );
    }
}
