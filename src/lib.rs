#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

mod utils;

pub mod args;
pub mod build_id;
pub mod record;
pub mod event_type;
pub mod event_attr;
pub mod record_cache;
pub mod record_file;
pub mod record_file_writer;
pub mod record_file_reader;
pub mod event_selection_set;
mod maps;
mod kallsyms;
mod elf;
mod read_apk;
mod read_dex_file;
pub mod dso;
pub mod thread_tree;
pub mod jit_debug_reader;
pub mod call_chain;
pub mod perf_regs;
pub mod unwinder;
pub mod report_lib;
pub mod cmd_record;
pub mod cmd_report;
pub mod cmd_dump;
