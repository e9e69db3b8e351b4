#[macro_use]
extern crate log;

mod event_fd;

pub mod sys;

pub use event_fd::{
    page_size,
    EventFd,
    PerfCounter
};
