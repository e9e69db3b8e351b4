use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;
use std::sync::atomic::fence;
use std::sync::atomic::Ordering;

use libc::{self, c_int, c_void, pid_t};

use crate::sys::*;

unsafe fn read_head( pointer: *const u8 ) -> u64 {
    let page = &*(pointer as *const PerfEventMmapPage);
    let head = ptr::read_volatile( &page.data_head );
    fence( Ordering::Acquire );
    head
}

unsafe fn read_tail( pointer: *const u8 ) -> u64 {
    let page = &*(pointer as *const PerfEventMmapPage);
    ptr::read_volatile( &page.data_tail )
}

unsafe fn write_tail( pointer: *mut u8, value: u64 ) {
    let page = &mut *(pointer as *mut PerfEventMmapPage);
    fence( Ordering::AcqRel );
    ptr::write_volatile( &mut page.data_tail, value );
}

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf( libc::_SC_PAGESIZE ) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// A mapped ring buffer: one metadata page followed by `size` bytes of data.
struct MappedBuffer {
    pointer: *mut u8,
    page_size: usize,
    size: usize
}

impl MappedBuffer {
    #[inline]
    fn data( &self ) -> &[u8] {
        unsafe {
            slice::from_raw_parts( self.pointer.add( self.page_size ), self.size )
        }
    }
}

impl Drop for MappedBuffer {
    fn drop( &mut self ) {
        unsafe {
            libc::munmap( self.pointer as *mut c_void, self.size + self.page_size );
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct PerfCounter {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub id: u64
}

/// One opened kernel monitoring context for an (attr, thread, cpu) triple.
pub struct EventFd {
    fd: RawFd,
    attr: PerfEventAttr,
    tid: pid_t,
    cpu: c_int,
    id: u64,
    buffer: Option< MappedBuffer >,
    shares_buffer: bool
}

impl fmt::Debug for EventFd {
    fn fmt( &self, fmt: &mut fmt::Formatter ) -> Result< (), fmt::Error > {
        fmt.debug_map()
            .entry( &"fd", &self.fd )
            .entry( &"tid", &self.tid )
            .entry( &"cpu", &self.cpu )
            .entry( &"id", &self.id )
            .entry( &"mapped", &self.buffer.is_some() )
            .finish()
    }
}

impl Drop for EventFd {
    fn drop( &mut self ) {
        self.buffer = None;
        unsafe {
            libc::close( self.fd );
        }
    }
}

impl EventFd {
    /// Opens a monitoring context; `group` is the already opened group leader, if any.
    pub fn open( attr: &PerfEventAttr, tid: pid_t, cpu: c_int, group: Option< &EventFd > ) -> io::Result< EventFd > {
        let group_fd = group.map( |leader| leader.fd ).unwrap_or( -1 );
        let fd = match sys_perf_event_open( attr, tid, cpu, group_fd, PERF_FLAG_FD_CLOEXEC ) {
            Ok( fd ) => fd,
            Err( err ) => {
                debug!( "The perf_event_open syscall failed for TID {} on CPU {}: {}", tid, cpu, err );
                if err.raw_os_error() == Some( libc::EINVAL ) && attr.has_flag( PERF_ATTR_FLAG_FREQ ) {
                    debug!( "The sampling frequency {} might be too high", attr.sample_period_or_freq );
                }

                return Err( err );
            }
        };

        let mut event_fd = EventFd {
            fd,
            attr: *attr,
            tid,
            cpu,
            id: 0,
            buffer: None,
            shares_buffer: false
        };

        event_fd.id = event_fd.read_id()?;
        Ok( event_fd )
    }

    fn read_id( &self ) -> io::Result< u64 > {
        let mut id: u64 = 0;
        let result = unsafe {
            libc::ioctl( self.fd, PERF_EVENT_IOC_ID as _, &mut id as *mut u64 )
        };

        if result == 0 {
            return Ok( id );
        }

        // Older kernels lack the ioctl; the id is part of the counter read instead.
        if self.attr.read_format & PERF_FORMAT_ID != 0 {
            return Ok( self.read_counter()?.id );
        }

        Err( io::Error::last_os_error() )
    }

    #[inline]
    pub fn fd( &self ) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn id( &self ) -> u64 {
        self.id
    }

    #[inline]
    pub fn tid( &self ) -> pid_t {
        self.tid
    }

    #[inline]
    pub fn cpu( &self ) -> c_int {
        self.cpu
    }

    #[inline]
    pub fn attr( &self ) -> &PerfEventAttr {
        &self.attr
    }

    pub fn set_enabled( &self, enabled: bool ) -> io::Result< () > {
        let request = if enabled { PERF_EVENT_IOC_ENABLE } else { PERF_EVENT_IOC_DISABLE };
        let result = unsafe {
            libc::ioctl( self.fd, request as _, 0 )
        };

        if result < 0 {
            return Err( io::Error::last_os_error() );
        }

        Ok(())
    }

    /// Reads `{value, time_enabled, time_running, id}`; requires the matching `read_format`.
    pub fn read_counter( &self ) -> io::Result< PerfCounter > {
        let mut values = [0_u64; 4];
        let size = mem::size_of_val( &values );
        let result = unsafe {
            libc::read( self.fd, values.as_mut_ptr() as *mut c_void, size )
        };

        if result < 0 {
            return Err( io::Error::last_os_error() );
        }

        if result as usize != size {
            return Err( io::Error::new( io::ErrorKind::UnexpectedEof, "short read of a perf counter" ) );
        }

        Ok( PerfCounter {
            value: values[ 0 ],
            time_enabled: values[ 1 ],
            time_running: values[ 2 ],
            id: values[ 3 ]
        })
    }

    /// Maps a ring buffer of `page_count` data pages; `page_count` must be a power of two.
    pub fn create_mapped_buffer( &mut self, page_count: usize ) -> io::Result< () > {
        if !page_count.is_power_of_two() {
            return Err( io::Error::new( io::ErrorKind::InvalidInput, "the ring buffer page count must be a power of two" ) );
        }

        let page_size = page_size();
        let full_size = page_size * (page_count + 1);
        let pointer = unsafe {
            libc::mmap( ptr::null_mut(), full_size, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED, self.fd, 0 )
        };

        if pointer == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            debug!( "Failed to mmap {} + 1 pages for TID {} on CPU {}: {}", page_count, self.tid, self.cpu, err );
            return Err( err );
        }

        debug!( "Allocated {} + 1 pages for the ring buffer of TID {} on CPU {}", page_count, self.tid, self.cpu );
        self.buffer = Some( MappedBuffer {
            pointer: pointer as *mut u8,
            page_size,
            size: page_size * page_count
        });

        Ok(())
    }

    /// Unmaps the ring buffer created by `create_mapped_buffer`, if any.
    pub fn release_mapped_buffer( &mut self ) {
        self.buffer = None;
    }

    /// Redirects this context's records into the ring buffer owned by `owner`.
    pub fn share_mapped_buffer( &mut self, owner: &EventFd ) -> io::Result< () > {
        let result = unsafe {
            libc::ioctl( self.fd, PERF_EVENT_IOC_SET_OUTPUT as _, owner.fd )
        };

        if result < 0 {
            return Err( io::Error::last_os_error() );
        }

        self.shares_buffer = true;
        Ok(())
    }

    #[inline]
    pub fn has_mapped_buffer( &self ) -> bool {
        self.buffer.is_some()
    }

    #[inline]
    pub fn shares_mapped_buffer( &self ) -> bool {
        self.shares_buffer
    }

    #[inline]
    pub fn are_events_pending( &self ) -> bool {
        match self.buffer {
            Some( ref buffer ) => unsafe { read_head( buffer.pointer ) != read_tail( buffer.pointer ) },
            None => false
        }
    }

    /// Appends every byte currently available in the ring buffer to `output`
    /// and releases that space back to the kernel.
    pub fn read_available_data( &mut self, output: &mut Vec< u8 > ) -> usize {
        let buffer = match self.buffer {
            Some( ref buffer ) => buffer,
            None => return 0
        };

        let head = unsafe { read_head( buffer.pointer ) };
        let tail = unsafe { read_tail( buffer.pointer ) };
        if head == tail {
            return 0;
        }

        let data = buffer.data();
        let size = buffer.size as u64;
        let length = head.wrapping_sub( tail );
        if length > size {
            warn!( "Ring buffer of TID {} on CPU {} reports {} bytes available out of {}", self.tid, self.cpu, length, size );
        }

        let length = std::cmp::min( length, size ) as usize;
        let start = (tail % size) as usize;
        if start + length <= data.len() {
            output.extend_from_slice( &data[ start..start + length ] );
        } else {
            let first = data.len() - start;
            output.extend_from_slice( &data[ start.. ] );
            output.extend_from_slice( &data[ ..length - first ] );
        }

        unsafe {
            write_tail( buffer.pointer, head );
        }

        length
    }

    pub fn poll_fd( &self ) -> libc::pollfd {
        libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN | libc::POLLHUP,
            revents: 0
        }
    }
}
