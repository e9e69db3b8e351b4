use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, VecDeque};

pub const DEFAULT_MIN_TIME_DIFF: u64 = 1_000_000;
pub const DEFAULT_MAX_CACHE_SIZE: usize = 64 * 1024;

struct CachedRecord< T > {
    timestamp: u64,
    sequence: u64,
    record: T
}

impl< T > PartialEq for CachedRecord< T > {
    fn eq( &self, other: &Self ) -> bool {
        self.timestamp == other.timestamp && self.sequence == other.sequence
    }
}

impl< T > Eq for CachedRecord< T > {}

impl< T > PartialOrd for CachedRecord< T > {
    fn partial_cmp( &self, other: &Self ) -> Option< Ordering > {
        Some( self.cmp( other ) )
    }
}

impl< T > Ord for CachedRecord< T > {
    fn cmp( &self, other: &Self ) -> Ordering {
        (self.timestamp, self.sequence).cmp( &(other.timestamp, other.sequence) )
    }
}

/// Reorders records coming from several time-ordered sources into one time-ordered stream.
///
/// With timestamps a record is only released once every registered source has
/// moved past it (the watermark). Without registered sources the watermark is the
/// newest timestamp seen minus `min_time_diff`. Without timestamps records pass
/// through in arrival order.
pub struct RecordCache< T > {
    has_timestamp: bool,
    min_time_diff: u64,
    max_cache_size: usize,
    heap: BinaryHeap< Reverse< CachedRecord< T > > >,
    fifo: VecDeque< T >,
    sources: BTreeMap< u32, u64 >,
    latest_timestamp: u64,
    last_popped_timestamp: u64,
    sequence: u64
}

impl< T > RecordCache< T > {
    pub fn new( has_timestamp: bool, min_time_diff: u64, max_cache_size: usize ) -> Self {
        RecordCache {
            has_timestamp,
            min_time_diff,
            max_cache_size,
            heap: BinaryHeap::new(),
            fifo: VecDeque::new(),
            sources: BTreeMap::new(),
            latest_timestamp: 0,
            last_popped_timestamp: 0,
            sequence: 0
        }
    }

    pub fn with_defaults( has_timestamp: bool ) -> Self {
        RecordCache::new( has_timestamp, DEFAULT_MIN_TIME_DIFF, DEFAULT_MAX_CACHE_SIZE )
    }

    /// Registers a source which must be heard from before the watermark can pass.
    pub fn add_source( &mut self, source: u32 ) {
        self.sources.entry( source ).or_insert( 0 );
    }

    pub fn len( &self ) -> usize {
        self.heap.len() + self.fifo.len()
    }

    pub fn is_empty( &self ) -> bool {
        self.len() == 0
    }

    /// Queues `record`; `timestamp` is `None` for records whose layout carries no time.
    pub fn push( &mut self, source: u32, timestamp: Option< u64 >, record: T ) {
        if !self.has_timestamp {
            self.fifo.push_back( record );
            return;
        }

        let last_of_source = self.sources.get( &source ).cloned().unwrap_or( self.latest_timestamp );
        let timestamp = match timestamp {
            Some( timestamp ) => timestamp,
            // Records without a timestamp stay right after the previous record of their source.
            None => last_of_source
        };

        if let Some( last ) = self.sources.get_mut( &source ) {
            if timestamp > *last {
                *last = timestamp;
            }
        }

        if timestamp > self.latest_timestamp {
            self.latest_timestamp = timestamp;
        }

        if timestamp < self.last_popped_timestamp {
            debug!( "Record at {} arrived after the cache already released {}", timestamp, self.last_popped_timestamp );
        }

        self.sequence += 1;
        self.heap.push( Reverse( CachedRecord {
            timestamp,
            sequence: self.sequence,
            record
        }));
    }

    /// Declares that `source` has nothing pending right now, so it no longer holds the watermark back.
    pub fn mark_drained( &mut self, source: u32 ) {
        let floor = self.latest_timestamp.saturating_sub( self.min_time_diff );
        if let Some( last ) = self.sources.get_mut( &source ) {
            if floor > *last {
                *last = floor;
            }
        }
    }

    fn watermark( &self ) -> u64 {
        if self.sources.is_empty() {
            self.latest_timestamp.saturating_sub( self.min_time_diff )
        } else {
            self.sources.values().cloned().min().unwrap_or( 0 )
        }
    }

    /// Returns the oldest record which is safe to emit, if any.
    pub fn pop( &mut self ) -> Option< T > {
        if !self.has_timestamp {
            return self.fifo.pop_front();
        }

        let watermark = self.watermark();
        let is_ready = match self.heap.peek() {
            Some( &Reverse( ref top ) ) => top.timestamp <= watermark || self.heap.len() > self.max_cache_size,
            None => false
        };

        if !is_ready {
            return None;
        }

        self.heap.pop().map( |Reverse( cached )| {
            self.last_popped_timestamp = cached.timestamp;
            cached.record
        })
    }

    /// Flushes everything, still in timestamp order.
    pub fn pop_all( &mut self ) -> Vec< T > {
        if !self.has_timestamp {
            return self.fifo.drain( .. ).collect();
        }

        let mut output = Vec::with_capacity( self.heap.len() );
        while let Some( Reverse( cached ) ) = self.heap.pop() {
            self.last_popped_timestamp = cached.timestamp;
            output.push( cached.record );
        }

        output
    }
}
