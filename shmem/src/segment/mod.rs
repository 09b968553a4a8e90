//! A fixed-size shared memory segment and the two-event baton guarding it.
//!
//! Layout: a `#[repr(C)]` header at offset 0, two process-shared auto-reset
//! events (`consumer_turn`, `producer_turn`) at 64-byte aligned offsets, and
//! the payload from [`header_size`] to the end of the segment.
//!
//! Access to header and payload is only possible through a [`ProducerTurn`] or
//! a [`ConsumerTurn`]. Handing a turn off consumes it, so a side can never
//! touch the segment after passing the baton.

use std::mem;
use std::ptr;
use std::slice;

use log::warn;
use nix::errno::Errno;
use once_cell::sync::Lazy;
use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::Timeout;
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::core::{ResourcePath, SegmentName, Status, MAX_PATH_LEN};
use crate::errors::{Result, ShmemLibError};

const EVENT_ALIGN: usize = 64;

const FLAG_DONE: u32 = 1;
const FLAG_CANCELLED: u32 = 1 << 1;

#[repr(C)]
struct SegmentHeader {
    path: [u8; MAX_PATH_LEN],
    total_length: u64,
    chunk_length: u64,
    status: u32,
    flags: u32,
}

struct Layout {
    consumer_turn: usize,
    producer_turn: usize,
    payload: usize,
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

static LAYOUT: Lazy<Layout> = Lazy::new(|| {
    let event_size = align_up(Event::size_of(None), EVENT_ALIGN);
    let consumer_turn = align_up(mem::size_of::<SegmentHeader>(), EVENT_ALIGN);
    let producer_turn = consumer_turn + event_size;
    Layout {
        consumer_turn,
        producer_turn,
        payload: producer_turn + event_size,
    }
});

/// Bytes in front of the payload: header plus both events.
pub fn header_size() -> usize {
    LAYOUT.payload
}

/// Payload bytes available in a segment of `segment_size` bytes, or `None`
/// when the segment cannot hold a single payload byte.
pub fn payload_capacity(segment_size: usize) -> Option<usize> {
    segment_size.checked_sub(header_size()).filter(|c| *c > 0)
}

pub struct Segment {
    shmem: Shmem,
    name: SegmentName,
    size: usize,
    consumer_turn: Box<dyn EventImpl>,
    producer_turn: Box<dyn EventImpl>,
}

// The mapping and the events are process-shared by construction; every access
// to header and payload is serialized by the baton.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

fn map_segment(name: &SegmentName, size: usize) -> Result<Shmem> {
    match ShmemConf::new().size(size).os_id(name.as_str()).create() {
        Ok(shmem) => Ok(shmem),
        Err(ShmemError::MappingIdExists) => {
            warn!("Removing stale segment {} left by a previous run", name);
            let mut stale = ShmemConf::new().os_id(name.as_str()).open()?;
            stale.set_owner(true);
            drop(stale);
            Ok(ShmemConf::new().size(size).os_id(name.as_str()).create()?)
        }
        Err(e) => Err(e.into()),
    }
}

type Events = (Box<dyn EventImpl>, Box<dyn EventImpl>);

unsafe fn init_events(base: *mut u8) -> std::result::Result<Events, Box<dyn std::error::Error>> {
    let (consumer_turn, _) = Event::new(base.add(LAYOUT.consumer_turn), true)?;
    let (producer_turn, _) = Event::new(base.add(LAYOUT.producer_turn), true)?;
    consumer_turn.set(EventState::Clear)?;
    producer_turn.set(EventState::Signaled)?;
    Ok((consumer_turn, producer_turn))
}

impl Segment {
    /// Creates and initializes a segment: zeroed header, `consumer_turn`
    /// clear, `producer_turn` signaled.
    ///
    /// The segment is not unlinked on drop; the owner calls [`Segment::unlink`].
    pub fn create(name: SegmentName, size: usize) -> Result<Segment> {
        if payload_capacity(size).is_none() {
            return Err(ShmemLibError::Config(format!(
                "segment size {} leaves no payload after a {}-byte header",
                size,
                header_size()
            )));
        }
        let mut shmem = map_segment(&name, size)?;
        shmem.set_owner(false);
        let base = shmem.as_ptr();
        let events = unsafe {
            ptr::write_bytes(base, 0, header_size());
            init_events(base)
        };
        let (consumer_turn, producer_turn) = match events {
            Ok(v) => v,
            Err(e) => {
                let err = ShmemLibError::lock(e);
                let _ = nix::sys::mman::shm_unlink(name.as_str());
                return Err(err);
            }
        };
        Ok(Segment {
            shmem,
            name,
            size,
            consumer_turn,
            producer_turn,
        })
    }

    /// Maps a segment created by the front-end.
    pub fn attach(name: &SegmentName, size: usize) -> Result<Segment> {
        let shmem = ShmemConf::new().os_id(name.as_str()).open()?;
        if payload_capacity(size).is_none() || shmem.len() < size {
            return Err(ShmemLibError::protocol(format!(
                "segment {} maps {} bytes, {} requested",
                name,
                shmem.len(),
                size
            )));
        }
        let base = shmem.as_ptr();
        let (consumer_turn, producer_turn) = unsafe {
            let (consumer_turn, _) = Event::from_existing(base.add(LAYOUT.consumer_turn))
                .map_err(ShmemLibError::lock)?;
            let (producer_turn, _) = Event::from_existing(base.add(LAYOUT.producer_turn))
                .map_err(ShmemLibError::lock)?;
            (consumer_turn, producer_turn)
        };
        Ok(Segment {
            shmem,
            name: name.clone(),
            size,
            consumer_turn,
            producer_turn,
        })
    }

    pub fn name(&self) -> &SegmentName {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.size - header_size()
    }

    /// Removes the name. Existing mappings stay valid until dropped.
    pub fn unlink(&self) -> Result<()> {
        match nix::sys::mman::shm_unlink(self.name.as_str()) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocks until the back-end may write.
    pub fn producer_turn(&self) -> Result<ProducerTurn<'_>> {
        self.producer_turn
            .wait(Timeout::Infinite)
            .map_err(ShmemLibError::lock)?;
        Ok(ProducerTurn { segment: self })
    }

    /// Blocks until the front-end may read.
    pub fn consumer_turn(&self) -> Result<ConsumerTurn<'_>> {
        self.consumer_turn
            .wait(Timeout::Infinite)
            .map_err(ShmemLibError::lock)?;
        Ok(ConsumerTurn { segment: self })
    }

    #[inline]
    fn header(&self) -> *mut SegmentHeader {
        self.shmem.as_ptr().cast()
    }

    #[inline]
    fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.shmem.as_ptr().add(header_size()) }
    }

    #[inline]
    fn path_ptr(&self) -> *mut u8 {
        unsafe { ptr::addr_of_mut!((*self.header()).path).cast::<u8>() }
    }

    fn path_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.path_ptr(), MAX_PATH_LEN) }
    }

    fn write_path(&self, path: Option<&ResourcePath>) {
        let dest = unsafe { slice::from_raw_parts_mut(self.path_ptr(), MAX_PATH_LEN) };
        match path {
            Some(path) => path.write_to(dest),
            None => dest.fill(0),
        }
    }

    fn total_length(&self) -> u64 {
        unsafe { ptr::addr_of!((*self.header()).total_length).read_volatile() }
    }

    fn set_total_length(&self, v: u64) {
        unsafe { ptr::addr_of_mut!((*self.header()).total_length).write_volatile(v) }
    }

    fn chunk_length(&self) -> u64 {
        unsafe { ptr::addr_of!((*self.header()).chunk_length).read_volatile() }
    }

    fn set_chunk_length(&self, v: u64) {
        unsafe { ptr::addr_of_mut!((*self.header()).chunk_length).write_volatile(v) }
    }

    fn raw_status(&self) -> u32 {
        unsafe { ptr::addr_of!((*self.header()).status).read_volatile() }
    }

    fn set_raw_status(&self, v: u32) {
        unsafe { ptr::addr_of_mut!((*self.header()).status).write_volatile(v) }
    }

    fn flags(&self) -> u32 {
        unsafe { ptr::addr_of!((*self.header()).flags).read_volatile() }
    }

    fn set_flags(&self, v: u32) {
        unsafe { ptr::addr_of_mut!((*self.header()).flags).write_volatile(v) }
    }

    /// Clears every header field. Only the front-end calls this, while the
    /// segment is not bound to a transfer.
    pub(crate) fn reset(&self) {
        self.write_path(None);
        self.set_total_length(0);
        self.set_chunk_length(0);
        self.set_raw_status(0);
        self.set_flags(0);
    }

    pub fn is_clean(&self) -> bool {
        self.path_bytes().iter().all(|&b| b == 0)
            && self.total_length() == 0
            && self.chunk_length() == 0
            && self.raw_status() == 0
            && self.flags() == 0
    }

    fn post_consumer(&self) -> Result<()> {
        self.consumer_turn
            .set(EventState::Signaled)
            .map_err(ShmemLibError::lock)
    }

    fn post_producer(&self) -> Result<()> {
        self.producer_turn
            .set(EventState::Signaled)
            .map_err(ShmemLibError::lock)
    }
}

/// Write permission on a segment, held by the back-end.
pub struct ProducerTurn<'a> {
    segment: &'a Segment,
}

impl<'a> ProducerTurn<'a> {
    /// Stamps the resolution result. Done once per request, on the first turn.
    pub fn announce(&mut self, path: &ResourcePath, status: Status, total_length: u64) {
        self.segment.write_path(Some(path));
        self.segment.set_raw_status(status as u32);
        self.segment.set_total_length(total_length);
        self.segment.set_chunk_length(0);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.segment.payload_ptr(), self.segment.capacity()) }
    }

    /// Marks the first `len` payload bytes as the current chunk.
    pub fn stage(&mut self, len: usize) -> Result<()> {
        if len > self.segment.capacity() {
            return Err(ShmemLibError::TooLong {
                field: "chunk",
                len,
                max: self.segment.capacity(),
            });
        }
        self.segment.set_chunk_length(len as u64);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.stage(data.len())?;
        self.payload_mut()[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.segment.flags() & FLAG_CANCELLED != 0
    }

    /// Passes the staged chunk to the consumer and waits for the baton back.
    pub fn hand_off(self) -> Result<ProducerTurn<'a>> {
        let segment = self.segment;
        segment.post_consumer()?;
        segment.producer_turn()
    }

    /// Ends the transfer: no more chunks, and the producer will not wait on
    /// this segment again for the current request.
    pub fn finish(self) -> Result<()> {
        let segment = self.segment;
        segment.set_chunk_length(0);
        segment.set_flags(segment.flags() | FLAG_DONE);
        segment.post_consumer()
    }
}

/// Read permission on a segment, held by the front-end.
pub struct ConsumerTurn<'a> {
    segment: &'a Segment,
}

impl<'a> ConsumerTurn<'a> {
    pub fn segment_name(&self) -> &SegmentName {
        self.segment.name()
    }

    pub fn status(&self) -> Result<Status> {
        let raw = self.segment.raw_status();
        Status::from_raw(raw)
            .ok_or_else(|| ShmemLibError::protocol(format!("invalid status {} in {}", raw, self.segment.name())))
    }

    pub fn total_length(&self) -> u64 {
        self.segment.total_length()
    }

    pub fn path(&self) -> Result<ResourcePath> {
        ResourcePath::read_from("path", self.segment.path_bytes())
    }

    pub fn is_done(&self) -> bool {
        self.segment.flags() & FLAG_DONE != 0
    }

    /// The staged chunk. A length beyond the payload capacity is rejected.
    pub fn chunk(&self) -> Result<&[u8]> {
        let len = self.segment.chunk_length();
        if len > self.segment.capacity() as u64 {
            return Err(ShmemLibError::protocol(format!(
                "chunk of {} bytes exceeds capacity {} of {}",
                len,
                self.segment.capacity(),
                self.segment.name()
            )));
        }
        Ok(unsafe { slice::from_raw_parts(self.segment.payload_ptr(), len as usize) })
    }

    /// Returns the baton to the producer and waits for the next chunk.
    pub fn hand_off(self) -> Result<ConsumerTurn<'a>> {
        let segment = self.segment;
        segment.post_producer()?;
        segment.consumer_turn()
    }

    /// Asks the producer to stop and waits until it has finished.
    pub fn drain(self) -> Result<ConsumerTurn<'a>> {
        let mut turn = self;
        while !turn.is_done() {
            let segment = turn.segment;
            segment.set_flags(segment.flags() | FLAG_CANCELLED);
            turn = turn.hand_off()?;
        }
        Ok(turn)
    }

    /// Resets the header and restores the initial baton state. Only valid once
    /// the producer has finished.
    pub fn release(self) -> Result<()> {
        if !self.is_done() {
            return Err(ShmemLibError::protocol(format!(
                "{} released before the producer finished",
                self.segment.name()
            )));
        }
        self.segment.reset();
        self.segment.post_producer()
    }
}
