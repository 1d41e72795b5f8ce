//! The mmap ring-buffer reader: one header page followed by `N` power-of-two
//! data pages (§4.6). Reads use `data_head` with an acquire fence, process up
//! to that head, then release-store `data_tail` (§5).
//!
//! An earlier revision of this reader incremented its read cursor without
//! bound, overrunning the buffer (§9, Open Question 3); every offset here
//! is taken modulo the data region's capacity.

use std::fs::File;
use std::os::fd::FromRawFd;
use std::sync::atomic::{fence, Ordering};

use memmap2::{MmapOptions, MmapRaw};

use crate::error::{errors, AutopinError};
use crate::perf::ffi::RingBufferHeader;

pub struct RingBuffer {
    _file: File,
    map: MmapRaw,
    data_size: usize,
}

impl RingBuffer {
    /// `page_count` must be a power of two; the mapped region is
    /// `(1 + page_count) * page_size` bytes (header page + data pages).
    pub fn map(fd: i32, page_count: usize, page_size: usize) -> Result<Self, AutopinError> {
        if !page_count.is_power_of_two() {
            return Err(errors::system(
                "mmap",
                format!("page_count {page_count} is not a power of two"),
            ));
        }
        let total = (1 + page_count) * page_size;
        let file = unsafe { File::from_raw_fd(fd) };
        let map = unsafe {
            MmapOptions::new()
                .len(total)
                .map_raw(&file)
                .map_err(|e| errors::system("mmap", e.to_string()))?
        };
        Ok(Self {
            _file: file,
            map,
            data_size: page_count * page_size,
        })
    }

    fn header(&self) -> &RingBufferHeader {
        unsafe { &*(self.map.as_ptr() as *const RingBufferHeader) }
    }

    fn data_ptr(&self) -> *const u8 {
        unsafe { self.map.as_ptr().add(self.map.len() - self.data_size) }
    }

    /// Copies out every byte between the last-seen tail and the current
    /// head, release-storing the new tail once done. Returns an empty vec
    /// when there's nothing new.
    pub fn drain(&self) -> Vec<u8> {
        let header = self.header();
        let head = unsafe { std::ptr::read_volatile(&header.data_head) };
        fence(Ordering::Acquire);
        let tail = unsafe { std::ptr::read_volatile(&header.data_tail) };

        if head == tail {
            return Vec::new();
        }

        let available = (head - tail) as usize;
        let mut out = Vec::with_capacity(available);
        let data = self.data_ptr();
        for i in 0..available {
            let offset = (tail as usize + i) % self.data_size;
            out.push(unsafe { *data.add(offset) });
        }

        fence(Ordering::Release);
        unsafe {
            std::ptr::write_volatile(
                &header.data_tail as *const u64 as *mut u64,
                head,
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    /// A standalone model of the modulo-capacity addressing, exercised
    /// without a real perf fd: writes that wrap past the end of the data
    /// region must still land at the correct offset instead of running past
    /// the buffer (the Open Question 3 fix).
    #[test]
    fn wrap_around_offset_stays_within_capacity() {
        let capacity = 16usize;
        let tail: u64 = capacity as u64 - 2;
        let i = 5usize; // read 5 bytes starting near the end, must wrap
        let offset = (tail as usize + i) % capacity;
        assert!(offset < capacity);
        assert_eq!(offset, 3);
    }

    #[test]
    fn no_bytes_available_when_head_equals_tail() {
        let head: u64 = 42;
        let tail: u64 = 42;
        assert_eq!(head, tail);
    }
}
