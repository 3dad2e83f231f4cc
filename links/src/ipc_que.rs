// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Lock-free single-writer/single-reader ring in shared memory.
//!
//! The ring lives entirely inside a [`SharedRegion`]:
//!
//! ```text
//! word 0      1       2              3              4 ..
//!    ┌──────┬──────┬──────────────┬──────────────┬───────────────────────┐
//!    │ rd   │ wr   │ element size │ max elements │ element slots         │
//!    └──────┴──────┴──────────────┴──────────────┴───────────────────────┘
//! ```
//!
//! `rd` and `wr` are free-running counters; the ring holds `wr - rd` elements
//! and is full when that reaches `max elements`. Only the writer stores `wr`
//! and only the reader stores `rd`, so no lock is needed. The contract is
//! carried by the types: [`IpcQue::create`] returns exactly one
//! [`IpcQueWriter`] and one [`IpcQueReader`], and neither can be cloned.

use std::sync::atomic::Ordering;

use crate::{Error, Result, shared_mem::SharedRegion};

const RD: usize = 0;
const WR: usize = 1;
const ELEMENT_SIZE: usize = 2;
const MAX_ELEMENTS: usize = 3;
const HEADER_WORDS: usize = 4;

pub struct IpcQue;

impl IpcQue {
    /// Number of words a ring of the given geometry needs.
    pub fn region_words(max_elements: u32, element_size: u32) -> usize {
        HEADER_WORDS + max_elements as usize * element_size.div_ceil(4) as usize
    }

    /// Lays out a ring in `region` and returns its two ends.
    ///
    /// # Arguments
    ///
    /// * `region` - Backing words, at least [`IpcQue::region_words`] long
    /// * `max_elements` - Ring capacity
    /// * `element_size` - Bytes per element, a non-zero multiple of 4
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] on a zero or misaligned geometry or a
    /// region that is too small.
    ///
    /// # Examples
    ///
    /// ```
    /// use links::{SharedHeap, ipc_que::IpcQue};
    ///
    /// # fn main() -> Result<(), links::Error> {
    /// let heap = SharedHeap::new(4096);
    /// let region = heap.alloc_region(IpcQue::region_words(4, 8))?;
    /// let (mut writer, mut reader) = IpcQue::create(region, 4, 8)?;
    /// writer.write(&[1, 2, 3, 4, 5, 6, 7, 8])?;
    /// let mut element = [0u8; 8];
    /// reader.read(&mut element)?;
    /// assert_eq!(element[7], 8);
    /// # Ok(())
    /// # }
    /// ```
    pub fn create(
        region: SharedRegion,
        max_elements: u32,
        element_size: u32,
    ) -> Result<(IpcQueWriter, IpcQueReader)> {
        if max_elements == 0 || element_size == 0 || element_size % 4 != 0 {
            return Err(Error::InvalidParams(format!(
                "Invalid ring geometry: {max_elements} elements of {element_size} bytes."
            )));
        }
        let needed = Self::region_words(max_elements, element_size);
        if region.len() < needed {
            return Err(Error::InvalidParams(format!(
                "Ring needs {needed} words, region has {}.",
                region.len()
            )));
        }
        region.store(RD, 0, Ordering::Relaxed);
        region.store(WR, 0, Ordering::Relaxed);
        region.store(ELEMENT_SIZE, element_size, Ordering::Relaxed);
        region.store(MAX_ELEMENTS, max_elements, Ordering::Release);

        let ring = Ring::attach(region.clone())?;
        Ok((
            IpcQueWriter { ring },
            IpcQueReader {
                ring: Ring::attach(region)?,
            },
        ))
    }
}

/// Geometry cached from the header, re-read by `reset`.
struct Ring {
    region: SharedRegion,
    element_size: u32,
    max_elements: u32,
}

impl Ring {
    fn attach(region: SharedRegion) -> Result<Self> {
        let mut ring = Ring {
            region,
            element_size: 0,
            max_elements: 0,
        };
        ring.reload()?;
        Ok(ring)
    }

    fn reload(&mut self) -> Result<()> {
        self.max_elements = self.region.load(MAX_ELEMENTS, Ordering::Acquire);
        self.element_size = self.region.load(ELEMENT_SIZE, Ordering::Relaxed);
        self.check()
    }

    /// Fails once the ring has been deleted.
    fn check(&self) -> Result<()> {
        if self.max_elements == 0
            || self.element_size == 0
            || self.region.load(MAX_ELEMENTS, Ordering::Acquire) == 0
        {
            return Err(Error::InvalidParams("IPC ring has been deleted.".into()));
        }
        Ok(())
    }

    fn len(&self) -> u32 {
        let wr = self.region.load(WR, Ordering::Acquire);
        let rd = self.region.load(RD, Ordering::Acquire);
        wr.wrapping_sub(rd)
    }

    fn slot(&self, counter: u32) -> usize {
        HEADER_WORDS + (counter % self.max_elements) as usize * (self.element_size / 4) as usize
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.element_size as usize {
            return Err(Error::InvalidParams(format!(
                "Element of {len} bytes on a ring of {}-byte elements.",
                self.element_size
            )));
        }
        Ok(())
    }

    fn delete(&self) {
        self.region.store(ELEMENT_SIZE, 0, Ordering::Relaxed);
        self.region.store(MAX_ELEMENTS, 0, Ordering::Release);
    }
}

/// Writing end of a ring.
pub struct IpcQueWriter {
    ring: Ring,
}

impl IpcQueWriter {
    /// Copies one element into the ring.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if the ring is full; the element is not
    /// written and nothing is overwritten.
    pub fn write(&mut self, element: &[u8]) -> Result<()> {
        self.ring.check()?;
        self.ring.check_len(element.len())?;
        if self.ring.len() >= self.ring.max_elements {
            return Err(Error::QueueFull);
        }
        let wr = self.ring.region.load(WR, Ordering::Relaxed);
        let base = self.ring.slot(wr);
        for (i, chunk) in element.chunks_exact(4).enumerate() {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.ring.region.store(base + i, word, Ordering::Relaxed);
        }
        self.ring
            .region
            .store(WR, wr.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.ring.len() >= self.ring.max_elements
    }

    pub fn is_empty(&self) -> bool {
        self.ring.len() == 0
    }

    pub fn len(&self) -> usize {
        self.ring.len() as usize
    }

    pub fn element_size(&self) -> usize {
        self.ring.element_size as usize
    }

    /// Re-reads the ring geometry from the shared header.
    pub fn reset(&mut self) -> Result<()> {
        self.ring.reload()
    }

    /// Zeroes the header; both ends fail from now on.
    pub fn delete(self) {
        self.ring.delete();
    }
}

/// Reading end of a ring.
pub struct IpcQueReader {
    ring: Ring,
}

impl IpcQueReader {
    /// Copies the oldest element into `element`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] if the ring is empty.
    pub fn read(&mut self, element: &mut [u8]) -> Result<()> {
        self.ring.check()?;
        self.ring.check_len(element.len())?;
        if self.ring.len() == 0 {
            return Err(Error::NotReady);
        }
        let rd = self.ring.region.load(RD, Ordering::Relaxed);
        let base = self.ring.slot(rd);
        for (i, chunk) in element.chunks_exact_mut(4).enumerate() {
            let word = self.ring.region.load(base + i, Ordering::Relaxed);
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        self.ring
            .region
            .store(RD, rd.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.ring.len() >= self.ring.max_elements
    }

    pub fn is_empty(&self) -> bool {
        self.ring.len() == 0
    }

    pub fn len(&self) -> usize {
        self.ring.len() as usize
    }

    pub fn element_size(&self) -> usize {
        self.ring.element_size as usize
    }

    pub fn reset(&mut self) -> Result<()> {
        self.ring.reload()
    }

    pub fn delete(self) {
        self.ring.delete();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::shared_mem::SharedHeap;

    fn ring(max: u32, size: u32) -> (IpcQueWriter, IpcQueReader) {
        let heap = SharedHeap::new(1 << 16);
        let region = heap.alloc_region(IpcQue::region_words(max, size)).unwrap();
        IpcQue::create(region, max, size).unwrap()
    }

    #[test]
    fn geometry_is_validated() {
        let heap = SharedHeap::new(1 << 16);
        let region = heap.alloc_region(8).unwrap();
        assert!(IpcQue::create(region.clone(), 4, 6).is_err());
        assert!(IpcQue::create(region.clone(), 0, 4).is_err());
        assert!(IpcQue::create(region, 4, 8).is_err());
    }

    #[test]
    fn ninth_write_to_eight_slot_ring_is_rejected() {
        let (mut writer, mut reader) = ring(8, 4);
        for i in 0..8u32 {
            writer.write(&i.to_le_bytes()).unwrap();
        }
        assert!(writer.is_full());
        assert!(matches!(
            writer.write(&99u32.to_le_bytes()),
            Err(Error::QueueFull)
        ));

        // the oldest element was not overwritten
        let mut element = [0u8; 4];
        reader.read(&mut element).unwrap();
        assert_eq!(u32::from_le_bytes(element), 0);
    }

    #[test]
    fn delete_disables_both_ends() {
        let (writer, mut reader) = ring(4, 4);
        writer.delete();
        let mut element = [0u8; 4];
        assert!(matches!(
            reader.read(&mut element),
            Err(Error::InvalidParams(_))
        ));
        assert!(reader.reset().is_err());
    }

    #[test]
    fn counters_survive_many_wraps_across_threads() {
        let (mut writer, mut reader) = ring(4, 8);
        const COUNT: u64 = 10_000;
        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                while writer.write(&i.to_le_bytes()).is_err() {
                    thread::yield_now();
                }
            }
        });
        let mut element = [0u8; 8];
        for expected in 0..COUNT {
            while reader.read(&mut element).is_err() {
                thread::yield_now();
            }
            assert_eq!(u64::from_le_bytes(element), expected);
        }
        producer.join().unwrap();
        assert!(reader.is_empty());
    }
}
