// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Byte oriented migration stream.
//!
//! Writers and readers never fail individually. The first I/O error is
//! latched and every later access turns into a no-op, callers check the
//! stream state at the points where a failure matters.

use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::MigratableError;

pub trait MigrationStream {
    fn put_byte(&mut self, v: u8);
    fn put_be32(&mut self, v: u32);
    fn put_be64(&mut self, v: u64);
    fn put_buffer(&mut self, buf: &[u8]);
    fn get_byte(&mut self) -> u8;
    fn get_be32(&mut self) -> u32;
    fn get_be64(&mut self) -> u64;
    /// Fills `buf` entirely, or latches an error.
    fn get_buffer(&mut self, buf: &mut [u8]);
    fn flush(&mut self);
    /// Marks the stream as failed. Only the first error is kept.
    fn set_error(&mut self, error: io::Error);
    fn error(&self) -> Option<&io::Error>;

    /// Turns a latched error into a `MigratableError`.
    fn check(&self) -> Result<(), MigratableError> {
        match self.error() {
            Some(e) => Err(MigratableError::Stream(io::Error::new(e.kind(), e.to_string()))),
            None => Ok(()),
        }
    }
}

/// A `MigrationStream` over any reader/writer: a socket, a file or memory.
pub struct IoStream<T> {
    inner: T,
    error: Option<io::Error>,
}

/// An in memory stream, used for local save/restore and tests.
pub type BufferStream = IoStream<Cursor<Vec<u8>>>;

impl<T> IoStream<T> {
    pub fn new(inner: T) -> Self {
        IoStream { inner, error: None }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    fn latch<R: Default>(&mut self, r: io::Result<R>) -> R {
        match r {
            Ok(v) => v,
            Err(e) => {
                self.latch_error(e);
                R::default()
            }
        }
    }

    fn latch_error(&mut self, error: io::Error) {
        if self.error.is_none() {
            debug!("Migration stream error: {}", error);
            self.error = Some(error);
        }
    }
}

impl BufferStream {
    pub fn buffer() -> Self {
        IoStream::new(Cursor::new(Vec::new()))
    }

    /// A stream reading back `data` from the start.
    pub fn reader(data: Vec<u8>) -> Self {
        IoStream::new(Cursor::new(data))
    }

    pub fn data(&self) -> &[u8] {
        self.inner.get_ref()
    }
}

impl<T: Read + Write> MigrationStream for IoStream<T> {
    fn put_byte(&mut self, v: u8) {
        if self.error.is_none() {
            let r = self.inner.write_u8(v);
            self.latch(r)
        }
    }

    fn put_be32(&mut self, v: u32) {
        if self.error.is_none() {
            let r = self.inner.write_u32::<BigEndian>(v);
            self.latch(r)
        }
    }

    fn put_be64(&mut self, v: u64) {
        if self.error.is_none() {
            let r = self.inner.write_u64::<BigEndian>(v);
            self.latch(r)
        }
    }

    fn put_buffer(&mut self, buf: &[u8]) {
        if self.error.is_none() {
            let r = self.inner.write_all(buf);
            self.latch(r)
        }
    }

    fn get_byte(&mut self) -> u8 {
        if self.error.is_some() {
            return 0;
        }
        let r = self.inner.read_u8();
        self.latch(r)
    }

    fn get_be32(&mut self) -> u32 {
        if self.error.is_some() {
            return 0;
        }
        let r = self.inner.read_u32::<BigEndian>();
        self.latch(r)
    }

    fn get_be64(&mut self) -> u64 {
        if self.error.is_some() {
            return 0;
        }
        let r = self.inner.read_u64::<BigEndian>();
        self.latch(r)
    }

    fn get_buffer(&mut self, buf: &mut [u8]) {
        if self.error.is_none() {
            let r = self.inner.read_exact(buf);
            self.latch(r)
        }
    }

    fn flush(&mut self) {
        if self.error.is_none() {
            let r = self.inner.flush();
            self.latch(r)
        }
    }

    fn set_error(&mut self, error: io::Error) {
        self.latch_error(error)
    }

    fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_layout() {
        let mut s = BufferStream::buffer();
        s.put_byte(0x20);
        s.put_be32(0x0102_0304);
        s.put_be64(0x400);
        s.put_buffer(b"ram");
        assert!(s.check().is_ok());
        assert_eq!(
            s.data(),
            &[0x20, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 4, 0, b'r', b'a', b'm']
        );

        let mut r = BufferStream::reader(s.into_inner().into_inner());
        assert_eq!(r.get_byte(), 0x20);
        assert_eq!(r.get_be32(), 0x0102_0304);
        assert_eq!(r.get_be64(), 0x400);
        let mut name = [0u8; 3];
        r.get_buffer(&mut name);
        assert_eq!(&name, b"ram");
        assert!(r.check().is_ok());
    }

    #[test]
    fn short_read_latches_error() {
        let mut r = BufferStream::reader(vec![1, 2]);
        assert_eq!(r.get_be32(), 0);
        assert!(r.error().is_some());
        // Sticky, even though a byte would be available.
        assert_eq!(r.get_byte(), 0);
        assert!(matches!(r.check(), Err(MigratableError::Stream(_))));
    }
}
