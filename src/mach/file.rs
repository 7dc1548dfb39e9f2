/*!
## File-system port

Sequential and fixed-record random access behind a trait, so tests and
embedding hosts can substitute their own storage.

*/

use crate::lang::ast::FileMode;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};

pub trait FileHandle {
    fn read_line(&mut self) -> io::Result<Option<String>>;
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn read_chars(&mut self, n: usize) -> io::Result<Vec<u8>>;
    fn eof(&mut self) -> bool;
    fn position(&mut self) -> u64;
    fn length(&mut self) -> u64;
    /// Seeks to a 1-based record.
    fn seek_record(&mut self, record: usize, record_length: usize) -> io::Result<()>;
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_raw(&mut self, buf: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

pub trait FileSystem {
    fn open(
        &mut self,
        path: &str,
        mode: FileMode,
        record_length: usize,
    ) -> Option<Box<dyn FileHandle>>;
    fn exists(&self, path: &str) -> bool;
    fn remove(&mut self, path: &str) -> bool;
    fn rename(&mut self, old: &str, new: &str) -> bool;
}

/// Native file system over `std::fs`.
pub struct NativeFileSystem;

impl FileSystem for NativeFileSystem {
    fn open(
        &mut self,
        path: &str,
        mode: FileMode,
        _record_length: usize,
    ) -> Option<Box<dyn FileHandle>> {
        let file = match mode {
            FileMode::Input => File::open(path).ok()?,
            FileMode::Output => File::create(path).ok()?,
            FileMode::Append => OpenOptions::new().append(true).create(true).open(path).ok()?,
            FileMode::Random => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .ok()?,
        };
        Some(Box::new(NativeFileHandle { file }))
    }

    fn exists(&self, path: &str) -> bool {
        std::path::Path::new(path).exists()
    }

    fn remove(&mut self, path: &str) -> bool {
        std::fs::remove_file(path).is_ok()
    }

    fn rename(&mut self, old: &str, new: &str) -> bool {
        std::fs::rename(old, new).is_ok()
    }
}

pub struct NativeFileHandle {
    file: File,
}

impl FileHandle for NativeFileHandle {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut bytes = vec![];
        let mut one = [0u8; 1];
        loop {
            match self.file.read(&mut one)? {
                0 => break,
                _ => {
                    if one[0] == b'\n' {
                        break;
                    }
                    bytes.push(one[0]);
                }
            }
        }
        if bytes.is_empty() && self.eof() {
            return Ok(None);
        }
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        Ok(Some(super::val::bytes_string(&bytes)))
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    fn read_chars(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let mut read = 0;
        while read < n {
            match self.file.read(&mut buf[read..])? {
                0 => break,
                got => read += got,
            }
        }
        buf.truncate(read);
        Ok(buf)
    }

    fn eof(&mut self) -> bool {
        self.position() >= self.length()
    }

    fn position(&mut self) -> u64 {
        self.file.seek(SeekFrom::Current(0)).unwrap_or(0)
    }

    fn length(&mut self) -> u64 {
        let current = self.position();
        let end = self.file.seek(SeekFrom::End(0)).unwrap_or(0);
        let _ = self.file.seek(SeekFrom::Start(current));
        end
    }

    fn seek_record(&mut self, record: usize, record_length: usize) -> io::Result<()> {
        let offset = (record.saturating_sub(1) * record_length) as u64;
        self.file.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            match self.file.read(&mut buf[read..])? {
                0 => break,
                got => read += got,
            }
        }
        Ok(read)
    }

    fn write_raw(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
