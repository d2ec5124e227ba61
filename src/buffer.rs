use nix::sys::uio::readv;
use std::io;
use std::io::IoSliceMut;
use std::os::fd::BorrowedFd;

/// Bytes a fresh buffer can hold before its first growth.
const INITIAL_SIZE: usize = 1024;

/// Stack-side scratch space for scatter reads.
const EXTRA_BUF_SIZE: usize = 65536;

/// A byte buffer with separate read and write positions.
///
/// Connections keep one buffer per direction: readable bytes sit between the
/// read position and the end of storage, and consumers may retrieve any
/// prefix while the residue stays put. Storage is compacted lazily when the
/// consumed prefix grows large.
pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            data: Vec::with_capacity(INITIAL_SIZE),
            read_index: 0,
        }
    }

    /// Number of bytes available for reading.
    pub fn readable_bytes(&self) -> usize {
        self.data.len() - self.read_index
    }

    /// Returns the readable bytes without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_index..]
    }

    /// Consumes `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        self.read_index += n;
        if self.read_index == self.data.len() {
            self.data.clear();
            self.read_index = 0;
        }
    }

    /// Consumes everything.
    pub fn retrieve_all(&mut self) {
        self.data.clear();
        self.read_index = 0;
    }

    /// Consumes everything, returning the bytes.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    /// Consumes everything, returning the bytes as a lossy string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_bytes()).into_owned()
    }

    /// Appends `bytes` after the current readable region.
    pub fn append(&mut self, bytes: &[u8]) {
        self.make_space();
        self.data.extend_from_slice(bytes);
    }

    // Reclaim the consumed prefix once it dominates the storage, instead of
    // growing forever under a slow consumer.
    fn make_space(&mut self) {
        if self.read_index > INITIAL_SIZE && self.read_index * 2 >= self.data.len() {
            self.data.drain(..self.read_index);
            self.read_index = 0;
        }
    }

    /// Reads from `fd` directly into the buffer.
    ///
    /// A scatter read into the buffer's tail plus a large stack scratch
    /// captures bursts far beyond the buffered capacity in one syscall; the
    /// scratch overflow is appended afterwards.
    pub fn read_fd(&mut self, fd: BorrowedFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        self.make_space();
        let old_len = self.data.len();
        let chunk = (self.data.capacity() - old_len).max(INITIAL_SIZE);
        self.data.resize(old_len + chunk, 0);

        let read = {
            let (_, tail) = self.data.split_at_mut(old_len);
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            readv(fd, &mut iov)
        };
        let n = match read {
            Ok(n) => n,
            Err(err) => {
                self.data.truncate(old_len);
                return Err(err.into());
            }
        };

        if n <= chunk {
            self.data.truncate(old_len + n);
        } else {
            self.data.extend_from_slice(&extra[..n - chunk]);
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;
    use std::os::fd::AsFd;

    #[test]
    fn append_and_retrieve() {
        let mut buffer = Buffer::new();
        assert_eq!(buffer.readable_bytes(), 0);

        buffer.append(b"hello ");
        buffer.append(b"world");
        assert_eq!(buffer.readable_bytes(), 11);
        assert_eq!(buffer.peek(), b"hello world");

        buffer.retrieve(6);
        assert_eq!(buffer.peek(), b"world");
        assert_eq!(buffer.retrieve_all_as_string(), "world");
        assert_eq!(buffer.readable_bytes(), 0);
    }

    #[test]
    fn retrieve_resets_positions_when_drained() {
        let mut buffer = Buffer::new();
        buffer.append(b"abcd");
        buffer.retrieve(4);
        assert_eq!(buffer.readable_bytes(), 0);
        buffer.append(b"efgh");
        assert_eq!(buffer.peek(), b"efgh");
    }

    #[test]
    fn compacts_consumed_prefix() {
        let mut buffer = Buffer::new();
        buffer.append(&[b'x'; 4096]);
        buffer.retrieve(4000);
        buffer.append(b"tail");
        assert_eq!(buffer.readable_bytes(), 100);
        assert_eq!(&buffer.peek()[96..], b"tail");
    }

    #[test]
    fn reads_from_a_pipe() {
        let (reader, writer) = unistd::pipe().unwrap();
        unistd::write(&writer, b"some bytes").unwrap();

        let mut buffer = Buffer::new();
        let n = buffer.read_fd(reader.as_fd()).unwrap();
        assert_eq!(n, 10);
        assert_eq!(buffer.peek(), b"some bytes");
    }

    #[test]
    fn reads_past_the_buffered_capacity() {
        let payload = vec![b'z'; 100_000];
        let (reader, writer) = unistd::pipe().unwrap();

        let written = payload.clone();
        let feeder = std::thread::spawn(move || {
            let mut offset = 0;
            while offset < written.len() {
                offset += unistd::write(&writer, &written[offset..]).unwrap();
            }
        });

        let mut buffer = Buffer::new();
        while buffer.readable_bytes() < payload.len() {
            buffer.read_fd(reader.as_fd()).unwrap();
        }
        feeder.join().unwrap();
        assert_eq!(buffer.peek(), &payload[..]);
    }
}
