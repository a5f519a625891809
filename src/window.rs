use std::io::{self, Read, Seek, SeekFrom, Write};

/// Sub-view over a seekable stream with its own cursor.
///
/// Every access seeks the source absolutely, so several windows can share
/// one stream as long as they are not used concurrently. An optional length
/// clamps reads and writes; without one the window extends to the end of
/// the source.
pub struct IOWindow<'a, S> {
    source: &'a mut S,
    start: u64,
    length: Option<u64>,
    pos: u64,
}

impl<'a, S: Seek> IOWindow<'a, S> {
    pub fn new(source: &'a mut S, start: u64) -> io::Result<Self> {
        source.seek(SeekFrom::Start(start))?;
        Ok(IOWindow {
            source,
            start,
            length: None,
            pos: 0,
        })
    }

    pub fn with_length(source: &'a mut S, start: u64, length: u64) -> io::Result<Self> {
        source.seek(SeekFrom::Start(start))?;
        Ok(IOWindow {
            source,
            start,
            length: Some(length),
            pos: 0,
        })
    }

    /// Bytes left before the window's length bound, if it has one.
    fn remaining(&self) -> Option<u64> {
        self.length.map(|len| len.saturating_sub(self.pos))
    }
}

impl<'a, S: Read + Seek> Read for IOWindow<'a, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max = match self.remaining() {
            Some(rem) => (rem.min(buf.len() as u64)) as usize,
            None => buf.len(),
        };
        if max == 0 {
            return Ok(0);
        }
        self.source.seek(SeekFrom::Start(self.start + self.pos))?;
        let read = self.source.read(&mut buf[..max])?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl<'a, S: Write + Seek> Write for IOWindow<'a, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let max = match self.remaining() {
            Some(rem) => (rem.min(buf.len() as u64)) as usize,
            None => buf.len(),
        };
        if max == 0 && !buf.is_empty() {
            return Ok(0);
        }
        self.source.seek(SeekFrom::Start(self.start + self.pos))?;
        let written = self.source.write(&buf[..max])?;
        self.pos += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.source.flush()
    }
}

impl<'a, S: Seek> Seek for IOWindow<'a, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(off) => self.pos as i64 + off,
            SeekFrom::End(off) => match self.length {
                Some(len) => len as i64 + off,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "window has no length, cannot seek from the end",
                    ))
                }
            },
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of window",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }
}

#[cfg(test)]
mod test {
    use super::IOWindow;
    use std::io::{Cursor, Read, Seek, SeekFrom, Write};

    #[test]
    fn reads_are_relative_to_start() {
        let mut inner = Cursor::new((0u8..32).collect::<Vec<u8>>());
        let mut window = IOWindow::new(&mut inner, 8).unwrap();
        let mut buf = [0u8; 4];
        window.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [8, 9, 10, 11]);
        window.seek(SeekFrom::Start(0)).unwrap();
        window.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [8, 9, 10, 11]);
    }

    #[test]
    fn window_ignores_outer_cursor_moves() {
        let mut inner = Cursor::new(vec![0u8; 64]);
        let mut window = IOWindow::new(&mut inner, 16).unwrap();
        window.write_all(&[1, 2, 3]).unwrap();
        // move the source cursor behind the window's back
        window.source.seek(SeekFrom::Start(0)).unwrap();
        window.write_all(&[4]).unwrap();
        assert_eq!(&inner.get_ref()[16..20], &[1, 2, 3, 4]);
    }

    #[test]
    fn length_bound_clamps_reads() {
        let mut inner = Cursor::new((0u8..32).collect::<Vec<u8>>());
        let mut window = IOWindow::with_length(&mut inner, 4, 6).unwrap();
        let mut buf = Vec::new();
        window.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn length_bound_rejects_long_writes() {
        let mut inner = Cursor::new(vec![0u8; 32]);
        let mut window = IOWindow::with_length(&mut inner, 0, 2).unwrap();
        assert!(window.write_all(&[1, 2, 3]).is_err());
    }

    #[test]
    fn seek_from_end_needs_a_length() {
        let mut inner = Cursor::new(vec![0u8; 8]);
        let mut window = IOWindow::new(&mut inner, 0).unwrap();
        assert!(window.seek(SeekFrom::End(-1)).is_err());
        let mut window = IOWindow::with_length(&mut inner, 0, 8).unwrap();
        assert_eq!(window.seek(SeekFrom::End(-1)).unwrap(), 7);
    }
}
