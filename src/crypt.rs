use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::{
    crypto::{decrypt_group, hash_encrypt_group},
    BLOCKS_PER_GROUP, BLOCK_DATA_OFFSET, BLOCK_DATA_SIZE, BLOCK_SIZE, GROUP_DATA_SIZE, GROUP_SIZE,
    H3_TABLE_SIZE,
};

fn group_box() -> Box<[u8; GROUP_SIZE as usize]> {
    vec![0u8; GROUP_SIZE as usize]
        .into_boxed_slice()
        .try_into()
        .unwrap()
}

fn group_data_box() -> Box<[u8; GROUP_DATA_SIZE as usize]> {
    vec![0u8; GROUP_DATA_SIZE as usize]
        .into_boxed_slice()
        .try_into()
        .unwrap()
}

/// Plaintext random access over the encrypted data area of a partition.
///
/// Keeps the plaintext of the most recently touched group in a single cache
/// slot, so consecutive reads from the same group hit the underlying stream
/// only once. The stream is re-seeked absolutely for every group load; the
/// reader owns no other stream state.
pub struct CryptPartReader<'a, RS: Read + Seek> {
    stream: &'a mut RS,
    data_offset: u64,
    title_key: [u8; 16],
    cached_group: Option<u64>,
    cache: Box<[u8; GROUP_DATA_SIZE as usize]>,
    raw_buf: Box<[u8; GROUP_SIZE as usize]>,
    position: u64,
}

impl<'a, RS: Read + Seek> CryptPartReader<'a, RS> {
    /// `data_offset` is the absolute offset of the first ciphertext group.
    pub fn new(stream: &'a mut RS, data_offset: u64, title_key: [u8; 16]) -> Self {
        CryptPartReader {
            stream,
            data_offset,
            title_key,
            cached_group: None,
            cache: group_data_box(),
            raw_buf: group_box(),
            position: 0,
        }
    }

    fn ensure_group(&mut self, group: u64) -> io::Result<()> {
        if self.cached_group == Some(group) {
            return Ok(());
        }
        self.stream
            .seek(SeekFrom::Start(self.data_offset + group * GROUP_SIZE))?;
        self.stream.read_exact(self.raw_buf.as_mut())?;
        decrypt_group(&self.raw_buf, &self.title_key, &mut self.cache);
        self.cached_group = Some(group);
        Ok(())
    }

    /// Reads `length` plaintext bytes at `offset` into the buffer, clearing
    /// it first. Does not move the reader's own position.
    pub fn read_into_vec(
        &mut self,
        mut offset: u64,
        length: u64,
        buffer: &mut Vec<u8>,
    ) -> io::Result<()> {
        buffer.clear();
        buffer.reserve(length as usize);
        while (buffer.len() as u64) < length {
            let group = offset / GROUP_DATA_SIZE;
            let offset_in_group = offset % GROUP_DATA_SIZE;
            let count_to_copy =
                (GROUP_DATA_SIZE - offset_in_group).min(length - buffer.len() as u64);
            self.ensure_group(group)?;
            buffer.extend_from_slice(
                &self.cache[offset_in_group as usize..][..count_to_copy as usize],
            );
            offset += count_to_copy;
        }
        Ok(())
    }

    pub fn read_at(&mut self, offset: u64, size: usize) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.read_into_vec(offset, size as u64, &mut buffer)?;
        Ok(buffer)
    }
}

impl<'a, RS: Read + Seek> Read for CryptPartReader<'a, RS> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read_bytes = 0;
        while read_bytes < buf.len() {
            let group = self.position / GROUP_DATA_SIZE;
            let offset_in_group = self.position % GROUP_DATA_SIZE;
            let count_to_copy =
                ((GROUP_DATA_SIZE - offset_in_group) as usize).min(buf.len() - read_bytes);
            self.ensure_group(group)?;
            buf[read_bytes..][..count_to_copy]
                .copy_from_slice(&self.cache[offset_in_group as usize..][..count_to_copy]);
            self.position += count_to_copy as u64;
            read_bytes += count_to_copy;
        }
        Ok(read_bytes)
    }
}

impl<'a, RS: Read + Seek> Seek for CryptPartReader<'a, RS> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(off) => self.position as i64 + off,
            // the plaintext extent is not tracked here
            SeekFrom::End(_) => return Err(io::Error::from(io::ErrorKind::Unsupported)),
        };
        self.position = new_pos.max(0) as u64;
        Ok(self.position)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.position)
    }
}

/// Append-only encrypting sink for a partition's data area.
///
/// Plaintext is buffered until a full group's worth (0x1F0000 bytes) is
/// available, then hashed, encrypted and written as one 2 MiB group. H3
/// entries accumulate per group; `close` pads and flushes a trailing
/// partial group.
pub struct CryptPartWriter<'a, W: Write + Seek> {
    stream: &'a mut W,
    data_offset: u64,
    title_key: [u8; 16],
    current_position: u64,
    buffer: Box<[u8; GROUP_DATA_SIZE as usize]>,
    buffer_size: usize,
    scratch: Box<[u8; GROUP_SIZE as usize]>,
    h3: Vec<u8>,
    filled_groups: u64,
}

impl<'a, W: Write + Seek> CryptPartWriter<'a, W> {
    pub fn new(stream: &'a mut W, data_offset: u64, title_key: [u8; 16]) -> Self {
        CryptPartWriter {
            stream,
            data_offset,
            title_key,
            current_position: 0,
            buffer: group_data_box(),
            buffer_size: 0,
            scratch: group_box(),
            h3: Vec::new(),
            filled_groups: 0,
        }
    }

    /// Total plaintext bytes accepted so far, padding excluded.
    pub fn current_position(&self) -> u64 {
        self.current_position
    }

    pub fn filled_groups(&self) -> u64 {
        self.filled_groups
    }

    fn flush_group(&mut self) -> io::Result<()> {
        if self.buffer_size == 0 {
            return Ok(());
        }
        if self.buffer_size < GROUP_DATA_SIZE as usize {
            self.buffer[self.buffer_size..].fill(0);
        }

        self.scratch.fill(0);
        for block in 0..BLOCKS_PER_GROUP as usize {
            self.scratch[block * BLOCK_SIZE as usize + BLOCK_DATA_OFFSET as usize..]
                [..BLOCK_DATA_SIZE as usize]
                .copy_from_slice(
                    &self.buffer[block * BLOCK_DATA_SIZE as usize..][..BLOCK_DATA_SIZE as usize],
                );
        }
        let h3_entry = hash_encrypt_group(&mut self.scratch, &self.title_key);
        self.h3.extend_from_slice(&h3_entry);

        self.stream.seek(SeekFrom::Start(
            self.data_offset + self.filled_groups * GROUP_SIZE,
        ))?;
        self.stream.write_all(self.scratch.as_ref())?;
        self.filled_groups += 1;
        self.buffer_size = 0;
        Ok(())
    }

    /// Encrypts and writes any buffered partial group, zero padded to a
    /// full group.
    pub fn close(&mut self) -> io::Result<()> {
        self.flush_group()
    }

    /// The accumulated H3 hashes, zero padded to the fixed table size.
    pub fn h3_table(&self) -> Vec<u8> {
        let mut table = self.h3.clone();
        table.resize(H3_TABLE_SIZE as usize, 0);
        table
    }
}

impl<'a, W: Write + Seek> Write for CryptPartWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            let space_left = GROUP_DATA_SIZE as usize - self.buffer_size;
            let chunk = space_left.min(buf.len() - offset);
            self.buffer[self.buffer_size..][..chunk].copy_from_slice(&buf[offset..][..chunk]);
            self.buffer_size += chunk;
            self.current_position += chunk as u64;
            offset += chunk;
            if self.buffer_size == GROUP_DATA_SIZE as usize {
                self.flush_group()?;
            }
        }
        Ok(buf.len())
    }

    /// Flushes the inner stream only; a buffered partial group stays put
    /// until `close`, because flushing it would commit zero padding in the
    /// middle of the plaintext.
    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod test {
    use std::io::{Cursor, Read, Seek, SeekFrom, Write};

    use super::{CryptPartReader, CryptPartWriter};
    use crate::{GROUP_DATA_SIZE, GROUP_SIZE, H3_TABLE_SIZE};

    const KEY: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

    fn sample_plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn encrypt_all(plaintext: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut out = Cursor::new(Vec::new());
        let mut writer = CryptPartWriter::new(&mut out, 0, KEY);
        writer.write_all(plaintext).unwrap();
        writer.close().unwrap();
        let h3 = writer.h3_table();
        (out.into_inner(), h3)
    }

    struct CountingStream<T> {
        inner: T,
        reads: usize,
        bytes_read: u64,
    }

    impl<T: Read> Read for CountingStream<T> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.reads += 1;
            self.bytes_read += n as u64;
            Ok(n)
        }
    }

    impl<T: Seek> Seek for CountingStream<T> {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn writer_then_reader_roundtrip() {
        let plaintext = sample_plaintext(GROUP_DATA_SIZE as usize + 0x1234);
        let (encrypted, _) = encrypt_all(&plaintext);
        assert_eq!(encrypted.len() as u64, 2 * GROUP_SIZE);

        let mut stream = Cursor::new(encrypted);
        let mut reader = CryptPartReader::new(&mut stream, 0, KEY);
        assert_eq!(reader.read_at(0, plaintext.len()).unwrap(), plaintext);
        // a window crossing the group boundary
        let cross = reader.read_at(GROUP_DATA_SIZE - 100, 300).unwrap();
        assert_eq!(
            cross,
            &plaintext[(GROUP_DATA_SIZE - 100) as usize..][..300]
        );
        // padding past the written plaintext reads back as zeroes
        let tail = reader.read_at(plaintext.len() as u64, 16).unwrap();
        assert_eq!(tail, vec![0u8; 16]);
    }

    #[test]
    fn chunked_writes_match_single_write() {
        let plaintext = sample_plaintext(GROUP_DATA_SIZE as usize + 0x605);
        let (single, h3_single) = encrypt_all(&plaintext);

        let mut out = Cursor::new(Vec::new());
        let mut writer = CryptPartWriter::new(&mut out, 0, KEY);
        for chunk in plaintext.chunks(977) {
            writer.write_all(chunk).unwrap();
        }
        writer.close().unwrap();
        assert_eq!(writer.current_position(), plaintext.len() as u64);
        assert_eq!(writer.filled_groups(), 2);
        let h3_chunked = writer.h3_table();
        assert_eq!(out.into_inner(), single);
        assert_eq!(h3_chunked, h3_single);
    }

    #[test]
    fn h3_table_has_fixed_size() {
        let (_, h3) = encrypt_all(&sample_plaintext(100));
        assert_eq!(h3.len() as u64, H3_TABLE_SIZE);
        // one group written: exactly one non-zero entry
        assert!(h3[..20].iter().any(|b| *b != 0));
        assert!(h3[20..].iter().all(|b| *b == 0));
    }

    #[test]
    fn close_on_empty_writer_writes_nothing() {
        let mut out = Cursor::new(Vec::new());
        let mut writer = CryptPartWriter::new(&mut out, 0, KEY);
        writer.close().unwrap();
        assert_eq!(writer.current_position(), 0);
        assert_eq!(writer.filled_groups(), 0);
        assert!(out.into_inner().is_empty());
    }

    #[test]
    fn same_group_reads_hit_the_stream_once() {
        let plaintext = sample_plaintext(GROUP_DATA_SIZE as usize * 2);
        let (encrypted, _) = encrypt_all(&plaintext);

        let mut counting = CountingStream {
            inner: Cursor::new(encrypted),
            reads: 0,
            bytes_read: 0,
        };
        let mut reader = CryptPartReader::new(&mut counting, 0, KEY);
        assert_eq!(reader.read_at(0, 100).unwrap(), &plaintext[..100]);
        assert_eq!(reader.read_at(50, 200).unwrap(), &plaintext[50..250]);
        assert_eq!(counting.reads, 1);
        assert_eq!(counting.bytes_read, GROUP_SIZE);

        let mut reader = CryptPartReader::new(&mut counting, 0, KEY);
        reader.read_at(GROUP_DATA_SIZE, 10).unwrap();
        assert_eq!(counting.reads, 2);
    }

    #[test]
    fn reader_positions_track_seeks() {
        let plaintext = sample_plaintext(0x3000);
        let (encrypted, _) = encrypt_all(&plaintext);
        let mut stream = Cursor::new(encrypted);
        let mut reader = CryptPartReader::new(&mut stream, 0, KEY);

        reader.seek(SeekFrom::Start(0x100)).unwrap();
        let mut buf = [0u8; 0x40];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &plaintext[0x100..0x140]);
        assert_eq!(reader.stream_position().unwrap(), 0x140);
        reader.seek(SeekFrom::Current(-0x40)).unwrap();
        assert_eq!(reader.stream_position().unwrap(), 0x100);
        assert!(reader.seek(SeekFrom::End(0)).is_err());
    }
}
