use std::{
    borrow::Cow,
    convert::Infallible,
    error::Error,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
};

use binrw::BinWriterExt;

use crate::{
    crypt::{CryptPartReader, CryptPartWriter},
    fst::{FstNode, FstToBytes, FstToBytesError},
    reader::{read_apploader, read_bi2, read_dol, WiiPartition, APPLOADER_OFFSET},
    structs::{Certificate, DiscHeader, WiiPartTableEntry, WiiPartType, WiiPartitionHeader, TMD},
    window::IOWindow,
    GROUP_DATA_SIZE, GROUP_SIZE,
};

/// Absolute offset of the first partition in a freshly built image.
pub const FIRST_PARTITION_OFFSET: u64 = 0xF800000;
/// Space reserved in front of each partition's data area for the partition
/// header, TMD, certificate chain and H3 table.
const PARTITION_METADATA_SIZE: u64 = 0x20000;

#[inline]
// only works with power of 2
fn align_next(num: u64, alignment: u64) -> u64 {
    num.wrapping_add(alignment - 1) & !(alignment - 1)
}

#[derive(thiserror::Error, Debug)]
pub enum PartitionAddError<E: Error> {
    #[error("{0}")]
    Custom(E),
    #[error("io error: {0}")]
    IO(#[from] io::Error),
    #[error("binrw error: {0}")]
    BinRW(#[from] binrw::Error),
    #[error("fst build failed: {0}")]
    Fst(#[from] FstToBytesError),
    #[error("writer is at 0x{current:X}, past the pad target 0x{target:X}")]
    PastTarget { current: u64, target: u64 },
}

/// Zero-fills the encrypted stream up to `target` plaintext position.
fn pad_to<E: Error, W: Write + Seek>(
    writer: &mut CryptPartWriter<W>,
    target: u64,
) -> Result<(), PartitionAddError<E>> {
    let current = writer.current_position();
    if target < current {
        return Err(PartitionAddError::PastTarget { current, target });
    }
    let zeroes = [0u8; 0x2000];
    let mut remaining = target - current;
    while remaining > 0 {
        let chunk = remaining.min(zeroes.len() as u64) as usize;
        writer.write_all(&zeroes[..chunk])?;
        remaining -= chunk as u64;
    }
    Ok(())
}

/// One partition's worth of source material for [`WiiDiscBuilder`].
///
/// The builder drives the implementation in a fixed order: layout first
/// (`fst_to_bytes` for the size, then `assign_file_offsets`), then the
/// metadata records, then the plaintext streams, then `write_file_data`
/// into the encryptor.
pub trait WiiPartitionDefinition<E: Error> {
    fn get_part_type(&self) -> WiiPartType;

    /// Partition header template carrying the ticket and the metadata
    /// layout offsets; `data_size` is replaced by the builder.
    fn get_header(&mut self) -> Result<WiiPartitionHeader, PartitionAddError<E>>;

    fn get_tmd(&mut self) -> Result<TMD, PartitionAddError<E>>;

    fn get_cert_chain(&mut self) -> Result<[Certificate; 3], PartitionAddError<E>>;

    /// The disc header that starts the partition's plaintext; its FST size
    /// fields are replaced by the builder.
    fn get_internal_header(&mut self) -> Result<DiscHeader, PartitionAddError<E>>;

    fn get_bi2(&mut self) -> Result<Cow<'_, [u8]>, PartitionAddError<E>>;

    fn get_apploader(&mut self) -> Result<Cow<'_, [u8]>, PartitionAddError<E>>;

    fn get_dol(&mut self) -> Result<Cow<'_, [u8]>, PartitionAddError<E>>;

    fn fst_to_bytes(&mut self) -> &mut FstToBytes;

    /// Re-plans the file layout: every file gets its new plaintext offset,
    /// starting at `start`, 4-byte aligned.
    fn assign_file_offsets(&mut self, start: u64);

    /// Streams every file's contents into the encryptor in FST order and
    /// reports progress as a percentage, at most once per file. Returns the
    /// file count.
    fn write_file_data<W: Write + Seek>(
        &mut self,
        writer: &mut CryptPartWriter<W>,
        progress_cb: &mut dyn FnMut(u8),
    ) -> Result<usize, PartitionAddError<E>>;
}

fn snapshot_source_files(fst_to_bytes: &FstToBytes) -> Vec<(u64, u32)> {
    let mut source_files = Vec::new();
    fst_to_bytes
        .callback_all_files::<Infallible, _>(&mut |_, node| {
            if let FstNode::File { offset, length, .. } = node {
                source_files.push((*offset, *length));
            }
            Ok(())
        })
        .unwrap();
    source_files
}

fn assign_offsets(fst_to_bytes: &mut FstToBytes, start: u64) {
    let mut current = start;
    fst_to_bytes
        .callback_all_files_mut::<Infallible, _>(&mut |_, offset, length| {
            current = align_next(current, 4);
            *offset = current;
            current += u64::from(*length);
            Ok(())
        })
        .unwrap();
}

/// Presents an opened source partition to the disc builder, copying file
/// contents verbatim while the tree itself may have been reshaped.
///
/// Each file's source `(offset, length)` is captured at construction, in
/// FST order. `assign_file_offsets` later overwrites the offsets in the
/// tree, so copying reads from the snapshot and never from the mutated
/// nodes; otherwise source and destination layouts would alias.
pub struct CopyBuilder<'a, RS: Read + Seek> {
    part_type: WiiPartType,
    header: WiiPartitionHeader,
    tmd: TMD,
    cert_chain: [Certificate; 3],
    internal_header: DiscHeader,
    fst_to_bytes: FstToBytes,
    source_files: Vec<(u64, u32)>,
    crypto: CryptPartReader<'a, RS>,
    buffer: Vec<u8>,
}

impl<'a, RS: Read + Seek> CopyBuilder<'a, RS> {
    /// Consumes the partition view. Mutate its FST (drop, add or rename
    /// nodes) *before* this call; file nodes present here get copied.
    pub fn new(partition: WiiPartition<'a, RS>) -> Result<Self, FstToBytesError> {
        let WiiPartition {
            entry,
            header,
            tmd,
            cert_chain,
            internal_header,
            fst,
            crypto,
        } = partition;
        let fst_to_bytes = FstToBytes::try_from(fst)?;
        let source_files = snapshot_source_files(&fst_to_bytes);
        Ok(CopyBuilder {
            part_type: entry.part_type,
            header,
            tmd,
            cert_chain,
            internal_header,
            fst_to_bytes,
            source_files,
            crypto,
            buffer: Vec::new(),
        })
    }
}

type CpBuildErr = PartitionAddError<Infallible>;

impl<'b, RS: Read + Seek> WiiPartitionDefinition<Infallible> for CopyBuilder<'b, RS> {
    fn get_part_type(&self) -> WiiPartType {
        self.part_type
    }

    fn get_header(&mut self) -> Result<WiiPartitionHeader, CpBuildErr> {
        Ok(self.header.clone())
    }

    fn get_tmd(&mut self) -> Result<TMD, CpBuildErr> {
        Ok(self.tmd.clone())
    }

    fn get_cert_chain(&mut self) -> Result<[Certificate; 3], CpBuildErr> {
        Ok(self.cert_chain.clone())
    }

    fn get_internal_header(&mut self) -> Result<DiscHeader, CpBuildErr> {
        Ok(self.internal_header.clone())
    }

    fn get_bi2(&mut self) -> Result<Cow<'_, [u8]>, CpBuildErr> {
        self.buffer = read_bi2(&mut self.crypto)?;
        Ok(Cow::Borrowed(&self.buffer))
    }

    fn get_apploader(&mut self) -> Result<Cow<'_, [u8]>, CpBuildErr> {
        self.buffer = read_apploader(&mut self.crypto)?;
        Ok(Cow::Borrowed(&self.buffer))
    }

    fn get_dol(&mut self) -> Result<Cow<'_, [u8]>, CpBuildErr> {
        self.buffer = read_dol(&mut self.crypto, *self.internal_header.dol_off)?;
        Ok(Cow::Borrowed(&self.buffer))
    }

    fn fst_to_bytes(&mut self) -> &mut FstToBytes {
        &mut self.fst_to_bytes
    }

    fn assign_file_offsets(&mut self, start: u64) {
        assign_offsets(&mut self.fst_to_bytes, start);
    }

    fn write_file_data<W: Write + Seek>(
        &mut self,
        writer: &mut CryptPartWriter<W>,
        progress_cb: &mut dyn FnMut(u8),
    ) -> Result<usize, CpBuildErr> {
        let total = self.source_files.len();
        for (i, (src_offset, src_length)) in self.source_files.iter().enumerate() {
            // keep the stream in step with the 4-byte aligned offsets that
            // assign_file_offsets planned
            let pos = writer.current_position();
            let aligned = align_next(pos, 4);
            writer.write_all(&[0u8; 3][..(aligned - pos) as usize])?;
            if *src_length > 0 {
                self.crypto
                    .read_into_vec(*src_offset, u64::from(*src_length), &mut self.buffer)?;
                writer.write_all(&self.buffer)?;
            }
            if total > 0 {
                progress_cb(((i + 1) * 100 / total) as u8);
            }
        }
        Ok(total)
    }
}

/// Assembles a new disc image: places partitions, writes their metadata
/// and encrypted payload, and closes out the partition table.
pub struct WiiDiscBuilder<WS: Read + Write + Seek> {
    file: WS,
    disc_header: DiscHeader,
    region: [u8; 32],
    partitions: Vec<(WiiPartTableEntry, u64)>,
}

impl<WS: Read + Write + Seek> WiiDiscBuilder<WS> {
    pub fn create(file: WS, disc_header: DiscHeader, region: [u8; 32]) -> Self {
        Self {
            file,
            disc_header,
            region,
            partitions: Vec::new(),
        }
    }

    /// The first partition sits at a fixed offset; every further one lands
    /// at the next group boundary after the previous partition's metadata
    /// and data.
    fn next_partition_offset(&self) -> u64 {
        match self.partitions.last() {
            None => FIRST_PARTITION_OFFSET,
            Some((entry, data_size)) => align_next(
                *entry.part_data_off + PARTITION_METADATA_SIZE + data_size,
                GROUP_SIZE,
            ),
        }
    }

    pub fn add_partition<P, E>(
        &mut self,
        partition_def: &mut P,
        progress_cb: &mut dyn FnMut(u8),
    ) -> Result<usize, PartitionAddError<E>>
    where
        P: WiiPartitionDefinition<E>,
        E: Error,
    {
        let offset = self.next_partition_offset();
        let mut part_header = partition_def.get_header()?;
        let mut internal_header = partition_def.get_internal_header()?;

        // The flat FST's size only depends on the tree shape, so the file
        // data start is known before any file offset is.
        let fst_size = partition_def.fst_to_bytes().byte_size() as u64;
        internal_header.fst_sz = fst_size.into();
        internal_header.fst_max_sz = fst_size.into();
        let file_data_start = *internal_header.fst_off + fst_size;
        partition_def.assign_file_offsets(file_data_start);

        let mut window = IOWindow::new(&mut self.file, offset)?;
        part_header.data_size = 0.into();
        window.write_be(&part_header)?;
        window.seek(SeekFrom::Start(*part_header.tmd_off))?;
        window.write_be(&partition_def.get_tmd()?)?;
        window.seek(SeekFrom::Start(*part_header.cert_chain_off))?;
        window.write_be(&partition_def.get_cert_chain()?)?;

        let title_key = part_header.ticket.title_key;
        let mut writer = CryptPartWriter::new(&mut window, *part_header.data_off, title_key);

        let mut boot_buf = Cursor::new(Vec::new());
        boot_buf.write_be(&internal_header)?;
        writer.write_all(boot_buf.get_ref())?;
        writer.write_all(&partition_def.get_bi2()?)?;
        pad_to(&mut writer, APPLOADER_OFFSET)?;
        writer.write_all(&partition_def.get_apploader()?)?;
        pad_to(&mut writer, *internal_header.dol_off)?;
        writer.write_all(&partition_def.get_dol()?)?;
        pad_to(&mut writer, *internal_header.fst_off)?;
        partition_def.fst_to_bytes().write_to(&mut writer)?;
        pad_to(&mut writer, file_data_start)?;

        let file_count = partition_def.write_file_data(&mut writer, progress_cb)?;
        writer.close()?;
        let h3_table = writer.h3_table();
        let total_plaintext = writer.current_position();
        drop(writer);

        window.seek(SeekFrom::Start(*part_header.global_hash_table_off))?;
        window.write_all(&h3_table)?;

        // whole ciphertext groups, at least one
        let data_size = (total_plaintext / GROUP_DATA_SIZE + 1) * GROUP_SIZE;
        part_header.data_size = data_size.into();
        window.seek(SeekFrom::Start(0))?;
        window.write_be(&part_header)?;
        window.flush()?;

        self.partitions.push((
            WiiPartTableEntry {
                part_data_off: offset.into(),
                part_type: partition_def.get_part_type(),
            },
            data_size,
        ));
        Ok(file_count)
    }

    pub fn finish(&mut self) -> binrw::BinResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_be(&self.disc_header)?;
        self.file.seek(SeekFrom::Start(0x4E000))?;
        self.file.write_all(&self.region)?;
        // partition table: everything lives in the first of the four
        // groups, the other three stay zeroed
        self.file.seek(SeekFrom::Start(0x40000))?;
        self.file.write_be(&(self.partitions.len() as u32))?;
        self.file.write_be(&(0x40020u32 >> 2))?;
        self.file.write_all(&[0u8; 24])?;
        self.file.seek(SeekFrom::Start(0x40020))?;
        for (entry, _) in self.partitions.iter() {
            self.file.write_be(entry)?;
        }
        self.file.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> WS {
        self.file
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use binrw::BinReaderExt;

    use super::*;
    use crate::fst::Fst;

    #[test]
    fn align_next_behaviour() {
        assert_eq!(align_next(0x200000, 0x200000), 0x200000);
        assert_eq!(align_next(0x200001, 0x200000), 0x400000);
        assert_eq!(align_next(0, 0x8000), 0);
    }

    #[test]
    fn pad_to_fills_and_rejects_backwards() {
        let mut out = Cursor::new(Vec::new());
        let mut writer = CryptPartWriter::new(&mut out, 0, [0; 16]);
        writer.write_all(&[0xAA; 10]).unwrap();
        pad_to::<Infallible, _>(&mut writer, 50).unwrap();
        assert_eq!(writer.current_position(), 50);
        pad_to::<Infallible, _>(&mut writer, 50).unwrap();
        assert_eq!(writer.current_position(), 50);
        assert!(matches!(
            pad_to::<Infallible, _>(&mut writer, 40),
            Err(PartitionAddError::PastTarget {
                current: 50,
                target: 40
            })
        ));
    }

    fn fake_fst() -> Fst {
        let mut subdir = FstNode::directory("subdir");
        if let FstNode::Directory { files, .. } = &mut subdir {
            files.push(FstNode::file("c.bin", 0x2000, 0x50));
        }
        Fst {
            entries: vec![FstNode::file("a.bin", 0x1000, 0x200), subdir],
        }
    }

    #[test]
    fn source_snapshot_survives_reassignment() {
        let mut fst_to_bytes = FstToBytes::try_from(fake_fst()).unwrap();
        let snapshot = snapshot_source_files(&fst_to_bytes);
        assert_eq!(snapshot, vec![(0x1000, 0x200), (0x2000, 0x50)]);

        assign_offsets(&mut fst_to_bytes, 0x8000);
        let mut assigned = Vec::new();
        fst_to_bytes
            .callback_all_files::<Infallible, _>(&mut |_, node| {
                if let FstNode::File { offset, length, .. } = node {
                    assigned.push((*offset, *length));
                }
                Ok(())
            })
            .unwrap();
        // a.bin starts at 0x8000, c.bin right behind it, lengths untouched
        assert_eq!(assigned, vec![(0x8000, 0x200), (0x8200, 0x50)]);
        // the snapshot taken up front is what a copy would still read from
        assert_eq!(snapshot, vec![(0x1000, 0x200), (0x2000, 0x50)]);
    }

    #[test]
    fn assigned_offsets_are_four_byte_aligned() {
        let mut fst = Fst::default();
        fst.add_node("", FstNode::file("odd.bin", 0, 0x123)).unwrap();
        fst.add_node("", FstNode::file("z.bin", 0, 0x10)).unwrap();
        let mut fst_to_bytes = FstToBytes::try_from(fst).unwrap();
        assign_offsets(&mut fst_to_bytes, 0x40);

        let mut assigned = Vec::new();
        fst_to_bytes
            .callback_all_files::<Infallible, _>(&mut |path, node| {
                if let FstNode::File { offset, .. } = node {
                    assigned.push((path.join("/"), *offset));
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(
            assigned,
            vec![("odd.bin".to_owned(), 0x40), ("z.bin".to_owned(), 0x164)]
        );
    }

    #[test]
    fn second_partition_lands_on_a_group_boundary() {
        let mut builder = WiiDiscBuilder::create(
            Cursor::new(Vec::new()),
            DiscHeader::default(),
            [0u8; 32],
        );
        assert_eq!(builder.next_partition_offset(), 0xF800000);
        builder.partitions.push((
            WiiPartTableEntry {
                part_data_off: 0xF800000.into(),
                part_type: WiiPartType::Data,
            },
            0x100000,
        ));
        assert_eq!(builder.next_partition_offset(), 0xFA00000);
    }

    #[test]
    fn finish_writes_the_partition_table() {
        let mut builder = WiiDiscBuilder::create(
            Cursor::new(vec![0u8; 0x50000]),
            {
                let mut header = DiscHeader::default();
                header.game_id = *b"RMGE01";
                header.wii_magic = 0x5D1C9EA3;
                header
            },
            [0x11u8; 32],
        );
        builder.partitions.push((
            WiiPartTableEntry {
                part_data_off: 0xF800000.into(),
                part_type: WiiPartType::Data,
            },
            0x200000,
        ));
        builder.finish().unwrap();

        let out = builder.into_inner().into_inner();
        assert_eq!(&out[0..6], b"RMGE01");
        assert_eq!(&out[0x4E000..0x4E020], &[0x11u8; 32]);
        assert_eq!(&out[0x40000..0x40004], &1u32.to_be_bytes());
        assert_eq!(&out[0x40004..0x40008], &(0x40020u32 >> 2).to_be_bytes());
        assert_eq!(&out[0x40008..0x40020], &[0u8; 24]);

        let entry: WiiPartTableEntry = Cursor::new(&out[0x40020..0x40028]).read_be().unwrap();
        assert_eq!(*entry.part_data_off, 0xF800000);
        assert_eq!(entry.part_type, WiiPartType::Data);
    }

    #[test]
    fn empty_finish_reports_no_partitions() {
        let mut builder = WiiDiscBuilder::create(
            Cursor::new(vec![0u8; 0x50000]),
            DiscHeader::default(),
            [0u8; 32],
        );
        builder.finish().unwrap();
        let out = builder.into_inner().into_inner();
        assert_eq!(&out[0x40000..0x40004], &0u32.to_be_bytes());
    }
}
