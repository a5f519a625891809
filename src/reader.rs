use std::io::{self, Read, Seek, SeekFrom};

use binrw::BinReaderExt;
use thiserror::Error;

use crate::{
    crypt::CryptPartReader,
    fst::{Fst, FstNode},
    structs::{
        read_parts, ApploaderHeader, Certificate, DOLHeader, DiscHeader, WiiPartTableEntry,
        WiiPartType, WiiPartitionHeader, TMD,
    },
};

pub const BI2_OFFSET: u64 = 0x440;
pub const BI2_SIZE: usize = 0x2000;
pub const APPLOADER_OFFSET: u64 = 0x2440;

#[derive(Error, Debug)]
pub enum FileReadError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("path is a directory: {0}")]
    IsADirectory(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Read access to a disc image: outer header, partition table, region, and
/// per-partition views.
pub struct WiiIsoReader<RS: Read + Seek> {
    file: RS,
    header: DiscHeader,
    region: [u8; 32],
    partitions: Vec<WiiPartTableEntry>,
}

impl<RS: Read + Seek> WiiIsoReader<RS> {
    pub fn create(mut rs: RS) -> binrw::BinResult<Self> {
        rs.seek(SeekFrom::Start(0))?;
        let header: DiscHeader = rs.read_be()?;
        let partitions = read_parts(&mut rs)?;
        let mut region = [0u8; 32];
        rs.seek(SeekFrom::Start(0x4E000))?;
        rs.read_exact(&mut region)?;
        Ok(WiiIsoReader {
            file: rs,
            header,
            region,
            partitions,
        })
    }

    pub fn partitions(&self) -> &Vec<WiiPartTableEntry> {
        &self.partitions
    }

    pub fn get_header(&self) -> &DiscHeader {
        &self.header
    }

    pub fn get_region(&self) -> &[u8; 32] {
        &self.region
    }

    pub fn find_partition(&self, part_type: WiiPartType) -> Option<WiiPartTableEntry> {
        self.partitions
            .iter()
            .find(|p| p.part_type == part_type)
            .cloned()
    }

    /// Materialises a partition view: partition header (deriving the title
    /// key from its ticket), TMD, certificate chain, then the internal disc
    /// header and FST through the decryptor.
    pub fn open_partition(
        &mut self,
        entry: &WiiPartTableEntry,
    ) -> binrw::BinResult<WiiPartition<'_, RS>> {
        let offset = *entry.part_data_off;
        self.file.seek(SeekFrom::Start(offset))?;
        let header: WiiPartitionHeader = self.file.read_be()?;
        self.file.seek(SeekFrom::Start(offset + *header.tmd_off))?;
        let tmd: TMD = self.file.read_be()?;
        self.file
            .seek(SeekFrom::Start(offset + *header.cert_chain_off))?;
        let cert_chain: [Certificate; 3] = self.file.read_be()?;

        let title_key = header.ticket.title_key;
        let mut crypto = CryptPartReader::new(&mut self.file, offset + *header.data_off, title_key);
        let internal_header: DiscHeader = crypto.read_be()?;
        let fst = Fst::read(&mut crypto, *internal_header.fst_off)?;
        Ok(WiiPartition {
            entry: entry.clone(),
            header,
            tmd,
            cert_chain,
            internal_header,
            fst,
            crypto,
        })
    }
}

/// One opened partition: its leaf records, the FST tree and plaintext
/// random access through the decryptor.
pub struct WiiPartition<'a, RS: Read + Seek> {
    pub(crate) entry: WiiPartTableEntry,
    pub(crate) header: WiiPartitionHeader,
    pub(crate) tmd: TMD,
    pub(crate) cert_chain: [Certificate; 3],
    pub(crate) internal_header: DiscHeader,
    pub(crate) fst: Fst,
    pub(crate) crypto: CryptPartReader<'a, RS>,
}

impl<'a, RS: Read + Seek> WiiPartition<'a, RS> {
    pub fn part_type(&self) -> WiiPartType {
        self.entry.part_type
    }

    pub fn get_header(&self) -> &WiiPartitionHeader {
        &self.header
    }

    pub fn get_tmd(&self) -> &TMD {
        &self.tmd
    }

    pub fn get_cert_chain(&self) -> &[Certificate; 3] {
        &self.cert_chain
    }

    pub fn get_internal_header(&self) -> &DiscHeader {
        &self.internal_header
    }

    pub fn fst(&self) -> &Fst {
        &self.fst
    }

    pub fn fst_mut(&mut self) -> &mut Fst {
        &mut self.fst
    }

    pub fn crypto(&mut self) -> &mut CryptPartReader<'a, RS> {
        &mut self.crypto
    }

    pub fn read_bi2(&mut self) -> io::Result<Vec<u8>> {
        read_bi2(&mut self.crypto)
    }

    pub fn read_apploader(&mut self) -> binrw::BinResult<Vec<u8>> {
        read_apploader(&mut self.crypto)
    }

    pub fn read_dol(&mut self) -> binrw::BinResult<Vec<u8>> {
        read_dol(&mut self.crypto, *self.internal_header.dol_off)
    }

    /// Reads a file's contents by `/`-separated path.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FileReadError> {
        match self.fst.find_node(path) {
            Some(FstNode::File { offset, length, .. }) => {
                let (offset, length) = (*offset, *length);
                Ok(self.crypto.read_at(offset, length as usize)?)
            }
            Some(FstNode::Directory { .. }) => Err(FileReadError::IsADirectory(path.to_owned())),
            None => Err(FileReadError::NotFound(path.to_owned())),
        }
    }

    pub fn list_files(&self) -> Vec<String> {
        self.fst.file_paths()
    }
}

pub fn read_bi2<RS: Read + Seek>(crypto: &mut CryptPartReader<RS>) -> io::Result<Vec<u8>> {
    crypto.read_at(BI2_OFFSET, BI2_SIZE)
}

/// The apploader header announces its two section sizes; the full image is
/// the 0x20 byte header plus both sections.
pub fn read_apploader<RS: Read + Seek>(
    crypto: &mut CryptPartReader<RS>,
) -> binrw::BinResult<Vec<u8>> {
    crypto.seek(SeekFrom::Start(APPLOADER_OFFSET))?;
    let apploader_header: ApploaderHeader = crypto.read_be()?;
    let fullsize = 0x20 + u64::from(apploader_header.size1) + u64::from(apploader_header.size2);
    let mut buf = Vec::new();
    crypto.read_into_vec(APPLOADER_OFFSET, fullsize, &mut buf)?;
    Ok(buf)
}

pub fn read_dol<RS: Read + Seek>(
    crypto: &mut CryptPartReader<RS>,
    dol_offset: u64,
) -> binrw::BinResult<Vec<u8>> {
    crypto.seek(SeekFrom::Start(dol_offset))?;
    let dol_header: DOLHeader = crypto.read_be()?;
    let mut buf = Vec::new();
    crypto.read_into_vec(dol_offset, dol_header.dol_size(), &mut buf)?;
    Ok(buf)
}
