use std::{
    io::{Read, Seek, SeekFrom, Write},
    ops::Deref,
};

use binrw::{binrw, BinRead, BinReaderExt, BinResult, BinWrite, Endian};

use crate::crypto::{decrypt_title_key, encrypt_title_key, KeyError};

/// Offset stored right-shifted by 2 on disc (u32), unshifted in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShiftedU64(pub u64);

impl BinRead for ShiftedU64 {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _args: (),
    ) -> BinResult<Self> {
        let raw = u32::read_options(reader, endian, ())?;
        Ok(ShiftedU64(u64::from(raw) << 2))
    }
}

impl BinWrite for ShiftedU64 {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        _args: (),
    ) -> BinResult<()> {
        ((self.0 >> 2) as u32).write_options(writer, endian, ())
    }
}

impl Deref for ShiftedU64 {
    type Target = u64;

    fn deref(&self) -> &u64 {
        &self.0
    }
}

impl From<u64> for ShiftedU64 {
    fn from(value: u64) -> Self {
        ShiftedU64(value)
    }
}

impl From<ShiftedU64> for u64 {
    fn from(value: ShiftedU64) -> Self {
        value.0
    }
}

#[binrw]
#[brw(repr = u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WiiPartType {
    Data = 0,
    Update = 1,
    Channel = 2,
}

#[binrw]
#[brw(repr = u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    None = 0,
    Rsa4096 = 0x0001_0000,
    Rsa2048 = 0x0001_0001,
    EccB233 = 0x0001_0002,
}

impl SignatureType {
    pub fn signature_len(&self) -> usize {
        match self {
            SignatureType::None => 0,
            SignatureType::Rsa4096 => 0x200,
            SignatureType::Rsa2048 => 0x100,
            SignatureType::EccB233 => 0x40,
        }
    }
}

#[binrw]
#[brw(repr = u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa4096 = 0,
    Rsa2048 = 1,
    EccB233 = 2,
}

impl KeyType {
    pub fn key_len(&self) -> usize {
        match self {
            KeyType::Rsa4096 => 0x200,
            KeyType::Rsa2048 => 0x100,
            KeyType::EccB233 => 0x3C,
        }
    }

    pub fn has_exponent(&self) -> bool {
        matches!(self, KeyType::Rsa4096 | KeyType::Rsa2048)
    }

    pub fn trailing_pad(&self) -> u64 {
        match self {
            KeyType::Rsa4096 | KeyType::Rsa2048 => 0x34,
            KeyType::EccB233 => 0x3C,
        }
    }
}

/// Entry of the outer partition table at 0x40020.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct WiiPartTableEntry {
    pub part_data_off: ShiftedU64,
    pub part_type: WiiPartType,
}

/// Reads the partition table: four groups of `{count, entries offset}`
/// records at 0x40000, each pointing at its run of entries.
pub fn read_parts<RS: Read + Seek>(rs: &mut RS) -> BinResult<Vec<WiiPartTableEntry>> {
    rs.seek(SeekFrom::Start(0x40000))?;
    let mut groups = Vec::with_capacity(4);
    for _ in 0..4 {
        let count: u32 = rs.read_be()?;
        let entries_off: ShiftedU64 = rs.read_be()?;
        groups.push((count, entries_off));
    }
    let mut entries = Vec::new();
    for (count, entries_off) in groups {
        if count == 0 {
            continue;
        }
        rs.seek(SeekFrom::Start(*entries_off))?;
        for _ in 0..count {
            entries.push(rs.read_be::<WiiPartTableEntry>()?);
        }
    }
    Ok(entries)
}

/// Disc header, 0x440 bytes. Appears twice per image: at absolute offset 0
/// and again as the first thing in every partition's plaintext.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct DiscHeader {
    pub game_id: [u8; 6],
    pub disc_num: u8,
    pub disc_version: u8,
    pub audio_streaming: u8,
    pub audio_stream_buf_size: u8,
    #[brw(pad_before = 0x0E)]
    pub wii_magic: u32,
    pub gamecube_magic: u32,
    pub game_title: [u8; 0x40],
    pub disable_hash_verification: u8,
    pub disable_disc_enc: u8,
    #[brw(pad_before = 0x39E)]
    pub debug_mon_off: u32,
    pub debug_load_addr: u32,
    #[brw(pad_before = 0x18)]
    pub dol_off: ShiftedU64,
    pub fst_off: ShiftedU64,
    pub fst_sz: ShiftedU64,
    pub fst_max_sz: ShiftedU64,
    pub fst_memory_address: u32,
    pub user_position: u32,
    #[brw(pad_after = 0x04)]
    pub user_size: u32,
}

impl DiscHeader {
    pub fn get_game_title(&self) -> String {
        let end = self
            .game_title
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.game_title.len());
        String::from_utf8_lossy(&self.game_title[..end]).into_owned()
    }
}

impl Default for DiscHeader {
    fn default() -> Self {
        DiscHeader {
            game_id: [0; 6],
            disc_num: 0,
            disc_version: 0,
            audio_streaming: 0,
            audio_stream_buf_size: 0,
            wii_magic: 0,
            gamecube_magic: 0,
            game_title: [0; 0x40],
            disable_hash_verification: 0,
            disable_disc_enc: 0,
            debug_mon_off: 0,
            debug_load_addr: 0,
            dol_off: ShiftedU64(0),
            fst_off: ShiftedU64(0),
            fst_sz: ShiftedU64(0),
            fst_max_sz: ShiftedU64(0),
            fst_memory_address: 0,
            user_position: 0,
            user_size: 0,
        }
    }
}

#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TicketTimeLimit {
    pub enable_time_limit: u32,
    pub time_limit: u32,
}

/// Partition ticket, 0x2A4 bytes. Carries the encrypted title key; the
/// plaintext key is derived while reading and never serialised back.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub signature_type: SignatureType,
    pub signature: [u8; 0x100],
    #[brw(pad_before = 0x3C)]
    pub signature_issuer: [u8; 0x40],
    pub ecdh: [u8; 0x3C],
    #[brw(pad_before = 0x03)]
    pub encrypted_key: [u8; 0x10],
    pub unk1: u8,
    pub ticket_id: [u8; 0x08],
    pub console_id: [u8; 0x04],
    pub title_id: [u8; 0x08],
    pub unk2: u16,
    pub ticket_version: u16,
    pub permitted_titles_mask: u32,
    pub permit_mask: u32,
    pub title_export_allowed: u8,
    pub common_key_index: u8,
    pub unk3: [u8; 0x30],
    pub content_access_permissions: [u8; 0x40],
    #[brw(pad_before = 0x02)]
    pub time_limits: [TicketTimeLimit; 8],
    #[br(try_calc = decrypt_title_key(&encrypted_key, common_key_index, &title_id))]
    #[bw(ignore)]
    pub title_key: [u8; 16],
}

impl Ticket {
    /// Installs a new title key, re-wrapping it under the selected common
    /// key so the serialised ticket stays consistent.
    pub fn set_title_key(&mut self, title_key: [u8; 16]) -> Result<(), KeyError> {
        self.encrypted_key = encrypt_title_key(&title_key, self.common_key_index, &self.title_id)?;
        self.title_key = title_key;
        Ok(())
    }
}

#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct TMDContent {
    pub id: u32,
    pub index: u16,
    pub content_type: u16,
    pub size: u64,
    pub hash: [u8; 20],
}

/// Title metadata.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct TMD {
    pub signature_type: SignatureType,
    pub signature: [u8; 0x100],
    #[brw(pad_before = 0x3C)]
    pub signature_issuer: [u8; 0x40],
    pub version: u8,
    pub ca_crl_version: u8,
    pub signer_crl_version: u8,
    pub is_virtual_wii: u8,
    pub system_version: u64,
    pub title_id: u64,
    pub title_type: u32,
    pub group_id: u16,
    pub unk1: [u8; 0x38],
    #[brw(pad_before = 0x06)]
    pub access_rights: u32,
    pub title_version: u16,
    #[br(temp)]
    #[bw(calc = contents.len() as u16)]
    num_contents: u16,
    #[brw(pad_after = 0x02)]
    pub boot_index: u16,
    #[br(count = num_contents)]
    pub contents: Vec<TMDContent>,
}

/// A certificate of the trust chain; three of them back to back make up a
/// partition's certificate chain. Signature and key sizes depend on the
/// respective type fields.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct Certificate {
    pub signature_type: SignatureType,
    #[br(count = signature_type.signature_len())]
    pub signature: Vec<u8>,
    #[brw(pad_before = 0x3C)]
    pub issuer: [u8; 0x40],
    pub key_type: KeyType,
    pub child_identity: [u8; 0x40],
    pub key_id: u32,
    #[br(count = key_type.key_len())]
    pub key: Vec<u8>,
    #[br(if(key_type.has_exponent()))]
    #[brw(pad_after = key_type.trailing_pad())]
    pub public_exponent: Option<u32>,
}

#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct ApploaderHeader {
    #[brw(pad_before = 0x14)]
    pub size1: u32,
    pub size2: u32,
}

/// DOL executable header, 0x100 bytes: seven text and eleven data sections.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct DOLHeader {
    pub text_off: [u32; 7],
    pub data_off: [u32; 11],
    pub text_starts: [u32; 7],
    pub data_starts: [u32; 11],
    pub text_sizes: [u32; 7],
    pub data_sizes: [u32; 11],
    pub bss_start: u32,
    pub bss_size: u32,
    #[brw(pad_after = 0x1C)]
    pub entry_point: u32,
}

impl DOLHeader {
    /// Total on-disc size of the DOL: the furthest section end, but at
    /// least the header itself.
    pub fn dol_size(&self) -> u64 {
        let text = self
            .text_off
            .iter()
            .zip(self.text_sizes.iter())
            .map(|(off, size)| u64::from(*off) + u64::from(*size));
        let data = self
            .data_off
            .iter()
            .zip(self.data_sizes.iter())
            .map(|(off, size)| u64::from(*off) + u64::from(*size));
        text.chain(data).fold(0x100, u64::max)
    }
}

/// Partition header at the start of every partition, 0x2C0 bytes. All
/// offsets are relative to the partition start.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct WiiPartitionHeader {
    pub ticket: Ticket,
    pub tmd_size: u32,
    pub tmd_off: ShiftedU64,
    pub cert_chain_size: u32,
    pub cert_chain_off: ShiftedU64,
    pub global_hash_table_off: ShiftedU64,
    pub data_off: ShiftedU64,
    pub data_size: ShiftedU64,
}
