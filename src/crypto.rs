use aes::{
    cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit},
    Aes128,
};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::{
    keys::common_key, BLOCKS_PER_GROUP, BLOCK_DATA_OFFSET, BLOCK_DATA_SIZE, BLOCK_SIZE,
    GROUP_DATA_SIZE, GROUP_SIZE,
};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const SUBGROUPS_PER_GROUP: usize = 8;
const BLOCKS_PER_SUBGROUP: usize = 8;
const SUBBLOCKS_PER_BLOCK: usize = 31;
const SUBGROUP_SIZE: u64 = BLOCK_SIZE * BLOCKS_PER_SUBGROUP as u64;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("common key index {0} is not one of the known keys")]
    UnknownCommonKey(u8),
}

fn title_key_iv(title_id: &[u8; 8]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(title_id);
    iv
}

/// Unwraps the encrypted title key from a ticket: AES-128-CBC under the
/// selected common key, IV = title id followed by zeroes.
pub fn decrypt_title_key(
    encrypted_key: &[u8; 16],
    common_key_index: u8,
    title_id: &[u8; 8],
) -> Result<[u8; 16], KeyError> {
    let common = common_key(common_key_index).ok_or(KeyError::UnknownCommonKey(common_key_index))?;
    let iv = title_key_iv(title_id);
    let mut key = *encrypted_key;
    Aes128CbcDec::new(common.into(), iv.as_ref().into())
        .decrypt_padded_mut::<NoPadding>(&mut key)
        .unwrap();
    Ok(key)
}

/// Wraps a plaintext title key back into the form a ticket carries.
pub fn encrypt_title_key(
    title_key: &[u8; 16],
    common_key_index: u8,
    title_id: &[u8; 8],
) -> Result<[u8; 16], KeyError> {
    let common = common_key(common_key_index).ok_or(KeyError::UnknownCommonKey(common_key_index))?;
    let iv = title_key_iv(title_id);
    let mut key = *title_key;
    Aes128CbcEnc::new(common.into(), iv.as_ref().into())
        .encrypt_padded_mut::<NoPadding>(&mut key, 16)
        .unwrap();
    Ok(key)
}

/// Decrypts one 2 MiB group into its 0x1F0000 bytes of plaintext.
///
/// Per block the IV sits at 0x3D0 of the hash header and the payload covers
/// the rest. Hashes are carried, not checked.
pub fn decrypt_group(
    raw: &[u8; GROUP_SIZE as usize],
    title_key: &[u8; 16],
    out: &mut [u8; GROUP_DATA_SIZE as usize],
) {
    for block in 0..BLOCKS_PER_GROUP as usize {
        let block_bytes = &raw[block * BLOCK_SIZE as usize..][..BLOCK_SIZE as usize];
        Aes128CbcDec::new(title_key.into(), block_bytes[0x3D0..][..0x10].into())
            .decrypt_padded_b2b_mut::<NoPadding>(
                &block_bytes[BLOCK_DATA_OFFSET as usize..],
                &mut out[block * BLOCK_DATA_SIZE as usize..][..BLOCK_DATA_SIZE as usize],
            )
            .unwrap();
    }
}

/// Builds the hash tree over a group and encrypts it in place.
///
/// The 64 block-data sections must already sit at `block * 0x8000 + 0x400`;
/// the header bytes may hold anything, they are fully rewritten. Returns the
/// group's H3 entry, the SHA-1 of the finished H2 table.
///
/// The H0 loop hashes `block_start + (j + 1) * 0x400` for j in 0..31: the
/// first 0x400 of every block is the hash header itself, so the 31 data
/// subblocks land exactly one slot further in.
pub fn hash_encrypt_group(buffer: &mut [u8; GROUP_SIZE as usize], title_key: &[u8; 16]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    let mut h2 = [0u8; 20 * SUBGROUPS_PER_GROUP];
    for subgroup in 0..SUBGROUPS_PER_GROUP {
        let mut h1 = [0u8; 20 * BLOCKS_PER_SUBGROUP];
        for block in 0..BLOCKS_PER_SUBGROUP {
            let block_start =
                subgroup * SUBGROUP_SIZE as usize + block * BLOCK_SIZE as usize;
            let mut h0 = [0u8; 20 * SUBBLOCKS_PER_BLOCK];
            for subblock in 0..SUBBLOCKS_PER_BLOCK {
                hasher.update(&buffer[block_start + (subblock + 1) * 0x400..][..0x400]);
                h0[subblock * 20..][..20].copy_from_slice(&hasher.finalize_reset());
            }
            hasher.update(h0);
            h1[block * 20..][..20].copy_from_slice(&hasher.finalize_reset());
            buffer[block_start..][..h0.len()].copy_from_slice(&h0);
            buffer[block_start + h0.len()..][..0x14].fill(0);
        }
        hasher.update(h1);
        h2[subgroup * 20..][..20].copy_from_slice(&hasher.finalize_reset());
        for block in 0..BLOCKS_PER_SUBGROUP {
            let block_start =
                subgroup * SUBGROUP_SIZE as usize + block * BLOCK_SIZE as usize;
            buffer[block_start + 0x280..][..h1.len()].copy_from_slice(&h1);
            buffer[block_start + 0x320..][..0x20].fill(0);
        }
    }

    hasher.update(h2);
    let mut h3 = [0u8; 20];
    h3.copy_from_slice(&hasher.finalize_reset());

    for block in 0..BLOCKS_PER_GROUP as usize {
        let block_bytes = &mut buffer[block * BLOCK_SIZE as usize..][..BLOCK_SIZE as usize];
        block_bytes[0x340..][..h2.len()].copy_from_slice(&h2);
        block_bytes[0x3E0..][..0x20].fill(0);
        // the header is encrypted with a zero IV, the payload with the last
        // 16 bytes of the freshly encrypted header
        Aes128CbcEnc::new(title_key.into(), [0u8; 16].as_ref().into())
            .encrypt_padded_mut::<NoPadding>(&mut block_bytes[..0x400], 0x400)
            .unwrap();
        let iv: [u8; 16] = block_bytes[0x3D0..0x3E0].try_into().unwrap();
        Aes128CbcEnc::new(title_key.into(), iv.as_ref().into())
            .encrypt_padded_mut::<NoPadding>(
                &mut block_bytes[0x400..],
                (BLOCK_SIZE - BLOCK_DATA_OFFSET) as usize,
            )
            .unwrap();
    }
    h3
}

#[cfg(test)]
mod test {
    use super::*;

    fn group_buf() -> Box<[u8; GROUP_SIZE as usize]> {
        vec![0u8; GROUP_SIZE as usize]
            .into_boxed_slice()
            .try_into()
            .unwrap()
    }

    fn plain_buf() -> Box<[u8; GROUP_DATA_SIZE as usize]> {
        vec![0u8; GROUP_DATA_SIZE as usize]
            .into_boxed_slice()
            .try_into()
            .unwrap()
    }

    #[test]
    fn title_key_wrap_unwrap() {
        let title_id = *b"\x00\x01\x00\x00RTST";
        let key = [0x5Au8; 16];
        for index in [0u8, 1] {
            let wrapped = encrypt_title_key(&key, index, &title_id).unwrap();
            assert_ne!(wrapped, key);
            assert_eq!(decrypt_title_key(&wrapped, index, &title_id).unwrap(), key);
        }
    }

    #[test]
    fn unknown_common_key_index() {
        assert!(matches!(
            decrypt_title_key(&[0; 16], 3, &[0; 8]),
            Err(KeyError::UnknownCommonKey(3))
        ));
    }

    #[test]
    fn group_roundtrip() {
        let title_key = [0x13u8; 16];
        let mut plaintext = plain_buf();
        for (i, b) in plaintext.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let mut group = group_buf();
        for block in 0..BLOCKS_PER_GROUP as usize {
            group[block * BLOCK_SIZE as usize + BLOCK_DATA_OFFSET as usize..]
                [..BLOCK_DATA_SIZE as usize]
                .copy_from_slice(
                    &plaintext[block * BLOCK_DATA_SIZE as usize..][..BLOCK_DATA_SIZE as usize],
                );
        }
        let h3 = hash_encrypt_group(&mut group, &title_key);

        let mut decrypted = plain_buf();
        decrypt_group(&group, &title_key, &mut decrypted);
        assert_eq!(decrypted.as_ref(), plaintext.as_ref());

        // same plaintext encrypts to the same bytes and the same h3
        let mut group2 = group_buf();
        for block in 0..BLOCKS_PER_GROUP as usize {
            group2[block * BLOCK_SIZE as usize + BLOCK_DATA_OFFSET as usize..]
                [..BLOCK_DATA_SIZE as usize]
                .copy_from_slice(
                    &plaintext[block * BLOCK_DATA_SIZE as usize..][..BLOCK_DATA_SIZE as usize],
                );
        }
        let h3_2 = hash_encrypt_group(&mut group2, &title_key);
        assert_eq!(h3, h3_2);
        assert_eq!(group.as_ref(), group2.as_ref());
    }

    #[test]
    fn first_data_subblock_is_hashed_into_h0_slot_zero() {
        use sha1::{Digest, Sha1};

        let title_key = [0u8; 16];
        let mut group = group_buf();
        for (i, b) in group
            [BLOCK_DATA_OFFSET as usize..BLOCK_SIZE as usize]
            .iter_mut()
            .enumerate()
        {
            *b = (i % 253) as u8;
        }
        let expected_h0_0: [u8; 20] = {
            let mut hasher = Sha1::new();
            hasher.update(&group[0x400..0x800]);
            hasher.finalize().into()
        };
        hash_encrypt_group(&mut group, &title_key);

        // peel the header encryption off block 0 again to look at H0
        let mut header: [u8; 0x400] = group[..0x400].try_into().unwrap();
        Aes128CbcDec::new(title_key.as_ref().into(), [0u8; 16].as_ref().into())
            .decrypt_padded_mut::<NoPadding>(&mut header)
            .unwrap();
        assert_eq!(&header[..20], &expected_h0_0);
        // pad spans after H0 and H1 are zero
        assert!(header[0x26C..0x280].iter().all(|b| *b == 0));
        assert!(header[0x320..0x340].iter().all(|b| *b == 0));
    }
}
