use std::{
    fmt,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
};

use binrw::{binrw, BinReaderExt, BinResult, BinWriterExt};
use encoding_rs::SHIFT_JIS;
use thiserror::Error;

/// On-disc directory entry, 12 bytes: type flag, u24 offset into the string
/// table, data offset (shifted for files, parent index for directories) and
/// length (byte count for files, end-of-span index for directories).
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct RawFstNode {
    ty: u8,
    #[br(map = |b: [u8; 3]| u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2]))]
    #[bw(map = |off: &u32| [(*off >> 16) as u8, (*off >> 8) as u8, *off as u8])]
    name_offset: u32,
    data_offset: u32,
    length: u32,
}

const RAW_NODE_SIZE: usize = 12;
const DIRECTORY: u8 = 1;

/// A file or directory name.
///
/// The exact on-disc byte sequence is kept and re-emitted verbatim; the
/// Shift-JIS decoding (with replacement characters where the bytes are not
/// valid) only serves display and path lookup.
#[derive(Clone, PartialEq, Eq)]
pub struct FstName {
    raw: Vec<u8>,
    display: String,
}

impl FstName {
    pub fn new(name: &str) -> Self {
        let (encoded, _, _) = SHIFT_JIS.encode(name);
        FstName {
            raw: encoded.into_owned(),
            display: name.to_owned(),
        }
    }

    pub fn from_raw(raw: Vec<u8>) -> Self {
        let (display, _, _) = SHIFT_JIS.decode(&raw);
        let display = display.into_owned();
        FstName { raw, display }
    }

    pub fn as_str(&self) -> &str {
        &self.display
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }
}

impl From<&str> for FstName {
    fn from(name: &str) -> Self {
        FstName::new(name)
    }
}

impl fmt::Display for FstName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl fmt::Debug for FstName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.display)
    }
}

/// A node of the filesystem tree. File offsets are plaintext byte offsets
/// within the partition, unshifted.
#[derive(Debug, Clone, PartialEq)]
pub enum FstNode {
    File {
        name: FstName,
        offset: u64,
        length: u32,
    },
    Directory {
        name: FstName,
        files: Vec<FstNode>,
    },
}

impl FstNode {
    pub fn file(name: &str, offset: u64, length: u32) -> Self {
        FstNode::File {
            name: FstName::new(name),
            offset,
            length,
        }
    }

    pub fn directory(name: &str) -> Self {
        FstNode::Directory {
            name: FstName::new(name),
            files: Vec::new(),
        }
    }

    pub fn name(&self) -> &FstName {
        match self {
            FstNode::File { name, .. } => name,
            FstNode::Directory { name, .. } => name,
        }
    }

    pub fn get_name(&self) -> &str {
        self.name().as_str()
    }

    pub fn is_file(&self) -> bool {
        matches!(self, FstNode::File { .. })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FstNode::Directory { .. })
    }
}

#[derive(Error, Debug)]
pub enum FstError {
    #[error("path segment {0:?} is a file, not a directory")]
    NotADirectory(String),
}

/// The filesystem table of one partition, as a tree. The implicit root
/// directory is the entry list itself.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fst {
    pub entries: Vec<FstNode>,
}

impl Fst {
    /// Parses a flat node table + string table at `offset`. The root node's
    /// length field announces the total node count.
    pub fn read<RS: Read + Seek>(stream: &mut RS, offset: u64) -> BinResult<Self> {
        stream.seek(SeekFrom::Start(offset))?;
        let root: RawFstNode = stream.read_be()?;
        if root.ty != DIRECTORY {
            return Err(binrw::Error::Custom {
                pos: offset,
                err: Box::new("fst root node is not a directory"),
            });
        }
        if root.length == 0 {
            return Err(binrw::Error::Custom {
                pos: offset,
                err: Box::new("fst claims zero nodes"),
            });
        }
        let total_nodes = root.length as usize;
        let mut nodes = Vec::with_capacity(total_nodes);
        nodes.push(root);
        for _ in 1..total_nodes {
            nodes.push(stream.read_be::<RawFstNode>()?);
        }
        let string_base = offset + (total_nodes * RAW_NODE_SIZE) as u64;
        let (entries, _) = build_tree(stream, string_base, &nodes, 1, total_nodes)?;
        Ok(Fst { entries })
    }

    /// Serialises the tree with the offsets and lengths currently stored in
    /// the file nodes. For the build-time two-phase flow use [`FstToBytes`].
    pub fn write_to<W: Write>(&self, sink: &mut W) -> BinResult<()> {
        let mut raw_nodes = vec![RawFstNode {
            ty: DIRECTORY,
            name_offset: 0,
            data_offset: 0,
            length: 0,
        }];
        let mut strings = vec![0u8];
        flatten_tree(&self.entries, &mut raw_nodes, &mut strings, 0);
        raw_nodes[0].length = raw_nodes.len() as u32;
        if strings.len() > 0x100_0000 {
            return Err(binrw::Error::Custom {
                pos: 0,
                err: Box::new("fst string table exceeds the 24 bit name offset range"),
            });
        }
        let mut cur = Cursor::new(Vec::with_capacity(
            raw_nodes.len() * RAW_NODE_SIZE + strings.len(),
        ));
        for node in &raw_nodes {
            cur.write_be(node)?;
        }
        cur.write_all(&strings)?;
        sink.write_all(&cur.into_inner())?;
        Ok(())
    }

    /// Looks up a node by `/`-separated path.
    pub fn find_node(&self, path: &str) -> Option<&FstNode> {
        let mut parts = path_segments(path).peekable();
        let mut current_list = &self.entries;
        loop {
            let part = parts.next()?;
            let node = current_list.iter().find(|n| n.get_name() == part)?;
            if parts.peek().is_none() {
                return Some(node);
            }
            match node {
                FstNode::Directory { files, .. } => current_list = files,
                FstNode::File { .. } => return None,
            }
        }
    }

    pub fn find_node_mut(&mut self, path: &str) -> Option<&mut FstNode> {
        let mut parts = path_segments(path).peekable();
        let mut current_list = &mut self.entries;
        loop {
            let part = parts.next()?;
            let idx = current_list.iter().position(|n| n.get_name() == part)?;
            if parts.peek().is_none() {
                return current_list.get_mut(idx);
            }
            match &mut current_list[idx] {
                FstNode::Directory { files, .. } => current_list = files,
                FstNode::File { .. } => return None,
            }
        }
    }

    /// Inserts a node under the given directory path, creating missing
    /// directories on the way. Children stay sorted case-insensitively; a
    /// node of the same name is replaced and handed back.
    pub fn add_node(&mut self, dir_path: &str, node: FstNode) -> Result<Option<FstNode>, FstError> {
        let mut current_list = &mut self.entries;
        for part in path_segments(dir_path) {
            let idx = match current_list
                .iter()
                .position(|n| n.get_name().eq_ignore_ascii_case(part))
            {
                Some(idx) => {
                    if !current_list[idx].is_dir() {
                        return Err(FstError::NotADirectory(part.to_owned()));
                    }
                    idx
                }
                None => {
                    let idx = sorted_insert_index(current_list, part);
                    current_list.insert(idx, FstNode::directory(part));
                    idx
                }
            };
            match &mut current_list[idx] {
                FstNode::Directory { files, .. } => current_list = files,
                FstNode::File { .. } => unreachable!(),
            }
        }
        let idx = sorted_insert_index(current_list, node.get_name());
        if idx < current_list.len()
            && current_list[idx]
                .get_name()
                .eq_ignore_ascii_case(node.get_name())
        {
            let old = std::mem::replace(&mut current_list[idx], node);
            return Ok(Some(old));
        }
        current_list.insert(idx, node);
        Ok(None)
    }

    /// Detaches and returns the node at the given path.
    pub fn remove_node(&mut self, path: &str) -> Option<FstNode> {
        let parts: Vec<&str> = path_segments(path).collect();
        let (last, dirs) = parts.split_last()?;
        let mut current_list = &mut self.entries;
        for part in dirs {
            let idx = current_list.iter().position(|n| n.get_name() == *part)?;
            match &mut current_list[idx] {
                FstNode::Directory { files, .. } => current_list = files,
                FstNode::File { .. } => return None,
            }
        }
        let idx = current_list.iter().position(|n| n.get_name() == *last)?;
        Some(current_list.remove(idx))
    }

    pub fn count_files(&self) -> usize {
        fn count(entries: &[FstNode]) -> usize {
            entries
                .iter()
                .map(|e| match e {
                    FstNode::File { .. } => 1,
                    FstNode::Directory { files, .. } => count(files),
                })
                .sum()
        }
        count(&self.entries)
    }

    /// Full `/`-separated paths of every file, depth first.
    pub fn file_paths(&self) -> Vec<String> {
        fn walk(entries: &[FstNode], prefix: &str, out: &mut Vec<String>) {
            for entry in entries {
                match entry {
                    FstNode::Directory { name, files } => {
                        walk(files, &format!("{}{}/", prefix, name), out);
                    }
                    FstNode::File { name, .. } => out.push(format!("{}{}", prefix, name)),
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.entries, "", &mut out);
        out
    }

    pub fn print_tree(&self) {
        fn print_level(entries: &[FstNode], indent: usize) {
            for entry in entries {
                match entry {
                    FstNode::Directory { name, files } => {
                        println!("{:indent$}{}/", "", name, indent = indent);
                        print_level(files, indent + 2);
                    }
                    FstNode::File { name, length, .. } => {
                        println!("{:indent$}{} ({} bytes)", "", name, length, indent = indent);
                    }
                }
            }
        }
        print_level(&self.entries, 0);
    }
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|p| !p.is_empty())
}

fn sorted_insert_index(list: &[FstNode], name: &str) -> usize {
    list.partition_point(|n| n.get_name().to_lowercase() < name.to_lowercase())
}

fn read_null_terminated<RS: Read + Seek>(stream: &mut RS, offset: u64) -> io::Result<Vec<u8>> {
    stream.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    Ok(bytes)
}

fn build_tree<RS: Read + Seek>(
    stream: &mut RS,
    string_base: u64,
    nodes: &[RawFstNode],
    start: usize,
    end: usize,
) -> BinResult<(Vec<FstNode>, usize)> {
    let mut result = Vec::new();
    let mut i = start;
    while i < end {
        let raw = nodes[i];
        let name = FstName::from_raw(read_null_terminated(
            stream,
            string_base + u64::from(raw.name_offset),
        )?);
        if raw.ty == DIRECTORY {
            let sub_end = raw.length as usize;
            if sub_end <= i || sub_end > end {
                return Err(binrw::Error::Custom {
                    pos: (i * RAW_NODE_SIZE) as u64,
                    err: Box::new("fst directory span out of range"),
                });
            }
            let (files, _) = build_tree(stream, string_base, nodes, i + 1, sub_end)?;
            result.push(FstNode::Directory { name, files });
            i = sub_end;
        } else {
            result.push(FstNode::File {
                name,
                offset: u64::from(raw.data_offset) << 2,
                length: raw.length,
            });
            i += 1;
        }
    }
    Ok((result, i))
}

fn flatten_tree(
    entries: &[FstNode],
    raw_nodes: &mut Vec<RawFstNode>,
    strings: &mut Vec<u8>,
    parent_index: u32,
) {
    for entry in entries {
        let name_offset = strings.len() as u32;
        strings.extend_from_slice(entry.name().raw_bytes());
        strings.push(0);
        match entry {
            FstNode::Directory { files, .. } => {
                let this_index = raw_nodes.len();
                raw_nodes.push(RawFstNode {
                    ty: DIRECTORY,
                    name_offset,
                    data_offset: parent_index,
                    length: 0,
                });
                flatten_tree(files, raw_nodes, strings, this_index as u32);
                raw_nodes[this_index].length = raw_nodes.len() as u32;
            }
            FstNode::File { offset, length, .. } => {
                raw_nodes.push(RawFstNode {
                    ty: 0,
                    name_offset,
                    data_offset: (*offset >> 2) as u32,
                    length: *length,
                });
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum FstToBytesError {
    #[error("fst string table exceeds the 24 bit name offset range")]
    NameTableTooBig,
}

/// Build-ready form of an [`Fst`].
///
/// The node count and string table only depend on the tree's shape and
/// names, never on file offsets, so the serialised size is known before any
/// file placement happens. The builder uses that to fix the file data start,
/// assigns offsets through [`FstToBytes::callback_all_files_mut`], and only
/// then serialises.
pub struct FstToBytes {
    fst: Fst,
    string_bytes: Vec<u8>,
    /// DFS pre-order, root included: offset of node i's name.
    string_offsets: Vec<u32>,
}

impl TryFrom<Fst> for FstToBytes {
    type Error = FstToBytesError;

    fn try_from(fst: Fst) -> Result<Self, FstToBytesError> {
        // index 0 is the root's empty name, a single null byte
        let mut string_bytes = vec![0u8];
        let mut string_offsets = vec![0u32];
        build_string_table(&fst.entries, &mut string_offsets, &mut string_bytes)?;
        Ok(FstToBytes {
            fst,
            string_bytes,
            string_offsets,
        })
    }
}

impl FstToBytes {
    /// Serialised size in bytes: nodes (root included) plus string table.
    /// Stable across offset and length mutation.
    pub fn byte_size(&self) -> usize {
        (1 + count_nodes(&self.fst.entries)) * RAW_NODE_SIZE + self.string_bytes.len()
    }

    pub fn total_file_count(&self) -> usize {
        self.fst.count_files()
    }

    pub fn fst(&self) -> &Fst {
        &self.fst
    }

    pub fn into_fst(self) -> Fst {
        self.fst
    }

    /// Visits every file depth first. The path ends with the file name.
    pub fn callback_all_files<E, F>(&self, callback: &mut F) -> Result<(), E>
    where
        F: FnMut(&Vec<String>, &FstNode) -> Result<(), E>,
    {
        walk_files(&self.fst.entries, &mut Vec::new(), callback)
    }

    /// Like [`FstToBytes::callback_all_files`], but hands out the file's
    /// offset and length for mutation.
    pub fn callback_all_files_mut<E, F>(&mut self, callback: &mut F) -> Result<(), E>
    where
        F: FnMut(&Vec<String>, &mut u64, &mut u32) -> Result<(), E>,
    {
        walk_files_mut(&mut self.fst.entries, &mut Vec::new(), callback)
    }

    /// Emits the flat table with each file's offset and length as they are
    /// right now.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> BinResult<()> {
        let mut raw_nodes = vec![RawFstNode {
            ty: DIRECTORY,
            name_offset: 0,
            data_offset: 0,
            length: 0,
        }];
        let mut counter = 1usize;
        build_raw_nodes(
            &self.fst.entries,
            &self.string_offsets,
            &mut raw_nodes,
            &mut counter,
            0,
        );
        raw_nodes[0].length = raw_nodes.len() as u32;

        let mut cur = Cursor::new(Vec::with_capacity(self.byte_size()));
        for node in &raw_nodes {
            cur.write_be(node)?;
        }
        cur.write_all(&self.string_bytes)?;
        sink.write_all(&cur.into_inner())?;
        Ok(())
    }
}

fn count_nodes(entries: &[FstNode]) -> usize {
    entries
        .iter()
        .map(|e| match e {
            FstNode::Directory { files, .. } => 1 + count_nodes(files),
            FstNode::File { .. } => 1,
        })
        .sum()
}

fn build_string_table(
    entries: &[FstNode],
    offsets: &mut Vec<u32>,
    strings: &mut Vec<u8>,
) -> Result<(), FstToBytesError> {
    for entry in entries {
        if strings.len() > 0xFF_FFFF {
            return Err(FstToBytesError::NameTableTooBig);
        }
        offsets.push(strings.len() as u32);
        strings.extend_from_slice(entry.name().raw_bytes());
        strings.push(0);
        if let FstNode::Directory { files, .. } = entry {
            build_string_table(files, offsets, strings)?;
        }
    }
    Ok(())
}

fn build_raw_nodes(
    entries: &[FstNode],
    string_offsets: &[u32],
    raw_nodes: &mut Vec<RawFstNode>,
    counter: &mut usize,
    parent_index: u32,
) {
    for entry in entries {
        let this_index = *counter;
        *counter += 1;
        let name_offset = string_offsets[this_index];
        match entry {
            FstNode::Directory { files, .. } => {
                raw_nodes.push(RawFstNode {
                    ty: DIRECTORY,
                    name_offset,
                    data_offset: parent_index,
                    length: 0,
                });
                build_raw_nodes(files, string_offsets, raw_nodes, counter, this_index as u32);
                raw_nodes[this_index].length = *counter as u32;
            }
            FstNode::File { offset, length, .. } => {
                raw_nodes.push(RawFstNode {
                    ty: 0,
                    name_offset,
                    data_offset: (*offset >> 2) as u32,
                    length: *length,
                });
            }
        }
    }
}

fn walk_files<E, F>(entries: &[FstNode], path: &mut Vec<String>, callback: &mut F) -> Result<(), E>
where
    F: FnMut(&Vec<String>, &FstNode) -> Result<(), E>,
{
    for entry in entries {
        match entry {
            FstNode::Directory { name, files } => {
                path.push(name.as_str().to_owned());
                walk_files(files, path, callback)?;
                path.pop();
            }
            FstNode::File { name, .. } => {
                path.push(name.as_str().to_owned());
                let result = callback(path, entry);
                path.pop();
                result?;
            }
        }
    }
    Ok(())
}

fn walk_files_mut<E, F>(
    entries: &mut [FstNode],
    path: &mut Vec<String>,
    callback: &mut F,
) -> Result<(), E>
where
    F: FnMut(&Vec<String>, &mut u64, &mut u32) -> Result<(), E>,
{
    for entry in entries.iter_mut() {
        match entry {
            FstNode::Directory { name, files } => {
                path.push(name.as_str().to_owned());
                walk_files_mut(files, path, callback)?;
                path.pop();
            }
            FstNode::File {
                name,
                offset,
                length,
            } => {
                path.push(name.as_str().to_owned());
                let result = callback(path, offset, length);
                path.pop();
                result?;
            }
        }
    }
    Ok(())
}
