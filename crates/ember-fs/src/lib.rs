//! On-disk format of the Ember flat filesystem.
//!
//! Disk layout: `[ boot block | inodes | data blocks ]`, everything in
//! 4 KiB blocks, all integers little-endian. The boot block holds up to 63
//! directory entries mapping a 32-byte name to an inode number; each inode
//! is a full block holding the file length and the list of data-block
//! indices. Data block `k` lives at byte offset `(1 + num_inodes + k) *
//! BLOCK_SIZE` of the image. The filesystem is read-mounted: block contents
//! may be rewritten in place, but lengths and indices are fixed.

#![no_std]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Size of every block in the image: boot block, inodes, and data blocks.
pub const BLOCK_SIZE: usize = 4096;

/// Length of the name field in a directory entry. Names are stored
/// left-justified and space-padded, without a terminator when full.
pub const NAME_LEN: usize = 32;

/// The boot block has room for this many directory entries.
pub const MAX_DENTRIES: usize = 63;

/// Number of data-block indices in one inode: (4096 - 4) / 4.
pub const INODE_BLOCKS: usize = 1023;

type Le32 = U32<LittleEndian>;

/// Directory entry: a fixed 64-byte record in the boot block.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Dentry {
    pub name: [u8; NAME_LEN],
    pub inode: Le32,
    reserved: [u8; 28],
}

/// Boot block: the first 4 KiB of the image.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct BootBlock {
    pub num_dentries: Le32,
    pub num_inodes: Le32,
    pub num_blks: Le32,
    reserved: [u8; 52],
    pub dentries: [Dentry; MAX_DENTRIES],
}

/// Inode: one full block giving a file's length in bytes and its data
/// blocks, in order.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Inode {
    pub len: Le32,
    pub blocks: [Le32; INODE_BLOCKS],
}

impl Dentry {
    pub fn new(name: &str, inode: u32) -> Self {
        let mut d = Dentry::new_zeroed();
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_LEN);
        d.name[..n].copy_from_slice(&bytes[..n]);
        for b in d.name[n..].iter_mut() {
            *b = b' ';
        }
        d.inode = Le32::new(inode);
        d
    }

    /// Whether this entry names `name`. Trailing padding (spaces or NULs)
    /// in the stored field is ignored so that images written by older
    /// tools, which zero-padded, still match.
    pub fn matches(&self, name: &str) -> bool {
        let stored = trim_name(&self.name);
        stored == name.as_bytes()
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(trim_name(&self.name)).into_owned()
    }
}

fn trim_name(field: &[u8; NAME_LEN]) -> &[u8] {
    let end = field
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |i| i + 1);
    &field[..end]
}

impl BootBlock {
    /// Linear search of the directory for `name`.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        let n = self.num_dentries.get() as usize;
        self.dentries[..n.min(MAX_DENTRIES)]
            .iter()
            .find(|d| d.matches(name))
            .map(|d| d.inode.get())
    }
}

impl Inode {
    /// Number of data blocks the file length implies.
    pub fn block_count(&self) -> usize {
        (self.len.get() as usize).div_ceil(BLOCK_SIZE)
    }
}

/// Absolute byte offset of data block `k` within the image.
pub fn data_block_offset(num_inodes: u32, k: u32) -> u64 {
    (1 + num_inodes as u64 + k as u64) * BLOCK_SIZE as u64
}

/// Builds a filesystem image in memory: boot block, then inodes in
/// declaration order, then every file's data blocks concatenated. Shared by
/// the mkfs tool and by kernel tests.
#[derive(Default)]
pub struct ImageBuilder {
    files: Vec<(String, Vec<u8>)>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, name: &str, data: &[u8]) -> Self {
        assert!(self.files.len() < MAX_DENTRIES, "too many files");
        assert!(name.len() <= NAME_LEN, "file name too long");
        self.files.push((String::from(name), Vec::from(data)));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut boot = BootBlock::new_zeroed();
        boot.num_dentries = Le32::new(self.files.len() as u32);
        boot.num_inodes = Le32::new(self.files.len() as u32);

        let mut inodes = Vec::with_capacity(self.files.len());
        let mut next_blk = 0u32;
        for (i, (name, data)) in self.files.iter().enumerate() {
            boot.dentries[i] = Dentry::new(name, i as u32);
            let mut inode = Inode::new_zeroed();
            inode.len = Le32::new(data.len() as u32);
            for j in 0..data.len().div_ceil(BLOCK_SIZE) {
                inode.blocks[j] = Le32::new(next_blk);
                next_blk += 1;
            }
            inodes.push(inode);
        }
        boot.num_blks = Le32::new(next_blk);

        let mut image = Vec::with_capacity((1 + inodes.len()) * BLOCK_SIZE);
        image.extend_from_slice(boot.as_bytes());
        for inode in &inodes {
            image.extend_from_slice(inode.as_bytes());
        }
        for (_, data) in &self.files {
            image.extend_from_slice(data);
            let pad = data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE - data.len();
            image.resize(image.len() + pad, 0);
        }
        image
    }
}
