/* Copyright (C) 2024 Philipp Benner
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::io::{self, Read, Seek, SeekFrom, Write};

use async_stream::stream;
use futures_core::stream::Stream;

use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::bed::{BbiBedRecord, BedBlockParser};
use crate::error::BigBedError;

/* -------------------------------------------------------------------------- */

pub const BIGBED_MAGIC    : u32 = 0x8789F2EB;
pub const CHROM_TREE_MAGIC: u32 = 0x78CA8C91;
pub const IDX_MAGIC       : u32 = 0x2468ACE0;

pub const BBI_MAX_ZOOM_LEVELS: usize = 10;
pub const BBI_MIN_VERSION    : u16   = 3;

const FILE_HEADER_SIZE : u64 = 64;
const ZOOM_HEADER_SIZE : u64 = 24;
const SUMMARY_SIZE     : u64 = 40;
const TREE_HEADER_SIZE : u64 = 32;
const INDEX_HEADER_SIZE: u64 = 48;

/* -------------------------------------------------------------------------- */

pub fn compress_slice(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn uncompress_slice(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut buffer  = Vec::new();
    decoder.read_to_end(&mut buffer)?;
    Ok(buffer)
}

/* -------------------------------------------------------------------------- */

/// Whole-file summary statistics. BigBed files carry this block for
/// compatibility with bigWig tooling; this writer emits it zeroed.
#[derive(Clone, Copy, Debug, Default)]
pub struct BbiSummary {
    pub bases_covered: u64,
    pub min          : f64,
    pub max          : f64,
    pub sum          : f64,
    pub sum_squares  : f64,
}

/* -------------------------------------------------------------------------- */

impl BbiSummary {

    pub fn read<E: ByteOrder, R: Read + Seek>(&mut self, reader: &mut R) -> io::Result<()> {
        self.bases_covered = reader.read_u64::<E>()?;
        self.min           = reader.read_f64::<E>()?;
        self.max           = reader.read_f64::<E>()?;
        self.sum           = reader.read_f64::<E>()?;
        self.sum_squares   = reader.read_f64::<E>()?;
        Ok(())
    }

    pub fn write<E: ByteOrder, W: Write + Seek>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u64::<E>(self.bases_covered)?;
        writer.write_f64::<E>(self.min)?;
        writer.write_f64::<E>(self.max)?;
        writer.write_f64::<E>(self.sum)?;
        writer.write_f64::<E>(self.sum_squares)?;
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */

/// Header of one zoom level. Zoom data is read but never produced.
#[derive(Clone, Copy, Debug, Default)]
pub struct BbiHeaderZoom {
    pub reduction_level: u32,
    pub reserved       : u32,
    pub data_offset    : u64,
    pub index_offset   : u64,
}

/* -------------------------------------------------------------------------- */

impl BbiHeaderZoom {

    pub fn read<E: ByteOrder, R: Read + Seek>(&mut self, reader: &mut R) -> io::Result<()> {
        self.reduction_level = reader.read_u32::<E>()?;
        self.reserved        = reader.read_u32::<E>()?;
        self.data_offset     = reader.read_u64::<E>()?;
        self.index_offset    = reader.read_u64::<E>()?;
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */

/// The fixed-size header at the start of every BigBed file, together with
/// the zoom headers, the total summary, and the feature count stored at the
/// beginning of the data section.
#[derive(Clone, Debug, Default)]
pub struct BbiHeader {
    pub magic                : u32,
    pub version              : u16,
    pub zoom_levels          : u16,
    pub chrom_tree_offset    : u64,
    pub full_data_offset     : u64,
    pub full_index_offset    : u64,
    pub field_count          : u16,
    pub defined_field_count  : u16,
    pub auto_sql_offset      : u64,
    pub total_summary_offset : u64,
    pub uncompressed_buf_size: u32,
    pub reserved             : u64,
    pub zoom_headers         : Vec<BbiHeaderZoom>,
    pub summary              : BbiSummary,
    pub n_entries            : u64,
}

/* -------------------------------------------------------------------------- */

impl BbiHeader {

    pub fn read<E: ByteOrder, R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), BigBedError> {
        reader.seek(SeekFrom::Start(0))?;
        self.magic = reader.read_u32::<E>()?;
        if self.magic != BIGBED_MAGIC {
            return Err(BigBedError::InvalidMagic);
        }
        self.version = reader.read_u16::<E>()?;
        if self.version < BBI_MIN_VERSION {
            return Err(BigBedError::UnsupportedVersion(self.version));
        }
        self.zoom_levels           = reader.read_u16::<E>()?;
        self.chrom_tree_offset     = reader.read_u64::<E>()?;
        self.full_data_offset      = reader.read_u64::<E>()?;
        self.full_index_offset     = reader.read_u64::<E>()?;
        self.field_count           = reader.read_u16::<E>()?;
        self.defined_field_count   = reader.read_u16::<E>()?;
        self.auto_sql_offset       = reader.read_u64::<E>()?;
        self.total_summary_offset  = reader.read_u64::<E>()?;
        self.uncompressed_buf_size = reader.read_u32::<E>()?;
        self.reserved              = reader.read_u64::<E>()?;

        self.zoom_headers.clear();
        for _ in 0..self.zoom_levels {
            let mut zoom_header = BbiHeaderZoom::default();
            zoom_header.read::<E, R>(reader)?;
            self.zoom_headers.push(zoom_header);
        }
        // the data section starts with the number of features in the file
        reader.seek(SeekFrom::Start(self.full_data_offset))?;
        self.n_entries = reader.read_u64::<E>()?;

        if self.total_summary_offset != 0 {
            reader.seek(SeekFrom::Start(self.total_summary_offset))?;
            self.summary.read::<E, R>(reader)?;
        }
        Ok(())
    }

    pub fn write<E: ByteOrder, W: Write + Seek>(&self, writer: &mut W) -> Result<(), BigBedError> {
        writer.seek(SeekFrom::Start(0))?;
        writer.write_u32::<E>(self.magic)?;
        writer.write_u16::<E>(self.version)?;
        writer.write_u16::<E>(self.zoom_levels)?;
        writer.write_u64::<E>(self.chrom_tree_offset)?;
        writer.write_u64::<E>(self.full_data_offset)?;
        writer.write_u64::<E>(self.full_index_offset)?;
        writer.write_u16::<E>(self.field_count)?;
        writer.write_u16::<E>(self.defined_field_count)?;
        writer.write_u64::<E>(self.auto_sql_offset)?;
        writer.write_u64::<E>(self.total_summary_offset)?;
        writer.write_u32::<E>(self.uncompressed_buf_size)?;
        writer.write_u64::<E>(self.reserved)?;
        Ok(())
    }

    pub fn write_n_entries<E: ByteOrder, W: Write + Seek>(&self, writer: &mut W) -> Result<(), BigBedError> {
        writer.seek(SeekFrom::Start(self.full_data_offset))?;
        writer.write_u64::<E>(self.n_entries)?;
        Ok(())
    }

    pub fn write_summary<E: ByteOrder, W: Write + Seek>(&self, writer: &mut W) -> Result<(), BigBedError> {
        if self.total_summary_offset != 0 {
            writer.seek(SeekFrom::Start(self.total_summary_offset))?;
            self.summary.write::<E, W>(writer)?;
        }
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */

// Index of the first element in [0, count) for which `less` is false
fn lower_bound(count: usize, less: impl Fn(usize) -> bool) -> usize {
    let mut lo = 0;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if less(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/* -------------------------------------------------------------------------- */

/// On-disk B+-tree mapping zero-padded sequence names to a dense chromosome
/// identifier and the chromosome length. Lookups walk the tree on disk; the
/// node scratch buffers are preallocated so queries do not allocate.
#[derive(Clone, Debug, Default)]
pub struct BTree {
    pub magic     : u32,
    pub block_size: u32,
    pub key_size  : u32,
    pub value_size: u32,
    pub item_count: u64,
    root_offset   : u64,
    // write side
    names         : Vec<(String, u32)>,
    // preallocated lookup scratch
    key_buf       : Vec<u8>,
    node_keys     : Vec<u8>,
    node_vals     : Vec<u8>,
}

/* -------------------------------------------------------------------------- */

impl BTree {

    pub fn open<E: ByteOrder, R: Read + Seek>(reader: &mut R, offset: u64) -> Result<BTree, BigBedError> {
        reader.seek(SeekFrom::Start(offset))?;

        let mut btree = BTree::default();
        btree.magic       = reader.read_u32::<E>()?;
        btree.block_size  = reader.read_u32::<E>()?;
        btree.key_size    = reader.read_u32::<E>()?;
        btree.value_size  = reader.read_u32::<E>()?;
        btree.item_count  = reader.read_u64::<E>()?;
        let _reserved     = reader.read_u64::<E>()?;
        btree.root_offset = offset + TREE_HEADER_SIZE;

        // Magic validation is deferred to the first lookup; scratch space is
        // only set up for trees with a plausible geometry
        if btree.magic == CHROM_TREE_MAGIC {
            if btree.block_size == 0 || btree.block_size > 0x10000 || btree.key_size == 0 || btree.key_size > 4096 {
                return Err(BigBedError::CorruptIndex(String::from("chromosome tree header has implausible geometry")));
            }
            btree.key_buf   = vec![0; btree.key_size as usize];
            btree.node_keys = vec![0; btree.block_size as usize * btree.key_size as usize];
            btree.node_vals = vec![0; btree.block_size as usize * 8];
        }
        Ok(btree)
    }

    fn read_node<E: ByteOrder, R: Read + Seek>(&mut self, reader: &mut R, file_size: u64, offset: u64) -> Result<(u8, usize), BigBedError> {
        if offset >= file_size {
            return Err(BigBedError::CorruptIndex(String::from("chromosome tree node offset outside of file")));
        }
        reader.seek(SeekFrom::Start(offset))?;
        let is_leaf   = reader.read_u8()?;
        let _reserved = reader.read_u8()?;
        let count     = reader.read_u16::<E>()? as usize;
        if count > self.block_size as usize {
            return Err(BigBedError::CorruptIndex(String::from("chromosome tree node count exceeds block size")));
        }
        if is_leaf > 1 {
            return Err(BigBedError::CorruptIndex(String::from("invalid chromosome tree node type")));
        }
        let key_size = self.key_size as usize;
        for i in 0..count {
            reader.read_exact(&mut self.node_keys[i*key_size..(i + 1)*key_size])?;
            reader.read_exact(&mut self.node_vals[i*8..(i + 1)*8])?;
        }
        Ok((is_leaf, count))
    }

    /// Resolves a sequence name to `(chrom_id, chrom_size)` by walking the
    /// tree on disk.
    pub fn lookup<E: ByteOrder, R: Read + Seek>(&mut self, reader: &mut R, file_size: u64, seqname: &str) -> Result<(u32, u32), BigBedError> {
        if self.magic != CHROM_TREE_MAGIC {
            return Err(BigBedError::InvalidMagic);
        }
        let key_size = self.key_size as usize;
        if seqname.len() > key_size {
            return Err(BigBedError::SeqnameNotFound(seqname.to_string()));
        }
        self.key_buf.iter_mut().for_each(|b| *b = 0);
        self.key_buf[..seqname.len()].copy_from_slice(seqname.as_bytes());

        let mut offset = self.root_offset;
        loop {
            let (is_leaf, count) = self.read_node::<E, R>(reader, file_size, offset)?;

            let i = lower_bound(count, |i| self.node_keys[i*key_size..(i + 1)*key_size] < self.key_buf[..]);

            if is_leaf == 1 {
                if i < count && self.node_keys[i*key_size..(i + 1)*key_size] == self.key_buf[..] {
                    let chrom_id   = E::read_u32(&self.node_vals[i*8  ..i*8 + 4]);
                    let chrom_size = E::read_u32(&self.node_vals[i*8+4..i*8 + 8]);
                    return Ok((chrom_id, chrom_size));
                }
                return Err(BigBedError::SeqnameNotFound(seqname.to_string()));
            }
            // Separator keys hold the first key of the corresponding child
            // subtree, so descend into the last child whose separator does
            // not exceed the query
            let child = if i < count && self.node_keys[i*key_size..(i + 1)*key_size] == self.key_buf[..] {
                i
            } else if i == 0 {
                return Err(BigBedError::SeqnameNotFound(seqname.to_string()));
            } else {
                i - 1
            };
            offset = E::read_u64(&self.node_vals[child*8..(child + 1)*8]);
        }
    }

    /// Enumerates all `(seqname, chrom_id, chrom_size)` entries of the tree.
    pub fn chrom_list<E: ByteOrder, R: Read + Seek>(&mut self, reader: &mut R, file_size: u64) -> Result<Vec<(String, u32, u32)>, BigBedError> {
        if self.magic != CHROM_TREE_MAGIC {
            return Err(BigBedError::InvalidMagic);
        }
        let key_size = self.key_size as usize;
        let mut result  = Vec::with_capacity(self.item_count as usize);
        let mut stack   = vec![self.root_offset];
        let mut visited = 0u64;

        while let Some(offset) = stack.pop() {
            visited += 1;
            if visited > 2 * self.item_count + 64 {
                return Err(BigBedError::CorruptIndex(String::from("chromosome tree traversal does not terminate")));
            }
            let (is_leaf, count) = self.read_node::<E, R>(reader, file_size, offset)?;

            if is_leaf == 1 {
                for i in 0..count {
                    let key  = &self.node_keys[i*key_size..(i + 1)*key_size];
                    let name = String::from_utf8_lossy(key).trim_end_matches('\0').to_string();
                    let chrom_id   = E::read_u32(&self.node_vals[i*8  ..i*8 + 4]);
                    let chrom_size = E::read_u32(&self.node_vals[i*8+4..i*8 + 8]);
                    result.push((name, chrom_id, chrom_size));
                }
            } else {
                for i in (0..count).rev() {
                    stack.push(E::read_u64(&self.node_vals[i*8..(i + 1)*8]));
                }
            }
        }
        Ok(result)
    }

    /* Construction
     * ---------------------------------------------------------------------- */

    pub fn add(&mut self, seqname: &str, chrom_size: u32) {
        self.names.push((seqname.to_string(), chrom_size));
    }

    /// Writes the complete tree at the current stream position. Names are
    /// sorted in ascending byte order and chromosome identifiers assigned
    /// densely in that order. Levels are emitted root first; node positions
    /// follow from the uniform node width, so child offsets are computed
    /// arithmetically.
    pub fn write<E: ByteOrder, W: Write + Seek>(&mut self, writer: &mut W) -> Result<u64, BigBedError> {
        let tree_offset = writer.seek(SeekFrom::Current(0))?;

        self.names.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let n        = self.names.len();
        let key_size = self.names.iter().map(|x| x.0.len()).max().unwrap_or(0).max(1);
        // a fan-out below two cannot shrink the item count per level
        let mut bs = (self.block_size as usize).max(1).min(n.max(1)).min(0xffff);
        if n > 1 && bs < 2 {
            bs = 2;
        }

        self.magic      = CHROM_TREE_MAGIC;
        self.block_size = bs as u32;
        self.key_size   = key_size as u32;
        self.value_size = 8;
        self.item_count = n as u64;

        let mut levels   = 1usize;
        let mut capacity = bs as u64;
        while capacity < n as u64 {
            capacity = capacity.saturating_mul(bs as u64);
            levels  += 1;
        }
        let node_size  = 4 + bs as u64 * (key_size as u64 + 8);
        let leaf_nodes = if n == 0 { 1 } else { (n + bs - 1) / bs };

        let mut level_nodes = vec![0u64; levels];
        for l in 0..levels {
            if l == 0 {
                level_nodes[l] = leaf_nodes as u64;
            } else {
                let span = (bs as u64).pow(l as u32 + 1);
                level_nodes[l] = (n as u64 + span - 1) / span;
            }
        }
        let mut level_starts = vec![0u64; levels];
        let mut position     = tree_offset + TREE_HEADER_SIZE;
        for l in (0..levels).rev() {
            level_starts[l] = position;
            position += level_nodes[l] * node_size;
        }

        writer.write_u32::<E>(CHROM_TREE_MAGIC)?;
        writer.write_u32::<E>(bs as u32)?;
        writer.write_u32::<E>(self.key_size)?;
        writer.write_u32::<E>(self.value_size)?;
        writer.write_u64::<E>(self.item_count)?;
        writer.write_u64::<E>(0)?;

        let mut key = vec![0u8; key_size];

        // non-leaf levels, root first; a slot holds the first key of the
        // child subtree and the child's future file offset
        for l in (1..levels).rev() {
            let per_slot = (bs as u64).pow(l as u32);
            let per_node = per_slot * bs as u64;
            for j in 0..level_nodes[l] {
                let first = j * per_node;
                let live  = ((n as u64 - first + per_slot - 1) / per_slot).min(bs as u64);
                writer.write_u8(0)?;
                writer.write_u8(0)?;
                writer.write_u16::<E>(live as u16)?;
                for s in 0..bs as u64 {
                    key.iter_mut().for_each(|b| *b = 0);
                    if s < live {
                        let item = (first + s * per_slot) as usize;
                        key[..self.names[item].0.len()].copy_from_slice(self.names[item].0.as_bytes());
                        writer.write_all(&key)?;
                        writer.write_u64::<E>(level_starts[l - 1] + (j * bs as u64 + s) * node_size)?;
                    } else {
                        writer.write_all(&key)?;
                        writer.write_u64::<E>(0)?;
                    }
                }
            }
        }
        // leaf level
        for j in 0..leaf_nodes {
            let first = j * bs;
            let live  = n.saturating_sub(first).min(bs);
            writer.write_u8(1)?;
            writer.write_u8(0)?;
            writer.write_u16::<E>(live as u16)?;
            for s in 0..bs {
                key.iter_mut().for_each(|b| *b = 0);
                if s < live {
                    let item = first + s;
                    key[..self.names[item].0.len()].copy_from_slice(self.names[item].0.as_bytes());
                    writer.write_all(&key)?;
                    writer.write_u32::<E>(item as u32)?;
                    writer.write_u32::<E>(self.names[item].1)?;
                } else {
                    writer.write_all(&key)?;
                    writer.write_u32::<E>(0)?;
                    writer.write_u32::<E>(0)?;
                }
            }
        }
        self.root_offset = tree_offset + TREE_HEADER_SIZE;

        Ok(tree_offset)
    }
}

/* -------------------------------------------------------------------------- */

/// Genomic bounding box over `(chromosome index, base position)` pairs in
/// 0-based half-open coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RTreeBbox {
    pub start_chrom_ix: u32,
    pub start_base    : u32,
    pub end_chrom_ix  : u32,
    pub end_base      : u32,
}

/* -------------------------------------------------------------------------- */

fn position_less(chrom1: u32, base1: u32, chrom2: u32, base2: u32) -> bool {
    chrom1 < chrom2 || (chrom1 == chrom2 && base1 < base2)
}

impl RTreeBbox {

    pub fn new(chrom_ix: u32, start: u32, end: u32) -> Self {
        RTreeBbox {
            start_chrom_ix: chrom_ix,
            start_base    : start,
            end_chrom_ix  : chrom_ix,
            end_base      : end,
        }
    }

    pub fn union(&self, other: &RTreeBbox) -> RTreeBbox {
        let mut result = *self;
        if position_less(other.start_chrom_ix, other.start_base, result.start_chrom_ix, result.start_base) {
            result.start_chrom_ix = other.start_chrom_ix;
            result.start_base     = other.start_base;
        }
        if position_less(result.end_chrom_ix, result.end_base, other.end_chrom_ix, other.end_base) {
            result.end_chrom_ix = other.end_chrom_ix;
            result.end_base     = other.end_base;
        }
        result
    }

    /// Tests whether the query `[from, to)` on the given chromosome can
    /// overlap any feature inside this box. The test is conservative at the
    /// box boundaries; candidates are filtered against exact feature
    /// coordinates later.
    pub fn overlaps(&self, chrom_id: u32, from: u32, to: u32) -> bool {
        self.start_chrom_ix <= chrom_id && chrom_id <= self.end_chrom_ix
            && (chrom_id < self.end_chrom_ix   || from <= self.end_base)
            && (chrom_id > self.start_chrom_ix || to > self.start_base)
    }

    fn read<E: ByteOrder, R: Read>(reader: &mut R) -> io::Result<RTreeBbox> {
        Ok(RTreeBbox {
            start_chrom_ix: reader.read_u32::<E>()?,
            start_base    : reader.read_u32::<E>()?,
            end_chrom_ix  : reader.read_u32::<E>()?,
            end_base      : reader.read_u32::<E>()?,
        })
    }

    fn write<E: ByteOrder, W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<E>(self.start_chrom_ix)?;
        writer.write_u32::<E>(self.start_base)?;
        writer.write_u32::<E>(self.end_chrom_ix)?;
        writer.write_u32::<E>(self.end_base)?;
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */

/// One indexed data block: its bounding box and location in the file.
#[derive(Clone, Copy, Debug)]
pub struct RTreeLeaf {
    pub bbox       : RTreeBbox,
    pub data_offset: u64,
    pub data_size  : u64,
}

/* -------------------------------------------------------------------------- */

/// On-disk R-tree over the bounding boxes of all data blocks. The search
/// walks the tree with an explicit stack, pruning subtrees whose bounding
/// box cannot overlap the query.
#[derive(Clone, Debug, Default)]
pub struct RTree {
    pub magic          : u32,
    pub block_size     : u32,
    pub item_count     : u64,
    pub bbox           : RTreeBbox,
    pub end_file_offset: u64,
    pub items_per_slot : u32,
    root_offset        : u64,
    leaves             : Vec<RTreeLeaf>,
}

/* -------------------------------------------------------------------------- */

impl RTree {

    pub fn open<E: ByteOrder, R: Read + Seek>(reader: &mut R, offset: u64) -> Result<RTree, BigBedError> {
        reader.seek(SeekFrom::Start(offset))?;

        let mut rtree = RTree::default();
        rtree.magic           = reader.read_u32::<E>()?;
        rtree.block_size      = reader.read_u32::<E>()?;
        rtree.item_count      = reader.read_u64::<E>()?;
        rtree.bbox            = RTreeBbox::read::<E, R>(reader)?;
        rtree.end_file_offset = reader.read_u64::<E>()?;
        rtree.items_per_slot  = reader.read_u32::<E>()?;
        let _reserved         = reader.read_u32::<E>()?;
        rtree.root_offset     = offset + INDEX_HEADER_SIZE;

        Ok(rtree)
    }

    /// Collects `(data_offset, data_size)` of every data block whose
    /// bounding box overlaps the query `[from, to)`. Blocks are returned in
    /// depth-first traversal order, not genomic order.
    pub fn search<E: ByteOrder, R: Read + Seek>(&self, reader: &mut R, file_size: u64, chrom_id: u32, from: u32, to: u32) -> Result<Vec<(u64, u64)>, BigBedError> {
        if self.magic != IDX_MAGIC {
            return Err(BigBedError::InvalidMagic);
        }
        let mut blocks  = Vec::new();
        let mut stack   = vec![self.root_offset];
        let mut visited = 0u64;

        while let Some(offset) = stack.pop() {
            if offset >= file_size {
                return Err(BigBedError::CorruptIndex(String::from("interval tree node offset outside of file")));
            }
            visited += 1;
            if visited > 2 * self.item_count + 64 {
                return Err(BigBedError::CorruptIndex(String::from("interval tree traversal does not terminate")));
            }
            reader.seek(SeekFrom::Start(offset))?;
            let is_leaf   = reader.read_u8()?;
            let _reserved = reader.read_u8()?;
            let count     = reader.read_u16::<E>()? as u32;
            if count > self.block_size {
                return Err(BigBedError::CorruptIndex(String::from("interval tree node count exceeds block size")));
            }
            if is_leaf == 1 {
                for _ in 0..count {
                    let bbox        = RTreeBbox::read::<E, R>(reader)?;
                    let data_offset = reader.read_u64::<E>()?;
                    let data_size   = reader.read_u64::<E>()?;
                    if bbox.overlaps(chrom_id, from, to) {
                        blocks.push((data_offset, data_size));
                    }
                }
            } else if is_leaf == 0 {
                let mut children = Vec::new();
                for _ in 0..count {
                    let bbox         = RTreeBbox::read::<E, R>(reader)?;
                    let child_offset = reader.read_u64::<E>()?;
                    if bbox.overlaps(chrom_id, from, to) {
                        children.push(child_offset);
                    }
                }
                for child in children.into_iter().rev() {
                    stack.push(child);
                }
            } else {
                return Err(BigBedError::CorruptIndex(String::from("invalid interval tree node type")));
            }
        }
        Ok(blocks)
    }

    /* Construction
     * ---------------------------------------------------------------------- */

    pub fn add_leaf(&mut self, bbox: RTreeBbox, data_offset: u64, data_size: u64) {
        self.leaves.push(RTreeLeaf { bbox, data_offset, data_size });
    }

    /// Writes the packed tree at the current stream position. Consecutive
    /// leaf items are grouped into nodes of up to `block_size` children and
    /// recursively into higher levels until a single root remains; levels
    /// are emitted root first so that the root immediately follows the
    /// header.
    pub fn write<E: ByteOrder, W: Write + Seek>(&mut self, writer: &mut W) -> Result<u64, BigBedError> {
        let tree_offset = writer.seek(SeekFrom::Current(0))?;
        // a fan-out below two cannot shrink the node count per level
        let bs = (self.block_size as usize).max(2).min(0xffff);
        let n  = self.leaves.len();

        self.magic           = IDX_MAGIC;
        self.block_size      = bs as u32;
        self.item_count      = n as u64;
        self.end_file_offset = tree_offset;
        self.root_offset     = tree_offset + INDEX_HEADER_SIZE;

        // per-level bounding boxes, bottom up; level 0 holds one box per
        // leaf node
        let mut level_boxes: Vec<Vec<RTreeBbox>> = Vec::new();
        let mut boxes: Vec<RTreeBbox> = self.leaves
            .chunks(bs)
            .map(|chunk| chunk.iter().skip(1).fold(chunk[0].bbox, |acc, leaf| acc.union(&leaf.bbox)))
            .collect();
        if boxes.is_empty() {
            boxes.push(RTreeBbox::default());
        }
        level_boxes.push(boxes);
        while level_boxes.last().unwrap().len() > 1 {
            let next: Vec<RTreeBbox> = level_boxes.last().unwrap()
                .chunks(bs)
                .map(|chunk| chunk.iter().skip(1).fold(chunk[0], |acc, bbox| acc.union(bbox)))
                .collect();
            level_boxes.push(next);
        }
        let levels = level_boxes.len();

        self.bbox = if n == 0 { RTreeBbox::default() } else { level_boxes[levels - 1][0] };

        let leaf_node_size     = 4 + bs as u64 * 32;
        let internal_node_size = 4 + bs as u64 * 24;
        let mut level_starts = vec![0u64; levels];
        let mut position     = tree_offset + INDEX_HEADER_SIZE;
        for l in (0..levels).rev() {
            level_starts[l] = position;
            position += level_boxes[l].len() as u64 * if l == 0 { leaf_node_size } else { internal_node_size };
        }

        writer.write_u32::<E>(IDX_MAGIC)?;
        writer.write_u32::<E>(bs as u32)?;
        writer.write_u64::<E>(self.item_count)?;
        self.bbox.write::<E, W>(writer)?;
        writer.write_u64::<E>(self.end_file_offset)?;
        writer.write_u32::<E>(self.items_per_slot)?;
        writer.write_u32::<E>(0)?;

        for l in (0..levels).rev() {
            if l == 0 {
                if self.leaves.is_empty() {
                    writer.write_u8(1)?;
                    writer.write_u8(0)?;
                    writer.write_u16::<E>(0)?;
                    for _ in 0..bs {
                        writer.write_all(&[0u8; 32])?;
                    }
                } else {
                    for chunk in self.leaves.chunks(bs) {
                        writer.write_u8(1)?;
                        writer.write_u8(0)?;
                        writer.write_u16::<E>(chunk.len() as u16)?;
                        for leaf in chunk {
                            leaf.bbox.write::<E, W>(writer)?;
                            writer.write_u64::<E>(leaf.data_offset)?;
                            writer.write_u64::<E>(leaf.data_size)?;
                        }
                        for _ in chunk.len()..bs {
                            writer.write_all(&[0u8; 32])?;
                        }
                    }
                }
            } else {
                let child_count = level_boxes[l - 1].len();
                let child_size  = if l == 1 { leaf_node_size } else { internal_node_size };
                for j in 0..level_boxes[l].len() {
                    let lo = j * bs;
                    let hi = ((j + 1) * bs).min(child_count);
                    writer.write_u8(0)?;
                    writer.write_u8(0)?;
                    writer.write_u16::<E>((hi - lo) as u16)?;
                    for c in lo..hi {
                        level_boxes[l - 1][c].write::<E, W>(writer)?;
                        writer.write_u64::<E>(level_starts[l - 1] + c as u64 * child_size)?;
                    }
                    for _ in hi - lo..bs {
                        writer.write_all(&[0u8; 24])?;
                    }
                }
            }
        }
        Ok(tree_offset)
    }
}

/* -------------------------------------------------------------------------- */

/// Parsed state of an open BigBed file: the header, both trees, and the
/// scratch buffers shared by all queries of the owning reader.
#[derive(Clone, Debug, Default)]
pub struct BbiFile {
    pub header    : BbiHeader,
    pub chrom_tree: BTree,
    pub index     : RTree,
    file_size     : u64,
    raw_buffer    : Vec<u8>,
    buffer        : Vec<u8>,
}

/* -------------------------------------------------------------------------- */

impl BbiFile {

    pub fn open<E: ByteOrder, R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), BigBedError> {
        self.file_size = reader.seek(SeekFrom::End(0)).map_err(|_| BigBedError::NotSeekable)?;
        self.header.read::<E, R>(reader)?;
        self.chrom_tree = BTree::open::<E, R>(reader, self.header.chrom_tree_offset)?;
        self.index      = RTree::open::<E, R>(reader, self.header.full_index_offset)?;
        self.buffer     = Vec::with_capacity(self.header.uncompressed_buf_size as usize);
        Ok(())
    }

    pub fn lookup<E: ByteOrder, R: Read + Seek>(&mut self, reader: &mut R, seqname: &str) -> Result<(u32, u32), BigBedError> {
        self.chrom_tree.lookup::<E, R>(reader, self.file_size, seqname)
    }

    pub fn chrom_list<E: ByteOrder, R: Read + Seek>(&mut self, reader: &mut R) -> Result<Vec<(String, u32, u32)>, BigBedError> {
        self.chrom_tree.chrom_list::<E, R>(reader, self.file_size)
    }

    pub fn overlapping_blocks<E: ByteOrder, R: Read + Seek>(&mut self, reader: &mut R, chrom_id: u32, from: u32, to: u32) -> Result<Vec<(u64, u64)>, BigBedError> {
        self.index.search::<E, R>(reader, self.file_size, chrom_id, from, to)
    }

    // Fetches one data block into the shared scratch buffer and returns the
    // payload length
    fn read_block<E: ByteOrder, R: Read + Seek>(&mut self, reader: &mut R, data_offset: u64, data_size: u64) -> Result<usize, BigBedError> {
        reader.seek(SeekFrom::Start(data_offset))?;
        self.raw_buffer.clear();
        self.raw_buffer.resize(data_size as usize, 0);
        reader.read_exact(&mut self.raw_buffer)?;

        self.buffer.clear();
        if self.header.uncompressed_buf_size > 0 {
            let limit = self.header.uncompressed_buf_size as u64;
            let mut decoder = ZlibDecoder::new(&self.raw_buffer[..]).take(limit + 1);
            decoder.read_to_end(&mut self.buffer)?;
            if self.buffer.len() as u64 > limit {
                return Err(BigBedError::CorruptIndex(String::from("data block exceeds the uncompressed buffer size")));
            }
        } else {
            self.buffer.extend_from_slice(&self.raw_buffer);
        }
        Ok(self.buffer.len())
    }

    /// Lazily yields all features on the given chromosome overlapping
    /// `[from, to)` in 0-based half-open coordinates. Features are emitted
    /// in block traversal order and, within a block, in on-disk order.
    pub fn query_stream<'a, E: ByteOrder + 'a, R: Read + Seek>(
        &'a mut self,
        reader  : &'a mut R,
        chrom_id: u32,
        from    : u32,
        to      : u32,
    ) -> impl Stream<Item = Result<BbiBedRecord, BigBedError>> + 'a {

        stream! {

            let blocks = match self.overlapping_blocks::<E, R>(reader, chrom_id, from, to) {
                Ok (blocks) => blocks,
                Err(err)    => {
                    yield Err(err);
                    return;
                }
            };

            for (data_offset, data_size) in blocks {

                let length = match self.read_block::<E, R>(reader, data_offset, data_size) {
                    Ok (length) => length,
                    Err(err)    => {
                        yield Err(err);
                        return;
                    }
                };

                let mut parser = BedBlockParser::new(&self.buffer[..length]);

                loop {
                    match parser.next_entry::<E>() {
                        Ok(Some(entry)) => {
                            if entry.chrom_id == chrom_id && entry.from < to && entry.to > from {
                                yield Ok(entry);
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            // a malformed record terminates this block
                            yield Err(err);
                            break;
                        }
                    }
                }
            }
        }
    }

    /* Construction
     * ---------------------------------------------------------------------- */

    /// Reserves space for the file header, the maximum zoom header array,
    /// and the total summary.
    pub fn create<E: ByteOrder, W: Write + Seek>(&mut self, writer: &mut W) -> Result<(), BigBedError> {
        writer.seek(SeekFrom::Start(0)).map_err(|_| BigBedError::NotSeekable)?;
        let reserved = vec![0u8; (FILE_HEADER_SIZE + BBI_MAX_ZOOM_LEVELS as u64 * ZOOM_HEADER_SIZE + SUMMARY_SIZE) as usize];
        writer.write_all(&reserved)?;
        self.header.total_summary_offset = FILE_HEADER_SIZE + BBI_MAX_ZOOM_LEVELS as u64 * ZOOM_HEADER_SIZE;
        self.header.chrom_tree_offset    = self.header.total_summary_offset + SUMMARY_SIZE;
        Ok(())
    }

    pub fn write_chrom_tree<E: ByteOrder, W: Write + Seek>(&mut self, writer: &mut W) -> Result<(), BigBedError> {
        self.header.chrom_tree_offset = self.chrom_tree.write::<E, W>(writer)?;
        Ok(())
    }

    pub fn write_index<E: ByteOrder, W: Write + Seek>(&mut self, writer: &mut W) -> Result<(), BigBedError> {
        self.header.full_index_offset = self.index.write::<E, W>(writer)?;
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */
/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {

    use std::io::Cursor;

    use byteorder::LittleEndian;

    use crate::bbi::{compress_slice, uncompress_slice, BTree, RTree, RTreeBbox};
    use crate::error::BigBedError;

    #[test]
    fn test_compress_roundtrip() {

        let data = b"lorem ipsum dolor sit amet".repeat(20);

        let compressed = compress_slice(&data).unwrap();

        assert!(compressed.len() < data.len());
        assert_eq!(uncompress_slice(&compressed).unwrap(), data);
    }

    #[test]
    fn test_btree_roundtrip() {

        let mut file = Cursor::new(Vec::new());

        let mut btree = BTree::default();
        btree.block_size = 4;

        // enough names to force three tree levels at a fan-out of four
        let names: Vec<String> = (0..100).map(|i| format!("chr{:03}", i)).collect();
        for (i, name) in names.iter().enumerate() {
            btree.add(name, 1000 + i as u32);
        }
        btree.write::<LittleEndian, _>(&mut file).unwrap();

        let file_size = file.get_ref().len() as u64;
        let mut btree = BTree::open::<LittleEndian, _>(&mut file, 0).unwrap();

        assert_eq!(btree.item_count, 100);
        assert_eq!(btree.key_size, 6);

        for (i, name) in names.iter().enumerate() {
            let (chrom_id, chrom_size) = btree.lookup::<LittleEndian, _>(&mut file, file_size, name).unwrap();
            assert_eq!(chrom_id, i as u32);
            assert_eq!(chrom_size, 1000 + i as u32);
        }
        match btree.lookup::<LittleEndian, _>(&mut file, file_size, "chr999") {
            Err(BigBedError::SeqnameNotFound(_)) => {}
            other => panic!("unexpected lookup result: {:?}", other.map(|_| ())),
        }
        match btree.lookup::<LittleEndian, _>(&mut file, file_size, "name-longer-than-keys") {
            Err(BigBedError::SeqnameNotFound(_)) => {}
            other => panic!("unexpected lookup result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_btree_pathological_keys() {

        let mut file = Cursor::new(Vec::new());

        let mut btree = BTree::default();
        btree.block_size = 2;

        // mixed-length names whose byte order differs from their numeric
        // order, with a fan-out small enough for several internal levels
        let mut names: Vec<String> = (0..40).map(|i| format!("c{}", i)).collect();
        names.push(String::from("c"));
        names.push(String::from("c1x"));
        names.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

        for name in names.iter() {
            btree.add(name, 1);
        }
        btree.write::<LittleEndian, _>(&mut file).unwrap();

        let file_size = file.get_ref().len() as u64;
        let mut btree = BTree::open::<LittleEndian, _>(&mut file, 0).unwrap();

        for (i, name) in names.iter().enumerate() {
            let (chrom_id, _) = btree.lookup::<LittleEndian, _>(&mut file, file_size, name).unwrap();
            assert_eq!(chrom_id, i as u32, "lookup of `{}` returned the wrong identifier", name);
        }
        // absent keys that fall between existing separators
        for name in ["b", "c00", "c39x", "d"] {
            assert!(btree.lookup::<LittleEndian, _>(&mut file, file_size, name).is_err());
        }
    }

    #[test]
    fn test_btree_chrom_list() {

        let mut file = Cursor::new(Vec::new());

        let mut btree = BTree::default();
        btree.block_size = 3;
        btree.add("chr2" , 200);
        btree.add("chr10", 100);
        btree.add("chr1" , 300);
        btree.write::<LittleEndian, _>(&mut file).unwrap();

        let file_size = file.get_ref().len() as u64;
        let mut btree = BTree::open::<LittleEndian, _>(&mut file, 0).unwrap();

        let list = btree.chrom_list::<LittleEndian, _>(&mut file, file_size).unwrap();

        assert_eq!(list, vec![
            (String::from("chr1") , 0, 300),
            (String::from("chr10"), 1, 100),
            (String::from("chr2") , 2, 200),
        ]);
    }

    #[test]
    fn test_bbox_overlaps() {

        let bbox = RTreeBbox { start_chrom_ix: 1, start_base: 100, end_chrom_ix: 1, end_base: 200 };

        assert!( bbox.overlaps(1, 150, 160));
        assert!( bbox.overlaps(1,  50, 101));
        assert!( bbox.overlaps(1, 199, 300));
        assert!(!bbox.overlaps(1, 201, 300));
        assert!(!bbox.overlaps(1,  50, 100));
        assert!(!bbox.overlaps(0, 150, 160));
        assert!(!bbox.overlaps(2, 150, 160));

        let spanning = RTreeBbox { start_chrom_ix: 0, start_base: 500, end_chrom_ix: 2, end_base: 10 };

        assert!( spanning.overlaps(1, 0, 1));
        assert!( spanning.overlaps(0, 600, 700));
        assert!(!spanning.overlaps(0, 100, 500));
    }

    #[test]
    fn test_rtree_roundtrip() {

        let mut file = Cursor::new(Vec::new());

        let mut rtree = RTree::default();
        rtree.block_size     = 4;
        rtree.items_per_slot = 16;

        // one leaf item per block of sixteen positions on chromosome zero
        for i in 0..64u32 {
            rtree.add_leaf(RTreeBbox::new(0, i * 16, (i + 1) * 16), 10_000 + i as u64 * 100, 100);
        }
        rtree.write::<LittleEndian, _>(&mut file).unwrap();

        let file_size = file.get_ref().len() as u64;
        let rtree = RTree::open::<LittleEndian, _>(&mut file, 0).unwrap();

        assert_eq!(rtree.item_count, 64);
        assert_eq!(rtree.bbox, RTreeBbox { start_chrom_ix: 0, start_base: 0, end_chrom_ix: 0, end_base: 1024 });

        // a point query touches a single block
        let blocks = rtree.search::<LittleEndian, _>(&mut file, file_size, 0, 100, 101).unwrap();
        assert_eq!(blocks, vec![(10_000 + 6 * 100, 100)]);

        // a range query touches the covering consecutive blocks
        let blocks = rtree.search::<LittleEndian, _>(&mut file, file_size, 0, 100, 200).unwrap();
        assert_eq!(blocks.len(), 7);

        // queries outside the indexed region return nothing
        let blocks = rtree.search::<LittleEndian, _>(&mut file, file_size, 1, 0, 100).unwrap();
        assert!(blocks.is_empty());

        let blocks = rtree.search::<LittleEndian, _>(&mut file, file_size, 0, 2000, 3000).unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_rtree_empty() {

        let mut file = Cursor::new(Vec::new());

        let mut rtree = RTree::default();
        rtree.block_size     = 4;
        rtree.items_per_slot = 16;
        rtree.write::<LittleEndian, _>(&mut file).unwrap();

        let file_size = file.get_ref().len() as u64;
        let rtree = RTree::open::<LittleEndian, _>(&mut file, 0).unwrap();

        assert_eq!(rtree.item_count, 0);
        assert!(rtree.search::<LittleEndian, _>(&mut file, file_size, 0, 0, 1000).unwrap().is_empty());
    }
}
