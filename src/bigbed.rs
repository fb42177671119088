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

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use async_stream::stream;
use futures::executor::{block_on_stream, BlockingStream};
use futures::pin_mut;
use futures::StreamExt;
use futures_core::stream::Stream;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use memmap2::Mmap;

use crate::bbi::{compress_slice, BbiFile, BbiHeader, BbiHeaderZoom, BbiSummary, RTreeBbox};
use crate::bbi::{BBI_MIN_VERSION, BIGBED_MAGIC};
use crate::bed::{BbiBedRecord, BedRecord};
use crate::bed_set::BedRecordSet;
use crate::error::BigBedError;
use crate::genome::Genome;
use crate::netfile::NetFile;

/* -------------------------------------------------------------------------- */

pub fn is_bigbed_file(filename: &str) -> Result<bool, BigBedError> {

    let mut file = NetFile::open(filename)?;

    let magic = file.read_u32::<LittleEndian>()?;

    Ok(BIGBED_MAGIC == magic)

}

/* -------------------------------------------------------------------------- */

pub enum OptionBigBed {
    BlockSize(usize),
    ItemsPerSlot(usize),
    Compressed(bool),
}

/* -------------------------------------------------------------------------- */

#[derive(Clone, Debug)]
pub struct BigBedParameters {
    pub block_size    : usize,
    pub items_per_slot: usize,
    pub compressed    : bool,
}

/* -------------------------------------------------------------------------- */

impl BigBedParameters {
    pub fn insert_option(&mut self, option: OptionBigBed) {
        match option {
            OptionBigBed::BlockSize(x)    => self.block_size     = x,
            OptionBigBed::ItemsPerSlot(x) => self.items_per_slot = x,
            OptionBigBed::Compressed(x)   => self.compressed     = x,
        }
    }
}

/* -------------------------------------------------------------------------- */

impl Default for BigBedParameters {
    fn default() -> Self {
        BigBedParameters {
            block_size    : 256,
            items_per_slot: 512,
            compressed    : true,
        }
    }
}

/* -------------------------------------------------------------------------- */

pub enum BigBedFile {}

/* -------------------------------------------------------------------------- */

impl BigBedFile {

    pub fn new_reader(filename: &str) -> Result<BigBedReader<NetFile>, BigBedError> {

        let file = NetFile::open(filename)?;

        BigBedReader::new(file)

    }

    /// Opens a local file through a read-only memory mapping instead of
    /// buffered reads.
    pub fn new_reader_mmap(filename: &str) -> Result<BigBedReader<Cursor<Mmap>>, BigBedError> {

        let file = File::open(filename)?;
        let map  = unsafe { Mmap::map(&file) }?;

        BigBedReader::new(Cursor::new(map))

    }

    pub fn new_writer(filename: &str, genome: Genome, parameters: Vec<OptionBigBed>) -> Result<BigBedWriter<File>, BigBedError> {

        let file = File::create(filename)?;

        BigBedWriter::new(file, genome, parameters)

    }

    /// Writes a complete BigBed file in one invocation. Chromosome sizes
    /// missing from `chrom_sizes` default to the largest end position
    /// observed on the respective sequence.
    pub fn write(filename: &str, records: &BedRecordSet, chrom_sizes: Option<&Genome>, parameters: Vec<OptionBigBed>) -> Result<(), BigBedError> {

        let file = File::create(filename)?;

        bigbed_write(file, records, chrom_sizes, parameters)

    }

}

/* -------------------------------------------------------------------------- */

/// Random-access reader over a BigBed file. The reader owns the underlying
/// stream together with all scratch buffers, so a single reader can only
/// drive one query at a time.
pub struct BigBedReader<R: Read + Seek> {
    reader: R,
    bwf   : BbiFile,
    genome: Option<Genome>,
}

/* -------------------------------------------------------------------------- */

impl<R: Read + Seek> BigBedReader<R> {

    pub fn new(mut reader: R) -> Result<Self, BigBedError> {

        let mut bwf = BbiFile::default();

        bwf.open::<LittleEndian, R>(&mut reader)?;

        Ok(BigBedReader {
            reader: reader,
            bwf   : bwf,
            genome: None,
        })
    }

    pub fn header(&self) -> &BbiHeader {
        &self.bwf.header
    }

    pub fn zoom_headers(&self) -> &[BbiHeaderZoom] {
        &self.bwf.header.zoom_headers
    }

    pub fn total_summary(&self) -> &BbiSummary {
        &self.bwf.header.summary
    }

    /// Resolves a sequence name to `(chrom_id, chrom_size)` by walking the
    /// on-disk chromosome tree.
    pub fn resolve(&mut self, seqname: &str) -> Result<(u32, u32), BigBedError> {
        self.bwf.lookup::<LittleEndian, R>(&mut self.reader, seqname)
    }

    /// The chromosomes stored in the file, enumerated from the chromosome
    /// tree on first use and cached afterwards.
    pub fn genome(&mut self) -> Result<&Genome, BigBedError> {
        if self.genome.is_none() {
            let list = self.bwf.chrom_list::<LittleEndian, R>(&mut self.reader)?;
            let n = list.len();
            let mut genome = Genome {
                seqnames: vec![String::new(); n],
                lengths : vec![0; n],
            };
            for (seqname, chrom_id, chrom_size) in list {
                if chrom_id as usize >= n {
                    return Err(BigBedError::CorruptIndex(String::from("invalid chromosome identifier")));
                }
                genome.seqnames[chrom_id as usize] = seqname;
                genome.lengths [chrom_id as usize] = chrom_size as usize;
            }
            self.genome = Some(genome);
        }
        match self.genome.as_ref() {
            Some(genome) => Ok(genome),
            None         => Err(BigBedError::CorruptIndex(String::from("chromosome list is unavailable"))),
        }
    }

    /// The autoSql schema stored in the file, if any, as an opaque string.
    pub fn autosql(&mut self) -> Result<Option<String>, BigBedError> {
        if self.bwf.header.auto_sql_offset == 0 {
            return Ok(None);
        }
        self.reader.seek(SeekFrom::Start(self.bwf.header.auto_sql_offset))?;
        let mut buffer = Vec::new();
        loop {
            let byte = self.reader.read_u8()?;
            if byte == 0 {
                break;
            }
            buffer.push(byte);
            if buffer.len() > 0x10000 {
                return Err(BigBedError::CorruptIndex(String::from("unterminated autoSql string")));
            }
        }
        String::from_utf8(buffer).map(Some).map_err(|_| {
            BigBedError::MalformedRecord(String::from("autoSql string is not valid utf-8"))
        })
    }

    /// The data blocks a query would have to visit; mainly useful for
    /// diagnostics.
    pub fn overlapping_blocks(&mut self, seqname: &str, from: usize, to: usize) -> Result<Vec<(u64, u64)>, BigBedError> {
        let (chrom_id, _) = self.resolve(seqname)?;
        let (from, to) = convert_query(from, to);
        self.bwf.overlapping_blocks::<LittleEndian, R>(&mut self.reader, chrom_id, from, to)
    }

    /// Lazily yields all features overlapping the query, given in 1-based
    /// inclusive coordinates. An unknown sequence name is reported as an
    /// error item. Features arrive in block traversal order; callers that
    /// need genomic order must sort downstream.
    pub fn query_stream<'a>(
        &'a mut self,
        seqname: &'a str,
        from   : usize,
        to     : usize,
    ) -> impl Stream<Item = Result<BedRecord, BigBedError>> + 'a {

        stream! {

            let chrom_id = match self.bwf.lookup::<LittleEndian, R>(&mut self.reader, seqname) {
                Ok ((chrom_id, _)) => chrom_id,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            let (from, to) = convert_query(from, to);

            let inner = self.bwf.query_stream::<LittleEndian, R>(&mut self.reader, chrom_id, from, to);

            pin_mut!(inner);

            while let Some(item) = inner.next().await {
                match item {
                    Ok (entry) => yield Ok(record_from_entry(seqname, entry)),
                    Err(err)   => yield Err(err),
                }
            }
        }
    }

    pub fn query<'a>(
        &'a mut self,
        seqname: &'a str,
        from   : usize,
        to     : usize,
    ) -> BlockingStream<impl Stream<Item = Result<BedRecord, BigBedError>> + 'a> {

        let s = Box::pin(self.query_stream(seqname, from, to));

        block_on_stream(s)
    }

    /// Queries every chromosome whose name matches the anchored regular
    /// expression.
    pub fn query_regex_stream<'a>(
        &'a mut self,
        seq_regex: &'a str,
        from     : usize,
        to       : usize,
    ) -> impl Stream<Item = Result<BedRecord, BigBedError>> + 'a {

        stream! {

            let re = match regex::Regex::new(&format!("^{}$", seq_regex)) {
                Ok (re)  => re,
                Err(err) => {
                    yield Err(BigBedError::Io(io::Error::new(io::ErrorKind::InvalidInput, err)));
                    return;
                }
            };
            let seqnames = match self.genome() {
                Ok (genome) => genome.seqnames.clone(),
                Err(err)    => {
                    yield Err(err);
                    return;
                }
            };
            for seqname in seqnames {
                if !re.is_match(&seqname) {
                    continue;
                }
                let inner = self.query_stream(&seqname, from, to);

                pin_mut!(inner);

                while let Some(item) = inner.next().await {
                    yield item;
                }
            }
        }
    }

    pub fn query_regex<'a>(
        &'a mut self,
        seq_regex: &'a str,
        from     : usize,
        to       : usize,
    ) -> BlockingStream<impl Stream<Item = Result<BedRecord, BigBedError>> + 'a> {

        let s = Box::pin(self.query_regex_stream(seq_regex, from, to));

        block_on_stream(s)
    }

    /// Queries a whole chromosome.
    pub fn query_sequence<'a>(
        &'a mut self,
        seqname: &'a str,
    ) -> Result<BlockingStream<impl Stream<Item = Result<BedRecord, BigBedError>> + 'a>, BigBedError> {

        let (_, chrom_size) = self.resolve(seqname)?;

        Ok(self.query(seqname, 1, chrom_size as usize))
    }

}

/* Some private utility functions
 * -------------------------------------------------------------------------- */

// External query coordinates are 1-based inclusive, on-disk coordinates
// 0-based half-open
fn convert_query(from: usize, to: usize) -> (u32, u32) {
    let from = from.max(1).min(u32::MAX as usize) as u32 - 1;
    let to   = to.min(u32::MAX as usize) as u32;
    (from, to)
}

fn record_from_entry(seqname: &str, entry: BbiBedRecord) -> BedRecord {
    BedRecord {
        seqname   : seqname.to_string(),
        from      : entry.from as usize + 1,
        to        : entry.to as usize,
        strand    : entry.strand,
        annotation: entry.annotation,
    }
}

/* -------------------------------------------------------------------------- */

/// Sequential BigBed writer. Construction reserves the header regions and
/// emits the chromosome tree; sequences are then written in ascending
/// chromosome order, followed by `write_index` and `close`, which patches
/// the file header.
pub struct BigBedWriter<W: Write + Seek> {
    writer         : W,
    bwf            : BbiFile,
    genome         : Genome,
    parameters     : BigBedParameters,
    last_chrom_id  : Option<u32>,
    n_entries      : u64,
    max_block_size : u32,
    max_field_depth: usize,
    block_buffer   : Vec<u8>,
}

/* -------------------------------------------------------------------------- */

impl<W: Write + Seek> BigBedWriter<W> {

    pub fn new(writer: W, genome: Genome, parameters_arg: Vec<OptionBigBed>) -> Result<Self, BigBedError> {

        let mut parameters = BigBedParameters::default();

        for parameter in parameters_arg {
            parameters.insert_option(parameter);
        }

        let mut bwf = BbiFile::default();
        bwf.header.magic          = BIGBED_MAGIC;
        bwf.header.version        = BBI_MIN_VERSION;
        bwf.chrom_tree.block_size = parameters.block_size as u32;
        bwf.index.block_size      = parameters.block_size as u32;
        bwf.index.items_per_slot  = parameters.items_per_slot as u32;

        let mut bbw = BigBedWriter {
            writer,
            bwf,
            genome         : genome.sorted(),
            parameters     : parameters,
            last_chrom_id  : None,
            n_entries      : 0,
            max_block_size : 0,
            max_field_depth: 0,
            block_buffer   : Vec::new(),
        };

        bbw.bwf.create::<LittleEndian, W>(&mut bbw.writer)?;

        for i in 0..bbw.genome.len() {
            bbw.bwf.chrom_tree.add(&bbw.genome.seqnames[i], bbw.genome.lengths[i] as u32);
        }
        bbw.bwf.write_chrom_tree::<LittleEndian, W>(&mut bbw.writer)?;

        // the data section starts with a feature count that is patched on
        // close
        bbw.bwf.header.full_data_offset = bbw.writer.seek(SeekFrom::Current(0))?;
        bbw.writer.write_u64::<LittleEndian>(0)?;

        Ok(bbw)
    }

    pub fn parameters(&self) -> &BigBedParameters {
        &self.parameters
    }

    pub fn genome(&self) -> &Genome {
        &self.genome
    }

    /// Writes all features of one sequence. Sequences must arrive in
    /// ascending chromosome order; features are packed into data blocks of
    /// up to `items_per_slot` records.
    pub fn write(&mut self, seqname: &str, records: &[BedRecord]) -> Result<(), BigBedError> {
        let chrom_id = self.genome.get_idx(seqname).ok_or_else(|| {
            BigBedError::SeqnameNotFound(seqname.to_string())
        })? as u32;

        if let Some(last) = self.last_chrom_id {
            if chrom_id <= last {
                return Err(BigBedError::Io(io::Error::new(io::ErrorKind::InvalidInput,
                    "sequences must be written in ascending chromosome order")));
            }
        }
        self.last_chrom_id = Some(chrom_id);

        let mut sorted: Vec<&BedRecord> = records.iter().collect();
        sorted.sort_by(|a, b| (a.from, a.to).cmp(&(b.from, b.to)));

        let items_per_slot = self.parameters.items_per_slot.max(1);

        for slot in sorted.chunks(items_per_slot) {
            self.write_data_block(chrom_id, slot)?;
        }
        Ok(())
    }

    fn write_data_block(&mut self, chrom_id: u32, records: &[&BedRecord]) -> Result<(), BigBedError> {
        if records.is_empty() {
            return Ok(());
        }
        self.block_buffer.clear();

        let mut min_start = u32::MAX;
        let mut max_end   = 0u32;

        for record in records {
            if record.from < 1 || record.to < record.from {
                return Err(BigBedError::Io(io::Error::new(io::ErrorKind::InvalidInput,
                    format!("invalid record interval [{}, {}]", record.from, record.to))));
            }
            let start = (record.from - 1).min(u32::MAX as usize) as u32;
            let end   =  record.to      .min(u32::MAX as usize) as u32;

            min_start = min_start.min(start);
            max_end   = max_end  .max(end);

            self.block_buffer.write_u32::<LittleEndian>(chrom_id)?;
            self.block_buffer.write_u32::<LittleEndian>(start)?;
            self.block_buffer.write_u32::<LittleEndian>(end)?;

            let tail = record.annotation.format(record.strand, start, end);
            self.block_buffer.extend_from_slice(tail.as_bytes());
            self.block_buffer.push(0);

            self.max_field_depth = self.max_field_depth.max(record.annotation.depth(record.strand));
        }
        if self.block_buffer.len() > self.max_block_size as usize {
            self.max_block_size = self.block_buffer.len() as u32;
        }
        let data_offset = self.writer.seek(SeekFrom::Current(0))?;
        let data_size   = if self.parameters.compressed {
            let compressed = compress_slice(&self.block_buffer)?;
            self.writer.write_all(&compressed)?;
            compressed.len() as u64
        } else {
            self.writer.write_all(&self.block_buffer)?;
            self.block_buffer.len() as u64
        };
        self.bwf.index.add_leaf(RTreeBbox::new(chrom_id, min_start, max_end), data_offset, data_size);
        self.n_entries += records.len() as u64;

        Ok(())
    }

    /// Builds the interval index over all data blocks written so far and
    /// appends it to the file.
    pub fn write_index(&mut self) -> Result<(), BigBedError> {
        self.bwf.write_index::<LittleEndian, W>(&mut self.writer)
    }

    /// Patches the file header with the final offsets and counts.
    pub fn close(&mut self) -> Result<(), BigBedError> {
        if self.bwf.header.full_index_offset == 0 {
            self.write_index()?;
        }
        self.bwf.header.zoom_levels           = 0;
        self.bwf.header.auto_sql_offset       = 0;
        self.bwf.header.field_count           = 3 + self.max_field_depth as u16;
        self.bwf.header.defined_field_count   = self.bwf.header.field_count;
        self.bwf.header.uncompressed_buf_size = if self.parameters.compressed { self.max_block_size } else { 0 };
        self.bwf.header.n_entries             = self.n_entries;

        self.bwf.header.write::<LittleEndian, W>(&mut self.writer)?;
        self.bwf.header.write_n_entries::<LittleEndian, W>(&mut self.writer)?;
        self.bwf.header.write_summary::<LittleEndian, W>(&mut self.writer)?;

        self.writer.seek(SeekFrom::End(0))?;
        self.writer.flush()?;

        Ok(())
    }
}

/* Utility functions
 * -------------------------------------------------------------------------- */

/// Writes a complete BigBed file from an ordered record collection. The
/// stream must be seekable. Chromosome sizes missing from `chrom_sizes`
/// default to the largest end position observed on the respective sequence;
/// sequences listed in `chrom_sizes` without records still appear in the
/// chromosome tree.
pub fn bigbed_write<W: Write + Seek>(writer: W, records: &BedRecordSet, chrom_sizes: Option<&Genome>, parameters: Vec<OptionBigBed>) -> Result<(), BigBedError> {

    let mut names: Vec<String> = records.seqnames().iter().map(|s| s.to_string()).collect();
    if let Some(sizes) = chrom_sizes {
        for name in &sizes.seqnames {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
    }
    names.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

    let mut genome = Genome::default();
    for name in names {
        let length = chrom_sizes
            .and_then(|sizes| sizes.seq_length(&name).ok())
            .or_else(|| records.max_end(&name))
            .unwrap_or(0);
        genome.lengths .push(length);
        genome.seqnames.push(name);
    }

    let mut writer = BigBedWriter::new(writer, genome, parameters)?;

    let seqnames = writer.genome.seqnames.clone();
    for seqname in seqnames {
        if let Some(list) = records.records(&seqname) {
            writer.write(&seqname, list)?;
        }
    }
    writer.write_index()?;
    writer.close()?;

    Ok(())
}

/* -------------------------------------------------------------------------- */

pub fn bigbed_read_genome<R: Read + Seek>(reader: R) -> Result<Genome, BigBedError> {
    let mut reader = BigBedReader::new(reader)?;
    Ok(reader.genome()?.clone())
}

pub fn bigbed_import_genome(filename: &str) -> Result<Genome, BigBedError> {
    let file = NetFile::open(filename)?;
    bigbed_read_genome(file)
        .map_err(|err| match err {
            BigBedError::Io(e) => BigBedError::Io(io::Error::new(io::ErrorKind::Other, format!("importing genome from `{}` failed: {}", filename, e))),
            other              => other,
        })
}

/* -------------------------------------------------------------------------- */
/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {

    use std::io::Cursor;

    use crate::bed::BedRecord;
    use crate::bed_set::BedRecordSet;
    use crate::bigbed::{bigbed_write, BigBedReader, OptionBigBed};
    use crate::error::BigBedError;

    fn write_to_vec(records: &BedRecordSet, parameters: Vec<OptionBigBed>) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        bigbed_write(&mut cursor, records, None, parameters).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_bigbed_1() {

        let records: BedRecordSet = vec![
            BedRecord::new("chr1", 10, 20).with_strand('+'),
        ].into_iter().collect();

        let data = write_to_vec(&records, vec![]);

        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        assert_eq!(reader.header().n_entries, 1);
        assert_eq!(reader.resolve("chr1").unwrap(), (0, 20));

        let result: Vec<BedRecord> = reader.query("chr1", 1, 100)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].from, 10);
        assert_eq!(result[0].to, 20);
        assert_eq!(result[0].strand, Some('+'));

        let result: Vec<BedRecord> = reader.query("chr1", 21, 100)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(result.is_empty());

        let result: Result<Vec<BedRecord>, BigBedError> = reader.query("chr2", 1, 100).collect();

        assert!(matches!(result, Err(BigBedError::SeqnameNotFound(_))));
    }

    #[test]
    fn test_bigbed_2() {

        let records: BedRecordSet = vec![
            BedRecord::new("chr1", 1, 10),
            BedRecord::new("chr1", 5, 15),
        ].into_iter().collect();

        let data = write_to_vec(&records, vec![]);

        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        let result: Vec<BedRecord> = reader.query("chr1", 6, 7)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(result.len(), 2);

        let result: Vec<BedRecord> = reader.query("chr1", 11, 15)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].from, 5);
        assert_eq!(result[0].to, 15);
    }

    #[test]
    fn test_bigbed_regex_query() {

        let records: BedRecordSet = vec![
            BedRecord::new("chr1" , 1, 10),
            BedRecord::new("chr2" , 1, 10),
            BedRecord::new("chrX" , 1, 10),
        ].into_iter().collect();

        let data = write_to_vec(&records, vec![]);

        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        let result: Vec<BedRecord> = reader.query_regex("chr[0-9]", 1, 100)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].seqname, "chr1");
        assert_eq!(result[1].seqname, "chr2");
    }

    #[test]
    fn test_bigbed_uncompressed() {

        let records: BedRecordSet = vec![
            BedRecord::new("chr1", 10, 20),
        ].into_iter().collect();

        let data = write_to_vec(&records, vec![OptionBigBed::Compressed(false)]);

        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        assert_eq!(reader.header().uncompressed_buf_size, 0);

        let result: Vec<BedRecord> = reader.query("chr1", 1, 100)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(result.len(), 1);
    }
}
