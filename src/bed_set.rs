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

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};

use flate2::read::GzDecoder;

use crate::bed::{BedRecord, ItemRgb};
use crate::error::BigBedError;

/* -------------------------------------------------------------------------- */

/// An in-memory collection of bed features grouped by sequence name. The
/// map keeps sequences in ascending byte order, which is the traversal
/// order the BigBed writer requires.
#[derive(Clone, Debug, Default)]
pub struct BedRecordSet {
    records: BTreeMap<String, Vec<BedRecord>>,
}

/* -------------------------------------------------------------------------- */

impl BedRecordSet {

    pub fn new() -> Self {
        BedRecordSet { records: BTreeMap::new() }
    }

    pub fn insert(&mut self, record: BedRecord) {
        self.records.entry(record.seqname.clone()).or_default().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn seqnames(&self) -> Vec<&str> {
        self.records.keys().map(|s| s.as_str()).collect()
    }

    pub fn records(&self, seqname: &str) -> Option<&[BedRecord]> {
        self.records.get(seqname).map(|v| v.as_slice())
    }

    /// Largest 1-based inclusive end position on the given sequence, which
    /// doubles as the default chromosome size.
    pub fn max_end(&self, seqname: &str) -> Option<usize> {
        self.records.get(seqname).and_then(|v| v.iter().map(|r| r.to).max())
    }

    /// Sorts every sequence by start and end position.
    pub fn sort(&mut self) {
        for records in self.records.values_mut() {
            records.sort_by(|a, b| (a.from, a.to).cmp(&(b.from, b.to)));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<BedRecord>)> {
        self.records.iter()
    }

    /* Plain-text bed import
     * ---------------------------------------------------------------------- */

    pub fn read_bed(&mut self, reader: &mut dyn BufRead, columns: usize) -> Result<(), BigBedError> {
        if !matches!(columns, 3 | 6 | 9 | 12) {
            return Err(BigBedError::MalformedRecord(format!("unsupported number of bed columns: {}", columns)));
        }
        let mut line = String::new();
        while reader.read_line(&mut line)? > 0 {
            if !line.trim().is_empty() {
                self.insert(parse_bed_line(line.trim_end(), columns)?);
            }
            line.clear();
        }
        self.sort();
        Ok(())
    }

    pub fn import_bed(&mut self, filename: &str, columns: usize, compress: bool) -> Result<(), BigBedError> {
        let file = File::open(filename)?;
        let mut reader: Box<dyn BufRead> = if compress {
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        self.read_bed(&mut reader, columns)
    }

    /// Imports a bed file after detecting the number of columns from its
    /// first non-empty line.
    pub fn import_bed_auto(&mut self, filename: &str, compress: bool) -> Result<(), BigBedError> {
        let columns = detect_bed_columns(filename, compress)?;
        self.import_bed(filename, columns, compress)
    }
}

/* -------------------------------------------------------------------------- */

pub fn detect_bed_columns(filename: &str, compress: bool) -> Result<usize, BigBedError> {
    let file = File::open(filename)?;
    let mut reader: Box<dyn BufRead> = if compress {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut line = String::new();
    while reader.read_line(&mut line)? > 0 {
        if !line.trim().is_empty() {
            let n = line.trim_end().split('\t').count();
            for supported in [12, 9, 6, 3] {
                if n >= supported {
                    return Ok(supported);
                }
            }
            return Err(BigBedError::MalformedRecord(String::from("bed file must have at least 3 columns")));
        }
        line.clear();
    }
    Err(BigBedError::MalformedRecord(String::from("bed file is empty")))
}

/* -------------------------------------------------------------------------- */

fn parse_bed_int(field: &str) -> Result<i64, BigBedError> {
    field.trim().parse::<i64>().map_err(|_| {
        BigBedError::MalformedRecord(format!("invalid integer field `{}`", field))
    })
}

fn parse_bed_int_list(field: &str) -> Result<Vec<i64>, BigBedError> {
    let field = field.strip_suffix(',').unwrap_or(field);
    field.split(',').map(parse_bed_int).collect()
}

fn parse_bed_line(line: &str, columns: usize) -> Result<BedRecord, BigBedError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < columns {
        return Err(BigBedError::MalformedRecord(format!("bed file must have at least {} columns", columns)));
    }
    // Text bed coordinates are 0-based half-open
    let start = parse_bed_int(fields[1])?;
    let end   = parse_bed_int(fields[2])?;
    if start < 0 || end < start {
        return Err(BigBedError::MalformedRecord(format!("invalid bed interval [{}, {})", start, end)));
    }
    let mut record = BedRecord::new(fields[0], start as usize + 1, end as usize);

    if columns >= 6 {
        record.annotation.name  = Some(fields[3].to_string());
        record.annotation.score = Some(parse_bed_int(fields[4])?);
        record.strand           = fields[5].chars().next();
    }
    if columns >= 9 {
        record.annotation.thick_start = Some(parse_bed_int(fields[6])?);
        record.annotation.thick_end   = Some(parse_bed_int(fields[7])?);
        record.annotation.item_rgb    = Some(ItemRgb::parse(fields[8])?);
    }
    if columns >= 12 {
        record.annotation.block_count  = Some(parse_bed_int(fields[9])?);
        record.annotation.block_sizes  = Some(parse_bed_int_list(fields[10])?);
        record.annotation.block_starts = Some(parse_bed_int_list(fields[11])?);
    }
    Ok(record)
}

/* -------------------------------------------------------------------------- */

impl FromIterator<BedRecord> for BedRecordSet {
    fn from_iter<I: IntoIterator<Item = BedRecord>>(iter: I) -> Self {
        let mut set = BedRecordSet::new();
        for record in iter {
            set.insert(record);
        }
        set.sort();
        set
    }
}

/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {

    use crate::bed::BedAnnotation;
    use crate::bed_set::BedRecordSet;

    #[test]
    fn test_read_bed6() {

        let input = "chr1\t9\t20\tfeature1\t100\t+\nchr1\t4\t15\tfeature2\t200\t-\nchr2\t0\t10\tfeature3\t0\t.\n";

        let mut set = BedRecordSet::new();
        set.read_bed(&mut input.as_bytes(), 6).unwrap();

        assert_eq!(set.len(), 3);
        assert_eq!(set.seqnames(), vec!["chr1", "chr2"]);

        // Records are sorted by start position
        let records = set.records("chr1").unwrap();
        assert_eq!(records[0].from, 5);
        assert_eq!(records[0].to, 15);
        assert_eq!(records[0].annotation.name.as_deref(), Some("feature2"));
        assert_eq!(records[1].from, 10);
        assert_eq!(records[1].strand, Some('+'));

        assert_eq!(set.max_end("chr1"), Some(20));
        assert_eq!(set.max_end("chr3"), None);
    }

    #[test]
    fn test_read_bed12() {

        let input = "chr1\t0\t100\tx\t0\t+\t10\t90\t255,0,0\t2\t10,20\t0,80\n";

        let mut set = BedRecordSet::new();
        set.read_bed(&mut input.as_bytes(), 12).unwrap();

        let record = &set.records("chr1").unwrap()[0];
        let expected = BedAnnotation {
            name        : Some(String::from("x")),
            score       : Some(0),
            thick_start : Some(10),
            thick_end   : Some(90),
            item_rgb    : Some(crate::bed::ItemRgb { red: 255, green: 0, blue: 0 }),
            block_count : Some(2),
            block_sizes : Some(vec![10, 20]),
            block_starts: Some(vec![0, 80]),
        };
        assert_eq!(record.annotation, expected);
    }

    #[test]
    fn test_read_bed_invalid() {

        let mut set = BedRecordSet::new();

        assert!(set.read_bed(&mut "chr1\t10\t5\n".as_bytes(), 3).is_err());
        assert!(set.read_bed(&mut "chr1\t0\n".as_bytes(), 3).is_err());
    }
}
