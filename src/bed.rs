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

use std::fmt;

use byteorder::ByteOrder;

use crate::error::BigBedError;

/* -------------------------------------------------------------------------- */

/// RGB color of a bed feature. A single gray value `v` is equivalent to
/// `v,v,v`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemRgb {
    pub red  : u8,
    pub green: u8,
    pub blue : u8,
}

/* -------------------------------------------------------------------------- */

impl ItemRgb {

    pub fn parse(s: &str) -> Result<ItemRgb, BigBedError> {
        let components: Vec<&str> = s.split(',').collect();
        match components.len() {
            1 => {
                let v = parse_color(components[0])?;
                Ok(ItemRgb { red: v, green: v, blue: v })
            }
            3 => {
                Ok(ItemRgb {
                    red  : parse_color(components[0])?,
                    green: parse_color(components[1])?,
                    blue : parse_color(components[2])?,
                })
            }
            _ => Err(BigBedError::MalformedRecord(format!("invalid itemRgb field `{}`", s))),
        }
    }
}

/* -------------------------------------------------------------------------- */

impl fmt::Display for ItemRgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.red, self.green, self.blue)
    }
}

/* -------------------------------------------------------------------------- */

fn parse_color(s: &str) -> Result<u8, BigBedError> {
    s.trim().parse::<u8>().map_err(|_| {
        BigBedError::MalformedRecord(format!("invalid color component `{}`", s))
    })
}

fn parse_int(s: &str) -> Result<i64, BigBedError> {
    s.trim().parse::<i64>().map_err(|_| {
        BigBedError::MalformedRecord(format!("invalid integer field `{}`", s))
    })
}

// Comma separated integer list; a single trailing comma is permitted
fn parse_int_list(s: &str) -> Result<Vec<i64>, BigBedError> {
    let s = s.strip_suffix(',').unwrap_or(s);
    s.split(',').map(parse_int).collect()
}

fn format_int_list(v: &[i64]) -> String {
    v.iter().map(|x| x.to_string()).collect::<Vec<String>>().join(",")
}

/* -------------------------------------------------------------------------- */

/// Optional bed columns following the strand field. Fields are positional:
/// a present field implies that all earlier fields are present, missing
/// intermediate values are filled with defaults when formatting.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BedAnnotation {
    pub name        : Option<String>,
    pub score       : Option<i64>,
    pub thick_start : Option<i64>,
    pub thick_end   : Option<i64>,
    pub item_rgb    : Option<ItemRgb>,
    pub block_count : Option<i64>,
    pub block_sizes : Option<Vec<i64>>,
    pub block_starts: Option<Vec<i64>>,
}

/* -------------------------------------------------------------------------- */

impl BedAnnotation {

    /// Number of optional columns required to represent this annotation,
    /// including the strand column that sits between score and thickStart.
    pub fn depth(&self, strand: Option<char>) -> usize {
        if self.block_starts.is_some() {
            9
        } else if self.block_sizes.is_some() {
            8
        } else if self.block_count.is_some() {
            7
        } else if self.item_rgb.is_some() {
            6
        } else if self.thick_end.is_some() {
            5
        } else if self.thick_start.is_some() {
            4
        } else if strand.is_some() {
            3
        } else if self.score.is_some() {
            2
        } else if self.name.is_some() {
            1
        } else {
            0
        }
    }

    /// Decodes the tab separated tail of an on-disk record. Returns the
    /// strand column separately since it is not part of the annotation.
    pub fn parse(tail: &str) -> Result<(Option<char>, BedAnnotation), BigBedError> {
        let mut strand     = None;
        let mut annotation = BedAnnotation::default();

        if tail.is_empty() {
            return Ok((strand, annotation));
        }
        for (i, field) in tail.split('\t').enumerate() {
            match i {
                0 => annotation.name = Some(field.to_string()),
                1 => annotation.score = Some(parse_int(field)?),
                2 => {
                    let mut chars = field.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) if matches!(c, '+' | '-' | '.' | '?') => strand = Some(c),
                        _ => return Err(BigBedError::MalformedRecord(format!("invalid strand field `{}`", field))),
                    }
                }
                3 => annotation.thick_start  = Some(parse_int(field)?),
                4 => annotation.thick_end    = Some(parse_int(field)?),
                5 => annotation.item_rgb     = Some(ItemRgb::parse(field)?),
                6 => annotation.block_count  = Some(parse_int(field)?),
                7 => annotation.block_sizes  = Some(parse_int_list(field)?),
                8 => annotation.block_starts = Some(parse_int_list(field)?),
                _ => return Err(BigBedError::MalformedRecord(format!("unexpected trailing field `{}`", field))),
            }
        }
        Ok((strand, annotation))
    }

    /// Encodes the annotation as the tab separated record tail. The feature
    /// coordinates provide defaults for absent thickStart/thickEnd columns.
    pub fn format(&self, strand: Option<char>, start: u32, end: u32) -> String {
        let depth = self.depth(strand);
        let mut columns: Vec<String> = Vec::with_capacity(depth);

        if depth >= 1 {
            columns.push(self.name.clone().unwrap_or_default());
        }
        if depth >= 2 {
            columns.push(self.score.unwrap_or(0).to_string());
        }
        if depth >= 3 {
            columns.push(strand.unwrap_or('.').to_string());
        }
        if depth >= 4 {
            columns.push(self.thick_start.unwrap_or(start as i64).to_string());
        }
        if depth >= 5 {
            columns.push(self.thick_end.unwrap_or(end as i64).to_string());
        }
        if depth >= 6 {
            columns.push(self.item_rgb.map(|x| x.to_string()).unwrap_or_else(|| String::from("0")));
        }
        if depth >= 7 {
            columns.push(self.block_count.unwrap_or(0).to_string());
        }
        if depth >= 8 {
            columns.push(self.block_sizes.as_deref().map(format_int_list).unwrap_or_else(|| String::from("0")));
        }
        if depth >= 9 {
            columns.push(self.block_starts.as_deref().map(format_int_list).unwrap_or_else(|| String::from("0")));
        }
        columns.join("\t")
    }
}

/* -------------------------------------------------------------------------- */

/// A single bed feature with 1-based inclusive coordinates, as presented to
/// library users. On disk features are stored 0-based half-open.
#[derive(Clone, Debug, PartialEq)]
pub struct BedRecord {
    pub seqname   : String,
    pub from      : usize,
    pub to        : usize,
    pub strand    : Option<char>,
    pub annotation: BedAnnotation,
}

/* -------------------------------------------------------------------------- */

impl BedRecord {

    pub fn new(seqname: &str, from: usize, to: usize) -> Self {
        BedRecord {
            seqname   : seqname.to_string(),
            from      : from,
            to        : to,
            strand    : None,
            annotation: BedAnnotation::default(),
        }
    }

    pub fn with_strand(mut self, strand: char) -> Self {
        self.strand = Some(strand);
        self
    }

    pub fn with_annotation(mut self, annotation: BedAnnotation) -> Self {
        self.annotation = annotation;
        self
    }

    /// Formats the record as a plain-text bed line with 0-based half-open
    /// coordinates.
    pub fn format_bed(&self) -> String {
        let start = (self.from - 1) as u32;
        let end   = self.to as u32;
        let mut line = format!("{}\t{}\t{}", self.seqname, start, end);
        let tail = self.annotation.format(self.strand, start, end);
        if !tail.is_empty() {
            line.push('\t');
            line.push_str(&tail);
        }
        line
    }
}

/* -------------------------------------------------------------------------- */

impl fmt::Display for BedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BedRecord(seqname={}, range=[{}, {}], strand={})",
            self.seqname,
            self.from,
            self.to,
            self.strand.unwrap_or('*'))
    }
}

/* -------------------------------------------------------------------------- */

/// A feature as stored inside a data block, before the chromosome identifier
/// has been translated back into a sequence name. Coordinates are 0-based
/// half-open.
#[derive(Clone, Debug, PartialEq)]
pub struct BbiBedRecord {
    pub chrom_id  : u32,
    pub from      : u32,
    pub to        : u32,
    pub strand    : Option<char>,
    pub annotation: BedAnnotation,
}

/* -------------------------------------------------------------------------- */

/// Incremental lexer over the uncompressed payload of a single data block.
/// Each call to `next_entry` consumes exactly one NUL-terminated record.
pub struct BedBlockParser<'a> {
    buffer  : &'a [u8],
    position: usize,
}

/* -------------------------------------------------------------------------- */

impl<'a> BedBlockParser<'a> {

    pub fn new(buffer: &'a [u8]) -> Self {
        BedBlockParser { buffer, position: 0 }
    }

    pub fn next_entry<E: ByteOrder>(&mut self) -> Result<Option<BbiBedRecord>, BigBedError> {
        if self.position >= self.buffer.len() {
            return Ok(None);
        }
        if self.position + 12 > self.buffer.len() {
            return Err(BigBedError::MalformedRecord(String::from("truncated record header")));
        }
        let chrom_id = E::read_u32(&self.buffer[self.position    ..self.position +  4]);
        let from     = E::read_u32(&self.buffer[self.position + 4..self.position +  8]);
        let to       = E::read_u32(&self.buffer[self.position + 8..self.position + 12]);

        let tail_start = self.position + 12;
        let tail_end = match self.buffer[tail_start..].iter().position(|&b| b == 0) {
            Some(offset) => tail_start + offset,
            None => return Err(BigBedError::MalformedRecord(String::from("missing record terminator"))),
        };
        let tail = std::str::from_utf8(&self.buffer[tail_start..tail_end]).map_err(|_| {
            BigBedError::MalformedRecord(String::from("record fields are not valid ascii"))
        })?;
        let (strand, annotation) = BedAnnotation::parse(tail)?;

        self.position = tail_end + 1;

        Ok(Some(BbiBedRecord { chrom_id, from, to, strand, annotation }))
    }
}

/* -------------------------------------------------------------------------- */
/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {

    use byteorder::{LittleEndian, WriteBytesExt};

    use crate::bed::{BedAnnotation, BedBlockParser, ItemRgb};

    #[test]
    fn test_annotation_roundtrip() {

        let annotation = BedAnnotation {
            name        : Some(String::from("feature1")),
            score       : Some(960),
            thick_start : Some(12),
            thick_end   : Some(18),
            item_rgb    : Some(ItemRgb { red: 255, green: 128, blue: 0 }),
            block_count : Some(2),
            block_sizes : Some(vec![10, 20]),
            block_starts: Some(vec![0, 30]),
        };
        let tail = annotation.format(Some('-'), 9, 20);

        assert_eq!(tail, "feature1\t960\t-\t12\t18\t255,128,0\t2\t10,20\t0,30");

        let (strand, parsed) = BedAnnotation::parse(&tail).unwrap();

        assert_eq!(strand, Some('-'));
        assert_eq!(parsed, annotation);
    }

    #[test]
    fn test_annotation_defaults() {

        let mut annotation = BedAnnotation::default();
        annotation.thick_start = Some(5);

        // Missing name, score, and strand are filled with defaults
        assert_eq!(annotation.format(None, 5, 10), "\t0\t.\t5");
        assert_eq!(annotation.depth(None), 4);
    }

    #[test]
    fn test_item_rgb_gray() {

        let rgb = ItemRgb::parse("128").unwrap();

        assert_eq!(rgb, ItemRgb { red: 128, green: 128, blue: 128 });
        assert_eq!(rgb.to_string(), "128,128,128");

        assert_eq!(ItemRgb::parse("255, 128, 0").unwrap(), ItemRgb { red: 255, green: 128, blue: 0 });
        assert!(ItemRgb::parse("1,2").is_err());
        assert!(ItemRgb::parse("300").is_err());
    }

    #[test]
    fn test_trailing_comma_lists() {

        let (_, annotation) = BedAnnotation::parse("x\t0\t+\t1\t2\t0\t2\t10,20,\t0,30").unwrap();

        assert_eq!(annotation.block_sizes , Some(vec![10, 20]));
        assert_eq!(annotation.block_starts, Some(vec![0, 30]));

        assert!(BedAnnotation::parse("x\t0\t+\t1\t2\t0\t2\t10,,20\t0,30").is_err());
    }

    #[test]
    fn test_invalid_strand() {
        assert!(BedAnnotation::parse("x\t0\tz").is_err());
        assert!(BedAnnotation::parse("x\t0\t++").is_err());
    }

    #[test]
    fn test_block_parser() {

        let mut buffer = Vec::new();

        buffer.write_u32::<LittleEndian>(3).unwrap();
        buffer.write_u32::<LittleEndian>(9).unwrap();
        buffer.write_u32::<LittleEndian>(20).unwrap();
        buffer.extend_from_slice(b"feature1\t100\t+");
        buffer.push(0);
        buffer.write_u32::<LittleEndian>(3).unwrap();
        buffer.write_u32::<LittleEndian>(25).unwrap();
        buffer.write_u32::<LittleEndian>(30).unwrap();
        buffer.push(0);

        let mut parser = BedBlockParser::new(&buffer);

        let r1 = parser.next_entry::<LittleEndian>().unwrap().unwrap();
        assert_eq!(r1.chrom_id, 3);
        assert_eq!(r1.from, 9);
        assert_eq!(r1.to, 20);
        assert_eq!(r1.strand, Some('+'));
        assert_eq!(r1.annotation.name.as_deref(), Some("feature1"));
        assert_eq!(r1.annotation.score, Some(100));

        let r2 = parser.next_entry::<LittleEndian>().unwrap().unwrap();
        assert_eq!(r2.from, 25);
        assert_eq!(r2.strand, None);
        assert_eq!(r2.annotation, Default::default());

        assert!(parser.next_entry::<LittleEndian>().unwrap().is_none());
    }

    #[test]
    fn test_block_parser_truncated() {

        let mut buffer = Vec::new();

        buffer.write_u32::<LittleEndian>(0).unwrap();
        buffer.write_u32::<LittleEndian>(5).unwrap();
        buffer.write_u32::<LittleEndian>(10).unwrap();
        buffer.extend_from_slice(b"name-without-terminator");

        let mut parser = BedBlockParser::new(&buffer);

        assert!(parser.next_entry::<LittleEndian>().is_err());
    }
}
