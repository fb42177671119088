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

/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {

    use std::io::Cursor;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use rustybed::bed::{BedAnnotation, BedRecord, ItemRgb};
    use rustybed::bed_set::BedRecordSet;
    use rustybed::bigbed::{bigbed_write, BigBedReader, OptionBigBed};
    use rustybed::error::BigBedError;
    use rustybed::genome::Genome;

    fn write_to_vec(records: &BedRecordSet, chrom_sizes: Option<&Genome>, parameters: Vec<OptionBigBed>) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        bigbed_write(&mut cursor, records, chrom_sizes, parameters).unwrap();
        cursor.into_inner()
    }

    fn query_all(reader: &mut BigBedReader<Cursor<Vec<u8>>>, seqname: &str, from: usize, to: usize) -> Vec<BedRecord> {
        reader.query(seqname, from, to).collect::<Result<Vec<_>, _>>().unwrap()
    }

    #[test]
    fn bigbed_test_chromosome_order() {

        // lexicographic order differs from numeric order
        let records: BedRecordSet = vec![
            BedRecord::new("chr1" , 10, 20),
            BedRecord::new("chr10", 30, 40),
            BedRecord::new("chr2" , 50, 60),
        ].into_iter().collect();

        let data = write_to_vec(&records, None, vec![]);
        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        assert_eq!(reader.resolve("chr1") .unwrap(), (0, 20));
        assert_eq!(reader.resolve("chr10").unwrap(), (1, 40));
        assert_eq!(reader.resolve("chr2") .unwrap(), (2, 60));

        // lookups are repeatable and do not interfere with each other
        assert_eq!(reader.resolve("chr10").unwrap(), (1, 40));
        assert!(matches!(reader.resolve("chr3"), Err(BigBedError::SeqnameNotFound(_))));
        assert_eq!(reader.resolve("chr10").unwrap(), (1, 40));

        let genome = reader.genome().unwrap().clone();

        assert_eq!(genome.seqnames, vec!["chr1", "chr10", "chr2"]);
        assert_eq!(genome.lengths , vec![20, 40, 60]);

        for (seqname, from, to) in [("chr1", 10, 20), ("chr10", 30, 40), ("chr2", 50, 60)] {
            let result = query_all(&mut reader, seqname, 1, 100);
            assert_eq!(result.len(), 1);
            assert_eq!(result[0].from, from);
            assert_eq!(result[0].to, to);
        }
    }

    #[test]
    fn bigbed_test_annotation_roundtrip() {

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
        let records: BedRecordSet = vec![
            BedRecord::new("chr1", 10, 50).with_strand('-').with_annotation(annotation.clone()),
        ].into_iter().collect();

        let data = write_to_vec(&records, None, vec![]);
        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        assert_eq!(reader.header().field_count, 12);

        let result = query_all(&mut reader, "chr1", 1, 100);

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].from, 10);
        assert_eq!(result[0].to, 50);
        assert_eq!(result[0].strand, Some('-'));
        assert_eq!(result[0].annotation, annotation);
    }

    #[test]
    fn bigbed_test_point_query() {

        // ten thousand non-overlapping intervals on a single chromosome
        let records: BedRecordSet = (0..10_000usize)
            .map(|i| BedRecord::new("chr1", i * 10 + 1, i * 10 + 10))
            .collect();

        let parameters = vec![
            OptionBigBed::BlockSize(256),
            OptionBigBed::ItemsPerSlot(512),
        ];
        let data = write_to_vec(&records, None, parameters);
        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        assert_eq!(reader.header().n_entries, 10_000);

        let result = query_all(&mut reader, "chr1", 50_001, 50_010);

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].from, 50_001);
        assert_eq!(result[0].to, 50_010);

        // the index prunes all but a bounded number of candidate blocks
        let blocks = reader.overlapping_blocks("chr1", 50_001, 50_010).unwrap();
        assert!(!blocks.is_empty());
        assert!(blocks.len() <= (10_000 + 511) / 512);
    }

    #[test]
    fn bigbed_test_full_sequence_roundtrip() {

        let mut records = BedRecordSet::new();
        for i in 0..1000usize {
            records.insert(BedRecord::new("chr1", i * 7 + 1, i * 7 + 13));
            records.insert(BedRecord::new("chr2", i * 3 + 5, i * 3 + 6));
        }
        records.sort();

        let data = write_to_vec(&records, None, vec![OptionBigBed::ItemsPerSlot(64)]);
        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        for seqname in ["chr1", "chr2"] {
            let (_, chrom_size) = reader.resolve(seqname).unwrap();

            let mut result = query_all(&mut reader, seqname, 1, chrom_size as usize);
            result.sort_by(|a, b| (a.from, a.to).cmp(&(b.from, b.to)));

            let expected = records.records(seqname).unwrap();

            assert_eq!(result.len(), expected.len());
            for (a, b) in result.iter().zip(expected.iter()) {
                assert_eq!((a.from, a.to), (b.from, b.to));
            }
        }
    }

    #[test]
    fn bigbed_test_random_queries() {

        let mut rng = StdRng::seed_from_u64(42);

        let mut records = BedRecordSet::new();
        for _ in 0..2000 {
            let seqname = if rng.gen_bool(0.7) { "chr1" } else { "chr2" };
            let from    = rng.gen_range(1..100_000usize);
            let length  = rng.gen_range(1..50usize);
            records.insert(BedRecord::new(seqname, from, from + length - 1));
        }
        records.sort();

        let data = write_to_vec(&records, None, vec![OptionBigBed::ItemsPerSlot(128), OptionBigBed::BlockSize(16)]);
        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        for _ in 0..50 {
            let seqname = if rng.gen_bool(0.5) { "chr1" } else { "chr2" };
            let from    = rng.gen_range(1..100_000usize);
            let to      = from + rng.gen_range(0..2000usize);

            let mut result = query_all(&mut reader, seqname, from, to);
            result.sort_by(|a, b| (a.from, a.to).cmp(&(b.from, b.to)));

            let expected: Vec<&BedRecord> = records.records(seqname).unwrap().iter()
                .filter(|r| r.from <= to && r.to >= from)
                .collect();

            assert_eq!(result.len(), expected.len());
            for (a, b) in result.iter().zip(expected.iter()) {
                assert_eq!((a.from, a.to), (b.from, b.to));
            }
        }
    }

    #[test]
    fn bigbed_test_empty_sequences() {

        // chr2 is listed in the genome but carries no features
        let records: BedRecordSet = vec![
            BedRecord::new("chr1", 10, 20),
        ].into_iter().collect();

        let genome = Genome::new(
            vec![String::from("chr1"), String::from("chr2")],
            vec![1000, 2000],
        );
        let data = write_to_vec(&records, Some(&genome), vec![]);
        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        assert_eq!(reader.resolve("chr2").unwrap(), (1, 2000));
        assert!(query_all(&mut reader, "chr2", 1, 2000).is_empty());

        let result = query_all(&mut reader, "chr1", 1, 1000);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn bigbed_test_empty_input() {

        let records = BedRecordSet::new();

        let data = write_to_vec(&records, None, vec![]);
        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        assert_eq!(reader.header().n_entries, 0);
        assert!(reader.genome().unwrap().is_empty());
        assert!(matches!(reader.resolve("chr1"), Err(BigBedError::SeqnameNotFound(_))));
    }

    #[test]
    fn bigbed_test_deterministic_output() {

        let records: BedRecordSet = (0..500usize)
            .map(|i| BedRecord::new("chr1", i * 5 + 1, i * 5 + 20).with_strand('+'))
            .collect();

        let data1 = write_to_vec(&records, None, vec![]);
        let data2 = write_to_vec(&records, None, vec![]);

        assert_eq!(data1, data2);
    }

    #[test]
    fn bigbed_test_invalid_magic() {

        let records: BedRecordSet = vec![
            BedRecord::new("chr1", 10, 20),
        ].into_iter().collect();

        let data = write_to_vec(&records, None, vec![]);

        // corrupt the file magic
        let mut corrupted = data.clone();
        corrupted[0..4].copy_from_slice(&[0, 0, 0, 0]);

        assert!(matches!(BigBedReader::new(Cursor::new(corrupted)), Err(BigBedError::InvalidMagic)));

        // corrupt the chromosome tree magic; the file opens but the first
        // name lookup fails
        let chrom_tree_offset = u64::from_le_bytes(data[8..16].try_into().unwrap()) as usize;

        let mut corrupted = data.clone();
        corrupted[chrom_tree_offset..chrom_tree_offset + 4].copy_from_slice(&[0, 0, 0, 0]);

        let mut reader = BigBedReader::new(Cursor::new(corrupted)).unwrap();

        assert!(matches!(reader.resolve("chr1"), Err(BigBedError::InvalidMagic)));

        // corrupt the interval tree magic; the name resolves but the query
        // fails
        let full_index_offset = u64::from_le_bytes(data[24..32].try_into().unwrap()) as usize;

        let mut corrupted = data.clone();
        corrupted[full_index_offset..full_index_offset + 4].copy_from_slice(&[0, 0, 0, 0]);

        let mut reader = BigBedReader::new(Cursor::new(corrupted)).unwrap();

        assert!(reader.resolve("chr1").is_ok());

        let result: Result<Vec<BedRecord>, BigBedError> = reader.query("chr1", 1, 100).collect();
        assert!(matches!(result, Err(BigBedError::InvalidMagic)));
    }

    #[test]
    fn bigbed_test_unsupported_version() {

        let records: BedRecordSet = vec![
            BedRecord::new("chr1", 10, 20),
        ].into_iter().collect();

        let mut data = write_to_vec(&records, None, vec![]);
        data[4..6].copy_from_slice(&2u16.to_le_bytes());

        assert!(matches!(BigBedReader::new(Cursor::new(data)), Err(BigBedError::UnsupportedVersion(2))));
    }

    #[test]
    fn bigbed_test_many_chromosomes() {

        // enough chromosomes to force internal chromosome tree levels at
        // the chosen fan-out
        let mut records = BedRecordSet::new();
        for i in 0..300usize {
            records.insert(BedRecord::new(&format!("scaffold{}", i), 100, 200));
        }
        records.sort();

        let data = write_to_vec(&records, None, vec![OptionBigBed::BlockSize(16)]);
        let mut reader = BigBedReader::new(Cursor::new(data)).unwrap();

        for i in 0..300usize {
            let seqname = format!("scaffold{}", i);
            let (_, chrom_size) = reader.resolve(&seqname).unwrap();

            assert_eq!(chrom_size, 200);

            let result = query_all(&mut reader, &seqname, 1, 200);
            assert_eq!(result.len(), 1, "query on `{}` returned the wrong number of features", seqname);
        }
        assert!(matches!(reader.resolve("scaffold300"), Err(BigBedError::SeqnameNotFound(_))));
        assert!(matches!(reader.resolve("chr1"), Err(BigBedError::SeqnameNotFound(_))));
    }
}
