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

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

/* -------------------------------------------------------------------------- */

/// A set of chromosomes with their lengths in bases. The position of a
/// sequence in `seqnames` is its dense chromosome index.
#[derive(Clone, Debug, Default)]
pub struct Genome {
    pub seqnames: Vec<String>,
    pub lengths : Vec<usize>,
}

/* -------------------------------------------------------------------------- */

impl Genome {

    pub fn new(seqnames: Vec<String>, lengths: Vec<usize>) -> Self {
        if seqnames.len() != lengths.len() {
            panic!("Genome::new(): invalid parameters");
        }
        Genome { seqnames, lengths }
    }

    pub fn len(&self) -> usize {
        self.seqnames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqnames.is_empty()
    }

    pub fn get_idx(&self, seqname: &str) -> Option<usize> {
        self.seqnames.iter().position(|name| name == seqname)
    }

    pub fn seq_length(&self, seqname: &str) -> Result<usize, String> {
        self.get_idx(seqname)
            .map(|i| self.lengths[i])
            .ok_or_else(|| format!("sequence `{}` not found in genome", seqname))
    }

    pub fn add_sequence(&mut self, seqname: String, length: usize) -> Result<usize, String> {
        if self.get_idx(&seqname).is_some() {
            Err(format!("sequence `{}` already exists", seqname))
        } else {
            self.seqnames.push(seqname);
            self.lengths .push(length);
            Ok(self.len() - 1)
        }
    }

    /// Returns a copy with sequences in ascending byte order of their names,
    /// which is the order chromosome identifiers are assigned in.
    pub fn sorted(&self) -> Self {
        let mut pairs: Vec<(String, usize)> = self.seqnames.iter().cloned().zip(self.lengths.iter().cloned()).collect();
        pairs.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        Genome {
            seqnames: pairs.iter().map(|x| x.0.clone()).collect(),
            lengths : pairs.iter().map(|x| x.1).collect(),
        }
    }

    pub fn read<R: Read>(&mut self, reader: R) -> io::Result<()> {
        let reader = BufReader::new(reader);
        let mut seqnames = Vec::new();
        let mut lengths  = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid genome file"));
            }
            let length: usize = fields[1].parse().map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            seqnames.push(fields[0].to_string());
            lengths .push(length);
        }
        *self = Genome::new(seqnames, lengths);
        Ok(())
    }

    pub fn import<P: AsRef<Path>>(&mut self, filename: P) -> io::Result<()> {
        let file = File::open(filename.as_ref())?;
        self.read(file).map_err(|e| io::Error::new(io::ErrorKind::Other, format!("reading genome from `{:?}` failed: {}", filename.as_ref(), e)))
    }
}

/* -------------------------------------------------------------------------- */

impl fmt::Display for Genome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<10} {:>10}", "seqnames", "lengths")?;
        for (seqname, length) in self.seqnames.iter().zip(self.lengths.iter()) {
            writeln!(f, "{:<10} {:>10}", seqname, length)?;
        }
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {

    use crate::genome::Genome;

    #[test]
    fn test_genome_sorted() {

        let genome = Genome::new(
            vec![String::from("chr2"), String::from("chr10"), String::from("chr1")],
            vec![200, 100, 300],
        );
        let sorted = genome.sorted();

        assert_eq!(sorted.seqnames, vec!["chr1", "chr10", "chr2"]);
        assert_eq!(sorted.lengths , vec![300, 100, 200]);
        assert_eq!(sorted.get_idx("chr10"), Some(1));
    }

    #[test]
    fn test_genome_read() {

        let mut genome = Genome::default();

        genome.read("chr1\t1000\nchr2\t500\n".as_bytes()).unwrap();

        assert_eq!(genome.len(), 2);
        assert_eq!(genome.seq_length("chr2").unwrap(), 500);
        assert!(genome.seq_length("chr3").is_err());
    }
}
