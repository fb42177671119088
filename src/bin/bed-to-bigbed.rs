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

use std::process;

use clap::{Arg, Command};

use rustybed::bed_set::BedRecordSet;
use rustybed::bigbed::{BigBedFile, OptionBigBed};
use rustybed::genome::Genome;

/* -------------------------------------------------------------------------- */

fn convert(
    filename_in : &str,
    filename_out: &str,
    genome_file : Option<&str>,
    block_size  : usize,
    items       : usize,
    uncompressed: bool,
    verbose     : bool,
) {
    if verbose {
        eprintln!("Reading bed file {}", filename_in);
    }

    let compress = filename_in.ends_with(".gz");

    let mut records = BedRecordSet::new();
    if let Err(err) = records.import_bed_auto(filename_in, compress) {
        eprintln!("Error reading bed file: {}", err);
        process::exit(1);
    }

    let mut chrom_sizes = None;
    if let Some(filename) = genome_file {
        if verbose {
            eprintln!("Reading chromosome sizes from {}", filename);
        }
        let mut genome = Genome::default();
        if let Err(err) = genome.import(filename) {
            eprintln!("Error reading genome file: {}", err);
            process::exit(1);
        }
        chrom_sizes = Some(genome);
    }

    if verbose {
        eprintln!("Writing {} records to {}", records.len(), filename_out);
    }

    let parameters = vec![
        OptionBigBed::BlockSize(block_size),
        OptionBigBed::ItemsPerSlot(items),
        OptionBigBed::Compressed(!uncompressed),
    ];

    if let Err(err) = BigBedFile::write(filename_out, &records, chrom_sizes.as_ref(), parameters) {
        eprintln!("Error writing BigBed file: {}", err);
        process::exit(1);
    }
}

/* -------------------------------------------------------------------------- */

fn main() {
    let matches = Command::new("Bed To BigBed")
        .version("1.0")
        .author("Philipp Benner [https://github.com/pbenner]")
        .about("Convert plain-text bed files to BigBed")
        .arg(
            Arg::new("input")
                .help("The input bed file (gzip compressed if the name ends in .gz)")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("output")
                .help("The output BigBed file")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::new("genome")
                .long("genome")
                .help("Two-column file with chromosome names and sizes"))
        .arg(
            Arg::new("block-size")
                .long("block-size")
                .default_value("256")
                .help("Number of slots per index node"))
        .arg(
            Arg::new("items-per-slot")
                .long("items-per-slot")
                .default_value("512")
                .help("Number of features per data block"))
        .arg(
            Arg::new("uncompressed")
                .long("uncompressed")
                .action(clap::ArgAction::SetTrue)
                .help("Store data blocks without compression"))
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::SetTrue)
                .help("Be verbose"))
        .get_matches();

    let filename_in  = matches.get_one::<String>("input") .expect("Input file is required");
    let filename_out = matches.get_one::<String>("output").expect("Output file is required");
    let genome_file  = matches.get_one::<String>("genome").map(|s| s.as_str());
    let block_size: usize = matches
        .get_one::<String>("block-size")
        .expect("Block size is required")
        .parse()
        .unwrap_or_else(|_| {
            eprintln!("Invalid block size");
            process::exit(1);
        });
    let items: usize = matches
        .get_one::<String>("items-per-slot")
        .expect("Items per slot is required")
        .parse()
        .unwrap_or_else(|_| {
            eprintln!("Invalid number of items per slot");
            process::exit(1);
        });
    let uncompressed = matches.get_flag("uncompressed");
    let verbose      = matches.get_flag("verbose");

    convert(filename_in, filename_out, genome_file, block_size, items, uncompressed, verbose);

}
