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

use rustybed::bigbed::BigBedFile;

/* -------------------------------------------------------------------------- */

fn info(filename_in: &str, verbose: bool) {

    if verbose {
        eprintln!("Opening bigBed file {}", filename_in);
    }

    let mut reader = BigBedFile::new_reader(filename_in).unwrap_or_else(|err| {
        eprintln!("Error opening file: {}", err);
        process::exit(1);
    });

    let header = reader.header().clone();

    println!("version:               {}", header.version);
    println!("item count:            {}", header.n_entries);
    println!("field count:           {}", header.field_count);
    println!("defined field count:   {}", header.defined_field_count);
    println!("zoom levels:           {}", header.zoom_levels);
    println!("compressed:            {}", header.uncompressed_buf_size > 0);
    println!("bases covered:         {}", header.summary.bases_covered);

    match reader.genome() {
        Ok(genome) => {
            println!();
            print!("{}", genome);
        }
        Err(err) => {
            eprintln!("Error reading chromosome list: {}", err);
            process::exit(1);
        }
    }
}

/* -------------------------------------------------------------------------- */

fn main() {
    let matches = Command::new("BigBed Info")
        .version("1.0")
        .author("Philipp Benner [https://github.com/pbenner]")
        .about("Print bigBed header and genome information")
        .arg(Arg::new("input")
            .required(true)
            .index(1)
            .help("Input BigBed file"))
        .arg(Arg::new("verbose")
            .short('v')
            .long("verbose")
            .action(clap::ArgAction::SetTrue)
            .help("Enable verbose output"))
        .get_matches();

    let filename_in = matches.get_one::<String>("input").expect("Input file is required");
    let verbose     = matches.get_flag("verbose");

    info(filename_in, verbose);
}
