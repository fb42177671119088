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

use std::io;

use thiserror::Error;

/* -------------------------------------------------------------------------- */

/// Errors that can occur while reading or writing BigBed files.
#[derive(Error, Debug)]
pub enum BigBedError {
    #[error("invalid magic number (not a bigBed file or corrupted index)")]
    InvalidMagic,
    #[error("unsupported bigBed version {0} (minimum supported version is 3)")]
    UnsupportedVersion(u16),
    #[error("stream does not support seeking")]
    NotSeekable,
    #[error("sequence `{0}` not found in chromosome index")]
    SeqnameNotFound(String),
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("malformed bed record: {0}")]
    MalformedRecord(String),
    #[error("corrupted index: {0}")]
    CorruptIndex(String),
    #[error("i/o error: {0}")]
    Io(io::Error),
}

/* -------------------------------------------------------------------------- */

impl From<io::Error> for BigBedError {
    fn from(error: io::Error) -> Self {
        // Truncated fixed-size records surface as a distinct error kind
        if error.kind() == io::ErrorKind::UnexpectedEof {
            BigBedError::UnexpectedEof
        } else {
            BigBedError::Io(error)
        }
    }
}
