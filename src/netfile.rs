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
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use reqwest::blocking::Client;

/* -------------------------------------------------------------------------- */

/// A random-access byte stream over either a local file or a remote HTTP
/// resource. Remote resources are read through range requests, so only the
/// regions a query touches are transferred.
pub enum NetFile {
    Local (File),
    Remote(HttpRangeReader),
}

/* -------------------------------------------------------------------------- */

impl NetFile {

    pub fn open(filename: &str) -> io::Result<NetFile> {
        if filename.starts_with("http://") || filename.starts_with("https://") {
            Ok(NetFile::Remote(HttpRangeReader::open(filename)?))
        } else {
            let path = Path::new(filename);
            if !path.is_file() {
                return Err(io::Error::new(io::ErrorKind::NotFound, format!("file `{}` not found", filename)));
            }
            Ok(NetFile::Local(File::open(path)?))
        }
    }

}

/* -------------------------------------------------------------------------- */

impl Read for NetFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetFile::Local (file) => file.read(buf),
            NetFile::Remote(file) => file.read(buf),
        }
    }
}

impl Seek for NetFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            NetFile::Local (file) => file.seek(pos),
            NetFile::Remote(file) => file.seek(pos),
        }
    }
}

/* -------------------------------------------------------------------------- */

/// Seekable reader over an HTTP resource using range requests.
pub struct HttpRangeReader {
    client  : Client,
    url     : String,
    position: u64,
    length  : u64,
}

/* -------------------------------------------------------------------------- */

impl HttpRangeReader {

    fn open(url: &str) -> io::Result<HttpRangeReader> {
        let client   = Client::new();
        let response = client.head(url).send().map_err(http_error)?;

        if !response.status().is_success() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("HTTP request for `{}` failed: {}", url, response.status())));
        }
        let length = response
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing or invalid Content-Length header"))?;

        Ok(HttpRangeReader {
            client  : client,
            url     : url.to_string(),
            position: 0,
            length  : length,
        })
    }

    pub fn len(&self) -> u64 {
        self.length
    }

}

/* -------------------------------------------------------------------------- */

fn http_error(error: reqwest::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error)
}

/* -------------------------------------------------------------------------- */

impl Read for HttpRangeReader {

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let remaining = self.length - self.position;
        let count     = (buf.len() as u64).min(remaining);
        let range     = format!("bytes={}-{}", self.position, self.position + count - 1);

        let response = self.client
            .get(&self.url)
            .header("Range", range)
            .send()
            .map_err(http_error)?;
        let bytes = response.bytes().map_err(http_error)?;

        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        self.position += n as u64;

        Ok(n)
    }

}

impl Seek for HttpRangeReader {

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start  (p) => Some(p),
            SeekFrom::Current(p) => apply_offset(self.position, p),
            SeekFrom::End    (p) => apply_offset(self.length, p),
        };
        match target {
            Some(p) if p <= self.length => {
                self.position = p;
                Ok(p)
            }
            Some(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek position beyond end of resource")),
            None    => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")),
        }
    }

}

/* -------------------------------------------------------------------------- */

fn apply_offset(base: u64, offset: i64) -> Option<u64> {
    if offset >= 0 {
        base.checked_add(offset as u64)
    } else {
        base.checked_sub(offset.unsigned_abs())
    }
}
