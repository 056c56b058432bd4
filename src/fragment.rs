//! Streaming gzip+tar decomposition into file fragments.
//!
//! A layer blob is a gzip-compressed tarball. [`walk_fragments`] decodes it
//! lazily and feeds the consumer tagged events: `Data` for each fragment of
//! each regular file (a large file spans multiple fragments with the same
//! path), `Corrupt` for a read failure inside an entry whose path is known.
//! Nothing is ever fully materialised; one fragment buffer is reused for the
//! whole walk.
//!
//! Error split: a failure while iterating entry headers (or in the gzip
//! stream itself) is unrecoverable and surfaces as the walk's return error;
//! a failure while reading one entry's bytes yields `Corrupt` and the walk
//! moves on to the next entry.

use flate2::read::GzDecoder;
use std::io::{self, Read};
use std::ops::ControlFlow;
use tar::Archive;

/// One event from the fragment walk.
pub enum FragmentEvent<'a> {
    /// A contiguous byte-range of a regular file.
    Data { path: &'a str, bytes: &'a [u8] },
    /// Extraction error local to one entry. The walk continues.
    Corrupt { path: &'a str, error: io::Error },
}

/// Decodes `reader` as a gzipped tarball and feeds fragments of at most
/// `fragment_size` bytes to `consume`. The consumer returns
/// [`ControlFlow::Break`] to abort at a fragment boundary (cancellation);
/// the walk then returns `Ok`.
pub fn walk_fragments<R, F>(reader: R, fragment_size: usize, mut consume: F) -> io::Result<()>
where
    R: Read,
    F: FnMut(FragmentEvent<'_>) -> ControlFlow<()>,
{
    let gz = GzDecoder::new(reader);
    let mut archive = Archive::new(gz);
    let mut buf = vec![0u8; fragment_size.max(1)];

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        loop {
            match fill(&mut entry, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let flow = consume(FragmentEvent::Data {
                        path: &path,
                        bytes: &buf[..n],
                    });
                    if flow.is_break() {
                        return Ok(());
                    }
                }
                Err(error) => {
                    let flow = consume(FragmentEvent::Corrupt { path: &path, error });
                    if flow.is_break() {
                        return Ok(());
                    }
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Reads until `buf` is full or the entry ends. Keeps fragments maximal so
/// fingerprints are stable across identical files.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_input_is_fatal() {
        let garbage: &[u8] = b"this is not gzip";
        let result = walk_fragments(garbage, 64, |_| ControlFlow::Continue(()));
        assert!(result.is_err());
    }
}
