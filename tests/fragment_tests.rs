//! Tests for gzip+tar fragment walking.
//!
//! Validates chunking, entry filtering, empty archives, and early abort.

use flate2::write::GzEncoder;
use flate2::Compression;
use layerharvest::fragment::{walk_fragments, FragmentEvent};
use std::ops::ControlFlow;

/// Builds an in-memory gzipped tarball from `(path, content)` pairs.
fn gz_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, *path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn collect_fragments(blob: &[u8], fragment_size: usize) -> Vec<(String, Vec<u8>)> {
    let mut fragments = Vec::new();
    walk_fragments(blob, fragment_size, |event| {
        if let FragmentEvent::Data { path, bytes } = event {
            fragments.push((path.to_string(), bytes.to_vec()));
        }
        ControlFlow::Continue(())
    })
    .unwrap();
    fragments
}

// =============================================================================
// Walking Tests
// =============================================================================

#[test]
fn test_single_file_single_fragment() {
    let blob = gz_tar(&[("a/b.txt", b"hello world")]);
    let fragments = collect_fragments(&blob, 4096);

    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].0, "a/b.txt");
    assert_eq!(fragments[0].1, b"hello world");
}

#[test]
fn test_large_file_spans_fragments() {
    let content: Vec<u8> = (0..10u8).collect();
    let blob = gz_tar(&[("big.bin", &content)]);
    let fragments = collect_fragments(&blob, 4);

    assert_eq!(fragments.len(), 3);
    assert!(fragments.iter().all(|(path, _)| path == "big.bin"));
    assert_eq!(fragments[0].1, vec![0, 1, 2, 3]);
    assert_eq!(fragments[1].1, vec![4, 5, 6, 7]);
    assert_eq!(fragments[2].1, vec![8, 9]);
}

#[test]
fn test_multiple_files_in_order() {
    let blob = gz_tar(&[("one", b"1"), ("two", b"22"), ("three", b"333")]);
    let fragments = collect_fragments(&blob, 4096);

    let paths: Vec<&str> = fragments.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(paths, vec!["one", "two", "three"]);
}

#[test]
fn test_directories_are_skipped() {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o755);
    dir.set_cksum();
    builder.append_data(&mut dir, "subdir/", &b""[..]).unwrap();

    let mut file = tar::Header::new_gnu();
    file.set_size(4);
    file.set_mode(0o644);
    file.set_cksum();
    builder
        .append_data(&mut file, "subdir/f.txt", &b"data"[..])
        .unwrap();

    let blob = builder.into_inner().unwrap().finish().unwrap();
    let fragments = collect_fragments(&blob, 4096);

    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].0, "subdir/f.txt");
}

#[test]
fn test_empty_archive_yields_nothing() {
    let blob = gz_tar(&[]);
    assert!(collect_fragments(&blob, 4096).is_empty());
}

#[test]
fn test_empty_file_yields_no_fragments() {
    let blob = gz_tar(&[("empty.txt", b""), ("full.txt", b"x")]);
    let fragments = collect_fragments(&blob, 4096);

    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].0, "full.txt");
}

// =============================================================================
// Abort Tests
// =============================================================================

#[test]
fn test_break_stops_the_walk() {
    let blob = gz_tar(&[("one", b"1"), ("two", b"2"), ("three", b"3")]);
    let mut seen = 0;
    walk_fragments(&blob[..], 4096, |_| {
        seen += 1;
        ControlFlow::Break(())
    })
    .unwrap();
    assert_eq!(seen, 1);
}

#[test]
fn test_non_gzip_input_is_an_error() {
    let result = walk_fragments(&b"plain bytes"[..], 4096, |_| ControlFlow::Continue(()));
    assert!(result.is_err());
}
