//! `write_zero_at` in both `Plain` and `Alloc` modes, including re-zeroing
//! of stale physical bytes on a later partial write to a zero-alloc
//! cluster.

use qcow2_core::backend::MemBackend;
use qcow2_core::{CreateOptions, Image, ZeroMode};

fn new_image(size: u64) -> Image {
    Image::create_in(Box::new(MemBackend::new()), &CreateOptions { size, ..Default::default() }).unwrap()
}

#[test]
fn plain_zero_clears_whole_cluster_and_frees_its_backing_storage() {
    let cluster_size = 1u64 << 16;
    let image = new_image(cluster_size * 2);
    image.write_at(&vec![0xaau8; cluster_size as usize], 0).unwrap();
    image.write_zero_at(0, cluster_size, ZeroMode::Plain).unwrap();

    let mut buf = vec![0xffu8; cluster_size as usize];
    image.read_at(&mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    let report = image.check().unwrap();
    assert_eq!(report.leaks, 0, "{:?}", report.errors);
    assert_eq!(report.corruptions, 0, "{:?}", report.errors);
}

#[test]
fn alloc_zero_preserves_host_offset_and_reads_zero() {
    let cluster_size = 1u64 << 16;
    let image = new_image(cluster_size * 2);
    image.write_at(&vec![0xaau8; cluster_size as usize], 0).unwrap();
    image.write_zero_at(0, cluster_size, ZeroMode::Alloc).unwrap();

    let mut buf = vec![0xffu8; cluster_size as usize];
    image.read_at(&mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    let report = image.check().unwrap();
    assert_eq!(report.leaks, 0, "{:?}", report.errors);
    assert_eq!(report.corruptions, 0, "{:?}", report.errors);
}

#[test]
fn partial_write_into_zero_alloc_cluster_does_not_resurrect_stale_bytes() {
    let cluster_size = 1u64 << 16;
    let image = new_image(cluster_size * 2);

    image.write_at(&vec![0xaau8; cluster_size as usize], 0).unwrap();
    image.write_zero_at(0, cluster_size, ZeroMode::Alloc).unwrap();

    // A small write into the middle of the now-zero-alloc cluster must not
    // expose any of the old 0xaa bytes outside the patched range.
    image.write_at(b"patch", 100).unwrap();

    let mut buf = vec![0u8; cluster_size as usize];
    image.read_at(&mut buf, 0).unwrap();
    assert!(buf[..100].iter().all(|&b| b == 0));
    assert_eq!(&buf[100..105], b"patch");
    assert!(buf[105..].iter().all(|&b| b == 0));
}

#[test]
fn zero_write_spanning_partial_and_whole_clusters() {
    let cluster_size = 1u64 << 16;
    let image = new_image(cluster_size * 3);
    image.write_at(&vec![0x11u8; (cluster_size * 3) as usize], 0).unwrap();

    let start = cluster_size - 10;
    let len = cluster_size + 20;
    image.write_zero_at(start, len, ZeroMode::Plain).unwrap();

    let mut before = vec![0u8; 10];
    image.read_at(&mut before, start - 10).unwrap();
    assert!(before.iter().all(|&b| b == 0x11));

    let mut zeroed = vec![0u8; len as usize];
    image.read_at(&mut zeroed, start).unwrap();
    assert!(zeroed.iter().all(|&b| b == 0));

    let mut after = vec![0u8; 10];
    image.read_at(&mut after, start + len).unwrap();
    assert!(after.iter().all(|&b| b == 0x11));
}
