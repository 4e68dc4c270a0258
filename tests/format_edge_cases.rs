//! Format-level edge cases: refcount width variants, extended-L2 write
//! rejection, and cluster/L2-boundary offsets.

use std::collections::HashMap;

use qcow2_core::backend::MemBackend;
use qcow2_core::qcow2::header::{self, Header};
use qcow2_core::{CreateOptions, DiskError, Image, OpenFlags};

fn header_fixture(cluster_bits: u32, size: u64, incompatible_features: u64) -> MemBackend {
    let cluster_size = 1u64 << cluster_bits;
    let mut backend = MemBackend::with_len(cluster_size * 4).unwrap();
    let l2_entry_size = if incompatible_features & header::INCOMPAT_EXTENDED_L2 != 0 { 16 } else { 8 };
    let l2_entries = cluster_size / l2_entry_size;
    let l1_size = size.div_ceil(cluster_size).div_ceil(l2_entries).max(1) as u32;
    let header = Header {
        version: 3,
        size,
        cluster_bits,
        l1_size,
        l1_table_offset: cluster_size,
        refcount_table_offset: cluster_size * 2,
        refcount_table_clusters: 1,
        crypt_method: 0,
        backing_file_offset: 0,
        backing_file_size: 0,
        refcount_order: 4,
        incompatible_features,
        compatible_features: 0,
        autoclear_features: 0,
        header_length: header::V3_HEADER_LEN,
        extensions: HashMap::new(),
    };
    header.write(&mut backend).unwrap();
    backend
}

#[test]
fn extended_l2_image_rejects_writes() {
    let backend = header_fixture(16, 1 << 16, header::INCOMPAT_EXTENDED_L2);
    let image = Image::open_in(Box::new(backend), OpenFlags::read_write()).unwrap();
    let err = image.write_at(b"x", 0).unwrap_err();
    assert!(matches!(err, DiskError::UnsupportedFeature(_)));
}

#[test]
fn extended_l2_image_still_allows_reads() {
    let backend = header_fixture(16, 1 << 16, header::INCOMPAT_EXTENDED_L2);
    let image = Image::open_in(Box::new(backend), OpenFlags::read_write()).unwrap();
    let mut buf = [0u8; 4];
    // Untouched region of an extended-L2 image is still unallocated/zero.
    image.read_at(&mut buf, 0).unwrap();
    assert_eq!(buf, [0; 4]);
}

#[test]
fn every_refcount_width_persists_and_checks_clean() {
    for order in 0..=6u32 {
        let options = CreateOptions {
            size: 1 << 20,
            refcount_order: order,
            ..Default::default()
        };
        let image = Image::create_in(Box::new(MemBackend::new()), &options).unwrap();
        for i in 0..4u64 {
            image.write_at(&[order as u8, i as u8], i * (1 << 16)).unwrap();
        }
        let report = image.check().unwrap();
        assert_eq!(report.leaks, 0, "order {order}: {:?}", report.errors);
        assert_eq!(report.corruptions, 0, "order {order}: {:?}", report.errors);

        for i in 0..4u64 {
            let mut buf = [0u8; 2];
            image.read_at(&mut buf, i * (1 << 16)).unwrap();
            assert_eq!(buf, [order as u8, i as u8]);
        }
    }
}

#[test]
fn v2_image_rejects_non_default_refcount_order() {
    let options = CreateOptions {
        version: 2,
        refcount_order: 0,
        ..Default::default()
    };
    assert!(Image::create_in(Box::new(MemBackend::new()), &options).is_err());
}

#[test]
fn writes_exactly_at_cluster_and_l2_boundaries_round_trip() {
    let cluster_bits = 16;
    let cluster_size = 1u64 << cluster_bits;
    let l2_entries = cluster_size / 8;
    let options = CreateOptions {
        size: cluster_size * (l2_entries + 4),
        cluster_bits,
        ..Default::default()
    };
    let image = Image::create_in(Box::new(MemBackend::new()), &options).unwrap();

    let boundaries = [
        0u64,
        cluster_size - 1,
        cluster_size,
        cluster_size * l2_entries - 1, // last byte covered by the first L2 table
        cluster_size * l2_entries,     // first byte covered by the second L2 table
    ];
    for &off in &boundaries {
        image.write_at(&[0xab], off).unwrap();
        let mut buf = [0u8; 1];
        image.read_at(&mut buf, off).unwrap();
        assert_eq!(buf, [0xab], "offset {off}");
    }

    let report = image.check().unwrap();
    assert_eq!(report.leaks, 0, "{:?}", report.errors);
    assert_eq!(report.corruptions, 0, "{:?}", report.errors);
}
