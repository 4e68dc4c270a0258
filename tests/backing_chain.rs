//! Backing-file fallthrough: reads of unallocated clusters fall through to
//! a raw backing file, and a partial write to such a cluster preserves the
//! backing bytes outside the patched range.

use qcow2_core::{CreateOptions, Image, OpenFlags};

#[test]
fn unallocated_reads_fall_through_to_raw_backing_file() {
    let dir = tempfile::tempdir().unwrap();
    let backing_path = dir.path().join("base.raw");
    let overlay_path = dir.path().join("overlay.qcow2");

    let cluster_size = 1u64 << 16;
    let backing_bytes: Vec<u8> = (0..cluster_size * 2).map(|i| (i % 200) as u8).collect();
    std::fs::write(&backing_path, &backing_bytes).unwrap();

    let options = CreateOptions {
        size: cluster_size * 2,
        cluster_bits: 16,
        backing_path: Some(backing_path.to_string_lossy().into_owned()),
        backing_format: Some("raw".to_string()),
        ..Default::default()
    };
    Image::create(&overlay_path, &options).unwrap();

    let overlay = Image::open(&overlay_path, OpenFlags::read_write()).unwrap();
    let mut buf = vec![0u8; cluster_size as usize];
    overlay.read_at(&mut buf, 0).unwrap();
    assert_eq!(buf, backing_bytes[..cluster_size as usize]);
}

#[test]
fn partial_write_to_unallocated_cluster_primes_from_backing_file() {
    let dir = tempfile::tempdir().unwrap();
    let backing_path = dir.path().join("base.raw");
    let overlay_path = dir.path().join("overlay.qcow2");

    let cluster_size = 1u64 << 16;
    let backing_bytes: Vec<u8> = (0..cluster_size).map(|i| (i % 200) as u8).collect();
    std::fs::write(&backing_path, &backing_bytes).unwrap();

    let options = CreateOptions {
        size: cluster_size,
        cluster_bits: 16,
        backing_path: Some(backing_path.to_string_lossy().into_owned()),
        backing_format: Some("raw".to_string()),
        ..Default::default()
    };
    Image::create(&overlay_path, &options).unwrap();

    let overlay = Image::open(&overlay_path, OpenFlags::read_write()).unwrap();
    overlay.write_at(b"OVERLAY", 1000).unwrap();

    let mut whole = vec![0u8; cluster_size as usize];
    overlay.read_at(&mut whole, 0).unwrap();
    assert_eq!(&whole[1000..1007], b"OVERLAY");
    assert_eq!(&whole[..1000], &backing_bytes[..1000]);
    assert_eq!(&whole[1007..], &backing_bytes[1007..]);
}

#[test]
fn backing_chain_cycle_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("self_referential.qcow2");
    let options = CreateOptions {
        size: 1 << 20,
        backing_path: Some(path.file_name().unwrap().to_string_lossy().into_owned()),
        ..Default::default()
    };
    Image::create(&path, &options).unwrap();

    let err = Image::open(&path, OpenFlags::read_write()).unwrap_err();
    assert!(matches!(err, qcow2_core::DiskError::BackingChainCycle));
}
