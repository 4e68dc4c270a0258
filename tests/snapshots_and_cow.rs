//! Snapshot create/revert/delete, and the copy-on-write behavior a
//! snapshot's shared L2 tables rely on.

use qcow2_core::backend::MemBackend;
use qcow2_core::{CreateOptions, Image};

fn new_image(size: u64) -> Image {
    Image::create_in(Box::new(MemBackend::new()), &CreateOptions { size, ..Default::default() }).unwrap()
}

#[test]
fn snapshot_preserves_state_through_later_writes() {
    let cluster_size = 1u64 << 16;
    let image = new_image(cluster_size * 4);

    image.write_at(b"before snapshot", 0).unwrap();
    image.create_snapshot("s0").unwrap();

    image.write_at(b"after snapshot!", 0).unwrap();

    let mut live = vec![0u8; 15];
    image.read_at(&mut live, 0).unwrap();
    assert_eq!(&live, b"after snapshot!");

    let mut snap = vec![0u8; 15];
    image.read_at_snapshot(&mut snap, 0, "s0").unwrap();
    assert_eq!(&snap, b"before snapshot");
}

#[test]
fn revert_restores_snapshot_state() {
    let cluster_size = 1u64 << 16;
    let image = new_image(cluster_size * 4);

    image.write_at(b"v1", 0).unwrap();
    image.create_snapshot("s0").unwrap();
    image.write_at(b"v2", 0).unwrap();

    image.revert_to_snapshot("s0").unwrap();
    let mut buf = vec![0u8; 2];
    image.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"v1");

    let report = image.check().unwrap();
    assert_eq!(report.leaks, 0, "{:?}", report.errors);
    assert_eq!(report.corruptions, 0, "{:?}", report.errors);
}

#[test]
fn delete_snapshot_frees_exclusively_owned_clusters() {
    let cluster_size = 1u64 << 16;
    let image = new_image(cluster_size * 4);

    image.write_at(b"only snapshot owns this", 0).unwrap();
    image.create_snapshot("s0").unwrap();
    image.delete_snapshot("s0").unwrap();

    assert!(image.snapshots().is_empty());
    let report = image.check().unwrap();
    assert_eq!(report.leaks, 0, "{:?}", report.errors);
    assert_eq!(report.corruptions, 0, "{:?}", report.errors);
}

#[test]
fn writes_after_snapshot_copy_on_write_shared_l2_table() {
    let cluster_size = 1u64 << 16;
    let image = new_image(cluster_size * 16);

    // Touch many clusters through one L2 table, snapshot, then mutate one
    // of them; the rest must still read back unchanged through the
    // snapshot and the live image both.
    for i in 0..8u64 {
        image.write_at(&[i as u8; 4], i * cluster_size).unwrap();
    }
    image.create_snapshot("s0").unwrap();
    image.write_at(&[0xffu8; 4], 3 * cluster_size).unwrap();

    for i in 0..8u64 {
        let mut buf = [0u8; 4];
        image.read_at(&mut buf, i * cluster_size).unwrap();
        if i == 3 {
            assert_eq!(buf, [0xff; 4]);
        } else {
            assert_eq!(buf, [i as u8; 4]);
        }

        let mut snap_buf = [0u8; 4];
        image.read_at_snapshot(&mut snap_buf, i * cluster_size, "s0").unwrap();
        assert_eq!(snap_buf, [i as u8; 4]);
    }

    let report = image.check().unwrap();
    assert_eq!(report.leaks, 0, "{:?}", report.errors);
    assert_eq!(report.corruptions, 0, "{:?}", report.errors);
}

#[test]
fn unknown_snapshot_name_is_an_error() {
    let image = new_image(1 << 20);
    assert!(image.delete_snapshot("nope").is_err());
    assert!(image.revert_to_snapshot("nope").is_err());
    assert!(image.read_at_snapshot(&mut [0u8; 1], 0, "nope").is_err());
}
