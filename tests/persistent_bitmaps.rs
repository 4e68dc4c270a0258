//! Persistent dirty-bitmap creation, auto dirty-tracking on write, and
//! directory persistence across a reopen.

use qcow2_core::{CreateOptions, Image, OpenFlags};

#[test]
fn writes_mark_ranges_dirty_in_an_auto_bitmap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.qcow2");
    let options = CreateOptions {
        size: 1 << 20,
        ..Default::default()
    };
    let image = Image::create(&path, &options).unwrap();

    let bitmap = image.create_bitmap("backup-0", 4096).unwrap();
    assert!(!bitmap.in_use());

    image.write_at(b"hello", 10_000).unwrap();
    assert!(image.bitmap_is_set("backup-0", 10_000).unwrap());
    assert!(!image.bitmap_is_set("backup-0", 500_000).unwrap());

    let ranges = image.bitmap_dirty_ranges("backup-0").unwrap();
    assert!(!ranges.is_empty());
}

#[test]
fn bitmap_directory_survives_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.qcow2");
    let options = CreateOptions {
        size: 1 << 20,
        ..Default::default()
    };
    let image = Image::create(&path, &options).unwrap();
    image.create_bitmap("b0", 65536).unwrap();
    image.write_at(b"x", 0).unwrap();
    image.flush().unwrap();
    drop(image);

    let reopened = Image::open(&path, OpenFlags::read_write()).unwrap();
    let entry = reopened.find_bitmap("b0").expect("bitmap directory must persist");
    assert_eq!(entry.granularity, 65536);
    assert!(reopened.bitmap_is_set("b0", 0).unwrap());
}

#[test]
fn unknown_bitmap_name_is_an_error() {
    let image = Image::create_in(
        Box::new(qcow2_core::MemBackend::new()),
        &CreateOptions { size: 1 << 16, ..Default::default() },
    )
    .unwrap();
    assert!(image.open_bitmap("missing").is_err());
}
