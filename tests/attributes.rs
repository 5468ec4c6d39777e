//! End-to-end attribute scenarios: regime transitions, deletions and
//! read-modify-write across file reopens.

use hfive::Attribute;
use hfive::CreateMode;
use hfive::Dataspace;
use hfive::Datatype;
use hfive::DatasetOptions;
use hfive::Error;
use hfive::FileOptions;
use hfive::Hfive;
use hfive::OpenMode;
use std::path::Path;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn int_attr(name: &str, value: i32) -> Attribute {
    Attribute {
        name: name.into(),
        datatype: Datatype::int32(),
        dataspace: Dataspace::scalar(),
        data: value.to_le_bytes().to_vec(),
    }
}

fn create_int_dataset(f: &mut Hfive, path: &str, len: u64) {
    f.create_dataset(path, Datatype::int32(), Dataspace::new(vec![len]), &DatasetOptions::default())
        .unwrap();
}

/// Compact to dense transition: ten attributes survive a close and reopen,
/// and the object header ends up with dense storage.
#[test]
fn compact_to_dense_transition() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s1.h5");

    let mut f = Hfive::create(&path, CreateMode::Truncate, FileOptions::default()).unwrap();
    create_int_dataset(&mut f, "/data", 10);
    for i in 0i32..10 {
        f.write_attribute("/data", int_attr(&format!("a{i}"), i * 10)).unwrap();
    }
    f.close().unwrap();

    let mut f = Hfive::open(&path, OpenMode::ReadOnly).unwrap();
    let names = f.list_attributes("/data").unwrap();
    let expected: Vec<String> = (0..10).map(|i| format!("a{i}")).collect();
    assert_eq!(names, expected);
    for i in 0i32..10 {
        let a = f.read_attribute("/data", &format!("a{i}")).unwrap();
        assert_eq!(a.datatype, Datatype::int32());
        assert_eq!(a.data, (i * 10).to_le_bytes());
    }
    assert!(f.attribute_storage_is_dense("/data").unwrap());
}

/// Deleting the middle compact attribute leaves the others untouched.
#[test]
fn delete_middle_compact_attribute() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s2.h5");

    let mut f = Hfive::create(&path, CreateMode::Truncate, FileOptions::default()).unwrap();
    create_int_dataset(&mut f, "/data", 5);
    f.write_attribute("/data", int_attr("attr0", 0)).unwrap();
    f.write_attribute("/data", int_attr("attr1", 10)).unwrap();
    f.write_attribute("/data", int_attr("attr2", 20)).unwrap();
    f.close().unwrap();

    let mut f = Hfive::open(&path, OpenMode::ReadWrite).unwrap();
    f.delete_attribute("/data", "attr1").unwrap();
    f.close().unwrap();

    let mut f = Hfive::open(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(f.list_attributes("/data").unwrap(), ["attr0", "attr2"]);
    assert_eq!(f.read_attribute("/data", "attr0").unwrap().data, 0i32.to_le_bytes());
    assert_eq!(f.read_attribute("/data", "attr2").unwrap().data, 20i32.to_le_bytes());
    assert!(matches!(
        f.read_attribute("/data", "attr1"),
        Err(Error::NotFound(_))
    ));
}

/// Read-modify-write append: a reopened object with dense storage keeps
/// taking attributes through the dense path.
#[test]
fn rmw_append_to_dense_attributes() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s6.h5");

    let mut f = Hfive::create(&path, CreateMode::Truncate, FileOptions::default()).unwrap();
    create_int_dataset(&mut f, "/data", 1);
    for i in 0..8 {
        f.write_attribute("/data", int_attr(&format!("attr{i:02}"), i)).unwrap();
    }
    f.close().unwrap();

    let mut f = Hfive::open(&path, OpenMode::ReadWrite).unwrap();
    for i in 8i32..11 {
        f.write_attribute("/data", int_attr(&format!("attr{i:02}"), i)).unwrap();
    }
    f.close().unwrap();

    let mut f = Hfive::open(&path, OpenMode::ReadOnly).unwrap();
    let names = f.list_attributes("/data").unwrap();
    assert_eq!(names.len(), 11);
    for i in 0i32..11 {
        let a = f.read_attribute("/data", &format!("attr{i:02}")).unwrap();
        assert_eq!(a.data, i.to_le_bytes());
    }
    assert!(f.attribute_storage_is_dense("/data").unwrap());
}

/// The attribute set after creation does not depend on where the transition
/// point fell.
#[test]
fn attribute_set_independent_of_transition_point() {
    init();
    let dir = tempfile::tempdir().unwrap();
    for count in [1usize, 7, 8, 9, 16, 40] {
        let path = dir.path().join(format!("n{count}.h5"));
        let mut f = Hfive::create(&path, CreateMode::Truncate, FileOptions::default()).unwrap();
        f.create_group("/obj").unwrap();
        for i in 0..count {
            f.write_attribute("/obj", int_attr(&format!("name{i:03}"), i as i32)).unwrap();
        }
        f.close().unwrap();

        let mut f = Hfive::open(&path, OpenMode::ReadOnly).unwrap();
        let names = f.list_attributes("/obj").unwrap();
        let expected: Vec<String> = (0..count).map(|i| format!("name{i:03}")).collect();
        assert_eq!(names, expected, "with {count} attributes");
        assert_eq!(f.attribute_storage_is_dense("/obj").unwrap(), count > 8);
    }
}

/// Deleting from dense storage, then reading back.
#[test]
fn dense_delete_then_not_found() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dense_delete.h5");

    let mut f = Hfive::create(&path, CreateMode::Truncate, FileOptions::default()).unwrap();
    f.create_group("/obj").unwrap();
    for i in 0..20 {
        f.write_attribute("/obj", int_attr(&format!("k{i:02}"), i)).unwrap();
    }
    f.delete_attribute("/obj", "k13").unwrap();
    f.close().unwrap();

    let mut f = Hfive::open(&path, OpenMode::ReadOnly).unwrap();
    assert!(matches!(
        f.read_attribute("/obj", "k13"),
        Err(Error::NotFound(_))
    ));
    assert_eq!(f.list_attributes("/obj").unwrap().len(), 19);
    assert_eq!(f.read_attribute("/obj", "k12").unwrap().data, 12i32.to_le_bytes());
}

/// Batch deletion with deferred rebalancing, then one explicit rebalance.
/// The rebalance is idempotent.
#[test]
fn deferred_rebalancing_batch() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batch.h5");

    let mut f = Hfive::create(&path, CreateMode::Truncate, FileOptions::default()).unwrap();
    f.create_group("/obj").unwrap();
    for i in 0..60 {
        f.write_attribute("/obj", int_attr(&format!("v{i:02}"), i)).unwrap();
    }

    f.disable_rebalancing();
    for i in 0..45 {
        f.delete_attribute("/obj", &format!("v{i:02}")).unwrap();
    }
    f.rebalance_attribute_btree("/obj").unwrap();
    f.rebalance_attribute_btree("/obj").unwrap();
    f.close().unwrap();

    let mut f = Hfive::open(&path, OpenMode::ReadOnly).unwrap();
    let names = f.list_attributes("/obj").unwrap();
    assert_eq!(names.len(), 15);
    for i in 45..60 {
        assert_eq!(
            f.read_attribute("/obj", &format!("v{i:02}")).unwrap().data,
            (i as i32).to_le_bytes()
        );
    }
}

/// Modifying attributes in both regimes survives a reopen.
#[test]
fn modify_across_reopen() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("modify.h5");

    let mut f = Hfive::create(&path, CreateMode::Truncate, FileOptions::default()).unwrap();
    f.create_group("/obj").unwrap();
    f.write_attribute("/obj", int_attr("compact", 1)).unwrap();
    f.close().unwrap();

    let mut f = Hfive::open(&path, OpenMode::ReadWrite).unwrap();
    f.modify_attribute("/obj", int_attr("compact", -1)).unwrap();
    assert!(matches!(
        f.modify_attribute("/obj", int_attr("absent", 0)),
        Err(Error::NotFound(_))
    ));
    f.close().unwrap();

    let mut f = Hfive::open(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(
        f.read_attribute("/obj", "compact").unwrap().data,
        (-1i32).to_le_bytes()
    );
}

/// String-typed attributes round-trip with their exact width.
#[test]
fn string_attribute_roundtrip() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strings.h5");

    let mut f = Hfive::create(&path, CreateMode::Truncate, FileOptions::default()).unwrap();
    f.create_group("/obj").unwrap();
    f.write_attribute(
        "/obj",
        Attribute {
            name: "label".into(),
            datatype: Datatype::string(6),
            dataspace: Dataspace::scalar(),
            data: b"double".to_vec(),
        },
    )
    .unwrap();
    f.close().unwrap();

    let mut f = Hfive::open(&path, OpenMode::ReadOnly).unwrap();
    let a = f.read_attribute("/obj", "label").unwrap();
    assert_eq!(a.datatype, Datatype::string(6));
    assert_eq!(a.data, b"double");
}

/// Exclusive creation refuses an existing path.
#[test]
fn exclusive_create() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path: &Path = &dir.path().join("excl.h5");

    Hfive::create(path, CreateMode::Exclusive, FileOptions::default())
        .unwrap()
        .close()
        .unwrap();
    assert!(matches!(
        Hfive::create(path, CreateMode::Exclusive, FileOptions::default()),
        Err(Error::AlreadyExists(_))
    ));
    // Truncate overwrites it
    Hfive::create(path, CreateMode::Truncate, FileOptions::default())
        .unwrap()
        .close()
        .unwrap();
}
