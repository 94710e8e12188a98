use silt::{Config, Lookup, WriteBatch};
use test_log::test;

fn found(lookup: Lookup) -> Option<Vec<u8>> {
    match lookup {
        Lookup::Found(value) => Some(value.to_vec()),
        _ => None,
    }
}

#[test]
fn put_get_roundtrip() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.put(b"a", b"1")?;
    db.put(b"b", b"2")?;
    db.put(b"a", b"3")?;

    assert_eq!(Some(b"3".to_vec()), found(db.get(b"a")?));
    assert_eq!(Some(b"2".to_vec()), found(db.get(b"b")?));
    assert_eq!(Lookup::NotFound, db.get(b"c")?);

    Ok(())
}

#[test]
fn delete_then_get_reports_deleted() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.put(b"k", b"v")?;
    db.delete(b"k")?;

    assert_eq!(Lookup::Deleted, db.get(b"k")?);

    // A later write resurrects the key
    db.put(b"k", b"v2")?;
    assert_eq!(Some(b"v2".to_vec()), found(db.get(b"k")?));

    Ok(())
}

#[test]
fn batch_applies_atomically() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.put(b"stale", b"old")?;

    let mut batch = WriteBatch::new();
    batch.put(b"x", b"1");
    batch.put(b"y", b"2");
    batch.delete(b"stale");
    batch.put(b"z", b"3");
    db.write(batch)?;

    assert_eq!(Some(b"1".to_vec()), found(db.get(b"x")?));
    assert_eq!(Some(b"2".to_vec()), found(db.get(b"y")?));
    assert_eq!(Some(b"3".to_vec()), found(db.get(b"z")?));
    assert_eq!(Lookup::Deleted, db.get(b"stale")?);

    Ok(())
}

#[test]
fn empty_batch_is_a_noop() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.write(WriteBatch::new())?;
    assert_eq!(Lookup::NotFound, db.get(b"anything")?);

    Ok(())
}

#[test]
fn values_survive_memtable_rotation() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .write_buffer_size(8 * 1_024)
        .open()?;

    // Way more data than one memtable holds
    for i in 0..500u32 {
        db.put(format!("key{i:04}"), format!("value{i}").repeat(8))?;
    }

    for i in 0..500u32 {
        assert_eq!(
            Some(format!("value{i}").repeat(8).into_bytes()),
            found(db.get(format!("key{i:04}"))?),
            "key{i:04}"
        );
    }

    Ok(())
}

#[test]
fn random_payloads_roundtrip() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    let payloads: Vec<(String, String)> = (0..200)
        .map(|i| (format!("key{i:03}"), nanoid::nanoid!()))
        .collect();

    for (k, v) in &payloads {
        db.put(k, v)?;
    }
    db.flush_memtable()?;

    for (k, v) in &payloads {
        assert!(
            matches!(db.get(k)?, Lookup::Found(got) if *got == *v.as_bytes()),
            "{k}"
        );
    }

    Ok(())
}

#[test]
fn operations_after_close_fail() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.put(b"k", b"v")?;
    db.close()?;

    assert!(matches!(db.put(b"k2", b"v"), Err(silt::Error::Closed)));
    assert!(matches!(db.get(b"k"), Err(silt::Error::Closed)));

    // Closing twice is fine
    db.close()?;

    Ok(())
}

#[test]
fn folder_is_locked_exclusively() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    assert!(matches!(
        Config::new(&folder).open(),
        Err(silt::Error::Locked)
    ));

    drop(db);
    Config::new(&folder).open()?;

    Ok(())
}
