use silt::{Config, Lookup};
use test_log::test;

#[test]
fn iteration_is_ordered_and_deduplicated() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.put(b"c", b"3")?;
    db.put(b"a", b"1")?;
    db.put(b"b", b"old")?;
    db.put(b"b", b"2")?;
    db.put(b"d", b"4")?;
    db.delete(b"d")?;

    let items = db
        .iter()?
        .collect::<silt::Result<Vec<_>>>()?
        .into_iter()
        .map(|(k, v)| (k.to_vec(), v.to_vec()))
        .collect::<Vec<_>>();

    assert_eq!(
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ],
        items
    );

    Ok(())
}

#[test]
fn iteration_spans_memtables_and_tables() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .write_buffer_size(8 * 1_024)
        .open()?;

    for i in (0..300u32).rev() {
        db.put(format!("key{i:04}"), format!("v{i}"))?;
    }
    db.flush_memtable()?;
    db.compact_level(0)?;

    // Newer writes overlay the table data
    db.put(b"key0000", b"patched")?;
    db.delete(b"key0001")?;

    let items = db.iter()?.collect::<silt::Result<Vec<_>>>()?;

    assert_eq!(299, items.len());
    assert_eq!(b"key0000".to_vec(), items[0].0.to_vec());
    assert_eq!(b"patched".to_vec(), items[0].1.to_vec());
    assert_eq!(b"key0002".to_vec(), items[1].0.to_vec());

    // Strictly ascending user keys
    for pair in items.windows(2) {
        assert!(pair[0].0 < pair[1].0);
    }

    Ok(())
}

#[test]
fn seek_positions_at_first_key_at_or_after_target() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    for key in [b"apple" as &[u8], b"banana", b"cherry", b"damson"] {
        db.put(key, b"v")?;
    }

    let mut iter = db.iter()?;

    assert!(iter.seek(b"banana"));
    assert_eq!(b"banana", iter.key());

    assert!(iter.seek(b"blueberry"));
    assert_eq!(b"cherry", iter.key());

    assert!(iter.advance());
    assert_eq!(b"damson", iter.key());
    assert!(!iter.advance());

    assert!(!iter.seek(b"zucchini"));
    iter.status()?;

    Ok(())
}

#[test]
fn iterator_reads_at_a_stable_snapshot() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.put(b"a", b"before")?;
    db.put(b"b", b"before")?;

    let iter = db.iter()?;

    // These land after the iterator's snapshot
    db.put(b"a", b"after")?;
    db.put(b"c", b"new")?;
    db.delete(b"b")?;

    let items = iter
        .collect::<silt::Result<Vec<_>>>()?
        .into_iter()
        .map(|(k, v)| (k.to_vec(), v.to_vec()))
        .collect::<Vec<_>>();

    assert_eq!(
        vec![
            (b"a".to_vec(), b"before".to_vec()),
            (b"b".to_vec(), b"before".to_vec()),
        ],
        items
    );

    // Reads at the head see the new state
    assert!(matches!(db.get(b"a")?, Lookup::Found(v) if &*v == b"after"));
    assert_eq!(Lookup::Deleted, db.get(b"b")?);

    Ok(())
}
