use silt::{Config, Lookup, ValueType};
use test_log::test;

/// A tombstone must survive compaction while an older version of its
/// key lives below the output level, and must be physically dropped
/// once it reaches the bottom of the tree.
#[test]
fn tombstone_dropped_only_at_base_level() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    // Sink an old value to the bottom level
    db.put(b"doomed", b"v1")?;
    db.put(b"padding_a", b"x")?;
    db.put(b"padding_z", b"x")?;
    db.major_compact()?;

    let bottom_entries = db.dump_table_entries()?;
    let bottom_level = bottom_entries
        .iter()
        .find(|(_, k, _, _)| k == b"doomed")
        .map(|(level, ..)| *level)
        .expect("value reached a table");
    assert!(bottom_level >= 1);

    // Delete it and flush the tombstone to level 0
    db.delete(b"doomed")?;
    db.flush_memtable()?;

    // One step of compaction: the tombstone moves below level 0 but the
    // old value still lives deeper, so it must be carried along
    db.compact_level(0)?;

    let entries = db.dump_table_entries()?;
    let tombstones: Vec<_> = entries
        .iter()
        .filter(|(_, k, _, t)| k == b"doomed" && *t == ValueType::Tombstone)
        .collect();
    assert_eq!(
        1,
        tombstones.len(),
        "tombstone must survive while shadowed data sits deeper: {entries:?}"
    );
    assert!(tombstones[0].0 < bottom_level);
    assert_eq!(Lookup::Deleted, db.get(b"doomed")?);

    // Drive the tombstone all the way down; once nothing can hide
    // underneath it, it disappears physically
    db.major_compact()?;

    let entries = db.dump_table_entries()?;
    assert!(
        !entries.iter().any(|(_, k, _, _)| k == b"doomed"),
        "neither value nor tombstone should remain: {entries:?}"
    );
    assert_eq!(Lookup::NotFound, db.get(b"doomed")?);

    // Unrelated keys are untouched
    assert!(matches!(db.get(b"padding_a")?, Lookup::Found(_)));
    assert!(matches!(db.get(b"padding_z")?, Lookup::Found(_)));

    Ok(())
}

/// Overwritten versions are garbage-collected by compaction: only the
/// newest version of a key remains in the tables afterwards.
#[test]
fn old_versions_are_collected() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    for round in 0..5u32 {
        db.put(b"hot", format!("v{round}"))?;
        db.flush_memtable()?;
    }

    db.major_compact()?;

    let versions: Vec<_> = db
        .dump_table_entries()?
        .into_iter()
        .filter(|(_, k, _, _)| k == b"hot")
        .collect();

    assert_eq!(1, versions.len(), "{versions:?}");
    assert!(matches!(db.get(b"hot")?, Lookup::Found(v) if &*v == b"v4"));

    Ok(())
}
