use silt::{Config, Lookup};
use test_log::test;

#[test]
fn reopen_replays_journal() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = Config::new(&folder).open()?;
        for i in 0..100u32 {
            db.put(format!("k_{i:03}"), format!("v_{i}"))?;
        }
        // Dropped without any flush: everything lives in the journal
    }

    let db = Config::new(&folder).open()?;
    for i in 0..100u32 {
        match db.get(format!("k_{i:03}"))? {
            Lookup::Found(value) => assert_eq!(format!("v_{i}").as_bytes(), &*value),
            other => panic!("k_{i:03} should be found, got {other:?}"),
        }
    }

    Ok(())
}

#[test]
fn reopen_preserves_deletes_and_overwrites() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = Config::new(&folder).open()?;
        db.put(b"kept", b"v1")?;
        db.put(b"overwritten", b"old")?;
        db.put(b"overwritten", b"new")?;
        db.put(b"removed", b"v")?;
        db.delete(b"removed")?;
    }

    let db = Config::new(&folder).open()?;
    assert!(matches!(db.get(b"kept")?, Lookup::Found(v) if &*v == b"v1"));
    assert!(matches!(db.get(b"overwritten")?, Lookup::Found(v) if &*v == b"new"));
    assert_eq!(Lookup::Deleted, db.get(b"removed")?);
    assert_eq!(Lookup::NotFound, db.get(b"never")?);

    Ok(())
}

#[test]
fn reopen_after_flush_reads_from_tables() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = Config::new(&folder).open()?;
        for i in 0..50u32 {
            db.put(format!("t{i:02}"), format!("v{i}"))?;
        }
        db.flush_memtable()?;

        // Journal-only writes on top of the flushed state
        db.put(b"t00", b"patched")?;
    }

    let db = Config::new(&folder).open()?;

    assert!(matches!(db.get(b"t00")?, Lookup::Found(v) if &*v == b"patched"));
    for i in 1..50u32 {
        assert!(
            matches!(db.get(format!("t{i:02}"))?, Lookup::Found(v) if *v == *format!("v{i}").as_bytes()),
            "t{i:02}"
        );
    }

    Ok(())
}

#[test]
fn sequence_numbers_keep_growing_across_reopens() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = Config::new(&folder).open()?;
        db.put(b"a", b"1")?;
    }
    {
        let db = Config::new(&folder).open()?;
        // This overwrite must win over the pre-reopen version
        db.put(b"a", b"2")?;
    }

    let db = Config::new(&folder).open()?;
    assert!(matches!(db.get(b"a")?, Lookup::Found(v) if &*v == b"2"));

    Ok(())
}

#[test]
fn many_reopen_cycles_accumulate_state() -> silt::Result<()> {
    let folder = tempfile::tempdir()?;

    for round in 0..5u32 {
        let db = Config::new(&folder).open()?;
        for i in 0..20u32 {
            db.put(format!("r{round}_{i:02}"), format!("{round}/{i}"))?;
        }

        // Every earlier round must still be fully visible
        for r in 0..=round {
            for i in 0..20u32 {
                assert!(
                    matches!(
                        db.get(format!("r{r}_{i:02}"))?,
                        Lookup::Found(v) if *v == *format!("{r}/{i}").as_bytes()
                    ),
                    "round {round}: r{r}_{i:02}"
                );
            }
        }
    }

    Ok(())
}
