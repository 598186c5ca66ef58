use lumokv::constants::{CORE_DBS, PAGE_SIZE};
use lumokv::dbi::default_put_flags;
use lumokv::{
    Config, DbFlags, DbiDecl, DbiType, Error, ErrorKind, MdbError, RetryBudgets, Store,
    TransactionFlags, WriteFlags, DEFAULT_ENV_MODE,
};
use tempfile::TempDir;

fn declarations() -> Vec<DbiDecl> {
    vec![
        DbiDecl::new("plain", DbiType::empty()),
        DbiDecl::new("unique", DbiType::NOOVERWRITE),
        DbiDecl::new("sorted", DbiType::DUPSORT),
        DbiDecl::new("fixed", DbiType::DUPSORT | DbiType::DUPFIXED),
        DbiDecl::new("log", DbiType::APPENDABLE),
        DbiDecl::new("dup_log", DbiType::DUPSORT | DbiType::APPENDABLE | DbiType::NOOVERWRITE),
    ]
}

#[test]
fn test_descriptors_follow_declarations() {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(temp_dir.path(), DEFAULT_ENV_MODE, &declarations()).unwrap();

    for (index, decl) in declarations().iter().enumerate() {
        let dbi = store.dbi(index).unwrap();
        assert_eq!(dbi.name, decl.name);
        assert_eq!(dbi.kind, decl.kind);
        assert_eq!(dbi.handle, CORE_DBS + index as u32);
    }
    assert!(matches!(store.dbi(6), Err(Error::InvalidArgument(_))));

    let plain = store.dbi(0).unwrap();
    assert_eq!(plain.put_flags, WriteFlags::empty());
    assert!(!plain.dupsort);

    assert_eq!(store.dbi(1).unwrap().put_flags, WriteFlags::NOOVERWRITE);

    let sorted = store.dbi(2).unwrap();
    assert_eq!(sorted.db_flags, DbFlags::DUPSORT);
    assert!(sorted.dupsort);
    assert!(!sorted.dupfixed);

    let fixed = store.dbi(3).unwrap();
    assert_eq!(fixed.db_flags, DbFlags::DUPSORT | DbFlags::DUPFIXED);
    assert!(fixed.dupsort && fixed.dupfixed);

    assert_eq!(store.dbi(4).unwrap().put_flags, WriteFlags::APPEND);
    assert_eq!(
        store.dbi(5).unwrap().put_flags,
        WriteFlags::APPENDDUP | WriteFlags::NOOVERWRITE
    );
}

#[test]
fn test_default_put_flags() {
    assert_eq!(default_put_flags(DbiType::empty(), DbFlags::empty()), WriteFlags::empty());
    assert_eq!(
        default_put_flags(DbiType::NOOVERWRITE, DbFlags::DUPSORT),
        WriteFlags::NOOVERWRITE
    );
    assert_eq!(default_put_flags(DbiType::APPENDABLE, DbFlags::empty()), WriteFlags::APPEND);
    assert_eq!(
        default_put_flags(DbiType::APPENDABLE, DbFlags::DUPSORT),
        WriteFlags::APPENDDUP
    );
}

#[test]
fn test_appendable_rejects_out_of_order_keys() {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(temp_dir.path(), DEFAULT_ENV_MODE, &declarations()).unwrap();
    let mut batch = store.batch();

    batch.put(4, b"0001", b"first").unwrap();
    batch.put(4, b"0002", b"second").unwrap();
    batch.execute().unwrap();

    batch.put(4, b"0000", b"late").unwrap();
    assert!(matches!(batch.execute(), Err(Error::Conflict)));

    batch.put(4, b"0003", b"third").unwrap();
    batch.execute().unwrap();
}

#[test]
fn test_registry_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let decls = declarations();
    {
        let store = Store::open(temp_dir.path(), DEFAULT_ENV_MODE, &decls).unwrap();
        let mut batch = store.batch();
        batch.put(2, b"tag", b"a").unwrap();
        batch.put(2, b"tag", b"b").unwrap();
        batch.execute().unwrap();
    }

    let store = Store::open(temp_dir.path(), DEFAULT_ENV_MODE, &decls).unwrap();
    assert_eq!(store.dbi(2).unwrap().handle, CORE_DBS + 2);
    assert!(store.dbi(2).unwrap().dupsort);

    let env = store.env().unwrap();
    assert_eq!(env.stat().unwrap().databases, decls.len());
    let txn = env.begin_txn(TransactionFlags::RDONLY).unwrap();
    assert_eq!(txn.get(store.dbi(2).unwrap().handle, b"tag").unwrap(), b"a");
}

#[test]
fn test_declaration_order_defines_handles_on_fresh_store() {
    let temp_dir = TempDir::new().unwrap();
    let decls = vec![
        DbiDecl::new("second", DbiType::empty()),
        DbiDecl::new("first", DbiType::empty()),
    ];
    let store = Store::open(temp_dir.path(), DEFAULT_ENV_MODE, &decls).unwrap();
    assert_eq!(store.dbi(0).unwrap().handle, CORE_DBS);
    assert_eq!(store.dbi(1).unwrap().handle, CORE_DBS + 1);
}

#[test]
fn test_incompatible_redeclaration_fails() {
    let temp_dir = TempDir::new().unwrap();
    drop(
        Store::open(
            temp_dir.path(),
            DEFAULT_ENV_MODE,
            &[DbiDecl::new("tags", DbiType::DUPSORT)],
        )
        .unwrap(),
    );

    let err = Store::open(
        temp_dir.path(),
        DEFAULT_ENV_MODE,
        &[DbiDecl::new("tags", DbiType::empty())],
    )
    .unwrap_err();
    assert!(matches!(err, Error::Engine(lumokv::MdbError::Incompatible)));
    assert_eq!(err.errno(), -libc::EPROTO);
}

fn two_declarations() -> Vec<DbiDecl> {
    vec![
        DbiDecl::new("first", DbiType::empty()),
        DbiDecl::new("second", DbiType::DUPSORT),
    ]
}

#[test]
fn test_registry_restarts_after_map_growth() {
    let temp_dir = TempDir::new().unwrap();
    // No room past the meta pages: the first create hits MapFull
    let config = Config::default()
        .with_map_size(2 * PAGE_SIZE)
        .with_map_size_max(16 * PAGE_SIZE);
    let store = Store::open_with(config, temp_dir.path(), DEFAULT_ENV_MODE, &two_declarations())
        .unwrap();

    assert_eq!(store.metrics().unwrap().map_size, 4 * PAGE_SIZE as u64);
    assert_eq!(store.dbi(0).unwrap().handle, CORE_DBS);
    assert_eq!(store.dbi(1).unwrap().handle, CORE_DBS + 1);
    assert!(store.dbi(1).unwrap().dupsort);

    // Handles from the restarted transaction are usable
    let mut batch = store.batch();
    batch.put(1, b"k", b"v").unwrap();
    batch.execute().unwrap();
}

#[test]
fn test_registry_without_open_retries_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::default()
        .with_map_size(2 * PAGE_SIZE)
        .with_map_size_max(16 * PAGE_SIZE)
        .with_retry(RetryBudgets {
            dbi_open: 0,
            ..RetryBudgets::default()
        });
    let err = Store::open_with(config, temp_dir.path(), DEFAULT_ENV_MODE, &two_declarations())
        .unwrap_err();
    assert!(matches!(err, Error::Exhausted(MdbError::MapFull)));
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(err.errno(), -libc::ENOSPC);

    // Nothing stays open after the failure
    let store = Store::open(temp_dir.path(), DEFAULT_ENV_MODE, &two_declarations()).unwrap();
    assert_eq!(store.dbi(1).unwrap().handle, CORE_DBS + 1);
}
