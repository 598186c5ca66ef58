use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;
use log::{info, warn};

use crate::batch::Batch;
use crate::config::Config;
use crate::dbi::{DbiDecl, DbiDescriptor, DbiRegistry};
use crate::engine::Environment;
use crate::error::{Error, MdbError, Result};
use crate::lifecycle::{init_environment, shutdown_environment};
use crate::policy::ErrorPolicy;

lazy_static! {
    /// Environment paths held by a live store in this process
    static ref OPEN_PATHS: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

/// Absolute, symlink-free form of `path`.
///
/// A `NOSUBDIR` data file may not exist before the first open, so its
/// directory is resolved instead and the file name joined back on.
fn registry_key(path: &Path) -> PathBuf {
    let absolute = match std::env::current_dir() {
        Ok(cwd) if path.is_relative() => cwd.join(path),
        _ => path.to_path_buf(),
    };
    if let Ok(canonical) = absolute.canonicalize() {
        return canonical;
    }
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|dir| dir.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

fn claim(key: &Path) -> Result<()> {
    let mut paths = OPEN_PATHS.lock().unwrap_or_else(PoisonError::into_inner);
    if !paths.insert(key.to_path_buf()) {
        return Err(Error::AlreadyInitialized(key.to_path_buf()));
    }
    Ok(())
}

fn release(key: &Path) {
    OPEN_PATHS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(key);
}

/// Storage usage reported by [`Store::metrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    /// Bytes in use up to the last used page
    pub used_bytes: u64,
    /// Current map size
    pub map_size: u64,
    pub page_size: u32,
}

/// An open storage environment with its declared sub-databases.
///
/// Only one store may be open per environment path in a process. The
/// environment is shut down by [`Store::shutdown`] or on drop.
#[derive(Debug)]
pub struct Store {
    env: Option<Environment>,
    dbis: DbiRegistry,
    config: Config,
    /// Key of this store in the open path registry
    path: PathBuf,
}

impl Store {
    /// Open a store with the default configuration.
    pub fn open<P: AsRef<Path>>(path: P, mode: u32, decls: &[DbiDecl]) -> Result<Store> {
        Self::open_with(Config::default(), path, mode, decls)
    }

    /// Open the environment at `path` and every declared sub-database.
    ///
    /// Nothing stays open when this fails.
    pub fn open_with<P: AsRef<Path>>(
        config: Config,
        path: P,
        mode: u32,
        decls: &[DbiDecl],
    ) -> Result<Store> {
        let path = path.as_ref();
        let key = registry_key(path);
        claim(&key)?;

        match Self::init(&config, path, mode, decls) {
            Ok((env, dbis)) => {
                info!("store open at {} with {} sub-databases", path.display(), dbis.len());
                Ok(Store {
                    env: Some(env),
                    dbis,
                    config,
                    path: key,
                })
            }
            Err(err) => {
                release(&key);
                Err(err)
            }
        }
    }

    fn init(
        config: &Config,
        path: &Path,
        mode: u32,
        decls: &[DbiDecl],
    ) -> Result<(Environment, DbiRegistry)> {
        let env = init_environment(path, mode, config)?;
        let dbis = {
            let policy = ErrorPolicy::new(&env, config.map_size_max);
            DbiRegistry::open(&env, &policy, decls, &config.retry)
        };
        match dbis {
            Ok(dbis) => Ok((env, dbis)),
            Err(err) => {
                warn!("sub-database setup failed, tearing down: {}", err);
                shutdown_environment(env, &DbiRegistry::default());
                Err(err)
            }
        }
    }

    /// Start a new batch against this store.
    pub fn batch<'a>(&self) -> Batch<'_, 'a> {
        Batch::new(self.env.as_ref(), &self.dbis, &self.config)
    }

    /// Shut the store down and return the final map size.
    ///
    /// Returns 0 when already shut down.
    pub fn shutdown(&mut self) -> usize {
        let Some(env) = self.env.take() else {
            return 0;
        };
        let map_size = shutdown_environment(env, &self.dbis);
        self.dbis.clear();
        release(&self.path);
        map_size
    }

    /// Storage usage, queried from the engine.
    pub fn metrics(&self) -> Result<Metrics> {
        let env = self.env()?;
        let info = env.info().map_err(|status| self.engine_error(env, status))?;
        let stat = env.stat().map_err(|status| self.engine_error(env, status))?;
        Ok(Metrics {
            used_bytes: (info.last_pgno as u64 + 1) * stat.psize as u64,
            map_size: info.map_size as u64,
            page_size: stat.psize,
        })
    }

    fn engine_error(&self, env: &Environment, status: MdbError) -> Error {
        ErrorPolicy::new(env, self.config.map_size_max)
            .evaluate(Some(status), None)
            .into_error()
    }

    /// Descriptor of the sub-database declared at `index`
    pub fn dbi(&self, index: usize) -> Result<&DbiDescriptor> {
        self.env()?;
        self.dbis.get(index)
    }

    /// The engine environment
    pub fn env(&self) -> Result<&Environment> {
        self.env.as_ref().ok_or(Error::NotInitialized)
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.env.is_some()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.shutdown();
    }
}
