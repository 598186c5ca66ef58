use std::path::Path;

use log::{error, info, warn};

use crate::config::Config;
use crate::dbi::DbiRegistry;
use crate::engine::Environment;
use crate::error::{Error, MdbError, Result};
use crate::policy::{errno_for, ErrorPolicy};

/// Failure during setup. Setup is never retried, so every verdict is terminal.
fn terminal(env: &Environment, config: &Config, step: &str, status: MdbError) -> Error {
    let verdict = ErrorPolicy::new(env, config.map_size_max).evaluate(Some(status), None);
    error!("{} failed: {} (errno {})", step, status, verdict.errno);
    verdict.into_error()
}

/// Failure before any environment exists to bind a policy to. There is no
/// transaction to abort and no map to grow, so only the errno table applies.
fn unmanaged(step: &str, status: MdbError) -> Error {
    error!("{} failed: {} (errno {})", step, status, errno_for(status));
    Error::from(status)
}

/// Create and open the environment at `path`.
///
/// On failure the partially set up environment is closed before returning.
pub fn init_environment(path: &Path, mode: u32, config: &Config) -> Result<Environment> {
    config.validate()?;
    if config.max_dbs == 0 {
        return Err(Error::InvalidArgument("max sub-databases cannot be zero"));
    }

    let mut env =
        Environment::create().map_err(|status| unmanaged("environment create", status))?;

    if let Err(status) = env.set_max_dbs(config.max_dbs) {
        return Err(terminal(&env, config, "set max dbs", status));
    }
    if let Err(status) = env.set_max_readers(config.max_readers) {
        return Err(terminal(&env, config, "set max readers", status));
    }
    if let Err(status) = env.set_map_size(config.map_size) {
        return Err(terminal(&env, config, "set map size", status));
    }
    if let Err(status) = env.open(path, config.env_flags, mode) {
        return Err(terminal(&env, config, "environment open", status));
    }

    info!(
        "map size: initial={} bytes, max={} bytes",
        env.map_size(),
        config.map_size_max
    );
    Ok(env)
}

/// Close every DBI handle and the environment.
///
/// Returns the final map size, or 0 when it could not be queried.
pub fn shutdown_environment(mut env: Environment, dbis: &DbiRegistry) -> usize {
    let map_size = match env.info() {
        Ok(info) => info.map_size,
        Err(err) => {
            warn!("map size query during shutdown failed: {}", err);
            0
        }
    };
    for dbi in dbis.iter() {
        env.dbi_close(dbi.handle);
    }
    env.close();
    info!("environment shut down (map size {} bytes)", map_size);
    map_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmanaged_failure_keeps_policy_errno() {
        for status in [
            MdbError::Panic,
            MdbError::MapFull,
            MdbError::NotFound,
            MdbError::Other(libc::ENOMEM),
        ] {
            let err = unmanaged("environment create", status);
            assert_eq!(err.errno(), errno_for(status));
        }
        assert!(matches!(
            unmanaged("environment create", MdbError::Panic),
            Error::Engine(MdbError::Panic)
        ));
    }
}
