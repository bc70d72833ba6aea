//! Environment-variable plumbing: knob overrides and the tracing
//! subscriber both daemons install at startup.

use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

use tracing_subscriber::{
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Read an override for a knob from the environment, falling back to the
/// default on absence or a malformed value. Misconfiguration is never
/// fatal here; the default is.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let raw = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}");
            return default;
        },
    };
    match T::from_str(&raw) {
        Ok(value) => {
            tracing::info!("Overriding {name} to {value:?} from environment");
            value
        },
        Err(e) => {
            tracing::warn!("Invalid value {raw} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Install the global tracing subscriber: terse fmt output filtered by
/// `RUST_LOG`, defaulting to `info`.
pub fn config_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[cfg(test)]
mod tests {
    use super::env_config;

    #[test]
    fn test_env_config_defaults() {
        assert_eq!(env_config("DEFINITELY_NOT_SET_ANYWHERE", 42usize), 42);
    }

    #[test]
    fn test_env_config_parses_override() {
        // Unsafe on edition 2024; the test runs single-threaded over this var.
        unsafe { std::env::set_var("ENV_CONFIG_TEST_KNOB", "7") };
        assert_eq!(env_config("ENV_CONFIG_TEST_KNOB", 42usize), 7);
        unsafe { std::env::remove_var("ENV_CONFIG_TEST_KNOB") };
    }

    #[test]
    fn test_env_config_rejects_garbage() {
        unsafe { std::env::set_var("ENV_CONFIG_TEST_BAD_KNOB", "not-a-number") };
        assert_eq!(env_config("ENV_CONFIG_TEST_BAD_KNOB", 42usize), 42);
        unsafe { std::env::remove_var("ENV_CONFIG_TEST_BAD_KNOB") };
    }
}
