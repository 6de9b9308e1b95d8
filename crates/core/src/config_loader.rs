use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from `config/Config.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load() -> Result<AppConfig> {
        Self::load_from("config/Config.toml")
    }

    /// Loads configuration by layering defaults, a TOML file and `TRADE_ENGINE_*`
    /// environment variables (nested keys separated by `__`).
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file or a variable cannot be parsed, or
    /// if the merged values fail [`AppConfig::validate`].
    pub fn load_from(path: impl AsRef<Path>) -> Result<AppConfig> {
        let path = path.as_ref();
        let config: AppConfig = Self::figment(path).extract()?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TRADE_ENGINE_").split("__"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ConfigLoader::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.ticks.channel_prefix, "ticks");
        assert_eq!(config.executor.snapshot_interval_ticks, 500);
    }

    #[test]
    fn toml_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "engine.toml",
                r#"
                [lifecycle]
                stale_after_secs = 45

                [ticks]
                instruments = ["EUR_USD", "USD_JPY"]
                "#,
            )?;
            jail.set_env("TRADE_ENGINE_TICKS__FLUSH_BATCH_SIZE", "50");

            let config = ConfigLoader::load_from("engine.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.lifecycle.stale_after_secs, 45);
            assert_eq!(config.lifecycle.heartbeat_interval_secs, 5);
            assert_eq!(config.ticks.instruments.len(), 2);
            assert_eq!(config.ticks.flush_batch_size, 50);
            Ok(())
        });
    }

    #[test]
    fn zero_keepalive_is_rejected_at_load() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "engine.toml",
                r#"
                [ticks]
                keepalive_interval_secs = 0
                "#,
            )?;

            let err = ConfigLoader::load_from("engine.toml").unwrap_err();
            assert!(format!("{err:#}").contains("ticks.keepalive_interval_secs"));
            Ok(())
        });
    }

    #[test]
    fn zero_flush_interval_from_env_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("TRADE_ENGINE_TICKS__FLUSH_INTERVAL_SECS", "0");
            assert!(ConfigLoader::load_from("engine.toml").is_err());
            Ok(())
        });
    }
}
