use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use cascade_rs::config::ShardConfig;

const DEFAULT_STORAGE_PATH: &str = "storage/cascadedb";
pub const DEFAULT_PROMPT: &str = "cascli";

/// CLI-side configuration: where the local shard lives plus presentation
/// preferences. Shard tuning fields pass through to [`ShardConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    version: u8,

    /// Where the local shard keeps its log, default '${pwd}/storage/cascadedb'.
    storage_path: Option<PathBuf>,

    /// prompt
    pub prompt: Option<String>,

    /// Show stats after executing queries.
    pub show_stats: Option<bool>,

    /// Serve reads in stable mode unless the query says otherwise.
    pub stable_reads: Option<bool>,

    /// The embedded shard's own tuning knobs.
    shard: Option<ShardConfig>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            version: 0,
            storage_path: None,
            prompt: Some(DEFAULT_PROMPT.to_string()),
            show_stats: Some(false),
            stable_reads: Some(false),
            shard: Some(ShardConfig::default()),
        }
    }
}

impl ConfigLoad {
    /// Loads the configuration file, falling back to defaults when absent.
    pub fn new(path: &str) -> anyhow::Result<Self> {
        Ok(confy::load_path(path)?)
    }

    pub fn get_storage_path(&self) -> PathBuf {
        match self.storage_path.as_ref() {
            None => PathBuf::from(DEFAULT_STORAGE_PATH),
            Some(path) => path.clone(),
        }
    }

    pub fn is_show_stats(&self) -> bool {
        self.show_stats.unwrap_or(false)
    }

    pub fn is_stable_reads(&self) -> bool {
        self.stable_reads.unwrap_or(false)
    }

    pub fn get_prompt(&self) -> String {
        match self.prompt.as_ref() {
            None => DEFAULT_PROMPT.to_string(),
            Some(prompt) => prompt.trim_end().to_string(),
        }
    }

    /// The shard configuration with the CLI's storage path applied.
    pub fn to_shard_config(&self) -> ShardConfig {
        let mut shard = self.shard.clone().unwrap_or_default();
        shard.set_data_dir(self.get_storage_path());
        shard
    }

    /// change cmd: show_stats、stable_reads, and any shard setting.
    pub fn inject_cmd(&mut self, cmd_name: &str, cmd_value: &str) -> anyhow::Result<()> {
        match cmd_name {
            "show_stats" => self.show_stats = Some(cmd_value.parse()?),
            "stable_reads" => self.stable_reads = Some(cmd_value.parse()?),
            name => {
                let mut shard = self.shard.clone().unwrap_or_default();
                shard
                    .inject_cmd(name, cmd_value)
                    .map_err(|err| anyhow::anyhow!("{}", err))?;
                self.shard = Some(shard);
            }
        }
        Ok(())
    }

    pub fn terminal_update(&mut self) {
        self.show_stats = Some(true);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ConfigLoad::default();
        assert_eq!(cfg.get_storage_path(), PathBuf::from(DEFAULT_STORAGE_PATH));
        assert_eq!(cfg.get_prompt(), "cascli");
        assert!(!cfg.is_show_stats());
        assert!(!cfg.is_stable_reads());
    }

    #[test]
    fn shard_settings_pass_through() {
        let mut cfg = ConfigLoad::default();
        cfg.inject_cmd("stable_reads", "true").unwrap();
        cfg.inject_cmd("stable_wait_timeout_ms", "123").unwrap();
        assert!(cfg.is_stable_reads());
        assert_eq!(
            cfg.to_shard_config().get_stable_wait_timeout(),
            std::time::Duration::from_millis(123)
        );
        assert!(cfg.inject_cmd("bogus", "1").is_err());
    }
}
