//! CLI command implementations

pub mod add;
pub mod config;
pub mod delete;
pub mod run;
pub mod status;
pub mod tick;

use crate::system_config::SystemConfig;
use crate::util;
use anyhow::Result;
use std::path::PathBuf;

/// Options shared by every command
#[derive(Debug, Clone, Default)]
pub struct Globals {
    pub config: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

impl Globals {
    pub fn load(&self) -> Result<SystemConfig> {
        util::load_config(self.config.as_deref(), self.data_dir.as_deref())
    }
}
