use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use rocket::figment::providers::{Env, Format, Toml};
use rocket::figment::Figment;
use url::Url;

use crate::auth::{ApiToken, MutationPolicy};
use crate::broadcast::DEFAULT_SESSION_BUFFER;



pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";
pub const DEFAULT_CONFIG_FILE: &str = "/etc/camera-status-board/board.toml";

/// The `[<profile>.board]` table.
#[derive(Clone)]
#[derive(Debug)]
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
	/// YAML file mirroring the camera table. Memory only when unset.
	pub store_file: Option<PathBuf>,
	/// Origin the dashboard UI is served from.
	pub cors_origin: Option<Url>,
	/// Events queued per viewer before further events are dropped for it.
	pub session_buffer: usize,
	pub mutation_policy: MutationPolicy,
	pub api_tokens: Vec<ApiToken>,
}

impl Default for BoardConfig {
	fn default() -> Self {
		BoardConfig {
			store_file: None,
			cors_origin: None,
			session_buffer: DEFAULT_SESSION_BUFFER,
			mutation_policy: MutationPolicy::Open,
			api_tokens: Vec::new(),
		}
	}
}

impl BoardConfig {
	pub fn allowed_origin(&self) -> String {
		match &self.cors_origin {
			Some(url) => url.origin().ascii_serialization(),
			None => DEFAULT_CORS_ORIGIN.to_string(),
		}
	}

	pub fn validate(&self) -> anyhow::Result<()> {
		if self.session_buffer == 0 {
			bail!("board.session_buffer must be at least 1");
		}
		if let Some(url) = &self.cors_origin {
			if !url.origin().is_tuple() {
				bail!("board.cors_origin '{}' has no usable origin", url);
			}
		}
		if self.mutation_policy == MutationPolicy::Authenticated && self.api_tokens.is_empty() {
			bail!("board.mutation_policy is 'authenticated' but no board.api_tokens are configured");
		}
		if self.api_tokens.iter().any(|api_token| api_token.token.trim().is_empty()) {
			bail!("board.api_tokens entries need a non-empty token");
		}
		Ok(())
	}
}

/// Layers configuration sources: Rocket's own (`Rocket.toml`, `ROCKET_*`),
/// then TOML files given on the command line, then `BOARD_*` variables for
/// the board table.
pub struct ConfigManager {
	figment: Figment,
}

impl ConfigManager {
	pub fn new() -> ConfigManager {
		ConfigManager {
			figment: rocket::Config::figment(),
		}
	}

	pub fn read_config(&mut self, filenames: Vec<&str>) -> anyhow::Result<()> {
		for filename in filenames {
			let path = Path::new(filename);
			if !path.is_file() {
				bail!("config file {} does not exist", path.display());
			}
			self.merge_file(path);
		}
		Ok(())
	}

	pub fn read_default_config_files(&mut self) -> anyhow::Result<()> {
		let path = Path::new(DEFAULT_CONFIG_FILE);
		if path.is_file() {
			self.merge_file(path);
		}
		Ok(())
	}

	fn merge_file(&mut self, path: &Path) {
		self.figment = std::mem::take(&mut self.figment).merge(Toml::file(path).nested());
	}

	/// Figment to hand to `rocket::custom`.
	pub fn figment(&self) -> Figment {
		self.figment.clone()
	}

	pub fn board(&self) -> anyhow::Result<BoardConfig> {
		let board: BoardConfig = self.figment
			.focus("board")
			.merge(Env::prefixed("BOARD_").global())
			.extract()
			.context("invalid [board] configuration")?;
		board.validate()?;
		Ok(board)
	}
}

impl Default for ConfigManager {
	fn default() -> Self {
		ConfigManager::new()
	}
}
