use std::path::Path;

use assert_cmd::Command;
use insta_cmd::get_cargo_bin;

pub fn mdck_cmd() -> Command {
	let mut cmd = Command::new(get_cargo_bin("mdck"));
	cmd.env("NO_COLOR", "1");
	cmd.env_remove("MDCK_LOG");
	cmd
}

/// Write `content` to `name` below `root`, creating parent directories.
#[allow(dead_code)]
pub fn write(root: &Path, name: &str, content: &str) -> std::io::Result<()> {
	let path = root.join(name);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(path, content)
}
