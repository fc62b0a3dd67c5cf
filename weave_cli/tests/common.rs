#![allow(dead_code)]

use std::path::Path;
use std::path::PathBuf;

use assert_cmd::Command;
use insta_cmd::get_cargo_bin;

pub const MAIN_C: &str = "#include <stdio.h>\n\nint main(void) {\n    // TC001 STEP1 open\n    return 1;\n}\n";

pub const REPOSITORY: &str = "TC001:\n  STEP1:\n    open: |\n      return 0;\n";

pub fn weave_cmd() -> Command {
	let mut cmd = Command::new(get_cargo_bin("weave"));
	cmd.env("NO_COLOR", "1");
	cmd.env_remove("WEAVE_LOG");
	cmd
}

/// Create `<tmp>/src` holding `files` and return it. Runs write their output
/// next to the root, so tests keep the root one level below the tempdir.
pub fn source_root(tmp: &Path, files: &[(&str, &str)]) -> std::io::Result<PathBuf> {
	let root = tmp.join("src");
	for (relative, contents) in files {
		let path = root.join(relative);
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		std::fs::write(path, contents)?;
	}
	std::fs::create_dir_all(&root)?;
	Ok(root)
}

/// Directory entries of `dir` whose names start with `prefix`, sorted.
pub fn entries_starting_with(dir: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
	let mut entries = Vec::new();
	for entry in std::fs::read_dir(dir)? {
		let entry = entry?;
		if entry.file_name().to_string_lossy().starts_with(prefix) {
			entries.push(entry.path());
		}
	}
	entries.sort();
	Ok(entries)
}
