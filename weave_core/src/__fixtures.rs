use std::path::Path;
use std::path::PathBuf;

use crate::Fragment;
use crate::FragmentKey;
use crate::FragmentRepository;
use crate::split_lines;

pub fn lines(text: &str) -> Vec<String> {
	split_lines(text)
}

pub fn repository(entries: &[(&str, &str, &str, &str)]) -> FragmentRepository {
	let mut repository = FragmentRepository::new();
	for (case_id, step_id, segment_id, text) in entries {
		repository.insert(
			FragmentKey::new(case_id, step_id, segment_id),
			Fragment::new(text),
		);
	}
	repository
}

/// Write `files` (relative path, contents) below `root`, creating parents.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
	for (relative, contents) in files {
		write_file(root, relative, contents);
	}
}

pub fn write_file(root: &Path, relative: &str, contents: impl AsRef<[u8]>) {
	let path = root.join(relative);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).unwrap_or_else(|e| panic!("create dir: {e}"));
	}
	std::fs::write(&path, contents).unwrap_or_else(|e| panic!("write {relative}: {e}"));
}

/// A `src` directory inside `tmp`, so run directories land inside `tmp`
/// as well.
pub fn source_root(tmp: &Path) -> PathBuf {
	let root = tmp.join("src");
	std::fs::create_dir_all(&root).unwrap_or_else(|e| panic!("create root: {e}"));
	root
}

/// Names of the entries directly inside `dir`, sorted.
pub fn entry_names(dir: &Path) -> Vec<String> {
	let mut names: Vec<String> = std::fs::read_dir(dir)
		.unwrap_or_else(|e| panic!("read dir: {e}"))
		.filter_map(Result::ok)
		.map(|entry| entry.file_name().to_string_lossy().into_owned())
		.collect();
	names.sort();
	names
}

pub fn read(path: &Path) -> String {
	std::fs::read_to_string(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

pub const MAIN_C: &str = "#include <stdio.h>\n\nint main(void) {\n    // TC001 STEP1 \
                          segment1\n    return 1;\n}\n";

pub const UTIL_H: &str = "#pragma once\n\nstatic void helper(void) {\n\t// TC001 STEP2 \
                          setup\n\t// TC002 STEP1 missing\n}\n";

pub const NONE_C: &str = "int untouched(void) { return 0; }\n";

pub fn sample_repository() -> FragmentRepository {
	repository(&[
		("TC001", "STEP1", "segment1", "return 0;\n"),
		("TC001", "STEP2", "setup", "int x = 1;\n\nx++;\n"),
	])
}

pub fn sample_tree(root: &Path) {
	write_tree(
		root,
		&[
			("main.c", MAIN_C),
			("lib/util.h", UTIL_H),
			("none.c", NONE_C),
			("notes.txt", "// TC001 STEP1 segment1\n"),
		],
	);
}
