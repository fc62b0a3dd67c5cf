mod common;

use weave_core::AnyEmptyResult;
use weave_core::FragmentRepository;
use weave_core::WeaveConfig;

#[test]
fn can_init() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	let mut cmd = common::weave_cmd();
	let assert = cmd
		.arg("init")
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.success();
	assert
		.stdout(predicates::str::contains("Created weave.toml"))
		.stdout(predicates::str::contains("Created repository"))
		.stdout(predicates::str::contains("Next steps"));

	let config = std::fs::read_to_string(tmp.path().join("weave.toml"))?;
	let parsed = WeaveConfig::parse(&config)?;
	assert_eq!(
		parsed.repository_path(tmp.path()),
		tmp.path().join("stubs.yaml")
	);

	let stubs = std::fs::read_to_string(tmp.path().join("stubs.yaml"))?;
	let repository = FragmentRepository::from_yaml(&stubs, "stubs.yaml")?;
	assert!(repository.get("TC001", "STEP1", "open").is_some());

	Ok(())
}

#[test]
fn init_does_not_overwrite() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	let config_path = tmp.path().join("weave.toml");
	std::fs::write(&config_path, "existing config")?;
	let stubs_path = tmp.path().join("stubs.yaml");
	std::fs::write(&stubs_path, "existing: {}\n")?;

	let mut cmd = common::weave_cmd();
	cmd.arg("init")
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.success()
		.stdout(predicates::str::contains("already exists"));

	assert_eq!(std::fs::read_to_string(&config_path)?, "existing config");
	assert_eq!(std::fs::read_to_string(&stubs_path)?, "existing: {}\n");

	Ok(())
}

#[test]
fn missing_subcommand_exits_with_usage_hint() -> AnyEmptyResult {
	let mut cmd = common::weave_cmd();
	cmd.assert()
		.code(2)
		.stderr(predicates::str::contains("weave --help"));

	Ok(())
}
