//! Integration tests for Kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn kiln() -> Command {
        cargo_bin_cmd!("kiln")
    }

    #[test]
    fn help_displays() {
        kiln()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("dependency fetcher"));
    }

    #[test]
    fn version_displays() {
        kiln()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn config_path() {
        kiln()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        kiln()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"));
    }

    #[test]
    fn config_init_then_show_roundtrips() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");

        kiln()
            .args(["--config", config.to_str().unwrap(), "config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized"));

        // A second init without --force leaves the file alone.
        kiln()
            .args(["--config", config.to_str().unwrap(), "config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        kiln()
            .args(["--config", config.to_str().unwrap(), "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("size_mb"));
    }

    #[test]
    fn cache_stats_on_empty_cache() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(
            &config,
            format!(
                "[cache]\ndir = \"{}\"\nsize_mb = 16\n",
                dir.path().join("cache").display()
            ),
        )
        .unwrap();

        kiln()
            .args(["--config", config.to_str().unwrap(), "cache", "stats"])
            .assert()
            .success()
            .stdout(predicate::str::contains("entries"))
            .stdout(predicate::str::contains("16.0 MiB"));
    }

    #[test]
    fn cache_path_prints_configured_dir() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(&config, "[cache]\ndir = \"/tmp/kiln-cache-test\"\n").unwrap();

        kiln()
            .args(["--config", config.to_str().unwrap(), "cache", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("/tmp/kiln-cache-test"));
    }

    #[test]
    fn resolve_missing_job_file_fails() {
        kiln()
            .args(["resolve", "/nonexistent/job.toml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn resolve_without_server_fails_with_hint() {
        let dir = TempDir::new().unwrap();
        let job = dir.path().join("job.toml");
        std::fs::write(
            &job,
            r#"
            project = "home:alice"
            repository = "standard"
            package = "widget"
            arch = "x86_64"
            "#,
        )
        .unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(&config, "").unwrap();

        kiln()
            .args([
                "--config",
                config.to_str().unwrap(),
                "resolve",
                job.to_str().unwrap(),
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("no repository server"));
    }

    #[test]
    fn resolve_rejects_malformed_job() {
        let dir = TempDir::new().unwrap();
        let job = dir.path().join("job.toml");
        std::fs::write(&job, "project = [not, valid, toml").unwrap();

        kiln()
            .args(["resolve", job.to_str().unwrap()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }
}
