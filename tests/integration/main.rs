//! Integration tests for Stevedore

mod cache_tests;
mod manager_tests;
mod parallel_tests;
mod storage_tests;
mod sync_tests;

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn stevedore() -> Command {
        cargo_bin_cmd!("stevedore")
    }

    /// Config file pointing every state dir into `temp`
    fn write_config(temp: &TempDir, cache_backend: &str) -> PathBuf {
        let path = temp.path().join("config.toml");
        let content = format!(
            "[cache]\nbackend = {:?}\ndir = {:?}\nlegacy_dir = {:?}\n\n[lock]\ndir = {:?}\n",
            cache_backend,
            temp.path().join("cache"),
            temp.path().join("legacy"),
            temp.path().join("locks"),
        );
        std::fs::write(&path, content).unwrap();
        path
    }

    fn cache_cmd(config: &Path) -> Command {
        let mut cmd = stevedore();
        cmd.arg("--config").arg(config).args(["cache", "--project", "demo"]);
        cmd
    }

    #[test]
    fn help_displays() {
        stevedore()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("stages storage"));
    }

    #[test]
    fn version_displays() {
        stevedore()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("stevedore"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp, "file");
        stevedore()
            .arg("--config")
            .arg(&config)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp, "file");
        stevedore()
            .arg("--config")
            .arg(&config)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]").and(predicate::str::contains("[cache]")));
    }

    #[test]
    fn config_init_keeps_existing_file() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("nested/config.toml");

        stevedore()
            .arg("--config")
            .arg(&config)
            .args(["config", "init"])
            .assert()
            .success();
        assert!(config.exists());

        stevedore()
            .arg("--config")
            .arg(&config)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn cache_get_missing_entry() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp, "file");
        cache_cmd(&config)
            .args(["get", "abc"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entry for abc"));
    }

    #[test]
    fn cache_get_and_delete_entry() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp, "file");
        let entry = temp.path().join("cache/demo/abc");
        std::fs::create_dir_all(entry.parent().unwrap()).unwrap();
        std::fs::write(
            &entry,
            r#"{"stages":[{"dependenciesDigest":"abc","uniqueID":1700000000000}]}"#,
        )
        .unwrap();

        cache_cmd(&config)
            .args(["get", "abc"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1700000000000").and(predicate::str::contains("Total: 1")));

        cache_cmd(&config)
            .args(["delete", "abc"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Deleted cache entry abc"));
        assert!(!entry.exists());
    }

    #[test]
    fn cache_unknown_backend_fails() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp, "etcd");
        cache_cmd(&config)
            .args(["get-all"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }
}
