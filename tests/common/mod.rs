//! Shared test infrastructure for integration tests.
//!
//! Each test gets a sandbox with a package tree and a fake client script that
//! logs its arguments and answers with canned JSON.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const FAKE_CLIENT: &str = r#"
echo "$*" >> "$CHAINBOOT_FAKE_LOG"
case "$*" in
  publish*)
    if [ -n "$CHAINBOOT_FAKE_FAIL_PUBLISH" ]; then
      echo "publish rejected: insufficient gas"
      exit 1
    fi
    printf '%s' '{"events":[{"packageId":"0xfeed","parsedJson":{"db":"0xdb1","manager_badge":"0xmgr"}}]}'
    ;;
  *register_node_entry*)
    printf '%s' '{"events":[{"parsedJson":{"badge_id":"0xbadge","node_small_id":{"inner":4}}}]}'
    ;;
  *create_task_entry*)
    printf '%s' '{"events":[{"parsedJson":{"task_small_id":{"inner":11}}}]}'
    ;;
  *)
    printf '%s' '{}'
    ;;
esac
"#;

pub struct Sandbox {
    pub dir: TempDir,
}

impl Sandbox {
    /// Sandbox with `sui/packages/atoma` and a published-looking manifest.
    pub fn new() -> anyhow::Result<Self> {
        let dir = TempDir::new()?;
        let package = dir.path().join("sui/packages/atoma");
        std::fs::create_dir_all(&package)?;
        std::fs::write(
            package.join("Move.toml"),
            "[package]\nname = \"atoma\"\npublished-at = \"0xold\"\n\n[addresses]\natoma = \"0xold\"\n",
        )?;
        std::fs::write(dir.path().join("fake-client.sh"), FAKE_CLIENT)?;
        Ok(Self { dir })
    }

    /// Sandbox without any package sources.
    pub fn empty() -> anyhow::Result<Self> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("fake-client.sh"), FAKE_CLIENT)?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn package_dir(&self) -> PathBuf {
        self.root().join("sui/packages/atoma")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root().join("client.log")
    }

    /// Client argument lines recorded so far, one per call.
    pub fn logged_calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.log_path())
            .map(|text| text.lines().map(String::from).collect())
            .unwrap_or_default()
    }

    fn client_command(&self) -> String {
        let script = self.root().join("fake-client.sh").display().to_string();
        shell_words::join(["sh", script.as_str()])
    }

    /// Run the built binary inside the sandbox.
    pub fn chainboot(&self, args: &[&str], envs: &[(&str, &str)]) -> anyhow::Result<Output> {
        let mut command = Command::new(env!("CARGO_BIN_EXE_chainboot"));
        command
            .args(args)
            .current_dir(self.root())
            .env("CHAINBOOT_FAKE_LOG", self.log_path())
            .env("CHAINBOOT_CLIENT", self.client_command())
            .env("RUST_LOG", "warn")
            .env_remove("CHAINBOOT_FAKE_FAIL_PUBLISH");
        for (key, value) in envs {
            command.env(key, value);
        }
        Ok(command.output()?)
    }
}
