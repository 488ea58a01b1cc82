//! External command-line tools (MRtrix3, FreeSurfer) and how they are invoked.
//!
//! Tool locations are resolved once, when the registry is built, and the
//! resolved paths are handed to every caller. A TOML file can pin individual
//! tools to explicit paths:
//!
//! ```toml
//! [tools]
//! 5ttgen = "/opt/mrtrix3/bin/5ttgen"
//! mri_vol2surf = "/usr/local/freesurfer/bin/mri_vol2surf"
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Every tool the anatomical collaborators may call.
pub const KNOWN_TOOLS: [&str; 7] = [
    "5ttgen",
    "5tt2gmwmi",
    "mri_vol2surf",
    "mri_label2vol",
    "mri_surf2vol",
    "transformconvert",
    "mrtransform",
];

#[derive(Debug, Default, Deserialize)]
struct ToolConfig {
    #[serde(default)]
    tools: BTreeMap<String, PathBuf>,
}

/// Logical tool name to executable path.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    paths: BTreeMap<String, PathBuf>,
}

impl ToolRegistry {
    /// Looks up every name on `PATH`, then applies overrides from `config`.
    /// Names that cannot be found are left out; asking for one later fails.
    pub fn resolve<S: AsRef<str>>(names: &[S], config: Option<&Path>) -> Result<Self> {
        let search_path = std::env::var_os("PATH").unwrap_or_default();
        let mut paths = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            if let Some(found) = find_on_path(name, &search_path) {
                debug!(tool = name, path = %found.display(), "resolved tool");
                paths.insert(name.to_string(), found);
            }
        }
        let mut registry = Self { paths };
        if let Some(config) = config {
            registry.apply_config(config)?;
        }
        Ok(registry)
    }

    /// Registry over [`KNOWN_TOOLS`].
    pub fn discover(config: Option<&Path>) -> Result<Self> {
        Self::resolve(&KNOWN_TOOLS, config)
    }

    fn apply_config(&mut self, config: &Path) -> Result<()> {
        if !config.exists() {
            return Err(Error::MissingInput {
                what: "Tool configuration",
                path: config.to_path_buf(),
            });
        }
        let parsed: ToolConfig = toml::from_str(&std::fs::read_to_string(config)?)?;
        for (name, path) in parsed.tools {
            if !path.is_file() {
                return Err(Error::MissingInput {
                    what: "Configured tool",
                    path,
                });
            }
            info!(tool = %name, path = %path.display(), "tool path set by configuration");
            self.paths.insert(name, path);
        }
        Ok(())
    }

    pub fn insert(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.paths.insert(name.into(), path.into());
    }

    pub fn get(&self, name: &str) -> Result<&Path> {
        self.paths
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))
    }

    /// Fails on the first of `names` that was not resolved.
    pub fn require(&self, names: &[&str]) -> Result<()> {
        names.iter().try_for_each(|name| self.get(name).map(|_| ()))
    }

    /// Starts building an invocation of a resolved tool.
    pub fn command(&self, name: &str) -> Result<Invocation> {
        Ok(Invocation {
            tool: name.to_string(),
            command: Command::new(self.get(name)?),
            outputs: Vec::new(),
        })
    }
}

fn find_on_path(name: &str, search_path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// One blocking call of an external tool, with the files it must produce.
#[derive(Debug)]
pub struct Invocation {
    tool: String,
    command: Command,
    outputs: Vec<PathBuf>,
}

impl Invocation {
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    /// Sets an environment variable for this child process only.
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        self.command.env(key, value);
        self
    }

    /// A file the tool must have written for the call to count as successful.
    pub fn output<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Runs the tool to completion.
    ///
    /// Fails when the tool cannot be started, exits non-zero, or leaves any
    /// declared output missing.
    pub fn run(mut self) -> Result<()> {
        let line: Vec<OsString> = std::iter::once(self.command.get_program().to_os_string())
            .chain(self.command.get_args().map(OsStr::to_os_string))
            .collect();
        info!(tool = %self.tool, command = ?line, "running external tool");
        let status = self.command.status()?;
        if !status.success() {
            return Err(Error::ToolFailed {
                tool: self.tool,
                status,
            });
        }
        if let Some(missing) = self.outputs.into_iter().find(|p| !p.exists()) {
            return Err(Error::MissingOutput {
                tool: self.tool,
                path: missing,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unknown_tool_is_reported_by_name() {
        let registry = ToolRegistry::default();
        match registry.get("5ttgen") {
            Err(Error::ToolNotFound(name)) => assert_eq!(name, "5ttgen"),
            other => panic!("expected ToolNotFound, got {:?}", other),
        }
        assert!(registry.require(&["5ttgen"]).is_err());
    }

    #[test]
    fn configuration_overrides_path() {
        let dir = tempdir().unwrap();
        let tool = dir.path().join("my-mrtransform");
        std::fs::write(&tool, "").unwrap();
        let config = dir.path().join("tools.toml");
        std::fs::write(
            &config,
            format!("[tools]\nmrtransform = \"{}\"\n", tool.display()),
        )
        .unwrap();
        let registry = ToolRegistry::resolve(&["definitely-not-a-real-tool"], Some(&config)).unwrap();
        assert_eq!(registry.get("mrtransform").unwrap(), tool.as_path());
        assert!(registry.get("definitely-not-a-real-tool").is_err());
    }

    #[test]
    fn configured_tool_must_exist() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("tools.toml");
        std::fs::write(&config, "[tools]\n5ttgen = \"/nonexistent/5ttgen\"\n").unwrap();
        assert!(matches!(
            ToolRegistry::resolve(&KNOWN_TOOLS, Some(&config)),
            Err(Error::MissingInput { .. })
        ));
    }

    #[test]
    fn malformed_configuration_is_rejected() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("tools.toml");
        std::fs::write(&config, "[tools\n").unwrap();
        assert!(matches!(
            ToolRegistry::resolve(&KNOWN_TOOLS, Some(&config)),
            Err(Error::ToolConfig(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn successful_tool_runs() {
        let registry = ToolRegistry::resolve(&["true"], None).unwrap();
        registry.command("true").unwrap().arg("ignored").run().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_reports_status() {
        let registry = ToolRegistry::resolve(&["false"], None).unwrap();
        match registry.command("false").unwrap().run() {
            Err(Error::ToolFailed { tool, status }) => {
                assert_eq!(tool, "false");
                assert!(!status.success());
            }
            other => panic!("expected ToolFailed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn missing_output_is_an_error() {
        let dir = tempdir().unwrap();
        let registry = ToolRegistry::resolve(&["true"], None).unwrap();
        let result = registry
            .command("true")
            .unwrap()
            .output(dir.path().join("never-written.nii.gz"))
            .run();
        assert!(matches!(result, Err(Error::MissingOutput { .. })));
    }
}
