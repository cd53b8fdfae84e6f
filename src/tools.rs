//! Wrappers around the external programs the patcher drives.
//!
//! Each tool call is synchronous and either returns the captured output or a
//! [`ToolError`]. The traits keep the pipeline independent of the concrete
//! programs so it can be exercised without an Android SDK.

use log::{debug, info};
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Programs the default toolchain expects on `PATH`.
pub const REQUIRED_TOOLS: [&str; 4] = ["apktool", "aapt", "keytool", "apksigner"];

pub type ToolResult<T> = Result<T, ToolError>;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("{program} {args:?} exited with {status}")]
    Failed {
        program: String,
        args: Vec<String>,
        status: String,
        /// Interleaved stdout and stderr of the failed run
        log: String,
    },
}

/// Unpacks a package into a directory of resources, manifest and smali files.
pub trait Decompiler {
    fn decode(&self, apk: &Path, out_dir: &Path, with_resources: bool) -> ToolResult<String>;
}

/// Assembles a decoded directory back into a package.
pub trait Rebuilder {
    fn build(&self, decoded_dir: &Path, out_apk: &Path) -> ToolResult<String>;
}

/// Signs a package in place.
pub trait Signer {
    fn sign(&self, apk: &Path) -> ToolResult<String>;
}

/* Wrapper around command for nicer error handling */
pub fn execute_command(program: &str, args: &[&str], show_output: bool) -> ToolResult<String> {
    debug!("Executing {} {:?}", program, args);
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ToolError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(&output.stderr));
    for line in log.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if show_output {
            info!("[{}] {}", program, line);
        } else {
            debug!("[{}] {}", program, line);
        }
    }

    if output.status.success() {
        Ok(log)
    } else {
        Err(ToolError::Failed {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            status: output.status.to_string(),
            log,
        })
    }
}

/// Looks `program` up on `PATH`.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// The subset of `tools` that cannot be found on `PATH`.
pub fn missing_tools(tools: &[&str]) -> Vec<String> {
    tools
        .iter()
        .filter(|t| find_in_path(t).is_none())
        .map(|t| t.to_string())
        .collect()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[derive(Debug, Clone)]
pub struct Apktool {
    pub program: String,
    pub show_output: bool,
}

impl Default for Apktool {
    fn default() -> Self {
        Apktool {
            program: "apktool".to_string(),
            show_output: false,
        }
    }
}

impl Decompiler for Apktool {
    fn decode(&self, apk: &Path, out_dir: &Path, with_resources: bool) -> ToolResult<String> {
        let (apk, out_dir) = (path_arg(apk), path_arg(out_dir));
        let mut args = vec!["d", "-f"];
        if !with_resources {
            args.push("-r");
        }
        args.extend(["-o", out_dir.as_str(), apk.as_str()]);
        execute_command(&self.program, &args, self.show_output)
    }
}

impl Rebuilder for Apktool {
    fn build(&self, decoded_dir: &Path, out_apk: &Path) -> ToolResult<String> {
        let (dir, out) = (path_arg(decoded_dir), path_arg(out_apk));
        execute_command(&self.program, &["b", &dir, "-o", &out], self.show_output)
    }
}

/// Signs with a debug keystore, generating it with `keytool` on first use.
#[derive(Debug, Clone)]
pub struct ApkSigner {
    pub keystore: PathBuf,
    pub alias: String,
    pub password: String,
    pub show_output: bool,
}

impl Default for ApkSigner {
    fn default() -> Self {
        ApkSigner {
            keystore: PathBuf::from("debug.keystore"),
            alias: "androiddebugkey".to_string(),
            password: "android".to_string(),
            show_output: false,
        }
    }
}

impl ApkSigner {
    pub fn ensure_keystore(&self) -> ToolResult<()> {
        if self.keystore.exists() {
            return Ok(());
        }
        info!("Creating debug keystore {}", self.keystore.display());
        let keystore = path_arg(&self.keystore);
        execute_command(
            "keytool",
            &[
                "-genkey",
                "-v",
                "-keystore",
                &keystore,
                "-storepass",
                &self.password,
                "-alias",
                &self.alias,
                "-keypass",
                &self.password,
                "-keyalg",
                "RSA",
                "-keysize",
                "2048",
                "-validity",
                "10000",
                "-dname",
                "CN=Android Debug,O=Android,C=US",
            ],
            self.show_output,
        )?;
        Ok(())
    }
}

impl Signer for ApkSigner {
    fn sign(&self, apk: &Path) -> ToolResult<String> {
        self.ensure_keystore()?;
        let keystore = path_arg(&self.keystore);
        let pass = format!("pass:{}", self.password);
        let apk = path_arg(apk);
        execute_command(
            "apksigner",
            &[
                "sign",
                "--ks",
                &keystore,
                "--ks-key-alias",
                &self.alias,
                "--ks-pass",
                &pass,
                "--key-pass",
                &pass,
                &apk,
            ],
            self.show_output,
        )
    }
}
