use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Fixed library-style name the user script is stored under.
pub const SCRIPT_FILE_NAME: &str = "libscript.so";

pub type LayoutResult<T> = Result<T, LayoutError>;

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("{} not found.", .0.display())]
    MissingFile(PathBuf),
    #[error("failed to place {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown architecture '{0}', expected one of: armeabi-v7a, arm64-v8a, x86, x86_64")]
pub struct ParseArchitectureError(String);

/// ABI directory names understood by the package installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "armeabi-v7a")]
    ArmeabiV7a,
    #[serde(rename = "arm64-v8a")]
    Arm64V8a,
    #[serde(rename = "x86")]
    X86,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl Architecture {
    pub const ALL: [Architecture; 4] = [
        Architecture::ArmeabiV7a,
        Architecture::Arm64V8a,
        Architecture::X86,
        Architecture::X86_64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::ArmeabiV7a => "armeabi-v7a",
            Architecture::Arm64V8a => "arm64-v8a",
            Architecture::X86 => "x86",
            Architecture::X86_64 => "x86_64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = ParseArchitectureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Architecture::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| ParseArchitectureError(s.to_string()))
    }
}

/// Where the agent binaries come from and where they go inside a decoded package.
///
/// Sources are `<gadget_dir>/<arch>/lib<name>.so` and `lib<name>.config.so`; both land in
/// `<decoded>/lib/<arch>/` under the same names.
#[derive(Debug, Clone)]
pub struct AgentLayout {
    pub gadget_dir: PathBuf,
    pub arch: Architecture,
    pub library: String,
}

impl AgentLayout {
    pub fn new(gadget_dir: impl Into<PathBuf>, arch: Architecture, library: impl Into<String>) -> Self {
        AgentLayout {
            gadget_dir: gadget_dir.into(),
            arch,
            library: library.into(),
        }
    }

    pub fn agent_file_names(&self) -> [String; 2] {
        [
            format!("lib{}.so", self.library),
            format!("lib{}.config.so", self.library),
        ]
    }

    pub fn target_dir(&self, decoded_dir: &Path) -> PathBuf {
        decoded_dir.join("lib").join(self.arch.as_str())
    }

    fn ensure_target_dir(&self, decoded_dir: &Path) -> LayoutResult<PathBuf> {
        let dir = self.target_dir(decoded_dir);
        fs::create_dir_all(&dir).map_err(|source| LayoutError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Copies the agent library and its configuration next to the app's own native libraries.
    pub fn place_agent(&self, decoded_dir: &Path) -> LayoutResult<Vec<PathBuf>> {
        let source_dir = self.gadget_dir.join(self.arch.as_str());
        let target_dir = self.ensure_target_dir(decoded_dir)?;

        let mut placed = Vec::new();
        for name in self.agent_file_names() {
            let source = source_dir.join(&name);
            if !source.is_file() {
                return Err(LayoutError::MissingFile(source));
            }
            placed.push(copy_file(&source, &target_dir.join(&name))?);
        }
        Ok(placed)
    }

    /// Copies the user script under its fixed library-style name.
    pub fn place_script(&self, script: &Path, decoded_dir: &Path) -> LayoutResult<PathBuf> {
        if !script.is_file() {
            return Err(LayoutError::MissingFile(script.to_path_buf()));
        }
        let target_dir = self.ensure_target_dir(decoded_dir)?;
        copy_file(script, &target_dir.join(SCRIPT_FILE_NAME))
    }
}

fn copy_file(source: &Path, dest: &Path) -> LayoutResult<PathBuf> {
    fs::copy(source, dest).map_err(|source_err| LayoutError::Io {
        path: dest.to_path_buf(),
        source: source_err,
    })?;
    info!("Copied {} -> {}", source.display(), dest.display());
    Ok(dest.to_path_buf())
}
