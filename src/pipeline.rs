//! End to end patching of a package.
//!
//! Steps run strictly in order and the first failure stops the run. The
//! working directory is a [`tempfile::TempDir`] removed on every exit path.

use crate::android::layout::{AgentLayout, Architecture, LayoutError};
use crate::android::manifest::{resolve_launcher_activity, ActivityRecord, ManifestError};
use crate::inject::{InjectionError, InjectionOutcome, LoaderInjector, DEFAULT_LIBRARY_NAME};
use crate::tools::{
    missing_tools, ApkSigner, Apktool, Decompiler, Rebuilder, Signer, ToolError, REQUIRED_TOOLS,
};
use crate::types::{ObjectIdentifier, SmaliDocument, SmaliError};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("The following required tools are not installed: {}", .0.join(", "))]
    MissingTools(Vec<String>),
    #[error("Failed to {step}: {source}")]
    Tool {
        step: &'static str,
        source: ToolError,
    },
    #[error("Failed to parse AndroidManifest.xml: {0}")]
    Manifest(#[from] ManifestError),
    #[error("Could not find the main activity")]
    ActivityNotFound,
    #[error("Class {class} not found in any of: {}", display_paths(.searched))]
    ClassNotFound {
        class: String,
        searched: Vec<PathBuf>,
    },
    #[error("Failed to insert loader: {0}")]
    Injection(#[from] InjectionError),
    #[error("Failed to copy agent files: {0}")]
    Layout(#[from] LayoutError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: io::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<SmaliError> for PipelineError {
    fn from(value: SmaliError) -> Self {
        PipelineError::Injection(InjectionError::Smali(value))
    }
}

fn step(step: &'static str) -> impl FnOnce(ToolError) -> PipelineError {
    move |source| PipelineError::Tool { step, source }
}

/// What to patch and with which agent.
#[derive(Debug, Clone, Serialize)]
pub struct PatchOptions {
    pub apk: PathBuf,
    pub arch: Architecture,
    /// Script placed next to the agent as `libscript.so`
    pub script: Option<PathBuf>,
    /// Holds `<arch>/lib<library>.so` and `<arch>/lib<library>.config.so`
    pub gadget_dir: PathBuf,
    pub library: String,
    /// Defaults to `<apk dir>/<apk stem>_mod.apk`
    pub output: Option<PathBuf>,
}

impl PatchOptions {
    pub fn new(apk: impl Into<PathBuf>, arch: Architecture) -> Self {
        PatchOptions {
            apk: apk.into(),
            arch,
            script: None,
            gadget_dir: PathBuf::from("gadget"),
            library: DEFAULT_LIBRARY_NAME.to_string(),
            output: None,
        }
    }

    pub fn output_path(&self) -> PathBuf {
        if let Some(output) = &self.output {
            return output.clone();
        }
        let stem = self
            .apk
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_string());
        let dir = self.apk.parent().unwrap_or_else(|| Path::new(""));
        dir.join(format!("{stem}_mod.apk"))
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct PatchReport {
    pub activity: ActivityRecord,
    /// Class file path relative to the decoded package
    pub class_file: PathBuf,
    /// `None` when the class already carried the loader
    pub injection: Option<InjectionOutcome>,
    pub placed_files: Vec<PathBuf>,
    pub output: PathBuf,
}

/// The external programs used by a [`Patcher`].
pub struct Toolchain {
    pub decompiler: Box<dyn Decompiler>,
    pub rebuilder: Box<dyn Rebuilder>,
    pub signer: Box<dyn Signer>,
}

impl Toolchain {
    /// apktool for decoding and building, apksigner with a debug keystore for signing.
    pub fn system(keystore: impl Into<PathBuf>, show_output: bool) -> Self {
        let apktool = Apktool {
            show_output,
            ..Apktool::default()
        };
        let signer = ApkSigner {
            keystore: keystore.into(),
            show_output,
            ..ApkSigner::default()
        };
        Toolchain {
            decompiler: Box::new(apktool.clone()),
            rebuilder: Box::new(apktool),
            signer: Box::new(signer),
        }
    }
}

pub struct Patcher {
    tools: Toolchain,
    options: PatchOptions,
}

impl Patcher {
    pub fn new(tools: Toolchain, options: PatchOptions) -> Self {
        Patcher { tools, options }
    }

    /// Fails when any program of the system toolchain is missing from `PATH`.
    pub fn preflight() -> PipelineResult<()> {
        let missing = missing_tools(&REQUIRED_TOOLS);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::MissingTools(missing))
        }
    }

    pub fn run(&self) -> PipelineResult<PatchReport> {
        let work_dir = tempfile::Builder::new()
            .prefix("easygadget-")
            .tempdir()
            .map_err(|source| PipelineError::Io {
                context: "Failed to create temporary directory".to_string(),
                source,
            })?;

        let result = self.run_in(&work_dir.path().join("decoded"));

        info!("Cleaning up temporary files...");
        let path = work_dir.path().to_path_buf();
        if let Err(e) = work_dir.close() {
            warn!("Failed to clean up temporary files {}: {}", path.display(), e);
        }
        result
    }

    fn run_in(&self, decoded: &Path) -> PipelineResult<PatchReport> {
        let opts = &self.options;
        let tools = &self.tools;

        info!("Decompiling APK...");
        tools
            .decompiler
            .decode(&opts.apk, decoded, true)
            .map_err(step("decompile APK with resources"))?;

        let manifest_path = decoded.join("AndroidManifest.xml");
        let manifest = fs::read(&manifest_path).map_err(|source| PipelineError::Io {
            context: format!("Failed to read {}", manifest_path.display()),
            source,
        })?;
        let activity = resolve_launcher_activity(&manifest)?.ok_or(PipelineError::ActivityNotFound)?;
        info!("Main activity: {}", activity.class_name());

        info!("Decompiling APK without resources...");
        tools
            .decompiler
            .decode(&opts.apk, decoded, false)
            .map_err(step("decompile APK without resources"))?;

        let class_path = find_class_file(decoded, &activity.class_name())?;
        let injection = self.inject(&class_path)?;

        info!("Copying agent libraries...");
        let layout = AgentLayout::new(&opts.gadget_dir, opts.arch, &opts.library);
        let mut placed_files = layout.place_agent(decoded)?;
        if let Some(script) = &opts.script {
            info!("Copying and renaming script...");
            placed_files.push(layout.place_script(script, decoded)?);
        }

        let output = opts.output_path();
        info!("Recompiling APK...");
        tools
            .rebuilder
            .build(decoded, &output)
            .map_err(step("recompile the APK"))?;

        info!("Signing APK...");
        tools.signer.sign(&output).map_err(step("sign the APK"))?;

        let relative = |p: &Path| p.strip_prefix(decoded).unwrap_or(p).to_path_buf();
        Ok(PatchReport {
            activity,
            class_file: relative(&class_path),
            injection,
            placed_files: placed_files.iter().map(|p| relative(p)).collect(),
            output,
        })
    }

    fn inject(&self, class_path: &Path) -> PipelineResult<Option<InjectionOutcome>> {
        let injector = LoaderInjector::new(&self.options.library)?;
        let mut doc = SmaliDocument::read_from_file(class_path)?;
        if injector.stub().count_in(&doc) > 0 {
            warn!(
                "{} already loads lib{}.so, leaving it untouched",
                class_path.display(),
                injector.stub().library()
            );
            return Ok(None);
        }

        info!("Inserting loader...");
        let outcome = injector.inject(&mut doc);
        doc.save()?;
        Ok(Some(outcome))
    }
}

/// Finds the class file in `smali/` or any `smali_classesN/` directory of a decoded package.
pub fn find_class_file(decoded: &Path, class_name: &str) -> PipelineResult<PathBuf> {
    let class = ObjectIdentifier::from_java_type(class_name);
    let relative = class.smali_path();
    let searched = smali_roots(decoded);
    debug!("Looking for {} in {} smali roots", class.as_jni_type(), searched.len());
    searched
        .iter()
        .map(|root| root.join(&relative))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| PipelineError::ClassNotFound {
            class: class_name.to_string(),
            searched,
        })
}

fn smali_roots(decoded: &Path) -> Vec<PathBuf> {
    let mut extra: Vec<(u32, PathBuf)> = fs::read_dir(decoded)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let index = name.strip_prefix("smali_classes")?.parse().ok()?;
            Some((index, entry.path()))
        })
        .collect();
    extra.sort();

    let mut roots = vec![decoded.join("smali")];
    roots.extend(extra.into_iter().map(|(_, p)| p));
    roots
}
