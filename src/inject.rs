//! Loader injection into a class' static initializer.
//!
//! The injector walks the class once, front to back, and makes sure a
//! `System.loadLibrary` call for the agent library runs while the class is
//! initialized:
//!
//! * an existing `<clinit>` gets the stub as its first lines,
//! * a class without one gets a new trailing `<clinit>` holding the stub.
//!
//! Running it twice on the same class inserts the stub twice. Callers that
//! may see already patched input should check [`LoaderStub::count_in`] first.

use crate::types::{ClassItem, SmaliDocument, SmaliError, SmaliLine, SmaliMethod};
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::path::Path;

/// Library name loaded by the stub unless another one is requested.
pub const DEFAULT_LIBRARY_NAME: &str = "frida";

const LOAD_LIBRARY_INVOKE: &str =
    "invoke-static {v0}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V";

/// Result alias for injection operations.
pub type InjectionResult<T> = Result<T, InjectionError>;

#[derive(Debug, thiserror::Error)]
pub enum InjectionError {
    #[error("invalid library name {0:?}: must be non-empty without quotes, backslashes or line breaks")]
    InvalidLibraryName(String),
    #[error(transparent)]
    Smali(#[from] SmaliError),
}

/// The fixed instruction fragment calling `System.loadLibrary` with a literal name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderStub {
    library: String,
}

impl Default for LoaderStub {
    fn default() -> Self {
        LoaderStub {
            library: DEFAULT_LIBRARY_NAME.to_string(),
        }
    }
}

impl LoaderStub {
    pub fn new(library: &str) -> InjectionResult<Self> {
        let invalid = library.is_empty()
            || library
                .chars()
                .any(|c| matches!(c, '"' | '\\' | '\n' | '\r'));
        if invalid {
            return Err(InjectionError::InvalidLibraryName(library.to_string()));
        }
        Ok(LoaderStub {
            library: library.to_string(),
        })
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    fn const_string(&self) -> String {
        format!("const-string v0, \"{}\"", self.library)
    }

    /// The stub as it is written into a method body, separator line included.
    pub fn lines(&self) -> Vec<String> {
        vec![
            String::new(),
            format!("    {}", self.const_string()),
            format!("    {LOAD_LIBRARY_INVOKE}"),
        ]
    }

    /// Number of times the stub's two instructions appear back to back in the document.
    pub fn count_in(&self, doc: &SmaliDocument) -> usize {
        let const_string = self.const_string();
        let lines: Vec<&str> = doc.lines().map(str::trim).collect();
        lines
            .windows(2)
            .filter(|w| w[0] == const_string && w[1] == LOAD_LIBRARY_INVOKE)
            .count()
    }
}

/// Where the stub ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionOutcome {
    /// Inserted right after the signature of the existing initializer
    AfterSignature,
    /// Inserted right before the terminator of the existing initializer
    BeforeTerminator,
    /// A new initializer was appended to the class
    Synthesized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Searching,
    InsideInitializer,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct LoaderInjector {
    stub: LoaderStub,
}

impl LoaderInjector {
    pub fn new(library: &str) -> InjectionResult<Self> {
        Ok(LoaderInjector {
            stub: LoaderStub::new(library)?,
        })
    }

    pub fn stub(&self) -> &LoaderStub {
        &self.stub
    }

    /// Inserts the stub into the first static initializer, or appends a new one.
    pub fn inject(&self, doc: &mut SmaliDocument) -> InjectionOutcome {
        let mut state = ScanState::Searching;
        let mut outcome = None;

        for (idx, item) in doc.items.iter_mut().enumerate() {
            let ClassItem::Method(method) = item else {
                continue;
            };
            trace!("item {}: {}", idx, method.signature);

            if state == ScanState::Searching && method.is_static_initializer() {
                debug!("Found <clinit> at item {}", idx);
                state = self.enter_initializer(method, &mut outcome);
            }
            if state == ScanState::InsideInitializer && method.terminator.is_some() {
                state = self.leave_initializer(method, &mut outcome);
            }
            // First initializer wins, a second <clinit> is left alone
            if state == ScanState::Done {
                break;
            }
        }

        debug!("scan finished in state {:?}", state);
        match outcome {
            Some(o) => o,
            None => {
                info!("<clinit> method not found, creating new one");
                doc.append_method(self.synthesize_initializer());
                InjectionOutcome::Synthesized
            }
        }
    }

    /* Signature of the initializer: the stub goes right after it */
    fn enter_initializer(&self, method: &mut SmaliMethod, outcome: &mut Option<InjectionOutcome>) -> ScanState {
        if method.register_count() == Some(0) {
            warn!(
                "<clinit> declares no registers but the loader uses v0: {}",
                method.signature
            );
        }
        method.insert_after_signature(self.stub.lines());
        *outcome = Some(InjectionOutcome::AfterSignature);
        ScanState::InsideInitializer
    }

    /* Terminator of the initializer: the stub goes before it unless it was placed already */
    fn leave_initializer(&self, method: &mut SmaliMethod, outcome: &mut Option<InjectionOutcome>) -> ScanState {
        if outcome.is_none() {
            debug!("Adding loader before the end of {}", method.signature);
            method.insert_before_terminator(self.stub.lines());
            *outcome = Some(InjectionOutcome::BeforeTerminator);
        }
        ScanState::Done
    }

    fn synthesize_initializer(&self) -> SmaliMethod {
        let mut method = SmaliMethod::static_initializer();
        method.body.push("    .registers 1".into());
        method.body.extend(self.stub.lines().into_iter().map(SmaliLine::from));
        method.body.push(SmaliLine::default());
        method.body.push("    return-void".into());
        method
    }

    /// Patches a class file in place.
    pub fn inject_file(&self, path: &Path) -> InjectionResult<InjectionOutcome> {
        let mut doc = SmaliDocument::read_from_file(path)?;
        let outcome = self.inject(&mut doc);
        doc.save()?;
        info!("Loader for lib{}.so inserted into {}", self.stub.library(), path.display());
        Ok(outcome)
    }
}

/// Returns `class_body` with a load of `library_name` running during static initialization.
///
/// # Examples
///
/// ```
/// use easygadget::inject::inject_loader;
///
/// let smali = ".class public Lcom/cool/Main;\n.super Ljava/lang/Object;\n";
/// let patched = inject_loader(smali, "frida").unwrap();
/// assert!(patched.contains("const-string v0, \"frida\""));
/// assert!(patched.ends_with("    return-void\n.end method\n"));
/// ```
pub fn inject_loader(class_body: &str, library_name: &str) -> InjectionResult<String> {
    let injector = LoaderInjector::new(library_name)?;
    let mut doc = SmaliDocument::from_smali(class_body);
    injector.inject(&mut doc);
    Ok(doc.to_smali())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{METHOD_TERMINATOR, STATIC_INITIALIZER_SIGNATURE};
    use pretty_assertions::assert_eq;

    const HEADER: &str = ".class public Lcom/example/Main;\n.super Landroid/app/Activity;\n.source \"Main.java\"\n";

    #[test]
    fn empty_initializer_gets_stub_after_signature() {
        let smali = format!("{HEADER}\n{STATIC_INITIALIZER_SIGNATURE}\n.end method\n");
        let mut doc = SmaliDocument::from_smali(&smali);
        let injector = LoaderInjector::default();

        assert_eq!(injector.inject(&mut doc), InjectionOutcome::AfterSignature);
        assert_eq!(injector.stub().count_in(&doc), 1);

        let lines: Vec<&str> = doc.lines().collect();
        let sig = lines.iter().position(|l| *l == STATIC_INITIALIZER_SIGNATURE).unwrap();
        assert_eq!(lines[sig + 1..sig + 4].to_vec(), injector.stub().lines());
        assert_eq!(lines[sig + 4], METHOD_TERMINATOR);
    }

    #[test]
    fn populated_initializer_keeps_existing_body() {
        let smali = format!(
            "{HEADER}\n{STATIC_INITIALIZER_SIGNATURE}\n    .locals 1\n\n    const/4 v0, 0x0\n    sput v0, Lcom/example/Main;->x:I\n\n    return-void\n.end method\n"
        );
        let patched = inject_loader(&smali, "frida").unwrap();
        let expected = format!(
            "{HEADER}\n{STATIC_INITIALIZER_SIGNATURE}\n\n    const-string v0, \"frida\"\n    invoke-static {{v0}}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V\n    .locals 1\n\n    const/4 v0, 0x0\n    sput v0, Lcom/example/Main;->x:I\n\n    return-void\n.end method\n"
        );
        assert_eq!(patched, expected);
    }

    #[test]
    fn missing_initializer_is_synthesized() {
        let smali = format!(
            "{HEADER}\n.method public constructor <init>()V\n    .locals 0\n    invoke-direct {{p0}}, Landroid/app/Activity;-><init>()V\n    return-void\n.end method\n"
        );
        let patched = inject_loader(&smali, "frida").unwrap();
        let expected = format!(
            "{smali}\n{STATIC_INITIALIZER_SIGNATURE}\n    .registers 1\n\n    const-string v0, \"frida\"\n    invoke-static {{v0}}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V\n\n    return-void\n.end method\n"
        );
        assert_eq!(patched, expected);

        let doc = SmaliDocument::from_smali(&patched);
        assert_eq!(doc.methods().count(), 2);
        assert_eq!(doc.methods().filter(|m| m.is_static_initializer()).count(), 1);
    }

    #[test]
    fn missing_initializer_without_final_newline() {
        let patched = inject_loader(".class public La;", "frida").unwrap();
        assert!(patched.starts_with(".class public La;\n.method public static constructor <clinit>()V\n"));
        assert!(patched.ends_with(".end method\n"));
    }

    #[test]
    fn terminator_step_adds_stub_when_none_placed() {
        let injector = LoaderInjector::new("agent").unwrap();
        let mut method = SmaliMethod::static_initializer();
        method.body.push("    return-void".into());

        let mut outcome = None;
        assert_eq!(injector.leave_initializer(&mut method, &mut outcome), ScanState::Done);
        assert_eq!(outcome, Some(InjectionOutcome::BeforeTerminator));
        let mut expected = vec!["    return-void".to_string()];
        expected.extend(injector.stub().lines());
        assert_eq!(method.body, expected);

        // Already placed after the signature: the terminator step leaves the body alone
        let mut method = SmaliMethod::static_initializer();
        let mut outcome = None;
        assert_eq!(injector.enter_initializer(&mut method, &mut outcome), ScanState::InsideInitializer);
        assert_eq!(injector.leave_initializer(&mut method, &mut outcome), ScanState::Done);
        assert_eq!(outcome, Some(InjectionOutcome::AfterSignature));
        assert_eq!(method.body, injector.stub().lines());
    }

    #[test]
    fn mixed_line_endings_survive_injection() {
        let smali = ".class public La;\r\n.super Ljava/lang/Object;\n# lf only\n\n.method static constructor <clinit>()V\n    .locals 1\r\n    return-void\n.end method\n";
        let patched = inject_loader(smali, "frida").unwrap();
        let stub = "\n    const-string v0, \"frida\"\n    invoke-static {v0}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V\n";
        assert_eq!(patched, smali.replacen("<clinit>()V\n", &format!("<clinit>()V\n{stub}"), 1));
    }

    #[test]
    fn reinjection_duplicates_stub() {
        let stub = LoaderStub::default();
        for smali in [
            format!("{HEADER}\n{STATIC_INITIALIZER_SIGNATURE}\n.end method\n"),
            HEADER.to_string(),
        ] {
            let once = inject_loader(&smali, "frida").unwrap();
            assert_eq!(stub.count_in(&SmaliDocument::from_smali(&once)), 1);
            let twice = inject_loader(&once, "frida").unwrap();
            let doc = SmaliDocument::from_smali(&twice);
            assert_eq!(stub.count_in(&doc), 2);
            assert_eq!(doc.methods().filter(|m| m.is_static_initializer()).count(), 1);
        }
    }

    #[test]
    fn only_first_initializer_is_patched() {
        let smali = format!(
            "{HEADER}\n{STATIC_INITIALIZER_SIGNATURE}\n.end method\n\n{STATIC_INITIALIZER_SIGNATURE}\n.end method\n"
        );
        let mut doc = SmaliDocument::from_smali(&smali);
        LoaderInjector::default().inject(&mut doc);
        let inits: Vec<&SmaliMethod> = doc.methods().collect();
        assert_eq!(inits[0].body.len(), 3);
        assert!(inits[1].body.is_empty());
    }

    #[test]
    fn package_private_initializer_is_used() {
        let smali = format!("{HEADER}\n.method static constructor <clinit>()V\n    .locals 1\n    return-void\n.end method\n");
        let mut doc = SmaliDocument::from_smali(&smali);
        assert_eq!(LoaderInjector::default().inject(&mut doc), InjectionOutcome::AfterSignature);
        assert_eq!(doc.methods().count(), 1);
    }

    #[test]
    fn unterminated_initializer_still_patched_once() {
        let smali = format!("{HEADER}{STATIC_INITIALIZER_SIGNATURE}\n    return-void\n");
        let mut doc = SmaliDocument::from_smali(&smali);
        let injector = LoaderInjector::default();
        assert_eq!(injector.inject(&mut doc), InjectionOutcome::AfterSignature);
        assert_eq!(injector.stub().count_in(&doc), 1);
        assert_eq!(doc.methods().count(), 1);
    }

    #[test]
    fn custom_library_and_crlf() {
        let smali = ".class public La;\r\n.super Ljava/lang/Object;\r\n";
        let patched = inject_loader(smali, "gadget").unwrap();
        assert!(patched.contains("    const-string v0, \"gadget\"\r\n"));
        assert!(!patched.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn invalid_library_names() {
        for name in ["", "fri\"da", "a\\b", "a\nb"] {
            assert!(matches!(
                inject_loader(".class La;\n", name),
                Err(InjectionError::InvalidLibraryName(_))
            ));
        }
    }

    #[test]
    fn inject_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Main.smali");
        std::fs::write(&path, HEADER).unwrap();

        let outcome = LoaderInjector::default().inject_file(&path).unwrap();
        assert_eq!(outcome, InjectionOutcome::Synthesized);
        let doc = SmaliDocument::read_from_file(&path).unwrap();
        assert_eq!(LoaderStub::default().count_in(&doc), 1);

        let missing = dir.path().join("Missing.smali");
        assert!(matches!(
            LoaderInjector::default().inject_file(&missing),
            Err(InjectionError::Smali(SmaliError::Read { .. }))
        ));
    }
}
