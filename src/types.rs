/* Line preserving model of a smali class document. */
/* Untouched content renders back byte for byte; edits happen through explicit insertion points. */

use crate::smali_parse::{parse_document, parse_method_header, parse_register_directive};
use crate::smali_write::write_document;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Header line of the static initializer as emitted for synthesized methods.
pub const STATIC_INITIALIZER_SIGNATURE: &str = ".method public static constructor <clinit>()V";

/// Terminator line closing every method block.
pub const METHOD_TERMINATOR: &str = ".end method";

/// Errors raised while loading or saving smali documents.
#[derive(Debug, thiserror::Error)]
pub enum SmaliError {
    #[error("Error loading file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Error writing file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unable to save, no file_path set for document")]
    NoFilePath,
    #[error("Unknown modifier: {0}")]
    UnknownModifier(String),
}

/// Represents a Java object identifier
///
/// # Examples
///
/// ```
/// use easygadget::types::ObjectIdentifier;
///
/// let o = ObjectIdentifier::from_java_type("com.basic.Test");
/// assert_eq!(o.as_jni_type(), "Lcom/basic/Test;");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentifier {
    pub(crate) class_name: String,
}

impl ObjectIdentifier {
    pub fn from_java_type(t: &str) -> ObjectIdentifier {
        ObjectIdentifier {
            class_name: t.replace('.', "/"),
        }
    }

    pub fn as_jni_type(&self) -> String {
        format!("L{};", self.class_name)
    }

    /// Path of the class' smali file relative to a `smali*` root, e.g. `com/basic/Test.smali`
    ///
    /// ```
    /// use easygadget::types::ObjectIdentifier;
    /// use std::path::PathBuf;
    ///
    /// let o = ObjectIdentifier::from_java_type("com.basic.Test$Inner");
    /// assert_eq!(o.smali_path(), PathBuf::from("com/basic/Test$Inner.smali"));
    /// ```
    pub fn smali_path(&self) -> PathBuf {
        let mut path: PathBuf = self.class_name.split('/').collect();
        path.set_extension("smali");
        path
    }
}

/// Simple enum to represent Java method, field and class modifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Public,
    Protected,
    Private,
    Static,
    Final,
    Abstract,
    Interface,
    Synthetic,
    Transient,
    Volatile,
    Synchronized,
    DeclaredSynchronized,
    Native,
    Varargs,
    Annotation,
    Enum,
    Strict,
    Bridge,
    Constructor,
}

impl FromStr for Modifier {
    type Err = SmaliError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Modifier::Public),
            "protected" => Ok(Modifier::Protected),
            "private" => Ok(Modifier::Private),
            "static" => Ok(Modifier::Static),
            "final" => Ok(Modifier::Final),
            "abstract" => Ok(Modifier::Abstract),
            "interface" => Ok(Modifier::Interface),
            "synthetic" => Ok(Modifier::Synthetic),
            "transient" => Ok(Modifier::Transient),
            "volatile" => Ok(Modifier::Volatile),
            "synchronized" => Ok(Modifier::Synchronized),
            "declared-synchronized" => Ok(Modifier::DeclaredSynchronized),
            "native" => Ok(Modifier::Native),
            "varargs" => Ok(Modifier::Varargs),
            "annotation" => Ok(Modifier::Annotation),
            "enum" => Ok(Modifier::Enum),
            "strict" => Ok(Modifier::Strict),
            "bridge" => Ok(Modifier::Bridge),
            "constructor" => Ok(Modifier::Constructor),
            _ => Err(SmaliError::UnknownModifier(s.to_string())),
        }
    }
}

/// The parsed parts of a `.method` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodHeader {
    pub modifiers: Vec<Modifier>,
    pub name: String,
    /// Method descriptor in JNI form, e.g. `()V`
    pub descriptor: String,
}

impl MethodHeader {
    pub fn is_static_initializer(&self) -> bool {
        self.name == "<clinit>"
            && self.descriptor == "()V"
            && self.modifiers.contains(&Modifier::Static)
            && self.modifiers.contains(&Modifier::Constructor)
    }
}

/// One line of a document together with the terminator that followed it in the source.
///
/// `ending` is `None` for lines built in memory and for a final line without a newline.
/// Those are written with the document's dominant ending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmaliLine {
    pub text: String,
    pub ending: Option<LineEnding>,
}

impl SmaliLine {
    pub fn new(text: impl Into<String>) -> Self {
        SmaliLine {
            text: text.into(),
            ending: None,
        }
    }

    pub(crate) fn with_ending(text: &str, ending: Option<LineEnding>) -> Self {
        SmaliLine {
            text: text.to_string(),
            ending,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl From<&str> for SmaliLine {
    fn from(text: &str) -> Self {
        SmaliLine::new(text)
    }
}

impl From<String> for SmaliLine {
    fn from(text: String) -> Self {
        SmaliLine::new(text)
    }
}

impl fmt::Display for SmaliLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl PartialEq<str> for SmaliLine {
    fn eq(&self, other: &str) -> bool {
        self.text == other
    }
}

impl PartialEq<&str> for SmaliLine {
    fn eq(&self, other: &&str) -> bool {
        self.text == *other
    }
}

impl PartialEq<String> for SmaliLine {
    fn eq(&self, other: &String) -> bool {
        &self.text == other
    }
}

/// A method block: signature line, body lines and the closing `.end method`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmaliMethod {
    /// The `.method ...` line as it appeared in the document
    pub signature: SmaliLine,
    /// Parsed header, `None` when the signature line could not be understood
    pub header: Option<MethodHeader>,
    /// Everything between the signature and the terminator
    pub body: Vec<SmaliLine>,
    /// The `.end method` line, `None` for a method left open at end of input
    pub terminator: Option<SmaliLine>,
}

impl SmaliMethod {
    pub fn new(signature: impl Into<SmaliLine>) -> Self {
        let signature = signature.into();
        let header = parse_method_header(&signature.text).ok().map(|(_, h)| h);
        SmaliMethod {
            signature,
            header,
            body: Vec::new(),
            terminator: None,
        }
    }

    /// Builds an empty `<clinit>` with the canonical public signature and a terminator.
    pub fn static_initializer() -> Self {
        let mut method = SmaliMethod::new(STATIC_INITIALIZER_SIGNATURE);
        method.terminator = Some(SmaliLine::new(METHOD_TERMINATOR));
        method
    }

    /// True for the exact canonical signature, or any `static constructor <clinit>()V` header.
    pub fn is_static_initializer(&self) -> bool {
        self.signature.text.trim() == STATIC_INITIALIZER_SIGNATURE
            || self
                .header
                .as_ref()
                .is_some_and(MethodHeader::is_static_initializer)
    }

    /// Register count from the first `.locals` or `.registers` directive in the body.
    pub fn register_count(&self) -> Option<u32> {
        self.body
            .iter()
            .find_map(|line| parse_register_directive(&line.text).ok().map(|(_, n)| n))
    }

    pub fn insert_after_signature<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<SmaliLine>,
    {
        let lines: Vec<SmaliLine> = lines.into_iter().map(Into::into).collect();
        self.body.splice(0..0, lines);
    }

    pub fn insert_before_terminator<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<SmaliLine>,
    {
        self.body.extend(lines.into_iter().map(Into::into));
    }

    /// Text of every line, signature and terminator included.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.entries().map(SmaliLine::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SmaliLine> {
        std::iter::once(&self.signature)
            .chain(self.body.iter())
            .chain(self.terminator.as_ref())
    }
}

/// Top level entries of a document, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassItem {
    /// Anything outside a method: directives, fields, annotations, comments, blank lines
    Line(SmaliLine),
    Method(SmaliMethod),
}

impl ClassItem {
    pub fn entries(&self) -> Box<dyn Iterator<Item = &SmaliLine> + '_> {
        match self {
            ClassItem::Line(l) => Box::new(std::iter::once(l)),
            ClassItem::Method(m) => Box::new(m.entries()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// Represents a smali document i.e. the whole .smali file
///
/// # Examples
///
/// ```
/// use easygadget::types::SmaliDocument;
///
/// let smali = ".class public Lcom/cool/Main;\r\n.super Ljava/lang/Object;\n";
/// let doc = SmaliDocument::from_smali(smali);
/// assert_eq!(doc.to_smali(), smali);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmaliDocument {
    pub items: Vec<ClassItem>,
    /// Ending used by most source lines, given to lines added in memory
    pub line_ending: LineEnding,
    /// Whether the last line is followed by a line ending
    pub trailing_newline: bool,

    // Internal
    /// The file path where this document was loaded from (.smali file)
    pub file_path: Option<PathBuf>,
}

impl SmaliDocument {
    /// Splits smali text into lines and method blocks. Never fails: text that does not look
    /// like a method is kept as plain lines.
    pub fn from_smali(s: &str) -> SmaliDocument {
        parse_document(s)
    }

    /// Loads a document from a .smali file
    ///
    /// ```no_run
    /// use std::path::Path;
    /// use easygadget::types::SmaliDocument;
    ///
    /// let doc = SmaliDocument::read_from_file(Path::new("smali/com/cool/Main.smali")).expect("Uh oh, does the file exist?");
    /// ```
    pub fn read_from_file(path: &Path) -> Result<SmaliDocument, SmaliError> {
        let text = fs::read_to_string(path).map_err(|source| SmaliError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut doc = SmaliDocument::from_smali(&text);
        doc.file_path = Some(path.to_path_buf());
        Ok(doc)
    }

    pub fn to_smali(&self) -> String {
        write_document(self)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<(), SmaliError> {
        fs::write(path, self.to_smali()).map_err(|source| SmaliError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes the document back to the file it was loaded from
    pub fn save(&self) -> Result<(), SmaliError> {
        match &self.file_path {
            Some(p) => self.write_to_file(p),
            None => Err(SmaliError::NoFilePath),
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = &SmaliMethod> {
        self.items.iter().filter_map(|item| match item {
            ClassItem::Method(m) => Some(m),
            ClassItem::Line(_) => None,
        })
    }

    pub fn static_initializer(&self) -> Option<&SmaliMethod> {
        self.methods().find(|m| m.is_static_initializer())
    }

    /// Appends a method as the last item of the class.
    ///
    /// A blank line separates it from the previous content when that content ends with a
    /// newline. Otherwise the open last line is terminated and the method follows directly.
    pub fn append_method(&mut self, method: SmaliMethod) {
        if self.items.is_empty() || self.trailing_newline {
            self.items.push(ClassItem::Line(SmaliLine::default()));
        }
        self.items.push(ClassItem::Method(method));
        self.trailing_newline = true;
    }

    /// All lines of the document in order, without line terminators.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.entries().map(SmaliLine::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SmaliLine> {
        self.items.iter().flat_map(ClassItem::entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_identifier_paths() {
        let o = ObjectIdentifier::from_java_type("com.basic.Test");
        assert_eq!(o.as_jni_type(), "Lcom/basic/Test;");
        assert_eq!(o.smali_path(), PathBuf::from("com/basic/Test.smali"));
    }

    #[test]
    fn non_public_clinit_is_initializer() {
        let m = SmaliMethod::new(".method static constructor <clinit>()V");
        assert!(m.is_static_initializer());
        let m = SmaliMethod::new(".method public constructor <init>()V");
        assert!(!m.is_static_initializer());
        let m = SmaliMethod::new(".method public static clinit()V");
        assert!(!m.is_static_initializer());
    }

    #[test]
    fn insertion_points() {
        let mut m = SmaliMethod::static_initializer();
        m.body.push("    return-void".into());
        m.insert_after_signature(["    .locals 1"]);
        m.insert_before_terminator(["    # tail"]);
        let lines: Vec<&str> = m.lines().collect();
        assert_eq!(
            lines,
            vec![
                STATIC_INITIALIZER_SIGNATURE,
                "    .locals 1",
                "    return-void",
                "    # tail",
                METHOD_TERMINATOR
            ]
        );
        assert_eq!(m.register_count(), Some(1));
    }

    #[test]
    fn appended_method_separator() {
        let mut doc = SmaliDocument::from_smali(".class public La;\n");
        doc.append_method(SmaliMethod::static_initializer());
        assert_eq!(
            doc.to_smali(),
            format!(".class public La;\n\n{STATIC_INITIALIZER_SIGNATURE}\n{METHOD_TERMINATOR}\n")
        );

        let mut doc = SmaliDocument::from_smali(".class public La;");
        doc.append_method(SmaliMethod::static_initializer());
        assert_eq!(
            doc.to_smali(),
            format!(".class public La;\n{STATIC_INITIALIZER_SIGNATURE}\n{METHOD_TERMINATOR}\n")
        );

        let mut doc = SmaliDocument::default();
        doc.append_method(SmaliMethod::static_initializer());
        assert_eq!(
            doc.to_smali(),
            format!("\n{STATIC_INITIALIZER_SIGNATURE}\n{METHOD_TERMINATOR}\n")
        );
    }
}
