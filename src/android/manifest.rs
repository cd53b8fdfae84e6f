use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;
use quick_xml::Error as QuickXmlError;
use serde::{Deserialize, Serialize};
use std::str;

pub const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";

pub const ACTION_MAIN: &str = "android.intent.action.MAIN";
pub const CATEGORY_LAUNCHER: &str = "android.intent.category.LAUNCHER";

/// Result alias for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;

/// Errors surfaced while parsing a textual manifest. Any of them means the
/// document is not usable for launcher resolution.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The document is missing the expected structure.
    #[error("Malformed manifest: {0}")]
    MalformedDocument(String),
    /// Text XML parsing failure.
    #[error("XML error: {0}")]
    Xml(#[from] QuickXmlError),
    #[error("XML attribute error: {0}")]
    Attribute(#[from] AttrError),
    #[error("Manifest is not valid UTF-8: {0}")]
    Utf8(#[from] str::Utf8Error),
}

/// A single attribute attached to a manifest element, keyed by namespace URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestAttribute {
    pub namespace_uri: Option<String>,
    pub name: String,
    pub value: String,
}

/// DOM-style element node of the manifest tree.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ManifestElement {
    pub namespace_uri: Option<String>,
    pub tag: String,
    pub attributes: Vec<ManifestAttribute>,
    pub children: Vec<ManifestElement>,
}

impl ManifestElement {
    pub fn new(tag: impl Into<String>) -> Self {
        ManifestElement {
            tag: tag.into(),
            ..ManifestElement::default()
        }
    }

    /// Attribute without namespace, e.g. `package` on the root element.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attribute_ns(None, name)
    }

    /// Attribute in the Android namespace, e.g. `android:name`.
    pub fn android_attribute(&self, name: &str) -> Option<&str> {
        self.attribute_ns(Some(ANDROID_NAMESPACE_URI), name)
    }

    pub fn attribute_ns(&self, namespace_uri: Option<&str>, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name == name && attr.namespace_uri.as_deref() == namespace_uri)
            .map(|attr| attr.value.as_str())
    }

    /// Direct children with the given tag and no namespace, in document order.
    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a ManifestElement> + 'a {
        self.children
            .iter()
            .filter(move |child| child.tag == tag && child.namespace_uri.is_none())
    }

    /// Depth-first, document order walk over all descendants.
    pub fn descendants(&self) -> Vec<&ManifestElement> {
        let mut out = Vec::new();
        for child in &self.children {
            out.push(child);
            out.extend(child.descendants());
        }
        out
    }

    fn has_android_name(&self, tag: &str, value: &str) -> bool {
        self.children_named(tag)
            .any(|child| child.android_attribute("name") == Some(value))
    }

    /// An intent filter advertising the main launcher entry point.
    pub fn is_launcher_filter(&self) -> bool {
        self.has_android_name("action", ACTION_MAIN)
            && self.has_android_name("category", CATEGORY_LAUNCHER)
    }
}

/// The launcher activity as declared in the manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// `android:name` exactly as written
    pub name: String,
    /// `package` of the manifest root, used to expand shorthand names
    pub package: Option<String>,
}

impl ActivityRecord {
    /// Fully qualified class name, expanding `.Main` and `Main` against the package.
    ///
    /// ```
    /// use easygadget::android::manifest::ActivityRecord;
    ///
    /// let a = ActivityRecord { name: ".ui.Main".into(), package: Some("com.cool".into()) };
    /// assert_eq!(a.class_name(), "com.cool.ui.Main");
    /// ```
    pub fn class_name(&self) -> String {
        match self.package.as_deref() {
            Some(package) if self.name.starts_with('.') => format!("{package}{}", self.name),
            Some(package) if !self.name.contains('.') => format!("{package}.{}", self.name),
            _ => self.name.clone(),
        }
    }
}

/// Parsed, read-only textual AndroidManifest.xml.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestDocument {
    root: ManifestElement,
}

impl ManifestDocument {
    pub fn from_string(xml: &str) -> ManifestResult<Self> {
        Self::from_bytes(xml.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> ManifestResult<Self> {
        let mut reader = NsReader::from_reader(bytes);
        let mut buffer = Vec::new();
        let mut stack: Vec<ManifestElement> = Vec::new();
        let mut root: Option<ManifestElement> = None;

        loop {
            match reader.read_resolved_event_into(&mut buffer)? {
                (ns, Event::Start(start)) => {
                    let namespace = namespace_uri(ns)?;
                    let element = build_element(&reader, namespace, &start)?;
                    stack.push(element);
                }
                (ns, Event::Empty(start)) => {
                    let namespace = namespace_uri(ns)?;
                    let element = build_element(&reader, namespace, &start)?;
                    attach_element(&mut stack, &mut root, element)?;
                }
                (_, Event::End(_)) => {
                    let element = stack.pop().ok_or_else(|| {
                        ManifestError::MalformedDocument("Unbalanced end tag in manifest".to_string())
                    })?;
                    attach_element(&mut stack, &mut root, element)?;
                }
                (_, Event::Text(text)) => {
                    let text = text.unescape()?;
                    if stack.is_empty() && !text.trim().is_empty() {
                        return Err(ManifestError::MalformedDocument(
                            "Text outside the root element".to_string(),
                        ));
                    }
                }
                (_, Event::CData(_)) if stack.is_empty() => {
                    return Err(ManifestError::MalformedDocument(
                        "CDATA outside the root element".to_string(),
                    ));
                }
                (_, Event::Eof) => break,
                _ => {}
            }
            buffer.clear();
        }

        if !stack.is_empty() {
            return Err(ManifestError::MalformedDocument(
                "Unclosed XML elements in manifest".to_string(),
            ));
        }

        let root = root.ok_or_else(|| {
            ManifestError::MalformedDocument("Manifest does not have a root element".to_string())
        })?;

        Ok(ManifestDocument { root })
    }

    pub fn package_name(&self) -> Option<&str> {
        self.root.attribute("package")
    }

    /// Every `activity` element below the root, in document order.
    pub fn activities(&self) -> Vec<&ManifestElement> {
        self.root
            .descendants()
            .into_iter()
            .filter(|e| e.tag == "activity" && e.namespace_uri.is_none())
            .collect()
    }

    /// First activity, in document order, with a MAIN/LAUNCHER intent filter.
    pub fn launcher_activity(&self) -> Option<ActivityRecord> {
        self.activities()
            .into_iter()
            .find(|activity| {
                activity
                    .children_named("intent-filter")
                    .any(ManifestElement::is_launcher_filter)
            })
            .and_then(|activity| activity.android_attribute("name"))
            .map(|name| ActivityRecord {
                name: name.to_string(),
                package: self.package_name().map(str::to_string),
            })
    }
}

/// Parses `manifest` and resolves its launcher activity. `Ok(None)` means the
/// document is fine but declares no launcher.
///
/// # Examples
///
/// ```
/// use easygadget::android::manifest::resolve_launcher_activity;
///
/// let xml = br#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.cool">
///   <application>
///     <activity android:name="com.cool.Main">
///       <intent-filter>
///         <action android:name="android.intent.action.MAIN"/>
///         <category android:name="android.intent.category.LAUNCHER"/>
///       </intent-filter>
///     </activity>
///   </application>
/// </manifest>"#;
/// let activity = resolve_launcher_activity(xml).unwrap().unwrap();
/// assert_eq!(activity.name, "com.cool.Main");
/// ```
pub fn resolve_launcher_activity(manifest: &[u8]) -> ManifestResult<Option<ActivityRecord>> {
    Ok(ManifestDocument::from_bytes(manifest)?.launcher_activity())
}

fn namespace_uri(ns: ResolveResult) -> ManifestResult<Option<String>> {
    match ns {
        ResolveResult::Bound(Namespace(uri)) => Ok(Some(str::from_utf8(uri)?.to_string())),
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(ManifestError::MalformedDocument(format!(
            "Unbound namespace prefix '{}'",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn build_element(
    reader: &NsReader<&[u8]>,
    namespace_uri_of_tag: Option<String>,
    start: &BytesStart,
) -> ManifestResult<ManifestElement> {
    let tag = str::from_utf8(start.local_name().as_ref())?.to_string();
    let mut element = ManifestElement {
        namespace_uri: namespace_uri_of_tag,
        ..ManifestElement::new(tag)
    };

    for attr in start.attributes() {
        let attr = attr?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let (ns, local) = reader.resolve_attribute(attr.key);
        element.attributes.push(ManifestAttribute {
            namespace_uri: namespace_uri(ns)?,
            name: str::from_utf8(local.as_ref())?.to_string(),
            value: attr.unescape_value()?.into_owned(),
        });
    }

    Ok(element)
}

fn attach_element(
    stack: &mut [ManifestElement],
    root: &mut Option<ManifestElement>,
    element: ManifestElement,
) -> ManifestResult<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    } else {
        return Err(ManifestError::MalformedDocument(
            "Multiple root elements in manifest".to_string(),
        ));
    }
    Ok(())
}
