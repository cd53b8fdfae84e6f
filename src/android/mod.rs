//! Android package specifics: the textual manifest and the native library layout.

pub mod layout;
pub mod manifest;
