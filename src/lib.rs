//! # EasyGadget
//!
//! Patches an Android package so a native instrumentation agent is loaded
//! when the launcher activity's class is initialized.
//!
//! The two pieces doing actual work are
//!
//! * [`android::manifest`], which finds the launcher activity in a decoded
//!   `AndroidManifest.xml`, and
//! * [`inject`], which edits that activity's smali class so its static
//!   initializer calls `System.loadLibrary`.
//!
//! [`pipeline`] strings them together with apktool, apksigner and the agent
//! library layout.
//!
//! ```
//! use easygadget::android::manifest::resolve_launcher_activity;
//! use easygadget::inject::inject_loader;
//!
//! let manifest = br#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.cool">
//!   <application>
//!     <activity android:name=".Main">
//!       <intent-filter>
//!         <action android:name="android.intent.action.MAIN"/>
//!         <category android:name="android.intent.category.LAUNCHER"/>
//!       </intent-filter>
//!     </activity>
//!   </application>
//! </manifest>"#;
//! let activity = resolve_launcher_activity(manifest).unwrap().unwrap();
//! assert_eq!(activity.class_name(), "com.cool.Main");
//!
//! let patched = inject_loader(".class public Lcom/cool/Main;\n.super Landroid/app/Activity;\n", "frida").unwrap();
//! assert!(patched.contains(".method public static constructor <clinit>()V"));
//! ```

pub mod android;
pub mod inject;
pub mod pipeline;
mod smali_parse;
mod smali_write;
pub mod tools;
pub mod types;
