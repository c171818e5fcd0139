//! Audio Unit bundle probing.
//!
//! Audio Units are discovered from the `AudioComponents` array in a
//! `.component` bundle's `Contents/Info.plist`. Instantiation needs the
//! AudioToolbox component manager, which this host does not link, so
//! `load` always reports `Unsupported`.

use cuehost_plugin::{PluginDescriptor, PluginError, PluginFormat};
use std::path::Path;

/// Component type codes that produce audio without an input
const INSTRUMENT_TYPES: [&str; 2] = ["aumu", "augn"];

/// First `AudioComponents` entry of a bundle's Info.plist
#[derive(Debug, Default, PartialEq, Eq)]
struct ComponentEntry {
    name: String,
    component_type: String,
    version: String,
}

/// Probe a `.component` bundle.
pub fn probe(path: &Path) -> Result<PluginDescriptor, PluginError> {
    if path.extension().and_then(|e| e.to_str()) != Some("component") || !path.is_dir() {
        return Err(PluginError::FormatError(format!(
            "{} is not an Audio Unit bundle",
            path.display()
        )));
    }

    let plist_path = path.join("Contents").join("Info.plist");
    let plist = std::fs::read_to_string(&plist_path).map_err(|e| {
        PluginError::FormatError(format!("Failed to read {}: {e}", plist_path.display()))
    })?;
    let entry = parse_audio_component(&plist).ok_or_else(|| {
        PluginError::FormatError(format!(
            "{} declares no AudioComponents",
            plist_path.display()
        ))
    })?;

    let bundle = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| PluginError::FormatError("Invalid bundle name".to_string()))?;

    // AU component names are "Manufacturer: Plugin".
    let (vendor, name) = entry
        .name
        .split_once(':')
        .map_or(("", entry.name.as_str()), |(v, n)| (v.trim(), n.trim()));
    let instrument = INSTRUMENT_TYPES.contains(&entry.component_type.as_str());
    tracing::debug!("Probed AU bundle {bundle} ({})", entry.component_type);

    Ok(
        PluginDescriptor::new(PluginFormat::Au, bundle, path, if name.is_empty() { bundle } else { name })
            .vendor(vendor)
            .version(entry.version)
            .instrument(instrument)
            .channels(if instrument { 0 } else { 2 }, 2),
    )
}

/// Audio Units cannot be instantiated by this host.
pub fn load(descriptor: &PluginDescriptor) -> Result<std::convert::Infallible, PluginError> {
    Err(PluginError::Unsupported(format!(
        "Audio Unit '{}' cannot be instantiated: AudioToolbox hosting is not available",
        descriptor.name
    )))
}

fn parse_audio_component(plist: &str) -> Option<ComponentEntry> {
    let start = plist.find("<key>AudioComponents</key>")?;
    let section = &plist[start..];
    let dict_start = section.find("<dict>")?;
    let dict_end = section[dict_start..].find("</dict>")? + dict_start;
    let dict = &section[dict_start..dict_end];

    let mut entry = ComponentEntry {
        name: string_value(dict, "name").unwrap_or_default(),
        component_type: string_value(dict, "type").unwrap_or_default(),
        version: String::new(),
    };
    if let Some(version) = string_value(plist, "CFBundleShortVersionString") {
        entry.version = version;
    }
    Some(entry)
}

/// The `<string>` (or `<integer>`) following `<key>key</key>`.
fn string_value(xml: &str, key: &str) -> Option<String> {
    let marker = format!("<key>{key}</key>");
    let rest = &xml[xml.find(&marker)? + marker.len()..];
    let rest = rest.trim_start();
    let (open, close) = if rest.starts_with("<string>") {
        ("<string>", "</string>")
    } else if rest.starts_with("<integer>") {
        ("<integer>", "</integer>")
    } else {
        return None;
    };
    let value = &rest[open.len()..];
    Some(value[..value.find(close)?].trim().to_string())
}
