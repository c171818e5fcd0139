//! Discovered plugin metadata.

use std::fmt;
use std::path::{Path, PathBuf};

use cuehost_core::ChannelCount;
use serde::{Deserialize, Serialize};

/// Binary plugin format. Selects which adapter drives an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginFormat {
    #[serde(rename = "VST2")]
    Vst2,
    #[serde(rename = "VST3")]
    Vst3,
    #[serde(rename = "AU")]
    Au,
    /// Reference processors compiled into the host.
    #[serde(rename = "BUILTIN")]
    Builtin,
}

impl PluginFormat {
    /// Classify a path by its extension.
    ///
    /// Shared-library extensions are only VST2 *candidates*; the probe
    /// decides whether the binary actually exports a VST2 entry point.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "vst3" => Some(Self::Vst3),
            "component" => Some(Self::Au),
            "vst" | "dll" | "so" | "dylib" => Some(Self::Vst2),
            _ => None,
        }
    }

    /// Lowercase tag used as the descriptor id prefix.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Vst2 => "vst2",
            Self::Vst3 => "vst3",
            Self::Au => "au",
            Self::Builtin => "builtin",
        }
    }
}

impl fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vst2 => write!(f, "VST2"),
            Self::Vst3 => write!(f, "VST3"),
            Self::Au => write!(f, "AU"),
            Self::Builtin => write!(f, "BUILTIN"),
        }
    }
}

impl std::str::FromStr for PluginFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vst2" => Ok(Self::Vst2),
            "vst3" => Ok(Self::Vst3),
            "au" => Ok(Self::Au),
            "builtin" => Ok(Self::Builtin),
            other => Err(format!("unknown plugin format '{other}'")),
        }
    }
}

/// Identity and capabilities of a plugin, as reported by a probe.
///
/// Immutable once discovered; a later scan may replace it wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// Stable id, `<format tag>:<format-specific unique id>`
    pub id: String,
    pub format: PluginFormat,
    pub path: PathBuf,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub is_instrument: bool,
    pub input_channels: ChannelCount,
    pub output_channels: ChannelCount,
    pub supports_offline_render: bool,
    pub has_editor: bool,
}

impl PluginDescriptor {
    /// Create a stereo effect descriptor; refine with the builder methods.
    pub fn new(
        format: PluginFormat,
        unique_id: impl fmt::Display,
        path: impl Into<PathBuf>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("{}:{unique_id}", format.tag()),
            format,
            path: path.into(),
            name: name.into(),
            vendor: String::new(),
            version: String::new(),
            is_instrument: false,
            input_channels: 2,
            output_channels: 2,
            supports_offline_render: true,
            has_editor: false,
        }
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn instrument(mut self, is_instrument: bool) -> Self {
        self.is_instrument = is_instrument;
        self
    }

    pub fn channels(mut self, inputs: ChannelCount, outputs: ChannelCount) -> Self {
        self.input_channels = inputs;
        self.output_channels = outputs;
        self
    }

    pub fn offline_render(mut self, supported: bool) -> Self {
        self.supports_offline_render = supported;
        self
    }

    pub fn editor(mut self, has_editor: bool) -> Self {
        self.has_editor = has_editor;
        self
    }
}

/// Information about a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterInfo {
    pub id: u32,
    pub name: String,
    pub min_value: f32,
    pub max_value: f32,
    pub default_value: f32,
    pub automatable: bool,
}

impl ParameterInfo {
    /// A parameter in the normalized `0.0..=1.0` range used by VST2 and VST3.
    pub fn normalized(id: u32, name: impl Into<String>, default_value: f32) -> Self {
        Self {
            id,
            name: name.into(),
            min_value: 0.0,
            max_value: 1.0,
            default_value: default_value.clamp(0.0, 1.0),
            automatable: true,
        }
    }

    /// Clamp `value` into the declared range.
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min_value, self.max_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            PluginFormat::from_path(Path::new("/p/Reverb.vst3")),
            Some(PluginFormat::Vst3)
        );
        assert_eq!(
            PluginFormat::from_path(Path::new("/p/Synth.COMPONENT")),
            Some(PluginFormat::Au)
        );
        assert_eq!(
            PluginFormat::from_path(Path::new("/p/delay.so")),
            Some(PluginFormat::Vst2)
        );
        assert_eq!(PluginFormat::from_path(Path::new("/p/readme.txt")), None);
        assert_eq!(PluginFormat::from_path(Path::new("/p/noext")), None);
    }

    #[test]
    fn test_descriptor_id_and_wire_shape() {
        let descriptor = PluginDescriptor::new(PluginFormat::Vst2, 1_234, "/p/x.so", "X")
            .vendor("Acme")
            .instrument(true)
            .channels(0, 2);
        assert_eq!(descriptor.id, "vst2:1234");

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["format"], "VST2");
        assert_eq!(json["isInstrument"], true);
        assert_eq!(json["inputChannels"], 0);
        assert_eq!(json["supportsOfflineRender"], true);
    }

    #[test]
    fn test_parameter_clamp() {
        let info = ParameterInfo::normalized(0, "Mix", 0.5);
        assert_eq!(info.clamp(2.0), 1.0);
        assert_eq!(info.clamp(-1.0), 0.0);
        assert_eq!(info.clamp(0.25), 0.25);
    }
}
