use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A configurable value that is either inherited from a parent default,
/// explicitly set, or explicitly disabled.
///
/// In JSON an absent key is `Inherit`, `null` is `Disabled` and any other
/// value is `Set`. Containers must mark every `Field` with `#[serde(default)]`
/// for the absent case to work, and with
/// `#[serde(skip_serializing_if = "Field::is_inherit")]` to write it back out
/// without turning `Inherit` into `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Inherit,
    Set(T),
    Disabled,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Inherit
    }
}

impl<T> Field<T> {
    pub fn is_inherit(&self) -> bool {
        matches!(self, Field::Inherit)
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Field::Set(_))
    }

    /// The explicit value, if there is one
    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Set(v) => Some(v),
            _ => None,
        }
    }

    /// Layer this field over `parent`: only `Inherit` falls through.
    pub fn overlay(self, parent: Field<T>) -> Field<T> {
        match self {
            Field::Inherit => parent,
            other => other,
        }
    }

    pub fn as_ref(&self) -> Field<&T> {
        match self {
            Field::Inherit => Field::Inherit,
            Field::Set(v) => Field::Set(v),
            Field::Disabled => Field::Disabled,
        }
    }
}

impl<T> From<T> for Field<T> {
    fn from(value: T) -> Self {
        Field::Set(value)
    }
}

impl<'de, T> Deserialize<'de> for Field<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => Field::Set(value),
            None => Field::Disabled,
        })
    }
}

impl<T> Serialize for Field<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Field::Set(value) => serializer.serialize_some(value),
            Field::Inherit | Field::Disabled => serializer.serialize_none(),
        }
    }
}

/// av1an log verbosity on the console
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_arg(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneDetectionMethod {
    Standard,
    Fast,
}

impl SceneDetectionMethod {
    pub fn as_arg(&self) -> &'static str {
        match self {
            SceneDetectionMethod::Standard => "standard",
            SceneDetectionMethod::Fast => "fast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SplitMethod {
    AvScenechange,
    None,
}

impl SplitMethod {
    pub fn as_arg(&self) -> &'static str {
        match self {
            SplitMethod::AvScenechange => "av-scenechange",
            SplitMethod::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMethod {
    Segment,
    Select,
    Ffms2,
    Lsmash,
    Dgdecnv,
    Bestsource,
    Hybrid,
}

impl ChunkMethod {
    pub fn as_arg(&self) -> &'static str {
        match self {
            ChunkMethod::Segment => "segment",
            ChunkMethod::Select => "select",
            ChunkMethod::Ffms2 => "ffms2",
            ChunkMethod::Lsmash => "lsmash",
            ChunkMethod::Dgdecnv => "dgdecnv",
            ChunkMethod::Bestsource => "bestsource",
            ChunkMethod::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkOrder {
    LongToShort,
    ShortToLong,
    Sequential,
    Random,
}

impl ChunkOrder {
    pub fn as_arg(&self) -> &'static str {
        match self {
            ChunkOrder::LongToShort => "long-to-short",
            ChunkOrder::ShortToLong => "short-to-long",
            ChunkOrder::Sequential => "sequential",
            ChunkOrder::Random => "random",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcatMethod {
    Ffmpeg,
    Mkvmerge,
    Ivf,
}

impl ConcatMethod {
    pub fn as_arg(&self) -> &'static str {
        match self {
            ConcatMethod::Ffmpeg => "ffmpeg",
            ConcatMethod::Mkvmerge => "mkvmerge",
            ConcatMethod::Ivf => "ivf",
        }
    }
}

/// How an encoder expects `--name value` pairs inside `--video-params`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSyntax {
    /// `--name value`
    Spaced,
    /// `--name=value`
    Joined,
}

/// Encoders av1an can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoder {
    Aom,
    Rav1e,
    #[serde(alias = "svt")]
    SvtAv1,
    Vpx,
    X264,
    X265,
}

impl Encoder {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Encoder::Aom => "aom",
            Encoder::Rav1e => "rav1e",
            Encoder::SvtAv1 => "svt-av1",
            Encoder::Vpx => "vpx",
            Encoder::X264 => "x264",
            Encoder::X265 => "x265",
        }
    }

    pub fn param_syntax(&self) -> ParamSyntax {
        match self {
            Encoder::SvtAv1 | Encoder::Rav1e => ParamSyntax::Spaced,
            Encoder::Aom | Encoder::Vpx | Encoder::X264 | Encoder::X265 => ParamSyntax::Joined,
        }
    }
}

/// Value of one structured encoder parameter
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Flag(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

fn default_prefix() -> String {
    "--".to_string()
}

fn default_delimiter() -> String {
    " ".to_string()
}

/// A user-declared flag that is not part of any structured schema.
///
/// Each kind carries the prefix and delimiter the target program expects.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CustomParam {
    String {
        #[serde(default = "default_prefix")]
        prefix: String,
        #[serde(default = "default_delimiter")]
        delimiter: String,
        value: String,
    },
    Number {
        #[serde(default = "default_prefix")]
        prefix: String,
        #[serde(default = "default_delimiter")]
        delimiter: String,
        value: f64,
    },
    Boolean {
        #[serde(default = "default_prefix")]
        prefix: String,
        value: bool,
    },
}

impl CustomParam {
    pub fn string(value: impl Into<String>) -> Self {
        CustomParam::String {
            prefix: default_prefix(),
            delimiter: default_delimiter(),
            value: value.into(),
        }
    }

    pub fn number(value: f64) -> Self {
        CustomParam::Number {
            prefix: default_prefix(),
            delimiter: default_delimiter(),
            value,
        }
    }

    pub fn boolean(value: bool) -> Self {
        CustomParam::Boolean {
            prefix: default_prefix(),
            value,
        }
    }

    pub fn prefix(&self) -> &str {
        match self {
            CustomParam::String { prefix, .. }
            | CustomParam::Number { prefix, .. }
            | CustomParam::Boolean { prefix, .. } => prefix,
        }
    }

    /// Delimiter and rendered value, or `None` for boolean params
    pub fn delimited_value(&self) -> Option<(&str, String)> {
        match self {
            CustomParam::String { delimiter, value, .. } => Some((delimiter, value.clone())),
            CustomParam::Number { delimiter, value, .. } => Some((delimiter, value.to_string())),
            CustomParam::Boolean { .. } => None,
        }
    }

    /// Whether this param produces any output at all
    pub fn is_emitted(&self) -> bool {
        !matches!(self, CustomParam::Boolean { value: false, .. })
    }
}

/// Structured encoder parameters plus named custom overrides
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParamSet {
    pub params: BTreeMap<String, Field<ParamValue>>,
    pub custom: BTreeMap<String, Field<CustomParam>>,
}

/// The selected encoder and its parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EncoderParams {
    pub encoder: Encoder,
    #[serde(flatten)]
    pub set: ParamSet,
}

impl EncoderParams {
    pub fn new(encoder: Encoder) -> Self {
        Self {
            encoder,
            set: ParamSet::default(),
        }
    }

    pub fn param(mut self, name: &str, value: ParamValue) -> Self {
        self.set.params.insert(name.to_string(), Field::Set(value));
        self
    }

    pub fn custom(mut self, name: &str, value: CustomParam) -> Self {
        self.set.custom.insert(name.to_string(), Field::Set(value));
        self
    }
}

/// Video parameters used by target-quality probes
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeVideoParams {
    /// Reuse the main encode's video params
    Copy,
    Params(ParamSet),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    pub path: Field<PathBuf>,
    pub level: Field<LogLevel>,
    pub verbosity: Field<Verbosity>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SceneOptions {
    /// Scene plan file; read if it exists, otherwise produced by a detection-only run
    pub path: Field<PathBuf>,
    pub detection_only: Field<bool>,
    pub method: Field<SceneDetectionMethod>,
    pub split_method: Field<SplitMethod>,
    pub pix_format: Field<String>,
    pub downscale_height: Field<u32>,
    pub extra_split: Field<u32>,
    pub extra_split_seconds: Field<f64>,
    pub min_scene_len: Field<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChunkingOptions {
    pub method: Field<ChunkMethod>,
    pub order: Field<ChunkOrder>,
    pub concat: Field<ConcatMethod>,
    pub workers: Field<u32>,
    pub set_thread_affinity: Field<u32>,
    pub max_tries: Field<u32>,
    pub ignore_frame_mismatch: Field<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VideoOptions {
    pub encoder: Field<EncoderParams>,
    pub passes: Field<u8>,
    pub pix_format: Field<String>,
    pub tile_auto: Field<bool>,
    pub photon_noise: Field<u32>,
    pub chroma_noise: Field<bool>,
    pub ffmpeg_filter: Field<String>,
    pub audio_params: Field<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VmafOptions {
    pub enabled: Field<bool>,
    pub path: Field<PathBuf>,
    pub resolution: Field<String>,
    pub threads: Field<u32>,
    pub filter: Field<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TargetQualityOptions {
    pub target: Field<f64>,
    pub probes: Field<u32>,
    pub probing_rate: Field<u32>,
    pub probe_slow: Field<bool>,
    pub min_q: Field<u32>,
    pub max_q: Field<u32>,
    pub probe_video_params: Field<ProbeVideoParams>,
}

/// Fully resolved options for one av1an run
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EncodeOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default)]
    pub overwrite_output: Field<bool>,
    #[serde(default)]
    pub temp: Field<PathBuf>,
    #[serde(default)]
    pub keep_temp: Field<bool>,
    #[serde(default)]
    pub resume: Field<bool>,
    #[serde(default)]
    pub logging: LoggingOptions,
    #[serde(default)]
    pub scenes: SceneOptions,
    #[serde(default)]
    pub chunking: ChunkingOptions,
    #[serde(default)]
    pub video: VideoOptions,
    #[serde(default)]
    pub vmaf: VmafOptions,
    #[serde(default)]
    pub target_quality: TargetQualityOptions,
    #[serde(default)]
    pub custom: BTreeMap<String, Field<CustomParam>>,
}

impl EncodeOptions {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            overwrite_output: Field::Inherit,
            temp: Field::Inherit,
            keep_temp: Field::Inherit,
            resume: Field::Inherit,
            logging: LoggingOptions::default(),
            scenes: SceneOptions::default(),
            chunking: ChunkingOptions::default(),
            video: VideoOptions::default(),
            vmaf: VmafOptions::default(),
            target_quality: TargetQualityOptions::default(),
            custom: BTreeMap::new(),
        }
    }

    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp.value().map(PathBuf::as_path)
    }

    pub fn scenes_path(&self) -> Option<&Path> {
        self.scenes.path.value().map(PathBuf::as_path)
    }

    /// Where av1an writes its log: the configured path, or `log.log` one
    /// level above the temp directory
    pub fn log_path(&self) -> Option<PathBuf> {
        if let Some(path) = self.logging.path.value() {
            return Some(path.clone());
        }
        let temp = self.temp_dir()?;
        let parent = temp.parent().unwrap_or(temp);
        Some(parent.join("log.log"))
    }

    /// Working directory for the av1an process
    pub fn working_dir(&self) -> Option<&Path> {
        match self.temp_dir() {
            Some(temp) => temp.parent().filter(|p| !p.as_os_str().is_empty()),
            None => self.output.parent().filter(|p| !p.as_os_str().is_empty()),
        }
    }

    /// The same options with scene detection forced to run on its own
    pub fn detection_only(&self) -> Self {
        let mut options = self.clone();
        options.scenes.detection_only = Field::Set(true);
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Holder {
        #[serde(default, skip_serializing_if = "Field::is_inherit")]
        workers: Field<u32>,
    }

    #[test]
    fn test_field_tri_state_from_json() {
        let absent: Holder = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.workers, Field::Inherit);

        let null: Holder = serde_json::from_str(r#"{"workers": null}"#).unwrap();
        assert_eq!(null.workers, Field::Disabled);

        let set: Holder = serde_json::from_str(r#"{"workers": 4}"#).unwrap();
        assert_eq!(set.workers, Field::Set(4));
    }

    #[test]
    fn test_field_tri_state_to_json() {
        let write = |workers| serde_json::to_string(&Holder { workers }).unwrap();
        assert_eq!(write(Field::Inherit), "{}");
        assert_eq!(write(Field::Disabled), r#"{"workers":null}"#);
        assert_eq!(write(Field::Set(4)), r#"{"workers":4}"#);

        let back: Holder = serde_json::from_str(&write(Field::Disabled)).unwrap();
        assert_eq!(back.workers, Field::Disabled);
    }

    #[test]
    fn test_field_overlay() {
        assert_eq!(Field::Inherit.overlay(Field::Set(2)), Field::Set(2));
        assert_eq!(Field::Set(1).overlay(Field::Set(2)), Field::Set(1));
        assert_eq!(Field::Disabled.overlay(Field::Set(2)), Field::<i32>::Disabled);
        assert_eq!(Field::<i32>::Inherit.overlay(Field::Inherit), Field::Inherit);
    }

    #[test]
    fn test_encode_options_from_json() {
        let json = r#"{
            "input": "in.mkv",
            "output": "out/out.mkv",
            "temp": "work/temp",
            "overwriteOutput": false,
            "video": {
                "encoder": {
                    "encoder": "svt-av1",
                    "params": { "crf": 30, "preset": 6, "film-grain": null },
                    "custom": { "tune": { "type": "number", "value": 0 } }
                }
            },
            "target_quality": { "probe_video_params": "copy" },
            "custom": { "extra": { "type": "boolean", "value": true } }
        }"#;
        let options: EncodeOptions = serde_json::from_str(json).unwrap();

        assert_eq!(options.input, PathBuf::from("in.mkv"));
        assert_eq!(options.temp_dir(), Some(Path::new("work/temp")));
        // unknown camelCase key is ignored, so overwrite stays inherited
        assert!(options.overwrite_output.is_inherit());

        let encoder = options.video.encoder.value().unwrap();
        assert_eq!(encoder.encoder, Encoder::SvtAv1);
        assert_eq!(encoder.set.params["crf"], Field::Set(ParamValue::Int(30)));
        assert_eq!(encoder.set.params["film-grain"], Field::Disabled);
        assert_eq!(encoder.set.custom["tune"], Field::Set(CustomParam::number(0.0)));
        assert_eq!(
            options.target_quality.probe_video_params,
            Field::Set(ProbeVideoParams::Copy)
        );
        assert_eq!(options.custom["extra"], Field::Set(CustomParam::boolean(true)));
    }

    #[test]
    fn test_log_path_defaults_next_to_temp() {
        let mut options = EncodeOptions::new("a.mkv", "b.mkv");
        assert_eq!(options.log_path(), None);

        options.temp = Field::Set(PathBuf::from("/work/job/temp"));
        assert_eq!(options.log_path(), Some(PathBuf::from("/work/job/log.log")));
        assert_eq!(options.working_dir(), Some(Path::new("/work/job")));

        options.logging.path = Field::Set(PathBuf::from("/logs/run.log"));
        assert_eq!(options.log_path(), Some(PathBuf::from("/logs/run.log")));
    }

    #[test]
    fn test_detection_only_copy() {
        let options = EncodeOptions::new("a.mkv", "b.mkv");
        let detect = options.detection_only();
        assert_eq!(detect.scenes.detection_only, Field::Set(true));
        assert!(options.scenes.detection_only.is_inherit());
    }

    #[test]
    fn test_param_syntax_per_encoder() {
        assert_eq!(Encoder::SvtAv1.param_syntax(), ParamSyntax::Spaced);
        assert_eq!(Encoder::Rav1e.param_syntax(), ParamSyntax::Spaced);
        assert_eq!(Encoder::Aom.param_syntax(), ParamSyntax::Joined);
        assert_eq!(Encoder::X265.param_syntax(), ParamSyntax::Joined);
    }
}
