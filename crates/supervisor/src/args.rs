//! Compiles [`EncodeOptions`] into an av1an argument vector.
//!
//! The build is pure: the same options always produce the same arguments.
//! Fields left as `Inherit` or `Disabled` never produce an argument, with one
//! exception: an inherited `overwrite_output` still emits `-y`, because av1an
//! would otherwise stop at an interactive prompt nobody can answer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};

use crate::options::{
    CustomParam, EncodeOptions, Encoder, Field, ParamSet, ParamSyntax, ParamValue,
    ProbeVideoParams, Verbosity,
};

/// Encoder av1an falls back to when none is selected
const DEFAULT_ENCODER: Encoder = Encoder::Aom;

/// Argument vector for spawning, plus a quoted variant for logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArgs {
    pub argv: Vec<String>,
    /// Same arguments with paths and free text wrapped in quotes. Never pass
    /// this to a shell or a process.
    pub display: Vec<String>,
}

impl BuiltArgs {
    pub fn display_line(&self) -> String {
        self.display.join(" ")
    }
}

/// Collects arguments, skipping any flag a custom entry overrides
struct ArgWriter<'a> {
    argv: Vec<String>,
    display: Vec<String>,
    overridden: BTreeSet<&'a str>,
}

impl<'a> ArgWriter<'a> {
    fn new(custom: &'a BTreeMap<String, Field<CustomParam>>) -> Self {
        let overridden = custom
            .iter()
            .filter(|(_, field)| field.is_set())
            .map(|(name, _)| name.trim_start_matches('-'))
            .collect();
        Self {
            argv: Vec::new(),
            display: Vec::new(),
            overridden,
        }
    }

    fn raw(&mut self, arg: String, shown: String) {
        self.argv.push(arg);
        self.display.push(shown);
    }

    fn allowed(&self, flag: &str) -> bool {
        !self.overridden.contains(flag.trim_start_matches('-'))
    }

    fn flag(&mut self, flag: &str) {
        if self.allowed(flag) {
            self.raw(flag.to_string(), flag.to_string());
        }
    }

    fn value(&mut self, flag: &str, value: impl Display) {
        if self.allowed(flag) {
            self.raw(flag.to_string(), flag.to_string());
            let value = value.to_string();
            self.raw(value.clone(), value);
        }
    }

    fn quoted(&mut self, flag: &str, value: &str) {
        if self.allowed(flag) {
            self.raw(flag.to_string(), flag.to_string());
            self.raw(value.to_string(), quote(value));
        }
    }

    fn switch(&mut self, flag: &str, field: &Field<bool>) {
        if field.value() == Some(&true) {
            self.flag(flag);
        }
    }

    fn opt<T: Display>(&mut self, flag: &str, field: &Field<T>) {
        if let Some(value) = field.value() {
            self.value(flag, value);
        }
    }

    fn opt_text(&mut self, flag: &str, field: &Field<String>) {
        if let Some(value) = field.value() {
            self.quoted(flag, value);
        }
    }

    fn opt_path(&mut self, flag: &str, field: &Field<PathBuf>) {
        if let Some(path) = field.value() {
            self.quoted(flag, &path_arg(path));
        }
    }

    fn finish(self) -> BuiltArgs {
        BuiltArgs {
            argv: self.argv,
            display: self.display,
        }
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Build the av1an arguments for `options`
pub fn build(options: &EncodeOptions) -> BuiltArgs {
    let mut w = ArgWriter::new(&options.custom);

    // Input and output are never overridable
    w.raw("-i".to_string(), "-i".to_string());
    let input = path_arg(&options.input);
    w.raw(input.clone(), quote(&input));
    w.raw("-o".to_string(), "-o".to_string());
    let output = path_arg(&options.output);
    w.raw(output.clone(), quote(&output));

    match options.overwrite_output {
        Field::Inherit | Field::Set(true) => w.flag("-y"),
        Field::Set(false) => w.flag("-n"),
        Field::Disabled => {}
    }

    w.opt_path("--temp", &options.temp);
    w.switch("--keep", &options.keep_temp);
    w.switch("--resume", &options.resume);

    let logging = &options.logging;
    w.opt_path("--log-file", &logging.path);
    if let Some(level) = logging.level.value() {
        w.value("--log-level", level.as_arg());
    }
    match logging.verbosity.value() {
        Some(Verbosity::Quiet) => w.flag("--quiet"),
        Some(Verbosity::Verbose) => w.flag("--verbose"),
        Some(Verbosity::Normal) | None => {}
    }

    let scenes = &options.scenes;
    w.opt_path("--scenes", &scenes.path);
    w.switch("--sc-only", &scenes.detection_only);
    if let Some(method) = scenes.method.value() {
        w.value("--sc-method", method.as_arg());
    }
    if let Some(method) = scenes.split_method.value() {
        w.value("--split-method", method.as_arg());
    }
    w.opt("--sc-pix-format", &scenes.pix_format);
    w.opt("--sc-downscale-height", &scenes.downscale_height);
    w.opt("--extra-split", &scenes.extra_split);
    w.opt("--extra-split-sec", &scenes.extra_split_seconds);
    w.opt("--min-scene-len", &scenes.min_scene_len);

    let chunking = &options.chunking;
    if let Some(method) = chunking.method.value() {
        w.value("--chunk-method", method.as_arg());
    }
    if let Some(order) = chunking.order.value() {
        w.value("--chunk-order", order.as_arg());
    }
    if let Some(concat) = chunking.concat.value() {
        w.value("--concat", concat.as_arg());
    }
    w.opt("--workers", &chunking.workers);
    w.opt("--set-thread-affinity", &chunking.set_thread_affinity);
    w.opt("--max-tries", &chunking.max_tries);
    w.switch("--ignore-frame-mismatch", &chunking.ignore_frame_mismatch);

    let video = &options.video;
    let encoder = video.encoder.value();
    if let Some(selected) = encoder {
        w.value("--encoder", selected.encoder.as_arg());
        let params = video_params(selected.encoder, &selected.set);
        if !params.is_empty() {
            w.quoted("--video-params", &params);
        }
    }
    w.opt("--passes", &video.passes);
    w.opt("--pix-format", &video.pix_format);
    w.switch("--tile-auto", &video.tile_auto);
    w.opt("--photon-noise", &video.photon_noise);
    w.switch("--chroma-noise", &video.chroma_noise);
    w.opt_text("--ffmpeg", &video.ffmpeg_filter);
    w.opt_text("--audio-params", &video.audio_params);

    let vmaf = &options.vmaf;
    w.switch("--vmaf", &vmaf.enabled);
    w.opt_path("--vmaf-path", &vmaf.path);
    w.opt("--vmaf-res", &vmaf.resolution);
    w.opt("--vmaf-threads", &vmaf.threads);
    w.opt_text("--vmaf-filter", &vmaf.filter);

    let tq = &options.target_quality;
    w.opt("--target-quality", &tq.target);
    w.opt("--probes", &tq.probes);
    w.opt("--probing-rate", &tq.probing_rate);
    w.switch("--probe-slow", &tq.probe_slow);
    w.opt("--min-q", &tq.min_q);
    w.opt("--max-q", &tq.max_q);
    match tq.probe_video_params.value() {
        Some(ProbeVideoParams::Copy) => w.value("--probe-video-params", "copy"),
        Some(ProbeVideoParams::Params(set)) => {
            let kind = encoder.map(|e| e.encoder).unwrap_or(DEFAULT_ENCODER);
            let params = video_params(kind, set);
            if !params.is_empty() {
                w.quoted("--probe-video-params", &params);
            }
        }
        None => {}
    }

    for (name, field) in &options.custom {
        if let Field::Set(param) = field {
            push_custom(&mut w, name, param);
        }
    }

    w.finish()
}

fn push_custom(w: &mut ArgWriter<'_>, name: &str, param: &CustomParam) {
    if !param.is_emitted() {
        return;
    }
    let flag = format!("{}{}", param.prefix(), name);
    match param.delimited_value() {
        None => w.raw(flag.clone(), flag),
        Some((delimiter, value)) if delimiter.trim().is_empty() => {
            w.raw(flag.clone(), flag);
            let shown = match param {
                CustomParam::String { .. } => quote(&value),
                _ => value.clone(),
            };
            w.raw(value, shown);
        }
        Some((delimiter, value)) => {
            let arg = format!("{}{}{}", flag, delimiter, value);
            w.raw(arg.clone(), arg);
        }
    }
}

/// Flatten a parameter set into one `--video-params` string using the
/// encoder's flag syntax. Custom entries replace structured entries of the
/// same name.
pub fn video_params(encoder: Encoder, set: &ParamSet) -> String {
    let overridden: BTreeSet<&str> = set
        .custom
        .iter()
        .filter(|(_, field)| field.is_set())
        .map(|(name, _)| name.trim_start_matches('-'))
        .collect();

    let mut tokens = Vec::new();
    for (name, field) in &set.params {
        let name = name.trim_start_matches('-');
        if overridden.contains(name) {
            continue;
        }
        let Field::Set(value) = field else {
            continue;
        };
        match value {
            ParamValue::Flag(true) => tokens.push(format!("--{}", name)),
            ParamValue::Flag(false) => {}
            other => tokens.push(match encoder.param_syntax() {
                ParamSyntax::Spaced => format!("--{} {}", name, other),
                ParamSyntax::Joined => format!("--{}={}", name, other),
            }),
        }
    }

    for (name, field) in &set.custom {
        let Field::Set(param) = field else {
            continue;
        };
        if !param.is_emitted() {
            continue;
        }
        let name = name.trim_start_matches('-');
        match param.delimited_value() {
            Some((delimiter, value)) => {
                tokens.push(format!("{}{}{}{}", param.prefix(), name, delimiter, value))
            }
            None => tokens.push(format!("{}{}", param.prefix(), name)),
        }
    }

    tokens.join(" ")
}
