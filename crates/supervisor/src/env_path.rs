use std::env::{self, JoinPathsError};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Where a dependency binary should be taken from
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencySource {
    /// Whatever is already on PATH
    #[default]
    System,
    /// The copy bundled with the application, if one is known
    Packaged,
    /// An explicit binary path
    Custom(PathBuf),
}

/// User preference for a single dependency
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DependencyPath {
    pub source: DependencySource,
    /// Bundled binary location, filled in by the settings layer
    pub packaged: Option<PathBuf>,
}

impl DependencyPath {
    pub fn custom(path: impl Into<PathBuf>) -> Self {
        Self {
            source: DependencySource::Custom(path.into()),
            packaged: None,
        }
    }

    pub fn packaged(path: impl Into<PathBuf>) -> Self {
        Self {
            source: DependencySource::Packaged,
            packaged: Some(path.into()),
        }
    }

    /// The binary to use, or `None` to leave PATH alone
    pub fn binary(&self) -> Option<&Path> {
        match &self.source {
            DependencySource::System => None,
            DependencySource::Packaged => self.packaged.as_deref(),
            DependencySource::Custom(path) => Some(path.as_path()),
        }
    }
}

/// External programs av1an may need to find
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    VapourSynth,
    Lsmash,
    Ffms2,
    Av1an,
    Mkvmerge,
    Ffmpeg,
    Aomenc,
    Rav1e,
    SvtAv1,
    Vpxenc,
    X264,
    X265,
}

impl Dependency {
    /// Directories to put on PATH for the given binary. VapourSynth also
    /// needs its plugin directory so the source filters can be loaded.
    pub fn search_dirs(&self, binary: &Path) -> Vec<PathBuf> {
        let Some(dir) = binary.parent().filter(|d| !d.as_os_str().is_empty()) else {
            return Vec::new();
        };
        match self {
            Dependency::VapourSynth => vec![
                dir.to_path_buf(),
                dir.join("vapoursynth64").join("plugins"),
            ],
            _ => vec![dir.to_path_buf()],
        }
    }
}

/// Resolved preferences for every dependency
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DependencyPaths {
    pub vapoursynth: DependencyPath,
    pub lsmash: DependencyPath,
    pub ffms2: DependencyPath,
    pub av1an: DependencyPath,
    pub mkvmerge: DependencyPath,
    pub ffmpeg: DependencyPath,
    pub aomenc: DependencyPath,
    pub rav1e: DependencyPath,
    pub svt: DependencyPath,
    pub vpxenc: DependencyPath,
    pub x264: DependencyPath,
    pub x265: DependencyPath,
}

impl DependencyPaths {
    pub fn entries(&self) -> [(Dependency, &DependencyPath); 12] {
        [
            (Dependency::VapourSynth, &self.vapoursynth),
            (Dependency::Lsmash, &self.lsmash),
            (Dependency::Ffms2, &self.ffms2),
            (Dependency::Av1an, &self.av1an),
            (Dependency::Mkvmerge, &self.mkvmerge),
            (Dependency::Ffmpeg, &self.ffmpeg),
            (Dependency::Aomenc, &self.aomenc),
            (Dependency::Rav1e, &self.rav1e),
            (Dependency::SvtAv1, &self.svt),
            (Dependency::Vpxenc, &self.vpxenc),
            (Dependency::X264, &self.x264),
            (Dependency::X265, &self.x265),
        ]
    }
}

/// Build the PATH for the av1an process: every non-system dependency's
/// directory first, then the inherited entries.
pub fn resolve_path(
    deps: &DependencyPaths,
    inherited: Option<&OsStr>,
) -> Result<OsString, JoinPathsError> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for (dependency, preference) in deps.entries() {
        let Some(binary) = preference.binary() else {
            continue;
        };
        for dir in dependency.search_dirs(binary) {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }

    let prepended = dirs.len();
    if let Some(inherited) = inherited {
        for dir in env::split_paths(inherited) {
            if !dirs[..prepended].contains(&dir) {
                dirs.push(dir);
            }
        }
    }

    env::join_paths(dirs)
}

/// [`resolve_path`] against this process's PATH
pub fn resolve_current_path(deps: &DependencyPaths) -> Result<OsString, JoinPathsError> {
    let inherited = env::var_os("PATH");
    resolve_path(deps, inherited.as_deref())
}
