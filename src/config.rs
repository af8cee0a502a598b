use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use crate::acoustic::engine::FrequencySweep;
use crate::analyzer::{ANALYSIS_STOP_HZ, AnalysisSettings};
use crate::optimize::OptimizerSettings;
use crate::optimize::inverse::Observable;
use crate::optimize::solver::DefaultSolver;
use crate::tuning::{DEFAULT_DIAPASON_HZ, SemitoneTable};
use crate::MM_TO_M;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults, the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding one sub-directory per flute.
    pub data_dir: Option<PathBuf>,
    /// Fingering chart used when `--chart` is not given.
    pub fingering_chart: Option<PathBuf>,
    pub diapason_hz: f64,
    pub temperature_c: f64,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub sweep: SweepConfig,
    pub optimizer: OptimizerConfig,
    pub physics: PhysicsConfig,
    /// Note → semitone offsets merged over the built-in table.
    pub semitones: BTreeMap<String, i32>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            fingering_chart: None,
            diapason_hz: DEFAULT_DIAPASON_HZ,
            temperature_c: 25.0,
            workers: 0,
            sweep: SweepConfig::default(),
            optimizer: OptimizerConfig::default(),
            physics: PhysicsConfig::default(),
            semitones: BTreeMap::new(),
        }
    }
}

/// Frequency sweep for admittance curves (Hz).
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub start_hz: f64,
    /// End of the optimizer's before/after sweep.
    pub stop_hz: f64,
    /// End of the `analyze` sweep.
    pub analysis_stop_hz: f64,
    pub step_hz: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        let sweep = FrequencySweep::default();
        Self {
            start_hz: sweep.start_hz,
            stop_hz: sweep.stop_hz,
            analysis_stop_hz: ANALYSIS_STOP_HZ,
            step_hz: sweep.step_hz,
        }
    }
}

/// Chimney optimizer settings. Heights in millimeters.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub initial_chimney_mm: f64,
    pub min_chimney_mm: f64,
    pub max_chimney_mm: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub observable: Observable,
    pub low_freq_seed: bool,
    pub mode_shapes: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            initial_chimney_mm: 3.0,
            min_chimney_mm: 1.0,
            max_chimney_mm: 10.0,
            max_iterations: 200,
            tolerance: 1e-9,
            observable: Observable::default(),
            low_freq_seed: true,
            mode_shapes: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    pub losses: bool,
    /// Relative humidity, 0..1.
    pub humidity: f64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            losses: true,
            humidity: 0.5,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/traverso/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                Self::default()
            }
        }
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Flute data root: config value, else the XDG data directory.
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn sweep(&self) -> FrequencySweep {
        FrequencySweep {
            start_hz: self.sweep.start_hz,
            stop_hz: self.sweep.stop_hz,
            step_hz: self.sweep.step_hz,
        }
    }

    pub fn semitone_table(&self) -> SemitoneTable {
        SemitoneTable::with_overrides(&self.semitones)
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            sweep: FrequencySweep {
                stop_hz: self.sweep.analysis_stop_hz,
                ..self.sweep()
            },
            losses: self.physics.losses,
            humidity: self.physics.humidity,
            ..AnalysisSettings::default()
        }
    }

    pub fn optimizer_settings(&self) -> OptimizerSettings {
        let opt = &self.optimizer;
        OptimizerSettings {
            initial_chimney_m: opt.initial_chimney_mm * MM_TO_M,
            bounds_m: (opt.min_chimney_mm * MM_TO_M, opt.max_chimney_mm * MM_TO_M),
            sweep: self.sweep(),
            observable: opt.observable,
            low_freq_seed: opt.low_freq_seed,
            mode_shapes: opt.mode_shapes,
            losses: self.physics.losses,
            humidity: self.physics.humidity,
            ..OptimizerSettings::default()
        }
    }

    pub fn solver(&self) -> DefaultSolver {
        DefaultSolver {
            max_iterations: self.optimizer.max_iterations,
            tolerance: self.optimizer.tolerance,
            ..DefaultSolver::default()
        }
    }
}

/// Resolve the default flute data directory using XDG data directory.
pub fn default_data_dir() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        dirs.data_dir().join("flutes")
    } else {
        PathBuf::from("flutes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.diapason_hz, 415.0);
        assert_eq!(config.temperature_c, 25.0);
        assert_eq!(config.optimizer.observable, Observable::Reflection);
        assert_eq!(config.sweep().frequencies().len(), 2451);
        assert_eq!(config.analysis_settings().sweep.frequencies().len(), 1450);
        assert_eq!(
            config.analysis_settings().sweep.frequencies().len(),
            AnalysisSettings::default().sweep.frequencies().len()
        );
        let settings = config.optimizer_settings();
        assert!((settings.initial_chimney_m - 0.003).abs() < 1e-15);
        assert!((settings.bounds_m.1 - 0.010).abs() < 1e-15);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            diapason_hz = 440.0
            workers = 3

            [optimizer]
            max_chimney_mm = 12.0
            observable = "impedance_phase"

            [physics]
            losses = false

            [semitones]
            F = -4
            A = 12
            "#,
        )
        .unwrap();
        assert_eq!(config.diapason_hz, 440.0);
        assert_eq!(config.resolve_workers(), 3);
        assert_eq!(config.optimizer.min_chimney_mm, 1.0);
        assert_eq!(config.optimizer.observable, Observable::ImpedancePhase);
        assert!(!config.analysis_settings().losses);
        assert_eq!(config.analysis_settings().humidity, 0.5);
        assert_eq!(config.solver().max_iterations, 200);

        let table = config.semitone_table();
        assert_eq!(table.offset("F"), Some(-4));
        assert_eq!(table.offset("A"), Some(12));
        assert_eq!(table.offset("D"), Some(-7));
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "diapason_hz = \"high\"").unwrap();
        let config = AppConfig::load_from(&path);
        assert_eq!(config.diapason_hz, 415.0);

        std::fs::write(&path, "temperature_c = 18.5").unwrap();
        assert_eq!(AppConfig::load_from(&path).temperature_c, 18.5);
    }

    #[test]
    fn auto_workers_is_at_least_one() {
        assert!(AppConfig::default().resolve_workers() >= 1);
    }
}
