//! Configuration file and command line parsing, using [serde] and [clap].
//!
//! The command line overrides the file, which overrides the defaults. Options
//! that can be given on the command line are `Option`s so that unset ones can
//! be filled in with [merge].

use std::str::FromStr;

use clap::{Args, Parser};
use merge::Merge;
use nt_coordinator::CoordinatorConfig;
use ntthread::RuntimeConfig;
use serde::{Deserialize, Serialize};

const START_HELP_TEXT: &str = "\
    Run a thread workload on the NT thread runtime, against an in-process \
    coordinator.";

#[derive(Debug, Clone, Parser)]
#[clap(name = "ntthread-run", about = START_HELP_TEXT, version)]
#[clap(next_display_order = None)]
pub struct CliOptions {
    /// Path to a YAML configuration file. Use '-' to read from stdin
    pub config: Option<String>,

    /// Exit after printing the final configuration
    #[clap(long)]
    pub show_config: bool,

    #[clap(flatten)]
    pub general: GeneralOptions,

    #[clap(flatten)]
    pub scenario: ScenarioOptions,
}

/// Options contained in a configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileOptions {
    #[serde(default)]
    pub general: GeneralOptions,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub scenario: ScenarioOptions,
}

/// Configuration after processing command-line and configuration file options.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigOptions {
    pub general: GeneralOptions,
    pub runtime: RuntimeConfig,
    pub coordinator: CoordinatorConfig,
    pub scenario: ScenarioOptions,
}

impl ConfigOptions {
    pub fn new(config_file: ConfigFileOptions, options: CliOptions) -> Self {
        Self {
            general: options
                .general
                .with_defaults(config_file.general)
                .with_defaults(GeneralOptions::default()),
            runtime: config_file.runtime,
            coordinator: config_file.coordinator,
            scenario: options
                .scenario
                .with_defaults(config_file.scenario)
                .with_defaults(ScenarioOptions::default()),
        }
    }
}

// these must all be Option types since they aren't required by the CLI, even if they're
// required in the configuration file
#[derive(Debug, Clone, Args, Serialize, Deserialize, Merge)]
#[clap(next_help_heading = "General (Override configured general options)")]
#[serde(deny_unknown_fields)]
pub struct GeneralOptions {
    /// Log level of output written on stdout. In release builds, messages at
    /// level 'trace' are always dropped
    #[clap(long, short = 'l', value_name = "level")]
    #[serde(default = "default_some_info")]
    pub log_level: Option<LogLevel>,
}

impl GeneralOptions {
    /// Replace unset (`None`) values of `base` with values from `default`.
    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

impl Default for GeneralOptions {
    fn default() -> Self {
        Self {
            log_level: default_some_info(),
        }
    }
}

#[derive(Debug, Clone, Args, Serialize, Deserialize, Merge)]
#[clap(next_help_heading = "Scenario (Override configured scenario options)")]
#[serde(deny_unknown_fields)]
pub struct ScenarioOptions {
    /// Worker threads created per iteration
    #[clap(long, short = 't', value_name = "N")]
    #[serde(default = "default_some_4")]
    pub threads: Option<u32>,

    /// Times to run the scenario
    #[clap(long, short = 'i', value_name = "K")]
    #[serde(default = "default_some_1")]
    pub iterations: Option<u32>,
}

impl ScenarioOptions {
    /// Replace unset (`None`) values of `base` with values from `default`.
    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            threads: default_some_4(),
            iterations: default_some_1(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Helper function for serde default `Some(LogLevel::Info)` values.
fn default_some_info() -> Option<LogLevel> {
    Some(LogLevel::Info)
}

/// Helper function for serde default `Some(4)` values.
fn default_some_4() -> Option<u32> {
    Some(4)
}

/// Helper function for serde default `Some(1)` values.
fn default_some_1() -> Option<u32> {
    Some(1)
}
