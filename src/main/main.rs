use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use nt_coordinator::Coordinator;
use ntthread::logger::RuntimeLogger;
use ntthread::Process;

use crate::config::{CliOptions, ConfigFileOptions, ConfigOptions, LogLevel};

mod config;
mod scenario;

fn load_config_file(path: &str) -> anyhow::Result<ConfigFileOptions> {
    // read from stdin if the config filename is given as '-'
    let path = match path {
        "-" => "/dev/stdin",
        x => x,
    };
    let file =
        std::fs::File::open(path).context(format!("Could not open config file {path:?}"))?;
    serde_yaml::from_reader(file).context(format!("Could not parse configuration file {path:?}"))
}

fn main() -> anyhow::Result<()> {
    let options = CliOptions::parse();

    let config_file = match options.config.as_deref() {
        Some(path) => load_config_file(path)?,
        None => ConfigFileOptions::default(),
    };
    let config = ConfigOptions::new(config_file, options.clone());

    if options.show_config {
        eprintln!("{config:#?}");
        return Ok(());
    }

    let log_level: log::LevelFilter = config.general.log_level.unwrap_or(LogLevel::Info).into();
    RuntimeLogger::install(log_level).context("Could not install the logger")?;
    if log_level > log::STATIC_MAX_LEVEL {
        log::warn!(
            "Log level set to {}, but messages higher than {} have been compiled out",
            log_level,
            log::STATIC_MAX_LEVEL,
        );
    }

    let coordinator = Arc::new(Coordinator::new(config.coordinator.clone()));
    let process = Process::init(config.runtime.clone(), coordinator)
        .context("Could not initialize the process")?;
    log::debug!("running as process {}", process.pid());

    let scenario = config.scenario.clone();
    let exit_code = process.run(move || match scenario::run(&scenario) {
        Ok(summary) => {
            println!("{summary}");
            0
        }
        Err(e) => {
            log::error!("{e:?}");
            eprintln!("** Scenario failed: {e:#}");
            1
        }
    })?;

    // Only reached if workers outlived the initial thread. The process exits
    // with the last of them.
    log::info!("initial thread done with {exit_code}, waiting for the remaining threads");
    loop {
        std::thread::park();
    }
}
