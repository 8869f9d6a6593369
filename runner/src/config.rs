use crate::step::MAX_CORES_PER_RANK;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{fs::File, io::Error, path::PathBuf};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found")]
    FileNotFound,
    #[error("Failed to read the config file")]
    ReadFailed(#[from] Error),
    #[error("Failed to parse the config file")]
    ParseFailed(#[from] serde_yaml::Error),
    #[error("Missing required option --{0}")]
    MissingOption(&'static str),
    #[error("Preflight checks failed")]
    PreflightFailed,
}

/// command line of a worker rank
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Worker rank of the distributed task runner")]
pub struct SlaveArgs {
    /// local scratch directory
    #[arg(long)]
    pub tmp_dir: Option<PathBuf>,

    /// number of worker threads
    #[arg(long)]
    pub cores: Option<usize>,

    /// directory receiving the working directory of failed tasks
    #[arg(long)]
    pub archive_dir: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,

    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// yaml file providing defaults for the options above
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// content of the optional yaml config file
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SlaveConfigFile {
    #[serde(alias = "tmp")]
    pub tmp_dir: Option<PathBuf>,
    pub cores: Option<usize>,
    pub archive_dir: Option<PathBuf>,
    #[serde(default)]
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlaveConfig {
    pub tmp_dir: PathBuf,
    pub cores: usize,
    pub archive_dir: Option<PathBuf>,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

impl SlaveConfigFile {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            return Err(ConfigErrors::FileNotFound);
        }

        Ok(serde_yaml::from_reader(File::open(path)?)?)
    }
}

impl SlaveConfig {
    /// merge the command line over the config file, flags take precedence
    pub fn resolve(args: SlaveArgs) -> Result<Self, ConfigErrors> {
        let file = match args.config {
            Some(ref path) => SlaveConfigFile::load(path)?,
            None => SlaveConfigFile::default(),
        };

        Ok(Self {
            tmp_dir: args
                .tmp_dir
                .or(file.tmp_dir)
                .ok_or(ConfigErrors::MissingOption("tmp-dir"))?,
            cores: args
                .cores
                .or(file.cores)
                .ok_or(ConfigErrors::MissingOption("cores"))?,
            archive_dir: args.archive_dir.or(file.archive_dir),
            verbose: args.verbose || file.verbose,
            log_file: args.log_file.or(file.log_file),
        })
    }

    /// check the whole config and report every problem instead of stopping at the first one
    pub fn preflight_checks(&self) -> Result<(), ConfigErrors> {
        let mut contains_error = false;

        if !self.tmp_dir.is_dir() {
            error!(
                "tmp-dir {} does not exist or is not a directory",
                self.tmp_dir.to_string_lossy()
            );
            contains_error = true;
        }

        if let Some(ref archive_dir) = self.archive_dir {
            if !archive_dir.is_dir() {
                error!(
                    "archive-dir {} does not exist or is not a directory",
                    archive_dir.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if self.cores == 0 || self.cores > MAX_CORES_PER_RANK {
            error!(
                "cores must be between 1 and {MAX_CORES_PER_RANK}, got {}",
                self.cores
            );
            contains_error = true;
        }

        if contains_error {
            Err(ConfigErrors::PreflightFailed)
        } else {
            Ok(())
        }
    }
}
