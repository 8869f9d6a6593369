use clap::Parser;
use itools_runner::{
    config::{SlaveArgs, SlaveConfig},
    logging,
    slave::run_slave,
    transport::mpi::MpiTransport,
};
use std::process::exit;
use tracing::error;
use tracing_unwrap::ResultExt;

fn main() {
    let args = SlaveArgs::parse();

    let config = match SlaveConfig::resolve(args) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            exit(2)
        }
    };

    logging::init(config.verbose, config.log_file.as_deref())
        .expect("Failed to set up logging");

    if config.preflight_checks().is_err() {
        error!("Preflight checks failed, exiting");
        exit(2)
    }

    let transport = MpiTransport::initialize().expect_or_log("Failed to initialize MPI");

    if run_slave(transport, &config).is_err() {
        exit(1)
    }
}
