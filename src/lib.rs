//! Boot guests under VNC over and over, and stop the moment one of them shows a
//! crash screen.

#[macro_use]
extern crate lazy_static;

pub mod artifact;
pub mod cgroup;
pub mod classify;
pub mod config;
pub mod frame;
pub mod rfb;
pub mod round;
pub mod utils;
pub mod vm;

use crate::{
    artifact::{ArtifactError, Artifacts},
    cgroup::{Cgroup, CgroupError, ProcessGroup},
    classify::{Classifier, Histogram},
    config::{Config, ConfigError},
    rfb::{RfbError, RfbSession},
    round::{Orchestrator, Outcome, RoundConfig},
    vm::{LaunchError, QemuConfig, QemuLauncher},
};

use std::{time::Duration, time::Instant};

use thiserror::Error;

pub use config::{Rounds, Settle};

#[derive(Debug, Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("cgroup: {0}")]
    Cgroup(#[from] CgroupError),
    #[error("processes of a previous run survived cleanup: {0:?}")]
    StaleProcesses(Vec<u32>),
    #[error("{0}")]
    Launch(#[from] LaunchError),
    #[error("rfb: {0}")]
    Rfb(#[from] RfbError),
    #[error("{0}")]
    Artifact(#[from] ArtifactError),
    #[error("signal handler: {0}")]
    Signal(std::io::Error),
    #[error("spawn instance thread: {0}")]
    Thread(std::io::Error),
    #[error("instance thread exited without a result")]
    Lost,
}

impl Error {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::StaleProcesses(_) => 2,
            _ => 3,
        }
    }
}

/// Kills whatever a previous run left in the group, then puts us in it so every
/// guest we spawn is tracked for the next run.
pub fn evict_stale<P: ProcessGroup>(group: &mut P, me: u32) -> Result<(), Error> {
    if group.clean()? {
        log::info!("no previous processes");
    }
    let left = group.remaining()?;
    if !left.is_empty() {
        return Err(Error::StaleProcesses(left));
    }
    group.register(me)?;
    Ok(())
}

/// Runs the rounds described by `config`. Returns when all rounds passed or a
/// stop was requested, never returns after a crash was found.
pub fn start(config: Config, started_at: Instant) -> Result<(), Error> {
    config.check()?;

    if config.disable_cgroup {
        log::info!("process group cleanup disabled");
    } else {
        log::info!("cleaning up {}", config.cgroup_dir.display());
        let mut cg = Cgroup::open(&config.cgroup_dir)?;
        evict_stale(&mut cg, std::process::id())?;
    }
    utils::setup_signal_handler().map_err(Error::Signal)?;

    let launcher = QemuLauncher::with_config(QemuConfig {
        template: config.qemu.clone(),
        host: config.host.clone(),
        settle: config.settle,
    });
    let grabber = rfb::RfbGrabber {
        connect_timeout: config.connect_timeout,
    };
    let orchestrator = Orchestrator::new(
        RoundConfig {
            instances: config.instances,
            base_port: config.base_port,
            host: config.host.clone(),
            rounds: config.rounds,
        },
        launcher,
        grabber,
        Classifier::new(config.threshold),
        Artifacts::new(&config.out_dir, config.viewer.clone()),
        started_at,
    );

    match orchestrator.run()? {
        Outcome::Crashed(report) => {
            println!("{}", report);
            log::info!("halted, guests are left running for inspection");
            utils::halt()
        }
        Outcome::Finished { rounds } => {
            log::info!("{} rounds passed", rounds);
            Ok(())
        }
        Outcome::Stopped { rounds } => {
            log::info!("stopped after {} rounds", rounds);
            Ok(())
        }
    }
}

/// Captures one frame from `addr` and prints its color statistics.
pub fn probe(addr: &str, timeout: Option<Duration>) -> Result<(), Error> {
    let mut session = RfbSession::connect(addr, timeout)?;
    log::info!(
        "connected to '{}', rfb {:?}, {}x{}",
        session.name(),
        session.version(),
        session.width(),
        session.height()
    );
    session.inject_wake()?;
    let shot = session.capture()?;
    let hist = Histogram::of(&shot);
    println!("{}", hist.distinct());
    println!("{}x{}", shot.width(), shot.height());
    for (color, count) in hist.most_common() {
        println!(
            "#{:02x}{:02x}{:02x} {}",
            color[0], color[1], color[2], count
        );
    }
    Ok(())
}
