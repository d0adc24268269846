use std::{path::PathBuf, process::exit, time::Instant};
use structopt::StructOpt;
use vnctest::{config::Config, utils, Rounds, Settle};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "vnctest",
    about = "Boot guests under VNC in rounds, halt when a crash screen shows up."
)]
struct Settings {
    /// Launch command, run by bash. %p is replaced by the VNC display port, %c by the
    /// instance counter, %h by the VNC host.
    #[structopt(long)]
    qemu: Option<String>,
    /// Number of parallel instances.
    #[structopt(short = "n", default_value = "1")]
    instances: usize,
    /// VNC display of the first instance, instance i listens on 5900 + base + i.
    #[structopt(long = "vncbaseport", default_value = "77")]
    base_port: u16,
    /// Host the VNC servers listen on.
    #[structopt(long = "vnchost", default_value = "localhost")]
    host: String,
    /// Only print the color histogram of the screen at host:port.
    #[structopt(long)]
    histogram: Option<String>,
    /// Time to wait after launch before the guest is looked at, e.g. 500msec, 30sec, 2min.
    /// Required unless --histogram is given.
    #[structopt(long)]
    settle: Option<Settle>,
    /// Do not kill processes of previous runs.
    #[structopt(long)]
    disable_cgroup: bool,
    /// Directory of the cgroup tracking spawned processes.
    #[structopt(long, default_value = "/sys/fs/cgroup/systemd/vnctest")]
    cgroup_dir: PathBuf,
    /// 0 runs once, negative forever, positive that many rounds.
    #[structopt(long, default_value = "1", allow_hyphen_values = true)]
    rounds: i64,
    /// Screens with fewer distinct colors are treated as crashed.
    #[structopt(long, default_value = "30")]
    threshold: usize,
    /// Directory screenshots are saved to.
    #[structopt(long, default_value = "/tmp")]
    out_dir: PathBuf,
    /// Command run with the path of every saved screenshot.
    #[structopt(long)]
    viewer: Option<String>,
    /// Timeout of connecting to a VNC server.
    #[structopt(long, default_value = "10sec")]
    connect_timeout: Settle,
}

pub fn main() {
    let started_at = Instant::now();
    let settings = Settings::from_args();
    let level = if utils::debug() {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    if let Err(e) = simplelog::CombinedLogger::init(vec![simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )]) {
        eprintln!("failed to init logger: {}", e);
    }

    if let Some(addr) = settings.histogram.as_ref() {
        if let Err(e) = vnctest::probe(addr, Some(settings.connect_timeout.0)) {
            eprintln!("{}", e);
            exit(e.exit_code());
        }
        return;
    }

    let conf = match round_config(settings) {
        Ok(c) => c,
        Err(missing) => usage_error(&format!("{} is required", missing)),
    };

    if let Err(e) = vnctest::start(conf, started_at) {
        eprintln!("{}", e);
        exit(e.exit_code());
    }
}

/// Config of the round mode, or the name of a missing required flag.
fn round_config(settings: Settings) -> Result<Config, &'static str> {
    let qemu = settings.qemu.ok_or("--qemu")?;
    let settle = settings.settle.ok_or("--settle")?;
    Ok(Config {
        qemu,
        instances: settings.instances,
        base_port: settings.base_port,
        host: settings.host,
        settle: settle.0,
        disable_cgroup: settings.disable_cgroup,
        cgroup_dir: settings.cgroup_dir,
        rounds: Rounds::from_count(settings.rounds),
        threshold: settings.threshold,
        out_dir: settings.out_dir,
        viewer: settings.viewer,
        connect_timeout: Some(settings.connect_timeout.0),
    })
}

fn usage_error(msg: &str) -> ! {
    eprintln!("{}\n", msg);
    let _ = Settings::clap().print_help();
    println!();
    exit(1)
}
