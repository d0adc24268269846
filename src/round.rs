//! Rounds of launching instances, watching their displays and deciding whether to stop.
//!
//! A round launches every instance in its own thread. Each thread delivers exactly
//! one [`RoundResult`] and then reaps its VM. The orchestrator waits for all of
//! them before reporting; a crash ends the run in [`Outcome::Crashed`], which the
//! caller turns into a permanent halt.
use crate::{
    artifact::Artifacts,
    classify::{Classifier, Histogram, Verdict},
    config::Rounds,
    frame::Screenshot,
    rfb::{Grab, RfbError},
    utils::stop_soon,
    vm::{Instance, Launch, ManageVm},
    Error,
};

use std::{
    fmt,
    path::PathBuf,
    sync::{
        mpsc::{channel, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Outcome of one instance in one round.
pub enum RoundResult {
    Captured {
        instance: Instance,
        pid: u32,
        screenshot: Screenshot,
        histogram: Histogram,
        verdict: Verdict,
    },
    /// The display could not be reached, the instance is left out of the verdict.
    Failed { instance: Instance, error: RfbError },
}

impl RoundResult {
    pub fn instance(&self) -> &Instance {
        match self {
            RoundResult::Captured { instance, .. } | RoundResult::Failed { instance, .. } => {
                instance
            }
        }
    }
}

/// What is printed when a crashed display is found.
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub index: usize,
    pub pid: u32,
    pub elapsed: Duration,
    pub screen: PathBuf,
    pub display_port: u16,
    pub colors: usize,
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Found BSOD in pid {} after {:?} screen {} on VNC port {} ({} colors)",
            self.pid,
            self.elapsed,
            self.screen.display(),
            self.display_port,
            self.colors
        )
    }
}

/// A healthy instance of a finished round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Healthy {
    pub index: usize,
    pub pid: u32,
    pub colors: usize,
}

/// Everything reported about one round.
#[derive(Debug, Default)]
pub struct RoundReport {
    pub elapsed: Duration,
    pub healthy: Vec<Healthy>,
    /// Instances whose display could not be captured, with the reason.
    pub failed: Vec<(usize, String)>,
    pub crash: Option<CrashReport>,
}

impl RoundReport {
    /// `pid <pid> hist <colors> ` for every healthy instance.
    pub fn healthy_summary(&self) -> String {
        let mut s = String::new();
        for h in &self.healthy {
            s.push_str(&format!("pid {} hist {} ", h.pid, h.colors));
        }
        s
    }

    /// Healthy instances, then the elapsed time.
    pub fn summary(&self) -> String {
        format!("{}{:?} passed", self.healthy_summary(), self.elapsed)
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// A crashed display was found, nothing may touch the guests anymore.
    Crashed(CrashReport),
    /// All configured rounds passed.
    Finished { rounds: u64 },
    /// Stop requested by a signal between rounds.
    Stopped { rounds: u64 },
}

#[derive(Debug, Clone)]
pub struct RoundConfig {
    pub instances: usize,
    pub base_port: u16,
    pub host: String,
    pub rounds: Rounds,
}

pub struct Orchestrator<L, G> {
    cfg: RoundConfig,
    launcher: Arc<L>,
    grabber: Arc<G>,
    classifier: Classifier,
    artifacts: Artifacts,
    started_at: Instant,
}

/// Threads of a round, each reaps its VM before exiting.
struct Tasks(Vec<JoinHandle<()>>);

impl Tasks {
    fn reap(self) {
        for t in self.0 {
            if t.join().is_err() {
                log::warn!("instance thread panicked");
            }
        }
    }
}

impl<L: Launch, G: Grab> Orchestrator<L, G> {
    pub fn new(
        cfg: RoundConfig,
        launcher: L,
        grabber: G,
        classifier: Classifier,
        artifacts: Artifacts,
        started_at: Instant,
    ) -> Self {
        Self {
            cfg,
            launcher: Arc::new(launcher),
            grabber: Arc::new(grabber),
            classifier,
            artifacts,
            started_at,
        }
    }

    /// Runs rounds until a crash is found, the round count is exhausted or a stop
    /// is requested. Fatal errors of any instance abort immediately.
    pub fn run(&self) -> Result<Outcome, Error> {
        let mut left = self.cfg.rounds;
        let mut round = 0;
        loop {
            let (report, tasks) = self.run_round(round)?;
            round += 1;
            if let Some(ref crash) = report.crash {
                if !report.healthy.is_empty() {
                    println!("{}", report.healthy_summary().trim_end());
                }
                // the crashed guest must stay up, its thread keeps waiting on it.
                return Ok(Outcome::Crashed(crash.clone()));
            }
            println!("{}", report.summary());
            tasks.reap();

            left = match left.after_one() {
                Some(l) => l,
                None => return Ok(Outcome::Finished { rounds: round }),
            };
            if stop_soon() {
                return Ok(Outcome::Stopped { rounds: round });
            }
        }
    }

    /// One round: launch, collect exactly one result per instance, persist and
    /// classify. The returned tasks still have to be reaped.
    fn run_round(&self, round: u64) -> Result<(RoundReport, Tasks), Error> {
        let n = self.cfg.instances;
        log::info!("round {}: launching {} instances", round, n);
        let (tx, rx) = channel();
        let mut tasks = Vec::with_capacity(n);
        for i in 0..n {
            let instance = Instance::new(i, self.cfg.base_port);
            let tx = tx.clone();
            let launcher = Arc::clone(&self.launcher);
            let grabber = Arc::clone(&self.grabber);
            let classifier = self.classifier;
            let host = self.cfg.host.clone();
            let t = thread::Builder::new()
                .name(format!("vnctest-{}", i))
                .spawn(move || {
                    observe(&*launcher, &*grabber, &classifier, instance, &host, tx)
                })
                .map_err(Error::Thread)?;
            tasks.push(t);
        }
        drop(tx);

        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            match rx.recv() {
                Ok(r) => results.push(r?),
                Err(_) => return Err(Error::Lost),
            }
        }
        results.sort_by_key(|r| r.instance().index);

        let report = self.report(results)?;
        Ok((report, Tasks(tasks)))
    }

    fn report(&self, results: Vec<RoundResult>) -> Result<RoundReport, Error> {
        let mut report = RoundReport {
            elapsed: self.started_at.elapsed(),
            ..Default::default()
        };
        for r in results {
            match r {
                RoundResult::Captured {
                    instance,
                    pid,
                    screenshot,
                    histogram,
                    verdict,
                } => {
                    let screen = self.artifacts.persist(instance.index, &screenshot)?;
                    let colors = histogram.distinct();
                    log::info!(
                        "instance {} (pid {}): {}x{}, {} colors, {:?}",
                        instance.index,
                        pid,
                        screenshot.width(),
                        screenshot.height(),
                        colors,
                        verdict
                    );
                    if verdict == Verdict::Crashed {
                        if report.crash.is_none() {
                            report.crash = Some(CrashReport {
                                index: instance.index,
                                pid,
                                elapsed: report.elapsed,
                                screen,
                                display_port: instance.display_port,
                                colors,
                            });
                        }
                    } else {
                        report.healthy.push(Healthy {
                            index: instance.index,
                            pid,
                            colors,
                        });
                    }
                }
                RoundResult::Failed { instance, error } => {
                    println!("error getting {}: {}", instance.index, error);
                    report.failed.push((instance.index, error.to_string()));
                }
            }
        }
        Ok(report)
    }
}

/// Launch → connect → wake → capture → classify for one instance, then reap.
fn observe<L: Launch, G: Grab>(
    launcher: &L,
    grabber: &G,
    classifier: &Classifier,
    instance: Instance,
    host: &str,
    tx: Sender<Result<RoundResult, Error>>,
) {
    let mut vm = match launcher.launch(&instance) {
        Ok(vm) => vm,
        Err(e) => {
            let _ = tx.send(Err(e.into()));
            return;
        }
    };
    let pid = vm.pid();
    let result = match grabber.grab(&instance.rfb_addr(host)) {
        Ok(screenshot) => {
            let histogram = Histogram::of(&screenshot);
            let verdict = classifier.classify(&histogram);
            Ok(RoundResult::Captured {
                instance,
                pid,
                screenshot,
                histogram,
                verdict,
            })
        }
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(error) => Ok(RoundResult::Failed { instance, error }),
    };
    // the receiver is gone only when the run is already aborting.
    let _ = tx.send(result);
    drop(tx);

    match vm.wait() {
        Ok(status) => log::debug!("instance {} (pid {}) exited: {}", instance.index, pid, status),
        Err(e) => log::warn!("failed to reap instance {} (pid {}): {}", instance.index, pid, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{classify::frame_with_colors, vm::LaunchError};
    use std::{
        io,
        os::unix::process::ExitStatusExt,
        process::ExitStatus,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
    };

    struct FakeVm {
        pid: u32,
        reaped: Arc<AtomicUsize>,
        /// Guests stay up until this is set.
        shutdown: Arc<AtomicBool>,
    }

    impl ManageVm for FakeVm {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn wait(&mut self) -> io::Result<ExitStatus> {
            while !self.shutdown.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(10));
            }
            self.reaped.fetch_add(1, Ordering::SeqCst);
            Ok(ExitStatus::from_raw(0))
        }
    }

    struct FakeLauncher {
        launched: AtomicUsize,
        reaped: Arc<AtomicUsize>,
        shutdown: Arc<AtomicBool>,
        /// Instance index that dies during the settle window.
        dead: Option<usize>,
    }

    impl Default for FakeLauncher {
        fn default() -> Self {
            Self {
                launched: AtomicUsize::new(0),
                reaped: Arc::new(AtomicUsize::new(0)),
                shutdown: Arc::new(AtomicBool::new(true)),
                dead: None,
            }
        }
    }

    impl Launch for FakeLauncher {
        type Vm = FakeVm;

        fn launch(&self, instance: &Instance) -> Result<FakeVm, LaunchError> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            if self.dead == Some(instance.index) {
                return Err(LaunchError::EarlyExit {
                    index: instance.index,
                    status: ExitStatus::from_raw(1 << 8),
                    cmd: "qemu".to_string(),
                    stderr: String::new(),
                });
            }
            Ok(FakeVm {
                pid: 1000 + instance.index as u32,
                reaped: Arc::clone(&self.reaped),
                shutdown: Arc::clone(&self.shutdown),
            })
        }
    }

    enum Screen {
        Colors(usize),
        Refused,
        TwoRects,
        Panic,
    }

    /// Answers by display port, `port_base + index` picks the screen of an instance.
    struct FakeGrabber {
        screens: Mutex<Box<dyn FnMut(u16) -> Screen + Send>>,
        addrs: Mutex<Vec<String>>,
    }

    impl FakeGrabber {
        fn new<F: FnMut(u16) -> Screen + Send + 'static>(f: F) -> Self {
            Self {
                screens: Mutex::new(Box::new(f)),
                addrs: Mutex::new(Vec::new()),
            }
        }
    }

    impl Grab for FakeGrabber {
        fn grab(&self, addr: &str) -> Result<Screenshot, RfbError> {
            self.addrs.lock().unwrap().push(addr.to_string());
            let port = addr.rsplit(':').next().unwrap().parse::<u16>().unwrap();
            let screen = {
                let mut f = self.screens.lock().unwrap();
                (&mut *f)(port - 5900)
            };
            match screen {
                Screen::Colors(n) => Ok(frame_with_colors(8, 8, n)),
                Screen::Refused => Err(RfbError::Connect {
                    addr: addr.to_string(),
                    source: io::Error::from(io::ErrorKind::ConnectionRefused),
                }),
                Screen::TwoRects => Err(RfbError::RectCount(2)),
                Screen::Panic => panic!("grabber of {} panicked", addr),
            }
        }
    }

    fn orchestrator(
        n: usize,
        rounds: i64,
        launcher: FakeLauncher,
        grabber: FakeGrabber,
        dir: &tempfile::TempDir,
    ) -> Orchestrator<FakeLauncher, FakeGrabber> {
        Orchestrator::new(
            RoundConfig {
                instances: n,
                base_port: 77,
                host: "localhost".to_string(),
                rounds: Rounds::from_count(rounds),
            },
            launcher,
            grabber,
            Classifier::default(),
            Artifacts::new(dir.path(), None),
            Instant::now(),
        )
    }

    #[test]
    fn solid_screen_halts() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(
            1,
            5,
            FakeLauncher::default(),
            FakeGrabber::new(|_| Screen::Colors(1)),
            &dir,
        );
        match o.run().unwrap() {
            Outcome::Crashed(report) => {
                assert_eq!(report.pid, 1000);
                assert_eq!(report.display_port, 77);
                assert_eq!(report.colors, 1);
                assert!(report.screen.is_file());
                let line = report.to_string();
                assert!(line.contains("pid 1000"));
                assert!(line.contains(&format!("{:?}", report.elapsed)));
            }
            o => panic!("unexpected outcome {:?}", o),
        }
        assert_eq!(o.launcher.launched.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn healthy_rounds_finish() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(
            3,
            2,
            FakeLauncher::default(),
            FakeGrabber::new(|_| Screen::Colors(64)),
            &dir,
        );
        assert!(matches!(o.run().unwrap(), Outcome::Finished { rounds: 2 }));
        assert_eq!(o.launcher.launched.load(Ordering::SeqCst), 6);
        assert_eq!(o.launcher.reaped.load(Ordering::SeqCst), 6);

        let mut addrs = o.grabber.addrs.lock().unwrap().clone();
        addrs.sort();
        addrs.dedup();
        assert_eq!(
            addrs,
            vec!["localhost:5977", "localhost:5978", "localhost:5979"]
        );
    }

    #[test]
    fn zero_rounds_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(
            2,
            0,
            FakeLauncher::default(),
            FakeGrabber::new(|_| Screen::Colors(30)),
            &dir,
        );
        assert!(matches!(o.run().unwrap(), Outcome::Finished { rounds: 1 }));
        assert_eq!(o.launcher.launched.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn all_healthy_report() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(
            3,
            1,
            FakeLauncher::default(),
            FakeGrabber::new(|_| Screen::Colors(40)),
            &dir,
        );
        let (report, tasks) = o.run_round(0).unwrap();
        tasks.reap();
        assert!(report.crash.is_none());
        assert!(report.failed.is_empty());
        let pids = report.healthy.iter().map(|h| h.pid).collect::<Vec<_>>();
        assert_eq!(pids, vec![1000, 1001, 1002]);
        assert!(report.healthy.iter().all(|h| h.colors == 40));
        assert!(report.summary().starts_with("pid 1000 hist 40 pid 1001 hist 40 pid 1002 hist 40 "));
        assert!(report.summary().ends_with("passed"));
    }

    #[test]
    fn unreachable_display_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(
            3,
            1,
            FakeLauncher::default(),
            FakeGrabber::new(|port| {
                if port == 78 {
                    Screen::Refused
                } else {
                    Screen::Colors(100)
                }
            }),
            &dir,
        );
        let (report, tasks) = o.run_round(0).unwrap();
        tasks.reap();
        assert!(report.crash.is_none());
        assert_eq!(report.healthy.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 1);
        assert_eq!(o.launcher.reaped.load(Ordering::SeqCst), 3);

        assert!(matches!(o.run().unwrap(), Outcome::Finished { rounds: 1 }));
    }

    #[test]
    fn forever_until_crash() {
        let dir = tempfile::tempdir().unwrap();
        let mut calls = 0;
        // 2 instances, 5 healthy rounds, then instance 1 crashes.
        let grabber = FakeGrabber::new(move |port| {
            calls += 1;
            if calls > 10 && port == 78 {
                Screen::Colors(2)
            } else {
                Screen::Colors(50)
            }
        });
        let o = orchestrator(2, -1, FakeLauncher::default(), grabber, &dir);
        match o.run().unwrap() {
            Outcome::Crashed(report) => {
                assert_eq!(report.index, 1);
                assert_eq!(report.display_port, 78);
            }
            o => panic!("unexpected outcome {:?}", o),
        }
        assert_eq!(o.launcher.launched.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn two_rectangles_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(
            2,
            3,
            FakeLauncher::default(),
            FakeGrabber::new(|port| {
                if port == 77 {
                    Screen::TwoRects
                } else {
                    Screen::Colors(50)
                }
            }),
            &dir,
        );
        assert!(matches!(o.run(), Err(Error::Rfb(RfbError::RectCount(2)))));
    }

    #[test]
    fn dead_vm_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher {
            dead: Some(0),
            ..Default::default()
        };
        let o = orchestrator(2, 1, launcher, FakeGrabber::new(|_| Screen::Colors(50)), &dir);
        assert!(matches!(o.run(), Err(Error::Launch(LaunchError::EarlyExit { index: 0, .. }))));
    }

    #[test]
    fn healthy_context_of_a_crashed_round() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(
            3,
            1,
            FakeLauncher::default(),
            FakeGrabber::new(|port| {
                if port == 78 {
                    Screen::Colors(3)
                } else {
                    Screen::Colors(50)
                }
            }),
            &dir,
        );
        let (report, tasks) = o.run_round(0).unwrap();
        tasks.reap();
        assert_eq!(report.crash.as_ref().map(|c| c.index), Some(1));
        assert_eq!(report.healthy_summary(), "pid 1000 hist 50 pid 1002 hist 50 ");
    }

    #[test]
    fn panicked_instance_does_not_hang_the_round() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher {
            shutdown: Arc::new(AtomicBool::new(false)),
            ..Default::default()
        };
        let shutdown = Arc::clone(&launcher.shutdown);
        let grabber = FakeGrabber::new(|port| {
            if port == 77 {
                Screen::Panic
            } else {
                Screen::Colors(50)
            }
        });
        let o = orchestrator(2, 1, launcher, grabber, &dir);
        // instance 1 is still waiting on its guest when the round gives up.
        assert!(matches!(o.run(), Err(Error::Lost)));
        assert_eq!(o.launcher.reaped.load(Ordering::SeqCst), 0);
        shutdown.store(true, Ordering::SeqCst);
    }
}
