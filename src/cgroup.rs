//! Track every process this tool spawns, so the next run can kill leftovers.
//!
//! The tracker is a cgroup v1 directory: `tasks` lists member pids, writing a pid
//! to `cgroup.procs` moves that process (and its future children) into the group.
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    thread::sleep,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use thiserror::Error;

pub const CGROUP_DIR: &str = "/sys/fs/cgroup/systemd/vnctest";
const TASKS: &str = "tasks";
const PROCS: &str = "cgroup.procs";

/// Time given to terminated processes before they are killed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("bad pid '{line}' in {path}")]
    BadPid { path: PathBuf, line: String },
}

/// Bookkeeping of processes across invocations.
pub trait ProcessGroup {
    /// Terminates every member except ourself, returns true if there was none.
    fn clean(&mut self) -> Result<bool, CgroupError>;
    /// Members other than ourself that are still alive.
    fn remaining(&self) -> Result<Vec<u32>, CgroupError>;
    /// Adds `pid` to the group, once.
    fn register(&mut self, pid: u32) -> Result<(), CgroupError>;
}

pub struct Cgroup {
    dir: PathBuf,
    me: u32,
    grace: Duration,
}

impl Cgroup {
    /// Opens the group at `dir`, creating the directory if missing.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, CgroupError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|source| CgroupError::Create {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self {
            dir,
            me: std::process::id(),
            grace: GRACE_PERIOD,
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_pids(&self, name: &str) -> Result<Vec<u32>, CgroupError> {
        let path = self.dir.join(name);
        let content = fs::read_to_string(&path).map_err(|source| CgroupError::Read {
            path: path.clone(),
            source,
        })?;
        let mut pids = Vec::new();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let pid = line.parse::<u32>().map_err(|_| CgroupError::BadPid {
                path: path.clone(),
                line: line.to_string(),
            })?;
            pids.push(pid);
        }
        Ok(pids)
    }

    fn signal_all(&self, pids: &[u32], sig: Signal) {
        for &pid in pids {
            match kill(Pid::from_raw(pid as i32), sig) {
                Ok(_) | Err(Errno::ESRCH) => (),
                Err(e) => log::warn!("failed to send {} to {}: {}", sig, pid, e),
            }
        }
    }
}

impl ProcessGroup for Cgroup {
    fn clean(&mut self) -> Result<bool, CgroupError> {
        let pids = self.remaining()?;
        if pids.is_empty() {
            return Ok(true);
        }
        log::info!("terminating {} previous processes: {:?}", pids.len(), pids);
        self.signal_all(&pids, Signal::SIGTERM);
        sleep(self.grace);

        let pids = self.remaining()?;
        if !pids.is_empty() {
            log::info!("killing {} processes: {:?}", pids.len(), pids);
            self.signal_all(&pids, Signal::SIGKILL);
        }
        Ok(false)
    }

    fn remaining(&self) -> Result<Vec<u32>, CgroupError> {
        let mut pids = self.read_pids(TASKS)?;
        pids.retain(|&p| p != self.me);
        Ok(pids)
    }

    fn register(&mut self, pid: u32) -> Result<(), CgroupError> {
        if self.read_pids(TASKS)?.contains(&pid) || self.read_pids(PROCS)?.contains(&pid) {
            return Ok(());
        }
        let path = self.dir.join(PROCS);
        let mut f = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|source| CgroupError::Write {
                path: path.clone(),
                source,
            })?;
        writeln!(f, "{}", pid).map_err(|source| CgroupError::Write { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;

    fn fake_group(tasks: &str) -> (tempfile::TempDir, Cgroup) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(TASKS), tasks).unwrap();
        fs::write(dir.path().join(PROCS), "").unwrap();
        let cg = Cgroup::open(dir.path())
            .unwrap()
            .with_grace(Duration::from_millis(100));
        (dir, cg)
    }

    #[test]
    fn only_ourself_is_empty() {
        let me = std::process::id();
        let (_dir, mut cg) = fake_group(&format!("{}\n", me));
        assert!(cg.clean().unwrap());
        assert!(cg.remaining().unwrap().is_empty());
    }

    #[test]
    fn terminate_previous_processes() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let (_dir, mut cg) = fake_group(&format!("{}\n{}\n", std::process::id(), child.id()));
        assert!(!cg.clean().unwrap());
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }

    #[test]
    fn kill_after_grace() {
        use std::io::{BufRead, BufReader};
        use std::process::Stdio;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; echo ready; exec sleep 30")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut line = String::new();
        BufReader::new(child.stdout.take().unwrap())
            .read_line(&mut line)
            .unwrap();
        assert_eq!(line.trim(), "ready");

        let (_dir, mut cg) = fake_group(&format!("{}\n", child.id()));
        assert!(!cg.clean().unwrap());
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }

    #[test]
    fn gone_process_is_ignored() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let (_dir, mut cg) = fake_group(&format!("{}\n", pid));
        assert!(!cg.clean().unwrap());
    }

    #[test]
    fn bad_pid_line() {
        let (_dir, mut cg) = fake_group("12\nnot-a-pid\n");
        assert!(matches!(cg.clean(), Err(CgroupError::BadPid { .. })));
    }

    #[test]
    fn missing_tasks_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cg = Cgroup::open(dir.path().join("vnctest")).unwrap();
        assert!(cg.dir().is_dir());
        assert!(matches!(cg.clean(), Err(CgroupError::Read { .. })));
    }

    #[test]
    fn register_once() {
        let (dir, mut cg) = fake_group("");
        cg.register(4242).unwrap();
        cg.register(4242).unwrap();
        let procs = fs::read_to_string(dir.path().join(PROCS)).unwrap();
        assert_eq!(procs, "4242\n");
    }
}
