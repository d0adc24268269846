//! Spawn qemu (or whatever the launch template runs) and check it survives the settle window.
use crate::{
    utils::{
        debug,
        io::{read_background, BackgroundIoHandle},
    },
    vm::{render_command, Instance, Launch, ManageVm},
};

use std::{
    io,
    os::unix::prelude::CommandExt,
    process::{Child, Command, ExitStatus, Stdio},
    thread::sleep,
    time::Duration,
};

use nix::unistd::setsid;
use thiserror::Error;

/// How long stderr of a dead VM is drained for the error report.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// Configuration of launching VMs.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    /// Shell command template, see [`render_command`].
    pub template: String,
    /// Host the VNC server listens on, substituted for `%h`.
    pub host: String,
    /// Time to wait after spawning before the VM is considered up.
    pub settle: Duration,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            template: String::new(),
            host: "localhost".to_string(),
            settle: Duration::from_secs(0),
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("spawn '{cmd}': {source}")]
    Spawn { cmd: String, source: io::Error },
    #[error("qemu dead: instance {index} exited with {status} within the settle window\ncmdline: {cmd}\nSTDERR:\n{stderr}")]
    EarlyExit {
        index: usize,
        status: ExitStatus,
        cmd: String,
        stderr: String,
    },
    #[error("wait: {0}")]
    Wait(#[from] io::Error),
}

pub struct QemuLauncher {
    cfg: QemuConfig,
}

impl QemuLauncher {
    pub fn with_config(cfg: QemuConfig) -> Self {
        Self { cfg }
    }
}

impl Launch for QemuLauncher {
    type Vm = QemuHandle;

    fn launch(&self, instance: &Instance) -> Result<QemuHandle, LaunchError> {
        let cmd = render_command(&self.cfg.template, instance, &self.cfg.host);
        let mut qemu_cmd = Command::new("bash");
        qemu_cmd
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if debug() {
            log::debug!("instance {} spawning: {}", instance.index, cmd);
        }
        // a session of its own, so ^C on the harness leaves the guest running.
        unsafe {
            qemu_cmd.pre_exec(|| {
                let _ = setsid();
                Ok(())
            });
        }
        let mut child = qemu_cmd.spawn().map_err(|source| LaunchError::Spawn {
            cmd: cmd.clone(),
            source,
        })?;
        let stdout = child.stdout.take().map(read_background);
        let stderr = child.stderr.take().map(read_background);
        let mut handle = QemuHandle {
            qemu: Some(child),
            stdout,
            stderr,
        };
        log::info!("instance {} started, pid {}", instance.index, handle.pid());

        sleep(self.cfg.settle);

        if let Some(status) = handle.try_wait()? {
            let stderr = handle
                .stderr
                .take()
                .map(|e| e.wait_finish(STDERR_DRAIN))
                .unwrap_or_default();
            return Err(LaunchError::EarlyExit {
                index: instance.index,
                status,
                cmd,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        Ok(handle)
    }
}

pub struct QemuHandle {
    qemu: Option<Child>,
    stdout: Option<BackgroundIoHandle>,
    stderr: Option<BackgroundIoHandle>,
}

impl QemuHandle {
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        match self.qemu.as_mut() {
            Some(qemu) => qemu.try_wait(),
            None => Ok(None),
        }
    }

    /// Output of the VM not consumed yet, stdout and stderr.
    pub fn output(&self) -> (Vec<u8>, Vec<u8>) {
        let take = |h: &Option<BackgroundIoHandle>| {
            h.as_ref().map(|h| h.current_data()).unwrap_or_default()
        };
        (take(&self.stdout), take(&self.stderr))
    }

    fn kill_qemu(&mut self) {
        if let Some(qemu) = self.qemu.as_mut() {
            let _ = qemu.kill();
            let _ = qemu.wait();
        }
        self.qemu = None;
        self.stdout = None;
        self.stderr = None;
    }
}

impl ManageVm for QemuHandle {
    fn pid(&self) -> u32 {
        self.qemu.as_ref().map(|q| q.id()).unwrap_or(0)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        match self.qemu.take() {
            Some(mut qemu) => qemu.wait(),
            None => Err(io::Error::new(io::ErrorKind::Other, "already reaped")),
        }
    }
}

impl Drop for QemuHandle {
    fn drop(&mut self) {
        self.kill_qemu();
    }
}
