//! Drain child pipes in the background so a chatty VM never blocks on a full pipe.
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread::sleep;
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Runtime};

use crate::utils::debug;

lazy_static! {
    static ref RUNTIME: Runtime = Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("vnctest-bg-io")
        .enable_all()
        .build()
        .expect("Failed to init tokio runtime.");
}

pub fn runtime() -> &'static Runtime {
    &RUNTIME
}

/// Spawns a background task copying everything readable from `f` into a shared buffer.
pub fn read_background<T: IntoRawFd>(f: T) -> BackgroundIoHandle {
    let fd = f.into_raw_fd();
    let f = unsafe { std::fs::File::from_raw_fd(fd) };
    let mut f = tokio::fs::File::from_std(f);
    let buf = Arc::new(Mutex::new(Vec::with_capacity(1024)));
    let finished = Arc::new(AtomicBool::new(false));
    let buf1 = Arc::clone(&buf);
    let finished1 = Arc::clone(&finished);

    runtime().spawn(async move {
        use tokio::io::AsyncReadExt;

        let mut chunk = [0_u8; 4096];
        while let Ok(sz) = f.read(&mut chunk).await {
            if sz == 0 {
                break;
            }
            if let Ok(mut shared_buf) = buf1.lock() {
                shared_buf.extend(&chunk[..sz]);
            }
            if debug() {
                log::debug!("{}", String::from_utf8_lossy(&chunk[..sz]).trim_end());
            }
        }
        finished1.store(true, Ordering::Release);
    });

    BackgroundIoHandle { buf, finished }
}

pub struct BackgroundIoHandle {
    buf: Arc<Mutex<Vec<u8>>>,
    finished: Arc<AtomicBool>,
}

impl BackgroundIoHandle {
    /// Takes what has been read so far.
    pub fn current_data(&self) -> Vec<u8> {
        match self.buf.lock() {
            Ok(mut buf) => buf.split_off(0),
            Err(_) => Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Waits for EOF at most `timeout`, then returns whatever was collected.
    ///
    /// A grandchild of the launch shell may inherit the pipe and keep it open
    /// long after the shell itself died, so EOF is not guaranteed.
    pub fn wait_finish(self, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() && Instant::now() < deadline {
            sleep(Duration::from_millis(10));
        }
        self.current_data()
    }
}
