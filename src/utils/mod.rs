use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

pub mod io;

static STOP_SOON: AtomicBool = AtomicBool::new(false);
static HALTED: AtomicBool = AtomicBool::new(false);

lazy_static! {
    static ref DEBUG: bool = std::env::var("VNCTEST_DEBUG").is_ok();
}

/// Whether verbose output of child processes should be logged.
pub fn debug() -> bool {
    *DEBUG
}

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::Relaxed)
}

pub fn stop_req() {
    STOP_SOON.store(true, Ordering::Relaxed)
}

/// Block the calling thread forever, leaving every guest untouched for inspection.
pub fn halt() -> ! {
    HALTED.store(true, Ordering::SeqCst);
    loop {
        thread::park();
    }
}

/// First termination signal asks the round loop to stop after the current round,
/// a second one (or any signal while halted) exits right away.
pub fn setup_signal_handler() -> Result<(), std::io::Error> {
    use signal_hook::consts::*;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    fn named_signal(sig: c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS)?;
    thread::Builder::new()
        .name("vnctest-signal".into())
        .spawn(move || {
            for info in signals.forever() {
                let from = if let Some(p) = info.process {
                    format!("(pid: {}, uid: {})", p.pid, p.uid)
                } else {
                    "unknown".to_string()
                };
                log::info!("{} recved, from: {}", named_signal(info.signal), from);
                if HALTED.load(Ordering::SeqCst) || stop_soon() {
                    std::process::exit(128 + info.signal);
                }
                println!("please wait for the current round to finish...");
                stop_req();
            }
        })?;
    Ok(())
}
