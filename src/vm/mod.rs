//! VM instances and how they are launched.

use std::{io, process::ExitStatus};

pub mod qemu;

pub use qemu::{LaunchError, QemuConfig, QemuHandle, QemuLauncher};

/// VNC display `n` listens on TCP port `5900 + n`.
pub const RFB_PORT_BASE: u16 = 5900;

/// Identity of one instance within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance {
    pub index: usize,
    /// VNC display number, `base_port + index`.
    pub display_port: u16,
}

impl Instance {
    pub fn new(index: usize, base_port: u16) -> Self {
        Self {
            index,
            display_port: base_port + index as u16,
        }
    }

    /// TCP port of the display.
    pub fn rfb_port(&self) -> u16 {
        RFB_PORT_BASE + self.display_port
    }

    pub fn rfb_addr(&self, host: &str) -> String {
        format!("{}:{}", host, self.rfb_port())
    }
}

/// A running VM process.
pub trait ManageVm: Send {
    fn pid(&self) -> u32;
    /// Blocks until the process exits and reaps it.
    fn wait(&mut self) -> io::Result<ExitStatus>;
}

/// Starts one VM per instance.
pub trait Launch: Send + Sync + 'static {
    type Vm: ManageVm + 'static;

    fn launch(&self, instance: &Instance) -> Result<Self::Vm, LaunchError>;
}

/// Substitutes `%p` (display port), `%c` (instance counter) and `%h` (host) in
/// a launch command template.
pub fn render_command(template: &str, instance: &Instance, host: &str) -> String {
    template
        .replace("%c", &instance.index.to_string())
        .replace("%p", &instance.display_port.to_string())
        .replace("%h", host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_derivation() {
        let base = 77;
        for i in 0..16 {
            let inst = Instance::new(i, base);
            assert_eq!(inst.index, i);
            assert_eq!(inst.display_port, base + i as u16);
            assert_eq!(inst.rfb_port(), 5900 + base + i as u16);
        }
        assert_eq!(Instance::new(2, 10).rfb_addr("localhost"), "localhost:5912");
    }

    #[test]
    fn render_placeholders() {
        let inst = Instance::new(3, 77);
        let cmd = render_command(
            "qemu-system-x86_64 -vnc %h:%p -drive file=disk%c.img -name vm%c",
            &inst,
            "127.0.0.1",
        );
        assert_eq!(
            cmd,
            "qemu-system-x86_64 -vnc 127.0.0.1:80 -drive file=disk3.img -name vm3"
        );
        assert_eq!(render_command("true", &inst, "h"), "true");
    }
}
