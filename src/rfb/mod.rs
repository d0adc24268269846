//! Minimal VNC client: handshake, key injection and a single full-frame capture.
use crate::frame::Screenshot;

use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    thread::sleep,
    time::Duration,
};

use thiserror::Error;

/// Wire format.
pub mod proto;

use proto::{PixelFormat, ServerInit, Version};

/// Keysym pressed to wake a blanked guest display (Pointer_EnableKeys).
pub const WAKE_KEYSYM: u32 = 0xfee3;
/// How long the wake key is held down.
pub const WAKE_HOLD: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum RfbError {
    #[error("connect {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported protocol version: {0:?}")]
    Version(String),
    #[error("handshake refused: {0}")]
    Refused(String),
    #[error("no supported security type in {0:?}")]
    Security(Vec<u8>),
    #[error("expected a framebuffer update, got message type {0}")]
    UnexpectedMessage(u8),
    #[error("expected to get a single rectangle, got {0}")]
    RectCount(u16),
    #[error("unsupported encoding {0}, only raw is supported")]
    Encoding(i32),
    #[error("rectangle {width}x{height}+{x}+{y} does not cover the {frame_width}x{frame_height} frame")]
    PartialRect {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        frame_width: u16,
        frame_height: u16,
    },
}

impl RfbError {
    /// Protocol violations in a frame update mean the server does not behave the way
    /// this harness assumes, carrying on would misread the screen.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RfbError::UnexpectedMessage(_)
                | RfbError::RectCount(_)
                | RfbError::Encoding(_)
                | RfbError::PartialRect { .. }
        )
    }
}

/// One connection to a VNC server.
pub struct RfbSession {
    stream: TcpStream,
    version: Version,
    width: u16,
    height: u16,
    format: PixelFormat,
    name: String,
}

impl RfbSession {
    /// Connects to `addr` (`host:port`) and finishes the handshake.
    pub fn connect(addr: &str, timeout: Option<Duration>) -> Result<Self, RfbError> {
        let stream = open(addr, timeout).map_err(|source| RfbError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        stream.set_nodelay(true)?;
        Self::handshake(stream)
    }

    fn handshake(mut stream: TcpStream) -> Result<Self, RfbError> {
        let mut banner = [0_u8; proto::VERSION_LEN];
        stream.read_exact(&mut banner)?;
        let version = Version::parse(&banner).ok_or_else(|| {
            RfbError::Version(String::from_utf8_lossy(&banner).trim_end().to_string())
        })?;
        stream.write_all(version.banner())?;

        if version == Version::V3_3 {
            // the server picks the security type.
            match proto::read_u32(&mut stream)? {
                0 => return Err(RfbError::Refused(proto::read_reason(&mut stream)?)),
                1 => (),
                ty => return Err(RfbError::Security(vec![ty as u8])),
            }
        } else {
            let n = proto::read_u8(&mut stream)? as usize;
            if n == 0 {
                return Err(RfbError::Refused(proto::read_reason(&mut stream)?));
            }
            let mut types = vec![0_u8; n];
            stream.read_exact(&mut types)?;
            if !types.contains(&proto::SEC_NONE) {
                return Err(RfbError::Security(types));
            }
            stream.write_all(&[proto::SEC_NONE])?;
            // 3.7 sends no SecurityResult for the None type.
            if version == Version::V3_8 && proto::read_u32(&mut stream)? != 0 {
                return Err(RfbError::Refused(proto::read_reason(&mut stream)?));
            }
        }

        stream.write_all(&proto::client_init(true))?;
        let init = ServerInit::read(&mut stream)?;
        log::debug!(
            "vnc server '{}' ({:?}): {}x{}, {:?}",
            init.name,
            version,
            init.width,
            init.height,
            init.pixel_format
        );

        let format = PixelFormat::RGB888;
        stream.write_all(&proto::set_pixel_format(&format))?;
        stream.write_all(&proto::set_encodings(&[proto::ENCODING_RAW]))?;

        Ok(Self {
            stream,
            version,
            width: init.width,
            height: init.height,
            format,
            name: init.name,
        })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn key_event(&mut self, keysym: u32, down: bool) -> Result<(), RfbError> {
        self.stream.write_all(&proto::key_event(down, keysym))?;
        Ok(())
    }

    /// Press and release [`WAKE_KEYSYM`], so a blanked display shows its live state.
    pub fn inject_wake(&mut self) -> Result<(), RfbError> {
        self.key_event(WAKE_KEYSYM, true)?;
        sleep(WAKE_HOLD);
        self.key_event(WAKE_KEYSYM, false)
    }

    /// Requests a non-incremental update of the whole frame and decodes the single
    /// raw rectangle it must consist of.
    pub fn capture(&mut self) -> Result<Screenshot, RfbError> {
        let req = proto::framebuffer_update_request(false, 0, 0, self.width, self.height);
        self.stream.write_all(&req)?;

        let ty = proto::read_u8(&mut self.stream)?;
        if ty != proto::FRAMEBUFFER_UPDATE {
            return Err(RfbError::UnexpectedMessage(ty));
        }
        let _padding = proto::read_u8(&mut self.stream)?;
        let n = proto::read_u16(&mut self.stream)?;
        if n != 1 {
            return Err(RfbError::RectCount(n));
        }
        let rect = proto::RectHeader::read(&mut self.stream)?;
        if rect.encoding != proto::ENCODING_RAW {
            return Err(RfbError::Encoding(rect.encoding));
        }
        if (rect.x, rect.y, rect.width, rect.height) != (0, 0, self.width, self.height) {
            return Err(RfbError::PartialRect {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
                frame_width: self.width,
                frame_height: self.height,
            });
        }

        let (w, h) = (rect.width as usize, rect.height as usize);
        let bpp = self.format.bytes_per_pixel();
        let mut raw = vec![0_u8; w * h * bpp];
        self.stream.read_exact(&mut raw)?;
        let mut data = Vec::with_capacity(w * h * 4);
        for px in raw.chunks_exact(bpp) {
            data.extend_from_slice(&self.format.rgba(px));
        }
        Ok(Screenshot::from_rgba(w as u32, h as u32, data))
    }
}

fn open(addr: &str, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let timeout = match timeout {
        Some(t) => t,
        None => return TcpStream::connect(addr),
    };
    let mut last_err = None;
    for a in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&a, timeout) {
            Ok(s) => return Ok(s),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    }))
}

/// Source of screenshots, one fresh connection per call.
pub trait Grab: Send + Sync + 'static {
    fn grab(&self, addr: &str) -> Result<Screenshot, RfbError>;
}

/// Connect, wake the display, capture.
#[derive(Debug, Clone, Default)]
pub struct RfbGrabber {
    pub connect_timeout: Option<Duration>,
}

impl Grab for RfbGrabber {
    fn grab(&self, addr: &str) -> Result<Screenshot, RfbError> {
        let mut session = RfbSession::connect(addr, self.connect_timeout)?;
        session.inject_wake()?;
        session.capture()
    }
}
