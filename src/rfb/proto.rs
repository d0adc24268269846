//! Wire format of the subset of RFB (RFC 6143) we speak.
use std::io::{self, Read};

use bytes::{Buf, BufMut, BytesMut};

/// Length of the `RFB xxx.yyy\n` version banner.
pub const VERSION_LEN: usize = 12;

pub const SEC_NONE: u8 = 1;

// Client to server message types.
pub const SET_PIXEL_FORMAT: u8 = 0;
pub const SET_ENCODINGS: u8 = 2;
pub const FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
pub const KEY_EVENT: u8 = 4;

// Server to client message types.
pub const FRAMEBUFFER_UPDATE: u8 = 0;

pub const ENCODING_RAW: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V3_3,
    V3_7,
    V3_8,
}

impl Version {
    /// Parses the server banner. Minor versions 4 to 6 are unofficial and handled
    /// as 3.3, anything past 8 as 3.8.
    pub fn parse(banner: &[u8]) -> Option<Self> {
        if banner.len() != VERSION_LEN || &banner[..4] != b"RFB " || banner[11] != b'\n' {
            return None;
        }
        let s = std::str::from_utf8(&banner[4..11]).ok()?;
        let mut parts = s.split('.');
        let major = parts.next()?.parse::<u32>().ok()?;
        let minor = parts.next()?.parse::<u32>().ok()?;
        match (major, minor) {
            (3, 3..=6) => Some(Version::V3_3),
            (3, 7) => Some(Version::V3_7),
            (3, m) if m >= 8 => Some(Version::V3_8),
            _ => None,
        }
    }

    pub fn banner(self) -> &'static [u8; VERSION_LEN] {
        match self {
            Version::V3_3 => b"RFB 003.003\n",
            Version::V3_7 => b"RFB 003.007\n",
            Version::V3_8 => b"RFB 003.008\n",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_color: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Encoded size, including 3 bytes of padding.
    pub const LEN: usize = 16;

    /// 32 bits little-endian `0x00RRGGBB`, the format requested from every server.
    pub const RGB888: PixelFormat = PixelFormat {
        bits_per_pixel: 32,
        depth: 24,
        big_endian: false,
        true_color: true,
        red_max: 255,
        green_max: 255,
        blue_max: 255,
        red_shift: 16,
        green_shift: 8,
        blue_shift: 0,
    };

    pub fn decode(buf: &mut &[u8]) -> Option<Self> {
        if buf.remaining() < Self::LEN {
            return None;
        }
        let pf = PixelFormat {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian: buf.get_u8() != 0,
            true_color: buf.get_u8() != 0,
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3);
        Some(pf)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian as u8);
        buf.put_u8(self.true_color as u8);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3);
    }

    pub fn bytes_per_pixel(&self) -> usize {
        std::cmp::max(self.bits_per_pixel as usize / 8, 1)
    }

    /// Converts one raw true color pixel to RGBA, scaling every channel to 8 bits.
    pub fn rgba(&self, px: &[u8]) -> [u8; 4] {
        let v = match (px.len(), self.big_endian) {
            (1, _) => px[0] as u32,
            (2, true) => u16::from_be_bytes([px[0], px[1]]) as u32,
            (2, false) => u16::from_le_bytes([px[0], px[1]]) as u32,
            (4, true) => u32::from_be_bytes([px[0], px[1], px[2], px[3]]),
            (4, false) => u32::from_le_bytes([px[0], px[1], px[2], px[3]]),
            _ => 0,
        };
        [
            scale(v >> self.red_shift, self.red_max),
            scale(v >> self.green_shift, self.green_max),
            scale(v >> self.blue_shift, self.blue_max),
            255,
        ]
    }
}

fn scale(v: u32, max: u16) -> u8 {
    if max == 0 {
        return 0;
    }
    let max = max as u32;
    ((v & max) * 255 / max) as u8
}

/// ServerInit, sent once after the security handshake.
#[derive(Debug, Clone)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

impl ServerInit {
    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut head = [0_u8; 4 + PixelFormat::LEN + 4];
        r.read_exact(&mut head)?;
        let mut buf = &head[..];
        let width = buf.get_u16();
        let height = buf.get_u16();
        let pixel_format = PixelFormat::decode(&mut buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "short pixel format"))?;
        let name_len = buf.get_u32() as usize;
        let mut name = vec![0_u8; name_len];
        r.read_exact(&mut name)?;
        Ok(Self {
            width,
            height,
            pixel_format,
            name: String::from_utf8_lossy(&name).into_owned(),
        })
    }
}

/// Header of one rectangle of a FramebufferUpdate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectHeader {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
}

impl RectHeader {
    pub const LEN: usize = 12;

    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut head = [0_u8; Self::LEN];
        r.read_exact(&mut head)?;
        let mut buf = &head[..];
        Ok(Self {
            x: buf.get_u16(),
            y: buf.get_u16(),
            width: buf.get_u16(),
            height: buf.get_u16(),
            encoding: buf.get_i32(),
        })
    }
}

pub fn client_init(shared: bool) -> [u8; 1] {
    [shared as u8]
}

pub fn set_pixel_format(pf: &PixelFormat) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + PixelFormat::LEN);
    buf.put_u8(SET_PIXEL_FORMAT);
    buf.put_bytes(0, 3);
    pf.encode(&mut buf);
    buf
}

pub fn set_encodings(encodings: &[i32]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + encodings.len() * 4);
    buf.put_u8(SET_ENCODINGS);
    buf.put_u8(0);
    buf.put_u16(encodings.len() as u16);
    for e in encodings {
        buf.put_i32(*e);
    }
    buf
}

pub fn framebuffer_update_request(
    incremental: bool,
    x: u16,
    y: u16,
    width: u16,
    height: u16,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(10);
    buf.put_u8(FRAMEBUFFER_UPDATE_REQUEST);
    buf.put_u8(incremental as u8);
    buf.put_u16(x);
    buf.put_u16(y);
    buf.put_u16(width);
    buf.put_u16(height);
    buf
}

pub fn key_event(down: bool, keysym: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(KEY_EVENT);
    buf.put_u8(down as u8);
    buf.put_u16(0);
    buf.put_u32(keysym);
    buf
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut b = [0_u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

pub fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    let mut b = [0_u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0_u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

/// Reads a length prefixed failure reason.
pub fn read_reason<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_u32(r)? as usize;
    let mut reason = vec![0_u8; len];
    r.read_exact(&mut reason)?;
    Ok(String::from_utf8_lossy(&reason).into_owned())
}
