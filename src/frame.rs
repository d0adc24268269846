//! Captured screen content.

/// One pixel, red, green, blue and alpha.
pub type Rgba = [u8; 4];

/// A full-frame capture of one guest display.
///
/// Pixels are row-major RGBA with alpha always 255. A screenshot is never
/// mutated after capture; persistence and classification both borrow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Screenshot {
    /// Builds a screenshot from raw RGBA bytes, `data.len()` must be `width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Self {
        assert_eq!(data.len(), width as usize * height as usize * 4);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn from_pixels(width: u32, height: u32, pixels: &[Rgba]) -> Self {
        let data = pixels.iter().flatten().copied().collect();
        Self::from_rgba(width, height, data)
    }

    pub fn filled(width: u32, height: u32, color: Rgba) -> Self {
        let n = width as usize * height as usize;
        Self::from_pixels(width, height, &vec![color; n])
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA bytes.
    #[inline]
    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels(&self) -> impl Iterator<Item = Rgba> + '_ {
        self.data
            .chunks_exact(4)
            .map(|px| [px[0], px[1], px[2], px[3]])
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let px = &self.data[i..i + 4];
        Some([px[0], px[1], px[2], px[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::Screenshot;

    #[test]
    fn row_major_layout() {
        let px = (1..=6).map(|r| [r, 0, 0, 255]).collect::<Vec<_>>();
        let shot = Screenshot::from_pixels(3, 2, &px);
        assert_eq!(shot.pixel(0, 0), Some([1, 0, 0, 255]));
        assert_eq!(shot.pixel(2, 0), Some([3, 0, 0, 255]));
        assert_eq!(shot.pixel(0, 1), Some([4, 0, 0, 255]));
        assert_eq!(shot.pixel(3, 0), None);
        assert_eq!(shot.pixels().count(), 6);
    }

    #[test]
    #[should_panic]
    fn size_mismatch() {
        Screenshot::from_rgba(2, 2, vec![0; 12]);
    }
}
