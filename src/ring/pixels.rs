// Read-only view over a mapped readback buffer
//
// Rows are `row_pitch` bytes apart; only the first `width * 4` bytes of
// each row are pixel data. Texels are 4 bytes in the ring's color format
// (BGRA for the default format).

use std::fmt;

pub const BYTES_PER_TEXEL: usize = 4;

#[derive(Clone, Copy)]
pub struct PixelView<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
    row_pitch: usize,
}

impl<'a> PixelView<'a> {
    /// `data` must hold `height` rows of `row_pitch` bytes (the last row may
    /// stop after its pixels).
    pub(crate) fn new(data: &'a [u8], width: u32, height: u32, row_pitch: usize) -> Self {
        let row_bytes = width as usize * BYTES_PER_TEXEL;
        debug_assert!(row_pitch >= row_bytes);
        debug_assert!(height == 0 || data.len() >= (height as usize - 1) * row_pitch + row_bytes);
        Self {
            data,
            width,
            height,
            row_pitch,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Distance between rows in bytes.
    #[inline]
    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    /// Pixel bytes of row `y`, without padding.
    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.row_pitch;
        self.data.get(start..start + self.width as usize * BYTES_PER_TEXEL)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width {
            return None;
        }
        let row = self.row(y)?;
        let start = x as usize * BYTES_PER_TEXEL;
        let mut texel = [0u8; 4];
        texel.copy_from_slice(&row[start..start + BYTES_PER_TEXEL]);
        Some(texel)
    }

    pub fn rows(&self) -> impl Iterator<Item = &'a [u8]> {
        let view = *self;
        (0..self.height).filter_map(move |y| view.row(y))
    }

    /// The mapped bytes including row padding.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Copy out tightly packed rows.
    pub fn to_packed(&self) -> Vec<u8> {
        let mut packed =
            Vec::with_capacity(self.width as usize * self.height as usize * BYTES_PER_TEXEL);
        for row in self.rows() {
            packed.extend_from_slice(row);
        }
        packed
    }
}

impl fmt::Debug for PixelView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelView")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("row_pitch", &self.row_pitch)
            .finish()
    }
}

/// Round `value` up to a multiple of `alignment` (which must be non-zero).
pub fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_skip_padding() {
        // 2x2 image, 12-byte pitch
        let data: Vec<u8> = (0..24).collect();
        let view = PixelView::new(&data, 2, 2, 12);
        assert_eq!(view.row(0), Some(&data[0..8]));
        assert_eq!(view.row(1), Some(&data[12..20]));
        assert_eq!(view.row(2), None);
        assert_eq!(view.pixel(1, 1), Some([16, 17, 18, 19]));
        assert_eq!(view.pixel(2, 0), None);
        assert_eq!(view.to_packed(), [&data[0..8], &data[12..20]].concat());
        assert_eq!(view.as_bytes().len(), 24);
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(40, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 4), 260);
    }
}
