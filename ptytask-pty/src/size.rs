//! Terminal dimensions

/// Terminal size in character cells, with optional pixel dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// Width in character cells
    pub cols: u16,
    /// Height in character cells
    pub rows: u16,
    /// Width in pixels (0 when unknown)
    pub pixel_width: u16,
    /// Height in pixels (0 when unknown)
    pub pixel_height: u16,
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self::with_pixels(cols, rows, 0, 0)
    }

    pub fn with_pixels(cols: u16, rows: u16, pixel_width: u16, pixel_height: u16) -> Self {
        Self {
            cols,
            rows,
            pixel_width,
            pixel_height,
        }
    }

    /// Raise zero dimensions to one cell.
    ///
    /// Some programs divide by the reported width or height, so a pty is
    /// never given an empty grid.
    pub fn clamped(self) -> Self {
        Self {
            cols: self.cols.max(1),
            rows: self.rows.max(1),
            ..self
        }
    }

    pub(crate) fn to_winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self::with_pixels(ws.ws_col, ws.ws_row, ws.ws_xpixel, ws.ws_ypixel)
    }
}
