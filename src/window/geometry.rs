/// Integer rectangle, `x1`/`y1` exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl Rect {
    pub const fn from_size(width: i32, height: i32) -> Self {
        Self {
            x0: 0,
            y0: 0,
            x1: width,
            y1: height,
        }
    }

    pub const fn width(&self) -> i32 {
        self.x1 - self.x0
    }

    pub const fn height(&self) -> i32 {
        self.y1 - self.y0
    }

    pub const fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn size(&self) -> (i32, i32) {
        (self.width(), self.height())
    }

    /// Scales the far corner by `factor`, keeping the origin.
    pub fn scale_extent(&mut self, factor: f64) {
        self.x1 = (self.x1 as f64 * factor) as i32;
        self.y1 = (self.y1 as f64 * factor) as i32;
    }
}

pub fn gcd(a: i32, b: i32) -> i32 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Width:height pair reduced by their GCD, `(1, 1)` for degenerate input.
pub fn reduce_aspect(width: i32, height: i32) -> (i32, i32) {
    if width <= 0 || height <= 0 {
        return (1, 1);
    }
    let d = gcd(width, height);
    (width / d, height / d)
}

/// Largest rectangle with the source aspect ratio centered inside `window`.
pub fn letterbox(src_width: i32, src_height: i32, window: Rect) -> Rect {
    let (win_w, win_h) = window.size();
    if src_width <= 0 || src_height <= 0 || win_w <= 0 || win_h <= 0 {
        return window;
    }
    let (src_w, src_h) = (src_width as i64, src_height as i64);
    let (mut w, mut h) = (win_w as i64, win_h as i64);
    if src_w * h > src_h * w {
        h = (w * src_h + src_w / 2) / src_w;
    } else {
        w = (h * src_w + src_h / 2) / src_h;
    }
    let x0 = window.x0 + ((win_w as i64 - w) / 2) as i32;
    let y0 = window.y0 + ((win_h as i64 - h) / 2) as i32;
    Rect {
        x0,
        y0,
        x1: x0 + w as i32,
        y1: y0 + h as i32,
    }
}
