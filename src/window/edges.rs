/// Edge of the window a client-side resize grabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeEdge {
    Top,
    Bottom,
    Left,
    TopLeft,
    BottomLeft,
    Right,
    TopRight,
    BottomRight,
}

/// Maps a surface-local position to a resize edge when it lies within
/// `edge_pixels` of the window border. Corners win over plain edges.
pub fn check_for_resize(x: f64, y: f64, edge_pixels: i32, width: i32, height: i32) -> Option<ResizeEdge> {
    let (x, y) = (x as i32, y as i32);
    let left = x < edge_pixels;
    let top = y < edge_pixels;
    let right = x > width - edge_pixels;
    let bottom = y > height - edge_pixels;

    match (left, right, top, bottom) {
        (true, _, true, _) => Some(ResizeEdge::TopLeft),
        (true, _, _, true) => Some(ResizeEdge::BottomLeft),
        (true, _, _, _) => Some(ResizeEdge::Left),
        (_, true, true, _) => Some(ResizeEdge::TopRight),
        (_, true, _, true) => Some(ResizeEdge::BottomRight),
        (_, true, _, _) => Some(ResizeEdge::Right),
        (_, _, true, _) => Some(ResizeEdge::Top),
        (_, _, _, true) => Some(ResizeEdge::Bottom),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: i32 = 800;
    const H: i32 = 600;

    #[test]
    fn corners_take_priority() {
        assert_eq!(check_for_resize(2.0, 3.0, 10, W, H), Some(ResizeEdge::TopLeft));
        assert_eq!(check_for_resize(1.0, 595.0, 10, W, H), Some(ResizeEdge::BottomLeft));
        assert_eq!(check_for_resize(795.0, 0.0, 10, W, H), Some(ResizeEdge::TopRight));
        assert_eq!(check_for_resize(799.0, 599.0, 10, W, H), Some(ResizeEdge::BottomRight));
    }

    #[test]
    fn plain_edges() {
        assert_eq!(check_for_resize(5.0, 300.0, 10, W, H), Some(ResizeEdge::Left));
        assert_eq!(check_for_resize(795.0, 300.0, 10, W, H), Some(ResizeEdge::Right));
        assert_eq!(check_for_resize(400.0, 5.0, 10, W, H), Some(ResizeEdge::Top));
        assert_eq!(check_for_resize(400.0, 595.0, 10, W, H), Some(ResizeEdge::Bottom));
    }

    #[test]
    fn interior_is_a_move() {
        assert_eq!(check_for_resize(400.0, 300.0, 10, W, H), None);
        assert_eq!(check_for_resize(10.0, 10.0, 10, W, H), None);
    }

    #[test]
    fn touch_zone_is_wider() {
        assert_eq!(check_for_resize(20.0, 300.0, 10, W, H), None);
        assert_eq!(check_for_resize(20.0, 300.0, 32, W, H), Some(ResizeEdge::Left));
    }
}
