//! Integer rectangle clipping for tile-local geometry.

use crate::mvt::geometry::Point;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClipBox {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
}

impl ClipBox {
    /// The clip rectangle for a tile extent with a symmetric buffer.
    pub fn with_buffer(extent: i64, buffer: i64) -> Self {
        Self {
            min_x: -buffer,
            min_y: -buffer,
            max_x: extent + buffer,
            max_y: extent + buffer,
        }
    }

    pub fn contains(&self, point: &Point) -> bool {
        point.0 >= self.min_x
            && point.0 <= self.max_x
            && point.1 >= self.min_y
            && point.1 <= self.max_y
    }

    /// Clips a polyline, splitting it into the parts that remain inside.
    /// Each segment is clipped with Liang-Barsky; consecutive surviving
    /// segments are stitched back into one part.
    pub fn clip_line(&self, line: &[Point]) -> Vec<Vec<Point>> {
        let mut parts: Vec<Vec<Point>> = Vec::new();
        let mut current: Vec<Point> = Vec::new();
        for window in line.windows(2) {
            let (a, b) = (window[0], window[1]);
            match self.clip_segment(a, b) {
                Some((ca, cb)) => {
                    let continues = current.last() == Some(&ca);
                    if !continues {
                        if current.len() >= 2 {
                            parts.push(std::mem::take(&mut current));
                        } else {
                            current.clear();
                        }
                        current.push(ca);
                    }
                    if current.last() != Some(&cb) {
                        current.push(cb);
                    }
                }
                None => {
                    if current.len() >= 2 {
                        parts.push(std::mem::take(&mut current));
                    } else {
                        current.clear();
                    }
                }
            }
        }
        if current.len() >= 2 {
            parts.push(current);
        }
        parts
    }

    /// Sutherland-Hodgman ring clipping. Returns an empty ring when nothing
    /// survives; degenerate output (fewer than three distinct points) is
    /// collapsed to empty.
    pub fn clip_ring(&self, ring: &[Point]) -> Vec<Point> {
        if ring.is_empty() {
            return Vec::new();
        }
        let mut points: Vec<Point> = ring.to_vec();
        for edge in 0..4 {
            if points.is_empty() {
                return Vec::new();
            }
            let input = std::mem::take(&mut points);
            let Some(&last) = input.last() else {
                return Vec::new();
            };
            let mut prev = last;
            for point in input {
                let point_inside = self.edge_inside(edge, &point);
                let prev_inside = self.edge_inside(edge, &prev);
                if point_inside {
                    if !prev_inside {
                        points.push(self.edge_intersect(edge, prev, point));
                    }
                    points.push(point);
                } else if prev_inside {
                    points.push(self.edge_intersect(edge, prev, point));
                }
                prev = point;
            }
        }
        points.dedup();
        if points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        if points.len() < 3 {
            return Vec::new();
        }
        points
    }

    fn edge_inside(&self, edge: usize, point: &Point) -> bool {
        match edge {
            0 => point.0 >= self.min_x,
            1 => point.0 <= self.max_x,
            2 => point.1 >= self.min_y,
            _ => point.1 <= self.max_y,
        }
    }

    fn edge_intersect(&self, edge: usize, a: Point, b: Point) -> Point {
        let (ax, ay) = (a.0 as f64, a.1 as f64);
        let (bx, by) = (b.0 as f64, b.1 as f64);
        match edge {
            0 | 1 => {
                let x = if edge == 0 { self.min_x } else { self.max_x };
                let t = (x as f64 - ax) / (bx - ax);
                (x, (ay + t * (by - ay)).round() as i64)
            }
            _ => {
                let y = if edge == 2 { self.min_y } else { self.max_y };
                let t = (y as f64 - ay) / (by - ay);
                ((ax + t * (bx - ax)).round() as i64, y)
            }
        }
    }

    /// Liang-Barsky clip of one segment; `None` when fully outside.
    fn clip_segment(&self, a: Point, b: Point) -> Option<(Point, Point)> {
        let (x0, y0) = (a.0 as f64, a.1 as f64);
        let (x1, y1) = (b.0 as f64, b.1 as f64);
        let (dx, dy) = (x1 - x0, y1 - y0);
        let mut t0 = 0.0f64;
        let mut t1 = 1.0f64;
        let checks = [
            (-dx, x0 - self.min_x as f64),
            (dx, self.max_x as f64 - x0),
            (-dy, y0 - self.min_y as f64),
            (dy, self.max_y as f64 - y0),
        ];
        for (p, q) in checks {
            if p == 0.0 {
                if q < 0.0 {
                    return None;
                }
                continue;
            }
            let r = q / p;
            if p < 0.0 {
                if r > t1 {
                    return None;
                }
                if r > t0 {
                    t0 = r;
                }
            } else {
                if r < t0 {
                    return None;
                }
                if r < t1 {
                    t1 = r;
                }
            }
        }
        let clip_point = |t: f64| -> Point {
            (
                (x0 + t * dx).round() as i64,
                (y0 + t * dy).round() as i64,
            )
        };
        Some((clip_point(t0), clip_point(t1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOX: ClipBox = ClipBox {
        min_x: 0,
        min_y: 0,
        max_x: 100,
        max_y: 100,
    };

    #[test]
    fn point_containment() {
        assert!(BOX.contains(&(0, 0)));
        assert!(BOX.contains(&(100, 100)));
        assert!(!BOX.contains(&(101, 50)));
        assert!(!BOX.contains(&(50, -1)));
    }

    #[test]
    fn line_crossing_is_trimmed() {
        let parts = BOX.clip_line(&[(-50, 50), (150, 50)]);
        assert_eq!(parts, vec![vec![(0, 50), (100, 50)]]);
    }

    #[test]
    fn line_leaving_and_reentering_splits() {
        let parts = BOX.clip_line(&[(10, 10), (10, 150), (90, 150), (90, 10)]);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], vec![(10, 10), (10, 100)]);
        assert_eq!(parts[1], vec![(90, 100), (90, 10)]);
    }

    #[test]
    fn fully_outside_line_disappears() {
        assert!(BOX.clip_line(&[(200, 200), (300, 300)]).is_empty());
    }

    #[test]
    fn ring_corner_clip() {
        // A square poking over the top-right corner gains the corner point.
        let ring = vec![(50, 50), (150, 50), (150, 150), (50, 150)];
        let clipped = BOX.clip_ring(&ring);
        assert_eq!(clipped, vec![(50, 100), (50, 50), (100, 50), (100, 100)]);
    }

    #[test]
    fn ring_outside_is_dropped() {
        let ring = vec![(200, 200), (300, 200), (300, 300)];
        assert!(BOX.clip_ring(&ring).is_empty());
    }

    #[test]
    fn inner_ring_is_untouched() {
        let ring = vec![(10, 10), (20, 10), (20, 20), (10, 20)];
        assert_eq!(BOX.clip_ring(&ring), ring);
    }
}
