//! MVT geometry command-stream codec.
//!
//! Geometries travel as `CommandInteger`/`ParameterInteger` sequences with a
//! cursor that persists across the whole feature. Decoding produces typed
//! point lists in tile-local integer coordinates; encoding rebuilds the
//! command stream with delta-encoded zigzag parameters.

use geozero::mvt::tile::GeomType;
use geozero::mvt::{Command, CommandInteger, ParameterInteger};

use crate::mvt::MvtError;

pub type Point = (i64, i64);

#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    Points(Vec<Point>),
    Lines(Vec<Vec<Point>>),
    /// Polygon rings in encounter order; winding distinguishes outer rings
    /// from holes and is preserved as-is.
    Polygon(Vec<Vec<Point>>),
}

impl Geometry {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Points(points) => points.is_empty(),
            Self::Lines(lines) => lines.is_empty(),
            Self::Polygon(rings) => rings.is_empty(),
        }
    }
}

const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

fn zigzag_decode(value: u32) -> i64 {
    i64::from((value >> 1) as i32 ^ -((value & 1) as i32))
}

struct CommandReader<'a> {
    data: &'a [u32],
    pos: usize,
    cursor: Point,
}

impl<'a> CommandReader<'a> {
    fn new(data: &'a [u32]) -> Self {
        Self {
            data,
            pos: 0,
            cursor: (0, 0),
        }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn command(&mut self) -> Result<(u32, u32), MvtError> {
        let raw = *self
            .data
            .get(self.pos)
            .ok_or_else(|| MvtError::Geometry("truncated command".to_string()))?;
        self.pos += 1;
        Ok((raw & 0x7, raw >> 3))
    }

    fn point(&mut self) -> Result<Point, MvtError> {
        if self.pos + 2 > self.data.len() {
            return Err(MvtError::Geometry("truncated parameters".to_string()));
        }
        let dx = zigzag_decode(self.data[self.pos]);
        let dy = zigzag_decode(self.data[self.pos + 1]);
        self.pos += 2;
        self.cursor.0 += dx;
        self.cursor.1 += dy;
        Ok(self.cursor)
    }
}

pub fn decode_geometry(data: &[u32], geom_type: GeomType) -> Result<Geometry, MvtError> {
    match geom_type {
        GeomType::Point => decode_points(data),
        GeomType::Linestring => Ok(Geometry::Lines(decode_paths(data, false)?)),
        GeomType::Polygon => Ok(Geometry::Polygon(decode_paths(data, true)?)),
        GeomType::Unknown => Err(MvtError::Geometry("unknown geometry type".to_string())),
    }
}

fn decode_points(data: &[u32]) -> Result<Geometry, MvtError> {
    let mut reader = CommandReader::new(data);
    let mut points = Vec::new();
    while !reader.done() {
        let (cmd, count) = reader.command()?;
        if cmd != CMD_MOVE_TO {
            return Err(MvtError::Geometry(format!(
                "unexpected command {cmd} in point geometry"
            )));
        }
        for _ in 0..count {
            points.push(reader.point()?);
        }
    }
    Ok(Geometry::Points(points))
}

fn decode_paths(data: &[u32], closed: bool) -> Result<Vec<Vec<Point>>, MvtError> {
    let mut reader = CommandReader::new(data);
    let mut paths = Vec::new();
    let mut current: Vec<Point> = Vec::new();
    while !reader.done() {
        let (cmd, count) = reader.command()?;
        match cmd {
            CMD_MOVE_TO => {
                if !current.is_empty() {
                    paths.push(std::mem::take(&mut current));
                }
                for _ in 0..count {
                    current.push(reader.point()?);
                }
            }
            CMD_LINE_TO => {
                for _ in 0..count {
                    current.push(reader.point()?);
                }
            }
            CMD_CLOSE_PATH => {
                if !closed {
                    return Err(MvtError::Geometry(
                        "close-path in linestring geometry".to_string(),
                    ));
                }
                if !current.is_empty() {
                    paths.push(std::mem::take(&mut current));
                }
            }
            other => {
                return Err(MvtError::Geometry(format!("unknown command {other}")));
            }
        }
    }
    if !current.is_empty() {
        paths.push(current);
    }
    Ok(paths)
}

struct CommandWriter {
    out: Vec<u32>,
    cursor: Point,
}

impl CommandWriter {
    fn new() -> Self {
        Self {
            out: Vec::new(),
            cursor: (0, 0),
        }
    }

    fn command(&mut self, command: Command, count: u32) {
        self.out.push(CommandInteger::from(command, count));
    }

    fn point(&mut self, point: Point) {
        let dx = point.0 - self.cursor.0;
        let dy = point.1 - self.cursor.1;
        self.out.push(ParameterInteger::from(dx as i32));
        self.out.push(ParameterInteger::from(dy as i32));
        self.cursor = point;
    }
}

pub fn encode_geometry(geometry: &Geometry) -> Vec<u32> {
    let mut writer = CommandWriter::new();
    match geometry {
        Geometry::Points(points) => {
            if points.is_empty() {
                return writer.out;
            }
            writer.command(Command::MoveTo, points.len() as u32);
            for point in points {
                writer.point(*point);
            }
        }
        Geometry::Lines(lines) => {
            for line in lines {
                if line.len() < 2 {
                    continue;
                }
                writer.command(Command::MoveTo, 1);
                writer.point(line[0]);
                writer.command(Command::LineTo, (line.len() - 1) as u32);
                for point in &line[1..] {
                    writer.point(*point);
                }
            }
        }
        Geometry::Polygon(rings) => {
            for ring in rings {
                // Rings carry an implicit closing edge; a trailing point equal
                // to the first one is dropped on encode.
                let mut ring: &[Point] = ring;
                if ring.len() > 1 && ring.first() == ring.last() {
                    ring = &ring[..ring.len() - 1];
                }
                if ring.len() < 3 {
                    continue;
                }
                writer.command(Command::MoveTo, 1);
                writer.point(ring[0]);
                writer.command(Command::LineTo, (ring.len() - 1) as u32);
                for point in &ring[1..] {
                    writer.point(*point);
                }
                writer.command(Command::ClosePath, 1);
            }
        }
    }
    writer.out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_roundtrip() {
        let geometry = Geometry::Points(vec![(25, 17), (30, 10)]);
        let encoded = encode_geometry(&geometry);
        assert_eq!(decode_geometry(&encoded, GeomType::Point).unwrap(), geometry);
    }

    #[test]
    fn linestring_roundtrip_preserves_cursor_between_parts() {
        let geometry = Geometry::Lines(vec![
            vec![(2, 2), (2, 10), (10, 10)],
            vec![(1, 1), (3, 5)],
        ]);
        let encoded = encode_geometry(&geometry);
        assert_eq!(
            decode_geometry(&encoded, GeomType::Linestring).unwrap(),
            geometry
        );
    }

    #[test]
    fn polygon_roundtrip_closes_rings() {
        let geometry = Geometry::Polygon(vec![vec![(3, 6), (8, 12), (20, 34)]]);
        let encoded = encode_geometry(&geometry);
        // MoveTo(1) + pair, LineTo(2) + 2 pairs, ClosePath.
        assert_eq!(encoded.len(), 1 + 2 + 1 + 4 + 1);
        assert_eq!(
            decode_geometry(&encoded, GeomType::Polygon).unwrap(),
            geometry
        );
    }

    #[test]
    fn known_command_stream_encoding() {
        // MoveTo(25, 17): [9, 50, 34]
        let geometry = Geometry::Points(vec![(25, 17)]);
        assert_eq!(encode_geometry(&geometry), vec![9, 50, 34]);
    }

    #[test]
    fn degenerate_rings_are_dropped_on_encode() {
        let geometry = Geometry::Polygon(vec![vec![(0, 0), (1, 1)]]);
        assert!(encode_geometry(&geometry).is_empty());
    }

    #[test]
    fn truncated_stream_errors() {
        assert!(decode_geometry(&[9, 50], GeomType::Point).is_err());
    }
}
