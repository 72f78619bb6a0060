use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Viewport widths below this stack sessions vertically.
pub const WIDE_LAYOUT_BREAKPOINT: f64 = 1100.0;
/// Inner padding of the layout region; routes turn inside it.
pub const BOUNDS_PADDING: f64 = 10.0;
/// A target whose leading edge sits this close to the bounds is reachable directly.
pub const ACCESSIBLE_TOLERANCE: f64 = 10.0;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("{name} rectangle has non-finite coordinates")]
    NonFinite { name: &'static str },
    #[error("{name} rectangle has negative size ({width} x {height})")]
    NegativeSize {
        name: &'static str,
        width: f64,
        height: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn center_x(&self) -> f64 {
        self.left + self.width / 2.0
    }

    pub fn center_y(&self) -> f64 {
        self.top + self.height / 2.0
    }

    fn validate(&self, name: &'static str) -> Result<(), GeometryError> {
        let finite = [self.left, self.top, self.width, self.height]
            .iter()
            .all(|value| value.is_finite());
        if !finite {
            return Err(GeometryError::NonFinite { name });
        }
        if self.width < 0.0 || self.height < 0.0 {
            return Err(GeometryError::NegativeSize {
                name,
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Polyline handed to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    points: Vec<Point>,
}

impl Path {
    fn from_points(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn segments(&self) -> usize {
        self.points.len().saturating_sub(1)
    }

    pub fn end(&self) -> Option<Point> {
        self.points.last().copied()
    }

    pub fn length(&self) -> f64 {
        self.points
            .windows(2)
            .map(|pair| (pair[1].x - pair[0].x).hypot(pair[1].y - pair[0].y))
            .sum()
    }

    /// SVG path description: `M x y L x y ...`.
    pub fn to_svg(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, point) in self.points.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            let command = if idx == 0 { "M" } else { "L" };
            write!(f, "{command} {} {}", point.x, point.y)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    Compact,
    Wide,
}

impl LayoutMode {
    pub fn for_viewport(width: f64, sidebar_open: bool) -> Self {
        if sidebar_open || width < WIDE_LAYOUT_BREAKPOINT {
            LayoutMode::Compact
        } else {
            LayoutMode::Wide
        }
    }
}

/// Routes from the anchor's trailing edge to the target.
///
/// The vertical leg runs halfway between the anchor and the padded leading
/// edge of `bounds`. In wide mode a target that is not flush with the bounds
/// is entered from its trailing side through the top of the layout region.
pub fn route(
    anchor: Rect,
    target: Rect,
    bounds: Rect,
    mode: LayoutMode,
) -> Result<Path, GeometryError> {
    anchor.validate("anchor")?;
    target.validate("target")?;
    bounds.validate("bounds")?;

    let start = Point::new(anchor.right(), anchor.center_y());
    let mid_x = anchor.right() + ((bounds.left + BOUNDS_PADDING) - anchor.right()) / 2.0;
    let exit = Point::new(mid_x, start.y);

    let accessible = target.left - bounds.left <= ACCESSIBLE_TOLERANCE;
    if mode == LayoutMode::Compact || accessible {
        return Ok(Path::from_points(vec![
            start,
            exit,
            Point::new(mid_x, target.center_y()),
            Point::new(target.left, target.center_y()),
        ]));
    }

    let side_x = target.right() + (bounds.right() - target.right()) / 2.0;
    Ok(Path::from_points(vec![
        start,
        exit,
        Point::new(mid_x, bounds.top),
        Point::new(side_x, bounds.top),
        Point::new(side_x, target.center_y()),
        Point::new(target.right(), target.center_y()),
    ]))
}

/// Straight line between a task card's bottom edge and the anchor's top
/// centre. `None` while the card's bottom edge is scrolled out of the list.
pub fn assist_segment(
    card: Rect,
    anchor: Rect,
    list_viewport: Rect,
) -> Result<Option<Path>, GeometryError> {
    card.validate("card")?;
    anchor.validate("anchor")?;
    list_viewport.validate("list viewport")?;

    let bottom_in_list = card.bottom() - list_viewport.top;
    if bottom_in_list <= 0.0 || bottom_in_list > list_viewport.height {
        return Ok(None);
    }
    let x = anchor.center_x();
    Ok(Some(Path::from_points(vec![
        Point::new(x, card.bottom()),
        Point::new(x, anchor.top),
    ])))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "up" | "k" => Ok(Direction::Up),
            "down" | "j" => Ok(Direction::Down),
            "left" | "h" => Ok(Direction::Left),
            "right" | "l" => Ok(Direction::Right),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Columns and rows of the session grid for `count` sessions.
pub fn grid_dimensions(count: usize) -> (usize, usize) {
    match count {
        0 => (0, 0),
        1 => (1, 1),
        2 => (2, 1),
        3 | 4 => (2, 2),
        5 | 6 => (3, 2),
        _ => {
            let cols = (count as f64).sqrt().ceil() as usize;
            (cols, count.div_ceil(cols))
        }
    }
}

/// Next session index for keyboard navigation. With nothing selected the
/// first session is chosen; moves that leave the grid keep the selection.
pub fn navigate(
    current: Option<usize>,
    count: usize,
    direction: Direction,
    mode: LayoutMode,
) -> Option<usize> {
    if count == 0 {
        return None;
    }
    let Some(current) = current.filter(|idx| *idx < count) else {
        return Some(0);
    };

    let target = match mode {
        LayoutMode::Compact => match direction {
            Direction::Up => current.saturating_sub(1),
            Direction::Down => (current + 1).min(count - 1),
            Direction::Left | Direction::Right => current,
        },
        LayoutMode::Wide => {
            let (cols, rows) = grid_dimensions(count);
            let mut row = current / cols;
            let mut col = current % cols;
            match direction {
                Direction::Up => row = row.saturating_sub(1),
                Direction::Down => row = (row + 1).min(rows - 1),
                Direction::Left => col = col.saturating_sub(1),
                Direction::Right => col = (col + 1).min(cols - 1),
            }
            row * cols + col
        }
    };

    if target < count {
        Some(target)
    } else {
        Some(current)
    }
}
