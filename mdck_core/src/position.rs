use serde::Deserialize;
use serde::Serialize;

/// A single location in a source file. Lines and columns are 1-based, the
/// offset is a 0-based byte index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Point {
	pub line: usize,
	pub column: usize,
	pub offset: usize,
}

impl Point {
	pub const fn new(line: usize, column: usize, offset: usize) -> Self {
		Self {
			line,
			column,
			offset,
		}
	}

	/// Move the point forward over `text`.
	pub fn advance_str(&mut self, text: &str) {
		for ch in text.chars() {
			self.advance_char(ch);
		}
	}

	pub fn advance_char(&mut self, ch: char) {
		self.offset += ch.len_utf8();

		if ch == '\n' {
			self.line += 1;
			self.column = 1;
		} else {
			self.column += 1;
		}
	}

	/// Return a point shifted by `base`, treating `self` as relative to a
	/// chunk that starts at `base`.
	#[must_use]
	pub fn shifted(self, base: Point) -> Self {
		let column = if self.line == 1 {
			base.column + self.column - 1
		} else {
			self.column
		};

		Self {
			line: base.line + self.line - 1,
			column,
			offset: base.offset + self.offset,
		}
	}
}

impl Default for Point {
	fn default() -> Self {
		Self::new(1, 1, 0)
	}
}

impl From<&markdown::unist::Point> for Point {
	fn from(point: &markdown::unist::Point) -> Self {
		Self::new(point.line, point.column, point.offset)
	}
}

/// The span of a node in its source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
	pub start: Point,
	pub end: Point,
}

impl Position {
	pub const fn new(
		start_line: usize,
		start_column: usize,
		start_offset: usize,
		end_line: usize,
		end_column: usize,
		end_offset: usize,
	) -> Self {
		Self {
			start: Point::new(start_line, start_column, start_offset),
			end: Point::new(end_line, end_column, end_offset),
		}
	}

	pub const fn from_points(start: Point, end: Point) -> Self {
		Self { start, end }
	}

	#[must_use]
	pub fn shifted(self, base: Point) -> Self {
		Self {
			start: self.start.shifted(base),
			end: self.end.shifted(base),
		}
	}
}

impl From<&markdown::unist::Position> for Position {
	fn from(position: &markdown::unist::Position) -> Self {
		Self {
			start: (&position.start).into(),
			end: (&position.end).into(),
		}
	}
}
