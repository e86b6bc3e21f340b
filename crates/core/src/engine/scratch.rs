//! Fixed scratch slots for marshalling geometry across the call boundary.
//!
//! Value arguments (matrices, rects, points, quads, colors) never allocate
//! on the way in or out of an engine call. Each kind has a pre-sized slot in
//! one flat f64 block; writing a slot returns a token addressing it, and the
//! value stays readable until the next write of that same slot. Calls taking
//! two arguments of one kind use the independent second slot.

use crate::error::{Error, Result};
use crate::geometry::{Color, Matrix, Point, Quad, Rect};

const MATRIX_OFF: usize = 0;
const MATRIX2_OFF: usize = 6;
const RECT_OFF: usize = 12;
const RECT2_OFF: usize = 16;
const POINT_OFF: usize = 20;
const POINT2_OFF: usize = 22;
const QUAD_OFF: usize = 24;
const COLOR_OFF: usize = 32;
const COLOR_N_OFF: usize = 36;
const WORDS: usize = 37;

/// Token naming a scratch slot. Copyable; holding one does not pin the
/// value, only the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSlot {
    Matrix,
    Matrix2,
    Rect,
    Rect2,
    Point,
    Point2,
    Quad,
    Color,
}

impl ArgSlot {
    fn kind_name(self) -> &'static str {
        match self {
            ArgSlot::Matrix | ArgSlot::Matrix2 => "matrix",
            ArgSlot::Rect | ArgSlot::Rect2 => "rect",
            ArgSlot::Point | ArgSlot::Point2 => "point",
            ArgSlot::Quad => "quad",
            ArgSlot::Color => "color",
        }
    }
}

/// Which of the two independent slots of a kind to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotSet {
    #[default]
    First,
    Second,
}

/// The pre-allocated marshalling block. One per engine.
pub struct ScratchPad {
    words: [f64; WORDS],
}

impl ScratchPad {
    pub fn new() -> ScratchPad {
        ScratchPad {
            words: [0.0; WORDS],
        }
    }

    pub fn write_matrix(&mut self, m: Matrix, set: SlotSet) -> ArgSlot {
        let (off, slot) = match set {
            SlotSet::First => (MATRIX_OFF, ArgSlot::Matrix),
            SlotSet::Second => (MATRIX2_OFF, ArgSlot::Matrix2),
        };
        self.words[off..off + 6].copy_from_slice(&[m.a, m.b, m.c, m.d, m.e, m.f]);
        slot
    }

    pub fn write_rect(&mut self, r: Rect, set: SlotSet) -> ArgSlot {
        let (off, slot) = match set {
            SlotSet::First => (RECT_OFF, ArgSlot::Rect),
            SlotSet::Second => (RECT2_OFF, ArgSlot::Rect2),
        };
        self.words[off..off + 4].copy_from_slice(&[r.x0, r.y0, r.x1, r.y1]);
        slot
    }

    pub fn write_point(&mut self, p: Point, set: SlotSet) -> ArgSlot {
        let (off, slot) = match set {
            SlotSet::First => (POINT_OFF, ArgSlot::Point),
            SlotSet::Second => (POINT2_OFF, ArgSlot::Point2),
        };
        self.words[off] = p.x;
        self.words[off + 1] = p.y;
        slot
    }

    pub fn write_quad(&mut self, q: Quad) -> ArgSlot {
        self.words[QUAD_OFF..QUAD_OFF + 8].copy_from_slice(&[
            q.ul.x, q.ul.y, q.ur.x, q.ur.y, q.ll.x, q.ll.y, q.lr.x, q.lr.y,
        ]);
        ArgSlot::Quad
    }

    pub fn write_color(&mut self, color: &Color) -> ArgSlot {
        let (c, n) = color.components();
        self.words[COLOR_OFF..COLOR_OFF + 4].copy_from_slice(&c);
        self.words[COLOR_N_OFF] = n as f64;
        ArgSlot::Color
    }

    fn check(&self, slot: ArgSlot, expected: &'static str) -> Result<()> {
        if slot.kind_name() == expected {
            Ok(())
        } else {
            Err(Error::Type {
                expected,
                got: slot.kind_name(),
            })
        }
    }

    pub fn read_matrix(&self, slot: ArgSlot) -> Result<Matrix> {
        self.check(slot, "matrix")?;
        let off = if slot == ArgSlot::Matrix {
            MATRIX_OFF
        } else {
            MATRIX2_OFF
        };
        let w = &self.words[off..off + 6];
        Ok(Matrix::new(w[0], w[1], w[2], w[3], w[4], w[5]))
    }

    pub fn read_rect(&self, slot: ArgSlot) -> Result<Rect> {
        self.check(slot, "rect")?;
        let off = if slot == ArgSlot::Rect { RECT_OFF } else { RECT2_OFF };
        let w = &self.words[off..off + 4];
        Ok(Rect::new(w[0], w[1], w[2], w[3]))
    }

    pub fn read_point(&self, slot: ArgSlot) -> Result<Point> {
        self.check(slot, "point")?;
        let off = if slot == ArgSlot::Point {
            POINT_OFF
        } else {
            POINT2_OFF
        };
        Ok(Point::new(self.words[off], self.words[off + 1]))
    }

    pub fn read_quad(&self, slot: ArgSlot) -> Result<Quad> {
        self.check(slot, "quad")?;
        let w = &self.words[QUAD_OFF..QUAD_OFF + 8];
        Ok(Quad {
            ul: Point::new(w[0], w[1]),
            ur: Point::new(w[2], w[3]),
            ll: Point::new(w[4], w[5]),
            lr: Point::new(w[6], w[7]),
        })
    }

    pub fn read_color(&self, slot: ArgSlot) -> Result<Color> {
        self.check(slot, "color")?;
        let n = (self.words[COLOR_N_OFF] as usize).min(4);
        Ok(Color::from_components(&self.words[COLOR_OFF..COLOR_OFF + n]))
    }
}

impl Default for ScratchPad {
    fn default() -> Self {
        ScratchPad::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_matrix() {
        let mut pad = ScratchPad::new();
        let m = Matrix::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0);
        let slot = pad.write_matrix(m, SlotSet::First);
        assert_eq!(pad.read_matrix(slot).unwrap(), m);
    }

    #[test]
    fn test_same_slot_overwrite_invalidates() {
        let mut pad = ScratchPad::new();
        let first = pad.write_rect(Rect::new(0.0, 0.0, 1.0, 1.0), SlotSet::First);
        let second = pad.write_rect(Rect::new(9.0, 9.0, 10.0, 10.0), SlotSet::First);
        assert_eq!(first, second);
        // The earlier token now reads the newer value.
        assert_eq!(pad.read_rect(first).unwrap(), Rect::new(9.0, 9.0, 10.0, 10.0));
    }

    #[test]
    fn test_second_set_is_independent() {
        let mut pad = ScratchPad::new();
        let a = pad.write_rect(Rect::new(0.0, 0.0, 1.0, 1.0), SlotSet::First);
        let b = pad.write_rect(Rect::new(2.0, 2.0, 3.0, 3.0), SlotSet::Second);
        assert_ne!(a, b);
        assert_eq!(pad.read_rect(a).unwrap(), Rect::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(pad.read_rect(b).unwrap(), Rect::new(2.0, 2.0, 3.0, 3.0));

        let m1 = pad.write_matrix(Matrix::scale(2.0, 2.0), SlotSet::First);
        let m2 = pad.write_matrix(Matrix::translate(5.0, 5.0), SlotSet::Second);
        assert_eq!(pad.read_matrix(m1).unwrap(), Matrix::scale(2.0, 2.0));
        assert_eq!(pad.read_matrix(m2).unwrap(), Matrix::translate(5.0, 5.0));
    }

    #[test]
    fn test_slot_kind_confusion_is_type_error() {
        let mut pad = ScratchPad::new();
        let slot = pad.write_rect(Rect::new(0.0, 0.0, 1.0, 1.0), SlotSet::First);
        let err = pad.read_matrix(slot).unwrap_err();
        assert_eq!(err.name(), "type-error");
        assert_eq!(err.to_string(), "type error: expected matrix, got rect");
    }

    #[test]
    fn test_color_roundtrip() {
        let mut pad = ScratchPad::new();
        let slot = pad.write_color(&Color::Cmyk(0.1, 0.2, 0.3, 0.4));
        assert_eq!(
            pad.read_color(slot).unwrap(),
            Color::Cmyk(0.1, 0.2, 0.3, 0.4)
        );
        let slot = pad.write_color(&Color::Gray(0.5));
        assert_eq!(pad.read_color(slot).unwrap(), Color::Gray(0.5));
    }

    #[test]
    fn test_quad_roundtrip() {
        let mut pad = ScratchPad::new();
        let q = Quad::from_rect(Rect::new(1.0, 2.0, 3.0, 4.0));
        let slot = pad.write_quad(q);
        assert_eq!(pad.read_quad(slot).unwrap(), q);
    }
}
