//! Plain geometry values crossing the wrapper boundary.
//!
//! Points, rectangles, matrices and quads are passed by value everywhere;
//! only resource-backed things get handles. All components are f64.

/// Compares two floats for approximate equality.
#[inline]
pub fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() < epsilon
}

/// A point in document space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    #[inline]
    pub fn new(x: f64, y: f64) -> Point {
        Point { x, y }
    }

    /// Applies a matrix to this point.
    #[inline]
    pub fn transform(self, m: Matrix) -> Point {
        Point {
            x: m.a * self.x + m.c * self.y + m.e,
            y: m.b * self.x + m.d * self.y + m.f,
        }
    }
}

/// A rectangle with (x0, y0) at one corner and (x1, y1) at the opposite one.
///
/// A rect is valid when x0 <= x1 and y0 <= y1; the infinite rect is a
/// sentinel that survives transformation unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Rect {
    pub const EMPTY: Rect = Rect {
        x0: 0.0,
        y0: 0.0,
        x1: 0.0,
        y1: 0.0,
    };

    pub const INFINITE: Rect = Rect {
        x0: f64::NEG_INFINITY,
        y0: f64::NEG_INFINITY,
        x1: f64::INFINITY,
        y1: f64::INFINITY,
    };

    #[inline]
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Rect {
        Rect { x0, y0, x1, y1 }
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    #[inline]
    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    /// True when the rect encloses no area.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x0 >= self.x1 || self.y0 >= self.y1
    }

    /// True when min/max corners are ordered. Invalid rects are used as
    /// "nothing" markers and pass through geometry ops untouched.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.x0 <= self.x1 && self.y0 <= self.y1
    }

    #[inline]
    pub fn is_infinite(&self) -> bool {
        self.x0 == f64::NEG_INFINITY
            && self.y0 == f64::NEG_INFINITY
            && self.x1 == f64::INFINITY
            && self.y1 == f64::INFINITY
    }

    #[inline]
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x0 && p.x < self.x1 && p.y >= self.y0 && p.y < self.y1
    }

    /// Smallest rect covering both inputs. Empty operands drop out.
    pub fn union(&self, other: Rect) -> Rect {
        if !self.is_valid() || self.is_empty() {
            return other;
        }
        if !other.is_valid() || other.is_empty() {
            return *self;
        }
        Rect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Grows the rect to cover a point.
    pub fn include(&self, p: Point) -> Rect {
        if !self.is_valid() {
            return *self;
        }
        Rect {
            x0: self.x0.min(p.x),
            y0: self.y0.min(p.y),
            x1: self.x1.max(p.x),
            y1: self.y1.max(p.y),
        }
    }

    /// Applies a matrix to a rectangle.
    ///
    /// The result is not a rotated rectangle but the axis-aligned rect that
    /// tightly fits the transformed corners. Infinite and invalid rects are
    /// returned unchanged.
    pub fn transform(self, m: Matrix) -> Rect {
        if self.is_infinite() || !self.is_valid() {
            return self;
        }
        let p0 = Point::new(self.x0, self.y0).transform(m);
        let p1 = Point::new(self.x1, self.y0).transform(m);
        let p2 = Point::new(self.x1, self.y1).transform(m);
        let p3 = Point::new(self.x0, self.y1).transform(m);
        Rect {
            x0: p0.x.min(p1.x).min(p2.x).min(p3.x),
            y0: p0.y.min(p1.y).min(p2.y).min(p3.y),
            x1: p0.x.max(p1.x).max(p2.x).max(p3.x),
            y1: p0.y.max(p1.y).max(p2.y).max(p3.y),
        }
    }
}

/// A 6-element affine transformation matrix.
/// Transforms point (x, y) to (ax + cy + e, bx + dy + f).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Default for Matrix {
    fn default() -> Self {
        Matrix::IDENTITY
    }
}

impl Matrix {
    pub const IDENTITY: Matrix = Matrix {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    #[inline]
    pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Matrix {
        Matrix { a, b, c, d, e, f }
    }

    #[inline]
    pub fn scale(sx: f64, sy: f64) -> Matrix {
        Matrix::new(sx, 0.0, 0.0, sy, 0.0, 0.0)
    }

    #[inline]
    pub fn translate(tx: f64, ty: f64) -> Matrix {
        Matrix::new(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    /// Rotation by `degrees` counterclockwise.
    pub fn rotate(degrees: f64) -> Matrix {
        let (s, c) = degrees.to_radians().sin_cos();
        Matrix::new(c, s, -s, c, 0.0, 0.0)
    }

    /// Multiplies two matrices: self applied first, then `m`.
    pub fn concat(self, m: Matrix) -> Matrix {
        Matrix {
            a: self.a * m.a + self.b * m.c,
            b: self.a * m.b + self.b * m.d,
            c: self.c * m.a + self.d * m.c,
            d: self.c * m.b + self.d * m.d,
            e: self.e * m.a + self.f * m.c + m.e,
            f: self.e * m.b + self.f * m.d + m.f,
        }
    }

    #[inline]
    pub fn pre_translate(self, tx: f64, ty: f64) -> Matrix {
        Matrix::translate(tx, ty).concat(self)
    }

    #[inline]
    pub fn pre_scale(self, sx: f64, sy: f64) -> Matrix {
        Matrix::scale(sx, sy).concat(self)
    }

    /// Inverts the matrix, or None for a degenerate (or non-finite) one.
    pub fn invert(self) -> Option<Matrix> {
        let det = self.a * self.d - self.b * self.c;
        if !det.is_finite() || det.abs() < 1e-12 {
            return None;
        }
        let rd = 1.0 / det;
        let a = self.d * rd;
        let b = -self.b * rd;
        let c = -self.c * rd;
        let d = self.a * rd;
        Some(Matrix {
            a,
            b,
            c,
            d,
            e: -(self.e * a + self.f * c),
            f: -(self.e * b + self.f * d),
        })
    }

    /// Largest singular-value style expansion factor, used for sizing
    /// rasterization buffers.
    pub fn expansion(&self) -> f64 {
        (self.a * self.d - self.b * self.c).abs().sqrt()
    }
}

/// Four corners of a (possibly rotated) rectangle, y-up document order.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quad {
    pub ul: Point,
    pub ur: Point,
    pub ll: Point,
    pub lr: Point,
}

impl Quad {
    pub fn from_rect(r: Rect) -> Quad {
        Quad {
            ul: Point::new(r.x0, r.y1),
            ur: Point::new(r.x1, r.y1),
            ll: Point::new(r.x0, r.y0),
            lr: Point::new(r.x1, r.y0),
        }
    }

    pub fn transform(self, m: Matrix) -> Quad {
        Quad {
            ul: self.ul.transform(m),
            ur: self.ur.transform(m),
            ll: self.ll.transform(m),
            lr: self.lr.transform(m),
        }
    }

    /// Axis-aligned rect covering the quad.
    pub fn bounds(&self) -> Rect {
        Rect {
            x0: self.ul.x.min(self.ur.x).min(self.ll.x).min(self.lr.x),
            y0: self.ul.y.min(self.ur.y).min(self.ll.y).min(self.lr.y),
            x1: self.ul.x.max(self.ur.x).max(self.ll.x).max(self.lr.x),
            y1: self.ul.y.max(self.ur.y).max(self.ll.y).max(self.lr.y),
        }
    }
}

/// Component values for a painting color.
#[derive(Debug, Clone, PartialEq)]
pub enum Color {
    /// Greyscale (0.0 = black, 1.0 = white)
    Gray(f64),
    Rgb(f64, f64, f64),
    Cmyk(f64, f64, f64, f64),
}

impl Default for Color {
    fn default() -> Self {
        Color::Gray(0.0)
    }
}

impl Color {
    pub fn n_components(&self) -> usize {
        match self {
            Color::Gray(_) => 1,
            Color::Rgb(..) => 3,
            Color::Cmyk(..) => 4,
        }
    }

    /// Component values padded into a fixed array, with the live count.
    pub fn components(&self) -> ([f64; 4], usize) {
        match *self {
            Color::Gray(g) => ([g, 0.0, 0.0, 0.0], 1),
            Color::Rgb(r, g, b) => ([r, g, b, 0.0], 3),
            Color::Cmyk(c, m, y, k) => ([c, m, y, k], 4),
        }
    }

    /// Rebuilds a color from a component slice; lengths other than 1, 3, 4
    /// are rejected upstream, this maps unknown counts to gray black.
    pub fn from_components(c: &[f64]) -> Color {
        match c {
            [g] => Color::Gray(*g),
            [r, g, b] => Color::Rgb(*r, *g, *b),
            [c, m, y, k] => Color::Cmyk(*c, *m, *y, *k),
            _ => Color::Gray(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_identity() {
        let m = Matrix::new(2.0, 0.0, 0.0, 3.0, 5.0, 7.0);
        assert_eq!(m.concat(Matrix::IDENTITY), m);
        assert_eq!(Matrix::IDENTITY.concat(m), m);
    }

    #[test]
    fn test_point_transform() {
        let m = Matrix::translate(10.0, 20.0);
        let p = Point::new(5.0, 10.0).transform(m);
        assert_eq!(p, Point::new(15.0, 30.0));
    }

    #[test]
    fn test_invert_roundtrip() {
        let m = Matrix::new(2.0, 1.0, 0.5, 3.0, -4.0, 9.0);
        let inv = m.invert().unwrap();
        let r = Rect::new(1.0, 2.0, 30.0, 40.0);
        let back = r.transform(m).transform(inv);
        assert!(approx_eq(back.x0, r.x0, 1e-9));
        assert!(approx_eq(back.y0, r.y0, 1e-9));
        assert!(approx_eq(back.x1, r.x1, 1e-9));
        assert!(approx_eq(back.y1, r.y1, 1e-9));
    }

    #[test]
    fn test_invert_degenerate() {
        assert!(Matrix::scale(0.0, 1.0).invert().is_none());
        let nan = Matrix::new(f64::NAN, 0.0, 0.0, 1.0, 0.0, 0.0);
        assert!(nan.invert().is_none());
    }

    #[test]
    fn test_infinite_rect_unchanged() {
        let m = Matrix::rotate(45.0).pre_scale(2.0, 2.0);
        assert_eq!(Rect::INFINITE.transform(m), Rect::INFINITE);
        assert!(Rect::INFINITE.is_infinite());
    }

    #[test]
    fn test_invalid_rect_unchanged() {
        let broken = Rect::new(10.0, 10.0, -5.0, -5.0);
        assert!(!broken.is_valid());
        assert_eq!(broken.transform(Matrix::scale(3.0, 3.0)), broken);
    }

    #[test]
    fn test_rotated_rect_bounds() {
        let r = Rect::new(0.0, 0.0, 10.0, 10.0);
        let t = r.transform(Matrix::rotate(90.0));
        assert!(approx_eq(t.x0, -10.0, 1e-9));
        assert!(approx_eq(t.y0, 0.0, 1e-9));
        assert!(approx_eq(t.x1, 0.0, 1e-9));
        assert!(approx_eq(t.y1, 10.0, 1e-9));
    }

    #[test]
    fn test_union_drops_empty() {
        let a = Rect::new(0.0, 0.0, 5.0, 5.0);
        assert_eq!(a.union(Rect::EMPTY), a);
        assert_eq!(Rect::EMPTY.union(a), a);
        let b = Rect::new(3.0, 3.0, 9.0, 4.0);
        assert_eq!(a.union(b), Rect::new(0.0, 0.0, 9.0, 5.0));
    }

    #[test]
    fn test_quad_roundtrip_bounds() {
        let r = Rect::new(2.0, 3.0, 8.0, 9.0);
        assert_eq!(Quad::from_rect(r).bounds(), r);
    }

    #[test]
    fn test_color_components() {
        let (c, n) = Color::Rgb(0.25, 0.5, 0.75).components();
        assert_eq!(n, 3);
        assert_eq!(&c[..3], &[0.25, 0.5, 0.75]);
        assert_eq!(
            Color::from_components(&[0.25, 0.5, 0.75]),
            Color::Rgb(0.25, 0.5, 0.75)
        );
    }
}
