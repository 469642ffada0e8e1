use opencv::core::{self, Mat, Rect, Size};
use opencv::prelude::*;

/// Clockwise rotation applied to every frame before cropping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    /// One step further clockwise, wrapping at 360.
    pub fn next(self) -> Self {
        match self {
            Rotation::R0 => Rotation::R90,
            Rotation::R90 => Rotation::R180,
            Rotation::R180 => Rotation::R270,
            Rotation::R270 => Rotation::R0,
        }
    }

    pub fn inverse(self) -> Self {
        match self {
            Rotation::R0 => Rotation::R0,
            Rotation::R90 => Rotation::R270,
            Rotation::R180 => Rotation::R180,
            Rotation::R270 => Rotation::R90,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::R90 | Rotation::R270)
    }

    pub fn rotated_size(self, size: Size) -> Size {
        if self.swaps_axes() {
            Size::new(size.height, size.width)
        } else {
            size
        }
    }

    /// Maps `rect`, given in a frame of `source` size, into the rotated frame.
    pub fn rotate_rect(self, rect: Rect, source: Size) -> Rect {
        let (w, h) = (source.width, source.height);
        match self {
            Rotation::R0 => rect,
            Rotation::R90 => Rect::new(h - rect.y - rect.height, rect.x, rect.height, rect.width),
            Rotation::R180 => Rect::new(
                w - rect.x - rect.width,
                h - rect.y - rect.height,
                rect.width,
                rect.height,
            ),
            Rotation::R270 => Rect::new(rect.y, w - rect.x - rect.width, rect.height, rect.width),
        }
    }

    pub fn apply(self, frame: &Mat) -> opencv::Result<Mat> {
        let code = match self {
            Rotation::R0 => return frame.try_clone(),
            Rotation::R90 => core::ROTATE_90_CLOCKWISE,
            Rotation::R180 => core::ROTATE_180,
            Rotation::R270 => core::ROTATE_90_COUNTERCLOCKWISE,
        };
        let mut rotated = Mat::default();
        core::rotate(frame, &mut rotated, code)?;
        Ok(rotated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, Vec3b, VecN, CV_8UC3};

    fn gradient(rows: i32, cols: i32) -> Mat {
        let mut mat =
            Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(0.0)).unwrap();
        for r in 0..rows {
            for c in 0..cols {
                *mat.at_2d_mut::<Vec3b>(r, c).unwrap() =
                    VecN([r as u8, c as u8, (r * cols + c) as u8]);
            }
        }
        mat
    }

    #[test]
    fn test_next_cycles_through_quarter_turns() {
        let mut rotation = Rotation::R0;
        let mut seen = Vec::new();
        for _ in 0..4 {
            rotation = rotation.next();
            seen.push(rotation.degrees());
        }
        assert_eq!(seen, vec![90, 180, 270, 0]);
    }

    #[test]
    fn test_four_rotations_restore_frame() {
        let original = gradient(3, 5);
        let mut frame = original.try_clone().unwrap();
        let mut rotation = Rotation::R0;
        for _ in 0..4 {
            rotation = rotation.next();
            frame = Rotation::R90.apply(&frame).unwrap();
        }
        assert_eq!(rotation, Rotation::R0);
        assert_eq!(frame.size().unwrap(), original.size().unwrap());
        assert_eq!(frame.data_bytes().unwrap(), original.data_bytes().unwrap());
    }

    #[test]
    fn test_rotated_size_swaps_for_quarter_turns() {
        let size = Size::new(640, 480);
        assert_eq!(Rotation::R90.rotated_size(size), Size::new(480, 640));
        assert_eq!(Rotation::R180.rotated_size(size), size);
        assert_eq!(Rotation::R270.rotated_size(size), Size::new(480, 640));
    }

    #[test]
    fn test_rotate_rect_matches_pixel_rotation() {
        let source = Size::new(5, 3);
        let frame = gradient(3, 5);
        let rect = Rect::new(1, 0, 2, 1);
        let marker = *frame.at_2d::<Vec3b>(0, 1).unwrap();

        for rotation in [Rotation::R90, Rotation::R180, Rotation::R270] {
            let rotated = rotation.apply(&frame).unwrap();
            let mapped = rotation.rotate_rect(rect, source);
            let inside = (mapped.y..mapped.y + mapped.height)
                .flat_map(|r| (mapped.x..mapped.x + mapped.width).map(move |c| (r, c)))
                .any(|(r, c)| *rotated.at_2d::<Vec3b>(r, c).unwrap() == marker);
            assert!(inside, "{rotation:?} lost the marked pixel");
        }
    }

    #[test]
    fn test_inverse_undoes_rect_rotation() {
        let source = Size::new(640, 360);
        let rect = Rect::new(100, 40, 200, 80);
        for rotation in [Rotation::R0, Rotation::R90, Rotation::R180, Rotation::R270] {
            let there = rotation.rotate_rect(rect, source);
            let back = rotation
                .inverse()
                .rotate_rect(there, rotation.rotated_size(source));
            assert_eq!(back, rect, "{rotation:?}");
        }
    }
}
