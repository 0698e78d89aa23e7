use serde::{Deserialize, Serialize};

/// Axis-aligned detection box in pixel units, origin at the top-left corner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersection-over-union. Zero when the union is empty.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let ix1 = self.x.max(other.x) as u64;
        let iy1 = self.y.max(other.y) as u64;
        let ix2 = (self.x as u64 + self.width as u64).min(other.x as u64 + other.width as u64);
        let iy2 = (self.y as u64 + self.height as u64).min(other.y as u64 + other.height as u64);

        let inter = ix2.saturating_sub(ix1) * iy2.saturating_sub(iy1);
        // two areas near u32::MAX squared do not fit a u64 sum
        let union = self.area() as u128 + other.area() as u128 - inter as u128;
        if union == 0 {
            return 0.0;
        }
        inter as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn bbox(x: u32, y: u32, w: u32, h: u32) -> BoundingBox {
        BoundingBox::new(x, y, w, h)
    }

    #[test]
    fn test_iou_identical_boxes() {
        let a = bbox(10, 10, 100, 100);
        assert_relative_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_iou_disjoint_boxes() {
        let a = bbox(0, 0, 50, 50);
        let b = bbox(100, 100, 50, 50);
        assert_relative_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        // intersection 50*100 = 5000, union 15000
        let a = bbox(0, 0, 100, 100);
        let b = bbox(50, 0, 100, 100);
        assert_relative_eq!(a.iou(&b), 5000.0 / 15000.0);
    }

    #[test]
    fn test_iou_contained() {
        let a = bbox(0, 0, 100, 100);
        let b = bbox(25, 25, 50, 50);
        assert_relative_eq!(a.iou(&b), 2500.0 / 10000.0);
    }

    #[test]
    fn test_iou_touching_edges() {
        let a = bbox(0, 0, 50, 50);
        let b = bbox(50, 0, 50, 50);
        assert_relative_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_degenerate_boxes_is_zero() {
        let a = bbox(10, 10, 0, 0);
        assert_relative_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_iou_of_maximal_boxes_stays_in_range() {
        let a = bbox(0, 0, u32::MAX, u32::MAX);
        let b = bbox(1, 1, u32::MAX, u32::MAX);
        let iou = a.iou(&b);
        assert!(iou > 0.99 && iou <= 1.0, "got {iou}");
        assert_relative_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_iou_large_coordinates_do_not_overflow() {
        let a = bbox(u32::MAX - 10, u32::MAX - 10, 10, 10);
        assert_relative_eq!(a.iou(&a), 1.0);
    }

    #[rstest]
    #[case(bbox(0, 0, u32::MAX, u32::MAX), bbox(1, 1, u32::MAX, u32::MAX))]
    #[case(bbox(0, 0, u32::MAX, u32::MAX), bbox(u32::MAX, u32::MAX, u32::MAX, u32::MAX))]
    #[case(bbox(0, 0, 10, 10), bbox(5, 5, 10, 10))]
    #[case(bbox(0, 0, 100, 40), bbox(20, 10, 30, 300))]
    #[case(bbox(7, 3, 1, 1), bbox(0, 0, 640, 480))]
    #[case(bbox(0, 0, 0, 10), bbox(0, 0, 10, 10))]
    #[case(bbox(300, 300, 20, 20), bbox(0, 0, 10, 10))]
    fn test_iou_symmetric_and_bounded(#[case] a: BoundingBox, #[case] b: BoundingBox) {
        let ab = a.iou(&b);
        let ba = b.iou(&a);
        assert_eq!(ab, ba);
        assert!((0.0..=1.0).contains(&ab));
    }
}
