use ndarray::ArrayView3;

/// Pixels of a single animal cut out of a photo: contiguous RGB, row-major.
#[derive(Clone, Debug)]
pub struct Crop {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Crop {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(
            data.len(),
            (width as usize) * (height as usize) * 3,
            "data length must equal width * height * 3"
        );
        Self {
            data,
            width,
            height,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// True when either side is shorter than `min_px`.
    pub fn is_smaller_than(&self, min_px: u32) -> bool {
        self.width < min_px || self.height < min_px
    }

    /// `[H, W, 3]` view, or `None` if the buffer does not match the dimensions.
    pub fn as_ndarray(&self) -> Option<ArrayView3<'_, u8>> {
        ArrayView3::from_shape(
            (self.height as usize, self.width as usize, 3),
            &self.data,
        )
        .ok()
    }
}
