use crate::quant::blocks::*;

/// The element type of a tensor.
///
/// Tag values follow the GGUF on-disk numbering, so a dtype read from a
/// container maps directly onto this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F32,
    F16,
    I8,
    I16,
    I32,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    Q8K,
}

impl Dtype {
    pub fn from_u32(u: u32) -> Option<Self> {
        let dtype = match u {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            10 => Self::Q2K,
            11 => Self::Q3K,
            12 => Self::Q4K,
            13 => Self::Q5K,
            14 => Self::Q6K,
            15 => Self::Q8K,
            16 => Self::I8,
            17 => Self::I16,
            18 => Self::I32,
            _ => return None,
        };
        Some(dtype)
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q5_0 => 6,
            Self::Q5_1 => 7,
            Self::Q8_0 => 8,
            Self::Q8_1 => 9,
            Self::Q2K => 10,
            Self::Q3K => 11,
            Self::Q4K => 12,
            Self::Q5K => 13,
            Self::Q6K => 14,
            Self::Q8K => 15,
            Self::I8 => 16,
            Self::I16 => 17,
            Self::I32 => 18,
        }
    }

    /// The number of elements encoded together in one block.
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 | Self::I8 | Self::I16 | Self::I32 => 1,
            Self::Q4_0 => QK4_0,
            Self::Q4_1 => QK4_1,
            Self::Q5_0 => QK5_0,
            Self::Q5_1 => QK5_1,
            Self::Q8_0 => QK8_0,
            Self::Q8_1 => QK8_1,
            Self::Q2K | Self::Q3K | Self::Q4K | Self::Q5K | Self::Q6K | Self::Q8K => QK_K,
        }
    }

    /// The on-disk byte size of one block.
    pub fn type_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
            Self::Q4_0 => std::mem::size_of::<BlockQ4_0>(),
            Self::Q4_1 => std::mem::size_of::<BlockQ4_1>(),
            Self::Q5_0 => std::mem::size_of::<BlockQ5_0>(),
            Self::Q5_1 => std::mem::size_of::<BlockQ5_1>(),
            Self::Q8_0 => std::mem::size_of::<BlockQ8_0>(),
            Self::Q8_1 => std::mem::size_of::<BlockQ8_1>(),
            Self::Q2K => std::mem::size_of::<BlockQ2K>(),
            Self::Q3K => std::mem::size_of::<BlockQ3K>(),
            Self::Q4K => std::mem::size_of::<BlockQ4K>(),
            Self::Q5K => std::mem::size_of::<BlockQ5K>(),
            Self::Q6K => std::mem::size_of::<BlockQ6K>(),
            Self::Q8K => std::mem::size_of::<BlockQ8K>(),
        }
    }

    pub fn bits_per_weight(self) -> f64 {
        (self.type_size() as f64 * 8.0) / self.block_size() as f64
    }

    pub fn is_quantized(self) -> bool {
        self.block_size() > 1
    }

    /// The format the right-hand operand of a dot product must be encoded
    /// in when the left-hand side has this dtype.
    pub fn vec_dot_type(self) -> Self {
        match self {
            Self::Q4_0 | Self::Q5_0 | Self::Q8_0 => Self::Q8_0,
            Self::Q4_1 | Self::Q5_1 | Self::Q8_1 => Self::Q8_1,
            Self::Q2K | Self::Q3K | Self::Q4K | Self::Q5K | Self::Q6K | Self::Q8K => Self::Q8K,
            Self::F16 => Self::F16,
            _ => Self::F32,
        }
    }

    /// Byte size of `n` elements, `n` divisible by the block size.
    pub fn row_size(self, n: usize) -> usize {
        debug_assert!(n % self.block_size() == 0);
        n / self.block_size() * self.type_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_sizes_match_disk_layout() {
        assert_eq!(Dtype::Q4_0.type_size(), 18);
        assert_eq!(Dtype::Q4_1.type_size(), 20);
        assert_eq!(Dtype::Q5_0.type_size(), 22);
        assert_eq!(Dtype::Q5_1.type_size(), 24);
        assert_eq!(Dtype::Q8_0.type_size(), 34);
        assert_eq!(Dtype::Q8_1.type_size(), 40);
        assert_eq!(Dtype::F32.block_size(), 1);
        for dtype in [Dtype::Q2K, Dtype::Q3K, Dtype::Q4K, Dtype::Q5K, Dtype::Q6K, Dtype::Q8K] {
            assert_eq!(dtype.block_size(), 256);
        }
    }

    #[test]
    fn dtype_tags_round_trip() {
        for tag in 0..=18u32 {
            if let Some(dtype) = Dtype::from_u32(tag) {
                assert_eq!(dtype.to_u32(), tag);
            }
        }
        assert!(Dtype::from_u32(4).is_none());
        assert!(Dtype::from_u32(5).is_none());
        assert!(Dtype::from_u32(19).is_none());
    }
}
