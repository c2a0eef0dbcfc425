//! Hilbert curve indexing.

/// Hilbert curve over `dim_num` axes with `bits` bits per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hilbert {
    bits: u32,
    dim_num: usize,
}

impl Hilbert {
    /// Curve for `dim_num` axes, using as many bits as fit a `u64` index.
    pub fn new(dim_num: usize) -> Self {
        let bits = (63 / dim_num.max(1) as u32).max(1);
        Self { bits, dim_num }
    }

    /// Bits per axis.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Hilbert index of a point whose axes are already in `[0, 2^bits)`.
    pub fn index(&self, coords: &[u64]) -> u64 {
        debug_assert_eq!(coords.len(), self.dim_num);
        let mut x = coords.to_vec();
        axes_to_transpose(&mut x, self.bits);

        let mut h = 0u64;
        for b in (0..self.bits).rev() {
            for xi in &x {
                h = (h << 1) | ((xi >> b) & 1);
            }
        }
        h
    }
}

/// Skilling's in-place transform from axes to the transposed Hilbert index.
fn axes_to_transpose(x: &mut [u64], bits: u32) {
    let n = x.len();
    if n == 0 {
        return;
    }
    let m = 1u64 << (bits - 1);

    // Inverse undo
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0u64;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for xi in x.iter_mut() {
        *xi ^= t;
    }
}
