/// The "minimal standard" Lehmer generator (`minstd_rand0`).
///
/// The sequence must match `minstd_rand0` exactly for a seed to choose the same tokens.
#[derive(Debug, Clone)]
pub struct MinStdRand {
    state: u32,
}

impl MinStdRand {
    pub const MULTIPLIER: u64 = 16807;
    pub const MODULUS: u64 = 2_147_483_647;
    /// Smallest value [`next_u32`](Self::next_u32) can return.
    pub const MIN: u32 = 1;
    /// Largest value [`next_u32`](Self::next_u32) can return.
    pub const MAX: u32 = (Self::MODULUS - 1) as u32;

    pub fn new(seed: u64) -> Self {
        let mut rng = Self { state: 1 };
        rng.seed(seed);
        rng
    }

    /// A zero residue would lock the generator at zero, so it maps to 1.
    pub fn seed(&mut self, seed: u64) {
        self.state = match seed % Self::MODULUS {
            0 => 1,
            x => x as u32,
        };
    }

    pub fn next_u32(&mut self) -> u32 {
        let next = (self.state as u64 * Self::MULTIPLIER) % Self::MODULUS;
        self.state = next as u32;
        self.state
    }

    /// Uniform value in `[0, 1]`, computed in double precision.
    pub fn next_unit(&mut self) -> f64 {
        let x = self.next_u32() - Self::MIN;
        x as f64 / (Self::MAX - Self::MIN) as f64
    }
}

impl Default for MinStdRand {
    fn default() -> Self {
        Self::new(1)
    }
}
