use rand::{
    RngCore,
    distr::{Distribution, Uniform},
};

use crate::shortcode::GenerateShortcode;

const ALPHABET_LEN: usize = 62;
const ALPHABET: &[u8; ALPHABET_LEN] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// 62^6 ~ 5.68e10 codes; collisions are resolved by bounded retry at insert.
const LEN: usize = 6;

#[derive(Debug, Clone, Copy, Default)]
pub struct AlphanumericShortcode;

impl AlphanumericShortcode {
    /// Call at startup so any OS entropy blocking happens before serving.
    /// Note: warms only the current thread; each thread initializes its own TLS RNG on first use.
    pub fn warm_up() {
        let mut rng = rand::rng();
        // Consume a value so seeding happens now.
        std::hint::black_box(rng.next_u32());
    }
}

impl GenerateShortcode for AlphanumericShortcode {
    fn generate_shortcode(&self) -> String {
        let mut rng = rand::rng();
        let dist = Uniform::new(0, ALPHABET_LEN).expect("failed to create distribution");

        (0..LEN)
            .map(|_| ALPHABET[dist.sample(&mut rng)] as char)
            .collect()
    }
}
