//! Random filler for follow-up fragments.
//!
//! Header and Body mode fragments carry random tokens so that intermediaries
//! cannot collapse them into a recognizable signature. Tokens are drawn from
//! a fixed alphabet of characters that are safe inside both header names and
//! urlencoded form fields.

use rand::rngs::ThreadRng;
use rand::seq::SliceRandom;
use rand::Rng;

const ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789 ,.;:'";

/// Browser strings rotated into the User-Agent header, one pick per run.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_9_2) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/33.0.1750.152 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_9_2) AppleWebKit/537.75.14 (KHTML, like Gecko) Version/7.0.3 Safari/537.75.14",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.9; rv:27.0) Gecko/20100101 Firefox/27.0",
    "Mozilla/5.0 (Windows NT 6.1; WOW64; Trident/7.0; rv:11.0) like Gecko",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X) AppleWebKit/534.34 (KHTML, like Gecko) PhantomJS/1.9.0 Safari/534.34",
    "Mozilla/4.0 (compatible; MSIE 8.0; Windows NT 6.1; Trident/4.0; SLCC2)",
    "Opera/9.80 (Macintosh; Intel Mac OS X 10.7.0; U; en) Presto/2.9.168 Version/11.52",
];

pub struct TextGenerator {
    rng: ThreadRng,
}

impl TextGenerator {
    pub fn new() -> Self {
        TextGenerator {
            rng: rand::thread_rng(),
        }
    }

    /// Returns a random token of exactly `len` characters.
    pub fn token(&mut self, len: usize) -> String {
        (0..len)
            .map(|_| *ALPHABET.choose(&mut self.rng).unwrap_or(&b'a') as char)
            .collect()
    }

    pub fn user_agent(&mut self) -> &'static str {
        USER_AGENTS
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(USER_AGENTS[0])
    }

    /// Uniform draw from the inclusive range, used for the per-connection
    /// receive window.
    pub fn window(&mut self, lower: usize, upper: usize) -> usize {
        if lower >= upper {
            return upper;
        }
        self.rng.gen_range(lower..=upper)
    }
}

impl Default for TextGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Characters a token may contain, exposed for tests.
pub fn alphabet() -> &'static [u8] {
    ALPHABET
}
