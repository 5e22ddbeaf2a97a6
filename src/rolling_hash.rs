/// Adler-32 style rolling checksum used to find candidate block matches
/// while sliding a window over the new file one byte at a time.
///
/// Two 16-bit sums (a, b) packed into a u32. Sliding the window is O(1):
/// drop the oldest byte, admit the newest.
const MOD_ADLER: u32 = 65521;

pub struct RollingHash {
    a: u32,
    b: u32,
    window: u32,
}

impl RollingHash {
    /// Seed the checksum over an initial window.
    pub fn from_window(data: &[u8]) -> Self {
        // Accumulate in u64 so the modular reduction happens once at the
        // end instead of per byte.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in data {
            a += byte as u64;
            b += a;
        }
        Self {
            a: (a % MOD_ADLER as u64) as u32,
            b: (b % MOD_ADLER as u64) as u32,
            window: data.len() as u32,
        }
    }

    /// Slide the window one byte: drop `outgoing` from the front, admit
    /// `incoming` at the back.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = outgoing as u32;
        let inc = incoming as u32;

        self.a = (self.a + MOD_ADLER - out + inc) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a - (out * self.window) % MOD_ADLER) % MOD_ADLER;
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let data = b"the same bytes twice";
        assert_eq!(
            RollingHash::from_window(data).digest(),
            RollingHash::from_window(data).digest()
        );
    }

    #[test]
    fn test_distinguishes_content() {
        assert_ne!(
            RollingHash::from_window(b"alpha").digest(),
            RollingHash::from_window(b"omega").digest()
        );
    }

    #[test]
    fn test_roll_matches_reseed() {
        let data = b"QWERTYUIOP";
        let mut rolled = RollingHash::from_window(&data[0..6]);
        rolled.roll(data[0], data[6]);
        rolled.roll(data[1], data[7]);

        let fresh = RollingHash::from_window(&data[2..8]);
        assert_eq!(rolled.digest(), fresh.digest());
    }
}
