/// Adler-32 style checksum over a fixed-size sliding window.
///
/// Two sums modulo 65521 packed into a `u32`. Sliding the window by one byte
/// is O(1), which is what makes scanning every offset of the new data cheap.
const MOD_ADLER: u32 = 65521;

#[derive(Debug, Clone, Copy)]
pub struct Adler32Window {
    a: u32,
    b: u32,
    len: u32,
}

impl Adler32Window {
    /// Checksum of `window`; its length fixes the window size for [`roll`](Self::roll).
    pub fn over(window: &[u8]) -> Self {
        // Sums fit in u64 for any realistic block size, so reduce once at the end.
        let (a, b) = window.iter().fold((1u64, 0u64), |(a, b), &byte| {
            let a = a + u64::from(byte);
            (a, b + a)
        });
        Self {
            a: (a % u64::from(MOD_ADLER)) as u32,
            b: (b % u64::from(MOD_ADLER)) as u32,
            len: window.len() as u32,
        }
    }

    /// Drop `outgoing` from the front of the window and append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = u32::from(outgoing);
        let inc = u32::from(incoming);
        self.a = (self.a + MOD_ADLER - out + inc) % MOD_ADLER;
        let dropped = (out * (self.len % MOD_ADLER)) % MOD_ADLER;
        self.b = (self.b + self.a + MOD_ADLER - 1 + MOD_ADLER - dropped) % MOD_ADLER;
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roll_matches_fresh_checksum() {
        let data: Vec<u8> = (0..200u32).map(|i| (i * 37 % 256) as u8).collect();
        let width = 16;
        let mut rolling = Adler32Window::over(&data[..width]);
        for start in 1..=data.len() - width {
            rolling.roll(data[start - 1], data[start + width - 1]);
            assert_eq!(
                rolling.digest(),
                Adler32Window::over(&data[start..start + width]).digest(),
                "window starting at {start}"
            );
        }
    }

    #[test]
    fn test_different_windows_differ() {
        assert_ne!(
            Adler32Window::over(b"Hello").digest(),
            Adler32Window::over(b"World").digest()
        );
    }

    #[test]
    fn test_matches_reference_adler32() {
        // Adler-32 of "Wikipedia" is 0x11E60398.
        assert_eq!(Adler32Window::over(b"Wikipedia").digest(), 0x11E6_0398);
    }
}
