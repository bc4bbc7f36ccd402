//! Small shared helpers

pub mod jitter;

use rand::Rng;

const NAME_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Random `[A-Z0-9]` string, used for public upload file names
pub fn random_name(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| NAME_CHARSET[rng.random_range(0..NAME_CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_name_charset_and_length() {
        let name = random_name(32);
        assert_eq!(name.len(), 32);
        assert!(
            name.chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        );
        assert_ne!(random_name(32), name);
    }
}
