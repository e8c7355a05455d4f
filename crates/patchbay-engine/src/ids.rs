//! Short opaque identifiers for peers and request correlation.

use rand::{distributions::Alphanumeric, Rng};

const ID_LEN: usize = 8;

/// Generate a short random identifier.
///
/// Eight alphanumeric characters give enough entropy to avoid collisions
/// within one broker session while keeping topics and envelopes compact.
#[must_use]
pub fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape() {
        let id = random_id();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn distinct() {
        assert_ne!(random_id(), random_id());
    }
}
