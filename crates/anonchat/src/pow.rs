//! Proof-of-work solver for the chat-requirements challenge.
//!
//! Upstream hands out a `(seed, difficulty)` pair together with the session
//! token and expects a token proving that the client burned some CPU on it.
//! The proof is a base64 JSON array imitating a browser fingerprint, with one
//! slot used as the counter:
//!
//! ```text
//! [cores + screen, "<date> GMT-0500 (Eastern Time)", 4294705152, counter, user_agent]
//! ```
//!
//! A counter is accepted once `sha3_512(seed + base64)` rendered as hex has a
//! prefix (half as long as the difficulty) that sorts at or below the
//! difficulty string. Solving is best-effort: when the attempt bound runs out
//! a fixed fallback token is returned and upstream is left to reject it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use sha3::{Digest, Sha3_512};

pub const MAX_ATTEMPTS: u32 = 100_000;

const CORE_COUNTS: [u32; 4] = [8, 12, 16, 24];
const SCREEN_SIZES: [u32; 3] = [3000, 4000, 6000];
const CONFIG_MAGIC: u64 = 4_294_705_152;
const CLOCK_SKEW_HOURS: i64 = 8;

const TOKEN_PREFIX: &str = "gAAAAAB";
const FALLBACK_PREFIX: &str = "gAAAAABwQ8Lk5FbGpA2NcR9dShT6gYjU7VxZ4D";

/// Browser-looking values mixed into every proof attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hardware: u32,
    pub timestamp: String,
    pub user_agent: String,
}

impl Fingerprint {
    /// Pick a random plausible core count and screen size, stamped now.
    pub fn random(user_agent: &str) -> Self {
        let mut rng = rand::thread_rng();
        let cores = CORE_COUNTS.choose(&mut rng).copied().unwrap_or(8);
        let screen = SCREEN_SIZES.choose(&mut rng).copied().unwrap_or(3000);
        Self::at(Utc::now(), cores + screen, user_agent)
    }

    pub fn at(now: DateTime<Utc>, hardware: u32, user_agent: &str) -> Self {
        Self {
            hardware,
            timestamp: format_timestamp(now),
            user_agent: user_agent.to_string(),
        }
    }
}

/// Render `now` minus the clock skew as an HTTP date with a zone label
/// spliced in, the way a browser's `Date.toString` would read.
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    let skewed = now - chrono::Duration::hours(CLOCK_SKEW_HOURS);
    skewed
        .format("%a, %d %b %Y %H:%M:%S GMT-0500 (Eastern Time)")
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofToken {
    /// A counter satisfying the difficulty was found.
    Solved { token: String, counter: u32 },
    /// The attempt bound ran out; upstream will most likely reject this.
    Fallback(String),
}

impl ProofToken {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Solved { token, .. } => token,
            Self::Fallback(token) => token,
        }
    }

    pub fn into_string(self) -> String {
        match self {
            Self::Solved { token, .. } => token,
            Self::Fallback(token) => token,
        }
    }

    pub fn is_solved(&self) -> bool {
        matches!(self, Self::Solved { .. })
    }
}

pub fn solve(seed: &str, difficulty: &str, user_agent: &str) -> ProofToken {
    solve_with(seed, difficulty, &Fingerprint::random(user_agent), MAX_ATTEMPTS)
}

/// Deterministic core of [`solve`].
pub fn solve_with(
    seed: &str,
    difficulty: &str,
    fingerprint: &Fingerprint,
    max_attempts: u32,
) -> ProofToken {
    let (head, tail) = config_template(fingerprint);

    for counter in 0..max_attempts {
        let config = format!("{}{}{}", head, counter, tail);
        let encoded = STANDARD.encode(config.as_bytes());
        if meets_difficulty(seed, &encoded, difficulty) {
            return ProofToken::Solved {
                token: format!("{}{}", TOKEN_PREFIX, encoded),
                counter,
            };
        }
    }

    tracing::warn!(
        difficulty,
        attempts = max_attempts,
        "proof of work not solved, using fallback token"
    );
    ProofToken::Fallback(fallback_token(seed))
}

/// Check a token returned by [`solve`] against its challenge.
pub fn verify(token: &str, seed: &str, difficulty: &str) -> bool {
    token
        .strip_prefix(TOKEN_PREFIX)
        .is_some_and(|encoded| meets_difficulty(seed, encoded, difficulty))
}

pub fn fallback_token(seed: &str) -> String {
    let quoted = format!("\"{}\"", seed);
    format!("{}{}", FALLBACK_PREFIX, STANDARD.encode(quoted.as_bytes()))
}

/// Compact JSON of the config array split around the counter slot.
fn config_template(fingerprint: &Fingerprint) -> (String, String) {
    let timestamp = serde_json::Value::from(fingerprint.timestamp.as_str()).to_string();
    let user_agent = serde_json::Value::from(fingerprint.user_agent.as_str()).to_string();
    (
        format!("[{},{},{},", fingerprint.hardware, timestamp, CONFIG_MAGIC),
        format!(",{}]", user_agent),
    )
}

fn meets_difficulty(seed: &str, encoded: &str, difficulty: &str) -> bool {
    let mut hasher = Sha3_512::new();
    hasher.update(seed.as_bytes());
    hasher.update(encoded.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let prefix_len = (difficulty.len() / 2).min(digest.len());
    digest[..prefix_len] <= *difficulty
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_fingerprint() -> Fingerprint {
        let now = Utc.with_ymd_and_hms(2024, 4, 10, 12, 30, 0).unwrap();
        Fingerprint::at(now, 8 + 3000, "Mozilla/5.0")
    }

    fn decode_config(token: &str) -> serde_json::Value {
        let encoded = token.strip_prefix(TOKEN_PREFIX).unwrap();
        let raw = STANDARD.decode(encoded).unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    #[test]
    fn test_timestamp_is_skewed_and_labelled() {
        let now = Utc.with_ymd_and_hms(2024, 4, 10, 12, 30, 0).unwrap();
        assert_eq!(
            format_timestamp(now),
            "Wed, 10 Apr 2024 04:30:00 GMT-0500 (Eastern Time)"
        );
    }

    #[test]
    fn test_config_layout() {
        let token = solve_with("seed", "ffffff", &fixed_fingerprint(), 10);
        assert!(matches!(token, ProofToken::Solved { counter: 0, .. }));

        let config = decode_config(token.as_str());
        assert_eq!(
            config,
            serde_json::json!([
                3008,
                "Wed, 10 Apr 2024 04:30:00 GMT-0500 (Eastern Time)",
                4294705152u64,
                0,
                "Mozilla/5.0"
            ])
        );
    }

    #[test]
    fn test_solved_token_satisfies_difficulty() {
        let seed = "0.4242424242";
        let difficulty = "0fffff";
        let token = solve_with(seed, difficulty, &fixed_fingerprint(), MAX_ATTEMPTS);

        assert!(token.is_solved());
        assert!(verify(token.as_str(), seed, difficulty));

        let ProofToken::Solved { counter, .. } = &token else {
            unreachable!()
        };
        assert_eq!(decode_config(token.as_str())[3], *counter);

        // The digest of the embedded config really has a small enough prefix.
        let encoded = token.as_str().strip_prefix(TOKEN_PREFIX).unwrap();
        let digest = hex::encode(Sha3_512::digest(format!("{}{}", seed, encoded)));
        assert!(&digest[..3] <= difficulty);
    }

    #[test]
    fn test_exhausted_bound_returns_fallback() {
        let token = solve_with("abc", "0000000000", &fixed_fingerprint(), 20);

        assert!(!token.is_solved());
        assert_eq!(token.as_str(), fallback_token("abc"));
        // base64 of "\"abc\""
        assert_eq!(
            token.into_string(),
            "gAAAAABwQ8Lk5FbGpA2NcR9dShT6gYjU7VxZ4DImFiYyI="
        );
    }

    #[test]
    fn test_verify_rejects_foreign_tokens() {
        assert!(!verify("not-a-proof", "seed", "ffffff"));
        assert!(!verify(&fallback_token("seed"), "seed", "0000000000"));
    }

    #[test]
    fn test_random_fingerprint_uses_known_hardware() {
        let fp = Fingerprint::random("ua");
        let plausible: Vec<u32> = CORE_COUNTS
            .iter()
            .flat_map(|c| SCREEN_SIZES.iter().map(move |s| c + s))
            .collect();
        assert!(plausible.contains(&fp.hardware));
        assert!(fp.timestamp.ends_with("GMT-0500 (Eastern Time)"));
    }
}
