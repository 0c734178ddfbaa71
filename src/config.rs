//! Mount-option parsing.
//!
//! A comma-split, per-token `key=value` tokenizer. Mount option strings are
//! not argv, so this is deliberately not `clap`-based.

use log::warn;

/// Backup retention window used when no mount option overrides it.
pub const DEFAULT_MAXVERS: u32 = 10;
/// Minimum single-write size (bytes) needed to trigger a backup.
pub const DEFAULT_BKP_THRESHOLD: u32 = 32;

/// Parsed, immutable-for-the-mount configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BkpConfig {
    /// Retention window. `0` disables versioning entirely.
    pub maxvers: u32,
    /// Minimum requested write size (bytes) that triggers a backup.
    pub bkp_threshold: u32,
}

impl Default for BkpConfig {
    fn default() -> Self {
        BkpConfig {
            maxvers: DEFAULT_MAXVERS,
            bkp_threshold: DEFAULT_BKP_THRESHOLD,
        }
    }
}

impl BkpConfig {
    /// Parse a comma-separated `key=value` mount option string. Unknown keys
    /// are logged and skipped, not rejected; a malformed value for a known
    /// key falls back to that key's default.
    pub fn parse(options: &str) -> BkpConfig {
        let mut config = BkpConfig::default();
        for token in options.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let Some((key, value)) = token.split_once('=') else {
                warn!("bkpfs: ignoring mount option without a value: {token:?}");
                continue;
            };
            match key.trim() {
                "maxvers" => match value.trim().parse() {
                    Ok(v) => config.maxvers = v,
                    Err(_) => warn!("bkpfs: ignoring malformed maxvers value: {value:?}"),
                },
                "bkp_threshold" => match value.trim().parse() {
                    Ok(v) => config.bkp_threshold = v,
                    Err(_) => warn!("bkpfs: ignoring malformed bkp_threshold value: {value:?}"),
                },
                other => warn!("bkpfs: ignoring unknown mount option {other:?}"),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = BkpConfig::parse("");
        assert_eq!(config.maxvers, DEFAULT_MAXVERS);
        assert_eq!(config.bkp_threshold, DEFAULT_BKP_THRESHOLD);
    }

    #[test]
    fn parses_known_keys() {
        let config = BkpConfig::parse("maxvers=3,bkp_threshold=4");
        assert_eq!(config.maxvers, 3);
        assert_eq!(config.bkp_threshold, 4);
    }

    #[test]
    fn unknown_keys_are_ignored_not_rejected() {
        let config = BkpConfig::parse("maxvers=5,frobnicate=yes");
        assert_eq!(config.maxvers, 5);
        assert_eq!(config.bkp_threshold, DEFAULT_BKP_THRESHOLD);
    }

    #[test]
    fn zero_maxvers_disables_versioning() {
        let config = BkpConfig::parse("maxvers=0");
        assert_eq!(config.maxvers, 0);
    }
}
