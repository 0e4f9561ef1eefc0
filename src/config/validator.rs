//! Configuration validator
//!
//! Checks that only need the decoded values; anything that depends on the
//! protocol of the relay (destination count, TLS files) is checked when the
//! relay is built.

use std::collections::HashSet;

use crate::common::{RelayError, Result};
use crate::config::defaults::MAX_NAME_LEN;
use crate::config::RelaysFile;

/// Validate a relay name
///
/// Names are 1 to 64 characters of ASCII letters, digits, `-`, `_` and `.`.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(RelayError::InvalidName(name.to_string()))
    }
}

/// Validate a whole relays file
pub fn validate_file(file: &RelaysFile) -> Result<()> {
    let mut seen = HashSet::new();

    for relay in &file.relays {
        validate_name(&relay.name)?;

        if !seen.insert(relay.name.as_str()) {
            return Err(RelayError::Config(format!(
                "Relay name {:?} is used more than once",
                relay.name
            )));
        }

        if relay.destinations.is_empty() {
            return Err(RelayError::NoDestination);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("tor-web_1.0").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("slash/name").is_err());
        assert!(validate_name(&"a".repeat(65)).is_err());
    }
}
