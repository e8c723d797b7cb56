//! User-Agent string sent with every page, tile, and probe request.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/folio";

/// Default User-Agent identifying the tool and its version.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("folio/{version} (image-archive-assembler; +{PROJECT_UA_URL})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_carries_version_and_url() {
        let ua = default_user_agent();
        assert!(ua.starts_with(&format!("folio/{} ", env!("CARGO_PKG_VERSION"))));
        assert!(ua.contains(PROJECT_UA_URL));
    }
}
