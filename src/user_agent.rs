//! User-Agent string shared by every outbound request.

/// Project URL advertised to vendor sites so operators can identify the crawler.
const PROJECT_UA_URL: &str = "https://github.com/fierce/manual-harvester";

/// Default User-Agent for page fetches, API calls and artifact downloads.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("manual-harvester/{version} (AVManualsBot; +{PROJECT_UA_URL})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_identifies_bot_and_version() {
        let ua = default_user_agent();
        assert!(ua.starts_with("manual-harvester/"));
        assert!(ua.contains(env!("CARGO_PKG_VERSION")));
        assert!(ua.contains("AVManualsBot"));
        assert!(ua.contains(PROJECT_UA_URL));
    }
}
