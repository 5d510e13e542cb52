use woothee::parser::{Parser, WootheeResult};

// List of valid user-agent attributes to keep, anything not in this list is
// converted to "Other"
const VALID_UA_OS: &[&str] = &["Firefox OS", "Linux", "Mac OSX", "Windows", "Android"];

// See dataset.rs in https://github.com/woothee/woothee-rust for the full
// list (WebKit resolves to Safari, Chromium to Chrome, etc.)
const VALID_UA_BROWSER: &[&str] = &["Chrome", "Firefox", "Safari", "Opera"];

/// Parse a user-agent string into the low-cardinality os/browser families
/// used for log fields and metric tags.
pub fn parse_user_agent(agent: &str) -> (WootheeResult<'_>, &str, &str) {
    let parser = Parser::new();
    let wresult: WootheeResult<'_> = parser.parse(agent).unwrap_or_default();

    // Determine a base os/browser for metrics' tags
    let metrics_os = if wresult.os.starts_with("Windows") {
        "Windows"
    } else if VALID_UA_OS.contains(&wresult.os) {
        wresult.os
    } else {
        "Other"
    };
    let metrics_browser = if VALID_UA_BROWSER.contains(&wresult.name) {
        wresult.name
    } else {
        "Other"
    };
    (wresult, metrics_os, metrics_browser)
}

#[cfg(test)]
mod tests {
    use super::parse_user_agent;

    #[test]
    fn test_linux() {
        let agent = r#"Mozilla/5.0 (X11; Ubuntu; Linux i686; rv:45.0) Gecko/20100101 Firefox/45.0"#;
        let (ua_result, metrics_os, metrics_browser) = parse_user_agent(agent);
        assert_eq!(metrics_os, "Linux");
        assert_eq!(ua_result.os, "Linux");
        assert_eq!(metrics_browser, "Firefox");
    }

    #[test]
    fn test_windows() {
        let agent = r#"Mozilla/5.0 (Windows NT 6.1; WOW64; rv:40.0) Gecko/20100101 Firefox/40.1"#;
        let (ua_result, metrics_os, metrics_browser) = parse_user_agent(agent);
        assert_eq!(metrics_os, "Windows");
        assert_eq!(ua_result.os, "Windows 7");
        assert_eq!(metrics_browser, "Firefox");
    }

    #[test]
    fn test_osx() {
        let agent =
            r#"Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:85.0) Gecko/20100101 Firefox/85.0"#;
        let (ua_result, metrics_os, metrics_browser) = parse_user_agent(agent);
        assert_eq!(metrics_os, "Mac OSX");
        assert_eq!(ua_result.os, "Mac OSX");
        assert_eq!(metrics_browser, "Firefox");
    }

    #[test]
    fn test_other() {
        let agent =
            r#"BlackBerry9000/4.6.0.167 Profile/MIDP-2.0 Configuration/CLDC-1.1 VendorID/102"#;
        let (ua_result, metrics_os, metrics_browser) = parse_user_agent(agent);
        assert_eq!(metrics_os, "Other");
        assert_eq!(ua_result.category, "mobilephone");
        assert_eq!(metrics_browser, "Other");
    }
}
