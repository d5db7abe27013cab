use std::fmt;
use std::path::PathBuf;

use url::Url;

use crate::error::LoadError;

/// The source location of a loadable resource.
///
/// Locators are parsed from the textual form consumers hand in. Recognized
/// forms are `http(s)://` URLs, `file://` URLs and plain absolute paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceLocator {
    /// A resource fetched over HTTP(S).
    Http(Url),
    /// A resource read from the local filesystem.
    Filesystem(PathBuf),
}

impl SourceLocator {
    /// Parses a textual locator.
    ///
    /// This is the synchronous error surface of the engine: a malformed
    /// locator is reported to the caller directly and never turns into a
    /// request.
    pub fn parse(input: &str) -> Result<Self, LoadError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(LoadError::InvalidLocator("empty locator".into()));
        }

        match Url::parse(input) {
            Ok(url) => match url.scheme() {
                "http" | "https" => Ok(Self::Http(url)),
                "file" => url
                    .to_file_path()
                    .map(Self::Filesystem)
                    .map_err(|()| LoadError::InvalidLocator(input.into())),
                scheme => Err(LoadError::InvalidLocator(format!(
                    "unsupported scheme `{scheme}`"
                ))),
            },
            // Not URL-shaped. Absolute paths still count as filesystem
            // locators, anything else is rejected.
            Err(_) if input.starts_with('/') => Ok(Self::Filesystem(PathBuf::from(input))),
            Err(_) => Err(LoadError::InvalidLocator(input.into())),
        }
    }

    /// Returns `true` for locators that resolve over the network.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => f.write_str(url.as_str()),
            Self::Filesystem(path) => write!(f, "file://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_http_urls() {
        let locator = SourceLocator::parse("https://example.com/assets/logo.png").unwrap();
        assert_eq!(
            locator,
            SourceLocator::Http(Url::parse("https://example.com/assets/logo.png").unwrap())
        );
        assert!(locator.is_remote());
    }

    #[test]
    fn parses_file_urls_and_plain_paths() {
        let from_url = SourceLocator::parse("file:///var/data/blob.bin").unwrap();
        let from_path = SourceLocator::parse("/var/data/blob.bin").unwrap();
        assert_eq!(from_url, from_path);
        assert_eq!(
            from_path,
            SourceLocator::Filesystem(PathBuf::from("/var/data/blob.bin"))
        );
        assert!(!from_path.is_remote());
    }

    #[test]
    fn rejects_malformed_locators() {
        assert!(matches!(
            SourceLocator::parse(""),
            Err(LoadError::InvalidLocator(_))
        ));
        assert!(matches!(
            SourceLocator::parse("relative/path.png"),
            Err(LoadError::InvalidLocator(_))
        ));
        assert!(matches!(
            SourceLocator::parse("ftp://example.com/logo.png"),
            Err(LoadError::InvalidLocator(_))
        ));
    }

    #[test]
    fn display_roundtrips_through_parse() {
        for input in ["https://example.com/a/b.png", "file:///var/data/blob.bin"] {
            let locator = SourceLocator::parse(input).unwrap();
            assert_eq!(SourceLocator::parse(&locator.to_string()).unwrap(), locator);
        }
    }
}
