use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::locator::SourceLocator;
use crate::types::LoadOptions;

/// The deterministic identifier of a cacheable resource, also used as the
/// file name inside the disk cache.
///
/// A key is derived from the source locator plus the load variant. Policy
/// options (cache tiers, TTL, refresh flags) deliberately do not contribute,
/// so requests that only differ in policy still coalesce onto one fetch.
#[derive(Debug, Clone, Eq)]
pub struct ResourceKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_path())
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl PartialOrd for ResourceKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hash.cmp(&other.hash)
    }
}

impl std::hash::Hash for ResourceKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl ResourceKey {
    /// Creates the [`ResourceKey`] for the given locator and options.
    pub fn for_locator(locator: &SourceLocator, options: &LoadOptions) -> Self {
        let mut builder = Self::builder(locator);
        if let Some(variant) = options.variant.as_deref() {
            builder.write_variant(variant).unwrap();
        }
        builder.build()
    }

    /// Creates a [`KeyBuilder`] seeded with the locator metadata.
    pub fn builder(locator: &SourceLocator) -> KeyBuilder {
        let metadata = format!("locator: {locator}\n");
        KeyBuilder { metadata }
    }

    /// Returns the human-readable metadata that forms the basis of the key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this key inside a cache directory.
    ///
    /// The relative path is the sha-256 over the metadata, hex-formatted and
    /// sharded like so: `aa/bbccdd/eeff...`
    pub fn relative_path(&self) -> String {
        let mut path = format!("{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path.push('/');
        for b in &self.hash[4..] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path
    }

    #[cfg(test)]
    pub fn for_testing(metadata: impl Into<String>) -> Self {
        KeyBuilder {
            metadata: metadata.into(),
        }
        .build()
    }
}

/// A builder for [`ResourceKey`]s.
///
/// The builder implements [`Write`](std::fmt::Write) and accepts human
/// readable, but most importantly **stable**, input. The input is hashed to
/// form the key and kept verbatim for debugging.
pub struct KeyBuilder {
    metadata: String,
}

impl KeyBuilder {
    /// Writes the load variant into the key.
    pub fn write_variant(&mut self, variant: &str) -> Result<(), fmt::Error> {
        self.metadata
            .write_fmt(format_args!("variant: {variant}\n"))
    }

    /// Finalize the [`ResourceKey`].
    pub fn build(self) -> ResourceKey {
        let hash = Sha256::digest(&self.metadata);
        // FIXME: `sha2` should really adopt const generics, this is such a pain right now
        let hash = <[u8; 32]>::try_from(hash).expect("sha256 outputs 32 bytes");

        ResourceKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for KeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashed_paths() {
        let locator = SourceLocator::parse("https://example.com/assets/logo.png").unwrap();

        let key = ResourceKey::for_locator(&locator, &LoadOptions::default());
        assert_eq!(
            key.metadata(),
            "locator: https://example.com/assets/logo.png\n"
        );
        assert_eq!(
            &key.relative_path(),
            "e7/18830d/fefe99b5a1cdf20a9abeb86bc7f3799d6a89c828a4b98890e3d9c1f6"
        );

        let options = LoadOptions {
            variant: Some("thumb-64".into()),
            ..Default::default()
        };
        let key = ResourceKey::for_locator(&locator, &options);
        assert_eq!(
            key.metadata(),
            "locator: https://example.com/assets/logo.png\nvariant: thumb-64\n"
        );
        assert_eq!(
            &key.relative_path(),
            "b2/db531b/113376d14b1c83c3961802ad16c74069a854a24dcbf41bc75c2f461c"
        );

        let locator = SourceLocator::parse("file:///var/data/blob.bin").unwrap();
        let key = ResourceKey::for_locator(&locator, &LoadOptions::default());
        assert_eq!(
            &key.relative_path(),
            "86/d21df3/f6aa70777c7e0c1ef34840a6c134566c24d6c86434bc1b19bd3021d6"
        );
    }

    #[test]
    fn policy_options_do_not_change_the_key() {
        let locator = SourceLocator::parse("https://example.com/a.bin").unwrap();
        let plain = ResourceKey::for_locator(&locator, &LoadOptions::default());
        let tweaked = ResourceKey::for_locator(
            &locator,
            &LoadOptions {
                cache_in_memory: false,
                cache_on_disk: false,
                ttl: Some(std::time::Duration::from_secs(1)),
                refresh_after_hit: true,
                ..Default::default()
            },
        );
        assert_eq!(plain, tweaked);

        let variant = ResourceKey::for_locator(
            &locator,
            &LoadOptions {
                variant: Some("grayscale".into()),
                ..Default::default()
            },
        );
        assert_ne!(plain, variant);
    }
}
