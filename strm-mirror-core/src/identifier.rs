//! Canonical catalog identifier extraction.
//!
//! The mirror inserts one directory level named after the identifier found in
//! each placeholder's filename. [`IdentifierExtractor`] is the seam; an empty
//! string means "nothing recognised" and makes the file ineligible for
//! mirroring. [`CatalogIdExtractor`] is the built-in heuristic parser.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;

use regex::Regex;

use crate::error::Result;

/// Extracts the canonical identifier from a filename.
pub trait IdentifierExtractor: Send + Sync {
    /// Returns the identifier for `name`, or an empty string when none is recognised.
    fn extract(&self, name: &str) -> String;
}

impl<F> IdentifierExtractor for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn extract(&self, name: &str) -> String {
        self(name)
    }
}

/// Catalog-number heuristic parser (`ABC-123`, `FC2-1234567`, `HEYDOUGA-4017-123`, ...).
///
/// Exceptions are returned verbatim when the upper-cased title contains them;
/// ignored patterns are stripped from the file stem before matching.
pub struct CatalogIdExtractor {
    exceptions: Vec<String>,
    ignored: Option<Regex>,
    patterns: CatalogPatterns,
}

impl fmt::Debug for CatalogIdExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogIdExtractor")
            .field("exceptions", &self.exceptions)
            .field("ignored", &self.ignored.as_ref().map(Regex::as_str))
            .finish()
    }
}

struct CatalogPatterns {
    fc2: Regex,
    heydouga: Regex,
    getchu: Regex,
    gyutto: Regex,
    luxu: Regex,
    domain: Regex,
    hey_short: Regex,
    mugen: Regex,
    ibw: Regex,
    separated: Regex,
    tokyo_hot_series: Regex,
    unseparated: Regex,
    tma: Regex,
    tokyo_hot_nk: Regex,
    numeric: Regex,
}

impl CatalogPatterns {
    fn new() -> Result<Self> {
        Ok(Self {
            fc2: Regex::new(r"FC2[^A-Z\d]{0,5}(PPV[^A-Z\d]{0,5})?(\d{5,7})")?,
            heydouga: Regex::new(r"(HEYDOUGA)[-_]*(\d{4})[-_]0?(\d{3,5})")?,
            getchu: Regex::new(r"GETCHU[-_]*(\d+)")?,
            gyutto: Regex::new(r"GYUTTO-(\d+)")?,
            luxu: Regex::new(r"259LUXU-(\d+)")?,
            domain: Regex::new(r"(?i)\w{3,10}\.(COM|NET|APP|XYZ)")?,
            hey_short: Regex::new(r"HEY[-_]*(\d{4})[-_]0?(\d{3,5})")?,
            mugen: Regex::new(r"(MKB?D)[-_]*(S\d{2,3})|(MK3D2DBD|S2M|S2MBD)[-_]*(\d{2,3})")?,
            ibw: Regex::new(r"(?i)(IBW)[-_](\d{2,5}z)")?,
            separated: Regex::new(r"([A-Z]{2,10})[-_](\d{2,5})")?,
            tokyo_hot_series: Regex::new(r"(RED[01]\d\d|SKY[0-3]\d\d|EX00[01]\d)")?,
            unseparated: Regex::new(r"([A-Z]{2,})(\d{2,5})")?,
            tma: Regex::new(r"(T[23]8[-_]\d{3})")?,
            tokyo_hot_nk: Regex::new(r"(N\d{4}|K\d{4})")?,
            numeric: Regex::new(r"(\d{6}[-_]\d{2,3})")?,
        })
    }
}

impl CatalogIdExtractor {
    /// Build an extractor. Ignored patterns are regular expressions; an invalid
    /// one is reported as [`crate::MirrorError::Pattern`].
    pub fn new(exceptions: Vec<String>, ignored_patterns: &[String]) -> Result<Self> {
        let ignored = if ignored_patterns.is_empty() {
            None
        } else {
            Some(Regex::new(&ignored_patterns.join("|"))?)
        };

        Ok(Self {
            exceptions,
            ignored,
            patterns: CatalogPatterns::new()?,
        })
    }

    fn resolve(&self, title: &str) -> String {
        let title = title.replace('/', "");
        let upper = title.to_uppercase();
        if let Some(hit) = self
            .exceptions
            .iter()
            .find(|exception| upper.contains(&exception.to_uppercase()))
        {
            return hit.clone();
        }
        self.identify(&title).to_uppercase()
    }

    fn identify(&self, title: &str) -> String {
        let stem = Path::new(title)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(title);
        let cleaned = match &self.ignored {
            Some(pattern) => pattern.replace_all(stem, ""),
            None => Cow::Borrowed(stem),
        };
        let norm = cleaned.to_uppercase();
        let p = &self.patterns;

        // Marker families only fall through to the generic tail, never to the
        // common patterns.
        if norm.contains("FC2") {
            if let Some(caps) = p.fc2.captures(&norm) {
                return format!("FC2-{}", &caps[2]);
            }
        } else if norm.contains("HEYDOUGA") {
            if let Some(caps) = p.heydouga.captures(&norm) {
                return format!("{}-{}-{}", &caps[1], &caps[2], &caps[3]);
            }
        } else if norm.contains("GETCHU") {
            if let Some(caps) = p.getchu.captures(&norm) {
                return format!("GETCHU-{}", &caps[1]);
            }
        } else if norm.contains("GYUTTO") {
            if let Some(caps) = p.gyutto.captures(&norm) {
                return format!("GYUTTO-{}", &caps[1]);
            }
        } else if norm.contains("259LUXU") {
            if let Some(caps) = p.luxu.captures(&norm) {
                return format!("259LUXU-{}", &caps[1]);
            }
        } else if let Some(id) = self.identify_common(&norm) {
            return id;
        }

        self.identify_tail(&norm)
    }

    fn identify_common(&self, norm: &str) -> Option<String> {
        let p = &self.patterns;

        let no_domain = p.domain.replace_all(norm, "");
        if no_domain != norm {
            let id = self.resolve(&no_domain);
            if !id.is_empty() {
                return Some(id);
            }
        }

        // Three-part heydouga ids must win over the two-part forms below.
        if let Some(caps) = p.hey_short.captures(norm) {
            return Some(format!("HEYDOUGA-{}-{}", &caps[1], &caps[2]));
        }
        if let Some(caps) = p.mugen.captures(norm) {
            return Some(match (caps.get(1), caps.get(2)) {
                (Some(label), Some(number)) => format!("{}-{}", label.as_str(), number.as_str()),
                _ => format!("{}-{}", &caps[3], &caps[4]),
            });
        }
        if let Some(caps) = p.ibw.captures(norm) {
            return Some(format!("{}-{}", &caps[1], &caps[2]));
        }
        if let Some(caps) = p.separated.captures(norm) {
            return Some(format!("{}-{}", &caps[1], &caps[2]));
        }
        if let Some(caps) = p.tokyo_hot_series.captures(norm) {
            return Some(caps[1].to_string());
        }
        if let Some(caps) = p.unseparated.captures(norm) {
            return Some(format!("{}-{}", &caps[1], &caps[2]));
        }
        None
    }

    fn identify_tail(&self, norm: &str) -> String {
        let p = &self.patterns;
        for pattern in [&p.tma, &p.tokyo_hot_nk, &p.numeric] {
            if let Some(caps) = pattern.captures(norm) {
                return caps[1].to_string();
            }
        }

        if norm.contains(")(") {
            let id = self.resolve(&norm.replace(")(", "-"));
            if !id.is_empty() {
                return id;
            }
        }

        String::new()
    }
}

impl IdentifierExtractor for CatalogIdExtractor {
    fn extract(&self, name: &str) -> String {
        self.resolve(name)
    }
}
