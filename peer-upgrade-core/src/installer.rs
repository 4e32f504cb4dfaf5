//! Installer descriptors and the installer-list schema exchanged between peers.

use std::cmp::Ordering;
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only content hash algorithm peers advertise.
pub const HASH_TYPE_SHA256: &str = "sha256";

/// Length of a lowercase hex SHA-256 digest.
const HASH_HEX_LEN: usize = 64;

/// Metadata for one installer package. Identity is the content hash; `id` mirrors it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstallerDescriptor {
    pub hash: String,
    pub size: u64,
    pub version: Version,
    pub hash_type: String,
    pub platform: String,
    pub arch: Vec<String>,
    pub id: String,
}

/// What a package validator reports about an installer's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub version: Version,
    pub size: u64,
    pub platform: String,
    pub arch: Vec<String>,
}

impl InstallerDescriptor {
    pub fn new(hash: impl Into<String>, info: PackageInfo) -> Self {
        let hash = hash.into();
        Self {
            id: hash.clone(),
            hash,
            size: info.size,
            version: info.version,
            hash_type: HASH_TYPE_SHA256.to_string(),
            platform: info.platform,
            arch: info.arch,
        }
    }

    pub fn package_info(&self) -> PackageInfo {
        PackageInfo {
            version: self.version.clone(),
            size: self.size,
            platform: self.platform.clone(),
            arch: self.arch.clone(),
        }
    }

    /// True when this installer runs on `platform` with at least one of `arch`.
    pub fn is_compatible(&self, platform: &str, arch: &[String]) -> bool {
        self.platform == platform && self.arch.iter().any(|a| arch.contains(a))
    }

    fn check_schema(&self) -> Result<(), ListError> {
        if !is_valid_hash(&self.hash) {
            return Err(ListError::Schema(format!("invalid hash {:?}", self.hash)));
        }
        if self.id != self.hash {
            return Err(ListError::Schema(format!(
                "id {:?} does not match hash",
                self.id
            )));
        }
        if self.hash_type != HASH_TYPE_SHA256 {
            return Err(ListError::Schema(format!(
                "unsupported hash type {:?}",
                self.hash_type
            )));
        }
        if self.platform.is_empty() {
            return Err(ListError::Schema("empty platform".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for InstallerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] {}",
            self.version,
            self.platform,
            self.arch.join(","),
            short_hash(&self.hash)
        )
    }
}

/// First seven characters of a hash, for logs.
pub fn short_hash(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}

/// Lowercase hex SHA-256 digest.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_HEX_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Semantic-version precedence. Build metadata does not take part, so two
/// versions differing only in build metadata compare equal.
pub fn precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch)
        .cmp(&(b.major, b.minor, b.patch))
        .then_with(|| a.pre.cmp(&b.pre))
}

/// Error parsing an installer list received from a peer.
#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("forbidden key {0:?}")]
    ForbiddenKey(String),
    #[error("schema violation: {0}")]
    Schema(String),
}

/// Parse and validate the body of a peer's `GET /installers` response.
/// Documents carrying prototype-polluting keys are rejected outright.
pub fn parse_installer_list(text: &str) -> Result<Vec<InstallerDescriptor>, ListError> {
    let value: Value = serde_json::from_str(text)?;
    reject_forbidden_keys(&value)?;
    let list: Vec<InstallerDescriptor> =
        serde_json::from_value(value).map_err(|e| ListError::Schema(e.to_string()))?;
    for installer in &list {
        installer.check_schema()?;
    }
    Ok(list)
}

fn reject_forbidden_keys(value: &Value) -> Result<(), ListError> {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                if key == "__proto__" {
                    return Err(ListError::ForbiddenKey(key.clone()));
                }
                if key == "constructor" {
                    if let Value::Object(ctor) = inner {
                        if ctor.contains_key("prototype") {
                            return Err(ListError::ForbiddenKey(key.clone()));
                        }
                    }
                }
                reject_forbidden_keys(inner)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                reject_forbidden_keys(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAKE_HASH: &str = "78ad74cecb99d1023206bf2f7d9b11b28767fbb9369daa0afa5e4d062c7ce041";

    fn fake_installer() -> InstallerDescriptor {
        InstallerDescriptor::new(
            FAKE_HASH,
            PackageInfo {
                version: Version::new(1, 0, 0),
                size: 10,
                platform: "android".to_string(),
                arch: vec!["arm64-v8a".to_string()],
            },
        )
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let json = serde_json::to_value(fake_installer()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "hash": FAKE_HASH,
                "size": 10,
                "version": "1.0.0",
                "hashType": "sha256",
                "platform": "android",
                "arch": ["arm64-v8a"],
                "id": FAKE_HASH,
            })
        );
    }

    #[test]
    fn parses_valid_list() {
        let body = serde_json::to_string(&vec![fake_installer()]).unwrap();
        let list = parse_installer_list(&body).unwrap();
        assert_eq!(list, vec![fake_installer()]);
    }

    #[test]
    fn parses_empty_list() {
        assert!(parse_installer_list("[]").unwrap().is_empty());
    }

    #[test]
    fn rejects_proto_key() {
        let body = format!(
            r#"[{{"hash":"{h}","size":10,"version":"1.0.0","hashType":"sha256","platform":"android","arch":["arm64-v8a"],"id":"{h}","__proto__":{{"admin":true}}}}]"#,
            h = FAKE_HASH
        );
        assert!(matches!(
            parse_installer_list(&body),
            Err(ListError::ForbiddenKey(_))
        ));
    }

    #[test]
    fn rejects_constructor_prototype() {
        let body = r#"{"constructor":{"prototype":{"polluted":1}}}"#;
        assert!(matches!(
            parse_installer_list(body),
            Err(ListError::ForbiddenKey(_))
        ));
    }

    #[test]
    fn rejects_non_array() {
        assert!(matches!(
            parse_installer_list(r#"{"hash":"x"}"#),
            Err(ListError::Schema(_))
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            parse_installer_list("[{"),
            Err(ListError::Json(_))
        ));
    }

    #[test]
    fn rejects_id_mismatch_and_bad_hash() {
        let mut wrong_id = fake_installer();
        wrong_id.id = "something-else".to_string();
        let body = serde_json::to_string(&vec![wrong_id]).unwrap();
        assert!(matches!(
            parse_installer_list(&body),
            Err(ListError::Schema(_))
        ));

        let mut bad_hash = fake_installer();
        bad_hash.hash = "ABC".to_string();
        bad_hash.id = "ABC".to_string();
        let body = serde_json::to_string(&vec![bad_hash]).unwrap();
        assert!(matches!(
            parse_installer_list(&body),
            Err(ListError::Schema(_))
        ));
    }

    #[test]
    fn rejects_unknown_fields_and_bad_version() {
        let body = format!(
            r#"[{{"hash":"{h}","size":10,"version":"one","hashType":"sha256","platform":"android","arch":[],"id":"{h}"}}]"#,
            h = FAKE_HASH
        );
        assert!(matches!(
            parse_installer_list(&body),
            Err(ListError::Schema(_))
        ));

        let body = format!(
            r#"[{{"hash":"{h}","size":10,"version":"1.0.0","hashType":"sha256","platform":"android","arch":[],"id":"{h}","extra":1}}]"#,
            h = FAKE_HASH
        );
        assert!(parse_installer_list(&body).is_err());
    }

    #[test]
    fn precedence_ignores_build_metadata() {
        let a = Version::parse("1.2.3+build.1").unwrap();
        let b = Version::parse("1.2.3+build.2").unwrap();
        assert_eq!(precedence(&a, &b), Ordering::Equal);
    }

    #[test]
    fn precedence_orders_prerelease_below_release() {
        let pre = Version::parse("2.0.0-rc.1").unwrap();
        let rel = Version::parse("2.0.0").unwrap();
        assert_eq!(precedence(&pre, &rel), Ordering::Less);
        assert_eq!(
            precedence(&Version::new(3, 0, 0), &Version::new(4, 0, 0)),
            Ordering::Less
        );
    }

    #[test]
    fn compatibility_needs_platform_and_shared_arch() {
        let installer = fake_installer();
        let arm = vec!["arm64-v8a".to_string(), "armeabi-v7a".to_string()];
        assert!(installer.is_compatible("android", &arm));
        assert!(!installer.is_compatible("ios", &arm));
        assert!(!installer.is_compatible("android", &["x86_64".to_string()]));
    }

    #[test]
    fn short_hash_truncates() {
        assert_eq!(short_hash(FAKE_HASH), "78ad74c");
        assert_eq!(short_hash("abc"), "abc");
    }
}
