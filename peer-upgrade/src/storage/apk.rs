//! Android package inspection.
//!
//! An APK is a ZIP archive holding a compiled (binary XML) `AndroidManifest.xml`
//! and, for native code, `lib/<abi>/*.so`. The version comes from the
//! manifest's `versionName` and the architectures from the `lib/` entries.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use peer_upgrade_core::PackageInfo;
use semver::Version;
use tracing::debug;

use super::validator::InstallerValidator;
use crate::error::{Error, Result};

pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";
pub const ANDROID_PLATFORM: &str = "android";

/// Reported for packages without native libraries; they run on every ABI.
pub const UNIVERSAL_ABIS: &[&str] = &["arm64-v8a", "armeabi-v7a", "x86", "x86_64"];

const MAX_MANIFEST_LEN: u64 = 4 * 1024 * 1024;

const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_TYPE: u16 = 0x0003;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const CHUNK_HEADER_LEN: usize = 8;
const UTF8_FLAG: u32 = 1 << 8;
const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const NO_INDEX: u32 = u32::MAX;

/// What the `<manifest>` element says about the package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApkManifest {
    pub package: Option<String>,
    pub version_name: Option<String>,
    pub version_code: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApkContents {
    pub manifest: ApkManifest,
    /// ABIs with native libraries, sorted; empty for pure-Java packages.
    pub abis: Vec<String>,
}

/// Open `path` as an APK and read its manifest and native ABIs.
pub fn inspect(path: &Path) -> Result<ApkContents> {
    let file = BufReader::new(File::open(path)?);
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| Error::InvalidInstaller(format!("not an APK archive: {e}")))?;
    let abis: BTreeSet<String> = archive
        .file_names()
        .filter_map(|name| name.strip_prefix("lib/")?.split_once('/'))
        .filter(|(abi, file)| !abi.is_empty() && !file.is_empty())
        .map(|(abi, _)| abi.to_string())
        .collect();

    let mut entry = archive
        .by_name(MANIFEST_ENTRY)
        .map_err(|e| Error::InvalidInstaller(format!("{MANIFEST_ENTRY}: {e}")))?;
    if entry.size() > MAX_MANIFEST_LEN {
        return Err(Error::InvalidInstaller(format!(
            "{MANIFEST_ENTRY} is {} bytes",
            entry.size()
        )));
    }
    let mut raw = Vec::new();
    entry
        .by_ref()
        .take(MAX_MANIFEST_LEN)
        .read_to_end(&mut raw)
        .map_err(|e| Error::InvalidInstaller(format!("{MANIFEST_ENTRY}: {e}")))?;

    Ok(ApkContents {
        manifest: parse_manifest(&raw)?,
        abis: abis.into_iter().collect(),
    })
}

/// Read the attributes of the root `<manifest>` element from compiled XML.
pub fn parse_manifest(raw: &[u8]) -> Result<ApkManifest> {
    if u16_at(raw, 0) != Some(RES_XML_TYPE) {
        return Err(malformed("not a compiled XML document"));
    }
    let header_len = u16_at(raw, 2).ok_or_else(|| malformed("truncated header"))? as usize;
    let end = u32_at(raw, 4)
        .map(|len| (len as usize).min(raw.len()))
        .ok_or_else(|| malformed("truncated header"))?;

    let mut strings: Option<Vec<String>> = None;
    let mut pos = header_len.max(CHUNK_HEADER_LEN);
    while pos + CHUNK_HEADER_LEN <= end {
        let (Some(kind), Some(chunk_header), Some(size)) =
            (u16_at(raw, pos), u16_at(raw, pos + 2), u32_at(raw, pos + 4))
        else {
            break;
        };
        let size = size as usize;
        if size < CHUNK_HEADER_LEN || pos + size > end {
            return Err(malformed("chunk overruns document"));
        }
        let chunk = &raw[pos..pos + size];
        match kind {
            RES_STRING_POOL_TYPE if strings.is_none() => {
                strings = Some(string_pool(chunk).ok_or_else(|| malformed("bad string pool"))?);
            }
            RES_XML_START_ELEMENT_TYPE => {
                let strings = strings
                    .as_deref()
                    .ok_or_else(|| malformed("element before string pool"))?;
                return manifest_element(chunk, chunk_header as usize, strings)
                    .ok_or_else(|| malformed("bad <manifest> element"))?;
            }
            _ => {}
        }
        pos += size;
    }
    Err(malformed("no <manifest> element"))
}

fn manifest_element(
    chunk: &[u8],
    header_len: usize,
    strings: &[String],
) -> Option<Result<ApkManifest>> {
    let name = strings.get(u32_at(chunk, header_len + 4)? as usize)?;
    if name != "manifest" {
        return Some(Err(malformed("root element is not <manifest>")));
    }
    let attr_start = header_len + u16_at(chunk, header_len + 8)? as usize;
    let attr_size = u16_at(chunk, header_len + 10)? as usize;
    let attr_count = u16_at(chunk, header_len + 12)? as usize;

    let mut manifest = ApkManifest::default();
    for i in 0..attr_count {
        let at = attr_start + i * attr_size;
        let Some(attr) = strings.get(u32_at(chunk, at + 4)? as usize) else {
            continue;
        };
        let raw_value = u32_at(chunk, at + 8)?;
        let data_type = *chunk.get(at + 15)?;
        let data = u32_at(chunk, at + 16)?;
        let text = || match (raw_value, data_type) {
            (NO_INDEX, TYPE_STRING) => strings.get(data as usize).cloned(),
            (NO_INDEX, _) => None,
            (index, _) => strings.get(index as usize).cloned(),
        };
        match attr.as_str() {
            "package" => manifest.package = text(),
            "versionName" => manifest.version_name = text(),
            "versionCode" if matches!(data_type, TYPE_INT_DEC | TYPE_INT_HEX) => {
                manifest.version_code = Some(data);
            }
            _ => {}
        }
    }
    Some(Ok(manifest))
}

fn string_pool(chunk: &[u8]) -> Option<Vec<String>> {
    let header_len = u16_at(chunk, 2)? as usize;
    let count = u32_at(chunk, 8)? as usize;
    let flags = u32_at(chunk, 16)?;
    let strings_start = u32_at(chunk, 20)? as usize;
    if header_len.checked_add(count.checked_mul(4)?)? > chunk.len() {
        return None;
    }
    (0..count)
        .map(|i| {
            let at = strings_start.checked_add(u32_at(chunk, header_len + i * 4)? as usize)?;
            if flags & UTF8_FLAG != 0 {
                utf8_string(chunk, at)
            } else {
                utf16_string(chunk, at)
            }
        })
        .collect()
}

fn utf16_string(buf: &[u8], at: usize) -> Option<String> {
    let first = u16_at(buf, at)? as usize;
    let (len, start) = if first & 0x8000 != 0 {
        (((first & 0x7fff) << 16) | u16_at(buf, at + 2)? as usize, at + 4)
    } else {
        (first, at + 2)
    };
    let bytes = buf.get(start..start.checked_add(len.checked_mul(2)?)?)?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

fn utf8_string(buf: &[u8], at: usize) -> Option<String> {
    // UTF-16 length first (unused), then the UTF-8 byte length.
    let (_, at) = utf8_len(buf, at)?;
    let (len, start) = utf8_len(buf, at)?;
    let bytes = buf.get(start..start.checked_add(len)?)?;
    String::from_utf8(bytes.to_vec()).ok()
}

fn utf8_len(buf: &[u8], at: usize) -> Option<(usize, usize)> {
    let first = *buf.get(at)? as usize;
    if first & 0x80 != 0 {
        Some((((first & 0x7f) << 8) | *buf.get(at + 1)? as usize, at + 2))
    } else {
        Some((first, at + 1))
    }
}

fn u16_at(buf: &[u8], at: usize) -> Option<u16> {
    let b = buf.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

fn u32_at(buf: &[u8], at: usize) -> Option<u32> {
    let b = buf.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn malformed(what: &str) -> Error {
    Error::InvalidInstaller(format!("{MANIFEST_ENTRY}: {what}"))
}

/// Reads version and ABIs out of the package itself. Declared metadata, when
/// present, must agree with what the package says.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApkValidator;

impl InstallerValidator for ApkValidator {
    fn validate(&self, path: &Path, declared: Option<&PackageInfo>) -> Result<PackageInfo> {
        let size = std::fs::metadata(path)?.len();
        let contents = inspect(path)?;
        debug!(
            package = contents.manifest.package.as_deref().unwrap_or("?"),
            version_code = ?contents.manifest.version_code,
            abis = contents.abis.len(),
            "inspected package"
        );
        let version_name = contents
            .manifest
            .version_name
            .ok_or_else(|| malformed("no versionName"))?;
        let version = Version::parse(&version_name)
            .map_err(|e| Error::InvalidInstaller(format!("versionName {version_name:?}: {e}")))?;
        let arch = if contents.abis.is_empty() {
            UNIVERSAL_ABIS.iter().map(|abi| abi.to_string()).collect()
        } else {
            contents.abis
        };
        let info = PackageInfo {
            version,
            size,
            platform: ANDROID_PLATFORM.to_string(),
            arch,
        };
        if let Some(declared) = declared {
            cross_check(declared, &info)?;
        }
        Ok(info)
    }
}

fn cross_check(declared: &PackageInfo, actual: &PackageInfo) -> Result<()> {
    if declared.size != actual.size {
        return Err(Error::InvalidInstaller(format!(
            "package is {} bytes, declared {}",
            actual.size, declared.size
        )));
    }
    if declared.version != actual.version {
        return Err(Error::InvalidInstaller(format!(
            "package is version {}, declared {}",
            actual.version, declared.version
        )));
    }
    if declared.platform != actual.platform {
        return Err(Error::InvalidInstaller(format!(
            "package is for {}, declared {}",
            actual.platform, declared.platform
        )));
    }
    if let Some(abi) = declared.arch.iter().find(|abi| !actual.arch.contains(abi)) {
        return Err(Error::InvalidInstaller(format!(
            "declared {abi} but package has no such libraries"
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixture::{apk, manifest};
    use super::*;
    use rand::RngCore;
    use tempfile::TempDir;

    fn write(temp: &TempDir, bytes: &[u8]) -> std::path::PathBuf {
        let path = temp.path().join("pkg.apk");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn manifest_attributes_are_read() {
        let parsed = parse_manifest(&manifest("com.example.test", "1.2.3", 42)).unwrap();
        assert_eq!(
            parsed,
            ApkManifest {
                package: Some("com.example.test".to_string()),
                version_name: Some("1.2.3".to_string()),
                version_code: Some(42),
            }
        );
    }

    #[test]
    fn manifest_garbage_is_rejected() {
        assert!(parse_manifest(b"<manifest/>").is_err());
        let doc = manifest("com.example.test", "1.0.0", 1);
        assert!(parse_manifest(&doc[..doc.len() - 10]).is_err());
        assert!(parse_manifest(&doc[..12]).is_err());
    }

    #[test]
    fn package_version_and_abis_come_from_the_archive() {
        let temp = TempDir::new().unwrap();
        let bytes = apk("2.1.0", &["x86_64", "arm64-v8a"]);
        let path = write(&temp, &bytes);

        let contents = inspect(&path).unwrap();
        assert_eq!(contents.abis, vec!["arm64-v8a", "x86_64"]);

        let info = ApkValidator.validate(&path, None).unwrap();
        assert_eq!(info.version, Version::new(2, 1, 0));
        assert_eq!(info.size, bytes.len() as u64);
        assert_eq!(info.platform, ANDROID_PLATFORM);
        assert_eq!(info.arch, vec!["arm64-v8a", "x86_64"]);
    }

    #[test]
    fn package_without_native_code_runs_everywhere() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, &apk("1.0.0", &[]));
        let info = ApkValidator.validate(&path, None).unwrap();
        assert_eq!(info.arch, UNIVERSAL_ABIS);
    }

    #[test]
    fn random_bytes_are_not_a_package() {
        let temp = TempDir::new().unwrap();
        let mut bytes = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut bytes);
        let path = write(&temp, &bytes);
        assert!(matches!(
            ApkValidator.validate(&path, None),
            Err(Error::InvalidInstaller(_))
        ));
    }

    #[test]
    fn archive_without_manifest_is_rejected() {
        use std::io::{Cursor, Write};
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("classes.dex", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"dex\n035\0").unwrap();
        let bytes = zip.finish().unwrap().into_inner();

        let temp = TempDir::new().unwrap();
        let path = write(&temp, &bytes);
        assert!(matches!(
            ApkValidator.validate(&path, None),
            Err(Error::InvalidInstaller(_))
        ));
    }

    #[test]
    fn declared_metadata_must_agree() {
        let temp = TempDir::new().unwrap();
        let bytes = apk("1.0.0", &["arm64-v8a"]);
        let path = write(&temp, &bytes);
        let honest = PackageInfo {
            version: Version::new(1, 0, 0),
            size: bytes.len() as u64,
            platform: ANDROID_PLATFORM.to_string(),
            arch: vec!["arm64-v8a".to_string()],
        };
        assert_eq!(ApkValidator.validate(&path, Some(&honest)).unwrap(), honest);

        let mut inflated = honest.clone();
        inflated.version = Version::new(99, 0, 0);
        assert!(ApkValidator.validate(&path, Some(&inflated)).is_err());

        let mut other_abi = honest.clone();
        other_abi.arch = vec!["x86".to_string()];
        assert!(ApkValidator.validate(&path, Some(&other_abi)).is_err());

        let mut wrong_size = honest;
        wrong_size.size += 1;
        assert!(ApkValidator.validate(&path, Some(&wrong_size)).is_err());
    }
}
