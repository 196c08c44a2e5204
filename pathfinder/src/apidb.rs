//! The API signature database consulted to enrich imports.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::convention::CallingConvention;
use crate::error::ApiDatabaseError;

/// What is known about an imported API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApiSignature {
    pub stack_delta: Option<i64>,
    pub convention: Option<CallingConvention>,
}

/// Lookup of API signatures by library, symbol, and ordinal.
pub trait ApiDictionary: Send + Sync {
    fn lookup(&self, library: &str, symbol: &str, ordinal: Option<u32>) -> Option<ApiSignature>;
}

#[derive(Deserialize)]
struct ApiEntry {
    library: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ordinal: Option<u32>,
    #[serde(default)]
    stack_delta: Option<i64>,
    #[serde(default)]
    convention: Option<CallingConvention>,
}

/// An [`ApiDictionary`] loaded from a JSON array of
/// `{"library", "name", "ordinal"?, "stack_delta"?, "convention"?}` objects.
#[derive(Debug, Default)]
pub struct JsonApiDictionary {
    by_name: BTreeMap<(String, String), ApiSignature>,
    by_ordinal: BTreeMap<(String, u32), ApiSignature>,
}

/// Library names match case-insensitively, with or without a `.dll` suffix.
fn normalize_library(library: &str) -> String {
    let l = library.to_ascii_lowercase();
    match l.strip_suffix(".dll") {
        Some(s) => s.to_owned(),
        None => l,
    }
}

impl JsonApiDictionary {
    pub fn from_json_str(s: &str) -> Result<Self, ApiDatabaseError> {
        let entries: Vec<ApiEntry> = serde_json::from_str(s)?;
        let mut r = Self::default();
        for e in entries {
            let lib = normalize_library(&e.library);
            let sig = ApiSignature {
                stack_delta: e.stack_delta,
                convention: e.convention,
            };
            if let Some(n) = e.name {
                r.by_name.insert((lib.clone(), n), sig);
            }
            if let Some(o) = e.ordinal {
                r.by_ordinal.insert((lib, o), sig);
            }
        }
        Ok(r)
    }

    pub fn load(path: &Path) -> Result<Self, ApiDatabaseError> {
        let text = std::fs::read_to_string(path).map_err(|source| ApiDatabaseError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn len(&self) -> usize {
        self.by_name.len() + self.by_ordinal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ApiDictionary for JsonApiDictionary {
    fn lookup(&self, library: &str, symbol: &str, ordinal: Option<u32>) -> Option<ApiSignature> {
        let lib = normalize_library(library);
        self.by_name
            .get(&(lib.clone(), symbol.to_owned()))
            .or_else(|| ordinal.and_then(|o| self.by_ordinal.get(&(lib, o))))
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    const DB: &str = r#"[
        {"library": "KERNEL32.dll", "name": "ExitProcess", "stack_delta": 4, "convention": "stdcall"},
        {"library": "msvcrt.dll", "name": "rand", "stack_delta": 0, "convention": "cdecl"},
        {"library": "ws2_32.dll", "ordinal": 23, "stack_delta": 12}
    ]"#;

    #[test]
    fn lookups_by_name_and_ordinal() {
        let db = JsonApiDictionary::from_json_str(DB).unwrap();
        let sig = db.lookup("kernel32.DLL", "ExitProcess", None).unwrap();
        assert_eq!(sig.stack_delta, Some(4));
        assert_eq!(sig.convention, Some(CallingConvention::Stdcall));
        assert_eq!(
            db.lookup("ws2_32", "Ordinal_23", Some(23)).unwrap().stack_delta,
            Some(12)
        );
        assert!(db.lookup("msvcrt.dll", "srand", None).is_none());
    }

    #[test]
    fn loads_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(DB.as_bytes()).unwrap();
        let db = JsonApiDictionary::load(f.path()).unwrap();
        assert_eq!(db.len(), 3);
    }

    #[test]
    fn malformed_database_is_an_error() {
        assert!(matches!(
            JsonApiDictionary::from_json_str("{"),
            Err(ApiDatabaseError::Json(_))
        ));
    }
}
