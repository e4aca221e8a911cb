use maxminddb::Reader;
use serde::Serialize;
use serde_json::Value;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const UNKNOWN: &str = "unknown";

#[derive(Error, Debug)]
pub enum GeoIpError {
    #[error("failed to open GeoIP database {path}: {source}")]
    DatabaseOpenError {
        path: PathBuf,
        #[source]
        source: maxminddb::MaxMindDBError,
    },
}

/// Location of a client, every field falls back to `unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeoInfo {
    pub country: String,
    pub province: String,
    pub city: String,
    pub isp: String,
}

impl Default for GeoInfo {
    fn default() -> Self {
        Self {
            country: UNKNOWN.to_string(),
            province: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
            isp: UNKNOWN.to_string(),
        }
    }
}

/// Resolves an address to a location. Implemented by `GeoIpClient`, and by
/// fixed tables in tests.
pub trait GeoLookup {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

pub struct GeoIpClient {
    city: Reader<Vec<u8>>,
    isp: Option<Reader<Vec<u8>>>,
}

fn open(path: &Path) -> Result<Reader<Vec<u8>>, GeoIpError> {
    debug!("opening GeoIP database at {:?}", path);
    let reader = Reader::open_readfile(path).map_err(|source| GeoIpError::DatabaseOpenError {
        path: path.to_path_buf(),
        source,
    })?;
    info!(
        "opened GeoIP database {:?} ({})",
        path, reader.metadata.database_type
    );
    Ok(reader)
}

impl GeoIpClient {
    /// Opens the city database, and the ISP (or ASN) database when given.
    pub fn new(city_db: &Path, isp_db: Option<&Path>) -> Result<Self, GeoIpError> {
        let city = open(city_db)?;
        let isp = isp_db.map(open).transpose()?;
        Ok(Self { city, isp })
    }
}

impl GeoLookup for GeoIpClient {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        if ip.is_loopback() || ip.is_unspecified() {
            return None;
        }
        let city = self.city.lookup::<Value>(ip).ok()?;
        let mut info = extract_location(&city);
        if let Some(isp) = self.isp.as_ref().and_then(|r| r.lookup::<Value>(ip).ok()) {
            if let Some(name) = ISP_PATHS
                .iter()
                .find_map(|path| get_nested_value(&isp, path))
            {
                info.isp = name.to_string();
            }
        }
        Some(info)
    }
}

const COUNTRY_PATH: &[&str] = &["country", "iso_code"];
const PROVINCE_PATH: &[&str] = &["subdivisions", "0", "names", "en"];
const CITY_PATH: &[&str] = &["city", "names", "en"];
// GeoIP2-ISP first, GeoLite2-ASN as a fallback
const ISP_PATHS: [&[&str]; 2] = [&["isp"], &["autonomous_system_organization"]];

// Regions reported under CN, with the region promoted to province
const CN_REGIONS: [(&str, &str); 3] = [("TW", "Taiwan"), ("MO", "Macao"), ("HK", "Hong Kong")];

fn get_nested_value<'a>(data: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = data;
    for &key in path {
        current = match key.parse::<usize>() {
            Ok(idx) => current.get(idx)?,
            Err(_) => current.get(key)?,
        };
    }
    current.as_str().filter(|s| !s.is_empty())
}

fn extract_location(city: &Value) -> GeoInfo {
    let mut info = GeoInfo::default();
    if let Some(country) = get_nested_value(city, COUNTRY_PATH) {
        info.country = country.to_string();
    }
    if let Some(province) = get_nested_value(city, PROVINCE_PATH) {
        info.province = province.to_string();
    }
    if let Some(name) = get_nested_value(city, CITY_PATH) {
        info.city = name.to_string();
    }
    normalize_region(info)
}

fn normalize_region(mut info: GeoInfo) -> GeoInfo {
    if let Some((_, region)) = CN_REGIONS.iter().find(|(code, _)| *code == info.country) {
        info.country = "CN".to_string();
        info.province = region.to_string();
    }
    info
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn open_missing_database_fails() {
        let res = GeoIpClient::new(Path::new("/non/existent/GeoLite2-City.mmdb"), None);
        assert!(matches!(res, Err(GeoIpError::DatabaseOpenError { .. })));
    }

    #[test]
    fn nested_values_follow_arrays() {
        let data = json!({
            "country": {"iso_code": "FR"},
            "subdivisions": [{"names": {"en": "Ile-de-France"}}],
            "city": {"names": {"en": ""}}
        });

        assert_eq!(get_nested_value(&data, COUNTRY_PATH), Some("FR"));
        assert_eq!(get_nested_value(&data, PROVINCE_PATH), Some("Ile-de-France"));
        assert_eq!(get_nested_value(&data, CITY_PATH), None);
        assert_eq!(get_nested_value(&data, &["subdivisions", "3", "names"]), None);
    }

    #[test]
    fn missing_fields_are_unknown() {
        let info = extract_location(&json!({"country": {"iso_code": "US"}}));
        assert_eq!(
            info,
            GeoInfo {
                country: "US".to_string(),
                ..GeoInfo::default()
            }
        );
    }

    #[test]
    fn chinese_regions_are_folded_into_cn() {
        let info = extract_location(&json!({
            "country": {"iso_code": "HK"},
            "city": {"names": {"en": "Kowloon"}}
        }));
        assert_eq!(info.country, "CN");
        assert_eq!(info.province, "Hong Kong");
        assert_eq!(info.city, "Kowloon");

        let info = extract_location(&json!({"country": {"iso_code": "TW"}}));
        assert_eq!((info.country.as_str(), info.province.as_str()), ("CN", "Taiwan"));
    }
}
