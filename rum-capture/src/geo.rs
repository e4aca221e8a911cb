use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use axum::http::HeaderMap;
use geoip::{GeoInfo, GeoLookup};
use metrics::counter;
use tracing::debug;

use crate::point::Point;

/// Headers consulted after the configured one.
const CLIENT_REAL_IP_HEADERS: [&str; 2] = ["X-Forwarded-For", "X-Real-IP"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpClass {
    Public,
    Private,
    RemoteAddr,
    Illegal,
}

impl IpClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpClass::Public => "public",
            IpClass::Private => "private",
            IpClass::RemoteAddr => "remote-addr",
            IpClass::Illegal => "illegal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp {
    /// As found in the header or on the socket
    pub raw: String,
    pub ip: Option<IpAddr>,
    pub class: IpClass,
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    // unique local fc00::/7, link local fe80::/10
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_ip(&IpAddr::V4(v4)),
            None => v6.is_loopback() || is_private_v6(v6),
        },
    }
}

/// Finds the client address: the first entry of the configured header, then
/// of the usual proxy headers, then the socket peer.
pub fn client_ip(headers: &HeaderMap, origin_header: &str, remote: SocketAddr) -> ClientIp {
    let from_header = std::iter::once(origin_header)
        .chain(CLIENT_REAL_IP_HEADERS)
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(',').next())
        .map(str::trim)
        .find(|value| !value.is_empty());

    let client = match from_header {
        Some(raw) => match raw.parse::<IpAddr>() {
            Ok(ip) => ClientIp {
                raw: raw.to_string(),
                ip: Some(ip),
                class: if is_private_ip(&ip) {
                    IpClass::Private
                } else {
                    IpClass::Public
                },
            },
            Err(_) => ClientIp {
                raw: raw.to_string(),
                ip: None,
                class: IpClass::Illegal,
            },
        },
        None => ClientIp {
            raw: remote.ip().to_string(),
            ip: Some(remote.ip()),
            class: IpClass::RemoteAddr,
        },
    };

    debug!("client ip {} ({})", client.raw, client.class.as_str());
    counter!("rum_client_ip_total", "class" => client.class.as_str()).increment(1);
    client
}

/// The `ip`, `city`, `province`, `country` and `isp` tags of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoTags {
    pub ip: String,
    pub info: GeoInfo,
}

impl GeoTags {
    pub fn resolve(lookup: Option<&(dyn GeoLookup + Send + Sync)>, client: &ClientIp) -> Self {
        let info = match (lookup, client.ip) {
            (Some(lookup), Some(ip)) => lookup.lookup(ip).unwrap_or_default(),
            _ => GeoInfo::default(),
        };
        Self {
            ip: client.raw.clone(),
            info,
        }
    }

    /// Adds the tags the client did not send itself.
    pub fn apply(&self, point: &mut Point) {
        point.add_tag_if_absent("ip", &self.ip);
        point.add_tag_if_absent("city", &self.info.city);
        point.add_tag_if_absent("province", &self.info.province);
        point.add_tag_if_absent("country", &self.info.country);
        point.add_tag_if_absent("isp", &self.info.isp);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::http::HeaderValue;

    use super::*;
    use crate::point::{FieldValue, Measurement};

    struct FixedGeo;

    impl GeoLookup for FixedGeo {
        fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
            (ip.to_string() == "1.2.3.4").then(|| GeoInfo {
                country: "CN".to_string(),
                province: "Hong Kong".to_string(),
                city: "Kowloon".to_string(),
                isp: "unknown".to_string(),
            })
        }
    }

    fn remote() -> SocketAddr {
        "10.1.1.1:4567".parse().unwrap()
    }

    #[test]
    fn classifies_private_ranges() {
        let private = [
            "127.0.0.1",
            "10.2.3.4",
            "172.16.0.9",
            "192.168.1.1",
            "169.254.3.3",
            "::1",
            "fd00::1",
            "fe80::1",
            "::ffff:192.168.0.1",
        ];
        for ip in private {
            assert!(is_private_ip(&ip.parse().unwrap()), "{ip}");
        }
        for ip in ["8.8.8.8", "172.32.0.1", "2001:4860::8888"] {
            assert!(!is_private_ip(&ip.parse().unwrap()), "{ip}");
        }
    }

    #[test]
    fn header_first_entry_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("1.2.3.4, 10.0.0.1"));

        let client = client_ip(&headers, "X-Forwarded-For", remote());
        assert_eq!(client.raw, "1.2.3.4");
        assert_eq!(client.class, IpClass::Public);
    }

    #[test]
    fn configured_header_then_fallbacks() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Real-IP", HeaderValue::from_static("192.168.0.3"));
        headers.insert("X-Client-IP", HeaderValue::from_static("8.8.4.4"));

        let client = client_ip(&headers, "X-Client-IP", remote());
        assert_eq!(client.raw, "8.8.4.4");

        headers.remove("X-Client-IP");
        let client = client_ip(&headers, "X-Client-IP", remote());
        assert_eq!(client.raw, "192.168.0.3");
        assert_eq!(client.class, IpClass::Private);
    }

    #[test]
    fn illegal_and_remote_addresses() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("not-an-ip"));
        let client = client_ip(&headers, "X-Forwarded-For", remote());
        assert_eq!(client.class, IpClass::Illegal);
        assert_eq!(client.ip, None);

        let client = client_ip(&HeaderMap::new(), "X-Forwarded-For", remote());
        assert_eq!(client.class, IpClass::RemoteAddr);
        assert_eq!(client.raw, "10.1.1.1");
    }

    #[test]
    fn geo_tags_keep_client_values() {
        let client = ClientIp {
            raw: "1.2.3.4".to_string(),
            ip: Some("1.2.3.4".parse().unwrap()),
            class: IpClass::Public,
        };
        let geo: &(dyn GeoLookup + Send + Sync) = &FixedGeo;
        let tags = GeoTags::resolve(Some(geo), &client);
        let mut point = Point::new(
            Measurement::View,
            BTreeMap::from([("city".to_string(), "Shenzhen".to_string())]),
            BTreeMap::from([("duration".to_string(), FieldValue::Int(1))]),
            0,
        )
        .unwrap();

        tags.apply(&mut point);

        assert_eq!(point.tag("ip"), Some("1.2.3.4"));
        assert_eq!(point.tag("city"), Some("Shenzhen"));
        assert_eq!(point.tag("province"), Some("Hong Kong"));
        assert_eq!(point.tag("country"), Some("CN"));
        assert_eq!(point.tag("isp"), Some("unknown"));

        let unknown = GeoTags::resolve(None, &client);
        assert_eq!(unknown.info, GeoInfo::default());
    }
}
