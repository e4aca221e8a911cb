use std::collections::HashMap;

use prost::Message;

/// One accepted replay upload as it sits in the disk queue.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// Request headers, names lower-cased
    #[prost(map = "string, string", tag = "1")]
    pub headers: HashMap<String, String>,
    /// The multipart body exactly as the SDK sent it
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
    /// Text fields of the multipart form
    #[prost(map = "string, message", tag = "3")]
    pub form_values: HashMap<String, FormValues>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FormValues {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

impl Envelope {
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form_values
            .get(key)
            .and_then(|v| v.values.first())
            .map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn encode_record(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn decode_record(record: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(record)
    }
}

/// The `{app_id, env, version, service}` labels of replay metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayLabels {
    pub app_id: String,
    pub env: String,
    pub version: String,
    pub service: String,
}

impl ReplayLabels {
    pub fn of(envelope: &Envelope) -> Self {
        let label = |key: &str| envelope.form_value(key).unwrap_or_default().to_string();
        Self {
            app_id: label("app_id"),
            env: label("env"),
            version: label("version"),
            service: label("service"),
        }
    }

    pub fn labels(&self) -> [(&'static str, String); 4] {
        [
            ("app_id", self.app_id.clone()),
            ("env", self.env.clone()),
            ("version", self.version.clone()),
            ("service", self.service.clone()),
        ]
    }
}
