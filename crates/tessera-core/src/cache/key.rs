use serde_json::Value;
use std::fmt;

/// Deterministic identity of a (channel, arguments) pair.
///
/// Arguments are rendered as canonical JSON with object keys sorted, then
/// hashed with BLAKE3, so `{"a":1,"b":2}` and `{"b":2,"a":1}` share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn fingerprint(channel: &str, args: &Value) -> Self {
        let mut canonical = String::new();
        write_canonical(args, &mut canonical);
        let digest = blake3::hash(canonical.as_bytes());
        Self(format!("{}#{}", channel, digest.to_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn channel(&self) -> &str {
        // The digest never contains '#', the channel might.
        self.0.rsplit_once('#').map_or(self.0.as_str(), |(channel, _)| channel)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
