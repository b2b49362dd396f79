use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;

pub const DEFAULT_SOCKS_PORT: u16 = 10801;
pub const DEFAULT_HTTP_PORT: u16 = 10871;

/// The JSON document handed to the proxy core.
///
/// Opaque apart from the listener convention: `inbounds[0]` is SOCKS, `inbounds[1]` is HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceConfig(Value);

impl ServiceConfig {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value { &self.0 }
    pub fn into_value(self) -> Value { self.0 }

    pub fn socks_port(&self) -> Option<u16> { self.inbound_port(0) }
    pub fn http_port(&self) -> Option<u16> { self.inbound_port(1) }

    fn inbound_port(&self, index: usize) -> Option<u16> {
        self.0
            .get("inbounds")?
            .get(index)?
            .get("port")?
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
    }

    /// Runnable config from the persisted server template and the selected outbound.
    ///
    /// Log files go to `log_dir`; the template's outbounds are replaced by `outbound` alone.
    pub fn from_template(template: Value, outbound: Value, log_dir: &Path) -> Self {
        let mut doc = match template {
            Value::Object(_) => template,
            _ => Self::default_template().into_value(),
        };
        doc["log"] = json!({
            "error": log_dir.join("error.log").to_string_lossy(),
            "loglevel": "info",
            "access": log_dir.join("access.log").to_string_lossy(),
        });
        doc["outbounds"] = json!([outbound]);
        log::info!("[CONFIG] Built core config with logs in {}", log_dir.display());
        Self(doc)
    }

    /// Template used when nothing has been persisted yet.
    pub fn default_template() -> Self {
        let allocate = json!({ "strategy": "always", "refresh": 5, "concurrency": 3 });
        Self(json!({
            "log": { "error": "", "loglevel": "info", "access": "" },
            "inbounds": [
                {
                    "listen": "127.0.0.1",
                    "port": DEFAULT_SOCKS_PORT,
                    "protocol": "socks",
                    "tag": "socks-inbound",
                    "allocate": allocate.clone(),
                },
                {
                    "listen": "127.0.0.1",
                    "port": DEFAULT_HTTP_PORT,
                    "protocol": "http",
                    "tag": "http-inbound",
                    "allocate": allocate,
                },
            ],
            "outbounds": [],
            "dns": {},
            "routing": { "settings": { "domainStrategy": "AsIs", "rules": [] } },
            "transport": {},
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_listener_ports() {
        let cfg = ServiceConfig::default_template();
        assert_eq!(cfg.socks_port(), Some(10801));
        assert_eq!(cfg.http_port(), Some(10871));
    }

    #[test]
    fn ports_absent_or_out_of_range() {
        assert_eq!(ServiceConfig::new(json!({})).socks_port(), None);
        let cfg = ServiceConfig::new(json!({ "inbounds": [{ "port": 70000 }] }));
        assert_eq!(cfg.socks_port(), None);
        assert_eq!(cfg.http_port(), None);
    }

    #[test]
    fn template_gets_logs_and_single_outbound() {
        let outbound = json!({ "protocol": "vmess", "tag": "proxy" });
        let cfg = ServiceConfig::from_template(
            ServiceConfig::default_template().into_value(),
            outbound.clone(),
            Path::new("/var/log/v2rayx"),
        );
        let v = cfg.as_value();
        assert_eq!(v["outbounds"], json!([outbound]));
        assert_eq!(v["log"]["loglevel"], "info");
        assert_eq!(v["log"]["access"], "/var/log/v2rayx/access.log");
        assert_eq!(cfg.http_port(), Some(10871));
    }

    #[test]
    fn serializes_as_plain_document() {
        let cfg = ServiceConfig::new(json!({ "inbounds": [] }));
        assert_eq!(serde_json::to_string(&cfg).unwrap(), r#"{"inbounds":[]}"#);
    }
}
