use std::time::Duration;

use url::Url;

use ember_types::Topic;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// API origin, e.g. `https://api.example.com/`. The scheme is swapped
    /// for its streaming equivalent.
    pub origin: Url,
    /// Prefix placed before every topic.
    pub path_prefix: String,
    /// How long to wait for the server to echo a close frame.
    pub close_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            path_prefix: "ws/".into(),
            close_timeout: Duration::from_secs(5),
        }
    }

    fn stream_scheme(&self) -> Result<&'static str, GatewayError> {
        match self.origin.scheme() {
            "http" | "ws" => Ok("ws"),
            "https" | "wss" => Ok("wss"),
            other => Err(GatewayError::InvalidOrigin(other.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        self.stream_scheme().map(|_| ())
    }

    /// `<ws-origin>/<prefix><topic>`. The access token is NOT part of the URL;
    /// it travels as a subprotocol so it stays out of access logs.
    pub fn channel_url(&self, topic: &Topic) -> Result<Url, GatewayError> {
        let scheme = self.stream_scheme()?;
        let mut url = self.origin.clone();
        url.set_scheme(scheme)
            .map_err(|_| GatewayError::InvalidOrigin(self.origin.scheme().to_string()))?;
        url.set_path(&format!("/{}{}", self.path_prefix, topic));
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

pub fn bearer_subprotocol(token: &str) -> String {
    format!("Bearer.{}", token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::PeerId;

    fn config(origin: &str) -> GatewayConfig {
        GatewayConfig::new(Url::parse(origin).unwrap())
    }

    #[test]
    fn swaps_scheme_and_replaces_path() {
        let url = config("https://api.example.com/api/?x=1")
            .channel_url(&Topic::messages(PeerId(42)))
            .unwrap();
        assert_eq!(url.as_str(), "wss://api.example.com/ws/message/42/");

        let url = config("http://localhost:8000").channel_url(&Topic::swipe()).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/ws/swipe/");
    }

    #[test]
    fn rejects_non_http_origins() {
        assert!(matches!(
            config("ftp://example.com").validate(),
            Err(GatewayError::InvalidOrigin(_))
        ));
    }

    #[test]
    fn subprotocol_format() {
        assert_eq!(bearer_subprotocol("abc.def.ghi"), "Bearer.abc.def.ghi");
    }
}
