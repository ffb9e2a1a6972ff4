//! Transport negotiation.
//!
//! `POST {hub}/negotiate?negotiateVersion=1` returns the connection token and
//! the transports the server offers. The server may instead redirect the
//! client to another endpoint (`url` + `accessToken`); redirects are followed
//! up to [`MAX_REDIRECTS`] times.

use crate::error::{ChannelError, Result};
use crate::transport::TransportKind;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

/// Negotiate protocol version requested by the client
pub const NEGOTIATE_VERSION: u32 = 1;

pub const MAX_REDIRECTS: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub negotiate_version: u32,
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

impl NegotiateResponse {
    /// Offered transports that can carry the text protocol, in server order
    pub fn text_transports(&self) -> Vec<TransportKind> {
        self.available_transports
            .iter()
            .filter(|t| t.transfer_formats.iter().any(|f| f == "Text"))
            .filter_map(|t| TransportKind::from_name(&t.transport))
            .collect()
    }

    /// Token identifying this connection on the transport URL.
    ///
    /// Version 0 servers only send `connectionId`.
    pub fn connection_key(&self) -> Option<&str> {
        if self.negotiate_version >= 1 {
            self.connection_token.as_deref()
        } else {
            self.connection_id.as_deref()
        }
    }
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    /// Hub URL after redirects, with whatever query the last redirect carried
    pub url: Url,
    /// Bearer token to use on the transport (redirects may replace it)
    pub access_token: String,
    pub connection_key: Option<String>,
    pub transports: Vec<TransportKind>,
}

impl Negotiated {
    /// Transport URL: hub URL plus `id=<connection token>`
    pub fn connection_url(&self) -> Url {
        let mut url = self.url.clone();
        if let Some(key) = &self.connection_key {
            url.query_pairs_mut().append_pair("id", key);
        }
        url
    }
}

/// `{hub}/negotiate?negotiateVersion=1`, keeping any query already on `hub`
pub fn negotiate_url(hub: &Url) -> Url {
    let mut url = hub.clone();
    let path = format!("{}/negotiate", hub.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .append_pair("negotiateVersion", &NEGOTIATE_VERSION.to_string());
    url
}

pub async fn negotiate(client: &reqwest::Client, hub: &Url, token: &str) -> Result<Negotiated> {
    let mut url = hub.clone();
    let mut token = token.to_string();

    for _ in 0..MAX_REDIRECTS {
        let response = client
            .post(negotiate_url(&url))
            .bearer_auth(&token)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ChannelError::Unauthorized(format!(
                    "Negotiate returned {}",
                    response.status()
                )));
            }
            status if !status.is_success() => {
                return Err(ChannelError::Negotiate(format!(
                    "Negotiate returned {}",
                    status
                )));
            }
            _ => {}
        }

        let body: NegotiateResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(ChannelError::Negotiate(error));
        }

        if let Some(redirect) = &body.url {
            tracing::debug!("Negotiate redirected to {}", redirect);
            url = Url::parse(redirect)?;
            if let Some(access_token) = &body.access_token {
                token = access_token.clone();
            }
            continue;
        }

        let transports = body.text_transports();
        let connection_key = body.connection_key().map(str::to_string);
        return Ok(Negotiated {
            url,
            access_token: token,
            connection_key,
            transports,
        });
    }

    Err(ChannelError::Negotiate(format!(
        "Exceeded {} negotiate redirects",
        MAX_REDIRECTS
    )))
}
